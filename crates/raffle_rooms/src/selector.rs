//! Deterministic winner selection: (participants, seed) → winners + payouts.
//!
//! Commit-reveal seed pair: the server seed is generated and committed (via
//! its blake3 hash) before the round starts; an optional client seed is mixed
//! in so neither party can bias the outcome alone. The same inputs always
//! reproduce the same winners and amounts, which is what makes post-hoc
//! dispute resolution possible.

use crate::error::{ensure, RaffleError, Result};
use crate::state::{Participant, RoundId, UserId};
use crate::BPS_DENOMINATOR;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawnWinner {
    pub user_id:  UserId,
    pub position: usize,
    pub payout:   u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawOutcome {
    pub winners:      Vec<DrawnWinner>,
    pub prize_pool:   u64,
    pub platform_fee: u64,
}

/// Commitment published at round creation: blake3 of the server seed.
pub fn commitment(server_seed: &[u8; 32]) -> [u8; 32] {
    *blake3::hash(server_seed).as_bytes()
}

/// Blake3( server_seed || client_seed || round_id ) — the draw seed.
/// Binding the round id means a seed pair can never be replayed across
/// rounds, even if a client submits the same value twice.
pub fn derive_seed(server_seed: &[u8; 32], client_seed: Option<&str>, round_id: RoundId) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(server_seed);
    if let Some(seed) = client_seed {
        hasher.update(seed.as_bytes());
    }
    hasher.update(round_id.as_bytes());
    *hasher.finalize().as_bytes()
}

/// One u64 from the seed's draw stream. Counter-suffixed hashing gives an
/// arbitrary-length stream from a single 32-byte seed.
fn draw_u64(seed: &[u8; 32], counter: u64) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(seed);
    hasher.update(&counter.to_le_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes(digest.as_bytes()[0..8].try_into().unwrap())
}

/// Position-based payout split of the net pool, in basis points.
/// Fixed table through three winners; even split with the remainder on the
/// top position beyond that.
pub fn payout_splits_bps(winner_count: usize) -> Vec<u64> {
    match winner_count {
        0 => Vec::new(),
        1 => vec![10_000],
        2 => vec![6_000, 4_000],
        3 => vec![5_000, 3_000, 2_000],
        n => {
            let base = BPS_DENOMINATOR / n as u64;
            let mut splits = vec![base; n];
            splits[0] += BPS_DENOMINATOR - base * n as u64;
            splits
        }
    }
}

/// Draw `winner_count` distinct participants uniformly without replacement
/// and split the prize pool.
///
/// Rounding: each payout truncates to the minor unit; the truncation
/// remainder folds into the platform fee, never left unallocated. Exact
/// invariant on every outcome: sum(payouts) + platform_fee == prize_pool.
pub fn select(
    participants: &[Participant],
    seed: &[u8; 32],
    winner_count: usize,
    fee_bps: u64,
) -> Result<DrawOutcome> {
    ensure!(!participants.is_empty(), RaffleError::NoParticipants);

    let prize_pool: u64 = participants.iter().map(|p| p.stake).sum();
    let draws = winner_count.min(participants.len());

    // ── Draw without replacement ─────────────────────────────────
    let mut remaining: Vec<&Participant> = participants.iter().collect();
    let mut drawn: Vec<&Participant> = Vec::with_capacity(draws);
    for counter in 0..draws {
        let roll = draw_u64(seed, counter as u64) as usize % remaining.len();
        drawn.push(remaining.remove(roll));
    }

    // ── Fee + position splits, truncation remainder to the fee ───
    let mut platform_fee = prize_pool.saturating_mul(fee_bps) / BPS_DENOMINATOR;
    let net_pool = prize_pool - platform_fee;
    let splits = payout_splits_bps(draws);

    let mut winners = Vec::with_capacity(draws);
    let mut distributed: u64 = 0;
    for (position, participant) in drawn.iter().enumerate() {
        let payout = net_pool.saturating_mul(splits[position]) / BPS_DENOMINATOR;
        distributed += payout;
        winners.push(DrawnWinner {
            user_id: participant.user_id,
            position,
            payout,
        });
    }
    platform_fee += net_pool - distributed;

    Ok(DrawOutcome {
        winners,
        prize_pool,
        platform_fee,
    })
}
