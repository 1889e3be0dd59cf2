//! Round Ledger: the authoritative record of rooms, rounds, participants and
//! user balances, and the arithmetic tying stakes to balances.
//!
//! Every operation takes the single state mutex for its whole critical
//! section, so each operation is one atomic transaction: balance movements
//! commit together with the participant/round rows they belong to, and room
//! status is re-validated inside the lock (a join raced against a reset is
//! rejected, not applied). A persistent deployment swaps the interior for a
//! database transaction with row locks; the operation contracts stay as-is.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::config::RoomConfig;
use crate::error::{ensure, RaffleError, Result};
use crate::selector::DrawOutcome;
use crate::state::{Participant, Room, RoomId, RoomStatus, Round, RoundId, UserId};

// ── Operation outcomes ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub round_id:          RoundId,
    pub participant_count: usize,
    pub prize_pool:        u64,
    pub countdown_wanted:  bool, // count just reached the room minimum
    pub countdown_secs:    u32,
    pub seed_commitment:   [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub round_id:          RoundId,
    pub participant_count: usize,
    pub prize_pool:        u64,
    pub refunded:          u64,
    pub below_min:         bool,
}

/// Input to the winner-computation job: everything the selector needs,
/// captured in one consistent read.
#[derive(Debug, Clone)]
pub struct RoundSnapshot {
    pub round_id:         RoundId,
    pub room_id:          RoomId,
    pub participants:     Vec<Participant>,
    pub server_seed:      [u8; 32],
    pub client_seed:      Option<String>,
    pub seed_commitment:  [u8; 32],
    pub winner_count:     usize,
    pub fee_bps:          u64,
    pub countdown_secs:   u32,
    pub min_participants: usize,
}

/// Transparency counters, monotonic over the ledger's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub rounds_completed: u64,
    pub total_wagered:    u64,
    pub total_paid_out:   u64,
    pub total_fees:       u64,
    pub biggest_payout:   u64,
}

// ══════════════════════════════════════════════════════════════════════════
//  LEDGER
// ══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct LedgerState {
    rooms:          HashMap<RoomId, Room>,
    rounds:         HashMap<RoundId, Round>,
    current_rounds: HashMap<RoomId, RoundId>, // ≤ 1 entry per room
    participants:   HashMap<RoundId, Vec<Participant>>,
    balances:       HashMap<UserId, u64>,
    stats:          LedgerStats,
}

#[derive(Default)]
pub struct RoundLedger {
    state: Mutex<LedgerState>,
}

impl RoundLedger {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Rooms & balances ─────────────────────────────────────────

    pub async fn create_room(&self, config: RoomConfig) -> Result<RoomId> {
        config.validate()?;
        let room = Room::new(config);
        let id = room.id;
        self.state.lock().await.rooms.insert(id, room);
        Ok(id)
    }

    pub async fn room_status(&self, room_id: RoomId) -> Result<RoomStatus> {
        let s = self.state.lock().await;
        Ok(s.rooms.get(&room_id).ok_or(RaffleError::RoomNotFound)?.status)
    }

    pub async fn set_room_status(&self, room_id: RoomId, status: RoomStatus) -> Result<()> {
        let mut s = self.state.lock().await;
        s.rooms.get_mut(&room_id).ok_or(RaffleError::RoomNotFound)?.status = status;
        Ok(())
    }

    pub async fn set_paused(&self, room_id: RoomId, paused: bool) -> Result<()> {
        let mut s = self.state.lock().await;
        s.rooms.get_mut(&room_id).ok_or(RaffleError::RoomNotFound)?.paused = paused;
        Ok(())
    }

    /// Operator close-out. Refuses while stakes are committed to an
    /// uncompleted round; a closed room never accepts joins again.
    pub async fn close_room(&self, room_id: RoomId, status: RoomStatus) -> Result<()> {
        ensure!(
            matches!(status, RoomStatus::Completed | RoomStatus::Cancelled),
            RaffleError::InvalidRoomConfig("close status must be COMPLETED or CANCELLED".into())
        );
        let mut s = self.state.lock().await;
        ensure!(s.rooms.contains_key(&room_id), RaffleError::RoomNotFound);
        if let Some(round_id) = s.current_rounds.get(&room_id) {
            let staked = s.participants.get(round_id).map(|p| !p.is_empty()).unwrap_or(false);
            let uncompleted = s
                .rounds
                .get(round_id)
                .map(|r| r.completed_at.is_none())
                .unwrap_or(false);
            ensure!(!(staked && uncompleted), RaffleError::RoomNotJoinable);
        }
        if let Some(room) = s.rooms.get_mut(&room_id) {
            room.status = status;
        }
        Ok(())
    }

    /// Deposits/withdrawals are an external subsystem; the ledger only
    /// consumes the resulting balance.
    pub async fn credit_balance(&self, user_id: UserId, amount: u64) {
        let mut s = self.state.lock().await;
        let balance = s.balances.entry(user_id).or_insert(0);
        *balance = balance.saturating_add(amount);
    }

    pub async fn balance(&self, user_id: UserId) -> u64 {
        self.state.lock().await.balances.get(&user_id).copied().unwrap_or(0)
    }

    pub async fn stats(&self) -> LedgerStats {
        self.state.lock().await.stats
    }

    // ── Join / leave ─────────────────────────────────────────────

    /// Debit the stake and insert the participant, creating the round lazily
    /// on first join (seed pair fixed here). The caller starts a countdown
    /// when `countdown_wanted` is set and none is already running.
    pub async fn join(
        &self,
        room_id: RoomId,
        user_id: UserId,
        client_seed: Option<String>,
    ) -> Result<JoinOutcome> {
        let mut s = self.state.lock().await;

        let room = s.rooms.get(&room_id).ok_or(RaffleError::RoomNotFound)?;
        ensure!(!room.paused, RaffleError::RoomPaused);
        ensure!(room.status == RoomStatus::Waiting, RaffleError::RoomNotJoinable);
        let stake = room.config.bet_amount;
        let min = room.config.min_participants;
        let max = room.config.max_participants;
        let countdown_secs = room.config.countdown_secs;

        let balance = s.balances.get(&user_id).copied().unwrap_or(0);
        ensure!(balance >= stake, RaffleError::InsufficientBalance);

        let (round_id, seed_commitment) = match s.current_rounds.get(&room_id).copied() {
            Some(id) => {
                let round = s.rounds.get(&id).ok_or(RaffleError::RoundNotFound)?;
                (id, round.seed_commitment)
            }
            None => {
                let round = Round::new(room_id);
                let (id, commitment) = (round.id, round.seed_commitment);
                s.rounds.insert(id, round);
                s.current_rounds.insert(room_id, id);
                s.participants.insert(id, Vec::new());
                (id, commitment)
            }
        };

        {
            let parts = s.participants.entry(round_id).or_default();
            ensure!(parts.len() < max, RaffleError::RoomNotJoinable);
            ensure!(
                parts.iter().all(|p| p.user_id != user_id),
                RaffleError::AlreadyJoined
            );
        }

        // First supplied client seed is recorded; later ones are ignored.
        if let Some(seed) = client_seed {
            if let Some(round) = s.rounds.get_mut(&round_id) {
                if round.client_seed.is_none() {
                    round.client_seed = Some(seed);
                }
            }
        }

        // Debit and insert commit together under the same lock.
        s.balances.insert(user_id, balance - stake);
        s.stats.total_wagered = s.stats.total_wagered.saturating_add(stake);
        let parts = s.participants.entry(round_id).or_default();
        parts.push(Participant::new(round_id, user_id, stake));
        let participant_count = parts.len();
        let prize_pool: u64 = parts.iter().map(|p| p.stake).sum();

        Ok(JoinOutcome {
            round_id,
            participant_count,
            prize_pool,
            countdown_wanted: participant_count >= min,
            countdown_secs,
            seed_commitment,
        })
    }

    /// Refund the stake and remove the participant. Only allowed while the
    /// room is still WAITING (pre- or mid-countdown); once the countdown has
    /// elapsed the stake is locked into the round.
    pub async fn leave(&self, room_id: RoomId, user_id: UserId) -> Result<LeaveOutcome> {
        let mut s = self.state.lock().await;

        let room = s.rooms.get(&room_id).ok_or(RaffleError::RoomNotFound)?;
        ensure!(room.status == RoomStatus::Waiting, RaffleError::NotAParticipant);
        let min = room.config.min_participants;

        let round_id = s
            .current_rounds
            .get(&room_id)
            .copied()
            .ok_or(RaffleError::NotAParticipant)?;
        let parts = s
            .participants
            .get_mut(&round_id)
            .ok_or(RaffleError::NotAParticipant)?;
        let index = parts
            .iter()
            .position(|p| p.user_id == user_id)
            .ok_or(RaffleError::NotAParticipant)?;

        // Credit-back and removal commit together.
        let refunded = parts.remove(index).stake;
        let participant_count = parts.len();
        let prize_pool: u64 = parts.iter().map(|p| p.stake).sum();
        let balance = s.balances.entry(user_id).or_insert(0);
        *balance = balance.saturating_add(refunded);
        s.stats.total_wagered = s.stats.total_wagered.saturating_sub(refunded);

        Ok(LeaveOutcome {
            round_id,
            participant_count,
            prize_pool,
            refunded,
            below_min: participant_count < min,
        })
    }

    // ── Settlement ───────────────────────────────────────────────

    /// Apply payouts, mark winners, stamp completion. All-or-nothing: every
    /// new balance is computed and validated before any row mutates, so a
    /// failure leaves stakes committed and the round uncompleted.
    pub async fn settle(&self, round_id: RoundId, outcome: &DrawOutcome) -> Result<()> {
        let mut s = self.state.lock().await;

        let round = s.rounds.get(&round_id).ok_or(RaffleError::RoundNotFound)?;
        ensure!(round.completed_at.is_none(), RaffleError::RoundAlreadyCompleted);

        let parts = s.participants.get(&round_id).ok_or(RaffleError::RoundNotFound)?;
        let prize_pool: u64 = parts.iter().map(|p| p.stake).sum();
        let distributed: u64 = outcome.winners.iter().map(|w| w.payout).sum();
        ensure!(
            outcome.prize_pool == prize_pool,
            RaffleError::ProcessingFailed("prize pool mismatch".into())
        );
        ensure!(
            distributed + outcome.platform_fee == prize_pool,
            RaffleError::ProcessingFailed("money conservation violated".into())
        );
        for winner in &outcome.winners {
            ensure!(
                parts.iter().any(|p| p.user_id == winner.user_id),
                RaffleError::ProcessingFailed("winner is not a participant".into())
            );
        }

        // Pure math first: every credited balance, checked, before any write.
        let mut credited: Vec<(UserId, u64)> = Vec::with_capacity(outcome.winners.len());
        for winner in &outcome.winners {
            let current = s.balances.get(&winner.user_id).copied().unwrap_or(0);
            let next = current.checked_add(winner.payout).ok_or_else(|| {
                RaffleError::ProcessingFailed("winner balance overflow".into())
            })?;
            credited.push((winner.user_id, next));
        }

        // Commit: balances, winner flags and the completion stamp together.
        for (user_id, next) in credited {
            s.balances.insert(user_id, next);
        }
        if let Some(parts) = s.participants.get_mut(&round_id) {
            for p in parts.iter_mut() {
                if let Some(w) = outcome.winners.iter().find(|w| w.user_id == p.user_id) {
                    p.is_winner = true;
                    p.won_amount = w.payout;
                }
            }
        }
        if let Some(round) = s.rounds.get_mut(&round_id) {
            round.completed_at = Some(chrono::Utc::now());
        }
        s.stats.rounds_completed += 1;
        s.stats.total_paid_out = s.stats.total_paid_out.saturating_add(distributed);
        s.stats.total_fees = s.stats.total_fees.saturating_add(outcome.platform_fee);
        if let Some(top) = outcome.winners.iter().map(|w| w.payout).max() {
            if top > s.stats.biggest_payout {
                s.stats.biggest_payout = top;
            }
        }
        Ok(())
    }

    // ── Reset helpers ────────────────────────────────────────────

    /// Archive the room's completed round so history queries exclude it.
    /// Returns false (and touches nothing) when there is no completed,
    /// unarchived round — that makes the caller's reset idempotent.
    pub async fn archive_completed_round(&self, room_id: RoomId) -> Result<bool> {
        let mut s = self.state.lock().await;
        let Some(round_id) = s.current_rounds.get(&room_id).copied() else {
            return Ok(false);
        };
        let Some(round) = s.rounds.get_mut(&round_id) else {
            return Ok(false);
        };
        if round.completed_at.is_none() || round.archived_at.is_some() {
            return Ok(false);
        }
        round.archived_at = Some(chrono::Utc::now());
        s.current_rounds.remove(&room_id);
        Ok(true)
    }

    /// Delete a round that never started: created, but nobody staked.
    pub async fn purge_abandoned_round(&self, room_id: RoomId) -> Result<()> {
        let mut s = self.state.lock().await;
        let Some(round_id) = s.current_rounds.get(&room_id).copied() else {
            return Ok(());
        };
        let empty = s.participants.get(&round_id).map(|p| p.is_empty()).unwrap_or(true);
        let uncompleted = s
            .rounds
            .get(&round_id)
            .map(|r| r.completed_at.is_none())
            .unwrap_or(false);
        if empty && uncompleted {
            s.rounds.remove(&round_id);
            s.participants.remove(&round_id);
            s.current_rounds.remove(&room_id);
        }
        Ok(())
    }

    /// Fresh seed pair for a round whose processing failed, so a retry never
    /// replays the original seed. Returns the new commitment.
    pub async fn reroll_server_seed(&self, round_id: RoundId) -> Result<[u8; 32]> {
        let mut s = self.state.lock().await;
        let round = s.rounds.get_mut(&round_id).ok_or(RaffleError::RoundNotFound)?;
        ensure!(round.completed_at.is_none(), RaffleError::RoundAlreadyCompleted);
        Ok(round.reroll_seed())
    }

    // ── Reads ────────────────────────────────────────────────────

    pub async fn round_snapshot(&self, room_id: RoomId) -> Result<RoundSnapshot> {
        let s = self.state.lock().await;
        let round_id = s
            .current_rounds
            .get(&room_id)
            .copied()
            .ok_or(RaffleError::RoundNotFound)?;
        let round = s.rounds.get(&round_id).ok_or(RaffleError::RoundNotFound)?;
        ensure!(round.completed_at.is_none(), RaffleError::RoundAlreadyCompleted);
        let room = s.rooms.get(&room_id).ok_or(RaffleError::RoomNotFound)?;
        Ok(RoundSnapshot {
            round_id,
            room_id,
            participants: s.participants.get(&round_id).cloned().unwrap_or_default(),
            server_seed: round.server_seed,
            client_seed: round.client_seed.clone(),
            seed_commitment: round.seed_commitment,
            winner_count: room.config.winner_count,
            fee_bps: room.config.fee_bps,
            countdown_secs: room.config.countdown_secs,
            min_participants: room.config.min_participants,
        })
    }

    /// The authoritative settlement audience: participants by user identity,
    /// independent of who happens to be connected.
    pub async fn participants_of_round(&self, round_id: RoundId) -> Result<(RoomId, Vec<UserId>)> {
        let s = self.state.lock().await;
        let round = s.rounds.get(&round_id).ok_or(RaffleError::RoundNotFound)?;
        let users = s
            .participants
            .get(&round_id)
            .map(|parts| parts.iter().map(|p| p.user_id).collect())
            .unwrap_or_default();
        Ok((round.room_id, users))
    }

    pub async fn is_participant(&self, room_id: RoomId, user_id: UserId) -> bool {
        let s = self.state.lock().await;
        let Some(round_id) = s.current_rounds.get(&room_id) else {
            return false;
        };
        s.participants
            .get(round_id)
            .map(|parts| parts.iter().any(|p| p.user_id == user_id))
            .unwrap_or(false)
    }

    /// (participant count, prize pool) of the room's current round.
    pub async fn room_overview(&self, room_id: RoomId) -> Result<(usize, u64)> {
        let s = self.state.lock().await;
        ensure!(s.rooms.contains_key(&room_id), RaffleError::RoomNotFound);
        let Some(round_id) = s.current_rounds.get(&room_id) else {
            return Ok((0, 0));
        };
        let (count, pool) = s
            .participants
            .get(round_id)
            .map(|parts| (parts.len(), parts.iter().map(|p| p.stake).sum()))
            .unwrap_or((0, 0));
        Ok((count, pool))
    }

    /// Seed pair reveal, published with the settlement broadcast.
    pub async fn round_seed(&self, round_id: RoundId) -> Result<([u8; 32], Option<String>)> {
        let s = self.state.lock().await;
        let round = s.rounds.get(&round_id).ok_or(RaffleError::RoundNotFound)?;
        Ok((round.server_seed, round.client_seed.clone()))
    }

    /// Count of active (uncompleted, unarchived) rounds for a room. Exposed
    /// for invariant checks; must never exceed one.
    pub async fn active_round_count(&self, room_id: RoomId) -> usize {
        let s = self.state.lock().await;
        s.rounds
            .values()
            .filter(|r| r.room_id == room_id && r.is_active())
            .count()
    }
}
