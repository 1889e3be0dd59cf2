use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::error::{ensure, RaffleError, Result};
use crate::BPS_DENOMINATOR;

// ── Room configuration ────────────────────────────────────────────────────
// Per-room product knobs. Amounts are in the currency's minor unit.

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomConfig {
    pub bet_amount:       u64,   // stake per participant, minor units
    pub min_participants: usize, // countdown arms at this count
    pub max_participants: usize,
    pub countdown_secs:   u32,
    pub winner_count:     usize,
    pub fee_bps:          u64,   // platform cut of the prize pool, basis points
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            bet_amount:       1_000, // $10.00
            min_participants: 3,
            max_participants: 10,
            countdown_secs:   30,
            winner_count:     1,
            fee_bps:          1_000, // 10%
        }
    }
}

impl RoomConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.bet_amount > 0,
            RaffleError::InvalidRoomConfig("bet amount must be positive".into())
        );
        ensure!(
            self.min_participants >= 2,
            RaffleError::InvalidRoomConfig("min participants must be at least 2".into())
        );
        ensure!(
            self.max_participants >= self.min_participants,
            RaffleError::InvalidRoomConfig("max participants below min".into())
        );
        ensure!(
            self.countdown_secs >= 1,
            RaffleError::InvalidRoomConfig("countdown must be at least 1 second".into())
        );
        ensure!(
            self.winner_count >= 1 && self.winner_count <= self.min_participants,
            RaffleError::InvalidRoomConfig("winner count must be 1..=min participants".into())
        );
        ensure!(
            self.fee_bps <= BPS_DENOMINATOR,
            RaffleError::InvalidRoomConfig("fee exceeds 100%".into())
        );
        Ok(())
    }
}

// ── Coordinator configuration ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub animation_secs:       u64, // expected client winner-animation duration
    pub fallback_margin_secs: u64, // safety margin before the server takes over
    pub reset_delay_secs:     u64, // let clients render the outcome before reset
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            animation_secs:       8,
            fallback_margin_secs: 4,
            reset_delay_secs:     5,
        }
    }
}

impl CoordinatorConfig {
    /// Fallback deadline measured from countdown start: the client gets the
    /// whole countdown plus the animation plus the margin to report back.
    pub fn fallback_delay(&self, countdown_secs: u32) -> Duration {
        Duration::from_secs(countdown_secs as u64 + self.animation_secs + self.fallback_margin_secs)
    }

    pub fn reset_delay(&self) -> Duration {
        Duration::from_secs(self.reset_delay_secs)
    }
}
