use std::fmt;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RoomConfig;
use crate::selector;

// ── Identifiers ───────────────────────────────────────────────────────────

macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(RoomId);
id_type!(RoundId);
id_type!(UserId);
id_type!(ConnectionId);

// ── Room lifecycle status ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomStatus {
    Waiting,
    Active,
    Resetting,
    Completed,
    Cancelled,
}

// ══════════════════════════════════════════════════════════════════════════
//  STATE
// ══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct Room {
    pub id:     RoomId,
    pub config: RoomConfig,
    pub status: RoomStatus,
    pub paused: bool,
}

impl Room {
    pub fn new(config: RoomConfig) -> Self {
        Self {
            id: RoomId::new(),
            config,
            status: RoomStatus::Waiting,
            paused: false,
        }
    }
}

/// One instance of play within a room. Active iff neither completed nor
/// archived; at most one active round exists per room at any time.
#[derive(Debug, Clone)]
pub struct Round {
    pub id:              RoundId,
    pub room_id:         RoomId,
    pub created_at:      DateTime<Utc>,
    pub server_seed:     [u8; 32],          // secret until the round settles
    pub seed_commitment: [u8; 32],          // published at round creation
    pub client_seed:     Option<String>,    // first user-supplied value wins
    pub completed_at:    Option<DateTime<Utc>>,
    pub archived_at:     Option<DateTime<Utc>>,
}

impl Round {
    pub fn new(room_id: RoomId) -> Self {
        let server_seed = fresh_server_seed();
        Self {
            id: RoundId::new(),
            room_id,
            created_at: Utc::now(),
            server_seed,
            seed_commitment: selector::commitment(&server_seed),
            client_seed: None,
            completed_at: None,
            archived_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.completed_at.is_none() && self.archived_at.is_none()
    }

    /// Replace the seed pair after a failed processing attempt, so a retried
    /// round never replays the original seed.
    pub fn reroll_seed(&mut self) -> [u8; 32] {
        self.server_seed = fresh_server_seed();
        self.seed_commitment = selector::commitment(&self.server_seed);
        self.seed_commitment
    }
}

fn fresh_server_seed() -> [u8; 32] {
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    seed
}

/// A user's stake commitment to a specific round. Immutable history once the
/// round completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub round_id:   RoundId,
    pub user_id:    UserId,
    pub stake:      u64,
    pub won_amount: u64,
    pub is_winner:  bool,
    pub joined_at:  DateTime<Utc>,
}

impl Participant {
    pub fn new(round_id: RoundId, user_id: UserId, stake: u64) -> Self {
        Self {
            round_id,
            user_id,
            stake,
            won_amount: 0,
            is_winner: false,
            joined_at: Utc::now(),
        }
    }
}
