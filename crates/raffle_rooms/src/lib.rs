//! Room/round lifecycle core for a pooled-stake raffle platform.
//!
//! Users stake into a room's round, a countdown arms once enough of them
//! join, a provably-fair draw (commit-reveal seeds, blake3) picks the
//! winners, payouts settle against user balances, and the room resets for
//! the next round. Winner selection runs exactly once per round even when
//! the client completion signal and the server fallback timer race, and
//! every participant converges on the same outcome regardless of
//! connection churn.
//!
//! The surrounding web glue (HTTP controllers, socket framing, payments,
//! admin tooling) lives elsewhere; this crate exposes the coordinator and
//! its collaborator seams.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod fanout;
pub mod ledger;
pub mod queue;
pub mod selector;
pub mod state;

// ── Constants ─────────────────────────────────────────────────────────────
pub const BPS_DENOMINATOR:      u64 = 10_000;   // basis-point denominator for fees and splits
pub const COUNTDOWN_TICK_SECS:  u64 = 1;        // countdown broadcast cadence
pub const GENERIC_DISPLAY_NAME: &str = "player"; // fallback when the directory lookup fails

pub use config::{CoordinatorConfig, RoomConfig};
pub use coordinator::Coordinator;
pub use error::{RaffleError, Result};
pub use events::{EventScope, ServerEvent, WinnerSummary};
pub use fanout::{ConnectionFanout, ConnectionSink, NoopNotifier, NotificationSink, UserDirectory};
pub use ledger::{JoinOutcome, LeaveOutcome, LedgerStats, RoundLedger, RoundSnapshot};
pub use queue::{ProcessingOutcome, RoundQueue};
pub use selector::{DrawOutcome, DrawnWinner};
pub use state::{ConnectionId, Participant, Room, RoomId, RoomStatus, Round, RoundId, UserId};
