use serde::{Deserialize, Serialize};

use crate::state::{RoomId, RoomStatus, RoundId, UserId};

/// Whether an event concerns the receiving user directly or is informational
/// (spectator copy). Clients use this to decide between "you won/lost" and a
/// plain status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventScope {
    Targeted,
    Informational,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinnerSummary {
    pub user_id:  UserId,
    pub position: usize, // 0-based rank in the draw order
    pub payout:   u64,
}

// ── Wire events ───────────────────────────────────────────────────────────
// Every payload carries enough identity (room, round, user) for a client to
// reconcile optimistic local state idempotently.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    UserJoined {
        room_id:           RoomId,
        user_id:           UserId,
        display_name:      String,
        participant_count: usize,
        prize_pool:        u64,
    },
    UserLeft {
        room_id:           RoomId,
        user_id:           UserId,
        display_name:      String,
        participant_count: usize,
        prize_pool:        u64,
    },
    CountdownStarted {
        room_id:         RoomId,
        round_id:        RoundId,
        seconds:         u32,
        seed_commitment: String, // hex; server seed revealed at settlement
    },
    CountdownTick {
        room_id:   RoomId,
        remaining: u32,
    },
    CountdownCancelled {
        room_id:           RoomId,
        participant_count: usize,
    },
    AnimationStart {
        room_id:  RoomId,
        round_id: RoundId,
    },
    WinnerAnnounced {
        room_id:      RoomId,
        round_id:     RoundId,
        scope:        EventScope,
        winners:      Vec<WinnerSummary>,
        prize_pool:   u64,
        platform_fee: u64,
        server_seed:  String, // hex reveal for independent verification
        client_seed:  Option<String>,
    },
    ProcessingFailed {
        room_id:  RoomId,
        round_id: Option<RoundId>,
        message:  String,
    },
    RoomReset {
        room_id:           RoomId,
        status:            RoomStatus,
        participant_count: usize,
    },
    BalanceUpdate {
        user_id:  UserId,
        round_id: RoundId,
        balance:  u64,
    },
}

/// Lowercase hex rendering for seeds and commitments on the wire.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_tag_by_type() {
        let ev = ServerEvent::CountdownTick { room_id: RoomId::new(), remaining: 7 };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"countdown_tick\""));
        assert!(json.contains("\"remaining\":7"));
    }

    #[test]
    fn hex_renders_lowercase_pairs() {
        assert_eq!(to_hex(&[0x00, 0xab, 0xff]), "00abff");
    }
}
