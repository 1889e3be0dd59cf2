//! Connection Fanout: delivery of room/user events to the right live
//! connections across reconnects and multiple tabs.
//!
//! Delivery is at-least-once per connected sink at call time; sockets that
//! are offline when an event fires do not receive it retroactively (clients
//! reconcile via a room-state fetch on reconnect). Per-sink failures are
//! logged and skipped, never escalated.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::{RaffleError, Result};
use crate::events::ServerEvent;
use crate::ledger::RoundLedger;
use crate::state::{ConnectionId, RoomId, RoundId, UserId};
use crate::GENERIC_DISPLAY_NAME;

// ── Collaborator seams ────────────────────────────────────────────────────

/// Per-connection send half of the real-time transport. Identity is attached
/// at handshake, before the fanout ever sees the connection.
#[async_trait]
pub trait ConnectionSink: Send + Sync {
    async fn send(&self, event: &ServerEvent) -> Result<()>;
}

/// Display-name lookup. Failures fall back to a generic label.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn display_name(&self, user_id: UserId) -> Result<String>;
}

/// Fire-and-forget audit/notification sink. Failures must never block or
/// roll back the transition that emitted the event.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: &ServerEvent) -> Result<()>;
}

pub struct NoopNotifier;

#[async_trait]
impl NotificationSink for NoopNotifier {
    async fn notify(&self, _event: &ServerEvent) -> Result<()> {
        Ok(())
    }
}

// ══════════════════════════════════════════════════════════════════════════
//  FANOUT
// ══════════════════════════════════════════════════════════════════════════

struct ConnectionEntry {
    user_id:           UserId,
    sink:              Arc<dyn ConnectionSink>,
    viewing:           HashSet<RoomId>, // rooms whose channel this connection watches
    participant_rooms: HashSet<RoomId>, // subset where the user is staked in the active round
}

#[derive(Default)]
struct FanoutState {
    connections:  HashMap<ConnectionId, ConnectionEntry>,
    by_user:      HashMap<UserId, HashSet<ConnectionId>>,
    room_viewers: HashMap<RoomId, HashSet<ConnectionId>>,
}

pub struct ConnectionFanout {
    ledger:    Arc<RoundLedger>,
    directory: Arc<dyn UserDirectory>,
    state:     RwLock<FanoutState>,
}

impl ConnectionFanout {
    pub fn new(ledger: Arc<RoundLedger>, directory: Arc<dyn UserDirectory>) -> Self {
        Self {
            ledger,
            directory,
            state: RwLock::new(FanoutState::default()),
        }
    }

    /// Register an authenticated connection. A user may hold any number of
    /// simultaneous connections; all of them receive identical events.
    pub async fn register(&self, user_id: UserId, sink: Arc<dyn ConnectionSink>) -> ConnectionId {
        let id = ConnectionId::new();
        let mut st = self.state.write().await;
        st.connections.insert(
            id,
            ConnectionEntry {
                user_id,
                sink,
                viewing: HashSet::new(),
                participant_rooms: HashSet::new(),
            },
        );
        st.by_user.entry(user_id).or_default().insert(id);
        id
    }

    /// Subscribe a connection to a room's channel. If the user is a
    /// participant of the room's active round, other viewers are notified —
    /// excluding the joining connection itself, so the initiator does not
    /// double-count its own join.
    pub async fn join(&self, conn: ConnectionId, room_id: RoomId) -> Result<()> {
        let user_id = self.user_of(conn).await?;
        self.ledger.room_status(room_id).await?; // room must exist
        let is_participant = self.ledger.is_participant(room_id, user_id).await;

        let targets = {
            let mut st = self.state.write().await;
            {
                let entry = st.connections.get_mut(&conn).ok_or(RaffleError::UnknownConnection)?;
                entry.viewing.insert(room_id);
                if is_participant {
                    entry.participant_rooms.insert(room_id);
                }
            }
            st.room_viewers.entry(room_id).or_default().insert(conn);
            if is_participant {
                viewer_sinks(&st, room_id, Some(conn))
            } else {
                Vec::new()
            }
        };

        if !targets.is_empty() {
            let (participant_count, prize_pool) =
                self.ledger.room_overview(room_id).await.unwrap_or((0, 0));
            let event = ServerEvent::UserJoined {
                room_id,
                user_id,
                display_name: self.display_name_or_fallback(user_id).await,
                participant_count,
                prize_pool,
            };
            send_all(&targets, &event).await;
        }
        Ok(())
    }

    /// Unsubscribe a connection from a room's channel. A "user left" goes to
    /// the remaining viewers only if this connection was a recorded
    /// participant there.
    pub async fn leave(&self, conn: ConnectionId, room_id: RoomId) -> Result<()> {
        let (user_id, was_participant, targets) = {
            let mut st = self.state.write().await;
            let (user_id, was_participant) = {
                let entry = st.connections.get_mut(&conn).ok_or(RaffleError::UnknownConnection)?;
                entry.viewing.remove(&room_id);
                (entry.user_id, entry.participant_rooms.remove(&room_id))
            };
            if let Some(viewers) = st.room_viewers.get_mut(&room_id) {
                viewers.remove(&conn);
            }
            let targets = if was_participant {
                viewer_sinks(&st, room_id, Some(conn))
            } else {
                Vec::new()
            };
            (user_id, was_participant, targets)
        };

        if was_participant {
            self.send_user_left(room_id, user_id, &targets).await;
        }
        Ok(())
    }

    /// Drop a connection entirely. Best-effort "user left" per room where
    /// the connection was a participant.
    pub async fn disconnect(&self, conn: ConnectionId) -> Result<()> {
        let (user_id, rooms) = {
            let mut st = self.state.write().await;
            let entry = st.connections.remove(&conn).ok_or(RaffleError::UnknownConnection)?;
            if let Some(conns) = st.by_user.get_mut(&entry.user_id) {
                conns.remove(&conn);
                if conns.is_empty() {
                    st.by_user.remove(&entry.user_id);
                }
            }
            for room_id in &entry.viewing {
                if let Some(viewers) = st.room_viewers.get_mut(room_id) {
                    viewers.remove(&conn);
                }
            }
            let rooms: Vec<(RoomId, Vec<Arc<dyn ConnectionSink>>)> = entry
                .participant_rooms
                .iter()
                .map(|&room_id| (room_id, viewer_sinks(&st, room_id, None)))
                .collect();
            (entry.user_id, rooms)
        };

        for (room_id, targets) in rooms {
            self.send_user_left(room_id, user_id, &targets).await;
        }
        Ok(())
    }

    /// Deliver a settlement-grade event to the round's authoritative
    /// participant set — resolved from the ledger by user identity, not from
    /// whoever is currently on the room's channel — on every live connection
    /// each participant owns. Current viewers that did not get the targeted
    /// copy receive the informational one.
    pub async fn notify_round_participants(
        &self,
        round_id: RoundId,
        targeted: &ServerEvent,
        informational: &ServerEvent,
    ) -> Result<()> {
        let (room_id, users) = self.ledger.participants_of_round(round_id).await?;

        let (targeted_sinks, info_sinks) = {
            let st = self.state.read().await;
            let mut seen: HashSet<ConnectionId> = HashSet::new();
            let mut targeted_sinks = Vec::new();
            for user in &users {
                if let Some(conns) = st.by_user.get(user) {
                    for &conn in conns {
                        if let Some(entry) = st.connections.get(&conn) {
                            targeted_sinks.push(Arc::clone(&entry.sink));
                            seen.insert(conn);
                        }
                    }
                }
            }
            let mut info_sinks = Vec::new();
            if let Some(viewers) = st.room_viewers.get(&room_id) {
                for &conn in viewers {
                    if !seen.contains(&conn) {
                        if let Some(entry) = st.connections.get(&conn) {
                            info_sinks.push(Arc::clone(&entry.sink));
                        }
                    }
                }
            }
            (targeted_sinks, info_sinks)
        };

        send_all(&targeted_sinks, targeted).await;
        send_all(&info_sinks, informational).await;
        Ok(())
    }

    /// Deliver to every live connection of one user.
    pub async fn notify_user(&self, user_id: UserId, event: &ServerEvent) {
        let sinks = {
            let st = self.state.read().await;
            let mut sinks = Vec::new();
            if let Some(conns) = st.by_user.get(&user_id) {
                for conn in conns {
                    if let Some(entry) = st.connections.get(conn) {
                        sinks.push(Arc::clone(&entry.sink));
                    }
                }
            }
            sinks
        };
        send_all(&sinks, event).await;
    }

    /// Spectator-grade broadcast to everyone viewing the room's channel.
    pub async fn broadcast_room(&self, room_id: RoomId, event: &ServerEvent) {
        let sinks = {
            let st = self.state.read().await;
            viewer_sinks(&st, room_id, None)
        };
        send_all(&sinks, event).await;
    }

    // ── Internals ────────────────────────────────────────────────

    async fn user_of(&self, conn: ConnectionId) -> Result<UserId> {
        let st = self.state.read().await;
        Ok(st
            .connections
            .get(&conn)
            .ok_or(RaffleError::UnknownConnection)?
            .user_id)
    }

    async fn send_user_left(
        &self,
        room_id: RoomId,
        user_id: UserId,
        targets: &[Arc<dyn ConnectionSink>],
    ) {
        let (participant_count, prize_pool) =
            self.ledger.room_overview(room_id).await.unwrap_or((0, 0));
        let event = ServerEvent::UserLeft {
            room_id,
            user_id,
            display_name: self.display_name_or_fallback(user_id).await,
            participant_count,
            prize_pool,
        };
        send_all(targets, &event).await;
    }

    async fn display_name_or_fallback(&self, user_id: UserId) -> String {
        match self.directory.display_name(user_id).await {
            Ok(name) => name,
            Err(err) => {
                warn!(%user_id, error = %err, "display name lookup failed");
                GENERIC_DISPLAY_NAME.to_string()
            }
        }
    }
}

fn viewer_sinks(
    st: &FanoutState,
    room_id: RoomId,
    exclude: Option<ConnectionId>,
) -> Vec<Arc<dyn ConnectionSink>> {
    let Some(viewers) = st.room_viewers.get(&room_id) else {
        return Vec::new();
    };
    viewers
        .iter()
        .filter(|&&conn| Some(conn) != exclude)
        .filter_map(|conn| st.connections.get(conn).map(|e| Arc::clone(&e.sink)))
        .collect()
}

async fn send_all(sinks: &[Arc<dyn ConnectionSink>], event: &ServerEvent) {
    for sink in sinks {
        if let Err(err) = sink.send(event).await {
            warn!(error = %err, "fanout delivery failed");
        }
    }
}
