//! Round Processing Queue: at most one in-flight winner computation per
//! room, rooms processed concurrently, results reported on an explicit typed
//! channel rather than an ambient event bus.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{error, info};

use crate::error::RaffleError;
use crate::ledger::RoundLedger;
use crate::selector::{self, DrawOutcome};
use crate::state::{RoomId, RoundId};

/// Result of a processing job, delivered to the coordinator.
#[derive(Debug, Clone)]
pub enum ProcessingOutcome {
    Processed {
        room_id:  RoomId,
        round_id: RoundId,
        outcome:  DrawOutcome,
    },
    Failed {
        room_id:  RoomId,
        round_id: Option<RoundId>,
        message:  String,
    },
}

pub struct RoundQueue {
    ledger:    Arc<RoundLedger>,
    in_flight: Mutex<HashSet<RoomId>>,
    results:   mpsc::UnboundedSender<ProcessingOutcome>,
}

impl RoundQueue {
    pub fn new(ledger: Arc<RoundLedger>) -> (Arc<Self>, mpsc::UnboundedReceiver<ProcessingOutcome>) {
        let (results, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            ledger,
            in_flight: Mutex::new(HashSet::new()),
            results,
        });
        (queue, rx)
    }

    /// Schedule winner computation for the room's active round. Idempotent:
    /// while a job for the room is pending or running, further calls are
    /// dropped. Returns whether a job was actually scheduled.
    pub async fn enqueue(self: &Arc<Self>, room_id: RoomId) -> bool {
        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(room_id) {
                info!(%room_id, "processing already in flight, enqueue dropped");
                return false;
            }
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let result = queue.process(room_id).await;
            queue.in_flight.lock().await.remove(&room_id);
            let outcome = match result {
                Ok((round_id, outcome)) => {
                    info!(%room_id, %round_id, "winner processing complete");
                    ProcessingOutcome::Processed { room_id, round_id, outcome }
                }
                Err((round_id, err)) => {
                    error!(%room_id, error = %err, "winner processing failed");
                    ProcessingOutcome::Failed {
                        room_id,
                        round_id,
                        message: err.to_string(),
                    }
                }
            };
            let _ = queue.results.send(outcome);
        });
        true
    }

    /// Snapshot → select → settle. Any error leaves the round uncompleted
    /// and the room recoverable; the coordinator reopens it.
    async fn process(
        &self,
        room_id: RoomId,
    ) -> std::result::Result<(RoundId, DrawOutcome), (Option<RoundId>, RaffleError)> {
        let snapshot = self
            .ledger
            .round_snapshot(room_id)
            .await
            .map_err(|e| (None, e))?;
        let round_id = snapshot.round_id;
        let seed = selector::derive_seed(
            &snapshot.server_seed,
            snapshot.client_seed.as_deref(),
            round_id,
        );
        let outcome = selector::select(
            &snapshot.participants,
            &seed,
            snapshot.winner_count,
            snapshot.fee_bps,
        )
        .map_err(|e| (Some(round_id), e))?;
        self.ledger
            .settle(round_id, &outcome)
            .await
            .map_err(|e| (Some(round_id), e))?;
        Ok((round_id, outcome))
    }
}
