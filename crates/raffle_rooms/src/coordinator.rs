//! Round Lifecycle Coordinator: the per-room state machine driving
//! countdown → animation → settlement → reset.
//!
//! Two unordered sources can complete the animation step — the client's
//! completion signal and the server-side fallback timer — and both are
//! tolerated: the processed-round marker admits exactly one of them to the
//! processing queue, keyed by round id so a stale timer from a previous
//! round can never touch the next one.
//!
//! Timer handles live in a per-room arena and are aborted explicitly,
//! synchronously with the state transition that invalidates them; a timer is
//! never left to "win the race" against a state change.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::config::{CoordinatorConfig, RoomConfig};
use crate::error::{ensure, RaffleError, Result};
use crate::events::{to_hex, EventScope, ServerEvent, WinnerSummary};
use crate::fanout::{ConnectionFanout, NotificationSink, UserDirectory};
use crate::ledger::{JoinOutcome, LeaveOutcome, RoundLedger};
use crate::queue::{ProcessingOutcome, RoundQueue};
use crate::selector::DrawOutcome;
use crate::state::{RoomId, RoomStatus, RoundId, UserId};
use crate::{COUNTDOWN_TICK_SECS, GENERIC_DISPLAY_NAME};

// ── Per-room runtime ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum RoomPhase {
    #[default]
    Idle,
    Countdown,
    AwaitingAnimation,
    Processing,
    Settling,
    Resetting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompletionTrigger {
    ClientSignal,
    FallbackTimer,
}

#[derive(Default)]
struct RoomRuntime {
    phase:         RoomPhase,
    pending_round: Option<RoundId>,
    countdown:     Option<JoinHandle<()>>,
    fallback:      Option<JoinHandle<()>>,
}

impl RoomRuntime {
    fn abort_timers(&mut self) {
        if let Some(handle) = self.countdown.take() {
            handle.abort();
        }
        if let Some(handle) = self.fallback.take() {
            handle.abort();
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════
//  COORDINATOR
// ══════════════════════════════════════════════════════════════════════════

pub struct Coordinator {
    config:    CoordinatorConfig,
    ledger:    Arc<RoundLedger>,
    queue:     Arc<RoundQueue>,
    fanout:    Arc<ConnectionFanout>,
    directory: Arc<dyn UserDirectory>,
    notifier:  Arc<dyn NotificationSink>,
    rooms:     Mutex<HashMap<RoomId, RoomRuntime>>,
    processed: Mutex<HashSet<RoundId>>, // round ids submitted for processing
}

impl Coordinator {
    /// Construct the coordinator and start consuming processing results.
    /// Collaborators are injected; nothing here is a global.
    pub fn spawn(
        config: CoordinatorConfig,
        ledger: Arc<RoundLedger>,
        fanout: Arc<ConnectionFanout>,
        directory: Arc<dyn UserDirectory>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Arc<Self> {
        let (queue, results) = RoundQueue::new(Arc::clone(&ledger));
        let coordinator = Arc::new(Self {
            config,
            ledger,
            queue,
            fanout,
            directory,
            notifier,
            rooms: Mutex::new(HashMap::new()),
            processed: Mutex::new(HashSet::new()),
        });
        tokio::spawn(Self::run_results(Arc::clone(&coordinator), results));
        coordinator
    }

    pub fn ledger(&self) -> &Arc<RoundLedger> {
        &self.ledger
    }

    pub async fn create_room(&self, config: RoomConfig) -> Result<RoomId> {
        self.ledger.create_room(config).await
    }

    pub async fn set_paused(&self, room_id: RoomId, paused: bool) -> Result<()> {
        self.ledger.set_paused(room_id, paused).await
    }

    // ── Client actions ───────────────────────────────────────────

    /// Stake into the room's current round. Broadcasts the join and arms the
    /// countdown once the minimum participant count is reached.
    pub async fn join_room(
        self: &Arc<Self>,
        room_id: RoomId,
        user_id: UserId,
        client_seed: Option<String>,
    ) -> Result<JoinOutcome> {
        let outcome = self.ledger.join(room_id, user_id, client_seed).await?;
        let display_name = self.display_name(user_id).await;
        self.fanout
            .broadcast_room(
                room_id,
                &ServerEvent::UserJoined {
                    room_id,
                    user_id,
                    display_name,
                    participant_count: outcome.participant_count,
                    prize_pool: outcome.prize_pool,
                },
            )
            .await;
        if outcome.countdown_wanted {
            self.start_countdown(
                room_id,
                outcome.round_id,
                outcome.countdown_secs,
                outcome.seed_commitment,
            )
            .await;
        }
        Ok(outcome)
    }

    /// Refundable leave (only while the room is still WAITING). Cancels the
    /// countdown when the count drops below the minimum — with no balance
    /// side effects from the cancellation itself.
    pub async fn leave_room(self: &Arc<Self>, room_id: RoomId, user_id: UserId) -> Result<LeaveOutcome> {
        let outcome = self.ledger.leave(room_id, user_id).await?;
        let display_name = self.display_name(user_id).await;
        self.fanout
            .broadcast_room(
                room_id,
                &ServerEvent::UserLeft {
                    room_id,
                    user_id,
                    display_name,
                    participant_count: outcome.participant_count,
                    prize_pool: outcome.prize_pool,
                },
            )
            .await;
        if outcome.below_min {
            self.cancel_countdown(room_id, outcome.participant_count).await;
        }
        Ok(outcome)
    }

    /// Client-reported animation completion. Signals outside the animation
    /// window (early, duplicate, or from a previous round) are no-ops, not
    /// errors.
    pub async fn animation_complete(self: &Arc<Self>, room_id: RoomId) -> Result<()> {
        let round_id = {
            let rooms = self.rooms.lock().await;
            match rooms.get(&room_id) {
                Some(rt) if rt.phase == RoomPhase::AwaitingAnimation => rt.pending_round,
                _ => None,
            }
        };
        let Some(round_id) = round_id else {
            debug!(%room_id, "animation signal outside window ignored");
            return Ok(());
        };
        self.complete_animation(room_id, round_id, CompletionTrigger::ClientSignal)
            .await;
        Ok(())
    }

    /// Operator retrigger for a room whose processing failed: restarts the
    /// countdown for the still-open round (which carries a fresh seed).
    pub async fn retry_round(self: &Arc<Self>, room_id: RoomId) -> Result<()> {
        ensure!(
            self.ledger.room_status(room_id).await? == RoomStatus::Waiting,
            RaffleError::RoomNotJoinable
        );
        let snapshot = self.ledger.round_snapshot(room_id).await?;
        ensure!(
            snapshot.participants.len() >= snapshot.min_participants,
            RaffleError::NotEnoughParticipants
        );
        self.start_countdown(
            room_id,
            snapshot.round_id,
            snapshot.countdown_secs,
            snapshot.seed_commitment,
        )
        .await;
        Ok(())
    }

    // ── Countdown ────────────────────────────────────────────────

    async fn start_countdown(
        self: &Arc<Self>,
        room_id: RoomId,
        round_id: RoundId,
        countdown_secs: u32,
        seed_commitment: [u8; 32],
    ) {
        {
            let mut rooms = self.rooms.lock().await;
            let rt = rooms.entry(room_id).or_default();
            if rt.phase != RoomPhase::Idle {
                return; // countdown (or a later stage) already in flight
            }
            // Any stale handles from a previous cycle go first.
            rt.abort_timers();
            rt.phase = RoomPhase::Countdown;
            rt.pending_round = Some(round_id);

            let this = Arc::clone(self);
            rt.countdown = Some(tokio::spawn(async move {
                this.run_countdown(room_id, round_id, countdown_secs).await;
            }));

            // Safety net in case the client never confirms the animation:
            // countdown + animation + margin, measured from countdown start.
            let this = Arc::clone(self);
            let delay = self.config.fallback_delay(countdown_secs);
            rt.fallback = Some(tokio::spawn(async move {
                sleep(delay).await;
                this.complete_animation(room_id, round_id, CompletionTrigger::FallbackTimer)
                    .await;
            }));
        }
        info!(%room_id, %round_id, countdown_secs, "countdown started");
        self.fanout
            .broadcast_room(
                room_id,
                &ServerEvent::CountdownStarted {
                    room_id,
                    round_id,
                    seconds: countdown_secs,
                    seed_commitment: to_hex(&seed_commitment),
                },
            )
            .await;
    }

    async fn run_countdown(self: Arc<Self>, room_id: RoomId, round_id: RoundId, countdown_secs: u32) {
        let mut remaining = countdown_secs;
        let mut ticker = interval(Duration::from_secs(COUNTDOWN_TICK_SECS));
        ticker.tick().await; // the first tick resolves immediately
        while remaining > 0 {
            ticker.tick().await;
            remaining -= 1;
            self.fanout
                .broadcast_room(room_id, &ServerEvent::CountdownTick { room_id, remaining })
                .await;
        }
        self.on_countdown_complete(room_id, round_id).await;
    }

    async fn cancel_countdown(&self, room_id: RoomId, participant_count: usize) {
        {
            let mut rooms = self.rooms.lock().await;
            let Some(rt) = rooms.get_mut(&room_id) else {
                return;
            };
            if rt.phase != RoomPhase::Countdown {
                return;
            }
            rt.abort_timers();
            rt.phase = RoomPhase::Idle;
            rt.pending_round = None;
        }
        info!(%room_id, "countdown cancelled, participants below minimum");
        self.fanout
            .broadcast_room(
                room_id,
                &ServerEvent::CountdownCancelled { room_id, participant_count },
            )
            .await;
    }

    async fn on_countdown_complete(self: &Arc<Self>, room_id: RoomId, round_id: RoundId) {
        {
            let mut rooms = self.rooms.lock().await;
            let Some(rt) = rooms.get_mut(&room_id) else {
                return;
            };
            if rt.phase != RoomPhase::Countdown || rt.pending_round != Some(round_id) {
                return;
            }
            rt.phase = RoomPhase::AwaitingAnimation;
            rt.countdown = None;
        }
        // Joins and refundable leaves are frozen from here on.
        if let Err(err) = self.ledger.set_room_status(room_id, RoomStatus::Active).await {
            warn!(%room_id, error = %err, "failed to activate room at countdown end");
        }
        info!(%room_id, %round_id, "countdown complete, awaiting animation");
        self.fanout
            .broadcast_room(room_id, &ServerEvent::AnimationStart { room_id, round_id })
            .await;
    }

    // ── Animation completion (client signal vs. fallback) ────────

    async fn complete_animation(
        self: &Arc<Self>,
        room_id: RoomId,
        round_id: RoundId,
        trigger: CompletionTrigger,
    ) {
        {
            let rooms = self.rooms.lock().await;
            let Some(rt) = rooms.get(&room_id) else {
                return;
            };
            if rt.phase != RoomPhase::AwaitingAnimation || rt.pending_round != Some(round_id) {
                return; // stale trigger from an earlier cycle
            }
        }
        {
            // The marker entry happens synchronously with the decision to
            // enqueue — before the queue confirms anything — so the second
            // of two racing triggers always observes it and backs off.
            let mut processed = self.processed.lock().await;
            if !processed.insert(round_id) {
                debug!(%room_id, %round_id, ?trigger, "round already submitted, trigger ignored");
                return;
            }
        }
        {
            let mut rooms = self.rooms.lock().await;
            if let Some(rt) = rooms.get_mut(&room_id) {
                rt.phase = RoomPhase::Processing;
            }
        }
        info!(%room_id, %round_id, ?trigger, "winner processing enqueued");
        if !self.queue.enqueue(room_id).await {
            warn!(%room_id, "a processing job was already in flight");
        }
    }

    // ── Processing results ───────────────────────────────────────

    async fn run_results(this: Arc<Self>, mut results: mpsc::UnboundedReceiver<ProcessingOutcome>) {
        while let Some(outcome) = results.recv().await {
            match outcome {
                ProcessingOutcome::Processed { room_id, round_id, outcome } => {
                    this.on_winner_processed(room_id, round_id, outcome).await;
                }
                ProcessingOutcome::Failed { room_id, round_id, message } => {
                    this.on_processing_failed(room_id, round_id, message).await;
                }
            }
        }
    }

    async fn on_winner_processed(self: &Arc<Self>, room_id: RoomId, round_id: RoundId, outcome: DrawOutcome) {
        {
            let mut rooms = self.rooms.lock().await;
            rooms.entry(room_id).or_default().phase = RoomPhase::Settling;
        }
        if let Err(err) = self.ledger.set_room_status(room_id, RoomStatus::Resetting).await {
            warn!(%room_id, error = %err, "failed to mark room resetting");
        }

        // Seed reveal rides along with the announcement so anyone can verify
        // the draw against the commitment published at countdown start.
        let (server_seed, client_seed) = match self.ledger.round_seed(round_id).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%round_id, error = %err, "seed reveal lookup failed");
                ([0u8; 32], None)
            }
        };
        let winners: Vec<WinnerSummary> = outcome
            .winners
            .iter()
            .map(|w| WinnerSummary {
                user_id: w.user_id,
                position: w.position,
                payout: w.payout,
            })
            .collect();
        let announcement = |scope: EventScope| ServerEvent::WinnerAnnounced {
            room_id,
            round_id,
            scope,
            winners: winners.clone(),
            prize_pool: outcome.prize_pool,
            platform_fee: outcome.platform_fee,
            server_seed: to_hex(&server_seed),
            client_seed: client_seed.clone(),
        };
        let targeted = announcement(EventScope::Targeted);
        let informational = announcement(EventScope::Informational);

        // Audience is the ledger's participant set by user identity — a
        // participant who navigated away or reconnected still gets it on
        // every connection they currently hold.
        if let Err(err) = self
            .fanout
            .notify_round_participants(round_id, &targeted, &informational)
            .await
        {
            warn!(%round_id, error = %err, "settlement fanout failed");
        }
        self.notify_sink(&targeted).await;

        for winner in &outcome.winners {
            let balance = self.ledger.balance(winner.user_id).await;
            let event = ServerEvent::BalanceUpdate {
                user_id: winner.user_id,
                round_id,
                balance,
            };
            self.fanout.notify_user(winner.user_id, &event).await;
            self.notify_sink(&event).await;
        }
        info!(%room_id, %round_id, pool = outcome.prize_pool, fee = outcome.platform_fee, "round settled");

        // Give clients a moment to render the outcome before the reset.
        let this = Arc::clone(self);
        let delay = self.config.reset_delay();
        tokio::spawn(async move {
            sleep(delay).await;
            this.reset_room(room_id, round_id).await;
        });
    }

    async fn on_processing_failed(self: &Arc<Self>, room_id: RoomId, round_id: Option<RoundId>, message: String) {
        error!(%room_id, reason = %message, "round abandoned after processing failure");
        {
            let mut rooms = self.rooms.lock().await;
            if let Some(rt) = rooms.get_mut(&room_id) {
                rt.abort_timers();
                rt.phase = RoomPhase::Idle;
            }
        }
        if let Some(round_id) = round_id {
            self.processed.lock().await.remove(&round_id);
            // A retried round must never replay a potentially compromised
            // seed; stakes stay committed — no silent refund.
            if let Err(err) = self.ledger.reroll_server_seed(round_id).await {
                warn!(%round_id, error = %err, "seed reroll failed");
            }
        }
        if let Err(err) = self.ledger.set_room_status(room_id, RoomStatus::Waiting).await {
            warn!(%room_id, error = %err, "failed to reopen room");
        }
        self.fanout
            .broadcast_room(
                room_id,
                &ServerEvent::ProcessingFailed { room_id, round_id, message },
            )
            .await;
    }

    // ── Reset ────────────────────────────────────────────────────

    /// Archive the settled round and reopen the room. Idempotent: when the
    /// round is already archived, nothing mutates and nothing is broadcast
    /// again.
    pub async fn reset_room(self: &Arc<Self>, room_id: RoomId, round_id: RoundId) {
        {
            let mut rooms = self.rooms.lock().await;
            if let Some(rt) = rooms.get_mut(&room_id) {
                rt.abort_timers();
                rt.phase = RoomPhase::Resetting;
                rt.pending_round = None;
            }
        }
        let archived = match self.ledger.archive_completed_round(room_id).await {
            Ok(archived) => archived,
            Err(err) => {
                warn!(%room_id, error = %err, "archive failed during reset");
                false
            }
        };
        if archived {
            if let Err(err) = self.ledger.purge_abandoned_round(room_id).await {
                warn!(%room_id, error = %err, "stray round purge failed");
            }
            if let Err(err) = self.ledger.set_room_status(room_id, RoomStatus::Waiting).await {
                warn!(%room_id, error = %err, "failed to reopen room after reset");
            }
            // Bounded marker cleanup: the round id leaves the processed set
            // once its room has fully cycled.
            self.processed.lock().await.remove(&round_id);
        }
        {
            let mut rooms = self.rooms.lock().await;
            if let Some(rt) = rooms.get_mut(&room_id) {
                rt.phase = RoomPhase::Idle;
            }
        }
        if !archived {
            debug!(%room_id, %round_id, "reset skipped, round already archived");
            return;
        }
        info!(%room_id, %round_id, "room reset");
        self.fanout
            .broadcast_room(
                room_id,
                &ServerEvent::RoomReset {
                    room_id,
                    status: RoomStatus::Waiting,
                    participant_count: 0,
                },
            )
            .await;
    }

    // ── Internals ────────────────────────────────────────────────

    async fn display_name(&self, user_id: UserId) -> String {
        match self.directory.display_name(user_id).await {
            Ok(name) => name,
            Err(err) => {
                warn!(%user_id, error = %err, "display name lookup failed");
                GENERIC_DISPLAY_NAME.to_string()
            }
        }
    }

    /// Fire-and-forget: sink failures are logged, never propagated into the
    /// lifecycle transition that emitted the event.
    async fn notify_sink(&self, event: &ServerEvent) {
        if let Err(err) = self.notifier.notify(event).await {
            warn!(error = %err, "notification sink failed");
        }
    }
}
