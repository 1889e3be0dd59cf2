//! Whole-lifecycle tests: join → countdown → animation → settlement → reset,
//! driven on a paused clock so timer behavior is deterministic and fast.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::time::{sleep, Duration};

use raffle_rooms::{
    ConnectionFanout, ConnectionId, ConnectionSink, Coordinator, CoordinatorConfig, EventScope,
    NoopNotifier, RaffleError, Result, RoomConfig, RoomId, RoomStatus, RoundLedger, ServerEvent,
    UserDirectory, UserId,
};

// ── Fixtures ──────────────────────────────────────────────────────────────

struct RecordingSink {
    events: Mutex<Vec<ServerEvent>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self { events: Mutex::new(Vec::new()) })
    }

    fn recorded(&self) -> Vec<ServerEvent> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, pred: impl Fn(&ServerEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}

#[async_trait]
impl ConnectionSink for RecordingSink {
    async fn send(&self, event: &ServerEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

struct TestDirectory;

#[async_trait]
impl UserDirectory for TestDirectory {
    async fn display_name(&self, user_id: UserId) -> Result<String> {
        Ok(format!("user-{user_id}"))
    }
}

struct Harness {
    coordinator: Arc<Coordinator>,
    fanout:      Arc<ConnectionFanout>,
    ledger:      Arc<RoundLedger>,
}

async fn harness(room_config: RoomConfig) -> (Harness, RoomId) {
    let ledger = Arc::new(RoundLedger::new());
    let fanout = Arc::new(ConnectionFanout::new(Arc::clone(&ledger), Arc::new(TestDirectory)));
    let coordinator = Coordinator::spawn(
        CoordinatorConfig::default(),
        Arc::clone(&ledger),
        Arc::clone(&fanout),
        Arc::new(TestDirectory),
        Arc::new(NoopNotifier),
    );
    let room_id = coordinator.create_room(room_config).await.unwrap();
    (Harness { coordinator, fanout, ledger }, room_id)
}

fn room_config() -> RoomConfig {
    // min=3, max=10, bet=$10, single winner, 10% fee.
    RoomConfig {
        bet_amount:       1_000,
        min_participants: 3,
        max_participants: 10,
        countdown_secs:   30,
        winner_count:     1,
        fee_bps:          1_000,
    }
}

/// A funded user with one connection viewing the room, staked into the round.
async fn join_player(
    h: &Harness,
    room_id: RoomId,
    funds: u64,
) -> (UserId, Arc<RecordingSink>, ConnectionId) {
    let user = UserId::new();
    h.ledger.credit_balance(user, funds).await;
    let sink = RecordingSink::new();
    let conn = h.fanout.register(user, sink.clone()).await;
    // Subscribe to the room channel first so the connection sees the events
    // its own join triggers (user-joined, countdown start).
    h.fanout.join(conn, room_id).await.unwrap();
    h.coordinator.join_room(room_id, user, None).await.unwrap();
    (user, sink, conn)
}

/// Let spawned jobs and the result loop drain without advancing the clock.
async fn drain() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

fn winner_announcements(sink: &RecordingSink) -> usize {
    sink.count(|e| matches!(e, ServerEvent::WinnerAnnounced { .. }))
}

// ── Scenario A: joins and a leave mid-countdown leave the countdown alone ──

#[tokio::test(start_paused = true)]
async fn scenario_a_countdown_survives_midstream_churn() {
    let (h, room_id) = harness(room_config()).await;

    let (first, _s1, _c1) = join_player(&h, room_id, 5_000).await;
    join_player(&h, room_id, 5_000).await;
    let (_, sink, _) = join_player(&h, room_id, 5_000).await;
    drain().await;
    assert_eq!(sink.count(|e| matches!(e, ServerEvent::CountdownStarted { .. })), 1);

    // Fourth joins mid-countdown: pool grows, countdown unaffected.
    sleep(Duration::from_secs(10)).await;
    join_player(&h, room_id, 5_000).await;
    let (count, pool) = h.ledger.room_overview(room_id).await.unwrap();
    assert_eq!((count, pool), (4, 4_000));

    // One of the original three leaves: still at the minimum, no cancel.
    h.coordinator.leave_room(room_id, first).await.unwrap();
    let (count, pool) = h.ledger.room_overview(room_id).await.unwrap();
    assert_eq!((count, pool), (3, 3_000));

    sleep(Duration::from_secs(25)).await;
    drain().await;
    assert_eq!(sink.count(|e| matches!(e, ServerEvent::CountdownStarted { .. })), 1);
    assert_eq!(sink.count(|e| matches!(e, ServerEvent::CountdownCancelled { .. })), 0);
    assert_eq!(sink.count(|e| matches!(e, ServerEvent::AnimationStart { .. })), 1);
}

// ── Scenario B: dropping below the minimum cancels the countdown ──────────

#[tokio::test(start_paused = true)]
async fn scenario_b_countdown_cancels_below_minimum() {
    let (h, room_id) = harness(room_config()).await;

    let (leaver, _s, _c) = join_player(&h, room_id, 5_000).await;
    join_player(&h, room_id, 5_000).await;
    let (stayer, sink, _) = join_player(&h, room_id, 5_000).await;

    sleep(Duration::from_secs(5)).await;
    h.coordinator.leave_room(room_id, leaver).await.unwrap();
    drain().await;

    assert_eq!(sink.count(|e| matches!(e, ServerEvent::CountdownCancelled { .. })), 1);
    assert_eq!(h.ledger.room_status(room_id).await.unwrap(), RoomStatus::Waiting);
    // The cancellation itself moves no money: the leaver was refunded by the
    // leave, the stayers remain staked.
    assert_eq!(h.ledger.balance(leaver).await, 5_000);
    assert_eq!(h.ledger.balance(stayer).await, 4_000);

    // Long after the aborted countdown would have finished, nothing fired.
    sleep(Duration::from_secs(60)).await;
    drain().await;
    assert_eq!(sink.count(|e| matches!(e, ServerEvent::AnimationStart { .. })), 0);
    assert_eq!(h.ledger.stats().await.rounds_completed, 0);
}

// ── Scenario C: fallback timer settles when the client never confirms ─────

#[tokio::test(start_paused = true)]
async fn scenario_c_fallback_settles_without_client_signal() {
    let (h, room_id) = harness(room_config()).await;

    let mut players = Vec::new();
    for _ in 0..3 {
        players.push(join_player(&h, room_id, 5_000).await);
    }
    players.push(join_player(&h, room_id, 5_000).await); // $40 pool

    // Countdown (30s) + animation (8s) + margin (4s), and then some. The
    // client never reports completion — the simulated disconnect.
    sleep(Duration::from_secs(50)).await;
    drain().await;

    assert_eq!(h.ledger.stats().await.rounds_completed, 1);
    for (_, sink, _) in &players {
        assert_eq!(winner_announcements(sink), 1);
    }

    // 10% fee on $40: $36 distributed, $4 kept.
    let stats = h.ledger.stats().await;
    assert_eq!(stats.total_paid_out, 3_600);
    assert_eq!(stats.total_fees, 400);
    let total = total_balance_of(&h, &players).await;
    assert_eq!(total, 4 * 5_000 - 400); // users collectively paid only the fee
}

async fn total_balance_of(h: &Harness, players: &[(UserId, Arc<RecordingSink>, ConnectionId)]) -> u64 {
    let mut total = 0;
    for (user, _, _) in players {
        total += h.ledger.balance(*user).await;
    }
    total
}

// ── Scenario D: client signal wins, the later fallback is a no-op ─────────

#[tokio::test(start_paused = true)]
async fn scenario_d_client_signal_beats_fallback() {
    let (h, room_id) = harness(room_config()).await;

    let mut players = Vec::new();
    for _ in 0..4 {
        players.push(join_player(&h, room_id, 5_000).await);
    }

    // One second into the animation window, well before the fallback at 42s.
    sleep(Duration::from_secs(31)).await;
    drain().await;
    h.coordinator.animation_complete(room_id).await.unwrap();
    drain().await;
    assert_eq!(h.ledger.stats().await.rounds_completed, 1);

    // Sail past the fallback deadline: exactly one settlement ever happens.
    sleep(Duration::from_secs(30)).await;
    drain().await;
    assert_eq!(h.ledger.stats().await.rounds_completed, 1);
    for (_, sink, _) in &players {
        assert_eq!(winner_announcements(sink), 1);
    }
}

// ── Scenario E: both tabs of a participant get the identical payload ──────

#[tokio::test(start_paused = true)]
async fn scenario_e_multi_tab_delivery_is_identical() {
    let (h, room_id) = harness(room_config()).await;

    let (user, tab_a, _) = join_player(&h, room_id, 5_000).await;
    // Second tab: same user, separate connection, also viewing the room.
    let tab_b = RecordingSink::new();
    let conn_b = h.fanout.register(user, tab_b.clone()).await;
    h.fanout.join(conn_b, room_id).await.unwrap();

    join_player(&h, room_id, 5_000).await;
    join_player(&h, room_id, 5_000).await;

    sleep(Duration::from_secs(31)).await;
    drain().await;
    h.coordinator.animation_complete(room_id).await.unwrap();
    drain().await;

    let from_a: Vec<ServerEvent> = tab_a
        .recorded()
        .into_iter()
        .filter(|e| matches!(e, ServerEvent::WinnerAnnounced { .. }))
        .collect();
    let from_b: Vec<ServerEvent> = tab_b
        .recorded()
        .into_iter()
        .filter(|e| matches!(e, ServerEvent::WinnerAnnounced { .. }))
        .collect();
    assert_eq!(from_a.len(), 1);
    assert_eq!(from_a, from_b);
    assert!(matches!(
        &from_a[0],
        ServerEvent::WinnerAnnounced { scope: EventScope::Targeted, .. }
    ));
}

// ── Scenario F: mid-settlement failure reopens the room, stakes stay ──────

#[tokio::test(start_paused = true)]
async fn scenario_f_processing_failure_reopens_room() {
    let (h, room_id) = harness(room_config()).await;

    // Balances engineered so the winner credit overflows inside settlement.
    let mut players = Vec::new();
    for _ in 0..3 {
        players.push(join_player(&h, room_id, u64::MAX).await);
    }
    let before = h.ledger.round_snapshot(room_id).await.unwrap();

    sleep(Duration::from_secs(31)).await;
    drain().await;
    h.coordinator.animation_complete(room_id).await.unwrap();
    drain().await;

    // Room is recoverable, the round is abandoned but intact, and no stake
    // was silently refunded.
    assert_eq!(h.ledger.room_status(room_id).await.unwrap(), RoomStatus::Waiting);
    assert_eq!(h.ledger.stats().await.rounds_completed, 0);
    let after = h.ledger.round_snapshot(room_id).await.unwrap();
    assert_eq!(after.round_id, before.round_id);
    for (user, _, _) in &players {
        assert_eq!(h.ledger.balance(*user).await, u64::MAX - 1_000);
    }
    // A retried round must not replay the compromised seed.
    assert_ne!(after.seed_commitment, before.seed_commitment);

    for (_, sink, _) in &players {
        assert_eq!(sink.count(|e| matches!(e, ServerEvent::ProcessingFailed { .. })), 1);
        assert_eq!(winner_announcements(sink), 0);
    }
}

// ── Failure retrigger: operator retry restarts the countdown ──────────────

#[tokio::test(start_paused = true)]
async fn retry_after_failure_restarts_countdown() {
    let (h, room_id) = harness(room_config()).await;
    let mut sinks = Vec::new();
    for _ in 0..3 {
        let (_, sink, _) = join_player(&h, room_id, u64::MAX).await;
        sinks.push(sink);
    }

    sleep(Duration::from_secs(50)).await; // fallback path fails the round
    drain().await;
    assert_eq!(h.ledger.room_status(room_id).await.unwrap(), RoomStatus::Waiting);

    h.coordinator.retry_round(room_id).await.unwrap();
    drain().await;
    assert_eq!(sinks[0].count(|e| matches!(e, ServerEvent::CountdownStarted { .. })), 2);
}

// ── Full cycle: the room comes back WAITING and plays another round ───────

#[tokio::test(start_paused = true)]
async fn room_resets_and_plays_consecutive_rounds() {
    let (h, room_id) = harness(room_config()).await;

    let mut players = Vec::new();
    for _ in 0..3 {
        players.push(join_player(&h, room_id, 10_000).await);
    }
    let first_round = h.ledger.round_snapshot(room_id).await.unwrap().round_id;

    sleep(Duration::from_secs(31)).await;
    drain().await;
    h.coordinator.animation_complete(room_id).await.unwrap();
    drain().await;
    sleep(Duration::from_secs(10)).await; // render delay, then reset
    drain().await;

    assert_eq!(h.ledger.room_status(room_id).await.unwrap(), RoomStatus::Waiting);
    for (_, sink, _) in &players {
        assert_eq!(sink.count(|e| matches!(e, ServerEvent::RoomReset { .. })), 1);
    }

    // Same users stake again: a fresh round, a fresh countdown, a second
    // settlement.
    for (user, _, _) in &players {
        h.coordinator.join_room(room_id, *user, None).await.unwrap();
    }
    let second_round = h.ledger.round_snapshot(room_id).await.unwrap().round_id;
    assert_ne!(second_round, first_round);

    sleep(Duration::from_secs(50)).await;
    drain().await;
    assert_eq!(h.ledger.stats().await.rounds_completed, 2);
    assert_eq!(h.ledger.room_status(room_id).await.unwrap(), RoomStatus::Waiting);
}

// ── Rooms run independently ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn rooms_process_concurrently_and_independently() {
    let (h, room_a) = harness(room_config()).await;
    let room_b = h.coordinator.create_room(room_config()).await.unwrap();

    for _ in 0..3 {
        join_player(&h, room_a, 5_000).await;
        join_player(&h, room_b, 5_000).await;
    }

    sleep(Duration::from_secs(50)).await; // both fallbacks fire
    drain().await;
    assert_eq!(h.ledger.stats().await.rounds_completed, 2);
    assert_eq!(h.ledger.room_status(room_a).await.unwrap(), RoomStatus::Waiting);
    assert_eq!(h.ledger.room_status(room_b).await.unwrap(), RoomStatus::Waiting);
}

// ── Joins are rejected while the round is in flight ───────────────────────

#[tokio::test(start_paused = true)]
async fn no_join_between_countdown_end_and_reset() {
    let (h, room_id) = harness(room_config()).await;
    for _ in 0..3 {
        join_player(&h, room_id, 5_000).await;
    }

    sleep(Duration::from_secs(31)).await;
    drain().await;

    let late = UserId::new();
    h.ledger.credit_balance(late, 5_000).await;
    assert_eq!(
        h.coordinator.join_room(room_id, late, None).await,
        Err(RaffleError::RoomNotJoinable)
    );
    assert_eq!(h.ledger.balance(late).await, 5_000);
}
