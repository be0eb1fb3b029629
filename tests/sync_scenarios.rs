use async_trait::async_trait;
use matchsync::cache::CollectionKind;
use matchsync::capabilities::testing::MemoryCapabilities;
use matchsync::capabilities::{
    Capabilities, ChangeEvent, DataError, DataOp, DataService, EventBus, LocalStorage,
    MemoryDataService, Patch, Query, Table,
};
use matchsync::deep_link::DeepLinkOutcome;
use matchsync::ingestion::{IngestionStatus, Interest};
use matchsync::offline_store::ParticipationMirror;
use matchsync::{ErrorKind, EventId, MatchId, SyncConfig, SyncEngine, UserId};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// Alice has one confirmed match with Bob, one with Carol, and one event with
/// five other participants out of ten seats.
fn world() -> MemoryCapabilities {
    let caps = MemoryCapabilities::new();
    caps.data.seed(
        Table::Matches,
        [
            json!({"id": "m-bob", "user1_id": "alice", "user2_id": "bob", "status": "matched", "created_at": 1}),
            json!({"id": "m-carol", "user1_id": "carol", "user2_id": "alice", "status": "matched", "created_at": 2}),
        ],
    );
    caps.data.seed(
        Table::Profiles,
        [
            json!({"id": "bob", "display_name": "Bob"}),
            json!({"id": "carol", "display_name": "Carol"}),
        ],
    );
    caps.data.seed(
        Table::Events,
        [json!({"id": "e1", "title": "Board games", "creator_id": "bob", "created_at": 1, "starts_at": 100, "max_participants": 10})],
    );
    caps.data.seed(
        Table::EventParticipants,
        (1..=5).map(|n| {
            json!({"id": format!("e1:u{n}"), "event_id": "e1", "user_id": format!("u{n}"), "joined_at": n})
        }),
    );
    caps
}

fn engine(caps: &MemoryCapabilities) -> Arc<SyncEngine> {
    engine_with(caps.capabilities(), SyncConfig::default())
}

fn engine_with(caps: Capabilities, config: SyncConfig) -> Arc<SyncEngine> {
    Arc::new(SyncEngine::new(UserId::new("alice"), caps, config).unwrap())
}

fn small_pages() -> SyncConfig {
    SyncConfig {
        message_page_size: 2,
        ..SyncConfig::default()
    }
}

fn message_row(id: &str, at: u64) -> Value {
    json!({"id": id, "match_id": "m-bob", "sender_id": "bob", "content": id, "created_at": at})
}

fn message_ids(engine: &SyncEngine) -> Vec<String> {
    engine
        .view()
        .selected_messages
        .iter()
        .map(|m| m.id.as_str().to_string())
        .collect()
}

/// Hands back participant rows only after `release`, once armed, so a
/// refresh can read the server and then stall before it lands.
struct StallingParticipants {
    inner: Arc<MemoryDataService>,
    armed: AtomicBool,
    gate: Semaphore,
}

impl StallingParticipants {
    fn new(inner: Arc<MemoryDataService>) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(false),
            gate: Semaphore::new(0),
        }
    }

    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    fn release(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait]
impl DataService for StallingParticipants {
    async fn fetch(&self, query: &Query) -> Result<Vec<Value>, DataError> {
        let rows = self.inner.fetch(query).await?;
        if query.table == Table::EventParticipants && self.armed.swap(false, Ordering::SeqCst) {
            self.gate.acquire().await.unwrap().forget();
        }
        Ok(rows)
    }

    async fn count(&self, query: &Query) -> Result<u64, DataError> {
        self.inner.count(query).await
    }

    async fn insert(&self, table: Table, row: Value) -> Result<Value, DataError> {
        self.inner.insert(table, row).await
    }

    async fn update(&self, table: Table, id: &str, patch: Patch) -> Result<Value, DataError> {
        self.inner.update(table, id, patch).await
    }

    async fn delete(&self, table: Table, id: &str) -> Result<(), DataError> {
        self.inner.delete(table, id).await
    }
}

fn seat_count(engine: &SyncEngine) -> u32 {
    engine
        .view()
        .events
        .iter()
        .find(|e| e.id == EventId::new("e1"))
        .map(|e| e.current_participants)
        .unwrap()
}

fn joined(engine: &SyncEngine) -> Option<bool> {
    engine.view().participation.get(&EventId::new("e1")).copied()
}

#[tokio::test]
async fn local_send_and_echo_leave_one_message() {
    let caps = world();
    let engine = engine(&caps);
    engine.start().await;

    // 1. Open the conversation; realtime is bound to it
    let m = MatchId::new("m-bob");
    engine.select_match(Some(&m)).await.unwrap();
    assert_eq!(
        engine.view().realtime,
        IngestionStatus::Live(Interest::Conversation(m.clone()))
    );

    // 2. Send; the backend echoes the insert onto the bus
    let sent = engine.send_message(&m, "hello there").await.unwrap();
    settle().await;

    // 3. Replay the same row again, as a duplicate delivery would
    let row = caps.data.rows(Table::Messages).pop().unwrap();
    assert_eq!(caps.bus.publish(&ChangeEvent::insert(Table::Messages, row)), 1);
    settle().await;

    let view = engine.view();
    assert_eq!(view.selected_messages.len(), 1);
    assert_eq!(view.selected_messages[0].id, sent.id);
    let summary = view
        .matches
        .iter()
        .find(|r| r.id == m)
        .and_then(|r| r.last_message.clone())
        .unwrap();
    assert_eq!(summary.message_id, sent.id);
    engine.stop().await;
}

#[tokio::test]
async fn rapid_double_join_issues_one_insert() {
    let caps = world();
    let engine = engine(&caps);
    engine.start().await;
    caps.data.hold(DataOp::Insert, Table::EventParticipants);

    let first = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.join_event(&EventId::new("e1")).await }
    });
    settle().await;

    // Optimistic state is visible while the insert is held
    assert_eq!(joined(&engine), Some(true));
    assert_eq!(seat_count(&engine), 6);
    assert_eq!(engine.view().pending_mutations, vec!["event:e1".to_string()]);

    let second = engine.join_event(&EventId::new("e1")).await.unwrap_err();
    assert_eq!(second.kind, ErrorKind::InFlight);

    caps.data.release(DataOp::Insert, Table::EventParticipants);
    assert!(first.await.unwrap().unwrap());
    assert_eq!(caps.data.calls(DataOp::Insert, Table::EventParticipants), 1);
    assert!(engine.view().pending_mutations.is_empty());
    engine.stop().await;
}

#[tokio::test]
async fn join_then_refresh_does_not_flicker() {
    let caps = world();
    let engine = engine(&caps);
    engine.start().await;
    assert_eq!((joined(&engine), seat_count(&engine)), (Some(false), 5));

    // 1. Join: shown immediately, confirmed remotely
    assert!(engine.join_event(&EventId::new("e1")).await.unwrap());
    assert_eq!((joined(&engine), seat_count(&engine)), (Some(true), 6));
    let before = engine.view().revisions;

    // 2. Focus refresh returns the same authoritative state
    let summary = engine.on_focus().await;
    assert!(summary.failed.is_empty());
    assert_eq!((joined(&engine), seat_count(&engine)), (Some(true), 6));
    assert!(engine.view().revisions.events > before.events);
    engine.stop().await;
}

#[tokio::test]
async fn failed_join_restores_exact_prior_state() {
    let caps = world();
    let engine = engine(&caps);
    engine.start().await;
    let before = engine.view();

    caps.data.fail_next(
        DataOp::Insert,
        Table::EventParticipants,
        DataError::network("connection reset"),
    );
    let err = engine.join_event(&EventId::new("e1")).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Network);

    let after = engine.view();
    assert_eq!(after.events, before.events);
    assert_eq!(after.participation, before.participation);
    assert_eq!(after.matches, before.matches);
    assert!(after.active_error.is_some());
    assert!(after.toast.is_some());
    engine.stop().await;
}

#[tokio::test]
async fn refresh_during_inflight_join_keeps_optimistic_state() {
    let caps = world();
    let engine = engine(&caps);
    engine.start().await;

    // 1. Join is held in flight; a queued failure will be returned on release
    caps.data.fail_next(
        DataOp::Insert,
        Table::EventParticipants,
        DataError::network("dropped"),
    );
    caps.data.hold(DataOp::Insert, Table::EventParticipants);
    let join = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.join_event(&EventId::new("e1")).await }
    });
    settle().await;

    // 2. Someone else joins server-side, then a refresh lands mid-flight
    caps.data.seed(
        Table::EventParticipants,
        [json!({"id": "e1:u6", "event_id": "e1", "user_id": "u6", "joined_at": 6})],
    );
    engine.on_focus().await;
    assert_eq!((joined(&engine), seat_count(&engine)), (Some(true), 7));

    // 3. The join fails: revert lands on the refreshed authoritative value
    caps.data.release(DataOp::Insert, Table::EventParticipants);
    assert!(join.await.unwrap().is_err());
    assert_eq!((joined(&engine), seat_count(&engine)), (Some(false), 6));
    engine.stop().await;
}

#[tokio::test]
async fn deep_link_before_matches_load_selects_once() {
    let caps = world();
    let engine = engine(&caps);

    // 1. Reference arrives before anything is loaded
    let link = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.open_deep_link(&UserId::new("carol")).await }
    });
    settle().await;
    assert!(engine.view().selected_match.is_none());

    // 2. Initial load resolves it
    engine.start().await;
    assert_eq!(
        link.await.unwrap(),
        DeepLinkOutcome::Selected(MatchId::new("m-carol"))
    );
    assert_eq!(engine.view().selected_match, Some(MatchId::new("m-carol")));

    // 3. The identical reference again is a no-op, even after deselecting
    engine.select_match(None).await.unwrap();
    assert_eq!(
        engine.open_deep_link(&UserId::new("carol")).await,
        DeepLinkOutcome::AlreadyProcessed
    );
    assert!(engine.view().selected_match.is_none());
    engine.stop().await;
}

#[tokio::test]
async fn switching_conversations_never_overlaps_subscriptions() {
    let caps = world();
    let engine = engine(&caps);
    engine.start().await;

    engine.select_match(Some(&MatchId::new("m-bob"))).await.unwrap();
    engine.select_match(Some(&MatchId::new("m-carol"))).await.unwrap();
    assert_eq!(caps.bus.live_subscriptions(), 1);
    assert_eq!(caps.bus.subscribe_count(), 2);

    // A late message for the de-selected conversation reaches no subscriber
    let late = json!({"id": "late", "match_id": "m-bob", "sender_id": "bob", "content": "still there?", "created_at": 99});
    assert_eq!(caps.bus.publish(&ChangeEvent::insert(Table::Messages, late)), 0);
    let fresh = json!({"id": "fresh", "match_id": "m-carol", "sender_id": "carol", "content": "hi!", "created_at": 100});
    assert_eq!(caps.bus.publish(&ChangeEvent::insert(Table::Messages, fresh)), 1);
    settle().await;

    engine.cache().read(|s| {
        assert!(s.message(&matchsync::MessageId::new("late")).is_none());
        assert!(s.message(&matchsync::MessageId::new("fresh")).is_some());
    });
    engine.stop().await;
}

#[tokio::test]
async fn dropped_subscription_recovers_on_visibility() {
    let caps = world();
    let engine = engine(&caps);
    engine.start().await;
    let m = MatchId::new("m-bob");
    engine.select_match(Some(&m)).await.unwrap();

    // 1. Bus drops; a message is written while nobody listens
    caps.bus.disconnect_all();
    settle().await;
    assert_eq!(
        engine.view().realtime,
        IngestionStatus::Stale(Interest::Conversation(m.clone()))
    );
    caps.data.seed(
        Table::Messages,
        [json!({"id": "missed", "match_id": "m-bob", "sender_id": "bob", "content": "you there?", "created_at": 50})],
    );

    // 2. Hidden then visible again: re-subscribe and backfill
    assert!(engine.on_visibility_change(false).await.is_none());
    let summary = engine.on_visibility_change(true).await.unwrap();
    assert_eq!(summary.recovered, Some(Interest::Conversation(m.clone())));
    let view = engine.view();
    assert_eq!(view.realtime, IngestionStatus::Live(Interest::Conversation(m)));
    assert_eq!(view.selected_messages.len(), 1);
    engine.stop().await;
}

#[tokio::test]
async fn refresh_that_read_before_a_join_does_not_revert_it() {
    let caps = world();
    let stalling = Arc::new(StallingParticipants::new(Arc::clone(&caps.data)));
    let engine = engine_with(
        Capabilities::new(
            Arc::clone(&stalling) as Arc<dyn DataService>,
            Arc::clone(&caps.bus) as Arc<dyn EventBus>,
            Arc::clone(&caps.storage) as Arc<dyn LocalStorage>,
        ),
        SyncConfig::default(),
    );
    engine.start().await;

    // 1. A focus refresh reads the five participant rows, then stalls
    stalling.arm();
    let focus = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.on_focus().await }
    });
    settle().await;

    // 2. The join commits while that stale read is parked
    assert!(engine.join_event(&EventId::new("e1")).await.unwrap());
    assert_eq!((joined(&engine), seat_count(&engine)), (Some(true), 6));

    // 3. The stale read is discarded; the refetch agrees with the server
    stalling.release();
    let summary = focus.await.unwrap();
    assert!(summary.refreshed.contains(&CollectionKind::Events));
    assert_eq!((joined(&engine), seat_count(&engine)), (Some(true), 6));
    assert_eq!(caps.data.rows(Table::EventParticipants).len(), 6);

    let storage: Arc<dyn LocalStorage> = Arc::clone(&caps.storage) as Arc<dyn LocalStorage>;
    let mirror = ParticipationMirror::new(storage, UserId::new("alice")).unwrap();
    assert_eq!(mirror.load().unwrap().get(&EventId::new("e1")), Some(&true));
    engine.stop().await;
}

#[tokio::test]
async fn reconnect_backfills_every_message_missed_while_offline() {
    let caps = world();
    caps.data.seed(Table::Messages, [message_row("x1", 10)]);
    let engine = engine_with(caps.capabilities(), small_pages());
    engine.start().await;
    let m = MatchId::new("m-bob");
    engine.select_match(Some(&m)).await.unwrap();
    assert_eq!(message_ids(&engine), vec!["x1"]);

    // 1. Realtime drops while five messages arrive, more than one page
    caps.bus.disconnect_all();
    settle().await;
    caps.data.seed(
        Table::Messages,
        [20, 30, 40, 50, 60]
            .into_iter()
            .enumerate()
            .map(|(n, at)| message_row(&format!("x{}", n + 2), at)),
    );

    // 2. Coming back pages back until it meets the cached history
    engine.on_visibility_change(false).await;
    let summary = engine.on_visibility_change(true).await.unwrap();
    assert_eq!(summary.recovered, Some(Interest::Conversation(m.clone())));
    assert_eq!(message_ids(&engine), vec!["x1", "x2", "x3", "x4", "x5", "x6"]);

    // 3. Nothing is left to page in
    engine.load_older_messages(&m).await.unwrap();
    assert_eq!(message_ids(&engine).len(), 6);
    assert!(!engine.view().has_older_messages);
    engine.stop().await;
}

#[tokio::test]
async fn paging_older_keeps_messages_sharing_a_timestamp() {
    let caps = world();
    caps.data.seed(
        Table::Messages,
        [
            message_row("x1", 10),
            message_row("x2", 20),
            message_row("x3", 20),
            message_row("x4", 30),
        ],
    );
    let engine = engine_with(caps.capabilities(), small_pages());
    engine.start().await;
    let m = MatchId::new("m-bob");
    engine.select_match(Some(&m)).await.unwrap();
    assert_eq!(message_ids(&engine).len(), 2);

    while engine.view().has_older_messages {
        engine.load_older_messages(&m).await.unwrap();
    }
    assert_eq!(message_ids(&engine), vec!["x1", "x2", "x3", "x4"]);
    engine.stop().await;
}
