#![cfg(not(target_arch = "wasm32"))]

use matchsync::capabilities::{
    Capabilities, DataService, EventBus, KeyNamespace, KvKey, LocalStorage, MemoryDataService,
    MemoryEventBus, SqliteStorage, Table,
};
use matchsync::offline_store::ParticipationMirror;
use matchsync::{EventId, SyncConfig, SyncEngine, UserId};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

fn backend() -> (Arc<MemoryDataService>, Arc<MemoryEventBus>) {
    let bus = Arc::new(MemoryEventBus::new());
    let data = Arc::new(MemoryDataService::with_bus(Arc::clone(&bus)));
    data.seed(
        Table::Events,
        [
            json!({"id": "e1", "title": "Run club", "creator_id": "bob", "created_at": 1, "starts_at": 100, "max_participants": 20}),
            json!({"id": "e2", "title": "Quiz", "creator_id": "bob", "created_at": 2, "starts_at": 200, "max_participants": 8}),
        ],
    );
    (data, bus)
}

fn engine_on(path: &Path, data: &Arc<MemoryDataService>, bus: &Arc<MemoryEventBus>) -> SyncEngine {
    let storage = SqliteStorage::open(path).unwrap();
    let caps = Capabilities::new(
        Arc::clone(data) as Arc<dyn DataService>,
        Arc::clone(bus) as Arc<dyn EventBus>,
        Arc::new(storage) as Arc<dyn LocalStorage>,
    );
    SyncEngine::new(UserId::new("alice"), caps, SyncConfig::default()).unwrap()
}

#[tokio::test]
async fn join_leave_round_trip_keeps_mirror_consistent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mirror.db");
    let (data, bus) = backend();
    let engine = engine_on(&path, &data, &bus);
    engine.start().await;

    let e1 = EventId::new("e1");
    assert!(engine.join_event(&e1).await.unwrap());
    assert!(!engine.leave_event(&e1).await.unwrap());
    assert_eq!(engine.view().participation.get(&e1), Some(&false));
    assert!(data.rows(Table::EventParticipants).is_empty());

    let storage: Arc<dyn LocalStorage> = Arc::new(SqliteStorage::open(&path).unwrap());
    let mirror = ParticipationMirror::new(storage, UserId::new("alice")).unwrap();
    assert_eq!(mirror.load().unwrap().get(&e1), Some(&false));
    engine.stop().await;
}

#[tokio::test]
async fn mirror_survives_restart_and_paints_before_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mirror.db");
    let (data, bus) = backend();

    // 1. First session joins e2
    {
        let engine = engine_on(&path, &data, &bus);
        engine.start().await;
        assert!(engine.join_event(&EventId::new("e2")).await.unwrap());
        engine.stop().await;
    }

    // 2. Second session paints membership with no fetch yet
    let engine = engine_on(&path, &data, &bus);
    let view = engine.view();
    assert!(!view.events_loaded);
    assert_eq!(view.participation.get(&EventId::new("e2")), Some(&true));
    assert_eq!(view.participation.get(&EventId::new("e1")), Some(&false));

    // 3. Server wins: the row disappears remotely, the refresh overwrites both
    data.delete(Table::EventParticipants, "e2:alice").await.unwrap();
    engine.start().await;
    assert_eq!(engine.view().participation.get(&EventId::new("e2")), Some(&false));

    let storage: Arc<dyn LocalStorage> = Arc::new(SqliteStorage::open(&path).unwrap());
    let mirror = ParticipationMirror::new(storage, UserId::new("alice")).unwrap();
    assert_eq!(mirror.load().unwrap().get(&EventId::new("e2")), Some(&false));
    engine.stop().await;
}

#[tokio::test]
async fn corrupted_mirror_is_ignored_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mirror.db");
    {
        let storage = SqliteStorage::open(&path).unwrap();
        let key = KvKey::new(KeyNamespace::Participation, "alice").unwrap();
        storage.set(&key, b"definitely not cbor").unwrap();
    }

    let (data, bus) = backend();
    let engine = engine_on(&path, &data, &bus);
    assert!(engine.view().participation.is_empty());

    // The first authoritative refresh replaces the bad blob
    engine.start().await;
    let storage: Arc<dyn LocalStorage> = Arc::new(SqliteStorage::open(&path).unwrap());
    let mirror = ParticipationMirror::new(storage, UserId::new("alice")).unwrap();
    assert_eq!(mirror.load().unwrap().len(), 2);
    engine.stop().await;
}
