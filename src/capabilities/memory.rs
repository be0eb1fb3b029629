//! In-memory collaborators.
//!
//! `MemoryDataService` behaves like the hosted backend closely enough for the
//! engine: filtered queries, id conflicts, change echoes onto a linked bus.
//! It also records call counts, can fail the next call of a given kind, and
//! can hold calls in flight until released.

use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Semaphore;
use tracing::debug;

use super::data::{compare_values, DataError, DataErrorKind, DataService, Patch, Query, Table};
use super::realtime::{
    BusError, ChangeEvent, ChangeOperation, EventBus, Subscription, SubscriptionId, Topic,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataOp {
    Fetch,
    Count,
    Insert,
    Update,
    Delete,
}

#[derive(Default)]
struct DataState {
    tables: HashMap<Table, Vec<Value>>,
    calls: HashMap<(DataOp, Table), u64>,
    failures: HashMap<(DataOp, Table), VecDeque<DataError>>,
    gates: HashMap<(DataOp, Table), Arc<Semaphore>>,
}

#[derive(Default)]
pub struct MemoryDataService {
    state: Mutex<DataState>,
    bus: Option<Arc<MemoryEventBus>>,
}

impl MemoryDataService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every successful write is echoed to `bus` as a change event.
    #[must_use]
    pub fn with_bus(bus: Arc<MemoryEventBus>) -> Self {
        Self {
            state: Mutex::default(),
            bus: Some(bus),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DataState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts rows directly, without counting a call or echoing.
    pub fn seed(&self, table: Table, rows: impl IntoIterator<Item = Value>) {
        self.lock().tables.entry(table).or_default().extend(rows);
    }

    #[must_use]
    pub fn rows(&self, table: Table) -> Vec<Value> {
        self.lock().tables.get(&table).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn calls(&self, op: DataOp, table: Table) -> u64 {
        self.lock().calls.get(&(op, table)).copied().unwrap_or(0)
    }

    /// Queues `error` as the outcome of the next `op` against `table`.
    pub fn fail_next(&self, op: DataOp, table: Table, error: DataError) {
        self.lock()
            .failures
            .entry((op, table))
            .or_default()
            .push_back(error);
    }

    /// Parks every `op` against `table` until [`release`] is called.
    ///
    /// [`release`]: MemoryDataService::release
    pub fn hold(&self, op: DataOp, table: Table) {
        self.lock()
            .gates
            .entry((op, table))
            .or_insert_with(|| Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, op: DataOp, table: Table) {
        if let Some(gate) = self.lock().gates.remove(&(op, table)) {
            gate.close();
        }
    }

    /// Counts the call, waits out any hold, then yields a queued failure.
    async fn enter(&self, op: DataOp, table: Table) -> Result<(), DataError> {
        let gate = {
            let mut state = self.lock();
            *state.calls.entry((op, table)).or_insert(0) += 1;
            state.gates.get(&(op, table)).cloned()
        };
        if let Some(gate) = gate {
            // Closed on release; the acquire error is the wake-up signal.
            let _ = gate.acquire().await;
        }
        let mut state = self.lock();
        match state.failures.get_mut(&(op, table)).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn echo(&self, event: ChangeEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(&event);
        }
    }
}

fn row_id(row: &Value) -> Option<&str> {
    row.get("id").and_then(Value::as_str)
}

#[async_trait]
impl DataService for MemoryDataService {
    async fn fetch(&self, query: &Query) -> Result<Vec<Value>, DataError> {
        self.enter(DataOp::Fetch, query.table).await?;
        let state = self.lock();
        let mut rows: Vec<Value> = state
            .tables
            .get(&query.table)
            .map(|rows| rows.iter().filter(|r| query.matches(r)).cloned().collect())
            .unwrap_or_default();
        drop(state);

        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let ord = match (a.get(&order.column), b.get(&order.column)) {
                    (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                    _ => Ordering::Equal,
                };
                if order.ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        debug!(table = query.table.name(), rows = rows.len(), "memory fetch");
        Ok(rows)
    }

    async fn count(&self, query: &Query) -> Result<u64, DataError> {
        self.enter(DataOp::Count, query.table).await?;
        let state = self.lock();
        let n = state
            .tables
            .get(&query.table)
            .map_or(0, |rows| rows.iter().filter(|r| query.matches(r)).count());
        Ok(u64::try_from(n).unwrap_or(u64::MAX))
    }

    async fn insert(&self, table: Table, mut row: Value) -> Result<Value, DataError> {
        self.enter(DataOp::Insert, table).await?;
        let Some(obj) = row.as_object_mut() else {
            return Err(DataError::new(DataErrorKind::Validation, "row must be an object"));
        };
        if !obj.contains_key("id") {
            obj.insert("id".into(), Value::String(uuid::Uuid::new_v4().to_string()));
        }
        {
            let mut state = self.lock();
            let rows = state.tables.entry(table).or_default();
            if rows.iter().any(|r| row_id(r) == row_id(&row)) {
                return Err(DataError::new(
                    DataErrorKind::Conflict,
                    format!("duplicate key in {}", table.name()),
                ));
            }
            rows.push(row.clone());
        }
        self.echo(ChangeEvent::insert(table, row.clone()));
        Ok(row)
    }

    async fn update(&self, table: Table, id: &str, patch: Patch) -> Result<Value, DataError> {
        self.enter(DataOp::Update, table).await?;
        let updated = {
            let mut state = self.lock();
            let row = state
                .tables
                .get_mut(&table)
                .and_then(|rows| rows.iter_mut().find(|r| row_id(r) == Some(id)))
                .ok_or_else(|| {
                    DataError::new(DataErrorKind::NotFound, format!("{} {id}", table.name()))
                })?;
            if let Some(obj) = row.as_object_mut() {
                obj.extend(patch);
            }
            row.clone()
        };
        self.echo(ChangeEvent {
            operation: ChangeOperation::Update,
            table,
            record: updated.clone(),
        });
        Ok(updated)
    }

    async fn delete(&self, table: Table, id: &str) -> Result<(), DataError> {
        self.enter(DataOp::Delete, table).await?;
        let removed = {
            let mut state = self.lock();
            let rows = state.tables.entry(table).or_default();
            let mut removed = None;
            rows.retain(|r| {
                if row_id(r) == Some(id) {
                    removed = Some(r.clone());
                    false
                } else {
                    true
                }
            });
            removed
        };
        if let Some(record) = removed {
            self.echo(ChangeEvent {
                operation: ChangeOperation::Delete,
                table,
                record,
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct BusState {
    next_id: u64,
    subscribes: u64,
    subscriptions: HashMap<SubscriptionId, (Topic, UnboundedSender<ChangeEvent>)>,
    reject_next: Option<String>,
}

/// Fan-out bus. Publishing delivers to every live subscription whose topic
/// matches; disconnecting drops every sender so receivers observe end of
/// stream.
#[derive(Default)]
pub struct MemoryEventBus {
    state: Mutex<BusState>,
}

impl MemoryEventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns how many subscriptions received the event.
    pub fn publish(&self, event: &ChangeEvent) -> usize {
        let mut state = self.lock();
        state.subscriptions.retain(|_, (_, tx)| !tx.is_closed());
        state
            .subscriptions
            .values()
            .filter(|(topic, _)| topic.matches(event))
            .filter(|(_, tx)| tx.send(event.clone()).is_ok())
            .count()
    }

    pub fn disconnect_all(&self) {
        self.lock().subscriptions.clear();
    }

    pub fn reject_next_subscribe(&self, reason: impl Into<String>) {
        self.lock().reject_next = Some(reason.into());
    }

    #[must_use]
    pub fn live_subscriptions(&self) -> usize {
        self.lock().subscriptions.len()
    }

    #[must_use]
    pub fn live_topics(&self) -> Vec<Topic> {
        self.lock()
            .subscriptions
            .values()
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    /// Total successful `subscribe` calls since creation.
    #[must_use]
    pub fn subscribe_count(&self) -> u64 {
        self.lock().subscribes
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn subscribe(&self, topic: Topic) -> Result<Subscription, BusError> {
        let mut state = self.lock();
        if let Some(reason) = state.reject_next.take() {
            return Err(BusError::Rejected { reason });
        }
        state.next_id += 1;
        state.subscribes += 1;
        let id = SubscriptionId(state.next_id);
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscriptions.insert(id, (topic.clone(), tx));
        Ok(Subscription {
            id,
            topic,
            events: rx,
        })
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.lock().subscriptions.remove(&id);
    }
}
