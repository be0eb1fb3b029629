//! Realtime ingestion.
//!
//! Exactly one live subscription, bound to the current interest. Switching
//! interest tears the old subscription down before the new one is requested,
//! and every delivery is checked against the subscription's generation inside
//! the cache critical section, so nothing from a de-selected interest lands.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheStore, CollectionKind, Record};
use crate::capabilities::{
    decode_row, BusError, ChangeEvent, ChangeOperation, EventBus, Filter, SubscriptionId, Table,
    Topic,
};
use crate::ids::{EventId, MatchId};
use crate::model::{CommentRecord, MessageRecord};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Interest {
    Conversation(MatchId),
    EventComments(EventId),
}

impl Interest {
    #[must_use]
    pub fn topic(&self) -> Topic {
        match self {
            Self::Conversation(id) => {
                Topic::filtered(Table::Messages, Filter::eq("match_id", id.as_str()))
            }
            Self::EventComments(id) => {
                Topic::filtered(Table::EventComments, Filter::eq("event_id", id.as_str()))
            }
        }
    }

    #[must_use]
    pub fn collection(&self) -> CollectionKind {
        match self {
            Self::Conversation(id) => CollectionKind::Messages(id.clone()),
            Self::EventComments(id) => CollectionKind::Comments(id.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "interest", rename_all = "snake_case")]
pub enum IngestionStatus {
    #[default]
    Idle,
    Live(Interest),
    /// The bus dropped the subscription; recovered by the next refresh.
    Stale(Interest),
}

#[derive(Default)]
struct Shared {
    generation: AtomicU64,
    status: Mutex<IngestionStatus>,
}

impl Shared {
    fn set_status(&self, status: IngestionStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    fn status(&self) -> IngestionStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }
}

/// Folds one change event into the cache if `generation` is still current.
/// Returns whether the cache changed.
fn deliver(
    cache: &CacheStore,
    shared: &Shared,
    generation: u64,
    interest: &Interest,
    event: ChangeEvent,
) -> bool {
    if event.operation != ChangeOperation::Insert {
        debug!(operation = ?event.operation, table = event.table.name(), "ignoring non-insert change on timeline");
        return false;
    }
    let record = match (interest, event.table) {
        (Interest::Conversation(match_id), Table::Messages) => {
            match decode_row::<MessageRecord>(Table::Messages, event.record) {
                Ok(m) if &m.match_id == match_id => Record::Message(m),
                Ok(m) => {
                    debug!(message_id = %m.id, "message for another conversation");
                    return false;
                }
                Err(e) => {
                    warn!(error = %e, "dropping undecodable realtime row");
                    return false;
                }
            }
        }
        (Interest::EventComments(event_id), Table::EventComments) => {
            match decode_row::<CommentRecord>(Table::EventComments, event.record) {
                Ok(c) if &c.event_id == event_id => Record::Comment(c),
                Ok(_) => return false,
                Err(e) => {
                    warn!(error = %e, "dropping undecodable realtime row");
                    return false;
                }
            }
        }
        _ => return false,
    };

    cache.write(|state| {
        if !shared.is_current(generation) {
            debug!(generation, "discarding delivery for torn-down subscription");
            return false;
        }
        state.upsert_one(record)
    })
}

struct Active {
    interest: Interest,
    subscription_id: SubscriptionId,
    task: JoinHandle<()>,
}

pub struct IngestionManager {
    cache: Arc<CacheStore>,
    bus: Arc<dyn EventBus>,
    shared: Arc<Shared>,
    active: AsyncMutex<Option<Active>>,
}

impl IngestionManager {
    pub fn new(cache: Arc<CacheStore>, bus: Arc<dyn EventBus>) -> Self {
        Self {
            cache,
            bus,
            shared: Arc::new(Shared::default()),
            active: AsyncMutex::new(None),
        }
    }

    #[must_use]
    pub fn status(&self) -> IngestionStatus {
        self.shared.status()
    }

    #[must_use]
    pub fn current_interest(&self) -> Option<Interest> {
        match self.status() {
            IngestionStatus::Idle => None,
            IngestionStatus::Live(i) | IngestionStatus::Stale(i) => Some(i),
        }
    }

    /// Switches the single live subscription to `interest` (or none).
    /// A no-op when that interest is already live.
    #[instrument(skip(self))]
    pub async fn set_interest(&self, interest: Option<Interest>) -> Result<(), BusError> {
        let mut active = self.active.lock().await;
        if let (Some(current), Some(wanted)) = (active.as_ref(), interest.as_ref()) {
            if &current.interest == wanted
                && self.status() == IngestionStatus::Live(wanted.clone())
            {
                return Ok(());
            }
        }

        self.teardown(&mut active);

        let Some(interest) = interest else {
            self.shared.set_status(IngestionStatus::Idle);
            return Ok(());
        };

        let generation = self.shared.generation.load(Ordering::SeqCst);
        let subscription = match self.bus.subscribe(interest.topic()).await {
            Ok(s) => s,
            Err(e) => {
                warn!(interest = ?interest, error = %e, "subscribe failed");
                self.shared.set_status(IngestionStatus::Stale(interest));
                return Err(e);
            }
        };

        let subscription_id = subscription.id;
        let mut events = subscription.events;
        let task = tokio::spawn({
            let cache = Arc::clone(&self.cache);
            let shared = Arc::clone(&self.shared);
            let interest = interest.clone();
            async move {
                while let Some(event) = events.recv().await {
                    deliver(&cache, &shared, generation, &interest, event);
                }
                if shared.is_current(generation) {
                    warn!(interest = ?interest, "realtime subscription dropped");
                    shared.set_status(IngestionStatus::Stale(interest));
                }
            }
        });

        info!(interest = ?interest, subscription = %subscription_id, "subscribed");
        self.shared.set_status(IngestionStatus::Live(interest.clone()));
        *active = Some(Active {
            interest,
            subscription_id,
            task,
        });
        Ok(())
    }

    /// Drops the subscription only if it is bound to `interest`.
    pub async fn clear_interest_if(&self, interest: &Interest) -> Result<(), BusError> {
        if self.current_interest().as_ref() == Some(interest) {
            self.set_interest(None).await
        } else {
            Ok(())
        }
    }

    /// Re-subscribes a stale interest. Returns it so the caller can backfill
    /// whatever was missed.
    pub async fn recover(&self) -> Option<Interest> {
        let IngestionStatus::Stale(interest) = self.status() else {
            return None;
        };
        match self.set_interest(Some(interest.clone())).await {
            Ok(()) => Some(interest),
            Err(_) => None,
        }
    }

    fn teardown(&self, active: &mut Option<Active>) {
        // Invalidate first, under the cache lock, so an in-progress
        // delivery either finishes before this or sees the new generation.
        self.cache.write(|_| {
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
        });
        if let Some(old) = active.take() {
            old.task.abort();
            self.bus.unsubscribe(old.subscription_id);
            debug!(subscription = %old.subscription_id, "unsubscribed");
        }
    }
}

impl Drop for IngestionManager {
    fn drop(&mut self) {
        if let Some(old) = self.active.get_mut().take() {
            old.task.abort();
            self.bus.unsubscribe(old.subscription_id);
        }
    }
}
