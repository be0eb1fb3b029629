use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

use super::data::{Filter, Table};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// Row-level change pushed by the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub operation: ChangeOperation,
    pub table: Table,
    pub record: Value,
}

impl ChangeEvent {
    #[must_use]
    pub fn insert(table: Table, record: Value) -> Self {
        Self {
            operation: ChangeOperation::Insert,
            table,
            record,
        }
    }
}

/// Table plus an optional row predicate, evaluated by the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub table: Table,
    pub filter: Option<Filter>,
}

impl Topic {
    #[must_use]
    pub fn table(table: Table) -> Self {
        Self {
            table,
            filter: None,
        }
    }

    #[must_use]
    pub fn filtered(table: Table, filter: Filter) -> Self {
        Self {
            table,
            filter: Some(filter),
        }
    }

    #[must_use]
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        event.table == self.table
            && self
                .filter
                .as_ref()
                .map_or(true, |f| f.matches(&event.record))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Live feed for one topic. The receiver ends when the bus drops the
/// channel (disconnect); it is never restarted.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub topic: Topic,
    pub events: UnboundedReceiver<ChangeEvent>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusError {
    #[error("realtime channel disconnected")]
    Disconnected,

    #[error("subscription rejected: {reason}")]
    Rejected { reason: String },
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn subscribe(&self, topic: Topic) -> Result<Subscription, BusError>;

    /// Idempotent; takes effect before returning.
    fn unsubscribe(&self, id: SubscriptionId);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_topic_matching() {
        let topic = Topic::filtered(Table::Messages, Filter::eq("match_id", "m1"));
        assert!(topic.matches(&ChangeEvent::insert(
            Table::Messages,
            json!({"id": "x", "match_id": "m1"})
        )));
        assert!(!topic.matches(&ChangeEvent::insert(
            Table::Messages,
            json!({"id": "x", "match_id": "m2"})
        )));
        assert!(!topic.matches(&ChangeEvent::insert(
            Table::Matches,
            json!({"id": "x", "match_id": "m1"})
        )));
        assert!(Topic::table(Table::Events).matches(&ChangeEvent::insert(Table::Events, json!({}))));
    }

    #[test]
    fn test_operation_wire_format() {
        let json = serde_json::to_string(&ChangeOperation::Insert).unwrap();
        assert_eq!(json, "\"INSERT\"");
    }
}
