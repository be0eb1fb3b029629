use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use thiserror::Error;

pub type Patch = Map<String, Value>;

pub const MAX_QUERY_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Matches,
    Messages,
    Profiles,
    Events,
    EventParticipants,
    EventComments,
}

impl Table {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Table::Matches => "matches",
            Table::Messages => "messages",
            Table::Profiles => "profiles",
            Table::Events => "events",
            Table::EventParticipants => "event_participants",
            Table::EventComments => "event_comments",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataErrorKind {
    Validation,
    NotFound,
    Permission,
    Conflict,
    Network,
    Timeout,
    Server,
    Decode,
}

impl DataErrorKind {
    /// Rejections are the backend declining the request; everything else is
    /// a transport or server fault.
    #[must_use]
    pub const fn is_rejection(self) -> bool {
        matches!(
            self,
            Self::Validation | Self::NotFound | Self::Permission | Self::Conflict
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct DataError {
    pub kind: DataErrorKind,
    pub message: String,
}

impl DataError {
    pub fn new(kind: DataErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(DataErrorKind::Network, message)
    }

    pub fn decode(table: Table, err: &serde_json::Error) -> Self {
        Self::new(
            DataErrorKind::Decode,
            format!("malformed {} row: {err}", table.name()),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    Eq(String, Value),
    Neq(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    In(String, Vec<Value>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(column.into(), value.into())
    }

    pub fn neq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Neq(column.into(), value.into())
    }

    pub fn gte(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gte(column.into(), value.into())
    }

    pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lt(column.into(), value.into())
    }

    pub fn lte(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lte(column.into(), value.into())
    }

    pub fn any_of<I, V>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::In(column.into(), values.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn or(filters: Vec<Filter>) -> Self {
        Self::Or(filters)
    }

    /// Row predicate with the backend's semantics: a missing column never
    /// matches, numbers compare numerically, strings lexicographically.
    #[must_use]
    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Filter::Eq(col, v) => row.get(col).is_some_and(|x| x == v),
            Filter::Neq(col, v) => row.get(col).is_some_and(|x| x != v),
            Filter::Gte(col, v) => row
                .get(col)
                .and_then(|x| compare_values(x, v))
                .is_some_and(|o| o != Ordering::Less),
            Filter::Lt(col, v) => row
                .get(col)
                .and_then(|x| compare_values(x, v))
                .is_some_and(|o| o == Ordering::Less),
            Filter::Lte(col, v) => row
                .get(col)
                .and_then(|x| compare_values(x, v))
                .is_some_and(|o| o != Ordering::Greater),
            Filter::In(col, vs) => row.get(col).is_some_and(|x| vs.contains(x)),
            Filter::Or(fs) => fs.iter().any(|f| f.matches(row)),
        }
    }
}

#[must_use]
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub ascending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub table: Table,
    pub filters: Vec<Filter>,
    pub order: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl Query {
    #[must_use]
    pub fn table(table: Table) -> Self {
        Self {
            table,
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn order_by(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order = Some(OrderBy {
            column: column.into(),
            ascending,
        });
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit.min(MAX_QUERY_LIMIT));
        self
    }

    #[must_use]
    pub fn matches(&self, row: &Value) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }
}

/// Authoritative backend: arbitrary CRUD plus filtered queries over JSON rows.
#[async_trait]
pub trait DataService: Send + Sync {
    async fn fetch(&self, query: &Query) -> Result<Vec<Value>, DataError>;
    async fn count(&self, query: &Query) -> Result<u64, DataError>;
    async fn insert(&self, table: Table, row: Value) -> Result<Value, DataError>;
    async fn update(&self, table: Table, id: &str, patch: Patch) -> Result<Value, DataError>;
    async fn delete(&self, table: Table, id: &str) -> Result<(), DataError>;
}

pub fn encode_row<T: Serialize>(table: Table, value: &T) -> Result<Value, DataError> {
    serde_json::to_value(value).map_err(|e| DataError::decode(table, &e))
}

pub fn decode_row<T: DeserializeOwned>(table: Table, row: Value) -> Result<T, DataError> {
    serde_json::from_value(row).map_err(|e| DataError::decode(table, &e))
}

pub fn decode_rows<T: DeserializeOwned>(table: Table, rows: Vec<Value>) -> Result<Vec<T>, DataError> {
    rows.into_iter().map(|row| decode_row(table, row)).collect()
}
