// lib.rs - client-side state synchronization core

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod cache;
pub mod capabilities;
pub mod config;
pub mod deep_link;
pub mod engine;
pub mod ids;
pub mod ingestion;
pub mod model;
pub mod offline_store;
pub mod optimistic;
pub mod refresh;
pub mod unread;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use cache::{CacheStore, CollectionKind};
pub use config::{ConfigError, SyncConfig};
pub use engine::{SyncEngine, ViewModel};
pub use ids::{CommentId, EventId, MatchId, MessageId, MutationId, UserId};

use crate::capabilities::{BusError, DataError, DataErrorKind, KvError};
use crate::offline_store::StoreError;
use crate::optimistic::MutationError;

pub const MAX_MESSAGE_BYTES: usize = 4096;
pub const DEFAULT_UNREAD_POLL_MS: u64 = 30_000;
pub const DEFAULT_NEW_EVENT_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;
pub const DEFAULT_DEEP_LINK_ATTEMPTS: u32 = 3;
pub const DEFAULT_PROCESSED_LINK_MEMORY: usize = 64;
pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Authorization,
    Validation,
    NotFound,
    Conflict,
    InFlight,
    Storage,
    Serialization,
    Deserialization,
    Subscription,
    InvalidState,
    Configuration,
    Internal,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Authorization => "FORBIDDEN",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::InFlight => "IN_FLIGHT",
            Self::Storage => "STORAGE_ERROR",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::Deserialization => "DESERIALIZATION_ERROR",
            Self::Subscription => "SUBSCRIPTION_ERROR",
            Self::InvalidState => "INVALID_STATE",
            Self::Configuration => "CONFIG_ERROR",
            Self::Internal => "INTERNAL_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network
            | Self::Timeout
            | Self::Conflict
            | Self::InFlight
            | Self::Storage
            | Self::Subscription => ErrorSeverity::Transient,

            Self::Serialization
            | Self::Deserialization
            | Self::Configuration
            | Self::Internal
            | Self::InvalidState => ErrorSeverity::Fatal,

            Self::Authorization | Self::Validation | Self::NotFound | Self::Unknown => {
                ErrorSeverity::Permanent
            }
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network
                | Self::Timeout
                | Self::Storage
                | Self::Conflict
                | Self::InFlight
                | Self::Subscription
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub internal_message: Option<String>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && !matches!(self.severity, ErrorSeverity::Fatal)
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::Network => {
                "Unable to connect. Please check your internet connection and try again.".into()
            }
            ErrorKind::Timeout => "The request timed out. Please try again.".into(),
            ErrorKind::Authorization => {
                "You don't have permission to perform this action.".into()
            }
            ErrorKind::Validation => self.message.clone(),
            ErrorKind::NotFound => "The requested item could not be found.".into(),
            ErrorKind::Conflict => {
                "This action conflicts with a recent change. Please refresh and try again.".into()
            }
            ErrorKind::InFlight => "This action is already in progress.".into(),
            ErrorKind::Storage => "Unable to save data locally.".into(),
            ErrorKind::Serialization | ErrorKind::Deserialization => {
                "A data error occurred. Please contact support if this persists.".into()
            }
            ErrorKind::Subscription => {
                "Live updates are paused. They will resume shortly.".into()
            }
            ErrorKind::InvalidState => {
                "The app is in an invalid state. Please restart the app.".into()
            }
            ErrorKind::Configuration => "The app is misconfigured.".into(),
            ErrorKind::Internal | ErrorKind::Unknown => {
                "An unexpected error occurred. Please try again or contact support.".into()
            }
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<DataError> for AppError {
    fn from(e: DataError) -> Self {
        let kind = match e.kind {
            DataErrorKind::Validation => ErrorKind::Validation,
            DataErrorKind::NotFound => ErrorKind::NotFound,
            DataErrorKind::Permission => ErrorKind::Authorization,
            DataErrorKind::Conflict => ErrorKind::Conflict,
            DataErrorKind::Network => ErrorKind::Network,
            DataErrorKind::Timeout => ErrorKind::Timeout,
            DataErrorKind::Server => ErrorKind::Internal,
            DataErrorKind::Decode => ErrorKind::Deserialization,
        };
        AppError::new(kind, e.message.clone()).with_internal(e.to_string())
    }
}

impl From<BusError> for AppError {
    fn from(e: BusError) -> Self {
        AppError::new(ErrorKind::Subscription, e.to_string())
    }
}

impl From<KvError> for AppError {
    fn from(e: KvError) -> Self {
        match e {
            KvError::InvalidKey { .. } => AppError::new(ErrorKind::Validation, e.to_string()),
            KvError::Serialization { .. } => {
                AppError::new(ErrorKind::Serialization, e.to_string())
            }
            _ => AppError::new(ErrorKind::Storage, e.to_string()),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Serialization(_) => AppError::new(ErrorKind::Serialization, e.to_string()),
            StoreError::Kv(inner) => inner.into(),
            _ => AppError::new(ErrorKind::Storage, e.to_string()),
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::new(ErrorKind::Configuration, e.to_string())
    }
}

impl From<MutationError> for AppError {
    fn from(e: MutationError) -> Self {
        match e {
            MutationError::Remote(inner) => inner.into(),
            MutationError::InFlight { ref target } => {
                AppError::new(ErrorKind::InFlight, e.to_string()).with_context("target", target)
            }
            MutationError::Validation(message) => AppError::new(ErrorKind::Validation, message),
            MutationError::NotLoaded { ref target } => {
                AppError::new(ErrorKind::NotFound, e.to_string()).with_context("target", target)
            }
            MutationError::InvalidTransition { .. } => {
                AppError::new(ErrorKind::InvalidState, e.to_string())
            }
        }
    }
}

#[must_use]
pub fn get_current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(get_current_time_ms())
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn elapsed_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    #[must_use]
    pub fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    #[must_use]
    pub fn sub_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_sub(ms))
    }

    #[must_use]
    pub fn is_before(self, other: Self) -> bool {
        self.0 < other.0
    }

    #[must_use]
    pub fn is_after(self, other: Self) -> bool {
        self.0 > other.0
    }
}

/// User-visible, non-fatal notice raised by a failed action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToastMessage {
    pub message: String,
    pub kind: ToastKind,
    pub created_at_ms: u64,
    pub duration_ms: u64,
}

impl ToastMessage {
    #[must_use]
    pub fn new(message: impl Into<String>, kind: ToastKind) -> Self {
        Self {
            message: message.into(),
            kind,
            created_at_ms: get_current_time_ms(),
            duration_ms: kind.default_duration_ms(),
        }
    }

    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at_ms) > self.duration_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToastKind {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

impl ToastKind {
    #[must_use]
    pub const fn default_duration_ms(self) -> u64 {
        match self {
            Self::Info => 3000,
            Self::Success => 2000,
            Self::Warning => 4000,
            Self::Error => 5000,
        }
    }
}
