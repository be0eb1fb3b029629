use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::{
    DEFAULT_DEEP_LINK_ATTEMPTS, DEFAULT_NEW_EVENT_WINDOW_MS, DEFAULT_PAGE_SIZE,
    DEFAULT_PROCESSED_LINK_MEMORY, DEFAULT_UNREAD_POLL_MS, MAX_MESSAGE_BYTES,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("failed to parse config: {0}")]
    Parse(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub unread_poll_interval_ms: u64,
    pub new_event_window_ms: u64,
    pub deep_link_max_attempts: u32,
    pub processed_link_memory: usize,
    pub message_page_size: usize,
    /// Artificial pause before a "load more" fetch; zero disables it.
    pub load_more_delay_ms: u64,
    pub max_message_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            unread_poll_interval_ms: DEFAULT_UNREAD_POLL_MS,
            new_event_window_ms: DEFAULT_NEW_EVENT_WINDOW_MS,
            deep_link_max_attempts: DEFAULT_DEEP_LINK_ATTEMPTS,
            processed_link_memory: DEFAULT_PROCESSED_LINK_MEMORY,
            message_page_size: DEFAULT_PAGE_SIZE,
            load_more_delay_ms: 0,
            max_message_bytes: MAX_MESSAGE_BYTES,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.unread_poll_interval_ms < 1000 {
            return Err(ConfigError::Invalid(
                "unread_poll_interval_ms should be at least 1000ms".into(),
            ));
        }
        if self.new_event_window_ms == 0 {
            return Err(ConfigError::Invalid("new_event_window_ms must be > 0".into()));
        }
        if self.deep_link_max_attempts == 0 {
            return Err(ConfigError::Invalid("deep_link_max_attempts must be > 0".into()));
        }
        if self.processed_link_memory == 0 {
            return Err(ConfigError::Invalid("processed_link_memory must be > 0".into()));
        }
        if self.message_page_size == 0 || self.message_page_size > crate::capabilities::MAX_QUERY_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "message_page_size must be in 1..={}",
                crate::capabilities::MAX_QUERY_LIMIT
            )));
        }
        if self.max_message_bytes == 0 {
            return Err(ConfigError::Invalid("max_message_bytes must be > 0".into()));
        }
        Ok(())
    }

    /// Parses and validates; missing fields take their defaults.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub const fn unread_poll_interval(&self) -> Duration {
        Duration::from_millis(self.unread_poll_interval_ms)
    }

    #[must_use]
    pub const fn load_more_delay(&self) -> Duration {
        Duration::from_millis(self.load_more_delay_ms)
    }
}
