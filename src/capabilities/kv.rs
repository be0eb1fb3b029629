use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvKey {
    namespace: KeyNamespace,
    key: String,
}

impl KvKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    #[must_use]
    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    #[must_use]
    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    fn validate_key(key: &str) -> Result<(), KvError> {
        let invalid = |reason: &str| KvError::InvalidKey {
            key: key.chars().take(50).collect(),
            reason: reason.to_string(),
        };

        if key.trim().is_empty() {
            return Err(invalid("key cannot be empty"));
        }
        if key.len() > MAX_KEY_LENGTH {
            return Err(invalid("key exceeds maximum length"));
        }
        if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(invalid("key cannot look like a path"));
        }
        if key.chars().any(char::is_control) {
            return Err(invalid("key contains control characters"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    Participation,
}

impl KeyNamespace {
    #[must_use]
    pub fn prefix(&self) -> &str {
        match self {
            KeyNamespace::Participation => "participation",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message} (code: {code:?})")]
    Storage {
        code: StorageErrorCode,
        message: String,
    },

    #[error("serialization error: {message}")]
    Serialization { message: String },
}

impl KvError {
    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        Self::Storage {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Unknown,
    Corrupted,
    DiskFull,
    PermissionDenied,
    Busy,
    Locked,
    IoError,
}

/// Persistent local key-value storage. Synchronous and best-effort: callers
/// log write failures and carry on.
pub trait LocalStorage: Send + Sync {
    fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError>;
    fn set(&self, key: &KvKey, value: &[u8]) -> Result<(), KvError>;
}

fn check_size(value: &[u8]) -> Result<(), KvError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

/// Volatile storage for tests and shells without a disk.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `set` fail, as a full disk would.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Overwrites raw bytes, bypassing validation. Used to simulate corruption.
    pub fn put_raw(&self, key: &KvKey, value: Vec<u8>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.raw(), value);
    }
}

impl LocalStorage for MemoryStorage {
    fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key.raw())
            .cloned())
    }

    fn set(&self, key: &KvKey, value: &[u8]) -> Result<(), KvError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(KvError::storage(StorageErrorCode::DiskFull, "write refused"));
        }
        check_size(value)?;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.raw(), value.to_vec());
        Ok(())
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteStorage;

#[cfg(not(target_arch = "wasm32"))]
mod sqlite {
    use super::{check_size, KvError, KvKey, LocalStorage, StorageErrorCode};
    use rusqlite::{params, Connection, OptionalExtension};
    use std::path::Path;
    use std::sync::{Mutex, PoisonError};

    /// SQLite-backed local storage with a single `kv` table.
    pub struct SqliteStorage {
        conn: Mutex<Connection>,
    }

    fn map_err(e: &rusqlite::Error) -> KvError {
        let code = match e {
            rusqlite::Error::SqliteFailure(err, _) => match err.code {
                rusqlite::ErrorCode::DatabaseBusy => StorageErrorCode::Busy,
                rusqlite::ErrorCode::DatabaseLocked => StorageErrorCode::Locked,
                rusqlite::ErrorCode::DiskFull => StorageErrorCode::DiskFull,
                rusqlite::ErrorCode::PermissionDenied | rusqlite::ErrorCode::ReadOnly => {
                    StorageErrorCode::PermissionDenied
                }
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase => {
                    StorageErrorCode::Corrupted
                }
                _ => StorageErrorCode::IoError,
            },
            _ => StorageErrorCode::Unknown,
        };
        KvError::storage(code, e.to_string())
    }

    impl SqliteStorage {
        pub fn open(path: &Path) -> Result<Self, KvError> {
            let conn = Connection::open(path).map_err(|e| map_err(&e))?;
            Self::init(conn)
        }

        pub fn open_in_memory() -> Result<Self, KvError> {
            let conn = Connection::open_in_memory().map_err(|e| map_err(&e))?;
            Self::init(conn)
        }

        fn init(conn: Connection) -> Result<Self, KvError> {
            conn.execute_batch(
                r"
                CREATE TABLE IF NOT EXISTS kv (
                    key TEXT PRIMARY KEY,
                    value BLOB NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                ",
            )
            .map_err(|e| map_err(&e))?;
            Ok(Self {
                conn: Mutex::new(conn),
            })
        }
    }

    impl LocalStorage for SqliteStorage {
        fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
            let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
            conn.query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![key.raw()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
            .map_err(|e| map_err(&e))
        }

        fn set(&self, key: &KvKey, value: &[u8]) -> Result<(), KvError> {
            check_size(value)?;
            let now = i64::try_from(crate::get_current_time_ms()).unwrap_or(i64::MAX);
            let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
            conn.execute(
                r"
                INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                ",
                params![key.raw(), value, now],
            )
            .map_err(|e| map_err(&e))?;
            Ok(())
        }
    }
}
