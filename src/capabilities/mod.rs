mod data;
mod kv;
mod memory;
mod realtime;

#[cfg(feature = "push")]
mod push;

pub use self::data::{
    compare_values, decode_row, decode_rows, encode_row, DataError, DataErrorKind, DataService,
    Filter, OrderBy, Patch, Query, Table, MAX_QUERY_LIMIT,
};
pub use self::kv::{
    KeyNamespace, KvError, KvKey, LocalStorage, MemoryStorage, StorageErrorCode, MAX_KEY_LENGTH,
    MAX_VALUE_SIZE,
};
pub use self::memory::{DataOp, MemoryDataService, MemoryEventBus};
pub use self::realtime::{
    BusError, ChangeEvent, ChangeOperation, EventBus, Subscription, SubscriptionId, Topic,
};

#[cfg(not(target_arch = "wasm32"))]
pub use self::kv::SqliteStorage;

#[cfg(feature = "push")]
pub use self::push::{PushError, PushPayload};

use std::sync::Arc;

/// The external collaborators the engine talks to.
#[derive(Clone)]
pub struct Capabilities {
    pub data: Arc<dyn DataService>,
    pub bus: Arc<dyn EventBus>,
    pub storage: Arc<dyn LocalStorage>,
}

impl Capabilities {
    pub fn new(
        data: Arc<dyn DataService>,
        bus: Arc<dyn EventBus>,
        storage: Arc<dyn LocalStorage>,
    ) -> Self {
        Self { data, bus, storage }
    }
}

pub mod testing {
    use super::*;

    /// Wired in-memory collaborators; writes to `data` echo onto `bus`.
    pub struct MemoryCapabilities {
        pub data: Arc<MemoryDataService>,
        pub bus: Arc<MemoryEventBus>,
        pub storage: Arc<MemoryStorage>,
    }

    impl MemoryCapabilities {
        #[must_use]
        pub fn new() -> Self {
            let bus = Arc::new(MemoryEventBus::new());
            Self {
                data: Arc::new(MemoryDataService::with_bus(Arc::clone(&bus))),
                bus,
                storage: Arc::new(MemoryStorage::new()),
            }
        }

        #[must_use]
        pub fn capabilities(&self) -> Capabilities {
            Capabilities::new(
                Arc::clone(&self.data) as Arc<dyn DataService>,
                Arc::clone(&self.bus) as Arc<dyn EventBus>,
                Arc::clone(&self.storage) as Arc<dyn LocalStorage>,
            )
        }
    }

    impl Default for MemoryCapabilities {
        fn default() -> Self {
            Self::new()
        }
    }
}
