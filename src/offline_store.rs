//! Persisted participation mirror.
//!
//! One blob per actor under `participation:<actor>`: a CBOR envelope with
//! magic bytes, schema version and a blake3 checksum over the payload. The
//! mirror is only used to paint membership before the first authoritative
//! fetch; every successful events refresh overwrites it wholesale.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::capabilities::{KeyNamespace, KvError, KvKey, LocalStorage, MAX_VALUE_SIZE};
use crate::ids::{EventId, UserId};

const CURRENT_SCHEMA_VERSION: u32 = 1;
const MIRROR_MAGIC: &[u8; 4] = b"PMIR";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Kv(#[from] KvError),

    #[error("corrupted mirror: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("mirror too large: {size} bytes, max {max}")]
    TooLarge { size: usize, max: usize },
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct MirrorEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
struct MirrorPayload {
    actor: UserId,
    joined: BTreeMap<EventId, bool>,
}

pub fn encode_mirror(actor: &UserId, joined: &BTreeMap<EventId, bool>) -> Result<Vec<u8>, StoreError> {
    let payload = MirrorPayload {
        actor: actor.clone(),
        joined: joined.clone(),
    };
    let mut payload_bytes = Vec::new();
    ciborium::into_writer(&payload, &mut payload_bytes)?;

    let checksum = blake3::hash(&payload_bytes);
    let envelope = MirrorEnvelope {
        magic: *MIRROR_MAGIC,
        schema_version: CURRENT_SCHEMA_VERSION,
        checksum: *checksum.as_bytes(),
        payload: payload_bytes,
    };

    let mut bytes = Vec::new();
    ciborium::into_writer(&envelope, &mut bytes)?;
    if bytes.len() > MAX_VALUE_SIZE {
        return Err(StoreError::TooLarge {
            size: bytes.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(bytes)
}

pub fn decode_mirror(bytes: &[u8], actor: &UserId) -> Result<BTreeMap<EventId, bool>, StoreError> {
    if bytes.is_empty() {
        return Err(StoreError::Corrupted {
            reason: "empty blob",
        });
    }
    if bytes.len() > MAX_VALUE_SIZE {
        return Err(StoreError::TooLarge {
            size: bytes.len(),
            max: MAX_VALUE_SIZE,
        });
    }

    let envelope: MirrorEnvelope = ciborium::from_reader(bytes)?;
    if envelope.magic != *MIRROR_MAGIC {
        return Err(StoreError::Corrupted {
            reason: "invalid magic bytes",
        });
    }
    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::FutureSchema {
            found: envelope.schema_version,
            max: CURRENT_SCHEMA_VERSION,
        });
    }

    let actual = blake3::hash(&envelope.payload);
    if actual.as_bytes() != &envelope.checksum {
        return Err(StoreError::IntegrityCheckFailed {
            expected: hex::encode(envelope.checksum),
            actual: hex::encode(actual.as_bytes()),
        });
    }

    let payload: MirrorPayload = ciborium::from_reader(&envelope.payload[..])?;
    if &payload.actor != actor {
        return Err(StoreError::Corrupted {
            reason: "mirror belongs to another actor",
        });
    }
    Ok(payload.joined)
}

/// Best-effort local copy of the actor's event membership.
pub struct ParticipationMirror {
    storage: Arc<dyn LocalStorage>,
    actor: UserId,
    key: KvKey,
}

impl ParticipationMirror {
    pub fn new(storage: Arc<dyn LocalStorage>, actor: UserId) -> Result<Self, StoreError> {
        let key = KvKey::new(KeyNamespace::Participation, actor.as_str())?;
        Ok(Self {
            storage,
            actor,
            key,
        })
    }

    #[must_use]
    pub fn actor(&self) -> &UserId {
        &self.actor
    }

    /// Missing blob reads as empty.
    pub fn load(&self) -> Result<BTreeMap<EventId, bool>, StoreError> {
        match self.storage.get(&self.key)? {
            Some(bytes) => decode_mirror(&bytes, &self.actor),
            None => Ok(BTreeMap::new()),
        }
    }

    /// Loads for immediate paint; an unreadable mirror paints nothing.
    #[must_use]
    pub fn hydrate(&self) -> BTreeMap<EventId, bool> {
        match self.load() {
            Ok(joined) => {
                debug!(actor = %self.actor, events = joined.len(), "hydrated participation mirror");
                joined
            }
            Err(e) => {
                warn!(actor = %self.actor, error = %e, "ignoring unreadable participation mirror");
                BTreeMap::new()
            }
        }
    }

    fn save(&self, joined: &BTreeMap<EventId, bool>) -> Result<(), StoreError> {
        let bytes = encode_mirror(&self.actor, joined)?;
        self.storage.set(&self.key, &bytes)?;
        Ok(())
    }

    /// Overwrites the mirror with the last authoritative membership.
    pub fn project(&self, authoritative: &HashMap<EventId, bool>) {
        let joined: BTreeMap<_, _> = authoritative
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        if let Err(e) = self.save(&joined) {
            warn!(actor = %self.actor, error = %e, "failed to persist participation mirror");
        }
    }

    /// Records one committed membership change.
    pub fn record(&self, event_id: &EventId, joined: bool) {
        let mut current = self.hydrate();
        current.insert(event_id.clone(), joined);
        if let Err(e) = self.save(&current) {
            warn!(actor = %self.actor, event_id = %event_id, error = %e, "failed to persist participation change");
        }
    }
}
