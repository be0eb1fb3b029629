use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CollectionKind;
use crate::ids::{EventId, MatchId, UserId};

/// Payload delivered by the push side channel. Hosts forward the raw JSON;
/// the engine only uses it to decide what to re-fetch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushPayload {
    NewMatch {
        match_id: MatchId,
        #[serde(default)]
        from_user_id: Option<UserId>,
    },
    MatchAccepted {
        match_id: MatchId,
    },
    NewMessage {
        match_id: MatchId,
        #[serde(default)]
        sender_id: Option<UserId>,
    },
    EventCreated {
        event_id: EventId,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PushError {
    #[error("malformed push payload: {message}")]
    Malformed { message: String },
}

impl PushPayload {
    pub fn from_json(raw: &str) -> Result<Self, PushError> {
        serde_json::from_str(raw).map_err(|e| PushError::Malformed {
            message: e.to_string(),
        })
    }

    /// Collections whose authoritative state this payload invalidates.
    #[must_use]
    pub fn stale_collections(&self) -> Vec<CollectionKind> {
        match self {
            Self::NewMatch { .. } | Self::MatchAccepted { .. } => vec![CollectionKind::Matches],
            Self::NewMessage { match_id, .. } => vec![
                CollectionKind::Matches,
                CollectionKind::Messages(match_id.clone()),
            ],
            Self::EventCreated { .. } => vec![CollectionKind::Events],
        }
    }

    /// Whether the payload moves one of the unread counters.
    #[must_use]
    pub const fn affects_unread(&self) -> bool {
        !matches!(self, Self::MatchAccepted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_new_message() {
        let payload =
            PushPayload::from_json(r#"{"type":"new_message","match_id":"m1","sender_id":"u2"}"#)
                .unwrap();
        assert_eq!(
            payload,
            PushPayload::NewMessage {
                match_id: MatchId::new("m1"),
                sender_id: Some(UserId::new("u2")),
            }
        );
        assert_eq!(
            payload.stale_collections(),
            vec![
                CollectionKind::Matches,
                CollectionKind::Messages(MatchId::new("m1"))
            ]
        );
    }

    #[test]
    fn test_optional_fields_default() {
        let payload = PushPayload::from_json(r#"{"type":"new_match","match_id":"m9"}"#).unwrap();
        assert!(matches!(payload, PushPayload::NewMatch { from_user_id: None, .. }));
        assert!(payload.affects_unread());
    }

    #[test]
    fn test_match_accepted_only_refreshes_matches() {
        let payload = PushPayload::from_json(r#"{"type":"match_accepted","match_id":"m1"}"#).unwrap();
        assert_eq!(payload.stale_collections(), vec![CollectionKind::Matches]);
        assert!(!payload.affects_unread());
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let err = PushPayload::from_json(r#"{"type":"poke"}"#).unwrap_err();
        assert!(matches!(err, PushError::Malformed { .. }));
        assert!(PushPayload::from_json("not json").is_err());
    }
}
