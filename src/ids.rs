use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Fresh client-side identity, used for optimistic inserts so the
            /// realtime echo carries the same id.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

typed_id!(UserId);
typed_id!(MatchId);
typed_id!(MessageId);
typed_id!(EventId);
typed_id!(CommentId);
typed_id!(MutationId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(MessageId::generate(), MessageId::generate());
    }

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let id = MatchId::new("m-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"m-1\"");
        let back: MatchId = serde_json::from_str("\"m-1\"").unwrap();
        assert_eq!(back, id);
    }
}
