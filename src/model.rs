use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use thiserror::Error;

use crate::ids::{CommentId, EventId, MatchId, MessageId, UserId};
use crate::UnixTimeMs;

pub const MESSAGE_PREVIEW_LENGTH: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Pending,
    Matched,
    Rejected,
}

impl MatchStatus {
    #[must_use]
    pub fn valid_transitions(self) -> Vec<Self> {
        match self {
            Self::Pending => vec![Self::Matched, Self::Rejected],
            Self::Matched | Self::Rejected => vec![],
        }
    }

    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        self.valid_transitions().contains(&to)
    }

    pub fn validate_transition(self, to: Self) -> Result<(), TransitionError> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(TransitionError::Invalid { from: self, to })
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Matched => "matched",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("cannot move match from {from} to {to}")]
    Invalid { from: MatchStatus, to: MatchStatus },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSummary {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub preview: String,
    pub created_at: UnixTimeMs,
}

impl From<&MessageRecord> for MessageSummary {
    fn from(message: &MessageRecord) -> Self {
        Self {
            message_id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            preview: preview(&message.content, MESSAGE_PREVIEW_LENGTH),
            created_at: message.created_at,
        }
    }
}

/// Row shape of the `matches` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRow {
    pub id: MatchId,
    pub user1_id: UserId,
    pub user2_id: UserId,
    pub status: MatchStatus,
    pub created_at: UnixTimeMs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub id: MatchId,
    /// Requester.
    pub user1_id: UserId,
    /// Recipient; the only party allowed to accept or reject.
    pub user2_id: UserId,
    pub status: MatchStatus,
    pub created_at: UnixTimeMs,
    #[serde(default)]
    pub counterpart: Option<ProfileSummary>,
    #[serde(default)]
    pub last_message: Option<MessageSummary>,
    #[serde(default)]
    pub unread_count: u32,
}

impl MatchRecord {
    #[must_use]
    pub fn from_row(row: MatchRow) -> Self {
        Self {
            id: row.id,
            user1_id: row.user1_id,
            user2_id: row.user2_id,
            status: row.status,
            created_at: row.created_at,
            counterpart: None,
            last_message: None,
            unread_count: 0,
        }
    }

    #[must_use]
    pub fn to_row(&self) -> MatchRow {
        MatchRow {
            id: self.id.clone(),
            user1_id: self.user1_id.clone(),
            user2_id: self.user2_id.clone(),
            status: self.status,
            created_at: self.created_at,
        }
    }

    /// Unordered participant pair; at most one match may exist per pair.
    #[must_use]
    pub fn pair_key(&self) -> (UserId, UserId) {
        pair_key(&self.user1_id, &self.user2_id)
    }

    #[must_use]
    pub fn involves(&self, user: &UserId) -> bool {
        &self.user1_id == user || &self.user2_id == user
    }

    #[must_use]
    pub fn counterpart_id(&self, actor: &UserId) -> &UserId {
        if &self.user1_id == actor {
            &self.user2_id
        } else {
            &self.user1_id
        }
    }

    #[must_use]
    pub fn is_incoming_request(&self, actor: &UserId) -> bool {
        self.status == MatchStatus::Pending && &self.user2_id == actor
    }

    /// Replaces the summary only with a strictly newer message.
    pub fn observe_message(&mut self, message: &MessageRecord) -> bool {
        let newer = self
            .last_message
            .as_ref()
            .map_or(true, |current| message.created_at > current.created_at);
        if newer {
            self.last_message = Some(MessageSummary::from(message));
        }
        newer
    }
}

#[must_use]
pub fn pair_key(a: &UserId, b: &UserId) -> (UserId, UserId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub match_id: MatchId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: UnixTimeMs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentRecord {
    pub id: CommentId,
    pub event_id: EventId,
    pub author_id: UserId,
    pub content: String,
    pub created_at: UnixTimeMs,
}

/// Row shape of the `events` table. Participant counts are derived from
/// `event_participants`, never read from this row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRow {
    pub id: EventId,
    pub title: String,
    pub creator_id: UserId,
    pub created_at: UnixTimeMs,
    pub starts_at: UnixTimeMs,
    pub max_participants: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    pub title: String,
    pub creator_id: UserId,
    pub created_at: UnixTimeMs,
    pub starts_at: UnixTimeMs,
    pub current_participants: u32,
    pub max_participants: u32,
}

impl EventRecord {
    #[must_use]
    pub fn from_row(row: EventRow, current_participants: u32) -> Self {
        Self {
            id: row.id,
            title: row.title,
            creator_id: row.creator_id,
            created_at: row.created_at,
            starts_at: row.starts_at,
            current_participants,
            max_participants: row.max_participants,
        }
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.current_participants >= self.max_participants
    }
}

/// Row shape of the `event_participants` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRow {
    pub id: String,
    pub event_id: EventId,
    pub user_id: UserId,
    pub joined_at: UnixTimeMs,
}

impl ParticipantRow {
    #[must_use]
    pub fn new(event_id: &EventId, user_id: &UserId, joined_at: UnixTimeMs) -> Self {
        Self {
            id: ParticipationRecord::row_id(event_id, user_id),
            event_id: event_id.clone(),
            user_id: user_id.clone(),
            joined_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipationRecord {
    pub joined: bool,
}

impl ParticipationRecord {
    pub const JOINED: Self = Self { joined: true };
    pub const NOT_JOINED: Self = Self { joined: false };

    /// Deterministic participant row id, so leaving can delete by id.
    #[must_use]
    pub fn row_id(event_id: &EventId, user_id: &UserId) -> String {
        format!("{event_id}:{user_id}")
    }
}

/// Append-only timeline entry (messages in a match, comments on an event).
pub trait TimelineEntry: Clone {
    type Id: Clone + Eq + Hash + fmt::Debug;
    type Owner: Clone + Eq + Hash + fmt::Debug;

    fn entry_id(&self) -> &Self::Id;
    fn owner(&self) -> &Self::Owner;
    fn created_at(&self) -> UnixTimeMs;
}

impl TimelineEntry for MessageRecord {
    type Id = MessageId;
    type Owner = MatchId;

    fn entry_id(&self) -> &MessageId {
        &self.id
    }

    fn owner(&self) -> &MatchId {
        &self.match_id
    }

    fn created_at(&self) -> UnixTimeMs {
        self.created_at
    }
}

impl TimelineEntry for CommentRecord {
    type Id = CommentId;
    type Owner = EventId;

    fn entry_id(&self) -> &CommentId {
        &self.id
    }

    fn owner(&self) -> &EventId {
        &self.event_id
    }

    fn created_at(&self) -> UnixTimeMs {
        self.created_at
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCounters {
    pub pending_matches: u32,
    pub unread_conversations: u32,
    pub new_events: u32,
}

impl UnreadCounters {
    #[must_use]
    pub const fn total(&self) -> u32 {
        self.pending_matches
            .saturating_add(self.unread_conversations)
            .saturating_add(self.new_events)
    }
}

#[must_use]
pub fn preview(text: &str, max_len: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_len {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(max_len.saturating_sub(3)).collect();
    format!("{}...", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, at: u64) -> MessageRecord {
        MessageRecord {
            id: MessageId::new(id),
            match_id: MatchId::new("m1"),
            sender_id: UserId::new("u1"),
            content: format!("hello {id}"),
            created_at: UnixTimeMs(at),
        }
    }

    fn pending_match() -> MatchRecord {
        MatchRecord::from_row(MatchRow {
            id: MatchId::new("m1"),
            user1_id: UserId::new("alice"),
            user2_id: UserId::new("bob"),
            status: MatchStatus::Pending,
            created_at: UnixTimeMs(1),
        })
    }

    #[test]
    fn test_match_transitions() {
        assert!(MatchStatus::Pending.can_transition_to(MatchStatus::Matched));
        assert!(MatchStatus::Pending.can_transition_to(MatchStatus::Rejected));
        assert!(MatchStatus::Matched
            .validate_transition(MatchStatus::Pending)
            .is_err());
        assert!(MatchStatus::Rejected.valid_transitions().is_empty());
    }

    #[test]
    fn test_pair_key_is_unordered() {
        let a = UserId::new("alice");
        let b = UserId::new("bob");
        assert_eq!(pair_key(&a, &b), pair_key(&b, &a));
    }

    #[test]
    fn test_counterpart_and_incoming() {
        let m = pending_match();
        assert_eq!(m.counterpart_id(&UserId::new("alice")).as_str(), "bob");
        assert_eq!(m.counterpart_id(&UserId::new("bob")).as_str(), "alice");
        assert!(m.is_incoming_request(&UserId::new("bob")));
        assert!(!m.is_incoming_request(&UserId::new("alice")));
    }

    #[test]
    fn test_observe_message_keeps_newest() {
        let mut m = pending_match();
        assert!(m.observe_message(&message("a", 10)));
        assert!(!m.observe_message(&message("b", 5)));
        assert_eq!(m.last_message.as_ref().unwrap().message_id.as_str(), "a");
        assert!(m.observe_message(&message("c", 11)));
        assert_eq!(m.last_message.unwrap().message_id.as_str(), "c");
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        assert_eq!(preview("  short  ", 10), "short");
        let long = "é".repeat(100);
        let p = preview(&long, 10);
        assert!(p.ends_with("..."));
        assert_eq!(p.chars().count(), 10);
    }

    #[test]
    fn test_event_capacity() {
        let row = EventRow {
            id: EventId::new("e1"),
            title: "Hike".into(),
            creator_id: UserId::new("alice"),
            created_at: UnixTimeMs(0),
            starts_at: UnixTimeMs(100),
            max_participants: 2,
        };
        assert!(!EventRecord::from_row(row.clone(), 1).is_full());
        assert!(EventRecord::from_row(row, 2).is_full());
    }

    #[test]
    fn test_participation_row_id() {
        let row = ParticipantRow::new(&EventId::new("e1"), &UserId::new("u1"), UnixTimeMs(3));
        assert_eq!(row.id, "e1:u1");
    }
}
