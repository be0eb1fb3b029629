//! Local cache store.
//!
//! All mutation goes through [`CacheState`] methods, reached via
//! [`CacheStore::write`] so each operation (or a composed sequence) runs in
//! one short critical section. The lock is never held across an await.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::ids::{CommentId, EventId, MatchId, MessageId, UserId};
use crate::model::{
    pair_key, CommentRecord, EventRecord, MatchRecord, MatchStatus, MessageRecord, TimelineEntry,
    UnreadCounters,
};
use crate::UnixTimeMs;

const LOADED_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionKind {
    Matches,
    Events,
    Messages(MatchId),
    Comments(EventId),
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Matches => f.write_str("matches"),
            Self::Events => f.write_str("events"),
            Self::Messages(id) => write!(f, "messages:{id}"),
            Self::Comments(id) => write!(f, "comments:{id}"),
        }
    }
}

/// Authoritative contents for a wholesale replace.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionData {
    Matches(Vec<MatchRecord>),
    /// Events plus the actor's membership, swapped together.
    Events {
        events: Vec<EventRecord>,
        participation: HashMap<EventId, bool>,
    },
}

impl CollectionData {
    #[must_use]
    pub fn kind(&self) -> CollectionKind {
        match self {
            Self::Matches(_) => CollectionKind::Matches,
            Self::Events { .. } => CollectionKind::Events,
        }
    }
}

/// A single record for [`CacheState::upsert_one`].
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Match(MatchRecord),
    Event(EventRecord),
    Message(MessageRecord),
    Comment(CommentRecord),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceOutcome {
    pub selection_cleared: bool,
}

/// Bumped on every effective change; lets the view skip unchanged slices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revisions {
    pub matches: u64,
    pub events: u64,
    pub participation: u64,
    pub messages: u64,
    pub comments: u64,
    pub unread: u64,
    pub selection: u64,
}

/// Pre-mutation copy of one entity. `None` means "absent".
#[derive(Debug, Clone, PartialEq)]
pub enum EntitySnapshot {
    Event {
        id: EventId,
        record: Option<EventRecord>,
        joined: Option<bool>,
    },
    Match {
        id: MatchId,
        record: Option<MatchRecord>,
    },
    Message {
        id: MessageId,
        match_id: MatchId,
        record: Option<MessageRecord>,
    },
}

impl EntitySnapshot {
    #[must_use]
    pub fn collection(&self) -> CollectionKind {
        match self {
            Self::Event { .. } => CollectionKind::Events,
            Self::Match { .. } => CollectionKind::Matches,
            Self::Message { match_id, .. } => CollectionKind::Messages(match_id.clone()),
        }
    }
}

#[derive(Debug)]
struct Timelines<T: TimelineEntry> {
    by_owner: HashMap<T::Owner, Vec<T>>,
    index: HashMap<T::Id, T::Owner>,
    loaded: HashSet<T::Owner>,
    exhausted: HashSet<T::Owner>,
}

impl<T: TimelineEntry> Default for Timelines<T> {
    fn default() -> Self {
        Self {
            by_owner: HashMap::new(),
            index: HashMap::new(),
            loaded: HashSet::new(),
            exhausted: HashSet::new(),
        }
    }
}

impl<T: TimelineEntry> Timelines<T> {
    fn get(&self, id: &T::Id) -> Option<&T> {
        let owner = self.index.get(id)?;
        self.by_owner
            .get(owner)?
            .iter()
            .find(|e| e.entry_id() == id)
    }

    fn entries(&self, owner: &T::Owner) -> &[T] {
        self.by_owner.get(owner).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Ignores ids already present anywhere in the cache.
    fn insert(&mut self, entry: T) -> bool {
        if self.index.contains_key(entry.entry_id()) {
            return false;
        }
        self.index
            .insert(entry.entry_id().clone(), entry.owner().clone());
        let list = self.by_owner.entry(entry.owner().clone()).or_default();
        let at = list.partition_point(|e| e.created_at() <= entry.created_at());
        list.insert(at, entry);
        true
    }

    fn merge(&mut self, owner: &T::Owner, entries: Vec<T>) -> usize {
        self.loaded.insert(owner.clone());
        let mut added = 0;
        for entry in entries {
            if entry.owner() != owner {
                continue;
            }
            if self.insert(entry) {
                added += 1;
            }
        }
        added
    }

    fn remove(&mut self, id: &T::Id) -> Option<T> {
        let owner = self.index.remove(id)?;
        let list = self.by_owner.get_mut(&owner)?;
        let pos = list.iter().position(|e| e.entry_id() == id)?;
        Some(list.remove(pos))
    }

    fn oldest(&self, owner: &T::Owner) -> Option<UnixTimeMs> {
        self.entries(owner).first().map(TimelineEntry::created_at)
    }
}

#[derive(Debug, Default)]
pub struct CacheState {
    matches: Vec<MatchRecord>,
    events: Vec<EventRecord>,
    participation: HashMap<EventId, bool>,
    messages: Timelines<MessageRecord>,
    comments: Timelines<CommentRecord>,
    unread: UnreadCounters,
    selected_match: Option<MatchId>,
    selected_event: Option<EventId>,
    loaded: HashSet<CollectionKind>,
    revisions: Revisions,
    commit_epochs: HashMap<CollectionKind, u64>,
}

impl CacheState {
    // --- reads ---

    #[must_use]
    pub fn matches(&self) -> &[MatchRecord] {
        &self.matches
    }

    #[must_use]
    pub fn match_by_id(&self, id: &MatchId) -> Option<&MatchRecord> {
        self.matches.iter().find(|m| &m.id == id)
    }

    #[must_use]
    pub fn match_for_pair(&self, a: &UserId, b: &UserId) -> Option<&MatchRecord> {
        let key = pair_key(a, b);
        self.matches.iter().find(|m| m.pair_key() == key)
    }

    #[must_use]
    pub fn events(&self) -> &[EventRecord] {
        &self.events
    }

    #[must_use]
    pub fn event(&self, id: &EventId) -> Option<&EventRecord> {
        self.events.iter().find(|e| &e.id == id)
    }

    #[must_use]
    pub fn participation(&self, event_id: &EventId) -> Option<bool> {
        self.participation.get(event_id).copied()
    }

    #[must_use]
    pub fn participation_map(&self) -> &HashMap<EventId, bool> {
        &self.participation
    }

    #[must_use]
    pub fn messages(&self, match_id: &MatchId) -> &[MessageRecord] {
        self.messages.entries(match_id)
    }

    #[must_use]
    pub fn message(&self, id: &MessageId) -> Option<&MessageRecord> {
        self.messages.get(id)
    }

    #[must_use]
    pub fn oldest_message_at(&self, match_id: &MatchId) -> Option<UnixTimeMs> {
        self.messages.oldest(match_id)
    }

    /// Cached messages of `match_id` stamped exactly `at`.
    #[must_use]
    pub fn messages_at(&self, match_id: &MatchId, at: UnixTimeMs) -> usize {
        self.messages(match_id)
            .iter()
            .filter(|m| m.created_at == at)
            .count()
    }

    #[must_use]
    pub fn has_older_messages(&self, match_id: &MatchId) -> bool {
        !self.messages.exhausted.contains(match_id)
    }

    #[must_use]
    pub fn comments(&self, event_id: &EventId) -> &[CommentRecord] {
        self.comments.entries(event_id)
    }

    #[must_use]
    pub fn comment(&self, id: &CommentId) -> Option<&CommentRecord> {
        self.comments.get(id)
    }

    #[must_use]
    pub fn unread(&self) -> UnreadCounters {
        self.unread
    }

    #[must_use]
    pub fn selected_match(&self) -> Option<&MatchId> {
        self.selected_match.as_ref()
    }

    #[must_use]
    pub fn selected_event(&self) -> Option<&EventId> {
        self.selected_event.as_ref()
    }

    #[must_use]
    pub fn is_loaded(&self, kind: &CollectionKind) -> bool {
        match kind {
            CollectionKind::Messages(id) => self.messages.loaded.contains(id),
            CollectionKind::Comments(id) => self.comments.loaded.contains(id),
            _ => self.loaded.contains(kind),
        }
    }

    #[must_use]
    pub fn revisions(&self) -> Revisions {
        self.revisions
    }

    /// Bumped whenever a mutation touching `kind` commits remotely.
    #[must_use]
    pub fn commit_epoch(&self, kind: &CollectionKind) -> u64 {
        self.commit_epochs.get(kind).copied().unwrap_or(0)
    }

    pub fn bump_commit_epoch(&mut self, kind: CollectionKind) {
        *self.commit_epochs.entry(kind).or_default() += 1;
    }

    // --- collection writes ---

    /// Atomically swaps a whole collection and re-resolves the selection by
    /// id. Duplicate participant pairs keep their first occurrence.
    pub fn replace_collection(&mut self, data: CollectionData) -> ReplaceOutcome {
        let mut outcome = ReplaceOutcome::default();
        match data {
            CollectionData::Matches(records) => {
                let mut seen = HashSet::new();
                let mut kept = Vec::with_capacity(records.len());
                for record in records {
                    if seen.insert(record.pair_key()) {
                        kept.push(record);
                    } else {
                        warn!(match_id = %record.id, "dropping duplicate match for pair");
                    }
                }
                self.matches = kept;
                self.loaded.insert(CollectionKind::Matches);
                self.revisions.matches += 1;
                if let Some(selected) = &self.selected_match {
                    if self.match_by_id(selected).is_none() {
                        debug!(match_id = %selected, "selected match gone after refresh");
                        self.selected_match = None;
                        self.revisions.selection += 1;
                        outcome.selection_cleared = true;
                    }
                }
            }
            CollectionData::Events {
                events,
                participation,
            } => {
                self.events = events;
                self.participation = participation;
                self.loaded.insert(CollectionKind::Events);
                self.revisions.events += 1;
                self.revisions.participation += 1;
                if let Some(selected) = &self.selected_event {
                    if self.event(selected).is_none() {
                        self.selected_event = None;
                        self.revisions.selection += 1;
                        outcome.selection_cleared = true;
                    }
                }
            }
        }
        outcome
    }

    /// Inserts `record` unless its id (or, for matches, its participant pair)
    /// is already present. Returns whether anything changed.
    pub fn upsert_one(&mut self, record: Record) -> bool {
        match record {
            Record::Match(m) => {
                if self.match_by_id(&m.id).is_some()
                    || self.match_for_pair(&m.user1_id, &m.user2_id).is_some()
                {
                    return false;
                }
                self.matches.insert(0, m);
                self.revisions.matches += 1;
                true
            }
            Record::Event(e) => {
                if self.event(&e.id).is_some() {
                    return false;
                }
                self.events.push(e);
                self.revisions.events += 1;
                true
            }
            Record::Message(msg) => {
                let summary_source = msg.clone();
                if !self.messages.insert(msg) {
                    return false;
                }
                self.revisions.messages += 1;
                self.observe_message(&summary_source);
                true
            }
            Record::Comment(c) => {
                let inserted = self.comments.insert(c);
                if inserted {
                    self.revisions.comments += 1;
                }
                inserted
            }
        }
    }

    /// Merges a fetched page into a match timeline; marks it loaded.
    pub fn merge_messages(&mut self, match_id: &MatchId, page: Vec<MessageRecord>) -> usize {
        let newest = page.iter().max_by_key(|m| m.created_at).cloned();
        let added = self.messages.merge(match_id, page);
        if added > 0 {
            self.revisions.messages += 1;
        }
        if let Some(newest) = newest {
            self.observe_message(&newest);
        }
        added
    }

    /// Points the owning match's summary at `message` if it is newer.
    pub fn observe_message(&mut self, message: &MessageRecord) -> bool {
        let Some(m) = self.matches.iter_mut().find(|m| m.id == message.match_id) else {
            return false;
        };
        let newer = m.observe_message(message);
        if newer {
            self.revisions.matches += 1;
        }
        newer
    }

    pub fn mark_messages_exhausted(&mut self, match_id: &MatchId) {
        self.messages.exhausted.insert(match_id.clone());
    }

    pub fn merge_comments(&mut self, event_id: &EventId, page: Vec<CommentRecord>) -> usize {
        let added = self.comments.merge(event_id, page);
        if added > 0 {
            self.revisions.comments += 1;
        }
        added
    }

    // --- entity writes ---

    /// Sets the actor's membership and moves the participant count with it.
    /// A no-op when membership already has that value.
    pub fn set_participation(&mut self, event_id: &EventId, joined: bool) -> bool {
        let was = self.participation.get(event_id).copied().unwrap_or(false);
        if was == joined && self.participation.contains_key(event_id) {
            return false;
        }
        self.participation.insert(event_id.clone(), joined);
        self.revisions.participation += 1;
        if was != joined {
            if let Some(event) = self.events.iter_mut().find(|e| &e.id == event_id) {
                event.current_participants = if joined {
                    event.current_participants.saturating_add(1)
                } else {
                    event.current_participants.saturating_sub(1)
                };
                self.revisions.events += 1;
            }
        }
        true
    }

    /// Seeds membership from the persisted mirror for immediate paint. Only
    /// before the first events refresh, and never over an existing entry.
    pub fn hydrate_participation(&mut self, joined: impl IntoIterator<Item = (EventId, bool)>) -> usize {
        if self.loaded.contains(&CollectionKind::Events) {
            return 0;
        }
        let mut added = 0;
        for (event_id, value) in joined {
            if let std::collections::hash_map::Entry::Vacant(slot) = self.participation.entry(event_id) {
                slot.insert(value);
                added += 1;
            }
        }
        if added > 0 {
            self.revisions.participation += 1;
        }
        added
    }

    pub fn set_match_status(&mut self, id: &MatchId, status: MatchStatus) -> bool {
        match self.matches.iter_mut().find(|m| &m.id == id) {
            Some(m) if m.status != status => {
                m.status = status;
                self.revisions.matches += 1;
                true
            }
            _ => false,
        }
    }

    pub fn set_unread(&mut self, counters: UnreadCounters) {
        if self.unread != counters {
            self.unread = counters;
            self.revisions.unread += 1;
        }
    }

    /// Selects a loaded match, or clears the selection with `None`.
    pub fn select_match(&mut self, id: Option<&MatchId>) -> bool {
        if let Some(id) = id {
            if self.match_by_id(id).is_none() {
                return false;
            }
        }
        if self.selected_match.as_ref() != id {
            self.selected_match = id.cloned();
            self.revisions.selection += 1;
        }
        true
    }

    pub fn select_event(&mut self, id: Option<&EventId>) -> bool {
        if let Some(id) = id {
            if self.event(id).is_none() {
                return false;
            }
        }
        if self.selected_event.as_ref() != id {
            self.selected_event = id.cloned();
            self.revisions.selection += 1;
        }
        true
    }

    // --- snapshots ---

    #[must_use]
    pub fn snapshot_event(&self, id: &EventId) -> EntitySnapshot {
        EntitySnapshot::Event {
            id: id.clone(),
            record: self.event(id).cloned(),
            joined: self.participation(id),
        }
    }

    #[must_use]
    pub fn snapshot_match(&self, id: &MatchId) -> EntitySnapshot {
        EntitySnapshot::Match {
            id: id.clone(),
            record: self.match_by_id(id).cloned(),
        }
    }

    #[must_use]
    pub fn snapshot_message(&self, id: &MessageId, match_id: &MatchId) -> EntitySnapshot {
        EntitySnapshot::Message {
            id: id.clone(),
            match_id: match_id.clone(),
            record: self.message(id).cloned(),
        }
    }

    /// Puts every entity back exactly as captured.
    pub fn restore(&mut self, snapshots: Vec<EntitySnapshot>) {
        for snapshot in snapshots {
            match snapshot {
                EntitySnapshot::Event { id, record, joined } => {
                    let pos = self.events.iter().position(|e| e.id == id);
                    match (record, pos) {
                        (Some(r), Some(i)) => self.events[i] = r,
                        (Some(r), None) => self.events.push(r),
                        (None, Some(i)) => {
                            self.events.remove(i);
                        }
                        (None, None) => {}
                    }
                    match joined {
                        Some(j) => self.participation.insert(id, j),
                        None => self.participation.remove(&id),
                    };
                    self.revisions.events += 1;
                    self.revisions.participation += 1;
                }
                EntitySnapshot::Match { id, record } => {
                    let pos = self.matches.iter().position(|m| m.id == id);
                    match (record, pos) {
                        (Some(r), Some(i)) => self.matches[i] = r,
                        (Some(r), None) => self.matches.insert(0, r),
                        (None, Some(i)) => {
                            self.matches.remove(i);
                        }
                        (None, None) => {}
                    }
                    self.revisions.matches += 1;
                    if self.selected_match.as_ref() == Some(&id) && self.match_by_id(&id).is_none()
                    {
                        self.selected_match = None;
                        self.revisions.selection += 1;
                    }
                }
                EntitySnapshot::Message { id, record, .. } => {
                    match record {
                        Some(r) => {
                            self.messages.insert(r);
                        }
                        None => {
                            self.messages.remove(&id);
                        }
                    }
                    self.revisions.messages += 1;
                }
            }
        }
    }
}

/// Read-only copy of everything the view renders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheSnapshot {
    pub matches: Vec<MatchRecord>,
    pub events: Vec<EventRecord>,
    pub participation: HashMap<EventId, bool>,
    pub selected_match: Option<MatchId>,
    pub selected_messages: Vec<MessageRecord>,
    pub selected_event: Option<EventId>,
    pub selected_comments: Vec<CommentRecord>,
    pub unread: UnreadCounters,
    pub matches_loaded: bool,
    pub events_loaded: bool,
    pub revisions: Revisions,
}

pub struct CacheStore {
    state: RwLock<CacheState>,
    loaded_tx: broadcast::Sender<CollectionKind>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    #[must_use]
    pub fn new() -> Self {
        let (loaded_tx, _) = broadcast::channel(LOADED_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(CacheState::default()),
            loaded_tx,
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&CacheState) -> R) -> R {
        let guard = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut CacheState) -> R) -> R {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn replace_collection(&self, data: CollectionData) -> ReplaceOutcome {
        self.replace_collection_then(data, |_| {})
    }

    /// Replaces a collection and runs `after` inside the same critical
    /// section, so no reader observes the state in between.
    pub fn replace_collection_then(
        &self,
        data: CollectionData,
        after: impl FnOnce(&mut CacheState),
    ) -> ReplaceOutcome {
        let kind = data.kind();
        let outcome = self.write(|state| {
            let outcome = state.replace_collection(data);
            after(state);
            outcome
        });
        self.notify_loaded(kind);
        outcome
    }

    /// Like [`Self::replace_collection_then`], but only if no commit touched
    /// the collection since `epoch` was read. `None` leaves the cache as is.
    pub fn replace_collection_if(
        &self,
        data: CollectionData,
        epoch: u64,
        after: impl FnOnce(&mut CacheState),
    ) -> Option<ReplaceOutcome> {
        let kind = data.kind();
        let outcome = self.write(|state| {
            if state.commit_epoch(&kind) != epoch {
                return None;
            }
            let outcome = state.replace_collection(data);
            after(state);
            Some(outcome)
        })?;
        self.notify_loaded(kind);
        Some(outcome)
    }

    #[must_use]
    pub fn commit_epoch(&self, kind: &CollectionKind) -> u64 {
        self.read(|state| state.commit_epoch(kind))
    }

    pub fn upsert_one(&self, record: Record) -> bool {
        self.write(|state| state.upsert_one(record))
    }

    pub fn merge_messages(&self, match_id: &MatchId, page: Vec<MessageRecord>) -> usize {
        let added = self.write(|state| state.merge_messages(match_id, page));
        self.notify_loaded(CollectionKind::Messages(match_id.clone()));
        added
    }

    pub fn merge_comments(&self, event_id: &EventId, page: Vec<CommentRecord>) -> usize {
        let added = self.write(|state| state.merge_comments(event_id, page));
        self.notify_loaded(CollectionKind::Comments(event_id.clone()));
        added
    }

    /// Receiver of "collection loaded" notifications, one per replace/merge.
    #[must_use]
    pub fn subscribe_loaded(&self) -> broadcast::Receiver<CollectionKind> {
        self.loaded_tx.subscribe()
    }

    pub fn notify_loaded(&self, kind: CollectionKind) {
        // No receivers is fine.
        let _ = self.loaded_tx.send(kind);
    }

    #[must_use]
    pub fn is_loaded(&self, kind: &CollectionKind) -> bool {
        self.read(|state| state.is_loaded(kind))
    }

    #[must_use]
    pub fn revisions(&self) -> Revisions {
        self.read(CacheState::revisions)
    }

    #[must_use]
    pub fn snapshot(&self) -> CacheSnapshot {
        self.read(|state| CacheSnapshot {
            matches: state.matches.clone(),
            events: state.events.clone(),
            participation: state.participation.clone(),
            selected_match: state.selected_match.clone(),
            selected_messages: state
                .selected_match
                .as_ref()
                .map(|id| state.messages(id).to_vec())
                .unwrap_or_default(),
            selected_event: state.selected_event.clone(),
            selected_comments: state
                .selected_event
                .as_ref()
                .map(|id| state.comments(id).to_vec())
                .unwrap_or_default(),
            unread: state.unread,
            matches_loaded: state.loaded.contains(&CollectionKind::Matches),
            events_loaded: state.loaded.contains(&CollectionKind::Events),
            revisions: state.revisions,
        })
    }
}
