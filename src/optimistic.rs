//! Optimistic mutation controller.
//!
//! Each user action is a small state machine: the delta is applied to the
//! cache before the remote call (`Idle -> Applied`), then either kept
//! (`Committed`) or undone from the captured snapshot (`RolledBack`). At most
//! one mutation per target is in flight; a second one is rejected.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::cache::{CacheState, CacheStore, CollectionKind, EntitySnapshot, Record};
use crate::capabilities::{encode_row, DataError, DataService, Patch, Table};
use crate::config::SyncConfig;
use crate::ids::{EventId, MatchId, MessageId, MutationId, UserId};
use crate::model::{pair_key, MatchRecord, MatchRow, MatchStatus, MessageRecord, ParticipantRow, ParticipationRecord};
use crate::offline_store::ParticipationMirror;
use crate::UnixTimeMs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationState {
    Idle,
    Applied,
    Committed,
    RolledBack,
}

impl MutationState {
    #[must_use]
    pub fn valid_transitions(self) -> Vec<Self> {
        match self {
            Self::Idle => vec![Self::Applied],
            Self::Applied => vec![Self::Committed, Self::RolledBack],
            Self::Committed | Self::RolledBack => vec![],
        }
    }

    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        self.valid_transitions().contains(&to)
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MutationError {
    #[error("remote mutation failed: {0}")]
    Remote(DataError),

    #[error("a mutation on {target} is already in flight")]
    InFlight { target: String },

    #[error("{0}")]
    Validation(String),

    #[error("{target} is not loaded")]
    NotLoaded { target: String },

    #[error("invalid mutation transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: MutationState,
        to: MutationState,
    },
}

/// The entity a mutation locks while it is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MutationTarget {
    Event(EventId),
    Match(MatchId),
    Pair(UserId, UserId),
    Message(MessageId),
}

impl fmt::Display for MutationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event(id) => write!(f, "event:{id}"),
            Self::Match(id) => write!(f, "match:{id}"),
            Self::Pair(a, b) => write!(f, "pair:{a}:{b}"),
            Self::Message(id) => write!(f, "message:{id}"),
        }
    }
}

/// The local change a mutation applies ahead of confirmation.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Participation { event_id: EventId, joined: bool },
    MatchStatus { match_id: MatchId, status: MatchStatus },
    InsertMatch(MatchRecord),
    InsertMessage(MessageRecord),
}

impl Delta {
    #[must_use]
    pub fn target(&self) -> MutationTarget {
        match self {
            Self::Participation { event_id, .. } => MutationTarget::Event(event_id.clone()),
            Self::MatchStatus { match_id, .. } => MutationTarget::Match(match_id.clone()),
            Self::InsertMatch(m) => {
                let (a, b) = m.pair_key();
                MutationTarget::Pair(a, b)
            }
            Self::InsertMessage(m) => MutationTarget::Message(m.id.clone()),
        }
    }

    fn capture(&self, state: &CacheState) -> Vec<EntitySnapshot> {
        match self {
            Self::Participation { event_id, .. } => vec![state.snapshot_event(event_id)],
            Self::MatchStatus { match_id, .. } => vec![state.snapshot_match(match_id)],
            Self::InsertMatch(m) => vec![state.snapshot_match(&m.id)],
            Self::InsertMessage(m) => vec![
                state.snapshot_message(&m.id, &m.match_id),
                state.snapshot_match(&m.match_id),
            ],
        }
    }

    /// Idempotent, so it can be re-applied on top of a fresh refresh.
    fn apply(&self, state: &mut CacheState) {
        match self {
            Self::Participation { event_id, joined } => {
                state.set_participation(event_id, *joined);
            }
            Self::MatchStatus { match_id, status } => {
                state.set_match_status(match_id, *status);
            }
            Self::InsertMatch(m) => {
                state.upsert_one(Record::Match(m.clone()));
            }
            Self::InsertMessage(m) => {
                state.upsert_one(Record::Message(m.clone()));
                state.observe_message(m);
            }
        }
    }

    fn collections(&self) -> Vec<CollectionKind> {
        match self {
            Self::Participation { .. } => vec![CollectionKind::Events],
            Self::MatchStatus { .. } | Self::InsertMatch(_) => vec![CollectionKind::Matches],
            Self::InsertMessage(m) => vec![
                CollectionKind::Matches,
                CollectionKind::Messages(m.match_id.clone()),
            ],
        }
    }

    fn touches(&self, kind: &CollectionKind) -> bool {
        self.collections().contains(kind)
    }
}

#[derive(Debug)]
struct Mutation {
    id: MutationId,
    delta: Delta,
    state: MutationState,
    snapshots: Vec<EntitySnapshot>,
}

impl Mutation {
    fn transition(&mut self, to: MutationState) -> Result<(), MutationError> {
        if !self.state.can_transition_to(to) {
            return Err(MutationError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

/// Rolls the mutation back if the caller's future is dropped mid-flight.
struct FlightGuard<'a> {
    controller: &'a MutationController,
    target: Option<MutationTarget>,
}

impl FlightGuard<'_> {
    fn disarm(&mut self) -> Option<MutationTarget> {
        self.target.take()
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            warn!(target = %target, "mutation abandoned in flight, rolling back");
            if let Err(e) = self.controller.rollback(&target) {
                warn!(target = %target, error = %e, "rollback of abandoned mutation failed");
            }
        }
    }
}

pub struct MutationController {
    cache: Arc<CacheStore>,
    data: Arc<dyn DataService>,
    mirror: Option<Arc<ParticipationMirror>>,
    actor: UserId,
    max_message_bytes: usize,
    pending: Mutex<HashMap<MutationTarget, Mutation>>,
}

impl MutationController {
    pub fn new(
        cache: Arc<CacheStore>,
        data: Arc<dyn DataService>,
        actor: UserId,
        config: &SyncConfig,
    ) -> Self {
        Self {
            cache,
            data,
            mirror: None,
            actor,
            max_message_bytes: config.max_message_bytes,
            pending: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_mirror(mut self, mirror: Arc<ParticipationMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<MutationTarget, Mutation>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_in_flight(&self, target: &MutationTarget) -> bool {
        self.pending().contains_key(target)
    }

    #[must_use]
    pub fn in_flight(&self) -> Vec<MutationTarget> {
        self.pending().keys().cloned().collect()
    }

    // --- public actions ---

    /// Joins `event_id`; a no-op if already joined.
    #[instrument(skip(self), fields(event_id = %event_id))]
    pub async fn join_event(&self, event_id: &EventId) -> Result<bool, MutationError> {
        self.set_participation(event_id, Some(true)).await
    }

    #[instrument(skip(self), fields(event_id = %event_id))]
    pub async fn leave_event(&self, event_id: &EventId) -> Result<bool, MutationError> {
        self.set_participation(event_id, Some(false)).await
    }

    /// Flips membership as the cache shows it right now.
    #[instrument(skip(self), fields(event_id = %event_id))]
    pub async fn toggle_participation(&self, event_id: &EventId) -> Result<bool, MutationError> {
        self.set_participation(event_id, None).await
    }

    async fn set_participation(
        &self,
        event_id: &EventId,
        want: Option<bool>,
    ) -> Result<bool, MutationError> {
        let target = MutationTarget::Event(event_id.clone());
        let prepared = self.begin(&target, |state| {
            let event = state.event(event_id).ok_or_else(|| MutationError::NotLoaded {
                target: format!("event:{event_id}"),
            })?;
            let current = state.participation(event_id).unwrap_or(false);
            let joined = want.unwrap_or(!current);
            if joined == current {
                return Ok(None);
            }
            if joined && event.is_full() {
                return Err(MutationError::Validation("This event is full.".into()));
            }
            Ok(Some(Delta::Participation {
                event_id: event_id.clone(),
                joined,
            }))
        })?;
        let Some((id, delta, guard)) = prepared else {
            return Ok(want.unwrap_or(false));
        };
        let joined = matches!(delta, Delta::Participation { joined: true, .. });
        self.execute(id, &delta, guard).await?;
        if let Some(mirror) = &self.mirror {
            mirror.record(event_id, joined);
        }
        Ok(joined)
    }

    #[instrument(skip(self, content), fields(match_id = %match_id, len = content.len()))]
    pub async fn send_message(
        &self,
        match_id: &MatchId,
        content: &str,
    ) -> Result<MessageRecord, MutationError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(MutationError::Validation("Message cannot be empty.".into()));
        }
        if content.len() > self.max_message_bytes {
            return Err(MutationError::Validation(format!(
                "Message is too long (max {} bytes).",
                self.max_message_bytes
            )));
        }
        let message = MessageRecord {
            id: MessageId::generate(),
            match_id: match_id.clone(),
            sender_id: self.actor.clone(),
            content: content.to_string(),
            created_at: UnixTimeMs::now(),
        };
        let target = MutationTarget::Message(message.id.clone());
        let prepared = self.begin(&target, |state| {
            let m = state.match_by_id(match_id).ok_or_else(|| MutationError::NotLoaded {
                target: format!("match:{match_id}"),
            })?;
            if !m.involves(&self.actor) {
                return Err(MutationError::Validation(
                    "You are not part of this conversation.".into(),
                ));
            }
            if m.status != MatchStatus::Matched {
                return Err(MutationError::Validation(
                    "You can only message confirmed matches.".into(),
                ));
            }
            Ok(Some(Delta::InsertMessage(message.clone())))
        })?;
        if let Some((id, delta, guard)) = prepared {
            self.execute(id, &delta, guard).await?;
        }
        Ok(message)
    }

    /// Sends a match request from the actor to `counterpart`.
    #[instrument(skip(self), fields(counterpart = %counterpart))]
    pub async fn create_match(&self, counterpart: &UserId) -> Result<MatchRecord, MutationError> {
        if counterpart == &self.actor {
            return Err(MutationError::Validation("You cannot match with yourself.".into()));
        }
        let record = MatchRecord::from_row(MatchRow {
            id: MatchId::generate(),
            user1_id: self.actor.clone(),
            user2_id: counterpart.clone(),
            status: MatchStatus::Pending,
            created_at: UnixTimeMs::now(),
        });
        let (a, b) = pair_key(&self.actor, counterpart);
        let target = MutationTarget::Pair(a, b);
        let prepared = self.begin(&target, |state| {
            if !state.is_loaded(&CollectionKind::Matches) {
                return Err(MutationError::NotLoaded {
                    target: "matches".into(),
                });
            }
            if state.match_for_pair(&self.actor, counterpart).is_some() {
                return Err(MutationError::Validation(
                    "You already have a match with this person.".into(),
                ));
            }
            Ok(Some(Delta::InsertMatch(record.clone())))
        })?;
        if let Some((id, delta, guard)) = prepared {
            self.execute(id, &delta, guard).await?;
        }
        Ok(record)
    }

    #[instrument(skip(self), fields(match_id = %match_id))]
    pub async fn accept_match(&self, match_id: &MatchId) -> Result<(), MutationError> {
        self.respond_to_match(match_id, MatchStatus::Matched).await
    }

    #[instrument(skip(self), fields(match_id = %match_id))]
    pub async fn reject_match(&self, match_id: &MatchId) -> Result<(), MutationError> {
        self.respond_to_match(match_id, MatchStatus::Rejected).await
    }

    async fn respond_to_match(
        &self,
        match_id: &MatchId,
        status: MatchStatus,
    ) -> Result<(), MutationError> {
        let target = MutationTarget::Match(match_id.clone());
        let prepared = self.begin(&target, |state| {
            let m = state.match_by_id(match_id).ok_or_else(|| MutationError::NotLoaded {
                target: format!("match:{match_id}"),
            })?;
            if m.user2_id != self.actor {
                return Err(MutationError::Validation(
                    "Only the recipient can respond to a match request.".into(),
                ));
            }
            m.status
                .validate_transition(status)
                .map_err(|e| MutationError::Validation(e.to_string()))?;
            Ok(Some(Delta::MatchStatus {
                match_id: match_id.clone(),
                status,
            }))
        })?;
        if let Some((id, delta, guard)) = prepared {
            self.execute(id, &delta, guard).await?;
        }
        Ok(())
    }

    // --- lifecycle ---

    /// Validates, snapshots and applies in one critical section, then
    /// registers the mutation as in flight. `Ok(None)` means nothing to do.
    fn begin(
        &self,
        target: &MutationTarget,
        prepare: impl FnOnce(&CacheState) -> Result<Option<Delta>, MutationError>,
    ) -> Result<Option<(MutationId, Delta, FlightGuard<'_>)>, MutationError> {
        let started = self.cache.write(|state| {
            let mut pending = self.pending();
            if pending.contains_key(target) {
                return Err(MutationError::InFlight {
                    target: target.to_string(),
                });
            }
            let Some(delta) = prepare(state)? else {
                return Ok(None);
            };
            let mut mutation = Mutation {
                id: MutationId::generate(),
                delta: delta.clone(),
                state: MutationState::Idle,
                snapshots: delta.capture(state),
            };
            delta.apply(state);
            mutation.transition(MutationState::Applied)?;
            let id = mutation.id.clone();
            pending.insert(target.clone(), mutation);
            Ok(Some((id, delta)))
        })?;

        Ok(started.map(|(id, delta)| {
            let guard = FlightGuard {
                controller: self,
                target: Some(target.clone()),
            };
            (id, delta, guard)
        }))
    }

    async fn execute(
        &self,
        id: MutationId,
        delta: &Delta,
        mut guard: FlightGuard<'_>,
    ) -> Result<(), MutationError> {
        let result = self.remote(delta).await;
        let Some(target) = guard.disarm() else {
            return Ok(());
        };
        match result {
            Ok(()) => {
                self.commit(&target)?;
                info!(mutation_id = %id, target = %target, "mutation committed");
                Ok(())
            }
            Err(e) => {
                warn!(mutation_id = %id, target = %target, error = %e, "mutation failed, rolling back");
                self.rollback(&target)?;
                Err(MutationError::Remote(e))
            }
        }
    }

    async fn remote(&self, delta: &Delta) -> Result<(), DataError> {
        match delta {
            Delta::Participation {
                event_id,
                joined: true,
            } => {
                let row = ParticipantRow::new(event_id, &self.actor, UnixTimeMs::now());
                let row = encode_row(Table::EventParticipants, &row)?;
                self.data.insert(Table::EventParticipants, row).await?;
            }
            Delta::Participation {
                event_id,
                joined: false,
            } => {
                let row_id = ParticipationRecord::row_id(event_id, &self.actor);
                self.data.delete(Table::EventParticipants, &row_id).await?;
            }
            Delta::MatchStatus { match_id, status } => {
                let mut patch = Patch::new();
                patch.insert("status".into(), Value::String(status.as_str().into()));
                self.data
                    .update(Table::Matches, match_id.as_str(), patch)
                    .await?;
            }
            Delta::InsertMatch(m) => {
                let row = encode_row(Table::Matches, &m.to_row())?;
                self.data.insert(Table::Matches, row).await?;
            }
            Delta::InsertMessage(m) => {
                let row = encode_row(Table::Messages, m)?;
                self.data.insert(Table::Messages, row).await?;
            }
        }
        Ok(())
    }

    /// Retires the mutation and bumps the commit epoch of every collection it
    /// touched, so a refresh that read the server before the write lands is
    /// discarded instead of reverting it.
    fn commit(&self, target: &MutationTarget) -> Result<(), MutationError> {
        self.cache.write(|state| {
            let mut pending = self.pending();
            let Some(mut mutation) = pending.remove(target) else {
                return Ok(());
            };
            mutation.transition(MutationState::Committed)?;
            for kind in mutation.delta.collections() {
                state.bump_commit_epoch(kind);
            }
            Ok(())
        })
    }

    fn rollback(&self, target: &MutationTarget) -> Result<(), MutationError> {
        self.cache.write(|state| {
            let mut pending = self.pending();
            let Some(mut mutation) = pending.remove(target) else {
                return Ok(());
            };
            mutation.transition(MutationState::RolledBack)?;
            state.restore(std::mem::take(&mut mutation.snapshots));
            Ok(())
        })
    }

    /// Called inside the critical section that replaced `kind`: re-takes the
    /// snapshot of every applied mutation touching it from the fresh
    /// authoritative state, then re-applies the delta on top.
    pub fn rebase_after_refresh(&self, state: &mut CacheState, kind: &CollectionKind) {
        let mut pending = self.pending();
        for (target, mutation) in pending.iter_mut() {
            if mutation.state != MutationState::Applied || !mutation.delta.touches(kind) {
                continue;
            }
            let fresh = mutation.delta.capture(state);
            mutation.snapshots.retain(|s| &s.collection() != kind);
            mutation
                .snapshots
                .extend(fresh.into_iter().filter(|s| &s.collection() == kind));
            mutation.delta.apply(state);
            info!(target = %target, collection = %kind, "rebased pending mutation");
        }
    }
}
