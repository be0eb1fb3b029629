//! Reconciliation and refresh scheduling.
//!
//! Every lifecycle trigger funnels into [`RefreshScheduler::refresh`], which
//! holds one in-flight ticket per collection. A trigger for a collection that
//! is already being fetched is suppressed, not queued.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheStore, CollectionData, CollectionKind};
use crate::capabilities::{
    decode_rows, DataError, DataErrorKind, DataService, Filter, Query, Table, MAX_QUERY_LIMIT,
};
use crate::config::SyncConfig;
use crate::ids::{EventId, MatchId, MessageId, UserId};
use crate::ingestion::{IngestionManager, Interest};
use crate::model::{
    CommentRecord, EventRecord, EventRow, MatchRecord, MatchRow, MatchStatus, MessageRecord,
    MessageSummary, ParticipantRow, ProfileSummary,
};
use crate::offline_store::ParticipationMirror;
use crate::optimistic::MutationController;
use crate::unread::UnreadAggregator;
use crate::UnixTimeMs;

#[cfg(feature = "push")]
use crate::capabilities::PushPayload;

/// Why a refresh was requested. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Visibility,
    Focus,
    Navigation,
    Push,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Replaced,
    /// Timeline merge; the number of entries not already present.
    Merged(usize),
    /// Another fetch of the same collection was in flight, or commits kept
    /// landing while this one fetched.
    Suppressed,
}

/// Host-side views whose data may be stale when navigated to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum View {
    Matches,
    Events,
    Conversation(MatchId),
    EventDetail(EventId),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncSummary {
    pub refreshed: Vec<CollectionKind>,
    pub suppressed: Vec<CollectionKind>,
    pub failed: Vec<CollectionKind>,
    pub recovered: Option<Interest>,
}

impl ResyncSummary {
    fn record(&mut self, kind: CollectionKind, result: Result<RefreshOutcome, DataError>) {
        match result {
            Ok(RefreshOutcome::Suppressed) => self.suppressed.push(kind),
            Ok(_) => self.refreshed.push(kind),
            Err(_) => self.failed.push(kind),
        }
    }
}

/// Fetches of a collection retried when a commit lands mid-fetch.
const MAX_REFRESH_ATTEMPTS: usize = 3;

/// Per-match latest-message queries in flight at once.
const LATEST_MESSAGE_CONCURRENCY: usize = 8;

fn not_found(what: &str, id: &str) -> DataError {
    DataError::new(DataErrorKind::NotFound, format!("{what} {id} is not visible to this user"))
}

struct RefreshTicket<'a> {
    guards: &'a Mutex<HashSet<CollectionKind>>,
    kind: CollectionKind,
}

impl Drop for RefreshTicket<'_> {
    fn drop(&mut self) {
        self.guards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.kind);
    }
}

pub struct RefreshScheduler {
    cache: Arc<CacheStore>,
    data: Arc<dyn DataService>,
    ingestion: Arc<IngestionManager>,
    controller: Arc<MutationController>,
    mirror: Option<Arc<ParticipationMirror>>,
    unread: Option<Arc<UnreadAggregator>>,
    actor: UserId,
    page_size: usize,
    load_more_delay: std::time::Duration,
    in_flight: Mutex<HashSet<CollectionKind>>,
    visible: AtomicBool,
}

impl RefreshScheduler {
    pub fn new(
        cache: Arc<CacheStore>,
        data: Arc<dyn DataService>,
        ingestion: Arc<IngestionManager>,
        controller: Arc<MutationController>,
        actor: UserId,
        config: &SyncConfig,
    ) -> Self {
        Self {
            cache,
            data,
            ingestion,
            controller,
            mirror: None,
            unread: None,
            actor,
            page_size: config.message_page_size,
            load_more_delay: config.load_more_delay(),
            in_flight: Mutex::new(HashSet::new()),
            visible: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn with_mirror(mut self, mirror: Arc<ParticipationMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    #[must_use]
    pub fn with_unread(mut self, unread: Arc<UnreadAggregator>) -> Self {
        self.unread = Some(unread);
        self
    }

    fn guards(&self) -> MutexGuard<'_, HashSet<CollectionKind>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_acquire(&self, kind: &CollectionKind) -> Option<RefreshTicket<'_>> {
        if !self.guards().insert(kind.clone()) {
            return None;
        }
        Some(RefreshTicket {
            guards: &self.in_flight,
            kind: kind.clone(),
        })
    }

    #[must_use]
    pub fn is_in_flight(&self, kind: &CollectionKind) -> bool {
        self.guards().contains(kind)
    }

    #[must_use]
    pub fn in_flight(&self) -> Vec<CollectionKind> {
        self.guards().iter().cloned().collect()
    }

    /// Re-fetches `kind` from the data service. Replaces whole collections;
    /// merges timelines.
    #[instrument(skip(self), fields(collection = %kind))]
    pub async fn refresh(&self, kind: CollectionKind) -> Result<RefreshOutcome, DataError> {
        let Some(_ticket) = self.try_acquire(&kind) else {
            debug!("refresh already in flight, suppressed");
            return Ok(RefreshOutcome::Suppressed);
        };
        let result = match &kind {
            CollectionKind::Matches => self.refresh_matches().await,
            CollectionKind::Events => self.refresh_events().await,
            CollectionKind::Messages(match_id) => self.refresh_messages(match_id).await,
            CollectionKind::Comments(event_id) => self.refresh_comments(event_id).await,
        };
        if let Err(e) = &result {
            warn!(error = %e, "refresh failed, keeping cached collection");
        }
        result
    }

    async fn refresh_matches(&self) -> Result<RefreshOutcome, DataError> {
        let kind = CollectionKind::Matches;
        for attempt in 1..=MAX_REFRESH_ATTEMPTS {
            let epoch = self.cache.commit_epoch(&kind);
            let records = self.fetch_matches().await?;
            let count = records.len();
            let Some(outcome) = self.cache.replace_collection_if(
                CollectionData::Matches(records),
                epoch,
                |state| self.controller.rebase_after_refresh(state, &kind),
            ) else {
                debug!(attempt, "match commit landed during fetch, refetching");
                continue;
            };
            info!(matches = count, "matches replaced");

            if outcome.selection_cleared {
                if let Some(Interest::Conversation(match_id)) = self.ingestion.current_interest() {
                    if self.cache.read(|s| s.match_by_id(&match_id).is_none()) {
                        self.drop_interest(&Interest::Conversation(match_id)).await;
                    }
                }
            }
            return Ok(RefreshOutcome::Replaced);
        }
        warn!("matches kept changing during refresh, keeping cached collection");
        Ok(RefreshOutcome::Suppressed)
    }

    async fn fetch_matches(&self) -> Result<Vec<MatchRecord>, DataError> {
        let rows = self
            .data
            .fetch(
                &Query::table(Table::Matches)
                    .filter(Filter::or(vec![
                        Filter::eq("user1_id", self.actor.as_str()),
                        Filter::eq("user2_id", self.actor.as_str()),
                    ]))
                    .filter(Filter::any_of(
                        "status",
                        [MatchStatus::Pending.as_str(), MatchStatus::Matched.as_str()],
                    ))
                    .order_by("created_at", false),
            )
            .await?;
        let mut records: Vec<MatchRecord> = decode_rows::<MatchRow>(Table::Matches, rows)?
            .into_iter()
            .map(MatchRecord::from_row)
            .collect();

        if !records.is_empty() {
            let profiles = self.fetch_profiles(&records).await?;
            let latest =
                fetch_latest_messages(self.data.as_ref(), records.iter().map(|r| r.id.clone()).collect::<Vec<_>>())
                    .await?;
            for record in &mut records {
                record.counterpart = profiles.get(record.counterpart_id(&self.actor)).cloned();
                record.last_message = latest.get(&record.id).map(MessageSummary::from);
            }
        }
        Ok(records)
    }

    async fn fetch_profiles(
        &self,
        records: &[MatchRecord],
    ) -> Result<HashMap<UserId, ProfileSummary>, DataError> {
        let ids: HashSet<&str> = records
            .iter()
            .map(|r| r.counterpart_id(&self.actor).as_str())
            .collect();
        let rows = self
            .data
            .fetch(&Query::table(Table::Profiles).filter(Filter::any_of("id", ids)))
            .await?;
        Ok(decode_rows::<ProfileSummary>(Table::Profiles, rows)?
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect())
    }

    async fn refresh_events(&self) -> Result<RefreshOutcome, DataError> {
        let kind = CollectionKind::Events;
        for attempt in 1..=MAX_REFRESH_ATTEMPTS {
            let epoch = self.cache.commit_epoch(&kind);
            let (records, participation) = self.fetch_events().await?;
            let count = records.len();
            let Some(outcome) = self.cache.replace_collection_if(
                CollectionData::Events {
                    events: records,
                    participation: participation.clone(),
                },
                epoch,
                |state| {
                    if let Some(mirror) = &self.mirror {
                        mirror.project(&participation);
                    }
                    self.controller.rebase_after_refresh(state, &kind);
                },
            ) else {
                debug!(attempt, "participation commit landed during fetch, refetching");
                continue;
            };
            info!(events = count, "events replaced");

            if outcome.selection_cleared {
                if let Some(Interest::EventComments(event_id)) = self.ingestion.current_interest() {
                    if self.cache.read(|s| s.event(&event_id).is_none()) {
                        self.drop_interest(&Interest::EventComments(event_id)).await;
                    }
                }
            }
            return Ok(RefreshOutcome::Replaced);
        }
        warn!("events kept changing during refresh, keeping cached collection");
        Ok(RefreshOutcome::Suppressed)
    }

    /// Events with counts and the actor's membership derived from the
    /// participant rows.
    async fn fetch_events(
        &self,
    ) -> Result<(Vec<EventRecord>, HashMap<EventId, bool>), DataError> {
        let rows = self
            .data
            .fetch(&Query::table(Table::Events).order_by("starts_at", true))
            .await?;
        let events: Vec<EventRow> = decode_rows(Table::Events, rows)?;

        let participants: Vec<ParticipantRow> = if events.is_empty() {
            Vec::new()
        } else {
            let rows = self
                .data
                .fetch(&Query::table(Table::EventParticipants).filter(Filter::any_of(
                    "event_id",
                    events.iter().map(|e| Value::from(e.id.as_str())),
                )))
                .await?;
            decode_rows(Table::EventParticipants, rows)?
        };

        let mut counts: HashMap<&EventId, u32> = HashMap::new();
        let mut mine: HashSet<&EventId> = HashSet::new();
        for row in &participants {
            *counts.entry(&row.event_id).or_default() += 1;
            if row.user_id == self.actor {
                mine.insert(&row.event_id);
            }
        }
        let participation: HashMap<EventId, bool> = events
            .iter()
            .map(|e| (e.id.clone(), mine.contains(&e.id)))
            .collect();
        let records: Vec<EventRecord> = events
            .iter()
            .map(|e| {
                let current = counts.get(&e.id).copied().unwrap_or(0);
                EventRecord::from_row(e.clone(), current)
            })
            .collect();
        debug!(participant_rows = participants.len(), "events fetched");
        Ok((records, participation))
    }

    /// Newest page first, then further back until a page overlaps what the
    /// cache already holds, so messages missed while disconnected are filled
    /// in rather than left as a gap.
    async fn refresh_messages(&self, match_id: &MatchId) -> Result<RefreshOutcome, DataError> {
        let known: HashSet<MessageId> = self
            .cache
            .read(|s| s.messages(match_id).iter().map(|m| m.id.clone()).collect());
        let mut cursor = None;
        let mut added = 0;
        loop {
            let (page, short) = self.fetch_message_page(match_id, cursor).await?;
            let overlaps = page.iter().any(|m| known.contains(&m.id));
            let next = page.last().map(|oldest| {
                let at = oldest.created_at;
                (at, page.iter().filter(|m| m.created_at == at).count())
            });
            added += self.merge_page(match_id, page, short);
            if short || overlaps || known.is_empty() {
                break;
            }
            let Some(next) = next else { break };
            debug!(added, "page does not reach cached history, paging back");
            cursor = Some(next);
        }
        Ok(RefreshOutcome::Merged(added))
    }

    /// One page of history, newest first. A cursor `(at, seen)` starts the
    /// page at `at` inclusive; `seen` entries stamped `at` are already held,
    /// so the limit grows by that much. Returns whether the page came back
    /// short, which means nothing older remains.
    async fn fetch_message_page(
        &self,
        match_id: &MatchId,
        cursor: Option<(UnixTimeMs, usize)>,
    ) -> Result<(Vec<MessageRecord>, bool), DataError> {
        let mut query = Query::table(Table::Messages)
            .filter(Filter::eq("match_id", match_id.as_str()))
            .order_by("created_at", false);
        let mut limit = self.page_size;
        if let Some((at, seen)) = cursor {
            query = query.filter(Filter::lte("created_at", at.as_millis()));
            limit = limit.saturating_add(seen);
        }
        let limit = limit.min(MAX_QUERY_LIMIT);
        let rows = self.data.fetch(&query.limit(limit)).await?;
        let page: Vec<MessageRecord> = decode_rows(Table::Messages, rows)?;
        let short = page.len() < limit;
        Ok((page, short))
    }

    async fn refresh_comments(&self, event_id: &EventId) -> Result<RefreshOutcome, DataError> {
        let query = Query::table(Table::EventComments)
            .filter(Filter::eq("event_id", event_id.as_str()))
            .order_by("created_at", true)
            .limit(MAX_QUERY_LIMIT);
        let page: Vec<CommentRecord> =
            decode_rows(Table::EventComments, self.data.fetch(&query).await?)?;
        Ok(RefreshOutcome::Merged(
            self.cache.merge_comments(event_id, page),
        ))
    }

    fn merge_page(&self, match_id: &MatchId, page: Vec<MessageRecord>, short: bool) -> usize {
        let added = self.cache.write(|state| {
            let added = state.merge_messages(match_id, page);
            if short {
                state.mark_messages_exhausted(match_id);
            }
            added
        });
        self.cache
            .notify_loaded(CollectionKind::Messages(match_id.clone()));
        added
    }

    /// Loads the page of messages older than the oldest cached one. Shares
    /// the conversation's in-flight ticket with [`Self::refresh`].
    #[instrument(skip(self), fields(match_id = %match_id))]
    pub async fn load_older_messages(
        &self,
        match_id: &MatchId,
    ) -> Result<RefreshOutcome, DataError> {
        let kind = CollectionKind::Messages(match_id.clone());
        let Some(_ticket) = self.try_acquire(&kind) else {
            return Ok(RefreshOutcome::Suppressed);
        };
        let (cursor, has_older) = self.cache.read(|s| {
            let cursor = s
                .oldest_message_at(match_id)
                .map(|at| (at, s.messages_at(match_id, at)));
            (cursor, s.has_older_messages(match_id))
        });
        let Some(cursor) = cursor else {
            return self.refresh_messages(match_id).await;
        };
        if !has_older {
            debug!("conversation history exhausted");
            return Ok(RefreshOutcome::Merged(0));
        }

        if !self.load_more_delay.is_zero() {
            tokio::time::sleep(self.load_more_delay).await;
        }

        let (page, short) = match self.fetch_message_page(match_id, Some(cursor)).await {
            Ok(page) => page,
            Err(e) => {
                warn!(error = %e, "loading older messages failed");
                return Err(e);
            }
        };
        Ok(RefreshOutcome::Merged(self.merge_page(match_id, page, short)))
    }

    async fn drop_interest(&self, interest: &Interest) {
        if let Err(e) = self.ingestion.clear_interest_if(interest).await {
            warn!(interest = ?interest, error = %e, "failed to drop interest");
        }
    }

    // --- lifecycle triggers ---

    /// Returns whether the change triggered a resync (hidden to visible only).
    pub async fn on_visibility_change(&self, visible: bool) -> Option<ResyncSummary> {
        let was_visible = self.visible.swap(visible, Ordering::SeqCst);
        if visible && !was_visible {
            Some(self.resync(Trigger::Visibility).await)
        } else {
            None
        }
    }

    pub async fn on_focus(&self) -> ResyncSummary {
        self.resync(Trigger::Focus).await
    }

    /// Full reconciliation: both authoritative collections, a stale realtime
    /// interest and an unread pass.
    #[instrument(skip(self))]
    pub async fn resync(&self, trigger: Trigger) -> ResyncSummary {
        let mut summary = ResyncSummary::default();
        for kind in [CollectionKind::Matches, CollectionKind::Events] {
            let result = self.refresh(kind.clone()).await;
            summary.record(kind, result);
        }

        if let Some(interest) = self.ingestion.recover().await {
            info!(interest = ?interest, "recovered realtime interest");
            let kind = interest.collection();
            let result = self.refresh(kind.clone()).await;
            summary.record(kind, result);
            summary.recovered = Some(interest);
        }

        if let Some(unread) = &self.unread {
            unread.run_once().await;
        }
        debug!(?summary, "resync finished");
        summary
    }

    /// Selects what `view` shows, rebinds the realtime interest and refreshes
    /// the view's data.
    #[instrument(skip(self))]
    pub async fn on_navigate(&self, view: View) -> Result<RefreshOutcome, DataError> {
        match view {
            View::Matches => self.refresh(CollectionKind::Matches).await,
            View::Events => self.refresh(CollectionKind::Events).await,
            View::Conversation(match_id) => {
                if !self.cache.write(|s| s.select_match(Some(&match_id))) {
                    self.refresh(CollectionKind::Matches).await?;
                    if !self.cache.write(|s| s.select_match(Some(&match_id))) {
                        return Err(not_found("match", match_id.as_str()));
                    }
                }
                self.bind(Interest::Conversation(match_id)).await
            }
            View::EventDetail(event_id) => {
                if !self.cache.write(|s| s.select_event(Some(&event_id))) {
                    self.refresh(CollectionKind::Events).await?;
                    if !self.cache.write(|s| s.select_event(Some(&event_id))) {
                        return Err(not_found("event", event_id.as_str()));
                    }
                }
                self.bind(Interest::EventComments(event_id)).await
            }
        }
    }

    async fn bind(&self, interest: Interest) -> Result<RefreshOutcome, DataError> {
        if let Err(e) = self.ingestion.set_interest(Some(interest.clone())).await {
            warn!(interest = ?interest, error = %e, "realtime unavailable, showing fetched data only");
        }
        self.refresh(interest.collection()).await
    }

    pub async fn deselect_match(&self) {
        let previous = self.cache.read(|s| s.selected_match().cloned());
        self.cache.write(|s| s.select_match(None));
        if let Some(match_id) = previous {
            self.drop_interest(&Interest::Conversation(match_id)).await;
        }
    }

    pub async fn deselect_event(&self) {
        let previous = self.cache.read(|s| s.selected_event().cloned());
        self.cache.write(|s| s.select_event(None));
        if let Some(event_id) = previous {
            self.drop_interest(&Interest::EventComments(event_id)).await;
        }
    }

    /// Refreshes whatever the payload invalidates.
    #[cfg(feature = "push")]
    #[instrument(skip(self))]
    pub async fn on_push(&self, payload: &PushPayload) -> ResyncSummary {
        let mut summary = ResyncSummary::default();
        for kind in payload.stale_collections() {
            if let CollectionKind::Messages(id) = &kind {
                if self.ingestion.current_interest() != Some(Interest::Conversation(id.clone())) {
                    continue;
                }
            }
            let result = self.refresh(kind.clone()).await;
            summary.record(kind, result);
        }
        if payload.affects_unread() {
            if let Some(unread) = &self.unread {
                unread.run_once().await;
            }
        }
        summary
    }
}

/// The newest message of each match, one `limit(1)` query per match with a
/// few in flight at a time.
pub(crate) async fn fetch_latest_messages(
    data: &dyn DataService,
    match_ids: impl IntoIterator<Item = MatchId>,
) -> Result<HashMap<MatchId, MessageRecord>, DataError> {
    let results: Vec<Result<Option<MessageRecord>, DataError>> = stream::iter(match_ids)
        .map(move |match_id| async move {
            let query = Query::table(Table::Messages)
                .filter(Filter::eq("match_id", match_id.as_str()))
                .order_by("created_at", false)
                .limit(1);
            let rows = data.fetch(&query).await?;
            let latest = decode_rows::<MessageRecord>(Table::Messages, rows)?;
            Ok::<_, DataError>(latest.into_iter().next())
        })
        .buffer_unordered(LATEST_MESSAGE_CONCURRENCY)
        .collect()
        .await;

    let mut latest = HashMap::new();
    for message in results {
        if let Some(message) = message? {
            latest.insert(message.match_id.clone(), message);
        }
    }
    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{DataOp, MemoryDataService, MemoryEventBus};
    use serde_json::json;

    struct Fixture {
        cache: Arc<CacheStore>,
        data: Arc<MemoryDataService>,
        bus: Arc<MemoryEventBus>,
        scheduler: Arc<RefreshScheduler>,
    }

    fn fixture() -> Fixture {
        fixture_with(SyncConfig::default())
    }

    fn fixture_with(config: SyncConfig) -> Fixture {
        let bus = Arc::new(MemoryEventBus::new());
        let data = Arc::new(MemoryDataService::with_bus(Arc::clone(&bus)));
        let cache = Arc::new(CacheStore::new());
        let actor = UserId::new("alice");
        let service: Arc<dyn DataService> = Arc::clone(&data) as Arc<dyn DataService>;
        let ingestion = Arc::new(IngestionManager::new(
            Arc::clone(&cache),
            Arc::clone(&bus) as Arc<dyn crate::capabilities::EventBus>,
        ));
        let controller = Arc::new(MutationController::new(
            Arc::clone(&cache),
            Arc::clone(&service),
            actor.clone(),
            &config,
        ));
        let scheduler = Arc::new(RefreshScheduler::new(
            Arc::clone(&cache),
            service,
            ingestion,
            controller,
            actor,
            &config,
        ));
        Fixture {
            cache,
            data,
            bus,
            scheduler,
        }
    }

    fn seed_matches(data: &MemoryDataService) {
        data.seed(
            Table::Matches,
            [
                json!({"id": "m1", "user1_id": "alice", "user2_id": "bob", "status": "matched", "created_at": 1}),
                json!({"id": "m2", "user1_id": "carol", "user2_id": "alice", "status": "pending", "created_at": 2}),
                json!({"id": "m3", "user1_id": "alice", "user2_id": "dave", "status": "rejected", "created_at": 3}),
                json!({"id": "m4", "user1_id": "bob", "user2_id": "erin", "status": "matched", "created_at": 4}),
            ],
        );
        data.seed(
            Table::Profiles,
            [
                json!({"id": "bob", "display_name": "Bob"}),
                json!({"id": "carol", "display_name": "Carol", "avatar_url": "c.png"}),
            ],
        );
        data.seed(
            Table::Messages,
            [
                json!({"id": "x1", "match_id": "m1", "sender_id": "bob", "content": "first", "created_at": 10}),
                json!({"id": "x2", "match_id": "m1", "sender_id": "alice", "content": "second", "created_at": 20}),
            ],
        );
    }

    fn seed_events(data: &MemoryDataService) {
        data.seed(
            Table::Events,
            [
                json!({"id": "e1", "title": "Picnic", "creator_id": "bob", "created_at": 1, "starts_at": 100, "max_participants": 10}),
                json!({"id": "e2", "title": "Hike", "creator_id": "carol", "created_at": 2, "starts_at": 50, "max_participants": 2}),
            ],
        );
        data.seed(
            Table::EventParticipants,
            [
                json!({"id": "e1:alice", "event_id": "e1", "user_id": "alice", "joined_at": 5}),
                json!({"id": "e1:bob", "event_id": "e1", "user_id": "bob", "joined_at": 6}),
                json!({"id": "e2:carol", "event_id": "e2", "user_id": "carol", "joined_at": 7}),
            ],
        );
    }

    #[tokio::test]
    async fn test_matches_refresh_denormalizes() {
        let fx = fixture();
        seed_matches(&fx.data);

        let outcome = fx.scheduler.refresh(CollectionKind::Matches).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Replaced);

        let matches = fx.cache.read(|s| s.matches().to_vec());
        let ids: Vec<&str> = matches.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m1"]);
        let m1 = &matches[1];
        assert_eq!(m1.counterpart.as_ref().unwrap().display_name, "Bob");
        assert_eq!(m1.last_message.as_ref().unwrap().preview, "second");
        assert_eq!(matches[0].counterpart.as_ref().unwrap().avatar_url.as_deref(), Some("c.png"));
        assert!(fx.cache.is_loaded(&CollectionKind::Matches));
    }

    #[tokio::test]
    async fn test_quiet_match_keeps_summary_behind_busy_one() {
        let fx = fixture();
        seed_matches(&fx.data);
        fx.data.seed(
            Table::Matches,
            [json!({"id": "m5", "user1_id": "alice", "user2_id": "frank", "status": "matched", "created_at": 5})],
        );
        fx.data.seed(
            Table::Messages,
            (0..MAX_QUERY_LIMIT).map(|n| {
                json!({"id": format!("f{n}"), "match_id": "m5", "sender_id": "frank", "content": "again", "created_at": 100 + n})
            }),
        );

        fx.scheduler.refresh(CollectionKind::Matches).await.unwrap();
        fx.cache.read(|s| {
            let m1 = s.match_by_id(&MatchId::new("m1")).unwrap();
            assert_eq!(m1.last_message.as_ref().unwrap().preview, "second");
            let m5 = s.match_by_id(&MatchId::new("m5")).unwrap();
            assert_eq!(
                m5.last_message.as_ref().unwrap().message_id.as_str(),
                format!("f{}", MAX_QUERY_LIMIT - 1)
            );
        });
    }

    #[tokio::test]
    async fn test_events_refresh_derives_counts_and_membership() {
        let fx = fixture();
        seed_events(&fx.data);

        fx.scheduler.refresh(CollectionKind::Events).await.unwrap();
        fx.cache.read(|s| {
            let ids: Vec<&str> = s.events().iter().map(|e| e.id.as_str()).collect();
            assert_eq!(ids, vec!["e2", "e1"]);
            assert_eq!(s.event(&EventId::new("e1")).unwrap().current_participants, 2);
            assert_eq!(s.event(&EventId::new("e2")).unwrap().current_participants, 1);
            assert_eq!(s.participation(&EventId::new("e1")), Some(true));
            assert_eq!(s.participation(&EventId::new("e2")), Some(false));
        });
    }

    #[tokio::test]
    async fn test_concurrent_refresh_is_suppressed() {
        let fx = fixture();
        seed_matches(&fx.data);
        fx.data.hold(DataOp::Fetch, Table::Matches);

        let first = tokio::spawn({
            let scheduler = Arc::clone(&fx.scheduler);
            async move { scheduler.refresh(CollectionKind::Matches).await }
        });
        tokio::task::yield_now().await;
        assert!(fx.scheduler.is_in_flight(&CollectionKind::Matches));

        let second = fx.scheduler.refresh(CollectionKind::Matches).await.unwrap();
        assert_eq!(second, RefreshOutcome::Suppressed);

        fx.data.release(DataOp::Fetch, Table::Matches);
        assert_eq!(first.await.unwrap().unwrap(), RefreshOutcome::Replaced);
        assert_eq!(fx.data.calls(DataOp::Fetch, Table::Matches), 1);
        assert_eq!(fx.cache.revisions().matches, 1);
        assert!(!fx.scheduler.is_in_flight(&CollectionKind::Matches));
    }

    #[tokio::test]
    async fn test_failure_keeps_collection_and_releases_guard() {
        let fx = fixture();
        seed_matches(&fx.data);
        fx.scheduler.refresh(CollectionKind::Matches).await.unwrap();

        fx.data
            .fail_next(DataOp::Fetch, Table::Matches, DataError::network("offline"));
        assert!(fx.scheduler.refresh(CollectionKind::Matches).await.is_err());
        assert_eq!(fx.cache.read(|s| s.matches().len()), 2);
        assert!(!fx.scheduler.is_in_flight(&CollectionKind::Matches));
    }

    #[tokio::test]
    async fn test_cancelled_refresh_releases_guard() {
        let fx = fixture();
        fx.data.hold(DataOp::Fetch, Table::Events);
        let task = tokio::spawn({
            let scheduler = Arc::clone(&fx.scheduler);
            async move { scheduler.refresh(CollectionKind::Events).await }
        });
        tokio::task::yield_now().await;
        assert!(fx.scheduler.is_in_flight(&CollectionKind::Events));

        task.abort();
        let _ = task.await;
        assert!(!fx.scheduler.is_in_flight(&CollectionKind::Events));
    }

    #[tokio::test]
    async fn test_visibility_only_triggers_after_hidden() {
        let fx = fixture();
        assert!(fx.scheduler.on_visibility_change(true).await.is_none());
        assert!(fx.scheduler.on_visibility_change(false).await.is_none());

        let summary = fx.scheduler.on_visibility_change(true).await.unwrap();
        assert_eq!(
            summary.refreshed,
            vec![CollectionKind::Matches, CollectionKind::Events]
        );
        assert_eq!(fx.data.calls(DataOp::Fetch, Table::Matches), 1);
    }

    #[tokio::test]
    async fn test_conversation_navigation_binds_interest_and_pages() {
        let fx = fixture_with(SyncConfig {
            message_page_size: 2,
            ..SyncConfig::default()
        });
        seed_matches(&fx.data);
        fx.data.seed(
            Table::Messages,
            [json!({"id": "x0", "match_id": "m1", "sender_id": "bob", "content": "zeroth", "created_at": 5})],
        );
        fx.scheduler.refresh(CollectionKind::Matches).await.unwrap();

        let outcome = fx
            .scheduler
            .on_navigate(View::Conversation(MatchId::new("m1")))
            .await
            .unwrap();
        assert_eq!(outcome, RefreshOutcome::Merged(2));
        assert_eq!(fx.bus.live_subscriptions(), 1);

        let m1 = MatchId::new("m1");
        assert!(fx.cache.read(|s| s.has_older_messages(&m1)));
        let older = fx.scheduler.load_older_messages(&m1).await.unwrap();
        assert_eq!(older, RefreshOutcome::Merged(1));
        fx.cache.read(|s| {
            let ids: Vec<&str> = s.messages(&m1).iter().map(|m| m.id.as_str()).collect();
            assert_eq!(ids, vec!["x0", "x1", "x2"]);
            assert!(!s.has_older_messages(&m1));
        });
        assert_eq!(
            fx.scheduler.load_older_messages(&m1).await.unwrap(),
            RefreshOutcome::Merged(0)
        );
    }

    #[tokio::test]
    async fn test_vanished_selection_drops_interest() {
        let fx = fixture();
        seed_matches(&fx.data);
        fx.scheduler.refresh(CollectionKind::Matches).await.unwrap();
        fx.scheduler
            .on_navigate(View::Conversation(MatchId::new("m1")))
            .await
            .unwrap();
        assert_eq!(fx.bus.live_subscriptions(), 1);

        fx.data
            .update(Table::Matches, "m1", {
                let mut patch = crate::capabilities::Patch::new();
                patch.insert("status".into(), json!("rejected"));
                patch
            })
            .await
            .unwrap();
        fx.scheduler.refresh(CollectionKind::Matches).await.unwrap();

        assert_eq!(fx.cache.read(|s| s.selected_match().cloned()), None);
        assert_eq!(fx.bus.live_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_focus_recovers_stale_interest() {
        let fx = fixture();
        seed_matches(&fx.data);
        fx.scheduler
            .on_navigate(View::Conversation(MatchId::new("m1")))
            .await
            .unwrap();
        fx.bus.disconnect_all();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        let summary = fx.scheduler.on_focus().await;
        assert_eq!(
            summary.recovered,
            Some(Interest::Conversation(MatchId::new("m1")))
        );
        assert!(summary
            .refreshed
            .contains(&CollectionKind::Messages(MatchId::new("m1"))));
        assert_eq!(fx.bus.live_subscriptions(), 1);
    }
}
