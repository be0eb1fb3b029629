//! Engine facade.
//!
//! Wires every component around one shared [`CacheStore`] and exposes what a
//! host shell needs: action dispatchers, lifecycle entry points and a
//! serializable [`ViewModel`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, instrument, warn};

use crate::cache::{CacheStore, CollectionKind, Revisions};
use crate::capabilities::Capabilities;
use crate::config::SyncConfig;
use crate::deep_link::{DeepLinkOutcome, DeepLinkResolver};
use crate::ids::{EventId, MatchId, UserId};
use crate::ingestion::{IngestionManager, IngestionStatus};
use crate::model::{
    CommentRecord, EventRecord, MatchRecord, MessageRecord, UnreadCounters,
};
use crate::offline_store::ParticipationMirror;
use crate::optimistic::{MutationController, MutationError};
use crate::refresh::{RefreshOutcome, RefreshScheduler, ResyncSummary, Trigger, View};
use crate::unread::{UnreadAggregator, UnreadTask};
use crate::{get_current_time_ms, AppError, AppResult, ErrorSeverity, ToastKind, ToastMessage};

#[cfg(feature = "push")]
use crate::capabilities::PushPayload;
#[cfg(feature = "push")]
use crate::ErrorKind;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserFacingError {
    pub message: String,
    pub is_transient: bool,
    pub is_retryable: bool,
    pub error_code: String,
}

impl From<&AppError> for UserFacingError {
    fn from(e: &AppError) -> Self {
        Self {
            message: e.user_facing_message(),
            is_transient: e.severity == ErrorSeverity::Transient,
            is_retryable: e.is_retryable(),
            error_code: e.code().to_string(),
        }
    }
}

/// Everything the host renders, copied out of the engine in one pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ViewModel {
    pub actor: UserId,
    pub matches: Vec<MatchRecord>,
    pub events: Vec<EventRecord>,
    pub participation: BTreeMap<EventId, bool>,
    pub selected_match: Option<MatchId>,
    pub selected_messages: Vec<MessageRecord>,
    pub has_older_messages: bool,
    pub selected_event: Option<EventId>,
    pub selected_comments: Vec<CommentRecord>,
    pub unread: UnreadCounters,
    pub matches_loaded: bool,
    pub events_loaded: bool,
    pub is_loading: bool,
    pub refreshing: Vec<CollectionKind>,
    pub pending_mutations: Vec<String>,
    pub realtime: IngestionStatus,
    pub active_error: Option<UserFacingError>,
    pub toast: Option<ToastMessage>,
    pub revisions: Revisions,
}

#[derive(Default)]
struct Feedback {
    active_error: Option<AppError>,
    toast: Option<ToastMessage>,
}

pub struct SyncEngine {
    actor: UserId,
    cache: Arc<CacheStore>,
    controller: Arc<MutationController>,
    ingestion: Arc<IngestionManager>,
    scheduler: Arc<RefreshScheduler>,
    unread: Arc<UnreadAggregator>,
    deep_links: DeepLinkResolver,
    unread_task: Mutex<Option<UnreadTask>>,
    feedback: Mutex<Feedback>,
}

impl SyncEngine {
    /// Builds the engine and paints the persisted participation mirror.
    /// Nothing touches the network until [`Self::start`].
    pub fn new(actor: UserId, caps: Capabilities, config: SyncConfig) -> AppResult<Self> {
        config.validate()?;

        let cache = Arc::new(CacheStore::new());
        let mirror = Arc::new(ParticipationMirror::new(
            Arc::clone(&caps.storage),
            actor.clone(),
        )?);
        let painted = cache.write(|state| state.hydrate_participation(mirror.hydrate()));

        let controller = Arc::new(
            MutationController::new(
                Arc::clone(&cache),
                Arc::clone(&caps.data),
                actor.clone(),
                &config,
            )
            .with_mirror(Arc::clone(&mirror)),
        );
        let ingestion = Arc::new(IngestionManager::new(
            Arc::clone(&cache),
            Arc::clone(&caps.bus),
        ));
        let unread = Arc::new(UnreadAggregator::new(
            Arc::clone(&cache),
            Arc::clone(&caps.data),
            actor.clone(),
            &config,
        ));
        let scheduler = Arc::new(
            RefreshScheduler::new(
                Arc::clone(&cache),
                Arc::clone(&caps.data),
                Arc::clone(&ingestion),
                Arc::clone(&controller),
                actor.clone(),
                &config,
            )
            .with_mirror(mirror)
            .with_unread(Arc::clone(&unread)),
        );
        let deep_links = DeepLinkResolver::new(Arc::clone(&cache), actor.clone(), &config);

        info!(actor = %actor, painted, "sync engine created");
        Ok(Self {
            actor,
            cache,
            controller,
            ingestion,
            scheduler,
            unread,
            deep_links,
            unread_task: Mutex::new(None),
            feedback: Mutex::new(Feedback::default()),
        })
    }

    fn feedback(&self) -> MutexGuard<'_, Feedback> {
        self.feedback.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn actor(&self) -> &UserId {
        &self.actor
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// Initial load plus the periodic unread loop. Must run inside a tokio
    /// runtime.
    #[instrument(skip(self), fields(actor = %self.actor))]
    pub async fn start(&self) -> ResyncSummary {
        {
            let mut task = self.unread_task.lock().unwrap_or_else(PoisonError::into_inner);
            if task.is_none() {
                *task = Some(self.unread.spawn_periodic());
            }
        }
        self.scheduler.resync(Trigger::Manual).await
    }

    /// Stops polling and drops the realtime subscription.
    pub async fn stop(&self) {
        self.unread_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Err(e) = self.ingestion.set_interest(None).await {
            warn!(error = %e, "failed to drop realtime interest on stop");
        }
    }

    /// Records a failed action for the view: active error plus an error toast.
    fn surface<T>(&self, result: Result<T, MutationError>) -> AppResult<T> {
        result.map_err(|e| {
            let error = AppError::from(e);
            warn!(code = error.code(), error = %error, "action failed");
            let mut feedback = self.feedback();
            feedback.toast = Some(ToastMessage::new(
                error.user_facing_message(),
                ToastKind::Error,
            ));
            feedback.active_error = Some(error.clone());
            error
        })
    }

    // --- actions ---

    pub async fn join_event(&self, event_id: &EventId) -> AppResult<bool> {
        self.surface(self.controller.join_event(event_id).await)
    }

    pub async fn leave_event(&self, event_id: &EventId) -> AppResult<bool> {
        self.surface(self.controller.leave_event(event_id).await)
    }

    pub async fn toggle_participation(&self, event_id: &EventId) -> AppResult<bool> {
        self.surface(self.controller.toggle_participation(event_id).await)
    }

    pub async fn send_message(&self, match_id: &MatchId, content: &str) -> AppResult<MessageRecord> {
        self.surface(self.controller.send_message(match_id, content).await)
    }

    pub async fn create_match(&self, counterpart: &UserId) -> AppResult<MatchRecord> {
        self.surface(self.controller.create_match(counterpart).await)
    }

    pub async fn accept_match(&self, match_id: &MatchId) -> AppResult<()> {
        self.surface(self.controller.accept_match(match_id).await)
    }

    pub async fn reject_match(&self, match_id: &MatchId) -> AppResult<()> {
        self.surface(self.controller.reject_match(match_id).await)
    }

    pub fn dismiss_error(&self) {
        let mut feedback = self.feedback();
        feedback.active_error = None;
        feedback.toast = None;
    }

    // --- selection and lifecycle ---

    pub async fn select_match(&self, match_id: Option<&MatchId>) -> AppResult<()> {
        match match_id {
            Some(id) => {
                self.scheduler
                    .on_navigate(View::Conversation(id.clone()))
                    .await?;
            }
            None => self.scheduler.deselect_match().await,
        }
        Ok(())
    }

    pub async fn select_event(&self, event_id: Option<&EventId>) -> AppResult<()> {
        match event_id {
            Some(id) => {
                self.scheduler
                    .on_navigate(View::EventDetail(id.clone()))
                    .await?;
            }
            None => self.scheduler.deselect_event().await,
        }
        Ok(())
    }

    pub async fn on_navigate(&self, view: View) -> AppResult<RefreshOutcome> {
        Ok(self.scheduler.on_navigate(view).await?)
    }

    pub async fn on_visibility_change(&self, visible: bool) -> Option<ResyncSummary> {
        self.scheduler.on_visibility_change(visible).await
    }

    pub async fn on_focus(&self) -> ResyncSummary {
        self.scheduler.on_focus().await
    }

    pub async fn load_older_messages(&self, match_id: &MatchId) -> AppResult<RefreshOutcome> {
        Ok(self.scheduler.load_older_messages(match_id).await?)
    }

    pub async fn refresh_unread(&self) -> UnreadCounters {
        self.unread.run_once().await
    }

    /// Resolves an entry-context reference to a conversation. Waits for the
    /// match list if it has not loaded yet, so hosts usually spawn this.
    pub async fn open_deep_link(&self, counterpart: &UserId) -> DeepLinkOutcome {
        let outcome = self.deep_links.resolve(counterpart).await;
        if let DeepLinkOutcome::Selected(match_id) = &outcome {
            if let Err(e) = self.select_match(Some(match_id)).await {
                warn!(match_id = %match_id, error = %e, "deep-linked conversation failed to load");
            }
        }
        outcome
    }

    /// Routes a raw push payload onto refreshes.
    #[cfg(feature = "push")]
    pub async fn handle_push(&self, raw: &str) -> AppResult<ResyncSummary> {
        let payload = PushPayload::from_json(raw)
            .map_err(|e| AppError::new(ErrorKind::Deserialization, e.to_string()))?;
        Ok(self.scheduler.on_push(&payload).await)
    }

    // --- view ---

    #[must_use]
    pub fn view(&self) -> ViewModel {
        let snapshot = self.cache.snapshot();
        let has_older_messages = snapshot
            .selected_match
            .as_ref()
            .is_some_and(|id| self.cache.read(|s| s.has_older_messages(id)));

        let mut refreshing = self.scheduler.in_flight();
        refreshing.sort_by_key(|k| k.to_string());
        let mut pending_mutations: Vec<String> = self
            .controller
            .in_flight()
            .iter()
            .map(ToString::to_string)
            .collect();
        pending_mutations.sort();

        let (active_error, toast) = {
            let feedback = self.feedback();
            let now = get_current_time_ms();
            (
                feedback.active_error.as_ref().map(UserFacingError::from),
                feedback.toast.clone().filter(|t| !t.is_expired(now)),
            )
        };

        ViewModel {
            actor: self.actor.clone(),
            matches: snapshot.matches,
            events: snapshot.events,
            participation: snapshot.participation.into_iter().collect(),
            selected_match: snapshot.selected_match,
            selected_messages: snapshot.selected_messages,
            has_older_messages,
            selected_event: snapshot.selected_event,
            selected_comments: snapshot.selected_comments,
            unread: snapshot.unread,
            matches_loaded: snapshot.matches_loaded,
            events_loaded: snapshot.events_loaded,
            is_loading: !refreshing.is_empty(),
            refreshing,
            pending_mutations,
            realtime: self.ingestion.status(),
            active_error,
            toast,
            revisions: snapshot.revisions,
        }
    }
}
