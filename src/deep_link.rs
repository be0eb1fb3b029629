//! Deep-link resolution.
//!
//! An entry context may name a counterpart; the matching conversation is
//! selected once the match list is loaded. Each reference is acted on at
//! most once, whether it resolves or not.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheStore, CollectionKind};
use crate::config::SyncConfig;
use crate::ids::{MatchId, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeepLinkOutcome {
    Selected(MatchId),
    /// The same reference was handled before.
    AlreadyProcessed,
    /// Another resolution is running.
    Busy,
    /// No match with that counterpart after the attempt budget.
    Abandoned,
}

struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct DeepLinkResolver {
    cache: Arc<CacheStore>,
    actor: UserId,
    max_attempts: u32,
    processing: AtomicBool,
    processed: Mutex<LruCache<UserId, ()>>,
}

impl DeepLinkResolver {
    pub fn new(cache: Arc<CacheStore>, actor: UserId, config: &SyncConfig) -> Self {
        let capacity =
            NonZeroUsize::new(config.processed_link_memory).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache,
            actor,
            max_attempts: config.deep_link_max_attempts,
            processing: AtomicBool::new(false),
            processed: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn processed(&self) -> MutexGuard<'_, LruCache<UserId, ()>> {
        self.processed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn was_processed(&self, counterpart: &UserId) -> bool {
        self.processed().contains(counterpart)
    }

    /// Selects the match with `counterpart`, waiting for up to
    /// `max_attempts` match-list loads if it is not there yet.
    #[instrument(skip(self), fields(counterpart = %counterpart))]
    pub async fn resolve(&self, counterpart: &UserId) -> DeepLinkOutcome {
        if self.was_processed(counterpart) {
            debug!("deep link already processed");
            return DeepLinkOutcome::AlreadyProcessed;
        }
        if self.processing.swap(true, Ordering::SeqCst) {
            debug!("deep link resolution already running");
            return DeepLinkOutcome::Busy;
        }
        let _processing = ProcessingGuard(&self.processing);

        // Subscribe before the first check so a load in between is not missed.
        let mut loaded = self.cache.subscribe_loaded();
        let mut attempts = 0;
        let outcome = loop {
            if let Some(match_id) = self.try_select(counterpart) {
                break DeepLinkOutcome::Selected(match_id);
            }
            if attempts >= self.max_attempts {
                break DeepLinkOutcome::Abandoned;
            }
            match loaded.recv().await {
                Ok(CollectionKind::Matches) => attempts += 1,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "loaded notifications lagged");
                    attempts += 1;
                }
                Err(RecvError::Closed) => break DeepLinkOutcome::Abandoned,
            }
        };

        self.processed().put(counterpart.clone(), ());
        match &outcome {
            DeepLinkOutcome::Selected(match_id) => info!(match_id = %match_id, "deep link resolved"),
            _ => warn!(attempts, "deep link abandoned"),
        }
        outcome
    }

    fn try_select(&self, counterpart: &UserId) -> Option<MatchId> {
        self.cache.write(|state| {
            if !state.is_loaded(&CollectionKind::Matches) {
                return None;
            }
            let match_id = state.match_for_pair(&self.actor, counterpart)?.id.clone();
            state.select_match(Some(&match_id)).then_some(match_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CollectionData;
    use crate::model::{MatchRecord, MatchRow, MatchStatus};
    use crate::UnixTimeMs;

    fn record(id: &str, a: &str, b: &str) -> MatchRecord {
        MatchRecord::from_row(MatchRow {
            id: MatchId::new(id),
            user1_id: UserId::new(a),
            user2_id: UserId::new(b),
            status: MatchStatus::Matched,
            created_at: UnixTimeMs(1),
        })
    }

    fn resolver(cache: &Arc<CacheStore>) -> Arc<DeepLinkResolver> {
        Arc::new(DeepLinkResolver::new(
            Arc::clone(cache),
            UserId::new("alice"),
            &SyncConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_resolves_loaded_match_once() {
        let cache = Arc::new(CacheStore::new());
        cache.replace_collection(CollectionData::Matches(vec![record("m1", "bob", "alice")]));
        let resolver = resolver(&cache);

        assert_eq!(
            resolver.resolve(&UserId::new("bob")).await,
            DeepLinkOutcome::Selected(MatchId::new("m1"))
        );
        assert_eq!(cache.read(|s| s.selected_match().cloned()), Some(MatchId::new("m1")));

        cache.write(|s| s.select_match(None));
        assert_eq!(
            resolver.resolve(&UserId::new("bob")).await,
            DeepLinkOutcome::AlreadyProcessed
        );
        assert_eq!(cache.read(|s| s.selected_match().cloned()), None);
    }

    #[tokio::test]
    async fn test_waits_for_load() {
        let cache = Arc::new(CacheStore::new());
        let resolver = resolver(&cache);
        let task = tokio::spawn({
            let resolver = Arc::clone(&resolver);
            async move { resolver.resolve(&UserId::new("bob")).await }
        });
        tokio::task::yield_now().await;
        assert!(resolver.is_processing());
        assert_eq!(
            resolver.resolve(&UserId::new("carol")).await,
            DeepLinkOutcome::Busy
        );

        cache.replace_collection(CollectionData::Matches(vec![record("m1", "alice", "bob")]));
        assert_eq!(
            task.await.unwrap(),
            DeepLinkOutcome::Selected(MatchId::new("m1"))
        );
        assert!(!resolver.is_processing());
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let cache = Arc::new(CacheStore::new());
        let resolver = resolver(&cache);
        let task = tokio::spawn({
            let resolver = Arc::clone(&resolver);
            async move { resolver.resolve(&UserId::new("zed")).await }
        });
        tokio::task::yield_now().await;
        for _ in 0..3 {
            cache.replace_collection(CollectionData::Matches(vec![record("m1", "alice", "bob")]));
            tokio::task::yield_now().await;
        }
        assert_eq!(task.await.unwrap(), DeepLinkOutcome::Abandoned);
        assert!(resolver.was_processed(&UserId::new("zed")));
        assert_eq!(
            resolver.resolve(&UserId::new("zed")).await,
            DeepLinkOutcome::AlreadyProcessed
        );
    }

    #[test]
    fn test_processed_memory_is_bounded() {
        let cache = Arc::new(CacheStore::new());
        let config = SyncConfig {
            processed_link_memory: 2,
            ..SyncConfig::default()
        };
        let resolver = DeepLinkResolver::new(cache, UserId::new("alice"), &config);
        for who in ["a", "b", "c"] {
            resolver.processed().put(UserId::new(who), ());
        }
        assert!(!resolver.was_processed(&UserId::new("a")));
        assert!(resolver.was_processed(&UserId::new("c")));
    }
}
