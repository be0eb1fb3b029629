//! Unread aggregation.
//!
//! Three counters, each from its own authoritative query. A failed query is
//! logged and leaves that counter at its last known value.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, instrument, warn};

use crate::cache::CacheStore;
use crate::capabilities::{decode_rows, DataError, DataService, Filter, Query, Table};
use crate::config::SyncConfig;
use crate::ids::UserId;
use crate::model::{MatchRow, MatchStatus, UnreadCounters};
use crate::refresh::fetch_latest_messages;
use crate::UnixTimeMs;

pub struct UnreadAggregator {
    cache: Arc<CacheStore>,
    data: Arc<dyn DataService>,
    actor: UserId,
    window_ms: u64,
    interval: Duration,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl UnreadAggregator {
    pub fn new(
        cache: Arc<CacheStore>,
        data: Arc<dyn DataService>,
        actor: UserId,
        config: &SyncConfig,
    ) -> Self {
        Self {
            cache,
            data,
            actor,
            window_ms: config.new_event_window_ms,
            interval: config.unread_poll_interval(),
            running: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One aggregation pass. Overlapping passes are skipped; the current
    /// counters are returned instead.
    #[instrument(skip(self), fields(actor = %self.actor))]
    pub async fn run_once(&self) -> UnreadCounters {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("unread pass already running");
            return self.cache.read(|s| s.unread());
        }
        let _running = RunningGuard(&self.running);

        let pending = self.pending_matches().await;
        let conversations = self.unread_conversations().await;
        let events = self.new_events(UnixTimeMs::now()).await;

        self.cache.write(|state| {
            let mut counters = state.unread();
            match pending {
                Ok(n) => counters.pending_matches = n,
                Err(e) => warn!(error = %e, "pending match count failed"),
            }
            match conversations {
                Ok(n) => counters.unread_conversations = n,
                Err(e) => warn!(error = %e, "unread conversation count failed"),
            }
            match events {
                Ok(n) => counters.new_events = n,
                Err(e) => warn!(error = %e, "new event count failed"),
            }
            state.set_unread(counters);
            counters
        })
    }

    async fn pending_matches(&self) -> Result<u32, DataError> {
        let query = Query::table(Table::Matches)
            .filter(Filter::eq("user2_id", self.actor.as_str()))
            .filter(Filter::eq("status", MatchStatus::Pending.as_str()));
        Ok(saturate(self.data.count(&query).await?))
    }

    /// Conversations whose latest message came from the counterpart. Binary
    /// per match, not a message count.
    async fn unread_conversations(&self) -> Result<u32, DataError> {
        let matches = self
            .data
            .fetch(
                &Query::table(Table::Matches)
                    .filter(Filter::or(vec![
                        Filter::eq("user1_id", self.actor.as_str()),
                        Filter::eq("user2_id", self.actor.as_str()),
                    ]))
                    .filter(Filter::eq("status", MatchStatus::Matched.as_str())),
            )
            .await?;
        let matches: Vec<MatchRow> = decode_rows(Table::Matches, matches)?;
        if matches.is_empty() {
            return Ok(0);
        }

        let latest =
            fetch_latest_messages(self.data.as_ref(), matches.into_iter().map(|m| m.id)).await?;
        let unread = latest
            .values()
            .filter(|m| m.sender_id != self.actor)
            .count();
        Ok(u32::try_from(unread).unwrap_or(u32::MAX))
    }

    async fn new_events(&self, now: UnixTimeMs) -> Result<u32, DataError> {
        let since = now.sub_millis(self.window_ms);
        let query = Query::table(Table::Events).filter(Filter::gte("created_at", since.as_millis()));
        Ok(saturate(self.data.count(&query).await?))
    }

    /// Starts the periodic loop; the first pass runs immediately.
    #[must_use]
    pub fn spawn_periodic(self: &Arc<Self>) -> UnreadTask {
        let aggregator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(aggregator.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                aggregator.run_once().await;
            }
        });
        UnreadTask { handle }
    }
}

fn saturate(n: u64) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Owns the periodic loop; dropping it stops polling.
pub struct UnreadTask {
    handle: JoinHandle<()>,
}

impl UnreadTask {
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for UnreadTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
