//! Polling fallback for call records
//!
//! When push subscriptions are unavailable the service pulls finished calls
//! from the call records API on a fixed interval. Each query covers
//! `[last_polled_at - lookback, window_end)` so records that show up late are
//! still caught; a TTL bounded seen set keeps the overlap from reporting the
//! same record twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::api::{with_timeout, ApiError, CallRecordsApi};
use crate::models::CallRecord;

#[derive(Debug, Clone, Default)]
struct PollCursor {
    /// End of the last successful query window.
    last_polled_at: Option<DateTime<Utc>>,
    is_polling: bool,
    /// Bumped on every start so a stale loop cannot clear a newer one's flag.
    generation: u64,
    last_poll_time: Option<DateTime<Utc>>,
}

/// Polling status as shown on the status surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollStatus {
    pub is_polling: bool,
    pub last_poll_time: Option<DateTime<Utc>>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub records_discovered: u64,
}

pub struct PollingService {
    api: Arc<dyn CallRecordsApi>,
    cursor: RwLock<PollCursor>,
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
    discovered: AtomicU64,
    interval: Duration,
    lookback: chrono::Duration,
    seen_ttl: chrono::Duration,
    timeout: Duration,
    current: Mutex<Option<CancellationToken>>,
    /// Set while the loop runs because push coverage lapsed.
    fallback: AtomicBool,
    shutdown: CancellationToken,
}

impl PollingService {
    pub fn new(
        api: Arc<dyn CallRecordsApi>,
        interval: Duration,
        lookback: chrono::Duration,
        seen_ttl: chrono::Duration,
        timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            api,
            cursor: RwLock::new(PollCursor::default()),
            seen: Mutex::new(HashMap::new()),
            discovered: AtomicU64::new(0),
            interval,
            lookback,
            seen_ttl,
            timeout,
            current: Mutex::new(None),
            fallback: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Start the polling loop. Returns false if it is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return false;
        }

        let token = self.shutdown.child_token();
        *current = Some(token.clone());
        let generation = {
            let mut cursor = self.cursor.write().unwrap_or_else(PoisonError::into_inner);
            cursor.is_polling = true;
            cursor.generation += 1;
            cursor.generation
        };

        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.poll_loop(token, generation).await;
        });
        tracing::info!("Call record polling started every {}s", self.interval.as_secs());
        true
    }

    /// Ask the loop to exit after its current iteration. Returns false if it
    /// was not running.
    pub fn stop(&self) -> bool {
        self.fallback.store(false, Ordering::Relaxed);
        let token = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match token {
            Some(token) => {
                token.cancel();
                self.cursor
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .is_polling = false;
                tracing::info!("Call record polling stopped");
                true
            }
            None => false,
        }
    }

    /// Poll while no push subscription is active. Only a loop started here
    /// is stopped again when coverage returns; a manual start is left alone.
    pub fn apply_coverage(self: &Arc<Self>, active_subscriptions: usize) {
        if active_subscriptions == 0 {
            if self.start() {
                self.fallback.store(true, Ordering::Relaxed);
                tracing::warn!("No active subscriptions, falling back to polling");
            }
        } else if self.fallback.swap(false, Ordering::Relaxed) {
            self.stop();
            tracing::info!(
                "{} subscriptions active, polling fallback ended",
                active_subscriptions
            );
        }
    }

    pub fn status(&self) -> PollStatus {
        let cursor = self.cursor.read().unwrap_or_else(PoisonError::into_inner);
        PollStatus {
            is_polling: cursor.is_polling,
            last_poll_time: cursor.last_poll_time,
            last_polled_at: cursor.last_polled_at,
            records_discovered: self.discovered.load(Ordering::Relaxed),
        }
    }

    async fn poll_loop(self: Arc<Self>, cancel: CancellationToken, generation: u64) {
        loop {
            match self.poll_once(Utc::now()).await {
                Ok(records) if !records.is_empty() => {
                    tracing::info!("Polling discovered {} new call records", records.len());
                }
                Ok(_) => {}
                Err(e) if e.is_transient() => tracing::warn!("Call record poll failed: {}", e),
                Err(e) => tracing::error!("Call record poll failed: {}", e),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        let mut cursor = self.cursor.write().unwrap_or_else(PoisonError::into_inner);
        if cursor.generation == generation {
            cursor.is_polling = false;
        }
    }

    /// Run a single query window ending at `now`. Returns the records not
    /// seen before. The cursor only moves when the query succeeds.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<Vec<CallRecord>, ApiError> {
        let window_end = now;
        let since = {
            let cursor = self.cursor.read().unwrap_or_else(PoisonError::into_inner);
            cursor.last_polled_at.unwrap_or(window_end) - self.lookback
        };

        self.purge_seen(now);

        let records = with_timeout(
            self.timeout,
            "list call records",
            self.api.list_call_records(since, window_end),
        )
        .await?;

        let fresh: Vec<CallRecord> = {
            let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
            records
                .into_iter()
                .filter(|record| seen.insert(record.id.clone(), now).is_none())
                .collect()
        };

        for record in &fresh {
            tracing::info!(
                "Call record {} ({}) started {:?}",
                record.id,
                record.call_type.as_deref().unwrap_or("unknown"),
                record.start_date_time
            );
        }
        self.discovered
            .fetch_add(fresh.len() as u64, Ordering::Relaxed);

        let mut cursor = self.cursor.write().unwrap_or_else(PoisonError::into_inner);
        cursor.last_polled_at = Some(window_end);
        cursor.last_poll_time = Some(now);
        Ok(fresh)
    }

    fn purge_seen(&self, now: DateTime<Utc>) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, first_seen| now - *first_seen < self.seen_ttl);
    }
}
