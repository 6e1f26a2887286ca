//! Push subscription lifecycle
//!
//! Creates subscriptions, renews them before they lapse and rebuilds any the
//! platform has forgotten. A renewal answered with 404 means the platform
//! purged the subscription (e.g. after an outage); it is recreated with the
//! same resource and change types instead of being dropped.
//!
//! Every subscription carries the same configured `clientState`, so
//! notifications from subscriptions created by an earlier run still validate
//! after a restart.

use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::api::{with_timeout, ApiError, SubscriptionApi};
use crate::models::{ChangeType, Subscription, SubscriptionSpec};
use crate::polling::PollingService;

/// Longest lifetime the platform accepts for a resource, in minutes.
fn max_ttl_minutes(resource: &str) -> i64 {
    let resource = resource.to_ascii_lowercase();
    if resource.contains("presences") {
        60
    } else if resource.contains("onlinemeetings") {
        4320
    } else {
        // callRecords and everything else
        4230
    }
}

/// Clamp a requested lifetime to the resource's maximum.
pub fn bounded_ttl(resource: &str, requested: chrono::Duration) -> chrono::Duration {
    requested.min(chrono::Duration::minutes(max_ttl_minutes(resource)))
}

/// Random opaque token the platform echoes back in every notification.
pub fn generate_client_state() -> String {
    let mut bytes = [0u8; 24];
    if getrandom::getrandom(&mut bytes).is_err() {
        return uuid::Uuid::new_v4().simple().to_string();
    }
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Result of one renewal request.
#[derive(Debug, Clone)]
pub enum RenewResult {
    Renewed(DateTime<Utc>),
    NotFound,
    Failed(ApiError),
}

impl From<Result<DateTime<Utc>, ApiError>> for RenewResult {
    fn from(result: Result<DateTime<Utc>, ApiError>) -> Self {
        match result {
            Ok(expires_at) => Self::Renewed(expires_at),
            Err(e) if e.is_not_found() => Self::NotFound,
            Err(e) => Self::Failed(e),
        }
    }
}

/// What a renewal pass did to one tracked subscription.
#[derive(Debug, Clone)]
pub enum RenewalAction {
    Renewed {
        id: String,
        expires_at: DateTime<Utc>,
    },
    Recreated {
        old_id: String,
        new_id: String,
    },
    /// Platform lost it and recreation failed; the stale entry is kept.
    RecreateFailed {
        old_id: String,
        error: ApiError,
    },
    /// Renewal failed for another reason; retried next cycle.
    Failed {
        id: String,
        error: ApiError,
    },
}

/// Dashboard view of tracked subscriptions.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSnapshot {
    pub active: Vec<Subscription>,
    pub expired: Vec<Subscription>,
}

pub struct SubscriptionManager {
    api: Arc<dyn SubscriptionApi>,
    tracked: RwLock<Vec<Subscription>>,
    notification_url: String,
    client_state: String,
    default_ttl: chrono::Duration,
    renewal_window: chrono::Duration,
    timeout: Duration,
    /// Resources the renewal loop keeps subscribed.
    resources: Vec<SubscriptionSpec>,
    /// Polled while no subscription is active.
    fallback: Option<Arc<PollingService>>,
}

impl SubscriptionManager {
    /// An empty `client_state` gets a random one, valid for this process only.
    pub fn new(
        api: Arc<dyn SubscriptionApi>,
        notification_url: impl Into<String>,
        client_state: impl Into<String>,
        default_ttl: chrono::Duration,
        renewal_window: chrono::Duration,
        timeout: Duration,
    ) -> Self {
        let mut client_state = client_state.into();
        if client_state.is_empty() {
            client_state = generate_client_state();
        }
        Self {
            api,
            tracked: RwLock::new(Vec::new()),
            notification_url: notification_url.into(),
            client_state,
            default_ttl,
            renewal_window,
            timeout,
            resources: Vec::new(),
            fallback: None,
        }
    }

    pub fn with_resources(mut self, resources: Vec<SubscriptionSpec>) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_fallback(mut self, polling: Arc<PollingService>) -> Self {
        self.fallback = Some(polling);
        self
    }

    /// Create one subscription and start tracking it.
    pub async fn create(
        &self,
        resource: &str,
        change_type: BTreeSet<ChangeType>,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Subscription, ApiError> {
        let request = Subscription {
            id: None,
            resource: resource.to_string(),
            change_type,
            notification_url: self.notification_url.clone(),
            expires_at: now + bounded_ttl(resource, ttl),
            client_state: self.client_state.clone(),
        };
        self.submit(request).await
    }

    async fn submit(&self, request: Subscription) -> Result<Subscription, ApiError> {
        let created = with_timeout(
            self.timeout,
            format!("create subscription for {}", request.resource),
            self.api.create_subscription(&request),
        )
        .await?;

        let mut tracked = self.tracked.write().unwrap_or_else(PoisonError::into_inner);
        tracked.retain(|s| !s.matches(&created.spec()));
        tracked.push(created.clone());
        Ok(created)
    }

    /// Create several subscriptions concurrently. Each resource succeeds or
    /// fails on its own.
    pub async fn create_batch(
        &self,
        specs: &[SubscriptionSpec],
        now: DateTime<Utc>,
    ) -> Vec<(SubscriptionSpec, Result<Subscription, ApiError>)> {
        let results = join_all(specs.iter().map(|spec| {
            self.create(
                &spec.resource,
                spec.change_type.clone(),
                self.default_ttl,
                now,
            )
        }))
        .await;

        specs
            .iter()
            .cloned()
            .zip(results)
            .inspect(|(spec, result)| {
                if let Err(e) = result {
                    tracing::warn!("Failed to subscribe to {}: {}", spec.resource, e);
                }
            })
            .collect()
    }

    /// Track subscriptions that already exist on the platform and point at
    /// our notification URL. Returns how many were adopted.
    pub fn adopt(&self, existing: Vec<Subscription>) -> usize {
        let mut tracked = self.tracked.write().unwrap_or_else(PoisonError::into_inner);
        let mut adopted = 0;
        for sub in existing {
            if sub.notification_url != self.notification_url || sub.id.is_none() {
                continue;
            }
            if tracked.iter().any(|s| s.id == sub.id) {
                continue;
            }
            // Reads never return clientState; ours is the only one we issue
            let client_state = if sub.client_state.is_empty() {
                self.client_state.clone()
            } else {
                sub.client_state
            };
            tracked.push(Subscription { client_state, ..sub });
            adopted += 1;
        }
        adopted
    }

    /// Subscribe to every resource without an active tracked subscription.
    pub async fn ensure(
        &self,
        specs: &[SubscriptionSpec],
        now: DateTime<Utc>,
    ) -> Vec<(SubscriptionSpec, Result<Subscription, ApiError>)> {
        let missing: Vec<SubscriptionSpec> = {
            let tracked = self.tracked.read().unwrap_or_else(PoisonError::into_inner);
            specs
                .iter()
                .filter(|spec| {
                    !tracked
                        .iter()
                        .any(|s| s.matches(spec) && !s.is_expired(now))
                })
                .cloned()
                .collect()
        };
        self.create_batch(&missing, now).await
    }

    /// Renew everything inside the renewal window. Subscriptions the
    /// platform no longer knows are recreated with the same parameters.
    pub async fn renew_all(&self, now: DateTime<Utc>) -> Vec<RenewalAction> {
        let due: Vec<Subscription> = {
            let tracked = self.tracked.read().unwrap_or_else(PoisonError::into_inner);
            tracked
                .iter()
                .filter(|s| s.id.is_some() && s.needs_renewal(now, self.renewal_window))
                .cloned()
                .collect()
        };

        let mut actions = Vec::with_capacity(due.len());
        for sub in due {
            let Some(id) = sub.id.clone() else { continue };
            let expires_at = now + bounded_ttl(&sub.resource, self.default_ttl);

            let result: RenewResult = with_timeout(
                self.timeout,
                format!("renew subscription {}", id),
                self.api.renew_subscription(&id, expires_at),
            )
            .await
            .into();

            let action = match result {
                RenewResult::Renewed(new_expiry) => {
                    self.update_expiry(&id, new_expiry);
                    tracing::info!("Renewed subscription {} until {}", id, new_expiry);
                    RenewalAction::Renewed {
                        id,
                        expires_at: new_expiry,
                    }
                }
                RenewResult::NotFound => self.recreate(sub, id, now).await,
                RenewResult::Failed(error) => {
                    tracing::warn!("Renewal of subscription {} failed: {}", id, error);
                    RenewalAction::Failed { id, error }
                }
            };
            actions.push(action);
        }
        actions
    }

    async fn recreate(
        &self,
        stale: Subscription,
        old_id: String,
        now: DateTime<Utc>,
    ) -> RenewalAction {
        tracing::warn!(
            "Subscription {} for {} no longer exists, recreating",
            old_id,
            stale.resource
        );
        let resource = stale.resource.clone();
        let client_state = if stale.client_state.is_empty() {
            self.client_state.clone()
        } else {
            stale.client_state
        };
        let request = Subscription {
            id: None,
            expires_at: now + bounded_ttl(&resource, self.default_ttl),
            resource: stale.resource,
            change_type: stale.change_type,
            notification_url: stale.notification_url,
            client_state,
        };

        match self.submit(request).await {
            Ok(created) => {
                let new_id = created.id.unwrap_or_default();
                tracing::info!("Replaced subscription {} with {}", old_id, new_id);
                RenewalAction::Recreated { old_id, new_id }
            }
            Err(error) => {
                tracing::error!(
                    "Could not recreate subscription {} ({}): {}",
                    old_id,
                    resource,
                    error
                );
                RenewalAction::RecreateFailed { old_id, error }
            }
        }
    }

    fn update_expiry(&self, id: &str, expires_at: DateTime<Utc>) {
        let mut tracked = self.tracked.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(sub) = tracked.iter_mut().find(|s| s.id.as_deref() == Some(id)) {
            sub.expires_at = expires_at;
        }
    }

    /// Delete a subscription on the platform and stop tracking it.
    pub async fn delete(&self, id: &str) -> Result<(), ApiError> {
        let result = with_timeout(
            self.timeout,
            format!("delete subscription {}", id),
            self.api.delete_subscription(id),
        )
        .await;

        match result {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                tracing::debug!("Subscription {} already gone", id);
            }
            Err(e) => return Err(e),
        }

        self.tracked
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|s| s.id.as_deref() != Some(id));
        Ok(())
    }

    /// Tracked subscriptions split by expiry.
    pub fn list_active(&self, now: DateTime<Utc>) -> SubscriptionSnapshot {
        let tracked = self.tracked.read().unwrap_or_else(PoisonError::into_inner);
        let (expired, active) = tracked.iter().cloned().partition(|s| s.is_expired(now));
        SubscriptionSnapshot { active, expired }
    }

    /// Whether a notification's `clientState` belongs to one of our subscriptions.
    pub fn validate_client_state(&self, client_state: &str) -> bool {
        if client_state == self.client_state {
            return true;
        }
        self.tracked
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|s| s.client_state == client_state)
    }

    /// Start or stop the polling fallback to match current push coverage.
    pub fn sync_fallback(&self, now: DateTime<Utc>) {
        if let Some(polling) = &self.fallback {
            polling.apply_coverage(self.list_active(now).active.len());
        }
    }

    /// Renewal loop: resubscribes missing resources, renews what is due and
    /// keeps the polling fallback in step. Exits within one iteration of `cancel`.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        tracing::info!("Subscription renewal every {}s", interval.as_secs());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let now = Utc::now();
            let recovered = self
                .ensure(&self.resources, now)
                .await
                .iter()
                .filter(|(_, result)| result.is_ok())
                .count();
            if recovered > 0 {
                tracing::info!("Resubscribed {} missing resources", recovered);
            }

            let actions = self.renew_all(now).await;
            let failed = actions
                .iter()
                .filter(|a| {
                    matches!(
                        a,
                        RenewalAction::Failed { .. } | RenewalAction::RecreateFailed { .. }
                    )
                })
                .count();
            if !actions.is_empty() {
                tracing::info!(
                    "Renewal pass: {} processed, {} failed",
                    actions.len(),
                    failed
                );
            }
            self.sync_fallback(Utc::now());
        }
        tracing::info!("Subscription renewal stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::CallRecordsApi;
    use crate::models::{parse_change_types, CallRecord};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeSubscriptionApi {
        creates: Mutex<Vec<(String, BTreeSet<ChangeType>)>>,
        renews: Mutex<Vec<String>>,
        next_id: Mutex<u32>,
        missing: Mutex<HashSet<String>>,
        failing_resources: HashSet<String>,
        /// Number of upcoming creates answered with 503.
        unavailable_creates: Mutex<u32>,
        renew_error: Option<u16>,
    }

    #[async_trait]
    impl SubscriptionApi for FakeSubscriptionApi {
        async fn create_subscription(
            &self,
            request: &Subscription,
        ) -> Result<Subscription, ApiError> {
            self.creates
                .lock()
                .unwrap()
                .push((request.resource.clone(), request.change_type.clone()));
            if self.failing_resources.contains(&request.resource) {
                return Err(ApiError::Status {
                    url: "/subscriptions".to_string(),
                    status: 403,
                    body: "forbidden".to_string(),
                });
            }
            {
                let mut unavailable = self.unavailable_creates.lock().unwrap();
                if *unavailable > 0 {
                    *unavailable -= 1;
                    return Err(ApiError::Status {
                        url: "/subscriptions".to_string(),
                        status: 503,
                        body: "service unavailable".to_string(),
                    });
                }
            }
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            Ok(Subscription {
                id: Some(format!("sub-{}", *next)),
                ..request.clone()
            })
        }

        async fn renew_subscription(
            &self,
            id: &str,
            expires_at: DateTime<Utc>,
        ) -> Result<DateTime<Utc>, ApiError> {
            self.renews.lock().unwrap().push(id.to_string());
            if self.missing.lock().unwrap().contains(id) {
                return Err(ApiError::NotFound {
                    url: format!("/subscriptions/{}", id),
                });
            }
            if let Some(status) = self.renew_error {
                return Err(ApiError::Status {
                    url: format!("/subscriptions/{}", id),
                    status,
                    body: String::new(),
                });
            }
            Ok(expires_at)
        }

        async fn delete_subscription(&self, id: &str) -> Result<(), ApiError> {
            Err(ApiError::NotFound {
                url: format!("/subscriptions/{}", id),
            })
        }

        async fn list_subscriptions(&self) -> Result<Vec<Subscription>, ApiError> {
            Ok(Vec::new())
        }
    }

    struct NoCallRecords;

    #[async_trait]
    impl CallRecordsApi for NoCallRecords {
        async fn list_call_records(
            &self,
            _since: DateTime<Utc>,
            _until: DateTime<Utc>,
        ) -> Result<Vec<CallRecord>, ApiError> {
            Ok(Vec::new())
        }
    }

    fn fallback_poller() -> Arc<PollingService> {
        Arc::new(PollingService::new(
            Arc::new(NoCallRecords),
            Duration::from_secs(3600),
            chrono::Duration::minutes(15),
            chrono::Duration::hours(1),
            Duration::from_secs(1),
            CancellationToken::new(),
        ))
    }

    fn manager(api: Arc<FakeSubscriptionApi>) -> SubscriptionManager {
        SubscriptionManager::new(
            api,
            "https://bot.example.com/api/notifications",
            "configured-client-state",
            chrono::Duration::minutes(4230),
            chrono::Duration::minutes(60),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_create_bounds_ttl() {
        let api = Arc::new(FakeSubscriptionApi::default());
        let mgr = manager(api.clone());
        let now = Utc::now();

        let sub = mgr
            .create(
                "communications/presences/abc",
                parse_change_types("updated"),
                chrono::Duration::days(30),
                now,
            )
            .await
            .unwrap();

        assert_eq!(sub.expires_at, now + chrono::Duration::minutes(60));
        assert!(mgr.validate_client_state(&sub.client_state));
        assert!(!mgr.validate_client_state("forged"));
    }

    #[tokio::test]
    async fn test_renew_not_found_recreates_same_resource() {
        let api = Arc::new(FakeSubscriptionApi::default());
        let mgr = manager(api.clone());
        let now = Utc::now();

        let original = mgr
            .create(
                "communications/callRecords",
                parse_change_types("created"),
                chrono::Duration::minutes(30),
                now,
            )
            .await
            .unwrap();
        let old_id = original.id.clone().unwrap();
        api.missing.lock().unwrap().insert(old_id.clone());

        let actions = mgr.renew_all(now).await;

        assert_eq!(actions.len(), 1);
        let new_id = match &actions[0] {
            RenewalAction::Recreated { old_id: o, new_id } => {
                assert_eq!(o, &old_id);
                new_id.clone()
            }
            other => panic!("expected Recreated, got {:?}", other),
        };

        let creates = api.creates.lock().unwrap().clone();
        assert_eq!(creates.len(), 2);
        assert_eq!(creates[1], creates[0]);

        let snapshot = mgr.list_active(now);
        assert_eq!(snapshot.active.len(), 1);
        assert_eq!(snapshot.active[0].id.as_deref(), Some(new_id.as_str()));
        assert_ne!(new_id, old_id);
        // Same clientState survives the rebuild
        assert_eq!(snapshot.active[0].client_state, original.client_state);
    }

    #[tokio::test]
    async fn test_other_renew_failure_keeps_entry() {
        let api = Arc::new(FakeSubscriptionApi {
            renew_error: Some(503),
            ..Default::default()
        });
        let mgr = manager(api.clone());
        let now = Utc::now();

        mgr.create(
            "communications/callRecords",
            parse_change_types("created"),
            chrono::Duration::minutes(30),
            now,
        )
        .await
        .unwrap();

        let actions = mgr.renew_all(now).await;
        assert!(matches!(actions[0], RenewalAction::Failed { .. }));
        assert_eq!(api.creates.lock().unwrap().len(), 1);
        assert_eq!(mgr.list_active(now).active.len(), 1);

        // Still due, so the next pass tries again
        mgr.renew_all(now).await;
        assert_eq!(api.renews.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_renew_skips_fresh_subscriptions() {
        let api = Arc::new(FakeSubscriptionApi::default());
        let mgr = manager(api.clone());
        let now = Utc::now();

        mgr.create(
            "communications/callRecords",
            parse_change_types("created"),
            chrono::Duration::minutes(4230),
            now,
        )
        .await
        .unwrap();

        assert!(mgr.renew_all(now).await.is_empty());
        assert!(api.renews.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_failures_are_independent() {
        let api = Arc::new(FakeSubscriptionApi {
            failing_resources: ["communications/calls".to_string()].into_iter().collect(),
            ..Default::default()
        });
        let mgr = manager(api.clone());
        let specs = vec![
            SubscriptionSpec::new("communications/calls", &[ChangeType::Created]),
            SubscriptionSpec::new("communications/callRecords", &[ChangeType::Created]),
            SubscriptionSpec::new(
                "communications/onlineMeetings",
                &[ChangeType::Created, ChangeType::Updated],
            ),
        ];

        let results = mgr.create_batch(&specs, Utc::now()).await;

        assert_eq!(results.len(), 3);
        assert!(results[0].1.is_err());
        assert!(results[1].1.is_ok());
        assert!(results[2].1.is_ok());
        assert_eq!(mgr.list_active(Utc::now()).active.len(), 2);

        // ensure() only retries what is missing
        mgr.ensure(&specs, Utc::now()).await;
        assert_eq!(api.creates.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_list_active_partitions_expired() {
        let api = Arc::new(FakeSubscriptionApi::default());
        let mgr = manager(api);
        let now = Utc::now();

        mgr.create(
            "communications/callRecords",
            parse_change_types("created"),
            chrono::Duration::minutes(10),
            now,
        )
        .await
        .unwrap();

        let later = mgr.list_active(now + chrono::Duration::minutes(11));
        assert!(later.active.is_empty());
        assert_eq!(later.expired.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_treats_not_found_as_deleted() {
        let api = Arc::new(FakeSubscriptionApi::default());
        let mgr = manager(api);
        let now = Utc::now();

        let sub = mgr
            .create(
                "communications/callRecords",
                parse_change_types("created"),
                chrono::Duration::minutes(10),
                now,
            )
            .await
            .unwrap();

        tokio_test::assert_ok!(mgr.delete(sub.id.as_deref().unwrap()).await);
        assert!(mgr.list_active(now).active.is_empty());
    }

    #[tokio::test]
    async fn test_adopt_only_our_subscriptions() {
        let api = Arc::new(FakeSubscriptionApi::default());
        let mgr = manager(api);
        let now = Utc::now();
        let ours = Subscription {
            id: Some("existing".to_string()),
            resource: "communications/callRecords".to_string(),
            change_type: parse_change_types("created"),
            notification_url: "https://bot.example.com/api/notifications".to_string(),
            expires_at: now + chrono::Duration::minutes(10),
            client_state: String::new(),
        };
        let foreign = Subscription {
            id: Some("other".to_string()),
            notification_url: "https://elsewhere.example.com/hook".to_string(),
            ..ours.clone()
        };

        assert_eq!(mgr.adopt(vec![ours.clone(), foreign]), 1);
        assert_eq!(mgr.adopt(vec![ours]), 0);
        assert_eq!(mgr.list_active(now).active.len(), 1);
    }

    #[tokio::test]
    async fn test_client_state_survives_restart() {
        let api = Arc::new(FakeSubscriptionApi::default());
        let before = manager(api.clone());
        let sub = before
            .create(
                "communications/callRecords",
                parse_change_types("created"),
                chrono::Duration::minutes(60),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(sub.client_state, "configured-client-state");

        // A fresh process tracks nothing yet but still owns the token
        let after = manager(api);
        assert!(after.list_active(Utc::now()).active.is_empty());
        assert!(after.validate_client_state(&sub.client_state));
        assert!(!after.validate_client_state("forged"));
    }

    #[tokio::test]
    async fn test_run_resubscribes_after_startup_failure() {
        let api = Arc::new(FakeSubscriptionApi::default());
        *api.unavailable_creates.lock().unwrap() = 1;
        let specs = vec![SubscriptionSpec::new(
            "communications/callRecords",
            &[ChangeType::Created],
        )];
        let mgr = Arc::new(manager(api.clone()).with_resources(specs.clone()));

        let results = mgr.create_batch(&specs, Utc::now()).await;
        assert!(results[0].1.is_err());
        assert!(mgr.list_active(Utc::now()).active.is_empty());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(mgr.clone().run(Duration::from_millis(10), cancel.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(mgr.list_active(Utc::now()).active.len(), 1);
        // One failed create, one recovery, nothing duplicated afterwards
        assert_eq!(api.creates.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_expired_subscription_is_resubscribed() {
        let api = Arc::new(FakeSubscriptionApi::default());
        let specs = vec![SubscriptionSpec::new(
            "communications/callRecords",
            &[ChangeType::Created],
        )];
        let mgr = manager(api.clone());
        let now = Utc::now();

        mgr.create(
            "communications/callRecords",
            parse_change_types("created"),
            chrono::Duration::minutes(10),
            now,
        )
        .await
        .unwrap();

        let later = now + chrono::Duration::minutes(11);
        assert!(mgr.ensure(&specs, now).await.is_empty());
        assert_eq!(mgr.ensure(&specs, later).await.len(), 1);
        let snapshot = mgr.list_active(later);
        assert_eq!(snapshot.active.len(), 1);
        assert!(snapshot.expired.is_empty());
    }

    #[tokio::test]
    async fn test_fallback_follows_push_coverage() {
        let api = Arc::new(FakeSubscriptionApi::default());
        let poller = fallback_poller();
        let mgr = manager(api).with_fallback(poller.clone());
        let now = Utc::now();

        mgr.sync_fallback(now);
        assert!(poller.status().is_polling);

        mgr.create(
            "communications/callRecords",
            parse_change_types("created"),
            chrono::Duration::minutes(10),
            now,
        )
        .await
        .unwrap();
        mgr.sync_fallback(now);
        assert!(!poller.status().is_polling);

        // Coverage lapses again once the only subscription expires
        mgr.sync_fallback(now + chrono::Duration::minutes(11));
        assert!(poller.status().is_polling);
        poller.stop();
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let api = Arc::new(FakeSubscriptionApi::default());
        let mgr = Arc::new(manager(api));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(mgr.run(Duration::from_secs(3600), cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
