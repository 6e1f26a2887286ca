//! Communications platform API
//!
//! The traits here are the seams between the call core and Microsoft Graph.
//! `GraphClient` implements all of them; tests swap in in-memory fakes.

mod call_records;
mod calls;
pub mod client;
mod error;
mod subscriptions;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{CallRecord, RecordingStatus, Subscription};
pub use client::GraphClient;
pub use error::ApiError;

/// Call control actions on a live call.
#[async_trait]
pub trait CallControl: Send + Sync {
    /// Answer an incoming call.
    async fn answer(&self, call_id: &str) -> Result<(), ApiError>;

    /// Tell the platform whether the call is being recorded.
    async fn update_recording_status(
        &self,
        call_id: &str,
        status: RecordingStatus,
    ) -> Result<(), ApiError>;
}

/// Push subscription CRUD.
#[async_trait]
pub trait SubscriptionApi: Send + Sync {
    /// Create `request` (its `id` is ignored). Returns the platform's view of it.
    async fn create_subscription(&self, request: &Subscription) -> Result<Subscription, ApiError>;

    /// Extend expiration. Returns the expiration the platform accepted.
    async fn renew_subscription(
        &self,
        id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ApiError>;

    async fn delete_subscription(&self, id: &str) -> Result<(), ApiError>;

    /// All subscriptions the app currently owns on the platform.
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, ApiError>;
}

/// Pull-based access to finished calls.
#[async_trait]
pub trait CallRecordsApi: Send + Sync {
    /// Records whose start time falls in `[since, until)`.
    async fn list_call_records(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<CallRecord>, ApiError>;
}

/// Run a platform call with an upper bound on its duration.
pub async fn with_timeout<T, F>(
    after: Duration,
    operation: impl Into<String>,
    fut: F,
) -> Result<T, ApiError>
where
    F: Future<Output = Result<T, ApiError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(ApiError::Timeout {
            operation: operation.into(),
            after,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_elapsed() {
        let result: Result<(), ApiError> = with_timeout(
            Duration::from_millis(10),
            "slow op",
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;
        assert!(matches!(result, Err(ApiError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_with_timeout_passthrough() {
        let result = with_timeout(Duration::from_secs(1), "fast op", async {
            Err::<(), _>(ApiError::NotFound {
                url: "x".to_string(),
            })
        })
        .await;
        assert!(result.unwrap_err().is_not_found());
    }
}
