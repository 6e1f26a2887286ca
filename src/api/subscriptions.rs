//! Subscription CRUD on `/subscriptions`

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;

use super::client::{json_body, GraphClient};
use super::{ApiError, SubscriptionApi};
use crate::models::{join_change_types, parse_change_types, Subscription};

/// Subscription resource as returned by Graph
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionResponse {
    id: String,
    resource: String,
    change_type: String,
    notification_url: String,
    expiration_date_time: DateTime<Utc>,
    client_state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionList {
    value: Vec<SubscriptionResponse>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

impl SubscriptionResponse {
    /// Graph does not echo `clientState` back on reads; keep the one we sent.
    fn into_subscription(self, client_state: Option<&str>) -> Subscription {
        Subscription {
            id: Some(self.id),
            resource: self.resource,
            change_type: parse_change_types(&self.change_type),
            notification_url: self.notification_url,
            expires_at: self.expiration_date_time,
            client_state: client_state
                .map(str::to_string)
                .or(self.client_state)
                .unwrap_or_default(),
        }
    }
}

fn graph_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn create_body(request: &Subscription) -> serde_json::Value {
    serde_json::json!({
        "changeType": join_change_types(&request.change_type),
        "notificationUrl": request.notification_url,
        "resource": request.resource,
        "expirationDateTime": graph_time(request.expires_at),
        "clientState": request.client_state
    })
}

#[async_trait]
impl SubscriptionApi for GraphClient {
    async fn create_subscription(&self, request: &Subscription) -> Result<Subscription, ApiError> {
        let resp = self.post("/subscriptions", &create_body(request)).await?;
        let created: SubscriptionResponse = json_body(resp).await?;
        tracing::info!(
            "Created subscription {} for {} (expires {})",
            created.id,
            created.resource,
            created.expiration_date_time
        );
        Ok(created.into_subscription(Some(&request.client_state)))
    }

    async fn renew_subscription(
        &self,
        id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ApiError> {
        let body = serde_json::json!({ "expirationDateTime": graph_time(expires_at) });
        let resp = self.patch(&format!("/subscriptions/{}", id), &body).await?;
        let renewed: SubscriptionResponse = json_body(resp).await?;
        Ok(renewed.expiration_date_time)
    }

    async fn delete_subscription(&self, id: &str) -> Result<(), ApiError> {
        self.delete(&format!("/subscriptions/{}", id)).await?;
        Ok(())
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, ApiError> {
        let mut out = Vec::new();
        let mut next = Some("/subscriptions".to_string());

        while let Some(path) = next.take() {
            let resp = self.get(&path).await?;
            let page: SubscriptionList = json_body(resp).await?;
            out.extend(page.value.into_iter().map(|s| s.into_subscription(None)));
            next = page.next_link;
        }

        Ok(out)
    }
}
