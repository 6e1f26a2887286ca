//! Inbound HTTP surface
//!
//! Webhook endpoints for call notifications plus a small JSON status API
//! for the subscription manager, polling service and live call sessions.
//! The webhook acknowledges with 200 in almost every case so the platform
//! does not retry; it only rejects oversized bodies and notifications whose
//! `clientState` is not ours.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::calling::CallStateMachine;
use crate::polling::PollingService;
use crate::subscriptions::{SubscriptionManager, SubscriptionSnapshot};
use crate::webhook::{normalize, Normalized};

/// Shared state handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub machine: Arc<CallStateMachine>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub polling: Arc<PollingService>,
    pub max_body_bytes: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/calls", post(notification))
        .route("/api/notifications", post(notification))
        .route("/api/status/polling", get(polling_status))
        .route("/api/status/subscriptions", get(subscription_status))
        .route("/api/status/calls", get(call_status))
        .route("/api/status/calls/:call_id", get(call_detail))
        .route("/api/polling/start", post(start_polling))
        .route("/api/polling/stop", post(stop_polling))
        .with_state(state)
}

/// Serve until `cancel` fires, then drain in-flight requests.
pub async fn serve(addr: SocketAddr, state: AppState, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Listening for call notifications on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("HTTP server failed")?;

    tracing::info!("HTTP server stopped");
    Ok(())
}

fn rejected(reason: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "status": "rejected", "reason": reason })),
    )
        .into_response()
}

fn ignored(reason: &str) -> Response {
    Json(json!({ "status": "ignored", "reason": reason })).into_response()
}

/// Handler for `POST /api/calls` and `POST /api/notifications`
async fn notification(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    // Subscription validation handshake
    if let Some(token) = params.get("validationToken") {
        tracing::info!("Answering subscription validation request");
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            token.clone(),
        )
            .into_response();
    }

    let bytes = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(
                "Rejected notification body over {} bytes: {}",
                state.max_body_bytes,
                e
            );
            return rejected("payload_too_large");
        }
    };

    let event = match normalize(&headers, &bytes, Utc::now()) {
        Normalized::Direct(event) | Normalized::Wrapped(event) => event,
        Normalized::NotACall(reason) => {
            tracing::debug!("Notification is not a call event: {}", reason.as_str());
            return ignored(reason.as_str());
        }
        Normalized::Unparseable(message) => {
            tracing::warn!("Unparseable notification body: {}", message);
            return ignored("unparseable");
        }
    };

    if let Some(client_state) = event.client_state.as_deref() {
        if !state.subscriptions.validate_client_state(client_state) {
            tracing::warn!(
                "Notification for call {:?} carries an unknown clientState",
                event.call_id
            );
            return rejected("client_state_mismatch");
        }
    }

    let outcome = state.machine.handle_event(event).await;
    Json(json!({ "status": "processed", "result": outcome })).into_response()
}

/// Handler for `GET /api/status/polling`
async fn polling_status(State(state): State<AppState>) -> Response {
    Json(state.polling.status()).into_response()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionStatus {
    active_count: usize,
    expired_count: usize,
    #[serde(flatten)]
    subscriptions: SubscriptionSnapshot,
}

/// Handler for `GET /api/status/subscriptions`
async fn subscription_status(State(state): State<AppState>) -> Json<SubscriptionStatus> {
    let subscriptions = state.subscriptions.list_active(Utc::now());
    Json(SubscriptionStatus {
        active_count: subscriptions.active.len(),
        expired_count: subscriptions.expired.len(),
        subscriptions,
    })
}

/// Handler for `GET /api/status/calls`
async fn call_status(State(state): State<AppState>) -> Response {
    Json(state.machine.snapshot()).into_response()
}

/// Handler for `GET /api/status/calls/:call_id`
async fn call_detail(State(state): State<AppState>, Path(call_id): Path<String>) -> Response {
    match state.machine.session(&call_id) {
        Some(session) => Json(session).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "status": "unknown_call", "callId": call_id })),
        )
            .into_response(),
    }
}

/// Handler for `POST /api/polling/start`
async fn start_polling(State(state): State<AppState>) -> Response {
    let started = state.polling.start();
    Json(json!({ "started": started, "polling": state.polling.status() })).into_response()
}

/// Handler for `POST /api/polling/stop`
async fn stop_polling(State(state): State<AppState>) -> Response {
    let stopped = state.polling.stop();
    Json(json!({ "stopped": stopped, "polling": state.polling.status() })).into_response()
}
