//! Call state machine
//!
//! Owns one [`CallSession`] per call id and decides, for each normalized
//! event, whether to answer, start recording, stop recording or ignore it.
//!
//! Events for different calls run in parallel. Events for the same call are
//! serialized by a per-call gate held for the whole event, so an
//! `established` and a `terminated` delivered together cannot interleave.
//! The session record itself sits behind a separate lock that is only taken
//! for bookkeeping, never across a platform call, so status readers never
//! wait on the network.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::api::{with_timeout, CallControl};
use crate::models::{ActionOutcome, CallEvent, CallSession, CallState, SessionState};
use crate::recording::{ComplianceOrchestrator, RecordingFailure, StartOutcome, StopOutcome};

/// Decides whether an incoming call gets answered.
pub type AnswerPolicy = Arc<dyn Fn(&CallEvent) -> bool + Send + Sync>;

/// Compliance recording answers everything.
pub fn always_answer() -> AnswerPolicy {
    Arc::new(|_| true)
}

/// What happened to one event, reported back to the webhook caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventOutcome {
    pub call_id: Option<String>,
    pub outcome: ActionOutcome,
    pub session_state: Option<SessionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl EventOutcome {
    fn ignored(call_id: Option<String>, detail: impl Into<String>) -> Self {
        Self {
            call_id,
            outcome: ActionOutcome::Ignored,
            session_state: None,
            detail: Some(detail.into()),
        }
    }
}

struct SessionSlot {
    /// Serializes event handling for one call id.
    gate: tokio::sync::Mutex<()>,
    session: Mutex<CallSession>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct CallStateMachine {
    sessions: Mutex<HashMap<String, Arc<SessionSlot>>>,
    control: Arc<dyn CallControl>,
    orchestrator: ComplianceOrchestrator,
    answer_policy: AnswerPolicy,
    timeout: Duration,
    quiet_period: chrono::Duration,
}

impl CallStateMachine {
    pub fn new(
        control: Arc<dyn CallControl>,
        orchestrator: ComplianceOrchestrator,
        answer_policy: AnswerPolicy,
        timeout: Duration,
        quiet_period: chrono::Duration,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            control,
            orchestrator,
            answer_policy,
            timeout,
            quiet_period,
        }
    }

    /// Handle one normalized event.
    pub async fn handle_event(&self, event: CallEvent) -> EventOutcome {
        let Some(call_id) = event.call_id.clone() else {
            tracing::info!(
                "Acknowledged {} event without call id",
                event.state.as_str()
            );
            return EventOutcome::ignored(None, "missing call id");
        };

        if let CallState::Unknown(ref raw) = event.state {
            tracing::info!("Ignoring state '{}' for call {}", raw, call_id);
            return EventOutcome::ignored(Some(call_id), format!("unhandled state '{}'", raw));
        }

        let slot = self.slot(&call_id, event.received_at);
        let _gate = slot.gate.lock().await;

        tracing::debug!(
            "Call {} event {} (direction {:?}, source {:?}, targets {:?}, callback {:?})",
            call_id,
            event.state.as_str(),
            event.direction,
            event.raw_source,
            event.raw_targets,
            event.raw_callback_uri
        );

        let (outcome, detail) = match event.state {
            CallState::Incoming | CallState::Establishing => self.on_incoming(&slot, &event).await,
            CallState::Established => self.on_established(&slot).await,
            CallState::Terminated | CallState::Disconnected => self.on_terminated(&slot).await,
            CallState::Unknown(_) => (ActionOutcome::Ignored, None),
        };

        let mut session = lock(&slot.session);
        if outcome != ActionOutcome::Duplicate {
            session.last_outcome = Some(outcome);
        }
        tracing::info!(
            "Call {} {} -> {} ({:?})",
            call_id,
            event.state.as_str(),
            outcome.as_str(),
            session.state
        );
        EventOutcome {
            call_id: Some(call_id),
            outcome,
            session_state: Some(session.state),
            detail,
        }
    }

    /// Session slot for `call_id`, created on first reference.
    fn slot(&self, call_id: &str, now: DateTime<Utc>) -> Arc<SessionSlot> {
        let mut sessions = lock(&self.sessions);
        sessions
            .entry(call_id.to_string())
            .or_insert_with(|| {
                tracing::debug!("New session for call {}", call_id);
                Arc::new(SessionSlot {
                    gate: tokio::sync::Mutex::new(()),
                    session: Mutex::new(CallSession::new(call_id, now)),
                })
            })
            .clone()
    }

    async fn on_incoming(
        &self,
        slot: &SessionSlot,
        event: &CallEvent,
    ) -> (ActionOutcome, Option<String>) {
        let call_id = {
            let mut session = lock(&slot.session);
            if session.state != SessionState::New || session.is_terminated() {
                return (ActionOutcome::Duplicate, None);
            }
            if !(self.answer_policy)(event) {
                tracing::info!("Answer policy declined call {}", session.call_id);
                return (ActionOutcome::AnswerDeclined, None);
            }
            session.transition(SessionState::Answering, Utc::now());
            session.call_id.clone()
        };

        let result = with_timeout(
            self.timeout,
            format!("answer {}", call_id),
            self.control.answer(&call_id),
        )
        .await;

        let mut session = lock(&slot.session);
        match result {
            Ok(()) => {
                session.transition(SessionState::Answered, Utc::now());
                (ActionOutcome::Answered, None)
            }
            Err(e) => {
                tracing::warn!("Failed to answer call {}: {}", call_id, e);
                session.transition(SessionState::Failed, Utc::now());
                (ActionOutcome::AnswerFailed, Some(e.to_string()))
            }
        }
    }

    async fn on_established(&self, slot: &SessionSlot) -> (ActionOutcome, Option<String>) {
        let call_id = {
            let session = lock(&slot.session);
            if session.is_terminated() {
                tracing::info!(
                    "Ignoring stale established event for terminated call {}",
                    session.call_id
                );
                return (ActionOutcome::Duplicate, None);
            }
            match session.state {
                SessionState::New | SessionState::Answered | SessionState::Failed => {}
                _ => return (ActionOutcome::Duplicate, None),
            }
            session.call_id.clone()
        };

        let outcome = self.orchestrator.start_recording(&call_id).await;

        let mut session = lock(&slot.session);
        let now = Utc::now();
        match outcome {
            StartOutcome::Started { recording_id } => {
                session.compliance_flags.recording_status_set_to_recording = true;
                if !session.enter_recording(recording_id.clone(), now) {
                    tracing::error!(
                        "COMPLIANCE: call {} refused to enter recording {}",
                        call_id,
                        recording_id
                    );
                    session.transition(SessionState::Failed, now);
                    return (
                        ActionOutcome::RecordingFailed,
                        Some(format!("recording {} not entered", recording_id)),
                    );
                }
                (ActionOutcome::RecordingStarted, None)
            }
            StartOutcome::Failed(failure) => {
                if let RecordingFailure::RecordingStartError(_) = failure {
                    // Remote side already reports "recording"
                    session.compliance_flags.recording_status_set_to_recording = true;
                    session.transition(SessionState::Failed, now);
                }
                (ActionOutcome::RecordingFailed, Some(failure.to_string()))
            }
        }
    }

    async fn on_terminated(&self, slot: &SessionSlot) -> (ActionOutcome, Option<String>) {
        let (call_id, recording_id) = {
            let mut session = lock(&slot.session);
            if session.is_finalized() {
                return (ActionOutcome::Duplicate, None);
            }
            if session.terminated_at.is_none() {
                session.terminated_at = Some(Utc::now());
            }
            (session.call_id.clone(), session.recording_id.clone())
        };

        let outcome = self
            .orchestrator
            .stop_recording(&call_id, recording_id.as_deref())
            .await;

        let mut session = lock(&slot.session);
        let now = Utc::now();
        match outcome {
            StopOutcome::Finalized => {
                session.compliance_flags.recording_status_set_to_not_recording = true;
                session.transition(SessionState::Stopped, now);
                tracing::info!("Call {} recording finalized", call_id);
                (ActionOutcome::RecordingFinalized, None)
            }
            StopOutcome::Cleanup { status_error } => {
                session.transition(SessionState::Stopped, now);
                tracing::warn!(
                    "Call {} recording cleaned up without notRecording status: {}",
                    call_id,
                    status_error
                );
                (ActionOutcome::RecordingCleanup, Some(status_error.to_string()))
            }
            StopOutcome::Failed {
                status_error,
                stop_error,
            } => {
                session.transition(SessionState::Failed, now);
                match &status_error {
                    Some(e) => tracing::error!(
                        "COMPLIANCE: call {} recording not released and notRecording failed: {}",
                        call_id,
                        e
                    ),
                    None => tracing::error!(
                        "Call {} recording not released after notRecording: {}",
                        call_id,
                        stop_error
                    ),
                }
                (ActionOutcome::RecordingFailed, Some(stop_error.to_string()))
            }
        }
    }

    /// Copy of one session, if tracked.
    pub fn session(&self, call_id: &str) -> Option<CallSession> {
        let slot = lock(&self.sessions).get(call_id).cloned()?;
        let session = lock(&slot.session).clone();
        Some(session)
    }

    /// Copies of all tracked sessions, oldest first.
    pub fn snapshot(&self) -> Vec<CallSession> {
        let slots: Vec<Arc<SessionSlot>> = lock(&self.sessions).values().cloned().collect();
        let mut sessions: Vec<CallSession> =
            slots.iter().map(|s| lock(&s.session).clone()).collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Drop sessions whose quiet period after termination has passed.
    /// Sessions with an event in flight are kept.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = lock(&self.sessions);
        let before = sessions.len();
        sessions.retain(|_, slot| {
            let Ok(_gate) = slot.gate.try_lock() else {
                return true;
            };
            let session = lock(&slot.session);
            match session.terminated_at {
                Some(at) => now - at < self.quiet_period,
                None => true,
            }
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            tracing::debug!("Evicted {} ended call sessions", evicted);
        }
        evicted
    }

    /// Periodically evict ended sessions until cancelled.
    pub async fn run_eviction(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    self.evict_expired(Utc::now());
                }
            }
        }
        tracing::debug!("Session eviction stopped");
    }
}
