//! Call events and per-call sessions

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Call state label as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Incoming,
    Establishing,
    Established,
    Terminated,
    Disconnected,
    /// Any label we do not act on, kept verbatim for logging.
    Unknown(String),
}

impl CallState {
    /// Parse a platform state label (case-insensitive).
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "incoming" => Self::Incoming,
            "establishing" => Self::Establishing,
            "established" => Self::Established,
            "terminated" => Self::Terminated,
            "disconnected" => Self::Disconnected,
            _ => Self::Unknown(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Incoming => "incoming",
            Self::Establishing => "establishing",
            Self::Established => "established",
            Self::Terminated => "terminated",
            Self::Disconnected => "disconnected",
            Self::Unknown(raw) => raw,
        }
    }
}

/// Call direction relative to the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Incoming,
    Outgoing,
    Unknown,
}

impl CallDirection {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "incoming" => Self::Incoming,
            "outgoing" => Self::Outgoing,
            _ => Self::Unknown,
        }
    }
}

/// Canonical call notification extracted from any accepted webhook shape.
#[derive(Debug, Clone)]
pub struct CallEvent {
    /// Required to act on the event. Events without it are only acknowledged.
    pub call_id: Option<String>,
    pub state: CallState,
    pub direction: CallDirection,
    /// Opaque pass-through fields, used for logging only.
    pub raw_source: Option<serde_json::Value>,
    pub raw_targets: Option<serde_json::Value>,
    pub raw_callback_uri: Option<String>,
    /// `clientState` from a push envelope, if any.
    pub client_state: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Value sent to the platform's `updateRecordingStatus` action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingStatus {
    Recording,
    NotRecording,
}

impl RecordingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recording => "recording",
            Self::NotRecording => "notRecording",
        }
    }
}

/// Lifecycle state of a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    New,
    Answering,
    Answered,
    Recording,
    Stopped,
    Failed,
}

/// Which halves of the recording status protocol have succeeded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceFlags {
    pub recording_status_set_to_recording: bool,
    pub recording_status_set_to_not_recording: bool,
}

/// Result of handling one call event, as reported to the webhook caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Answered,
    AnswerDeclined,
    AnswerFailed,
    RecordingStarted,
    RecordingFailed,
    RecordingFinalized,
    RecordingCleanup,
    /// The session already passed the state this event asks for.
    Duplicate,
    /// Unknown state label or event without a call id.
    Ignored,
}

impl ActionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Answered => "answered",
            Self::AnswerDeclined => "answer_declined",
            Self::AnswerFailed => "answer_failed",
            Self::RecordingStarted => "recording_started",
            Self::RecordingFailed => "recording_failed",
            Self::RecordingFinalized => "recording_finalized",
            Self::RecordingCleanup => "recording_cleanup",
            Self::Duplicate => "duplicate",
            Self::Ignored => "ignored",
        }
    }
}

/// Mutable per-call state, owned by the call state machine.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub call_id: String,
    pub state: SessionState,
    pub recording_id: Option<String>,
    pub last_transition_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub compliance_flags: ComplianceFlags,
    /// Set on the first terminated/disconnected event; drives eviction.
    pub terminated_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<ActionOutcome>,
}

impl CallSession {
    pub fn new(call_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            call_id: call_id.into(),
            state: SessionState::New,
            recording_id: None,
            last_transition_at: now,
            created_at: now,
            compliance_flags: ComplianceFlags::default(),
            terminated_at: None,
            last_outcome: None,
        }
    }

    /// Move to any state except `Recording` (use [`CallSession::enter_recording`]).
    pub fn transition(&mut self, state: SessionState, now: DateTime<Utc>) {
        debug_assert!(state != SessionState::Recording);
        if state == SessionState::Recording {
            return;
        }
        self.state = state;
        self.last_transition_at = now;
    }

    /// Enter `Recording`. Refused unless the remote status was acknowledged
    /// as "recording" first.
    #[must_use]
    pub fn enter_recording(&mut self, recording_id: String, now: DateTime<Utc>) -> bool {
        if !self.compliance_flags.recording_status_set_to_recording {
            return false;
        }
        self.recording_id = Some(recording_id);
        self.state = SessionState::Recording;
        self.last_transition_at = now;
        true
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated_at.is_some()
    }

    /// Whether a stop already completed the full compliant shutdown.
    pub fn is_finalized(&self) -> bool {
        self.state == SessionState::Stopped
            && self.compliance_flags.recording_status_set_to_not_recording
    }
}
