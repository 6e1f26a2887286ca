//! Compliance recording orchestration
//!
//! Teams requires the call's recording status to be acknowledged by the
//! platform before the corresponding local recording action:
//!
//! - start: set status `recording`, then open the recording resource
//! - stop: set status `notRecording`, then release the recording resource
//!
//! A start is refused when its status update fails. A stop always attempts
//! the local release, since termination must free resources even when the
//! status update did not go through.

mod local;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::api::{with_timeout, ApiError, CallControl};
use crate::models::RecordingStatus;
pub use local::LocalRecorder;

/// Local recording resource control.
#[async_trait]
pub trait MediaRecorder: Send + Sync {
    /// Open a recording for `call_id`. Returns the recording id.
    async fn start(&self, call_id: &str) -> Result<String, RecorderError>;

    /// Release a recording. Stopping an unknown or stopped recording succeeds.
    async fn stop(&self, recording_id: &str) -> Result<(), RecorderError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RecorderError {
    #[error("recording capacity of {0} reached")]
    CapacityExceeded(usize),
    #[error("recorder {operation} timed out after {secs}s", secs = .after.as_secs())]
    Timeout { operation: String, after: Duration },
    #[error("recorder rejected the request: {0}")]
    Rejected(String),
}

/// Why a start did not reach `Recording`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RecordingFailure {
    /// Remote status was never acknowledged; nothing was recorded.
    #[error("status update to recording failed: {0}")]
    StatusUpdateFailed(ApiError),
    /// Remote status says "recording" but the local recording did not open.
    #[error("recording start failed after status was set to recording: {0}")]
    RecordingStartError(RecorderError),
}

#[derive(Debug, Clone)]
pub enum StartOutcome {
    Started { recording_id: String },
    Failed(RecordingFailure),
}

#[derive(Debug, Clone)]
pub enum StopOutcome {
    /// Status set to notRecording and the resource released.
    Finalized,
    /// Resource released, but the status update failed.
    Cleanup { status_error: ApiError },
    /// The resource could not be released.
    Failed {
        status_error: Option<ApiError>,
        stop_error: RecorderError,
    },
}

/// Runs the two-phase recording protocol against the platform and recorder.
pub struct ComplianceOrchestrator {
    control: Arc<dyn CallControl>,
    recorder: Arc<dyn MediaRecorder>,
    timeout: Duration,
}

impl ComplianceOrchestrator {
    pub fn new(
        control: Arc<dyn CallControl>,
        recorder: Arc<dyn MediaRecorder>,
        timeout: Duration,
    ) -> Self {
        Self {
            control,
            recorder,
            timeout,
        }
    }

    async fn set_status(&self, call_id: &str, status: RecordingStatus) -> Result<(), ApiError> {
        with_timeout(
            self.timeout,
            format!("updateRecordingStatus({}) for {}", status.as_str(), call_id),
            self.control.update_recording_status(call_id, status),
        )
        .await
    }

    /// Set status `recording`, then open the recording.
    pub async fn start_recording(&self, call_id: &str) -> StartOutcome {
        if let Err(e) = self.set_status(call_id, RecordingStatus::Recording).await {
            tracing::warn!(
                "Refusing to record call {}: status update failed: {}",
                call_id,
                e
            );
            return StartOutcome::Failed(RecordingFailure::StatusUpdateFailed(e));
        }

        let started = match tokio::time::timeout(self.timeout, self.recorder.start(call_id)).await
        {
            Ok(result) => result,
            Err(_) => Err(RecorderError::Timeout {
                operation: format!("start for {}", call_id),
                after: self.timeout,
            }),
        };

        match started {
            Ok(recording_id) => {
                tracing::info!("Recording {} started for call {}", recording_id, call_id);
                StartOutcome::Started { recording_id }
            }
            Err(e) => {
                tracing::error!(
                    "COMPLIANCE: call {} reports status=recording but no recording is running: {}",
                    call_id,
                    e
                );
                StartOutcome::Failed(RecordingFailure::RecordingStartError(e))
            }
        }
    }

    /// Set status `notRecording`, then release `recording_id` regardless of
    /// the status result. One attempt each; callers may retry on a later event.
    pub async fn stop_recording(&self, call_id: &str, recording_id: Option<&str>) -> StopOutcome {
        let status_result = self.set_status(call_id, RecordingStatus::NotRecording).await;
        if let Err(ref e) = status_result {
            tracing::warn!(
                "Status update to notRecording failed for call {}, cleaning up anyway: {}",
                call_id,
                e
            );
        }

        let stop_result = match recording_id {
            Some(id) => match tokio::time::timeout(self.timeout, self.recorder.stop(id)).await {
                Ok(result) => result,
                Err(_) => Err(RecorderError::Timeout {
                    operation: format!("stop of {}", id),
                    after: self.timeout,
                }),
            },
            None => Ok(()),
        };

        match (status_result, stop_result) {
            (Ok(()), Ok(())) => StopOutcome::Finalized,
            (Err(status_error), Ok(())) => StopOutcome::Cleanup { status_error },
            (status, Err(stop_error)) => {
                tracing::error!(
                    "Failed to release recording {:?} for call {}: {}",
                    recording_id,
                    call_id,
                    stop_error
                );
                StopOutcome::Failed {
                    status_error: status.err(),
                    stop_error,
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn orchestrator(control: FakeControl, recorder: FakeRecorder) -> ComplianceOrchestrator {
        ComplianceOrchestrator::new(
            Arc::new(control),
            Arc::new(recorder),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_start_sets_status_before_recording() {
        let log = CallLog::default();
        let orch = orchestrator(
            FakeControl {
                log: log.clone(),
                ..Default::default()
            },
            FakeRecorder {
                log: log.clone(),
                ..Default::default()
            },
        );

        let outcome = orch.start_recording("c1").await;
        assert!(matches!(
            outcome,
            StartOutcome::Started { ref recording_id } if recording_id == "rec-c1"
        ));
        assert_eq!(entries(&log), vec!["status:c1:recording", "media_start:c1"]);
    }

    #[tokio::test]
    async fn test_start_refused_when_status_fails() {
        let log = CallLog::default();
        let orch = orchestrator(
            FakeControl {
                log: log.clone(),
                fail_recording: true,
                ..Default::default()
            },
            FakeRecorder {
                log: log.clone(),
                ..Default::default()
            },
        );

        let outcome = orch.start_recording("c1").await;
        assert!(matches!(
            outcome,
            StartOutcome::Failed(RecordingFailure::StatusUpdateFailed(_))
        ));
        assert_eq!(entries(&log), vec!["status:c1:recording"]);
    }

    #[tokio::test]
    async fn test_start_error_after_status_is_reported() {
        let log = CallLog::default();
        let orch = orchestrator(
            FakeControl {
                log: log.clone(),
                ..Default::default()
            },
            FakeRecorder {
                log: log.clone(),
                fail_start: true,
                ..Default::default()
            },
        );

        let outcome = orch.start_recording("c1").await;
        assert!(matches!(
            outcome,
            StartOutcome::Failed(RecordingFailure::RecordingStartError(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_cleans_up_when_status_fails() {
        let log = CallLog::default();
        let orch = orchestrator(
            FakeControl {
                log: log.clone(),
                fail_not_recording: true,
                ..Default::default()
            },
            FakeRecorder {
                log: log.clone(),
                ..Default::default()
            },
        );

        let outcome = orch.stop_recording("c1", Some("rec-c1")).await;
        assert!(matches!(outcome, StopOutcome::Cleanup { .. }));
        assert_eq!(
            entries(&log),
            vec!["status:c1:notRecording", "media_stop:rec-c1"]
        );
    }

    #[tokio::test]
    async fn test_stop_without_recording_still_sets_status() {
        let log = CallLog::default();
        let orch = orchestrator(
            FakeControl {
                log: log.clone(),
                ..Default::default()
            },
            FakeRecorder {
                log: log.clone(),
                ..Default::default()
            },
        );

        let outcome = orch.stop_recording("c1", None).await;
        assert!(matches!(outcome, StopOutcome::Finalized));
        assert_eq!(entries(&log), vec!["status:c1:notRecording"]);
    }

    #[tokio::test]
    async fn test_stop_failure_keeps_status_error() {
        let log = CallLog::default();
        let orch = orchestrator(
            FakeControl {
                log: log.clone(),
                fail_not_recording: true,
                ..Default::default()
            },
            FakeRecorder {
                log: log.clone(),
                fail_stop: true,
                ..Default::default()
            },
        );

        match orch.stop_recording("c1", Some("rec-c1")).await {
            StopOutcome::Failed {
                status_error,
                stop_error,
            } => {
                assert!(status_error.is_some());
                assert!(matches!(stop_error, RecorderError::Rejected(_)));
            }
            other => panic!("expected Failed, got {:?}", other),
        }
    }
}
