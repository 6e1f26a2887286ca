//! In-process recording registry
//!
//! Tracks which calls have an open recording resource. Capturing and
//! uploading the media itself happens outside this service; this registry is
//! what the compliance protocol opens and releases.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{MediaRecorder, RecorderError};

#[derive(Debug, Clone)]
struct ActiveRecording {
    call_id: String,
    started_at: DateTime<Utc>,
}

/// Recording resources held by this process, keyed by recording id.
pub struct LocalRecorder {
    active: Mutex<HashMap<String, ActiveRecording>>,
    max_concurrent: usize,
}

impl LocalRecorder {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            max_concurrent,
        }
    }

    #[cfg(test)]
    pub fn active_count(&self) -> usize {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl MediaRecorder for LocalRecorder {
    async fn start(&self, call_id: &str) -> Result<String, RecorderError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.len() >= self.max_concurrent {
            return Err(RecorderError::CapacityExceeded(self.max_concurrent));
        }
        if let Some((id, _)) = active.iter().find(|(_, rec)| rec.call_id == call_id) {
            return Err(RecorderError::Rejected(format!(
                "call {} already has open recording {}",
                call_id, id
            )));
        }

        let recording_id = uuid::Uuid::new_v4().to_string();
        active.insert(
            recording_id.clone(),
            ActiveRecording {
                call_id: call_id.to_string(),
                started_at: Utc::now(),
            },
        );
        tracing::info!("Opened recording {} for call {}", recording_id, call_id);
        Ok(recording_id)
    }

    async fn stop(&self, recording_id: &str) -> Result<(), RecorderError> {
        let removed = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(recording_id);

        match removed {
            Some(rec) => {
                let secs = (Utc::now() - rec.started_at).num_seconds();
                tracing::info!(
                    "Closed recording {} for call {} after {}s",
                    recording_id,
                    rec.call_id,
                    secs
                );
            }
            // Already stopped: nothing to release
            None => tracing::debug!("Recording {} not active, stop is a no-op", recording_id),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let recorder = LocalRecorder::new(4);
        let id = recorder.start("c1").await.unwrap();
        assert_eq!(recorder.active_count(), 1);

        assert_ok!(recorder.stop(&id).await);
        assert_ok!(recorder.stop(&id).await);
        assert_eq!(recorder.active_count(), 0);
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let recorder = LocalRecorder::new(1);
        assert_ok!(recorder.start("c1").await);
        assert_err!(recorder.start("c2").await);
    }

    #[tokio::test]
    async fn test_one_open_recording_per_call() {
        let recorder = LocalRecorder::new(4);
        let id = recorder.start("c1").await.unwrap();

        let second = recorder.start("c1").await;
        assert!(matches!(second, Err(RecorderError::Rejected(_))));
        assert_eq!(recorder.active_count(), 1);

        assert_ok!(recorder.stop(&id).await);
        assert_ok!(recorder.start("c1").await);
    }
}
