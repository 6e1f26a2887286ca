//! Call control on `/communications/calls`

use async_trait::async_trait;

use super::client::GraphClient;
use super::{ApiError, CallControl};
use crate::models::RecordingStatus;

/// Answer request body. Media is hosted by the platform; the bot only signals.
fn answer_body(callback_uri: &str) -> serde_json::Value {
    serde_json::json!({
        "callbackUri": callback_uri,
        "acceptedModalities": ["audio"],
        "mediaConfig": {
            "@odata.type": "#microsoft.graph.serviceHostedMediaConfig"
        }
    })
}

fn recording_status_body(status: RecordingStatus) -> serde_json::Value {
    serde_json::json!({
        "clientContext": uuid::Uuid::new_v4().to_string(),
        "status": status.as_str()
    })
}

#[async_trait]
impl CallControl for GraphClient {
    async fn answer(&self, call_id: &str) -> Result<(), ApiError> {
        let path = format!("/communications/calls/{}/answer", call_id);
        self.post(&path, &answer_body(self.callback_url())).await?;
        tracing::info!("Answered call {}", call_id);
        Ok(())
    }

    async fn update_recording_status(
        &self,
        call_id: &str,
        status: RecordingStatus,
    ) -> Result<(), ApiError> {
        let path = format!("/communications/calls/{}/updateRecordingStatus", call_id);
        self.post(&path, &recording_status_body(status)).await?;
        tracing::info!("Recording status for {} set to {}", call_id, status.as_str());
        Ok(())
    }
}
