//! Call records query on `/communications/callRecords`

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;

use super::client::{json_body, GraphClient};
use super::{ApiError, CallRecordsApi};
use crate::models::CallRecord;

/// Call records page from Graph API
#[derive(Debug, Deserialize)]
struct CallRecordsResponse {
    value: Vec<CallRecord>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

/// Query path for records started in `[since, until)`.
fn window_path(since: DateTime<Utc>, until: DateTime<Utc>) -> String {
    let filter = format!(
        "startDateTime ge {} and startDateTime lt {}",
        since.to_rfc3339_opts(SecondsFormat::Secs, true),
        until.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    let encoded: String = url::form_urlencoded::byte_serialize(filter.as_bytes()).collect();
    format!("/communications/callRecords?$filter={}", encoded)
}

#[async_trait]
impl CallRecordsApi for GraphClient {
    async fn list_call_records(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<CallRecord>, ApiError> {
        let mut records = Vec::new();
        let mut next = Some(window_path(since, until));

        while let Some(path) = next.take() {
            let resp = self.get(&path).await?;
            let page: CallRecordsResponse = json_body(resp).await?;
            records.extend(page.value);
            next = page.next_link;
        }

        tracing::debug!(
            "Fetched {} call records between {} and {}",
            records.len(),
            since,
            until
        );
        Ok(records)
    }
}
