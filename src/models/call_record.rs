//! Call record entity (Graph `callRecord`)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Summary of a finished call, as returned by the call records API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: Option<String>,
    #[serde(default)]
    pub modalities: Vec<String>,
    pub start_date_time: Option<DateTime<Utc>>,
    pub end_date_time: Option<DateTime<Utc>>,
    pub last_modified_date_time: Option<DateTime<Utc>>,
}
