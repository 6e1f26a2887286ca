//! Push subscription models

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Change types a subscription can listen for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "created" => Some(Self::Created),
            "updated" => Some(Self::Updated),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// Format a change type set the way Graph expects it: `created,updated`.
pub fn join_change_types(set: &BTreeSet<ChangeType>) -> String {
    set.iter()
        .map(ChangeType::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a comma separated change type list. Unknown entries are skipped.
pub fn parse_change_types(raw: &str) -> BTreeSet<ChangeType> {
    raw.split(',').filter_map(ChangeType::parse).collect()
}

/// What to subscribe to: one resource plus its change types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSpec {
    pub resource: String,
    pub change_type: BTreeSet<ChangeType>,
}

impl SubscriptionSpec {
    pub fn new(resource: impl Into<String>, change_type: &[ChangeType]) -> Self {
        Self {
            resource: resource.into(),
            change_type: change_type.iter().copied().collect(),
        }
    }
}

/// One push registration with the platform.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// Absent until the platform has created it.
    pub id: Option<String>,
    pub resource: String,
    pub change_type: BTreeSet<ChangeType>,
    pub notification_url: String,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing)]
    pub client_state: String,
}

impl Subscription {
    pub fn spec(&self) -> SubscriptionSpec {
        SubscriptionSpec {
            resource: self.resource.clone(),
            change_type: self.change_type.clone(),
        }
    }

    pub fn matches(&self, spec: &SubscriptionSpec) -> bool {
        self.resource == spec.resource && self.change_type == spec.change_type
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Due for renewal once fewer than `window` remain before expiry.
    pub fn needs_renewal(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.expires_at - now < window
    }
}
