//! Token storage and expiry

use chrono::{DateTime, Duration, Utc};

/// Consider a token expired this long before its real expiry.
const EXPIRY_MARGIN_SECS: i64 = 300;

/// Cached access token
#[derive(Debug, Clone)]
pub struct StoredToken {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredToken {
    pub fn new(token: String, expires_in_secs: Option<u64>, now: DateTime<Utc>) -> Self {
        let expires_at = expires_in_secs.map(|secs| now + Duration::seconds(secs as i64));
        Self { token, expires_at }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            // Less than 5 minutes remaining counts as expired
            Some(exp) => now + Duration::seconds(EXPIRY_MARGIN_SECS) >= exp,
            None => false,
        }
    }
}
