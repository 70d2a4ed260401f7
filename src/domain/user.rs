use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One registered identity. Serialized as-is into the JSON user store,
/// keyed by `username`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserRecord {
    pub username: String,
    pub password_hash: String,
    pub email: String,
    pub is_premium: bool,
    pub daily_scans_left: u32,
    pub last_reset: DateTime<Utc>,
    pub subscription_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn new(username: String, password_hash: String, email: String, free_quota: u32) -> Self {
        let now = Utc::now();
        Self {
            username,
            password_hash,
            email,
            is_premium: false,
            daily_scans_left: free_quota,
            last_reset: now,
            subscription_id: None,
            created_at: now,
        }
    }
}
