use crate::domain::UserRecord;
use chrono::{DateTime, Duration, Utc};
use serde::{Serialize, Serializer};

/// Free-tier quota rules. Values come from configuration; the defaults
/// (3 scans, 24h window) match the product contract.
#[derive(Debug, Clone, Copy)]
pub struct QuotaPolicy {
    pub free_daily_scans: u32,
    pub reset_window: Duration,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            free_daily_scans: 3,
            reset_window: Duration::hours(24),
        }
    }
}

/// What a user sees as their remaining allowance. Serializes to a bare
/// number for free users and the string `"unlimited"` for premium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScansRemaining {
    Unlimited,
    Count(u32),
}

impl Serialize for ScansRemaining {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Unlimited => serializer.serialize_str("unlimited"),
            Self::Count(n) => serializer.serialize_u32(*n),
        }
    }
}

/// Snapshot of a user's right to run one more analysis right now.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entitlement {
    pub allowed: bool,
    #[serde(rename = "scansLeft")]
    pub remaining: ScansRemaining,
    pub is_premium: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resets_at: Option<DateTime<Utc>>,
}

impl QuotaPolicy {
    pub fn new(free_daily_scans: u32, reset_window_hours: i64) -> Self {
        Self {
            free_daily_scans,
            reset_window: Duration::hours(reset_window_hours),
        }
    }

    /// Pure read. The lazy reset is applied logically here; the stored
    /// counter is only rewritten by `consume`.
    pub fn evaluate(&self, record: &UserRecord, now: DateTime<Utc>) -> Entitlement {
        if record.is_premium {
            return Entitlement {
                allowed: true,
                remaining: ScansRemaining::Unlimited,
                is_premium: true,
                resets_at: None,
            };
        }

        let (remaining, resets_at) = if self.window_elapsed(record, now) {
            (self.free_daily_scans, now + self.reset_window)
        } else {
            (record.daily_scans_left, record.last_reset + self.reset_window)
        };

        Entitlement {
            allowed: remaining > 0,
            remaining: ScansRemaining::Count(remaining),
            is_premium: false,
            resets_at: Some(resets_at),
        }
    }

    /// One unit of consumption. Callers invoke this only after
    /// `evaluate` allowed the request, at most once per analysis.
    pub fn consume(&self, record: &UserRecord, now: DateTime<Utc>) -> UserRecord {
        let mut updated = record.clone();
        if updated.is_premium {
            return updated;
        }

        if self.window_elapsed(record, now) {
            updated.last_reset = now;
            updated.daily_scans_left = self.free_daily_scans.saturating_sub(1);
        } else {
            updated.daily_scans_left = updated.daily_scans_left.saturating_sub(1);
        }
        updated
    }

    /// Downgrade transition: premium is switched off and the billing
    /// correlation is cleared. A full free quota starts from the
    /// downgrade instant; the pre-premium counter and window are not
    /// resumed.
    pub fn restore(&self, record: &UserRecord, now: DateTime<Utc>) -> UserRecord {
        let mut updated = record.clone();
        updated.is_premium = false;
        updated.subscription_id = None;
        updated.daily_scans_left = self.free_daily_scans;
        updated.last_reset = now;
        updated
    }

    // Inclusive on purpose: a request landing exactly on the boundary
    // counts as a fresh window.
    fn window_elapsed(&self, record: &UserRecord, now: DateTime<Utc>) -> bool {
        now - record.last_reset >= self.reset_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_user(scans_left: u32, last_reset: DateTime<Utc>) -> UserRecord {
        UserRecord {
            username: "ada".to_string(),
            password_hash: "pbkdf2-sha256$1$c2FsdA$aGFzaA".to_string(),
            email: "ada@example.com".to_string(),
            is_premium: false,
            daily_scans_left: scans_left,
            last_reset,
            subscription_id: None,
            created_at: last_reset,
        }
    }

    fn premium_user(scans_left: u32) -> UserRecord {
        let mut user = free_user(scans_left, Utc::now());
        user.is_premium = true;
        user.subscription_id = Some("sub_42".to_string());
        user
    }

    #[test]
    fn exhausted_free_user_within_window_is_denied() {
        let policy = QuotaPolicy::default();
        let now = Utc::now();
        let user = free_user(0, now - Duration::hours(1));

        let entitlement = policy.evaluate(&user, now);
        assert!(!entitlement.allowed);
        assert_eq!(entitlement.remaining, ScansRemaining::Count(0));
    }

    #[test]
    fn elapsed_window_allows_regardless_of_stored_counter() {
        let policy = QuotaPolicy::default();
        let now = Utc::now();
        let user = free_user(0, now - Duration::hours(25));

        let entitlement = policy.evaluate(&user, now);
        assert!(entitlement.allowed);
        assert_eq!(entitlement.remaining, ScansRemaining::Count(3));
    }

    #[test]
    fn boundary_is_inclusive() {
        let policy = QuotaPolicy::default();
        let now = Utc::now();
        let user = free_user(0, now - Duration::hours(24));

        let entitlement = policy.evaluate(&user, now);
        assert!(entitlement.allowed, "exactly 24h counts as elapsed");
    }

    #[test]
    fn one_second_short_of_the_window_is_not_elapsed() {
        let policy = QuotaPolicy::default();
        let now = Utc::now();
        let user = free_user(0, now - (Duration::hours(24) - Duration::seconds(1)));

        let entitlement = policy.evaluate(&user, now);
        assert!(!entitlement.allowed);
    }

    #[test]
    fn premium_is_always_allowed() {
        let policy = QuotaPolicy::default();
        let now = Utc::now();

        let entitlement = policy.evaluate(&premium_user(0), now);
        assert!(entitlement.allowed);
        assert_eq!(entitlement.remaining, ScansRemaining::Unlimited);
        assert!(entitlement.resets_at.is_none());
    }

    #[test]
    fn consume_decrements_within_window() {
        let policy = QuotaPolicy::default();
        let now = Utc::now();
        let user = free_user(3, now - Duration::hours(2));

        let updated = policy.consume(&user, now);
        assert_eq!(updated.daily_scans_left, 2);
        assert_eq!(updated.last_reset, user.last_reset, "window start untouched");
    }

    #[test]
    fn consume_resets_then_decrements_after_window() {
        let policy = QuotaPolicy::default();
        let now = Utc::now();
        let user = free_user(0, now - Duration::hours(30));

        let updated = policy.consume(&user, now);
        assert_eq!(updated.daily_scans_left, 2);
        assert_eq!(updated.last_reset, now);
    }

    #[test]
    fn consume_saturates_at_zero() {
        let policy = QuotaPolicy::default();
        let now = Utc::now();
        let user = free_user(0, now - Duration::hours(1));

        let updated = policy.consume(&user, now);
        assert_eq!(updated.daily_scans_left, 0);
    }

    #[test]
    fn consume_is_a_noop_for_premium() {
        let policy = QuotaPolicy::default();
        let now = Utc::now();
        let user = premium_user(1);

        let updated = policy.consume(&user, now);
        assert_eq!(updated, user);
    }

    #[test]
    fn last_scan_then_denial() {
        let policy = QuotaPolicy::default();
        let now = Utc::now();
        let user = free_user(1, now - Duration::hours(1));

        assert!(policy.evaluate(&user, now).allowed);
        let updated = policy.consume(&user, now);
        assert_eq!(updated.daily_scans_left, 0);
        assert!(!policy.evaluate(&updated, now).allowed);
    }

    #[test]
    fn restore_rebuilds_the_free_tier() {
        let policy = QuotaPolicy::default();
        let now = Utc::now();
        let user = premium_user(0);

        let updated = policy.restore(&user, now);
        assert!(!updated.is_premium);
        assert!(updated.subscription_id.is_none());
        assert_eq!(updated.daily_scans_left, 3);
        assert_eq!(updated.last_reset, now);
    }

    #[test]
    fn remaining_serializes_as_number_or_unlimited() {
        let count = serde_json::to_value(ScansRemaining::Count(2)).expect("should serialize");
        assert_eq!(count, serde_json::json!(2));

        let unlimited = serde_json::to_value(ScansRemaining::Unlimited).expect("should serialize");
        assert_eq!(unlimited, serde_json::json!("unlimited"));
    }
}
