use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Inbound webhook envelope from the billing provider. `correlation_id`
/// is the username we handed the provider at checkout; `status` only
/// matters for `subscription.updated`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BillingEvent {
    pub event_type: String,
    pub subscription_id: String,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum SubscriptionEventKind {
    #[strum(serialize = "subscription.created")]
    Created,
    #[strum(serialize = "subscription.updated")]
    Updated,
    #[strum(serialize = "subscription.canceled")]
    Canceled,
    #[strum(serialize = "subscription.expired")]
    Expired,
}

impl BillingEvent {
    /// Providers add event types over time; anything unrecognized is
    /// acknowledged and ignored rather than rejected.
    pub fn kind(&self) -> Option<SubscriptionEventKind> {
        self.event_type.parse().ok()
    }

    /// An `updated` event downgrades only when it explicitly reports a
    /// non-active subscription. Absent status means nothing changed.
    pub fn reports_inactive(&self) -> bool {
        match self.status.as_deref() {
            Some(status) => !matches!(status, "active" | "trialing"),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_event_types_parse() {
        let event = BillingEvent {
            event_type: "subscription.created".to_string(),
            subscription_id: "sub_123".to_string(),
            correlation_id: "ada".to_string(),
            status: None,
        };
        assert_eq!(event.kind(), Some(SubscriptionEventKind::Created));
    }

    #[test]
    fn unknown_event_type_is_none() {
        let event = BillingEvent {
            event_type: "invoice.paid".to_string(),
            subscription_id: "sub_123".to_string(),
            correlation_id: "ada".to_string(),
            status: None,
        };
        assert_eq!(event.kind(), None);
    }

    #[test]
    fn updated_event_inactive_detection() {
        let mut event = BillingEvent {
            event_type: "subscription.updated".to_string(),
            subscription_id: "sub_123".to_string(),
            correlation_id: "ada".to_string(),
            status: Some("past_due".to_string()),
        };
        assert!(event.reports_inactive());

        event.status = Some("active".to_string());
        assert!(!event.reports_inactive());

        event.status = None;
        assert!(!event.reports_inactive());
    }

    #[test]
    fn envelope_uses_camel_case_on_the_wire() {
        let event: BillingEvent = serde_json::from_str(
            r#"{"eventType":"subscription.expired","subscriptionId":"sub_9","correlationId":"grace"}"#,
        )
        .expect("should deserialize");
        assert_eq!(event.kind(), Some(SubscriptionEventKind::Expired));
        assert_eq!(event.correlation_id, "grace");
    }
}
