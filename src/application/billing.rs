use crate::application::entitlement::QuotaPolicy;
use crate::domain::{BillingEvent, SubscriptionEventKind, UserRecord};
use crate::infrastructure::{verify_webhook_signature, RepositoryError, UserRepository};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("Signature invalid")]
    SignatureInvalid,
    #[error("Malformed payload: {0}")]
    Malformed(String),
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// What a verified delivery did. Everything here is acknowledged with a
/// 200 so the provider stops redelivering; the variants keep applied
/// mutations distinguishable from ignored traffic in logs and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied {
        username: String,
        kind: SubscriptionEventKind,
    },
    /// Redelivery of an event whose effect is already in place.
    Unchanged { username: String },
    UnknownUser { correlation_id: String },
    Ignored { event_type: String },
}

pub struct BillingService<R>
where
    R: UserRepository,
{
    repo: Arc<R>,
    policy: QuotaPolicy,
    webhook_secret: String,
}

impl<R> BillingService<R>
where
    R: UserRepository,
{
    pub fn new(repo: Arc<R>, policy: QuotaPolicy, webhook_secret: String) -> Self {
        Self {
            repo,
            policy,
            webhook_secret,
        }
    }

    /// Full webhook path: verify the signature over the exact raw bytes
    /// received, then parse and apply. Verification comes first; a
    /// forged body must not even be parsed.
    pub async fn process(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookOutcome, WebhookError> {
        let signature = signature.ok_or(WebhookError::SignatureInvalid)?;
        if !verify_webhook_signature(&self.webhook_secret, raw_body, signature) {
            warn!("Billing webhook signature mismatch; dropping delivery");
            return Err(WebhookError::SignatureInvalid);
        }

        let event: BillingEvent = serde_json::from_slice(raw_body)
            .map_err(|e| WebhookError::Malformed(e.to_string()))?;
        self.apply(&event).await
    }

    /// Event state machine. Deliveries are at-least-once; every branch
    /// is safe to run twice.
    pub async fn apply(&self, event: &BillingEvent) -> Result<WebhookOutcome, WebhookError> {
        let Some(kind) = event.kind() else {
            info!("Ignoring unrecognized billing event type: {}", event.event_type);
            return Ok(WebhookOutcome::Ignored {
                event_type: event.event_type.clone(),
            });
        };

        let Some(user) = self.resolve_user(event).await? else {
            warn!(
                "Billing event {} matched no user (correlation: {})",
                event.event_type, event.correlation_id
            );
            return Ok(WebhookOutcome::UnknownUser {
                correlation_id: event.correlation_id.clone(),
            });
        };

        match kind {
            SubscriptionEventKind::Created => self.grant_premium(user, event).await,
            SubscriptionEventKind::Updated => {
                if event.reports_inactive() {
                    self.revoke_premium(user, kind).await
                } else {
                    info!(
                        "Subscription update for {} leaves entitlement unchanged",
                        user.username
                    );
                    Ok(WebhookOutcome::Unchanged {
                        username: user.username,
                    })
                }
            }
            SubscriptionEventKind::Canceled | SubscriptionEventKind::Expired => {
                self.revoke_premium(user, kind).await
            }
        }
    }

    async fn grant_premium(
        &self,
        mut user: UserRecord,
        event: &BillingEvent,
    ) -> Result<WebhookOutcome, WebhookError> {
        if user.is_premium && user.subscription_id.as_deref() == Some(&event.subscription_id) {
            info!(
                "Premium already active for {} (subscription {})",
                user.username, event.subscription_id
            );
            return Ok(WebhookOutcome::Unchanged {
                username: user.username,
            });
        }

        user.is_premium = true;
        user.subscription_id = Some(event.subscription_id.clone());
        self.repo.upsert(&user).await?;

        info!(
            "Premium granted to {} (subscription {})",
            user.username, event.subscription_id
        );
        Ok(WebhookOutcome::Applied {
            username: user.username,
            kind: SubscriptionEventKind::Created,
        })
    }

    async fn revoke_premium(
        &self,
        user: UserRecord,
        kind: SubscriptionEventKind,
    ) -> Result<WebhookOutcome, WebhookError> {
        // A late duplicate cancellation must not refill a quota the
        // user has since been spending.
        if !user.is_premium && user.subscription_id.is_none() {
            info!("Cancellation for {} already effective", user.username);
            return Ok(WebhookOutcome::Unchanged {
                username: user.username,
            });
        }

        let restored = self.policy.restore(&user, Utc::now());
        self.repo.upsert(&restored).await?;

        info!("Premium revoked for {} ({})", restored.username, kind);
        Ok(WebhookOutcome::Applied {
            username: restored.username,
            kind,
        })
    }

    // Correlation value first (it is the username we set at checkout);
    // fall back to the subscription id for deliveries whose correlation
    // no longer resolves.
    async fn resolve_user(&self, event: &BillingEvent) -> Result<Option<UserRecord>, WebhookError> {
        match self.repo.get(&event.correlation_id).await {
            Ok(user) => Ok(Some(user)),
            Err(RepositoryError::NotFound(_)) => Ok(self
                .repo
                .find_by_subscription_id(&event.subscription_id)
                .await?),
            Err(e) => Err(e.into()),
        }
    }
}
