use crate::application::entitlement::{Entitlement, QuotaPolicy};
use crate::domain::UserRecord;
use crate::infrastructure::{
    hash_password, verify_password, AccessTokens, RepositoryError, UserRepository,
};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use validator::Validate;

#[derive(Error, Debug)]
pub enum AccountError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Username already taken")]
    DuplicateUsername,
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Unauthenticated")]
    Unauthenticated,
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("Token error: {0}")]
    Token(String),
}

#[derive(Debug, Validate)]
struct Registration {
    #[validate(length(min = 3, message = "must be at least 3 characters"))]
    username: String,
    #[validate(length(min = 6, message = "must be at least 6 characters"))]
    password: String,
    #[validate(email(message = "must be a valid address"))]
    email: String,
}

pub struct AccountService<R>
where
    R: UserRepository,
{
    repo: Arc<R>,
    tokens: AccessTokens,
    policy: QuotaPolicy,
}

impl<R> AccountService<R>
where
    R: UserRepository,
{
    pub fn new(repo: Arc<R>, tokens: AccessTokens, policy: QuotaPolicy) -> Self {
        Self {
            repo,
            tokens,
            policy,
        }
    }

    /// Creates the record and returns a fresh access token so the
    /// client is signed in immediately.
    pub async fn register(
        &self,
        username: &str,
        password: &str,
        email: &str,
    ) -> Result<String, AccountError> {
        let registration = Registration {
            username: username.to_string(),
            password: password.to_string(),
            email: email.to_string(),
        };
        registration
            .validate()
            .map_err(|e| AccountError::Validation(flatten_validation_errors(&e)))?;

        let user = UserRecord::new(
            registration.username,
            hash_password(password),
            registration.email,
            self.policy.free_daily_scans,
        );

        match self.repo.insert(&user).await {
            Ok(()) => {}
            Err(RepositoryError::Duplicate(_)) => return Err(AccountError::DuplicateUsername),
            Err(e) => return Err(e.into()),
        }

        info!("Registered user: {}", user.username);
        self.issue_token(&user.username)
    }

    /// Bad username and bad password fail identically; the response
    /// must not reveal which usernames exist.
    pub async fn login(&self, username: &str, password: &str) -> Result<String, AccountError> {
        let user = match self.repo.get(username).await {
            Ok(user) => user,
            Err(RepositoryError::NotFound(_)) => return Err(AccountError::InvalidCredentials),
            Err(e) => return Err(e.into()),
        };

        if !verify_password(password, &user.password_hash) {
            return Err(AccountError::InvalidCredentials);
        }

        self.issue_token(&user.username)
    }

    /// Resolves a bearer token to the current user record. Any token
    /// problem, including a valid token for a since-removed user, is
    /// `Unauthenticated`.
    pub async fn authenticate(&self, token: &str) -> Result<UserRecord, AccountError> {
        let claims = self
            .tokens
            .verify(token)
            .map_err(|_| AccountError::Unauthenticated)?;

        match self.repo.get(&claims.sub).await {
            Ok(user) => Ok(user),
            Err(RepositoryError::NotFound(_)) => Err(AccountError::Unauthenticated),
            Err(e) => Err(e.into()),
        }
    }

    /// Read-only entitlement snapshot; nothing is consumed.
    pub fn entitlement_for(&self, user: &UserRecord) -> Entitlement {
        self.policy.evaluate(user, Utc::now())
    }

    fn issue_token(&self, username: &str) -> Result<String, AccountError> {
        self.tokens
            .issue(username)
            .map_err(|e| AccountError::Token(e.to_string()))
    }
}

fn flatten_validation_errors(errors: &validator::ValidationErrors) -> String {
    let mut messages: Vec<String> = errors
        .field_errors()
        .iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| match &e.message {
                Some(message) => format!("{} {}", field, message),
                None => format!("{} is invalid", field),
            })
        })
        .collect();
    messages.sort();
    messages.join("; ")
}
