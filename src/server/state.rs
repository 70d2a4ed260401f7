use crate::application::{
    AccountService, AnalysisService, BillingService, QuotaPolicy, TrialRegistry,
};
use crate::infrastructure::{AccessTokens, AppConfig, GeminiClient, JsonFileUserStore};
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;

pub type AccountServiceType = AccountService<JsonFileUserStore>;
pub type AnalysisServiceType = AnalysisService<JsonFileUserStore, GeminiClient>;
pub type BillingServiceType = BillingService<JsonFileUserStore>;

#[derive(Clone)]
pub struct AppState {
    pub users: Arc<JsonFileUserStore>,
    pub accounts: Arc<AccountServiceType>,
    pub analysis: Arc<AnalysisServiceType>,
    pub billing: Arc<BillingServiceType>,
    pub trials: Arc<TrialRegistry>,
    pub ai_configured: bool,
}

/// Build full state from config + an already opened store.
///
/// Intended for embedding into a larger service that manages the store itself.
pub async fn build_state_with_store(
    config: AppConfig,
    users: Arc<JsonFileUserStore>,
) -> anyhow::Result<AppState> {
    let gemini = Arc::new(
        GeminiClient::new(
            config.gemini_keys(),
            config.gemini_model.clone(),
            Duration::from_secs(config.gemini_timeout_secs),
        )
        .context("init Gemini client")?,
    );
    let ai_configured = gemini.is_configured();

    let tokens = AccessTokens::new(config.token_secret.clone(), config.token_ttl_hours);
    let policy = QuotaPolicy::new(config.free_daily_scans, config.reset_window_hours);

    let accounts = Arc::new(AccountService::new(users.clone(), tokens, policy));
    let analysis = Arc::new(AnalysisService::new(users.clone(), gemini, policy));
    let billing = Arc::new(BillingService::new(
        users.clone(),
        policy,
        config.webhook_secret.clone(),
    ));

    Ok(AppState {
        users,
        accounts,
        analysis,
        billing,
        trials: Arc::new(TrialRegistry::new()),
        ai_configured,
    })
}

/// Build state for the standalone server.
///
/// Opens and validates the user store at the configured path, then wires services.
pub async fn build_state_from_env(config: AppConfig) -> anyhow::Result<AppState> {
    let users = Arc::new(
        JsonFileUserStore::open(config.store_path.clone())
            .await
            .context("open user store")?,
    );
    build_state_with_store(config, users).await
}
