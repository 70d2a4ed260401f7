use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server_host: String,
    pub server_port: u16,
    pub store_path: String,

    // Secrets; no defaults, startup fails without them.
    pub token_secret: String,
    pub webhook_secret: String,

    pub token_ttl_hours: i64,

    // Comma-separated list; each key carries its own upstream rate
    // ceiling and the client rotates on 429. May be empty, in which
    // case every analysis serves the fallback lesson.
    pub gemini_api_keys: String,
    pub gemini_model: String,
    pub gemini_timeout_secs: u64,

    pub free_daily_scans: u32,
    pub reset_window_hours: i64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("SOCRATIC"))
            .set_default("server_host", "0.0.0.0")?
            .set_default("server_port", 8080)?
            .set_default("store_path", "data/users.json")?
            .set_default("token_ttl_hours", 24)?
            .set_default("gemini_api_keys", "")?
            .set_default("gemini_model", "gemini-2.5-flash")?
            .set_default("gemini_timeout_secs", 30)?
            .set_default("free_daily_scans", 3)?
            .set_default("reset_window_hours", 24)?
            .build()?;

        config.try_deserialize()
    }

    pub fn gemini_keys(&self) -> Vec<String> {
        self.gemini_api_keys
            .split(',')
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect()
    }
}
