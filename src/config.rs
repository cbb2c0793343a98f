use std::env;
use std::time::Duration;

use anyhow::Context;
use dotenvy::dotenv;
use serde::Deserialize;
use url::Url;

use crate::provider::ProviderSettings;
use crate::services::mapper::TransactionMapper;
use crate::services::sync::SyncOptions;

pub const DEFAULT_PROVIDER_BASE_URL: &str = "https://bankaccountdata.gocardless.com";
pub const MAX_LOOKBACK_DAYS: i64 = 3650;
pub const MAX_PROVIDER_RETRIES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub provider_base_url: String,
    pub provider_secret_id: String,
    pub provider_secret_key: String,
    pub provider_timeout_secs: u64,
    pub provider_max_retries: u32,
    pub provider_require_stable_ids: bool,
    pub sync_concurrency: usize,
    pub sync_lookback_days: i64,
    pub sync_account_timeout_secs: u64,
    pub sync_interval_secs: u64,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok(); // Load .env file if present

        Self::from_source(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; `from_env` passes the process environment.
    pub fn from_source<F>(get: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| get(key).with_context(|| format!("{} must be set", key));
        let or_default = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let provider_base_url = or_default("PROVIDER_BASE_URL", DEFAULT_PROVIDER_BASE_URL);
        Url::parse(&provider_base_url)
            .with_context(|| format!("PROVIDER_BASE_URL is not a valid URL: {}", provider_base_url))?;

        let sync_concurrency: usize = or_default("SYNC_CONCURRENCY", "4")
            .parse()
            .context("SYNC_CONCURRENCY must be a positive integer")?;
        if sync_concurrency == 0 {
            anyhow::bail!("SYNC_CONCURRENCY must be at least 1");
        }

        let provider_max_retries: u32 = or_default("PROVIDER_MAX_RETRIES", "3")
            .parse()
            .context("PROVIDER_MAX_RETRIES must be an integer")?;
        if provider_max_retries > MAX_PROVIDER_RETRIES {
            anyhow::bail!("PROVIDER_MAX_RETRIES must be at most {}", MAX_PROVIDER_RETRIES);
        }

        let sync_lookback_days: i64 = or_default("SYNC_LOOKBACK_DAYS", "90")
            .parse()
            .context("SYNC_LOOKBACK_DAYS must be an integer")?;
        if !(1..=MAX_LOOKBACK_DAYS).contains(&sync_lookback_days) {
            anyhow::bail!("SYNC_LOOKBACK_DAYS must be between 1 and {}", MAX_LOOKBACK_DAYS);
        }

        let log_format = match or_default("LOG_FORMAT", "text").to_lowercase().as_str() {
            "text" => LogFormat::Text,
            "json" => LogFormat::Json,
            other => anyhow::bail!("LOG_FORMAT must be 'text' or 'json', got '{}'", other),
        };

        Ok(Config {
            database_url: required("DATABASE_URL")?,
            provider_base_url,
            provider_secret_id: required("PROVIDER_SECRET_ID")?,
            provider_secret_key: required("PROVIDER_SECRET_KEY")?,
            provider_timeout_secs: or_default("PROVIDER_TIMEOUT_SECS", "30")
                .parse()
                .context("PROVIDER_TIMEOUT_SECS must be an integer")?,
            provider_max_retries,
            provider_require_stable_ids: or_default("PROVIDER_REQUIRE_STABLE_IDS", "false")
                .parse()
                .context("PROVIDER_REQUIRE_STABLE_IDS must be true or false")?,
            sync_concurrency,
            sync_lookback_days,
            sync_account_timeout_secs: or_default("SYNC_ACCOUNT_TIMEOUT_SECS", "120")
                .parse()
                .context("SYNC_ACCOUNT_TIMEOUT_SECS must be an integer")?,
            sync_interval_secs: or_default("SYNC_INTERVAL_SECS", "3600")
                .parse()
                .context("SYNC_INTERVAL_SECS must be an integer")?,
            log_format,
        })
    }

    pub fn provider_settings(&self) -> ProviderSettings {
        ProviderSettings {
            timeout: Duration::from_secs(self.provider_timeout_secs),
            max_retries: self.provider_max_retries,
            ..ProviderSettings::new(
                self.provider_base_url.clone(),
                self.provider_secret_id.clone(),
                self.provider_secret_key.clone(),
            )
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            concurrency: self.sync_concurrency,
            lookback_days: self.sync_lookback_days,
            account_timeout: Duration::from_secs(self.sync_account_timeout_secs),
        }
    }

    pub fn mapper(&self) -> TransactionMapper {
        TransactionMapper::new(self.provider_require_stable_ids)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}
