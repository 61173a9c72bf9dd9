//! Configuration management for the marketplace client.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Default Supabase URL (can be overridden at compile time via SUPABASE_URL env var).
pub const DEFAULT_SUPABASE_URL: &str = match option_env!("SUPABASE_URL") {
    Some(url) => url,
    None => "https://appmarket.supabase.co",
};

/// Default Supabase anon key (can be overridden at compile time via SUPABASE_ANON_KEY env var).
pub const DEFAULT_SUPABASE_ANON_KEY: &str = match option_env!("SUPABASE_ANON_KEY") {
    Some(key) => key,
    None => "public-anon-key",
};

/// Default web app origin used to build checkout return URLs.
pub const DEFAULT_WEB_APP_URL: &str = match option_env!("APPMARKET_WEB_APP_URL") {
    Some(url) => url,
    None => "https://appmarket.dev",
};

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default delay before the simulated checkout result is applied.
const DEFAULT_SIMULATED_CHECKOUT_DELAY_MS: u64 = 2_000;

/// Bounded exponential-backoff poll used while waiting on server-side work
/// (profile provisioning triggers, payment webhooks).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Maximum number of fetch attempts, including the first one.
    pub max_attempts: u32,
    /// Delay after the first empty attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Cap for a single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Upper bound on the total time spent waiting, in milliseconds.
    pub ceiling_ms: u64,
}

impl PollConfig {
    /// Poll used after sign-in while the profile-provisioning trigger settles.
    pub fn profile_provisioning() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 400,
            ceiling_ms: 1_000,
        }
    }

    /// Poll used after a checkout redirect while the payment webhook settles.
    pub fn webhook_settle() -> Self {
        Self {
            max_attempts: 6,
            initial_delay_ms: 250,
            max_delay_ms: 1_000,
            ceiling_ms: 2_000,
        }
    }

    /// A poll that fetches exactly once and never waits.
    pub fn immediate() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            ceiling_ms: 0,
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay_ms = self.initial_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }

    /// Total wait budget.
    pub fn ceiling(&self) -> Duration {
        Duration::from_millis(self.ceiling_ms)
    }
}

/// Which checkout-provider failures may degrade to the simulated success path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutFallback {
    /// Only connectivity and configuration failures fall back.
    #[default]
    Connectivity,
    /// Every provider failure falls back.
    Any,
    /// Never fall back; provider failures are returned to the caller.
    Disabled,
}

/// Main client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Supabase project URL.
    #[serde(default = "default_supabase_url")]
    pub supabase_url: String,
    /// Supabase anon API key (public, safe to expose).
    #[serde(default = "default_supabase_anon_key")]
    pub supabase_anon_key: String,
    /// Web app origin for checkout success/cancel URLs.
    #[serde(default = "default_web_app_url")]
    pub web_app_url: String,
    /// Poll while waiting for the profile row after sign-in.
    #[serde(default = "PollConfig::profile_provisioning")]
    pub profile_provisioning: PollConfig,
    /// Poll while waiting for the subscription row after a checkout redirect.
    #[serde(default = "PollConfig::webhook_settle")]
    pub webhook_settle: PollConfig,
    /// Delay before a simulated checkout is applied, in milliseconds.
    #[serde(default = "default_simulated_checkout_delay_ms")]
    pub simulated_checkout_delay_ms: u64,
    /// Fallback policy for checkout provider failures.
    #[serde(default)]
    pub checkout_fallback: CheckoutFallback,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_supabase_url() -> String {
    DEFAULT_SUPABASE_URL.to_string()
}

fn default_supabase_anon_key() -> String {
    DEFAULT_SUPABASE_ANON_KEY.to_string()
}

fn default_web_app_url() -> String {
    DEFAULT_WEB_APP_URL.to_string()
}

fn default_simulated_checkout_delay_ms() -> u64 {
    DEFAULT_SIMULATED_CHECKOUT_DELAY_MS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            supabase_url: default_supabase_url(),
            supabase_anon_key: default_supabase_anon_key(),
            web_app_url: default_web_app_url(),
            profile_provisioning: PollConfig::profile_provisioning(),
            webhook_settle: PollConfig::webhook_settle(),
            simulated_checkout_delay_ms: DEFAULT_SIMULATED_CHECKOUT_DELAY_MS,
            checkout_fallback: CheckoutFallback::default(),
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from the config file, falling back to defaults.
    /// Environment variables override whatever the file says.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|source| CoreError::ConfigFile {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Override configuration from environment variables.
    fn load_from_env(&mut self) {
        if let Some(log_level) = env_value("APPMARKET_LOG_LEVEL") {
            self.log_level = log_level;
        }
        if let Some(url) = env_value("APPMARKET_SUPABASE_URL") {
            self.supabase_url = url;
        }
        if let Some(key) = env_value("APPMARKET_SUPABASE_ANON_KEY") {
            self.supabase_anon_key = key;
        }
        if let Some(url) = env_value("APPMARKET_WEB_APP_URL") {
            self.web_app_url = url;
        }
    }

    /// Reject configurations that cannot possibly work.
    pub fn validate(&self) -> CoreResult<()> {
        self.supabase_url()?;
        self.web_app_url()?;
        if self.profile_provisioning.max_attempts == 0 || self.webhook_settle.max_attempts == 0 {
            return Err(CoreError::Config(
                "poll max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the Supabase URL as a parsed URL.
    pub fn supabase_url(&self) -> CoreResult<Url> {
        Url::parse(&self.supabase_url).map_err(CoreError::from)
    }

    /// Get the web app origin as a parsed URL.
    pub fn web_app_url(&self) -> CoreResult<Url> {
        Url::parse(&self.web_app_url).map_err(CoreError::from)
    }

    /// Delay before a simulated checkout result is applied.
    pub fn simulated_checkout_delay(&self) -> Duration {
        Duration::from_millis(self.simulated_checkout_delay_ms)
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.supabase_url, DEFAULT_SUPABASE_URL);
        assert_eq!(config.supabase_anon_key, DEFAULT_SUPABASE_ANON_KEY);
        assert_eq!(config.simulated_checkout_delay(), Duration::from_secs(2));
        assert_eq!(config.checkout_fallback, CheckoutFallback::Connectivity);
    }

    #[test]
    fn test_config_load_from_file_fills_missing_fields() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");

        let config_json = r#"{
            "log_level": "debug",
            "checkout_fallback": "any"
        }"#;

        std::fs::write(&config_path, config_json).unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.checkout_fallback, CheckoutFallback::Any);
        assert_eq!(config.profile_provisioning, PollConfig::profile_provisioning());
        assert_eq!(config.webhook_settle.ceiling_ms, 2_000);
    }

    #[test]
    fn test_config_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let mut config = Config::default();
        config.simulated_checkout_delay_ms = 10;
        config.checkout_fallback = CheckoutFallback::Disabled;
        config.save(&paths).unwrap();

        let loaded = Config::load(&paths).unwrap();
        assert_eq!(loaded.simulated_checkout_delay_ms, 10);
        assert_eq!(loaded.checkout_fallback, CheckoutFallback::Disabled);
    }

    #[test]
    fn test_config_load_nonexistent_uses_defaults() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = Config::load(&paths).unwrap();
        assert_eq!(config.web_app_url, DEFAULT_WEB_APP_URL);
    }

    #[test]
    fn test_config_load_reports_corrupt_file() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());
        std::fs::write(paths.config_file(), "{\"log_level\": 3").unwrap();

        let err = Config::load(&paths).unwrap_err();
        assert!(matches!(err, CoreError::ConfigFile { .. }));
        assert!(err.to_string().contains("config.json"));
    }

    #[test]
    fn test_config_invalid_url() {
        let mut config = Config::default();
        config.supabase_url = "not a valid url".to_string();

        assert!(config.supabase_url().is_err());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_zero_attempt_poll() {
        let mut config = Config::default();
        config.webhook_settle.max_attempts = 0;

        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_poll_delay_exponential_backoff() {
        let poll = PollConfig::webhook_settle();

        assert_eq!(poll.delay_for_attempt(0), Duration::from_millis(250));
        assert_eq!(poll.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(poll.delay_for_attempt(2), Duration::from_millis(1_000));
        // capped
        assert_eq!(poll.delay_for_attempt(3), Duration::from_millis(1_000));
        assert_eq!(poll.delay_for_attempt(70), Duration::from_millis(1_000));
    }

    #[test]
    fn test_immediate_poll_never_waits() {
        let poll = PollConfig::immediate();
        assert_eq!(poll.max_attempts, 1);
        assert_eq!(poll.ceiling(), Duration::ZERO);
    }

    #[test]
    fn test_fallback_serde_names() {
        let json = serde_json::to_string(&CheckoutFallback::Connectivity).unwrap();
        assert_eq!(json, "\"connectivity\"");
        let parsed: CheckoutFallback = serde_json::from_str("\"disabled\"").unwrap();
        assert_eq!(parsed, CheckoutFallback::Disabled);
    }
}
