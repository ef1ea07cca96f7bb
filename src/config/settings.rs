//! Engine settings loading from config.toml
//!
//! Holds the read-only inputs of the core: the exchange-rate table keyed by account tier,
//! the payment gateway endpoint and credentials, and the retry and polling policy. Every
//! field has a default, so a missing file or section still yields a usable configuration.
//! A few values can be overridden from the environment (see [`AppConfig::apply_env_overrides`]).

use crate::errors::{Error, Result};
use crate::models::PrivilegeTier;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Configuration structure representing the entire config.toml file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Payment gateway settings
    pub payment: PaymentSettings,
    /// Points per currency unit, per tier
    pub exchange_rates: ExchangeRates,
}

/// Points credited per currency unit.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeRates {
    /// Rate for normal (and admin) accounts
    pub normal: f64,
    /// Rate for VIP accounts
    pub vip: f64,
    /// Promotional rate
    pub promotional: f64,
    /// While true, accounts get the better of their tier rate and the promotional rate
    pub promotion_active: bool,
}

impl Default for ExchangeRates {
    fn default() -> Self {
        Self {
            normal: 100.0,
            vip: 120.0,
            promotional: 150.0,
            promotion_active: false,
        }
    }
}

impl ExchangeRates {
    /// Rate applying to an account of the given tier right now.
    #[must_use]
    pub fn rate_for(&self, tier: PrivilegeTier) -> f64 {
        let base = match tier {
            PrivilegeTier::Vip => self.vip,
            PrivilegeTier::Normal | PrivilegeTier::Admin => self.normal,
        };
        if self.promotion_active {
            base.max(self.promotional)
        } else {
            base
        }
    }

    /// Lowest rate any account can be credited at, whatever its tier or the promotion.
    #[must_use]
    pub fn min_rate(&self) -> f64 {
        self.normal.min(self.vip)
    }

    fn validate(&self) -> Result<()> {
        for (name, rate) in [
            ("normal", self.normal),
            ("vip", self.vip),
            ("promotional", self.promotional),
        ] {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(Error::Config {
                    message: format!("exchange rate '{name}' must be positive, got {rate}"),
                });
            }
        }
        Ok(())
    }
}

/// Payment gateway settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PaymentSettings {
    /// Gateway base URL; `/create` and `/check` are appended
    pub base_url: String,
    /// Gateway API key
    pub api_key: String,
    /// Use the in-process simulated gateway instead of HTTP
    pub simulation: bool,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
    /// Retry policy for gateway calls
    pub retry: RetrySettings,
    /// Status polling budget
    pub polling: PollingSettings,
}

impl Default for PaymentSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            simulation: false,
            request_timeout_secs: 10,
            retry: RetrySettings::default(),
            polling: PollingSettings::default(),
        }
    }
}

impl PaymentSettings {
    /// Request timeout as a `Duration`.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Bounded exponential backoff for gateway calls.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds
    pub initial_backoff_ms: u64,
    /// Multiplier applied to the delay after each retry
    pub backoff_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1000,
            backoff_factor: 2.0,
        }
    }
}

/// Fixed-interval polling of charge status.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    /// Maximum status queries per poll call
    pub attempts: u32,
    /// Pause between queries, in milliseconds
    pub interval_ms: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            attempts: 20,
            interval_ms: 3000,
        }
    }
}

impl PollingSettings {
    /// Interval as a `Duration`.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl AppConfig {
    /// Overrides gateway settings from `PAYMENT_API_URL`, `PAYMENT_API_KEY` and
    /// `USE_PAYMENT_SIMULATION` when they are set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("PAYMENT_API_URL") {
            self.payment.base_url = url;
        }
        if let Ok(key) = std::env::var("PAYMENT_API_KEY") {
            self.payment.api_key = key;
        }
        if let Ok(flag) = std::env::var("USE_PAYMENT_SIMULATION") {
            self.payment.simulation = flag.eq_ignore_ascii_case("true") || flag == "1";
        }
    }

    /// Checks values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        self.exchange_rates.validate()?;
        let retry = &self.payment.retry;
        if retry.max_attempts == 0 {
            return Err(Error::Config {
                message: "payment.retry.max_attempts must be at least 1".to_string(),
            });
        }
        if !retry.backoff_factor.is_finite() || retry.backoff_factor < 1.0 {
            return Err(Error::Config {
                message: format!(
                    "payment.retry.backoff_factor must be >= 1.0, got {}",
                    retry.backoff_factor
                ),
            });
        }
        if self.payment.polling.attempts == 0 {
            return Err(Error::Config {
                message: "payment.polling.attempts must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Parses configuration from a TOML string.
pub fn parse_config(contents: &str) -> Result<AppConfig> {
    let config: AppConfig = toml::from_str(contents).map_err(|e| Error::Config {
        message: format!("Failed to parse config.toml: {e}"),
    })?;
    config.validate()?;
    Ok(config)
}

/// Loads configuration from a TOML file
///
/// # Errors
/// Returns an error if:
/// - The file cannot be read
/// - The TOML syntax is invalid
/// - A value is out of range
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
    debug!("Loading configuration from {:?}", path.as_ref());
    let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::Config {
        message: format!("Failed to read config file: {e}"),
    })?;
    parse_config(&contents)
}

/// Loads configuration from `POINTSHOP_CONFIG` (default `./config.toml`), using defaults
/// when the file does not exist, then applies environment overrides.
pub fn load_app_configuration() -> Result<AppConfig> {
    let path = std::env::var("POINTSHOP_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let mut config = if Path::new(&path).exists() {
        load_config(&path)?
    } else {
        info!("No configuration file at {}, using defaults.", path);
        AppConfig::default()
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::float_cmp)]
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
            [exchange_rates]
            normal = 100.0
            vip = 120.0
            promotional = 150.0
            promotion_active = true

            [payment]
            base_url = "https://pay.example.com/api"
            api_key = "secret"
            request_timeout_secs = 5

            [payment.retry]
            max_attempts = 4
            initial_backoff_ms = 10
            backoff_factor = 1.5

            [payment.polling]
            attempts = 6
            interval_ms = 250
        "#;

        let config = parse_config(toml_str).unwrap();
        assert_eq!(config.payment.base_url, "https://pay.example.com/api");
        assert_eq!(config.payment.retry.max_attempts, 4);
        assert_eq!(config.payment.polling.interval(), Duration::from_millis(250));
        assert!(config.exchange_rates.promotion_active);
        assert!(!config.payment.simulation);
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.exchange_rates.normal, 100.0);
        assert_eq!(config.payment.retry.max_attempts, 3);
        assert_eq!(config.payment.request_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(parse_config("[exchange_rates]\nvip = 0.0").is_err());
        assert!(parse_config("[payment.retry]\nmax_attempts = 0").is_err());
        assert!(parse_config("[payment.retry]\nbackoff_factor = 0.5").is_err());
        assert!(parse_config("[payment.polling]\nattempts = 0").is_err());
        assert!(parse_config("not = [valid").is_err());
    }

    #[test]
    fn test_rate_for_tiers() {
        let mut rates = ExchangeRates::default();
        assert_eq!(rates.rate_for(PrivilegeTier::Normal), 100.0);
        assert_eq!(rates.rate_for(PrivilegeTier::Vip), 120.0);
        assert_eq!(rates.rate_for(PrivilegeTier::Admin), 100.0);

        rates.promotion_active = true;
        assert_eq!(rates.rate_for(PrivilegeTier::Normal), 150.0);
        rates.vip = 200.0;
        assert_eq!(rates.rate_for(PrivilegeTier::Vip), 200.0);
    }

    #[test]
    fn test_min_rate_ignores_promotion() {
        let mut rates = ExchangeRates::default();
        assert_eq!(rates.min_rate(), 100.0);
        rates.vip = 80.0;
        rates.promotion_active = true;
        assert_eq!(rates.min_rate(), 80.0);
    }
}
