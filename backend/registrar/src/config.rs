//! Application configuration loaded from environment variables.

use std::time::Duration;

use crate::errors::{PortalError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the registration backend (e.g. https://api.example.edu)
    pub backend_url: String,
    /// Public origin of this service, used to build the gateway return URL
    pub public_base_url: String,
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the HTTP server
    pub api_port: u16,
    /// Gateway path segment for order creation and launch (e.g. `billdesk`)
    pub gateway: String,
    /// Registration fee as a decimal string, e.g. `300.00`
    pub registration_fee: String,
    /// ISO-4217 numeric currency code
    pub currency_code: String,
    pub item_code: String,
    pub payment_purpose: String,
    pub order_id_prefix: String,
    pub verify_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub delays: RouteDelays,
    pub draft_ttl_hours: i64,
    pub abandon_after_mins: i64,
    pub sweep_interval_secs: u64,
}

/// How long a status message stays on screen before the terminal route is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteDelays {
    pub success_ms: u64,
    pub failure_ms: u64,
    pub error_ms: u64,
    pub missing_params_ms: u64,
}

impl Default for RouteDelays {
    fn default() -> Self {
        Self {
            success_ms: 1200,
            failure_ms: 1200,
            error_ms: 2000,
            missing_params_ms: 3000,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = RouteDelays::default();
        let config = Config {
            backend_url: env_var("BACKEND_URL").map_err(|_| {
                PortalError::Config("BACKEND_URL environment variable is required".to_string())
            })?,
            public_base_url: env_var("PUBLIC_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./graduation_portal.db".to_string()),
            api_port: parse_var("API_PORT", 3000)?,
            gateway: env_var("PAYMENT_GATEWAY").unwrap_or_else(|_| "billdesk".to_string()),
            registration_fee: env_var("REGISTRATION_FEE")
                .unwrap_or_else(|_| "300.00".to_string()),
            currency_code: env_var("CURRENCY_CODE").unwrap_or_else(|_| "356".to_string()),
            item_code: env_var("ITEM_CODE").unwrap_or_else(|_| "DIRECT".to_string()),
            payment_purpose: env_var("PAYMENT_PURPOSE")
                .unwrap_or_else(|_| "Graduation Registration Fee".to_string()),
            order_id_prefix: env_var("ORDER_ID_PREFIX").unwrap_or_else(|_| "PU".to_string()),
            verify_timeout_secs: parse_var("VERIFY_TIMEOUT_SECS", 20)?,
            http_timeout_secs: parse_var("HTTP_TIMEOUT_SECS", 30)?,
            delays: RouteDelays {
                success_ms: parse_var("SUCCESS_DELAY_MS", defaults.success_ms)?,
                failure_ms: parse_var("FAILURE_DELAY_MS", defaults.failure_ms)?,
                error_ms: parse_var("ERROR_DELAY_MS", defaults.error_ms)?,
                missing_params_ms: parse_var(
                    "MISSING_PARAMS_DELAY_MS",
                    defaults.missing_params_ms,
                )?,
            },
            draft_ttl_hours: parse_var("DRAFT_TTL_HOURS", 72)?,
            abandon_after_mins: parse_var("ABANDON_AFTER_MINS", 30)?,
            sweep_interval_secs: parse_var("SWEEP_INTERVAL_SECS", 60)?,
        };
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        let prefix_ok = !self.order_id_prefix.is_empty()
            && self
                .order_id_prefix
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
        if !prefix_ok {
            return Err(PortalError::Config(
                "ORDER_ID_PREFIX must be uppercase alphanumeric".to_string(),
            ));
        }
        url::Url::parse(&self.backend_url)
            .map_err(|e| PortalError::Config(format!("Invalid BACKEND_URL: {e}")))?;
        url::Url::parse(&self.public_base_url)
            .map_err(|e| PortalError::Config(format!("Invalid PUBLIC_BASE_URL: {e}")))?;
        Ok(())
    }

    /// Where the gateway sends the registrant after payment.
    pub fn return_url(&self) -> String {
        format!(
            "{}/payment/callback",
            self.public_base_url.trim_end_matches('/')
        )
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| PortalError::Config(format!("Missing env var: {key}")))
}

fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| PortalError::Config(format!("Invalid {key}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
impl Config {
    /// Configuration for tests: no display delays and a short verification timeout.
    pub fn for_tests(backend_url: &str) -> Self {
        Config {
            backend_url: backend_url.to_string(),
            public_base_url: "http://portal.test".to_string(),
            database_url: "sqlite::memory:".to_string(),
            api_port: 0,
            gateway: "billdesk".to_string(),
            registration_fee: "300.00".to_string(),
            currency_code: "356".to_string(),
            item_code: "DIRECT".to_string(),
            payment_purpose: "Graduation Registration Fee".to_string(),
            order_id_prefix: "PU".to_string(),
            verify_timeout_secs: 1,
            http_timeout_secs: 5,
            delays: RouteDelays {
                success_ms: 0,
                failure_ms: 0,
                error_ms: 0,
                missing_params_ms: 0,
            },
            draft_ttl_hours: 72,
            abandon_after_mins: 30,
            sweep_interval_secs: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_url_trims_trailing_slash() {
        let mut config = Config::for_tests("http://backend.test");
        config.public_base_url = "https://portal.example.edu/".to_string();
        assert_eq!(
            config.return_url(),
            "https://portal.example.edu/payment/callback"
        );
    }

    #[test]
    fn lowercase_prefix_is_rejected() {
        let mut config = Config::for_tests("http://backend.test");
        config.order_id_prefix = "pu".to_string();
        assert!(matches!(config.check(), Err(PortalError::Config(_))));
    }

    #[test]
    fn default_delays_match_callback_timings() {
        let delays = RouteDelays::default();
        assert_eq!(delays.success_ms, 1200);
        assert_eq!(delays.error_ms, 2000);
        assert_eq!(delays.missing_params_ms, 3000);
    }
}
