use std::{fmt, time::Duration};

use thiserror::Error;

use crate::domain::Currency;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing environment variable '{0}'")]
    Missing(&'static str),

    #[error("{0} is not configured (empty or placeholder value)")]
    NotConfigured(&'static str),

    #[error("{name} must start with one of {expected:?}")]
    InvalidPrefix {
        name: &'static str,
        expected: &'static [&'static str],
    },

    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

const PLACEHOLDER_MARKERS: &[&str] = &[
    "changeme",
    "change_me",
    "change-me",
    "placeholder",
    "your_",
    "your-",
    "xxxx",
    "dummy",
    "replace",
    "<",
];

/// Shortest credential body (after the prefix) accepted as a real key.
const MIN_KEY_BODY_LEN: usize = 8;

fn is_placeholder(value: &str) -> bool {
    let value = value.trim().to_ascii_lowercase();
    value.is_empty()
        || PLACEHOLDER_MARKERS
            .iter()
            .any(|marker| value.contains(marker))
}

fn validate_credential(
    name: &'static str,
    value: &str,
    prefixes: &'static [&'static str],
) -> Result<String, ConfigError> {
    let value = value.trim();
    if is_placeholder(value) {
        return Err(ConfigError::NotConfigured(name));
    }

    let body = prefixes
        .iter()
        .find_map(|prefix| value.strip_prefix(prefix))
        .ok_or(ConfigError::InvalidPrefix {
            name,
            expected: prefixes,
        })?;

    // "sk_test_" and friends with nothing real behind them
    let body = body
        .strip_prefix("test_")
        .or_else(|| body.strip_prefix("live_"))
        .unwrap_or(body);
    if body.len() < MIN_KEY_BODY_LEN {
        return Err(ConfigError::NotConfigured(name));
    }

    Ok(value.to_string())
}

/// Processor credentials and call settings, validated when constructed.
#[derive(Clone)]
pub struct GatewayConfig {
    pub name: String,
    pub secret_key: String,
    pub publishable_key: String,
    pub webhook_secret: String,
    pub api_base: String,
    pub currency: Currency,
    pub timeout: Duration,
    pub webhook_tolerance: Duration,
}

impl GatewayConfig {
    pub const DEFAULT_API_BASE: &'static str = "https://api.stripe.com";
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_WEBHOOK_TOLERANCE: Duration = Duration::from_secs(300);

    pub fn new(
        secret_key: &str,
        publishable_key: &str,
        webhook_secret: &str,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            name: "stripe".to_string(),
            secret_key: validate_credential("STRIPE_SECRET_KEY", secret_key, &["sk_", "rk_"])?,
            publishable_key: validate_credential(
                "STRIPE_PUBLISHABLE_KEY",
                publishable_key,
                &["pk_"],
            )?,
            webhook_secret: validate_credential(
                "STRIPE_WEBHOOK_SECRET",
                webhook_secret,
                &["whsec_"],
            )?,
            api_base: Self::DEFAULT_API_BASE.to_string(),
            currency: Currency::new("cop").map_err(|e| ConfigError::Invalid {
                name: "PAYMENT_CURRENCY",
                reason: e.to_string(),
            })?,
            timeout: Self::DEFAULT_TIMEOUT,
            webhook_tolerance: Self::DEFAULT_WEBHOOK_TOLERANCE,
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_currency(mut self, currency: Currency) -> Self {
        self.currency = currency;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_webhook_tolerance(mut self, tolerance: Duration) -> Self {
        self.webhook_tolerance = tolerance;
        self
    }
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("name", &self.name)
            .field("secret_key", &"[REDACTED]")
            .field("publishable_key", &self.publishable_key)
            .field("webhook_secret", &"[REDACTED]")
            .field("api_base", &self.api_base)
            .field("currency", &self.currency)
            .field("timeout", &self.timeout)
            .field("webhook_tolerance", &self.webhook_tolerance)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AmqpConfig {
    pub url: String,
    pub notification_queue: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub amqp: Option<AmqpConfig>,
}

impl AppConfig {
    /// Loads configuration from the process environment (after `.env` has been read).
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |key: &'static str| lookup(key).ok_or(ConfigError::Missing(key));
        let parse_secs = |key: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|e| ConfigError::Invalid {
                        name: key,
                        reason: e.to_string(),
                    }),
                None => Ok(default),
            }
        };

        let port = match lookup("SERVER_PORT") {
            Some(raw) => raw.trim().parse::<u16>().map_err(|e| ConfigError::Invalid {
                name: "SERVER_PORT",
                reason: e.to_string(),
            })?,
            None => 3000,
        };

        let database_url = required("DATABASE_URL")?;
        if database_url.trim().is_empty() {
            return Err(ConfigError::NotConfigured("DATABASE_URL"));
        }

        let mut gateway = GatewayConfig::new(
            &required("STRIPE_SECRET_KEY")?,
            &required("STRIPE_PUBLISHABLE_KEY")?,
            &required("STRIPE_WEBHOOK_SECRET")?,
        )?
        .with_timeout(parse_secs(
            "GATEWAY_TIMEOUT_SECS",
            GatewayConfig::DEFAULT_TIMEOUT,
        )?)
        .with_webhook_tolerance(parse_secs(
            "WEBHOOK_TOLERANCE_SECS",
            GatewayConfig::DEFAULT_WEBHOOK_TOLERANCE,
        )?);

        if let Some(api_base) = lookup("STRIPE_API_BASE") {
            gateway = gateway.with_api_base(api_base);
        }
        if let Some(code) = lookup("PAYMENT_CURRENCY") {
            let currency = Currency::new(&code).map_err(|e| ConfigError::Invalid {
                name: "PAYMENT_CURRENCY",
                reason: e.to_string(),
            })?;
            gateway = gateway.with_currency(currency);
        }

        let amqp = lookup("AMQP_URL")
            .filter(|url| !url.trim().is_empty())
            .map(|url| AmqpConfig {
                url,
                notification_queue: lookup("NOTIFICATION_QUEUE")
                    .unwrap_or_else(|| "notifications.dispatch".to_string()),
            });

        tracing::info!("Application configuration loaded successfully");

        Ok(Self {
            server: ServerConfig { port },
            database: DatabaseConfig { url: database_url },
            gateway,
            amqp,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const SECRET: &str = "sk_test_51Hk2mQa9ZbLrT0e";
    const PUBLISHABLE: &str = "pk_test_51Hk2mQa9ZbLrT0e";
    const WEBHOOK: &str = "whsec_8f2b1c9d4e7a";

    fn env(overrides: &[(&str, &str)]) -> HashMap<String, String> {
        let mut vars: HashMap<String, String> = [
            ("DATABASE_URL", "postgres://localhost/payments"),
            ("STRIPE_SECRET_KEY", SECRET),
            ("STRIPE_PUBLISHABLE_KEY", PUBLISHABLE),
            ("STRIPE_WEBHOOK_SECRET", WEBHOOK),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in overrides {
            vars.insert(k.to_string(), v.to_string());
        }
        vars
    }

    fn load(vars: HashMap<String, String>) -> Result<AppConfig, ConfigError> {
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn loads_valid_configuration_with_defaults() {
        let config = load(env(&[])).unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.gateway.currency.code(), "cop");
        assert_eq!(config.gateway.api_base, GatewayConfig::DEFAULT_API_BASE);
        assert!(config.amqp.is_none());
    }

    #[test]
    fn rejects_empty_and_placeholder_credentials() {
        for value in ["", "   ", "sk_test_changeme", "sk_test_xxxxxxxxxxxx", "sk_test_"] {
            let err = load(env(&[("STRIPE_SECRET_KEY", value)])).unwrap_err();
            assert_eq!(err, ConfigError::NotConfigured("STRIPE_SECRET_KEY"), "{value:?}");
        }
        let err = load(env(&[("STRIPE_WEBHOOK_SECRET", "whsec_your_secret_here")])).unwrap_err();
        assert_eq!(err, ConfigError::NotConfigured("STRIPE_WEBHOOK_SECRET"));
    }

    #[test]
    fn rejects_credentials_with_the_wrong_prefix() {
        let err = load(env(&[("STRIPE_PUBLISHABLE_KEY", SECRET)])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidPrefix {
                name: "STRIPE_PUBLISHABLE_KEY",
                ..
            }
        ));
    }

    #[test]
    fn missing_credentials_are_fatal() {
        let mut vars = env(&[]);
        vars.remove("STRIPE_WEBHOOK_SECRET");
        assert_eq!(
            load(vars).unwrap_err(),
            ConfigError::Missing("STRIPE_WEBHOOK_SECRET")
        );
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config = load(env(&[])).unwrap();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains(SECRET));
        assert!(!rendered.contains(WEBHOOK));
    }
}
