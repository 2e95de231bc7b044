//! Application configuration module
//! Handles environment variable loading, configuration validation, and application settings

use std::env;
use std::str::FromStr;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: Option<DatabaseConfig>,
    pub logging: LoggingConfig,
    pub payment_rules: PaymentRulesConfig,
    pub callback: CallbackConfig,
    pub skip_externals: bool,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,   // seconds
    pub idle_timeout: Option<u64>, // seconds
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

/// Prices and limits applied when a payment is initiated.
#[derive(Debug, Clone)]
pub struct PaymentRulesConfig {
    /// Fixed deposit price, smallest currency unit.
    pub deposit_amount: i64,
    /// Price of one day of cover.
    pub daily_amount: i64,
    pub max_days_per_request: u32,
    /// How long the push prompt stays answerable on the payer's phone.
    pub push_validity_secs: u64,
    pub notify_timeout_secs: u64,
}

impl Default for PaymentRulesConfig {
    fn default() -> Self {
        Self {
            deposit_amount: 1048,
            daily_amount: 87,
            max_days_per_request: 30,
            push_validity_secs: 90,
            notify_timeout_secs: 5,
        }
    }
}

/// Inbound provider callback settings
#[derive(Debug, Clone)]
pub struct CallbackConfig {
    /// Secret path segment the provider must call back on.
    pub token: String,
}

fn parse_env<T: FromStr>(key: &str, default: &str) -> Result<T, ConfigError> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(key.to_string()))
}

pub fn skip_externals() -> bool {
    env::var("SKIP_EXTERNALS")
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv::dotenv().ok();
        let skip_externals = skip_externals();

        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            database: if skip_externals {
                None
            } else {
                Some(DatabaseConfig::from_env()?)
            },
            logging: LoggingConfig::from_env()?,
            payment_rules: PaymentRulesConfig::from_env()?,
            callback: CallbackConfig::from_env()?,
            skip_externals,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        if let Some(database) = &self.database {
            database.validate()?;
        }
        self.logging.validate()?;
        self.payment_rules.validate()?;
        self.callback.validate()?;

        Ok(())
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: parse_env("SERVER_PORT", "8000")?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue(
                "SERVER_PORT cannot be 0".to_string(),
            ));
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SERVER_HOST cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::MissingVariable("DATABASE_URL".to_string()))?,
            max_connections: parse_env("DB_MAX_CONNECTIONS", "20")?,
            min_connections: parse_env("DB_MIN_CONNECTIONS", "5")?,
            connection_timeout: parse_env("DB_CONNECTION_TIMEOUT", "30")?,
            idle_timeout: env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|val| val.parse().ok()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::InvalidValue("DATABASE_URL".to_string()));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }

        Ok(())
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "plain".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Plain,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

impl PaymentRulesConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(PaymentRulesConfig {
            deposit_amount: parse_env("DEPOSIT_AMOUNT", &defaults.deposit_amount.to_string())?,
            daily_amount: parse_env("DAILY_AMOUNT", &defaults.daily_amount.to_string())?,
            max_days_per_request: parse_env(
                "MAX_DAYS_PER_REQUEST",
                &defaults.max_days_per_request.to_string(),
            )?,
            push_validity_secs: parse_env(
                "PUSH_VALIDITY_SECS",
                &defaults.push_validity_secs.to_string(),
            )?,
            notify_timeout_secs: parse_env(
                "NOTIFY_TIMEOUT_SECS",
                &defaults.notify_timeout_secs.to_string(),
            )?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.deposit_amount <= 0 {
            return Err(ConfigError::InvalidValue("DEPOSIT_AMOUNT".to_string()));
        }
        if self.daily_amount <= 0 {
            return Err(ConfigError::InvalidValue("DAILY_AMOUNT".to_string()));
        }
        if self.max_days_per_request == 0 {
            return Err(ConfigError::InvalidValue("MAX_DAYS_PER_REQUEST".to_string()));
        }
        if !(30..=300).contains(&self.push_validity_secs) {
            return Err(ConfigError::ValidationFailed(
                "PUSH_VALIDITY_SECS must be between 30 and 300".to_string(),
            ));
        }

        Ok(())
    }
}

impl CallbackConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(CallbackConfig {
            token: env::var("MPESA_CALLBACK_TOKEN").unwrap_or_default(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.len() < 16 {
            return Err(ConfigError::ValidationFailed(
                "MPESA_CALLBACK_TOKEN must be at least 16 characters".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

impl From<ConfigError> for crate::error::AppError {
    fn from(err: ConfigError) -> Self {
        use crate::error::{AppError, AppErrorKind, InfrastructureError};

        AppError::new(AppErrorKind::Infrastructure(
            InfrastructureError::Configuration {
                message: err.to_string(),
            },
        ))
    }
}
