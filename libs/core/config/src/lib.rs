//! Environment-driven configuration shared by the Courier services.
//!
//! Both processes read the same conventions (`APP_ENV`, `REDIS_URL`) and
//! add their own variables on top: the gateway its ingress listener, the
//! worker its health listener, provider credentials, and engine tuning.
//! [`Environment`] carries the policy switches that differ between a
//! local stack and a deployment - log format, and whether a provider
//! without credentials deserves a startup warning.

pub mod listen;
pub mod redis;
pub mod tracing;

use std::env;
use thiserror::Error;

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    MissingEnvVar(String),

    #[error("Failed to parse environment variable {key}: {details}")]
    ParseError { key: String, details: String },
}

/// Where the service is running.
///
/// Development targets the local stack: pretty logs, a Mailpit SMTP
/// default, and no expectation that API providers are configured.
/// Production emits JSON logs and treats missing provider credentials as
/// worth warning about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    /// Read `APP_ENV`; anything other than "production" is development.
    pub fn from_env() -> Self {
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        if app_env.eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }

    /// JSON logs for aggregation in production; pretty logs locally.
    pub fn log_json(&self) -> bool {
        self.is_production()
    }

    /// Whether a provider with no credentials in the environment should be
    /// called out at startup. Locally only the Mailpit SMTP default is
    /// expected to exist, so a missing SendGrid/Mailgun/SES setup is
    /// routine; in production it usually means a secret wasn't mounted.
    pub fn expects_provider_credentials(&self) -> bool {
        self.is_production()
    }
}

/// Typed loaders for env-var-backed configuration.
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Read a required variable. Unset and blank values are both rejected -
/// an empty `REDIS_URL` or `SERVICE_TOKENS` is always a deployment
/// mistake, not a choice.
pub fn env_required(key: &str) -> Result<String, ConfigError> {
    let value = env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))?;
    let value = value.trim();

    if value.is_empty() {
        return Err(ConfigError::MissingEnvVar(key.to_string()));
    }
    Ok(value.to_string())
}

/// Read and parse a variable, falling back to `default` when unset.
/// A value that is set but unparseable is an error, not a silent fallback.
pub fn env_parse_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|e: T::Err| ConfigError::ParseError {
            key: key.to_string(),
            details: format!("{}", e),
        }),
        Err(_) => Ok(default),
    }
}

/// Application name/version snapshot for health endpoints.
#[derive(Clone, Debug)]
pub struct AppInfo {
    pub name: &'static str,
    pub version: &'static str,
}

/// Capture the calling crate's name and version from Cargo metadata.
#[macro_export]
macro_rules! app_info {
    () => {
        $crate::AppInfo {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_defaults_to_development() {
        temp_env::with_var_unset("APP_ENV", || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Development);
            assert!(env.is_development());
            assert!(!env.is_production());
        });
    }

    #[test]
    fn test_environment_production() {
        temp_env::with_var("APP_ENV", Some("production"), || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Production);
            assert!(env.is_production());
        });
    }

    #[test]
    fn test_environment_production_case_insensitive() {
        temp_env::with_var("APP_ENV", Some("PRODUCTION"), || {
            assert_eq!(Environment::from_env(), Environment::Production);
        });
    }

    #[test]
    fn test_environment_unknown_defaults_to_development() {
        temp_env::with_var("APP_ENV", Some("staging"), || {
            assert_eq!(Environment::from_env(), Environment::Development);
        });
    }

    #[test]
    fn test_environment_policy_switches() {
        assert!(Environment::Production.log_json());
        assert!(Environment::Production.expects_provider_credentials());
        assert!(!Environment::Development.log_json());
        assert!(!Environment::Development.expects_provider_credentials());
    }

    #[test]
    fn test_env_required_missing() {
        temp_env::with_var_unset("MISSING_REQUIRED", || {
            let result = env_required("MISSING_REQUIRED");
            assert!(result.is_err());
            let err = result.unwrap_err();
            assert!(err.to_string().contains("MISSING_REQUIRED"));
            assert!(err.to_string().contains("required"));
        });
    }

    #[test]
    fn test_env_required_rejects_blank() {
        temp_env::with_var("BLANK_VAR", Some("   "), || {
            assert!(env_required("BLANK_VAR").is_err());
        });
    }

    #[test]
    fn test_env_required_trims() {
        temp_env::with_var("PADDED_VAR", Some("  value  "), || {
            assert_eq!(env_required("PADDED_VAR").unwrap(), "value");
        });
    }

    #[test]
    fn test_env_parse_or() {
        temp_env::with_var("PARSE_VAR", Some("42"), || {
            let value: u32 = env_parse_or("PARSE_VAR", 7).unwrap();
            assert_eq!(value, 42);
        });
        temp_env::with_var_unset("PARSE_VAR", || {
            let value: u32 = env_parse_or("PARSE_VAR", 7).unwrap();
            assert_eq!(value, 7);
        });
        temp_env::with_var("PARSE_VAR", Some("not_a_number"), || {
            let result: Result<u32, _> = env_parse_or("PARSE_VAR", 7);
            assert!(result.is_err());
            assert!(result.unwrap_err().to_string().contains("PARSE_VAR"));
        });
    }

    #[test]
    fn test_app_info_macro() {
        let info = app_info!();
        assert_eq!(info.name, "courier-config");
        assert!(!info.version.is_empty());
    }
}
