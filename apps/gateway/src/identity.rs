//! Service-token identity.
//!
//! Callers present `X-Service-Token`; the directory maps tokens to service
//! names. Tokens come from `SERVICE_TOKENS` as `token:service` pairs,
//! comma separated. Every authenticated request carries a
//! [`ServiceIdentity`] into the core.

use crate::state::AppState;
use axum::extract::FromRequestParts;
use axum::http::{request::Parts, StatusCode};
use axum::Json;
use courier_config::ConfigError;
use serde_json::{json, Value};
use std::collections::HashMap;

pub const SERVICE_TOKEN_HEADER: &str = "x-service-token";

/// Token-to-service lookup table.
pub struct ServiceDirectory {
    tokens: HashMap<String, String>,
}

impl ServiceDirectory {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    /// Parse `SERVICE_TOKENS` (e.g. `"abc123:billing,def456:signup"`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let raw = courier_config::env_required("SERVICE_TOKENS")?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let mut tokens = HashMap::new();

        for pair in raw.split(',').filter(|p| !p.trim().is_empty()) {
            let (token, service) = pair
                .trim()
                .split_once(':')
                .ok_or_else(|| ConfigError::ParseError {
                    key: "SERVICE_TOKENS".to_string(),
                    details: format!("expected token:service, got '{}'", pair),
                })?;

            if token.is_empty() || service.is_empty() {
                return Err(ConfigError::ParseError {
                    key: "SERVICE_TOKENS".to_string(),
                    details: "empty token or service name".to_string(),
                });
            }

            tokens.insert(token.to_string(), service.to_string());
        }

        if tokens.is_empty() {
            return Err(ConfigError::ParseError {
                key: "SERVICE_TOKENS".to_string(),
                details: "no token pairs configured".to_string(),
            });
        }

        Ok(Self::new(tokens))
    }

    pub fn authenticate(&self, token: &str) -> Option<&str> {
        self.tokens.get(token).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// The authenticated caller, extracted from `X-Service-Token`.
#[derive(Debug, Clone)]
pub struct ServiceIdentity {
    pub service: String,
}

impl FromRequestParts<AppState> for ServiceIdentity {
    type Rejection = (StatusCode, Json<Value>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(SERVICE_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| unauthorized("missing X-Service-Token header"))?;

        let service = state
            .identity
            .authenticate(token)
            .ok_or_else(|| unauthorized("unrecognized service token"))?;

        Ok(ServiceIdentity {
            service: service.to_string(),
        })
    }
}

fn unauthorized(reason: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "unauthorized", "reason": reason })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_pairs() {
        let directory = ServiceDirectory::parse("abc:billing, def:signup").unwrap();
        assert_eq!(directory.len(), 2);
        assert_eq!(directory.authenticate("abc"), Some("billing"));
        assert_eq!(directory.authenticate("def"), Some("signup"));
        assert_eq!(directory.authenticate("nope"), None);
    }

    #[test]
    fn test_parse_rejects_malformed_pair() {
        assert!(ServiceDirectory::parse("tokenwithoutname").is_err());
        assert!(ServiceDirectory::parse(":empty").is_err());
        assert!(ServiceDirectory::parse("").is_err());
    }
}
