//! Listener configuration for the service's HTTP surfaces.
//!
//! Courier binds exactly two kinds of sockets: the gateway's ingress
//! listener (`HOST`/`PORT`) and the worker's health/admin listener
//! (`HEALTH_HOST`/`HEALTH_PORT`). Both parse into a [`SocketAddr`] up
//! front so a bad bind address fails at startup instead of at serve time.

use crate::{env_parse_or, ConfigError};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// A resolved bind address for one HTTP surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenConfig {
    pub host: IpAddr,
    pub port: u16,
}

impl ListenConfig {
    pub fn new(host: IpAddr, port: u16) -> Self {
        Self { host, port }
    }

    /// The gateway ingress listener: `HOST`/`PORT`, default 0.0.0.0:8080.
    pub fn ingress_from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env_parse_or("HOST", IpAddr::V4(Ipv4Addr::UNSPECIFIED))?,
            port: env_parse_or("PORT", 8080)?,
        })
    }

    /// The worker's health/admin listener: `HEALTH_HOST`/`HEALTH_PORT`,
    /// default 0.0.0.0:8081. Kept off `PORT` so a worker colocated with
    /// the gateway never steals its ingress port.
    pub fn health_from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env_parse_or("HEALTH_HOST", IpAddr::V4(Ipv4Addr::UNSPECIFIED))?,
            port: env_parse_or("HEALTH_PORT", 8081)?,
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingress_defaults() {
        temp_env::with_vars([("HOST", None::<&str>), ("PORT", None::<&str>)], || {
            let config = ListenConfig::ingress_from_env().unwrap();
            assert_eq!(config.host, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
            assert_eq!(config.port, 8080);
            assert_eq!(config.socket_addr().to_string(), "0.0.0.0:8080");
        });
    }

    #[test]
    fn test_ingress_custom_values() {
        temp_env::with_vars(
            [("HOST", Some("127.0.0.1")), ("PORT", Some("3000"))],
            || {
                let config = ListenConfig::ingress_from_env().unwrap();
                assert_eq!(config.socket_addr().to_string(), "127.0.0.1:3000");
            },
        );
    }

    #[test]
    fn test_health_defaults_are_separate_from_ingress() {
        temp_env::with_vars(
            [
                ("PORT", Some("9999")),
                ("HEALTH_HOST", None::<&str>),
                ("HEALTH_PORT", None::<&str>),
            ],
            || {
                let config = ListenConfig::health_from_env().unwrap();
                // PORT must not leak into the health listener
                assert_eq!(config.port, 8081);
            },
        );
    }

    #[test]
    fn test_health_custom_port() {
        temp_env::with_var("HEALTH_PORT", Some("9091"), || {
            let config = ListenConfig::health_from_env().unwrap();
            assert_eq!(config.port, 9091);
        });
    }

    #[test]
    fn test_invalid_port_is_an_error() {
        temp_env::with_var("PORT", Some("not_a_number"), || {
            let result = ListenConfig::ingress_from_env();
            assert!(result.is_err());
            assert!(result.unwrap_err().to_string().contains("PORT"));
        });

        temp_env::with_var("PORT", Some("99999"), || {
            assert!(ListenConfig::ingress_from_env().is_err());
        });
    }

    #[test]
    fn test_invalid_host_is_an_error() {
        temp_env::with_var("HOST", Some("gateway.internal"), || {
            // Hostnames are not accepted; the bind address must be an IP
            let result = ListenConfig::ingress_from_env();
            assert!(result.is_err());
            assert!(result.unwrap_err().to_string().contains("HOST"));
        });
    }
}
