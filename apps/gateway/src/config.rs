//! Gateway configuration loaded from environment variables.

use courier_config::listen::ListenConfig;
use courier_config::redis::RedisConfig;
use courier_config::{ConfigError, Environment, FromEnv};

#[derive(Clone, Debug)]
pub struct Config {
    pub environment: Environment,
    pub listen: ListenConfig,
    pub redis: RedisConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            environment: Environment::from_env(),
            listen: ListenConfig::ingress_from_env()?,
            redis: RedisConfig::from_env()?,
        })
    }
}
