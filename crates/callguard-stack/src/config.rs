//! Middleware configuration.
//!
//! Values come from serde (any format) or from the environment via
//! [`MiddlewareConfig::from_env`]. Unset variables keep their defaults; a set
//! but unparsable variable is an error rather than being silently ignored.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use callguard_core::policy::{CircuitBreakerConfig, LimiterConfig, RetryConfig, TokenBucketConfig};

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidVar {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Client-side policies for one downstream dependency.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub rate_limit: TokenBucketConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
}

/// Server-side admission control and metrics labelling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `service` label on every metric the server stack records.
    pub service_name: String,
    pub rate_limit: LimiterConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown-service".into(),
            rate_limit: LimiterConfig::default(),
        }
    }
}

/// Complete middleware configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    pub client: ClientConfig,
    pub server: ServerConfig,
}

impl MiddlewareConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to resolve variable names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut config = Self::default();

        let client = &mut config.client;
        env.set("CLIENT_RATE_LIMIT", &mut client.rate_limit.limit)?;
        env.set("CLIENT_RATE_BURST", &mut client.rate_limit.burst)?;

        let breaker = &mut client.circuit_breaker;
        if let Some(name) = env.raw("CB_NAME") {
            breaker.name = name;
        }
        env.set("CB_MAX_REQUESTS", &mut breaker.max_probe_requests)?;
        env.set_duration("CB_INTERVAL_SEC", Duration::from_secs, &mut breaker.closed_interval)?;
        env.set_duration("CB_TIMEOUT_SEC", Duration::from_secs, &mut breaker.open_timeout)?;
        env.set("CB_MIN_REQUESTS", &mut breaker.min_requests)?;
        env.set("CB_FAILURE_RATIO", &mut breaker.failure_ratio)?;
        env.set("CB_SERVER_ERROR_CODES", &mut breaker.failure_codes)?;

        env.set("MAX_RETRIES", &mut client.retry.max_retries)?;
        env.set_duration("RETRY_DELAY", Duration::from_millis, &mut client.retry.delay)?;

        if let Some(name) = env.raw("SERVICE_NAME") {
            config.server.service_name = name;
        }
        let server = &mut config.server.rate_limit;
        env.set("SERVER_RATE_LIMIT", &mut server.default_limit)?;
        env.set("SERVER_RATE_BURST", &mut server.default_burst)?;
        env.set("SERVER_GLOBAL_RATE_LIMIT", &mut server.global_limit)?;
        env.set("SERVER_GLOBAL_RATE_BURST", &mut server.global_burst)?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values no policy can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ratio = self.client.circuit_breaker.failure_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(ConfigError::Invalid(format!(
                "circuit breaker failure_ratio must be within [0, 1], got {ratio}"
            )));
        }

        let server = &self.server.rate_limit;
        let rates = [
            ("client rate_limit.limit", self.client.rate_limit.limit),
            ("server default_limit", server.default_limit),
            ("server global_limit", server.global_limit),
        ]
        .into_iter()
        .chain(
            server
                .method_overrides
                .values()
                .map(|bucket| ("server method override limit", bucket.limit)),
        );
        for (what, rate) in rates {
            if !rate.is_finite() || rate < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{what} must be a non-negative number, got {rate}"
                )));
            }
        }

        Ok(())
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|value| !value.trim().is_empty())
    }

    fn set<T>(&self, key: &'static str, target: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(value) = self.raw(key) {
            *target = value
                .trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidVar {
                    key,
                    value: value.clone(),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    fn set_duration(
        &self,
        key: &'static str,
        unit: fn(u64) -> Duration,
        target: &mut Duration,
    ) -> Result<(), ConfigError> {
        if self.raw(key).is_some() {
            let mut amount = 0u64;
            self.set(key, &mut amount)?;
            *target = unit(amount);
        }
        Ok(())
    }
}
