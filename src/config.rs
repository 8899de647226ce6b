//! Rate limit configuration.
//!
//! Loaded once at startup (usually from JSON), validated, then shared read-only through an
//! `Arc`. Nothing in the crate mutates it afterwards, so every instance behind a load
//! balancer applies identical limits as long as they boot from the same file.
//!
//! ```rust
//! use tollgate::RateLimitConfig;
//!
//! let config = RateLimitConfig::from_json_str(r#"{
//!     "Endpoints": {
//!         "POST:/auth/login": {
//!             "RequestsPerMinute": 10,
//!             "RequestsPerHour": 100,
//!             "RequestsPerDay": 500,
//!             "EnableBurstProtection": true,
//!             "BurstLimit": 3
//!         }
//!     },
//!     "Global": {
//!         "RequestsPerMinute": 300,
//!         "RequestsPerHour": 1000,
//!         "IpBlockingEnabled": true,
//!         "BlockDurationSeconds": 900
//!     }
//! }"#).unwrap();
//! assert_eq!(config.global.requests_per_hour, 1000);
//! ```

use crate::classify::{normalize_endpoint, EndpointClass, EndpointKey};
use crate::error::ConfigError;
use crate::timeout::DEFAULT_STORE_TIMEOUT;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Longest block either escalation may impose (30 days).
pub const MAX_BLOCK_DURATION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Limits for one endpoint (or one endpoint class).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointRateLimit {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub requests_per_day: u32,
    #[serde(default)]
    pub enable_burst_protection: bool,
    /// Requests allowed per 10-second burst window. Ignored unless burst protection is on.
    #[serde(default)]
    pub burst_limit: u32,
}

impl EndpointRateLimit {
    pub fn new(per_minute: u32, per_hour: u32, per_day: u32) -> Self {
        Self {
            requests_per_minute: per_minute,
            requests_per_hour: per_hour,
            requests_per_day: per_day,
            enable_burst_protection: false,
            burst_limit: 0,
        }
    }

    /// Enable the 10-second burst window with the given limit.
    pub fn with_burst(mut self, burst_limit: u32) -> Self {
        self.enable_burst_protection = true;
        self.burst_limit = burst_limit;
        self
    }

    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        positive(&format!("{field}.RequestsPerMinute"), self.requests_per_minute)?;
        positive(&format!("{field}.RequestsPerHour"), self.requests_per_hour)?;
        positive(&format!("{field}.RequestsPerDay"), self.requests_per_day)?;
        if self.enable_burst_protection {
            positive(&format!("{field}.BurstLimit"), self.burst_limit)?;
        }
        Ok(())
    }
}

/// Per-client limits across all endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GlobalRateLimit {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub ip_blocking_enabled: bool,
    #[serde(rename = "BlockDurationSeconds", with = "duration_secs")]
    pub block_duration: Duration,
}

impl Default for GlobalRateLimit {
    fn default() -> Self {
        Self {
            requests_per_minute: 300,
            requests_per_hour: 5_000,
            ip_blocking_enabled: true,
            block_duration: Duration::from_secs(15 * 60),
        }
    }
}

/// Limits for security-sensitive operations, counted per client regardless of endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SecurityRateLimit {
    pub login_attempts_per_minute: u32,
    pub login_attempts_per_hour: u32,
    #[serde(rename = "LoginBlockDurationSeconds", with = "duration_secs")]
    pub login_block_duration: Duration,
    pub password_reset_attempts_per_hour: u32,
    pub registration_attempts_per_hour: u32,
}

impl Default for SecurityRateLimit {
    fn default() -> Self {
        Self {
            login_attempts_per_minute: 5,
            login_attempts_per_hour: 20,
            login_block_duration: Duration::from_secs(30 * 60),
            password_reset_attempts_per_hour: 3,
            registration_attempts_per_hour: 5,
        }
    }
}

/// Fallback limits for endpoints without an explicit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DefaultLimits {
    /// Paths containing an `/auth/` segment.
    pub auth: EndpointRateLimit,
    /// Paths under `/api/`.
    pub api: EndpointRateLimit,
    /// Everything else.
    pub other: EndpointRateLimit,
}

impl Default for DefaultLimits {
    fn default() -> Self {
        Self {
            auth: EndpointRateLimit::new(10, 50, 200).with_burst(5),
            api: EndpointRateLimit::new(60, 1_000, 10_000).with_burst(20),
            other: EndpointRateLimit::new(120, 3_000, 30_000),
        }
    }
}

/// Process-wide rate limit configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RateLimitConfig {
    /// Explicit limits keyed by `METHOD:/normalized/path`.
    pub endpoints: HashMap<String, EndpointRateLimit>,
    pub global: GlobalRateLimit,
    pub security: SecurityRateLimit,
    pub defaults: DefaultLimits,
    /// Budget for all store calls made while evaluating one request.
    #[serde(rename = "StoreTimeoutMs", with = "duration_millis")]
    pub store_timeout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            endpoints: HashMap::new(),
            global: GlobalRateLimit::default(),
            security: SecurityRateLimit::default(),
            defaults: DefaultLimits::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }
}

impl RateLimitConfig {
    /// Parse, normalize endpoint keys and validate.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: RateLimitConfig = serde_json::from_str(json)?;
        config.normalized().validated()
    }

    /// Read a JSON file and hand it to [`from_json_str`](Self::from_json_str).
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_json_str(&json)
    }

    /// Add or replace the limit for one endpoint. `endpoint` is normalized first.
    pub fn with_endpoint(mut self, endpoint: &str, limit: EndpointRateLimit) -> Self {
        self.endpoints.insert(normalize_config_key(endpoint), limit);
        self
    }

    /// Replace the global tier.
    pub fn with_global(mut self, global: GlobalRateLimit) -> Self {
        self.global = global;
        self
    }

    /// Replace the security tier.
    pub fn with_security(mut self, security: SecurityRateLimit) -> Self {
        self.security = security;
        self
    }

    /// Replace the class defaults.
    pub fn with_defaults(mut self, defaults: DefaultLimits) -> Self {
        self.defaults = defaults;
        self
    }

    /// Check every limit is usable.
    pub fn validated(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, limit) in &self.endpoints {
            limit.validate(&format!("Endpoints[{key}]"))?;
        }
        self.defaults.auth.validate("Defaults.Auth")?;
        self.defaults.api.validate("Defaults.Api")?;
        self.defaults.other.validate("Defaults.Other")?;

        positive("Global.RequestsPerMinute", self.global.requests_per_minute)?;
        positive("Global.RequestsPerHour", self.global.requests_per_hour)?;
        if self.global.ip_blocking_enabled && self.global.block_duration.is_zero() {
            return Err(ConfigError::invalid(
                "Global.BlockDurationSeconds",
                "must be > 0 when IpBlockingEnabled is set",
            ));
        }
        within_block_cap("Global.BlockDurationSeconds", self.global.block_duration)?;

        let security = &self.security;
        positive("Security.LoginAttemptsPerMinute", security.login_attempts_per_minute)?;
        positive("Security.LoginAttemptsPerHour", security.login_attempts_per_hour)?;
        if security.login_block_duration.is_zero() {
            return Err(ConfigError::invalid("Security.LoginBlockDurationSeconds", "must be > 0"));
        }
        within_block_cap("Security.LoginBlockDurationSeconds", security.login_block_duration)?;
        positive(
            "Security.PasswordResetAttemptsPerHour",
            security.password_reset_attempts_per_hour,
        )?;
        positive("Security.RegistrationAttemptsPerHour", security.registration_attempts_per_hour)?;
        Ok(())
    }

    /// Resolve the limit for an endpoint: explicit entry first, then the class default.
    pub fn endpoint_limit(&self, endpoint: &EndpointKey) -> &EndpointRateLimit {
        if let Some(limit) = self.endpoints.get(endpoint.as_str()) {
            return limit;
        }
        match endpoint.class() {
            EndpointClass::Auth => &self.defaults.auth,
            EndpointClass::Api => &self.defaults.api,
            EndpointClass::Other => &self.defaults.other,
        }
    }

    fn normalized(mut self) -> Self {
        self.endpoints = self
            .endpoints
            .into_iter()
            .map(|(key, limit)| (normalize_config_key(&key), limit))
            .collect();
        self
    }
}

/// Config keys are written as `METHOD:/path`; run them through the same normalization as
/// live requests so `GET:/api/Alarms/12` and `GET:/api/alarms/{id}` mean the same thing.
fn normalize_config_key(key: &str) -> String {
    match key.split_once(':') {
        Some((method, path)) => normalize_endpoint(method, path).into_string(),
        None => normalize_endpoint("GET", key).into_string(),
    }
}

fn positive(field: &str, value: u32) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::invalid(field, "must be > 0"));
    }
    Ok(())
}

fn within_block_cap(field: &str, duration: Duration) -> Result<(), ConfigError> {
    if duration > MAX_BLOCK_DURATION {
        return Err(ConfigError::invalid(
            field,
            format!("must be at most {} seconds", MAX_BLOCK_DURATION.as_secs()),
        ));
    }
    Ok(())
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        RateLimitConfig::default().validate().unwrap();
    }

    #[test]
    fn parses_pascal_case_json_and_normalizes_keys() {
        let config = RateLimitConfig::from_json_str(
            r#"{
                "Endpoints": {
                    "get:/api/Alarms/42": {
                        "RequestsPerMinute": 7,
                        "RequestsPerHour": 70,
                        "RequestsPerDay": 700
                    }
                },
                "Global": {
                    "RequestsPerMinute": 100,
                    "RequestsPerHour": 1000,
                    "IpBlockingEnabled": true,
                    "BlockDurationSeconds": 60
                },
                "StoreTimeoutMs": 50
            }"#,
        )
        .unwrap();

        let limit = config.endpoints.get("GET:/api/alarms/{id}").expect("normalized key");
        assert_eq!(limit.requests_per_minute, 7);
        assert!(!limit.enable_burst_protection);
        assert_eq!(config.global.block_duration, Duration::from_secs(60));
        assert_eq!(config.store_timeout, Duration::from_millis(50));
        assert_eq!(config.security, SecurityRateLimit::default());
    }

    #[test]
    fn rejects_zero_limits() {
        let err = RateLimitConfig::default()
            .with_endpoint("GET:/api/alarms", EndpointRateLimit::new(0, 10, 10))
            .validated()
            .unwrap_err();
        assert!(err.to_string().contains("RequestsPerMinute"));
    }

    #[test]
    fn rejects_burst_without_limit() {
        let mut limit = EndpointRateLimit::new(10, 10, 10);
        limit.enable_burst_protection = true;
        let err = RateLimitConfig::default()
            .with_endpoint("POST:/auth/login", limit)
            .validated()
            .unwrap_err();
        assert!(err.to_string().contains("BurstLimit"));
    }

    #[test]
    fn rejects_zero_block_duration_when_blocking() {
        let global = GlobalRateLimit { block_duration: Duration::ZERO, ..Default::default() };
        assert!(RateLimitConfig::default().with_global(global).validate().is_err());
    }

    #[test]
    fn rejects_block_durations_past_the_cap() {
        let err = RateLimitConfig::from_json_str(
            r#"{ "Global": { "RequestsPerMinute": 10, "RequestsPerHour": 100,
                             "IpBlockingEnabled": true,
                             "BlockDurationSeconds": 18446744073709551615 } }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Global.BlockDurationSeconds"), "{err}");

        let security = SecurityRateLimit {
            login_block_duration: MAX_BLOCK_DURATION + Duration::from_secs(1),
            ..Default::default()
        };
        let err = RateLimitConfig::default().with_security(security).validate().unwrap_err();
        assert!(err.to_string().contains("LoginBlockDurationSeconds"), "{err}");

        let at_cap = GlobalRateLimit { block_duration: MAX_BLOCK_DURATION, ..Default::default() };
        RateLimitConfig::default().with_global(at_cap).validate().unwrap();
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = RateLimitConfig::from_json_str("{ nope").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn endpoint_limit_falls_back_by_class() {
        let config = RateLimitConfig::default()
            .with_endpoint("POST:/auth/login", EndpointRateLimit::new(3, 30, 300));

        let explicit = config.endpoint_limit(&normalize_endpoint("POST", "/auth/login"));
        assert_eq!(explicit.requests_per_minute, 3);

        let auth = config.endpoint_limit(&normalize_endpoint("POST", "/api/auth/refresh"));
        assert_eq!(auth, &config.defaults.auth);

        let api = config.endpoint_limit(&normalize_endpoint("GET", "/api/routines/7"));
        assert_eq!(api, &config.defaults.api);

        let other = config.endpoint_limit(&normalize_endpoint("GET", "/"));
        assert_eq!(other, &config.defaults.other);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = RateLimitConfig::from_path("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
