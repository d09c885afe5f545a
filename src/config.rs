use serde::Deserialize;
use std::time::Duration;
use validator::Validate;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Settings {
    #[validate]
    pub application: ApplicationSettings,
    pub database: DatabaseSettings,
    pub redis: RedisSettings,
    #[validate]
    pub idempotency: IdempotencySettings,
    #[validate]
    pub cache: CacheSettings,
    #[serde(default)]
    pub upstream: UpstreamSettings,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ApplicationSettings {
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub pool_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    pub url: String,
}

/// Where idempotency records live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Redis,
    /// Process-local; only for development and tests.
    Memory,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct IdempotencySettings {
    pub backend: StoreBackend,
    #[validate(range(min = 1))]
    pub ttl_secs: u64,
    #[validate(range(min = 1))]
    pub pending_ttl_secs: u64,
    #[validate(length(min = 1))]
    pub key_prefix: String,
    #[validate(length(min = 1))]
    pub tenant_header: String,
    #[validate(length(min = 1))]
    pub product_header: String,
    #[validate(length(min = 1))]
    pub key_header: String,
    #[validate(range(min = 1))]
    pub max_body_bytes: usize,
    pub conflict_retry_attempts: u32,
    pub conflict_retry_backoff_ms: u64,
    pub sweep_interval_secs: u64,
}

impl IdempotencySettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            ttl_secs: 86400,
            pending_ttl_secs: 60,
            key_prefix: "idem".to_string(),
            tenant_header: "x-tenant-id".to_string(),
            product_header: "x-product-code".to_string(),
            key_header: "idempotency-key".to_string(),
            max_body_bytes: 1024 * 1024,
            conflict_retry_attempts: 0,
            conflict_retry_backoff_ms: 50,
            sweep_interval_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CacheSettings {
    pub enabled: bool,
    pub backend: CacheBackend,
    #[validate(length(min = 1))]
    pub key_prefix: String,
    #[validate(range(min = 1))]
    pub default_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CacheBackend::Memory,
            key_prefix: "edge-cache".to_string(),
            default_ttl_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSettings {
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: 30,
        }
    }
}

/// Headroom a pending lease keeps over the upstream timeout.
pub const LEASE_MARGIN_SECS: u64 = 5;

/// A pending marker must outlive the slowest upstream call, or a retry takes
/// the key over while the first attempt is still running.
pub fn check_pending_lease(
    idempotency: &IdempotencySettings,
    upstream: &UpstreamSettings,
) -> Result<(), config::ConfigError> {
    let required = upstream.timeout_secs.saturating_add(LEASE_MARGIN_SECS);
    if idempotency.pending_ttl_secs <= required {
        return Err(config::ConfigError::Message(format!(
            "idempotency.pending_ttl_secs ({}) must exceed upstream.timeout_secs ({}) plus {}s",
            idempotency.pending_ttl_secs, upstream.timeout_secs, LEASE_MARGIN_SECS
        )));
    }
    Ok(())
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings
            .validate()
            .map_err(|e| config::ConfigError::Message(e.to_string()))?;
        check_pending_lease(&settings.idempotency, &settings.upstream)?;

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_idempotency_settings_are_valid() {
        let settings = IdempotencySettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.ttl(), Duration::from_secs(86400));
        assert_eq!(settings.pending_ttl(), Duration::from_secs(60));
    }

    #[test]
    fn test_default_lease_outlives_upstream_timeout() {
        assert!(
            check_pending_lease(&IdempotencySettings::default(), &UpstreamSettings::default())
                .is_ok()
        );
    }

    #[test]
    fn test_lease_not_longer_than_upstream_timeout_rejected() {
        let upstream = UpstreamSettings::default();
        let equal = IdempotencySettings {
            pending_ttl_secs: upstream.timeout_secs,
            ..IdempotencySettings::default()
        };
        assert!(check_pending_lease(&equal, &upstream).is_err());

        let within_margin = IdempotencySettings {
            pending_ttl_secs: upstream.timeout_secs + LEASE_MARGIN_SECS,
            ..IdempotencySettings::default()
        };
        assert!(check_pending_lease(&within_margin, &upstream).is_err());

        let enough = IdempotencySettings {
            pending_ttl_secs: upstream.timeout_secs + LEASE_MARGIN_SECS + 1,
            ..IdempotencySettings::default()
        };
        assert!(check_pending_lease(&enough, &upstream).is_ok());
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let settings = IdempotencySettings {
            ttl_secs: 0,
            ..IdempotencySettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_empty_header_rejected() {
        let settings = IdempotencySettings {
            tenant_header: String::new(),
            ..IdempotencySettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
