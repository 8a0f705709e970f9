use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::core::identity::IdentityConfig;
use crate::core::identity::Role;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
    /// Bound on every store operation, in milliseconds
    pub op_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            op_timeout_ms: 250,
        }
    }
}

/// Per-role request quotas (or baselines) for one window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleQuotas {
    pub anonymous: u32,
    pub buyer: u32,
    pub supplier: u32,
    pub admin: u32,
    pub network: u32,
}

impl RoleQuotas {
    pub fn for_role(&self, role: Role) -> u32 {
        match role {
            Role::Anonymous => self.anonymous,
            Role::Buyer => self.buyer,
            Role::Supplier => self.supplier,
            Role::Admin => self.admin,
            Role::Network => self.network,
        }
    }

    fn values(&self) -> [u32; 5] {
        [
            self.anonymous,
            self.buyer,
            self.supplier,
            self.admin,
            self.network,
        ]
    }
}

impl Default for RoleQuotas {
    fn default() -> Self {
        Self {
            anonymous: 100,
            buyer: 300,
            supplier: 300,
            admin: 1000,
            network: 600,
        }
    }
}

/// Quota override for a specific endpoint, applied to every role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointQuota {
    pub window_ms: i64,
    pub max_requests: u32,
}

/// Rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sliding window length in milliseconds
    pub window_ms: i64,
    /// Role-tiered quotas per window
    pub role_quotas: RoleQuotas,
    /// Exact-path overrides, e.g. a tight quota on a login endpoint
    pub endpoint_overrides: HashMap<String, EndpointQuota>,
    /// Store-key namespace for quota records
    pub namespace: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            role_quotas: RoleQuotas::default(),
            endpoint_overrides: HashMap::new(),
            namespace: "rl".to_string(),
        }
    }
}

/// Geo blocking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoConfig {
    /// Explicitly denied IPs, highest priority
    pub deny_list: Vec<String>,
    /// ISO country codes blocked outright
    pub high_risk_countries: Vec<String>,
    /// ASNs blocked outright
    pub high_risk_asns: Vec<u32>,
    /// Anonymizing networks below this reputation are blocked
    pub reputation_threshold: u8,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            deny_list: Vec::new(),
            high_risk_countries: Vec::new(),
            high_risk_asns: Vec::new(),
            reputation_threshold: 40,
        }
    }
}

/// Behavioral analysis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorConfig {
    /// Rolling pattern-history window in milliseconds
    pub window_ms: i64,
    /// Request count below which endpoint diversity is not scored
    pub volume_gate: u32,
    /// Per-role velocity baselines for the suspicion score
    pub role_baselines: RoleQuotas,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            window_ms: 300_000,
            volume_gate: 20,
            role_baselines: RoleQuotas {
                anonymous: 60,
                buyer: 120,
                supplier: 120,
                admin: 240,
                network: 180,
            },
        }
    }
}

/// Bypass detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BypassConfig {
    /// Client-supplied headers that mark a bypass attempt
    pub marker_headers: Vec<String>,
    /// Longest plausible forwarded-for chain
    pub max_forward_hops: usize,
    /// Penalty multiplier for marker headers
    pub marker_penalty: f64,
    /// Penalty multiplier for spoofed forwarding headers
    pub spoof_penalty: f64,
}

impl Default for BypassConfig {
    fn default() -> Self {
        Self {
            marker_headers: vec![
                "x-rate-limit-bypass".to_string(),
                "x-bypass-token".to_string(),
                "x-admin-override".to_string(),
            ],
            max_forward_hops: 5,
            marker_penalty: 2.0,
            spoof_penalty: 2.0,
        }
    }
}

/// CAPTCHA gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaConfig {
    /// Suspicion score at or above which a challenge is offered
    pub suspicion_threshold: f64,
    pub captcha_type: String,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            suspicion_threshold: 0.6,
            captcha_type: "recaptcha_v2".to_string(),
        }
    }
}

/// DDoS detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdosConfig {
    /// Trailing window in milliseconds
    pub window_ms: i64,
    /// Request volume at or below this is normal traffic
    pub request_baseline: u64,
    /// Volume above this, with elevated cardinality, is a high-severity attack
    pub high_threshold: u64,
    /// Volume above this is critical regardless of cardinality
    pub critical_threshold: u64,
    /// Distinct source IPs above this count as elevated cardinality
    pub distinct_ip_baseline: u64,
}

impl Default for DdosConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            request_baseline: 100,
            high_threshold: 500,
            critical_threshold: 1_000,
            distinct_ip_baseline: 50,
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Methods that bypass every check
    pub skip_methods: Vec<String>,
    /// Exact paths that bypass every check
    pub skip_paths: Vec<String>,
    pub enable_geo_blocking: bool,
    pub enable_behavioral_analysis: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            skip_methods: vec!["OPTIONS".to_string()],
            skip_paths: Vec::new(),
            enable_geo_blocking: true,
            enable_behavioral_analysis: true,
        }
    }
}

/// Contradictory or malformed settings are fatal at startup, never
/// surfaced per-request.
#[derive(Error, Debug)]
pub enum ConfigValidationError {
    #[error("rate limit misconfigured: {0}")]
    RateLimit(String),
    #[error("identity headers misconfigured: {0}")]
    Identity(String),
    #[error("bypass detection misconfigured: {0}")]
    Bypass(String),
    #[error("captcha gate misconfigured: {0}")]
    Captcha(String),
    #[error("ddos thresholds misconfigured: {0}")]
    Ddos(String),
    #[error("behavior analysis misconfigured: {0}")]
    Behavior(String),
    #[error("redis misconfigured: {0}")]
    Redis(String),
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub identity: IdentityConfig,
    pub rate_limit: RateLimitConfig,
    pub geo: GeoConfig,
    pub behavior: BehaviorConfig,
    pub bypass: BypassConfig,
    pub captcha: CaptchaConfig,
    pub ddos: DdosConfig,
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Environment overrides on top of the defaults, for deployments
    /// without a config file.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();
        let mut config = Self::default();

        if let Ok(v) = std::env::var("SERVER_HOST") {
            config.server.host = v;
        }
        if let Ok(v) = std::env::var("SERVER_PORT") {
            config.server.port = v.parse()?;
        }
        if let Ok(v) = std::env::var("REDIS_URL") {
            config.redis.url = v;
        }
        if let Ok(v) = std::env::var("REDIS_OP_TIMEOUT_MS") {
            config.redis.op_timeout_ms = v.parse()?;
        }
        if let Ok(v) = std::env::var("RATE_LIMIT_WINDOW_MS") {
            config.rate_limit.window_ms = v.parse()?;
        }
        if let Ok(v) = std::env::var("RATE_LIMIT_ANONYMOUS") {
            config.rate_limit.role_quotas.anonymous = v.parse()?;
        }
        if let Ok(v) = std::env::var("DDOS_WINDOW_MS") {
            config.ddos.window_ms = v.parse()?;
        }
        if let Ok(v) = std::env::var("DDOS_CRITICAL_THRESHOLD") {
            config.ddos.critical_threshold = v.parse()?;
        }
        if let Ok(v) = std::env::var("CAPTCHA_SUSPICION_THRESHOLD") {
            config.captcha.suspicion_threshold = v.parse()?;
        }

        Ok(config)
    }

    /// Validate once at startup. Per-request code can then assume the
    /// configuration is internally consistent.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.redis.op_timeout_ms == 0 {
            return Err(ConfigValidationError::Redis(
                "op_timeout_ms must be positive".to_string(),
            ));
        }

        if self.rate_limit.window_ms <= 0 {
            return Err(ConfigValidationError::RateLimit(
                "window_ms must be positive".to_string(),
            ));
        }
        if self.rate_limit.role_quotas.values().iter().any(|q| *q == 0) {
            return Err(ConfigValidationError::RateLimit(
                "every role quota must be positive".to_string(),
            ));
        }
        if self.rate_limit.namespace.is_empty() {
            return Err(ConfigValidationError::RateLimit(
                "namespace must not be empty".to_string(),
            ));
        }
        for (endpoint, quota) in &self.rate_limit.endpoint_overrides {
            if quota.window_ms <= 0 || quota.max_requests == 0 {
                return Err(ConfigValidationError::RateLimit(format!(
                    "override for {} must have a positive window and quota",
                    endpoint
                )));
            }
        }

        if self.identity.client_ip_header.is_empty()
            || self.identity.forwarded_header.is_empty()
            || self.identity.real_ip_header.is_empty()
        {
            return Err(ConfigValidationError::Identity(
                "header names must not be empty".to_string(),
            ));
        }

        if self.bypass.marker_penalty < 1.0 || self.bypass.spoof_penalty < 1.0 {
            return Err(ConfigValidationError::Bypass(
                "penalty multipliers below 1.0 would weaken the quota".to_string(),
            ));
        }
        if self.bypass.max_forward_hops == 0 {
            return Err(ConfigValidationError::Bypass(
                "max_forward_hops must be positive".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.captcha.suspicion_threshold) {
            return Err(ConfigValidationError::Captcha(
                "suspicion_threshold must be within [0, 1]".to_string(),
            ));
        }

        if self.behavior.window_ms <= 0 {
            return Err(ConfigValidationError::Behavior(
                "window_ms must be positive".to_string(),
            ));
        }
        if self.behavior.role_baselines.values().iter().any(|b| *b == 0) {
            return Err(ConfigValidationError::Behavior(
                "every role baseline must be positive".to_string(),
            ));
        }

        if self.ddos.window_ms <= 0 {
            return Err(ConfigValidationError::Ddos(
                "window_ms must be positive".to_string(),
            ));
        }
        if self.ddos.request_baseline == 0
            || self.ddos.request_baseline >= self.ddos.high_threshold
            || self.ddos.high_threshold >= self.ddos.critical_threshold
        {
            return Err(ConfigValidationError::Ddos(
                "thresholds must be strictly increasing: baseline < high < critical".to_string(),
            ));
        }
        if self.ddos.distinct_ip_baseline == 0 {
            return Err(ConfigValidationError::Ddos(
                "distinct_ip_baseline must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_from_env_overrides_defaults() {
        std::env::set_var("RATE_LIMIT_ANONYMOUS", "42");
        std::env::set_var("CAPTCHA_SUSPICION_THRESHOLD", "0.9");

        let config = Config::from_env().expect("env overrides should parse");
        assert_eq!(config.rate_limit.role_quotas.anonymous, 42);
        assert_eq!(config.captcha.suspicion_threshold, 0.9);
        // Untouched settings keep their defaults.
        assert_eq!(config.ddos.critical_threshold, 1_000);

        std::env::remove_var("RATE_LIMIT_ANONYMOUS");
        std::env::remove_var("CAPTCHA_SUSPICION_THRESHOLD");
    }

    #[test]
    fn test_non_increasing_ddos_thresholds_are_rejected() {
        let mut config = Config::default();
        config.ddos.high_threshold = config.ddos.critical_threshold;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::Ddos(_))
        ));
    }

    #[test]
    fn test_zero_role_quota_is_rejected() {
        let mut config = Config::default();
        config.rate_limit.role_quotas.buyer = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::RateLimit(_))
        ));
    }

    #[test]
    fn test_sub_unit_penalty_is_rejected() {
        let mut config = Config::default();
        config.bypass.spoof_penalty = 0.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::Bypass(_))
        ));
    }

    #[test]
    fn test_captcha_threshold_out_of_range_is_rejected() {
        let mut config = Config::default();
        config.captcha.suspicion_threshold = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::Captcha(_))
        ));
    }

    #[test]
    fn test_empty_identity_header_is_rejected() {
        let mut config = Config::default();
        config.identity.forwarded_header = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::Identity(_))
        ));
    }
}
