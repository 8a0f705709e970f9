//! IP reputation and geo-based blocking.
//!
//! A [`GeoProvider`] resolves an IP to a [`GeoProfile`]; the analyzer
//! applies blocking rules in a fixed priority order: explicit deny-list
//! → high-risk country/ASN → anonymizing network with low reputation →
//! allow. A failed lookup skips the block path entirely, it never denies.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::GeoConfig;

#[derive(Error, Debug)]
pub enum GeoError {
    #[error("geo lookup failed: {0}")]
    LookupFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    None,
    Low,
    Medium,
    High,
}

/// Read-mostly reputation profile for one IP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoProfile {
    pub ip: String,
    pub country: String,
    pub asn: u32,
    pub is_proxy: bool,
    pub is_vpn: bool,
    pub is_tor: bool,
    pub is_hosting: bool,
    pub threat_level: ThreatLevel,
    /// 0 (worst) to 100 (clean).
    pub reputation: u8,
}

impl GeoProfile {
    /// Neutral profile for IPs the provider has no data on.
    pub fn unknown(ip: &str) -> Self {
        Self {
            ip: ip.to_string(),
            country: "ZZ".to_string(),
            asn: 0,
            is_proxy: false,
            is_vpn: false,
            is_tor: false,
            is_hosting: false,
            threat_level: ThreatLevel::None,
            reputation: 100,
        }
    }

    pub fn is_anonymizer(&self) -> bool {
        self.is_proxy || self.is_vpn || self.is_tor || self.is_hosting
    }

    /// Flag consumed by the behavioral suspicion score.
    pub fn threat_flagged(&self) -> bool {
        self.threat_level >= ThreatLevel::Medium || self.is_tor
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GeoProvider: Send + Sync {
    async fn lookup(&self, ip: &str) -> Result<GeoProfile, GeoError>;
}

/// Table-backed provider standing in for a geo database client. Profiles
/// are seeded at startup; unseeded IPs resolve to a neutral profile.
#[derive(Default)]
pub struct StaticGeoProvider {
    profiles: HashMap<String, GeoProfile>,
}

impl StaticGeoProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, profile: GeoProfile) -> Self {
        self.profiles.insert(profile.ip.clone(), profile);
        self
    }
}

#[async_trait]
impl GeoProvider for StaticGeoProvider {
    async fn lookup(&self, ip: &str) -> Result<GeoProfile, GeoError> {
        Ok(self
            .profiles
            .get(ip)
            .cloned()
            .unwrap_or_else(|| GeoProfile::unknown(ip)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoAction {
    Allow,
    Block,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeoBlockDecision {
    pub blocked: bool,
    pub reason: Option<String>,
    /// Which rule fired, for deny-response diagnostics.
    pub rule: Option<&'static str>,
    pub action: GeoAction,
}

impl GeoBlockDecision {
    fn allow() -> Self {
        Self {
            blocked: false,
            reason: None,
            rule: None,
            action: GeoAction::Allow,
        }
    }

    fn block(rule: &'static str, reason: String) -> Self {
        Self {
            blocked: true,
            reason: Some(reason),
            rule: Some(rule),
            action: GeoAction::Block,
        }
    }
}

pub struct GeoIpAnalyzer {
    provider: Arc<dyn GeoProvider>,
    config: GeoConfig,
}

impl GeoIpAnalyzer {
    pub fn new(provider: Arc<dyn GeoProvider>, config: GeoConfig) -> Self {
        Self { provider, config }
    }

    pub async fn analyze_ip(&self, ip: &str) -> Result<GeoProfile, GeoError> {
        self.provider.lookup(ip).await
    }

    /// Apply the blocking rules to an already-fetched profile.
    pub fn evaluate(&self, profile: &GeoProfile) -> GeoBlockDecision {
        if self.config.deny_list.iter().any(|denied| denied == &profile.ip) {
            return GeoBlockDecision::block(
                "deny_list",
                format!("IP {} is explicitly denied", profile.ip),
            );
        }
        if self
            .config
            .high_risk_countries
            .iter()
            .any(|c| c.eq_ignore_ascii_case(&profile.country))
        {
            return GeoBlockDecision::block(
                "high_risk_country",
                format!("country {} is high risk", profile.country),
            );
        }
        if self.config.high_risk_asns.contains(&profile.asn) {
            return GeoBlockDecision::block(
                "high_risk_asn",
                format!("ASN {} is high risk", profile.asn),
            );
        }
        if profile.is_anonymizer() && profile.reputation < self.config.reputation_threshold {
            return GeoBlockDecision::block(
                "anonymizer_low_reputation",
                format!(
                    "anonymizing network with reputation {} below {}",
                    profile.reputation, self.config.reputation_threshold
                ),
            );
        }
        GeoBlockDecision::allow()
    }

    /// Lookup plus rule evaluation. A provider failure is logged and
    /// treated as allow; the pipeline proceeds without a geo signal.
    pub async fn should_block_ip(&self, ip: &str) -> GeoBlockDecision {
        match self.analyze_ip(ip).await {
            Ok(profile) => self.evaluate(&profile),
            Err(err) => {
                warn!("geo lookup failed for {}, skipping geo block: {}", ip, err);
                GeoBlockDecision::allow()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GeoConfig {
        GeoConfig {
            deny_list: vec!["203.0.113.66".to_string()],
            high_risk_countries: vec!["XR".to_string()],
            high_risk_asns: vec![64500],
            reputation_threshold: 40,
        }
    }

    fn profile(ip: &str) -> GeoProfile {
        GeoProfile::unknown(ip)
    }

    #[tokio::test]
    async fn test_deny_list_has_highest_priority() {
        // Denied IP with an otherwise clean profile still blocks, and the
        // deny-list rule wins even when the country rule would also match.
        let mut p = profile("203.0.113.66");
        p.country = "XR".to_string();
        let analyzer = GeoIpAnalyzer::new(Arc::new(StaticGeoProvider::new()), config());

        let decision = analyzer.evaluate(&p);
        assert!(decision.blocked);
        assert_eq!(decision.rule, Some("deny_list"));
        assert_eq!(decision.action, GeoAction::Block);
    }

    #[tokio::test]
    async fn test_high_risk_country_blocks() {
        let mut p = profile("198.51.100.9");
        p.country = "xr".to_string();
        let analyzer = GeoIpAnalyzer::new(Arc::new(StaticGeoProvider::new()), config());
        assert_eq!(analyzer.evaluate(&p).rule, Some("high_risk_country"));
    }

    #[tokio::test]
    async fn test_anonymizer_blocks_only_with_low_reputation() {
        let analyzer = GeoIpAnalyzer::new(Arc::new(StaticGeoProvider::new()), config());

        let mut low = profile("198.51.100.10");
        low.is_vpn = true;
        low.reputation = 10;
        assert_eq!(analyzer.evaluate(&low).rule, Some("anonymizer_low_reputation"));

        let mut ok = profile("198.51.100.11");
        ok.is_vpn = true;
        ok.reputation = 80;
        assert!(!analyzer.evaluate(&ok).blocked);
    }

    #[tokio::test]
    async fn test_clean_profile_allows() {
        let analyzer = GeoIpAnalyzer::new(Arc::new(StaticGeoProvider::new()), config());
        let decision = analyzer.should_block_ip("198.51.100.12").await;
        assert!(!decision.blocked);
        assert_eq!(decision.action, GeoAction::Allow);
    }

    #[tokio::test]
    async fn test_lookup_failure_does_not_block() {
        let mut provider = MockGeoProvider::new();
        provider
            .expect_lookup()
            .returning(|_| Err(GeoError::LookupFailed("upstream timeout".to_string())));
        let analyzer = GeoIpAnalyzer::new(Arc::new(provider), config());

        let decision = analyzer.should_block_ip("203.0.113.66").await;
        assert!(!decision.blocked);
    }

    #[tokio::test]
    async fn test_static_provider_returns_seeded_profile() {
        let mut seeded = profile("198.51.100.13");
        seeded.country = "DE".to_string();
        seeded.asn = 3320;
        let provider = StaticGeoProvider::new().with_profile(seeded);

        let looked_up = provider.lookup("198.51.100.13").await.unwrap();
        assert_eq!(looked_up.country, "DE");
        assert_eq!(looked_up.asn, 3320);

        let unknown = provider.lookup("198.51.100.14").await.unwrap();
        assert_eq!(unknown.country, "ZZ");
        assert_eq!(unknown.reputation, 100);
    }
}
