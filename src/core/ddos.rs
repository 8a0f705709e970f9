//! DDoS detection and tiered mitigation.
//!
//! Aggregates global signals across all identities: total requests in a
//! trailing window plus distinct source-IP cardinality over the same
//! window. Severity drives an ordered list of mitigation actions,
//! applied before any per-identity check runs.

use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};

use super::store::{CounterStore, StoreError};
use crate::models::DdosConfig;
use crate::utils::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MitigationAction {
    ActivateEmergencyMode,
    BlockAllAnonymous,
}

#[derive(Debug, Clone, Serialize)]
pub struct MitigationDecision {
    pub is_ddos: bool,
    pub severity: Severity,
    pub mitigation_actions: Vec<MitigationAction>,
}

impl MitigationDecision {
    fn quiet() -> Self {
        Self {
            is_ddos: false,
            severity: Severity::Low,
            mitigation_actions: Vec::new(),
        }
    }
}

/// Denial selected by a mitigation action, turned into a response by the
/// pipeline.
#[derive(Debug, Clone)]
pub struct MitigationResponse {
    pub status: u16,
    pub error: &'static str,
    pub retry_after_secs: Option<u64>,
}

pub struct DdosDetector {
    store: Arc<dyn CounterStore>,
    config: DdosConfig,
}

impl DdosDetector {
    pub fn new(store: Arc<dyn CounterStore>, config: DdosConfig) -> Self {
        Self { store, config }
    }

    /// Record the request into the global window and classify the
    /// current attack severity. Store failures classify as quiet; a
    /// degraded store must not take the whole service down with it.
    pub async fn detect(&self, ip: &str) -> MitigationDecision {
        self.detect_at(ip, now_millis()).await
    }

    pub(crate) async fn detect_at(&self, ip: &str, now_ms: i64) -> MitigationDecision {
        match self.record_and_count(ip, now_ms).await {
            Ok((requests, distinct_ips)) => self.classify(requests, distinct_ips),
            Err(err) => {
                warn!("ddos detection store unavailable, treating as quiet: {}", err);
                MitigationDecision::quiet()
            }
        }
    }

    async fn record_and_count(&self, ip: &str, now_ms: i64) -> Result<(u64, u64), StoreError> {
        let window_start = now_ms - self.config.window_ms;
        let ttl = (self.config.window_ms / 1000) as u64 + 1;

        self.store.increment("ddos:requests", now_ms, 1).await?;
        let requests = self
            .store
            .count_in_window("ddos:requests", window_start, now_ms)
            .await?;
        self.store.expire("ddos:requests", ttl).await?;

        // Each IP keeps only its most recent sighting, so cardinality
        // follows the same trailing window as the request count.
        self.store.touch_set_member("ddos:ips", ip, now_ms).await?;
        self.store.expire("ddos:ips", ttl).await?;
        let distinct_ips = self
            .store
            .distinct_in_window("ddos:ips", window_start)
            .await?;

        Ok((requests, distinct_ips))
    }

    fn classify(&self, requests: u64, distinct_ips: u64) -> MitigationDecision {
        let elevated_ips = distinct_ips > self.config.distinct_ip_baseline;

        let severity = if requests > self.config.critical_threshold {
            Severity::Critical
        } else if requests > self.config.high_threshold && elevated_ips {
            Severity::High
        } else if requests > self.config.request_baseline && elevated_ips {
            Severity::Medium
        } else {
            Severity::Low
        };

        let mitigation_actions = match severity {
            Severity::Critical => vec![
                MitigationAction::ActivateEmergencyMode,
                MitigationAction::BlockAllAnonymous,
            ],
            Severity::High => vec![MitigationAction::BlockAllAnonymous],
            Severity::Medium | Severity::Low => Vec::new(),
        };

        MitigationDecision {
            is_ddos: severity != Severity::Low,
            severity,
            mitigation_actions,
        }
    }

    /// Map the decision's actions onto a denial for this request, if any
    /// applies. Emergency mode denies everyone; the anonymous block only
    /// denies requests without an authenticated identity.
    pub fn apply_mitigation(
        &self,
        decision: &MitigationDecision,
        is_authenticated: bool,
    ) -> Option<MitigationResponse> {
        for action in &decision.mitigation_actions {
            match action {
                MitigationAction::ActivateEmergencyMode => {
                    return Some(MitigationResponse {
                        status: 503,
                        error: "Service temporarily unavailable",
                        retry_after_secs: Some((self.config.window_ms / 1000) as u64),
                    });
                }
                MitigationAction::BlockAllAnonymous if !is_authenticated => {
                    return Some(MitigationResponse {
                        status: 429,
                        error: "Authentication required",
                        retry_after_secs: None,
                    });
                }
                MitigationAction::BlockAllAnonymous => {}
            }
        }
        None
    }
}
