//! Behavioral anomaly tracking.
//!
//! Records per-identity request patterns into the shared store and
//! derives a suspicion score in [0, 1] from the pattern window. The
//! score is never persisted; it is recomputed from the window on demand.
//! Recording is best-effort and must never block an admission decision.

use std::sync::Arc;

use log::debug;

use super::identity::Role;
use super::store::CounterStore;
use crate::models::BehaviorConfig;
use crate::utils::{format_store_key, now_millis};

/// One observed request, appended to the identity's rolling history.
#[derive(Debug, Clone)]
pub struct BehaviorPattern {
    pub identity_key: String,
    pub endpoint: String,
    pub method: String,
    pub timestamp_ms: i64,
}

pub struct BehavioralAnalyzer {
    store: Arc<dyn CounterStore>,
    config: BehaviorConfig,
}

impl BehavioralAnalyzer {
    pub fn new(store: Arc<dyn CounterStore>, config: BehaviorConfig) -> Self {
        Self { store, config }
    }

    /// Append a pattern to the identity's history. Failures are logged
    /// and swallowed; the history only feeds future decisions, never the
    /// current one.
    pub async fn record_pattern(&self, pattern: &BehaviorPattern) {
        let window_key = format_store_key("behavior", &pattern.identity_key);
        let endpoints_key = format_store_key("behavior:endpoints", &pattern.identity_key);
        let ttl = (self.config.window_ms / 1000) as u64 + 1;

        let result = async {
            self.store
                .increment(&window_key, pattern.timestamp_ms, 1)
                .await?;
            self.store
                .add_to_set(&endpoints_key, &pattern.endpoint)
                .await?;
            self.store.expire(&window_key, ttl).await?;
            self.store.expire(&endpoints_key, ttl).await
        }
        .await;

        if let Err(err) = result {
            debug!(
                "behavior recording failed for {}: {}",
                pattern.identity_key, err
            );
        }
    }

    /// Suspicion score in [0, 1].
    ///
    /// Monotonic by construction: the velocity term never decreases with
    /// request count, the diversity term only activates above the volume
    /// gate and grows as endpoint diversity narrows, and a threat-flagged
    /// geo profile adds a fixed amount. Store failures score 0.
    pub async fn suspicion_score(&self, identity_key: &str, role: Role, geo_threat: bool) -> f64 {
        self.suspicion_score_at(identity_key, role, geo_threat, now_millis())
            .await
    }

    pub(crate) async fn suspicion_score_at(
        &self,
        identity_key: &str,
        role: Role,
        geo_threat: bool,
        now_ms: i64,
    ) -> f64 {
        let window_key = format_store_key("behavior", identity_key);
        let endpoints_key = format_store_key("behavior:endpoints", identity_key);
        let window_start = now_ms - self.config.window_ms;

        let velocity = match self
            .store
            .count_in_window(&window_key, window_start, now_ms)
            .await
        {
            Ok(count) => count,
            Err(_) => return 0.0,
        };
        let distinct_endpoints = self
            .store
            .set_cardinality(&endpoints_key)
            .await
            .unwrap_or(0);

        let baseline = self.config.role_baselines.for_role(role) as f64;
        let velocity_term = 0.6 * (velocity as f64 / (4.0 * baseline)).min(1.0);

        let diversity_term = if velocity > self.config.volume_gate as u64 {
            let diversity_ratio = if velocity == 0 {
                1.0
            } else {
                (distinct_endpoints as f64 / velocity as f64).min(1.0)
            };
            0.25 * (1.0 - diversity_ratio)
        } else {
            0.0
        };

        let threat_term = if geo_threat { 0.15 } else { 0.0 };

        (velocity_term + diversity_term + threat_term).clamp(0.0, 1.0)
    }
}
