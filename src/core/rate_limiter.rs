//! Sliding-window rate limiting.
//!
//! Sliding-window log over the shared counter store: each admitted check
//! appends timestamped entries, prunes everything older than the window
//! and counts what remains. Quotas resolve per (role, endpoint); a
//! flagged request carries a penalty weight and consumes several window
//! entries at once.

use std::sync::Arc;

use log::warn;
use serde::Serialize;

use super::identity::Role;
use super::store::CounterStore;
use crate::models::RateLimitConfig;
use crate::utils::{format_store_key, now_millis};

/// Immutable quota resolved for one (role, endpoint) pair.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    pub window_ms: i64,
    pub max_requests: u32,
    /// Store-key namespace; keeps quota records apart from other
    /// components sharing the store.
    pub namespace: String,
}

/// Result of a limit check.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    pub remaining: u32,
    /// When the oldest in-window entry expires, i.e. when capacity
    /// frees up next.
    pub reset_ms: i64,
    pub total_requests: u64,
    /// Populated only on denial.
    pub retry_after_ms: Option<i64>,
}

impl RateLimitOutcome {
    /// Outcome used when the store is unavailable: the count is unknown,
    /// so the request is allowed rather than denied.
    fn fail_open(policy: &RateLimitPolicy, now_ms: i64) -> Self {
        Self {
            allowed: true,
            remaining: policy.max_requests,
            reset_ms: now_ms + policy.window_ms,
            total_requests: 0,
            retry_after_ms: None,
        }
    }
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    /// Resolve the quota for a role/endpoint pair. Endpoint overrides
    /// win over the role tier; roles the table does not know fall back
    /// to the anonymous (most restrictive) quota via [`Role::parse`].
    pub fn policy_for(&self, role: Role, endpoint: &str) -> RateLimitPolicy {
        if let Some(quota) = self.config.endpoint_overrides.get(endpoint) {
            return RateLimitPolicy {
                window_ms: quota.window_ms,
                max_requests: quota.max_requests,
                namespace: self.config.namespace.clone(),
            };
        }
        RateLimitPolicy {
            window_ms: self.config.window_ms,
            max_requests: self.config.role_quotas.for_role(role),
            namespace: self.config.namespace.clone(),
        }
    }

    /// Check and consume quota for `identity_key`.
    ///
    /// `weight` is the bypass penalty multiplier; fractional weights are
    /// rounded up and anything below 1.0 counts as a single entry.
    /// Store failures fail open: the check logs a warning and reports
    /// the request as allowed.
    pub async fn check_limit(
        &self,
        identity_key: &str,
        policy: &RateLimitPolicy,
        weight: f64,
    ) -> RateLimitOutcome {
        self.check_limit_at(identity_key, policy, weight, now_millis())
            .await
    }

    pub(crate) async fn check_limit_at(
        &self,
        identity_key: &str,
        policy: &RateLimitPolicy,
        weight: f64,
        now_ms: i64,
    ) -> RateLimitOutcome {
        let entries = weight.max(1.0).ceil() as u32;
        match self.try_check(identity_key, policy, entries, now_ms).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(
                    "rate limit store unavailable for {}, failing open: {}",
                    identity_key, err
                );
                RateLimitOutcome::fail_open(policy, now_ms)
            }
        }
    }

    async fn try_check(
        &self,
        identity_key: &str,
        policy: &RateLimitPolicy,
        entries: u32,
        now_ms: i64,
    ) -> Result<RateLimitOutcome, super::store::StoreError> {
        let window_key = format_store_key(&policy.namespace, identity_key);
        let window_start = now_ms - policy.window_ms;

        self.store.increment(&window_key, now_ms, entries).await?;
        let count = self
            .store
            .count_in_window(&window_key, window_start, now_ms)
            .await?;
        self.store
            .expire(&window_key, (policy.window_ms / 1000) as u64 + 1)
            .await?;

        let allowed = count <= policy.max_requests as u64;
        let oldest = self
            .store
            .oldest_in_window(&window_key, window_start)
            .await?;
        let reset_ms = oldest
            .map(|ts| ts + policy.window_ms)
            .unwrap_or(now_ms + policy.window_ms);

        Ok(RateLimitOutcome {
            allowed,
            remaining: policy.max_requests.saturating_sub(count as u32),
            reset_ms,
            total_requests: count,
            retry_after_ms: if allowed {
                None
            } else {
                Some((reset_ms - now_ms).max(1))
            },
        })
    }
}
