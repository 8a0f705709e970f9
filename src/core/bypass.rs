//! Bypass-attempt detection.
//!
//! Inspects untrusted client headers for rate-limit bypass markers and
//! forged forwarding chains. A flagged request is not denied outright;
//! it gets a penalty multiplier that makes it consume quota faster.
//! `should_block` is reserved for unambiguous forgery, where the
//! client-supplied forwarding headers contradict each other and the
//! platform header.

use serde::Serialize;

use super::request::AdmissionRequest;
use crate::models::{BypassConfig, IdentityConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BypassType {
    BypassHeader,
    SpoofedForwarding,
    HeaderForgery,
}

/// Per-request signal; stateless, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct BypassSignal {
    pub bypass_attempted: bool,
    pub bypass_type: Option<BypassType>,
    /// Always >= 1.0. Scales the request's weight against the quota.
    pub penalty_multiplier: f64,
    pub should_block: bool,
    pub reason: Option<String>,
}

impl BypassSignal {
    fn clean() -> Self {
        Self {
            bypass_attempted: false,
            bypass_type: None,
            penalty_multiplier: 1.0,
            should_block: false,
            reason: None,
        }
    }
}

pub struct BypassProtectionAnalyzer {
    config: BypassConfig,
    identity: IdentityConfig,
}

impl BypassProtectionAnalyzer {
    pub fn new(config: BypassConfig, identity: IdentityConfig) -> Self {
        Self { config, identity }
    }

    pub fn analyze_request(&self, request: &AdmissionRequest) -> BypassSignal {
        let mut signal = BypassSignal::clean();

        for marker in &self.config.marker_headers {
            if request.header(marker).is_some() {
                signal.bypass_attempted = true;
                signal.bypass_type = Some(BypassType::BypassHeader);
                signal.penalty_multiplier = signal.penalty_multiplier.max(self.config.marker_penalty);
                signal.reason = Some(format!("client-supplied bypass header {}", marker));
            }
        }

        let forwarded_first = request
            .header(&self.identity.forwarded_header)
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        let forwarded_hops = request
            .header(&self.identity.forwarded_header)
            .map(|v| v.split(',').count())
            .unwrap_or(0);
        let real_ip = request
            .header(&self.identity.real_ip_header)
            .map(str::trim)
            .filter(|v| !v.is_empty());
        let platform_ip = request
            .header(&self.identity.client_ip_header)
            .map(str::trim)
            .filter(|v| !v.is_empty());

        if forwarded_hops > self.config.max_forward_hops {
            signal.bypass_attempted = true;
            signal.bypass_type = Some(BypassType::SpoofedForwarding);
            signal.penalty_multiplier = signal.penalty_multiplier.max(self.config.spoof_penalty);
            signal.reason = Some(format!(
                "forwarding chain of {} hops exceeds {}",
                forwarded_hops, self.config.max_forward_hops
            ));
        }

        if let (Some(first), Some(real)) = (forwarded_first, real_ip) {
            if first != real {
                signal.bypass_attempted = true;
                signal.bypass_type = Some(BypassType::SpoofedForwarding);
                signal.penalty_multiplier = signal.penalty_multiplier.max(self.config.spoof_penalty);
                signal.reason = Some(format!(
                    "forwarded-for {} contradicts real-ip {}",
                    first, real
                ));

                // Three mutually inconsistent sources is forgery, not a
                // proxy quirk.
                if let Some(platform) = platform_ip {
                    if platform != first && platform != real {
                        signal.bypass_type = Some(BypassType::HeaderForgery);
                        signal.should_block = true;
                        signal.reason = Some(
                            "forwarding headers mutually inconsistent with platform client IP"
                                .to_string(),
                        );
                    }
                }
            }
        }

        // Multipliers below 1.0 would weaken the quota instead of
        // tightening it.
        signal.penalty_multiplier = signal.penalty_multiplier.max(1.0);
        signal
    }
}
