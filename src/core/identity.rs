//! Request identity resolution.
//!
//! Extracts a stable `(ip, role, endpoint)` identity from raw headers.
//! IP precedence, first populated wins: platform client-IP header →
//! left-most forwarded-for entry → real-ip header → loopback fallback.
//! The left-most forwarded-for entry is the client-closest one by
//! convention; later hops are proxy-appended.

use serde::{Deserialize, Serialize};

use super::request::AdmissionRequest;
use crate::utils::now_millis;

/// Caller role, resolved upstream. Unknown labels parse to `Anonymous`,
/// which carries the most restrictive quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Anonymous,
    Buyer,
    Supplier,
    Admin,
    Network,
}

impl Role {
    pub fn parse(label: &str) -> Self {
        match label.to_ascii_lowercase().as_str() {
            "buyer" => Role::Buyer,
            "supplier" => Role::Supplier,
            "admin" => Role::Admin,
            "network" => Role::Network,
            _ => Role::Anonymous,
        }
    }
}

/// Per-request identity. Derived fresh for every request and used only
/// as a lookup key, never persisted.
#[derive(Debug, Clone)]
pub struct RequestIdentity {
    pub ip: String,
    pub is_authenticated: bool,
    pub user_id: Option<String>,
    pub role: Role,
    pub endpoint: String,
    pub method: String,
    pub timestamp_ms: i64,
}

impl RequestIdentity {
    /// Default identity key: authenticated callers are tracked per user,
    /// everyone else per source IP.
    pub fn key(&self) -> String {
        match &self.user_id {
            Some(user_id) if self.is_authenticated => format!("user:{}", user_id),
            _ => format!("ip:{}", self.ip),
        }
    }
}

/// Header names consulted for the client IP, in precedence order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Platform-native client IP header, e.g. `cf-connecting-ip`.
    pub client_ip_header: String,
    /// Comma-separated forwarded-for header; only the first entry is used.
    pub forwarded_header: String,
    /// Secondary single-value real IP header.
    pub real_ip_header: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            client_ip_header: "cf-connecting-ip".to_string(),
            forwarded_header: "x-forwarded-for".to_string(),
            real_ip_header: "x-real-ip".to_string(),
        }
    }
}

const FALLBACK_IP: &str = "127.0.0.1";

/// Pure function of headers plus the pre-resolved auth context; no side
/// effects and no token parsing.
pub struct IdentityResolver {
    config: IdentityConfig,
}

impl IdentityResolver {
    pub fn new(config: IdentityConfig) -> Self {
        Self { config }
    }

    pub fn resolve(&self, request: &AdmissionRequest) -> RequestIdentity {
        let ip = self.client_ip(request);
        let (is_authenticated, user_id, role) = match &request.auth {
            Some(auth) => (true, Some(auth.user_id.clone()), auth.role),
            None => (false, None, Role::Anonymous),
        };

        RequestIdentity {
            ip,
            is_authenticated,
            user_id,
            role,
            endpoint: request.path.clone(),
            method: request.method.clone(),
            timestamp_ms: now_millis(),
        }
    }

    pub fn client_ip(&self, request: &AdmissionRequest) -> String {
        if let Some(ip) = non_empty(request.header(&self.config.client_ip_header)) {
            return ip.to_string();
        }
        if let Some(forwarded) = non_empty(request.header(&self.config.forwarded_header)) {
            if let Some(first) = forwarded.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
        if let Some(ip) = non_empty(request.header(&self.config.real_ip_header)) {
            return ip.to_string();
        }
        FALLBACK_IP.to_string()
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
