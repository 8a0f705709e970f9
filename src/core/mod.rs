//! Core admission-control components.
//!
//! Leaves first: the counter store abstraction and its backends, then
//! the per-request analyzers, then the pipeline that composes them.

pub mod store;
pub mod memory_store;
pub mod redis_store;

pub mod request;
pub mod identity;
pub mod rate_limiter;
pub mod geoip;
pub mod behavioral;
pub mod bypass;
pub mod captcha;
pub mod ddos;
pub mod pipeline;

pub use store::{CounterStore, StoreError};
pub use memory_store::MemoryCounterStore;
pub use redis_store::RedisCounterStore;

pub use request::{AdmissionRequest, AuthContext};
pub use identity::{IdentityResolver, RequestIdentity, Role};
pub use rate_limiter::{RateLimitOutcome, RateLimitPolicy, RateLimiter};
pub use geoip::{GeoIpAnalyzer, GeoProfile, GeoProvider, StaticGeoProvider};
pub use behavioral::{BehaviorPattern, BehavioralAnalyzer};
pub use bypass::{BypassProtectionAnalyzer, BypassSignal};
pub use captcha::CaptchaGate;
pub use ddos::{DdosDetector, MitigationAction, MitigationDecision, Severity};
pub use pipeline::{AdmissionDecision, AdmissionPipeline, DenyResponse, RateHeaders};
