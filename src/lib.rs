//! Request admission control service.
//!
//! Gates every API call before it reaches business logic: sliding-window
//! rate limiting, geo/IP reputation checks, behavioral anomaly tracking,
//! bypass-attempt detection, CAPTCHA escalation and DDoS detection with
//! tiered mitigation. All cross-request state lives in an external
//! atomic counter store so handler instances stay stateless.

pub mod api;
pub mod config;
pub mod core;
pub mod models;
pub mod utils;
