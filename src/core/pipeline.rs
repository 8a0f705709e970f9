//! Admission pipeline orchestration.
//!
//! Fixed per-request order: skip rules → DDoS mitigation → identity →
//! bypass check → geo check → rate check (with behavioral recording) →
//! CAPTCHA gate on denial. Produces an admit/deny decision plus the
//! rate-limit headers to decorate the business handler's response with.
//! The pipeline itself fails open: an unexpected internal error degrades
//! to "no protection", never to a denied request.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::FutureExt;
use log::{error, info, warn};
use metrics::increment_counter;
use serde_json::json;

use super::behavioral::{BehaviorPattern, BehavioralAnalyzer};
use super::bypass::BypassProtectionAnalyzer;
use super::captcha::CaptchaGate;
use super::ddos::DdosDetector;
use super::geoip::{GeoIpAnalyzer, GeoProfile};
use super::identity::{IdentityResolver, RequestIdentity};
use super::rate_limiter::{RateLimitOutcome, RateLimiter};
use super::request::AdmissionRequest;
use crate::models::PipelineConfig;

/// Override for the identity-key derivation. Must be pure: same request,
/// same key.
pub type IdentifierFn = Arc<dyn Fn(&AdmissionRequest) -> String + Send + Sync>;

/// Observer fired on rate-limit denial. Side effects only; its outcome
/// never changes the decision, and panics are swallowed.
pub type LimitObserverFn = Arc<dyn Fn(&AdmissionRequest, &RateLimitOutcome) + Send + Sync>;

/// Headers decorated onto admitted responses.
#[derive(Debug, Clone)]
pub struct RateHeaders {
    pub limit: u32,
    pub remaining: u32,
    pub reset_ms: i64,
}

/// Structured denial, mapped onto an HTTP response by the API layer.
#[derive(Debug, Clone)]
pub struct DenyResponse {
    pub status: u16,
    pub body: serde_json::Value,
    pub retry_after_secs: Option<u64>,
    pub rate_headers: Option<RateHeaders>,
}

#[derive(Debug, Clone)]
pub enum AdmissionDecision {
    /// Delegate to the business handler. `rate_headers` is `None` for
    /// requests that skipped the pipeline entirely.
    Admit { rate_headers: Option<RateHeaders> },
    Deny(DenyResponse),
}

impl AdmissionDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionDecision::Admit { .. })
    }
}

pub struct AdmissionPipeline {
    identity: IdentityResolver,
    bypass: BypassProtectionAnalyzer,
    geo: GeoIpAnalyzer,
    limiter: RateLimiter,
    behavioral: Arc<BehavioralAnalyzer>,
    captcha: CaptchaGate,
    ddos: DdosDetector,
    config: PipelineConfig,
    custom_identifier: Option<IdentifierFn>,
    on_limit_exceeded: Option<LimitObserverFn>,
}

impl AdmissionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: IdentityResolver,
        bypass: BypassProtectionAnalyzer,
        geo: GeoIpAnalyzer,
        limiter: RateLimiter,
        behavioral: Arc<BehavioralAnalyzer>,
        captcha: CaptchaGate,
        ddos: DdosDetector,
        config: PipelineConfig,
    ) -> Self {
        Self {
            identity,
            bypass,
            geo,
            limiter,
            behavioral,
            captcha,
            ddos,
            config,
            custom_identifier: None,
            on_limit_exceeded: None,
        }
    }

    pub fn with_custom_identifier(mut self, identifier: IdentifierFn) -> Self {
        self.custom_identifier = Some(identifier);
        self
    }

    pub fn with_limit_observer(mut self, observer: LimitObserverFn) -> Self {
        self.on_limit_exceeded = Some(observer);
        self
    }

    /// Run the full admission check for one request.
    ///
    /// A panic anywhere in the check, including injected strategies,
    /// admits the request without protection rather than failing it.
    pub async fn process(&self, request: &AdmissionRequest) -> AdmissionDecision {
        increment_counter!("admission_requests_total");

        match AssertUnwindSafe(self.evaluate(request)).catch_unwind().await {
            Ok(decision) => decision,
            Err(_) => {
                error!(
                    "admission check panicked for {} {}, failing open",
                    request.method, request.path
                );
                increment_counter!("admission_failopen_total");
                AdmissionDecision::Admit { rate_headers: None }
            }
        }
    }

    async fn evaluate(&self, request: &AdmissionRequest) -> AdmissionDecision {
        if self.should_skip(request) {
            return AdmissionDecision::Admit { rate_headers: None };
        }

        let identity = self.identity.resolve(request);

        // Global mitigation outranks every per-identity check.
        let ddos_decision = self.ddos.detect(&identity.ip).await;
        if let Some(mitigation) = self
            .ddos
            .apply_mitigation(&ddos_decision, identity.is_authenticated)
        {
            info!(
                "denying {} {} from {}: ddos mitigation ({:?})",
                request.method, request.path, identity.ip, ddos_decision.severity
            );
            increment_counter!("admission_denied_total", "reason" => "ddos_mitigation");
            return AdmissionDecision::Deny(DenyResponse {
                status: mitigation.status,
                body: json!({ "error": mitigation.error }),
                retry_after_secs: mitigation.retry_after_secs,
                rate_headers: None,
            });
        }

        let signal = self.bypass.analyze_request(request);
        if signal.should_block {
            info!(
                "denying {} {} from {}: bypass forgery",
                request.method, request.path, identity.ip
            );
            increment_counter!("admission_denied_total", "reason" => "bypass_block");
            return AdmissionDecision::Deny(DenyResponse {
                status: 403,
                body: json!({
                    "error": "Request blocked",
                    "reason": signal.reason,
                }),
                retry_after_secs: None,
                rate_headers: None,
            });
        }

        // Geo block must come before any quota write: deliberately
        // blocked traffic must not burn quota for legitimate users
        // sharing the same NAT.
        let mut geo_profile: Option<GeoProfile> = None;
        if self.config.enable_geo_blocking {
            match self.geo.analyze_ip(&identity.ip).await {
                Ok(profile) => {
                    let decision = self.geo.evaluate(&profile);
                    if decision.blocked {
                        info!(
                            "denying {} {} from {}: geo block ({})",
                            request.method,
                            request.path,
                            identity.ip,
                            decision.rule.unwrap_or("unknown")
                        );
                        increment_counter!("admission_denied_total", "reason" => "geo_block");
                        return AdmissionDecision::Deny(DenyResponse {
                            status: 403,
                            body: json!({
                                "error": "Geographic restriction",
                                "reason": decision.reason,
                            }),
                            retry_after_secs: None,
                            rate_headers: None,
                        });
                    }
                    geo_profile = Some(profile);
                }
                Err(err) => {
                    warn!("geo lookup failed for {}, continuing: {}", identity.ip, err);
                }
            }
        }

        let identity_key = match &self.custom_identifier {
            Some(identifier) => identifier(request),
            None => identity.key(),
        };

        if self.config.enable_behavioral_analysis {
            // Fire-and-forget: the history feeds future decisions, so the
            // write may outlive this request but must never delay it.
            let behavioral = Arc::clone(&self.behavioral);
            let pattern = BehaviorPattern {
                identity_key: identity_key.clone(),
                endpoint: identity.endpoint.clone(),
                method: identity.method.clone(),
                timestamp_ms: identity.timestamp_ms,
            };
            tokio::spawn(async move {
                behavioral.record_pattern(&pattern).await;
            });
        }

        let policy = self.limiter.policy_for(identity.role, &identity.endpoint);
        let outcome = self
            .limiter
            .check_limit(&identity_key, &policy, signal.penalty_multiplier)
            .await;

        if outcome.allowed {
            increment_counter!("admission_admitted_total");
            return AdmissionDecision::Admit {
                rate_headers: Some(RateHeaders {
                    limit: policy.max_requests,
                    remaining: outcome.remaining,
                    reset_ms: outcome.reset_ms,
                }),
            };
        }

        self.notify_limit_exceeded(request, &outcome);
        increment_counter!("admission_denied_total", "reason" => "rate_limit");

        let retry_after_secs = outcome
            .retry_after_ms
            .map(|ms| ((ms + 999) / 1000).max(1) as u64);
        let rate_headers = RateHeaders {
            limit: policy.max_requests,
            remaining: outcome.remaining,
            reset_ms: outcome.reset_ms,
        };

        if self.config.enable_behavioral_analysis {
            let suspicion = self
                .suspicion_for(&identity, &identity_key, geo_profile.as_ref())
                .await;
            if let Some(challenge) = self.captcha.evaluate(suspicion) {
                info!(
                    "denying {} {} from {}: rate limited, captcha offered (suspicion {:.2})",
                    request.method, request.path, identity.ip, suspicion
                );
                return AdmissionDecision::Deny(DenyResponse {
                    status: 429,
                    body: json!({
                        "error": "Rate limit exceeded",
                        "requiresCaptcha": true,
                        "captchaType": challenge.captcha_type,
                    }),
                    retry_after_secs,
                    rate_headers: Some(rate_headers),
                });
            }
        }

        info!(
            "denying {} {} from {}: rate limit exceeded",
            request.method, request.path, identity.ip
        );
        AdmissionDecision::Deny(DenyResponse {
            status: 429,
            body: json!({ "error": "Rate limit exceeded" }),
            retry_after_secs,
            rate_headers: Some(rate_headers),
        })
    }

    fn should_skip(&self, request: &AdmissionRequest) -> bool {
        self.config
            .skip_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(&request.method))
            || self.config.skip_paths.iter().any(|p| p == &request.path)
    }

    async fn suspicion_for(
        &self,
        identity: &RequestIdentity,
        identity_key: &str,
        geo_profile: Option<&GeoProfile>,
    ) -> f64 {
        let geo_threat = geo_profile.map(|p| p.threat_flagged()).unwrap_or(false);
        self.behavioral
            .suspicion_score(identity_key, identity.role, geo_threat)
            .await
    }

    fn notify_limit_exceeded(&self, request: &AdmissionRequest, outcome: &RateLimitOutcome) {
        if let Some(observer) = &self.on_limit_exceeded {
            let result = catch_unwind(AssertUnwindSafe(|| observer(request, outcome)));
            if result.is_err() {
                error!("on_limit_exceeded observer panicked; ignoring");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::core::behavioral::BehavioralAnalyzer;
    use crate::core::geoip::{GeoProfile, StaticGeoProvider, ThreatLevel};
    use crate::core::identity::IdentityConfig;
    use crate::core::memory_store::MemoryCounterStore;
    use crate::core::store::{CounterStore, FailingCounterStore};
    use crate::models::{
        BehaviorConfig, BypassConfig, CaptchaConfig, DdosConfig, GeoConfig, PipelineConfig,
        RateLimitConfig,
    };

    struct PipelineBuilder {
        store: Arc<MemoryCounterStore>,
        geo_config: GeoConfig,
        geo_provider: StaticGeoProvider,
        rate_config: RateLimitConfig,
        pipeline_config: PipelineConfig,
        captcha_config: CaptchaConfig,
    }

    impl PipelineBuilder {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryCounterStore::new()),
                geo_config: GeoConfig::default(),
                geo_provider: StaticGeoProvider::new(),
                rate_config: RateLimitConfig::default(),
                pipeline_config: PipelineConfig::default(),
                captcha_config: CaptchaConfig::default(),
            }
        }

        fn build(self) -> (AdmissionPipeline, Arc<MemoryCounterStore>) {
            let store: Arc<dyn CounterStore> = self.store.clone();
            let pipeline = AdmissionPipeline::new(
                IdentityResolver::new(IdentityConfig::default()),
                BypassProtectionAnalyzer::new(BypassConfig::default(), IdentityConfig::default()),
                GeoIpAnalyzer::new(Arc::new(self.geo_provider), self.geo_config),
                RateLimiter::new(store.clone(), self.rate_config),
                Arc::new(BehavioralAnalyzer::new(store.clone(), BehaviorConfig::default())),
                CaptchaGate::new(self.captcha_config),
                DdosDetector::new(store, DdosConfig::default()),
                self.pipeline_config,
            );
            (pipeline, self.store)
        }
    }

    fn anon_request(ip: &str) -> AdmissionRequest {
        AdmissionRequest::new("GET", "/api/v1/echo").with_header("x-real-ip", ip)
    }

    #[tokio::test]
    async fn test_options_requests_skip_every_check() {
        let (pipeline, store) = PipelineBuilder::new().build();
        let request = AdmissionRequest::new("OPTIONS", "/api/v1/echo")
            .with_header("x-real-ip", "203.0.113.1");

        let decision = pipeline.process(&request).await;
        match decision {
            AdmissionDecision::Admit { rate_headers } => assert!(rate_headers.is_none()),
            _ => panic!("OPTIONS must be admitted"),
        }
        // No global or per-identity counters were touched.
        assert_eq!(store.entry_count("ddos:requests"), 0);
        assert_eq!(store.entry_count("rl:ip:203.0.113.1"), 0);
    }

    #[tokio::test]
    async fn test_skip_paths_bypass_the_pipeline() {
        let mut builder = PipelineBuilder::new();
        builder.pipeline_config.skip_paths = vec!["/health".to_string()];
        let (pipeline, _) = builder.build();

        let decision = pipeline.process(&AdmissionRequest::new("GET", "/health")).await;
        match decision {
            AdmissionDecision::Admit { rate_headers } => assert!(rate_headers.is_none()),
            _ => panic!("skip path must be admitted"),
        }
    }

    #[tokio::test]
    async fn test_admitted_request_carries_rate_headers() {
        let (pipeline, _) = PipelineBuilder::new().build();
        let decision = pipeline.process(&anon_request("203.0.113.2")).await;

        match decision {
            AdmissionDecision::Admit { rate_headers } => {
                let headers = rate_headers.expect("rate headers expected");
                assert!(headers.limit > 0);
                assert_eq!(headers.remaining, headers.limit - 1);
            }
            _ => panic!("request must be admitted"),
        }
    }

    #[tokio::test]
    async fn test_geo_block_short_circuits_without_consuming_quota() {
        let mut builder = PipelineBuilder::new();
        builder.geo_config.deny_list = vec!["203.0.113.66".to_string()];
        let (pipeline, store) = builder.build();

        let decision = pipeline.process(&anon_request("203.0.113.66")).await;
        match decision {
            AdmissionDecision::Deny(deny) => {
                assert_eq!(deny.status, 403);
                assert_eq!(deny.body["error"], "Geographic restriction");
                assert!(deny.body["reason"].as_str().unwrap().contains("203.0.113.66"));
            }
            _ => panic!("denied request expected"),
        }
        assert_eq!(store.entry_count("rl:ip:203.0.113.66"), 0);
    }

    #[tokio::test]
    async fn test_rate_denial_returns_429_with_retry_after() {
        let mut builder = PipelineBuilder::new();
        builder.rate_config.role_quotas.anonymous = 3;
        let (pipeline, _) = builder.build();
        let request = anon_request("203.0.113.3");

        for _ in 0..3 {
            assert!(pipeline.process(&request).await.is_admitted());
        }
        match pipeline.process(&request).await {
            AdmissionDecision::Deny(deny) => {
                assert_eq!(deny.status, 429);
                assert_eq!(deny.body["error"], "Rate limit exceeded");
                assert!(deny.retry_after_secs.unwrap() >= 1);
                assert_eq!(deny.rate_headers.unwrap().remaining, 0);
            }
            _ => panic!("fourth request must be denied"),
        }
    }

    #[tokio::test]
    async fn test_store_outage_fails_open_to_admit() {
        let failing: Arc<dyn CounterStore> = Arc::new(FailingCounterStore);
        let pipeline = AdmissionPipeline::new(
            IdentityResolver::new(IdentityConfig::default()),
            BypassProtectionAnalyzer::new(BypassConfig::default(), IdentityConfig::default()),
            GeoIpAnalyzer::new(Arc::new(StaticGeoProvider::new()), GeoConfig::default()),
            RateLimiter::new(failing.clone(), RateLimitConfig::default()),
            Arc::new(BehavioralAnalyzer::new(failing.clone(), BehaviorConfig::default())),
            CaptchaGate::new(CaptchaConfig::default()),
            DdosDetector::new(failing, DdosConfig::default()),
            PipelineConfig::default(),
        );

        let decision = pipeline.process(&anon_request("203.0.113.4")).await;
        assert!(decision.is_admitted());
    }

    #[tokio::test]
    async fn test_header_forgery_is_denied_before_quota() {
        let (pipeline, store) = PipelineBuilder::new().build();
        let request = AdmissionRequest::new("GET", "/api/v1/echo")
            .with_header("cf-connecting-ip", "192.0.2.1")
            .with_header("x-forwarded-for", "203.0.113.1")
            .with_header("x-real-ip", "198.51.100.1");

        match pipeline.process(&request).await {
            AdmissionDecision::Deny(deny) => {
                assert_eq!(deny.status, 403);
                assert_eq!(deny.body["error"], "Request blocked");
            }
            _ => panic!("forged request must be denied"),
        }
        assert_eq!(store.entry_count("rl:ip:192.0.2.1"), 0);
    }

    #[tokio::test]
    async fn test_bypass_penalty_consumes_quota_faster() {
        let mut builder = PipelineBuilder::new();
        builder.rate_config.role_quotas.anonymous = 10;
        let (pipeline, _) = builder.build();
        // Marker header carries the default 2.0 penalty.
        let request = anon_request("203.0.113.5").with_header("x-rate-limit-bypass", "1");

        for i in 0..5 {
            assert!(
                pipeline.process(&request).await.is_admitted(),
                "flagged request {} still within quota",
                i + 1
            );
        }
        assert!(!pipeline.process(&request).await.is_admitted());
    }

    #[tokio::test]
    async fn test_captcha_offered_to_suspicious_identity() {
        let mut builder = PipelineBuilder::new();
        builder.rate_config.role_quotas.anonymous = 5;
        builder.captcha_config.suspicion_threshold = 0.05;
        builder.geo_provider = StaticGeoProvider::new().with_profile(GeoProfile {
            ip: "203.0.113.6".to_string(),
            country: "ZZ".to_string(),
            asn: 0,
            is_proxy: false,
            is_vpn: false,
            is_tor: true,
            is_hosting: false,
            threat_level: ThreatLevel::High,
            reputation: 90,
        });
        let (pipeline, store) = builder.build();
        let request = anon_request("203.0.113.6");

        for _ in 0..5 {
            assert!(pipeline.process(&request).await.is_admitted());
        }
        // Recording is spawned; make the history visible before the
        // denial that consults it.
        tokio::task::yield_now().await;
        for _ in 0..50 {
            store
                .increment("behavior:ip:203.0.113.6", crate::utils::now_millis(), 1)
                .await
                .unwrap();
            store
                .add_to_set("behavior:endpoints:ip:203.0.113.6", "/api/v1/echo")
                .await
                .unwrap();
        }

        match pipeline.process(&request).await {
            AdmissionDecision::Deny(deny) => {
                assert_eq!(deny.status, 429);
                assert_eq!(deny.body["requiresCaptcha"], true);
                assert_eq!(deny.body["captchaType"], "recaptcha_v2");
            }
            _ => panic!("suspicious rate-limited request must get a captcha offer"),
        }
    }

    #[tokio::test]
    async fn test_custom_identifier_overrides_identity_key() {
        let mut builder = PipelineBuilder::new();
        builder.rate_config.role_quotas.anonymous = 2;
        let (pipeline, _) = builder.build();
        let pipeline =
            pipeline.with_custom_identifier(Arc::new(|_req: &AdmissionRequest| "tenant:acme".to_string()));

        // Different source IPs now share one identity key.
        assert!(pipeline.process(&anon_request("203.0.113.7")).await.is_admitted());
        assert!(pipeline.process(&anon_request("203.0.113.8")).await.is_admitted());
        assert!(!pipeline.process(&anon_request("203.0.113.9")).await.is_admitted());
    }

    #[tokio::test]
    async fn test_panicking_identifier_strategy_fails_open() {
        let (pipeline, store) = PipelineBuilder::new().build();
        let pipeline = pipeline.with_custom_identifier(Arc::new(
            |_req: &AdmissionRequest| -> String { panic!("identifier strategy failure") },
        ));

        // The panic degrades to "no protection", never to a failed request.
        let decision = pipeline.process(&anon_request("203.0.113.11")).await;
        match decision {
            AdmissionDecision::Admit { rate_headers } => assert!(rate_headers.is_none()),
            _ => panic!("panicking check must admit"),
        }
        assert_eq!(store.entry_count("rl:ip:203.0.113.11"), 0);
    }

    #[tokio::test]
    async fn test_limit_observer_fires_on_denial_and_panics_are_swallowed() {
        let mut builder = PipelineBuilder::new();
        builder.rate_config.role_quotas.anonymous = 1;
        let (pipeline, _) = builder.build();

        let calls = Arc::new(AtomicUsize::new(0));
        let observed = calls.clone();
        let pipeline = pipeline.with_limit_observer(Arc::new(
            move |_req: &AdmissionRequest, outcome: &RateLimitOutcome| {
                observed.fetch_add(1, Ordering::SeqCst);
                assert!(!outcome.allowed);
                panic!("observer misbehaving on purpose");
            },
        ));
        let request = anon_request("203.0.113.10");

        assert!(pipeline.process(&request).await.is_admitted());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Denial fires the observer; its panic must not change the outcome.
        let decision = pipeline.process(&request).await;
        assert!(!decision.is_admitted());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
