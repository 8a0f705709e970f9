//! Admission Control Service
//!
//! Main entry point: loads and validates configuration, wires the
//! admission pipeline onto a Redis-backed counter store and starts the
//! web server.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use dotenv::dotenv;
use log::info;
use metrics_exporter_prometheus::PrometheusBuilder;
use redis::Client;

use admission_control_service::api::{self, ApiState};
use admission_control_service::config::load_config;
use admission_control_service::core::{
    AdmissionPipeline, BehavioralAnalyzer, BypassProtectionAnalyzer, CaptchaGate, CounterStore,
    DdosDetector, GeoIpAnalyzer, IdentityResolver, RateLimiter, RedisCounterStore,
    StaticGeoProvider,
};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::init();

    info!("Starting Admission Control Service...");

    // Load and validate configuration; contradictory settings are fatal
    // here, never per-request.
    let config = load_config().expect("Failed to load configuration");
    config.validate().expect("Invalid configuration");

    // Expose admission counters to Prometheus
    PrometheusBuilder::new()
        .install()
        .expect("Failed to install metrics recorder");

    // Initialize the shared counter store
    let redis_client = Client::open(config.redis.url.as_str()).expect("Failed to create Redis client");
    let store: Arc<dyn CounterStore> = Arc::new(RedisCounterStore::new(
        redis_client,
        Duration::from_millis(config.redis.op_timeout_ms),
    ));

    // Wire the admission pipeline
    let pipeline = AdmissionPipeline::new(
        IdentityResolver::new(config.identity.clone()),
        BypassProtectionAnalyzer::new(config.bypass.clone(), config.identity.clone()),
        GeoIpAnalyzer::new(Arc::new(StaticGeoProvider::new()), config.geo.clone()),
        RateLimiter::new(store.clone(), config.rate_limit.clone()),
        Arc::new(BehavioralAnalyzer::new(store.clone(), config.behavior.clone())),
        CaptchaGate::new(config.captcha.clone()),
        DdosDetector::new(store, config.ddos.clone()),
        config.pipeline.clone(),
    );

    let state = web::Data::new(ApiState {
        pipeline: Arc::new(pipeline),
    });

    let bind_host = config.server.host.clone();
    let bind_port = config.server.port;

    // Start HTTP server
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(api::config)
    })
    .bind((bind_host.as_str(), bind_port))?
    .run()
    .await
}
