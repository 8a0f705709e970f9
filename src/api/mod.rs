//! HTTP surface for the admission control service.
//!
//! Lowers the framework request into the pipeline's request model, runs
//! the admission check, and maps the decision back onto an HTTP
//! response. Admitted requests reach the business handler and get their
//! response decorated with rate-limit headers; denied requests get the
//! pipeline's structured error body and never touch business logic.

use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use serde::Serialize;
use std::sync::Arc;

use crate::core::identity::Role;
use crate::core::pipeline::{AdmissionDecision, AdmissionPipeline, DenyResponse, RateHeaders};
use crate::core::request::{AdmissionRequest, AuthContext};

pub struct ApiState {
    pub pipeline: Arc<AdmissionPipeline>,
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/health").route(web::get().to(health_check)))
            // All methods routed through the handler so skip-method
            // requests (e.g. OPTIONS) still reach the pipeline's bypass.
            .service(web::resource("/echo").route(web::route().to(echo))),
    );
}

/// Health check endpoint response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct EchoResponse {
    status: String,
    path: String,
}

/// Health check endpoint
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Demo business handler guarded by the admission pipeline.
async fn echo(state: web::Data<ApiState>, req: HttpRequest) -> impl Responder {
    let admission = lower_request(&req);
    match state.pipeline.process(&admission).await {
        AdmissionDecision::Admit { rate_headers } => {
            let mut builder = HttpResponse::Ok();
            apply_rate_headers(&mut builder, rate_headers.as_ref());
            builder.json(EchoResponse {
                status: "ok".to_string(),
                path: admission.path,
            })
        }
        AdmissionDecision::Deny(deny) => deny_response(deny),
    }
}

/// Lower the framework request into the pipeline's model. The upstream
/// auth gateway attaches the already-verified identity as trusted
/// headers; no tokens are parsed here.
fn lower_request(req: &HttpRequest) -> AdmissionRequest {
    let mut admission = AdmissionRequest::new(req.method().as_str(), req.path());
    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            admission
                .headers
                .insert(name.as_str().to_lowercase(), v.to_string());
        }
    }
    if let Some(user_id) = admission.header("x-auth-user-id").map(str::to_string) {
        let role = admission
            .header("x-auth-role")
            .map(Role::parse)
            .unwrap_or(Role::Anonymous);
        admission.auth = Some(AuthContext { user_id, role });
    }
    admission
}

fn apply_rate_headers(builder: &mut actix_web::HttpResponseBuilder, headers: Option<&RateHeaders>) {
    if let Some(h) = headers {
        builder.insert_header(("X-RateLimit-Limit", h.limit.to_string()));
        builder.insert_header(("X-RateLimit-Remaining", h.remaining.to_string()));
        builder.insert_header(("X-RateLimit-Reset", h.reset_ms.to_string()));
    }
}

fn deny_response(deny: DenyResponse) -> HttpResponse {
    let status = StatusCode::from_u16(deny.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = HttpResponse::build(status);
    apply_rate_headers(&mut builder, deny.rate_headers.as_ref());
    if let Some(secs) = deny.retry_after_secs {
        builder.insert_header(("Retry-After", secs.to_string()));
        builder.insert_header(("X-RateLimit-RetryAfter", secs.to_string()));
    }
    builder.json(deny.body)
}
