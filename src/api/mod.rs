//! API endpoints for the network defense service.
//!
//! This module provides the HTTP surface over the defense engine: traffic
//! ingestion, statistics and summary queries, alert and rule listings, and
//! the administrative operations (blocking, attack/trusted source
//! management, thresholds, strategies, emergency lockdown).

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, HttpResponse, Responder};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};

use crate::core::detector::AttackType;
use crate::core::engine::DefenseEngine;
use crate::core::firewall::FirewallError;
use crate::core::mitigation::MitigationStrategy;
use crate::models::TrafficObservation;

pub struct ApiState {
    pub engine: Arc<DefenseEngine>,
    pub prometheus: Option<PrometheusHandle>,
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/health").route(web::get().to(health_check)))
            .service(web::resource("/metrics").route(web::get().to(metrics)))
            .service(web::resource("/analyze").route(web::post().to(analyze)))
            .service(web::resource("/traffic").route(web::post().to(analyze_network)))
            .service(web::resource("/statistics").route(web::get().to(statistics)))
            .service(web::resource("/summary/traffic").route(web::get().to(traffic_summary)))
            .service(
                web::resource("/summary/connections").route(web::get().to(connection_summary)),
            )
            .service(web::resource("/alerts").route(web::get().to(alerts)))
            .service(web::resource("/rules").route(web::get().to(rules)))
            .service(web::resource("/admin/block").route(web::post().to(block)))
            .service(web::resource("/admin/unblock").route(web::post().to(unblock)))
            .service(
                web::resource("/admin/attack-sources")
                    .route(web::get().to(list_attack_sources))
                    .route(web::post().to(add_attack_source))
                    .route(web::delete().to(remove_attack_source)),
            )
            .service(
                web::resource("/admin/trusted-sources")
                    .route(web::post().to(add_trusted_source))
                    .route(web::delete().to(remove_trusted_source)),
            )
            .service(web::resource("/admin/thresholds").route(web::put().to(set_threshold)))
            .service(
                web::resource("/admin/strategies/{name}/enable")
                    .route(web::post().to(enable_strategy)),
            )
            .service(
                web::resource("/admin/strategies/{name}/disable")
                    .route(web::post().to(disable_strategy)),
            )
            .service(web::resource("/admin/emergency-block").route(web::post().to(emergency_block)))
            .service(web::resource("/admin/restore").route(web::post().to(restore))),
    );
}

/// Health check endpoint response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    /// Window in seconds; defaults to 60.
    pub window: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockRequest {
    /// IP or CIDR to block.
    pub target: String,
    pub duration_seconds: u64,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddressRequest {
    pub ip: IpAddr,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ThresholdRequest {
    pub attack_type: AttackType,
    pub value: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EmergencyRequest {
    pub duration_seconds: u64,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_json(message: impl ToString) -> ErrorResponse {
    ErrorResponse {
        error: message.to_string(),
    }
}

/// Map firewall errors to HTTP responses: validation faults are the
/// caller's, backend faults are the collaborator's.
fn firewall_error_response(e: FirewallError) -> HttpResponse {
    match e {
        FirewallError::InvalidAddress(_) => HttpResponse::BadRequest().json(error_json(e)),
        FirewallError::Backend(_) | FirewallError::UnsupportedPlatform => {
            HttpResponse::BadGateway().json(error_json(e))
        }
    }
}

/// Health check endpoint
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Prometheus exposition endpoint
async fn metrics(state: web::Data<ApiState>) -> impl Responder {
    match &state.prometheus {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::NotFound().json(error_json("metrics recorder not installed")),
    }
}

/// Full ingestion path with mitigation side effects.
async fn analyze(state: web::Data<ApiState>, obs: web::Json<TrafficObservation>) -> impl Responder {
    HttpResponse::Ok().json(state.engine.analyze_traffic(&obs).await)
}

/// Passive analysis, no attack context.
async fn analyze_network(
    state: web::Data<ApiState>,
    obs: web::Json<TrafficObservation>,
) -> impl Responder {
    HttpResponse::Ok().json(state.engine.analyze_network_traffic(&obs))
}

async fn statistics(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(state.engine.statistics().await)
}

async fn traffic_summary(
    state: web::Data<ApiState>,
    query: web::Query<SummaryQuery>,
) -> impl Responder {
    HttpResponse::Ok().json(state.engine.traffic_summary(query.window.unwrap_or(60)))
}

async fn connection_summary(
    state: web::Data<ApiState>,
    query: web::Query<SummaryQuery>,
) -> impl Responder {
    HttpResponse::Ok().json(state.engine.connection_summary(query.window.unwrap_or(60)))
}

async fn alerts(state: web::Data<ApiState>, query: web::Query<AlertsQuery>) -> impl Responder {
    HttpResponse::Ok().json(state.engine.recent_alerts(query.limit.unwrap_or(100)))
}

async fn rules(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(state.engine.active_rules().await)
}

async fn block(state: web::Data<ApiState>, req: web::Json<BlockRequest>) -> impl Responder {
    let reason = req.reason.as_deref().unwrap_or("operator block");
    match state
        .engine
        .block_ip(&req.target, reason, Duration::from_secs(req.duration_seconds))
        .await
    {
        Ok(rule_id) => HttpResponse::Ok().json(serde_json::json!({ "rule_id": rule_id })),
        Err(e) => firewall_error_response(e),
    }
}

async fn unblock(state: web::Data<ApiState>, req: web::Json<AddressRequest>) -> impl Responder {
    match state.engine.unblock_ip(&req.ip).await {
        Ok(removed) => HttpResponse::Ok().json(serde_json::json!({ "removed": removed })),
        Err(e) => firewall_error_response(e),
    }
}

async fn list_attack_sources(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(state.engine.attack_sources())
}

async fn add_attack_source(
    state: web::Data<ApiState>,
    req: web::Json<AddressRequest>,
) -> impl Responder {
    state.engine.add_attack_source(req.ip);
    HttpResponse::Ok().json(serde_json::json!({ "flagged": req.ip }))
}

async fn remove_attack_source(
    state: web::Data<ApiState>,
    req: web::Json<AddressRequest>,
) -> impl Responder {
    if state.engine.remove_attack_source(&req.ip) {
        HttpResponse::Ok().json(serde_json::json!({ "removed": req.ip }))
    } else {
        HttpResponse::NotFound().json(error_json(format!("{} is not flagged", req.ip)))
    }
}

async fn add_trusted_source(
    state: web::Data<ApiState>,
    req: web::Json<AddressRequest>,
) -> impl Responder {
    state.engine.add_trusted_source(req.ip);
    HttpResponse::Ok().json(serde_json::json!({ "trusted": req.ip }))
}

async fn remove_trusted_source(
    state: web::Data<ApiState>,
    req: web::Json<AddressRequest>,
) -> impl Responder {
    if state.engine.remove_trusted_source(&req.ip) {
        HttpResponse::Ok().json(serde_json::json!({ "removed": req.ip }))
    } else {
        HttpResponse::NotFound().json(error_json(format!("{} is not trusted", req.ip)))
    }
}

async fn set_threshold(
    state: web::Data<ApiState>,
    req: web::Json<ThresholdRequest>,
) -> impl Responder {
    match state.engine.configure_threshold(req.attack_type, req.value) {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({
            "attack_type": req.attack_type,
            "value": req.value,
        })),
        Err(e) => HttpResponse::BadRequest().json(error_json(e)),
    }
}

async fn enable_strategy(state: web::Data<ApiState>, path: web::Path<String>) -> impl Responder {
    toggle_strategy(state, &path, true)
}

async fn disable_strategy(state: web::Data<ApiState>, path: web::Path<String>) -> impl Responder {
    toggle_strategy(state, &path, false)
}

fn toggle_strategy(state: web::Data<ApiState>, name: &str, enabled: bool) -> HttpResponse {
    match name.parse::<MitigationStrategy>() {
        Ok(strategy) => {
            state.engine.set_strategy_enabled(strategy, enabled);
            HttpResponse::Ok().json(serde_json::json!({
                "strategy": strategy,
                "enabled": enabled,
            }))
        }
        Err(e) => HttpResponse::BadRequest().json(error_json(e)),
    }
}

async fn emergency_block(
    state: web::Data<ApiState>,
    req: web::Json<EmergencyRequest>,
) -> impl Responder {
    match state
        .engine
        .emergency_block_all(Duration::from_secs(req.duration_seconds))
        .await
    {
        Ok(rule_id) => HttpResponse::Ok().json(serde_json::json!({ "rule_id": rule_id })),
        Err(e) => firewall_error_response(e),
    }
}

async fn restore(state: web::Data<ApiState>) -> impl Responder {
    match state.engine.restore_connectivity().await {
        Ok(removed) => HttpResponse::Ok().json(serde_json::json!({ "removed": removed })),
        Err(e) => firewall_error_response(e),
    }
}
