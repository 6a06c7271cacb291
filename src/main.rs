//! Network Defense Service
//!
//! This is the main entry point for the network defense service. It wires
//! the traffic store, detector, firewall controller, and monitoring
//! coordinator together and starts the web server.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use log::info;
use metrics_exporter_prometheus::PrometheusBuilder;

use network_defense_service::api::ApiState;
use network_defense_service::config::load_config;
use network_defense_service::core::detector::AttackPatternDetector;
use network_defense_service::core::engine::DefenseEngine;
use network_defense_service::core::firewall::{select_backend, FirewallController};
use network_defense_service::core::geo::{GeoResolver, OctetHeuristicResolver};
use network_defense_service::core::monitoring::{AlertHistory, MonitoringCoordinator};
use network_defense_service::core::registry::AttackSourceRegistry;
use network_defense_service::core::traffic::TrafficCounterStore;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::init();

    info!("Starting Network Defense Service...");

    // Load configuration
    let config = load_config().context("Failed to load configuration")?;

    // Install the Prometheus metrics recorder
    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")?;

    // Build the core components
    let store = Arc::new(TrafficCounterStore::new(
        &config.store,
        &config.detection.auth_ports,
    ));
    let geo: Arc<dyn GeoResolver> = Arc::new(OctetHeuristicResolver);
    let detector = AttackPatternDetector::new(
        store.clone(),
        geo.clone(),
        &config.detection,
        config.geo.clone(),
        config.temporal.clone(),
    );
    let registry = Arc::new(AttackSourceRegistry::new());
    let firewall = Arc::new(FirewallController::new(
        select_backend(&config.firewall),
        &config.firewall,
    ));
    let alerts = Arc::new(AlertHistory::new(config.monitoring.alert_history_size));

    let coordinator = Arc::new(MonitoringCoordinator::new(
        store.clone(),
        firewall.clone(),
        alerts.clone(),
        config.monitoring.clone(),
        Duration::from_secs(config.store.eviction_interval_seconds),
        Duration::from_secs(config.firewall.sweep_interval_seconds),
    ));
    coordinator.start();

    let host = config.server.host.clone();
    let port = config.server.port;

    let engine = Arc::new(DefenseEngine::new(
        config, store, detector, registry, firewall, alerts, geo,
    ));
    let state = web::Data::new(ApiState {
        engine,
        prometheus: Some(prometheus),
    });

    // Start HTTP server
    info!("Listening on {}:{}", host, port);
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(network_defense_service::api::config)
    })
    .bind((host.as_str(), port))?
    .run()
    .await?;

    // Server exited; finish in-flight sweeps before returning.
    coordinator.stop().await;
    Ok(())
}
