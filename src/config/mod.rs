//! Configuration management for the network defense service.
//!
//! This module handles loading application configuration from a TOML file
//! and environment variables, with defaults matching the shipped detection
//! thresholds.

use crate::models::Config;
use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use std::env;

/// Load configuration from the config file and environment variables
pub fn load_config() -> Result<Config, ConfigError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());

    let config = ConfigBuilder::builder()
        .add_source(File::with_name(&config_file).required(false))
        .add_source(Environment::default().separator("__"))
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .set_default("store.traffic_retention_seconds", 300)?
        .set_default("store.connection_retention_seconds", 3600)?
        .set_default("store.eviction_interval_seconds", 10)?
        .set_default("detection.syn_flood_threshold", 1000)?
        .set_default("detection.udp_flood_threshold", 2000)?
        .set_default("detection.icmp_flood_threshold", 500)?
        .set_default("detection.http_flood_threshold", 100)?
        .set_default("detection.flood_window_seconds", 60)?
        .set_default("detection.dns_amplification_threshold", 100)?
        .set_default("detection.ntp_amplification_threshold", 50)?
        .set_default("detection.memcached_amplification_threshold", 25)?
        .set_default("detection.amplification_window_seconds", 60)?
        .set_default("detection.port_scan_threshold", 10)?
        .set_default("detection.port_scan_window_seconds", 60)?
        .set_default("detection.brute_force_threshold", 5)?
        .set_default("detection.brute_force_window_seconds", 300)?
        .set_default(
            "detection.auth_ports",
            vec![22, 23, 21, 25, 110, 143, 993, 995, 3389, 5432, 3306],
        )?
        .set_default(
            "detection.suspicious_ports",
            vec![1337, 4444, 5554, 6667, 12345, 31337],
        )?
        .set_default("detection.unusual_protocols", vec!["gre", "esp", "sctp"])?
        .set_default("detection.volume_window_seconds", 60)?
        .set_default("geo.enabled", true)?
        .set_default("geo.high_risk_countries", Vec::<String>::new())?
        .set_default("geo.concentration_ratio", 0.7)?
        .set_default("geo.min_sample_packets", 200)?
        .set_default("temporal.enabled", true)?
        .set_default("temporal.off_hours_start", 22)?
        .set_default("temporal.off_hours_end", 6)?
        .set_default("temporal.flag_weekends", true)?
        .set_default("temporal.utc_offset_hours", 0)?
        .set_default("mitigation.block_severity_threshold", 80)?
        .set_default("mitigation.repeat_offender_block_threshold", 65)?
        .set_default("mitigation.alert_severity_threshold", 85)?
        .set_default("mitigation.default_rate_limit_pps", 100)?
        .set_default(
            "mitigation.enabled_strategies",
            vec![
                "ip_blocking",
                "rate_limiting",
                "connection_limiting",
                "protocol_filtering",
                "traffic_shaping",
            ],
        )?
        .set_default("firewall.backend", "auto")?
        .set_default("firewall.command_timeout_seconds", 5)?
        .set_default("firewall.sweep_interval_seconds", 30)?
        .set_default("firewall.rule_prefix", "netdefense")?
        .set_default("monitoring.correlation_interval_seconds", 15)?
        .set_default("monitoring.correlation_window_seconds", 60)?
        .set_default("monitoring.coordinated_source_threshold", 10)?
        .set_default("monitoring.amplification_source_threshold", 5)?
        .set_default("monitoring.alert_history_size", 5000)?
        .build()?;

    config.try_deserialize()
}
