//! Defense engine for the network defense service.
//!
//! The composition root: wires an observation through the traffic store, the
//! pattern detector, severity scoring, mitigation selection, and the
//! firewall controller, and owns the aggregate statistics. The ingestion
//! path is infallible by design: a failed mitigation is logged and counted,
//! never propagated, so one bad observation or backend hiccup cannot stall
//! the pipeline.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use dashmap::DashMap;
use log::{info, warn};
use metrics::counter;
use serde::Serialize;
use uuid::Uuid;

use crate::core::detector::{AttackPatternDetector, AttackType, DetectionError};
use crate::core::firewall::{FirewallController, FirewallError, FirewallRule};
use crate::core::geo::GeoResolver;
use crate::core::mitigation::{
    self, MitigationAction, MitigationStrategy,
};
use crate::core::monitoring::{AlertHistory, AlertRecord};
use crate::core::registry::{AttackSourceEntry, AttackSourceRegistry};
use crate::core::traffic::TrafficCounterStore;
use crate::models::{AnalysisResult, Config, ThreatLevel, TrafficObservation};

/// Aggregate statistics exposed through the query API.
#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
    pub observations: u64,
    pub attacks_detected: u64,
    pub attacks_by_type: HashMap<AttackType, u64>,
    pub attacks_mitigated: u64,
    pub mitigations_by_type: HashMap<AttackType, u64>,
    pub mitigation_failures: u64,
    /// Fraction of block attempts that succeeded; 1.0 when none attempted.
    pub mitigation_rate: f64,
    pub ips_blocked: u64,
    pub active_rules: usize,
    pub tracked_sources: usize,
    pub attack_sources: usize,
    pub trusted_sources: usize,
    pub alerts_recorded: usize,
}

/// Traffic distribution over a caller-supplied window.
#[derive(Debug, Clone, Serialize)]
pub struct TrafficSummary {
    pub window_seconds: u64,
    pub total_packets: u64,
    pub total_bytes: u64,
    pub unique_sources: usize,
    pub protocols: HashMap<String, u64>,
    pub top_ports: Vec<(u16, u64)>,
    /// Packets per resolved country; unattributable sources are omitted.
    pub countries: HashMap<String, u64>,
}

/// Connection-attempt distribution over a caller-supplied window.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub window_seconds: u64,
    pub connection_attempts: u64,
    pub auth_port_attempts: u64,
    pub attempting_sources: usize,
}

#[derive(Debug, Default)]
struct EngineCounters {
    observations: AtomicU64,
    attacks_detected: AtomicU64,
    attacks_mitigated: AtomicU64,
    mitigation_failures: AtomicU64,
    ips_blocked: AtomicU64,
}

/// The defense engine. Shared behind an `Arc` by the HTTP adapter and the
/// monitoring coordinator.
pub struct DefenseEngine {
    config: Config,
    store: Arc<TrafficCounterStore>,
    detector: AttackPatternDetector,
    registry: Arc<AttackSourceRegistry>,
    firewall: Arc<FirewallController>,
    alerts: Arc<AlertHistory>,
    geo: Arc<dyn GeoResolver>,
    strategies: RwLock<HashSet<MitigationStrategy>>,
    by_type: DashMap<AttackType, u64>,
    mitigated_by_type: DashMap<AttackType, u64>,
    counters: EngineCounters,
}

impl DefenseEngine {
    pub fn new(
        config: Config,
        store: Arc<TrafficCounterStore>,
        detector: AttackPatternDetector,
        registry: Arc<AttackSourceRegistry>,
        firewall: Arc<FirewallController>,
        alerts: Arc<AlertHistory>,
        geo: Arc<dyn GeoResolver>,
    ) -> Self {
        let strategies: HashSet<MitigationStrategy> = config
            .mitigation
            .enabled_strategies
            .iter()
            .filter_map(|name| match name.parse() {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!("Ignoring configured strategy: {}", e);
                    None
                }
            })
            .collect();

        Self {
            config,
            store,
            detector,
            registry,
            firewall,
            alerts,
            geo,
            strategies: RwLock::new(strategies),
            by_type: DashMap::new(),
            mitigated_by_type: DashMap::new(),
            counters: EngineCounters::default(),
        }
    }

    /// Full ingestion path: record, detect, score, select, and mitigate.
    ///
    /// Never returns an error; mitigation failures are absorbed into the
    /// statistics so the capture layer can keep feeding observations.
    pub async fn analyze_traffic(&self, obs: &TrafficObservation) -> AnalysisResult {
        let mut result = self.observe_and_score(obs, true);
        if result.threat_level == ThreatLevel::None {
            return result;
        }

        let source = obs.source_ip;
        self.registry.flag(source);
        self.alerts.push(AlertRecord::detection(
            source,
            result.attack_types.clone(),
            result.severity,
        ));
        counter!("defense_attacks_detected", 1,
            "attack_type" => result.attack_types[0].as_str());

        if result
            .recommended_actions
            .contains(&MitigationAction::BlockSourceIp)
        {
            let duration = mitigation::block_duration(result.severity);
            result.rule_id = self.block_source(source, &result, duration).await;
            result.mitigated = result.rule_id.is_some();
        }
        result
    }

    /// Passive analysis: detection and scoring with no attack-context side
    /// effects. The observation still feeds the counters, but the source is
    /// not flagged and no firewall action is taken.
    pub fn analyze_network_traffic(&self, obs: &TrafficObservation) -> AnalysisResult {
        self.observe_and_score(obs, false)
    }

    fn observe_and_score(&self, obs: &TrafficObservation, count_detection: bool) -> AnalysisResult {
        self.counters.observations.fetch_add(1, Ordering::Relaxed);
        counter!("defense_observations", 1);
        self.store.record(obs);

        // Trusted sources are counted but never scored or mitigated.
        if self.registry.is_trusted(&obs.source_ip) {
            return AnalysisResult::clean();
        }

        let now = obs.timestamp;
        let Some(detection) = self.detector.evaluate(obs, now) else {
            return AnalysisResult::clean();
        };

        let known_attacker = self.registry.contains(&obs.source_ip);
        let recent_packets = self.store.packets_in_window(
            &obs.source_ip,
            self.config.detection.volume_window_seconds,
            now,
        );
        let severity = mitigation::score_severity(&detection, known_attacker, recent_packets);
        let strategies = self
            .strategies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let plan = mitigation::select_actions(
            &detection,
            severity,
            known_attacker,
            &strategies,
            &self.config.mitigation,
        );

        if count_detection {
            self.counters.attacks_detected.fetch_add(1, Ordering::Relaxed);
            for attack in &detection.attack_types {
                *self.by_type.entry(*attack).or_insert(0) += 1;
            }
        }

        // Highest base severity first, so the leading type is the headline.
        let mut attack_types = detection.attack_types;
        attack_types.sort_by_key(|t| std::cmp::Reverse(mitigation::base_severity(*t)));

        AnalysisResult {
            threat_level: ThreatLevel::from_severity(severity),
            attack_types,
            severity,
            recommended_actions: plan.actions,
            mitigated: false,
            rule_id: None,
        }
    }

    /// Best-effort block installation. When an active rule already covers
    /// the source, the existing rule is extended rather than duplicated: a
    /// repeat offender scores higher than its first verdict, so a later
    /// block duration can outlast the rule installed at detection time.
    /// Failures increment `mitigation_failures`.
    async fn block_source(
        &self,
        source: IpAddr,
        result: &AnalysisResult,
        duration: Duration,
    ) -> Option<Uuid> {
        if self.firewall.has_active_rule_for(&source).await {
            return self.firewall.extend_block(&source, duration).await;
        }
        let reason = format!(
            "{} (severity {})",
            result.attack_types[0].as_str(),
            result.severity
        );
        match self
            .firewall
            .create_block_rule(&source.to_string(), &reason, duration)
            .await
        {
            Ok(rule_id) => {
                self.counters.attacks_mitigated.fetch_add(1, Ordering::Relaxed);
                self.counters.ips_blocked.fetch_add(1, Ordering::Relaxed);
                *self.mitigated_by_type.entry(result.attack_types[0]).or_insert(0) += 1;
                counter!("defense_mitigations", 1);
                Some(rule_id)
            }
            Err(e) => {
                self.counters
                    .mitigation_failures
                    .fetch_add(1, Ordering::Relaxed);
                counter!("defense_mitigation_failures", 1);
                warn!("Best-effort block of {} failed: {}", source, e);
                None
            }
        }
    }

    /// Aggregate counters for the statistics API.
    pub async fn statistics(&self) -> Statistics {
        let mitigated = self.counters.attacks_mitigated.load(Ordering::Relaxed);
        let failures = self.counters.mitigation_failures.load(Ordering::Relaxed);
        let attempts = mitigated + failures;
        Statistics {
            observations: self.counters.observations.load(Ordering::Relaxed),
            attacks_detected: self.counters.attacks_detected.load(Ordering::Relaxed),
            attacks_by_type: self.by_type.iter().map(|e| (*e.key(), *e.value())).collect(),
            attacks_mitigated: mitigated,
            mitigations_by_type: self
                .mitigated_by_type
                .iter()
                .map(|e| (*e.key(), *e.value()))
                .collect(),
            mitigation_failures: failures,
            mitigation_rate: if attempts == 0 {
                1.0
            } else {
                mitigated as f64 / attempts as f64
            },
            ips_blocked: self.counters.ips_blocked.load(Ordering::Relaxed),
            active_rules: self.firewall.active_rules().await.len(),
            tracked_sources: self.store.tracked_sources(),
            attack_sources: self.registry.len(),
            trusted_sources: self.registry.trusted_sources().len(),
            alerts_recorded: self.alerts.len(),
        }
    }

    /// Protocol, port, and geography distributions over the window.
    pub fn traffic_summary(&self, window: u64) -> TrafficSummary {
        let now = crate::utils::get_current_timestamp();
        let (total_packets, total_bytes) = self.store.traffic_totals(window, now);

        let mut countries: HashMap<String, u64> = HashMap::new();
        for (ip, packets) in self.store.source_packet_counts(window, now) {
            if let Some(country) = self.geo.country(&ip) {
                *countries.entry(country.to_string()).or_insert(0) += packets;
            }
        }

        TrafficSummary {
            window_seconds: window,
            total_packets,
            total_bytes,
            unique_sources: self.store.unique_sources(window, now),
            protocols: self
                .store
                .protocol_distribution(window, now)
                .into_iter()
                .map(|(p, n)| (p.as_str().to_string(), n))
                .collect(),
            top_ports: self.store.top_destination_ports(window, now, 10),
            countries,
        }
    }

    pub fn connection_summary(&self, window: u64) -> ConnectionSummary {
        let now = crate::utils::get_current_timestamp();
        let totals = self.store.connection_totals(window, now);
        ConnectionSummary {
            window_seconds: window,
            connection_attempts: totals.attempts,
            auth_port_attempts: totals.auth_attempts,
            attempting_sources: totals.sources,
        }
    }

    pub fn recent_alerts(&self, limit: usize) -> Vec<AlertRecord> {
        self.alerts.recent(limit)
    }

    pub async fn active_rules(&self) -> Vec<FirewallRule> {
        self.firewall.active_rules().await
    }

    // Administrative surface.

    /// Operator-initiated block of an IP or CIDR.
    pub async fn block_ip(
        &self,
        target: &str,
        reason: &str,
        duration: Duration,
    ) -> Result<Uuid, FirewallError> {
        let rule_id = self.firewall.create_block_rule(target, reason, duration).await?;
        self.counters.ips_blocked.fetch_add(1, Ordering::Relaxed);
        Ok(rule_id)
    }

    /// Remove every rule covering the address.
    pub async fn unblock_ip(&self, ip: &IpAddr) -> Result<usize, FirewallError> {
        self.firewall.unblock_ip(ip).await
    }

    pub fn add_attack_source(&self, ip: IpAddr) {
        self.registry.flag(ip);
    }

    pub fn remove_attack_source(&self, ip: &IpAddr) -> bool {
        self.registry.remove(ip)
    }

    pub fn attack_sources(&self) -> Vec<AttackSourceEntry> {
        self.registry.sources()
    }

    pub fn add_trusted_source(&self, ip: IpAddr) {
        self.registry.trust(ip);
    }

    pub fn remove_trusted_source(&self, ip: &IpAddr) -> bool {
        self.registry.untrust(ip)
    }

    pub fn configure_threshold(
        &self,
        attack: AttackType,
        value: u64,
    ) -> Result<(), DetectionError> {
        info!("Threshold for {} set to {}", attack.as_str(), value);
        self.detector.configure_threshold(attack, value)
    }

    /// Enable or disable a mitigation strategy at runtime.
    pub fn set_strategy_enabled(&self, strategy: MitigationStrategy, enabled: bool) {
        let mut strategies = self.strategies.write().unwrap_or_else(|e| e.into_inner());
        if enabled {
            strategies.insert(strategy);
        } else {
            strategies.remove(&strategy);
        }
        info!(
            "Mitigation strategy {} {}",
            strategy.as_str(),
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub fn enabled_strategies(&self) -> Vec<MitigationStrategy> {
        self.strategies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect()
    }

    pub async fn emergency_block_all(&self, duration: Duration) -> Result<Uuid, FirewallError> {
        self.firewall.emergency_block_all(duration).await
    }

    pub async fn restore_connectivity(&self) -> Result<usize, FirewallError> {
        self.firewall.restore_connectivity().await
    }
}
