//! Monitoring coordinator for the network defense service.
//!
//! Runs the background sweep cycle: counter eviction on the traffic store,
//! rule expiry on the firewall controller, and cross-source correlation over
//! recent alerts. The coordinator owns no primary state of its own, so it
//! can be stopped and restarted without data loss. Each concern runs as its
//! own interval task with a clean stop signal that finishes in-flight work
//! before returning.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::core::detector::AttackType;
use crate::core::firewall::FirewallController;
use crate::core::traffic::TrafficCounterStore;
use crate::models::MonitoringConfig;

/// Alert level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

/// What kind of event an alert records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// A single source triggered a verdict.
    AttackDetected,
    /// Many distinct sources attacked concurrently.
    CoordinatedAttack,
    /// Many concurrent amplification sources.
    AmplificationCampaign,
}

/// An immutable alert, appended to the bounded history.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    pub id: Uuid,
    pub kind: AlertKind,
    pub level: AlertLevel,
    pub message: String,
    /// Sources involved; one for detections, all of them for correlations.
    pub source_ips: Vec<IpAddr>,
    pub attack_types: Vec<AttackType>,
    pub severity: u8,
    pub created_at: DateTime<Utc>,
}

impl AlertRecord {
    /// Alert for one scored detection.
    pub fn detection(source_ip: IpAddr, attack_types: Vec<AttackType>, severity: u8) -> Self {
        let names: Vec<&str> = attack_types.iter().map(|t| t.as_str()).collect();
        Self {
            id: Uuid::new_v4(),
            kind: AlertKind::AttackDetected,
            level: if severity >= 70 {
                AlertLevel::Critical
            } else if severity >= 40 {
                AlertLevel::Warning
            } else {
                AlertLevel::Info
            },
            message: format!(
                "Detected {} from {} (severity {})",
                names.join(", "),
                source_ip,
                severity
            ),
            source_ips: vec![source_ip],
            attack_types,
            severity,
            created_at: Utc::now(),
        }
    }
}

/// Bounded, append-only alert ring shared by the engine (producer), the
/// coordinator (correlation reader/producer), and the alerts API.
pub struct AlertHistory {
    // A plain mutex: alerts are rare next to observations, and readers take
    // snapshots.
    ring: Mutex<Vec<AlertRecord>>,
    capacity: usize,
}

impl AlertHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, alert: AlertRecord) {
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        if ring.len() == self.capacity {
            ring.remove(0);
        }
        ring.push(alert);
    }

    /// Most recent alerts, newest first.
    pub fn recent(&self, limit: usize) -> Vec<AlertRecord> {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.iter().rev().take(limit).cloned().collect()
    }

    /// Alerts created at or after the cutoff.
    pub fn since(&self, cutoff: DateTime<Utc>) -> Vec<AlertRecord> {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.iter()
            .filter(|a| a.created_at >= cutoff)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Correlate recent detection alerts into campaign-level alerts.
///
/// Pure over its input so it is testable without the coordinator running.
/// Emits at most one alert per kind per pass.
pub fn correlate(recent: &[AlertRecord], config: &MonitoringConfig) -> Vec<AlertRecord> {
    let mut attack_sources: HashSet<IpAddr> = HashSet::new();
    let mut amplification_sources: HashSet<IpAddr> = HashSet::new();

    for alert in recent {
        if alert.kind != AlertKind::AttackDetected {
            continue;
        }
        for ip in &alert.source_ips {
            attack_sources.insert(*ip);
            if alert.attack_types.iter().any(|t| t.is_amplification()) {
                amplification_sources.insert(*ip);
            }
        }
    }

    let mut out = Vec::new();
    if attack_sources.len() > config.coordinated_source_threshold {
        let mut ips: Vec<IpAddr> = attack_sources.iter().copied().collect();
        ips.sort();
        out.push(AlertRecord {
            id: Uuid::new_v4(),
            kind: AlertKind::CoordinatedAttack,
            level: AlertLevel::Critical,
            message: format!(
                "Coordinated attack: {} distinct sources active concurrently",
                ips.len()
            ),
            source_ips: ips,
            attack_types: Vec::new(),
            severity: 95,
            created_at: Utc::now(),
        });
    }
    if amplification_sources.len() > config.amplification_source_threshold {
        let mut ips: Vec<IpAddr> = amplification_sources.iter().copied().collect();
        ips.sort();
        out.push(AlertRecord {
            id: Uuid::new_v4(),
            kind: AlertKind::AmplificationCampaign,
            level: AlertLevel::Critical,
            message: format!(
                "Amplification campaign: {} concurrent amplification sources",
                ips.len()
            ),
            source_ips: ips,
            attack_types: Vec::new(),
            severity: 95,
            created_at: Utc::now(),
        });
    }
    out
}

/// The background coordinator: one task per sweep concern.
pub struct MonitoringCoordinator {
    store: Arc<TrafficCounterStore>,
    firewall: Arc<FirewallController>,
    alerts: Arc<AlertHistory>,
    config: MonitoringConfig,
    store_sweep_interval: Duration,
    rule_sweep_interval: Duration,
    stop_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl MonitoringCoordinator {
    pub fn new(
        store: Arc<TrafficCounterStore>,
        firewall: Arc<FirewallController>,
        alerts: Arc<AlertHistory>,
        config: MonitoringConfig,
        store_sweep_interval: Duration,
        rule_sweep_interval: Duration,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            store,
            firewall,
            alerts,
            config,
            store_sweep_interval,
            rule_sweep_interval,
            stop_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the sweep tasks. Call once; a second start would double the
    /// sweeps.
    pub fn start(&self) {
        info!("Starting monitoring coordinator");
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());

        {
            let store = self.store.clone();
            let interval = self.store_sweep_interval;
            let mut stop_rx = self.stop_tx.subscribe();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            store.sweep(crate::utils::get_current_timestamp());
                        }
                        _ = stop_rx.changed() => break,
                    }
                }
            }));
        }

        {
            let firewall = self.firewall.clone();
            let interval = self.rule_sweep_interval;
            let mut stop_rx = self.stop_tx.subscribe();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            firewall.sweep_expired().await;
                        }
                        _ = stop_rx.changed() => break,
                    }
                }
            }));
        }

        {
            let alerts = self.alerts.clone();
            let config = self.config.clone();
            let mut stop_rx = self.stop_tx.subscribe();
            handles.push(tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_secs(config.correlation_interval_seconds));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let cutoff = Utc::now()
                                - chrono::Duration::seconds(config.correlation_window_seconds as i64);
                            let recent = alerts.since(cutoff);
                            for alert in correlate(&recent, &config) {
                                warn!("{}", alert.message);
                                alerts.push(alert);
                            }
                        }
                        _ = stop_rx.changed() => break,
                    }
                }
            }));
        }
    }

    /// Signal all tasks to stop and wait for them. In-flight sweeps complete
    /// before the tasks exit; nothing is aborted mid-rule-deletion.
    pub async fn stop(&self) {
        info!("Stopping monitoring coordinator");
        if self.stop_tx.send(true).is_err() {
            error!("Monitoring tasks already gone");
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        join_all(handles).await;
        info!("Monitoring coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::firewall::NullBackend;
    use crate::models::{FirewallConfig, StoreConfig};
    use std::net::Ipv4Addr;

    fn monitoring_config() -> MonitoringConfig {
        MonitoringConfig {
            correlation_interval_seconds: 15,
            correlation_window_seconds: 60,
            coordinated_source_threshold: 10,
            amplification_source_threshold: 5,
            alert_history_size: 100,
        }
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, last))
    }

    #[test]
    fn test_alert_history_is_bounded() {
        let history = AlertHistory::new(3);
        for i in 0..5 {
            history.push(AlertRecord::detection(ip(i), vec![AttackType::SynFlood], 85));
        }
        assert_eq!(history.len(), 3);
        let recent = history.recent(10);
        // Newest first, oldest two evicted.
        assert_eq!(recent[0].source_ips, vec![ip(4)]);
        assert_eq!(recent[2].source_ips, vec![ip(2)]);
    }

    #[test]
    fn test_coordinated_attack_references_all_sources() {
        let config = monitoring_config();
        let alerts: Vec<AlertRecord> = (0..12)
            .map(|i| AlertRecord::detection(ip(i), vec![AttackType::SynFlood], 85))
            .collect();

        let out = correlate(&alerts, &config);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, AlertKind::CoordinatedAttack);
        assert_eq!(out[0].source_ips.len(), 12);
        for i in 0..12 {
            assert!(out[0].source_ips.contains(&ip(i)));
        }
    }

    #[test]
    fn test_below_threshold_no_correlation_alert() {
        let config = monitoring_config();
        let alerts: Vec<AlertRecord> = (0..10)
            .map(|i| AlertRecord::detection(ip(i), vec![AttackType::SynFlood], 85))
            .collect();

        assert!(correlate(&alerts, &config).is_empty());
    }

    #[test]
    fn test_amplification_campaign_detected() {
        let config = monitoring_config();
        let alerts: Vec<AlertRecord> = (0..6)
            .map(|i| AlertRecord::detection(ip(i), vec![AttackType::DnsAmplification], 90))
            .collect();

        let out = correlate(&alerts, &config);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, AlertKind::AmplificationCampaign);
        assert_eq!(out[0].source_ips.len(), 6);
    }

    #[test]
    fn test_repeat_alerts_from_one_source_are_one_source() {
        let config = monitoring_config();
        // 20 alerts, all from the same IP: not coordinated.
        let alerts: Vec<AlertRecord> = (0..20)
            .map(|_| AlertRecord::detection(ip(1), vec![AttackType::SynFlood], 85))
            .collect();

        assert!(correlate(&alerts, &config).is_empty());
    }

    #[test]
    fn test_correlation_ignores_correlation_alerts() {
        let config = monitoring_config();
        let mut alerts: Vec<AlertRecord> = (0..12)
            .map(|i| AlertRecord::detection(ip(i), vec![AttackType::SynFlood], 85))
            .collect();
        // A previous pass already emitted a coordinated alert; it must not
        // feed back into the next pass's source count.
        let previous = correlate(&alerts, &config);
        alerts.extend(previous);

        let out = correlate(&alerts, &config);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, AlertKind::CoordinatedAttack);
    }

    #[tokio::test]
    async fn test_coordinator_sweeps_and_stops_cleanly() {
        let store_config = StoreConfig {
            traffic_retention_seconds: 300,
            connection_retention_seconds: 3600,
            eviction_interval_seconds: 10,
        };
        let store = Arc::new(TrafficCounterStore::new(&store_config, &[22]));
        let firewall = Arc::new(FirewallController::new(
            Arc::new(NullBackend),
            &FirewallConfig {
                backend: "none".to_string(),
                command_timeout_seconds: 5,
                sweep_interval_seconds: 30,
                rule_prefix: "netdefense".to_string(),
            },
        ));
        let alerts = Arc::new(AlertHistory::new(100));

        let coordinator = MonitoringCoordinator::new(
            store,
            firewall.clone(),
            alerts,
            monitoring_config(),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );

        firewall
            .create_block_rule("203.0.113.5", "test", Duration::from_secs(0))
            .await
            .unwrap();

        coordinator.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.stop().await;

        // The expiry sweep ran and removed the zero-duration rule.
        assert!(firewall.active_rules().await.is_empty());
    }
}
