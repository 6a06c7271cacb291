//! Attack pattern detection for the network defense service.
//!
//! Every observation is checked against each configured pattern
//! independently: flood and amplification thresholds over sliding windows,
//! distinct-port scanning, brute force against authentication ports, static
//! suspicious-port and unusual-protocol lists, and geographic/temporal
//! heuristics. When several patterns trigger at once the detection reports
//! all of them, not just the first.
//!
//! Windowed thresholds are reconfigurable at runtime through
//! `configure_threshold`; static-list and heuristic patterns are not.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Datelike, FixedOffset, TimeZone, Timelike, Utc};
use dashmap::DashMap;
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::geo::GeoResolver;
use crate::core::traffic::TrafficCounterStore;
use crate::models::{DetectionConfig, GeoConfig, Protocol, TemporalConfig, TrafficObservation};

/// Errors from the detection configuration surface.
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("attack type {0} has no configurable threshold")]
    ThresholdNotConfigurable(&'static str),
    #[error("threshold must be greater than zero")]
    ZeroThreshold,
}

/// Every attack pattern the detector knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackType {
    SynFlood,
    UdpFlood,
    IcmpFlood,
    HttpFlood,
    DnsAmplification,
    NtpAmplification,
    MemcachedAmplification,
    PortScan,
    BruteForce,
    SuspiciousPort,
    UnusualProtocol,
    GeoAnomaly,
    TemporalAnomaly,
}

impl AttackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttackType::SynFlood => "syn_flood",
            AttackType::UdpFlood => "udp_flood",
            AttackType::IcmpFlood => "icmp_flood",
            AttackType::HttpFlood => "http_flood",
            AttackType::DnsAmplification => "dns_amplification",
            AttackType::NtpAmplification => "ntp_amplification",
            AttackType::MemcachedAmplification => "memcached_amplification",
            AttackType::PortScan => "port_scan",
            AttackType::BruteForce => "brute_force",
            AttackType::SuspiciousPort => "suspicious_port",
            AttackType::UnusualProtocol => "unusual_protocol",
            AttackType::GeoAnomaly => "geo_anomaly",
            AttackType::TemporalAnomaly => "temporal_anomaly",
        }
    }

    /// Flood-family patterns (volumetric, keyed by transport protocol).
    pub fn is_flood(&self) -> bool {
        matches!(
            self,
            AttackType::SynFlood
                | AttackType::UdpFlood
                | AttackType::IcmpFlood
                | AttackType::HttpFlood
        )
    }

    /// Reflection/amplification patterns.
    pub fn is_amplification(&self) -> bool {
        matches!(
            self,
            AttackType::DnsAmplification
                | AttackType::NtpAmplification
                | AttackType::MemcachedAmplification
        )
    }

    /// Patterns tied to a specific protocol, eligible for protocol filtering.
    pub fn is_protocol_specific(&self) -> bool {
        self.is_flood() || self.is_amplification() || *self == AttackType::UnusualProtocol
    }

    /// Whether `configure_threshold` applies to this pattern.
    pub fn has_windowed_threshold(&self) -> bool {
        self.is_flood()
            || self.is_amplification()
            || matches!(self, AttackType::PortScan | AttackType::BruteForce)
    }
}

/// Result of evaluating one observation: every pattern that triggered.
#[derive(Debug, Clone)]
pub struct Detection {
    pub source_ip: IpAddr,
    pub attack_types: Vec<AttackType>,
}

/// A windowed `(threshold, window_seconds)` pair for one pattern.
#[derive(Debug, Clone, Copy)]
struct WindowedThreshold {
    threshold: u64,
    window: u64,
}

/// The attack pattern detector. Holds no per-source state of its own; all
/// counts come from the traffic counter store.
pub struct AttackPatternDetector {
    store: Arc<TrafficCounterStore>,
    geo: Arc<dyn GeoResolver>,
    /// Runtime-tunable thresholds for the windowed patterns.
    thresholds: DashMap<AttackType, WindowedThreshold>,
    suspicious_ports: HashSet<u16>,
    unusual_protocols: HashSet<String>,
    geo_config: GeoConfig,
    temporal_config: TemporalConfig,
    /// Window used for the geographic concentration check.
    geo_window: u64,
    high_risk_countries: HashSet<String>,
}

impl AttackPatternDetector {
    pub fn new(
        store: Arc<TrafficCounterStore>,
        geo: Arc<dyn GeoResolver>,
        detection: &DetectionConfig,
        geo_config: GeoConfig,
        temporal_config: TemporalConfig,
    ) -> Self {
        let thresholds = DashMap::new();
        let flood = |t| WindowedThreshold {
            threshold: t,
            window: detection.flood_window_seconds,
        };
        let amp = |t| WindowedThreshold {
            threshold: t,
            window: detection.amplification_window_seconds,
        };
        thresholds.insert(AttackType::SynFlood, flood(detection.syn_flood_threshold));
        thresholds.insert(AttackType::UdpFlood, flood(detection.udp_flood_threshold));
        thresholds.insert(AttackType::IcmpFlood, flood(detection.icmp_flood_threshold));
        thresholds.insert(AttackType::HttpFlood, flood(detection.http_flood_threshold));
        thresholds.insert(
            AttackType::DnsAmplification,
            amp(detection.dns_amplification_threshold),
        );
        thresholds.insert(
            AttackType::NtpAmplification,
            amp(detection.ntp_amplification_threshold),
        );
        thresholds.insert(
            AttackType::MemcachedAmplification,
            amp(detection.memcached_amplification_threshold),
        );
        thresholds.insert(
            AttackType::PortScan,
            WindowedThreshold {
                threshold: detection.port_scan_threshold,
                window: detection.port_scan_window_seconds,
            },
        );
        thresholds.insert(
            AttackType::BruteForce,
            WindowedThreshold {
                threshold: detection.brute_force_threshold,
                window: detection.brute_force_window_seconds,
            },
        );

        Self {
            store,
            geo,
            thresholds,
            suspicious_ports: detection.suspicious_ports.iter().copied().collect(),
            unusual_protocols: detection
                .unusual_protocols
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
            high_risk_countries: geo_config
                .high_risk_countries
                .iter()
                .map(|c| c.to_uppercase())
                .collect(),
            geo_config,
            temporal_config,
            geo_window: detection.flood_window_seconds,
        }
    }

    /// Evaluate one observation against every configured pattern.
    ///
    /// Assumes the observation has already been recorded in the store, so
    /// windowed checks include it. Returns `None` when nothing triggered.
    pub fn evaluate(&self, obs: &TrafficObservation, now: u64) -> Option<Detection> {
        let mut triggered = Vec::new();
        let ip = &obs.source_ip;

        if let Some(t) = self.exceeds(AttackType::SynFlood, |w| {
            self.store.syn_count_in_window(ip, w, now)
        }) {
            triggered.push(t);
        }
        if let Some(t) = self.exceeds(AttackType::UdpFlood, |w| {
            self.store.count_in_window(ip, Protocol::Udp, w, now)
        }) {
            triggered.push(t);
        }
        if let Some(t) = self.exceeds(AttackType::IcmpFlood, |w| {
            self.store.count_in_window(ip, Protocol::Icmp, w, now)
        }) {
            triggered.push(t);
        }
        if let Some(t) = self.exceeds(AttackType::HttpFlood, |w| {
            self.store.count_in_window(ip, Protocol::Http, w, now)
        }) {
            triggered.push(t);
        }
        if let Some(t) = self.exceeds(AttackType::DnsAmplification, |w| {
            self.store.count_in_window(ip, Protocol::Dns, w, now)
        }) {
            triggered.push(t);
        }
        if let Some(t) = self.exceeds(AttackType::NtpAmplification, |w| {
            self.store.count_in_window(ip, Protocol::Ntp, w, now)
        }) {
            triggered.push(t);
        }
        if let Some(t) = self.exceeds(AttackType::MemcachedAmplification, |w| {
            self.store.count_in_window(ip, Protocol::Memcached, w, now)
        }) {
            triggered.push(t);
        }
        if let Some(t) = self.exceeds(AttackType::PortScan, |w| {
            self.store.distinct_ports_in_window(ip, w, now) as u64
        }) {
            triggered.push(t);
        }
        if let Some(t) = self.exceeds(AttackType::BruteForce, |w| {
            self.store.auth_attempts_in_window(ip, w, now)
        }) {
            triggered.push(t);
        }

        // Static membership checks, no windowing.
        if self.suspicious_ports.contains(&obs.dest_port) {
            triggered.push(AttackType::SuspiciousPort);
        }
        if self.unusual_protocols.contains(obs.protocol.as_str()) {
            triggered.push(AttackType::UnusualProtocol);
        }

        if self.geo_config.enabled && self.check_geo_anomaly(ip, now) {
            triggered.push(AttackType::GeoAnomaly);
        }
        if self.temporal_config.enabled && self.check_temporal_anomaly(obs.timestamp) {
            triggered.push(AttackType::TemporalAnomaly);
        }

        if triggered.is_empty() {
            None
        } else {
            debug!("Source {} triggered {:?}", ip, triggered);
            Some(Detection {
                source_ip: *ip,
                attack_types: triggered,
            })
        }
    }

    fn exceeds<F>(&self, attack: AttackType, count: F) -> Option<AttackType>
    where
        F: Fn(u64) -> u64,
    {
        let wt = *self.thresholds.get(&attack)?;
        (count(wt.window) >= wt.threshold).then_some(attack)
    }

    /// Source country is high-risk, or one country dominates recent traffic
    /// (only evaluated once the window carries a minimum sample).
    fn check_geo_anomaly(&self, ip: &IpAddr, now: u64) -> bool {
        let Some(country) = self.geo.country(ip) else {
            return false;
        };

        if self.high_risk_countries.contains(country) {
            return true;
        }

        let per_source = self.store.source_packet_counts(self.geo_window, now);
        let mut by_country: HashMap<&str, u64> = HashMap::new();
        let mut attributed = 0u64;
        for (source, packets) in &per_source {
            if let Some(c) = self.geo.country(source) {
                *by_country.entry(c).or_insert(0) += packets;
                attributed += packets;
            }
        }
        if attributed < self.geo_config.min_sample_packets {
            return false;
        }
        match by_country.get(country) {
            Some(&packets) => {
                packets as f64 / attributed as f64 > self.geo_config.concentration_ratio
            }
            None => false,
        }
    }

    /// Off-hours or weekend traffic, evaluated at a configured UTC offset so
    /// detection does not depend on the host timezone.
    fn check_temporal_anomaly(&self, timestamp: u64) -> bool {
        let offset_seconds = self.temporal_config.utc_offset_hours * 3600;
        let Some(offset) = FixedOffset::east_opt(offset_seconds) else {
            return false;
        };
        let utc: DateTime<Utc> = match Utc.timestamp_opt(timestamp as i64, 0).single() {
            Some(t) => t,
            None => return false,
        };
        let local = utc.with_timezone(&offset);

        let hour = local.hour();
        let off_hours = hour >= self.temporal_config.off_hours_start
            || hour < self.temporal_config.off_hours_end;
        let weekend = self.temporal_config.flag_weekends
            && matches!(local.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun);

        off_hours || weekend
    }

    /// Change the threshold of a windowed pattern at runtime. The window
    /// itself is not reconfigurable; static-list and heuristic patterns
    /// reject reconfiguration.
    pub fn configure_threshold(&self, attack: AttackType, value: u64) -> Result<(), DetectionError> {
        if !attack.has_windowed_threshold() {
            return Err(DetectionError::ThresholdNotConfigurable(attack.as_str()));
        }
        if value == 0 {
            return Err(DetectionError::ZeroThreshold);
        }
        if let Some(mut wt) = self.thresholds.get_mut(&attack) {
            wt.threshold = value;
        }
        Ok(())
    }

    /// Current `(threshold, window)` pairs for the windowed patterns.
    pub fn thresholds(&self) -> HashMap<AttackType, (u64, u64)> {
        self.thresholds
            .iter()
            .map(|e| (*e.key(), (e.value().threshold, e.value().window)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geo::OctetHeuristicResolver;
    use crate::models::{ObservationFlags, StoreConfig};
    use std::net::Ipv4Addr;

    // 2021-06-01 is a Tuesday; 12:00 UTC is well inside business hours.
    const TUESDAY_NOON: u64 = 1622548800;

    fn detector() -> (Arc<TrafficCounterStore>, AttackPatternDetector) {
        let detection = DetectionConfig::default();
        let store = Arc::new(TrafficCounterStore::new(
            &StoreConfig {
                traffic_retention_seconds: 300,
                connection_retention_seconds: 3600,
                eviction_interval_seconds: 10,
            },
            &detection.auth_ports,
        ));
        let det = AttackPatternDetector::new(
            store.clone(),
            Arc::new(OctetHeuristicResolver),
            &detection,
            GeoConfig {
                enabled: false,
                high_risk_countries: Vec::new(),
                concentration_ratio: 0.7,
                min_sample_packets: 200,
            },
            TemporalConfig {
                enabled: false,
                off_hours_start: 22,
                off_hours_end: 6,
                flag_weekends: true,
                utc_offset_hours: 0,
            },
        );
        (store, det)
    }

    fn obs(ip: [u8; 4], protocol: Protocol, dest_port: u16, ts: u64) -> TrafficObservation {
        TrafficObservation {
            source_ip: IpAddr::V4(Ipv4Addr::from(ip)),
            dest_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            protocol,
            source_port: 40000,
            dest_port,
            packet_count: 1,
            byte_count: 60,
            timestamp: ts,
            flags: ObservationFlags::default(),
        }
    }

    fn syn_obs(ip: [u8; 4], dest_port: u16, ts: u64) -> TrafficObservation {
        let mut o = obs(ip, Protocol::Tcp, dest_port, ts);
        o.flags.syn = true;
        o
    }

    #[test]
    fn test_syn_flood_triggers_at_threshold() {
        let (store, det) = detector();
        let now = TUESDAY_NOON;

        for i in 0..1000u64 {
            store.record(&syn_obs([203, 0, 113, 5], 80, now - (i % 50)));
        }
        let last = syn_obs([203, 0, 113, 5], 80, now);

        let detection = det.evaluate(&last, now).expect("should trigger");
        assert!(detection.attack_types.contains(&AttackType::SynFlood));
    }

    #[test]
    fn test_below_threshold_is_clean() {
        let (store, det) = detector();
        let now = TUESDAY_NOON;

        for i in 0..100u64 {
            store.record(&syn_obs([203, 0, 113, 6], 80, now - (i % 50)));
        }
        let last = syn_obs([203, 0, 113, 6], 80, now);

        assert!(det.evaluate(&last, now).is_none());
    }

    #[test]
    fn test_amplification_threshold_lower_than_flood() {
        let (store, det) = detector();
        let now = TUESDAY_NOON;

        // 100 DNS packets trips dns_amplification but would not trip any
        // flood threshold.
        for i in 0..100u64 {
            store.record(&obs([203, 0, 113, 7], Protocol::Dns, 53, now - (i % 50)));
        }
        let last = obs([203, 0, 113, 7], Protocol::Dns, 53, now);

        let detection = det.evaluate(&last, now).expect("should trigger");
        assert_eq!(detection.attack_types, vec![AttackType::DnsAmplification]);
    }

    #[test]
    fn test_port_scan_counts_distinct_ports_across_protocols() {
        let (store, det) = detector();
        let now = TUESDAY_NOON;

        for port in 2000..2010u16 {
            let proto = if port % 2 == 0 { Protocol::Tcp } else { Protocol::Udp };
            store.record(&obs([203, 0, 113, 8], proto, port, now));
        }
        let last = obs([203, 0, 113, 8], Protocol::Tcp, 2009, now);

        let detection = det.evaluate(&last, now).expect("should trigger");
        assert!(detection.attack_types.contains(&AttackType::PortScan));
    }

    #[test]
    fn test_brute_force_on_auth_port_attempts() {
        let (store, det) = detector();
        let now = TUESDAY_NOON;

        for i in 0..5u64 {
            store.record(&syn_obs([203, 0, 113, 9], 22, now - i * 30));
        }
        let last = syn_obs([203, 0, 113, 9], 22, now);

        let detection = det.evaluate(&last, now).expect("should trigger");
        assert!(detection.attack_types.contains(&AttackType::BruteForce));
    }

    #[test]
    fn test_static_checks_need_no_history() {
        let (store, det) = detector();
        let now = TUESDAY_NOON;

        let o = obs([203, 0, 113, 10], Protocol::Tcp, 31337, now);
        store.record(&o);
        let detection = det.evaluate(&o, now).expect("should trigger");
        assert_eq!(detection.attack_types, vec![AttackType::SuspiciousPort]);

        let o = obs([203, 0, 113, 11], Protocol::Gre, 0, now);
        store.record(&o);
        let detection = det.evaluate(&o, now).expect("should trigger");
        assert_eq!(detection.attack_types, vec![AttackType::UnusualProtocol]);
    }

    #[test]
    fn test_multiple_patterns_all_reported() {
        let (store, det) = detector();
        let now = TUESDAY_NOON;

        // SYN flood volume aimed at a suspicious port.
        for i in 0..1200u64 {
            store.record(&syn_obs([203, 0, 113, 12], 4444, now - (i % 10)));
        }
        let last = syn_obs([203, 0, 113, 12], 4444, now);

        let detection = det.evaluate(&last, now).expect("should trigger");
        assert!(detection.attack_types.contains(&AttackType::SynFlood));
        assert!(detection.attack_types.contains(&AttackType::SuspiciousPort));
        // 1200 packets at one port also exceeds nothing else windowed.
        assert!(!detection.attack_types.contains(&AttackType::PortScan));
    }

    #[test]
    fn test_configure_threshold_applies_at_runtime() {
        let (store, det) = detector();
        let now = TUESDAY_NOON;

        for i in 0..50u64 {
            store.record(&syn_obs([203, 0, 113, 13], 80, now - (i % 40)));
        }
        let last = syn_obs([203, 0, 113, 13], 80, now);
        assert!(det.evaluate(&last, now).is_none());

        det.configure_threshold(AttackType::SynFlood, 50).unwrap();
        let detection = det.evaluate(&last, now).expect("should trigger");
        assert!(detection.attack_types.contains(&AttackType::SynFlood));
    }

    #[test]
    fn test_configure_threshold_rejects_static_patterns() {
        let (_, det) = detector();

        assert!(matches!(
            det.configure_threshold(AttackType::SuspiciousPort, 5),
            Err(DetectionError::ThresholdNotConfigurable(_))
        ));
        assert!(matches!(
            det.configure_threshold(AttackType::SynFlood, 0),
            Err(DetectionError::ZeroThreshold)
        ));
    }

    #[test]
    fn test_temporal_anomaly_off_hours_and_weekends() {
        let detection = DetectionConfig::default();
        let store = Arc::new(TrafficCounterStore::new(
            &StoreConfig {
                traffic_retention_seconds: 300,
                connection_retention_seconds: 3600,
                eviction_interval_seconds: 10,
            },
            &detection.auth_ports,
        ));
        let det = AttackPatternDetector::new(
            store.clone(),
            Arc::new(OctetHeuristicResolver),
            &detection,
            GeoConfig {
                enabled: false,
                high_risk_countries: Vec::new(),
                concentration_ratio: 0.7,
                min_sample_packets: 200,
            },
            TemporalConfig {
                enabled: true,
                off_hours_start: 22,
                off_hours_end: 6,
                flag_weekends: true,
                utc_offset_hours: 0,
            },
        );

        // 2021-06-01 23:00 UTC, a Tuesday night.
        let night = TUESDAY_NOON + 11 * 3600;
        let o = obs([203, 0, 113, 14], Protocol::Tcp, 80, night);
        store.record(&o);
        let d = det.evaluate(&o, night).expect("off-hours should trigger");
        assert_eq!(d.attack_types, vec![AttackType::TemporalAnomaly]);

        // 2021-06-05 12:00 UTC, a Saturday.
        let saturday = TUESDAY_NOON + 4 * 86400;
        let o = obs([203, 0, 113, 15], Protocol::Tcp, 80, saturday);
        store.record(&o);
        let d = det.evaluate(&o, saturday).expect("weekend should trigger");
        assert_eq!(d.attack_types, vec![AttackType::TemporalAnomaly]);

        // Tuesday noon triggers neither.
        let o = obs([203, 0, 113, 16], Protocol::Tcp, 80, TUESDAY_NOON);
        store.record(&o);
        assert!(det.evaluate(&o, TUESDAY_NOON).is_none());
    }

    #[test]
    fn test_geo_anomaly_high_risk_country() {
        let detection = DetectionConfig::default();
        let store = Arc::new(TrafficCounterStore::new(
            &StoreConfig {
                traffic_retention_seconds: 300,
                connection_retention_seconds: 3600,
                eviction_interval_seconds: 10,
            },
            &detection.auth_ports,
        ));
        let det = AttackPatternDetector::new(
            store.clone(),
            Arc::new(OctetHeuristicResolver),
            &detection,
            GeoConfig {
                enabled: true,
                // The heuristic resolver maps 150-179 first octets to RU.
                high_risk_countries: vec!["ru".to_string()],
                concentration_ratio: 0.7,
                min_sample_packets: 200,
            },
            TemporalConfig {
                enabled: false,
                off_hours_start: 22,
                off_hours_end: 6,
                flag_weekends: true,
                utc_offset_hours: 0,
            },
        );
        let now = TUESDAY_NOON;

        let o = obs([160, 1, 2, 3], Protocol::Tcp, 80, now);
        store.record(&o);
        let d = det.evaluate(&o, now).expect("high-risk country should trigger");
        assert_eq!(d.attack_types, vec![AttackType::GeoAnomaly]);

        // A US-mapped source does not.
        let o = obs([50, 1, 2, 3], Protocol::Tcp, 80, now);
        store.record(&o);
        assert!(det.evaluate(&o, now).is_none());
    }

    fn concentration_detector(
        min_sample_packets: u64,
    ) -> (Arc<TrafficCounterStore>, AttackPatternDetector) {
        let detection = DetectionConfig::default();
        let store = Arc::new(TrafficCounterStore::new(
            &StoreConfig {
                traffic_retention_seconds: 300,
                connection_retention_seconds: 3600,
                eviction_interval_seconds: 10,
            },
            &detection.auth_ports,
        ));
        let det = AttackPatternDetector::new(
            store.clone(),
            Arc::new(OctetHeuristicResolver),
            &detection,
            GeoConfig {
                enabled: true,
                high_risk_countries: Vec::new(),
                concentration_ratio: 0.7,
                min_sample_packets,
            },
            TemporalConfig {
                enabled: false,
                off_hours_start: 22,
                off_hours_end: 6,
                flag_weekends: true,
                utc_offset_hours: 0,
            },
        );
        (store, det)
    }

    #[test]
    fn test_geo_concentration_flags_dominant_country_only() {
        let (store, det) = concentration_detector(100);
        let now = TUESDAY_NOON;

        // 150 of 180 attributed packets come from a US-mapped source, which
        // puts the US share at 0.83, above the 0.7 ratio.
        let mut heavy = obs([50, 1, 2, 3], Protocol::Tcp, 80, now);
        heavy.packet_count = 150;
        store.record(&heavy);
        let mut light = obs([110, 1, 2, 3], Protocol::Tcp, 80, now);
        light.packet_count = 30;
        store.record(&light);

        let d = det.evaluate(&heavy, now).expect("dominant country should trigger");
        assert_eq!(d.attack_types, vec![AttackType::GeoAnomaly]);

        // The DE-mapped source sits below the ratio and stays clean.
        assert!(det.evaluate(&light, now).is_none());
    }

    #[test]
    fn test_geo_concentration_needs_minimum_sample() {
        let (store, det) = concentration_detector(100);
        let now = TUESDAY_NOON;

        // Total attributed traffic is 50 packets, under the 100-packet
        // minimum, so even a 100% share does not trigger.
        let mut heavy = obs([50, 1, 2, 3], Protocol::Tcp, 80, now);
        heavy.packet_count = 50;
        store.record(&heavy);

        assert!(det.evaluate(&heavy, now).is_none());
    }
}
