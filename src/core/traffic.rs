//! Traffic counter store for the network defense service.
//!
//! This module keeps per-source-IP, per-second counters of packets, bytes,
//! protocols, destination ports, and authentication-port connection attempts.
//! Detectors query sliding windows over these buckets instead of raw
//! observation history, which bounds memory to the retention horizon.
//!
//! Locking granularity: sources live in a `DashMap`, so concurrent `record`
//! calls only contend when they hash to the same shard. The eviction sweep
//! locks one shard at a time and never blocks inserts on other shards.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;

use dashmap::DashMap;
use log::debug;

use crate::models::{Protocol, StoreConfig, TrafficObservation};

/// Packet and byte totals for one protocol within one bucket.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolCounter {
    pub packets: u64,
    pub bytes: u64,
}

/// Totals for a single (source, second) bucket.
#[derive(Debug, Clone, Default)]
struct TrafficBucket {
    packets: u64,
    bytes: u64,
    /// Packets flagged SYN-without-ACK, the substrate for SYN flood checks.
    syn_packets: u64,
    by_protocol: HashMap<Protocol, ProtocolCounter>,
}

/// All bucketed state tracked for one source IP.
///
/// `traffic` ages out on the traffic retention; `ports` and `auth_attempts`
/// are connection tracking and keep the longer connection retention.
#[derive(Debug, Default)]
struct SourceCounters {
    /// Second -> packet/byte totals.
    traffic: BTreeMap<u64, TrafficBucket>,
    /// Second -> destination port -> packets sent to it.
    ports: BTreeMap<u64, HashMap<u16, u64>>,
    /// Second -> connection attempts against authentication ports.
    auth_attempts: BTreeMap<u64, u64>,
}

impl SourceCounters {
    fn is_empty(&self) -> bool {
        self.traffic.is_empty() && self.ports.is_empty() && self.auth_attempts.is_empty()
    }
}

/// Aggregate connection-attempt totals over a window, for the summary API.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionTotals {
    /// SYN-classified packets across all sources.
    pub attempts: u64,
    /// Connection attempts against authentication ports.
    pub auth_attempts: u64,
    /// Sources that made at least one attempt.
    pub sources: usize,
}

/// Per-source, per-second counter store.
pub struct TrafficCounterStore {
    sources: DashMap<IpAddr, SourceCounters>,
    /// Retention for packet/byte buckets (seconds).
    traffic_retention: u64,
    /// Retention for connection tracking buckets (seconds).
    connection_retention: u64,
    /// Destination ports counted as authentication targets.
    auth_ports: HashSet<u16>,
}

impl TrafficCounterStore {
    /// Create a store with the given retention windows and auth port set.
    pub fn new(config: &StoreConfig, auth_ports: &[u16]) -> Self {
        Self {
            sources: DashMap::new(),
            traffic_retention: config.traffic_retention_seconds,
            connection_retention: config.connection_retention_seconds,
            auth_ports: auth_ports.iter().copied().collect(),
        }
    }

    /// Record one observation. Infallible; malformed data cannot enter
    /// because `TrafficObservation` is already typed.
    pub fn record(&self, obs: &TrafficObservation) {
        let mut entry = self.sources.entry(obs.source_ip).or_default();
        let second = obs.timestamp;

        let bucket = entry.traffic.entry(second).or_default();
        bucket.packets += obs.packet_count;
        bucket.bytes += obs.byte_count;
        if obs.is_connection_attempt() {
            bucket.syn_packets += obs.packet_count;
        }
        let proto = bucket.by_protocol.entry(obs.protocol).or_default();
        proto.packets += obs.packet_count;
        proto.bytes += obs.byte_count;

        if obs.dest_port != 0 {
            *entry
                .ports
                .entry(second)
                .or_default()
                .entry(obs.dest_port)
                .or_insert(0) += obs.packet_count;
        }

        // SYNs and RSTs against auth ports both count as attempts: servers
        // that reset on authentication failure produce the latter.
        if (obs.is_connection_attempt() || obs.flags.rst)
            && self.auth_ports.contains(&obs.dest_port)
        {
            *entry.auth_attempts.entry(second).or_insert(0) += obs.packet_count;
        }
    }

    /// Packets of one protocol sent by a source within the window ending at `now`.
    pub fn count_in_window(&self, ip: &IpAddr, protocol: Protocol, window: u64, now: u64) -> u64 {
        self.fold_traffic(ip, window, now, |bucket| {
            bucket
                .by_protocol
                .get(&protocol)
                .map(|c| c.packets)
                .unwrap_or(0)
        })
    }

    /// SYN-classified packets sent by a source within the window.
    pub fn syn_count_in_window(&self, ip: &IpAddr, window: u64, now: u64) -> u64 {
        self.fold_traffic(ip, window, now, |bucket| bucket.syn_packets)
    }

    /// Total packets from a source across all protocols within the window.
    pub fn packets_in_window(&self, ip: &IpAddr, window: u64, now: u64) -> u64 {
        self.fold_traffic(ip, window, now, |bucket| bucket.packets)
    }

    /// Total bytes from a source within the window.
    pub fn bytes_in_window(&self, ip: &IpAddr, window: u64, now: u64) -> u64 {
        self.fold_traffic(ip, window, now, |bucket| bucket.bytes)
    }

    fn fold_traffic<F>(&self, ip: &IpAddr, window: u64, now: u64, f: F) -> u64
    where
        F: Fn(&TrafficBucket) -> u64,
    {
        let Some(entry) = self.sources.get(ip) else {
            return 0;
        };
        let lo = window_start(window, now);
        entry
            .traffic
            .range(lo..=now)
            .map(|(_, bucket)| f(bucket))
            .sum()
    }

    /// Distinct destination ports a source contacted within the window.
    pub fn distinct_ports_in_window(&self, ip: &IpAddr, window: u64, now: u64) -> usize {
        let Some(entry) = self.sources.get(ip) else {
            return 0;
        };
        let lo = window_start(window, now);
        let mut seen: HashSet<u16> = HashSet::new();
        for (_, ports) in entry.ports.range(lo..=now) {
            seen.extend(ports.keys());
        }
        seen.len()
    }

    /// Connection attempts against authentication ports within the window.
    pub fn auth_attempts_in_window(&self, ip: &IpAddr, window: u64, now: u64) -> u64 {
        let Some(entry) = self.sources.get(ip) else {
            return 0;
        };
        let lo = window_start(window, now);
        entry.auth_attempts.range(lo..=now).map(|(_, n)| n).sum()
    }

    /// Per-source packet totals within the window, for concentration and
    /// geography analysis. Sources with no traffic in the window are omitted.
    pub fn source_packet_counts(&self, window: u64, now: u64) -> Vec<(IpAddr, u64)> {
        let lo = window_start(window, now);
        self.sources
            .iter()
            .filter_map(|entry| {
                let packets: u64 = entry
                    .value()
                    .traffic
                    .range(lo..=now)
                    .map(|(_, b)| b.packets)
                    .sum();
                (packets > 0).then(|| (*entry.key(), packets))
            })
            .collect()
    }

    /// Packet counts per protocol across all sources within the window.
    pub fn protocol_distribution(&self, window: u64, now: u64) -> HashMap<Protocol, u64> {
        let lo = window_start(window, now);
        let mut dist: HashMap<Protocol, u64> = HashMap::new();
        for entry in self.sources.iter() {
            for (_, bucket) in entry.value().traffic.range(lo..=now) {
                for (proto, counter) in &bucket.by_protocol {
                    *dist.entry(*proto).or_insert(0) += counter.packets;
                }
            }
        }
        dist
    }

    /// The most-contacted destination ports within the window, descending.
    pub fn top_destination_ports(&self, window: u64, now: u64, limit: usize) -> Vec<(u16, u64)> {
        let lo = window_start(window, now);
        let mut counts: HashMap<u16, u64> = HashMap::new();
        for entry in self.sources.iter() {
            for (_, ports) in entry.value().ports.range(lo..=now) {
                for (port, packets) in ports {
                    *counts.entry(*port).or_insert(0) += packets;
                }
            }
        }
        let mut sorted: Vec<(u16, u64)> = counts.into_iter().collect();
        sorted.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        sorted.truncate(limit);
        sorted
    }

    /// Packet and byte totals across all sources within the window.
    pub fn traffic_totals(&self, window: u64, now: u64) -> (u64, u64) {
        let lo = window_start(window, now);
        let mut packets = 0;
        let mut bytes = 0;
        for entry in self.sources.iter() {
            for (_, bucket) in entry.value().traffic.range(lo..=now) {
                packets += bucket.packets;
                bytes += bucket.bytes;
            }
        }
        (packets, bytes)
    }

    /// Sources with any traffic in the window.
    pub fn unique_sources(&self, window: u64, now: u64) -> usize {
        let lo = window_start(window, now);
        self.sources
            .iter()
            .filter(|entry| entry.value().traffic.range(lo..=now).next().is_some())
            .count()
    }

    /// Connection-attempt totals over the window.
    pub fn connection_totals(&self, window: u64, now: u64) -> ConnectionTotals {
        let lo = window_start(window, now);
        let mut totals = ConnectionTotals::default();
        for entry in self.sources.iter() {
            let counters = entry.value();
            let attempts: u64 = counters
                .traffic
                .range(lo..=now)
                .map(|(_, b)| b.syn_packets)
                .sum();
            let auth: u64 = counters.auth_attempts.range(lo..=now).map(|(_, n)| n).sum();
            if attempts > 0 || auth > 0 {
                totals.sources += 1;
            }
            totals.attempts += attempts;
            totals.auth_attempts += auth;
        }
        totals
    }

    /// Number of sources currently tracked.
    pub fn tracked_sources(&self) -> usize {
        self.sources.len()
    }

    /// Evict buckets older than the retention horizons and drop sources that
    /// have gone completely idle. Returns the number of sources removed.
    pub fn sweep(&self, now: u64) -> usize {
        let traffic_cutoff = now.saturating_sub(self.traffic_retention);
        let connection_cutoff = now.saturating_sub(self.connection_retention);
        let before = self.sources.len();

        self.sources.retain(|_, counters| {
            counters.traffic = counters.traffic.split_off(&traffic_cutoff);
            counters.ports = counters.ports.split_off(&connection_cutoff);
            counters.auth_attempts = counters.auth_attempts.split_off(&connection_cutoff);
            !counters.is_empty()
        });

        let removed = before - self.sources.len();
        if removed > 0 {
            debug!("Evicted {} idle sources from traffic store", removed);
        }
        removed
    }
}

/// First bucket id included in a window of `window` seconds ending at `now`.
fn window_start(window: u64, now: u64) -> u64 {
    now.saturating_sub(window.saturating_sub(1))
}
