//! Attack source registry for the network defense service.
//!
//! Sources that have triggered a verdict are flagged here; membership makes
//! subsequent mitigation more aggressive (halved rate limits, a lower block
//! threshold). This is a monotonic escalation list: entries persist until an
//! operator removes them, they never age out on their own.
//!
//! The registry also holds the trusted-source whitelist. Trusted sources are
//! still counted in traffic statistics but are exempt from mitigation.
//!
//! Locking granularity: both sets are `DashMap`s, so concurrent flagging only
//! contends per shard and never blocks the ingestion path globally.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::info;
use serde::Serialize;

/// What the registry knows about one hostile source.
#[derive(Debug, Clone, Serialize)]
pub struct AttackSourceEntry {
    pub ip: IpAddr,
    /// Number of verdicts this source has triggered since it was flagged.
    pub offenses: u64,
    pub first_flagged: DateTime<Utc>,
    pub last_flagged: DateTime<Utc>,
}

/// Registry of flagged attack sources and trusted sources.
#[derive(Default)]
pub struct AttackSourceRegistry {
    sources: DashMap<IpAddr, AttackSourceEntry>,
    trusted: DashMap<IpAddr, DateTime<Utc>>,
}

impl AttackSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag a source as hostile, creating the entry on first offense.
    /// Returns the updated offense count.
    pub fn flag(&self, ip: IpAddr) -> u64 {
        let now = Utc::now();
        let mut entry = self.sources.entry(ip).or_insert_with(|| {
            info!("Flagging new attack source {}", ip);
            AttackSourceEntry {
                ip,
                offenses: 0,
                first_flagged: now,
                last_flagged: now,
            }
        });
        entry.offenses += 1;
        entry.last_flagged = now;
        entry.offenses
    }

    /// Whether a source is currently flagged as hostile.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.sources.contains_key(ip)
    }

    /// Explicitly clear a source. Returns false if it was not flagged.
    pub fn remove(&self, ip: &IpAddr) -> bool {
        self.sources.remove(ip).is_some()
    }

    /// Snapshot of all flagged sources.
    pub fn sources(&self) -> Vec<AttackSourceEntry> {
        self.sources.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Mark a source as trusted, exempting it from mitigation.
    pub fn trust(&self, ip: IpAddr) {
        self.trusted.insert(ip, Utc::now());
        info!("Added trusted source {}", ip);
    }

    /// Remove a source from the trusted set. Returns false if absent.
    pub fn untrust(&self, ip: &IpAddr) -> bool {
        self.trusted.remove(ip).is_some()
    }

    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.trusted.contains_key(ip)
    }

    /// Snapshot of all trusted source addresses.
    pub fn trusted_sources(&self) -> Vec<IpAddr> {
        self.trusted.iter().map(|e| *e.key()).collect()
    }
}
