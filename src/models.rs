use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

use crate::core::detector::AttackType;
use crate::core::mitigation::MitigationAction;

/// Network protocol classification for an observation.
///
/// Floods are keyed by the transport protocols, amplification detection by
/// the application protocols a reflector would speak. `Other` covers anything
/// the capture layer could not classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Http,
    Dns,
    Ntp,
    Memcached,
    Gre,
    Esp,
    Sctp,
    Other,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::Http => "http",
            Protocol::Dns => "dns",
            Protocol::Ntp => "ntp",
            Protocol::Memcached => "memcached",
            Protocol::Gre => "gre",
            Protocol::Esp => "esp",
            Protocol::Sctp => "sctp",
            Protocol::Other => "other",
        }
    }
}

/// TCP-style flags carried by an observation. All default to false so pure
/// volume feeds (NetFlow-like) can omit them.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ObservationFlags {
    #[serde(default)]
    pub syn: bool,
    #[serde(default)]
    pub ack: bool,
    #[serde(default)]
    pub rst: bool,
    #[serde(default)]
    pub fin: bool,
}

/// A single traffic observation from the capture layer. Immutable, ingested
/// once; the subsystem never stores raw observations, only bucketed counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficObservation {
    /// Source IP address
    pub source_ip: IpAddr,
    /// Destination IP address
    pub dest_ip: IpAddr,
    /// Protocol classification
    pub protocol: Protocol,
    /// Source port (0 when not applicable)
    pub source_port: u16,
    /// Destination port (0 when not applicable)
    pub dest_port: u16,
    /// Packets represented by this observation
    pub packet_count: u64,
    /// Bytes represented by this observation
    pub byte_count: u64,
    /// Unix timestamp (seconds) when the traffic was seen
    pub timestamp: u64,
    /// Flags, when the capture layer provides them
    #[serde(default)]
    pub flags: ObservationFlags,
}

impl TrafficObservation {
    /// SYN without ACK: a new connection attempt as seen from the source.
    pub fn is_connection_attempt(&self) -> bool {
        self.flags.syn && !self.flags.ack
    }
}

/// Coarse threat classification derived from a 0-100 severity score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn from_severity(severity: u8) -> Self {
        match severity {
            0 => ThreatLevel::None,
            1..=39 => ThreatLevel::Low,
            40..=69 => ThreatLevel::Medium,
            70..=89 => ThreatLevel::High,
            _ => ThreatLevel::Critical,
        }
    }
}

/// Result returned by the ingestion APIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Coarse classification of the observation
    pub threat_level: ThreatLevel,
    /// Every attack pattern that triggered, highest base severity first
    pub attack_types: Vec<AttackType>,
    /// Computed severity (0-100)
    pub severity: u8,
    /// Recommended action codes
    pub recommended_actions: Vec<MitigationAction>,
    /// Whether a firewall rule was actually installed for this verdict
    pub mitigated: bool,
    /// Identifier of the installed rule, when one was created
    pub rule_id: Option<Uuid>,
}

impl AnalysisResult {
    /// Result for an observation that triggered nothing.
    pub fn clean() -> Self {
        Self {
            threat_level: ThreatLevel::None,
            attack_types: Vec::new(),
            severity: 0,
            recommended_actions: Vec::new(),
            mitigated: false,
            rule_id: None,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

/// Traffic counter store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Retention for packet/byte buckets in seconds
    pub traffic_retention_seconds: u64,
    /// Retention for connection tracking (port sets, auth attempts) in seconds
    pub connection_retention_seconds: u64,
    /// Interval between eviction sweeps in seconds
    pub eviction_interval_seconds: u64,
}

/// Attack detection thresholds. Windowed thresholds can also be changed at
/// runtime through the administrative API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// SYN flood threshold (SYN packets per flood window)
    pub syn_flood_threshold: u64,
    /// UDP flood threshold (packets per flood window)
    pub udp_flood_threshold: u64,
    /// ICMP flood threshold (packets per flood window)
    pub icmp_flood_threshold: u64,
    /// HTTP flood threshold (requests per flood window)
    pub http_flood_threshold: u64,
    /// Time window for flood detection (seconds)
    pub flood_window_seconds: u64,
    /// DNS amplification threshold (packets per amplification window)
    pub dns_amplification_threshold: u64,
    /// NTP amplification threshold (packets per amplification window)
    pub ntp_amplification_threshold: u64,
    /// Memcached amplification threshold (packets per amplification window)
    pub memcached_amplification_threshold: u64,
    /// Time window for amplification detection (seconds)
    pub amplification_window_seconds: u64,
    /// Distinct destination ports before a source counts as scanning
    pub port_scan_threshold: u64,
    /// Time window for port scan detection (seconds)
    pub port_scan_window_seconds: u64,
    /// Connection attempts to auth ports before brute force triggers
    pub brute_force_threshold: u64,
    /// Time window for brute force detection (seconds)
    pub brute_force_window_seconds: u64,
    /// Well-known authentication ports watched for brute force
    pub auth_ports: Vec<u16>,
    /// Destination ports flagged as suspicious on sight
    pub suspicious_ports: Vec<u16>,
    /// Protocol names flagged as unusual on sight
    pub unusual_protocols: Vec<String>,
    /// Window used when computing recent volume for severity escalation
    pub volume_window_seconds: u64,
}

/// Geographic anomaly configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoConfig {
    /// Whether geographic checks run at all
    pub enabled: bool,
    /// Country codes treated as high risk (empty disables the list check)
    pub high_risk_countries: Vec<String>,
    /// Fraction of recent traffic from one country that counts as anomalous
    pub concentration_ratio: f64,
    /// Minimum packets in the window before concentration is evaluated
    pub min_sample_packets: u64,
}

/// Temporal anomaly configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemporalConfig {
    /// Whether temporal checks run at all
    pub enabled: bool,
    /// Hour (0-23) at which off-hours begin
    pub off_hours_start: u32,
    /// Hour (0-23) at which off-hours end
    pub off_hours_end: u32,
    /// Flag weekend traffic
    pub flag_weekends: bool,
    /// Offset applied to observation timestamps before the clock checks,
    /// so detection does not depend on the host timezone
    pub utc_offset_hours: i32,
}

/// Severity scoring and mitigation selection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MitigationConfig {
    /// Severity above which a block rule is installed
    pub block_severity_threshold: u8,
    /// Lowered block threshold for sources already in the attack registry
    pub repeat_offender_block_threshold: u8,
    /// Severity at which ALERT_SECURITY_TEAM is recommended
    pub alert_severity_threshold: u8,
    /// Advisory rate limit handed to collaborators (packets per second)
    pub default_rate_limit_pps: u32,
    /// Mitigation strategies enabled at startup
    pub enabled_strategies: Vec<String>,
}

/// Firewall controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallConfig {
    /// Backend selection: "auto", "iptables", "netsh", "pfctl", or "none"
    pub backend: String,
    /// Timeout for a single firewall command (seconds)
    pub command_timeout_seconds: u64,
    /// Interval between rule expiry sweeps (seconds)
    pub sweep_interval_seconds: u64,
    /// Prefix for backend rule handles so our rules are identifiable
    pub rule_prefix: String,
}

/// Monitoring coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Interval between correlation passes (seconds)
    pub correlation_interval_seconds: u64,
    /// Window scanned for concurrently active attack sources (seconds)
    pub correlation_window_seconds: u64,
    /// Distinct attack sources that constitute a coordinated attack
    pub coordinated_source_threshold: usize,
    /// Distinct amplification sources that constitute a campaign
    pub amplification_source_threshold: usize,
    /// Bounded alert history size
    pub alert_history_size: usize,
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Traffic counter store configuration
    pub store: StoreConfig,
    /// Detection thresholds
    pub detection: DetectionConfig,
    /// Geographic anomaly configuration
    pub geo: GeoConfig,
    /// Temporal anomaly configuration
    pub temporal: TemporalConfig,
    /// Scoring and mitigation configuration
    pub mitigation: MitigationConfig,
    /// Firewall controller configuration
    pub firewall: FirewallConfig,
    /// Monitoring coordinator configuration
    pub monitoring: MonitoringConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            store: StoreConfig {
                traffic_retention_seconds: 300,
                connection_retention_seconds: 3600,
                eviction_interval_seconds: 10,
            },
            detection: DetectionConfig::default(),
            geo: GeoConfig {
                enabled: true,
                high_risk_countries: Vec::new(),
                concentration_ratio: 0.7,
                min_sample_packets: 200,
            },
            temporal: TemporalConfig {
                enabled: true,
                off_hours_start: 22,
                off_hours_end: 6,
                flag_weekends: true,
                utc_offset_hours: 0,
            },
            mitigation: MitigationConfig {
                block_severity_threshold: 80,
                repeat_offender_block_threshold: 65,
                alert_severity_threshold: 85,
                default_rate_limit_pps: 100,
                enabled_strategies: vec![
                    "ip_blocking".to_string(),
                    "rate_limiting".to_string(),
                    "connection_limiting".to_string(),
                    "protocol_filtering".to_string(),
                    "traffic_shaping".to_string(),
                ],
            },
            firewall: FirewallConfig {
                backend: "auto".to_string(),
                command_timeout_seconds: 5,
                sweep_interval_seconds: 30,
                rule_prefix: "netdefense".to_string(),
            },
            monitoring: MonitoringConfig {
                correlation_interval_seconds: 15,
                correlation_window_seconds: 60,
                coordinated_source_threshold: 10,
                amplification_source_threshold: 5,
                alert_history_size: 5000,
            },
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            syn_flood_threshold: 1000,
            udp_flood_threshold: 2000,
            icmp_flood_threshold: 500,
            http_flood_threshold: 100,
            flood_window_seconds: 60,
            dns_amplification_threshold: 100,
            ntp_amplification_threshold: 50,
            memcached_amplification_threshold: 25,
            amplification_window_seconds: 60,
            port_scan_threshold: 10,
            port_scan_window_seconds: 60,
            brute_force_threshold: 5,
            brute_force_window_seconds: 300,
            auth_ports: vec![22, 23, 21, 25, 110, 143, 993, 995, 3389, 5432, 3306],
            suspicious_ports: vec![1337, 4444, 5554, 6667, 12345, 31337],
            unusual_protocols: vec!["gre".to_string(), "esp".to_string(), "sctp".to_string()],
            volume_window_seconds: 60,
        }
    }
}
