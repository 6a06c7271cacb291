//! Severity scoring and mitigation selection for the network defense
//! service.
//!
//! Scoring and selection are pure functions of the detection, the source's
//! registry membership, its recent packet volume, and the enabled strategy
//! set. There is no hidden state here, which keeps both testable in
//! isolation from the store and the firewall.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::detector::{AttackType, Detection};
use crate::models::MitigationConfig;

/// Action codes recommended to collaborators. Serialized exactly as the
/// enumerated wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MitigationAction {
    BlockSourceIp,
    RateLimitSource,
    LimitConnections,
    FilterProtocol,
    ShapeTraffic,
    LogAttempt,
    AlertSecurityTeam,
}

/// Independent mitigation capabilities. Disabling a strategy suppresses its
/// action without changing the selector's control flow, so new strategies
/// extend this enum rather than the selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MitigationStrategy {
    IpBlocking,
    RateLimiting,
    ConnectionLimiting,
    ProtocolFiltering,
    TrafficShaping,
}

impl MitigationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MitigationStrategy::IpBlocking => "ip_blocking",
            MitigationStrategy::RateLimiting => "rate_limiting",
            MitigationStrategy::ConnectionLimiting => "connection_limiting",
            MitigationStrategy::ProtocolFiltering => "protocol_filtering",
            MitigationStrategy::TrafficShaping => "traffic_shaping",
        }
    }
}

impl FromStr for MitigationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ip_blocking" => Ok(MitigationStrategy::IpBlocking),
            "rate_limiting" => Ok(MitigationStrategy::RateLimiting),
            "connection_limiting" => Ok(MitigationStrategy::ConnectionLimiting),
            "protocol_filtering" => Ok(MitigationStrategy::ProtocolFiltering),
            "traffic_shaping" => Ok(MitigationStrategy::TrafficShaping),
            other => Err(format!("unknown mitigation strategy: {}", other)),
        }
    }
}

/// Base severity per attack class. Amplification scores highest because the
/// reflected volume hitting the victim dwarfs what this sensor sees.
pub fn base_severity(attack: AttackType) -> u8 {
    match attack {
        AttackType::SynFlood => 85,
        AttackType::UdpFlood => 80,
        AttackType::IcmpFlood => 75,
        AttackType::HttpFlood => 70,
        AttackType::DnsAmplification => 90,
        AttackType::NtpAmplification => 92,
        AttackType::MemcachedAmplification => 95,
        AttackType::PortScan => 80,
        AttackType::BruteForce => 90,
        AttackType::SuspiciousPort => 65,
        AttackType::UnusualProtocol => 50,
        AttackType::GeoAnomaly => 60,
        AttackType::TemporalAnomaly => 30,
    }
}

/// Compute the 0-100 severity for a detection.
///
/// Starts from the maximum base severity over the triggered types, adds +20
/// for a known attack source and a volume escalation from recent packet
/// counts, capped at 100.
pub fn score_severity(detection: &Detection, known_attacker: bool, recent_packets: u64) -> u8 {
    let base = detection
        .attack_types
        .iter()
        .map(|t| base_severity(*t))
        .max()
        .unwrap_or(0);

    let mut score = base as u32;
    if known_attacker {
        score += 20;
    }
    score += match recent_packets {
        p if p > 10_000 => 30,
        p if p > 5_000 => 20,
        p if p > 1_000 => 10,
        _ => 0,
    };
    score.min(100) as u8
}

/// Block duration scaled by severity.
pub fn block_duration(severity: u8) -> Duration {
    match severity {
        s if s >= 90 => Duration::from_secs(24 * 3600),
        s if s >= 70 => Duration::from_secs(3600),
        s if s >= 50 => Duration::from_secs(30 * 60),
        _ => Duration::from_secs(10 * 60),
    }
}

/// The selector's output: action codes plus the parameters collaborators
/// need to carry them out.
#[derive(Debug, Clone)]
pub struct MitigationPlan {
    pub actions: Vec<MitigationAction>,
    /// Present when `BLOCK_SOURCE_IP` was selected.
    pub block_duration: Option<Duration>,
    /// Advisory rate limit; halved for known attack sources.
    pub rate_limit_pps: u32,
}

impl MitigationPlan {
    pub fn includes(&self, action: MitigationAction) -> bool {
        self.actions.contains(&action)
    }
}

/// Select mitigation actions for a scored detection.
///
/// Every triggered verdict gets rate limiting and connection limiting;
/// blocks apply above the block threshold (lowered for known attackers);
/// protocol filtering when the attack is protocol-specific; traffic shaping
/// for mid-severity verdicts. Disabled strategies drop their action codes.
pub fn select_actions(
    detection: &Detection,
    severity: u8,
    known_attacker: bool,
    strategies: &HashSet<MitigationStrategy>,
    config: &MitigationConfig,
) -> MitigationPlan {
    let mut actions = vec![MitigationAction::LogAttempt];

    let block_threshold = if known_attacker {
        config.repeat_offender_block_threshold
    } else {
        config.block_severity_threshold
    };

    let mut duration = None;
    if severity > block_threshold && strategies.contains(&MitigationStrategy::IpBlocking) {
        actions.push(MitigationAction::BlockSourceIp);
        duration = Some(block_duration(severity));
    }
    if strategies.contains(&MitigationStrategy::RateLimiting) {
        actions.push(MitigationAction::RateLimitSource);
    }
    if strategies.contains(&MitigationStrategy::ConnectionLimiting) {
        actions.push(MitigationAction::LimitConnections);
    }
    if strategies.contains(&MitigationStrategy::ProtocolFiltering)
        && detection.attack_types.iter().any(|t| t.is_protocol_specific())
    {
        actions.push(MitigationAction::FilterProtocol);
    }
    if strategies.contains(&MitigationStrategy::TrafficShaping)
        && (40..=block_threshold).contains(&severity)
    {
        actions.push(MitigationAction::ShapeTraffic);
    }
    if severity >= config.alert_severity_threshold {
        actions.push(MitigationAction::AlertSecurityTeam);
    }

    let rate_limit_pps = if known_attacker {
        config.default_rate_limit_pps / 2
    } else {
        config.default_rate_limit_pps
    };

    MitigationPlan {
        actions,
        block_duration: duration,
        rate_limit_pps,
    }
}
