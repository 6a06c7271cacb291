//! Firewall rule lifecycle for the network defense service.
//!
//! The controller owns the rule table and is the only place rules are
//! created, expired, or deleted. Platform specifics live behind the
//! `FirewallBackend` trait: iptables/ip6tables on Linux, netsh advfirewall
//! on Windows, a pfctl table on macOS, and a log-only backend when no
//! adapter exists for the running platform. Argument construction never
//! leaks into detection logic.
//!
//! Rule state machine: Pending -> Active -> Expired/Deleted. A rule becomes
//! Active only after the backend accepted it; a backend failure on creation
//! leaves no rule behind. The expiry sweep retries backend failures on the
//! next pass, so an expired rule is eventually removed even when the
//! detection context that created it is long gone.

use std::collections::HashMap;
use std::net::IpAddr;
use std::process::Output;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::FirewallConfig;
use crate::utils::format_rule_handle;

/// Failures from the external firewall command.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("firewall command not found: {0}")]
    CommandNotFound(String),
    #[error("permission denied running {0} (are we root?)")]
    PermissionDenied(String),
    #[error("firewall command timed out after {0:?}")]
    Timeout(Duration),
    #[error("firewall command exited with {status}: {stderr}")]
    CommandFailed { status: i32, stderr: String },
    #[error("failed to run firewall command: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the firewall controller.
#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("invalid IP address or CIDR: {0}")]
    InvalidAddress(String),
    #[error("firewall backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("no firewall adapter for this platform")]
    UnsupportedPlatform,
}

/// An IP or CIDR block target, validated before any state mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTarget {
    pub network: IpAddr,
    pub prefix_len: u8,
}

impl BlockTarget {
    /// Parse `"203.0.113.5"` or `"203.0.113.0/24"` style targets.
    pub fn parse(s: &str) -> Result<Self, FirewallError> {
        let (addr_part, prefix_part) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };
        let network: IpAddr = addr_part
            .parse()
            .map_err(|_| FirewallError::InvalidAddress(s.to_string()))?;
        let max_prefix = if network.is_ipv4() { 32 } else { 128 };
        let prefix_len = match prefix_part {
            Some(p) => {
                let len: u8 = p
                    .parse()
                    .map_err(|_| FirewallError::InvalidAddress(s.to_string()))?;
                if len > max_prefix {
                    return Err(FirewallError::InvalidAddress(s.to_string()));
                }
                len
            }
            None => max_prefix,
        };
        Ok(Self { network, prefix_len })
    }

    pub fn from_ip(ip: IpAddr) -> Self {
        Self {
            network: ip,
            prefix_len: if ip.is_ipv4() { 32 } else { 128 },
        }
    }

    /// The wildcard target used by emergency rules.
    pub fn wildcard_v4() -> Self {
        Self {
            network: IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            prefix_len: 0,
        }
    }

    pub fn is_ipv4(&self) -> bool {
        self.network.is_ipv4()
    }

    /// Whether this target covers the given address.
    pub fn covers(&self, ip: &IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix_len as u32)
                };
                (u32::from(net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix_len as u32)
                };
                (u128::from(net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for BlockTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let host_prefix = if self.network.is_ipv4() { 32 } else { 128 };
        if self.prefix_len == host_prefix {
            write!(f, "{}", self.network)
        } else {
            write!(f, "{}/{}", self.network, self.prefix_len)
        }
    }
}

/// Rule direction/kind. Emergency rules are distinct from per-IP blocks so
/// `restore_connectivity` can remove them without touching the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleDirection {
    /// Inbound and outbound block pair for one source.
    BlockInOut,
    /// Wildcard emergency lockdown rule.
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleState {
    Pending,
    Active,
    Expired,
    Deleted,
}

/// One firewall rule owned by the controller.
#[derive(Debug, Clone, Serialize)]
pub struct FirewallRule {
    pub rule_id: Uuid,
    /// IP or CIDR rendered for the backend.
    pub target: String,
    pub reason: String,
    pub direction: RuleDirection,
    pub state: RuleState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Handle the backend rule is tagged with, for removal.
    pub backend_handle: String,
    #[serde(skip)]
    parsed_target: BlockTarget,
}

/// Platform adapter contract: install and remove a block for a CIDR target,
/// tagged with a handle the adapter can find again.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn install_block(&self, handle: &str, target: &BlockTarget) -> Result<(), BackendError>;
    async fn remove_block(&self, handle: &str, target: &BlockTarget) -> Result<(), BackendError>;
}

/// Run one firewall command with a timeout, mapping failures to the backend
/// error taxonomy.
async fn run_command(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<Output, BackendError> {
    debug!("Running firewall command: {} {}", program, args.join(" "));
    let result = tokio::time::timeout(timeout, Command::new(program).args(args).output()).await;
    let output = match result {
        Err(_) => return Err(BackendError::Timeout(timeout)),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(BackendError::CommandNotFound(program.to_string()));
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(BackendError::PermissionDenied(program.to_string()));
        }
        Ok(Err(e)) => return Err(BackendError::Io(e)),
        Ok(Ok(output)) => output,
    };
    if !output.status.success() {
        return Err(BackendError::CommandFailed {
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

/// Linux adapter: an inbound and outbound DROP pair in iptables (or
/// ip6tables for v6 targets), tagged with a comment so removal finds them.
pub struct IptablesBackend {
    timeout: Duration,
}

impl IptablesBackend {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn program(target: &BlockTarget) -> &'static str {
        if target.is_ipv4() {
            "iptables"
        } else {
            "ip6tables"
        }
    }

    fn rule_args(op: &str, chain: &str, flag: &str, handle: &str, target: &BlockTarget) -> Vec<String> {
        vec![
            op.to_string(),
            chain.to_string(),
            flag.to_string(),
            target.to_string(),
            "-j".to_string(),
            "DROP".to_string(),
            "-m".to_string(),
            "comment".to_string(),
            "--comment".to_string(),
            handle.to_string(),
        ]
    }
}

#[async_trait]
impl FirewallBackend for IptablesBackend {
    fn name(&self) -> &'static str {
        "iptables"
    }

    async fn install_block(&self, handle: &str, target: &BlockTarget) -> Result<(), BackendError> {
        let program = Self::program(target);
        run_command(
            program,
            &Self::rule_args("-I", "INPUT", "-s", handle, target),
            self.timeout,
        )
        .await?;
        run_command(
            program,
            &Self::rule_args("-I", "OUTPUT", "-d", handle, target),
            self.timeout,
        )
        .await?;
        Ok(())
    }

    async fn remove_block(&self, handle: &str, target: &BlockTarget) -> Result<(), BackendError> {
        let program = Self::program(target);
        run_command(
            program,
            &Self::rule_args("-D", "INPUT", "-s", handle, target),
            self.timeout,
        )
        .await?;
        run_command(
            program,
            &Self::rule_args("-D", "OUTPUT", "-d", handle, target),
            self.timeout,
        )
        .await?;
        Ok(())
    }
}

/// Windows adapter: an in/out rule pair in netsh advfirewall, named by the
/// handle.
pub struct NetshBackend {
    timeout: Duration,
}

impl NetshBackend {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl FirewallBackend for NetshBackend {
    fn name(&self) -> &'static str {
        "netsh"
    }

    async fn install_block(&self, handle: &str, target: &BlockTarget) -> Result<(), BackendError> {
        for dir in ["in", "out"] {
            let args = vec![
                "advfirewall".to_string(),
                "firewall".to_string(),
                "add".to_string(),
                "rule".to_string(),
                format!("name={}-{}", handle, dir),
                format!("dir={}", dir),
                "action=block".to_string(),
                format!("remoteip={}", target),
            ];
            run_command("netsh", &args, self.timeout).await?;
        }
        Ok(())
    }

    async fn remove_block(&self, handle: &str, _target: &BlockTarget) -> Result<(), BackendError> {
        for dir in ["in", "out"] {
            let args = vec![
                "advfirewall".to_string(),
                "firewall".to_string(),
                "delete".to_string(),
                "rule".to_string(),
                format!("name={}-{}", handle, dir),
            ];
            run_command("netsh", &args, self.timeout).await?;
        }
        Ok(())
    }
}

/// macOS adapter: addresses go into a pf table the ruleset is expected to
/// reference with a block rule.
pub struct PfctlBackend {
    timeout: Duration,
    table: String,
}

impl PfctlBackend {
    pub fn new(timeout: Duration, table: String) -> Self {
        Self { timeout, table }
    }
}

#[async_trait]
impl FirewallBackend for PfctlBackend {
    fn name(&self) -> &'static str {
        "pfctl"
    }

    async fn install_block(&self, _handle: &str, target: &BlockTarget) -> Result<(), BackendError> {
        let args = vec![
            "-t".to_string(),
            self.table.clone(),
            "-T".to_string(),
            "add".to_string(),
            target.to_string(),
        ];
        run_command("pfctl", &args, self.timeout).await?;
        Ok(())
    }

    async fn remove_block(&self, _handle: &str, target: &BlockTarget) -> Result<(), BackendError> {
        let args = vec![
            "-t".to_string(),
            self.table.clone(),
            "-T".to_string(),
            "delete".to_string(),
            target.to_string(),
        ];
        run_command("pfctl", &args, self.timeout).await?;
        Ok(())
    }
}

/// Log-only backend for platforms with no adapter and for dry runs. Always
/// succeeds; blocks are recorded in the rule table but enforce nothing.
pub struct NullBackend;

#[async_trait]
impl FirewallBackend for NullBackend {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn install_block(&self, handle: &str, target: &BlockTarget) -> Result<(), BackendError> {
        info!("[log-only] would block {} (handle {})", target, handle);
        Ok(())
    }

    async fn remove_block(&self, handle: &str, target: &BlockTarget) -> Result<(), BackendError> {
        info!("[log-only] would unblock {} (handle {})", target, handle);
        Ok(())
    }
}

/// Pick the backend for this configuration and platform. An unknown platform
/// degrades to the log-only backend rather than failing startup.
pub fn select_backend(config: &FirewallConfig) -> Arc<dyn FirewallBackend> {
    let timeout = Duration::from_secs(config.command_timeout_seconds);
    let selected = if config.backend == "auto" {
        if cfg!(target_os = "linux") {
            "iptables"
        } else if cfg!(target_os = "windows") {
            "netsh"
        } else if cfg!(target_os = "macos") {
            "pfctl"
        } else {
            warn!("No firewall adapter for this platform; actions will be log-only");
            "none"
        }
    } else {
        config.backend.as_str()
    };

    match selected {
        "iptables" => Arc::new(IptablesBackend::new(timeout)),
        "netsh" => Arc::new(NetshBackend::new(timeout)),
        "pfctl" => Arc::new(PfctlBackend::new(timeout, config.rule_prefix.clone())),
        "none" => Arc::new(NullBackend),
        other => {
            warn!("Unknown firewall backend '{}', using log-only", other);
            Arc::new(NullBackend)
        }
    }
}

/// Counters exposed through the statistics API.
#[derive(Debug, Default)]
struct ControllerStats {
    rules_created: AtomicU64,
    rules_deleted: AtomicU64,
    backend_failures: AtomicU64,
}

/// The firewall controller. All rule-table mutations go through its methods
/// behind one RwLock, serializing creation and deletion against the sweep.
pub struct FirewallController {
    backend: Arc<dyn FirewallBackend>,
    rules: RwLock<HashMap<Uuid, FirewallRule>>,
    rule_prefix: String,
    stats: ControllerStats,
}

impl FirewallController {
    pub fn new(backend: Arc<dyn FirewallBackend>, config: &FirewallConfig) -> Self {
        info!("Firewall controller using '{}' backend", backend.name());
        Self {
            backend,
            rules: RwLock::new(HashMap::new()),
            rule_prefix: config.rule_prefix.clone(),
            stats: ControllerStats::default(),
        }
    }

    /// Create and activate a block rule for an IP or CIDR.
    ///
    /// Validation happens before any state mutation; a backend failure
    /// leaves no rule behind and surfaces to the caller, who treats
    /// mitigation as best-effort.
    pub async fn create_block_rule(
        &self,
        target: &str,
        reason: &str,
        duration: Duration,
    ) -> Result<Uuid, FirewallError> {
        let parsed = BlockTarget::parse(target)?;
        self.install_rule(parsed, reason, duration, RuleDirection::BlockInOut)
            .await
    }

    async fn install_rule(
        &self,
        parsed: BlockTarget,
        reason: &str,
        duration: Duration,
        direction: RuleDirection,
    ) -> Result<Uuid, FirewallError> {
        let rule_id = Uuid::new_v4();
        let handle = format_rule_handle(&self.rule_prefix, &rule_id);
        let now = Utc::now();
        let mut rule = FirewallRule {
            rule_id,
            target: parsed.to_string(),
            reason: reason.to_string(),
            direction,
            state: RuleState::Pending,
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::hours(1)),
            backend_handle: handle.clone(),
            parsed_target: parsed,
        };

        if let Err(e) = self.backend.install_block(&handle, &parsed).await {
            self.stats.backend_failures.fetch_add(1, Ordering::Relaxed);
            error!("Failed to install block for {}: {}", parsed, e);
            return Err(FirewallError::Backend(e));
        }

        rule.state = RuleState::Active;
        info!(
            "Blocked {} for {:?} ({}), rule {}",
            parsed, duration, reason, rule_id
        );
        self.rules.write().await.insert(rule_id, rule);
        self.stats.rules_created.fetch_add(1, Ordering::Relaxed);
        Ok(rule_id)
    }

    /// Delete a rule by id. Idempotent: deleting an unknown or already
    /// deleted rule is a no-op with no statistics increment.
    pub async fn delete_rule(&self, rule_id: Uuid) -> Result<(), FirewallError> {
        let mut rules = self.rules.write().await;
        let Some(mut rule) = rules.remove(&rule_id) else {
            return Ok(());
        };

        if let Err(e) = self
            .backend
            .remove_block(&rule.backend_handle, &rule.parsed_target)
            .await
        {
            // Keep the rule so the sweep retries the backend removal.
            self.stats.backend_failures.fetch_add(1, Ordering::Relaxed);
            rule.state = RuleState::Expired;
            rule.expires_at = Utc::now();
            rules.insert(rule_id, rule);
            return Err(FirewallError::Backend(e));
        }

        rule.state = RuleState::Deleted;
        self.stats.rules_deleted.fetch_add(1, Ordering::Relaxed);
        debug!("Deleted rule {} for {}", rule_id, rule.target);
        Ok(())
    }

    /// Delete every rule whose target covers the given address.
    /// Returns the number of rules removed. A backend fault on one rule
    /// does not strand the rest: the loop keeps going and the failed rule
    /// stays Expired for the expiry sweep to retry.
    pub async fn unblock_ip(&self, ip: &IpAddr) -> Result<usize, FirewallError> {
        let matching: Vec<Uuid> = {
            let rules = self.rules.read().await;
            rules
                .values()
                .filter(|r| r.direction == RuleDirection::BlockInOut && r.parsed_target.covers(ip))
                .map(|r| r.rule_id)
                .collect()
        };
        self.delete_all(matching).await
    }

    /// Delete a batch of rules, continuing past backend failures. The
    /// successful deletions are counted in `rules_deleted`; the first
    /// failure is surfaced after every rule has been attempted.
    async fn delete_all(&self, rule_ids: Vec<Uuid>) -> Result<usize, FirewallError> {
        let mut removed = 0;
        let mut first_error = None;
        for rule_id in rule_ids {
            match self.delete_rule(rule_id).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!("Deletion of rule {} failed, sweep will retry: {}", rule_id, e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    /// Extend the expiry of the active rule covering `ip` when `duration`
    /// outlasts its remaining lifetime. The backend block is already in
    /// place, so this only moves the expiry; it never installs a duplicate
    /// backend rule. Returns the rule id when an extension happened.
    pub async fn extend_block(&self, ip: &IpAddr, duration: Duration) -> Option<Uuid> {
        let now = Utc::now();
        let new_expiry =
            now + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::hours(1));
        let mut rules = self.rules.write().await;
        let rule = rules.values_mut().find(|r| {
            r.state == RuleState::Active && r.expires_at > now && r.parsed_target.covers(ip)
        })?;
        if rule.expires_at >= new_expiry {
            return None;
        }
        info!("Extended block of {} until {}", rule.target, new_expiry);
        rule.expires_at = new_expiry;
        Some(rule.rule_id)
    }

    /// Remove every rule that has passed its expiry. Backend failures leave
    /// the rule marked Expired for the next sweep; each rule is eventually
    /// deleted. Returns the number of rules removed this pass.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<Uuid> = {
            let mut rules = self.rules.write().await;
            rules
                .values_mut()
                .filter(|r| r.expires_at <= now)
                .map(|r| {
                    r.state = RuleState::Expired;
                    r.rule_id
                })
                .collect()
        };

        let mut removed = 0;
        for rule_id in expired {
            match self.delete_rule(rule_id).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Expiry of rule {} failed, will retry: {}", rule_id, e),
            }
        }
        if removed > 0 {
            info!("Expired {} firewall rules", removed);
        }
        removed
    }

    /// Install the wildcard emergency rule. Reversible via
    /// `restore_connectivity`.
    pub async fn emergency_block_all(&self, duration: Duration) -> Result<Uuid, FirewallError> {
        warn!("EMERGENCY: blocking all traffic for {:?}", duration);
        self.install_rule(
            BlockTarget::wildcard_v4(),
            "emergency lockdown",
            duration,
            RuleDirection::Emergency,
        )
        .await
    }

    /// Delete only emergency-tagged rules, leaving per-IP blocks in place.
    /// Continues past backend failures like `unblock_ip`.
    pub async fn restore_connectivity(&self) -> Result<usize, FirewallError> {
        let emergency: Vec<Uuid> = {
            let rules = self.rules.read().await;
            rules
                .values()
                .filter(|r| r.direction == RuleDirection::Emergency)
                .map(|r| r.rule_id)
                .collect()
        };
        let removed = self.delete_all(emergency).await?;
        info!("Restored connectivity, removed {} emergency rules", removed);
        Ok(removed)
    }

    /// Whether an active, unexpired block already covers this address.
    pub async fn has_active_rule_for(&self, ip: &IpAddr) -> bool {
        let now = Utc::now();
        self.rules.read().await.values().any(|r| {
            r.state == RuleState::Active && r.expires_at > now && r.parsed_target.covers(ip)
        })
    }

    /// Snapshot of all rules currently in the table.
    pub async fn active_rules(&self) -> Vec<FirewallRule> {
        self.rules.read().await.values().cloned().collect()
    }

    pub fn rules_created(&self) -> u64 {
        self.stats.rules_created.load(Ordering::Relaxed)
    }

    pub fn rules_deleted(&self) -> u64 {
        self.stats.rules_deleted.load(Ordering::Relaxed)
    }

    pub fn backend_failures(&self) -> u64 {
        self.stats.backend_failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FirewallConfig {
        FirewallConfig {
            backend: "none".to_string(),
            command_timeout_seconds: 5,
            sweep_interval_seconds: 30,
            rule_prefix: "netdefense".to_string(),
        }
    }

    fn null_controller() -> FirewallController {
        FirewallController::new(Arc::new(NullBackend), &config())
    }

    #[test]
    fn test_target_parsing() {
        let t = BlockTarget::parse("203.0.113.5").unwrap();
        assert_eq!(t.prefix_len, 32);
        assert_eq!(t.to_string(), "203.0.113.5");

        let t = BlockTarget::parse("203.0.113.0/24").unwrap();
        assert_eq!(t.prefix_len, 24);
        assert_eq!(t.to_string(), "203.0.113.0/24");

        assert!(matches!(
            BlockTarget::parse("not-an-ip"),
            Err(FirewallError::InvalidAddress(_))
        ));
        assert!(matches!(
            BlockTarget::parse("203.0.113.0/33"),
            Err(FirewallError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_target_covers() {
        let net = BlockTarget::parse("203.0.113.0/24").unwrap();
        assert!(net.covers(&"203.0.113.200".parse().unwrap()));
        assert!(!net.covers(&"203.0.114.1".parse().unwrap()));

        let host = BlockTarget::parse("203.0.113.5").unwrap();
        assert!(host.covers(&"203.0.113.5".parse().unwrap()));
        assert!(!host.covers(&"203.0.113.6".parse().unwrap()));

        assert!(BlockTarget::wildcard_v4().covers(&"8.8.8.8".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_rule_active_after_creation_and_gone_after_expiry_sweep() {
        let controller = null_controller();
        let ip: IpAddr = "203.0.113.5".parse().unwrap();

        let rule_id = controller
            .create_block_rule("203.0.113.5", "test", Duration::from_secs(0))
            .await
            .unwrap();
        assert!(controller.has_active_rule_for(&ip).await || {
            // A zero duration may already be past expiry; the table still
            // holds the rule until the sweep.
            controller.active_rules().await.iter().any(|r| r.rule_id == rule_id)
        });

        let removed = controller.sweep_expired().await;
        assert_eq!(removed, 1);
        assert!(controller.active_rules().await.is_empty());
        assert!(!controller.has_active_rule_for(&ip).await);
    }

    #[tokio::test]
    async fn test_invalid_address_creates_nothing() {
        let controller = null_controller();

        let err = controller
            .create_block_rule("not-an-ip", "test", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, FirewallError::InvalidAddress(_)));
        assert!(controller.active_rules().await.is_empty());
        assert_eq!(controller.rules_created(), 0);
        assert_eq!(controller.backend_failures(), 0);
    }

    #[tokio::test]
    async fn test_delete_rule_is_idempotent() {
        let controller = null_controller();
        let rule_id = controller
            .create_block_rule("203.0.113.5", "test", Duration::from_secs(60))
            .await
            .unwrap();

        controller.delete_rule(rule_id).await.unwrap();
        assert_eq!(controller.rules_deleted(), 1);

        // Second delete: no error, no duplicate increment.
        controller.delete_rule(rule_id).await.unwrap();
        assert_eq!(controller.rules_deleted(), 1);
    }

    #[tokio::test]
    async fn test_backend_failure_on_create_leaves_no_rule() {
        let mut backend = MockFirewallBackend::new();
        backend.expect_name().return_const("mock");
        backend.expect_install_block().returning(|_, _| {
            Err(BackendError::CommandNotFound("iptables".to_string()))
        });
        let controller = FirewallController::new(Arc::new(backend), &config());

        let err = controller
            .create_block_rule("203.0.113.5", "test", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, FirewallError::Backend(_)));
        assert!(controller.active_rules().await.is_empty());
        assert_eq!(controller.rules_created(), 0);
        assert_eq!(controller.backend_failures(), 1);
    }

    #[tokio::test]
    async fn test_sweep_retries_backend_failures() {
        let mut backend = MockFirewallBackend::new();
        backend.expect_name().return_const("mock");
        backend.expect_install_block().returning(|_, _| Ok(()));
        // First removal attempt fails, second succeeds.
        let mut attempts = 0;
        backend.expect_remove_block().returning(move |_, _| {
            attempts += 1;
            if attempts == 1 {
                Err(BackendError::Timeout(Duration::from_secs(5)))
            } else {
                Ok(())
            }
        });
        let controller = FirewallController::new(Arc::new(backend), &config());

        controller
            .create_block_rule("203.0.113.5", "test", Duration::from_secs(0))
            .await
            .unwrap();

        // First sweep fails at the backend; the rule stays for retry.
        assert_eq!(controller.sweep_expired().await, 0);
        assert_eq!(controller.active_rules().await.len(), 1);

        // Second sweep completes the deletion.
        assert_eq!(controller.sweep_expired().await, 1);
        assert!(controller.active_rules().await.is_empty());
    }

    #[tokio::test]
    async fn test_emergency_rules_distinct_and_reversible() {
        let controller = null_controller();
        let ip: IpAddr = "203.0.113.5".parse().unwrap();

        controller
            .create_block_rule("203.0.113.5", "attack", Duration::from_secs(3600))
            .await
            .unwrap();
        controller
            .emergency_block_all(Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(controller.active_rules().await.len(), 2);

        let removed = controller.restore_connectivity().await.unwrap();
        assert_eq!(removed, 1);

        // The per-IP block survives the restore.
        let remaining = controller.active_rules().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].direction, RuleDirection::BlockInOut);
        assert!(controller.has_active_rule_for(&ip).await);
    }

    #[tokio::test]
    async fn test_extend_block_only_when_longer() {
        let controller = null_controller();
        let ip: IpAddr = "203.0.113.5".parse().unwrap();

        let rule_id = controller
            .create_block_rule("203.0.113.5", "test", Duration::from_secs(3600))
            .await
            .unwrap();

        // An equal-or-shorter block dedups; the existing rule stands.
        assert!(controller
            .extend_block(&ip, Duration::from_secs(600))
            .await
            .is_none());

        // A longer block moves the expiry without a second backend install.
        let extended = controller
            .extend_block(&ip, Duration::from_secs(24 * 3600))
            .await;
        assert_eq!(extended, Some(rule_id));

        let rules = controller.active_rules().await;
        assert_eq!(rules.len(), 1);
        assert!((rules[0].expires_at - rules[0].created_at).num_hours() >= 23);
        assert_eq!(controller.rules_created(), 1);
    }

    #[tokio::test]
    async fn test_unblock_continues_past_backend_failures() {
        let mut backend = MockFirewallBackend::new();
        backend.expect_name().return_const("mock");
        backend.expect_install_block().returning(|_, _| Ok(()));
        // The first removal attempt fails, all later ones succeed.
        let mut calls = 0;
        backend.expect_remove_block().returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Err(BackendError::Timeout(Duration::from_secs(5)))
            } else {
                Ok(())
            }
        });
        let controller = FirewallController::new(Arc::new(backend), &config());
        let ip: IpAddr = "203.0.113.5".parse().unwrap();

        controller
            .create_block_rule("203.0.113.5", "host block", Duration::from_secs(3600))
            .await
            .unwrap();
        controller
            .create_block_rule("203.0.113.0/24", "net block", Duration::from_secs(3600))
            .await
            .unwrap();

        // One covering rule hits the backend fault; the other is still
        // deleted in the same pass.
        let err = controller.unblock_ip(&ip).await.unwrap_err();
        assert!(matches!(err, FirewallError::Backend(_)));
        assert_eq!(controller.rules_deleted(), 1);
        assert_eq!(controller.active_rules().await.len(), 1);

        // The stranded rule is marked expired and the sweep finishes it.
        assert_eq!(controller.sweep_expired().await, 1);
        assert!(controller.active_rules().await.is_empty());
    }

    #[tokio::test]
    async fn test_unblock_ip_removes_covering_rules() {
        let controller = null_controller();
        let ip: IpAddr = "203.0.113.5".parse().unwrap();

        controller
            .create_block_rule("203.0.113.5", "host block", Duration::from_secs(3600))
            .await
            .unwrap();
        controller
            .create_block_rule("203.0.113.0/24", "net block", Duration::from_secs(3600))
            .await
            .unwrap();
        controller
            .create_block_rule("198.51.100.1", "other", Duration::from_secs(3600))
            .await
            .unwrap();

        let removed = controller.unblock_ip(&ip).await.unwrap();
        assert_eq!(removed, 2);
        assert!(!controller.has_active_rule_for(&ip).await);
        assert_eq!(controller.active_rules().await.len(), 1);
    }
}
