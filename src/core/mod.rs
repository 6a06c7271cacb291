//! Core functionality for the network defense service.
//!
//! This module contains the core components of the service: the traffic
//! counter store, attack pattern detection, severity scoring and mitigation
//! selection, the firewall controller, the attack source registry, the
//! monitoring coordinator, and the defense engine that composes them.

pub mod detector;
pub mod engine;
pub mod firewall;
pub mod geo;
pub mod mitigation;
pub mod monitoring;
pub mod registry;
pub mod traffic;

pub use detector::{AttackPatternDetector, AttackType, Detection};
pub use engine::DefenseEngine;
pub use firewall::{FirewallBackend, FirewallController, FirewallError};
pub use geo::{GeoResolver, OctetHeuristicResolver};
pub use mitigation::{MitigationAction, MitigationStrategy};
pub use monitoring::{AlertHistory, AlertRecord, MonitoringCoordinator};
pub use registry::AttackSourceRegistry;
pub use traffic::TrafficCounterStore;
