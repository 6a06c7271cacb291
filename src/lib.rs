//! Network Defense Service
//!
//! A traffic-pattern detector and mitigation controller: observations from a
//! capture layer are classified against known attack signatures, scored for
//! severity, and mitigated through a dynamic, OS-backed firewall.

pub mod api;
pub mod config;
pub mod core;
pub mod models;
pub mod utils;
