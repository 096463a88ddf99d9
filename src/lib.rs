//! Proxyfleet - lifecycle manager for local forward-proxy instances
//!
//! Fronts paid upstream proxy plans with locally bound proxy processes:
//! - Allocates local ports from a fixed partition per region class
//! - Spawns and kills proxy processes through an external helper
//! - Journals every instance to a whole-file JSON log
//! - Restores the running set from the journal after a crash or redeploy,
//!   healing missing regional siblings
//! - Buys plans from upstream resellers and exposes a small control API

pub mod allocator;
pub mod api;
pub mod config;
pub mod error;
pub mod frontdoor;
pub mod instance;
pub mod journal;
pub mod launcher;
pub mod orchestrator;
pub mod provider;
