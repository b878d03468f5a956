//! Handover - a supervisor and reverse proxy for hitless worker restarts
//!
//! This library provides a single-process supervisor that:
//! - Spawns and supervises one fleet of short-lived worker instances per app
//! - Fronts each app with an external HTTP listener that proxies to the
//!   currently active instance
//! - Health-probes freshly spawned instances and promotes them to active
//!   only once they answer
//! - Drains a displaced instance's in-flight requests before stopping it,
//!   so a restart never drops traffic
//! - Allocates internal worker ports from a shared pool
//! - Exposes an admin RPC surface for start/stop/status operations

pub mod app;
pub mod config;
pub mod error;
pub mod instance;
pub mod ports;
pub mod probe;
pub mod proxy;
pub mod rpc;
pub mod supervisor;
