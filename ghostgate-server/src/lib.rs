//! GhostGate server.
//!
//! Serves the gate, sync and balance routes over a configured credit store
//! and runs the background sync, reconciliation and replay jobs.
//!
//! # Modules
//!
//! - [`config`] - Server configuration with environment variable expansion
//! - [`app`] - Store, gate, synchronizer and router construction
//! - [`jobs`] - Periodic background work
//! - [`shutdown`] - Signal-driven cancellation

pub mod app;
pub mod config;
pub mod jobs;
pub mod shutdown;

pub use config::ServerConfig;
