#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! HTTP surface of the GhostGate credit gate.
//!
//! # Modules
//!
//! - [`constants`] - `x-ghost-*` header names, routes, default gateway URL
//! - [`error`] - The JSON error body and client error type
//! - [`types`] - Sync and balance bodies shared by both sides
//! - `server` - Axum routes with JSON error mapping (feature: `server`)
//! - `client` - Signing reqwest client (feature: `client`)

pub mod constants;
pub mod error;
pub mod types;

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "server")]
pub mod server;

#[cfg(feature = "client")]
pub use client::{GateCall, GateClient};
pub use error::{ErrorBody, HttpError};
#[cfg(feature = "server")]
pub use server::{AppState, router};
