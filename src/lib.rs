//! Session Coordinator library crate. The `coordinatord` binary (see
//! `src/main.rs`) wires these modules into a running server; this file
//! only declares the module tree and re-exports the handful of types
//! the binary and integration tests need at the top level.

pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod models;
pub mod ports;
pub mod pr_flow;
pub mod sandbox_event_router;
pub mod secrets_store;
pub mod session_actor;
pub mod session_store;
pub mod ws;

pub use coordinator::Coordinator;
pub use error::CoordinatorError;

use std::sync::Arc;

/// Shared axum state: every handler reaches a session only through the
/// `Coordinator` registry (SPEC_FULL.md §4.1a), never by holding a
/// `SessionActor` reference directly.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}
