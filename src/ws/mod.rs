//! WebSocket layer: wire protocol plus the per-socket task shape from
//! SPEC_FULL.md §4.2a.

pub mod handler;
pub mod protocol;

use tokio::sync::mpsc;

use crate::ws::protocol::SandboxCommand;

/// Reason a sandbox socket task is told to close by the actor, rather
/// than by its own read loop — e.g. a newer sandbox connection
/// superseded it (spec.md §4.2 "closes the previous sandbox socket").
#[derive(Debug, Clone, Copy)]
pub enum CloseReason {
    Superseded,
    Shutdown,
}

/// What the actor holds to reach a connected sandbox socket task.
pub struct SandboxSocketHandle {
    pub cmd_tx: mpsc::Sender<SandboxCommand>,
    pub close_tx: tokio::sync::oneshot::Sender<CloseReason>,
}
