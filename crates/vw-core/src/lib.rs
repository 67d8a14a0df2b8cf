//! Core of the view bridge
//!
//! This crate owns the asynchronous lifecycle of a view, buffers operations
//! issued before the view exists, exposes the command surface the host talks
//! to and routes named commands from an external transport onto the right
//! bridge instance.

pub mod bridge;
pub mod config;
pub mod diagnostics;
pub mod events;
pub mod lifecycle;
pub mod registry;
pub mod router;
pub mod view;

use thiserror::Error;

// Re-export commonly used types
pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use diagnostics::{CollectingSink, Diagnostic, DiagnosticKind, DiagnosticSink, TracingSink};
pub use events::{handler_from_fn, EventRelay, Handler, ListenerId, ListenerKind, ListenerRegistration, Outbound};
pub use lifecycle::{Readiness, Receipt, ViewFuture};
pub use registry::{BridgeRegistry, Locate, Lookup};
pub use router::{Dispatched, InboundCommand, InboundCommandRouter, RetryPolicy, RouteError, TargetLanes};
pub use view::{RenderTarget, SizedTarget, Specification, View, ViewError, ViewFactory};

/// Identifier a bridge instance is addressed by (element id / selector)
pub type TargetId = String;

/// Per-command failure, reported through the command's [`Receipt`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Apply(#[from] ViewError),

    #[error("view construction failed")]
    ConstructionFailed,

    #[error("view was superseded by a later render")]
    Superseded,

    #[error("operation was dropped before it reached a view")]
    Dropped,

    #[error("view replied with an unexpected result")]
    UnexpectedReply,
}
