//! Diagnostic reporting
//!
//! Failures inside the bridge never propagate to the host; they are reported
//! here instead. Sinks are fire-and-forget and must not fail.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::TargetId;

/// Category of a reported failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiagnosticKind {
    /// The view factory rejected the specification
    ConstructionFailure,
    /// No bridge registered under the id within the lookup budget
    UnknownTarget,
    /// Something is registered under the id, but it is not a bridge
    InvalidTargetType,
    /// A command named a method the view does not have
    MethodNotFound,
    /// The view raised an error while applying an operation
    ApplyFailure,
    /// A command payload could not be converted
    InvalidPayload,
}

/// A single diagnostic report
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub target: TargetId,
    pub kind: DiagnosticKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Diagnostic {
    pub fn new(target: impl Into<TargetId>, kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Destination for diagnostics
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, diagnostic: Diagnostic);
}

/// Sink writing diagnostics to the tracing subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, diagnostic: Diagnostic) {
        match diagnostic.kind {
            DiagnosticKind::ConstructionFailure | DiagnosticKind::ApplyFailure => {
                tracing::error!(target_id = %diagnostic.target, kind = ?diagnostic.kind, "{}", diagnostic.message);
            }
            _ => {
                tracing::warn!(target_id = %diagnostic.target, kind = ?diagnostic.kind, "{}", diagnostic.message);
            }
        }
    }
}

/// Sink keeping every report in memory
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    reports: Arc<Mutex<Vec<Diagnostic>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All reports so far, oldest first
    pub fn reports(&self) -> Vec<Diagnostic> {
        self.reports.lock().clone()
    }

    /// Kinds of all reports so far, oldest first
    pub fn kinds(&self) -> Vec<DiagnosticKind> {
        self.reports.lock().iter().map(|d| d.kind).collect()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }
}

impl DiagnosticSink for CollectingSink {
    fn report(&self, diagnostic: Diagnostic) {
        self.reports.lock().push(diagnostic);
    }
}
