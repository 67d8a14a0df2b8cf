//! The view seam: what the bridge drives, and how views get built

pub mod memory;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use vw_data::{ChangeSummary, Changeset, Predicate, Row};

use crate::events::ListenerRegistration;
use crate::TargetId;

pub use memory::{MemoryView, MemoryViewFactory, ViewProbe};

/// Declarative description of a visualization plus its rendering options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Specification {
    pub chart_spec: Value,

    #[serde(default)]
    pub embed_options: Value,
}

impl Specification {
    pub fn new(chart_spec: Value) -> Self {
        Self {
            chart_spec,
            embed_options: Value::Null,
        }
    }
}

/// Errors raised by a view, during construction or while applying operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ViewError {
    #[error("malformed specification: {0}")]
    MalformedSpec(String),

    #[error("view has no method '{0}'")]
    MethodNotFound(String),

    #[error("unrecognized data set '{0}'")]
    UnknownTable(String),

    #[error("unrecognized signal name '{0}'")]
    UnknownSignal(String),

    #[error("invalid arguments to '{method}': {message}")]
    InvalidArguments { method: String, message: String },

    #[error("render failed: {0}")]
    Render(String),
}

/// A realized, mutable rendering engine instance
///
/// Only the bridge's applier task ever holds one, so implementations need
/// `Send` but never `Sync`.
#[async_trait]
pub trait View: Send {
    /// Invoke a named method with positional parameters
    fn call(&mut self, method: &str, params: &[Value]) -> Result<Value, ViewError>;

    /// Append rows to a named table
    fn insert(&mut self, table: &str, rows: Vec<Row>) -> Result<(), ViewError>;

    /// Remove the rows of a named table selected by `predicate`
    fn remove(&mut self, table: &str, predicate: &Predicate) -> Result<usize, ViewError>;

    /// Apply a changeset to a named table as one batch
    fn change(&mut self, table: &str, changeset: &Changeset) -> Result<ChangeSummary, ViewError>;

    fn add_event_listener(&mut self, registration: ListenerRegistration) -> Result<(), ViewError>;

    fn add_signal_listener(&mut self, registration: ListenerRegistration) -> Result<(), ViewError>;

    /// Drop a registration previously added; returns whether it was present
    fn remove_listener(&mut self, registration: &ListenerRegistration) -> bool;

    /// Current value of a signal
    fn signal(&self, name: &str) -> Result<Value, ViewError>;

    /// Current rows of a table
    fn data(&self, table: &str) -> Result<Vec<Row>, ViewError>;

    /// Evaluate pending changes and re-render
    async fn run(&mut self) -> Result<(), ViewError>;
}

/// Builds views from specifications
#[async_trait]
pub trait ViewFactory: Send + Sync {
    async fn construct(&self, target: &TargetId, spec: &Specification) -> Result<Box<dyn View>, ViewError>;
}

/// The element a view renders into
pub trait RenderTarget: Send + Sync {
    /// Release externally imposed width/height so the view sizes itself
    fn clear_sizing(&self);
}

/// Render target that only tracks its imposed size
#[derive(Debug, Default)]
pub struct SizedTarget {
    size: Mutex<Option<(u32, u32)>>,
}

impl SizedTarget {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: Mutex::new(Some((width, height))),
        }
    }

    /// Imposed size, if it has not been cleared yet
    pub fn size(&self) -> Option<(u32, u32)> {
        *self.size.lock()
    }
}

impl RenderTarget for SizedTarget {
    fn clear_sizing(&self) {
        if let Some((width, height)) = self.size.lock().take() {
            tracing::debug!(width, height, "cleared render target sizing");
        }
    }
}
