//! Routing of named commands from an external transport
//!
//! A command names its target by id. The router looks the id up through a
//! [`Locate`] implementation, waiting a fixed interval between lookups while
//! the target has not been registered yet, and gives up after a bounded
//! number of attempts.

mod lanes;

pub use lanes::TargetLanes;

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use vw_data::ChangeSummary;

use crate::bridge::Bridge;
use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink, TracingSink};
use crate::lifecycle::Receipt;
use crate::registry::{Locate, Lookup};
use crate::{CommandError, TargetId};

/// A named command addressed to one bridge
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum InboundCommand {
    CallView {
        #[serde(rename = "targetId", alias = "id")]
        target_id: TargetId,
        #[serde(rename = "fn")]
        method: String,
        #[serde(default)]
        params: Vec<Value>,
        #[serde(default)]
        run: Option<bool>,
    },
    InsertData {
        #[serde(rename = "targetId", alias = "id")]
        target_id: TargetId,
        #[serde(rename = "tableName", alias = "name")]
        table: String,
        #[serde(default)]
        data_insert: Value,
        #[serde(default)]
        run: Option<bool>,
    },
    RemoveData {
        #[serde(rename = "targetId", alias = "id")]
        target_id: TargetId,
        #[serde(rename = "tableName", alias = "name")]
        table: String,
        #[serde(default)]
        data_remove: Option<Value>,
        #[serde(default)]
        run: Option<bool>,
    },
    ChangeData {
        #[serde(rename = "targetId", alias = "id")]
        target_id: TargetId,
        #[serde(rename = "tableName", alias = "name")]
        table: String,
        #[serde(default)]
        data_insert: Option<Value>,
        #[serde(default)]
        data_remove: Option<Value>,
        #[serde(default)]
        run: Option<bool>,
    },
}

impl InboundCommand {
    /// Parse a message body delivered under a separate command name
    pub fn from_named(name: &str, body: Value) -> Result<Self, RouteError> {
        let Value::Object(mut fields) = body else {
            return Err(RouteError::Malformed(format!("'{}' body must be an object", name)));
        };
        fields.insert("command".to_string(), Value::String(name.to_string()));
        serde_json::from_value(Value::Object(fields)).map_err(|e| RouteError::Malformed(e.to_string()))
    }

    pub fn target_id(&self) -> &str {
        match self {
            InboundCommand::CallView { target_id, .. }
            | InboundCommand::InsertData { target_id, .. }
            | InboundCommand::RemoveData { target_id, .. }
            | InboundCommand::ChangeData { target_id, .. } => target_id,
        }
    }

    /// Wire name of the command
    pub fn name(&self) -> &'static str {
        match self {
            InboundCommand::CallView { .. } => "callView",
            InboundCommand::InsertData { .. } => "insertData",
            InboundCommand::RemoveData { .. } => "removeData",
            InboundCommand::ChangeData { .. } => "changeData",
        }
    }

    /// Issue the command on `bridge`
    pub fn dispatch(self, bridge: &Bridge) -> Dispatched {
        match self {
            InboundCommand::CallView { method, params, run, .. } => {
                Dispatched::Value(bridge.call_view(&method, params, run))
            }
            InboundCommand::InsertData {
                table, data_insert, run, ..
            } => Dispatched::Applied(bridge.insert_data(&table, data_insert, run)),
            InboundCommand::RemoveData {
                table, data_remove, run, ..
            } => Dispatched::Applied(bridge.remove_data(&table, data_remove, run)),
            InboundCommand::ChangeData {
                table,
                data_insert,
                data_remove,
                run,
                ..
            } => Dispatched::Changed(bridge.change_data(&table, data_insert, data_remove, run)),
        }
    }
}

/// Receipt of a routed command
#[derive(Debug)]
pub enum Dispatched {
    Value(Receipt<Value>),
    Applied(Receipt<()>),
    Changed(Receipt<ChangeSummary>),
}

impl Dispatched {
    /// Wait for the command and render its result as JSON
    pub async fn outcome(self) -> Result<Value, CommandError> {
        match self {
            Dispatched::Value(receipt) => receipt.outcome().await,
            Dispatched::Applied(receipt) => receipt.outcome().await.map(|_| Value::Null),
            Dispatched::Changed(receipt) => receipt.outcome().await.map(|summary| {
                json!({
                    "inserted": summary.inserted,
                    "removed": summary.removed,
                })
            }),
        }
    }
}

/// Bounded lookup schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between lookups
    pub interval: Duration,
    /// Lookups before giving up; at least one is always made
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(50),
            max_attempts: 100,
        }
    }
}

/// Routing failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouteError {
    #[error("no view bridge registered as '{target}' after {attempts} lookups")]
    UnknownTarget { target: TargetId, attempts: u32 },

    #[error("'{target}' is a {kind}, not a view bridge")]
    InvalidTargetType { target: TargetId, kind: String },

    #[error("malformed command: {0}")]
    Malformed(String),

    #[error("view '{target}' is not usable: {source}")]
    NotReady {
        target: TargetId,
        #[source]
        source: CommandError,
    },
}

/// Routes inbound commands onto registered bridges
pub struct InboundCommandRouter {
    locator: Arc<dyn Locate>,
    policy: RetryPolicy,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl InboundCommandRouter {
    pub fn new(locator: Arc<dyn Locate>) -> Self {
        Self {
            locator,
            policy: RetryPolicy::default(),
            diagnostics: Arc::new(TracingSink),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Look a bridge up, waiting for it to be registered
    pub async fn find(&self, target_id: &str) -> Result<Arc<Bridge>, RouteError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.locator.locate(target_id) {
                Lookup::Found(bridge) => {
                    if attempts > 1 {
                        debug!(target_id, attempts, "located bridge");
                    }
                    return Ok(bridge);
                }
                Lookup::Invalid { kind } => {
                    let err = RouteError::InvalidTargetType {
                        target: target_id.to_string(),
                        kind,
                    };
                    self.report(target_id, DiagnosticKind::InvalidTargetType, &err);
                    return Err(err);
                }
                Lookup::NotFound if attempts >= max_attempts => {
                    let err = RouteError::UnknownTarget {
                        target: target_id.to_string(),
                        attempts,
                    };
                    self.report(target_id, DiagnosticKind::UnknownTarget, &err);
                    return Err(err);
                }
                Lookup::NotFound => {
                    trace!(target_id, attempts, "bridge not registered yet");
                    tokio::time::sleep(self.policy.interval).await;
                }
            }
        }
    }

    /// Look a bridge up and wait for its view to be constructed
    pub async fn find_ready(&self, target_id: &str) -> Result<Arc<Bridge>, RouteError> {
        let bridge = self.find(target_id).await?;
        bridge.ready().await.map_err(|source| RouteError::NotReady {
            target: target_id.to_string(),
            source,
        })?;
        Ok(bridge)
    }

    /// Locate the command's target and issue the command on it
    pub async fn route(&self, command: InboundCommand) -> Result<Dispatched, RouteError> {
        let bridge = self.find(command.target_id()).await?;
        debug!(target_id = %command.target_id(), command = command.name(), "routing command");
        Ok(command.dispatch(&bridge))
    }

    /// Route commands until the channel closes
    ///
    /// Commands for one target are routed in arrival order. Each target has
    /// its own lane, so a target still being looked up does not hold back
    /// commands for the others. Returns how many commands reached a bridge.
    pub async fn serve(self: Arc<Self>, mut commands: mpsc::UnboundedReceiver<InboundCommand>) -> usize {
        let mut lanes = TargetLanes::new();
        while let Some(command) = commands.recv().await {
            let target = command.target_id().to_string();
            let router = Arc::clone(&self);
            lanes.push(&target, command, move |queue| router.drain(queue));
        }
        lanes.close().await
    }

    /// Route one lane's commands in order
    pub async fn drain(self: Arc<Self>, mut commands: mpsc::UnboundedReceiver<InboundCommand>) -> usize {
        let mut routed = 0;
        while let Some(command) = commands.recv().await {
            // Failures are already reported as diagnostics
            if self.route(command).await.is_ok() {
                routed += 1;
            }
        }
        routed
    }

    fn report(&self, target_id: &str, kind: DiagnosticKind, err: &RouteError) {
        self.diagnostics
            .report(Diagnostic::new(target_id, kind, err.to_string()));
    }
}
