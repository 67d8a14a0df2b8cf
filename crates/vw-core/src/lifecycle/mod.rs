//! View lifecycle: one-shot construction, buffered replay, ordered apply
//!
//! Every render starts a new *generation*. A generation owns a
//! [`PendingOpBuffer`] and a [`ViewFuture`]; once its view is constructed a
//! single applier task drains the buffer and then applies operations one at
//! a time, so application order always equals submission order.

mod buffer;
mod operation;

pub use buffer::{Closure, Enqueued, PendingOpBuffer};
pub use operation::{OpKind, Operation, Receipt, Reply};

pub(crate) use operation::{reply_changed, reply_flag, reply_listener, reply_rows, reply_unit, reply_value};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink};
use crate::events::ListenerRegistration;
use crate::view::{RenderTarget, Specification, View, ViewError, ViewFactory};
use crate::{CommandError, TargetId};

/// Construction state of a generation's view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Not rendered yet, or still constructing
    Pending,
    /// Constructed; operations are being applied
    Ready,
    /// Construction failed; nothing will ever be applied
    Failed(String),
    /// Superseded by a later render and torn down
    Retired,
}

/// Handle on the one-shot construction of a view
///
/// Resolves at most once. Cloning is cheap; every clone observes the same
/// outcome.
#[derive(Debug, Clone)]
pub struct ViewFuture {
    generation: u64,
    readiness: watch::Receiver<Readiness>,
}

impl ViewFuture {
    /// Render generation this future belongs to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current state without waiting
    pub fn readiness(&self) -> Readiness {
        self.readiness.borrow().clone()
    }

    /// Wait until construction settles
    pub async fn wait(&self) -> Result<(), CommandError> {
        let mut readiness = self.readiness.clone();
        let settled = readiness
            .wait_for(|state| *state != Readiness::Pending)
            .await
            .map(|state| state.clone());

        match settled {
            Ok(Readiness::Ready) => Ok(()),
            Ok(Readiness::Failed(_)) => Err(CommandError::ConstructionFailed),
            Ok(Readiness::Retired) | Ok(Readiness::Pending) => Err(CommandError::Superseded),
            // Sender gone while still pending: the generation was dropped unstarted
            Err(_) => Err(CommandError::Superseded),
        }
    }

    /// Wait until the generation will apply nothing more
    ///
    /// Resolves once construction failed, or once the generation was retired
    /// and every operation already handed to its view has been applied.
    pub async fn finished(&self) {
        let mut readiness = self.readiness.clone();
        let _ = readiness
            .wait_for(|state| matches!(state, Readiness::Failed(_) | Readiness::Retired))
            .await;
    }
}

/// Collaborators a generation needs to construct and drive its view
#[derive(Clone)]
pub(crate) struct LifecycleContext {
    pub target_id: TargetId,
    pub factory: Arc<dyn ViewFactory>,
    pub target: Arc<dyn RenderTarget>,
    pub diagnostics: Arc<dyn DiagnosticSink>,
}

/// One render cycle of a bridge
pub(crate) struct Generation {
    pub number: u64,
    pub buffer: PendingOpBuffer,
    readiness: watch::Sender<Readiness>,
    started: AtomicBool,
}

impl Generation {
    pub fn new(number: u64) -> Arc<Self> {
        let (readiness, _) = watch::channel(Readiness::Pending);
        Arc::new(Self {
            number,
            buffer: PendingOpBuffer::new(),
            readiness,
            started: AtomicBool::new(false),
        })
    }

    pub fn future(&self) -> ViewFuture {
        ViewFuture {
            generation: self.number,
            readiness: self.readiness.subscribe(),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Begin constructing the view; a generation starts at most once
    pub fn start(self: &Arc<Self>, context: LifecycleContext, spec: Specification) -> bool {
        if self.started.swap(true, Ordering::AcqRel) {
            return false;
        }
        tokio::spawn(drive(Arc::clone(self), context, spec));
        true
    }

    /// Stop accepting operations and let the applier wind down
    pub fn retire(&self) {
        let dropped = self.buffer.close(Closure::Superseded);
        if dropped > 0 {
            debug!(generation = self.number, dropped, "retired generation with buffered operations");
        }
        if !self.is_started() {
            self.readiness.send_replace(Readiness::Retired);
        }
    }
}

async fn drive(generation: Arc<Generation>, context: LifecycleContext, spec: Specification) {
    let number = generation.number;
    debug!(target_id = %context.target_id, generation = number, "constructing view");

    let view = match context.factory.construct(&context.target_id, &spec).await {
        Ok(view) => view,
        Err(err) => {
            let dropped = generation.buffer.close(Closure::ConstructionFailed);
            context.diagnostics.report(Diagnostic::new(
                context.target_id.clone(),
                DiagnosticKind::ConstructionFailure,
                err.to_string(),
            ));
            debug!(target_id = %context.target_id, generation = number, dropped, "dropped operations for failed view");
            generation.readiness.send_replace(Readiness::Failed(err.to_string()));
            return;
        }
    };

    if generation.buffer.is_closed() {
        // Superseded while constructing; the render target belongs to a newer view
        debug!(target_id = %context.target_id, generation = number, "discarding superseded view");
        generation.readiness.send_replace(Readiness::Retired);
        return;
    }

    context.target.clear_sizing();

    let (applier_tx, mut applier_rx) = mpsc::unbounded_channel();
    match generation.buffer.drain_into(applier_tx) {
        Ok(replayed) => {
            info!(target_id = %context.target_id, generation = number, replayed, "view ready");
        }
        Err(_) => {
            generation.readiness.send_replace(Readiness::Retired);
            return;
        }
    }
    generation.readiness.send_replace(Readiness::Ready);

    let mut applier = Applier {
        view,
        target_id: context.target_id.clone(),
        diagnostics: Arc::clone(&context.diagnostics),
        listeners: Vec::new(),
    };
    while let Some(op) = applier_rx.recv().await {
        applier.apply(op).await;
    }

    applier.teardown();
    generation.readiness.send_replace(Readiness::Retired);
}

/// Sole owner of a constructed view
struct Applier {
    view: Box<dyn View>,
    target_id: TargetId,
    diagnostics: Arc<dyn DiagnosticSink>,
    listeners: Vec<ListenerRegistration>,
}

impl Applier {
    async fn apply(&mut self, op: Operation) {
        let (seq, kind, run_after_apply, reply) = op.into_parts();
        let name = kind.name();
        let target = kind.target().to_string();

        let mut result = self.apply_kind(kind);
        if result.is_ok() && run_after_apply {
            if let Err(err) = self.view.run().await {
                result = Err(err);
            }
        }

        let result = result.map_err(|err| {
            let kind = match err {
                ViewError::MethodNotFound(_) => DiagnosticKind::MethodNotFound,
                _ => DiagnosticKind::ApplyFailure,
            };
            self.diagnostics.report(Diagnostic::new(
                self.target_id.clone(),
                kind,
                format!("{} '{}' failed: {}", name, target, err),
            ));
            CommandError::Apply(err)
        });

        debug!(target_id = %self.target_id, seq, op = name, target = %target, ok = result.is_ok(), "applied operation");

        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    fn apply_kind(&mut self, kind: OpKind) -> Result<Reply, ViewError> {
        match kind {
            OpKind::Call { method, params } => self.view.call(&method, &params).map(Reply::Value),
            OpKind::Insert { table, rows } => self.view.insert(&table, rows).map(|_| Reply::Applied),
            OpKind::Remove { table, predicate } => self.view.remove(&table, &predicate).map(Reply::Removed),
            OpKind::Change { table, changeset } => self.view.change(&table, &changeset).map(Reply::Changed),
            OpKind::AddEventListener(registration) => {
                let id = registration.id;
                self.view.add_event_listener(registration.clone())?;
                self.listeners.push(registration);
                Ok(Reply::Listener(id))
            }
            OpKind::AddSignalListener(registration) => {
                let id = registration.id;
                self.view.add_signal_listener(registration.clone())?;
                self.listeners.push(registration);
                Ok(Reply::Listener(id))
            }
            OpKind::RemoveListener { id } => {
                let removed = match self.listeners.iter().position(|registration| registration.id == id) {
                    Some(index) => {
                        let registration = self.listeners.remove(index);
                        self.view.remove_listener(&registration)
                    }
                    None => false,
                };
                Ok(Reply::Value(Value::Bool(removed)))
            }
            OpKind::ReadSignal { name } => self.view.signal(&name).map(Reply::Value),
            OpKind::ReadData { table } => self.view.data(&table).map(Reply::Rows),
        }
    }

    /// Unregister every listener this bridge attached before the view is dropped
    fn teardown(&mut self) {
        let mut removed = 0;
        for registration in self.listeners.drain(..) {
            if self.view.remove_listener(&registration) {
                removed += 1;
            }
        }
        debug!(target_id = %self.target_id, removed, "tore down view");
    }
}
