//! Operations and the receipts handed back to their issuers

use serde_json::Value;
use tokio::sync::oneshot;
use vw_data::{ChangeSummary, Changeset, Predicate, Row};

use crate::events::{ListenerId, ListenerRegistration};
use crate::CommandError;

/// What an operation does to the view
#[derive(Debug)]
pub enum OpKind {
    Call { method: String, params: Vec<Value> },
    Insert { table: String, rows: Vec<Row> },
    Remove { table: String, predicate: Predicate },
    Change { table: String, changeset: Changeset },
    AddEventListener(ListenerRegistration),
    AddSignalListener(ListenerRegistration),
    RemoveListener { id: ListenerId },
    ReadSignal { name: String },
    ReadData { table: String },
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Call { .. } => "call",
            OpKind::Insert { .. } => "insert",
            OpKind::Remove { .. } => "remove",
            OpKind::Change { .. } => "change",
            OpKind::AddEventListener(_) => "addEventListener",
            OpKind::AddSignalListener(_) => "addSignalListener",
            OpKind::RemoveListener { .. } => "removeListener",
            OpKind::ReadSignal { .. } => "signal",
            OpKind::ReadData { .. } => "data",
        }
    }

    /// Method, table, event or signal name the operation addresses
    pub fn target(&self) -> &str {
        match self {
            OpKind::Call { method, .. } => method,
            OpKind::Insert { table, .. }
            | OpKind::Remove { table, .. }
            | OpKind::Change { table, .. }
            | OpKind::ReadData { table } => table,
            OpKind::AddEventListener(registration) | OpKind::AddSignalListener(registration) => &registration.name,
            OpKind::ReadSignal { name } => name,
            OpKind::RemoveListener { .. } => "listener",
        }
    }

    /// Whether the view's render step may follow this operation
    pub fn mutates(&self) -> bool {
        matches!(
            self,
            OpKind::Call { .. } | OpKind::Insert { .. } | OpKind::Remove { .. } | OpKind::Change { .. }
        )
    }
}

/// Successful result of applying an operation
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Value(Value),
    Removed(usize),
    Changed(ChangeSummary),
    Listener(ListenerId),
    Rows(Vec<Row>),
    Applied,
}

pub(crate) type ReplySender = oneshot::Sender<Result<Reply, CommandError>>;

/// A queued unit of work against a view
#[derive(Debug)]
pub struct Operation {
    pub seq: u64,
    pub kind: OpKind,
    pub run_after_apply: bool,
    reply: Option<ReplySender>,
}

impl Operation {
    pub(crate) fn new(seq: u64, kind: OpKind, run_after_apply: bool, reply: ReplySender) -> Self {
        let run_after_apply = run_after_apply && kind.mutates();
        Self {
            seq,
            kind,
            run_after_apply,
            reply: Some(reply),
        }
    }

    /// Resolve the issuer's receipt without applying the operation
    pub(crate) fn settle(mut self, result: Result<Reply, CommandError>) {
        if let Some(reply) = self.reply.take() {
            // The issuer may have dropped its receipt
            let _ = reply.send(result);
        }
    }

    pub(crate) fn into_parts(mut self) -> (u64, OpKind, bool, Option<ReplySender>) {
        let reply = self.reply.take();
        (self.seq, self.kind, self.run_after_apply, reply)
    }
}

/// Per-command outcome handle
///
/// Await [`Receipt::outcome`] for a typed result, or drop it to fire and
/// forget. Dropping never cancels the command.
#[derive(Debug)]
pub struct Receipt<T> {
    rx: oneshot::Receiver<Result<Reply, CommandError>>,
    extract: fn(Reply) -> Option<T>,
}

impl<T> Receipt<T> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<Reply, CommandError>>, extract: fn(Reply) -> Option<T>) -> Self {
        Self { rx, extract }
    }

    /// Receipt that is already settled with an error
    pub(crate) fn failed(error: CommandError, extract: fn(Reply) -> Option<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self { rx, extract }
    }

    /// Wait for the command to be applied (or dropped)
    pub async fn outcome(self) -> Result<T, CommandError> {
        match self.rx.await {
            Ok(Ok(reply)) => (self.extract)(reply).ok_or(CommandError::UnexpectedReply),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(CommandError::Dropped),
        }
    }

    /// Non-blocking check; `None` while the command is still pending
    pub fn try_outcome(&mut self) -> Option<Result<T, CommandError>> {
        match self.rx.try_recv() {
            Ok(Ok(reply)) => Some((self.extract)(reply).ok_or(CommandError::UnexpectedReply)),
            Ok(Err(error)) => Some(Err(error)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(CommandError::Dropped)),
        }
    }
}

pub(crate) fn reply_value(reply: Reply) -> Option<Value> {
    match reply {
        Reply::Value(value) => Some(value),
        _ => None,
    }
}

pub(crate) fn reply_unit(reply: Reply) -> Option<()> {
    match reply {
        Reply::Applied | Reply::Removed(_) => Some(()),
        _ => None,
    }
}

pub(crate) fn reply_flag(reply: Reply) -> Option<bool> {
    match reply {
        Reply::Value(Value::Bool(flag)) => Some(flag),
        _ => None,
    }
}

pub(crate) fn reply_changed(reply: Reply) -> Option<ChangeSummary> {
    match reply {
        Reply::Changed(summary) => Some(summary),
        _ => None,
    }
}

pub(crate) fn reply_listener(reply: Reply) -> Option<ListenerId> {
    match reply {
        Reply::Listener(id) => Some(id),
        _ => None,
    }
}

pub(crate) fn reply_rows(reply: Reply) -> Option<Vec<Row>> {
    match reply {
        Reply::Rows(rows) => Some(rows),
        _ => None,
    }
}
