//! Ordered buffer in front of a view that is still being constructed

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::operation::Operation;
use crate::CommandError;

/// Why a buffer stopped accepting operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closure {
    /// The view could not be constructed
    ConstructionFailed,
    /// The bridge re-rendered or was torn down
    Superseded,
}

impl Closure {
    fn error(self) -> CommandError {
        match self {
            Closure::ConstructionFailed => CommandError::ConstructionFailed,
            Closure::Superseded => CommandError::Superseded,
        }
    }
}

/// Where an enqueued operation went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Held until the view resolves
    Buffered,
    /// Handed straight to the applier
    Forwarded,
    /// Never applied; its receipt is settled with an error
    Dropped,
}

enum BufferState {
    Buffering(VecDeque<Operation>),
    PassThrough(mpsc::UnboundedSender<Operation>),
    Closed(Closure),
}

/// FIFO queue of operations issued before the view is ready
///
/// Once drained into an applier the buffer turns into a pass-through and
/// never buffers again. Draining and forwarding happen under the same lock,
/// so an operation enqueued during a drain lands behind every replayed one.
pub struct PendingOpBuffer {
    state: Mutex<BufferState>,
}

impl PendingOpBuffer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BufferState::Buffering(VecDeque::new())),
        }
    }

    /// Queue or forward an operation
    pub fn enqueue(&self, op: Operation) -> Enqueued {
        let mut state = self.state.lock();
        match &mut *state {
            BufferState::Buffering(queue) => {
                queue.push_back(op);
                Enqueued::Buffered
            }
            BufferState::PassThrough(applier) => match applier.send(op) {
                Ok(()) => Enqueued::Forwarded,
                Err(mpsc::error::SendError(op)) => {
                    op.settle(Err(CommandError::Dropped));
                    Enqueued::Dropped
                }
            },
            BufferState::Closed(closure) => {
                op.settle(Err(closure.error()));
                Enqueued::Dropped
            }
        }
    }

    /// Replay every buffered operation into the applier, in enqueue order,
    /// then switch to pass-through
    ///
    /// Returns the number of replayed operations, or the closure if the
    /// buffer was closed before the view resolved.
    pub fn drain_into(&self, applier: mpsc::UnboundedSender<Operation>) -> Result<usize, Closure> {
        let mut state = self.state.lock();
        let queue = match &mut *state {
            BufferState::Buffering(queue) => std::mem::take(queue),
            BufferState::PassThrough(_) => return Ok(0),
            BufferState::Closed(closure) => return Err(*closure),
        };

        let replayed = queue.len();
        for op in queue {
            if let Err(mpsc::error::SendError(op)) = applier.send(op) {
                op.settle(Err(CommandError::Dropped));
            }
        }
        *state = BufferState::PassThrough(applier);
        Ok(replayed)
    }

    /// Stop accepting operations
    ///
    /// Buffered operations are dropped and their receipts settled; a
    /// pass-through buffer releases its applier so the applier can finish.
    /// Returns the number of dropped operations.
    pub fn close(&self, closure: Closure) -> usize {
        let previous = std::mem::replace(&mut *self.state.lock(), BufferState::Closed(closure));
        match previous {
            BufferState::Buffering(queue) => {
                let dropped = queue.len();
                for op in queue {
                    op.settle(Err(closure.error()));
                }
                dropped
            }
            BufferState::PassThrough(_) | BufferState::Closed(_) => 0,
        }
    }

    /// Number of operations waiting for the view
    pub fn len(&self) -> usize {
        match &*self.state.lock() {
            BufferState::Buffering(queue) => queue.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_pass_through(&self) -> bool {
        matches!(&*self.state.lock(), BufferState::PassThrough(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(&*self.state.lock(), BufferState::Closed(_))
    }
}

impl Default for PendingOpBuffer {
    fn default() -> Self {
        Self::new()
    }
}
