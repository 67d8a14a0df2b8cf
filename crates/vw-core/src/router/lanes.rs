use std::future::Future;

use ahash::AHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{trace, warn};

use crate::TargetId;

/// One FIFO queue and worker task per target id
///
/// Items for the same target are handed to its worker in push order; a worker
/// stalled on one target never holds back another target's items.
#[derive(Debug)]
pub struct TargetLanes<T> {
    lanes: AHashMap<TargetId, mpsc::UnboundedSender<T>>,
    workers: JoinSet<usize>,
}

impl<T> Default for TargetLanes<T>
where
    T: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TargetLanes<T>
where
    T: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            lanes: AHashMap::new(),
            workers: JoinSet::new(),
        }
    }

    /// Number of lanes opened so far
    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    /// Queue `item` on the lane for `target`
    ///
    /// The first item for a target opens its lane: `open` receives the
    /// lane's queue and returns the worker draining it. Must be called from
    /// within a Tokio runtime.
    pub fn push<F, Fut>(&mut self, target: &str, item: T, open: F)
    where
        F: FnOnce(mpsc::UnboundedReceiver<T>) -> Fut,
        Fut: Future<Output = usize> + Send + 'static,
    {
        if !self.lanes.contains_key(target) {
            let (tx, rx) = mpsc::unbounded_channel();
            self.workers.spawn(open(rx));
            self.lanes.insert(target.to_string(), tx);
            trace!(target_id = target, lanes = self.lanes.len(), "opened lane");
        }
        if let Some(lane) = self.lanes.get(target) {
            if lane.send(item).is_err() {
                warn!(target_id = target, "lane worker gone, item dropped");
            }
        }
    }

    /// Close every lane and wait for the workers to drain them
    ///
    /// Returns the sum of the workers' results.
    pub async fn close(mut self) -> usize {
        self.lanes.clear();
        let mut total = 0;
        while let Some(joined) = self.workers.join_next().await {
            match joined {
                Ok(count) => total += count,
                Err(err) => warn!(%err, "lane worker failed"),
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    async fn record(log: Arc<Mutex<Vec<String>>>, mut queue: mpsc::UnboundedReceiver<(u64, &'static str)>) -> usize {
        let mut drained = 0;
        while let Some((delay, item)) = queue.recv().await {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            log.lock().push(item.to_string());
            drained += 1;
        }
        drained
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_lanes_keep_order_without_blocking_each_other() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut lanes = TargetLanes::new();

        for (target, item) in [
            ("slow", (500, "slow-1")),
            ("fast", (10, "fast-1")),
            ("slow", (0, "slow-2")),
            ("fast", (10, "fast-2")),
        ] {
            let log = Arc::clone(&log);
            lanes.push(target, item, move |queue| record(log, queue));
        }
        assert_eq!(lanes.len(), 2);

        assert_eq!(lanes.close().await, 4);
        assert_eq!(*log.lock(), vec!["fast-1", "fast-2", "slow-1", "slow-2"]);
    }
}
