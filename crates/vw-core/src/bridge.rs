//! Bridge instance and its command surface

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;
use vw_data::convert::batch_to_rows;
use vw_data::{ChangeSummary, Changeset, ChangesetBuilder, DataError, RecordConverter, Row};

use crate::config::BridgeConfig;
use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink, TracingSink};
use crate::events::{Handler, ListenerId, ListenerKind, ListenerRegistration};
use crate::lifecycle::{
    reply_changed, reply_flag, reply_listener, reply_rows, reply_unit, reply_value, Closure, Generation,
    LifecycleContext, OpKind, Operation, Receipt, Reply, ViewFuture,
};
use crate::view::{RenderTarget, SizedTarget, Specification, ViewFactory};
use crate::{CommandError, TargetId};

/// Externally addressable pairing of one view lifecycle with its commands
///
/// Commands may be issued at any time. Before the view exists they are
/// buffered; afterwards they go straight to the view. Either way they are
/// applied in the order they were issued, and every command hands back a
/// [`Receipt`] with its outcome.
pub struct Bridge {
    context: LifecycleContext,
    converter: RecordConverter,
    run_by_default: bool,
    current: Mutex<Arc<Generation>>,
    generations: AtomicU64,
    sequence: AtomicU64,
}

impl Bridge {
    /// Create a bridge with default configuration, an unsized render target
    /// and diagnostics going to tracing
    pub fn new(id: impl Into<TargetId>, factory: Arc<dyn ViewFactory>) -> Self {
        Self {
            context: LifecycleContext {
                target_id: id.into(),
                factory,
                target: Arc::new(SizedTarget::default()),
                diagnostics: Arc::new(TracingSink),
            },
            converter: RecordConverter::default(),
            run_by_default: true,
            current: Mutex::new(Generation::new(0)),
            generations: AtomicU64::new(1),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn with_target(mut self, target: Arc<dyn RenderTarget>) -> Self {
        self.context.target = target;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        self.context.diagnostics = diagnostics;
        self
    }

    pub fn with_config(mut self, config: &BridgeConfig) -> Self {
        self.converter = RecordConverter::new(config.converter.clone());
        self.run_by_default = config.run_by_default;
        self
    }

    pub fn id(&self) -> &str {
        &self.context.target_id
    }

    // Lifecycle

    /// Start constructing a view from `spec`
    ///
    /// The first render adopts every command issued so far. A later render
    /// retires the current generation: its buffered commands are dropped,
    /// commands already handed to the old view still apply, then the old
    /// view's listeners are unregistered and the view is discarded.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn render(&self, spec: Specification) -> ViewFuture {
        let mut current = self.current.lock();
        if current.is_started() || current.buffer.is_closed() {
            current.retire();
            let number = self.generations.fetch_add(1, Ordering::Relaxed);
            *current = Generation::new(number);
        }
        debug!(target_id = %self.id(), generation = current.number, "render requested");
        current.start(self.context.clone(), spec);
        current.future()
    }

    /// The current generation's view future
    pub fn view(&self) -> ViewFuture {
        self.current.lock().future()
    }

    /// Wait for the current view to be constructed
    pub async fn ready(&self) -> Result<(), CommandError> {
        let future = self.view();
        future.wait().await
    }

    /// Whether the current generation has been rendered
    pub fn is_rendered(&self) -> bool {
        self.current.lock().is_started()
    }

    /// Number of commands waiting for the current view
    pub fn pending(&self) -> usize {
        self.current.lock().buffer.len()
    }

    /// Retire the current view without replacing it
    ///
    /// Later commands are dropped; call [`Bridge::render`] to start over.
    pub fn teardown(&self) {
        let mut current = self.current.lock();
        current.retire();
        let number = self.generations.fetch_add(1, Ordering::Relaxed);
        let fresh = Generation::new(number);
        fresh.buffer.close(Closure::Superseded);
        *current = fresh;
        debug!(target_id = %self.id(), "bridge torn down");
    }

    // Commands

    /// Invoke a named view method with positional parameters
    ///
    /// When `run` (default from configuration) is set the view re-renders
    /// afterwards. An unknown method is a diagnostic, not a fault.
    pub fn call_view(&self, method: &str, params: Vec<Value>, run: Option<bool>) -> Receipt<Value> {
        let kind = OpKind::Call {
            method: method.to_string(),
            params,
        };
        self.submit(kind, run, reply_value)
    }

    /// Insert a row- or column-oriented payload into a table
    pub fn insert_data(&self, table: &str, data: Value, run: Option<bool>) -> Receipt<()> {
        match self.converter.rows(data) {
            Ok(rows) => self.insert_rows(table, rows, run),
            Err(err) => self.reject(table, err, reply_unit),
        }
    }

    /// Insert the rows of an Arrow record batch into a table
    pub fn insert_batch(&self, table: &str, batch: &RecordBatch, run: Option<bool>) -> Receipt<()> {
        match batch_to_rows(batch) {
            Ok(rows) => self.insert_rows(table, rows, run),
            Err(err) => self.reject(table, err, reply_unit),
        }
    }

    fn insert_rows(&self, table: &str, rows: Vec<Row>, run: Option<bool>) -> Receipt<()> {
        let kind = OpKind::Insert {
            table: table.to_string(),
            rows,
        };
        self.submit(kind, run, reply_unit)
    }

    /// Remove rows selected by `predicate`; every row when omitted
    pub fn remove_data(&self, table: &str, predicate: Option<Value>, run: Option<bool>) -> Receipt<()> {
        match self.converter.predicate(predicate) {
            Ok(predicate) => {
                let kind = OpKind::Remove {
                    table: table.to_string(),
                    predicate,
                };
                self.submit(kind, run, reply_unit)
            }
            Err(err) => self.reject(table, err, reply_unit),
        }
    }

    /// Insert and remove as one changeset
    ///
    /// Omitting `remove` replaces the whole table; omitting `insert` inserts
    /// nothing.
    pub fn change_data(
        &self,
        table: &str,
        insert: Option<Value>,
        remove: Option<Value>,
        run: Option<bool>,
    ) -> Receipt<ChangeSummary> {
        match ChangesetBuilder::new(&self.converter).build(insert, remove) {
            Ok(changeset) => self.submit_change(table, changeset, run),
            Err(err) => self.reject(table, err, reply_changed),
        }
    }

    /// Hard reset of a table to `data`
    pub fn change_view(&self, table: &str, data: Value) -> Receipt<ChangeSummary> {
        match self.converter.rows(data) {
            Ok(rows) => self.submit_change(table, Changeset::replace(rows), Some(true)),
            Err(err) => self.reject(table, err, reply_changed),
        }
    }

    /// Insert a table and re-render
    pub fn load_data(&self, table: &str, data: Value) -> Receipt<()> {
        self.insert_data(table, data, Some(true))
    }

    fn submit_change(&self, table: &str, changeset: Changeset, run: Option<bool>) -> Receipt<ChangeSummary> {
        let kind = OpKind::Change {
            table: table.to_string(),
            changeset,
        };
        self.submit(kind, run, reply_changed)
    }

    /// Attach a handler to a view event
    ///
    /// Handlers accumulate; registering twice for one event keeps both.
    pub fn add_event_listener(&self, event: &str, handler: Handler) -> Receipt<ListenerId> {
        let registration = ListenerRegistration::new(ListenerKind::Event, event, handler);
        self.submit(OpKind::AddEventListener(registration), Some(false), reply_listener)
    }

    /// Attach a handler to a view signal
    pub fn add_signal_listener(&self, signal: &str, handler: Handler) -> Receipt<ListenerId> {
        let registration = ListenerRegistration::new(ListenerKind::Signal, signal, handler);
        self.submit(OpKind::AddSignalListener(registration), Some(false), reply_listener)
    }

    /// Detach one listener previously added through this bridge
    ///
    /// Resolves to `false` if the current view does not hold it, e.g. after a
    /// re-render.
    pub fn remove_listener(&self, id: ListenerId) -> Receipt<bool> {
        self.submit(OpKind::RemoveListener { id }, Some(false), reply_flag)
    }

    /// Read a signal, ordered after every command issued before it
    pub fn signal(&self, name: &str) -> Receipt<Value> {
        let kind = OpKind::ReadSignal { name: name.to_string() };
        self.submit(kind, Some(false), reply_value)
    }

    /// Read a table's rows, ordered after every command issued before it
    pub fn data(&self, table: &str) -> Receipt<Vec<Row>> {
        let kind = OpKind::ReadData {
            table: table.to_string(),
        };
        self.submit(kind, Some(false), reply_rows)
    }

    fn submit<T>(&self, kind: OpKind, run: Option<bool>, extract: fn(Reply) -> Option<T>) -> Receipt<T> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let op = Operation::new(seq, kind, run.unwrap_or(self.run_by_default), tx);

        // Hold the generation lock so a concurrent render cannot slip in
        let current = self.current.lock();
        let enqueued = current.buffer.enqueue(op);
        debug!(target_id = %self.id(), generation = current.number, seq, ?enqueued, "submitted operation");

        Receipt::new(rx, extract)
    }

    fn reject<T>(&self, table: &str, err: DataError, extract: fn(Reply) -> Option<T>) -> Receipt<T> {
        let message = err.to_string();
        self.context.diagnostics.report(Diagnostic::new(
            self.id(),
            DiagnosticKind::InvalidPayload,
            format!("payload for '{}' rejected: {}", table, message),
        ));
        Receipt::failed(CommandError::InvalidPayload(message), extract)
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let current = self.current.lock();
        f.debug_struct("Bridge")
            .field("id", &self.id())
            .field("generation", &current.number)
            .field("pending", &current.buffer.len())
            .finish()
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        // Release the applier task, which otherwise waits for more operations
        self.current.get_mut().retire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CollectingSink;
    use crate::events::handler_from_fn;
    use crate::lifecycle::Readiness;
    use crate::view::{MemoryViewFactory, ViewError, ViewProbe};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    fn points_spec() -> Specification {
        Specification::new(json!({
            "data": [{"name": "points", "values": [{"x": 0, "y": 0}]}],
            "signals": [{"name": "threshold", "value": 5}]
        }))
    }

    struct Harness {
        bridge: Bridge,
        probe: ViewProbe,
        gate: Arc<Semaphore>,
        diagnostics: CollectingSink,
    }

    fn harness() -> Harness {
        let probe = ViewProbe::default();
        let gate = Arc::new(Semaphore::new(0));
        let factory = MemoryViewFactory::new(probe.clone())
            .with_gate(Arc::clone(&gate))
            .with_method("toggle", |_params| Ok(Value::Null));
        let diagnostics = CollectingSink::new();
        let bridge = Bridge::new("chart", Arc::new(factory)).with_diagnostics(Arc::new(diagnostics.clone()));
        Harness {
            bridge,
            probe,
            gate,
            diagnostics,
        }
    }

    #[tokio::test]
    async fn test_insert_before_ready_lands_once_resolved() {
        let h = harness();
        let future = h.bridge.render(Specification::new(json!({"data": [{"name": "points"}]})));
        let receipt = h.bridge.insert_data("points", json!([{"x": 1, "y": 2}]), None);
        assert_eq!(future.readiness(), Readiness::Pending);

        h.gate.add_permits(1);
        receipt.outcome().await.unwrap();

        let rows = h.bridge.data("points").outcome().await.unwrap();
        assert_eq!(rows, vec![json!({"x": 1, "y": 2})]);
        assert!(h.diagnostics.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_calls_replay_in_order() {
        let h = harness();
        h.bridge.render(points_spec());
        let first = h.bridge.call_view("toggle", vec![], None);
        let second = h.bridge.call_view("toggle", vec![], None);

        h.gate.add_permits(1);
        first.outcome().await.unwrap();
        second.outcome().await.unwrap();

        assert_eq!(h.probe.journal(), vec!["call toggle", "run", "call toggle", "run"]);
    }

    #[tokio::test]
    async fn test_order_spans_buffer_and_pass_through() {
        let h = harness();
        // Commands issued before the first render are adopted by it
        let early = h.bridge.insert_data("points", json!({"x": [1, 2], "y": [3, 4]}), Some(false));
        h.bridge.render(points_spec());
        h.bridge.remove_data("points", Some(json!("datum.x == 0")), Some(false));
        assert_eq!(h.bridge.pending(), 2);

        h.gate.add_permits(1);
        early.outcome().await.unwrap();
        h.bridge.ready().await.unwrap();

        let late = h.bridge.change_data("points", Some(json!([{"x": 9, "y": 9}])), Some(json!("datum.x < 2")), None);
        let summary = late.outcome().await.unwrap();
        assert_eq!(summary, ChangeSummary { inserted: 1, removed: 1 });

        assert_eq!(
            h.probe.journal(),
            vec!["insert points 2", "remove points 1", "change points +1 -1", "run"]
        );
        let rows = h.bridge.data("points").outcome().await.unwrap();
        assert_eq!(rows, vec![json!({"x": 2, "y": 4}), json!({"x": 9, "y": 9})]);
    }

    #[tokio::test]
    async fn test_change_without_remove_replaces_table() {
        let h = harness();
        h.bridge.render(points_spec());
        h.gate.add_permits(1);

        h.bridge.insert_data("points", json!([{"x": 1, "y": 1}]), None);
        h.bridge
            .change_data("points", Some(json!([{"x": 7, "y": 7}])), None, None)
            .outcome()
            .await
            .unwrap();

        let rows = h.bridge.data("points").outcome().await.unwrap();
        assert_eq!(rows, vec![json!({"x": 7, "y": 7})]);
    }

    #[tokio::test]
    async fn test_remove_without_predicate_clears_table() {
        let h = harness();
        h.bridge.render(points_spec());
        h.gate.add_permits(1);

        h.bridge.remove_data("points", None, None).outcome().await.unwrap();
        assert!(h.bridge.data("points").outcome().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_construction_failure_drops_everything_quietly() {
        let h = harness();
        let before = h.bridge.insert_data("points", json!([{"x": 1}]), None);
        let future = h.bridge.render(Specification::new(json!("not a spec")));
        h.gate.add_permits(1);

        assert_eq!(future.wait().await, Err(CommandError::ConstructionFailed));
        assert_eq!(before.outcome().await, Err(CommandError::ConstructionFailed));

        let after = h.bridge.insert_data("points", json!([{"x": 2}]), None);
        assert_eq!(after.outcome().await, Err(CommandError::ConstructionFailed));

        assert_eq!(h.diagnostics.kinds(), vec![DiagnosticKind::ConstructionFailure]);
        assert!(h.probe.journal().is_empty());
        assert!(matches!(future.readiness(), Readiness::Failed(_)));
    }

    #[tokio::test]
    async fn test_unknown_method_is_diagnosed_not_fatal() {
        let h = harness();
        h.bridge.render(points_spec());
        h.gate.add_permits(1);

        let missing = h.bridge.call_view("nope", vec![], None).outcome().await;
        assert_eq!(
            missing,
            Err(CommandError::Apply(ViewError::MethodNotFound("nope".to_string())))
        );
        assert_eq!(h.diagnostics.kinds(), vec![DiagnosticKind::MethodNotFound]);

        // The view keeps working
        h.bridge.call_view("toggle", vec![], None).outcome().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_table_is_apply_failure() {
        let h = harness();
        h.bridge.render(points_spec());
        h.gate.add_permits(1);

        let result = h.bridge.insert_data("lines", json!([{"x": 1}]), None).outcome().await;
        assert_eq!(result, Err(CommandError::Apply(ViewError::UnknownTable("lines".to_string()))));
        assert_eq!(h.diagnostics.kinds(), vec![DiagnosticKind::ApplyFailure]);
    }

    #[tokio::test]
    async fn test_bad_payload_is_rejected_up_front() {
        let h = harness();
        let result = h
            .bridge
            .insert_data("points", json!({"x": [1, 2], "y": [1]}), None)
            .outcome()
            .await;
        assert!(matches!(result, Err(CommandError::InvalidPayload(_))));
        assert_eq!(h.bridge.pending(), 0);
        assert_eq!(h.diagnostics.kinds(), vec![DiagnosticKind::InvalidPayload]);
    }

    #[tokio::test]
    async fn test_untrusted_predicates_are_refused() {
        let h = harness();
        let mut config = BridgeConfig::default();
        config.converter.trust_string_predicates = false;
        let bridge = h.bridge.with_config(&config);

        let result = bridge.remove_data("points", Some(json!("datum.x > 0")), None).outcome().await;
        assert!(matches!(result, Err(CommandError::InvalidPayload(_))));
    }

    #[tokio::test]
    async fn test_sizing_cleared_before_replay() {
        let probe = ViewProbe::default();
        let gate = Arc::new(Semaphore::new(0));
        let factory = MemoryViewFactory::new(probe.clone()).with_gate(Arc::clone(&gate));
        let target = Arc::new(SizedTarget::new(400, 300));
        let bridge = Bridge::new("chart", Arc::new(factory)).with_target(target.clone());

        bridge.render(points_spec());
        bridge.insert_data("points", json!([{"x": 1, "y": 1}]), None);
        assert_eq!(target.size(), Some((400, 300)));

        gate.add_permits(1);
        bridge.ready().await.unwrap();
        assert_eq!(target.size(), None);
    }

    #[tokio::test]
    async fn test_listeners_accumulate_and_fire() {
        let h = harness();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let hits = Arc::clone(&hits);
            h.bridge.add_signal_listener(
                "threshold",
                handler_from_fn(move |name, value| {
                    assert_eq!(name, "threshold");
                    assert_eq!(value, &json!(8));
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        h.bridge.render(points_spec());
        h.gate.add_permits(1);

        h.bridge
            .call_view("signal", vec![json!("threshold"), json!(8)], None)
            .outcome()
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(h.bridge.signal("threshold").outcome().await.unwrap(), json!(8));
    }

    #[tokio::test]
    async fn test_listener_removed_individually() {
        let h = harness();
        h.bridge.render(points_spec());
        h.gate.add_permits(1);

        let hits = Arc::new(AtomicUsize::new(0));
        let mut ids = Vec::new();
        for _ in 0..2 {
            let hits = Arc::clone(&hits);
            let handler = handler_from_fn(move |_, _| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
            ids.push(h.bridge.add_signal_listener("threshold", handler).outcome().await.unwrap());
        }

        assert!(h.bridge.remove_listener(ids[0]).outcome().await.unwrap());
        assert!(!h.bridge.remove_listener(ids[0]).outcome().await.unwrap());
        assert_eq!(h.probe.live_listeners(), 1);

        h.bridge
            .call_view("signal", vec![json!("threshold"), json!(1)], Some(false))
            .outcome()
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rerender_unregisters_old_listeners() {
        let h = harness();
        let first = h.bridge.render(points_spec());
        h.gate.add_permits(1);
        first.wait().await.unwrap();

        h.bridge
            .add_event_listener("click", handler_from_fn(|_, _| {}))
            .outcome()
            .await
            .unwrap();
        assert_eq!(h.probe.live_listeners(), 1);

        let second = h.bridge.render(points_spec());
        assert_ne!(first.generation(), second.generation());
        h.gate.add_permits(1);
        second.wait().await.unwrap();

        // The old applier winds down once its buffer closes
        while first.readiness() != Readiness::Retired {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.probe.live_listeners(), 0);
        assert_eq!(h.probe.constructed(), 2);
    }

    #[tokio::test]
    async fn test_rerender_while_constructing_drops_stale_buffer() {
        let h = harness();
        h.bridge.render(points_spec());
        let stale = h.bridge.insert_data("points", json!([{"x": 1, "y": 1}]), None);

        let future = h.bridge.render(points_spec());
        assert_eq!(stale.outcome().await, Err(CommandError::Superseded));

        let fresh = h.bridge.insert_data("points", json!([{"x": 2, "y": 2}]), None);
        h.gate.add_permits(1);
        h.gate.add_permits(1);
        fresh.outcome().await.unwrap();
        future.wait().await.unwrap();

        let rows = h.bridge.data("points").outcome().await.unwrap();
        assert_eq!(rows, vec![json!({"x": 0, "y": 0}), json!({"x": 2, "y": 2})]);
    }

    #[tokio::test]
    async fn test_teardown_drops_later_commands() {
        let h = harness();
        h.bridge.render(points_spec());
        h.gate.add_permits(1);
        h.bridge.ready().await.unwrap();

        h.bridge.teardown();
        let result = h.bridge.insert_data("points", json!([{"x": 1}]), None).outcome().await;
        assert_eq!(result, Err(CommandError::Superseded));
        assert!(h.diagnostics.is_empty());
    }

    #[tokio::test]
    async fn test_record_batch_insert() {
        use arrow::array::Int64Array;
        use arrow::datatypes::{DataType, Field, Schema};

        let h = harness();
        h.bridge.render(Specification::new(json!({"data": [{"name": "points"}]})));
        h.gate.add_permits(1);

        let schema = Arc::new(Schema::new(vec![
            Field::new("x", DataType::Int64, false),
            Field::new("y", DataType::Int64, false),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from(vec![1, 2])), Arc::new(Int64Array::from(vec![3, 4]))],
        )
        .unwrap();

        h.bridge.insert_batch("points", &batch, None).outcome().await.unwrap();
        let rows = h.bridge.data("points").outcome().await.unwrap();
        assert_eq!(rows, vec![json!({"x": 1, "y": 3}), json!({"x": 2, "y": 4})]);
    }

    #[tokio::test]
    async fn test_change_view_resets_table() {
        let h = harness();
        h.bridge.render(points_spec());
        h.gate.add_permits(1);

        let summary = h
            .bridge
            .change_view("points", json!({"x": [5], "y": [6]}))
            .outcome()
            .await
            .unwrap();
        assert_eq!(summary, ChangeSummary { inserted: 1, removed: 1 });
    }

    #[tokio::test]
    async fn test_debug_shows_generation_and_backlog() {
        let h = harness();
        h.bridge.call_view("toggle", Vec::new(), None);
        assert_eq!(format!("{:?}", h.bridge), "Bridge { id: \"chart\", generation: 0, pending: 1 }");

        h.bridge.render(points_spec());
        assert!(format!("{:?}", h.bridge).contains("generation: 0"));
    }
}
