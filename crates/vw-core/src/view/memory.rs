//! In-memory view
//!
//! Keeps declared data tables and signals in plain maps and renders nothing.
//! It backs the host binary and is what the bridge is tested against.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Semaphore;
use vw_data::convert::columns_to_rows;
use vw_data::{ChangeSummary, Changeset, Predicate, RecordConverter, Row};

use super::{Specification, View, ViewError, ViewFactory};
use crate::events::{ListenerKind, ListenerRegistration};
use crate::TargetId;

/// Custom view method
pub type Method = Arc<dyn Fn(&[Value]) -> Result<Value, ViewError> + Send + Sync>;

/// Shared record of what happened to the views a factory built
#[derive(Debug, Clone, Default)]
pub struct ViewProbe {
    state: Arc<Mutex<ProbeState>>,
}

#[derive(Debug, Default)]
struct ProbeState {
    journal: Vec<String>,
    constructed: usize,
    live_listeners: usize,
}

impl ViewProbe {
    /// Applied operations, oldest first
    pub fn journal(&self) -> Vec<String> {
        self.state.lock().journal.clone()
    }

    /// Views successfully constructed
    pub fn constructed(&self) -> usize {
        self.state.lock().constructed
    }

    /// Listeners currently attached across all views
    pub fn live_listeners(&self) -> usize {
        self.state.lock().live_listeners
    }

    fn record(&self, entry: String) {
        self.state.lock().journal.push(entry);
    }
}

/// View holding tables and signals in memory
pub struct MemoryView {
    tables: AHashMap<String, Vec<Row>>,
    signals: AHashMap<String, Value>,
    listeners: Vec<ListenerRegistration>,
    methods: AHashMap<String, Method>,
    converter: RecordConverter,
    probe: ViewProbe,
}

impl MemoryView {
    /// Build from a Vega / Vega-Lite style specification
    ///
    /// Tables come from `data` (array or single object) and `datasets`;
    /// signals from `signals` and `params`.
    pub fn from_spec(spec: &Specification, probe: ViewProbe) -> Result<Self, ViewError> {
        let Value::Object(chart) = &spec.chart_spec else {
            return Err(ViewError::MalformedSpec("specification must be a JSON object".to_string()));
        };

        let mut tables = AHashMap::new();
        match chart.get("data") {
            None | Some(Value::Null) => {}
            Some(Value::Array(entries)) => {
                for entry in entries {
                    let (name, rows) = dataset(entry)?;
                    tables.insert(name, rows);
                }
            }
            Some(entry @ Value::Object(_)) => {
                let (name, rows) = dataset(entry)?;
                tables.insert(name, rows);
            }
            Some(_) => return Err(ViewError::MalformedSpec("'data' must be an array or object".to_string())),
        }

        if let Some(datasets) = chart.get("datasets") {
            let Value::Object(datasets) = datasets else {
                return Err(ViewError::MalformedSpec("'datasets' must be an object".to_string()));
            };
            for (name, values) in datasets {
                tables.insert(name.clone(), rows_of(values)?);
            }
        }

        let mut signals = AHashMap::new();
        for key in ["signals", "params"] {
            match chart.get(key) {
                None => {}
                Some(Value::Array(entries)) => {
                    for entry in entries {
                        let name = entry
                            .get("name")
                            .and_then(Value::as_str)
                            .ok_or_else(|| ViewError::MalformedSpec(format!("every entry of '{}' needs a name", key)))?;
                        signals.insert(name.to_string(), entry.get("value").cloned().unwrap_or(Value::Null));
                    }
                }
                Some(_) => return Err(ViewError::MalformedSpec(format!("'{}' must be an array", key))),
            }
        }

        Ok(Self {
            tables,
            signals,
            listeners: Vec::new(),
            methods: AHashMap::new(),
            converter: RecordConverter::default(),
            probe,
        })
    }

    /// Add a custom method callable through [`View::call`]
    pub fn with_method(mut self, name: impl Into<String>, method: Method) -> Self {
        self.methods.insert(name.into(), method);
        self
    }

    /// Fire an event at every listener registered for it
    pub fn emit(&self, event: &str, payload: &Value) -> usize {
        self.notify(ListenerKind::Event, event, payload)
    }

    /// Set a signal and notify its listeners
    pub fn set_signal(&mut self, name: &str, value: Value) -> Result<(), ViewError> {
        let slot = self
            .signals
            .get_mut(name)
            .ok_or_else(|| ViewError::UnknownSignal(name.to_string()))?;
        *slot = value.clone();
        self.notify(ListenerKind::Signal, name, &value);
        Ok(())
    }

    fn notify(&self, kind: ListenerKind, name: &str, payload: &Value) -> usize {
        let mut notified = 0;
        for listener in self.listeners.iter().filter(|l| l.kind == kind && l.name == name) {
            listener.notify(payload);
            notified += 1;
        }
        notified
    }

    fn table_mut(&mut self, table: &str) -> Result<&mut Vec<Row>, ViewError> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| ViewError::UnknownTable(table.to_string()))
    }

    fn call_builtin(&mut self, method: &str, params: &[Value]) -> Option<Result<Value, ViewError>> {
        let invalid = |message: &str| ViewError::InvalidArguments {
            method: method.to_string(),
            message: message.to_string(),
        };

        let result = match (method, params) {
            ("run", _) => Ok(Value::Null),
            ("signal", [Value::String(name)]) => self.signal(name),
            ("signal", [Value::String(name), value]) => self.set_signal(name, value.clone()).map(|_| Value::Null),
            ("signal", _) => Err(invalid("expected (name) or (name, value)")),
            ("data", [Value::String(table)]) => self.data(table).map(Value::Array),
            ("data", _) => Err(invalid("expected (table)")),
            ("insert", [Value::String(table), rows]) => match self.converter.rows(rows.clone()) {
                Ok(rows) => self.insert(table, rows).map(|_| Value::Null),
                Err(err) => Err(invalid(&err.to_string())),
            },
            ("insert", _) => Err(invalid("expected (table, rows)")),
            ("remove", [Value::String(table), rest @ ..]) => match self.converter.predicate(rest.first().cloned()) {
                Ok(predicate) => self.remove(table, &predicate).map(Value::from),
                Err(err) => Err(invalid(&err.to_string())),
            },
            ("remove", _) => Err(invalid("expected (table, predicate?)")),
            ("emit", [Value::String(event), rest @ ..]) => {
                let payload = rest.first().cloned().unwrap_or(Value::Null);
                Ok(Value::from(self.emit(event, &payload)))
            }
            ("emit", _) => Err(invalid("expected (event, payload?)")),
            _ => return None,
        };
        Some(result)
    }
}

fn dataset(entry: &Value) -> Result<(String, Vec<Row>), ViewError> {
    let name = entry
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| ViewError::MalformedSpec("every data set needs a name".to_string()))?;
    let rows = match entry.get("values") {
        None => Vec::new(),
        Some(values) => rows_of(values)?,
    };
    Ok((name.to_string(), rows))
}

fn rows_of(values: &Value) -> Result<Vec<Row>, ViewError> {
    match values {
        Value::Array(rows) => Ok(rows.clone()),
        Value::Object(columns) => columns_to_rows(columns.clone()).map_err(|e| ViewError::MalformedSpec(e.to_string())),
        _ => Err(ViewError::MalformedSpec("data values must be rows or columns".to_string())),
    }
}

#[async_trait]
impl View for MemoryView {
    fn call(&mut self, method: &str, params: &[Value]) -> Result<Value, ViewError> {
        if let Some(custom) = self.methods.get(method).cloned() {
            self.probe.record(format!("call {}", method));
            return custom(params);
        }
        match self.call_builtin(method, params) {
            Some(result) => {
                self.probe.record(format!("call {}", method));
                result
            }
            None => Err(ViewError::MethodNotFound(method.to_string())),
        }
    }

    fn insert(&mut self, table: &str, rows: Vec<Row>) -> Result<(), ViewError> {
        let count = rows.len();
        self.table_mut(table)?.extend(rows);
        self.probe.record(format!("insert {} {}", table, count));
        Ok(())
    }

    fn remove(&mut self, table: &str, predicate: &Predicate) -> Result<usize, ViewError> {
        let rows = self.table_mut(table)?;
        let before = rows.len();
        rows.retain(|row| !predicate.matches(row));
        let removed = before - rows.len();
        self.probe.record(format!("remove {} {}", table, removed));
        Ok(removed)
    }

    fn change(&mut self, table: &str, changeset: &Changeset) -> Result<ChangeSummary, ViewError> {
        let summary = changeset.apply(self.table_mut(table)?);
        self.probe
            .record(format!("change {} +{} -{}", table, summary.inserted, summary.removed));
        Ok(summary)
    }

    fn add_event_listener(&mut self, registration: ListenerRegistration) -> Result<(), ViewError> {
        self.listeners.push(registration);
        self.probe.state.lock().live_listeners += 1;
        Ok(())
    }

    fn add_signal_listener(&mut self, registration: ListenerRegistration) -> Result<(), ViewError> {
        if !self.signals.contains_key(&registration.name) {
            return Err(ViewError::UnknownSignal(registration.name));
        }
        self.listeners.push(registration);
        self.probe.state.lock().live_listeners += 1;
        Ok(())
    }

    fn remove_listener(&mut self, registration: &ListenerRegistration) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| l.id != registration.id);
        let removed = self.listeners.len() < before;
        if removed {
            let mut state = self.probe.state.lock();
            state.live_listeners = state.live_listeners.saturating_sub(1);
        }
        removed
    }

    fn signal(&self, name: &str) -> Result<Value, ViewError> {
        self.signals
            .get(name)
            .cloned()
            .ok_or_else(|| ViewError::UnknownSignal(name.to_string()))
    }

    fn data(&self, table: &str) -> Result<Vec<Row>, ViewError> {
        self.tables
            .get(table)
            .cloned()
            .ok_or_else(|| ViewError::UnknownTable(table.to_string()))
    }

    async fn run(&mut self) -> Result<(), ViewError> {
        self.probe.record("run".to_string());
        tokio::task::yield_now().await;
        Ok(())
    }
}

/// Factory producing [`MemoryView`]s
///
/// Construction can be held back by a gate (one permit per view) or a fixed
/// delay to exercise the bridge's buffering.
#[derive(Clone, Default)]
pub struct MemoryViewFactory {
    probe: ViewProbe,
    methods: AHashMap<String, Method>,
    gate: Option<Arc<Semaphore>>,
    delay: Option<Duration>,
}

impl MemoryViewFactory {
    pub fn new(probe: ViewProbe) -> Self {
        Self {
            probe,
            ..Self::default()
        }
    }

    /// Wait for a permit from `gate` before constructing each view
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Register a custom method on every view this factory builds
    pub fn with_method<F>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, ViewError> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Arc::new(method));
        self
    }

    pub fn probe(&self) -> &ViewProbe {
        &self.probe
    }
}

#[async_trait]
impl ViewFactory for MemoryViewFactory {
    async fn construct(&self, target: &TargetId, spec: &Specification) -> Result<Box<dyn View>, ViewError> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| ViewError::Render("construction gate closed".to_string()))?
                .forget();
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut view = MemoryView::from_spec(spec, self.probe.clone())?;
        for (name, method) in &self.methods {
            view = view.with_method(name.clone(), Arc::clone(method));
        }
        self.probe.state.lock().constructed += 1;

        tracing::debug!(target_id = %target, tables = view.tables.len(), signals = view.signals.len(), "constructed memory view");
        Ok(Box::new(view))
    }
}
