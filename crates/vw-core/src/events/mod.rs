use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::TargetId;

/// Callback invoked with the event or signal name and its payload
pub type Handler = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Identifier handed out for every listener registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ListenerId(Uuid);

impl ListenerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What a listener is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ListenerKind {
    /// DOM-like view event (`click`, `mouseover`, ...)
    Event,
    /// Named reactive signal
    Signal,
}

/// A persistent callback bound to one view
///
/// Registrations accumulate: several handlers for the same name all stay
/// attached, each under its own id.
#[derive(Clone)]
pub struct ListenerRegistration {
    pub id: ListenerId,
    pub kind: ListenerKind,
    pub name: String,
    pub handler: Handler,
}

impl ListenerRegistration {
    pub fn new(kind: ListenerKind, name: impl Into<String>, handler: Handler) -> Self {
        Self {
            id: ListenerId::new(),
            kind,
            name: name.into(),
            handler,
        }
    }

    /// Invoke the handler
    pub fn notify(&self, payload: &Value) {
        (self.handler)(&self.name, payload);
    }
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .finish()
    }
}

/// Create a handler from a closure
pub fn handler_from_fn<F>(f: F) -> Handler
where
    F: Fn(&str, &Value) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Message relayed from a view to the host side of the boundary
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Outbound {
    #[serde(rename_all = "camelCase")]
    Event {
        target_id: TargetId,
        name: String,
        payload: Value,
    },
    #[serde(rename_all = "camelCase")]
    Signal {
        target_id: TargetId,
        name: String,
        value: Value,
    },
}

/// Forwards view events and signals to the host as [`Outbound`] messages
#[derive(Clone)]
pub struct EventRelay {
    target_id: TargetId,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl EventRelay {
    pub fn new(target_id: impl Into<TargetId>, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            target_id: target_id.into(),
            outbound,
        }
    }

    /// Handler relaying every invocation as an `Outbound::Event`
    pub fn event_handler(&self) -> Handler {
        let relay = self.clone();
        handler_from_fn(move |name, payload| {
            relay.send(Outbound::Event {
                target_id: relay.target_id.clone(),
                name: name.to_string(),
                payload: payload.clone(),
            });
        })
    }

    /// Handler relaying every invocation as an `Outbound::Signal`
    pub fn signal_handler(&self) -> Handler {
        let relay = self.clone();
        handler_from_fn(move |name, value| {
            relay.send(Outbound::Signal {
                target_id: relay.target_id.clone(),
                name: name.to_string(),
                value: value.clone(),
            });
        })
    }

    fn send(&self, message: Outbound) {
        // The host side may already be gone during shutdown
        if self.outbound.send(message).is_err() {
            tracing::debug!(target_id = %self.target_id, "outbound channel closed, dropping relayed message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_relay_forwards_signals() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let relay = EventRelay::new("chart", tx);

        let registration = ListenerRegistration::new(ListenerKind::Signal, "brush", relay.signal_handler());
        registration.notify(&json!([0, 10]));

        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Signal {
                target_id: "chart".to_string(),
                name: "brush".to_string(),
                value: json!([0, 10]),
            }
        );
    }

    #[test]
    fn test_outbound_wire_shape() {
        let message = Outbound::Event {
            target_id: "chart".to_string(),
            name: "click".to_string(),
            payload: json!({"x": 1}),
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"type": "event", "targetId": "chart", "name": "click", "payload": {"x": 1}})
        );
    }

    #[test]
    fn test_relay_survives_closed_host() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let relay = EventRelay::new("chart", tx);
        (relay.event_handler())("click", &Value::Null);
    }

    #[test]
    fn test_registrations_get_distinct_ids() {
        let handler = handler_from_fn(|_, _| {});
        let a = ListenerRegistration::new(ListenerKind::Event, "click", handler.clone());
        let b = ListenerRegistration::new(ListenerKind::Event, "click", handler);
        assert_ne!(a.id, b.id);
    }
}
