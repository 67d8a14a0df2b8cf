//! Host side of the bridge: owns the registry and handles host messages

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use vw_core::view::MemoryViewFactory;
use vw_core::{
    Bridge, BridgeConfig, BridgeRegistry, EventRelay, InboundCommand, InboundCommandRouter, Outbound, Receipt,
    Specification, TargetId, TargetLanes, ViewFactory, ViewFuture,
};

/// Messages managing bridges, as opposed to commands addressed to them
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostMessage {
    /// Create the bridge if needed and (re-)render it
    #[serde(rename_all = "camelCase")]
    Render {
        target_id: TargetId,
        spec: Value,
        #[serde(default)]
        embed_options: Value,
    },
    #[serde(rename_all = "camelCase")]
    Teardown { target_id: TargetId },
    /// Forward a signal's updates to stdout
    #[serde(rename_all = "camelCase")]
    RelaySignal { target_id: TargetId, name: String },
    /// Forward an event to stdout whenever the view raises it
    #[serde(rename_all = "camelCase")]
    RelayEvent { target_id: TargetId, name: String },
    /// Raise an event on the view, as a user interaction would
    #[serde(rename_all = "camelCase")]
    Emit {
        target_id: TargetId,
        event: String,
        #[serde(default)]
        payload: Value,
    },
}

impl HostMessage {
    pub fn target_id(&self) -> &str {
        match self {
            HostMessage::Render { target_id, .. }
            | HostMessage::Teardown { target_id }
            | HostMessage::RelaySignal { target_id, .. }
            | HostMessage::RelayEvent { target_id, .. }
            | HostMessage::Emit { target_id, .. } => target_id,
        }
    }
}

/// One parsed input line
#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    Host(HostMessage),
    Command(InboundCommand),
}

impl Line {
    /// Target the line is addressed to
    pub fn target_id(&self) -> &str {
        match self {
            Line::Host(message) => message.target_id(),
            Line::Command(command) => command.target_id(),
        }
    }

    /// Host messages carry `type`; commands carry `command`
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        if value.get("type").is_some() {
            Ok(Line::Host(serde_json::from_value(value)?))
        } else if value.get("command").is_some() {
            Ok(Line::Command(serde_json::from_value(value)?))
        } else {
            anyhow::bail!("message has neither 'type' nor 'command'")
        }
    }
}

pub struct Host {
    registry: BridgeRegistry,
    factory: Arc<dyn ViewFactory>,
    config: BridgeConfig,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Host {
    pub fn new(config: BridgeConfig, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            registry: BridgeRegistry::new(),
            factory: Arc::new(MemoryViewFactory::default()),
            config,
            outbound,
        }
    }

    pub fn with_factory(mut self, factory: Arc<dyn ViewFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn registry(&self) -> &BridgeRegistry {
        &self.registry
    }

    /// Handle input lines until the channel closes
    ///
    /// Lines addressed to one target are handled in arrival order, host
    /// messages and routed commands alike; each target gets its own lane.
    /// Returns how many commands reached a bridge.
    pub async fn serve(
        self: Arc<Self>,
        router: Arc<InboundCommandRouter>,
        mut lines: mpsc::UnboundedReceiver<Line>,
    ) -> usize {
        let mut lanes = TargetLanes::new();
        while let Some(line) = lines.recv().await {
            let target = line.target_id().to_string();
            let host = Arc::clone(&self);
            let router = Arc::clone(&router);
            lanes.push(&target, line, move |queue| host.drain(router, queue));
        }
        lanes.close().await
    }

    async fn drain(
        self: Arc<Self>,
        router: Arc<InboundCommandRouter>,
        mut lines: mpsc::UnboundedReceiver<Line>,
    ) -> usize {
        let mut routed = 0;
        while let Some(line) = lines.recv().await {
            match line {
                Line::Host(message) => self.handle(message),
                Line::Command(command) => {
                    if router.route(command).await.is_ok() {
                        routed += 1;
                    }
                }
            }
        }
        routed
    }

    pub fn handle(&self, message: HostMessage) {
        match message {
            HostMessage::Render {
                target_id,
                spec,
                embed_options,
            } => {
                let future = self.bridge(&target_id).render(Specification {
                    chart_spec: spec,
                    embed_options,
                });
                tokio::spawn(announce(target_id, future));
            }
            HostMessage::Teardown { target_id } => {
                if !self.registry.unregister(&target_id) {
                    warn!(target_id = %target_id, "teardown of unknown bridge");
                }
            }
            HostMessage::RelaySignal { target_id, name } => {
                let relay = EventRelay::new(target_id.clone(), self.outbound.clone());
                let receipt = self.bridge(&target_id).add_signal_listener(&name, relay.signal_handler());
                tokio::spawn(log_failure(target_id, "relaySignal", receipt));
            }
            HostMessage::RelayEvent { target_id, name } => {
                let relay = EventRelay::new(target_id.clone(), self.outbound.clone());
                let receipt = self.bridge(&target_id).add_event_listener(&name, relay.event_handler());
                tokio::spawn(log_failure(target_id, "relayEvent", receipt));
            }
            HostMessage::Emit {
                target_id,
                event,
                payload,
            } => {
                let receipt = self.bridge(&target_id).call_view("emit", vec![json!(event), payload], Some(false));
                tokio::spawn(log_failure(target_id, "emit", receipt));
            }
        }
    }

    /// Tear every bridge down and wait until their views are done
    ///
    /// Commands buffered for a view still under construction are applied
    /// first.
    pub async fn shutdown(&self) {
        let mut finishing = Vec::new();
        for id in self.registry.ids() {
            if let Some(bridge) = self.registry.get(&id) {
                if bridge.is_rendered() {
                    let _ = bridge.ready().await;
                }
                finishing.push(bridge.view());
            }
            self.registry.unregister(&id);
        }
        for future in finishing {
            future.finished().await;
        }
    }

    fn bridge(&self, target_id: &str) -> Arc<Bridge> {
        match self.registry.get(target_id) {
            Some(bridge) => bridge,
            None => {
                let bridge = Bridge::new(target_id, Arc::clone(&self.factory)).with_config(&self.config);
                self.registry.register(Arc::new(bridge))
            }
        }
    }
}

async fn announce(target_id: TargetId, future: ViewFuture) {
    match future.wait().await {
        Ok(()) => info!(target_id = %target_id, generation = future.generation(), "view rendered"),
        Err(err) => warn!(target_id = %target_id, generation = future.generation(), %err, "view not rendered"),
    }
}

async fn log_failure<T>(target_id: TargetId, what: &'static str, receipt: Receipt<T>) {
    if let Err(err) = receipt.outcome().await {
        warn!(target_id = %target_id, what, %err, "host request failed");
    }
}
