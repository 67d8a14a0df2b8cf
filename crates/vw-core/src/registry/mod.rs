use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::bridge::Bridge;
use crate::TargetId;

/// Result of looking a target id up
pub enum Lookup {
    /// A bridge is registered under the id
    Found(Arc<Bridge>),
    /// Nothing is registered under the id (yet)
    NotFound,
    /// The id names something that is not a bridge
    Invalid { kind: String },
}

impl std::fmt::Debug for Lookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lookup::Found(bridge) => f.debug_tuple("Found").field(&bridge.id()).finish(),
            Lookup::NotFound => f.write_str("NotFound"),
            Lookup::Invalid { kind } => f.debug_struct("Invalid").field("kind", kind).finish(),
        }
    }
}

/// Resolves target ids to bridge instances
pub trait Locate: Send + Sync {
    fn locate(&self, target_id: &str) -> Lookup;
}

enum Slot {
    Bridge(Arc<Bridge>),
    Foreign { kind: String },
}

/// Shared table of the bridges living in one host
///
/// Clones share the same table.
#[derive(Clone, Default)]
pub struct BridgeRegistry {
    slots: Arc<RwLock<AHashMap<TargetId, Slot>>>,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bridge under its own id, replacing whatever was there
    pub fn register(&self, bridge: Arc<Bridge>) -> Arc<Bridge> {
        let id = bridge.id().to_string();
        let previous = self.slots.write().insert(id.clone(), Slot::Bridge(Arc::clone(&bridge)));
        if let Some(Slot::Bridge(previous)) = previous {
            if !Arc::ptr_eq(&previous, &bridge) {
                previous.teardown();
            }
        }
        debug!(target_id = %id, "registered bridge");
        bridge
    }

    /// Occupy an id with something that is not a bridge
    pub fn register_foreign(&self, target_id: impl Into<TargetId>, kind: impl Into<String>) {
        let target_id = target_id.into();
        let previous = self.slots.write().insert(target_id, Slot::Foreign { kind: kind.into() });
        if let Some(Slot::Bridge(previous)) = previous {
            previous.teardown();
        }
    }

    /// Remove an id; a bridge registered there is torn down
    pub fn unregister(&self, target_id: &str) -> bool {
        let removed = self.slots.write().remove(target_id);
        match removed {
            Some(Slot::Bridge(bridge)) => {
                bridge.teardown();
                debug!(target_id, "unregistered bridge");
                true
            }
            Some(Slot::Foreign { .. }) => true,
            None => false,
        }
    }

    /// The bridge registered under `target_id`, if any
    pub fn get(&self, target_id: &str) -> Option<Arc<Bridge>> {
        match self.slots.read().get(target_id) {
            Some(Slot::Bridge(bridge)) => Some(Arc::clone(bridge)),
            _ => None,
        }
    }

    /// Every registered id, sorted
    pub fn ids(&self) -> Vec<TargetId> {
        let mut ids: Vec<_> = self.slots.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

impl Locate for BridgeRegistry {
    fn locate(&self, target_id: &str) -> Lookup {
        match self.slots.read().get(target_id) {
            Some(Slot::Bridge(bridge)) => Lookup::Found(Arc::clone(bridge)),
            Some(Slot::Foreign { kind }) => Lookup::Invalid { kind: kind.clone() },
            None => Lookup::NotFound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Readiness;
    use crate::view::{MemoryViewFactory, Specification, ViewProbe};
    use serde_json::json;

    fn bridge(id: &str) -> Arc<Bridge> {
        Arc::new(Bridge::new(id, Arc::new(MemoryViewFactory::new(ViewProbe::default()))))
    }

    #[test]
    fn test_locate() {
        let registry = BridgeRegistry::new();
        registry.register(bridge("chart"));
        registry.register_foreign("sidebar", "div");

        assert!(matches!(registry.locate("chart"), Lookup::Found(b) if b.id() == "chart"));
        assert!(matches!(registry.locate("sidebar"), Lookup::Invalid { kind } if kind == "div"));
        assert!(matches!(registry.locate("missing"), Lookup::NotFound));
        assert!(registry.get("sidebar").is_none());
        assert_eq!(registry.ids(), vec!["chart".to_string(), "sidebar".to_string()]);
    }

    #[test]
    fn test_clones_share_table() {
        let registry = BridgeRegistry::new();
        let other = registry.clone();
        other.register(bridge("chart"));
        assert_eq!(registry.len(), 1);
        assert!(registry.unregister("chart"));
        assert!(!registry.unregister("chart"));
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_tears_down() {
        let registry = BridgeRegistry::new();
        let chart = registry.register(bridge("chart"));
        chart.render(Specification::new(json!({}))).wait().await.unwrap();

        let before = chart.view();
        registry.unregister("chart");
        while before.readiness() != Readiness::Retired {
            tokio::task::yield_now().await;
        }
        assert_ne!(chart.view().generation(), before.generation());
    }

    #[tokio::test]
    async fn test_replacing_a_bridge_tears_the_old_one_down() {
        let registry = BridgeRegistry::new();
        let first = registry.register(bridge("chart"));
        let future = first.render(Specification::new(json!({})));
        future.wait().await.unwrap();

        registry.register(bridge("chart"));
        while future.readiness() != Readiness::Retired {
            tokio::task::yield_now().await;
        }
        assert!(!Arc::ptr_eq(&registry.get("chart").unwrap(), &first));
    }
}
