//! Tri-level model configuration: values can be stored against an
//! interface, a node or a whole radio network, with model defaults as
//! the floor.

use std::collections::HashMap;

use crate::model::{ModelConfig, ModelRegistry};
use crate::{IfaceId, IfaceKey, NodeId, Result};

/// Scope a stored configuration applies to. Resolution for an interface
/// walks `Iface` then `Node` then `Net` before model defaults.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ConfigKey {
    Node(NodeId),
    Iface(NodeId, IfaceId),
    Net(NodeId),
}

/// Stored model configurations plus the model pre-declared for nodes
/// whose networks do not exist yet.
#[derive(Default)]
pub struct ConfigStore {
    configs: HashMap<ConfigKey, HashMap<String, ModelConfig>>,
    node_models: HashMap<NodeId, String>,
}

impl ConfigStore {
    pub fn new() -> Self {
        ConfigStore::default()
    }

    /// The stored configuration for `key` and `model`, or the model's
    /// defaults when `default` is set, or `None`.
    pub fn get(
        &self,
        registry: &ModelRegistry,
        key: ConfigKey,
        model: &str,
        default: bool,
    ) -> Result<Option<ModelConfig>> {
        let model_class = registry.get(model)?;
        let config = self.configs.get(&key).and_then(|m| m.get(model)).cloned();
        Ok(match config {
            Some(config) => Some(config),
            None if default => Some(model_class.default_values()),
            None => None,
        })
    }

    /// Merge `config` over the current (or default) configuration for
    /// `key` and `model`.
    pub fn set(
        &mut self,
        registry: &ModelRegistry,
        key: ConfigKey,
        model: &str,
        config: &ModelConfig,
    ) -> Result<()> {
        let mut merged = self
            .get(registry, key, model, true)?
            .unwrap_or_default();
        merged.extend(config.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.configs
            .entry(key)
            .or_default()
            .insert(model.to_owned(), merged);
        Ok(())
    }

    /// Pre-declare the model a node will use.
    pub fn set_node_model(&mut self, node_id: NodeId, model: &str) {
        self.node_models.insert(node_id, model.to_owned());
    }

    pub fn node_model(&self, node_id: NodeId) -> Option<&str> {
        self.node_models.get(&node_id).map(String::as_str)
    }

    /// Drop everything, or only the given node's configurations and
    /// model selection.
    pub fn reset(&mut self, node_id: Option<NodeId>) {
        match node_id {
            None => {
                self.configs.clear();
                self.node_models.clear();
            }
            Some(id) => {
                self.configs.retain(|key, _| {
                    !matches!(key, ConfigKey::Node(n) | ConfigKey::Iface(n, _) if *n == id)
                });
                self.node_models.remove(&id);
            }
        }
    }

    /// Effective configuration for an interface on a radio network:
    /// interface-specific first, then node, then network, then model
    /// defaults. The first non-empty hit wins.
    pub fn iface_config(
        &self,
        registry: &ModelRegistry,
        model: &str,
        net_id: NodeId,
        iface: IfaceKey,
    ) -> Result<ModelConfig> {
        let keys = [
            ConfigKey::Iface(iface.0, iface.1),
            ConfigKey::Node(iface.0),
            ConfigKey::Net(net_id),
        ];
        for key in keys {
            if let Some(config) = self.get(registry, key, model, false)? {
                if !config.is_empty() {
                    return Ok(config);
                }
            }
        }
        Ok(registry.get(model)?.default_values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RadioError;

    fn store_with(entries: &[(ConfigKey, &str, &str)]) -> (ModelRegistry, ConfigStore) {
        let registry = ModelRegistry::with_defaults();
        let mut store = ConfigStore::new();
        for (key, option, value) in entries {
            let config =
                ModelConfig::from([((*option).to_owned(), (*value).to_owned())]);
            store.set(&registry, *key, "rfpipe", &config).unwrap();
        }
        (registry, store)
    }

    #[test]
    fn unknown_model_is_rejected() {
        let registry = ModelRegistry::with_defaults();
        let mut store = ConfigStore::new();
        let err = store
            .set(&registry, ConfigKey::Node(1), "nomodel", &ModelConfig::new())
            .unwrap_err();
        assert!(matches!(err, RadioError::UnknownModel(_)));
    }

    #[test]
    fn set_merges_over_defaults() {
        let (registry, store) = store_with(&[(ConfigKey::Node(2), "datarate", "11M")]);
        let config = store
            .get(&registry, ConfigKey::Node(2), "rfpipe", false)
            .unwrap()
            .unwrap();
        assert_eq!(config.get("datarate").map(String::as_str), Some("11M"));
        // untouched defaults survive the merge
        assert_eq!(config.get("delay").map(String::as_str), Some("0"));
    }

    #[test]
    fn resolution_priority_is_iface_node_net_defaults() {
        let (registry, store) = store_with(&[
            (ConfigKey::Iface(2, 0), "datarate", "iface"),
            (ConfigKey::Node(2), "datarate", "node"),
            (ConfigKey::Net(10), "datarate", "net"),
        ]);

        let pick = |store: &ConfigStore, iface: IfaceKey| {
            store
                .iface_config(&registry, "rfpipe", 10, iface)
                .unwrap()
                .remove("datarate")
                .unwrap()
        };

        assert_eq!(pick(&store, (2, 0)), "iface");

        let (_, store2) = store_with(&[
            (ConfigKey::Node(2), "datarate", "node"),
            (ConfigKey::Net(10), "datarate", "net"),
        ]);
        assert_eq!(pick(&store2, (2, 0)), "node");

        let (_, store3) = store_with(&[(ConfigKey::Net(10), "datarate", "net")]);
        assert_eq!(pick(&store3, (2, 0)), "net");

        let (_, store4) = store_with(&[]);
        assert_eq!(pick(&store4, (2, 0)), "1M");
    }

    #[test]
    fn reset_scopes_to_one_node() {
        let (registry, mut store) = store_with(&[
            (ConfigKey::Node(2), "datarate", "11M"),
            (ConfigKey::Iface(2, 0), "delay", "5"),
            (ConfigKey::Node(3), "datarate", "54M"),
        ]);
        store.set_node_model(2, "rfpipe");
        store.set_node_model(3, "rfpipe");

        store.reset(Some(2));
        assert!(store
            .get(&registry, ConfigKey::Node(2), "rfpipe", false)
            .unwrap()
            .is_none());
        assert!(store
            .get(&registry, ConfigKey::Iface(2, 0), "rfpipe", false)
            .unwrap()
            .is_none());
        assert!(store
            .get(&registry, ConfigKey::Node(3), "rfpipe", false)
            .unwrap()
            .is_some());
        assert_eq!(store.node_model(2), None);
        assert_eq!(store.node_model(3), Some("rfpipe"));

        store.reset(None);
        assert!(store
            .get(&registry, ConfigKey::Node(3), "rfpipe", false)
            .unwrap()
            .is_none());
    }
}
