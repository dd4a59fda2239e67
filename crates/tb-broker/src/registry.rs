//! Target registry
//!
//! Static catalog of targets built once from configuration. The catalog
//! itself never changes while the daemon runs; only each target's enabled
//! flag and runtime properties may be updated, through the methods below.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use tb_core::config::{TargetConfig, TargetType, TestingPolicy, Toolchain};
use tb_core::{BrokerError, TargetId};

/// Mutable part of a target
#[derive(Debug, Clone)]
struct TargetRuntime {
    enabled: bool,
    properties: BTreeMap<String, serde_json::Value>,
}

/// A registered target
pub struct TargetEntry {
    pub id: TargetId,
    pub config: TargetConfig,
    runtime: RwLock<TargetRuntime>,
}

impl TargetEntry {
    fn new(config: TargetConfig) -> Self {
        Self {
            id: TargetId::new(config.id.clone()),
            runtime: RwLock::new(TargetRuntime {
                enabled: true,
                properties: config.properties.clone(),
            }),
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.runtime.read().enabled
    }

    /// Snapshot for clients
    pub fn info(&self) -> TargetInfo {
        let runtime = self.runtime.read().clone();
        TargetInfo {
            id: self.id.to_string(),
            name: self.config.name.clone(),
            target_type: self.config.target_type,
            arch: self.config.arch.clone(),
            toolchains: self.config.toolchains.clone(),
            ram: self.config.ram,
            flash: self.config.flash,
            features: self.config.features.clone(),
            testing: self.config.testing.clone(),
            power: self.config.power.iter().map(|c| c.name.clone()).collect(),
            consoles: self.config.consoles.iter().map(|c| c.name.clone()).collect(),
            enabled: runtime.enabled,
            properties: runtime.properties,
        }
    }
}

/// Serializable view of a target
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub target_type: TargetType,
    pub arch: String,
    pub toolchains: Vec<Toolchain>,
    pub ram: u64,
    pub flash: u64,
    pub features: Vec<String>,
    pub testing: TestingPolicy,
    pub power: Vec<String>,
    pub consoles: Vec<String>,
    pub enabled: bool,
    pub properties: BTreeMap<String, serde_json::Value>,
}

/// Catalog of all targets served by this broker
pub struct TargetRegistry {
    targets: BTreeMap<TargetId, Arc<TargetEntry>>,
}

impl TargetRegistry {
    /// Build the registry from already-validated target definitions
    pub fn new(configs: impl IntoIterator<Item = TargetConfig>) -> Self {
        let targets = configs
            .into_iter()
            .map(|config| {
                let entry = Arc::new(TargetEntry::new(config));
                (entry.id.clone(), entry)
            })
            .collect();
        Self { targets }
    }

    /// Look up a target
    pub fn get(&self, id: &TargetId) -> Result<Arc<TargetEntry>, BrokerError> {
        self.targets
            .get(id)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(format!("target {}", id)))
    }

    pub fn contains(&self, id: &TargetId) -> bool {
        self.targets.contains_key(id)
    }

    /// All targets, ordered by ID
    pub fn list(&self) -> Vec<Arc<TargetEntry>> {
        self.targets.values().cloned().collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = &TargetId> {
        self.targets.keys()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Enable or disable a target for new allocations
    pub fn set_enabled(&self, id: &TargetId, enabled: bool) -> Result<(), BrokerError> {
        let entry = self.get(id)?;
        entry.runtime.write().enabled = enabled;
        tracing::info!(target_id = %id, enabled, "Target availability changed");
        Ok(())
    }

    /// Set runtime properties; a JSON `null` removes the property
    pub fn set_properties(
        &self,
        id: &TargetId,
        updates: BTreeMap<String, serde_json::Value>,
    ) -> Result<BTreeMap<String, serde_json::Value>, BrokerError> {
        let entry = self.get(id)?;
        if let Some(key) = updates.keys().find(|k| k.is_empty()) {
            return Err(BrokerError::InvalidInput(format!(
                "invalid property name '{}'",
                key
            )));
        }

        let mut runtime = entry.runtime.write();
        for (key, value) in updates {
            if value.is_null() {
                runtime.properties.remove(&key);
            } else {
                runtime.properties.insert(key, value);
            }
        }
        Ok(runtime.properties.clone())
    }

    pub fn properties(
        &self,
        id: &TargetId,
    ) -> Result<BTreeMap<String, serde_json::Value>, BrokerError> {
        Ok(self.get(id)?.runtime.read().properties.clone())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;
    use tb_core::config::{
        ConsoleConfig, ConsoleDriverConfig, PowerComponentConfig, PowerDriverConfig,
    };
    use tb_core::ErrorKind;

    /// Minimal QEMU target with one simulated power point and a loopback console
    pub(crate) fn qemu_target(id: &str) -> TargetConfig {
        TargetConfig {
            id: id.into(),
            name: format!("QEMU {}", id),
            target_type: TargetType::Qemu,
            arch: "x86_64".into(),
            toolchains: vec![Toolchain::Zephyr],
            ram: 1 << 20,
            flash: 0,
            features: vec![],
            testing: TestingPolicy::default(),
            power: vec![PowerComponentConfig {
                name: "vm".into(),
                driver: PowerDriverConfig::Simulated { initial: false },
                explicit: None,
            }],
            power_cycle_wait: Duration::ZERO,
            consoles: vec![ConsoleConfig {
                name: "ttyS0".into(),
                driver: ConsoleDriverConfig::Loopback,
                enabled: true,
            }],
            properties: BTreeMap::new(),
        }
    }

    #[test]
    fn test_get_unknown_target() {
        let registry = TargetRegistry::new(vec![qemu_target("qemu-01")]);
        let err = registry.get(&TargetId::new("qemu-99")).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_enable_disable() {
        let registry = TargetRegistry::new(vec![qemu_target("qemu-01")]);
        let id = TargetId::new("qemu-01");
        assert!(registry.get(&id).unwrap().is_enabled());
        registry.set_enabled(&id, false).unwrap();
        assert!(!registry.get(&id).unwrap().is_enabled());
        assert!(!registry.get(&id).unwrap().info().enabled);
    }

    #[test]
    fn test_properties_set_and_remove() {
        let registry = TargetRegistry::new(vec![qemu_target("qemu-01")]);
        let id = TargetId::new("qemu-01");

        let mut updates = BTreeMap::new();
        updates.insert("ip".to_string(), serde_json::json!("10.0.0.2"));
        registry.set_properties(&id, updates).unwrap();
        assert_eq!(registry.properties(&id).unwrap()["ip"], "10.0.0.2");

        let mut updates = BTreeMap::new();
        updates.insert("ip".to_string(), serde_json::Value::Null);
        let props = registry.set_properties(&id, updates).unwrap();
        assert!(props.is_empty());
    }
}
