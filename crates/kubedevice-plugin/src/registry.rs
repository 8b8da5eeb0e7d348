//! Device-kind registry
//!
//! Maps a device kind name to a factory producing a fresh [`DevicePlugin`].
//! Plugins are linked in and registered at startup; the host never loads
//! code at runtime.

use kubedevice_core::{DeviceError, DeviceResult, PluginSpec, SharedLogger};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::gpu::GpuPlugin;
use crate::nic::NicPlugin;
use crate::traits::DevicePlugin;

/// Everything a factory gets to build one plugin instance
#[derive(Clone)]
pub struct PluginContext {
    /// Name the instance must return from `name()`
    pub instance_name: String,
    /// Plugin-specific settings from the node configuration
    pub settings: toml::Table,
    pub logger: SharedLogger,
}

impl PluginContext {
    /// Deserialize the settings table into a plugin's config type
    pub fn settings<T: DeserializeOwned>(&self) -> DeviceResult<T> {
        toml::Value::Table(self.settings.clone())
            .try_into()
            .map_err(|e| {
                DeviceError::Config(format!(
                    "invalid settings for plugin {}: {}",
                    self.instance_name, e
                ))
            })
    }
}

/// Constructor for one device kind
pub type PluginFactory =
    Arc<dyn Fn(PluginContext) -> DeviceResult<Box<dyn DevicePlugin>> + Send + Sync>;

/// Registry of device kinds
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: BTreeMap<String, PluginFactory>,
}

impl PluginRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `gpu` and `nic` plugins
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.factories.insert(
            "gpu".to_string(),
            Arc::new(|ctx: PluginContext| {
                GpuPlugin::from_context(ctx).map(|p| Box::new(p) as Box<dyn DevicePlugin>)
            }),
        );
        registry.factories.insert(
            "nic".to_string(),
            Arc::new(|ctx: PluginContext| {
                NicPlugin::from_context(ctx).map(|p| Box::new(p) as Box<dyn DevicePlugin>)
            }),
        );
        registry
    }

    /// Register a factory for a device kind
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F) -> DeviceResult<()>
    where
        F: Fn(PluginContext) -> DeviceResult<Box<dyn DevicePlugin>> + Send + Sync + 'static,
    {
        let kind = kind.into();
        if self.factories.contains_key(&kind) {
            return Err(DeviceError::Conflict(format!(
                "device kind {} is already registered",
                kind
            )));
        }
        debug!(kind = %kind, "Registered device kind");
        self.factories.insert(kind, Arc::new(factory));
        Ok(())
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered kinds in sorted order
    pub fn kinds(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Build a plugin instance for `spec` on `node_name`
    pub fn create(
        &self,
        node_name: &str,
        spec: &PluginSpec,
        logger: SharedLogger,
    ) -> DeviceResult<Box<dyn DevicePlugin>> {
        let factory = self
            .factories
            .get(&spec.kind)
            .ok_or_else(|| DeviceError::PluginNotFound(spec.kind.clone()))?;
        debug!(node = %node_name, kind = %spec.kind, "Creating plugin");

        let ctx = PluginContext {
            instance_name: spec.instance_name().to_string(),
            settings: spec.settings.clone(),
            logger,
        };
        let plugin = factory(ctx)?;

        if plugin.name() != spec.instance_name() {
            return Err(DeviceError::Conflict(format!(
                "factory for {} produced plugin named {}, expected {}",
                spec.kind,
                plugin.name(),
                spec.instance_name()
            )));
        }
        Ok(plugin)
    }
}
