//! Plugin lifecycle enforcement
//!
//! Wraps a [`DevicePlugin`] and tracks where it is in
//! `Uninitialized -> Constructed -> Ready`. Calls made out of order are
//! rejected here, before they reach the plugin. A failed `init` or `start`
//! leaves the plugin in `Failed` for good.

use kubedevice_core::{
    ContainerInfo, DeviceError, DeviceResult, NodeInfo, PodInfo, SharedLogger, UsageLedger,
};
use serde::Serialize;

use crate::traits::{Allocation, DevicePlugin};

/// Lifecycle state of a hosted plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    /// Created by its factory, nothing run yet
    Uninitialized,
    /// `init` succeeded
    Constructed,
    /// `start` succeeded, allocations allowed
    Ready,
    /// `init` or `start` failed
    Failed,
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginState::Uninitialized => write!(f, "Uninitialized"),
            PluginState::Constructed => write!(f, "Constructed"),
            PluginState::Ready => write!(f, "Ready"),
            PluginState::Failed => write!(f, "Failed"),
        }
    }
}

/// A plugin together with its lifecycle state
pub struct ManagedPlugin {
    plugin: Box<dyn DevicePlugin>,
    state: PluginState,
    logger: SharedLogger,
}

impl ManagedPlugin {
    pub fn new(plugin: Box<dyn DevicePlugin>, logger: SharedLogger) -> Self {
        Self {
            plugin,
            state: PluginState::Uninitialized,
            logger,
        }
    }

    pub fn name(&self) -> &str {
        self.plugin.name()
    }

    pub fn state(&self) -> PluginState {
        self.state
    }

    /// Run the construction step; allowed exactly once
    pub fn init(&mut self) -> DeviceResult<()> {
        if self.state != PluginState::Uninitialized {
            return Err(DeviceError::Init(format!(
                "plugin {} cannot be initialized from state {}",
                self.name(),
                self.state
            )));
        }
        match self.plugin.init() {
            Ok(()) => {
                self.state = PluginState::Constructed;
                self.logger
                    .log(3, format_args!("plugin {} constructed", self.plugin.name()));
                Ok(())
            }
            Err(e) => {
                self.state = PluginState::Failed;
                Err(as_kind(e, DeviceError::Init))
            }
        }
    }

    /// Run logical initialization; requires a constructed plugin
    pub fn start(&mut self) -> DeviceResult<()> {
        if self.state != PluginState::Constructed {
            return Err(DeviceError::Start(format!(
                "plugin {} cannot be started from state {}",
                self.name(),
                self.state
            )));
        }
        match self.plugin.start() {
            Ok(()) => {
                self.state = PluginState::Ready;
                self.logger
                    .log(2, format_args!("plugin {} ready", self.plugin.name()));
                Ok(())
            }
            Err(e) => {
                self.state = PluginState::Failed;
                Err(as_kind(e, DeviceError::Start))
            }
        }
    }

    /// `init` followed by `start`
    pub fn bring_up(&mut self) -> DeviceResult<()> {
        self.init()?;
        self.start()
    }

    pub fn update_node_info(&self, node: &mut NodeInfo) -> DeviceResult<()> {
        self.ensure_ready()?;
        self.plugin
            .update_node_info(node)
            .map_err(|e| as_kind(e, DeviceError::Report))
    }

    pub fn allocate(
        &self,
        pod: &PodInfo,
        container_name: &str,
        container: &mut ContainerInfo,
        ledger: &mut UsageLedger<'_>,
    ) -> DeviceResult<Allocation> {
        self.ensure_ready()?;
        self.plugin.allocate(pod, container_name, container, ledger)
    }

    pub fn release(
        &self,
        pod: &PodInfo,
        container_name: &str,
        container: &mut ContainerInfo,
        device_ids: &[String],
        ledger: &mut UsageLedger<'_>,
    ) -> DeviceResult<()> {
        self.ensure_ready()?;
        self.plugin
            .release(pod, container_name, container, device_ids, ledger)
    }

    fn ensure_ready(&self) -> DeviceResult<()> {
        if self.state == PluginState::Ready {
            Ok(())
        } else {
            Err(DeviceError::NotReady(format!(
                "plugin {} is {}",
                self.name(),
                self.state
            )))
        }
    }
}

/// Keep errors already of the expected kind, wrap everything else in it
fn as_kind(err: DeviceError, kind: fn(String) -> DeviceError) -> DeviceError {
    let wrapped = kind(String::new());
    if std::mem::discriminant(&err) == std::mem::discriminant(&wrapped) {
        err
    } else {
        kind(err.to_string())
    }
}
