//! Launch descriptors

use kubedevice_core::{DeviceError, DeviceResult, Mount};
use kubedevice_plugin::Allocation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything the container runtime needs to start a workload with its devices
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchDescriptor {
    /// Bind mounts from every plugin, in plugin order
    pub mounts: Vec<Mount>,
    /// Device ids grouped by the plugin that handed them out
    pub devices: BTreeMap<String, Vec<String>>,
    /// All device ids, flattened in plugin order
    pub device_ids: Vec<String>,
    /// Merged environment
    pub env: BTreeMap<String, String>,
}

impl LaunchDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one plugin's allocation into the descriptor
    ///
    /// Two mounts at the same container path, or one env variable set to
    /// different values, are a `Conflict`. The descriptor is unchanged when
    /// this fails.
    pub fn merge(&mut self, plugin: &str, allocation: Allocation) -> DeviceResult<()> {
        for mount in &allocation.mounts {
            if let Some(existing) = self
                .mounts
                .iter()
                .find(|m| m.container_path == mount.container_path)
            {
                return Err(DeviceError::Conflict(format!(
                    "plugin {} mounts {} over {} at {}",
                    plugin, mount.host_path, existing.host_path, mount.container_path
                )));
            }
        }
        let mut seen = std::collections::BTreeSet::new();
        for mount in &allocation.mounts {
            if !seen.insert(mount.container_path.as_str()) {
                return Err(DeviceError::Conflict(format!(
                    "plugin {} mounts {} twice",
                    plugin, mount.container_path
                )));
            }
        }
        for (key, value) in &allocation.env {
            match self.env.get(key) {
                Some(current) if current != value => {
                    return Err(DeviceError::Conflict(format!(
                        "plugin {} sets {}={} but it is already {}",
                        plugin, key, value, current
                    )));
                }
                _ => {}
            }
        }

        self.mounts.extend(allocation.mounts);
        self.env.extend(allocation.env);
        if !allocation.device_ids.is_empty() {
            self.device_ids.extend(allocation.device_ids.iter().cloned());
            self.devices
                .entry(plugin.to_string())
                .or_default()
                .extend(allocation.device_ids);
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty() && self.device_ids.is_empty() && self.env.is_empty()
    }
}
