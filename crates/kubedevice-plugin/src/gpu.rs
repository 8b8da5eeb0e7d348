//! GPU detection and allocation
//!
//! Devices are the `/dev/nvidia<N>` character nodes under a configurable dev
//! root, or an explicit list of node names from the settings. Each allocated
//! device is bind-mounted into the container and its index exported through
//! `NVIDIA_VISIBLE_DEVICES`.

use kubedevice_core::{
    ContainerInfo, DeviceError, DeviceResult, Mount, NodeInfo, PodInfo, Quantity, SharedLogger,
    UsageLedger,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::pool::{holder_key, DevicePool, PooledDevice};
use crate::registry::PluginContext;
use crate::traits::{Allocation, DevicePlugin};

/// Represents a GPU device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuDevice {
    /// Device index
    pub index: u32,
    /// Device node name, e.g. `nvidia0`
    pub name: String,
    /// Device node on the host
    pub path: PathBuf,
}

impl PooledDevice for GpuDevice {
    fn id(&self) -> &str {
        &self.name
    }
}

/// GPU plugin settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuPluginConfig {
    /// Resource name in dev requests and the ledger
    pub resource_name: String,
    /// Resource name advertised to the orchestrator
    pub kube_resource_name: String,
    /// Directory holding the device nodes
    pub dev_root: PathBuf,
    /// Device node names to use instead of scanning `dev_root`
    pub devices: Option<Vec<String>>,
    /// Require every device node to exist at start
    pub verify_device_nodes: bool,
    /// Devices held back for the system
    pub reserved: u64,
    /// Extra mounts for every allocation (driver libraries, control nodes)
    pub driver_mounts: Vec<Mount>,
    /// Variable receiving the comma-separated device indices
    pub visible_devices_env: String,
}

impl Default for GpuPluginConfig {
    fn default() -> Self {
        Self {
            resource_name: "gpu".to_string(),
            kube_resource_name: "nvidia.com/gpu".to_string(),
            dev_root: PathBuf::from("/dev"),
            devices: None,
            verify_device_nodes: true,
            reserved: 0,
            driver_mounts: Vec::new(),
            visible_devices_env: "NVIDIA_VISIBLE_DEVICES".to_string(),
        }
    }
}

/// Parse the index out of a `nvidia<N>` node name
fn device_index(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("nvidia")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Detect GPUs under a dev root
///
/// Only `nvidia<N>` nodes count; control nodes such as `nvidiactl` and
/// `nvidia-uvm` are skipped.
pub fn detect_gpus(dev_root: &Path) -> DeviceResult<Vec<GpuDevice>> {
    let entries = std::fs::read_dir(dev_root).map_err(|e| {
        DeviceError::Init(format!("cannot scan {}: {}", dev_root.display(), e))
    })?;

    let mut devices = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(index) = device_index(&name) {
            devices.push(GpuDevice {
                index,
                path: entry.path(),
                name,
            });
        }
    }
    devices.sort_by_key(|d| d.index);
    Ok(devices)
}

/// GPU device plugin
pub struct GpuPlugin {
    name: String,
    config: GpuPluginConfig,
    logger: SharedLogger,
    pool: Mutex<DevicePool<GpuDevice>>,
}

impl GpuPlugin {
    pub fn new(name: impl Into<String>, config: GpuPluginConfig, logger: SharedLogger) -> Self {
        Self {
            name: name.into(),
            config,
            logger,
            pool: Mutex::new(DevicePool::empty()),
        }
    }

    /// Registry factory entry point
    pub fn from_context(ctx: PluginContext) -> DeviceResult<Self> {
        let config: GpuPluginConfig = ctx.settings()?;
        Ok(Self::new(ctx.instance_name, config, ctx.logger))
    }

    fn pool(&self) -> MutexGuard<'_, DevicePool<GpuDevice>> {
        self.pool.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn discover(&self) -> DeviceResult<Vec<GpuDevice>> {
        match &self.config.devices {
            Some(names) => {
                let mut devices = Vec::with_capacity(names.len());
                for name in names {
                    let index = device_index(name).ok_or_else(|| {
                        DeviceError::Init(format!("{} is not a GPU device node name", name))
                    })?;
                    devices.push(GpuDevice {
                        index,
                        name: name.clone(),
                        path: self.config.dev_root.join(name),
                    });
                }
                devices.sort_by_key(|d| d.index);
                if let Some(pair) = devices.windows(2).find(|w| w[0].index == w[1].index) {
                    return Err(DeviceError::Init(format!(
                        "{} and {} are the same GPU index {}",
                        pair[0].name, pair[1].name, pair[0].index
                    )));
                }
                Ok(devices)
            }
            None => detect_gpus(&self.config.dev_root),
        }
    }
}

impl DevicePlugin for GpuPlugin {
    fn init(&mut self) -> DeviceResult<()> {
        let devices = self.discover()?;
        self.logger.log(
            2,
            format_args!(
                "plugin {} found {} GPUs under {}",
                self.name,
                devices.len(),
                self.config.dev_root.display()
            ),
        );
        *self.pool.get_mut().unwrap_or_else(|e| e.into_inner()) =
            DevicePool::new(devices, self.config.reserved);
        Ok(())
    }

    fn start(&mut self) -> DeviceResult<()> {
        if !self.config.verify_device_nodes {
            return Ok(());
        }
        let pool = self.pool.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(missing) = pool.devices().iter().find(|d| !d.path.exists()) {
            return Err(DeviceError::Start(format!(
                "device node {} is missing",
                missing.path.display()
            )));
        }
        Ok(())
    }

    fn update_node_info(&self, node: &mut NodeInfo) -> DeviceResult<()> {
        let pool = self.pool();
        let resource = &self.config.resource_name;
        let kube = &self.config.kube_resource_name;

        node.capacity
            .insert(resource.clone(), Quantity(pool.total_count()));
        node.allocatable
            .insert(resource.clone(), Quantity(pool.allocatable_count()));
        node.used
            .insert(resource.clone(), Quantity(pool.allocated_count()));
        node.kube_cap.insert(kube.clone(), Quantity(pool.total_count()));
        node.kube_alloc
            .insert(kube.clone(), Quantity(pool.allocatable_count()));
        node.scorer.insert(
            self.name.clone(),
            serde_json::json!({
                "free": pool.available_count(),
                "devices": pool.devices().iter().map(|d| d.index).collect::<Vec<_>>(),
            }),
        );
        Ok(())
    }

    fn allocate(
        &self,
        pod: &PodInfo,
        container_name: &str,
        container: &mut ContainerInfo,
        ledger: &mut UsageLedger<'_>,
    ) -> DeviceResult<Allocation> {
        let resource = &self.config.resource_name;
        let holder = holder_key(pod, container_name);
        let devices = self
            .pool()
            .allocate_for(resource, &holder, container, ledger)
            .map_err(|e| {
                self.logger.warn(format_args!(
                    "plugin {} could not allocate for pod {}: {}",
                    self.name, pod.name, e
                ));
                e
            })?;
        if devices.is_empty() {
            return Ok(Allocation::default());
        }

        let mut mounts: Vec<Mount> = devices
            .iter()
            .map(|d| Mount::new(format!("/dev/{}", d.name), d.path.display().to_string(), false))
            .collect();
        mounts.extend(self.config.driver_mounts.iter().cloned());

        let indices = devices
            .iter()
            .map(|d| d.index.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let mut allocation = Allocation {
            mounts,
            device_ids: devices.iter().map(|d| d.name.clone()).collect(),
            ..Default::default()
        };
        allocation
            .env
            .insert(self.config.visible_devices_env.clone(), indices);

        self.logger.log(
            2,
            format_args!(
                "plugin {} allocated {:?} to pod {}",
                self.name, allocation.device_ids, pod.name
            ),
        );
        Ok(allocation)
    }

    fn release(
        &self,
        pod: &PodInfo,
        container_name: &str,
        container: &mut ContainerInfo,
        device_ids: &[String],
        ledger: &mut UsageLedger<'_>,
    ) -> DeviceResult<()> {
        let holder = holder_key(pod, container_name);
        self.pool().release_for(
            &self.config.resource_name,
            &holder,
            container,
            device_ids,
            ledger,
        )?;
        self.logger.log(
            2,
            format_args!(
                "plugin {} released {:?} from pod {}",
                self.name, device_ids, pod.name
            ),
        );
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
