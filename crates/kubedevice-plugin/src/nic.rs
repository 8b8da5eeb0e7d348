//! Network interface detection and allocation
//!
//! Physical interfaces are the entries under the sysfs net root that carry a
//! `device` link. Allocated interfaces are handed to the container runtime by
//! name through an environment variable; nothing is mounted.

use kubedevice_core::{
    ContainerInfo, DeviceError, DeviceResult, NodeInfo, PodInfo, Quantity, SharedLogger,
    UsageLedger,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::pool::{holder_key, DevicePool, PooledDevice};
use crate::registry::PluginContext;
use crate::traits::{Allocation, DevicePlugin};

/// A host network interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetInterface {
    pub name: String,
    /// Interface directory under the sysfs net root
    pub sys_path: PathBuf,
}

impl NetInterface {
    /// Contents of `operstate`, if readable
    pub fn operstate(&self) -> Option<String> {
        std::fs::read_to_string(self.sys_path.join("operstate"))
            .ok()
            .map(|s| s.trim().to_string())
    }
}

impl PooledDevice for NetInterface {
    fn id(&self) -> &str {
        &self.name
    }
}

/// NIC plugin settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NicPluginConfig {
    pub resource_name: String,
    pub kube_resource_name: String,
    /// Directory listing the host's interfaces
    pub sys_net_root: PathBuf,
    /// Interface names to use instead of scanning `sys_net_root`
    pub interfaces: Option<Vec<String>>,
    /// Drop interfaces reporting `operstate` down at start
    pub skip_down: bool,
    pub reserved: u64,
    /// Variable receiving the comma-separated interface names
    pub env_name: String,
}

impl Default for NicPluginConfig {
    fn default() -> Self {
        Self {
            resource_name: "nic".to_string(),
            kube_resource_name: "kubedevice.io/nic".to_string(),
            sys_net_root: PathBuf::from("/sys/class/net"),
            interfaces: None,
            skip_down: true,
            reserved: 0,
            env_name: "KUBEDEVICE_NICS".to_string(),
        }
    }
}

/// List physical interfaces under a sysfs net root, sorted by name
pub fn detect_interfaces(sys_net_root: &Path) -> DeviceResult<Vec<NetInterface>> {
    let entries = std::fs::read_dir(sys_net_root).map_err(|e| {
        DeviceError::Init(format!("cannot scan {}: {}", sys_net_root.display(), e))
    })?;

    let mut interfaces = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "lo" || !entry.path().join("device").exists() {
            continue;
        }
        interfaces.push(NetInterface {
            sys_path: entry.path(),
            name,
        });
    }
    interfaces.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(interfaces)
}

/// NIC device plugin
pub struct NicPlugin {
    name: String,
    config: NicPluginConfig,
    logger: SharedLogger,
    pool: Mutex<DevicePool<NetInterface>>,
}

impl NicPlugin {
    pub fn new(name: impl Into<String>, config: NicPluginConfig, logger: SharedLogger) -> Self {
        Self {
            name: name.into(),
            config,
            logger,
            pool: Mutex::new(DevicePool::empty()),
        }
    }

    /// Registry factory entry point
    pub fn from_context(ctx: PluginContext) -> DeviceResult<Self> {
        let config: NicPluginConfig = ctx.settings()?;
        Ok(Self::new(ctx.instance_name, config, ctx.logger))
    }

    fn pool(&self) -> MutexGuard<'_, DevicePool<NetInterface>> {
        self.pool.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn discover(&self) -> DeviceResult<Vec<NetInterface>> {
        match &self.config.interfaces {
            Some(names) => {
                let mut interfaces: Vec<NetInterface> = names
                    .iter()
                    .map(|name| NetInterface {
                        name: name.clone(),
                        sys_path: self.config.sys_net_root.join(name),
                    })
                    .collect();
                interfaces.sort_by(|a, b| a.name.cmp(&b.name));
                if let Some(pair) = interfaces.windows(2).find(|w| w[0].name == w[1].name) {
                    return Err(DeviceError::Init(format!(
                        "interface {} is listed twice",
                        pair[0].name
                    )));
                }
                Ok(interfaces)
            }
            None => detect_interfaces(&self.config.sys_net_root),
        }
    }
}

impl DevicePlugin for NicPlugin {
    fn init(&mut self) -> DeviceResult<()> {
        let interfaces = self.discover()?;
        self.logger.log(
            2,
            format_args!(
                "plugin {} found interfaces {:?}",
                self.name,
                interfaces.iter().map(|i| i.name.as_str()).collect::<Vec<_>>()
            ),
        );
        *self.pool.get_mut().unwrap_or_else(|e| e.into_inner()) =
            DevicePool::new(interfaces, self.config.reserved);
        Ok(())
    }

    fn start(&mut self) -> DeviceResult<()> {
        if !self.config.skip_down {
            return Ok(());
        }
        let pool = self.pool.get_mut().unwrap_or_else(|e| e.into_inner());
        let dropped = pool.retain(|iface| iface.operstate().as_deref() != Some("down"));
        if !dropped.is_empty() {
            self.logger.warn(format_args!(
                "plugin {} skipping interfaces that are down: {}",
                self.name,
                dropped.join(",")
            ));
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
                "interfaces": pool.devices().iter().map(|i| i.name.as_str()).collect::<Vec<_>>(),
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
        let holder = holder_key(pod, container_name);
        let interfaces = self.pool().allocate_for(
            &self.config.resource_name,
            &holder,
            container,
            ledger,
        )?;
        if interfaces.is_empty() {
            return Ok(Allocation::default());
        }

        let names: Vec<String> = interfaces.iter().map(|i| i.name.clone()).collect();
        let mut allocation = Allocation {
            device_ids: names.clone(),
            ..Default::default()
        };
        allocation
            .env
            .insert(self.config.env_name.clone(), names.join(","));

        self.logger.log(
            2,
            format_args!(
                "plugin {} allocated {} to pod {}",
                self.name,
                names.join(","),
                pod.name
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
            3,
            format_args!(
                "plugin {} released {} from pod {}",
                self.name,
                device_ids.join(","),
                pod.name
            ),
        );
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubedevice_core::{CapturingLogger, LogLevel, NodeLedger};
    use std::sync::Arc;

    /// Build a fake sysfs net root; `None` operstate leaves the file out
    fn fake_sys_net(ifaces: &[(&str, bool, Option<&str>)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, physical, operstate) in ifaces {
            let path = dir.path().join(name);
            std::fs::create_dir(&path).unwrap();
            if *physical {
                std::fs::create_dir(path.join("device")).unwrap();
            }
            if let Some(state) = operstate {
                std::fs::write(path.join("operstate"), format!("{}\n", state)).unwrap();
            }
        }
        dir
    }

    fn plugin_for(root: &Path, logger: Arc<CapturingLogger>) -> NicPlugin {
        let config = NicPluginConfig {
            sys_net_root: root.to_path_buf(),
            ..Default::default()
        };
        NicPlugin::new("nic", config, logger)
    }

    #[test]
    fn test_detect_interfaces_physical_only() {
        let root = fake_sys_net(&[
            ("lo", true, Some("unknown")),
            ("eth1", true, Some("up")),
            ("eth0", true, Some("up")),
            ("docker0", false, Some("up")),
        ]);
        let interfaces = detect_interfaces(root.path()).unwrap();
        let names: Vec<_> = interfaces.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["eth0", "eth1"]);
    }

    #[test]
    fn test_start_drops_down_interfaces() {
        let root = fake_sys_net(&[
            ("eth0", true, Some("up")),
            ("eth1", true, Some("down")),
            ("ib0", true, None),
        ]);
        let logger = Arc::new(CapturingLogger::new(5));
        let mut plugin = plugin_for(root.path(), logger.clone());
        plugin.init().unwrap();
        plugin.start().unwrap();

        let mut node = NodeInfo::new("node-1");
        plugin.update_node_info(&mut node).unwrap();
        assert_eq!(node.capacity["nic"], Quantity(2));
        assert!(logger.contains(LogLevel::Warning, "eth1"));
    }

    #[test]
    fn test_explicit_interfaces_bypass_scan() {
        let root = fake_sys_net(&[]);
        let config = NicPluginConfig {
            sys_net_root: root.path().to_path_buf(),
            interfaces: Some(vec!["ens2".to_string(), "ens1".to_string()]),
            skip_down: false,
            reserved: 1,
            ..Default::default()
        };
        let mut plugin = NicPlugin::new("fabric", config, Arc::new(CapturingLogger::new(0)));
        plugin.init().unwrap();
        plugin.start().unwrap();

        let mut node = NodeInfo::new("node-1");
        plugin.update_node_info(&mut node).unwrap();
        assert_eq!(node.capacity["nic"], Quantity(2));
        assert_eq!(node.allocatable["nic"], Quantity(1));
        assert_eq!(node.kube_alloc["kubedevice.io/nic"], Quantity(1));
        assert_eq!(node.scorer["fabric"]["interfaces"][0], "ens1");
    }

    #[test]
    fn test_allocate_and_release_interface() {
        let root = fake_sys_net(&[("eth0", true, Some("up")), ("eth1", true, Some("up"))]);
        let mut plugin = plugin_for(root.path(), Arc::new(CapturingLogger::new(5)));
        plugin.init().unwrap();
        plugin.start().unwrap();

        let mut report = NodeInfo::new("node-1");
        plugin.update_node_info(&mut report).unwrap();
        let mut ledger = NodeLedger::new("node-1");
        ledger.apply_report("nic", &report).unwrap();

        let pod = PodInfo::new("router", "node-1");
        let mut container = ContainerInfo::with_dev_requests([("nic", 1)]);
        let allocation = plugin
            .allocate(&pod, "main", &mut container, &mut ledger.usage("nic"))
            .unwrap();
        assert_eq!(allocation.device_ids, vec!["eth0"]);
        assert_eq!(allocation.env["KUBEDEVICE_NICS"], "eth0");
        assert!(allocation.mounts.is_empty());
        assert_eq!(ledger.snapshot().used["nic"], Quantity(1));

        let other = PodInfo::new("gateway", "node-1");
        let err = plugin
            .release(
                &other,
                "main",
                &mut container.clone(),
                &allocation.device_ids,
                &mut ledger.usage("nic"),
            )
            .unwrap_err();
        assert!(matches!(err, DeviceError::Conflict(_)));
        assert_eq!(ledger.snapshot().used["nic"], Quantity(1));

        plugin
            .release(
                &pod,
                "main",
                &mut container,
                &allocation.device_ids,
                &mut ledger.usage("nic"),
            )
            .unwrap();
        assert!(!container.is_allocated());
        assert_eq!(ledger.snapshot().used["nic"], Quantity::ZERO);
    }

    #[test]
    fn test_missing_sys_root_fails_init() {
        let root = fake_sys_net(&[]);
        let logger = Arc::new(CapturingLogger::new(0));
        let mut plugin = plugin_for(&root.path().join("absent"), logger);
        assert!(matches!(plugin.init(), Err(DeviceError::Init(_))));
    }

    #[test]
    fn test_interface_listed_twice_fails_init() {
        let root = fake_sys_net(&[]);
        let config = NicPluginConfig {
            sys_net_root: root.path().to_path_buf(),
            interfaces: Some(vec!["ens1".to_string(), "ens1".to_string()]),
            ..Default::default()
        };
        let mut plugin = NicPlugin::new("nic", config, Arc::new(CapturingLogger::new(0)));
        assert!(matches!(plugin.init(), Err(DeviceError::Init(_))));
    }
}
