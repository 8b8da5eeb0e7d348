//! Allocation coordinator
//!
//! Owns one ledger per node together with the plugins that report into it.
//! Requests against the same node are serialized by a per-node mutex; the
//! node map itself is only locked long enough to find or insert a node.

use kubedevice_core::{
    ContainerInfo, DeviceError, DeviceResult, NodeConfig, NodeInfo, NodeLedger, PodInfo,
    RegistrationPolicy, SharedLogger,
};
use kubedevice_plugin::{Allocation, ManagedPlugin, PluginRegistry, PluginState};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::launch::LaunchDescriptor;

/// Ledger and hosted plugins of one node
struct NodeState {
    ledger: NodeLedger,
    /// Plugins keyed by instance name
    plugins: BTreeMap<String, ManagedPlugin>,
}

type NodeSlot = Arc<Mutex<NodeState>>;

/// Outcome of registering a node
#[derive(Debug)]
pub struct NodeRegistration {
    /// Node record after every surviving plugin reported
    pub node: NodeInfo,
    /// Plugins left out under `exclude-device`, with the reason
    pub excluded: Vec<(String, DeviceError)>,
}

/// Node record plus the state of each hosted plugin
#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub node: NodeInfo,
    pub plugins: BTreeMap<String, PluginState>,
}

/// Coordinates device plugins across nodes
pub struct Coordinator {
    registry: PluginRegistry,
    logger: SharedLogger,
    nodes: RwLock<HashMap<String, NodeSlot>>,
}

impl Coordinator {
    /// Create a coordinator with no nodes
    pub fn new(registry: PluginRegistry, logger: SharedLogger) -> Self {
        Self {
            registry,
            logger,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Device kinds the registry can build
    pub fn plugin_kinds(&self) -> Vec<String> {
        self.registry.kinds()
    }

    /// Register a node and bring up its plugins
    ///
    /// Each plugin is created, initialized, started and asked for its report.
    /// A plugin failing any of these steps either aborts the registration or
    /// is left out, depending on the node's registration policy.
    pub async fn register_node(&self, config: &NodeConfig) -> DeviceResult<NodeRegistration> {
        let name = config.name.clone();
        let mut instances = BTreeSet::new();
        for spec in &config.plugins {
            if !instances.insert(spec.instance_name()) {
                return Err(DeviceError::Conflict(format!(
                    "plugin instance {} is configured twice on node {}",
                    spec.instance_name(),
                    name
                )));
            }
        }
        config.validate()?;

        if self.nodes.read().await.contains_key(&name) {
            return Err(DeviceError::Conflict(format!(
                "node {} is already registered",
                name
            )));
        }

        let mut state = NodeState {
            ledger: NodeLedger::new(&name),
            plugins: BTreeMap::new(),
        };
        let mut excluded = Vec::new();

        for spec in &config.plugins {
            let instance = spec.instance_name().to_string();
            let outcome = self
                .registry
                .create(&name, spec, self.logger.clone())
                .and_then(|plugin| {
                    let mut managed = ManagedPlugin::new(plugin, self.logger.clone());
                    managed.bring_up()?;
                    let mut report = NodeInfo::new(&name);
                    managed.update_node_info(&mut report)?;
                    state.ledger.apply_report(&instance, &report)?;
                    Ok(managed)
                });

            match outcome {
                Ok(managed) => {
                    debug!(node = %name, plugin = %instance, "Plugin ready");
                    state.plugins.insert(instance, managed);
                }
                Err(e)
                    if e.is_plugin_fatal()
                        && config.registration_policy == RegistrationPolicy::ExcludeDevice =>
                {
                    self.logger.warn(format_args!(
                        "excluding plugin {} from node {}: {}",
                        instance, name, e
                    ));
                    excluded.push((instance, e));
                }
                Err(e) => {
                    self.logger.error(format_args!(
                        "registration of node {} failed on plugin {}: {}",
                        name, instance, e
                    ));
                    return Err(e);
                }
            }
        }

        let node = state.ledger.snapshot();
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(&name) {
            return Err(DeviceError::Conflict(format!(
                "node {} is already registered",
                name
            )));
        }
        nodes.insert(name.clone(), Arc::new(Mutex::new(state)));

        info!(
            node = %name,
            plugins = config.plugins.len() - excluded.len(),
            excluded = excluded.len(),
            "Node registered"
        );

        Ok(NodeRegistration { node, excluded })
    }

    /// Ask every plugin of a node for a fresh report and apply it
    pub async fn refresh_node(&self, name: &str) -> DeviceResult<NodeInfo> {
        let slot = self.slot(name).await?;
        let mut guard = slot.lock().await;
        let NodeState { ledger, plugins } = &mut *guard;

        for (instance, plugin) in plugins.iter() {
            let mut report = NodeInfo::new(name);
            let applied = plugin
                .update_node_info(&mut report)
                .and_then(|_| ledger.apply_report(instance, &report));
            if let Err(e) = applied {
                self.logger.error(format_args!(
                    "refresh of node {} rejected report from {}: {}",
                    name, instance, e
                ));
                return Err(e);
            }
        }
        Ok(ledger.snapshot())
    }

    /// Allocate every device the container named `container_name` asks
    /// for, or none of them
    ///
    /// Plugins are visited in the order of the first resource each owns,
    /// resources sorted by name. If a plugin fails, or the merged launch
    /// descriptor would be contradictory, the plugins that already succeeded
    /// are released in reverse order and the original error is returned.
    pub async fn allocate(
        &self,
        pod: &PodInfo,
        container_name: &str,
        container: &mut ContainerInfo,
    ) -> DeviceResult<LaunchDescriptor> {
        if container.is_allocated() {
            return Err(DeviceError::Conflict(format!(
                "container {} in pod {} already holds devices",
                container_name, pod.name
            )));
        }

        let slot = self.slot(&pod.node_name).await?;
        let mut guard = slot.lock().await;
        let NodeState { ledger, plugins } = &mut *guard;

        let mut owners: Vec<String> = Vec::new();
        for (resource, quantity) in &container.dev_requests {
            if quantity.is_zero() {
                continue;
            }
            let owner = ledger.owner_of(resource).ok_or_else(|| {
                DeviceError::InsufficientResources(format!(
                    "node {} has no plugin providing {}",
                    pod.node_name, resource
                ))
            })?;
            if !owners.iter().any(|o| o == owner) {
                owners.push(owner.to_string());
            }
        }

        let mut done: Vec<(String, Allocation)> = Vec::with_capacity(owners.len());
        let mut failure = None;
        for owner in &owners {
            let result = match plugins.get(owner) {
                Some(plugin) => {
                    plugin.allocate(pod, container_name, container, &mut ledger.usage(owner))
                }
                None => Err(DeviceError::LedgerInvariant(format!(
                    "resource owner {} is not hosted on node {}",
                    owner, pod.node_name
                ))),
            };
            match result {
                Ok(allocation) => done.push((owner.clone(), allocation)),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let mut launch = LaunchDescriptor::new();
        if failure.is_none() {
            for (owner, allocation) in &done {
                if let Err(e) = launch.merge(owner, allocation.clone()) {
                    failure = Some(e);
                    break;
                }
            }
        }
        if failure.is_none() {
            failure = ledger.check().err();
        }

        if let Some(e) = failure {
            self.logger.warn(format_args!(
                "allocation for pod {} on node {} failed: {}",
                pod.name, pod.node_name, e
            ));
            self.roll_back(pod, container_name, container, ledger, plugins, &done);
            return Err(e);
        }

        self.logger.log(
            2,
            format_args!(
                "pod {} on node {} allocated {:?}",
                pod.name, pod.node_name, launch.device_ids
            ),
        );
        Ok(launch)
    }

    /// Return every device recorded in `container.allocate_from`
    ///
    /// Devices no longer held by `container_name` are refused with a
    /// `Conflict` by the plugin that owns them.
    pub async fn release(
        &self,
        pod: &PodInfo,
        container_name: &str,
        container: &mut ContainerInfo,
    ) -> DeviceResult<()> {
        let slot = self.slot(&pod.node_name).await?;
        let mut guard = slot.lock().await;
        let NodeState { ledger, plugins } = &mut *guard;

        let mut by_owner: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (resource, ids) in &container.allocate_from {
            let owner = ledger
                .owner_of(resource)
                .filter(|owner| plugins.contains_key(*owner))
                .ok_or_else(|| {
                    DeviceError::Conflict(format!(
                        "no plugin on node {} holds {}",
                        pod.node_name, resource
                    ))
                })?;
            by_owner
                .entry(owner.to_string())
                .or_default()
                .extend(ids.iter().cloned());
        }

        let mut first_error = None;
        for (owner, ids) in &by_owner {
            let Some(plugin) = plugins.get(owner) else {
                continue;
            };
            let mut usage = ledger.usage(owner);
            if let Err(e) = plugin.release(pod, container_name, container, ids, &mut usage) {
                self.logger.error(format_args!(
                    "plugin {} failed to release {:?} for pod {}: {}",
                    owner, ids, pod.name, e
                ));
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                self.logger.log(
                    2,
                    format_args!("pod {} on node {} released", pod.name, pod.node_name),
                );
                Ok(())
            }
        }
    }

    /// Snapshot of a node's record
    pub async fn node_info(&self, name: &str) -> DeviceResult<NodeInfo> {
        let slot = self.slot(name).await?;
        let state = slot.lock().await;
        Ok(state.ledger.snapshot())
    }

    /// Node record and plugin states
    pub async fn node_summary(&self, name: &str) -> DeviceResult<NodeSummary> {
        let slot = self.slot(name).await?;
        let state = slot.lock().await;
        Ok(summarize(&state))
    }

    /// Summaries of every node, sorted by name
    pub async fn list_nodes(&self) -> Vec<NodeSummary> {
        let slots: Vec<NodeSlot> = self.nodes.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(slots.len());
        for slot in slots {
            summaries.push(summarize(&*slot.lock().await));
        }
        summaries.sort_by(|a, b| a.node.name.cmp(&b.node.name));
        summaries
    }

    /// Forget a node and its plugins, returning its last record
    pub async fn remove_node(&self, name: &str) -> DeviceResult<NodeInfo> {
        let slot = self
            .nodes
            .write()
            .await
            .remove(name)
            .ok_or_else(|| DeviceError::NodeNotFound(name.to_string()))?;
        let state = slot.lock().await;
        info!(node = %name, "Node removed");
        Ok(state.ledger.snapshot())
    }

    async fn slot(&self, name: &str) -> DeviceResult<NodeSlot> {
        self.nodes
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| DeviceError::NodeNotFound(name.to_string()))
    }

    /// Release `done` in reverse and clear whatever is left on the container
    fn roll_back(
        &self,
        pod: &PodInfo,
        container_name: &str,
        container: &mut ContainerInfo,
        ledger: &mut NodeLedger,
        plugins: &BTreeMap<String, ManagedPlugin>,
        done: &[(String, Allocation)],
    ) {
        for (owner, allocation) in done.iter().rev() {
            let Some(plugin) = plugins.get(owner) else {
                continue;
            };
            if let Err(e) = plugin.release(
                pod,
                container_name,
                container,
                &allocation.device_ids,
                &mut ledger.usage(owner),
            ) {
                self.logger.error(format_args!(
                    "rollback of plugin {} for pod {} failed: {}",
                    owner, pod.name, e
                ));
            }
        }
        container.allocate_from.clear();
    }
}

fn summarize(state: &NodeState) -> NodeSummary {
    NodeSummary {
        node: state.ledger.snapshot(),
        plugins: state
            .plugins
            .iter()
            .map(|(name, plugin)| (name.clone(), plugin.state()))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubedevice_core::{
        diff_node, quantity_of, CapturingLogger, LogLevel, PluginSpec, Quantity, UsageLedger,
    };
    use kubedevice_plugin::{DevicePlugin, PluginContext};
    use serde::Deserialize;
    use std::sync::Mutex as StdMutex;

    /// Counter-backed plugin whose failures are chosen by its settings
    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(default)]
    struct FlakySettings {
        resource: String,
        capacity: u64,
        fail_init: bool,
        fail_allocate: bool,
        env_value: Option<String>,
    }

    struct FlakyPlugin {
        name: String,
        settings: FlakySettings,
        held: StdMutex<u64>,
    }

    impl DevicePlugin for FlakyPlugin {
        fn init(&mut self) -> DeviceResult<()> {
            if self.settings.fail_init {
                return Err(DeviceError::Init("firmware did not answer".into()));
            }
            Ok(())
        }

        fn start(&mut self) -> DeviceResult<()> {
            Ok(())
        }

        fn update_node_info(&self, node: &mut NodeInfo) -> DeviceResult<()> {
            let resource = self.settings.resource.clone();
            node.capacity.insert(resource.clone(), Quantity(self.settings.capacity));
            node.used.insert(resource, Quantity(*self.held.lock().unwrap()));
            Ok(())
        }

        fn allocate(
            &self,
            _pod: &PodInfo,
            _container_name: &str,
            container: &mut ContainerInfo,
            ledger: &mut UsageLedger<'_>,
        ) -> DeviceResult<Allocation> {
            let resource = &self.settings.resource;
            let count = quantity_of(&container.dev_requests, resource);
            if count.is_zero() {
                return Ok(Allocation::default());
            }
            if self.settings.fail_allocate {
                return Err(DeviceError::InsufficientResources("link flapped".into()));
            }
            ledger.charge(resource, count)?;
            let mut held = self.held.lock().unwrap();
            let ids: Vec<String> = (*held..*held + count.value())
                .map(|i| format!("{}-{}", self.name, i))
                .collect();
            *held += count.value();
            container.record_allocation(resource, ids.clone());

            let mut allocation = Allocation {
                device_ids: ids,
                ..Default::default()
            };
            if let Some(value) = &self.settings.env_value {
                allocation.env.insert("SHARED_MODE".to_string(), value.clone());
            }
            Ok(allocation)
        }

        fn release(
            &self,
            _pod: &PodInfo,
            _container_name: &str,
            container: &mut ContainerInfo,
            device_ids: &[String],
            ledger: &mut UsageLedger<'_>,
        ) -> DeviceResult<()> {
            ledger.credit(&self.settings.resource, Quantity(device_ids.len() as u64))?;
            *self.held.lock().unwrap() -= device_ids.len() as u64;
            container.forget_allocation(&self.settings.resource, device_ids);
            Ok(())
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    fn registry() -> PluginRegistry {
        let mut registry = PluginRegistry::with_builtin();
        registry
            .register("flaky", |ctx: PluginContext| {
                let settings: FlakySettings = ctx.settings()?;
                Ok(Box::new(FlakyPlugin {
                    name: ctx.instance_name,
                    settings,
                    held: StdMutex::new(0),
                }) as Box<dyn DevicePlugin>)
            })
            .unwrap();
        registry
    }

    fn coordinator() -> (Coordinator, Arc<CapturingLogger>) {
        let logger = Arc::new(CapturingLogger::new(5));
        (Coordinator::new(registry(), logger.clone()), logger)
    }

    fn fake_dev_root(gpus: u32) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..gpus {
            std::fs::write(dir.path().join(format!("nvidia{}", i)), b"").unwrap();
        }
        dir
    }

    fn gpu_spec(root: &tempfile::TempDir) -> PluginSpec {
        PluginSpec::new("gpu").with_setting("dev_root", root.path().display().to_string())
    }

    fn flaky_spec(name: &str, resource: &str) -> PluginSpec {
        PluginSpec::new("flaky")
            .named(name)
            .with_setting("resource", resource)
            .with_setting("capacity", 2i64)
    }

    #[tokio::test]
    async fn test_allocate_then_insufficient() {
        let root = fake_dev_root(4);
        let (coordinator, _) = coordinator();
        coordinator
            .register_node(&NodeConfig::new("node-1").with_plugin(gpu_spec(&root)))
            .await
            .unwrap();

        let pod = PodInfo::new("trainer", "node-1");
        let mut first = ContainerInfo::with_dev_requests([("gpu", 2)]);
        let launch = coordinator.allocate(&pod, "main", &mut first).await.unwrap();
        assert_eq!(launch.device_ids.len(), 2);
        assert_eq!(first.allocated_count("gpu"), 2);
        let node = coordinator.node_info("node-1").await.unwrap();
        assert_eq!(node.used["gpu"], Quantity(2));

        let mut second = ContainerInfo::with_dev_requests([("gpu", 3)]);
        let err = coordinator.allocate(&pod, "sidecar", &mut second).await.unwrap_err();
        assert!(err.is_admission_failure());
        assert!(!second.is_allocated());
        let node = coordinator.node_info("node-1").await.unwrap();
        assert_eq!(node.used["gpu"], Quantity(2));
    }

    #[tokio::test]
    async fn test_failed_plugin_rolls_back_earlier_ones() {
        let root = fake_dev_root(2);
        let (coordinator, logger) = coordinator();
        let config = NodeConfig::new("node-1")
            .with_plugin(gpu_spec(&root))
            .with_plugin(flaky_spec("nic", "nic").with_setting("fail_allocate", true));
        coordinator.register_node(&config).await.unwrap();
        let before = coordinator.node_info("node-1").await.unwrap();

        let pod = PodInfo::new("trainer", "node-1");
        let mut container = ContainerInfo::with_dev_requests([("gpu", 1), ("nic", 1)]);
        let err = coordinator.allocate(&pod, "main", &mut container).await.unwrap_err();

        assert!(matches!(err, DeviceError::InsufficientResources(ref m) if m == "link flapped"));
        assert!(container.allocate_from.is_empty());
        let after = coordinator.node_info("node-1").await.unwrap();
        assert!(diff_node(&before, &after).is_empty());
        assert!(logger.contains(LogLevel::Warning, "trainer"));

        // The GPU went back to the pool, so a GPU-only request still fits both.
        let mut retry = ContainerInfo::with_dev_requests([("gpu", 2)]);
        coordinator.allocate(&pod, "main", &mut retry).await.unwrap();
    }

    #[tokio::test]
    async fn test_env_disagreement_rolls_back() {
        let (coordinator, _) = coordinator();
        let config = NodeConfig::new("node-1")
            .with_plugin(flaky_spec("left", "x").with_setting("env_value", "exclusive"))
            .with_plugin(flaky_spec("right", "y").with_setting("env_value", "shared"));
        coordinator.register_node(&config).await.unwrap();

        let pod = PodInfo::new("mixed", "node-1");
        let mut container = ContainerInfo::with_dev_requests([("x", 1), ("y", 1)]);
        let err = coordinator.allocate(&pod, "main", &mut container).await.unwrap_err();
        assert!(matches!(err, DeviceError::Conflict(_)));
        assert!(!container.is_allocated());

        let node = coordinator.node_info("node-1").await.unwrap();
        assert_eq!(node.used["x"], Quantity::ZERO);
        assert_eq!(node.used["y"], Quantity::ZERO);
    }

    #[tokio::test]
    async fn test_merged_launch_across_plugins() {
        let root = fake_dev_root(2);
        let (coordinator, _) = coordinator();
        let config = NodeConfig::new("node-1")
            .with_plugin(gpu_spec(&root))
            .with_plugin(flaky_spec("fabric", "rdma"));
        coordinator.register_node(&config).await.unwrap();

        let pod = PodInfo::new("trainer", "node-1");
        let mut container = ContainerInfo::with_dev_requests([("gpu", 1), ("rdma", 2)]);
        let launch = coordinator.allocate(&pod, "main", &mut container).await.unwrap();

        assert_eq!(launch.devices["gpu"], vec!["nvidia0"]);
        assert_eq!(launch.devices["fabric"], vec!["fabric-0", "fabric-1"]);
        assert_eq!(launch.device_ids.len(), 3);
        assert_eq!(launch.env["NVIDIA_VISIBLE_DEVICES"], "0");
        assert_eq!(container.allocated_count("rdma"), 2);

        let node = coordinator.node_info("node-1").await.unwrap();
        assert_eq!(node.used["gpu"], Quantity(1));
        assert_eq!(node.used["rdma"], Quantity(2));
    }

    #[tokio::test]
    async fn test_unowned_kind_and_zero_requests() {
        let root = fake_dev_root(1);
        let (coordinator, _) = coordinator();
        coordinator
            .register_node(&NodeConfig::new("node-1").with_plugin(gpu_spec(&root)))
            .await
            .unwrap();
        let pod = PodInfo::new("web", "node-1");

        let mut fpga = ContainerInfo::with_dev_requests([("fpga", 1)]);
        let err = coordinator.allocate(&pod, "main", &mut fpga).await.unwrap_err();
        assert!(matches!(err, DeviceError::InsufficientResources(_)));

        let mut nothing = ContainerInfo::with_dev_requests([("fpga", 0), ("gpu", 0)]);
        let launch = coordinator.allocate(&pod, "main", &mut nothing).await.unwrap();
        assert!(launch.is_empty());
    }

    #[tokio::test]
    async fn test_allocated_container_is_rejected() {
        let root = fake_dev_root(2);
        let (coordinator, _) = coordinator();
        coordinator
            .register_node(&NodeConfig::new("node-1").with_plugin(gpu_spec(&root)))
            .await
            .unwrap();
        let pod = PodInfo::new("trainer", "node-1");
        let mut container = ContainerInfo::with_dev_requests([("gpu", 1)]);
        coordinator.allocate(&pod, "main", &mut container).await.unwrap();

        let err = coordinator.allocate(&pod, "main", &mut container).await.unwrap_err();
        assert!(matches!(err, DeviceError::Conflict(_)));
        assert_eq!(container.allocated_count("gpu"), 1);
    }

    #[tokio::test]
    async fn test_release_returns_everything() {
        let root = fake_dev_root(2);
        let (coordinator, _) = coordinator();
        let config = NodeConfig::new("node-1")
            .with_plugin(gpu_spec(&root))
            .with_plugin(flaky_spec("fabric", "rdma"));
        coordinator.register_node(&config).await.unwrap();

        let pod = PodInfo::new("trainer", "node-1");
        let mut container = ContainerInfo::with_dev_requests([("gpu", 2), ("rdma", 1)]);
        coordinator.allocate(&pod, "main", &mut container).await.unwrap();
        coordinator.release(&pod, "main", &mut container).await.unwrap();

        assert!(container.allocate_from.is_empty());
        let node = coordinator.node_info("node-1").await.unwrap();
        assert_eq!(node.used["gpu"], Quantity::ZERO);
        assert_eq!(node.used["rdma"], Quantity::ZERO);
    }

    #[tokio::test]
    async fn test_stale_release_cannot_free_reassigned_device() {
        let root = fake_dev_root(2);
        let (coordinator, _) = coordinator();
        coordinator
            .register_node(&NodeConfig::new("node-1").with_plugin(gpu_spec(&root)))
            .await
            .unwrap();

        let first_pod = PodInfo::new("first", "node-1");
        let mut first = ContainerInfo::with_dev_requests([("gpu", 1)]);
        coordinator.allocate(&first_pod, "main", &mut first).await.unwrap();
        let stale = first.clone();
        coordinator.release(&first_pod, "main", &mut first).await.unwrap();

        let second_pod = PodInfo::new("second", "node-1");
        let mut second = ContainerInfo::with_dev_requests([("gpu", 1)]);
        let launch = coordinator.allocate(&second_pod, "main", &mut second).await.unwrap();
        assert_eq!(launch.device_ids, vec!["nvidia0"]);

        let mut replay = stale;
        let err = coordinator.release(&first_pod, "main", &mut replay).await.unwrap_err();
        assert!(matches!(err, DeviceError::Conflict(_)));
        let node = coordinator.node_info("node-1").await.unwrap();
        assert_eq!(node.used["gpu"], Quantity(1));

        // nvidia0 is still held, so two more GPUs do not fit.
        let third_pod = PodInfo::new("third", "node-1");
        let mut third = ContainerInfo::with_dev_requests([("gpu", 2)]);
        let err = coordinator.allocate(&third_pod, "main", &mut third).await.unwrap_err();
        assert!(matches!(err, DeviceError::InsufficientResources(_)));
        assert!(!third.is_allocated());

        coordinator.release(&second_pod, "main", &mut second).await.unwrap();
        let node = coordinator.node_info("node-1").await.unwrap();
        assert_eq!(node.used["gpu"], Quantity::ZERO);
    }

    #[tokio::test]
    async fn test_refresh_is_idempotent() {
        let root = fake_dev_root(3);
        let (coordinator, _) = coordinator();
        coordinator
            .register_node(&NodeConfig::new("node-1").with_plugin(gpu_spec(&root)))
            .await
            .unwrap();
        let pod = PodInfo::new("trainer", "node-1");
        let mut container = ContainerInfo::with_dev_requests([("gpu", 1)]);
        coordinator.allocate(&pod, "main", &mut container).await.unwrap();

        let first = coordinator.refresh_node("node-1").await.unwrap();
        let second = coordinator.refresh_node("node-1").await.unwrap();
        assert!(diff_node(&first, &second).is_empty());
        assert_eq!(second.used["gpu"], Quantity(1));
    }

    #[tokio::test]
    async fn test_exclude_device_policy() {
        let root = fake_dev_root(1);
        let (coordinator, logger) = coordinator();
        let config = NodeConfig::new("node-1")
            .with_plugin(gpu_spec(&root))
            .with_plugin(flaky_spec("fpga", "fpga").with_setting("fail_init", true));

        let registration = coordinator.register_node(&config).await.unwrap();
        assert_eq!(registration.excluded.len(), 1);
        assert_eq!(registration.excluded[0].0, "fpga");
        assert!(registration.excluded[0].1.is_plugin_fatal());
        assert!(!registration.node.capacity.contains_key("fpga"));
        assert_eq!(registration.node.capacity["gpu"], Quantity(1));
        assert!(logger.contains(LogLevel::Warning, "excluding plugin fpga"));

        let summary = coordinator.node_summary("node-1").await.unwrap();
        assert_eq!(summary.plugins.len(), 1);
        assert_eq!(summary.plugins["gpu"], PluginState::Ready);
    }

    #[tokio::test]
    async fn test_fail_node_policy() {
        let root = fake_dev_root(1);
        let (coordinator, _) = coordinator();
        let mut config = NodeConfig::new("node-1")
            .with_plugin(gpu_spec(&root))
            .with_plugin(flaky_spec("fpga", "fpga").with_setting("fail_init", true));
        config.registration_policy = RegistrationPolicy::FailNode;

        let err = coordinator.register_node(&config).await.unwrap_err();
        assert!(matches!(err, DeviceError::Init(_)));
        assert!(matches!(
            coordinator.node_info("node-1").await,
            Err(DeviceError::NodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_conflicting_resource_owner_fails_registration() {
        let (coordinator, _) = coordinator();
        let config = NodeConfig::new("node-1")
            .with_plugin(flaky_spec("first", "accel"))
            .with_plugin(flaky_spec("second", "accel"));

        let err = coordinator.register_node(&config).await.unwrap_err();
        assert!(matches!(err, DeviceError::Conflict(_)));
        assert!(matches!(
            coordinator.node_info("node-1").await,
            Err(DeviceError::NodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_kind_fails_registration() {
        let root = fake_dev_root(1);
        let (coordinator, logger) = coordinator();
        let config = NodeConfig::new("node-1")
            .with_plugin(gpu_spec(&root))
            .with_plugin(PluginSpec::new("tpu"));

        let err = coordinator.register_node(&config).await.unwrap_err();
        assert!(matches!(err, DeviceError::PluginNotFound(ref kind) if kind == "tpu"));
        assert!(logger.contains(LogLevel::Error, "node-1"));
        assert!(coordinator.list_nodes().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_registration() {
        let (coordinator, _) = coordinator();
        coordinator
            .register_node(&NodeConfig::new("node-1"))
            .await
            .unwrap();
        let err = coordinator
            .register_node(&NodeConfig::new("node-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Conflict(_)));

        let twice = NodeConfig::new("node-2")
            .with_plugin(flaky_spec("a", "x"))
            .with_plugin(flaky_spec("a", "y"));
        let err = coordinator.register_node(&twice).await.unwrap_err();
        assert!(matches!(err, DeviceError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_list_and_remove_nodes() {
        let (coordinator, _) = coordinator();
        coordinator.register_node(&NodeConfig::new("b")).await.unwrap();
        coordinator.register_node(&NodeConfig::new("a")).await.unwrap();

        let names: Vec<_> = coordinator
            .list_nodes()
            .await
            .into_iter()
            .map(|s| s.node.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);

        coordinator.remove_node("a").await.unwrap();
        assert!(matches!(
            coordinator.remove_node("a").await,
            Err(DeviceError::NodeNotFound(_))
        ));
        assert_eq!(coordinator.list_nodes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_allocations_get_distinct_devices() {
        let root = fake_dev_root(4);
        let (coordinator, _) = coordinator();
        coordinator
            .register_node(&NodeConfig::new("node-1").with_plugin(gpu_spec(&root)))
            .await
            .unwrap();
        let coordinator = Arc::new(coordinator);

        let mut handles = Vec::new();
        for i in 0..4 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                let pod = PodInfo::new(format!("worker-{}", i), "node-1");
                let mut container = ContainerInfo::with_dev_requests([("gpu", 1)]);
                coordinator.allocate(&pod, "main", &mut container).await.unwrap();
                container
            }));
        }

        let mut ids = BTreeSet::new();
        for handle in handles {
            let container = handle.await.unwrap();
            ids.extend(container.allocate_from["gpu"].iter().cloned());
        }
        assert_eq!(ids.len(), 4);
        let node = coordinator.node_info("node-1").await.unwrap();
        assert_eq!(node.used["gpu"], Quantity(4));
    }
}
