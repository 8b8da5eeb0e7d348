//! Device plugin trait definitions

use kubedevice_core::{ContainerInfo, DeviceResult, Mount, NodeInfo, PodInfo, UsageLedger};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a plugin hands back for one container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Bind mounts to inject
    pub mounts: Vec<Mount>,
    /// Devices consumed, used as accounting tokens for release
    pub device_ids: Vec<String>,
    /// Environment to set in the container
    pub env: BTreeMap<String, String>,
}

impl Allocation {
    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty() && self.device_ids.is_empty() && self.env.is_empty()
    }
}

/// Hardware-specific discovery and allocation for one device kind
///
/// The host drives an implementation through `init`, `start`, and then any
/// number of `update_node_info`, `allocate` and `release` calls. Ordering is
/// enforced by [`crate::ManagedPlugin`], so implementations may assume it.
pub trait DevicePlugin: Send + Sync {
    /// Construct internal state, typically by enumerating hardware
    fn init(&mut self) -> DeviceResult<()>;

    /// Logical initialization that needs a constructed plugin
    fn start(&mut self) -> DeviceResult<()>;

    /// Write this plugin's capacity, allocatable, used and scorer into `node`
    ///
    /// Must leave `node` unchanged when called again with no allocation in between.
    fn update_node_info(&self, node: &mut NodeInfo) -> DeviceResult<()>;

    /// Reserve devices for the container named `container_name` in `pod`
    ///
    /// On success the chosen ids are recorded in `container.allocate_from`,
    /// held on behalf of that container and charged to `ledger`. On failure
    /// the pool, the ledger and the container are left as they were.
    fn allocate(
        &self,
        pod: &PodInfo,
        container_name: &str,
        container: &mut ContainerInfo,
        ledger: &mut UsageLedger<'_>,
    ) -> DeviceResult<Allocation>;

    /// Return devices from an earlier `allocate` to the pool
    ///
    /// Ids not held by the named container are a `Conflict`, and nothing is
    /// released in that case.
    fn release(
        &self,
        pod: &PodInfo,
        container_name: &str,
        container: &mut ContainerInfo,
        device_ids: &[String],
        ledger: &mut UsageLedger<'_>,
    ) -> DeviceResult<()>;

    /// Stable, unique instance name
    fn name(&self) -> &str;
}
