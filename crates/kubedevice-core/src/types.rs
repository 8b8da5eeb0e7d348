//! Node, pod, container and mount records exchanged with the orchestrator

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A non-negative amount of a resource (device count, bytes, ...)
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Quantity(pub u64);

impl Quantity {
    pub const ZERO: Quantity = Quantity(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Quantity) -> Option<Quantity> {
        self.0.checked_add(other.0).map(Quantity)
    }

    pub fn checked_sub(self, other: Quantity) -> Option<Quantity> {
        self.0.checked_sub(other.0).map(Quantity)
    }

    /// Subtraction clamped at zero
    pub fn saturating_sub(self, other: Quantity) -> Quantity {
        Quantity(self.0.saturating_sub(other.0))
    }
}

impl From<u64> for Quantity {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resource name to quantity
pub type ResourceList = BTreeMap<String, Quantity>;

/// Opaque placement-scoring payload, keyed by whoever wrote the entry
pub type Scorer = BTreeMap<String, serde_json::Value>;

/// Look up a quantity, treating a missing entry as zero
pub fn quantity_of(list: &ResourceList, resource: &str) -> Quantity {
    list.get(resource).copied().unwrap_or_default()
}

/// Per-node resource record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique node name
    pub name: String,
    /// Total quantities, fixed at registration
    #[serde(default)]
    pub capacity: ResourceList,
    /// Capacity minus system reservations
    #[serde(default)]
    pub allocatable: ResourceList,
    /// Quantities held by live allocations
    #[serde(default)]
    pub used: ResourceList,
    /// Plugin-defined scoring payload
    #[serde(default)]
    pub scorer: Scorer,
    /// Capacity as advertised to the orchestrator
    #[serde(default)]
    pub kube_cap: ResourceList,
    /// Allocatable as advertised to the orchestrator
    #[serde(default)]
    pub kube_alloc: ResourceList,
}

impl NodeInfo {
    /// Create an empty node record
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Which container list of a pod a container belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    Init,
    Running,
}

/// Per-workload record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodInfo {
    pub name: String,
    /// Node the pod is bound to
    pub node_name: String,
    #[serde(default)]
    pub requests: ResourceList,
    #[serde(default)]
    pub init_containers: BTreeMap<String, ContainerInfo>,
    #[serde(default)]
    pub running_containers: BTreeMap<String, ContainerInfo>,
}

impl PodInfo {
    pub fn new(name: impl Into<String>, node_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node_name: node_name.into(),
            ..Default::default()
        }
    }

    /// Find a container by name, running containers first
    pub fn find_container(&self, name: &str) -> Option<(ContainerKind, &ContainerInfo)> {
        self.running_containers
            .get(name)
            .map(|c| (ContainerKind::Running, c))
            .or_else(|| {
                self.init_containers
                    .get(name)
                    .map(|c| (ContainerKind::Init, c))
            })
    }

    /// Remove a container so it can be mutated alongside a shared borrow of the pod
    pub fn take_container(&mut self, name: &str) -> Option<(ContainerKind, ContainerInfo)> {
        if let Some(c) = self.running_containers.remove(name) {
            return Some((ContainerKind::Running, c));
        }
        self.init_containers
            .remove(name)
            .map(|c| (ContainerKind::Init, c))
    }

    pub fn insert_container(&mut self, kind: ContainerKind, name: String, info: ContainerInfo) {
        match kind {
            ContainerKind::Init => self.init_containers.insert(name, info),
            ContainerKind::Running => self.running_containers.insert(name, info),
        };
    }
}

/// Per-container record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Resource asks at the orchestrator-visible level
    #[serde(default)]
    pub requests: ResourceList,
    /// Raw requests before device-plugin translation
    #[serde(default)]
    pub kube_requests: ResourceList,
    /// Device-plugin-specific requests
    #[serde(default)]
    pub dev_requests: ResourceList,
    /// Concrete device identifiers chosen per resource
    #[serde(default)]
    pub allocate_from: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub scorer: Scorer,
}

impl ContainerInfo {
    /// Create a container asking for the given device quantities
    pub fn with_dev_requests<I, S>(requests: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        Self {
            dev_requests: requests
                .into_iter()
                .map(|(name, qty)| (name.into(), Quantity(qty)))
                .collect(),
            ..Default::default()
        }
    }

    /// Whether any device has been recorded for this container
    pub fn is_allocated(&self) -> bool {
        self.allocate_from.values().any(|ids| !ids.is_empty())
    }

    /// Number of devices recorded for a resource
    pub fn allocated_count(&self, resource: &str) -> usize {
        self.allocate_from.get(resource).map_or(0, |ids| ids.len())
    }

    /// Record devices chosen for a resource
    pub fn record_allocation<I>(&mut self, resource: &str, ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.allocate_from
            .entry(resource.to_string())
            .or_default()
            .extend(ids);
    }

    /// Forget devices for a resource, dropping the entry once it is empty
    pub fn forget_allocation(&mut self, resource: &str, ids: &[String]) {
        if let Some(set) = self.allocate_from.get_mut(resource) {
            for id in ids {
                set.remove(id);
            }
            if set.is_empty() {
                self.allocate_from.remove(resource);
            }
        }
    }
}

/// Bind mount injected into a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub container_path: String,
    pub host_path: String,
    #[serde(default)]
    pub readonly: bool,
}

impl Mount {
    pub fn new(
        container_path: impl Into<String>,
        host_path: impl Into<String>,
        readonly: bool,
    ) -> Self {
        Self {
            container_path: container_path.into(),
            host_path: host_path.into(),
            readonly,
        }
    }
}
