//! Per-node resource ledger
//!
//! The ledger is the only writer of a node's capacity, allocatable and used
//! quantities. Plugins contribute through capacity reports and through the
//! attributed [`UsageLedger`] view handed to them during allocation. Every
//! mutation is validated before it is committed, so `used <= allocatable <=
//! capacity` holds for each resource at all times.

use std::collections::BTreeMap;

use crate::{quantity_of, DeviceError, DeviceResult, NodeInfo, Quantity, ResourceList};

/// Ledger for one node
#[derive(Debug, Clone)]
pub struct NodeLedger {
    node: NodeInfo,
    /// Resource name to the plugin that reported it
    owners: BTreeMap<String, String>,
    /// Plugin name to the quantities it currently holds
    attributed: BTreeMap<String, ResourceList>,
}

struct StagedResource {
    resource: String,
    capacity: Quantity,
    allocatable: Quantity,
    used: Quantity,
    first_report: bool,
}

impl NodeLedger {
    /// Create an empty ledger for a node
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            node: NodeInfo::new(name),
            owners: BTreeMap::new(),
            attributed: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// Copy of the current node record
    pub fn snapshot(&self) -> NodeInfo {
        self.node.clone()
    }

    /// Plugin that reported a resource
    pub fn owner_of(&self, resource: &str) -> Option<&str> {
        self.owners.get(resource).map(String::as_str)
    }

    /// Quantities currently attributed to a plugin
    pub fn used_by(&self, plugin: &str) -> ResourceList {
        self.attributed.get(plugin).cloned().unwrap_or_default()
    }

    /// Apply a plugin's capacity report
    ///
    /// The first report for a resource registers it: capacity is fixed from then
    /// on and the reported used quantity seeds the plugin's attribution. Later
    /// reports may move allocatable anywhere in `[used, capacity]` and must
    /// agree with the ledger about used. Scorer and orchestrator-facing lists
    /// are merged as reported. Nothing is written unless the whole report is
    /// valid.
    pub fn apply_report(&mut self, plugin: &str, report: &NodeInfo) -> DeviceResult<()> {
        for resource in report.allocatable.keys().chain(report.used.keys()) {
            if !report.capacity.contains_key(resource) {
                return Err(DeviceError::LedgerInvariant(format!(
                    "plugin {} reported {} without a capacity",
                    plugin, resource
                )));
            }
        }

        let mut staged = Vec::with_capacity(report.capacity.len());
        for (resource, &capacity) in &report.capacity {
            let allocatable = report.allocatable.get(resource).copied().unwrap_or(capacity);
            let reported_used = quantity_of(&report.used, resource);

            let first_report = match self.owners.get(resource) {
                Some(owner) if owner != plugin => {
                    return Err(DeviceError::Conflict(format!(
                        "resource {} is already provided by plugin {}, cannot be reported by {}",
                        resource, owner, plugin
                    )));
                }
                Some(_) => {
                    let recorded = quantity_of(&self.node.capacity, resource);
                    if capacity != recorded {
                        return Err(DeviceError::LedgerInvariant(format!(
                            "plugin {} changed capacity of {} from {} to {}",
                            plugin, resource, recorded, capacity
                        )));
                    }
                    let used = self.attributed_used(plugin, resource);
                    if reported_used != used {
                        return Err(DeviceError::LedgerInvariant(format!(
                            "plugin {} reports {} {} in use but the ledger attributes {}",
                            plugin, reported_used, resource, used
                        )));
                    }
                    false
                }
                None => true,
            };

            check_bounds(resource, reported_used, allocatable, capacity)?;
            staged.push(StagedResource {
                resource: resource.clone(),
                capacity,
                allocatable,
                used: reported_used,
                first_report,
            });
        }

        for s in staged {
            if s.first_report {
                self.owners.insert(s.resource.clone(), plugin.to_string());
                self.attributed
                    .entry(plugin.to_string())
                    .or_default()
                    .insert(s.resource.clone(), s.used);
            }
            self.node.capacity.insert(s.resource.clone(), s.capacity);
            self.node.allocatable.insert(s.resource.clone(), s.allocatable);
            self.node.used.insert(s.resource, s.used);
        }

        for (key, value) in &report.scorer {
            self.node.scorer.insert(key.clone(), value.clone());
        }
        self.node
            .kube_cap
            .extend(report.kube_cap.iter().map(|(k, v)| (k.clone(), *v)));
        self.node
            .kube_alloc
            .extend(report.kube_alloc.iter().map(|(k, v)| (k.clone(), *v)));

        Ok(())
    }

    /// Attributed view for one plugin
    pub fn usage<'a>(&'a mut self, plugin: &'a str) -> UsageLedger<'a> {
        UsageLedger {
            ledger: self,
            plugin,
        }
    }

    /// Verify `used <= allocatable <= capacity` for every resource
    pub fn check(&self) -> DeviceResult<()> {
        for resource in self.node.used.keys().chain(self.node.allocatable.keys()) {
            if !self.node.capacity.contains_key(resource) {
                return Err(DeviceError::LedgerInvariant(format!(
                    "{} is tracked without a capacity",
                    resource
                )));
            }
        }
        for (resource, &capacity) in &self.node.capacity {
            check_bounds(
                resource,
                quantity_of(&self.node.used, resource),
                quantity_of(&self.node.allocatable, resource),
                capacity,
            )?;
        }
        Ok(())
    }

    fn attributed_used(&self, plugin: &str, resource: &str) -> Quantity {
        self.attributed
            .get(plugin)
            .map(|list| quantity_of(list, resource))
            .unwrap_or_default()
    }

    fn ensure_owner(&self, plugin: &str, resource: &str) -> DeviceResult<()> {
        match self.owners.get(resource) {
            Some(owner) if owner == plugin => Ok(()),
            Some(owner) => Err(DeviceError::LedgerInvariant(format!(
                "plugin {} touched {} which is owned by {}",
                plugin, resource, owner
            ))),
            None => Err(DeviceError::LedgerInvariant(format!(
                "plugin {} touched unregistered resource {}",
                plugin, resource
            ))),
        }
    }

    fn charge(&mut self, plugin: &str, resource: &str, quantity: Quantity) -> DeviceResult<()> {
        self.ensure_owner(plugin, resource)?;
        let used = quantity_of(&self.node.used, resource);
        let allocatable = quantity_of(&self.node.allocatable, resource);
        let next = used
            .checked_add(quantity)
            .filter(|next| *next <= allocatable)
            .ok_or_else(|| {
                DeviceError::LedgerInvariant(format!(
                    "plugin {} charging {} {} would exceed allocatable {} (used {})",
                    plugin, quantity, resource, allocatable, used
                ))
            })?;
        self.commit_used(plugin, resource, next);
        Ok(())
    }

    fn credit(&mut self, plugin: &str, resource: &str, quantity: Quantity) -> DeviceResult<()> {
        self.ensure_owner(plugin, resource)?;
        let held = self.attributed_used(plugin, resource);
        let next = held.checked_sub(quantity).ok_or_else(|| {
            DeviceError::LedgerInvariant(format!(
                "plugin {} crediting {} {} but only holds {}",
                plugin, quantity, resource, held
            ))
        })?;
        self.commit_used(plugin, resource, next);
        Ok(())
    }

    fn commit_used(&mut self, plugin: &str, resource: &str, used: Quantity) {
        self.node.used.insert(resource.to_string(), used);
        self.attributed
            .entry(plugin.to_string())
            .or_default()
            .insert(resource.to_string(), used);
    }
}

fn check_bounds(
    resource: &str,
    used: Quantity,
    allocatable: Quantity,
    capacity: Quantity,
) -> DeviceResult<()> {
    if used > allocatable || allocatable > capacity {
        return Err(DeviceError::LedgerInvariant(format!(
            "{}: used {} <= allocatable {} <= capacity {} does not hold",
            resource, used, allocatable, capacity
        )));
    }
    Ok(())
}

/// A plugin's attributed view of a node ledger
///
/// Every charge and credit made through this view is recorded against the
/// plugin it was created for.
pub struct UsageLedger<'a> {
    ledger: &'a mut NodeLedger,
    plugin: &'a str,
}

impl<'a> UsageLedger<'a> {
    pub fn allocatable(&self, resource: &str) -> Quantity {
        quantity_of(&self.ledger.node.allocatable, resource)
    }

    pub fn used(&self, resource: &str) -> Quantity {
        quantity_of(&self.ledger.node.used, resource)
    }

    /// Allocatable minus used
    pub fn available(&self, resource: &str) -> Quantity {
        self.allocatable(resource).saturating_sub(self.used(resource))
    }

    /// Increase used, failing if it would pass allocatable
    pub fn charge(&mut self, resource: &str, quantity: Quantity) -> DeviceResult<()> {
        self.ledger.charge(self.plugin, resource, quantity)
    }

    /// Decrease used, failing if the plugin does not hold that much
    pub fn credit(&mut self, resource: &str, quantity: Quantity) -> DeviceResult<()> {
        self.ledger.credit(self.plugin, resource, quantity)
    }
}
