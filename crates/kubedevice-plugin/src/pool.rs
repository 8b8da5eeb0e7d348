//! Device pool for tracking and assigning concrete devices

use kubedevice_core::{
    quantity_of, ContainerInfo, DeviceError, DeviceResult, PodInfo, Quantity, UsageLedger,
};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// A device that can be handed out by a [`DevicePool`]
pub trait PooledDevice: Clone {
    /// Identifier used as the accounting token
    fn id(&self) -> &str;
}

/// Key naming the container that holds a device
pub fn holder_key(pod: &PodInfo, container_name: &str) -> String {
    format!("{}/{}", pod.name, container_name)
}

/// Pool that tracks which devices are assigned, and to whom
///
/// A reserved count is held back for the system, so at most
/// `total - reserved` devices are ever handed out.
#[derive(Debug, Clone)]
pub struct DevicePool<D> {
    /// Devices in allocation order
    devices: Vec<D>,
    /// Allocated device id to its holder
    allocated: HashMap<String, String>,
    /// Devices held back for the system
    reserved: u64,
}

impl<D: PooledDevice> DevicePool<D> {
    /// Create a pool over the given devices
    pub fn new(devices: Vec<D>, reserved: u64) -> Self {
        Self {
            devices,
            allocated: HashMap::new(),
            reserved,
        }
    }

    /// Create an empty pool
    pub fn empty() -> Self {
        Self::new(Vec::new(), 0)
    }

    pub fn devices(&self) -> &[D] {
        &self.devices
    }

    /// Drop devices that fail `keep`, returning the ids removed
    ///
    /// Only valid before anything is allocated.
    pub fn retain<F>(&mut self, mut keep: F) -> Vec<String>
    where
        F: FnMut(&D) -> bool,
    {
        let mut removed = Vec::new();
        self.devices.retain(|d| {
            let k = keep(d);
            if !k {
                removed.push(d.id().to_string());
            }
            k
        });
        removed
    }

    /// Get the total number of devices
    pub fn total_count(&self) -> u64 {
        self.devices.len() as u64
    }

    /// Total minus reserved
    pub fn allocatable_count(&self) -> u64 {
        self.total_count().saturating_sub(self.reserved)
    }

    pub fn allocated_count(&self) -> u64 {
        self.allocated.len() as u64
    }

    /// Get the number of devices that can still be handed out
    pub fn available_count(&self) -> u64 {
        self.allocatable_count().saturating_sub(self.allocated_count())
    }

    pub fn is_allocated(&self, id: &str) -> bool {
        self.allocated.contains_key(id)
    }

    /// Holder of an allocated device
    pub fn holder_of(&self, id: &str) -> Option<&str> {
        self.allocated.get(id).map(String::as_str)
    }

    /// Allocate the requested number of devices to `holder`
    ///
    /// Returns the allocated devices in pool order
    pub fn allocate(&mut self, count: u64, holder: &str) -> DeviceResult<Vec<D>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let available = self.available_count();
        if available < count {
            return Err(DeviceError::InsufficientResources(format!(
                "Not enough devices available: requested {}, available {}",
                count, available
            )));
        }

        let chosen: Vec<D> = self
            .devices
            .iter()
            .filter(|d| !self.is_allocated(d.id()))
            .take(count as usize)
            .cloned()
            .collect();

        for device in &chosen {
            self.allocated
                .insert(device.id().to_string(), holder.to_string());
        }

        debug!(
            holder = %holder,
            devices = ?chosen.iter().map(|d| d.id()).collect::<Vec<_>>(),
            "Allocated devices"
        );

        Ok(chosen)
    }

    /// Release devices held by `holder`
    ///
    /// Either every id is released or none is. An id that is free or held by
    /// someone else is a `Conflict`.
    pub fn release(&mut self, ids: &[String], holder: &str) -> DeviceResult<()> {
        self.check_held(ids, holder)?;
        for id in ids {
            if self.allocated.remove(id).is_some() {
                debug!(device = %id, holder = %holder, "Released device");
            }
        }
        Ok(())
    }

    fn check_held(&self, ids: &[String], holder: &str) -> DeviceResult<()> {
        for id in ids {
            match self.holder_of(id) {
                None => {
                    return Err(DeviceError::Conflict(format!(
                        "device {} is not allocated",
                        id
                    )))
                }
                Some(current) if current != holder => {
                    return Err(DeviceError::Conflict(format!(
                        "device {} is held by {}, not {}",
                        id, current, holder
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

impl<D: PooledDevice> DevicePool<D> {
    /// Allocate what `container` asks for of `resource` and charge it
    ///
    /// The chosen ids are recorded in `container.allocate_from` and against
    /// `holder` in the pool. If the ledger refuses the charge the devices go
    /// back to the pool.
    pub fn allocate_for(
        &mut self,
        resource: &str,
        holder: &str,
        container: &mut ContainerInfo,
        ledger: &mut UsageLedger<'_>,
    ) -> DeviceResult<Vec<D>> {
        let count = quantity_of(&container.dev_requests, resource);
        let devices = self.allocate(count.value(), holder)?;
        if devices.is_empty() {
            return Ok(devices);
        }

        let ids: Vec<String> = devices.iter().map(|d| d.id().to_string()).collect();
        if let Err(e) = ledger.charge(resource, count) {
            self.release(&ids, holder)?;
            return Err(e);
        }
        container.record_allocation(resource, ids);
        Ok(devices)
    }

    /// Return devices held by `holder` to the pool and credit the ledger
    pub fn release_for(
        &mut self,
        resource: &str,
        holder: &str,
        container: &mut ContainerInfo,
        ids: &[String],
        ledger: &mut UsageLedger<'_>,
    ) -> DeviceResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let unique: BTreeSet<&String> = ids.iter().collect();
        if unique.len() != ids.len() {
            return Err(DeviceError::Conflict(format!(
                "release of {} lists a device twice",
                resource
            )));
        }
        self.check_held(ids, holder)?;

        ledger.credit(resource, Quantity(ids.len() as u64))?;
        self.release(ids, holder)?;
        container.forget_allocation(resource, ids);
        Ok(())
    }
}
