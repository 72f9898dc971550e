//! Live device usage of a node.
//!
//! A [`NodeUsage`] starts from the registered inventory and is charged with
//! every grant recorded on pods bound to the node. It is an advisory snapshot:
//! only the holder of the node lock may treat it as current.

use std::collections::BTreeMap;

use api_types::ContainerDevice;
use api_types::DeviceInfo;
use api_types::DeviceUsage;
use api_types::PodDevices;
use error_stack::Report;
use tracing::debug;

use crate::device::AllocationError;
use crate::device::DeviceRegistry;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeUsage {
    pub node: String,
    /// Usage per vendor tag, in inventory order
    pub devices: BTreeMap<String, Vec<DeviceUsage>>,
}

impl NodeUsage {
    pub fn from_inventory(node: &str, inventory: &BTreeMap<String, Vec<DeviceInfo>>) -> Self {
        Self {
            node: node.to_string(),
            devices: inventory
                .iter()
                .map(|(device_type, infos)| {
                    (device_type.clone(), infos.iter().map(DeviceUsage::from).collect())
                })
                .collect(),
        }
    }

    /// Devices of one vendor; empty if the node registered none.
    pub fn devices_of(&self, device_type: &str) -> &[DeviceUsage] {
        self.devices
            .get(device_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn device_count(&self) -> usize {
        self.devices.values().map(Vec::len).sum()
    }

    /// Charge one grant to the device it names.
    ///
    /// Grants for devices no longer registered are ignored.
    ///
    /// # Errors
    ///
    /// - [`AllocationError::NoInventory`] if no vendor is registered for the grant's type
    /// - [`AllocationError::InvalidGrant`] if the vendor rejects the grant
    pub fn add_grant(
        &mut self,
        registry: &DeviceRegistry,
        device_type: &str,
        granted: &ContainerDevice,
    ) -> Result<(), Report<AllocationError>> {
        let vendor = registry.get(device_type).ok_or_else(|| {
            Report::new(AllocationError::NoInventory {
                node: self.node.clone(),
                device_type: device_type.to_string(),
            })
        })?;
        let Some(device) = self
            .devices
            .get_mut(device_type)
            .and_then(|devices| devices.iter_mut().find(|d| d.id == granted.uuid))
        else {
            debug!(node = %self.node, device = %granted.uuid, "Grant for unregistered device ignored");
            return Ok(());
        };
        vendor.add_resource_usage(device, granted)
    }

    /// Charge every grant of a pod.
    ///
    /// # Errors
    ///
    /// - [`AllocationError`] from the first grant that cannot be charged
    pub fn add_pod_devices(
        &mut self,
        registry: &DeviceRegistry,
        pod_devices: &PodDevices,
    ) -> Result<(), Report<AllocationError>> {
        for (device_type, containers) in pod_devices {
            for granted in containers.iter().flatten() {
                self.add_grant(registry, device_type, granted)?;
            }
        }
        Ok(())
    }
}
