//! Shared device data model
//!
//! This crate contains the types exchanged between the node agent and the
//! scheduler: the inventory a node publishes, the live usage view the
//! scheduler builds from it, and the per-container requests and grants that
//! end up serialized in pod annotations.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// Sentinel for [`ContainerDeviceRequest::mem_percentagereq`] meaning "not set".
pub const MEM_PERCENTAGE_UNSET: i32 = 101;

/// Static inventory entry published by a node agent.
///
/// Replaced wholesale on every registration cycle; the scheduler never mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DeviceInfo {
    /// Stable device identifier (UUID or slot name)
    pub id: String,
    /// Physical index on the node
    #[serde(default)]
    pub index: u32,
    /// Maximum number of concurrent sharers
    pub count: i32,
    /// Device memory in MiB
    pub devmem: i32,
    /// Compute capacity, a percentage or a number of compute units
    pub devcore: i32,
    /// Vendor model tag, e.g. "NVIDIA-Tesla T4"
    #[serde(rename = "type")]
    pub device_type: String,
    /// NUMA node the device is attached to
    #[serde(default)]
    pub numa: i32,
    pub health: bool,
    /// Vendor-opaque key/value bag
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_info: BTreeMap<String, String>,
}

/// A device together with its live consumption counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DeviceUsage {
    pub id: String,
    pub index: u32,
    pub used: i32,
    pub count: i32,
    pub usedmem: i32,
    pub totalmem: i32,
    pub totalcore: i32,
    pub usedcores: i32,
    pub numa: i32,
    #[serde(rename = "type")]
    pub device_type: String,
    pub health: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_info: BTreeMap<String, String>,
}

impl From<&DeviceInfo> for DeviceUsage {
    fn from(info: &DeviceInfo) -> Self {
        Self {
            id: info.id.clone(),
            index: info.index,
            used: 0,
            count: info.count,
            usedmem: 0,
            totalmem: info.devmem,
            totalcore: info.devcore,
            usedcores: 0,
            numa: info.numa,
            device_type: info.device_type.clone(),
            health: info.health,
            custom_info: info.custom_info.clone(),
        }
    }
}

/// One container's ask for a single device type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDeviceRequest {
    /// Number of devices
    pub nums: i32,
    #[serde(rename = "type")]
    pub device_type: String,
    /// Absolute memory in MiB, 0 when a percentage is used
    pub memreq: i32,
    /// Memory percentage, [`MEM_PERCENTAGE_UNSET`] when not set
    pub mem_percentagereq: i32,
    pub coresreq: i32,
}

impl Default for ContainerDeviceRequest {
    fn default() -> Self {
        Self {
            nums: 0,
            device_type: String::new(),
            memreq: 0,
            mem_percentagereq: MEM_PERCENTAGE_UNSET,
            coresreq: 0,
        }
    }
}

/// One granted device slice.
///
/// Equality ignores `idx`: a grant is identified by its device `uuid`, and
/// the scan position is not written to pod annotations.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContainerDevice {
    /// Index of the granted device on its node; not part of the wire payload
    #[serde(default)]
    pub idx: usize,
    pub uuid: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub usedmem: i32,
    pub usedcores: i32,
    /// Vendor extras, persisted by the vendor beside the grant payload
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_info: BTreeMap<String, String>,
}

impl PartialEq for ContainerDevice {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
            && self.device_type == other.device_type
            && self.usedmem == other.usedmem
            && self.usedcores == other.usedcores
            && self.custom_info == other.custom_info
    }
}

impl Eq for ContainerDevice {}

/// Devices granted to one container.
pub type ContainerDevices = Vec<ContainerDevice>;

/// Grants of one device type for every container of a pod, in container order.
pub type PodSingleDevice = Vec<ContainerDevices>;

/// Grants of a pod keyed by device type tag.
pub type PodDevices = BTreeMap<String, PodSingleDevice>;

/// Requests of one container keyed by device type tag.
pub type ContainerDeviceRequests = BTreeMap<String, ContainerDeviceRequest>;

/// Preference for concentrating or spreading allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerPolicy {
    #[default]
    Binpack,
    Spread,
}

impl fmt::Display for SchedulerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binpack => write!(f, "binpack"),
            Self::Spread => write!(f, "spread"),
        }
    }
}

impl FromStr for SchedulerPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binpack" => Ok(Self::Binpack),
            "spread" => Ok(Self::Spread),
            other => Err(format!("unknown scheduler policy: {other}")),
        }
    }
}

/// Bind phase recorded on a pod while the scheduler hands it to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindPhase {
    Allocating,
    Failed,
    Success,
}

impl BindPhase {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Allocating => "allocating",
            Self::Failed => "failed",
            Self::Success => "success",
        }
    }
}

impl fmt::Display for BindPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
