//! Vendor device abstraction.
//!
//! Every accelerator family implements [`Device`]. The trait's default
//! [`Device::fit`] runs the shared scan in [`fit`]; vendors specialize it
//! through the predicate hooks or by post-processing the scan result.
//!
//! The main components are:
//! - [`Device`]: per-vendor request parsing, matching and annotation handling
//! - [`DeviceRegistry`]: vendor tag to implementation, built once at startup
//! - [`FitReasons`]: the rejection histogram rendered into fit failure reasons

pub mod cambricon;
pub mod core_mask;
pub mod fit;
pub mod hygon;
pub mod nvidia;
pub mod reason;
pub mod registry;
pub mod ring;

use std::collections::BTreeMap;

use api_types::ContainerDevice;
use api_types::ContainerDeviceRequest;
use api_types::ContainerDevices;
use api_types::DeviceInfo;
use api_types::DeviceUsage;
use api_types::PodDevices;
use api_types::PodSingleDevice;
use api_types::SchedulerPolicy;
use api_types::MEM_PERCENTAGE_UNSET;
use chrono::Utc;
use dashmap::DashMap;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;
use tracing::debug;
use tracing::warn;

use crate::codec;
use crate::codec::CodecError;
use crate::k8s::quantity::quantity_value;
use crate::k8s::AnnotationPatch;

pub use reason::FitReason;
pub use reason::FitReasons;
pub use registry::DeviceRegistry;

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("device {device} cannot take grant: {message}")]
    InvalidGrant { device: String, message: String },
    #[error("node {node} has no {device_type} inventory")]
    NoInventory { node: String, device_type: String },
}

/// Annotation keys owned by one vendor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAnnotationKeys {
    /// Pod annotation consumed by the node agent at allocate time
    pub to_allocate: &'static str,
    /// Pod annotation recording the grant for usage accounting
    pub allocated: &'static str,
    /// Node annotation carrying the registered inventory
    pub register: &'static str,
    /// Node annotation carrying the agent/scheduler handshake
    pub handshake: &'static str,
}

/// Resource names a vendor reads from container limits and requests.
#[derive(Debug, Clone, Copy)]
pub struct ResourceNames<'a> {
    pub count: &'a str,
    pub memory: &'a str,
    pub memory_percentage: Option<&'a str>,
    pub cores: &'a str,
}

/// Result of the type predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TypeCheck {
    /// Device type is acceptable for the request
    pub found: bool,
    /// Request asks for all devices on one NUMA node
    pub numa_bind: bool,
}

/// Inputs shared by every fit call for one container.
#[derive(Debug, Clone, Copy)]
pub struct FitContext<'a> {
    pub annotations: &'a BTreeMap<String, String>,
    pub pod: Option<&'a Pod>,
    pub node_name: &'a str,
    /// Grants already made to earlier containers of the same pod
    pub allocated: &'a PodDevices,
}

/// Outcome of matching one container request against a node's devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FitOutcome {
    Fit {
        devices: BTreeMap<String, ContainerDevices>,
    },
    Unfit {
        reason: String,
        partial: ContainerDevices,
    },
}

impl FitOutcome {
    pub fn is_fit(&self) -> bool {
        matches!(self, Self::Fit { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Fit { .. } => None,
            Self::Unfit { reason, .. } => Some(reason),
        }
    }
}

/// Per-vendor device operations.
pub trait Device: Send + Sync {
    /// Vendor tag used in requests and [`PodDevices`] keys, e.g. `NVIDIA`.
    fn device_type(&self) -> &'static str;

    fn annotation_keys(&self) -> &DeviceAnnotationKeys;

    fn resource_names(&self) -> ResourceNames<'_>;

    /// Cores requested when the container does not say.
    fn default_cores(&self) -> i32 {
        0
    }

    /// Memory in MiB requested when neither memory nor a percentage is set; 0 means whole card.
    fn default_memory(&self) -> i32 {
        0
    }

    /// Device count injected when a container asks for memory or cores only; 0 disables it.
    fn default_device_num(&self) -> i32 {
        0
    }

    /// Whether a NUMA change during the scan discards partial progress.
    fn resets_on_numa_change(&self) -> bool {
        false
    }

    /// Decide whether `container` asks for this vendor, filling in a default
    /// device count when only memory or cores were requested.
    fn mutate_admission(&self, container: &mut Container) -> bool {
        let names = self.resource_names();
        let limits = container.resources.get_or_insert_with(Default::default);
        let limits = limits.limits.get_or_insert_with(BTreeMap::new);
        if limits.contains_key(names.count) {
            return true;
        }

        let asks_for_slice = limits.contains_key(names.memory)
            || limits.contains_key(names.cores)
            || names
                .memory_percentage
                .is_some_and(|name| limits.contains_key(name));
        if asks_for_slice && self.default_device_num() > 0 {
            limits.insert(
                names.count.to_string(),
                Quantity(self.default_device_num().to_string()),
            );
            return true;
        }
        false
    }

    /// Build this vendor's request for `container`; `nums == 0` means none.
    fn generate_resource_requests(&self, container: &Container) -> ContainerDeviceRequest {
        resource_requests(self, container)
    }

    /// Registered inventory of `node`.
    ///
    /// # Errors
    ///
    /// - [`CodecError::MalformedNodeDevice`] if the annotation is missing or malformed
    fn get_node_devices(&self, node: &Node) -> Result<Vec<DeviceInfo>, Report<CodecError>> {
        let key = self.annotation_keys().register;
        let encoded = node
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .ok_or_else(|| {
                Report::new(CodecError::MalformedNodeDevice {
                    entry: String::new(),
                    message: format!("annotation {key} not found"),
                })
            })?;
        codec::decode_node_devices(encoded)
    }

    /// Compare the node's allocatable count with the last observed one.
    ///
    /// Returns `(healthy, needs_update)`.
    fn check_health(&self, node: &Node) -> (bool, bool);

    /// Node annotations marking this vendor's handshake as torn down.
    fn node_cleanup(&self) -> AnnotationPatch {
        let mut patch = AnnotationPatch::new();
        patch.insert(
            self.annotation_keys().handshake.to_string(),
            Some(format!("Deleted_{}", Utc::now().to_rfc3339())),
        );
        patch
    }

    fn check_type(
        &self,
        annotations: &BTreeMap<String, String>,
        device: &DeviceUsage,
        request: &ContainerDeviceRequest,
    ) -> TypeCheck;

    fn check_uuid(&self, annotations: &BTreeMap<String, String>, device: &DeviceUsage) -> bool;

    /// Memory, core, exclusivity and saturation checks, in that order.
    fn check_capacity(
        &self,
        device: &DeviceUsage,
        request: &ContainerDeviceRequest,
        memreq: i32,
    ) -> Result<(), FitReason> {
        percentage_capacity(device, request, memreq)
    }

    /// Build the grant for a device that passed every predicate.
    fn grant(
        &self,
        device: &DeviceUsage,
        request: &ContainerDeviceRequest,
        memreq: i32,
    ) -> Result<ContainerDevice, FitReason> {
        Ok(ContainerDevice {
            idx: device.index as usize,
            uuid: device.id.clone(),
            device_type: request.device_type.clone(),
            usedmem: memreq,
            usedcores: request.coresreq,
            custom_info: BTreeMap::new(),
        })
    }

    /// Match `request` against `devices`.
    fn fit(
        &self,
        devices: &[DeviceUsage],
        request: &ContainerDeviceRequest,
        ctx: &FitContext<'_>,
    ) -> FitOutcome {
        fit::scan(self, devices, request, ctx)
    }

    /// Charge a grant to a device.
    ///
    /// # Errors
    ///
    /// - [`AllocationError::InvalidGrant`] if the grant cannot apply to the device
    fn add_resource_usage(
        &self,
        device: &mut DeviceUsage,
        granted: &ContainerDevice,
    ) -> Result<(), Report<AllocationError>> {
        device.used += 1;
        device.usedcores += granted.usedcores;
        device.usedmem += granted.usedmem;
        Ok(())
    }

    /// Write this vendor's grants into pod annotations.
    fn patch_annotations(&self, pod_devices: &PodDevices, annotations: &mut BTreeMap<String, String>) {
        patch_grant_annotations(self, pod_devices, annotations);
    }

    /// Read back what [`Device::patch_annotations`] wrote; `None` if the pod
    /// holds nothing of this vendor.
    ///
    /// # Errors
    ///
    /// - [`CodecError`] if a payload is malformed
    fn decode_annotations(
        &self,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Option<PodSingleDevice>, Report<CodecError>> {
        decode_grant_annotations(self, annotations)
    }

    /// Vendor-specific usage score, used under a node policy when `Some`.
    fn score_node(
        &self,
        _node: &str,
        _pod_devices: &PodSingleDevice,
        _previous: &[DeviceUsage],
        _policy: SchedulerPolicy,
    ) -> Option<f32> {
        None
    }
}

/// Writes the grant payload under both the to-allocate and allocated keys.
/// A present but empty container list is written as an empty payload.
pub(crate) fn patch_grant_annotations<D: Device + ?Sized>(
    vendor: &D,
    pod_devices: &PodDevices,
    annotations: &mut BTreeMap<String, String>,
) {
    let Some(containers) = pod_devices.get(vendor.device_type()) else {
        return;
    };
    let encoded = codec::encode_pod_single_device(containers);
    let keys = vendor.annotation_keys();
    debug!(key = keys.to_allocate, value = %encoded, "Patching pod device annotation");
    annotations.insert(keys.to_allocate.to_string(), encoded.clone());
    annotations.insert(keys.allocated.to_string(), encoded);
}

pub(crate) fn decode_grant_annotations<D: Device + ?Sized>(
    vendor: &D,
    annotations: &BTreeMap<String, String>,
) -> Result<Option<PodSingleDevice>, Report<CodecError>> {
    let key = vendor.annotation_keys().allocated;
    annotations
        .get(key)
        .map(|value| {
            codec::decode_pod_single_device(value)
                .attach_printable_lazy(|| format!("annotation {key}"))
        })
        .transpose()
}

/// Request built from the vendor's resource names and defaults.
///
/// With neither memory nor a percentage set, `default_memory` is used when
/// non-zero and the whole card otherwise.
pub(crate) fn resource_requests<D: Device + ?Sized>(
    vendor: &D,
    container: &Container,
) -> ContainerDeviceRequest {
    let names = vendor.resource_names();
    let Some(nums) = container_resource(container, names.count) else {
        return ContainerDeviceRequest::default();
    };

    let mut memreq = container_resource(container, names.memory).unwrap_or(0);
    let mut mem_percentagereq = names
        .memory_percentage
        .and_then(|name| container_resource(container, name))
        .unwrap_or(MEM_PERCENTAGE_UNSET);
    if mem_percentagereq == MEM_PERCENTAGE_UNSET && memreq == 0 {
        if vendor.default_memory() != 0 {
            memreq = vendor.default_memory();
        } else {
            mem_percentagereq = 100;
        }
    }
    let coresreq = container_resource(container, names.cores).unwrap_or(vendor.default_cores());

    ContainerDeviceRequest {
        nums,
        device_type: vendor.device_type().to_string(),
        memreq,
        mem_percentagereq,
        coresreq,
    }
}

/// Reads an integer resource from limits, falling back to requests.
pub(crate) fn container_resource(container: &Container, name: &str) -> Option<i32> {
    let resources = container.resources.as_ref()?;
    let quantity = resources
        .limits
        .as_ref()
        .and_then(|limits| limits.get(name))
        .or_else(|| {
            resources
                .requests
                .as_ref()
                .and_then(|requests| requests.get(name))
        })?;

    match quantity_value(quantity) {
        Ok(value) => i32::try_from(value).ok(),
        Err(e) => {
            warn!(resource = name, container = %container.name, "Ignoring resource: {e:?}");
            None
        }
    }
}

/// Required memory for `request` on `device`.
pub(crate) fn required_memory(device: &DeviceUsage, request: &ContainerDeviceRequest) -> i32 {
    if request.memreq > 0 {
        return request.memreq;
    }
    if request.mem_percentagereq != MEM_PERCENTAGE_UNSET {
        return (i64::from(device.totalmem) * i64::from(request.mem_percentagereq) / 100) as i32;
    }
    0
}

/// Percentage based capacity checks shared by most vendors.
pub(crate) fn percentage_capacity(
    device: &DeviceUsage,
    request: &ContainerDeviceRequest,
    memreq: i32,
) -> Result<(), FitReason> {
    if device.totalmem - device.usedmem < memreq {
        return Err(FitReason::CardInsufficientMemory);
    }
    if device.totalcore - device.usedcores < request.coresreq {
        return Err(FitReason::CardInsufficientCore);
    }
    // Coresreq=100 asks for the whole card
    if device.totalcore == 100 && request.coresreq == 100 && device.used > 0 {
        return Err(FitReason::ExclusiveDeviceAllocateConflict);
    }
    // a zero-core job cannot land on a saturated card
    if device.totalcore != 0 && device.usedcores == device.totalcore && request.coresreq == 0 {
        return Err(FitReason::CardComputeUnitsExhausted);
    }
    Ok(())
}

/// Case-insensitive substring match of a device model against `use`/`nouse` lists.
///
/// A model must appear in the `use` list when one is set and must not appear
/// in the `nouse` list.
pub(crate) fn check_model_filter(
    annotations: &BTreeMap<String, String>,
    use_key: &str,
    nouse_key: &str,
    model: &str,
) -> bool {
    let model = model.to_uppercase();
    let listed = |value: &String| {
        value
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .any(|entry| model.contains(&entry.to_uppercase()))
    };

    if annotations.get(use_key).is_some_and(|value| !listed(value)) {
        return false;
    }
    !annotations.get(nouse_key).is_some_and(listed)
}

/// Exact match of a device id against `use`/`nouse` uuid lists.
///
/// The `use` list takes precedence over the `nouse` list.
pub(crate) fn check_uuid_filter(
    annotations: &BTreeMap<String, String>,
    use_key: &str,
    nouse_key: &str,
    id: &str,
) -> bool {
    let listed = |value: &String| value.split(',').map(str::trim).any(|uuid| uuid == id);

    if let Some(value) = annotations.get(use_key) {
        return listed(value);
    }
    if let Some(value) = annotations.get(nouse_key) {
        return !listed(value);
    }
    true
}

/// Tracks the allocatable device count last seen per node.
#[derive(Debug, Default)]
pub(crate) struct AllocatableTracker {
    reported: DashMap<String, i64>,
}

impl AllocatableTracker {
    /// Returns `(healthy, needs_update)` for `resource` on `node`.
    ///
    /// A node that stops advertising devices it advertised before is unhealthy;
    /// a changed non-zero count asks for a refresh.
    pub(crate) fn check(&self, node: &Node, resource: &str) -> (bool, bool) {
        let name = node.metadata.name.clone().unwrap_or_default();
        let current = node
            .status
            .as_ref()
            .and_then(|status| status.allocatable.as_ref())
            .and_then(|allocatable| allocatable.get(resource))
            .and_then(|quantity| {
                quantity_value(quantity)
                    .attach_printable_lazy(|| format!("allocatable {resource}"))
                    .ok()
            })
            .unwrap_or(0);

        let reported = self.reported.get(&name).map(|v| *v).unwrap_or(0);
        debug!(node = %name, resource, current, reported, "Checking device health");

        if current == 0 {
            if reported == 0 {
                return (true, false);
            }
            self.reported.insert(name, current);
            return (false, false);
        }
        if reported != current {
            self.reported.insert(name, current);
            return (true, true);
        }
        (true, false)
    }
}
