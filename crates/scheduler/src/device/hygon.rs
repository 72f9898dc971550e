use std::collections::BTreeMap;

use api_types::ContainerDevice;
use api_types::ContainerDeviceRequest;
use api_types::DeviceUsage;
use api_types::PodDevices;
use api_types::PodSingleDevice;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Node;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use super::check_model_filter;
use super::check_uuid_filter;
use super::core_mask;
use super::decode_grant_annotations;
use super::patch_grant_annotations;
use super::AllocatableTracker;
use super::AllocationError;
use super::Device;
use super::DeviceAnnotationKeys;
use super::FitReason;
use super::ResourceNames;
use super::TypeCheck;
use crate::codec::CodecError;

pub const HYGON_DCU_DEVICE: &str = "DCU";

pub const DCU_IN_USE_ANNOTATION: &str = "hygon.com/use-dcutype";
pub const DCU_NO_USE_ANNOTATION: &str = "hygon.com/nouse-dcutype";
pub const DCU_USE_UUID_ANNOTATION: &str = "hygon.com/use-gpuuuid";
pub const DCU_NO_USE_UUID_ANNOTATION: &str = "hygon.com/nouse-gpuuuid";

/// `custom_info` key holding the reserved compute-unit mask of a device or grant.
pub const CORE_MASK_KEY: &str = "coremask";
/// `custom_info` key overriding the compute-unit count of a device.
pub const COMPUTE_UNITS_KEY: &str = "cu";
/// Pod annotation with the mask of every DCU grant, a JSON list per container.
pub const DCU_CORE_MASKS_ANNOTATION: &str = "hygon.com/dcu-core-masks";

const KEYS: DeviceAnnotationKeys = DeviceAnnotationKeys {
    to_allocate: "hami.io/dcu-devices-to-allocate",
    allocated: "hami.io/dcu-devices-allocated",
    register: "hami.io/node-dcu-register",
    handshake: "hami.io/node-handshake-dcu",
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HygonConfig {
    pub resource_count_name: String,
    pub resource_memory_name: String,
    pub resource_core_name: String,
    /// Compute units per device unless the inventory says otherwise
    pub compute_units: u32,
}

impl Default for HygonConfig {
    fn default() -> Self {
        Self {
            resource_count_name: "hygon.com/dcunum".to_string(),
            resource_memory_name: "hygon.com/dcumem".to_string(),
            resource_core_name: "hygon.com/dcucores".to_string(),
            compute_units: 60,
        }
    }
}

/// Hygon DCUs, whose cores are handed out as compute-unit masks.
#[derive(Debug, Default)]
pub struct DcuDevices {
    config: HygonConfig,
    health: AllocatableTracker,
}

impl DcuDevices {
    pub fn new(config: HygonConfig) -> Self {
        Self {
            config,
            health: AllocatableTracker::default(),
        }
    }

    fn compute_units(&self, device: &DeviceUsage) -> u32 {
        device
            .custom_info
            .get(COMPUTE_UNITS_KEY)
            .and_then(|cu| cu.parse().ok())
            .unwrap_or(self.config.compute_units)
    }

    fn used_mask(&self, device: &DeviceUsage) -> String {
        device
            .custom_info
            .get(CORE_MASK_KEY)
            .cloned()
            .unwrap_or_else(|| core_mask::init_core_usage(self.compute_units(device)))
    }

    /// Compute units matching a core percentage on `device`.
    fn units_for(&self, device: &DeviceUsage, cores: i32) -> u32 {
        let cores = u32::try_from(cores).unwrap_or(0);
        cores.saturating_mul(self.compute_units(device)) / 100
    }
}

fn encode_masks(containers: &PodSingleDevice) -> Result<String, serde_json::Error> {
    let masks: Vec<Vec<&str>> = containers
        .iter()
        .map(|devices| {
            devices
                .iter()
                .map(|d| d.custom_info.get(CORE_MASK_KEY).map_or("", String::as_str))
                .collect()
        })
        .collect();
    serde_json::to_string(&masks)
}

/// Put the masks in `encoded` back on the grants they were taken from.
fn restore_masks(
    encoded: &str,
    containers: &mut PodSingleDevice,
) -> Result<(), Report<CodecError>> {
    let malformed = |message: String| CodecError::MalformedAnnotation {
        key: DCU_CORE_MASKS_ANNOTATION.to_string(),
        message,
    };
    let masks: Vec<Vec<String>> = serde_json::from_str(encoded)
        .change_context_lazy(|| malformed(format!("invalid JSON `{encoded}`")))?;
    let same_layout = masks.len() == containers.len()
        && masks.iter().zip(containers.iter()).all(|(m, d)| m.len() == d.len());
    if !same_layout {
        return Err(Report::new(malformed(
            "mask layout does not match the grants".to_string(),
        )));
    }
    for (devices, masks) in containers.iter_mut().zip(masks) {
        for (device, mask) in devices.iter_mut().zip(masks) {
            if !mask.is_empty() {
                device.custom_info.insert(CORE_MASK_KEY.to_string(), mask);
            }
        }
    }
    Ok(())
}

impl Device for DcuDevices {
    fn device_type(&self) -> &'static str {
        HYGON_DCU_DEVICE
    }

    fn annotation_keys(&self) -> &DeviceAnnotationKeys {
        &KEYS
    }

    fn resource_names(&self) -> ResourceNames<'_> {
        ResourceNames {
            count: &self.config.resource_count_name,
            memory: &self.config.resource_memory_name,
            memory_percentage: None,
            cores: &self.config.resource_core_name,
        }
    }

    fn default_cores(&self) -> i32 {
        100
    }

    fn check_health(&self, node: &Node) -> (bool, bool) {
        self.health.check(node, &self.config.resource_count_name)
    }

    fn check_type(
        &self,
        annotations: &BTreeMap<String, String>,
        device: &DeviceUsage,
        request: &ContainerDeviceRequest,
    ) -> TypeCheck {
        TypeCheck {
            found: request.device_type == HYGON_DCU_DEVICE
                && check_model_filter(
                    annotations,
                    DCU_IN_USE_ANNOTATION,
                    DCU_NO_USE_ANNOTATION,
                    &device.device_type,
                ),
            numa_bind: false,
        }
    }

    fn check_uuid(&self, annotations: &BTreeMap<String, String>, device: &DeviceUsage) -> bool {
        check_uuid_filter(
            annotations,
            DCU_USE_UUID_ANNOTATION,
            DCU_NO_USE_UUID_ANNOTATION,
            &device.id,
        )
    }

    fn grant(
        &self,
        device: &DeviceUsage,
        request: &ContainerDeviceRequest,
        memreq: i32,
    ) -> Result<ContainerDevice, FitReason> {
        let units = self.units_for(device, request.coresreq);
        let mask = core_mask::alloc_core_usage(&self.used_mask(device), units).map_err(|e| {
            debug!(device = %device.id, units, "No compute units left: {e:?}");
            FitReason::CardInsufficientCore
        })?;

        let mut custom_info = BTreeMap::new();
        custom_info.insert(CORE_MASK_KEY.to_string(), mask);
        Ok(ContainerDevice {
            idx: device.index as usize,
            uuid: device.id.clone(),
            device_type: request.device_type.clone(),
            usedmem: memreq,
            usedcores: request.coresreq,
            custom_info,
        })
    }

    /// Grants without a mask get their units re-reserved greedily, in grant
    /// order.
    fn add_resource_usage(
        &self,
        device: &mut DeviceUsage,
        granted: &ContainerDevice,
    ) -> Result<(), Report<AllocationError>> {
        let used = self.used_mask(device);
        let mask = match granted.custom_info.get(CORE_MASK_KEY) {
            Some(mask) => mask.clone(),
            None => core_mask::alloc_core_usage(&used, self.units_for(device, granted.usedcores))
                .change_context_lazy(|| AllocationError::InvalidGrant {
                    device: device.id.clone(),
                    message: "compute units exhausted".to_string(),
                })?,
        };
        let merged = core_mask::add_core_usage(&used, &mask).change_context_lazy(|| {
            AllocationError::InvalidGrant {
                device: device.id.clone(),
                message: format!("core mask {mask} does not match {used}"),
            }
        })?;

        device.used += 1;
        device.usedcores += granted.usedcores;
        device.usedmem += granted.usedmem;
        device.custom_info.insert(CORE_MASK_KEY.to_string(), merged);
        Ok(())
    }

    /// The masks ride in their own annotation; the grant payload keeps the
    /// four-field layout every vendor shares.
    fn patch_annotations(&self, pod_devices: &PodDevices, annotations: &mut BTreeMap<String, String>) {
        patch_grant_annotations(self, pod_devices, annotations);
        let Some(containers) = pod_devices.get(HYGON_DCU_DEVICE) else {
            return;
        };
        match encode_masks(containers) {
            Ok(masks) => {
                annotations.insert(DCU_CORE_MASKS_ANNOTATION.to_string(), masks);
            }
            Err(e) => warn!("Failed to encode DCU core masks: {e}"),
        }
    }

    fn decode_annotations(
        &self,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Option<PodSingleDevice>, Report<CodecError>> {
        let Some(mut containers) = decode_grant_annotations(self, annotations)? else {
            return Ok(None);
        };
        if let Some(masks) = annotations.get(DCU_CORE_MASKS_ANNOTATION) {
            restore_masks(masks, &mut containers)?;
        }
        Ok(Some(containers))
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::device::test_util::container;
    use crate::device::test_util::usage;
    use crate::device::FitContext;
    use crate::device::FitOutcome;

    fn dcu(id: &str, index: u32) -> DeviceUsage {
        usage(id, index, "DCU-Z100")
    }

    fn request(nums: i32, coresreq: i32) -> ContainerDeviceRequest {
        ContainerDeviceRequest {
            nums,
            device_type: HYGON_DCU_DEVICE.to_string(),
            memreq: 1024,
            mem_percentagereq: api_types::MEM_PERCENTAGE_UNSET,
            coresreq,
        }
    }

    fn fit(devices: &[DeviceUsage], request: &ContainerDeviceRequest) -> FitOutcome {
        let annotations = BTreeMap::new();
        let allocated = PodDevices::new();
        let ctx = FitContext {
            annotations: &annotations,
            pod: None,
            node_name: "node-a",
            allocated: &allocated,
        };
        DcuDevices::default().fit(devices, request, &ctx)
    }

    #[test]
    fn grant_carries_reserved_mask() {
        let FitOutcome::Fit { devices } = fit(&[dcu("DCU-0", 0)], &request(1, 20)) else {
            panic!("expected fit");
        };
        let granted = &devices[HYGON_DCU_DEVICE][0];
        assert_eq!(granted.custom_info[CORE_MASK_KEY], "fff000000000000");
        assert_eq!(granted.usedcores, 20);
    }

    #[test]
    fn usage_merges_masks() {
        let dcus = DcuDevices::default();
        let mut device = dcu("DCU-0", 0);
        for _ in 0..2 {
            let FitOutcome::Fit { devices } = fit(&[device.clone()], &request(1, 20)) else {
                panic!("expected fit");
            };
            dcus.add_resource_usage(&mut device, &devices[HYGON_DCU_DEVICE][0])
                .unwrap();
        }
        assert_eq!(device.custom_info[CORE_MASK_KEY], "ffffff000000000");
        assert_eq!(device.used, 2);
        assert_eq!(device.usedcores, 40);
    }

    #[test]
    fn decoded_grant_reserves_units_again() {
        let dcus = DcuDevices::default();
        let mut device = dcu("DCU-0", 0);
        let decoded = ContainerDevice {
            uuid: "DCU-0".to_string(),
            device_type: HYGON_DCU_DEVICE.to_string(),
            usedmem: 1024,
            usedcores: 50,
            ..Default::default()
        };
        dcus.add_resource_usage(&mut device, &decoded).unwrap();
        assert_eq!(device.custom_info[CORE_MASK_KEY], "fffffffc0000000");
    }

    #[test]
    fn sequential_grants_stay_within_capacity() {
        let dcus = DcuDevices::default();
        let mut device = dcu("DCU-0", 0);
        let mut granted = 0;
        while let FitOutcome::Fit { devices } = fit(&[device.clone()], &request(1, 40)) {
            dcus.add_resource_usage(&mut device, &devices[HYGON_DCU_DEVICE][0])
                .unwrap();
            granted += 1;
            assert!(device.used <= device.count);
            assert!(device.usedmem <= device.totalmem);
            assert!(device.usedcores <= device.totalcore);
            let units = core_mask::used_units(&device.custom_info[CORE_MASK_KEY]).unwrap();
            assert!(units <= dcus.compute_units(&device));
        }
        assert_eq!(granted, 2);
        assert_eq!(
            fit(&[device], &request(1, 40)).reason(),
            Some("1/1 CardInsufficientCore")
        );
    }

    #[test]
    fn oversized_core_count_saturates() {
        let dcus = DcuDevices::default();
        let device = dcu("DCU-0", 0);
        assert_eq!(dcus.units_for(&device, i32::MAX), u32::MAX / 100);
        assert_eq!(dcus.units_for(&device, -5), 0);

        let mut device = device;
        let decoded = ContainerDevice {
            uuid: "DCU-0".to_string(),
            device_type: HYGON_DCU_DEVICE.to_string(),
            usedcores: i32::MAX,
            ..Default::default()
        };
        assert!(dcus.add_resource_usage(&mut device, &decoded).is_err());
        assert_eq!(device.used, 0);
    }

    #[test]
    fn masks_survive_the_annotations() {
        let dcus = DcuDevices::default();
        let mut device = dcu("DCU-0", 0);
        device
            .custom_info
            .insert(CORE_MASK_KEY.to_string(), "f00000000000000".to_string());
        let FitOutcome::Fit { devices } = fit(&[device], &request(1, 20)) else {
            panic!("expected fit");
        };
        assert_eq!(
            devices[HYGON_DCU_DEVICE][0].custom_info[CORE_MASK_KEY],
            "0fff00000000000"
        );

        let mut pod_devices = PodDevices::new();
        pod_devices.insert(
            HYGON_DCU_DEVICE.to_string(),
            vec![vec![], devices[HYGON_DCU_DEVICE].clone()],
        );
        let mut annotations = BTreeMap::new();
        dcus.patch_annotations(&pod_devices, &mut annotations);
        assert_eq!(
            annotations[DCU_CORE_MASKS_ANNOTATION],
            r#"[[],["0fff00000000000"]]"#
        );
        assert_eq!(
            dcus.decode_annotations(&annotations).unwrap().as_ref(),
            pod_devices.get(HYGON_DCU_DEVICE)
        );
    }

    #[test]
    fn mismatched_mask_layout_fails_closed() {
        let dcus = DcuDevices::default();
        let mut annotations = BTreeMap::new();
        annotations.insert(
            "hami.io/dcu-devices-allocated".to_string(),
            "DCU-0,DCU,1024,20;".to_string(),
        );
        annotations.insert(DCU_CORE_MASKS_ANNOTATION.to_string(), "[[]]".to_string());
        let err = dcus.decode_annotations(&annotations).unwrap_err();
        assert!(matches!(
            err.current_context(),
            CodecError::MalformedAnnotation { .. }
        ));

        annotations.remove(DCU_CORE_MASKS_ANNOTATION);
        let decoded = dcus.decode_annotations(&annotations).unwrap().unwrap();
        assert!(decoded[0][0].custom_info.is_empty());
    }

    #[test]
    fn exhausted_mask_is_insufficient_core() {
        let mut device = dcu("DCU-0", 0);
        device.count = 10;
        device.usedcores = 20;
        device
            .custom_info
            .insert(CORE_MASK_KEY.to_string(), "fffffffffffffff".to_string());
        let outcome = fit(&[device], &request(1, 10));
        assert_eq!(outcome.reason(), Some("1/1 CardInsufficientCore"));
    }

    #[test]
    fn cores_default_to_whole_card() {
        let req = DcuDevices::default().generate_resource_requests(&container(&[
            ("hygon.com/dcunum", "1"),
            ("hygon.com/dcumem", "2048"),
        ]));
        assert_eq!(req.coresreq, 100);
        assert_eq!(req.memreq, 2048);
        assert_eq!(req.device_type, HYGON_DCU_DEVICE);
    }

    #[test]
    fn no_numa_reset() {
        let mut devices = vec![dcu("DCU-0", 0), dcu("DCU-1", 1)];
        devices[1].numa = 1;
        let outcome = fit(&devices, &request(2, 10));
        assert!(outcome.is_fit());
    }
}
