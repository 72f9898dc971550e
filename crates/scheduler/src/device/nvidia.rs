use std::collections::BTreeMap;

use api_types::ContainerDeviceRequest;
use api_types::DeviceUsage;
use k8s_openapi::api::core::v1::Node;
use serde::Deserialize;
use serde::Serialize;

use super::check_model_filter;
use super::check_uuid_filter;
use super::fit;
use super::AllocatableTracker;
use super::Device;
use super::DeviceAnnotationKeys;
use super::FitContext;
use super::FitOutcome;
use super::ResourceNames;
use super::TypeCheck;

pub const NVIDIA_DEVICE: &str = "NVIDIA";

pub const GPU_IN_USE_ANNOTATION: &str = "nvidia.com/use-gputype";
pub const GPU_NO_USE_ANNOTATION: &str = "nvidia.com/nouse-gputype";
pub const GPU_USE_UUID_ANNOTATION: &str = "nvidia.com/use-gpuuuid";
pub const GPU_NO_USE_UUID_ANNOTATION: &str = "nvidia.com/nouse-gpuuuid";
pub const NUMA_BIND_ANNOTATION: &str = "nvidia.com/numa-bind";

const KEYS: DeviceAnnotationKeys = DeviceAnnotationKeys {
    to_allocate: "hami.io/vgpu-devices-to-allocate",
    allocated: "hami.io/vgpu-devices-allocated",
    register: "hami.io/node-nvidia-register",
    handshake: "hami.io/node-handshake",
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NvidiaConfig {
    pub resource_count_name: String,
    pub resource_memory_name: String,
    pub resource_memory_percentage_name: String,
    pub resource_core_name: String,
    /// MiB granted when a container sets neither memory nor a percentage
    pub default_memory: i32,
    pub default_cores: i32,
    pub default_gpu_num: i32,
}

impl Default for NvidiaConfig {
    fn default() -> Self {
        Self {
            resource_count_name: "nvidia.com/gpu".to_string(),
            resource_memory_name: "nvidia.com/gpumem".to_string(),
            resource_memory_percentage_name: "nvidia.com/gpumem-percentage".to_string(),
            resource_core_name: "nvidia.com/gpucores".to_string(),
            default_memory: 0,
            default_cores: 0,
            default_gpu_num: 1,
        }
    }
}

/// NVIDIA GPUs shared by memory and core percentage.
#[derive(Debug, Default)]
pub struct NvidiaDevices {
    config: NvidiaConfig,
    health: AllocatableTracker,
}

impl NvidiaDevices {
    pub fn new(config: NvidiaConfig) -> Self {
        Self {
            config,
            health: AllocatableTracker::default(),
        }
    }
}

fn numa_bind_requested(annotations: &BTreeMap<String, String>) -> bool {
    annotations
        .get(NUMA_BIND_ANNOTATION)
        .and_then(|value| value.trim().parse::<bool>().ok())
        .unwrap_or(false)
}

impl Device for NvidiaDevices {
    fn device_type(&self) -> &'static str {
        NVIDIA_DEVICE
    }

    fn annotation_keys(&self) -> &DeviceAnnotationKeys {
        &KEYS
    }

    fn resource_names(&self) -> ResourceNames<'_> {
        ResourceNames {
            count: &self.config.resource_count_name,
            memory: &self.config.resource_memory_name,
            memory_percentage: Some(&self.config.resource_memory_percentage_name),
            cores: &self.config.resource_core_name,
        }
    }

    fn default_cores(&self) -> i32 {
        self.config.default_cores
    }

    fn default_memory(&self) -> i32 {
        self.config.default_memory
    }

    fn default_device_num(&self) -> i32 {
        self.config.default_gpu_num
    }

    fn resets_on_numa_change(&self) -> bool {
        true
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
        if request.device_type != NVIDIA_DEVICE {
            return TypeCheck::default();
        }
        TypeCheck {
            found: check_model_filter(
                annotations,
                GPU_IN_USE_ANNOTATION,
                GPU_NO_USE_ANNOTATION,
                &device.device_type,
            ),
            numa_bind: numa_bind_requested(annotations),
        }
    }

    fn check_uuid(&self, annotations: &BTreeMap<String, String>, device: &DeviceUsage) -> bool {
        check_uuid_filter(
            annotations,
            GPU_USE_UUID_ANNOTATION,
            GPU_NO_USE_UUID_ANNOTATION,
            &device.id,
        )
    }

    fn fit(
        &self,
        devices: &[DeviceUsage],
        request: &ContainerDeviceRequest,
        ctx: &FitContext<'_>,
    ) -> FitOutcome {
        let mut request = request.clone();
        request.coresreq = request.coresreq.min(100);
        fit::scan(self, devices, &request, ctx)
    }
}

#[cfg(test)]
mod tests {
    use api_types::ContainerDevice;
    use api_types::PodDevices;
    use api_types::MEM_PERCENTAGE_UNSET;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::device::test_util::container;
    use crate::device::test_util::usage;

    fn request(nums: i32) -> ContainerDeviceRequest {
        ContainerDeviceRequest {
            nums,
            device_type: NVIDIA_DEVICE.to_string(),
            memreq: 0,
            mem_percentagereq: MEM_PERCENTAGE_UNSET,
            coresreq: 0,
        }
    }

    fn fit_with(
        devices: &[DeviceUsage],
        request: &ContainerDeviceRequest,
        annotations: &BTreeMap<String, String>,
    ) -> FitOutcome {
        let allocated = PodDevices::new();
        let ctx = FitContext {
            annotations,
            pod: None,
            node_name: "node-a",
            allocated: &allocated,
        };
        NvidiaDevices::default().fit(devices, request, &ctx)
    }

    fn single_card() -> DeviceUsage {
        DeviceUsage {
            count: 1,
            ..usage("GPU-0", 0, "NVIDIA-Tesla T4")
        }
    }

    #[test]
    fn whole_card_by_percentage() {
        let mut req = request(1);
        req.mem_percentagereq = 100;
        req.coresreq = 100;

        let outcome = fit_with(&[single_card()], &req, &BTreeMap::new());
        let FitOutcome::Fit { devices } = outcome else {
            panic!("expected fit");
        };
        assert_eq!(
            devices[NVIDIA_DEVICE],
            vec![ContainerDevice {
                idx: 0,
                uuid: "GPU-0".to_string(),
                device_type: NVIDIA_DEVICE.to_string(),
                usedmem: 8192,
                usedcores: 100,
                custom_info: BTreeMap::new(),
            }]
        );
    }

    #[test]
    fn time_sliced_card_is_exhausted() {
        let mut dev = single_card();
        dev.used = 1;
        let mut req = request(1);
        req.mem_percentagereq = 100;

        let outcome = fit_with(&[dev], &req, &BTreeMap::new());
        assert_eq!(outcome.reason(), Some("1/1 CardTimeSlicingExhausted"));
    }

    #[test]
    fn every_exhausted_card_reports_time_slicing() {
        let devices: Vec<_> = (0..4)
            .map(|i| DeviceUsage {
                used: 10,
                ..usage(&format!("GPU-{i}"), i, "NVIDIA-A100")
            })
            .collect();

        let outcome = fit_with(&devices, &request(2), &BTreeMap::new());
        assert!(!outcome.is_fit());
        assert_eq!(outcome.reason(), Some("4/4 CardTimeSlicingExhausted"));
    }

    #[test]
    fn scans_from_highest_index() {
        let devices = vec![usage("GPU-0", 0, "NVIDIA-A100"), usage("GPU-1", 1, "NVIDIA-A100")];
        let FitOutcome::Fit { devices: result } = fit_with(&devices, &request(1), &BTreeMap::new())
        else {
            panic!("expected fit");
        };
        assert_eq!(result[NVIDIA_DEVICE][0].uuid, "GPU-1");
    }

    #[test]
    fn partial_progress_is_reported() {
        let mut busy = usage("GPU-0", 0, "NVIDIA-A100");
        busy.usedmem = 8000;
        let devices = vec![busy, usage("GPU-1", 1, "NVIDIA-A100")];
        let mut req = request(2);
        req.memreq = 1024;

        let outcome = fit_with(&devices, &req, &BTreeMap::new());
        let FitOutcome::Unfit { reason, partial } = outcome else {
            panic!("expected unfit");
        };
        assert_eq!(partial.len(), 1);
        assert_eq!(
            reason,
            "1/2 CardInsufficientMemory, 1/2 AllocatedCardsInsufficientRequest"
        );
    }

    #[test]
    fn cores_above_hundred_are_clamped() {
        let mut req = request(1);
        req.coresreq = 150;
        let FitOutcome::Fit { devices } = fit_with(&[single_card()], &req, &BTreeMap::new()) else {
            panic!("expected fit");
        };
        assert_eq!(devices[NVIDIA_DEVICE][0].usedcores, 100);
    }

    #[test]
    fn type_and_uuid_filters() {
        let devices = vec![usage("GPU-0", 0, "NVIDIA-A100"), usage("GPU-1", 1, "NVIDIA-T4")];
        let mut annotations = BTreeMap::new();
        annotations.insert(GPU_NO_USE_ANNOTATION.to_string(), "t4".to_string());
        let FitOutcome::Fit { devices: result } = fit_with(&devices, &request(1), &annotations)
        else {
            panic!("expected fit");
        };
        assert_eq!(result[NVIDIA_DEVICE][0].uuid, "GPU-0");

        annotations.insert(GPU_NO_USE_UUID_ANNOTATION.to_string(), "GPU-0".to_string());
        let outcome = fit_with(&devices, &request(1), &annotations);
        assert_eq!(
            outcome.reason(),
            Some("1/2 CardTypeMismatch, 1/2 CardUuidMismatch")
        );
    }

    #[test]
    fn numa_change_discards_partial_selection() {
        let mut devices = vec![
            usage("GPU-0", 0, "NVIDIA-A100"),
            usage("GPU-1", 1, "NVIDIA-A100"),
            usage("GPU-2", 2, "NVIDIA-A100"),
        ];
        devices[2].numa = 1;
        let mut annotations = BTreeMap::new();
        annotations.insert(NUMA_BIND_ANNOTATION.to_string(), "true".to_string());

        let FitOutcome::Fit { devices: result } = fit_with(&devices, &request(2), &annotations)
        else {
            panic!("expected fit");
        };
        let uuids: Vec<_> = result[NVIDIA_DEVICE].iter().map(|d| d.uuid.as_str()).collect();
        assert_eq!(uuids, vec!["GPU-1", "GPU-0"]);

        devices[0].numa = 2;
        let outcome = fit_with(&devices, &request(2), &annotations);
        assert_eq!(
            outcome.reason(),
            Some("2/3 NumaNotFit, 1/3 AllocatedCardsInsufficientRequest")
        );
    }

    #[test]
    fn unhealthy_devices_are_reported() {
        let mut sick = single_card();
        sick.health = false;
        let outcome = fit_with(&[sick.clone()], &request(1), &BTreeMap::new());
        assert_eq!(outcome.reason(), Some("1/1 CardNotHealth"));

        let mut mixed = vec![sick, single_card()];
        mixed[1].id = "GPU-1".to_string();
        let outcome = fit_with(&mixed, &request(2), &BTreeMap::new());
        assert_eq!(
            outcome.reason(),
            Some("1/2 CardNotHealth, 1/2 AllocatedCardsInsufficientRequest")
        );
    }

    #[test]
    fn sequential_grants_stay_within_capacity() {
        let vendor = NvidiaDevices::default();
        for (memreq, coresreq, count, expected, limit) in [
            (3000, 30, 10, 2, "1/1 CardInsufficientMemory"),
            (1000, 40, 10, 2, "1/1 CardInsufficientCore"),
            (100, 0, 3, 3, "1/1 CardTimeSlicingExhausted"),
        ] {
            let mut device = DeviceUsage {
                count,
                ..usage("GPU-0", 0, "NVIDIA-A100")
            };
            let mut req = request(1);
            req.memreq = memreq;
            req.coresreq = coresreq;

            let mut granted = 0;
            let reason = loop {
                let outcome = fit_with(&[device.clone()], &req, &BTreeMap::new());
                let FitOutcome::Fit { devices } = outcome else {
                    break outcome.reason().map(str::to_string);
                };
                vendor
                    .add_resource_usage(&mut device, &devices[NVIDIA_DEVICE][0])
                    .unwrap();
                granted += 1;
                assert!(device.used <= device.count);
                assert!(device.usedmem <= device.totalmem);
                assert!(device.usedcores <= device.totalcore);
            };
            assert_eq!(granted, expected);
            assert_eq!(reason.as_deref(), Some(limit));
        }
    }

    #[test]
    fn other_vendor_request_is_type_mismatch() {
        let mut req = request(1);
        req.device_type = "DCU".to_string();
        let outcome = fit_with(&[single_card()], &req, &BTreeMap::new());
        assert_eq!(outcome.reason(), Some("1/1 CardTypeMismatch"));
    }

    #[test]
    fn requests_from_limits() {
        let nvidia = NvidiaDevices::default();
        let req = nvidia.generate_resource_requests(&container(&[
            ("nvidia.com/gpu", "2"),
            ("nvidia.com/gpumem", "3000"),
            ("nvidia.com/gpucores", "30"),
        ]));
        assert_eq!(
            req,
            ContainerDeviceRequest {
                nums: 2,
                device_type: NVIDIA_DEVICE.to_string(),
                memreq: 3000,
                mem_percentagereq: MEM_PERCENTAGE_UNSET,
                coresreq: 30,
            }
        );

        let req = nvidia.generate_resource_requests(&container(&[("nvidia.com/gpu", "1")]));
        assert_eq!(req.memreq, 0);
        assert_eq!(req.mem_percentagereq, 100);

        let req = nvidia.generate_resource_requests(&container(&[("cpu", "1")]));
        assert_eq!(req.nums, 0);
    }

    #[test]
    fn default_memory_applies_without_percentage() {
        let nvidia = NvidiaDevices::new(NvidiaConfig {
            default_memory: 2048,
            ..Default::default()
        });
        let req = nvidia.generate_resource_requests(&container(&[("nvidia.com/gpu", "1")]));
        assert_eq!(req.memreq, 2048);
        assert_eq!(req.mem_percentagereq, MEM_PERCENTAGE_UNSET);
    }

    #[test]
    fn admission_injects_default_count() {
        let nvidia = NvidiaDevices::default();
        let mut ctr = container(&[("nvidia.com/gpumem", "1000")]);
        assert!(nvidia.mutate_admission(&mut ctr));
        let limits = ctr.resources.unwrap().limits.unwrap();
        assert_eq!(limits["nvidia.com/gpu"].0, "1");

        let mut ctr = container(&[("cpu", "2")]);
        assert!(!nvidia.mutate_admission(&mut ctr));
    }

    #[test]
    fn patch_writes_both_keys() {
        let mut pod_devices = PodDevices::new();
        pod_devices.insert(
            NVIDIA_DEVICE.to_string(),
            vec![vec![ContainerDevice {
                uuid: "GPU-0".to_string(),
                device_type: NVIDIA_DEVICE.to_string(),
                usedmem: 1000,
                usedcores: 30,
                ..Default::default()
            }]],
        );
        let mut annotations = BTreeMap::new();
        NvidiaDevices::default().patch_annotations(&pod_devices, &mut annotations);
        assert_eq!(annotations[KEYS.to_allocate], "GPU-0,NVIDIA,1000,30;");
        assert_eq!(annotations[KEYS.allocated], "GPU-0,NVIDIA,1000,30;");
    }
}
