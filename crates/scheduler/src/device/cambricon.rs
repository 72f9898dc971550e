use std::collections::BTreeMap;
use std::sync::Arc;

use api_types::ContainerDeviceRequest;
use api_types::DeviceUsage;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Node;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use super::check_model_filter;
use super::check_uuid_filter;
use super::fit;
use super::fit::Candidate;
use super::fit::ScanStep;
use super::resource_requests;
use super::ring::AllocationPolicy;
use super::ring::AllocatorKind;
use super::ring::NoRings;
use super::ring::RingAllocator;
use super::ring::RingTopology;
use super::AllocatableTracker;
use super::Device;
use super::DeviceAnnotationKeys;
use super::FitContext;
use super::FitOutcome;
use super::FitReason;
use super::ResourceNames;
use super::TypeCheck;

pub const CAMBRICON_MLU_DEVICE: &str = "MLU";

pub const MLU_IN_USE_ANNOTATION: &str = "cambricon.com/use-mlutype";
pub const MLU_NO_USE_ANNOTATION: &str = "cambricon.com/nouse-mlutype";
pub const MLU_USE_UUID_ANNOTATION: &str = "cambricon.com/use-gpuuuid";
pub const MLU_NO_USE_UUID_ANNOTATION: &str = "cambricon.com/nouse-gpuuuid";

const KEYS: DeviceAnnotationKeys = DeviceAnnotationKeys {
    to_allocate: "hami.io/cambricon-mlu-devices-to-allocate",
    allocated: "hami.io/cambricon-mlu-devices-allocated",
    register: "hami.io/node-mlu-register",
    handshake: "hami.io/node-handshake-mlu",
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CambriconConfig {
    pub resource_count_name: String,
    pub resource_memory_name: String,
    pub resource_core_name: String,
    /// MiB per unit of the memory resource
    pub memory_unit: i32,
    pub allocator: AllocatorKind,
    pub allocation_policy: AllocationPolicy,
}

impl Default for CambriconConfig {
    fn default() -> Self {
        Self {
            resource_count_name: "cambricon.com/vmlu".to_string(),
            resource_memory_name: "cambricon.com/mlu.smlu.vmemory".to_string(),
            resource_core_name: "cambricon.com/mlu.smlu.vcore".to_string(),
            memory_unit: 256,
            allocator: AllocatorKind::Default,
            allocation_policy: AllocationPolicy::BestEffort,
        }
    }
}

/// Cambricon MLUs; multi-device requests go through the ring allocator.
#[derive(Debug)]
pub struct MluDevices {
    config: CambriconConfig,
    health: AllocatableTracker,
    allocator: RingAllocator,
}

impl Default for MluDevices {
    fn default() -> Self {
        Self::new(CambriconConfig::default())
    }
}

impl MluDevices {
    pub fn new(config: CambriconConfig) -> Self {
        Self::with_topology(config, Arc::new(NoRings))
    }

    pub fn with_topology(config: CambriconConfig, topology: Arc<dyn RingTopology>) -> Self {
        let allocator = RingAllocator::new(config.allocator, config.allocation_policy, topology);
        Self {
            config,
            health: AllocatableTracker::default(),
            allocator,
        }
    }
}

impl Device for MluDevices {
    fn device_type(&self) -> &'static str {
        CAMBRICON_MLU_DEVICE
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

    fn generate_resource_requests(&self, container: &Container) -> ContainerDeviceRequest {
        let mut request = resource_requests(self, container);
        request.memreq = request.memreq.saturating_mul(self.config.memory_unit);
        request
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
            found: request.device_type == CAMBRICON_MLU_DEVICE
                && check_model_filter(
                    annotations,
                    MLU_IN_USE_ANNOTATION,
                    MLU_NO_USE_ANNOTATION,
                    &device.device_type,
                ),
            numa_bind: false,
        }
    }

    fn check_uuid(&self, annotations: &BTreeMap<String, String>, device: &DeviceUsage) -> bool {
        check_uuid_filter(
            annotations,
            MLU_USE_UUID_ANNOTATION,
            MLU_NO_USE_UUID_ANNOTATION,
            &device.id,
        )
    }

    fn fit(
        &self,
        devices: &[DeviceUsage],
        request: &ContainerDeviceRequest,
        ctx: &FitContext<'_>,
    ) -> FitOutcome {
        if request.nums <= 1 {
            return fit::scan(self, devices, request, ctx);
        }

        let mut candidates: Vec<Candidate<'_>> = Vec::new();
        let mut reasons = fit::walk(self, devices, request, ctx, |step, _| {
            if let ScanStep::Pass(candidate) = step {
                candidates.push(candidate);
            }
            false
        });

        let size = request.nums as usize;
        if candidates.len() < size {
            reasons.add_n(FitReason::AllocatedCardsInsufficientRequest, candidates.len());
            return FitOutcome::Unfit {
                reason: reasons.render(devices.len()),
                partial: candidates.into_iter().map(|c| c.grant).collect(),
            };
        }

        let available: Vec<u32> = candidates.iter().map(|c| c.device.index).collect();
        match self.allocator.allocate(&available, size) {
            Ok(chosen) => {
                let granted = chosen
                    .iter()
                    .filter_map(|ordinal| candidates.iter().find(|c| c.device.index == *ordinal))
                    .map(|c| c.grant.clone())
                    .collect();
                let mut result = BTreeMap::new();
                result.insert(request.device_type.clone(), granted);
                FitOutcome::Fit { devices: result }
            }
            Err(e) => {
                debug!(node = ctx.node_name, ?available, size, "Ring allocation failed: {e:?}");
                reasons.add_n(FitReason::TopologyNotFit, candidates.len());
                FitOutcome::Unfit {
                    reason: reasons.render(devices.len()),
                    partial: Vec::new(),
                }
            }
        }
    }
}
