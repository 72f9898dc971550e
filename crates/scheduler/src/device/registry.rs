use std::collections::BTreeMap;
use std::sync::Arc;

use api_types::ContainerDeviceRequests;
use api_types::ContainerDevices;
use api_types::PodDevices;
use error_stack::Report;
use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

use super::cambricon::MluDevices;
use super::hygon::DcuDevices;
use super::nvidia::NvidiaDevices;
use super::Device;
use crate::codec;
use crate::codec::CodecError;
use crate::config::DeviceConfig;
use crate::k8s::AnnotationPatch;

/// Vendor tag to implementation, built once at startup.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<&'static str, Arc<dyn Device>>,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DeviceRegistry {
    pub fn new(config: &DeviceConfig) -> Self {
        Self::default()
            .with_device(NvidiaDevices::new(config.nvidia.clone()))
            .with_device(DcuDevices::new(config.hygon.clone()))
            .with_device(MluDevices::new(config.cambricon.clone()))
    }

    /// Register `device`, replacing any implementation with the same tag.
    pub fn with_device(mut self, device: impl Device + 'static) -> Self {
        self.devices.insert(device.device_type(), Arc::new(device));
        self
    }

    pub fn get(&self, device_type: &str) -> Option<&Arc<dyn Device>> {
        self.devices.get(device_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Arc<dyn Device>)> {
        self.devices.iter().map(|(k, v)| (*k, v))
    }

    pub fn device_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.devices.keys().copied()
    }

    /// Let every vendor inspect every container; returns whether any vendor claimed one.
    pub fn mutate_admission(&self, pod: &mut Pod) -> bool {
        let Some(spec) = pod.spec.as_mut() else {
            return false;
        };
        let mut found = false;
        for container in &mut spec.containers {
            for device in self.devices.values() {
                found |= device.mutate_admission(container);
            }
        }
        found
    }

    /// Per-container requests of `pod`, in container order.
    ///
    /// Vendors a container does not ask for are left out of its map.
    pub fn resource_requests(&self, pod: &Pod) -> Vec<ContainerDeviceRequests> {
        let Some(spec) = pod.spec.as_ref() else {
            return Vec::new();
        };
        spec.containers
            .iter()
            .map(|container| {
                self.devices
                    .iter()
                    .filter_map(|(device_type, device)| {
                        let request = device.generate_resource_requests(container);
                        (request.nums > 0).then(|| (device_type.to_string(), request))
                    })
                    .collect()
            })
            .collect()
    }

    /// Grants recorded on a pod under every vendor's allocated key.
    ///
    /// # Errors
    ///
    /// - [`CodecError`] if any payload is malformed; nothing is returned in that case
    pub fn allocated_pod_devices(
        &self,
        annotations: &BTreeMap<String, String>,
    ) -> Result<PodDevices, Report<CodecError>> {
        let mut pod_devices = PodDevices::new();
        for (device_type, device) in &self.devices {
            if let Some(containers) = device.decode_annotations(annotations)? {
                pod_devices.insert(device_type.to_string(), containers);
            }
        }
        Ok(pod_devices)
    }

    fn to_allocate_payload<'p>(&self, device_type: &str, pod: &'p Pod) -> Option<(&'static str, &'p str)> {
        let key = self.get(device_type)?.annotation_keys().to_allocate;
        let value = pod.metadata.annotations.as_ref()?.get(key)?;
        Some((key, value.as_str()))
    }

    /// Position and devices of the first container of `pod` still waiting
    /// for `device_type` devices.
    ///
    /// # Errors
    ///
    /// - [`CodecError`] if the to-allocate payload is malformed
    pub fn next_device_request(
        &self,
        device_type: &str,
        pod: &Pod,
    ) -> Result<Option<(usize, ContainerDevices)>, Report<CodecError>> {
        match self.to_allocate_payload(device_type, pod) {
            Some((_, encoded)) => codec::next_device_request(encoded),
            None => Ok(None),
        }
    }

    /// Patch marking the container from [`Self::next_device_request`] as served.
    ///
    /// # Errors
    ///
    /// - [`CodecError`] if the to-allocate payload is malformed
    pub fn erase_next_device_request(
        &self,
        device_type: &str,
        pod: &Pod,
    ) -> Result<Option<AnnotationPatch>, Report<CodecError>> {
        let Some((key, encoded)) = self.to_allocate_payload(device_type, pod) else {
            return Ok(None);
        };
        let erased = codec::erase_next_device_request(encoded)?;
        let mut patch = AnnotationPatch::new();
        patch.insert(key.to_string(), Some(erased));
        Ok(Some(patch))
    }

    /// Write every vendor's grants into `annotations`.
    pub fn patch_annotations(&self, pod_devices: &PodDevices, annotations: &mut BTreeMap<String, String>) {
        for (device_type, device) in &self.devices {
            debug!(device_type, "Patching annotations");
            device.patch_annotations(pod_devices, annotations);
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::PodSpec;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::device::test_util;
    use crate::device::test_util::container;
    use crate::score::calc_score;
    use crate::score::ScorePolicies;
    use crate::usage::NodeUsage;

    fn pod(containers: Vec<k8s_openapi::api::core::v1::Container>) -> Pod {
        Pod {
            spec: Some(PodSpec {
                containers,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn registers_every_vendor() {
        let registry = DeviceRegistry::new(&DeviceConfig::default());
        assert_eq!(
            registry.device_types().collect::<Vec<_>>(),
            vec!["DCU", "MLU", "NVIDIA"]
        );
        assert!(registry.get("NVIDIA").is_some());
        assert!(registry.get("TPU").is_none());
    }

    #[test]
    fn requests_follow_container_order() {
        let registry = DeviceRegistry::new(&DeviceConfig::default());
        let pod = pod(vec![
            container(&[("cpu", "1")]),
            container(&[("nvidia.com/gpu", "1"), ("hygon.com/dcunum", "1")]),
        ]);

        let requests = registry.resource_requests(&pod);
        assert_eq!(requests.len(), 2);
        assert!(requests[0].is_empty());
        assert_eq!(
            requests[1].keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["DCU", "NVIDIA"]
        );
    }

    #[test]
    fn admission_claims_memory_only_container() {
        let registry = DeviceRegistry::new(&DeviceConfig::default());
        let mut pod = pod(vec![container(&[("nvidia.com/gpumem", "1024")])]);
        assert!(registry.mutate_admission(&mut pod));
        assert_eq!(registry.resource_requests(&pod)[0]["NVIDIA"].nums, 1);
    }

    #[test]
    fn allocated_devices_roundtrip_through_annotations() {
        let registry = DeviceRegistry::new(&DeviceConfig::default());
        let mut pod_devices = PodDevices::new();
        pod_devices.insert(
            "NVIDIA".to_string(),
            vec![
                vec![],
                vec![api_types::ContainerDevice {
                    uuid: "GPU-0".to_string(),
                    device_type: "NVIDIA".to_string(),
                    usedmem: 1024,
                    usedcores: 10,
                    ..Default::default()
                }],
            ],
        );

        let mut annotations = BTreeMap::new();
        registry.patch_annotations(&pod_devices, &mut annotations);
        assert_eq!(registry.allocated_pod_devices(&annotations).unwrap(), pod_devices);
    }

    #[test]
    fn scored_grants_roundtrip_through_annotations() {
        let registry = DeviceRegistry::new(&DeviceConfig::default());
        let pod = pod(vec![
            container(&[("nvidia.com/gpu", "2"), ("nvidia.com/gpumem", "1024")]),
            container(&[("cpu", "1")]),
            container(&[("hygon.com/dcunum", "1"), ("hygon.com/dcucores", "20")]),
        ]);
        let mut usage = NodeUsage {
            node: "node-a".to_string(),
            ..Default::default()
        };
        usage.devices.insert(
            "NVIDIA".to_string(),
            (0..3)
                .map(|i| test_util::usage(&format!("GPU-{i}"), i + 2, "NVIDIA-A100"))
                .collect(),
        );
        usage
            .devices
            .insert("DCU".to_string(), vec![test_util::usage("DCU-0", 0, "DCU-Z100")]);

        let scored = calc_score(
            &registry,
            &[usage],
            &registry.resource_requests(&pod),
            &pod,
            ScorePolicies::default(),
        );
        assert!(scored.failed.is_empty(), "{:?}", scored.failed);
        let granted = &scored.scores[0].devices;
        assert!(granted["NVIDIA"][0].iter().all(|d| d.idx >= 2));
        assert!(!granted["DCU"][2][0].custom_info.is_empty());

        let mut annotations = BTreeMap::new();
        registry.patch_annotations(granted, &mut annotations);
        assert_eq!(&registry.allocated_pod_devices(&annotations).unwrap(), granted);
    }

    #[test]
    fn empty_grants_roundtrip_through_annotations() {
        let registry = DeviceRegistry::new(&DeviceConfig::default());
        for pod_devices in [
            PodDevices::new(),
            [("NVIDIA".to_string(), vec![])].into_iter().collect(),
            [("MLU".to_string(), vec![vec![], vec![]])].into_iter().collect(),
        ] {
            let mut annotations = BTreeMap::new();
            registry.patch_annotations(&pod_devices, &mut annotations);
            assert_eq!(registry.allocated_pod_devices(&annotations).unwrap(), pod_devices);
        }
    }

    #[test]
    fn next_request_and_erase() {
        let registry = DeviceRegistry::new(&DeviceConfig::default());
        let mut pod = pod(vec![container(&[]), container(&[])]);
        pod.metadata.annotations = Some(
            [(
                "hami.io/dcu-devices-to-allocate".to_string(),
                ";DCU-0,DCU,1024,50;".to_string(),
            )]
            .into_iter()
            .collect(),
        );

        let (position, devices) = registry.next_device_request("DCU", &pod).unwrap().unwrap();
        assert_eq!(position, 1);
        assert_eq!(devices[0].uuid, "DCU-0");
        assert_eq!(registry.next_device_request("NVIDIA", &pod).unwrap(), None);

        let patch = registry.erase_next_device_request("DCU", &pod).unwrap().unwrap();
        assert_eq!(
            patch["hami.io/dcu-devices-to-allocate"].as_deref(),
            Some(";;")
        );
    }

    #[test]
    fn malformed_payload_fails_closed() {
        let registry = DeviceRegistry::new(&DeviceConfig::default());
        let mut annotations = BTreeMap::new();
        annotations.insert(
            "hami.io/vgpu-devices-allocated".to_string(),
            "GPU-0,NVIDIA,abc,10;".to_string(),
        );
        assert!(registry.allocated_pod_devices(&annotations).is_err());
    }
}
