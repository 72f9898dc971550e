//! Cache of pods holding device grants.

use api_types::PodDevices;
use dashmap::DashMap;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Pod;
use tracing::debug;
use tracing::warn;

use super::SchedulerError;
use crate::device::DeviceRegistry;
use crate::k8s::annotations::is_pod_terminated;
use crate::k8s::annotations::pod_annotations;
use crate::k8s::annotations::pod_name;
use crate::k8s::annotations::pod_namespace;
use crate::k8s::annotations::pod_uid;
use crate::k8s::KubeClient;
use crate::k8s::SchedulingAnnotations;

/// A pod bound, or being bound, to a node with device grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub node: String,
    pub devices: PodDevices,
}

impl PodInfo {
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

pub fn pod_key(pod: &Pod) -> String {
    format!("{}/{}", pod_namespace(pod), pod_name(pod))
}

#[derive(Debug, Default)]
pub struct PodManager {
    pods: DashMap<String, PodInfo>,
}

impl PodManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pod(&self, pod: &Pod, node: &str, devices: PodDevices) {
        let info = PodInfo {
            namespace: pod_namespace(pod).to_string(),
            name: pod_name(pod).to_string(),
            uid: pod_uid(pod).to_string(),
            node: node.to_string(),
            devices,
        };
        debug!(pod = %info.key(), node, "Tracking pod devices");
        self.pods.insert(info.key(), info);
    }

    pub fn del_pod(&self, pod: &Pod) {
        if self.pods.remove(&pod_key(pod)).is_some() {
            debug!(pod = %pod_key(pod), "Stopped tracking pod");
        }
    }

    pub fn get_pod(&self, key: &str) -> Option<PodInfo> {
        self.pods.get(key).map(|entry| entry.clone())
    }

    /// Tracked pods assigned to `node`.
    pub fn pods_on(&self, node: &str) -> Vec<PodInfo> {
        self.pods
            .iter()
            .filter(|entry| entry.node == node)
            .map(|entry| entry.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    /// Start or stop tracking `pod` from its current state.
    ///
    /// Terminated pods and pods without an assignment or grants are dropped.
    /// A malformed grant annotation is logged and the pod counts as holding
    /// no devices.
    pub fn track(&self, pod: &Pod, registry: &DeviceRegistry) {
        if is_pod_terminated(pod) {
            self.del_pod(pod);
            return;
        }
        let annotations = pod_annotations(pod);
        let assigned = SchedulingAnnotations::from_pod_annotations(annotations)
            .ok()
            .and_then(|scheduling| scheduling.assigned_node)
            .or_else(|| pod.spec.as_ref().and_then(|spec| spec.node_name.clone()));
        let Some(node) = assigned else {
            self.del_pod(pod);
            return;
        };

        match registry.allocated_pod_devices(annotations) {
            Ok(devices) if !devices.is_empty() => self.add_pod(pod, &node, devices),
            Ok(_) => self.del_pod(pod),
            Err(e) => {
                warn!(pod = %pod_key(pod), "Ignoring malformed device annotation: {e:?}");
                self.del_pod(pod);
            }
        }
    }

    /// Rebuild the cache from a full pod list.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::Kubernetes`] if pods cannot be listed; the cache is left as is
    #[tracing::instrument(skip_all)]
    pub async fn refresh(
        &self,
        client: &dyn KubeClient,
        registry: &DeviceRegistry,
    ) -> Result<(), Report<SchedulerError>> {
        let pods = client
            .list_pods()
            .await
            .change_context(SchedulerError::Kubernetes {
                message: "listing pods".to_string(),
            })?;

        let listed: Vec<String> = pods.iter().map(pod_key).collect();
        self.pods.retain(|key, _| listed.contains(key));
        for pod in &pods {
            self.track(pod, registry);
        }
        debug!(tracked = self.pods.len(), "Pod cache refreshed");
        Ok(())
    }
}
