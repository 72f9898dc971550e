//! In-memory [`KubeClient`] for tests
//!
//! Nodes and pods live in concurrent maps; merge patches are applied to the
//! stored objects so that callers observe their own writes on the next read.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use error_stack::Report;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodSpec;
use kube::api::ObjectMeta;

use crate::k8s::client::KubeClient;
use crate::k8s::types::AnnotationPatch;
use crate::k8s::types::KubernetesError;

type PodKey = (String, String);

/// Mock Kubernetes client
#[derive(Default)]
pub struct MockKubeClient {
    nodes: DashMap<String, Node>,
    pods: DashMap<PodKey, Pod>,
    bindings: Mutex<Vec<(String, String, String)>>,
    failing_node_patches: AtomicUsize,
    lost_node_patch_acks: AtomicUsize,
    node_patch_calls: AtomicUsize,
    pod_patch_delay_ms: AtomicU64,
}

impl MockKubeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_node(&self, node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.nodes.insert(name, node);
    }

    /// Insert an empty node carrying only the given annotations.
    pub fn add_node(&self, name: &str, annotations: BTreeMap<String, String>) {
        self.insert_node(Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        });
    }

    pub fn insert_pod(&self, pod: Pod) {
        let key = (
            pod.metadata.namespace.clone().unwrap_or_else(|| "default".to_string()),
            pod.metadata.name.clone().unwrap_or_default(),
        );
        self.pods.insert(key, pod);
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.pods.remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn node_annotation(&self, node: &str, key: &str) -> Option<String> {
        self.nodes.get(node).and_then(|n| {
            n.metadata
                .annotations
                .as_ref()
                .and_then(|annotations| annotations.get(key).cloned())
        })
    }

    pub fn pod_annotation(&self, namespace: &str, name: &str, key: &str) -> Option<String> {
        self.pods
            .get(&(namespace.to_string(), name.to_string()))
            .and_then(|p| {
                p.metadata
                    .annotations
                    .as_ref()
                    .and_then(|annotations| annotations.get(key).cloned())
            })
    }

    /// Make the next `count` node patches fail with [`KubernetesError::UpdateFailed`].
    pub fn fail_next_node_patches(&self, count: usize) {
        self.failing_node_patches.store(count, Ordering::SeqCst);
    }

    /// Apply the next `count` node patches but report them as timed out.
    pub fn lose_next_node_patch_acks(&self, count: usize) {
        self.lost_node_patch_acks.store(count, Ordering::SeqCst);
    }

    /// Sleep this long inside every pod annotation patch.
    pub fn delay_pod_patches(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.pod_patch_delay_ms.store(millis, Ordering::SeqCst);
    }

    pub fn node_patch_calls(&self) -> usize {
        self.node_patch_calls.load(Ordering::SeqCst)
    }

    /// Bindings performed so far as `(namespace, name, node)`.
    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.bindings
            .lock()
            .map(|bindings| bindings.clone())
            .unwrap_or_default()
    }
}

fn apply_patch(meta: &mut ObjectMeta, patch: &AnnotationPatch) {
    let annotations = meta.annotations.get_or_insert_with(BTreeMap::new);
    for (key, value) in patch {
        match value {
            Some(value) => {
                annotations.insert(key.clone(), value.clone());
            }
            None => {
                annotations.remove(key);
            }
        }
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn not_found(message: String) -> Report<KubernetesError> {
    Report::new(KubernetesError::NotFound { message })
}

#[async_trait::async_trait]
impl KubeClient for MockKubeClient {
    async fn get_node(&self, name: &str) -> Result<Node, Report<KubernetesError>> {
        self.nodes
            .get(name)
            .map(|node| node.clone())
            .ok_or_else(|| not_found(format!("node {name}")))
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, Report<KubernetesError>> {
        Ok(self.nodes.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn patch_node_annotations(
        &self,
        name: &str,
        annotations: &AnnotationPatch,
    ) -> Result<(), Report<KubernetesError>> {
        self.node_patch_calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.failing_node_patches) {
            return Err(Report::new(KubernetesError::UpdateFailed {
                message: format!("node {name}: injected conflict"),
            }));
        }

        let mut node = self
            .nodes
            .get_mut(name)
            .ok_or_else(|| not_found(format!("node {name}")))?;
        apply_patch(&mut node.metadata, annotations);
        drop(node);

        if take_one(&self.lost_node_patch_acks) {
            return Err(Report::new(KubernetesError::UpdateFailed {
                message: format!("node {name}: injected timeout after apply"),
            }));
        }
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, Report<KubernetesError>> {
        self.pods
            .get(&(namespace.to_string(), name.to_string()))
            .map(|pod| pod.clone())
            .ok_or_else(|| not_found(format!("pod {namespace}/{name}")))
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, Report<KubernetesError>> {
        Ok(self.pods.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &AnnotationPatch,
    ) -> Result<(), Report<KubernetesError>> {
        let delay = self.pod_patch_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let mut pod = self
            .pods
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| not_found(format!("pod {namespace}/{name}")))?;
        apply_patch(&mut pod.metadata, annotations);
        Ok(())
    }

    async fn bind_pod(
        &self,
        namespace: &str,
        name: &str,
        node: &str,
    ) -> Result<(), Report<KubernetesError>> {
        let mut pod = self
            .pods
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| not_found(format!("pod {namespace}/{name}")))?;
        pod.spec
            .get_or_insert_with(PodSpec::default)
            .node_name = Some(node.to_string());
        drop(pod);

        if let Ok(mut bindings) = self.bindings.lock() {
            bindings.push((namespace.to_string(), name.to_string(), node.to_string()));
        }
        Ok(())
    }
}
