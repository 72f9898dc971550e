use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Binding;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::api::ObjectMeta;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::api::PostParams;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Api;
use kube::Client;
use kube::Config;

use crate::k8s::types::AnnotationPatch;
use crate::k8s::types::KubernetesError;

/// Cluster operations used by the scheduler, the node lock and the node agent.
#[async_trait::async_trait]
pub trait KubeClient: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Node, Report<KubernetesError>>;

    async fn list_nodes(&self) -> Result<Vec<Node>, Report<KubernetesError>>;

    /// Merge-patch node annotations; `None` values delete the key.
    async fn patch_node_annotations(
        &self,
        name: &str,
        annotations: &AnnotationPatch,
    ) -> Result<(), Report<KubernetesError>>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, Report<KubernetesError>>;

    /// List pods across all namespaces.
    async fn list_pods(&self) -> Result<Vec<Pod>, Report<KubernetesError>>;

    /// Merge-patch pod annotations; `None` values delete the key.
    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &AnnotationPatch,
    ) -> Result<(), Report<KubernetesError>>;

    /// Bind a pending pod to a node.
    async fn bind_pod(
        &self,
        namespace: &str,
        name: &str,
        node: &str,
    ) -> Result<(), Report<KubernetesError>>;
}

/// [`KubeClient`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeApiClient {
    client: Client,
}

impl KubeApiClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using an explicit kubeconfig or the default configuration.
    ///
    /// # Errors
    ///
    /// - [`KubernetesError::ConnectionFailed`] if unable to build a client
    pub async fn connect(kubeconfig: Option<PathBuf>) -> Result<Self, Report<KubernetesError>> {
        let connection_failed = |message: String| KubernetesError::ConnectionFailed { message };
        let Some(path) = kubeconfig else {
            // in-cluster service account, then ~/.kube/config
            let client = Client::try_default()
                .await
                .change_context_lazy(|| connection_failed("no default kube config".to_string()))?;
            return Ok(Self::new(client));
        };

        let kubeconfig = Kubeconfig::read_from(&path)
            .change_context_lazy(|| connection_failed(format!("reading {}", path.display())))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .change_context_lazy(|| connection_failed(format!("loading {}", path.display())))?;
        let client = Client::try_from(config)
            .change_context_lazy(|| connection_failed(format!("client for {}", path.display())))?;
        Ok(Self::new(client))
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn annotation_patch(annotations: &AnnotationPatch) -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "annotations": annotations,
        }
    })
}

/// Maps a 404 to [`KubernetesError::NotFound`] and anything else to `fallback`.
fn map_kube_error(
    err: kube::Error,
    what: String,
    fallback: impl FnOnce(String) -> KubernetesError,
) -> Report<KubernetesError> {
    match err {
        kube::Error::Api(api_err) if api_err.code == 404 => {
            Report::new(KubernetesError::NotFound { message: what })
        }
        other => Report::new(fallback(format!("{what}: {other}"))),
    }
}

#[async_trait::async_trait]
impl KubeClient for KubeApiClient {
    async fn get_node(&self, name: &str) -> Result<Node, Report<KubernetesError>> {
        self.nodes().get(name).await.map_err(|e| {
            map_kube_error(e, format!("node {name}"), |message| {
                KubernetesError::GetFailed { message }
            })
        })
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, Report<KubernetesError>> {
        let nodes = self
            .nodes()
            .list(&ListParams::default())
            .await
            .change_context(KubernetesError::ListFailed {
                message: "nodes".to_string(),
            })?;
        Ok(nodes.items)
    }

    async fn patch_node_annotations(
        &self,
        name: &str,
        annotations: &AnnotationPatch,
    ) -> Result<(), Report<KubernetesError>> {
        self.nodes()
            .patch(
                name,
                &PatchParams::default(),
                &Patch::Merge(annotation_patch(annotations)),
            )
            .await
            .map_err(|e| {
                map_kube_error(e, format!("node {name}"), |message| {
                    KubernetesError::UpdateFailed { message }
                })
            })?;
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, Report<KubernetesError>> {
        self.pods(namespace).get(name).await.map_err(|e| {
            map_kube_error(e, format!("pod {namespace}/{name}"), |message| {
                KubernetesError::GetFailed { message }
            })
        })
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, Report<KubernetesError>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let pods = pods
            .list(&ListParams::default())
            .await
            .change_context(KubernetesError::ListFailed {
                message: "pods".to_string(),
            })?;
        Ok(pods.items)
    }

    async fn patch_pod_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: &AnnotationPatch,
    ) -> Result<(), Report<KubernetesError>> {
        self.pods(namespace)
            .patch(
                name,
                &PatchParams::default(),
                &Patch::Merge(annotation_patch(annotations)),
            )
            .await
            .map_err(|e| {
                map_kube_error(e, format!("pod {namespace}/{name}"), |message| {
                    KubernetesError::UpdateFailed { message }
                })
            })?;
        Ok(())
    }

    async fn bind_pod(
        &self,
        namespace: &str,
        name: &str,
        node: &str,
    ) -> Result<(), Report<KubernetesError>> {
        let binding = Binding {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            target: ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("Node".to_string()),
                name: Some(node.to_string()),
                ..Default::default()
            },
        };
        let data = serde_json::to_vec(&binding).change_context(KubernetesError::BindFailed {
            message: format!("Failed to serialize binding for {namespace}/{name}"),
        })?;

        self.pods(namespace)
            .create_subresource::<serde_json::Value>(
                "binding",
                name,
                &PostParams::default(),
                data,
            )
            .await
            .map_err(|e| {
                map_kube_error(e, format!("pod {namespace}/{name} to {node}"), |message| {
                    KubernetesError::BindFailed { message }
                })
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_body_nulls_removed_keys() {
        let mut annotations = AnnotationPatch::new();
        annotations.insert("a".to_string(), Some("1".to_string()));
        annotations.insert("b".to_string(), None);

        let body = annotation_patch(&annotations);
        assert_eq!(body["metadata"]["annotations"]["a"], "1");
        assert!(body["metadata"]["annotations"]["b"].is_null());
    }
}
