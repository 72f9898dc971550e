//! Node inventory cache and the agent handshake.
//!
//! Every refresh walks the cluster's nodes and, per vendor, reads the
//! handshake annotation the node agent answers with `Reported <time>`:
//!
//! | handshake value           | action                                      |
//! |---------------------------|---------------------------------------------|
//! | `Deleted_<time>`          | vendor torn down, skip it                   |
//! | `Requesting_<t>`, stale   | agent stopped answering, clean up and drop  |
//! | `Requesting_<t>`, fresh   | decode inventory, keep waiting              |
//! | anything else             | decode inventory, write `Requesting_<now>`  |

use std::collections::BTreeMap;
use std::time::Duration;

use api_types::DeviceInfo;
use chrono::DateTime;
use chrono::Utc;
use dashmap::DashMap;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Node;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::SchedulerError;
use crate::device::Device;
use crate::device::DeviceRegistry;
use crate::k8s::AnnotationPatch;
use crate::k8s::KubeClient;
use crate::nodelock::NodeLock;

pub const HANDSHAKE_REQUESTING: &str = "Requesting_";
pub const HANDSHAKE_DELETED: &str = "Deleted_";
/// Prefix the node agent writes after each registration.
pub const HANDSHAKE_REPORTED: &str = "Reported";

/// Age after which an unanswered `Requesting_` handshake is abandoned.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Deleted,
    /// Unparseable times count as stale
    Requesting(Option<DateTime<Utc>>),
    Other,
}

impl Handshake {
    pub fn parse(value: Option<&str>) -> Self {
        let Some(value) = value else {
            return Self::Other;
        };
        if value.starts_with(HANDSHAKE_DELETED) {
            return Self::Deleted;
        }
        match value.strip_prefix(HANDSHAKE_REQUESTING) {
            Some(time) => Self::Requesting(
                DateTime::parse_from_rfc3339(time)
                    .ok()
                    .map(|t| t.with_timezone(&Utc)),
            ),
            None => Self::Other,
        }
    }

    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Requesting(Some(since)) => now
                .signed_duration_since(*since)
                .to_std()
                .is_ok_and(|age| age > HANDSHAKE_TIMEOUT),
            Self::Requesting(None) => true,
            _ => false,
        }
    }
}

/// Registered inventory of one node, per vendor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub devices: BTreeMap<String, Vec<DeviceInfo>>,
}

#[derive(Debug, Default)]
pub struct NodeManager {
    nodes: DashMap<String, NodeInfo>,
}

fn node_name(node: &Node) -> &str {
    node.metadata.name.as_deref().unwrap_or_default()
}

fn annotation<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
}

impl NodeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node_devices(&self, node: &str, device_type: &str, devices: Vec<DeviceInfo>) {
        let mut entry = self.nodes.entry(node.to_string()).or_insert_with(|| NodeInfo {
            name: node.to_string(),
            ..Default::default()
        });
        entry.devices.insert(device_type.to_string(), devices);
    }

    /// Forget one vendor's inventory; the node itself stays known.
    pub fn remove_node_devices(&self, node: &str, device_type: &str) {
        if let Some(mut entry) = self.nodes.get_mut(node) {
            if entry.devices.remove(device_type).is_some() {
                info!(node, device_type, "Removed node devices");
            }
        }
    }

    pub fn get_node(&self, name: &str) -> Option<NodeInfo> {
        self.nodes.get(name).map(|entry| entry.clone())
    }

    pub fn list_nodes(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self.nodes.iter().map(|entry| entry.clone()).collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    /// Re-read every node and drive the handshake for every vendor.
    ///
    /// Nodes gone from the cluster are dropped together with their
    /// in-process lock.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::Kubernetes`] if nodes cannot be listed
    #[tracing::instrument(skip_all)]
    pub async fn refresh(
        &self,
        client: &dyn KubeClient,
        registry: &DeviceRegistry,
        lock: &NodeLock,
    ) -> Result<(), Report<SchedulerError>> {
        let nodes = client
            .list_nodes()
            .await
            .change_context(SchedulerError::Kubernetes {
                message: "listing nodes".to_string(),
            })?;

        let now = Utc::now();
        for node in &nodes {
            for (device_type, vendor) in registry.iter() {
                self.refresh_vendor(client, node, device_type, vendor.as_ref(), now)
                    .await;
            }
        }

        let live: Vec<&str> = nodes.iter().map(node_name).collect();
        self.nodes.retain(|name, _| {
            let keep = live.contains(&name.as_str());
            if !keep {
                info!(node = %name, "Node left the cluster");
                lock.cleanup_node_lock(name);
            }
            keep
        });
        Ok(())
    }

    async fn refresh_vendor(
        &self,
        client: &dyn KubeClient,
        node: &Node,
        device_type: &str,
        vendor: &dyn Device,
        now: DateTime<Utc>,
    ) {
        let name = node_name(node);
        let handshake_key = vendor.annotation_keys().handshake;
        let handshake = Handshake::parse(annotation(node, handshake_key));

        let (healthy, needs_update) = vendor.check_health(node);
        if !healthy {
            warn!(node = name, device_type, "Devices no longer advertised");
            self.cleanup(client, name, device_type, vendor).await;
            return;
        }
        if needs_update {
            debug!(node = name, device_type, "Allocatable count changed");
        }

        match handshake {
            Handshake::Deleted => {
                self.remove_node_devices(name, device_type);
                return;
            }
            Handshake::Requesting(_) if handshake.is_stale(now) => {
                if self.nodes.get(name).is_some_and(|n| n.devices.contains_key(device_type)) {
                    info!(node = name, device_type, "Handshake timed out, removing devices");
                    self.cleanup(client, name, device_type, vendor).await;
                }
                return;
            }
            Handshake::Requesting(_) => {}
            Handshake::Other => {
                if annotation(node, vendor.annotation_keys().register).is_none() {
                    return;
                }
                let mut patch = AnnotationPatch::new();
                patch.insert(
                    handshake_key.to_string(),
                    Some(format!("{HANDSHAKE_REQUESTING}{}", now.to_rfc3339())),
                );
                if let Err(e) = client.patch_node_annotations(name, &patch).await {
                    warn!(node = name, device_type, "Failed to write handshake: {e:?}");
                }
            }
        }

        match vendor.get_node_devices(node) {
            Ok(devices) => {
                debug!(node = name, device_type, count = devices.len(), "Node devices registered");
                self.add_node_devices(name, device_type, devices);
            }
            Err(e) => {
                warn!(node = name, device_type, "Undecodable inventory, treating node as empty: {e:?}");
                self.remove_node_devices(name, device_type);
            }
        }
    }

    async fn cleanup(&self, client: &dyn KubeClient, node: &str, device_type: &str, vendor: &dyn Device) {
        self.remove_node_devices(node, device_type);
        if let Err(e) = client.patch_node_annotations(node, &vendor.node_cleanup()).await {
            warn!(node, device_type, "Failed to clean up handshake: {e:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration as ChronoDuration;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::codec::encode_node_devices;
    use crate::config::DeviceConfig;
    use crate::k8s::MockKubeClient;
    use crate::nodelock::NodeLockConfig;

    const REGISTER: &str = "hami.io/node-nvidia-register";
    const HANDSHAKE: &str = "hami.io/node-handshake";

    fn inventory() -> String {
        encode_node_devices(&[DeviceInfo {
            id: "GPU-0".to_string(),
            count: 10,
            devmem: 8192,
            devcore: 100,
            device_type: "NVIDIA-A100".to_string(),
            health: true,
            ..Default::default()
        }])
    }

    fn setup(handshake: Option<String>) -> (Arc<MockKubeClient>, DeviceRegistry, NodeLock) {
        let client = Arc::new(MockKubeClient::new());
        let mut annotations = BTreeMap::new();
        annotations.insert(REGISTER.to_string(), inventory());
        if let Some(handshake) = handshake {
            annotations.insert(HANDSHAKE.to_string(), handshake);
        }
        client.add_node("node-a", annotations);
        let registry = DeviceRegistry::new(&DeviceConfig::default());
        let lock = NodeLock::new(client.clone(), NodeLockConfig::default());
        (client, registry, lock)
    }

    #[test]
    fn parses_handshake_states() {
        assert_eq!(Handshake::parse(None), Handshake::Other);
        assert_eq!(
            Handshake::parse(Some("Reported 2024-01-01T00:00:00Z")),
            Handshake::Other
        );
        assert_eq!(
            Handshake::parse(Some("Deleted_2024-01-01T00:00:00Z")),
            Handshake::Deleted
        );
        assert_eq!(Handshake::parse(Some("Requesting_garbage")), Handshake::Requesting(None));
        assert!(Handshake::parse(Some("Requesting_garbage")).is_stale(Utc::now()));
    }

    #[tokio::test]
    async fn reported_node_is_registered_and_requested() {
        let (client, registry, lock) = setup(Some("Reported 2024-01-01T00:00:00Z".to_string()));
        let manager = NodeManager::new();
        manager.refresh(client.as_ref(), &registry, &lock).await.unwrap();

        let node = manager.get_node("node-a").unwrap();
        assert_eq!(node.devices["NVIDIA"].len(), 1);
        assert!(client
            .node_annotation("node-a", HANDSHAKE)
            .unwrap()
            .starts_with(HANDSHAKE_REQUESTING));
    }

    #[tokio::test]
    async fn fresh_request_keeps_inventory() {
        let now = Utc::now().to_rfc3339();
        let (client, registry, lock) = setup(Some(format!("{HANDSHAKE_REQUESTING}{now}")));
        let manager = NodeManager::new();
        manager.refresh(client.as_ref(), &registry, &lock).await.unwrap();
        assert_eq!(manager.get_node("node-a").unwrap().devices["NVIDIA"].len(), 1);
        assert_eq!(client.node_patch_calls(), 0);
    }

    #[tokio::test]
    async fn stale_request_cleans_up() {
        let (client, registry, lock) = setup(None);
        let manager = NodeManager::new();
        manager.refresh(client.as_ref(), &registry, &lock).await.unwrap();
        assert!(manager.get_node("node-a").unwrap().devices.contains_key("NVIDIA"));

        let stale = Utc::now() - ChronoDuration::seconds(120);
        let mut patch = AnnotationPatch::new();
        patch.insert(
            HANDSHAKE.to_string(),
            Some(format!("{HANDSHAKE_REQUESTING}{}", stale.to_rfc3339())),
        );
        client.patch_node_annotations("node-a", &patch).await.unwrap();

        manager.refresh(client.as_ref(), &registry, &lock).await.unwrap();
        assert!(!manager.get_node("node-a").unwrap().devices.contains_key("NVIDIA"));
        assert!(client
            .node_annotation("node-a", HANDSHAKE)
            .unwrap()
            .starts_with(HANDSHAKE_DELETED));

        // stays torn down until the agent reports again
        manager.refresh(client.as_ref(), &registry, &lock).await.unwrap();
        assert!(!manager.get_node("node-a").unwrap().devices.contains_key("NVIDIA"));
    }

    #[tokio::test]
    async fn malformed_inventory_leaves_node_empty() {
        let (client, registry, lock) = setup(None);
        let mut patch = AnnotationPatch::new();
        patch.insert(REGISTER.to_string(), Some("GPU-0,ten,8192".to_string()));
        client.patch_node_annotations("node-a", &patch).await.unwrap();

        let manager = NodeManager::new();
        manager.refresh(client.as_ref(), &registry, &lock).await.unwrap();
        let devices = manager
            .get_node("node-a")
            .map(|node| node.devices)
            .unwrap_or_default();
        assert!(!devices.contains_key("NVIDIA"));
    }

    #[tokio::test]
    async fn removed_nodes_are_forgotten() {
        let (client, registry, lock) = setup(None);
        let manager = NodeManager::new();
        manager.add_node_devices("ghost", "NVIDIA", Vec::new());
        manager.refresh(client.as_ref(), &registry, &lock).await.unwrap();
        assert!(manager.get_node("ghost").is_none());
        assert_eq!(
            manager.list_nodes().iter().map(|n| n.name.as_str()).collect::<Vec<_>>(),
            vec!["node-a"]
        );
    }
}
