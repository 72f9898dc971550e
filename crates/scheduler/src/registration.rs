//! Node-side inventory registration.
//!
//! The [`Registrar`] publishes this node's devices into the vendor's register
//! annotation and answers the scheduler's handshake with `Reported <time>`.
//! Health transitions received from the [`HealthBroker`] override the
//! inventory's health flags and trigger an immediate re-registration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use api_types::DeviceInfo;
use chrono::Utc;
use error_stack::Report;
use error_stack::ResultExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::codec::encode_node_devices;
use crate::device::Device;
use crate::health::HealthBroker;
use crate::health::HealthEvent;
use crate::k8s::AnnotationPatch;
use crate::k8s::KubeClient;
use crate::scheduler::nodes::HANDSHAKE_REPORTED;

/// Pause before retrying a failed registration.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("failed to read device inventory: {message}")]
    Inventory { message: String },
    #[error("failed to publish devices of node {node}")]
    Publish { node: String },
}

/// Source of this node's devices.
#[async_trait::async_trait]
pub trait DeviceInventory: Send + Sync {
    async fn get_node_devices(&self) -> Result<Vec<DeviceInfo>, Report<RegistrationError>>;
}

/// Static device list read from a YAML file on every call.
#[derive(Debug, Clone)]
pub struct YamlInventory {
    path: PathBuf,
}

impl YamlInventory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl DeviceInventory for YamlInventory {
    async fn get_node_devices(&self) -> Result<Vec<DeviceInfo>, Report<RegistrationError>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .change_context_lazy(|| RegistrationError::Inventory {
                message: format!("reading {}", self.path.display()),
            })?;
        serde_yaml::from_str(&content).change_context_lazy(|| RegistrationError::Inventory {
            message: format!("parsing {}", self.path.display()),
        })
    }
}

pub struct Registrar {
    client: Arc<dyn KubeClient>,
    node_name: String,
    vendor: Arc<dyn Device>,
    inventory: Arc<dyn DeviceInventory>,
    broker: Arc<HealthBroker>,
    interval: Duration,
    retry_delay: Duration,
}

impl Registrar {
    pub fn new(
        client: Arc<dyn KubeClient>,
        node_name: impl Into<String>,
        vendor: Arc<dyn Device>,
        inventory: Arc<dyn DeviceInventory>,
        broker: Arc<HealthBroker>,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            node_name: node_name.into(),
            vendor,
            inventory,
            broker,
            interval,
            retry_delay: RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    fn subscriber_name(&self) -> String {
        format!("registrar/{}/{}", self.node_name, self.vendor.device_type())
    }

    /// Publish the current inventory once, with health overrides applied.
    ///
    /// Returns the number of devices published.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::Inventory`] if the inventory cannot be read
    /// - [`RegistrationError::Publish`] if the node cannot be patched
    pub async fn register_once(
        &self,
        health_overrides: &BTreeMap<String, bool>,
    ) -> Result<usize, Report<RegistrationError>> {
        let mut devices = self.inventory.get_node_devices().await?;
        for device in &mut devices {
            if let Some(healthy) = health_overrides.get(&device.id) {
                device.health = *healthy;
            }
        }

        let keys = self.vendor.annotation_keys();
        let mut patch = AnnotationPatch::new();
        patch.insert(keys.register.to_string(), Some(encode_node_devices(&devices)));
        patch.insert(
            keys.handshake.to_string(),
            Some(format!("{HANDSHAKE_REPORTED} {}", Utc::now().to_rfc3339())),
        );
        self.client
            .patch_node_annotations(&self.node_name, &patch)
            .await
            .change_context_lazy(|| RegistrationError::Publish {
                node: self.node_name.clone(),
            })?;
        Ok(devices.len())
    }

    /// Register every interval until cancelled, retrying failures after a short pause.
    #[tracing::instrument(skip_all, fields(node = %self.node_name, device_type = self.vendor.device_type()))]
    pub async fn run(&self, cancellation_token: CancellationToken) {
        let subscriber = self.subscriber_name();
        let mut events = Some(self.broker.subscribe(&subscriber).await);
        let mut health_overrides = BTreeMap::new();

        loop {
            let delay = match self.register_once(&health_overrides).await {
                Ok(count) => {
                    info!(count, "Registered node devices");
                    self.interval
                }
                Err(e) => {
                    warn!("Registration failed, retrying: {e:?}");
                    self.retry_delay
                }
            };

            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Registrar shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
                event = next_event(&mut events) => match event {
                    Some(event) if event.node == self.node_name => {
                        debug!(device = %event.device_id, healthy = event.healthy, "Applying health change");
                        health_overrides.insert(event.device_id, event.healthy);
                    }
                    Some(_) => {}
                    None => events = None,
                },
            }
        }
        self.broker.unsubscribe(&subscriber).await;
    }
}

/// Poll `inventory` and emit a [`HealthEvent`] whenever a device's health flag flips.
///
/// The first poll establishes the baseline and emits nothing.
pub async fn watch_inventory_health(
    inventory: Arc<dyn DeviceInventory>,
    node_name: String,
    interval: Duration,
    events: mpsc::Sender<HealthEvent>,
    cancellation_token: CancellationToken,
) {
    let mut known: BTreeMap<String, bool> = BTreeMap::new();
    let mut baseline = true;
    loop {
        match inventory.get_node_devices().await {
            Ok(devices) => {
                for device in devices {
                    let previous = known.insert(device.id.clone(), device.health);
                    if baseline || previous == Some(device.health) {
                        continue;
                    }
                    let event = HealthEvent {
                        node: node_name.clone(),
                        device_id: device.id,
                        healthy: device.health,
                    };
                    if events.send(event).await.is_err() {
                        debug!("Health receiver closed");
                        return;
                    }
                }
                baseline = false;
            }
            Err(e) => warn!("Health poll failed: {e:?}"),
        }

        tokio::select! {
            _ = cancellation_token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<HealthEvent>>) -> Option<HealthEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use similar_asserts::assert_eq;
    use tempfile::NamedTempFile;

    use super::*;
    use crate::codec::decode_node_devices;
    use crate::device::nvidia::NvidiaDevices;
    use crate::k8s::MockKubeClient;

    const REGISTER: &str = "hami.io/node-nvidia-register";
    const HANDSHAKE: &str = "hami.io/node-handshake";

    struct FixedInventory {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl DeviceInventory for FixedInventory {
        async fn get_node_devices(&self) -> Result<Vec<DeviceInfo>, Report<RegistrationError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![DeviceInfo {
                id: "GPU-0".to_string(),
                count: 10,
                devmem: 8192,
                devcore: 100,
                device_type: "NVIDIA-A100".to_string(),
                health: true,
                ..Default::default()
            }])
        }
    }

    fn registrar(client: Arc<MockKubeClient>, broker: Arc<HealthBroker>) -> (Registrar, Arc<FixedInventory>) {
        let inventory = Arc::new(FixedInventory {
            calls: AtomicUsize::new(0),
        });
        let registrar = Registrar::new(
            client,
            "node-a",
            Arc::new(NvidiaDevices::default()),
            inventory.clone(),
            broker,
            Duration::from_secs(30),
        )
        .with_retry_delay(Duration::from_millis(10));
        (registrar, inventory)
    }

    #[tokio::test]
    async fn register_once_publishes_and_reports() {
        let client = Arc::new(MockKubeClient::new());
        client.add_node("node-a", BTreeMap::new());
        let (registrar, _) = registrar(client.clone(), Arc::new(HealthBroker::new()));

        let mut overrides = BTreeMap::new();
        overrides.insert("GPU-0".to_string(), false);
        assert_eq!(registrar.register_once(&overrides).await.unwrap(), 1);

        let published = decode_node_devices(&client.node_annotation("node-a", REGISTER).unwrap()).unwrap();
        assert!(!published[0].health);
        assert!(client
            .node_annotation("node-a", HANDSHAKE)
            .unwrap()
            .starts_with(HANDSHAKE_REPORTED));
    }

    #[tokio::test]
    async fn missing_node_is_a_publish_error() {
        let client = Arc::new(MockKubeClient::new());
        let (registrar, _) = registrar(client, Arc::new(HealthBroker::new()));
        let err = registrar.register_once(&BTreeMap::new()).await.unwrap_err();
        assert!(matches!(
            err.current_context(),
            RegistrationError::Publish { .. }
        ));
    }

    #[test_log::test(tokio::test)]
    async fn run_retries_and_reacts_to_health() {
        let client = Arc::new(MockKubeClient::new());
        client.add_node("node-a", BTreeMap::new());
        client.fail_next_node_patches(1);
        let broker = Arc::new(HealthBroker::new());
        let (registrar, inventory) = registrar(client.clone(), broker.clone());
        let registrar = Arc::new(registrar);
        let token = CancellationToken::new();

        let handle = tokio::spawn({
            let registrar = registrar.clone();
            let token = token.clone();
            async move { registrar.run(token).await }
        });

        // first attempt fails, the retry succeeds well before the interval
        tokio::time::timeout(Duration::from_secs(2), async {
            while client.node_annotation("node-a", REGISTER).is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        while broker.subscriber_count().await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        broker
            .publish(HealthEvent {
                node: "node-a".to_string(),
                device_id: "GPU-0".to_string(),
                healthy: false,
            })
            .await;

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let published = client
                    .node_annotation("node-a", REGISTER)
                    .and_then(|value| decode_node_devices(&value).ok())
                    .unwrap_or_default();
                if published.first().is_some_and(|d| !d.health) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(inventory.calls.load(Ordering::SeqCst) >= 3);

        token.cancel();
        handle.await.unwrap();
        assert_eq!(broker.subscriber_count().await, 0);
    }

    struct FlippingInventory {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl DeviceInventory for FlippingInventory {
        async fn get_node_devices(&self) -> Result<Vec<DeviceInfo>, Report<RegistrationError>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![DeviceInfo {
                id: "GPU-0".to_string(),
                health: call == 0,
                ..Default::default()
            }])
        }
    }

    #[tokio::test]
    async fn health_watch_reports_transitions_only() {
        let inventory = Arc::new(FlippingInventory {
            calls: AtomicUsize::new(0),
        });
        let (tx, mut rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let handle = tokio::spawn(watch_inventory_health(
            inventory,
            "node-a".to_string(),
            Duration::from_millis(5),
            tx,
            token.clone(),
        ));

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            HealthEvent {
                node: "node-a".to_string(),
                device_id: "GPU-0".to_string(),
                healthy: false,
            }
        );
        // stays unhealthy, so nothing more is sent
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .is_err());

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn yaml_inventory_reads_device_list() {
        let yaml = r#"
- id: GPU-0
  index: 0
  count: 10
  devmem: 8192
  devcore: 100
  type: NVIDIA-A100
  numa: 1
  health: true
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let devices = YamlInventory::new(file.path()).get_node_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].numa, 1);
        assert_eq!(devices[0].device_type, "NVIDIA-A100");
    }

    #[tokio::test]
    async fn yaml_inventory_missing_file() {
        let err = YamlInventory::new("/nonexistent/devices.yaml")
            .get_node_devices()
            .await
            .unwrap_err();
        assert!(matches!(
            err.current_context(),
            RegistrationError::Inventory { .. }
        ));
    }
}
