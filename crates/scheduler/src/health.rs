//! Device health fan-out.
//!
//! A health source produces [`HealthEvent`]s on one channel; the broker
//! copies every event to each named subscriber. Subscribers whose receiver
//! was dropped are pruned on the next publish.

use std::collections::BTreeMap;

use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

/// Buffer of each subscriber channel.
const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    pub node: String,
    pub device_id: String,
    pub healthy: bool,
}

#[derive(Debug, Default)]
pub struct HealthBroker {
    subscribers: RwLock<BTreeMap<String, mpsc::Sender<HealthEvent>>>,
}

impl HealthBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`, replacing any previous subscription under that name.
    pub async fn subscribe(&self, name: &str) -> mpsc::Receiver<HealthEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.write().await.insert(name.to_string(), tx);
        debug!(subscriber = name, "Health subscriber added");
        rx
    }

    pub async fn unsubscribe(&self, name: &str) {
        if self.subscribers.write().await.remove(name).is_some() {
            debug!(subscriber = name, "Health subscriber removed");
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Deliver `event` to every subscriber.
    ///
    /// Returns the number of subscribers reached.
    pub async fn publish(&self, event: HealthEvent) -> usize {
        // Clone sender list while holding read lock
        let senders: Vec<(String, mpsc::Sender<HealthEvent>)> = self
            .subscribers
            .read()
            .await
            .iter()
            .map(|(name, tx)| (name.clone(), tx.clone()))
            .collect();

        let mut closed = Vec::new();
        let mut delivered = 0;
        for (name, tx) in senders {
            match tx.send(event.clone()).await {
                Ok(()) => delivered += 1,
                Err(_) => {
                    debug!(subscriber = %name, "Subscriber disconnected, cleaning up channel");
                    closed.push(name);
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for name in closed {
                if subscribers.get(&name).is_some_and(mpsc::Sender::is_closed) {
                    subscribers.remove(&name);
                }
            }
        }
        delivered
    }

    /// Fan `source` out to the subscribers until it closes or `cancellation_token` fires.
    pub async fn run(
        &self,
        mut source: mpsc::Receiver<HealthEvent>,
        cancellation_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Health broker shutdown requested");
                    break;
                }
                event = source.recv() => {
                    let Some(event) = event else {
                        info!("Health source closed");
                        break;
                    };
                    info!(
                        node = %event.node,
                        device = %event.device_id,
                        healthy = event.healthy,
                        "Device health changed"
                    );
                    self.publish(event).await;
                }
            }
        }
    }
}
