//! Cluster-side scheduling.
//!
//! [`Scheduler`] keeps the node and pod caches fresh, scores candidate nodes
//! for pods that ask for devices, records the decision on the pod and binds
//! it under the node lock.

pub mod nodes;
pub mod pods;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use api_types::BindPhase;
use chrono::Utc;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

pub use nodes::NodeInfo;
pub use nodes::NodeManager;
pub use pods::PodInfo;
pub use pods::PodManager;

use crate::device::DeviceRegistry;
use crate::k8s::annotations::is_pod_terminated;
use crate::k8s::annotations::pod_annotations;
use crate::k8s::annotations::pod_name;
use crate::k8s::annotations::pod_namespace;
use crate::k8s::annotations::ASSIGNED_NODE_ANNOTATION;
use crate::k8s::annotations::ASSIGNED_TIME_ANNOTATION;
use crate::k8s::annotations::BIND_PHASE_ANNOTATION;
use crate::k8s::annotations::BIND_TIME_ANNOTATION;
use crate::k8s::AnnotationPatch;
use crate::k8s::KubeClient;
use crate::logging::AUDIT_TARGET;
use crate::nodelock::NodeLock;
use crate::nodelock::NodeLockConfig;
use crate::nodelock::NodeLockError;
use crate::score::calc_score;
use crate::score::select_node;
use crate::score::NodeScore;
use crate::score::ScorePolicies;
use crate::usage::NodeUsage;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("kubernetes API error: {message}")]
    Kubernetes { message: String },
    #[error("failed to lock node {node} for pod {pod}")]
    Lock { node: String, pod: String },
    #[error("failed to bind pod {pod} to node {node}")]
    Bind { node: String, pod: String },
    #[error("pod {pod} has no assigned node")]
    NotAssigned { pod: String },
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Pods naming another scheduler are left alone
    pub scheduler_name: String,
    pub policies: ScorePolicies,
    pub resync_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduler_name: "hami-scheduler".to_string(),
            policies: ScorePolicies::default(),
            resync_interval: Duration::from_secs(15),
        }
    }
}

/// Outcome of [`Scheduler::filter`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterResult {
    /// Chosen node, `None` if no candidate fits
    pub node: Option<String>,
    /// Rejection reason per candidate
    pub failed: BTreeMap<String, String>,
}

pub struct Scheduler {
    client: Arc<dyn KubeClient>,
    registry: Arc<DeviceRegistry>,
    lock: NodeLock,
    nodes: NodeManager,
    pods: PodManager,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        client: Arc<dyn KubeClient>,
        registry: Arc<DeviceRegistry>,
        config: SchedulerConfig,
        lock_config: NodeLockConfig,
    ) -> Self {
        Self {
            lock: NodeLock::new(client.clone(), lock_config),
            client,
            registry,
            nodes: NodeManager::new(),
            pods: PodManager::new(),
            config,
        }
    }

    pub fn nodes(&self) -> &NodeManager {
        &self.nodes
    }

    pub fn pods(&self) -> &PodManager {
        &self.pods
    }

    /// Re-read nodes and pods from the cluster.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::Kubernetes`] if listing fails
    pub async fn refresh(&self) -> Result<(), Report<SchedulerError>> {
        self.nodes
            .refresh(self.client.as_ref(), &self.registry, &self.lock)
            .await?;
        self.pods.refresh(self.client.as_ref(), &self.registry).await
    }

    /// Usage of every node in `node_names`, excluding the grants of `exclude`.
    ///
    /// Unknown nodes come back with no devices.
    pub fn get_nodes_usage(&self, node_names: &[String], exclude: &Pod) -> Vec<NodeUsage> {
        let excluded = pods::pod_key(exclude);
        node_names
            .iter()
            .map(|name| {
                let inventory = self
                    .nodes
                    .get_node(name)
                    .map(|node| node.devices)
                    .unwrap_or_default();
                let mut usage = NodeUsage::from_inventory(name, &inventory);
                for pod in self.pods.pods_on(name) {
                    if pod.key() == excluded {
                        continue;
                    }
                    if let Err(e) = usage.add_pod_devices(&self.registry, &pod.devices) {
                        warn!(node = %name, pod = %pod.key(), "Failed to charge pod usage: {e:?}");
                    }
                }
                usage
            })
            .collect()
    }

    /// Pick a node among `candidates` and record the device decision on `pod`.
    ///
    /// All candidates are scored on a lock-free snapshot. The chosen node is
    /// then re-fitted and recorded while its in-process mutex is held; if it
    /// no longer fits, the next best node is tried.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::Kubernetes`] if the decision cannot be written to the pod
    #[tracing::instrument(skip(self, pod, candidates), fields(pod = %pods::pod_key(pod)))]
    pub async fn filter(
        &self,
        pod: &Pod,
        candidates: &[String],
    ) -> Result<FilterResult, Report<SchedulerError>> {
        let requests = self.registry.resource_requests(pod);
        if requests.iter().all(|container| container.is_empty()) {
            debug!("Pod requests no devices");
            return Ok(FilterResult::default());
        }

        self.pods.del_pod(pod);
        let usage = self.get_nodes_usage(candidates, pod);
        let mut scored = calc_score(&self.registry, &usage, &requests, pod, self.config.policies);

        loop {
            let Some(choice) =
                select_node(&scored.scores, self.config.policies.node).map(|s| s.node.clone())
            else {
                info!(
                    target: AUDIT_TARGET,
                    pod = %pods::pod_key(pod),
                    failed = ?scored.failed,
                    "No node fits"
                );
                return Ok(FilterResult {
                    node: None,
                    failed: scored.failed,
                });
            };
            scored.scores.retain(|score| score.node != choice);

            // The usage above is advisory. Fit and record under the node's mutex
            // so concurrent filters cannot hand out the same slot.
            let _guard = self.lock.local_guard(&choice).await;
            let fresh = self.get_nodes_usage(std::slice::from_ref(&choice), pod);
            let refit = calc_score(&self.registry, &fresh, &requests, pod, self.config.policies);
            let Some(winner) = refit.scores.into_iter().next() else {
                debug!(node = %choice, "Node filled up while scoring, trying the next one");
                scored.failed.extend(refit.failed);
                continue;
            };

            self.record_decision(pod, &winner).await?;
            return Ok(FilterResult {
                node: Some(winner.node),
                failed: scored.failed,
            });
        }
    }

    /// Write the chosen node and devices onto `pod` and start tracking its grants.
    async fn record_decision(
        &self,
        pod: &Pod,
        winner: &NodeScore,
    ) -> Result<(), Report<SchedulerError>> {
        let mut annotations = BTreeMap::new();
        annotations.insert(ASSIGNED_NODE_ANNOTATION.to_string(), winner.node.clone());
        annotations.insert(
            ASSIGNED_TIME_ANNOTATION.to_string(),
            Utc::now().timestamp().to_string(),
        );
        annotations.insert(
            BIND_PHASE_ANNOTATION.to_string(),
            BindPhase::Allocating.to_string(),
        );
        self.registry.patch_annotations(&winner.devices, &mut annotations);
        let patch: AnnotationPatch = annotations.into_iter().map(|(k, v)| (k, Some(v))).collect();

        self.client
            .patch_pod_annotations(pod_namespace(pod), pod_name(pod), &patch)
            .await
            .change_context_lazy(|| SchedulerError::Kubernetes {
                message: format!("recording decision on pod {}", pods::pod_key(pod)),
            })?;
        self.pods.add_pod(pod, &winner.node, winner.devices.clone());

        info!(
            target: AUDIT_TARGET,
            pod = %pods::pod_key(pod),
            node = %winner.node,
            score = winner.score,
            devices = ?winner.devices,
            "Node selected"
        );
        Ok(())
    }

    /// Bind a filtered pod to `node` under the node lock.
    ///
    /// The lock stays held until [`Self::pod_allocation_success`] or
    /// [`Self::pod_allocation_failed`], or until it expires.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::Kubernetes`] if the pod cannot be read
    /// - [`SchedulerError::Lock`] if the node is locked by another live pod or the lock fails
    /// - [`SchedulerError::Bind`] if the binding is rejected; the lock is released
    #[tracing::instrument(skip(self))]
    pub async fn bind(
        &self,
        namespace: &str,
        name: &str,
        node: &str,
    ) -> Result<(), Report<SchedulerError>> {
        let pod = self
            .client
            .get_pod(namespace, name)
            .await
            .change_context_lazy(|| SchedulerError::Kubernetes {
                message: format!("reading pod {namespace}/{name}"),
            })?;
        let pod_ref = format!("{namespace}/{name}");

        let requests_devices = self
            .registry
            .resource_requests(&pod)
            .iter()
            .any(|requests| !requests.is_empty());
        if requests_devices {
            self.lock
                .lock_node(node, &pod)
                .await
                .change_context_lazy(|| SchedulerError::Lock {
                    node: node.to_string(),
                    pod: pod_ref.clone(),
                })?;
        }

        if let Err(e) = self.client.bind_pod(namespace, name, node).await {
            error!(pod = %pod_ref, node, "Bind failed: {e:?}");
            if let Err(release) = self.lock.release_node_lock(node, &pod, false).await {
                warn!(node, "Failed to release node lock after bind failure: {release:?}");
            }
            self.set_bind_phase(namespace, name, BindPhase::Failed).await?;
            return Err(e.change_context(SchedulerError::Bind {
                node: node.to_string(),
                pod: pod_ref,
            }));
        }

        info!(target: AUDIT_TARGET, pod = %pod_ref, node, "Pod bound");
        Ok(())
    }

    /// The node agent finished allocating `pod`'s devices.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::NotAssigned`] if the pod carries no node assignment
    /// - [`SchedulerError::Kubernetes`] if the bind phase cannot be written
    /// - [`SchedulerError::Lock`] if the node lock cannot be released
    pub async fn pod_allocation_success(&self, pod: &Pod) -> Result<(), Report<SchedulerError>> {
        self.finish_allocation(pod, BindPhase::Success).await
    }

    /// The node agent gave up allocating `pod`'s devices.
    ///
    /// # Errors
    ///
    /// Same as [`Self::pod_allocation_success`].
    pub async fn pod_allocation_failed(&self, pod: &Pod) -> Result<(), Report<SchedulerError>> {
        self.finish_allocation(pod, BindPhase::Failed).await
    }

    async fn finish_allocation(
        &self,
        pod: &Pod,
        phase: BindPhase,
    ) -> Result<(), Report<SchedulerError>> {
        let node = pod_annotations(pod)
            .get(ASSIGNED_NODE_ANNOTATION)
            .cloned()
            .ok_or_else(|| {
                Report::new(SchedulerError::NotAssigned {
                    pod: pods::pod_key(pod),
                })
            })?;

        self.set_bind_phase(pod_namespace(pod), pod_name(pod), phase)
            .await?;
        self.lock
            .release_node_lock(&node, pod, false)
            .await
            .change_context_lazy(|| SchedulerError::Lock {
                node: node.clone(),
                pod: pods::pod_key(pod),
            })?;

        info!(target: AUDIT_TARGET, pod = %pods::pod_key(pod), node = %node, phase = %phase, "Allocation finished");
        Ok(())
    }

    async fn set_bind_phase(
        &self,
        namespace: &str,
        name: &str,
        phase: BindPhase,
    ) -> Result<(), Report<SchedulerError>> {
        let mut patch = AnnotationPatch::new();
        patch.insert(BIND_PHASE_ANNOTATION.to_string(), Some(phase.to_string()));
        if phase == BindPhase::Success {
            patch.insert(
                BIND_TIME_ANNOTATION.to_string(),
                Some(Utc::now().timestamp().to_string()),
            );
        }
        self.client
            .patch_pod_annotations(namespace, name, &patch)
            .await
            .change_context_lazy(|| SchedulerError::Kubernetes {
                message: format!("setting bind phase of {namespace}/{name}"),
            })
    }

    fn is_schedulable(&self, pod: &Pod) -> bool {
        let Some(spec) = pod.spec.as_ref() else {
            return false;
        };
        spec.scheduler_name.as_deref() == Some(self.config.scheduler_name.as_str())
            && spec.node_name.is_none()
            && !pod_annotations(pod).contains_key(ASSIGNED_NODE_ANNOTATION)
            && !is_pod_terminated(pod)
    }

    /// Filter and bind every pending pod addressed to this scheduler.
    ///
    /// Returns how many pods were bound.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::Kubernetes`] if pods cannot be listed
    pub async fn schedule_pending(&self) -> Result<usize, Report<SchedulerError>> {
        let pending: Vec<Pod> = self
            .client
            .list_pods()
            .await
            .change_context(SchedulerError::Kubernetes {
                message: "listing pods".to_string(),
            })?
            .into_iter()
            .filter(|pod| self.is_schedulable(pod))
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }

        let candidates: Vec<String> = self.nodes.list_nodes().into_iter().map(|n| n.name).collect();
        let mut bound = 0;
        for pod in &pending {
            let result = match self.filter(pod, &candidates).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(pod = %pods::pod_key(pod), "Filter failed: {e:?}");
                    continue;
                }
            };
            let Some(node) = result.node else {
                debug!(pod = %pods::pod_key(pod), "Pod left pending");
                continue;
            };
            match self.bind(pod_namespace(pod), pod_name(pod), &node).await {
                Ok(()) => bound += 1,
                Err(e) if is_contention(&e) => {
                    info!(pod = %pods::pod_key(pod), node = %node, "Node busy, retrying next resync");
                }
                Err(e) => warn!(pod = %pods::pod_key(pod), node = %node, "Bind failed: {e:?}"),
            }
        }
        Ok(bound)
    }

    /// Resync and schedule every `resync_interval` until cancelled.
    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!(
            scheduler_name = %self.config.scheduler_name,
            interval = ?self.config.resync_interval,
            "Scheduler started"
        );
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Scheduler shutdown requested");
                    break;
                }
                _ = async {
                    if let Err(e) = self.refresh().await {
                        warn!("Resync failed: {e:?}");
                    } else {
                        match self.schedule_pending().await {
                            Ok(0) => {}
                            Ok(bound) => info!(bound, "Scheduled pending pods"),
                            Err(e) => warn!("Scheduling pass failed: {e:?}"),
                        }
                    }
                    tokio::time::sleep(self.config.resync_interval).await;
                } => {}
            }
        }
    }
}

fn is_contention(report: &Report<SchedulerError>) -> bool {
    report
        .downcast_ref::<NodeLockError>()
        .is_some_and(NodeLockError::is_contention)
}
