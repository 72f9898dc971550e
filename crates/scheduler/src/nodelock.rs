//! Per-node allocation lock.
//!
//! Two layers serialize allocation decisions on a node:
//! - an in-process mutex per node name, held for the whole read-modify-write
//!   of the lock annotation;
//! - the `hami.io/mutex.lock` node annotation, an advisory lock shared with
//!   every other process. Its value is `<RFC3339 time>,<namespace>,<pod>`.
//!
//! The annotation is written with get-then-patch and bounded retries, not with
//! a compare-and-swap. Two processes can still both observe an unlocked node
//! and both write; callers treat the lock as best-effort serialization.

use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::k8s::annotations::pod_name;
use crate::k8s::annotations::pod_namespace;
use crate::k8s::annotations::NODE_LOCK_ANNOTATION;
use crate::k8s::AnnotationPatch;
use crate::k8s::KubeClient;
use crate::util::keyed_lock::KeyedAsyncLock;

const LOCK_VALUE_SEPARATOR: char = ',';

/// Default lifetime of a lock annotation before it is reclaimed.
pub const DEFAULT_LOCK_EXPIRE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum NodeLockError {
    #[error("node {node} has been locked within TTL")]
    Locked { node: String },
    #[error("malformed lock on node {node}: {message}")]
    Malformed { node: String, message: String },
    #[error("kubernetes API error while handling lock on node {node}")]
    Api { node: String },
}

impl NodeLockError {
    /// Contention is expected control flow, unlike API failures.
    pub const fn is_contention(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }
}

/// Timing knobs of the annotation lock.
#[derive(Debug, Clone, Copy)]
pub struct NodeLockConfig {
    /// Age after which a lock is considered abandoned
    pub expire: Duration,
    /// Attempts for each annotation write
    pub retries: usize,
    /// Pause between attempts
    pub backoff: Duration,
}

impl Default for NodeLockConfig {
    fn default() -> Self {
        Self {
            expire: DEFAULT_LOCK_EXPIRE,
            retries: 5,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Parsed lock annotation value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLockRecord {
    pub locked_at: DateTime<Utc>,
    /// Owning pod as `(namespace, name)`; absent in bare-timestamp values
    pub owner: Option<(String, String)>,
}

impl NodeLockRecord {
    pub fn new(locked_at: DateTime<Utc>, namespace: &str, name: &str) -> Self {
        Self {
            locked_at,
            owner: Some((namespace.to_string(), name.to_string())),
        }
    }

    pub fn encode(&self) -> String {
        let time = self.locked_at.to_rfc3339_opts(SecondsFormat::Secs, true);
        match &self.owner {
            Some((namespace, name)) => format!("{time},{namespace},{name}"),
            None => time,
        }
    }

    /// Parses `time` or `time,namespace,name`.
    pub fn parse(value: &str) -> Result<Self, String> {
        let parts: Vec<&str> = value.split(LOCK_VALUE_SEPARATOR).collect();
        let parse_time = |time: &str| {
            DateTime::parse_from_rfc3339(time)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| format!("invalid lock time `{time}`: {e}"))
        };
        match parts.as_slice() {
            [time] => Ok(Self {
                locked_at: parse_time(time)?,
                owner: None,
            }),
            [time, namespace, name] => Ok(Self::new(parse_time(time)?, namespace, name)),
            _ => Err(format!(
                "expected 1 or 3 comma separated fields, found {}",
                parts.len()
            )),
        }
    }

    fn is_owned_by(&self, namespace: &str, name: &str) -> bool {
        matches!(&self.owner, Some((ns, n)) if ns == namespace && n == name)
    }
}

fn lock_annotation(node: &Node) -> Option<&String> {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(NODE_LOCK_ANNOTATION))
}

/// Node lock manager shared by every allocation path of a process.
pub struct NodeLock {
    client: Arc<dyn KubeClient>,
    local: KeyedAsyncLock<String>,
    config: NodeLockConfig,
}

impl NodeLock {
    pub fn new(client: Arc<dyn KubeClient>, config: NodeLockConfig) -> Self {
        Self {
            client,
            local: KeyedAsyncLock::new(),
            config,
        }
    }

    pub fn config(&self) -> &NodeLockConfig {
        &self.config
    }

    /// Acquire the lock on `node_name` on behalf of `pod`.
    ///
    /// An existing lock is reclaimed when it is older than the configured
    /// expiry, or when it names another pod that no longer exists.
    ///
    /// # Errors
    ///
    /// - [`NodeLockError::Locked`] if another live pod holds a fresh lock
    /// - [`NodeLockError::Malformed`] if the existing lock value cannot be parsed
    /// - [`NodeLockError::Api`] if reading or writing the node fails
    #[tracing::instrument(skip(self, pod), fields(pod = %pod_name(pod)))]
    pub async fn lock_node(&self, node_name: &str, pod: &Pod) -> Result<(), Report<NodeLockError>> {
        let _local = self.local.lock(&node_name.to_string()).await;

        let node = self.get_node(node_name).await?;
        let Some(value) = lock_annotation(&node) else {
            return self.set_locked(node_name, pod).await;
        };

        let record = NodeLockRecord::parse(value).map_err(|message| {
            Report::new(NodeLockError::Malformed {
                node: node_name.to_string(),
                message,
            })
        })?;

        let age = Utc::now().signed_duration_since(record.locked_at);
        if age.to_std().map(|age| age > self.config.expire).unwrap_or(false) {
            warn!(
                node = node_name,
                locked_at = %record.locked_at,
                "Node lock expired, reclaiming"
            );
            self.release_locked(node_name, pod, true).await?;
            return self.set_locked(node_name, pod).await;
        }

        if let Some((namespace, name)) = &record.owner {
            if !record.is_owned_by(pod_namespace(pod), pod_name(pod))
                && self.is_pod_gone(node_name, namespace, name).await?
            {
                warn!(
                    node = node_name,
                    holder = %format!("{namespace}/{name}"),
                    "Node lock holder no longer exists, reclaiming dangling lock"
                );
                self.release_locked(node_name, pod, true).await?;
                return self.set_locked(node_name, pod).await;
            }
        }

        Err(Report::new(NodeLockError::Locked {
            node: node_name.to_string(),
        }))
    }

    /// Write the lock annotation for `pod`, failing if any lock is present.
    ///
    /// # Errors
    ///
    /// - [`NodeLockError::Locked`] if the annotation already exists
    /// - [`NodeLockError::Api`] if every write attempt fails
    pub async fn set_node_lock(
        &self,
        node_name: &str,
        pod: &Pod,
    ) -> Result<(), Report<NodeLockError>> {
        let _local = self.local.lock(&node_name.to_string()).await;
        self.set_locked(node_name, pod).await
    }

    /// Remove the lock annotation.
    ///
    /// Does nothing if the node is unlocked, or if the lock belongs to another
    /// pod and `skip_owner_check` is false.
    ///
    /// # Errors
    ///
    /// - [`NodeLockError::Api`] if reading the node or every delete attempt fails
    pub async fn release_node_lock(
        &self,
        node_name: &str,
        pod: &Pod,
        skip_owner_check: bool,
    ) -> Result<(), Report<NodeLockError>> {
        let _local = self.local.lock(&node_name.to_string()).await;
        self.release_locked(node_name, pod, skip_owner_check).await
    }

    // Callers hold the in-process mutex of `node_name`.
    async fn set_locked(&self, node_name: &str, pod: &Pod) -> Result<(), Report<NodeLockError>> {
        let node = self.get_node(node_name).await?;
        if lock_annotation(&node).is_some() {
            return Err(Report::new(NodeLockError::Locked {
                node: node_name.to_string(),
            }));
        }

        let value = NodeLockRecord::new(Utc::now(), pod_namespace(pod), pod_name(pod)).encode();
        self.write_with_retry(node_name, LockWrite::Set(&value)).await?;

        info!(node = node_name, pod = pod_name(pod), "Node lock set");
        Ok(())
    }

    // Callers hold the in-process mutex of `node_name`.
    async fn release_locked(
        &self,
        node_name: &str,
        pod: &Pod,
        skip_owner_check: bool,
    ) -> Result<(), Report<NodeLockError>> {
        let node = self.get_node(node_name).await?;
        let Some(value) = lock_annotation(&node) else {
            debug!(node = node_name, "Node lock already released");
            return Ok(());
        };

        if !skip_owner_check {
            let suffix = format!(",{},{}", pod_namespace(pod), pod_name(pod));
            if !value.ends_with(&suffix) {
                info!(
                    node = node_name,
                    pod = pod_name(pod),
                    lock = %value,
                    "Node lock not owned by pod, skipping release"
                );
                return Ok(());
            }
        }

        self.write_with_retry(node_name, LockWrite::Delete(value)).await?;

        info!(node = node_name, pod = pod_name(pod), "Node lock released");
        Ok(())
    }

    /// Forget the in-process mutex of a node removed from the cluster.
    pub fn cleanup_node_lock(&self, node_name: &str) {
        if self.local.remove(&node_name.to_string()) {
            debug!(node = node_name, "Removed in-process node lock");
        }
    }

    /// Hold the in-process mutex of a node without touching the annotation.
    pub async fn local_guard(&self, node_name: &str) -> tokio::sync::OwnedMutexGuard<()> {
        self.local.lock(&node_name.to_string()).await
    }

    async fn get_node(&self, node_name: &str) -> Result<Node, Report<NodeLockError>> {
        self.client
            .get_node(node_name)
            .await
            .change_context(NodeLockError::Api {
                node: node_name.to_string(),
            })
    }

    async fn is_pod_gone(
        &self,
        node_name: &str,
        namespace: &str,
        name: &str,
    ) -> Result<bool, Report<NodeLockError>> {
        match self.client.get_pod(namespace, name).await {
            Ok(_) => Ok(false),
            Err(report) if report.current_context().is_not_found() => Ok(true),
            Err(report) => Err(report.change_context(NodeLockError::Api {
                node: node_name.to_string(),
            })),
        }
    }

    /// Apply `write`, re-reading the annotation before every retry.
    ///
    /// A failed attempt may still have reached the API server, and another
    /// process may have taken or dropped the lock in between. A retry only
    /// patches while the annotation is still in the state the write expects.
    async fn write_with_retry(
        &self,
        node_name: &str,
        write: LockWrite<'_>,
    ) -> Result<(), Report<NodeLockError>> {
        let patch = write.patch();
        let mut attempt = 0;
        loop {
            attempt += 1;
            if attempt > 1 {
                let node = self.get_node(node_name).await?;
                match write.recheck(lock_annotation(&node).map(String::as_str)) {
                    Recheck::Apply => {}
                    Recheck::Done => {
                        debug!(node = node_name, attempt, "Previous lock write took effect");
                        return Ok(());
                    }
                    Recheck::Conflict => {
                        return Err(Report::new(NodeLockError::Locked {
                            node: node_name.to_string(),
                        }));
                    }
                }
            }

            match self.client.patch_node_annotations(node_name, &patch).await {
                Ok(()) => return Ok(()),
                Err(report) if attempt < self.config.retries => {
                    warn!(
                        node = node_name,
                        attempt,
                        "Failed to patch node lock annotation: {report:?}"
                    );
                    tokio::time::sleep(self.config.backoff).await;
                }
                Err(report) => {
                    return Err(report
                        .change_context(NodeLockError::Api {
                            node: node_name.to_string(),
                        })
                        .attach_printable(format!("gave up after {attempt} attempts")));
                }
            }
        }
    }
}

/// A lock annotation write and the value it was decided against.
#[derive(Debug, Clone, Copy)]
enum LockWrite<'a> {
    /// Write this value onto an unlocked node
    Set(&'a str),
    /// Delete the lock while it still holds this value
    Delete(&'a str),
}

#[derive(Debug, PartialEq, Eq)]
enum Recheck {
    Apply,
    Done,
    Conflict,
}

impl LockWrite<'_> {
    fn patch(&self) -> AnnotationPatch {
        let value = match self {
            Self::Set(value) => Some((*value).to_string()),
            Self::Delete(_) => None,
        };
        let mut patch = AnnotationPatch::new();
        patch.insert(NODE_LOCK_ANNOTATION.to_string(), value);
        patch
    }

    fn recheck(&self, current: Option<&str>) -> Recheck {
        match (self, current) {
            (Self::Set(_), None) => Recheck::Apply,
            (Self::Set(value), Some(current)) if current == *value => Recheck::Done,
            (Self::Set(_), Some(_)) => Recheck::Conflict,
            (Self::Delete(value), Some(current)) if current == *value => Recheck::Apply,
            // gone, or replaced by a lock that is not ours to delete
            (Self::Delete(_), _) => Recheck::Done,
        }
    }
}
