use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Pod;

use crate::k8s::types::KubernetesError;

/// Node annotation holding the cross-process allocation lock.
pub const NODE_LOCK_ANNOTATION: &str = "hami.io/mutex.lock";
/// Pod annotation naming the node chosen by the scheduler.
pub const ASSIGNED_NODE_ANNOTATION: &str = "hami.io/vgpu-node";
/// Pod annotation with the unix time of the scheduling decision.
pub const ASSIGNED_TIME_ANNOTATION: &str = "hami.io/vgpu-time";
pub const BIND_PHASE_ANNOTATION: &str = "hami.io/bind-phase";
pub const BIND_TIME_ANNOTATION: &str = "hami.io/bind-time";

const EMPTY: &BTreeMap<String, String> = &BTreeMap::new();

/// Scheduling annotations extracted from a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulingAnnotations {
    /// Node the pod was assigned to
    pub assigned_node: Option<String>,
    /// When the assignment was made
    pub assigned_time: Option<DateTime<Utc>>,
    /// Last recorded bind phase
    pub bind_phase: Option<String>,
}

impl SchedulingAnnotations {
    /// Parse scheduling annotations from a pod's annotations.
    ///
    /// # Errors
    ///
    /// - [`KubernetesError::AnnotationParseError`] if the assigned time is not a unix timestamp
    pub fn from_pod_annotations(
        annotations: &BTreeMap<String, String>,
    ) -> Result<Self, Report<KubernetesError>> {
        let mut result = Self {
            assigned_node: annotations
                .get(ASSIGNED_NODE_ANNOTATION)
                .filter(|node| !node.is_empty())
                .cloned(),
            bind_phase: annotations.get(BIND_PHASE_ANNOTATION).cloned(),
            ..Default::default()
        };

        if let Some(value) = annotations.get(ASSIGNED_TIME_ANNOTATION) {
            let secs = value
                .parse::<i64>()
                .change_context(KubernetesError::AnnotationParseError {
                    message: format!("Invalid {ASSIGNED_TIME_ANNOTATION} value: {value}"),
                })?;
            result.assigned_time = DateTime::from_timestamp(secs, 0);
        }

        Ok(result)
    }
}

/// Annotations of a pod, empty when the pod has none.
pub fn pod_annotations(pod: &Pod) -> &BTreeMap<String, String> {
    pod.metadata.annotations.as_ref().unwrap_or(EMPTY)
}

pub fn pod_namespace(pod: &Pod) -> &str {
    pod.metadata.namespace.as_deref().unwrap_or("default")
}

pub fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or("unknown")
}

pub fn pod_uid(pod: &Pod) -> &str {
    pod.metadata.uid.as_deref().unwrap_or_default()
}

/// Returns true once the pod reached a phase where it no longer holds devices.
pub fn is_pod_terminated(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|status| status.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}
