//! Kubernetes integration module.
//!
//! All cluster access goes through the [`KubeClient`] trait so that the node
//! lock, the scheduler and the registration loop can run against the API
//! server or against [`MockKubeClient`] in tests.
//!
//! The main components are:
//! - [`KubeClient`]: node and pod reads, annotation merge patches, pod binding
//! - [`KubeApiClient`]: the `kube` backed implementation
//! - [`SchedulingAnnotations`]: scheduling decision annotations parsed from a pod

pub mod annotations;
pub mod client;
pub mod mock;
pub(crate) mod quantity;
pub mod types;

pub use annotations::SchedulingAnnotations;
pub use client::KubeApiClient;
pub use client::KubeClient;
pub use mock::MockKubeClient;
pub use types::AnnotationPatch;
pub use types::KubernetesError;
