//! Device-sharing scheduler core.
//!
//! Nodes publish their accelerators as annotations, the scheduler decodes
//! them into a usage model, fits container requests against it and records
//! every decision back onto the pod. Binding is serialized per node through
//! an annotation lock so concurrent scheduler replicas stay consistent.

pub mod codec;
pub mod config;
pub mod device;
pub mod health;
pub mod k8s;
pub mod logging;
pub mod nodelock;
pub mod registration;
pub mod scheduler;
pub mod score;
pub mod usage;
pub mod util;
