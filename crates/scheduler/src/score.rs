//! Node scoring and device ordering policies.
//!
//! For every candidate node the pod's requests are fitted container by
//! container against a private copy of the node's usage, so that later
//! containers see the devices granted to earlier ones. Nodes that fit are
//! ranked by the free share of the picked devices plus a device count bonus,
//! or by the node policy when one is configured. The devices picked during
//! scoring are the ones written to the pod, with no second fit pass.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use api_types::ContainerDeviceRequest;
use api_types::ContainerDeviceRequests;
use api_types::DeviceUsage;
use api_types::PodDevices;
use api_types::SchedulerPolicy;
use api_types::MEM_PERCENTAGE_UNSET;
use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

use crate::device::DeviceRegistry;
use crate::device::FitContext;
use crate::device::FitOutcome;
use crate::device::FitReason;
use crate::k8s::annotations::pod_annotations;
use crate::usage::NodeUsage;

/// Scale applied to every usage ratio.
pub const WEIGHT: f32 = 10.0;

fn ratio(num: i32, den: i32) -> f32 {
    if den <= 0 {
        0.0
    } else {
        num as f32 / den as f32
    }
}

/// Score of `device` as if `request` were placed on it.
pub fn device_score(device: &DeviceUsage, request: &ContainerDeviceRequest) -> f32 {
    let mem = if request.mem_percentagereq != 0 && request.mem_percentagereq != MEM_PERCENTAGE_UNSET
    {
        (i64::from(device.totalmem) * i64::from(request.mem_percentagereq) / 100) as i32
    } else {
        request.memreq
    };
    let used = ratio(request.nums + device.used, device.count);
    let cores = ratio(request.coresreq + device.usedcores, device.totalcore);
    let memory = ratio(mem + device.usedmem, device.totalmem);
    WEIGHT * (used + cores + memory)
}

/// Order `devices` so that the fit scan, which starts from the end, meets
/// the preferred devices first.
///
/// Spread, the default, prefers the highest NUMA node and the least-used
/// device. Binpack prefers the lowest NUMA node and the fullest device.
/// Ties keep inventory order.
pub fn sort_devices(
    devices: &mut [DeviceUsage],
    request: &ContainerDeviceRequest,
    policy: SchedulerPolicy,
) {
    let mut scored: Vec<(f32, DeviceUsage)> = devices
        .iter()
        .map(|device| (device_score(device, request), device.clone()))
        .collect();
    scored.sort_by(|(a_score, a), (b_score, b)| match policy {
        SchedulerPolicy::Binpack => b.numa.cmp(&a.numa).then(a_score.total_cmp(b_score)),
        SchedulerPolicy::Spread => a.numa.cmp(&b.numa).then(b_score.total_cmp(a_score)),
    });
    for (slot, (_, device)) in devices.iter_mut().zip(scored) {
        *slot = device;
    }
}

/// `10 * (used/count + usedcores/totalcore + usedmem/totalmem)` summed over the node.
pub fn default_node_score<'a>(devices: impl IntoIterator<Item = &'a DeviceUsage>) -> f32 {
    let (mut used, mut count) = (0, 0);
    let (mut used_cores, mut total_cores) = (0, 0);
    let (mut used_mem, mut total_mem) = (0i64, 0i64);
    for device in devices {
        used += device.used;
        count += device.count;
        used_cores += device.usedcores;
        total_cores += device.totalcore;
        used_mem += i64::from(device.usedmem);
        total_mem += i64::from(device.totalmem);
    }
    let memory = if total_mem <= 0 {
        0.0
    } else {
        used_mem as f32 / total_mem as f32
    };
    WEIGHT * (ratio(used, count) + ratio(used_cores, total_cores) + memory)
}

/// A node that can host the whole pod.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeScore {
    pub node: String,
    /// Devices picked for every container, in container order
    pub devices: PodDevices,
    /// Free share of the picked devices plus a device count bonus, higher wins
    pub score: f32,
    /// Usage score ranked by the node policy, `None` without one
    pub policy_score: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreResult {
    /// Nodes that fit, in candidate order
    pub scores: Vec<NodeScore>,
    /// Rejection reason per node
    pub failed: BTreeMap<String, String>,
}

/// Scoring knobs.
#[derive(Debug, Clone, Copy)]
pub struct ScorePolicies {
    /// Rank nodes by usage instead of free share
    pub node: Option<SchedulerPolicy>,
    pub gpu: SchedulerPolicy,
}

impl Default for ScorePolicies {
    fn default() -> Self {
        Self {
            node: None,
            gpu: SchedulerPolicy::Spread,
        }
    }
}

/// Fit `requests` on every node in `nodes` and score the ones that fit.
pub fn calc_score(
    registry: &DeviceRegistry,
    nodes: &[NodeUsage],
    requests: &[ContainerDeviceRequests],
    pod: &Pod,
    policies: ScorePolicies,
) -> ScoreResult {
    let mut result = ScoreResult::default();
    for usage in nodes {
        match score_node(registry, usage, requests, pod, policies) {
            Ok(score) => {
                debug!(node = %usage.node, score = score.score, policy_score = ?score.policy_score, "Node fits");
                result.scores.push(score);
            }
            Err(reason) => {
                debug!(node = %usage.node, %reason, "Node does not fit");
                result.failed.insert(usage.node.clone(), reason);
            }
        }
    }
    result
}

fn score_node(
    registry: &DeviceRegistry,
    usage: &NodeUsage,
    requests: &[ContainerDeviceRequests],
    pod: &Pod,
    policies: ScorePolicies,
) -> Result<NodeScore, String> {
    let annotations = pod_annotations(pod);
    let mut snapshot = usage.clone();
    let mut devices = PodDevices::new();
    let mut score = 0.0;

    for (position, container_requests) in requests.iter().enumerate() {
        for (device_type, request) in container_requests {
            let vendor = registry
                .get(device_type)
                .ok_or_else(|| format!("unknown device type {device_type}"))?;
            let node_devices = snapshot
                .devices
                .get_mut(device_type)
                .filter(|node_devices| !node_devices.is_empty())
                .ok_or_else(|| FitReason::NodeInsufficientDevice.to_string())?;

            sort_devices(node_devices, request, policies.gpu);
            let ctx = FitContext {
                annotations,
                pod: Some(pod),
                node_name: &usage.node,
                allocated: &devices,
            };
            let mut granted = match vendor.fit(node_devices, request, &ctx) {
                FitOutcome::Fit { devices } => devices,
                FitOutcome::Unfit { reason, .. } => return Err(reason),
            };
            let granted = granted.remove(device_type.as_str()).unwrap_or_default();

            let (mut free, mut total) = (0, 0);
            for grant in &granted {
                let Some(device) = node_devices.iter_mut().find(|d| d.id == grant.uuid) else {
                    continue;
                };
                total += device.count;
                free += device.count - device.used;
                vendor
                    .add_resource_usage(device, grant)
                    .map_err(|e| e.current_context().to_string())?;
            }
            score += ratio(free, total) + node_devices.len() as f32;

            let containers = devices.entry(device_type.clone()).or_default();
            containers.resize(position, Vec::new());
            containers.push(granted);
        }
    }
    for containers in devices.values_mut() {
        containers.resize(requests.len(), Vec::new());
    }

    let policy_score = policies
        .node
        .map(|policy| usage_score(registry, usage, &devices, policy));

    Ok(NodeScore {
        node: usage.node.clone(),
        devices,
        score,
        policy_score,
    })
}

/// Usage of the node before this pod, unless a vendor scores it itself.
fn usage_score(
    registry: &DeviceRegistry,
    usage: &NodeUsage,
    devices: &PodDevices,
    policy: SchedulerPolicy,
) -> f32 {
    let overrides: Vec<f32> = devices
        .iter()
        .filter_map(|(device_type, containers)| {
            registry.get(device_type)?.score_node(
                &usage.node,
                containers,
                usage.devices_of(device_type),
                policy,
            )
        })
        .collect();
    if overrides.is_empty() {
        return default_node_score(usage.devices.values().flatten());
    }
    let score = overrides.iter().sum();
    debug!(node = %usage.node, score, "Vendor override score");
    score
}

fn compare(a: &NodeScore, b: &NodeScore, policy: Option<SchedulerPolicy>) -> Ordering {
    let (a_usage, b_usage) = (a.policy_score.unwrap_or(0.0), b.policy_score.unwrap_or(0.0));
    let by_policy = match policy {
        None => Ordering::Equal,
        Some(SchedulerPolicy::Binpack) => a_usage.total_cmp(&b_usage),
        Some(SchedulerPolicy::Spread) => b_usage.total_cmp(&a_usage),
    };
    by_policy.then(a.score.total_cmp(&b.score))
}

/// Best node: the highest [`NodeScore::score`], or under a node policy the
/// busiest (binpack) or idlest (spread) node.
///
/// Equal nodes resolve to the earliest candidate.
pub fn select_node(scores: &[NodeScore], policy: Option<SchedulerPolicy>) -> Option<&NodeScore> {
    scores.iter().fold(None, |best, candidate| match best {
        Some(best) if compare(candidate, best, policy) != Ordering::Greater => Some(best),
        _ => Some(candidate),
    })
}
