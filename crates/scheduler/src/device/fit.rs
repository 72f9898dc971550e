//! Shared device scan behind [`Device::fit`](super::Device::fit).

use std::collections::BTreeMap;

use api_types::ContainerDevice;
use api_types::ContainerDeviceRequest;
use api_types::ContainerDevices;
use api_types::DeviceUsage;
use tracing::debug;
use tracing::trace;

use super::required_memory;
use super::Device;
use super::FitContext;
use super::FitOutcome;
use super::FitReason;
use super::FitReasons;

/// A device that passed every predicate, with the grant it would receive.
#[derive(Debug, Clone)]
pub(crate) struct Candidate<'a> {
    pub device: &'a DeviceUsage,
    pub grant: ContainerDevice,
}

#[derive(Debug)]
pub(crate) enum ScanStep<'a> {
    /// The scan entered a new NUMA group
    NumaChanged(i32),
    Pass(Candidate<'a>),
}

/// Walks `devices` from the highest index down and evaluates the vendor
/// predicates on each.
///
/// `on_step` sees every passing device and every NUMA group change, and
/// returns `true` to stop the scan. The returned histogram covers the
/// rejected devices plus whatever `on_step` records.
pub(crate) fn walk<'a, D, F>(
    vendor: &D,
    devices: &'a [DeviceUsage],
    request: &ContainerDeviceRequest,
    ctx: &FitContext<'_>,
    mut on_step: F,
) -> FitReasons
where
    D: Device + ?Sized,
    F: FnMut(ScanStep<'a>, &mut FitReasons) -> bool,
{
    let mut reasons = FitReasons::new();
    let mut numa: Option<i32> = None;

    for device in devices.iter().rev() {
        trace!(device = %device.id, used = device.used, usedmem = device.usedmem, usedcores = device.usedcores, "Scanning device");
        if !device.health {
            reasons.add(FitReason::CardNotHealth);
            continue;
        }

        let check = vendor.check_type(ctx.annotations, device, request);
        if !check.found {
            reasons.add(FitReason::CardTypeMismatch);
            continue;
        }
        if check.numa_bind && vendor.resets_on_numa_change() && numa != Some(device.numa) {
            numa = Some(device.numa);
            if on_step(ScanStep::NumaChanged(device.numa), &mut reasons) {
                break;
            }
        }

        if !vendor.check_uuid(ctx.annotations, device) {
            reasons.add(FitReason::CardUuidMismatch);
            continue;
        }
        if device.count <= device.used {
            reasons.add(FitReason::CardTimeSlicingExhausted);
            continue;
        }

        let memreq = required_memory(device, request);
        if let Err(reason) = vendor.check_capacity(device, request, memreq) {
            reasons.add(reason);
            continue;
        }
        let grant = match vendor.grant(device, request, memreq) {
            Ok(grant) => grant,
            Err(reason) => {
                reasons.add(reason);
                continue;
            }
        };

        if on_step(ScanStep::Pass(Candidate { device, grant }), &mut reasons) {
            break;
        }
    }
    reasons
}

/// Greedy scan: take passing devices until the request is satisfied.
///
/// When the vendor resets on NUMA changes and the request binds to one NUMA
/// node, entering a new NUMA group discards the partial selection and
/// records it as [`FitReason::NumaNotFit`].
pub(crate) fn scan<D: Device + ?Sized>(
    vendor: &D,
    devices: &[DeviceUsage],
    request: &ContainerDeviceRequest,
    ctx: &FitContext<'_>,
) -> FitOutcome {
    if request.nums <= 0 {
        return FitOutcome::Fit {
            devices: BTreeMap::new(),
        };
    }

    let mut remaining = request.nums;
    let mut picked: ContainerDevices = Vec::new();

    let mut reasons = walk(vendor, devices, request, ctx, |step, reasons| match step {
        ScanStep::NumaChanged(numa) => {
            if !picked.is_empty() {
                debug!(numa, dropped = picked.len(), "NUMA group changed, restarting selection");
                reasons.add_n(FitReason::NumaNotFit, picked.len());
                picked.clear();
                remaining = request.nums;
            }
            false
        }
        ScanStep::Pass(candidate) => {
            picked.push(candidate.grant);
            remaining -= 1;
            remaining == 0
        }
    });

    if remaining == 0 {
        let mut result = BTreeMap::new();
        result.insert(request.device_type.clone(), picked);
        return FitOutcome::Fit { devices: result };
    }

    reasons.add_n(FitReason::AllocatedCardsInsufficientRequest, picked.len());
    FitOutcome::Unfit {
        reason: reasons.render(devices.len()),
        partial: picked,
    }
}
