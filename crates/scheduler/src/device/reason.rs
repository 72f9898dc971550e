//! Fit failure taxonomy.

use std::collections::BTreeMap;

use derive_more::Display;

/// Why a device or node was rejected. Declaration order is the rendering order.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FitReason {
    CardNotHealth,
    CardTypeMismatch,
    CardUuidMismatch,
    CardTimeSlicingExhausted,
    CardComputeUnitsExhausted,
    CardInsufficientMemory,
    CardInsufficientCore,
    NumaNotFit,
    /// No device subset satisfied the interconnect policy
    TopologyNotFit,
    ExclusiveDeviceAllocateConflict,
    NodeInsufficientDevice,
    AllocatedCardsInsufficientRequest,
}

/// Histogram of rejection reasons collected during one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FitReasons {
    counts: BTreeMap<FitReason, usize>,
}

impl FitReasons {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, reason: FitReason) {
        self.add_n(reason, 1);
    }

    pub fn add_n(&mut self, reason: FitReason, n: usize) {
        if n > 0 {
            *self.counts.entry(reason).or_default() += n;
        }
    }

    /// Renders `"<count>/<total> <Reason>"` entries joined by `", "`.
    pub fn render(&self, total: usize) -> String {
        self.counts
            .iter()
            .map(|(reason, count)| format!("{count}/{total} {reason}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}
