//! Interconnect-aware selection for multi-device requests.
//!
//! Ring discovery belongs to the vendor topology source; this module only
//! picks among the rings it reports.

use std::fmt::Debug;
use std::sync::Arc;

use derive_more::Display;
use error_stack::Report;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// A device set forming an interconnect ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ring {
    pub ordinals: Vec<u32>,
    /// Number of parallel rings that do not share links
    pub non_conflict_ring_num: u32,
}

/// Source of ring and board layout for one node.
pub trait RingTopology: Send + Sync + Debug {
    /// Rings of exactly `size` devices drawn from `available`.
    fn rings(&self, available: &[u32], size: usize) -> Vec<Ring>;

    /// Board hosting `ordinal`, if known.
    fn board_of(&self, ordinal: u32) -> Option<String>;
}

/// Topology that knows no rings; every device is its own board.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRings;

impl RingTopology for NoRings {
    fn rings(&self, _available: &[u32], _size: usize) -> Vec<Ring> {
        Vec::new()
    }

    fn board_of(&self, _ordinal: u32) -> Option<String> {
        None
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllocationPolicy {
    /// Fall back to plain packing when no ring exists
    #[default]
    #[display("best-effort")]
    BestEffort,
    /// Require rings, and enough parallel rings for 2 and 4 device jobs
    #[display("restricted")]
    Restricted,
    /// Require a ring whenever the size can form one
    #[display("guaranteed")]
    Guaranteed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllocatorKind {
    #[default]
    Default,
    /// Keep selections on as few boards as possible
    Board,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    #[error("policy {policy} found no rings for size {size}")]
    NoRings { policy: AllocationPolicy, size: usize },
    #[error("policy {policy} needs {size} non-conflict rings, best has {found}")]
    TooFewParallelRings {
        policy: AllocationPolicy,
        size: usize,
        found: u32,
    },
    #[error("{available} devices available, {size} requested")]
    NotEnoughDevices { available: usize, size: usize },
}

#[derive(Debug, Clone)]
pub struct RingAllocator {
    kind: AllocatorKind,
    policy: AllocationPolicy,
    topology: Arc<dyn RingTopology>,
}

impl RingAllocator {
    pub fn new(kind: AllocatorKind, policy: AllocationPolicy, topology: Arc<dyn RingTopology>) -> Self {
        Self {
            kind,
            policy,
            topology,
        }
    }

    fn size_never_forms_ring(&self, size: usize) -> bool {
        match self.kind {
            AllocatorKind::Default => size % 2 == 1,
            AllocatorKind::Board => size <= 1 || size > 8 || size % 2 == 1,
        }
    }

    /// Pick `size` ordinals out of `available`.
    ///
    /// # Errors
    ///
    /// - [`RingError::NotEnoughDevices`] if `available` is shorter than `size`
    /// - [`RingError::NoRings`] if the policy requires a ring and none exists
    /// - [`RingError::TooFewParallelRings`] if a restricted 2 or 4 device job
    ///   has too few parallel rings
    pub fn allocate(&self, available: &[u32], size: usize) -> Result<Vec<u32>, Report<RingError>> {
        if available.len() < size {
            return Err(Report::new(RingError::NotEnoughDevices {
                available: available.len(),
                size,
            }));
        }

        let mut rings = self.topology.rings(available, size);
        rings.sort_by(|a, b| b.non_conflict_ring_num.cmp(&a.non_conflict_ring_num));

        let Some(top) = rings.first() else {
            debug!(?available, size, policy = %self.policy, "Found no rings");
            if self.policy != AllocationPolicy::BestEffort && !self.size_never_forms_ring(size) {
                return Err(Report::new(RingError::NoRings {
                    policy: self.policy,
                    size,
                }));
            }
            return Ok(match self.kind {
                AllocatorKind::Default => available[..size].to_vec(),
                AllocatorKind::Board => self.pack_boards(available, size),
            });
        };

        if self.policy == AllocationPolicy::Restricted
            && (size == 2 || size == 4)
            && top.non_conflict_ring_num < size as u32
        {
            return Err(Report::new(RingError::TooFewParallelRings {
                policy: self.policy,
                size,
                found: top.non_conflict_ring_num,
            }));
        }

        if self.kind == AllocatorKind::Default {
            return Ok(top.ordinals.clone());
        }

        let best = top.non_conflict_ring_num;
        let on_one_board = rings
            .iter()
            .take_while(|ring| ring.non_conflict_ring_num == best)
            .find(|ring| self.single_board(&ring.ordinals));
        Ok(on_one_board.unwrap_or(top).ordinals.clone())
    }

    fn single_board(&self, ordinals: &[u32]) -> bool {
        let mut boards = ordinals.iter().map(|&o| self.topology.board_of(o));
        match boards.next() {
            Some(Some(first)) => boards.all(|board| board.as_ref() == Some(&first)),
            _ => false,
        }
    }

    /// Fill from the smallest boards first.
    fn pack_boards(&self, available: &[u32], size: usize) -> Vec<u32> {
        // unknown boards hold a single device each
        let mut boards: Vec<(Option<String>, Vec<u32>)> = Vec::new();
        for &ordinal in available {
            let board = self.topology.board_of(ordinal);
            match boards.iter_mut().find(|(b, _)| board.is_some() && *b == board) {
                Some((_, members)) => members.push(ordinal),
                None => boards.push((board, vec![ordinal])),
            }
        }
        boards.sort_by_key(|(_, members)| members.len());

        boards
            .into_iter()
            .flat_map(|(_, members)| members)
            .take(size)
            .collect()
    }
}
