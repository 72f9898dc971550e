//! Hex compute-unit masks.
//!
//! Each hex digit covers four compute units, most significant bit first.
//! A set bit means the unit is reserved.

use error_stack::Report;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreMaskError {
    #[error("invalid core mask `{mask}`: {message}")]
    Invalid { mask: String, message: String },
    #[error("core masks `{left}` and `{right}` differ in width")]
    WidthMismatch { left: String, right: String },
    #[error("{remaining} of {requested} compute units could not be reserved")]
    Insufficient { requested: u32, remaining: u32 },
}

fn nibbles(mask: &str) -> Result<Vec<u8>, Report<CoreMaskError>> {
    mask.chars()
        .map(|c| {
            c.to_digit(16).map(|d| d as u8).ok_or_else(|| {
                Report::new(CoreMaskError::Invalid {
                    mask: mask.to_string(),
                    message: format!("`{c}` is not a hex digit"),
                })
            })
        })
        .collect()
}

fn render(nibbles: impl IntoIterator<Item = u8>) -> String {
    nibbles
        .into_iter()
        .map(|n| format!("{n:x}"))
        .collect()
}

/// Empty mask for a device with `units` compute units.
pub fn init_core_usage(units: u32) -> String {
    "0".repeat((units / 4) as usize)
}

/// Bitwise OR of two masks of the same width.
///
/// # Errors
///
/// - [`CoreMaskError::Invalid`] if either mask has a non-hex digit
/// - [`CoreMaskError::WidthMismatch`] if the masks differ in length
pub fn add_core_usage(total: &str, granted: &str) -> Result<String, Report<CoreMaskError>> {
    if total.len() != granted.len() {
        return Err(Report::new(CoreMaskError::WidthMismatch {
            left: total.to_string(),
            right: granted.to_string(),
        }));
    }
    let left = nibbles(total)?;
    let right = nibbles(granted)?;
    Ok(render(left.into_iter().zip(right).map(|(l, r)| l | r)))
}

/// Reserve `units` free compute units in `used`, scanning from the first digit.
///
/// Returns a mask holding only the newly reserved units.
///
/// # Errors
///
/// - [`CoreMaskError::Invalid`] if `used` has a non-hex digit
/// - [`CoreMaskError::Insufficient`] if fewer than `units` units are free
pub fn alloc_core_usage(used: &str, units: u32) -> Result<String, Report<CoreMaskError>> {
    let mut remaining = units;
    let mut reserved = Vec::with_capacity(used.len());
    for nibble in nibbles(used)? {
        let mut out = 0u8;
        for bit in (0..4).rev() {
            if remaining > 0 && nibble & (1 << bit) == 0 {
                out |= 1 << bit;
                remaining -= 1;
            }
        }
        reserved.push(out);
    }

    if remaining > 0 {
        return Err(Report::new(CoreMaskError::Insufficient {
            requested: units,
            remaining,
        }));
    }
    Ok(render(reserved))
}

/// Number of reserved units in `mask`.
pub fn used_units(mask: &str) -> Result<u32, Report<CoreMaskError>> {
    Ok(nibbles(mask)?.into_iter().map(|n| n.count_ones()).sum())
}
