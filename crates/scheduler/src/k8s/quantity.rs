use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::k8s::types::KubernetesError;

/// Parse a Kubernetes quantity into its integer value, rounding fractions up.
///
/// Supports the following suffixes:
/// - Binary: "Ki", "Mi", "Gi", "Ti"
/// - Decimal: "k", "M", "G", "T"
/// - Milli: "m"
///
/// # Errors
///
/// - [`KubernetesError::QuantityParseError`] if the quantity format is invalid
pub(crate) fn quantity_value(quantity: &Quantity) -> Result<i64, Report<KubernetesError>> {
    parse_quantity(&quantity.0)
}

fn parse_quantity(value: &str) -> Result<i64, Report<KubernetesError>> {
    let value = value.trim();

    // Handle plain integers
    if let Ok(number) = value.parse::<i64>() {
        return Ok(number);
    }

    let (numeric_part, unit) = match value.find(|c: char| c.is_alphabetic()) {
        Some(pos) => (&value[..pos], &value[pos..]),
        None => (value, ""),
    };

    let numeric_value: f64 =
        numeric_part
            .parse::<f64>()
            .change_context(KubernetesError::QuantityParseError {
                message: format!("Invalid numeric part in quantity: {value}"),
            })?;

    let multiplier = match unit {
        "" => 1.0,
        "m" => 0.001,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024_f64.powi(4),
        _ => {
            return Err(Report::new(KubernetesError::QuantityParseError {
                message: format!("Unsupported quantity suffix: {unit}"),
            }));
        }
    };

    Ok((numeric_value * multiplier).ceil() as i64)
}
