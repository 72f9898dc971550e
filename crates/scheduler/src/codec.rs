//! Annotation codec.
//!
//! Pod grants are written as `uuid,type,usedmem,usedcores` per device, devices of
//! one container joined by `:`, and every container terminated by `;`. Node
//! inventories are written as `id,count,devmem,devcore,type,numa,health,index`
//! per device joined by `:`.

use std::collections::BTreeMap;

use api_types::ContainerDevice;
use api_types::ContainerDevices;
use api_types::DeviceInfo;
use api_types::PodSingleDevice;
use error_stack::Report;
use error_stack::ResultExt;
use thiserror::Error;

const DEVICE_FIELD_SEPARATOR: char = ',';
const CONTAINER_DEVICE_SEPARATOR: char = ':';
const POD_CONTAINER_SEPARATOR: char = ';';

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed container device entry `{entry}`: {message}")]
    MalformedContainerDevice { entry: String, message: String },
    #[error("Malformed node device entry `{entry}`: {message}")]
    MalformedNodeDevice { entry: String, message: String },
    #[error("Malformed annotation {key}: {message}")]
    MalformedAnnotation { key: String, message: String },
}

pub fn encode_container_devices(devices: &[ContainerDevice]) -> String {
    devices
        .iter()
        .map(|dev| {
            format!(
                "{}{sep}{}{sep}{}{sep}{}",
                dev.uuid,
                dev.device_type,
                dev.usedmem,
                dev.usedcores,
                sep = DEVICE_FIELD_SEPARATOR
            )
        })
        .collect::<Vec<_>>()
        .join(&CONTAINER_DEVICE_SEPARATOR.to_string())
}

/// Encodes the grants of one device type for every container, in container order.
pub fn encode_pod_single_device(pod_device: &PodSingleDevice) -> String {
    let mut encoded = String::new();
    for container in pod_device {
        encoded.push_str(&encode_container_devices(container));
        encoded.push(POD_CONTAINER_SEPARATOR);
    }
    encoded
}

/// Decodes one container's grants.
///
/// Empty segments between separators are tolerated so that payloads written with
/// a trailing `:` still decode.
///
/// # Errors
///
/// - [`CodecError::MalformedContainerDevice`] if an entry does not have exactly
///   four fields or a numeric field does not parse
pub fn decode_container_devices(encoded: &str) -> Result<ContainerDevices, Report<CodecError>> {
    encoded
        .split(CONTAINER_DEVICE_SEPARATOR)
        .filter(|entry| !entry.is_empty())
        .map(decode_container_device)
        .collect()
}

fn decode_container_device(entry: &str) -> Result<ContainerDevice, Report<CodecError>> {
    let fields: Vec<&str> = entry.split(DEVICE_FIELD_SEPARATOR).collect();
    let [uuid, device_type, usedmem, usedcores] = fields.as_slice() else {
        return Err(Report::new(CodecError::MalformedContainerDevice {
            entry: entry.to_string(),
            message: format!("expected 4 fields, found {}", fields.len()),
        }));
    };

    let parse = |value: &str, name: &str| {
        value
            .parse::<i32>()
            .change_context(CodecError::MalformedContainerDevice {
                entry: entry.to_string(),
                message: format!("invalid {name} `{value}`"),
            })
    };

    Ok(ContainerDevice {
        idx: 0,
        uuid: uuid.to_string(),
        device_type: device_type.to_string(),
        usedmem: parse(*usedmem, "usedmem")?,
        usedcores: parse(*usedcores, "usedcores")?,
        custom_info: BTreeMap::new(),
    })
}

/// Decodes the grants of one device type for every container.
///
/// The payload for a pod that requested nothing of this type is either empty
/// or a run of bare `;` separators, one per container.
///
/// # Errors
///
/// - [`CodecError::MalformedContainerDevice`] if any container payload is malformed
pub fn decode_pod_single_device(encoded: &str) -> Result<PodSingleDevice, Report<CodecError>> {
    if encoded.is_empty() {
        return Ok(Vec::new());
    }
    let body = encoded
        .strip_suffix(POD_CONTAINER_SEPARATOR)
        .unwrap_or(encoded);
    body.split(POD_CONTAINER_SEPARATOR)
        .map(decode_container_devices)
        .collect()
}

/// First container in `encoded` that still has devices to allocate.
///
/// Returns the container position and its devices.
///
/// # Errors
///
/// - [`CodecError::MalformedContainerDevice`] if the payload is malformed
pub fn next_device_request(
    encoded: &str,
) -> Result<Option<(usize, ContainerDevices)>, Report<CodecError>> {
    Ok(decode_pod_single_device(encoded)?
        .into_iter()
        .enumerate()
        .find(|(_, devices)| !devices.is_empty()))
}

/// Clear the container returned by [`next_device_request`] and re-encode.
///
/// # Errors
///
/// - [`CodecError::MalformedContainerDevice`] if the payload is malformed
pub fn erase_next_device_request(encoded: &str) -> Result<String, Report<CodecError>> {
    let mut pod_device = decode_pod_single_device(encoded)?;
    if let Some(devices) = pod_device.iter_mut().find(|devices| !devices.is_empty()) {
        devices.clear();
    }
    Ok(encode_pod_single_device(&pod_device))
}

pub fn encode_node_devices(devices: &[DeviceInfo]) -> String {
    devices
        .iter()
        .map(|dev| {
            format!(
                "{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}",
                dev.id,
                dev.count,
                dev.devmem,
                dev.devcore,
                dev.device_type,
                dev.numa,
                dev.health,
                dev.index,
                sep = DEVICE_FIELD_SEPARATOR
            )
        })
        .collect::<Vec<_>>()
        .join(&CONTAINER_DEVICE_SEPARATOR.to_string())
}

/// Decodes a node registration payload.
///
/// The trailing `index` field is optional; when absent the position in the
/// list is used.
///
/// # Errors
///
/// - [`CodecError::MalformedNodeDevice`] if an entry is malformed or the payload is empty
pub fn decode_node_devices(encoded: &str) -> Result<Vec<DeviceInfo>, Report<CodecError>> {
    let devices = encoded
        .split(CONTAINER_DEVICE_SEPARATOR)
        .filter(|entry| !entry.is_empty())
        .enumerate()
        .map(|(position, entry)| decode_node_device(position, entry))
        .collect::<Result<Vec<_>, _>>()?;

    if devices.is_empty() {
        return Err(Report::new(CodecError::MalformedNodeDevice {
            entry: encoded.to_string(),
            message: "no devices in registration payload".to_string(),
        }));
    }
    Ok(devices)
}

fn decode_node_device(position: usize, entry: &str) -> Result<DeviceInfo, Report<CodecError>> {
    let fields: Vec<&str> = entry.split(DEVICE_FIELD_SEPARATOR).collect();
    if fields.len() != 7 && fields.len() != 8 {
        return Err(Report::new(CodecError::MalformedNodeDevice {
            entry: entry.to_string(),
            message: format!("expected 7 or 8 fields, found {}", fields.len()),
        }));
    }

    let malformed = |message: String| CodecError::MalformedNodeDevice {
        entry: entry.to_string(),
        message,
    };
    let parse_i32 = |value: &str, name: &str| {
        value
            .parse::<i32>()
            .change_context_lazy(|| malformed(format!("invalid {name} `{value}`")))
    };

    let index = match fields.get(7) {
        Some(value) => value
            .parse::<u32>()
            .change_context_lazy(|| malformed(format!("invalid index `{value}`")))?,
        None => position as u32,
    };

    Ok(DeviceInfo {
        id: fields[0].to_string(),
        index,
        count: parse_i32(fields[1], "count")?,
        devmem: parse_i32(fields[2], "devmem")?,
        devcore: parse_i32(fields[3], "devcore")?,
        device_type: fields[4].to_string(),
        numa: parse_i32(fields[5], "numa")?,
        health: fields[6]
            .parse::<bool>()
            .change_context_lazy(|| malformed(format!("invalid health `{}`", fields[6])))?,
        custom_info: BTreeMap::new(),
    })
}
