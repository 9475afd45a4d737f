//! Device descriptor resolution
//!
//! Parses target strings like `"AUTO:GPU,CPU"`, `"MULTI:GPU.1,CPU"` or
//! `"BATCH:GPU(4)"` into immutable per-device descriptors, merging the base
//! config map and filtering it down to the keys each backend accepts.

use devmux_backend::{BackendCore, ConfigMap, DeviceName};
use devmux_common::config::keys;
use devmux_common::{DevMuxError, Result};
use tracing::debug;

/// How a compiled target schedules work across its devices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    /// Pick the best device, racing a fast helper while it loads
    Auto,

    /// Keep every listed device in service and balance across them
    Multi,

    /// Coalesce requests into fixed-size batches on a single device
    Batch,
}

/// Immutable description of one candidate device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Device name as the backend knows it, id suffix included (`"GPU.1"`)
    pub name: DeviceName,

    /// Per-device config map (base config merged, unsupported keys dropped)
    pub config: ConfigMap,

    /// Parenthesized count from the target string: the batch size for BATCH
    /// targets, the worker-pool size override otherwise
    pub requested_batch: Option<u32>,

    /// Stable identifier, unique across the resolved list
    pub unique_name: String,

    /// Position in the priority list; lower is better
    pub priority: u32,
}

/// A fully resolved compilation target
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub mode: ScheduleMode,
    pub devices: Vec<DeviceDescriptor>,
}

/// Whether a device is CPU-class, i.e. fast to initialize and usable as the
/// load-race helper
pub fn is_cpu_class(name: &str) -> bool {
    name.contains("CPU")
}

/// Resolve a target string into a schedule mode and device list
///
/// A missing mode prefix means AUTO. A bare `"BATCH"` target reads its
/// device-plus-batch spec from the `AUTO_BATCH` key of the base config.
pub fn resolve_target(
    target: &str,
    base_config: &ConfigMap,
    core: &dyn BackendCore,
) -> Result<ResolvedTarget> {
    let target = target.trim();
    let (mode, priorities) = match target.split_once(':') {
        Some(("AUTO", rest)) => (ScheduleMode::Auto, rest.to_string()),
        Some(("MULTI", rest)) => (ScheduleMode::Multi, rest.to_string()),
        Some(("BATCH", rest)) => (ScheduleMode::Batch, rest.to_string()),
        Some((other, _)) => {
            return Err(DevMuxError::config(format!(
                "Unknown schedule mode: {}",
                other
            )))
        }
        None if target == "BATCH" => {
            let spec = base_config.get(keys::AUTO_BATCH).ok_or_else(|| {
                DevMuxError::config("AUTO_BATCH key is not set for BATCH device")
            })?;
            (ScheduleMode::Batch, spec.clone())
        }
        None => (ScheduleMode::Auto, target.to_string()),
    };

    let devices = resolve_priorities(&priorities, base_config, core)?;

    if mode == ScheduleMode::Batch && devices.len() != 1 {
        return Err(DevMuxError::config(format!(
            "BATCH target takes exactly one device, got {}",
            devices.len()
        )));
    }

    Ok(ResolvedTarget { mode, devices })
}

/// Parse a comma-separated priority list into device descriptors
pub fn resolve_priorities(
    priorities: &str,
    base_config: &ConfigMap,
    core: &dyn BackendCore,
) -> Result<Vec<DeviceDescriptor>> {
    if priorities.trim().is_empty() {
        return Err(DevMuxError::config("Device priority list is empty"));
    }

    let mut devices = Vec::new();
    for (idx, entry) in priorities.split(',').enumerate() {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(DevMuxError::config(format!(
                "Empty device entry at position {}",
                idx
            )));
        }
        devices.push(parse_device(entry, idx as u32, base_config, core)?);
    }
    Ok(devices)
}

/// Parse one `name[(count)]` entry
fn parse_device(
    entry: &str,
    priority: u32,
    base_config: &ConfigMap,
    core: &dyn BackendCore,
) -> Result<DeviceDescriptor> {
    let (name, requested_batch) = match entry.find('(') {
        Some(open) => {
            let close = entry.find(')').ok_or_else(|| {
                DevMuxError::config(format!("Missing ')' in device entry '{}'", entry))
            })?;
            if close < open || close != entry.len() - 1 {
                return Err(DevMuxError::config(format!(
                    "Malformed device entry '{}'",
                    entry
                )));
            }
            let name = entry[..open].trim();
            let count: i64 = entry[open + 1..close].trim().parse().map_err(|_| {
                DevMuxError::config(format!("Invalid count in device entry '{}'", entry))
            })?;
            if count <= 0 {
                return Err(DevMuxError::config(format!(
                    "Batch value for '{}' must be > 0, while {} is passed",
                    name, count
                )));
            }
            (name, Some(count as u32))
        }
        None => (entry, None),
    };

    if name.is_empty() {
        return Err(DevMuxError::config(format!(
            "Missing device name in entry '{}'",
            entry
        )));
    }

    let mut config = base_config.clone();

    // a numeric suffix like "GPU.1" additionally lands in the device config
    if let Some((_, id)) = name.rsplit_once('.') {
        if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) {
            config.insert(keys::DEVICE_ID.to_string(), id.to_string());
        }
    }

    // keep only the keys the backend accepts; the rest are dropped, not errors
    let supported = core.supported_config_keys(name);
    let before = config.len();
    config.retain(|key, _| supported.iter().any(|s| s == key));
    if config.len() < before {
        debug!(
            device = name,
            dropped = before - config.len(),
            "dropped config keys the device does not support"
        );
    }

    Ok(DeviceDescriptor {
        name: name.to_string(),
        config,
        requested_batch,
        unique_name: format!("{}_{}", name, priority),
        priority,
    })
}
