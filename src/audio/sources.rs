//! Host input device enumeration

use cpal::traits::{DeviceTrait, HostTrait};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A capture device the host driver can open
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputDevice {
    /// Device name, as passed to `CpalDriver::with_device`
    pub name: String,

    /// Whether this is the host's default input
    pub is_default: bool,

    /// Default sample rate, when the device reports one
    pub sample_rate: Option<u32>,

    pub channels: Option<u16>,
}

/// Device enumeration errors
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to enumerate devices: {0}")]
    EnumerationError(String),
}

/// List input devices, default first
pub fn list_input_devices() -> Result<Vec<InputDevice>, SourceError> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let devices = host
        .input_devices()
        .map_err(|e| SourceError::EnumerationError(e.to_string()))?;

    let mut listed = Vec::new();
    for device in devices {
        let Ok(name) = device.name() else {
            continue;
        };
        let config = match device.default_input_config() {
            Ok(config) => Some(config),
            Err(e) => {
                log::debug!("No default config for {}: {}", name, e);
                None
            }
        };
        listed.push(InputDevice {
            is_default: default_name.as_deref() == Some(name.as_str()),
            sample_rate: config.as_ref().map(|c| c.sample_rate().0),
            channels: config.as_ref().map(|c| c.channels()),
            name,
        });
    }

    sort_default_first(&mut listed);
    Ok(listed)
}

fn sort_default_first(devices: &mut [InputDevice]) {
    devices.sort_by_key(|d| !d.is_default);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str, is_default: bool) -> InputDevice {
        InputDevice {
            name: name.to_string(),
            is_default,
            sample_rate: Some(44100),
            channels: Some(1),
        }
    }

    #[test]
    fn default_device_sorts_first_and_order_is_otherwise_kept() {
        let mut devices = vec![device("a", false), device("b", false), device("mic", true)];
        sort_default_first(&mut devices);

        let names: Vec<&str> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["mic", "a", "b"]);
    }

    #[test]
    fn device_serializes_for_json_output() {
        let json = serde_json::to_value(device("mic", true)).unwrap();
        assert_eq!(json["name"], "mic");
        assert_eq!(json["is_default"], true);
        assert_eq!(json["sample_rate"], 44100);
    }
}
