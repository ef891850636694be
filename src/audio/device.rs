//! Audio device enumeration and lookup

use cpal::traits::{DeviceTrait, HostTrait};

use crate::error::AudioError;

/// Description of one audio endpoint
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    pub channels: Vec<u16>,
}

/// List all available audio devices
pub fn list_devices() -> Vec<DeviceInfo> {
    let host = cpal::default_host();
    let mut devices: Vec<DeviceInfo> = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(inputs) = host.input_devices() {
        for device in inputs {
            if let Ok(name) = device.name() {
                let channels = device
                    .supported_input_configs()
                    .map(|configs| configs.map(|c| c.channels()).collect())
                    .unwrap_or_default();
                devices.push(DeviceInfo {
                    is_default: default_input_name.as_ref() == Some(&name),
                    name,
                    is_input: true,
                    is_output: false,
                    channels,
                });
            }
        }
    }

    if let Ok(outputs) = host.output_devices() {
        for device in outputs {
            if let Ok(name) = device.name() {
                let is_default = default_output_name.as_ref() == Some(&name);

                // Same endpoint seen as input already
                if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                    existing.is_output = true;
                    existing.is_default |= is_default;
                    continue;
                }

                let channels = device
                    .supported_output_configs()
                    .map(|configs| configs.map(|c| c.channels()).collect())
                    .unwrap_or_default();
                devices.push(DeviceInfo {
                    name,
                    is_input: false,
                    is_output: true,
                    is_default,
                    channels,
                });
            }
        }
    }

    for device in &mut devices {
        device.channels.sort_unstable();
        device.channels.dedup();
    }
    devices
}

/// Input device by name, or the default one
pub fn input_device(name: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default input device".to_string())),
        Some(name) => host
            .input_devices()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| AudioError::DeviceNotFound(name.to_string())),
    }
}

/// Output device by name, or the default one
pub fn output_device(name: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string())),
        Some(name) => host
            .output_devices()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| AudioError::DeviceNotFound(name.to_string())),
    }
}
