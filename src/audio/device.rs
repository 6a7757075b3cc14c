use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, Host, SupportedStreamConfig};
use log::warn;

use crate::store::TakeFormat;

/// Audio device information
#[derive(Debug, Clone)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub max_input_channels: usize,
    pub sample_rate: u32,
}

/// Get the default audio host
pub fn get_host() -> Host {
    cpal::default_host()
}

/// Get the default input device
pub fn get_default_input_device() -> Result<Device> {
    let host = get_host();
    host.default_input_device()
        .context("No default input device available")
}

fn device_name(device: &Device) -> Option<String> {
    device.description().ok().map(|desc| desc.name().to_string())
}

/// List all available input devices
pub fn list_input_devices() -> Result<Vec<AudioDeviceInfo>> {
    let host = get_host();
    let default_name = host.default_input_device().as_ref().and_then(device_name);

    let mut devices = Vec::new();

    for device in host.input_devices()? {
        let Some(name) = device_name(&device) else {
            continue;
        };
        let is_default = Some(&name) == default_name.as_ref();

        let (max_input_channels, sample_rate) = match device.default_input_config() {
            Ok(cfg) => (cfg.channels() as usize, cfg.sample_rate()),
            Err(_) => (0, 0),
        };

        devices.push(AudioDeviceInfo {
            name,
            is_default,
            max_input_channels,
            sample_rate,
        });
    }

    Ok(devices)
}

/// Resolve a device string (index or case-insensitive name fragment)
pub fn resolve_input_device(device_str: &str) -> Result<Device> {
    let host = get_host();
    let devices: Vec<Device> = host.input_devices()?.collect();

    // Try to parse as index first
    if let Ok(index) = device_str.parse::<usize>() {
        return devices.get(index).cloned().with_context(|| {
            format!(
                "Device index {} out of range (found {} devices)",
                index,
                devices.len()
            )
        });
    }

    let wanted = device_str.to_lowercase();
    devices
        .into_iter()
        .find(|device| {
            device_name(device)
                .map(|name| name.to_lowercase().contains(&wanted))
                .unwrap_or(false)
        })
        .with_context(|| format!("Audio device '{}' not found", device_str))
}

/// Pick the capture format: the requested rate and channel count when the
/// device supports them, otherwise the device default
pub fn input_format(device: &Device, sample_rate: u32, channels: u16) -> Result<TakeFormat> {
    if let Ok(configs) = device.supported_input_configs() {
        for range in configs {
            if range.channels() == channels
                && range.min_sample_rate() <= sample_rate
                && sample_rate <= range.max_sample_rate()
            {
                return Ok(TakeFormat::new(sample_rate, channels));
            }
        }
    }

    let fallback = device
        .default_input_config()
        .context("Failed to get default input config")?;
    warn!(
        "Device does not support {}ch @ {}Hz, using {}ch @ {}Hz",
        channels,
        sample_rate,
        fallback.channels(),
        fallback.sample_rate()
    );
    Ok(TakeFormat::new(fallback.sample_rate(), fallback.channels()))
}

/// Get the output configuration with the maximum number of channels
/// Falls back to default config if unable to query supported configs
pub fn get_max_channels_output_config(device: &Device, desired_rate: u32) -> Result<SupportedStreamConfig> {
    match device.supported_output_configs() {
        Ok(configs) => {
            let mut max_config: Option<SupportedStreamConfig> = None;
            let mut max_channels: u16 = 0;

            for config_range in configs {
                let channels = config_range.channels();
                if channels > max_channels {
                    max_channels = channels;
                    // Prefer the capture rate so both streams share one clock domain
                    let sample_rate = if config_range.min_sample_rate() <= desired_rate
                        && desired_rate <= config_range.max_sample_rate()
                    {
                        desired_rate
                    } else {
                        config_range.min_sample_rate()
                    };
                    max_config = Some(config_range.with_sample_rate(sample_rate));
                }
            }

            max_config.context("No supported output configurations found")
        }
        Err(_) => device
            .default_output_config()
            .context("Failed to get default output config"),
    }
}
