use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::codec::{ExportFormat, SampleDepth};
use crate::session::PunchWindow;
use crate::store::{StoreOptions, TakeFormat};
use crate::types::{CHANNELS, RING_BUFFER_SECONDS, SAMPLE_RATE};

/// Top-level configuration structure
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub devices: DeviceConfig,

    #[serde(default)]
    pub recording: RecordingConfig,

    #[serde(default)]
    pub punch: PunchConfig,

    #[serde(default)]
    pub backing: Option<BackingConfig>,

    #[serde(default)]
    pub export: ExportConfig,
}

/// Device configuration
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub audio: Option<String>,
    pub monitorch: Option<String>,
}

/// Capture settings
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub sample_rate: u32,
    pub channels: u16,

    /// Take ring buffer size in seconds
    pub ring_seconds: usize,

    pub input_gain: f32,

    /// Mix the input into the monitor output
    pub monitor_input: bool,

    /// Where takes and the take index live
    pub takes_dir: PathBuf,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            ring_seconds: RING_BUFFER_SECONDS,
            input_gain: 1.0,
            monitor_input: false,
            takes_dir: PathBuf::from("takes"),
        }
    }
}

/// Trim markers in seconds from the start of a take
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct PunchConfig {
    pub start: Option<f64>,
    pub end: Option<f64>,
}

/// Track played while recording
#[derive(Debug, Deserialize, Serialize)]
pub struct BackingConfig {
    pub file: PathBuf,

    #[serde(default)]
    pub level: Option<f32>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ExportConfig {
    #[serde(default)]
    pub format: Option<ExportFormat>,

    #[serde(default)]
    pub depth: Option<SampleDepth>,
}

impl Config {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse and validate configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content).context("Failed to parse YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        // Validate monitor channels format if present
        if let Some(ref monitorch) = self.devices.monitorch {
            validate_monitor_channels(monitorch)?;
        }

        let recording = &self.recording;
        if !(8000..=192_000).contains(&recording.sample_rate) {
            anyhow::bail!(
                "Sample rate must be between 8000 and 192000 Hz, got {}",
                recording.sample_rate
            );
        }

        if recording.channels < 1 {
            anyhow::bail!("Channels must be >= 1, got {}", recording.channels);
        }

        if recording.ring_seconds < 1 {
            anyhow::bail!("Ring buffer must hold at least 1 second, got {}", recording.ring_seconds);
        }

        if !(0.0..=1.0).contains(&recording.input_gain) {
            anyhow::bail!(
                "Input gain must be between 0.0 and 1.0, got {}",
                recording.input_gain
            );
        }

        if let Some(ref backing) = self.backing {
            if let Some(level) = backing.level {
                if !(0.0..=1.0).contains(&level) {
                    anyhow::bail!("Backing level must be between 0.0 and 1.0, got {}", level);
                }
            }
        }

        self.punch_window()?;
        Ok(())
    }

    /// Store settings for the configured capture format
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            format: TakeFormat::new(self.recording.sample_rate, self.recording.channels),
            ring_seconds: self.recording.ring_seconds,
        }
    }

    /// Punch window from the configured trim markers. A missing start means
    /// the beginning of the take; a missing end means as late as possible.
    pub fn punch_window(&self) -> Result<Option<PunchWindow>> {
        parse_punch(self.punch.start, self.punch.end, self.recording.sample_rate)
    }
}

/// Build a punch window from optional trim markers in seconds
pub fn parse_punch(start: Option<f64>, end: Option<f64>, sample_rate: u32) -> Result<Option<PunchWindow>> {
    if start.is_none() && end.is_none() {
        return Ok(None);
    }

    let start = start.unwrap_or(0.0);
    if start < 0.0 {
        anyhow::bail!("Punch start must be >= 0, got {}", start);
    }

    let window = match end {
        Some(end) => PunchWindow::from_seconds(start, end, sample_rate)?,
        None => PunchWindow::open_ended((start * sample_rate as f64).round() as u64),
    };
    Ok(Some(window))
}

/// Parse a punch window given on the command line as START-END in seconds
/// (e.g. "12.5-20", "-30", "8-")
pub fn parse_punch_arg(arg: &str, sample_rate: u32) -> Result<Option<PunchWindow>> {
    let (start, end) = arg
        .split_once('-')
        .with_context(|| format!("Invalid punch window '{}'. Expected START-END in seconds", arg))?;

    let parse = |part: &str| -> Result<Option<f64>> {
        let part = part.trim();
        if part.is_empty() {
            return Ok(None);
        }
        part.parse::<f64>()
            .map(Some)
            .with_context(|| format!("Invalid punch time '{}'", part))
    };

    parse_punch(parse(start)?, parse(end)?, sample_rate)
}

/// Validate monitor channels format (START-END)
pub fn validate_monitor_channels(channels_str: &str) -> Result<(u16, u16)> {
    let parts: Vec<&str> = channels_str.split('-').collect();
    if parts.len() != 2 {
        anyhow::bail!(
            "Invalid monitor channels format '{}'. Expected format: START-END (e.g., '17-18')",
            channels_str
        );
    }

    let start = parts[0]
        .parse::<u16>()
        .with_context(|| format!("Invalid start channel '{}'", parts[0]))?;
    let end = parts[1]
        .parse::<u16>()
        .with_context(|| format!("Invalid end channel '{}'", parts[1]))?;

    if start < 1 {
        anyhow::bail!("Start channel must be >= 1, got {}", start);
    }

    if end < start {
        anyhow::bail!("End channel {} must be >= start channel {}", end, start);
    }

    if end - start + 1 != 2 {
        anyhow::bail!(
            "Monitor channels must be exactly 2 channels (stereo), got {} channels",
            end - start + 1
        );
    }

    Ok((start, end))
}
