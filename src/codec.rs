use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::TakeError;
use crate::store::TakeFormat;

/// File formats a take can be exported to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Wav,
    Mp3,
    Flac,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Wav => "wav",
            ExportFormat::Mp3 => "mp3",
            ExportFormat::Flac => "flac",
        }
    }

    /// Guess the format from a file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ext.parse().ok())
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "wav" | "wave" => Ok(ExportFormat::Wav),
            "mp3" => Ok(ExportFormat::Mp3),
            "flac" => Ok(ExportFormat::Flac),
            other => Err(format!("Unknown export format '{}'. Expected wav, mp3 or flac", other)),
        }
    }
}

/// Bit depth used when writing WAV files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleDepth {
    Int16,
    Int24,
    #[default]
    Float32,
}

impl SampleDepth {
    fn spec(&self, format: TakeFormat) -> WavSpec {
        let (bits_per_sample, sample_format) = match self {
            SampleDepth::Int16 => (16, SampleFormat::Int),
            SampleDepth::Int24 => (24, SampleFormat::Int),
            SampleDepth::Float32 => (32, SampleFormat::Float),
        };

        WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample,
            sample_format,
        }
    }
}

/// Encodes interleaved f32 samples into a file. MP3/FLAC support plugs in
/// through this trait.
pub trait TakeEncoder: Send + Sync {
    fn encode(&self, samples: &[f32], format: TakeFormat, dest: &Path) -> Result<(), TakeError>;
}

/// WAV encoder backed by hound
#[derive(Debug, Clone, Copy, Default)]
pub struct WavEncoder {
    pub depth: SampleDepth,
}

impl WavEncoder {
    pub fn new(depth: SampleDepth) -> Self {
        Self { depth }
    }
}

impl TakeEncoder for WavEncoder {
    fn encode(&self, samples: &[f32], format: TakeFormat, dest: &Path) -> Result<(), TakeError> {
        let mut writer = WavWriter::create(dest, self.depth.spec(format))?;

        match self.depth {
            SampleDepth::Int16 => {
                for &sample in samples {
                    writer.write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
                }
            }
            SampleDepth::Int24 => {
                const MAX_24: f32 = 8_388_607.0;
                for &sample in samples {
                    writer.write_sample((sample.clamp(-1.0, 1.0) * MAX_24) as i32)?;
                }
            }
            SampleDepth::Float32 => {
                for &sample in samples {
                    writer.write_sample(sample)?;
                }
            }
        }

        writer.finalize()?;
        Ok(())
    }
}

/// Read a WAV file into interleaved f32 samples
pub fn decode_wav(path: &Path) -> Result<(TakeFormat, Vec<f32>), TakeError> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();
    let format = TakeFormat::new(spec.sample_rate, spec.channels);

    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader.samples::<f32>().collect::<Result<Vec<_>, _>>()?,
        SampleFormat::Int => {
            let bits = spec.bits_per_sample;
            if bits == 16 {
                reader
                    .samples::<i16>()
                    .map(|s| s.map(|v| v as f32 / i16::MAX as f32))
                    .collect::<Result<Vec<_>, _>>()?
            } else if bits == 24 || bits == 32 {
                let scale = ((1i64 << (bits - 1)) - 1) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<Vec<_>, _>>()?
            } else {
                return Err(TakeError::Storage(format!(
                    "Unsupported bit depth: file '{}' has {} bits per sample",
                    path.display(),
                    bits
                )));
            }
        }
    };

    Ok((format, samples))
}
