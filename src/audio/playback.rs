use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::codec::decode_wav;
use crate::error::TakeError;
use crate::types::AtomicF32;

/// Backing track played while recording.
///
/// Rendering is addressed by clock frame rather than an internal play head,
/// so playback stays in lockstep with whatever advances the session clock.
#[derive(Debug)]
pub struct BackingTrack {
    /// Audio samples loaded into memory (interleaved for stereo)
    samples: Vec<f32>,

    /// Number of channels (1 = mono, 2 = stereo)
    channels: u16,

    sample_rate: u32,

    /// Track level (0.0 - 1.0)
    level: AtomicF32,

    muted: AtomicBool,
}

impl BackingTrack {
    /// Load a WAV file from disk
    pub fn load_wav_file(filepath: &Path, target_sample_rate: u32) -> Result<Self, TakeError> {
        let (format, samples) = decode_wav(filepath)?;

        // Validate sample rate matches target
        if format.sample_rate != target_sample_rate {
            return Err(TakeError::Storage(format!(
                "Sample rate mismatch: file '{}' is {}Hz, expected {}Hz",
                filepath.display(),
                format.sample_rate,
                target_sample_rate
            )));
        }

        // Validate channel count (mono or stereo only)
        if format.channels != 1 && format.channels != 2 {
            return Err(TakeError::Storage(format!(
                "Unsupported channel count: file '{}' has {} channels, expected 1 or 2",
                filepath.display(),
                format.channels
            )));
        }

        Ok(Self::from_samples(samples, format.channels, format.sample_rate))
    }

    pub fn from_samples(samples: Vec<f32>, channels: u16, sample_rate: u32) -> Self {
        Self {
            samples,
            channels: channels.max(1),
            sample_rate,
            level: AtomicF32::new(1.0),
            muted: AtomicBool::new(false),
        }
    }

    /// Get number of frames in the audio file
    pub fn num_frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Interleaved samples at unity level
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Get level (audio-thread safe)
    pub fn get_level(&self) -> f32 {
        self.level.load(Ordering::Relaxed)
    }

    /// Set level (0.0 - 1.0)
    pub fn set_level(&self, level: f32) {
        self.level.store(level.clamp(0.0, 1.0), Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    /// Mix the track into a stereo interleaved buffer starting at clock
    /// position `frame` (audio-thread safe). Past the end of the file
    /// nothing is added.
    pub fn render_stereo(&self, frame: u64, out: &mut [f32]) {
        if self.is_muted() {
            return;
        }

        let level = self.get_level();
        let total = self.num_frames() as u64;
        let channels = self.channels as usize;

        for (i, pair) in out.chunks_exact_mut(2).enumerate() {
            let position = frame + i as u64;
            if position >= total {
                break;
            }

            let base = position as usize * channels;
            let (left, right) = if channels == 1 {
                let s = self.samples[base];
                (s, s)
            } else {
                (self.samples[base], self.samples[base + 1])
            };

            pair[0] += left * level;
            pair[1] += right * level;
        }
    }
}
