//! Stems and mixdown export through pluggable encoders.

use log::info;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::audio::BackingTrack;
use crate::codec::{ExportFormat, TakeEncoder, WavEncoder};
use crate::error::TakeError;
use crate::store::backend::file_stem;
use crate::store::{TakeFormat, TakeId, TakeStore};

/// Per-take mix settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TakeMix {
    pub gain: f32,
    pub muted: bool,
}

impl Default for TakeMix {
    fn default() -> Self {
        Self {
            gain: 1.0,
            muted: false,
        }
    }
}

/// Limit a mix gain to 0.0 - 1.0. NaN counts as silence.
pub fn clamp_gain(gain: f32) -> f32 {
    if gain.is_nan() {
        0.0
    } else {
        gain.clamp(0.0, 1.0)
    }
}

/// Mixdown settings. Takes without an entry play at unity gain. Gains are
/// limited to 0.0 - 1.0 when the mix is built.
#[derive(Debug, Clone)]
pub struct MixSettings {
    pub master_gain: f32,
    pub takes: HashMap<TakeId, TakeMix>,

    /// Played from clock frame 0 at its own level
    pub backing: Option<Arc<BackingTrack>>,
}

impl Default for MixSettings {
    fn default() -> Self {
        Self {
            master_gain: 1.0,
            takes: HashMap::new(),
            backing: None,
        }
    }
}

impl MixSettings {
    pub fn take(&self, id: TakeId) -> TakeMix {
        self.takes.get(&id).copied().unwrap_or_default()
    }

    pub fn set_master_gain(&mut self, gain: f32) {
        self.master_gain = clamp_gain(gain);
    }

    pub fn set_gain(&mut self, id: TakeId, gain: f32) {
        self.takes.entry(id).or_default().gain = clamp_gain(gain);
    }

    pub fn set_muted(&mut self, id: TakeId, muted: bool) {
        self.takes.entry(id).or_default().muted = muted;
    }
}

/// Writes takes to files with whichever encoders are registered
pub struct Exporter {
    encoders: HashMap<ExportFormat, Box<dyn TakeEncoder>>,
}

impl Default for Exporter {
    fn default() -> Self {
        Self::new(WavEncoder::default())
    }
}

impl Exporter {
    /// Exporter with the given WAV encoder and nothing else
    pub fn new(wav: WavEncoder) -> Self {
        let mut encoders: HashMap<ExportFormat, Box<dyn TakeEncoder>> = HashMap::new();
        encoders.insert(ExportFormat::Wav, Box::new(wav));
        Self { encoders }
    }

    /// Add or replace the encoder for a format
    pub fn register(&mut self, format: ExportFormat, encoder: Box<dyn TakeEncoder>) {
        self.encoders.insert(format, encoder);
    }

    pub fn supports(&self, format: ExportFormat) -> bool {
        self.encoders.contains_key(&format)
    }

    fn encoder(&self, format: ExportFormat) -> Result<&dyn TakeEncoder, TakeError> {
        self.encoders
            .get(&format)
            .map(|encoder| encoder.as_ref())
            .ok_or(TakeError::UnsupportedFormat(format))
    }

    /// Export one take. `dest` gets the format's extension if it has none.
    pub fn export_take(
        &self,
        store: &TakeStore,
        id: TakeId,
        dest: &Path,
        format: ExportFormat,
    ) -> Result<PathBuf, TakeError> {
        let encoder = self.encoder(format)?;
        let take = store.get(id).ok_or(TakeError::NotFound(id))?;
        let samples = store.read_samples(id)?;

        let dest = with_extension(dest, format);
        encoder.encode(&samples, take.format(), &dest)?;
        info!("Exported take {} to {}", id, dest.display());
        Ok(dest)
    }

    /// Export every take into `dir` as `<id>-<name>.<ext>`
    pub fn export_stems(
        &self,
        store: &TakeStore,
        dir: &Path,
        format: ExportFormat,
    ) -> Result<Vec<PathBuf>, TakeError> {
        let encoder = self.encoder(format)?;
        fs::create_dir_all(dir)?;

        let mut written = Vec::new();
        for take in &store.list() {
            let samples = store.read_samples(take.id())?;
            let dest = dir.join(format!(
                "{:02}-{}.{}",
                take.id().get(),
                file_stem(take.name()),
                format.extension()
            ));
            encoder.encode(&samples, take.format(), &dest)?;
            written.push(dest);
        }

        info!("Exported {} stems to {}", written.len(), dir.display());
        Ok(written)
    }

    /// Mix every take down and write the result to `dest`
    pub fn export_mix(
        &self,
        store: &TakeStore,
        settings: &MixSettings,
        dest: &Path,
        format: ExportFormat,
    ) -> Result<PathBuf, TakeError> {
        let encoder = self.encoder(format)?;
        let (mix_format, samples) = mixdown(store, settings)?;

        let dest = with_extension(dest, format);
        encoder.encode(&samples, mix_format, &dest)?;
        info!(
            "Exported mix of {} takes to {}",
            store.len(),
            dest.display()
        );
        Ok(dest)
    }
}

fn with_extension(dest: &Path, format: ExportFormat) -> PathBuf {
    if dest.extension().is_some() {
        dest.to_path_buf()
    } else {
        dest.with_extension(format.extension())
    }
}

/// Sum all takes into one buffer in the store's format. Each take starts at
/// its punch-in frame so it lines up with the backing track.
pub fn mixdown(store: &TakeStore, settings: &MixSettings) -> Result<(TakeFormat, Vec<f32>), TakeError> {
    let format = store.format();
    let channels = format.channels as usize;
    let mut mix: Vec<f32> = Vec::new();

    for take in &store.list() {
        if take.format() != format {
            return Err(TakeError::Storage(format!(
                "Take {} is {}ch @ {}Hz, mix is {}ch @ {}Hz",
                take.id(),
                take.channels(),
                take.sample_rate(),
                format.channels,
                format.sample_rate
            )));
        }

        let take_mix = settings.take(take.id());
        if take_mix.muted {
            continue;
        }

        let samples = store.read_samples(take.id())?;
        let offset = take.punch_in_frame().unwrap_or(0) as usize * channels;
        let end = offset + samples.len();
        if mix.len() < end {
            mix.resize(end, 0.0);
        }
        let gain = clamp_gain(take_mix.gain);
        for (dst, &src) in mix[offset..end].iter_mut().zip(&samples) {
            *dst += src * gain;
        }
    }

    if let Some(backing) = settings.backing.as_deref() {
        mix_backing(&mut mix, backing, format)?;
    }

    if mix.is_empty() {
        return Err(TakeError::InvalidState("nothing to mix"));
    }

    let master_gain = clamp_gain(settings.master_gain);
    if master_gain != 1.0 {
        for sample in mix.iter_mut() {
            *sample *= master_gain;
        }
    }

    Ok((format, mix))
}

/// Add the backing track, converting between mono and stereo as needed
fn mix_backing(mix: &mut Vec<f32>, backing: &BackingTrack, format: TakeFormat) -> Result<(), TakeError> {
    if backing.sample_rate() != format.sample_rate {
        return Err(TakeError::Storage(format!(
            "Backing track is {}Hz, mix is {}Hz",
            backing.sample_rate(),
            format.sample_rate
        )));
    }
    if backing.is_muted() {
        return Ok(());
    }

    let out_channels = format.channels as usize;
    let in_channels = backing.channels() as usize;
    let level = backing.get_level();
    let frames = backing.num_frames();

    if mix.len() < frames * out_channels {
        mix.resize(frames * out_channels, 0.0);
    }

    for (frame, source) in backing.samples().chunks_exact(in_channels).enumerate() {
        let mono = source.iter().sum::<f32>() / in_channels as f32;
        let dest = &mut mix[frame * out_channels..(frame + 1) * out_channels];
        for (ch, sample) in dest.iter_mut().enumerate() {
            let value = if in_channels == out_channels {
                source[ch]
            } else if in_channels == 1 {
                source[0]
            } else {
                mono
            };
            *sample += value * level;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_wav;
    use crate::store::StoreOptions;

    fn store(channels: u16) -> TakeStore {
        TakeStore::in_memory(StoreOptions {
            format: TakeFormat::new(1000, channels),
            ring_seconds: 1,
        })
    }

    fn record(store: &TakeStore, name: &str, at: u64, samples: &[f32]) -> TakeId {
        let mut take = store.begin_take(name).unwrap();
        take.append_at(at, samples).unwrap();
        take.commit().unwrap().id()
    }

    struct NullEncoder;

    impl TakeEncoder for NullEncoder {
        fn encode(&self, _samples: &[f32], _format: TakeFormat, dest: &Path) -> Result<(), TakeError> {
            fs::write(dest, b"")?;
            Ok(())
        }
    }

    #[test]
    fn test_mix_aligns_takes_by_punch_in() {
        let store = store(1);
        let first = record(&store, "first", 0, &[0.1, 0.1, 0.1]);
        let second = record(&store, "second", 2, &[0.2, 0.2]);

        let mut settings = MixSettings::default();
        settings.set_gain(second, 0.5);

        let (format, mix) = mixdown(&store, &settings).unwrap();
        assert_eq!(format, TakeFormat::new(1000, 1));
        let expected = [0.1, 0.1, 0.2, 0.1];
        assert_eq!(mix.len(), expected.len());
        for (got, want) in mix.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6);
        }

        settings.set_muted(first, true);
        settings.set_master_gain(0.5);
        let (_, mix) = mixdown(&store, &settings).unwrap();
        assert_eq!(mix.len(), 4);
        assert!((mix[0]).abs() < 1e-6);
        assert!((mix[3] - 0.05).abs() < 1e-6);
    }

    #[test]
    fn test_mix_gains_are_limited_to_unity() {
        let store = store(1);
        let take = record(&store, "loud", 0, &[0.4, -0.4]);

        let mut settings = MixSettings::default();
        settings.set_gain(take, 3.0);
        settings.set_master_gain(-2.0);
        assert_eq!(settings.take(take).gain, 1.0);
        assert_eq!(settings.master_gain, 0.0);

        // Fields set directly are limited when mixing
        settings.master_gain = 8.0;
        settings.takes.get_mut(&take).unwrap().gain = f32::NAN;
        let (_, mix) = mixdown(&store, &settings).unwrap();
        assert!(mix.iter().all(|s| *s == 0.0));

        settings.takes.get_mut(&take).unwrap().gain = 1.5;
        let (_, mix) = mixdown(&store, &settings).unwrap();
        assert_eq!(mix, vec![0.4, -0.4]);

        assert_eq!(clamp_gain(0.25), 0.25);
    }

    #[test]
    fn test_mix_includes_backing_track() {
        let store = store(2);
        record(&store, "vocal", 0, &[0.5, 0.5]);

        let backing = BackingTrack::from_samples(vec![0.25, 0.25], 1, 1000);
        backing.set_level(0.5);
        let settings = MixSettings {
            backing: Some(Arc::new(backing)),
            ..MixSettings::default()
        };

        let (_, mix) = mixdown(&store, &settings).unwrap();
        // Mono backing spread to both channels, two frames long
        let expected = [0.625, 0.625, 0.125, 0.125];
        assert_eq!(mix.len(), expected.len());
        for (got, want) in mix.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6);
        }
    }

    #[test]
    fn test_empty_mix_is_rejected() {
        let store = store(1);
        assert!(matches!(
            mixdown(&store, &MixSettings::default()),
            Err(TakeError::InvalidState(_))
        ));
    }

    #[test]
    fn test_export_stems_names_files_by_take() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(1);
        record(&store, "Take 1", 0, &[0.1; 10]);
        record(&store, "chorus/2", 0, &[0.2; 20]);

        let paths = Exporter::default()
            .export_stems(&store, &dir.path().join("stems"), ExportFormat::Wav)
            .unwrap();

        let names: Vec<_> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["01-Take_1.wav", "02-chorus_2.wav"]);

        let (format, samples) = decode_wav(&paths[1]).unwrap();
        assert_eq!(format, TakeFormat::new(1000, 1));
        assert_eq!(samples.len(), 20);
    }

    #[test]
    fn test_export_take_adds_extension() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(1);
        let id = record(&store, "solo", 0, &[0.3; 8]);

        let path = Exporter::default()
            .export_take(&store, id, &dir.path().join("solo"), ExportFormat::Wav)
            .unwrap();
        assert_eq!(path.extension().unwrap(), "wav");
        assert!(path.exists());

        assert!(matches!(
            Exporter::default().export_take(&store, TakeId::new(99), &path, ExportFormat::Wav),
            Err(TakeError::NotFound(_))
        ));
    }

    #[test]
    fn test_unregistered_format_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(1);
        let id = record(&store, "solo", 0, &[0.3; 8]);

        let mut exporter = Exporter::default();
        assert!(!exporter.supports(ExportFormat::Mp3));
        assert!(matches!(
            exporter.export_take(&store, id, &dir.path().join("solo"), ExportFormat::Mp3),
            Err(TakeError::UnsupportedFormat(ExportFormat::Mp3))
        ));

        exporter.register(ExportFormat::Mp3, Box::new(NullEncoder));
        let path = exporter
            .export_take(&store, id, &dir.path().join("solo"), ExportFormat::Mp3)
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "solo.mp3");
    }
}
