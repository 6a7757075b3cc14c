use chrono::Local;
use hound::{WavSpec, WavWriter};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::codec::decode_wav;
use crate::error::TakeError;
use crate::store::take::{StorageRef, TakeFormat};

/// Sink for one in-progress take. Lives on the writer thread.
pub trait TakeWriter: Send {
    fn write(&mut self, samples: &[f32]) -> Result<(), TakeError>;

    fn flush(&mut self) -> Result<(), TakeError> {
        Ok(())
    }

    /// Close the sink and return where the audio now lives
    fn finalize(self: Box<Self>) -> Result<StorageRef, TakeError>;

    /// Close the sink and throw the audio away
    fn discard(self: Box<Self>) -> Result<(), TakeError>;
}

/// Storage for take audio
pub trait TakeBackend: Send + Sync {
    fn create(&self, name: &str, format: TakeFormat) -> Result<Box<dyn TakeWriter>, TakeError>;

    fn read(&self, storage: &StorageRef) -> Result<Vec<f32>, TakeError>;

    fn remove(&self, storage: &StorageRef) -> Result<(), TakeError>;
}

/// Turn a take name into something safe for a file name
pub(crate) fn file_stem(name: &str) -> String {
    let stem: String = name
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();

    if stem.is_empty() {
        "take".to_string()
    } else {
        stem
    }
}

/// Generate a timestamp for file naming
pub fn generate_timestamp() -> String {
    Local::now().format("%Y%m%d-%H%M%S").to_string()
}

/// Writes one 32-bit float WAV file per take into a project directory
#[derive(Debug, Clone)]
pub struct WavBackend {
    dir: PathBuf,
}

impl WavBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// First free `<timestamp>-<name>[-n].wav` file name in the directory
    fn unique_file_name(&self, name: &str) -> PathBuf {
        let base = format!("{}-{}", generate_timestamp(), file_stem(name));
        let mut file_name = PathBuf::from(format!("{}.wav", base));
        let mut n = 2;
        while self.dir.join(&file_name).exists() {
            file_name = PathBuf::from(format!("{}-{}.wav", base, n));
            n += 1;
        }
        file_name
    }

    /// Resolve a stored reference against the directory. References are
    /// relative so the directory can be moved; absolute ones are used as is.
    fn resolve(&self, path: &Path) -> PathBuf {
        self.dir.join(path)
    }
}

impl TakeBackend for WavBackend {
    fn create(&self, name: &str, format: TakeFormat) -> Result<Box<dyn TakeWriter>, TakeError> {
        fs::create_dir_all(&self.dir)?;

        let spec = WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };

        let file_name = self.unique_file_name(name);
        let path = self.dir.join(&file_name);
        let writer = WavWriter::create(&path, spec)?;
        debug!("Opened take file {}", path.display());

        Ok(Box::new(WavTakeWriter {
            writer,
            path,
            file_name,
        }))
    }

    fn read(&self, storage: &StorageRef) -> Result<Vec<f32>, TakeError> {
        match storage {
            StorageRef::File(path) => Ok(decode_wav(&self.resolve(path))?.1),
            StorageRef::Buffer(_) => Err(TakeError::Storage(format!(
                "{} is not a file take",
                storage
            ))),
        }
    }

    fn remove(&self, storage: &StorageRef) -> Result<(), TakeError> {
        let StorageRef::File(path) = storage else {
            return Err(TakeError::Storage(format!("{} is not a file take", storage)));
        };

        let path = self.resolve(path);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Take file {} was already gone", path.display());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

struct WavTakeWriter {
    writer: WavWriter<BufWriter<File>>,
    path: PathBuf,
    file_name: PathBuf,
}

impl TakeWriter for WavTakeWriter {
    fn write(&mut self, samples: &[f32]) -> Result<(), TakeError> {
        for &sample in samples {
            self.writer.write_sample(sample)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TakeError> {
        self.writer.flush()?;
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<StorageRef, TakeError> {
        let WavTakeWriter {
            writer, file_name, ..
        } = *self;
        writer.finalize()?;
        Ok(StorageRef::File(file_name))
    }

    fn discard(self: Box<Self>) -> Result<(), TakeError> {
        let WavTakeWriter { writer, path, .. } = *self;
        // Finalize errors don't matter, the file is removed either way
        let _ = writer.finalize();
        fs::remove_file(&path)?;
        Ok(())
    }
}

/// Keeps take audio in memory. Clones share the same buffers.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    buffers: Arc<Mutex<HashMap<u64, Arc<Vec<f32>>>>>,
    next_handle: Arc<AtomicU64>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live buffers
    pub fn len(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.lock().is_empty()
    }
}

impl TakeBackend for MemoryBackend {
    fn create(&self, _name: &str, _format: TakeFormat) -> Result<Box<dyn TakeWriter>, TakeError> {
        Ok(Box::new(MemoryTakeWriter {
            handle: self.next_handle.fetch_add(1, Ordering::Relaxed),
            samples: Vec::new(),
            buffers: self.buffers.clone(),
        }))
    }

    fn read(&self, storage: &StorageRef) -> Result<Vec<f32>, TakeError> {
        let StorageRef::Buffer(handle) = storage else {
            return Err(TakeError::Storage(format!("{} is not a buffer take", storage)));
        };

        self.buffers
            .lock()
            .get(handle)
            .map(|samples| samples.as_ref().clone())
            .ok_or_else(|| TakeError::Storage(format!("{} does not exist", storage)))
    }

    fn remove(&self, storage: &StorageRef) -> Result<(), TakeError> {
        if let StorageRef::Buffer(handle) = storage {
            self.buffers.lock().remove(handle);
        }
        Ok(())
    }
}

struct MemoryTakeWriter {
    handle: u64,
    samples: Vec<f32>,
    buffers: Arc<Mutex<HashMap<u64, Arc<Vec<f32>>>>>,
}

impl TakeWriter for MemoryTakeWriter {
    fn write(&mut self, samples: &[f32]) -> Result<(), TakeError> {
        self.samples.extend_from_slice(samples);
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<StorageRef, TakeError> {
        let MemoryTakeWriter {
            handle,
            samples,
            buffers,
        } = *self;
        buffers.lock().insert(handle, Arc::new(samples));
        Ok(StorageRef::Buffer(handle))
    }

    fn discard(self: Box<Self>) -> Result<(), TakeError> {
        Ok(())
    }
}
