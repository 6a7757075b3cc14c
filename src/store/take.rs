use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Sequence number of a take, unique within a project
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TakeId(u64);

impl TakeId {
    pub const FIRST: TakeId = TakeId(1);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub(crate) fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for TakeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a take's audio lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageRef {
    /// WAV file on disk
    File(PathBuf),
    /// Handle into an in-memory backend
    Buffer(u64),
}

impl fmt::Display for StorageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageRef::File(path) => write!(f, "{}", path.display()),
            StorageRef::Buffer(handle) => write!(f, "buffer:{}", handle),
        }
    }
}

/// Sample layout of captured audio (interleaved f32)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl TakeFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Whole frames contained in `samples` interleaved samples
    pub fn frames_in(&self, samples: usize) -> usize {
        samples / self.channels.max(1) as usize
    }

    /// Interleaved samples needed to hold `seconds` of audio
    pub fn samples_for_seconds(&self, seconds: usize) -> usize {
        self.sample_rate as usize * seconds * self.channels as usize
    }
}

/// One committed recording. Immutable; rename and delete go through the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Take {
    id: TakeId,
    name: String,
    created_at: DateTime<Local>,
    sample_rate: u32,
    channels: u16,
    storage: StorageRef,
    duration_frames: u64,

    /// Clock frame of the first committed frame, for alignment with the backing track
    #[serde(default)]
    punch_in_frame: Option<u64>,
}

/// Everything a commit knows before the store assigns an id
#[derive(Debug, Clone)]
pub(crate) struct TakeDraft {
    pub name: String,
    pub format: TakeFormat,
    pub storage: StorageRef,
    pub duration_frames: u64,
    pub punch_in_frame: Option<u64>,
}

impl Take {
    pub(crate) fn from_draft(id: TakeId, draft: TakeDraft) -> Self {
        Self {
            id,
            name: draft.name,
            created_at: Local::now(),
            sample_rate: draft.format.sample_rate,
            channels: draft.format.channels,
            storage: draft.storage,
            duration_frames: draft.duration_frames,
            punch_in_frame: draft.punch_in_frame,
        }
    }

    pub(crate) fn renamed(&self, name: String) -> Self {
        Self {
            name,
            ..self.clone()
        }
    }

    pub fn id(&self) -> TakeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> DateTime<Local> {
        self.created_at
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn format(&self) -> TakeFormat {
        TakeFormat::new(self.sample_rate, self.channels)
    }

    pub fn storage(&self) -> &StorageRef {
        &self.storage
    }

    pub fn duration_frames(&self) -> u64 {
        self.duration_frames
    }

    pub fn punch_in_frame(&self) -> Option<u64> {
        self.punch_in_frame
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.duration_frames as f64 / self.sample_rate as f64)
    }
}
