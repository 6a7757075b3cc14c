use thiserror::Error;

use crate::codec::ExportFormat;
use crate::store::TakeId;

/// Errors reported by the recording session, the take store and export.
///
/// Every variant is recoverable: after any of them the session is back in
/// `Idle` and no partial take has been written to the store.
#[derive(Debug, Error)]
pub enum TakeError {
    /// Operation is not valid for the current session state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Malformed punch window
    #[error("invalid punch window {start}..{end}")]
    InvalidRange { start: u64, end: u64 },

    /// A take is already in progress for this store
    #[error("a take is already being recorded")]
    AlreadyRecording,

    /// Commit with zero recordable frames
    #[error("no recordable frames were captured")]
    EmptyTake,

    /// Unknown take identifier
    #[error("take {0} not found")]
    NotFound(TakeId),

    /// Input device failed while recording
    #[error("audio input lost: {0}")]
    InputLost(String),

    /// The persistence path fell behind and samples were dropped
    #[error("take buffer overrun, {dropped} samples dropped")]
    BufferOverrun { dropped: u64 },

    /// No encoder registered for the requested export format
    #[error("no encoder available for {0}")]
    UnsupportedFormat(ExportFormat),

    /// Backend failure not covered by I/O or WAV errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wav(#[from] hound::Error),

    #[error("take index error: {0}")]
    Index(#[from] serde_yaml::Error),
}
