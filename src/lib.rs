//! Take management and punch-in recording.
//!
//! A [`SessionClock`] counts frames while a take runs, a
//! [`PunchWindowTracker`] decides which of those frames are kept, and a
//! [`TakeStore`] holds the committed takes of one project. The [`audio`]
//! module connects them to a cpal device.

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod export;
pub mod session;
pub mod store;
pub mod types;

pub use codec::{ExportFormat, SampleDepth, TakeEncoder, WavEncoder};
pub use error::TakeError;
pub use export::{Exporter, MixSettings, TakeMix};
pub use session::{
    CommandOutcome, FrameClass, PunchWindow, PunchWindowTracker, RecordingSession,
    SessionClock, SessionCommand,
};
pub use store::{StoreOptions, Take, TakeBuilder, TakeFormat, TakeId, TakeStore};
pub use types::SessionState;
