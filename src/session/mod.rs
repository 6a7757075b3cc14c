//! Punch-in recording session: clock, punch window and the Idle/Recording
//! state machine over a take store.

pub mod clock;
pub mod punch;

pub use clock::SessionClock;
pub use punch::{FrameClass, PunchWindow, PunchWindowTracker};

use log::{info, warn};
use std::sync::Arc;

use crate::error::TakeError;
use crate::store::{Take, TakeBuilder, TakeId, TakeStore};
use crate::types::SessionState;

/// Timestamp one block against the clock, keep its recordable frames and
/// append them to the take. Returns the number of frames kept.
///
/// Only touches atomics and the take's ring, so the realtime callback and
/// the offline session share it.
pub fn capture_block(
    clock: &SessionClock,
    punch: &PunchWindowTracker,
    take: &mut TakeBuilder,
    block: &[f32],
) -> Result<usize, TakeError> {
    let channels = take.format().channels.max(1) as usize;
    let frames = block.len() / channels;

    let block_start = clock.current_frame();
    clock.advance(frames as u64)?;

    let range = punch.recordable_range(block_start, frames);
    if range.is_empty() {
        return Ok(0);
    }

    take.append_at(
        block_start + range.start as u64,
        &block[range.start * channels..range.end * channels],
    )
}

/// User actions as explicit command objects
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    BeginTake { name: String },
    Commit,
    Abort,
    SetWindow { start_frame: u64, end_frame: u64 },
    ClearWindow,
    Rename { id: TakeId, name: String },
    Delete { id: TakeId },
}

/// What a successfully executed command did
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Started,
    Committed(Take),
    Aborted,
    WindowSet(PunchWindow),
    WindowCleared,
    Renamed(Take),
    Deleted(Take),
}

/// One project's recording session.
///
/// Blocks are delivered by the caller with `append`; this is the
/// consumer-side counterpart of the realtime recorder and is what offline
/// tools and tests drive directly.
pub struct RecordingSession {
    clock: Arc<SessionClock>,
    punch: Arc<PunchWindowTracker>,
    store: TakeStore,
    take: Option<TakeBuilder>,
}

impl RecordingSession {
    pub fn new(store: TakeStore) -> Self {
        let clock = Arc::new(SessionClock::new(store.format().sample_rate));
        Self::with_shared(clock, Arc::new(PunchWindowTracker::new()), store)
    }

    /// Session over a clock and tracker shared with other components
    pub fn with_shared(
        clock: Arc<SessionClock>,
        punch: Arc<PunchWindowTracker>,
        store: TakeStore,
    ) -> Self {
        Self {
            clock,
            punch,
            store,
            take: None,
        }
    }

    pub fn state(&self) -> SessionState {
        if self.take.is_some() {
            SessionState::Recording
        } else {
            SessionState::Idle
        }
    }

    pub fn clock(&self) -> &Arc<SessionClock> {
        &self.clock
    }

    pub fn punch(&self) -> &Arc<PunchWindowTracker> {
        &self.punch
    }

    pub fn store(&self) -> &TakeStore {
        &self.store
    }

    /// `Idle -> Recording`
    pub fn begin_take(&mut self, name: impl Into<String>) -> Result<(), TakeError> {
        if self.take.is_some() {
            return Err(TakeError::AlreadyRecording);
        }

        let builder = self.store.begin_take(name)?;
        self.clock.start();
        self.take = Some(builder);
        Ok(())
    }

    /// Deliver one interleaved block. Only valid while recording.
    ///
    /// An overrun aborts the take and returns the session to `Idle`.
    pub fn append(&mut self, block: &[f32]) -> Result<usize, TakeError> {
        let Some(take) = self.take.as_mut() else {
            return Err(TakeError::InvalidState("append requires a take in progress"));
        };

        match capture_block(&self.clock, &self.punch, take, block) {
            Err(e @ TakeError::BufferOverrun { .. }) => {
                self.abort_take();
                Err(e)
            }
            result => result,
        }
    }

    /// `Recording -> Idle`, committing the take
    pub fn commit(&mut self) -> Result<Take, TakeError> {
        let take = self
            .take
            .take()
            .ok_or(TakeError::InvalidState("no take in progress"))?;

        let final_frame = self.clock.stop();
        let name = take.name().to_string();
        let result = take.commit();
        if let Err(e) = &result {
            info!("Take '{}' not committed after {} frames: {}", name, final_frame, e);
        }
        result
    }

    /// `Recording -> Idle`, discarding the take
    pub fn abort(&mut self) -> Result<(), TakeError> {
        if self.take.is_none() {
            return Err(TakeError::InvalidState("no take in progress"));
        }
        self.abort_take();
        Ok(())
    }

    fn abort_take(&mut self) {
        if let Some(take) = self.take.take() {
            self.clock.stop();
            take.abort();
        }
    }

    /// Report a lost input device. While recording, the take is aborted and
    /// `InputLost` is returned; when idle there is nothing to report.
    pub fn input_lost(&mut self, reason: impl Into<String>) -> Result<(), TakeError> {
        if self.take.is_none() {
            return Ok(());
        }

        let reason = reason.into();
        warn!("Input lost while recording: {}", reason);
        self.abort_take();
        Err(TakeError::InputLost(reason))
    }

    pub fn set_window(&self, start_frame: u64, end_frame: u64) -> Result<PunchWindow, TakeError> {
        self.punch.set_window(start_frame, end_frame)
    }

    pub fn clear_window(&self) {
        self.punch.clear_window();
    }

    pub fn window(&self) -> Option<PunchWindow> {
        self.punch.window()
    }

    pub fn current_frame(&self) -> u64 {
        self.clock.current_frame()
    }

    /// Frames captured into the take in progress
    pub fn recorded_frames(&self) -> Option<u64> {
        self.take.as_ref().map(|take| take.frames())
    }

    /// Run one user command
    pub fn execute(&mut self, command: SessionCommand) -> Result<CommandOutcome, TakeError> {
        match command {
            SessionCommand::BeginTake { name } => {
                self.begin_take(name)?;
                Ok(CommandOutcome::Started)
            }
            SessionCommand::Commit => self.commit().map(CommandOutcome::Committed),
            SessionCommand::Abort => {
                self.abort()?;
                Ok(CommandOutcome::Aborted)
            }
            SessionCommand::SetWindow {
                start_frame,
                end_frame,
            } => self
                .set_window(start_frame, end_frame)
                .map(CommandOutcome::WindowSet),
            SessionCommand::ClearWindow => {
                self.clear_window();
                Ok(CommandOutcome::WindowCleared)
            }
            SessionCommand::Rename { id, name } => {
                self.store.rename(id, name).map(CommandOutcome::Renamed)
            }
            SessionCommand::Delete { id } => self.store.delete(id).map(CommandOutcome::Deleted),
        }
    }
}
