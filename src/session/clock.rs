use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::error::TakeError;

/// Monotonic frame clock shared by the audio callback and the control thread.
///
/// `advance` is called from the realtime input callback and only touches
/// atomics. Readers on other threads get a consistent value from a single
/// atomic load.
#[derive(Debug)]
pub struct SessionClock {
    /// Frames elapsed since `start`
    frame: AtomicU64,

    /// Whether a session is running
    active: AtomicBool,

    /// Frames per second
    sample_rate: u32,
}

impl SessionClock {
    /// Create a stopped clock
    pub fn new(sample_rate: u32) -> Self {
        Self {
            frame: AtomicU64::new(0),
            active: AtomicBool::new(false),
            sample_rate,
        }
    }

    /// Reset the counter to zero and mark the session active
    pub fn start(&self) {
        self.frame.store(0, Ordering::Release);
        self.active.store(true, Ordering::Release);
    }

    /// Advance by `frames`, returning the new position (audio-thread safe)
    pub fn advance(&self, frames: u64) -> Result<u64, TakeError> {
        if !self.active.load(Ordering::Acquire) {
            return Err(TakeError::InvalidState("session clock is not running"));
        }

        Ok(self.frame.fetch_add(frames, Ordering::AcqRel) + frames)
    }

    /// Mark the session inactive and return the final frame count
    pub fn stop(&self) -> u64 {
        self.active.store(false, Ordering::Release);
        self.frame.load(Ordering::Acquire)
    }

    /// Current frame position (audio-thread safe)
    pub fn current_frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Wall time represented by the current position
    pub fn elapsed(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.current_frame() as f64 / self.sample_rate as f64)
    }

    /// Elapsed time as MM:SS for display
    pub fn format_elapsed(&self) -> String {
        let seconds = self.elapsed().as_secs();
        format!("{:02}:{:02}", seconds / 60, seconds % 60)
    }
}
