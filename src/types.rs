use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Default sample rate (Hz)
pub const SAMPLE_RATE: u32 = 48000;

/// Default number of captured channels
pub const CHANNELS: u16 = 2;

/// Buffer size requested from the device (frames)
pub const BUFFER_SIZE: u32 = 256;

/// Take ring buffer size in seconds
pub const RING_BUFFER_SECONDS: usize = 5;

/// Capacity of the command and event rings between the control thread and the audio callback
pub const COMMAND_QUEUE_SIZE: usize = 16;

/// Largest block the realtime recorder processes in one pass (frames).
/// Longer device buffers are split into several passes.
pub const MAX_BLOCK_FRAMES: usize = 4096;

/// Atomic float wrapper for real-time audio thread safety
#[derive(Debug)]
pub struct AtomicF32 {
    storage: AtomicU32,
}

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self {
            storage: AtomicU32::new(value.to_bits()),
        }
    }

    pub fn load(&self, ordering: Ordering) -> f32 {
        f32::from_bits(self.storage.load(ordering))
    }

    pub fn store(&self, value: f32, ordering: Ordering) {
        self.storage.store(value.to_bits(), ordering);
    }
}

/// Recording session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Recording,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Recording => write!(f, "recording"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_f32_roundtrips_value() {
        let value = AtomicF32::new(0.25);
        assert_eq!(value.load(Ordering::Relaxed), 0.25);
        value.store(-1.5, Ordering::Relaxed);
        assert_eq!(value.load(Ordering::Relaxed), -1.5);
    }

    #[test]
    fn test_session_state_defaults_to_idle() {
        assert_eq!(SessionState::default(), SessionState::Idle);
        assert_eq!(SessionState::Recording.to_string(), "recording");
    }
}
