use serde::{Deserialize, Serialize};
use std::hint;
use std::ops::Range;
use std::sync::atomic::{fence, AtomicU64, Ordering};

use crate::error::TakeError;

/// Frame interval `[start_frame, end_frame)` kept during a punch-in take
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunchWindow {
    pub start_frame: u64,
    pub end_frame: u64,
}

impl PunchWindow {
    pub fn new(start_frame: u64, end_frame: u64) -> Result<Self, TakeError> {
        if start_frame > end_frame {
            return Err(TakeError::InvalidRange {
                start: start_frame,
                end: end_frame,
            });
        }

        Ok(Self {
            start_frame,
            end_frame,
        })
    }

    /// Window from `start_frame` to the end of any take
    pub fn open_ended(start_frame: u64) -> Self {
        Self {
            start_frame,
            end_frame: u64::MAX,
        }
    }

    /// Build a window from trim markers expressed in seconds
    pub fn from_seconds(start: f64, end: f64, sample_rate: u32) -> Result<Self, TakeError> {
        let to_frames = |seconds: f64| (seconds * sample_rate as f64).round();
        let (start_frames, end_frames) = (to_frames(start), to_frames(end));

        if !start_frames.is_finite() || !end_frames.is_finite() || start_frames < 0.0 {
            return Err(TakeError::InvalidRange {
                start: start_frames.max(0.0) as u64,
                end: end_frames.max(0.0) as u64,
            });
        }

        Self::new(start_frames as u64, end_frames.max(0.0) as u64)
    }

    pub fn contains(&self, frame: u64) -> bool {
        self.start_frame <= frame && frame < self.end_frame
    }

    /// Number of frames inside the window
    pub fn len(&self) -> u64 {
        self.end_frame - self.start_frame
    }

    pub fn is_empty(&self) -> bool {
        self.start_frame == self.end_frame
    }
}

/// Result of classifying a single frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    Recordable,
    Discarded,
}

/// Holds the current punch window for lock-free reads from the audio callback.
///
/// Writers are user trim actions on the control thread; the callback reads
/// the window once per block. Both markers sit behind a sequence counter that
/// is odd while a write is in progress, so a reader never sees one marker
/// from the old window and one from the new.
#[derive(Debug)]
pub struct PunchWindowTracker {
    sequence: AtomicU64,
    start: AtomicU64,
    end: AtomicU64,
}

impl PunchWindowTracker {
    /// Tracker with no window (record everything)
    pub fn new() -> Self {
        // start > end marks "no window"; valid windows never look like that
        Self {
            sequence: AtomicU64::new(0),
            start: AtomicU64::new(1),
            end: AtomicU64::new(0),
        }
    }

    /// Restrict recording to `[start_frame, end_frame)`
    pub fn set_window(&self, start_frame: u64, end_frame: u64) -> Result<PunchWindow, TakeError> {
        let window = PunchWindow::new(start_frame, end_frame)?;
        self.store(window.start_frame, window.end_frame);
        Ok(window)
    }

    /// Remove any restriction
    pub fn clear_window(&self) {
        self.store(1, 0);
    }

    fn store(&self, start: u64, end: u64) {
        // Claim the counter by making it odd
        let mut seq = self.sequence.load(Ordering::Relaxed);
        loop {
            if seq % 2 == 1 {
                hint::spin_loop();
                seq = self.sequence.load(Ordering::Relaxed);
                continue;
            }
            match self.sequence.compare_exchange_weak(
                seq,
                seq + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => seq = current,
            }
        }
        fence(Ordering::Release);

        self.start.store(start, Ordering::Relaxed);
        self.end.store(end, Ordering::Relaxed);
        self.sequence.store(seq + 2, Ordering::Release);
    }

    /// Snapshot of the current window (audio-thread safe)
    pub fn window(&self) -> Option<PunchWindow> {
        loop {
            let before = self.sequence.load(Ordering::Acquire);
            if before % 2 == 1 {
                hint::spin_loop();
                continue;
            }

            let start_frame = self.start.load(Ordering::Relaxed);
            let end_frame = self.end.load(Ordering::Relaxed);
            fence(Ordering::Acquire);

            if self.sequence.load(Ordering::Relaxed) == before {
                return (start_frame <= end_frame).then_some(PunchWindow {
                    start_frame,
                    end_frame,
                });
            }
        }
    }

    /// Classify one frame position (audio-thread safe)
    pub fn classify(&self, frame: u64) -> FrameClass {
        match self.window() {
            Some(window) if !window.contains(frame) => FrameClass::Discarded,
            _ => FrameClass::Recordable,
        }
    }

    /// Recordable part of a block starting at `block_start`, as frame offsets
    /// into the block. Same answer as calling `classify` on every frame.
    pub fn recordable_range(&self, block_start: u64, frames: usize) -> Range<usize> {
        recordable_range(self.window(), block_start, frames)
    }
}

impl Default for PunchWindowTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Intersect a block with an optional window in constant time
pub fn recordable_range(window: Option<PunchWindow>, block_start: u64, frames: usize) -> Range<usize> {
    let Some(window) = window else {
        return 0..frames;
    };

    let block_end = block_start + frames as u64;
    let lo = window.start_frame.max(block_start);
    let hi = window.end_frame.min(block_end);

    if lo >= hi {
        return 0..0;
    }

    (lo - block_start) as usize..(hi - block_start) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_window_records_everything() {
        let tracker = PunchWindowTracker::new();
        assert_eq!(tracker.window(), None);
        for frame in [0, 1, 99, 1_000_000, u64::MAX] {
            assert_eq!(tracker.classify(frame), FrameClass::Recordable);
        }
    }

    #[test]
    fn test_window_boundaries() {
        let tracker = PunchWindowTracker::new();
        tracker.set_window(100, 200).unwrap();

        assert_eq!(tracker.classify(99), FrameClass::Discarded);
        assert_eq!(tracker.classify(100), FrameClass::Recordable);
        assert_eq!(tracker.classify(199), FrameClass::Recordable);
        assert_eq!(tracker.classify(200), FrameClass::Discarded);
    }

    #[test]
    fn test_invalid_range_rejected() {
        let tracker = PunchWindowTracker::new();
        tracker.set_window(10, 20).unwrap();

        let result = tracker.set_window(300, 200);
        assert!(matches!(
            result,
            Err(TakeError::InvalidRange { start: 300, end: 200 })
        ));
        // Previous window untouched
        assert_eq!(tracker.window(), Some(PunchWindow::new(10, 20).unwrap()));
    }

    #[test]
    fn test_empty_window_discards_everything() {
        let tracker = PunchWindowTracker::new();
        tracker.set_window(50, 50).unwrap();
        assert_eq!(tracker.classify(49), FrameClass::Discarded);
        assert_eq!(tracker.classify(50), FrameClass::Discarded);
        assert_eq!(tracker.recordable_range(0, 128), 0..0);
    }

    #[test]
    fn test_clear_window() {
        let tracker = PunchWindowTracker::new();
        tracker.set_window(0, 0).unwrap();
        assert_eq!(tracker.classify(5), FrameClass::Discarded);

        tracker.clear_window();
        assert_eq!(tracker.window(), None);
        assert_eq!(tracker.classify(5), FrameClass::Recordable);
    }

    #[test]
    fn test_window_beyond_u32_frames() {
        // Seven hours at 192kHz
        let end = 7 * 3600 * 192_000u64;
        assert!(end > u32::MAX as u64);

        let tracker = PunchWindowTracker::new();
        let window = tracker.set_window(0, end).unwrap();
        assert_eq!(tracker.window(), Some(window));
        assert_eq!(tracker.classify(u32::MAX as u64 + 1), FrameClass::Recordable);
        assert_eq!(tracker.classify(end - 1), FrameClass::Recordable);
        assert_eq!(tracker.classify(end), FrameClass::Discarded);

        let open = PunchWindow::open_ended(480);
        tracker.set_window(open.start_frame, open.end_frame).unwrap();
        assert_eq!(tracker.classify(u64::MAX - 1), FrameClass::Recordable);
        assert_eq!(tracker.recordable_range(u32::MAX as u64, 64), 0..64);
    }

    #[test]
    fn test_reader_sees_whole_windows() {
        use std::sync::Arc;
        use std::thread;

        let tracker = Arc::new(PunchWindowTracker::new());
        let writer = {
            let tracker = tracker.clone();
            thread::spawn(move || {
                for i in 0..10_000u64 {
                    // Every window written has end == start + 100
                    tracker.set_window(i << 20, (i << 20) + 100).unwrap();
                    if i % 7 == 0 {
                        tracker.clear_window();
                    }
                }
            })
        };

        for _ in 0..10_000 {
            if let Some(window) = tracker.window() {
                assert_eq!(window.len(), 100);
            }
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_recordable_range_matches_classify() {
        let tracker = PunchWindowTracker::new();
        tracker.set_window(100, 200).unwrap();

        for block_start in (0..320u64).step_by(37) {
            let frames = 64;
            let range = tracker.recordable_range(block_start, frames);
            for offset in 0..frames {
                let expected = tracker.classify(block_start + offset as u64) == FrameClass::Recordable;
                assert_eq!(range.contains(&offset), expected, "block {} offset {}", block_start, offset);
            }
        }
    }

    #[test]
    fn test_from_seconds() {
        let window = PunchWindow::from_seconds(1.5, 2.0, 48000).unwrap();
        assert_eq!(window.start_frame, 72000);
        assert_eq!(window.end_frame, 96000);
        assert_eq!(window.len(), 24000);

        assert!(PunchWindow::from_seconds(-1.0, 2.0, 48000).is_err());
        assert!(PunchWindow::from_seconds(3.0, 2.0, 48000).is_err());
        assert!(PunchWindow::from_seconds(0.0, f64::NAN, 48000).is_err());
    }
}
