use log::{info, warn};
use rtrb::Producer;
use std::sync::Arc;

use crate::error::TakeError;
use crate::store::take::{Take, TakeDraft, TakeFormat};
use crate::store::writer::WriterHandle;
use crate::store::StoreShared;

/// An in-progress take.
///
/// `append` runs on the realtime path: it copies into a preallocated SPSC
/// ring and never blocks or allocates. A writer thread drains the ring into
/// the store's backend. `commit` and `abort` join that thread and must be
/// called from a non-realtime context.
pub struct TakeBuilder {
    name: String,
    format: TakeFormat,
    producer: Producer<f32>,
    writer: WriterHandle,
    store: Arc<StoreShared>,

    /// Whole frames pushed into the ring
    frames: u64,

    /// Clock frame of the first appended frame
    punch_in_frame: Option<u64>,

    /// Samples refused because the ring was full
    dropped: u64,

    finished: bool,
}

impl TakeBuilder {
    pub(crate) fn new(
        name: String,
        format: TakeFormat,
        producer: Producer<f32>,
        writer: WriterHandle,
        store: Arc<StoreShared>,
    ) -> Self {
        Self {
            name,
            format,
            producer,
            writer,
            store,
            frames: 0,
            punch_in_frame: None,
            dropped: 0,
            finished: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> TakeFormat {
        self.format
    }

    /// Frames appended so far
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn punch_in_frame(&self) -> Option<u64> {
        self.punch_in_frame
    }

    /// Whether samples have been dropped; such a take can no longer commit
    pub fn is_overrun(&self) -> bool {
        self.dropped > 0
    }

    /// Append interleaved recordable frames (audio-thread safe).
    ///
    /// Returns the number of frames appended. A trailing partial frame is
    /// ignored. If the ring cannot hold the whole block nothing is written,
    /// the take is marked overrun and `BufferOverrun` is returned.
    pub fn append(&mut self, samples: &[f32]) -> Result<usize, TakeError> {
        let frames = self.format.frames_in(samples.len());
        let len = frames * self.format.channels as usize;
        if len == 0 {
            return Ok(0);
        }

        if self.dropped > 0 {
            self.dropped += len as u64;
            return Err(TakeError::BufferOverrun {
                dropped: self.dropped,
            });
        }

        let mut chunk = match self.producer.write_chunk(len) {
            Ok(chunk) => chunk,
            Err(_) => {
                self.dropped += len as u64;
                return Err(TakeError::BufferOverrun {
                    dropped: self.dropped,
                });
            }
        };

        let (first, second) = chunk.as_mut_slices();
        let split = first.len();
        first.copy_from_slice(&samples[..split]);
        second.copy_from_slice(&samples[split..len]);
        chunk.commit_all();

        self.frames += frames as u64;
        Ok(frames)
    }

    /// Append frames that start at clock position `frame` (audio-thread safe)
    pub fn append_at(&mut self, frame: u64, samples: &[f32]) -> Result<usize, TakeError> {
        let appended = self.append(samples)?;
        if appended > 0 && self.punch_in_frame.is_none() {
            self.punch_in_frame = Some(frame);
        }
        Ok(appended)
    }

    /// Finalize into an immutable take with the next sequence id
    pub fn commit(mut self) -> Result<Take, TakeError> {
        self.finished = true;
        let result = self.finish_commit();
        self.store.release();
        result
    }

    fn finish_commit(&mut self) -> Result<Take, TakeError> {
        let outcome = self.writer.finish(false)?;

        if self.dropped > 0 || self.frames == 0 {
            if let Some(storage) = outcome.storage {
                if let Err(e) = self.store.backend.remove(&storage) {
                    warn!("Could not remove audio of rejected take '{}': {}", self.name, e);
                }
            }

            if self.dropped > 0 {
                warn!("Take '{}' overran its buffer, {} samples dropped", self.name, self.dropped);
                return Err(TakeError::BufferOverrun {
                    dropped: self.dropped,
                });
            }

            info!("Take '{}' captured no recordable frames", self.name);
            return Err(TakeError::EmptyTake);
        }

        let storage = outcome
            .storage
            .ok_or_else(|| TakeError::Storage("writer produced no storage".to_string()))?;

        let draft = TakeDraft {
            name: self.name.clone(),
            format: self.format,
            storage,
            duration_frames: self.frames,
            punch_in_frame: self.punch_in_frame,
        };

        self.store.insert(draft)
    }

    /// Discard the in-progress buffer without creating a take
    pub fn abort(mut self) {
        self.discard();
    }

    fn discard(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        if let Err(e) = self.writer.finish(true) {
            warn!("Failed to discard take '{}': {}", self.name, e);
        }
        self.store.release();
        info!("Aborted take '{}' after {} frames", self.name, self.frames);
    }
}

impl Drop for TakeBuilder {
    fn drop(&mut self) {
        self.discard();
    }
}

impl std::fmt::Debug for TakeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TakeBuilder")
            .field("name", &self.name)
            .field("format", &self.format)
            .field("frames", &self.frames)
            .field("punch_in_frame", &self.punch_in_frame)
            .field("dropped", &self.dropped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::error::TakeError;
    use crate::store::{StoreOptions, TakeFormat, TakeStore};

    fn mono_store(ring_seconds: usize, sample_rate: u32) -> TakeStore {
        TakeStore::in_memory(StoreOptions {
            format: TakeFormat::new(sample_rate, 1),
            ring_seconds,
        })
    }

    #[test]
    fn test_append_counts_whole_frames() {
        let store = TakeStore::in_memory(StoreOptions {
            format: TakeFormat::new(48000, 2),
            ring_seconds: 1,
        });
        let mut take = store.begin_take("stereo").unwrap();

        assert_eq!(take.append(&[0.1, 0.2, 0.3, 0.4, 0.5]).unwrap(), 2);
        assert_eq!(take.frames(), 2);

        let committed = take.commit().unwrap();
        assert_eq!(committed.duration_frames(), 2);
        assert_eq!(store.read_samples(committed.id()).unwrap(), vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn test_append_at_records_punch_in() {
        let store = mono_store(1, 48000);
        let mut take = store.begin_take("punch").unwrap();

        assert_eq!(take.append_at(10, &[]).unwrap(), 0);
        assert_eq!(take.punch_in_frame(), None);

        take.append_at(100, &[0.0; 4]).unwrap();
        take.append_at(104, &[0.0; 4]).unwrap();
        assert_eq!(take.punch_in_frame(), Some(100));

        let committed = take.commit().unwrap();
        assert_eq!(committed.punch_in_frame(), Some(100));
    }

    #[test]
    fn test_overrun_fails_commit() {
        // Ring holds 100 samples; a 200-sample block can never fit
        let store = mono_store(1, 100);
        let mut take = store.begin_take("too big").unwrap();

        let result = take.append(&[0.0; 200]);
        assert!(matches!(result, Err(TakeError::BufferOverrun { dropped: 200 })));
        assert!(take.is_overrun());

        // Later blocks are refused too, so nothing is silently truncated
        assert!(take.append(&[0.0; 10]).is_err());

        let result = take.commit();
        assert!(matches!(result, Err(TakeError::BufferOverrun { dropped: 210 })));
        assert!(store.is_empty());
        assert!(!store.is_recording());
    }

    #[test]
    fn test_drop_releases_store() {
        let store = mono_store(1, 48000);
        {
            let mut take = store.begin_take("dropped").unwrap();
            take.append(&[0.5; 16]).unwrap();
            assert!(store.is_recording());
        }
        assert!(!store.is_recording());
        assert!(store.is_empty());
        assert!(store.begin_take("next").is_ok());
    }
}
