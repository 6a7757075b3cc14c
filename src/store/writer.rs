use log::{debug, error, warn};
use parking_lot::Mutex;
use rtrb::Consumer;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::TakeError;
use crate::store::backend::TakeWriter;
use crate::store::take::StorageRef;

/// How often the writer flushes to disk for crash safety
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// What the writer thread left behind
#[derive(Debug)]
pub(crate) struct WriterOutcome {
    /// None when the take was discarded
    pub storage: Option<StorageRef>,
    pub samples_written: u64,
}

/// Persistence side of a take: a thread that drains the take ring into a
/// backend writer.
pub(crate) struct WriterHandle {
    running: Arc<AtomicBool>,
    discard: Arc<AtomicBool>,
    thread_handle: Option<WriterThread>,
}

type WriterThread = thread::JoinHandle<Result<WriterOutcome, TakeError>>;
type WriterJob = Box<dyn FnOnce() -> Result<WriterOutcome, TakeError> + Send>;

impl WriterHandle {
    /// Start the writer thread
    pub fn spawn(
        consumer: Consumer<f32>,
        writer: Box<dyn TakeWriter>,
        name: &str,
    ) -> Result<Self, TakeError> {
        let builder = thread::Builder::new().name(format!("take-writer-{}", name));
        Self::spawn_with(consumer, writer, |job| builder.spawn(job))
    }

    /// Start the writer on a thread made by `spawn_thread`. If no thread can
    /// be started the writer is discarded so nothing is left in storage.
    fn spawn_with<S>(
        consumer: Consumer<f32>,
        writer: Box<dyn TakeWriter>,
        spawn_thread: S,
    ) -> Result<Self, TakeError>
    where
        S: FnOnce(WriterJob) -> io::Result<WriterThread>,
    {
        let running = Arc::new(AtomicBool::new(true));
        let discard = Arc::new(AtomicBool::new(false));

        // The thread takes the writer out once it runs
        let slot = Arc::new(Mutex::new(Some(writer)));

        let job: WriterJob = {
            let running = running.clone();
            let discard = discard.clone();
            let slot = slot.clone();
            Box::new(move || {
                let writer = slot
                    .lock()
                    .take()
                    .ok_or(TakeError::InvalidState("take writer already taken"))?;
                run_take_writer(consumer, writer, &running, &discard)
            })
        };

        let thread_handle = match spawn_thread(job) {
            Ok(handle) => handle,
            Err(e) => {
                if let Some(writer) = slot.lock().take() {
                    if let Err(cleanup) = writer.discard() {
                        warn!("Could not discard take after writer failed to start: {}", cleanup);
                    }
                }
                return Err(e.into());
            }
        };

        Ok(Self {
            running,
            discard,
            thread_handle: Some(thread_handle),
        })
    }

    /// Stop the thread and wait for it. Samples already in the ring are
    /// written first unless `discard` is set.
    pub fn finish(&mut self, discard: bool) -> Result<WriterOutcome, TakeError> {
        self.discard.store(discard, Ordering::Release);
        self.running.store(false, Ordering::Release);

        let handle = self
            .thread_handle
            .take()
            .ok_or(TakeError::InvalidState("take writer already finished"))?;

        handle
            .join()
            .map_err(|_| TakeError::Storage("take writer thread panicked".to_string()))?
    }
}

/// File writer main loop
fn run_take_writer(
    mut consumer: Consumer<f32>,
    mut writer: Box<dyn TakeWriter>,
    running: &AtomicBool,
    discard: &AtomicBool,
) -> Result<WriterOutcome, TakeError> {
    let samples_written = match pump(&mut consumer, writer.as_mut(), running, discard) {
        Ok(count) => count,
        Err(e) => {
            error!("Take writer failed: {}", e);
            let _ = writer.discard();
            return Err(e);
        }
    };

    if discard.load(Ordering::Acquire) {
        writer.discard()?;
        debug!("Discarded take after {} samples", samples_written);
        return Ok(WriterOutcome {
            storage: None,
            samples_written,
        });
    }

    if samples_written == 0 {
        writer.discard()?;
        return Ok(WriterOutcome {
            storage: None,
            samples_written,
        });
    }

    let storage = writer.finalize()?;
    debug!("Finalized take at {} ({} samples)", storage, samples_written);

    Ok(WriterOutcome {
        storage: Some(storage),
        samples_written,
    })
}

/// Move samples from the ring into the writer until told to stop, then drain
fn pump(
    consumer: &mut Consumer<f32>,
    writer: &mut dyn TakeWriter,
    running: &AtomicBool,
    discard: &AtomicBool,
) -> Result<u64, TakeError> {
    let mut samples_written = 0u64;
    let mut last_flush = Instant::now();

    while running.load(Ordering::Acquire) {
        let moved = drain(consumer, writer)?;
        samples_written += moved as u64;

        // Periodically flush to disk for crash safety
        if last_flush.elapsed() > FLUSH_INTERVAL {
            writer.flush()?;
            last_flush = Instant::now();
        }

        // Sleep briefly if no samples were available
        if moved == 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }

    if discard.load(Ordering::Acquire) {
        return Ok(samples_written);
    }

    // Drain any remaining samples
    samples_written += drain(consumer, writer)? as u64;
    Ok(samples_written)
}

fn drain(consumer: &mut Consumer<f32>, writer: &mut dyn TakeWriter) -> Result<usize, TakeError> {
    let available = consumer.slots();
    if available == 0 {
        return Ok(0);
    }

    let chunk = consumer
        .read_chunk(available)
        .map_err(|e| TakeError::Storage(e.to_string()))?;
    let (first, second) = chunk.as_slices();
    writer.write(first)?;
    writer.write(second)?;
    chunk.commit_all();

    Ok(available)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::{MemoryBackend, TakeBackend, WavBackend};
    use crate::store::take::TakeFormat;
    use std::fs;

    fn spawn_memory_writer(capacity: usize) -> (MemoryBackend, rtrb::Producer<f32>, WriterHandle) {
        let backend = MemoryBackend::new();
        let writer = backend.create("test", TakeFormat::new(48000, 1)).unwrap();
        let (producer, consumer) = rtrb::RingBuffer::new(capacity);
        let handle = WriterHandle::spawn(consumer, writer, "test").unwrap();
        (backend, producer, handle)
    }

    #[test]
    fn test_writer_drains_before_finalizing() {
        let (backend, mut producer, mut handle) = spawn_memory_writer(1024);
        for i in 0..500 {
            producer.push(i as f32).unwrap();
        }

        let outcome = handle.finish(false).unwrap();
        assert_eq!(outcome.samples_written, 500);

        let samples = backend.read(&outcome.storage.unwrap()).unwrap();
        assert_eq!(samples.len(), 500);
        assert_eq!(samples[499], 499.0);
    }

    #[test]
    fn test_writer_discard_leaves_nothing() {
        let (backend, mut producer, mut handle) = spawn_memory_writer(64);
        producer.push(1.0).unwrap();

        let outcome = handle.finish(true).unwrap();
        assert!(outcome.storage.is_none());
        assert!(backend.is_empty());
    }

    #[test]
    fn test_writer_without_samples_stores_nothing() {
        let (backend, _producer, mut handle) = spawn_memory_writer(64);
        let outcome = handle.finish(false).unwrap();
        assert_eq!(outcome.samples_written, 0);
        assert!(outcome.storage.is_none());
        assert!(backend.is_empty());
    }

    #[test]
    fn test_finish_twice_fails() {
        let (_backend, _producer, mut handle) = spawn_memory_writer(64);
        handle.finish(true).unwrap();
        assert!(matches!(handle.finish(true), Err(TakeError::InvalidState(_))));
    }

    #[test]
    fn test_failed_thread_start_discards_take_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = WavBackend::new(dir.path());
        let writer = backend.create("lost", TakeFormat::new(48000, 1)).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);

        let (_producer, consumer) = rtrb::RingBuffer::new(64);
        let result = WriterHandle::spawn_with(consumer, writer, |_job| {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "no threads left"))
        });

        assert!(matches!(result, Err(TakeError::Io(_))));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
