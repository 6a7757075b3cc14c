//! Ordered, append-only take storage for one project.

pub mod backend;
pub mod builder;
pub mod index;
pub mod take;
mod writer;

pub use backend::{MemoryBackend, TakeBackend, TakeWriter, WavBackend};
pub use builder::TakeBuilder;
pub use take::{StorageRef, Take, TakeFormat, TakeId};

use log::{info, warn};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::TakeError;
use crate::store::take::TakeDraft;
use crate::store::writer::WriterHandle;
use crate::types::{CHANNELS, RING_BUFFER_SECONDS, SAMPLE_RATE};

/// Store-wide settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Layout of every take recorded into this store
    pub format: TakeFormat,

    /// Capacity of each take's ring buffer, in seconds of audio
    pub ring_seconds: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            format: TakeFormat::new(SAMPLE_RATE, CHANNELS),
            ring_seconds: RING_BUFFER_SECONDS,
        }
    }
}

struct StoreState {
    takes: Arc<Vec<Take>>,
    next_id: TakeId,
}

pub(crate) struct StoreShared {
    state: RwLock<StoreState>,
    recording: AtomicBool,
    pub(crate) backend: Arc<dyn TakeBackend>,
    index_path: Option<PathBuf>,
    options: StoreOptions,
}

impl StoreShared {
    /// Assign the next id and append. Rolls back if the index can't be saved.
    pub(crate) fn insert(&self, draft: TakeDraft) -> Result<Take, TakeError> {
        let mut state = self.state.write();
        let id = state.next_id;
        let take = Take::from_draft(id, draft);

        let mut takes = state.takes.as_ref().clone();
        takes.push(take.clone());

        if let Some(path) = &self.index_path {
            if let Err(e) = index::save(path, id.next(), &takes) {
                drop(state);
                if let Err(cleanup) = self.backend.remove(take.storage()) {
                    warn!(
                        "Take index save failed and the audio at {} could not be removed: {}",
                        take.storage(),
                        cleanup
                    );
                }
                return Err(e);
            }
        }

        state.takes = Arc::new(takes);
        state.next_id = id.next();

        info!(
            "Committed take {} '{}' ({} frames, {})",
            id,
            take.name(),
            take.duration_frames(),
            take.storage()
        );
        Ok(take)
    }

    pub(crate) fn release(&self) {
        self.recording.store(false, Ordering::Release);
    }
}

/// Immutable snapshot of the store's takes in recording order.
///
/// Iterating is lazy and can be restarted any number of times.
#[derive(Debug, Clone)]
pub struct TakeList {
    takes: Arc<Vec<Take>>,
}

impl TakeList {
    pub fn iter(&self) -> std::slice::Iter<'_, Take> {
        self.takes.iter()
    }

    pub fn len(&self) -> usize {
        self.takes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.takes.is_empty()
    }
}

impl<'a> IntoIterator for &'a TakeList {
    type Item = &'a Take;
    type IntoIter = std::slice::Iter<'a, Take>;

    fn into_iter(self) -> Self::IntoIter {
        self.takes.iter()
    }
}

/// Ordered collection of takes for one project. Cheap to clone; clones
/// share the same takes.
#[derive(Clone)]
pub struct TakeStore {
    shared: Arc<StoreShared>,
}

impl TakeStore {
    /// Store over any backend, without a persisted index
    pub fn new(backend: Arc<dyn TakeBackend>, options: StoreOptions) -> Self {
        Self::with_state(backend, options, None, TakeId::FIRST, Vec::new())
    }

    /// Store that keeps take audio in memory
    pub fn in_memory(options: StoreOptions) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), options)
    }

    /// Open (or create) a project directory of WAV takes with a `takes.yaml` index
    pub fn open(dir: impl AsRef<Path>, options: StoreOptions) -> Result<Self, TakeError> {
        let dir = dir.as_ref();
        let index_path = dir.join(index::INDEX_FILE);

        let (next_id, takes) = index::load(&index_path)?.unwrap_or((TakeId::FIRST, Vec::new()));
        info!("Opened take store {} ({} takes)", dir.display(), takes.len());

        Ok(Self::with_state(
            Arc::new(WavBackend::new(dir)),
            options,
            Some(index_path),
            next_id,
            takes,
        ))
    }

    fn with_state(
        backend: Arc<dyn TakeBackend>,
        options: StoreOptions,
        index_path: Option<PathBuf>,
        next_id: TakeId,
        takes: Vec<Take>,
    ) -> Self {
        Self {
            shared: Arc::new(StoreShared {
                state: RwLock::new(StoreState {
                    takes: Arc::new(takes),
                    next_id,
                }),
                recording: AtomicBool::new(false),
                backend,
                index_path,
                options,
            }),
        }
    }

    pub fn format(&self) -> TakeFormat {
        self.shared.options.format
    }

    pub fn options(&self) -> StoreOptions {
        self.shared.options
    }

    /// Whether a take is in progress
    pub fn is_recording(&self) -> bool {
        self.shared.recording.load(Ordering::Acquire)
    }

    /// Start a new take. Only one take may be in progress per store.
    pub fn begin_take(&self, name: impl Into<String>) -> Result<TakeBuilder, TakeError> {
        let name = name.into();

        if self
            .shared
            .recording
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TakeError::AlreadyRecording);
        }

        match self.spawn_builder(name) {
            Ok(builder) => Ok(builder),
            Err(e) => {
                self.shared.release();
                Err(e)
            }
        }
    }

    fn spawn_builder(&self, name: String) -> Result<TakeBuilder, TakeError> {
        let options = self.shared.options;
        let capacity = options.format.samples_for_seconds(options.ring_seconds.max(1));

        let writer = self.shared.backend.create(&name, options.format)?;
        let (producer, consumer) = rtrb::RingBuffer::new(capacity);
        let writer = WriterHandle::spawn(consumer, writer, &name)?;

        info!("Started take '{}'", name);
        Ok(TakeBuilder::new(
            name,
            options.format,
            producer,
            writer,
            self.shared.clone(),
        ))
    }

    /// Snapshot of all takes in recording order
    pub fn list(&self) -> TakeList {
        TakeList {
            takes: self.shared.state.read().takes.clone(),
        }
    }

    pub fn get(&self, id: TakeId) -> Option<Take> {
        self.shared
            .state
            .read()
            .takes
            .iter()
            .find(|take| take.id() == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.shared.state.read().takes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Id the next committed take will receive
    pub fn next_id(&self) -> TakeId {
        self.shared.state.read().next_id
    }

    /// Remove a take and its audio. Its id is never handed out again.
    pub fn delete(&self, id: TakeId) -> Result<Take, TakeError> {
        let mut state = self.shared.state.write();
        let position = state
            .takes
            .iter()
            .position(|take| take.id() == id)
            .ok_or(TakeError::NotFound(id))?;

        let mut takes = state.takes.as_ref().clone();
        let removed = takes.remove(position);

        if let Some(path) = &self.shared.index_path {
            index::save(path, state.next_id, &takes)?;
        }
        state.takes = Arc::new(takes);
        drop(state);

        if let Err(e) = self.shared.backend.remove(removed.storage()) {
            warn!("Deleted take {} but could not remove its audio: {}", id, e);
        }

        info!("Deleted take {} '{}'", id, removed.name());
        Ok(removed)
    }

    /// Give a take a new display name
    pub fn rename(&self, id: TakeId, new_name: impl Into<String>) -> Result<Take, TakeError> {
        let new_name = new_name.into();
        let mut state = self.shared.state.write();
        let position = state
            .takes
            .iter()
            .position(|take| take.id() == id)
            .ok_or(TakeError::NotFound(id))?;

        let mut takes = state.takes.as_ref().clone();
        let renamed = takes[position].renamed(new_name);
        takes[position] = renamed.clone();

        if let Some(path) = &self.shared.index_path {
            index::save(path, state.next_id, &takes)?;
        }
        state.takes = Arc::new(takes);

        info!("Renamed take {} to '{}'", id, renamed.name());
        Ok(renamed)
    }

    /// Decode a take's audio as interleaved f32 samples
    pub fn read_samples(&self, id: TakeId) -> Result<Vec<f32>, TakeError> {
        let take = self.get(id).ok_or(TakeError::NotFound(id))?;
        self.shared.backend.read(take.storage())
    }
}

impl std::fmt::Debug for TakeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TakeStore")
            .field("takes", &self.len())
            .field("recording", &self.is_recording())
            .field("options", &self.shared.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono_store() -> TakeStore {
        TakeStore::in_memory(StoreOptions {
            format: TakeFormat::new(48000, 1),
            ring_seconds: 1,
        })
    }

    fn record(store: &TakeStore, name: &str, frames: usize) -> Take {
        let mut take = store.begin_take(name).unwrap();
        take.append(&vec![0.25; frames]).unwrap();
        take.commit().unwrap()
    }

    #[test]
    fn test_empty_commit_leaves_store_unchanged() {
        let store = mono_store();
        let take = store.begin_take("Take 1").unwrap();

        assert!(matches!(take.commit(), Err(TakeError::EmptyTake)));
        assert_eq!(store.len(), 0);
        assert_eq!(store.next_id(), TakeId::FIRST);
        assert!(!store.is_recording());
    }

    #[test]
    fn test_second_begin_fails_while_recording() {
        let store = mono_store();
        let first = store.begin_take("first").unwrap();

        assert!(matches!(store.begin_take("second"), Err(TakeError::AlreadyRecording)));

        first.abort();
        assert!(store.begin_take("second").is_ok());
    }

    #[test]
    fn test_ids_increase_and_are_not_reused() {
        let store = mono_store();
        let a = record(&store, "a", 10);
        let b = record(&store, "b", 10);
        assert!(b.id() > a.id());

        store.delete(b.id()).unwrap();
        let c = record(&store, "c", 10);
        assert!(c.id() > b.id());

        let ids: Vec<TakeId> = store.list().iter().map(|take| take.id()).collect();
        assert_eq!(ids, vec![a.id(), c.id()]);
    }

    #[test]
    fn test_abort_keeps_list_empty() {
        let store = mono_store();
        let mut take = store.begin_take("Take 1").unwrap();
        take.append(&[0.5; 50]).unwrap();
        take.abort();

        assert!(store.list().is_empty());
        assert_eq!(store.list().iter().count(), 0);
    }

    #[test]
    fn test_list_is_restartable_snapshot() {
        let store = mono_store();
        record(&store, "one", 4);
        record(&store, "two", 4);

        let list = store.list();
        let first_pass: Vec<&str> = list.iter().map(|take| take.name()).collect();
        let second_pass: Vec<&str> = (&list).into_iter().map(|take| take.name()).collect();
        assert_eq!(first_pass, vec!["one", "two"]);
        assert_eq!(first_pass, second_pass);

        // Later changes don't disturb an existing snapshot
        record(&store, "three", 4);
        assert_eq!(list.len(), 2);
        assert_eq!(store.list().len(), 3);
    }

    #[test]
    fn test_delete_and_rename_unknown_id() {
        let store = mono_store();
        let missing = TakeId::new(42);
        assert!(matches!(store.delete(missing), Err(TakeError::NotFound(id)) if id == missing));
        assert!(matches!(store.rename(missing, "x"), Err(TakeError::NotFound(_))));
        assert!(matches!(store.read_samples(missing), Err(TakeError::NotFound(_))));
    }

    #[test]
    fn test_delete_keeps_other_takes() {
        let store = mono_store();
        let a = record(&store, "a", 4);
        let b = record(&store, "b", 4);
        let c = record(&store, "c", 4);

        let removed = store.delete(b.id()).unwrap();
        assert_eq!(removed.name(), "b");
        assert_eq!(store.get(a.id()), Some(a));
        assert_eq!(store.get(c.id()), Some(c));
        assert!(store.get(b.id()).is_none());
    }

    #[test]
    fn test_rename() {
        let store = mono_store();
        let take = record(&store, "scratch", 4);

        let renamed = store.rename(take.id(), "Keeper").unwrap();
        assert_eq!(renamed.name(), "Keeper");
        assert_eq!(store.get(take.id()).unwrap().name(), "Keeper");
        assert_eq!(renamed.duration_frames(), take.duration_frames());
    }

    #[test]
    fn test_open_persists_ids_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let options = StoreOptions {
            format: TakeFormat::new(48000, 1),
            ring_seconds: 1,
        };

        let (kept, deleted) = {
            let store = TakeStore::open(dir.path(), options).unwrap();
            let kept = record(&store, "kept", 32);
            let deleted = record(&store, "deleted", 32);
            store.delete(deleted.id()).unwrap();
            (kept, deleted)
        };

        let store = TakeStore::open(dir.path(), options).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(kept.id()).unwrap().name(), "kept");
        assert_eq!(store.read_samples(kept.id()).unwrap(), vec![0.25; 32]);

        let next = record(&store, "after reopen", 8);
        assert!(next.id() > deleted.id());
    }

    #[test]
    fn test_moved_project_keeps_its_takes() {
        let dir = tempfile::tempdir().unwrap();
        let options = StoreOptions {
            format: TakeFormat::new(48000, 1),
            ring_seconds: 1,
        };

        let take = {
            let store = TakeStore::open(dir.path().join("before").join("takes"), options).unwrap();
            record(&store, "vocal", 16)
        };
        std::fs::rename(dir.path().join("before"), dir.path().join("after")).unwrap();

        let takes_dir = dir.path().join("after").join("takes");
        let store = TakeStore::open(&takes_dir, options).unwrap();
        assert_eq!(store.read_samples(take.id()).unwrap(), vec![0.25; 16]);

        store.delete(take.id()).unwrap();
        let remaining: Vec<_> = std::fs::read_dir(&takes_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(remaining, vec![std::ffi::OsString::from(index::INDEX_FILE)]);
    }

    /// Memory backend whose `remove` always fails
    #[derive(Default)]
    struct StuckBackend {
        inner: MemoryBackend,
        remove_attempts: std::sync::atomic::AtomicUsize,
    }

    impl TakeBackend for StuckBackend {
        fn create(&self, name: &str, format: TakeFormat) -> Result<Box<dyn TakeWriter>, TakeError> {
            self.inner.create(name, format)
        }

        fn read(&self, storage: &StorageRef) -> Result<Vec<f32>, TakeError> {
            self.inner.read(storage)
        }

        fn remove(&self, _storage: &StorageRef) -> Result<(), TakeError> {
            self.remove_attempts.fetch_add(1, Ordering::Relaxed);
            Err(TakeError::Storage("device busy".to_string()))
        }
    }

    #[test]
    fn test_index_failure_reports_index_error_when_cleanup_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let backend = Arc::new(StuckBackend::default());
        let store = TakeStore::with_state(
            backend.clone(),
            StoreOptions {
                format: TakeFormat::new(48000, 1),
                ring_seconds: 1,
            },
            Some(blocker.join(index::INDEX_FILE)),
            TakeId::FIRST,
            Vec::new(),
        );

        let mut take = store.begin_take("unsaved").unwrap();
        take.append(&[0.5; 8]).unwrap();
        assert!(matches!(take.commit(), Err(TakeError::Io(_))));

        assert_eq!(backend.remove_attempts.load(Ordering::Relaxed), 1);
        assert!(store.is_empty());
        assert!(!store.is_recording());
        assert_eq!(store.next_id(), TakeId::FIRST);
    }
}
