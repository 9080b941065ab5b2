//! RecordStore — one JSON document per collection, rewritten atomically.
//!
//! Reads parse the whole document. Mutations hold the store's writer lock
//! for the full read-modify-write cycle and publish the new document via a
//! temp file in the same directory followed by a rename, so a reader sees
//! either the old or the new document and never a partial one.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use chrono::Utc;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::record::Record;

/// Why a document could not be loaded.
enum LoadFailure {
    Missing,
    Unreadable(String),
    Corrupt(String),
}

/// Writer locks keyed by canonical document path.
static WRITERS: OnceLock<Mutex<HashMap<PathBuf, Weak<Mutex<()>>>>> = OnceLock::new();

/// The writer lock for the document at `key`, shared by every open handle.
fn writer_for(key: PathBuf) -> Arc<Mutex<()>> {
    let mut writers = WRITERS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    writers.retain(|_, writer| writer.strong_count() > 0);
    if let Some(writer) = writers.get(&key).and_then(Weak::upgrade) {
        return writer;
    }
    let writer = Arc::new(Mutex::new(()));
    writers.insert(key, Arc::downgrade(&writer));
    writer
}

/// Durable collection of `T` records backed by a single JSON file.
///
/// Every handle opened on the same document in this process shares one
/// writer lock, whether it was cloned or opened separately.
pub struct RecordStore<T: Record> {
    dir: PathBuf,
    path: PathBuf,
    writer: Arc<Mutex<()>>,
    _record: PhantomData<fn() -> T>,
}

impl<T: Record> Clone for RecordStore<T> {
    fn clone(&self) -> Self {
        Self {
            dir: self.dir.clone(),
            path: self.path.clone(),
            writer: Arc::clone(&self.writer),
            _record: PhantomData,
        }
    }
}

impl<T: Record> std::fmt::Debug for RecordStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore").field("path", &self.path).finish()
    }
}

impl<T: Record> RecordStore<T> {
    /// Open (or create) the collection stored at `dir/filename`.
    ///
    /// Creates the directory and an empty document if either is missing.
    pub fn open(dir: impl AsRef<Path>, filename: &str) -> StateResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| StateError::Io(format!("{}: {e}", dir.display())))?;
        let canonical =
            fs::canonicalize(&dir).map_err(|e| StateError::Io(format!("{}: {e}", dir.display())))?;
        let store = Self {
            path: dir.join(filename),
            dir,
            writer: writer_for(canonical.join(filename)),
            _record: PhantomData,
        };
        if store.ensure_document()? {
            debug!(path = ?store.path, "created empty state document");
        }
        debug!(path = ?store.path, "record store opened");
        Ok(store)
    }

    /// Open the collection under its default file name (`T::COLLECTION`).
    pub fn open_default(dir: impl AsRef<Path>) -> StateResult<Self> {
        Self::open(dir, T::COLLECTION)
    }

    /// Path of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Read the whole collection.
    ///
    /// Never fails: a missing document is recreated empty, and an unreadable
    /// or unparsable one is logged and treated as empty.
    pub fn list_all(&self) -> Vec<T> {
        match self.load() {
            Ok(records) => records,
            Err(LoadFailure::Missing) => {
                if let Err(e) = self.ensure_document() {
                    warn!(path = ?self.path, error = %e, "failed to recreate state document");
                }
                Vec::new()
            }
            Err(LoadFailure::Unreadable(e)) | Err(LoadFailure::Corrupt(e)) => {
                warn!(path = ?self.path, error = %e, "failed to read state document, treating collection as empty");
                Vec::new()
            }
        }
    }

    /// Find a record by id.
    pub fn get_by_id(&self, id: &str) -> Option<T> {
        self.list_all().into_iter().find(|r| r.id() == id)
    }

    /// Find a record by id, failing with `NotFound` when absent.
    pub fn require(&self, id: &str) -> StateResult<T> {
        self.get_by_id(id)
            .ok_or_else(|| StateError::NotFound(id.to_string()))
    }

    // ── Mutations ──────────────────────────────────────────────────

    /// Append a new record. Fails with `DuplicateId` if the id is taken.
    pub fn add(&self, record: T) -> StateResult<T> {
        let _guard = self.lock_writer();
        let mut records = self.load_for_write()?;
        if records.iter().any(|r| r.id() == record.id()) {
            return Err(StateError::DuplicateId(record.id().to_string()));
        }
        records.push(record.clone());
        self.write_document(&records)?;
        debug!(path = ?self.path, id = %record.id(), "record added");
        Ok(record)
    }

    /// Replace the record with the same id, or insert it if absent.
    ///
    /// A replaced record keeps its position in the document.
    pub fn update(&self, record: T) -> StateResult<T> {
        let _guard = self.lock_writer();
        let mut records = self.load_for_write()?;
        match records.iter().position(|r| r.id() == record.id()) {
            Some(index) => records[index] = record.clone(),
            None => records.push(record.clone()),
        }
        self.write_document(&records)?;
        debug!(path = ?self.path, id = %record.id(), "record updated");
        Ok(record)
    }

    /// Apply `change` to the stored record with `id` and persist it.
    ///
    /// Unlike [`RecordStore::update`] this never inserts: an absent id fails
    /// with `NotFound` and the document is left alone.
    pub fn modify<F>(&self, id: &str, change: F) -> StateResult<T>
    where
        F: FnOnce(&mut T),
    {
        let _guard = self.lock_writer();
        let mut records = self.load_for_write()?;
        let Some(record) = records.iter_mut().find(|r| r.id() == id) else {
            return Err(StateError::NotFound(id.to_string()));
        };
        change(record);
        if record.id() != id {
            return Err(StateError::Write(format!("record {id} changed its id")));
        }
        let modified = record.clone();
        self.write_document(&records)?;
        debug!(path = ?self.path, %id, "record modified");
        Ok(modified)
    }

    /// Remove the record with `id`. Returns true if one was removed.
    ///
    /// The document is only rewritten when something changed.
    pub fn remove(&self, id: &str) -> StateResult<bool> {
        let _guard = self.lock_writer();
        let mut records = self.load_for_write()?;
        let before = records.len();
        records.retain(|r| r.id() != id);
        let removed = records.len() != before;
        if removed {
            self.write_document(&records)?;
        }
        debug!(path = ?self.path, %id, removed, "record removed");
        Ok(removed)
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load(&self) -> Result<Vec<T>, LoadFailure> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(LoadFailure::Missing),
            Err(e) => return Err(LoadFailure::Unreadable(e.to_string())),
        };
        serde_json::from_slice(&bytes).map_err(|e| LoadFailure::Corrupt(e.to_string()))
    }

    /// Load the collection for a read-modify-write cycle. Caller holds the writer lock.
    ///
    /// A corrupt document is moved aside before it gets overwritten so its
    /// contents can still be recovered by hand.
    fn load_for_write(&self) -> StateResult<Vec<T>> {
        match self.load() {
            Ok(records) => Ok(records),
            Err(LoadFailure::Missing) => Ok(Vec::new()),
            Err(LoadFailure::Unreadable(e)) => Err(StateError::Io(format!(
                "{}: {e}",
                self.path.display()
            ))),
            Err(LoadFailure::Corrupt(e)) => {
                let aside = self.path.with_extension(format!(
                    "corrupt-{}",
                    Utc::now().format("%Y%m%dT%H%M%S")
                ));
                warn!(path = ?self.path, ?aside, error = %e, "state document is corrupt, moving it aside");
                fs::rename(&self.path, &aside).map_err(|e| StateError::Write(e.to_string()))?;
                Ok(Vec::new())
            }
        }
    }

    /// Serialize `records` and atomically replace the document.
    fn write_document(&self, records: &[T]) -> StateResult<()> {
        let bytes =
            serde_json::to_vec_pretty(records).map_err(|e| StateError::Serialize(e.to_string()))?;
        let tmp = self.write_temp(&bytes)?;
        tmp.persist(&self.path)
            .map_err(|e| StateError::Write(e.error.to_string()))?;
        Ok(())
    }

    /// Create an empty document unless one already exists.
    ///
    /// Uses a no-clobber rename so a document written concurrently by a
    /// mutation is never replaced by the empty one. Returns true if created.
    fn ensure_document(&self) -> StateResult<bool> {
        if self.path.exists() {
            return Ok(false);
        }
        let tmp = self.write_temp(b"[]")?;
        match tmp.persist_noclobber(&self.path) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StateError::Write(e.error.to_string())),
        }
    }

    fn write_temp(&self, bytes: &[u8]) -> StateResult<NamedTempFile> {
        let mut tmp =
            NamedTempFile::new_in(&self.dir).map_err(|e| StateError::Write(e.to_string()))?;
        tmp.write_all(bytes)
            .map_err(|e| StateError::Write(e.to_string()))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| StateError::Write(e.to_string()))?;
        Ok(tmp)
    }
}
