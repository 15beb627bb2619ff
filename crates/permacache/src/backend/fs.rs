//! The file backend.
//!
//! Each function owns a directory beneath the configured root. Two layouts
//! exist: a single `entries` file holding the whole key-to-entry map, or one
//! file per key named by the fingerprint's hex form (`separate_files`).
//!
//! Cross-process coordination uses blocking advisory locks on hidden sidecar
//! files, never on the data files themselves: data is replaced
//! atomic-by-rename, which would silently swap the locked inode out from
//! under a peer. Writes go through a temp file that is fsynced and renamed
//! over the target, so readers never observe a torn record; corrupt or
//! truncated files are treated as absent.
//!
//! In single-file mode the backend keeps an in-process snapshot of the map
//! and registers a filesystem watch on the function directory. External
//! modifications flip a dirty flag and the snapshot is re-read on the next
//! access. When watching is disabled by configuration the snapshot is simply
//! trusted; when the platform refuses the watch the backend degrades to
//! re-reading on every access.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use fs4::FileExt;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tempfile::NamedTempFile;

use crate::entry::{Blob, Claim, Entry};
use crate::error::BackendError;
use crate::key::Fingerprint;

use super::{Backend, WaitOutcome};

/// Name of the map file in single-file layout.
const ENTRIES_FILE: &str = "entries";

/// Sidecar lock for the map file.
const MAP_LOCK_FILE: &str = ".lock";

/// How long `wait_until_ready` polls when no explicit timeout is configured.
const DEFAULT_WAIT_BOUND: Duration = Duration::from_secs(30);

/// Backoff bounds for the in-flight poll loop.
const POLL_INITIAL: Duration = Duration::from_millis(10);
const POLL_MAX: Duration = Duration::from_millis(500);

pub struct FsBackend {
    dir: PathBuf,
    separate_files: bool,
    /// Whether the configuration asked for a directory watch.
    watch_requested: bool,
    /// In-process view of the map file; `None` until first load.
    snapshot: Mutex<Option<HashMap<String, Entry>>>,
    /// Flipped by the watcher when the directory changes externally.
    dirty: Arc<AtomicBool>,
    /// Set when the watch could not be (re-)registered; every access then
    /// re-reads from disk.
    degraded: Arc<AtomicBool>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl FsBackend {
    /// Opens (creating if necessary) the per-function directory `dir`.
    pub fn new(dir: PathBuf, separate_files: bool, watch: bool) -> Result<FsBackend, BackendError> {
        fs::create_dir_all(&dir)?;

        let backend = FsBackend {
            dir,
            separate_files,
            watch_requested: watch,
            snapshot: Mutex::new(None),
            dirty: Arc::new(AtomicBool::new(false)),
            degraded: Arc::new(AtomicBool::new(false)),
            watcher: Mutex::new(None),
        };

        // The watch only serves the single-file snapshot; per-entry mode
        // reads the entry file on every access anyway.
        if watch && !separate_files {
            backend.register_watch();
        }
        Ok(backend)
    }

    fn register_watch(&self) {
        let dirty = Arc::clone(&self.dirty);
        let result = notify::recommended_watcher(
            move |event: Result<notify::Event, notify::Error>| {
                // Any event, including an error, invalidates the snapshot.
                let _ = event;
                dirty.store(true, Ordering::Release);
            },
        )
        .and_then(|mut watcher| {
            watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;
            Ok(watcher)
        });

        match result {
            Ok(watcher) => {
                *self.watcher.lock() = Some(watcher);
                self.degraded.store(false, Ordering::Release);
            }
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    path = %self.dir.display(),
                    "cannot watch cache directory, re-reading on every access",
                );
                *self.watcher.lock() = None;
                self.degraded.store(true, Ordering::Release);
            }
        }
    }

    fn map_path(&self) -> PathBuf {
        self.dir.join(ENTRIES_FILE)
    }

    fn map_lock_path(&self) -> PathBuf {
        self.dir.join(MAP_LOCK_FILE)
    }

    fn entry_path(&self, hex: &str) -> PathBuf {
        self.dir.join(hex)
    }

    fn entry_lock_path(&self, hex: &str) -> PathBuf {
        self.dir.join(format!(".{hex}.lock"))
    }

    /// Reads the map file. Missing or undecodable files are an empty map.
    ///
    /// Callers must hold the map lock.
    fn load_map_locked(&self) -> HashMap<String, Entry> {
        read_record(&self.map_path())
    }

    fn store_map_locked(&self, map: &HashMap<String, Entry>) -> Result<(), BackendError> {
        let bytes = bincode::serialize(map).map_err(|err| BackendError::Encode(err.to_string()))?;
        write_atomic(&self.dir, &self.map_path(), &bytes)?;
        *self.snapshot.lock() = Some(map.clone());
        Ok(())
    }

    /// Read-modify-write on the map file under the map lock.
    ///
    /// `mutate` returns `Some` with its result to store the new map, `None`
    /// to leave the file untouched.
    fn update_map<R>(
        &self,
        mutate: impl FnOnce(&mut HashMap<String, Entry>) -> Option<R>,
    ) -> Result<Option<R>, BackendError> {
        let _lock = FileLock::acquire(&self.map_lock_path())?;
        let mut map = self.load_map_locked();
        match mutate(&mut map) {
            Some(result) => {
                self.store_map_locked(&map)?;
                Ok(Some(result))
            }
            None => Ok(None),
        }
    }

    /// Read-modify-write on one entry file under its lock.
    fn update_entry<R>(
        &self,
        hex: &str,
        mutate: impl FnOnce(Option<Entry>) -> EntryUpdate<R>,
    ) -> Result<R, BackendError> {
        let _lock = FileLock::acquire(&self.entry_lock_path(hex))?;
        let path = self.entry_path(hex);
        let current = read_entry_file(&path);
        match mutate(current) {
            EntryUpdate::Store(entry, result) => {
                let bytes = bincode::serialize(&entry)
                    .map_err(|err| BackendError::Encode(err.to_string()))?;
                write_atomic(&self.dir, &path, &bytes)?;
                Ok(result)
            }
            EntryUpdate::Remove(result) => {
                remove_if_exists(&path)?;
                Ok(result)
            }
            EntryUpdate::Keep(result) => Ok(result),
        }
    }

    /// The current single-file map, served from the snapshot when it is
    /// known to be current.
    fn current_map(&self) -> Result<HashMap<String, Entry>, BackendError> {
        if self.degraded.load(Ordering::Acquire) {
            let _lock = FileLock::acquire(&self.map_lock_path())?;
            return Ok(self.load_map_locked());
        }

        // Lock order is file lock before snapshot mutex, here and in the
        // write path; the snapshot mutex is never held across a file-lock
        // acquisition.
        {
            let snapshot = self.snapshot.lock();
            let invalidated = self.watch_requested && self.dirty.swap(false, Ordering::AcqRel);
            if let Some(map) = snapshot.as_ref() {
                if !invalidated {
                    return Ok(map.clone());
                }
            }
        }

        let _lock = FileLock::acquire(&self.map_lock_path())?;
        let map = self.load_map_locked();
        *self.snapshot.lock() = Some(map.clone());
        Ok(map)
    }

    /// An uncached read of one entry, for the poll loop.
    fn read_entry_fresh(&self, hex: &str) -> Result<Option<Entry>, BackendError> {
        if self.separate_files {
            let _lock = FileLock::acquire(&self.entry_lock_path(hex))?;
            Ok(read_entry_file(&self.entry_path(hex)))
        } else {
            let _lock = FileLock::acquire(&self.map_lock_path())?;
            Ok(self.load_map_locked().remove(hex))
        }
    }

    /// Fingerprint-named data files in the function directory.
    fn entry_files(&self) -> Result<Vec<(String, PathBuf)>, BackendError> {
        let mut files = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.len() == 64 && name.bytes().all(|b| b.is_ascii_hexdigit()) {
                files.push((name.to_owned(), dirent.path()));
            }
        }
        Ok(files)
    }
}

enum EntryUpdate<R> {
    Store(Entry, R),
    Remove(R),
    Keep(R),
}

impl Backend for FsBackend {
    fn get(&self, key: &Fingerprint) -> Result<Option<Entry>, BackendError> {
        let hex = key.as_hex();
        if self.separate_files {
            let _lock = FileLock::acquire(&self.entry_lock_path(&hex))?;
            Ok(read_entry_file(&self.entry_path(&hex)))
        } else {
            Ok(self.current_map()?.remove(&hex))
        }
    }

    fn put(&self, key: &Fingerprint, value: Blob, timestamp: SystemTime)
        -> Result<(), BackendError> {
        let hex = key.as_hex();
        let entry = Entry::published(value, timestamp);
        if self.separate_files {
            self.update_entry(&hex, |_| EntryUpdate::Store(entry, ()))
        } else {
            self.update_map(|map| {
                map.insert(hex, entry);
                Some(())
            })
            .map(|_| ())
        }
    }

    fn publish(
        &self,
        key: &Fingerprint,
        claim: Claim,
        value: Blob,
        timestamp: SystemTime,
    ) -> Result<bool, BackendError> {
        let hex = key.as_hex();
        let held = |entry: Option<&Entry>| entry.is_some_and(|e| e.claim == Some(claim.0));
        if self.separate_files {
            self.update_entry(&hex, |current| {
                if held(current.as_ref()) {
                    EntryUpdate::Store(Entry::published(value, timestamp), true)
                } else {
                    EntryUpdate::Keep(false)
                }
            })
        } else {
            let stored = self.update_map(|map| {
                if held(map.get(&hex)) {
                    map.insert(hex.clone(), Entry::published(value, timestamp));
                    Some(true)
                } else {
                    None
                }
            })?;
            Ok(stored.unwrap_or(false))
        }
    }

    fn mark_in_flight(&self, key: &Fingerprint) -> Result<Option<Claim>, BackendError> {
        let hex = key.as_hex();
        let now = SystemTime::now();
        let try_claim = |current: Option<Entry>| match current {
            Some(entry) if entry.in_flight => (None, None),
            Some(entry) => {
                let claim = Claim::next();
                (Some(entry.with_claim(claim, now)), Some(claim))
            }
            None => {
                let claim = Claim::next();
                (Some(Entry::claimed(claim, now)), Some(claim))
            }
        };

        if self.separate_files {
            self.update_entry(&hex, |current| match try_claim(current) {
                (Some(entry), claim) => EntryUpdate::Store(entry, claim),
                (None, claim) => EntryUpdate::Keep(claim),
            })
        } else {
            let claim = self.update_map(|map| {
                let (updated, claim) = try_claim(map.remove(&hex));
                if let Some(entry) = updated {
                    map.insert(hex.clone(), entry);
                    Some(claim)
                } else {
                    None
                }
            })?;
            Ok(claim.flatten())
        }
    }

    fn clear_in_flight(&self, key: &Fingerprint) -> Result<(), BackendError> {
        let hex = key.as_hex();
        let release = |entry: Entry| {
            if entry.has_value() {
                Some(entry.released())
            } else {
                None
            }
        };
        if self.separate_files {
            self.update_entry(&hex, |current| match current.and_then(release) {
                Some(entry) => EntryUpdate::Store(entry, ()),
                None => EntryUpdate::Remove(()),
            })
        } else {
            self.update_map(|map| {
                match map.remove(&hex).and_then(release) {
                    Some(entry) => {
                        map.insert(hex.clone(), entry);
                    }
                    None => {}
                }
                Some(())
            })
            .map(|_| ())
        }
    }

    fn clear_all_in_flight(&self) -> Result<(), BackendError> {
        if self.separate_files {
            for (hex, _) in self.entry_files()? {
                self.clear_in_flight(&fingerprint_from_hex(&hex)?)?;
            }
            Ok(())
        } else {
            self.update_map(|map| {
                map.retain(|_, entry| entry.has_value());
                for entry in map.values_mut() {
                    *entry = entry.clone().released();
                }
                Some(())
            })
            .map(|_| ())
        }
    }

    fn mark_stale(&self, key: &Fingerprint) -> Result<bool, BackendError> {
        let hex = key.as_hex();
        if self.separate_files {
            self.update_entry(&hex, |current| match current {
                Some(mut entry) if !entry.stale => {
                    entry.stale = true;
                    EntryUpdate::Store(entry, true)
                }
                _ => EntryUpdate::Keep(false),
            })
        } else {
            let acquired = self.update_map(|map| match map.get_mut(&hex) {
                Some(entry) if !entry.stale => {
                    entry.stale = true;
                    Some(true)
                }
                _ => None,
            })?;
            Ok(acquired.unwrap_or(false))
        }
    }

    fn clear_stale(&self, key: &Fingerprint) -> Result<(), BackendError> {
        let hex = key.as_hex();
        if self.separate_files {
            self.update_entry(&hex, |current| match current {
                Some(mut entry) if entry.stale => {
                    entry.stale = false;
                    EntryUpdate::Store(entry, ())
                }
                _ => EntryUpdate::Keep(()),
            })
        } else {
            self.update_map(|map| match map.get_mut(&hex) {
                Some(entry) if entry.stale => {
                    entry.stale = false;
                    Some(())
                }
                _ => None,
            })
            .map(|_| ())
        }
    }

    fn clear(&self, key: &Fingerprint) -> Result<(), BackendError> {
        let hex = key.as_hex();
        if self.separate_files {
            // The lock sidecar stays behind: deleting it while a peer blocks
            // on the lock would split the exclusion across two inodes.
            self.update_entry(&hex, |_| EntryUpdate::Remove(()))
        } else {
            self.update_map(|map| {
                map.remove(&hex);
                Some(())
            })
            .map(|_| ())
        }
    }

    fn clear_all(&self) -> Result<(), BackendError> {
        {
            let _lock = FileLock::acquire(&self.map_lock_path())?;
            fs::remove_dir_all(&self.dir)?;
            fs::create_dir_all(&self.dir)?;
            *self.snapshot.lock() = Some(HashMap::new());
        }
        // Recreating the directory invalidates the old inode's watch.
        if self.watch_requested && !self.separate_files {
            self.register_watch();
        }
        Ok(())
    }

    fn wait_until_ready(
        &self,
        key: &Fingerprint,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome, BackendError> {
        let hex = key.as_hex();
        let deadline = Instant::now() + timeout.unwrap_or(DEFAULT_WAIT_BOUND);
        let mut backoff = POLL_INITIAL;
        loop {
            match self.read_entry_fresh(&hex)? {
                None => return Ok(WaitOutcome::Gone),
                Some(entry) if !entry.in_flight => return Ok(WaitOutcome::Ready(entry)),
                Some(_) => {}
            }
            if Instant::now() >= deadline {
                return Ok(WaitOutcome::TimedOut);
            }
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(POLL_MAX);
        }
    }

    fn delete_stale_entries(&self, older_than: Duration) -> Result<(), BackendError> {
        let now = SystemTime::now();
        let expired = |entry: &Entry| {
            !entry.in_flight && entry.age(now).map_or(false, |age| age > older_than)
        };
        if self.separate_files {
            for (hex, _) in self.entry_files()? {
                self.update_entry(&hex, |current| match current {
                    Some(entry) if expired(&entry) => EntryUpdate::Remove(()),
                    _ => EntryUpdate::Keep(()),
                })?;
            }
            Ok(())
        } else {
            self.update_map(|map| {
                map.retain(|_, entry| !expired(entry));
                Some(())
            })
            .map(|_| ())
        }
    }

    fn cache_dir(&self) -> Option<PathBuf> {
        Some(self.dir.clone())
    }
}

/// A blocking advisory lock on a sidecar file, released on drop.
struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(path: &Path) -> Result<FileLock, BackendError> {
        let file = match OpenOptions::new().create(true).write(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                // The function directory itself is gone (a concurrent
                // clear_all); recreate it and retry once.
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                OpenOptions::new().create(true).write(true).open(path)?
            }
            Err(err) => return Err(err.into()),
        };
        file.lock_exclusive()?;
        Ok(FileLock { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            tracing::debug!(
                error = &err as &dyn std::error::Error,
                "failed to release cache file lock",
            );
        }
    }
}

/// Writes `bytes` to `target` atomically: temp file in the same directory,
/// fsync, rename over the target.
fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> Result<(), BackendError> {
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(target).map_err(|err| BackendError::Io(err.error))?;
    Ok(())
}

/// Reads and decodes a bincode record, treating any failure as absence.
fn read_record<T: serde::de::DeserializeOwned + Default>(path: &Path) -> T {
    let mut bytes = Vec::new();
    match File::open(path) {
        Ok(mut file) => {
            if file.read_to_end(&mut bytes).is_err() {
                return T::default();
            }
        }
        Err(_) => return T::default(),
    }
    match bincode::deserialize(&bytes) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                path = %path.display(),
                "unreadable cache record, treating as absent",
            );
            T::default()
        }
    }
}

fn read_entry_file(path: &Path) -> Option<Entry> {
    let mut bytes = Vec::new();
    File::open(path).ok()?.read_to_end(&mut bytes).ok()?;
    match bincode::deserialize(&bytes) {
        Ok(entry) => Some(entry),
        Err(err) => {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                path = %path.display(),
                "unreadable cache entry, treating as absent",
            );
            None
        }
    }
}

fn remove_if_exists(path: &Path) -> Result<(), BackendError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn fingerprint_from_hex(hex: &str) -> Result<Fingerprint, BackendError> {
    let mut bytes = [0u8; 32];
    if hex.len() != 64 {
        return Err(BackendError::Encode(format!("bad fingerprint name {hex:?}")));
    }
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let high = (chunk[0] as char).to_digit(16);
        let low = (chunk[1] as char).to_digit(16);
        match (high, low) {
            (Some(high), Some(low)) => bytes[i] = (high * 16 + low) as u8,
            _ => return Err(BackendError::Encode(format!("bad fingerprint name {hex:?}"))),
        }
    }
    Ok(Fingerprint::from_bytes(bytes))
}
