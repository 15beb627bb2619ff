//! The shared-state backend.
//!
//! Entries live in an external document or key-value store, keyed by the
//! pair `(function_id, key)`, so any number of processes and hosts can share
//! one cache. The store is reached through a [`DocumentStore`] connector
//! supplied as a factory and dialed lazily on first use.
//!
//! The contract pushes atomicity to the store: every [`DocumentStore`]
//! method is a single-key conditional operation (the moral equivalent of a
//! conditional update with a filter) and the backend never holds a
//! client-side lock across round-trips. In-flight markers carry an
//! acquisition timestamp; a marker older than the configured lease counts as
//! abandoned and may be reclaimed by the next caller.
//!
//! [`MemoryStore`] is the reference connector: an in-process map that
//! implements the conditional operations under one mutex. It backs the test
//! suite and documents the exact semantics a real connector must provide.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config;
use crate::entry::{Blob, Claim, Entry};
use crate::error::BackendError;
use crate::key::Fingerprint;

use super::{Backend, WaitOutcome};

/// Poll cadence of [`Backend::wait_until_ready`] against the store.
const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The stored envelope of one entry, as the external store sees it.
///
/// The primary key is `(function_id, key)`; `value` is an opaque serialized
/// blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryDocument {
    pub function_id: String,
    pub key: String,
    #[serde(default)]
    pub value: Option<Blob>,
    #[serde(default)]
    pub timestamp: Option<SystemTime>,
    #[serde(default)]
    pub in_flight: bool,
    #[serde(default)]
    pub stale: bool,
    #[serde(default)]
    pub claimed_at: Option<SystemTime>,
    #[serde(default)]
    pub claim: Option<u64>,
}

impl EntryDocument {
    fn from_entry(function_id: &str, key: &str, entry: Entry) -> EntryDocument {
        EntryDocument {
            function_id: function_id.to_owned(),
            key: key.to_owned(),
            value: entry.value,
            timestamp: entry.timestamp,
            in_flight: entry.in_flight,
            stale: entry.stale,
            claimed_at: entry.claimed_at,
            claim: entry.claim,
        }
    }

    fn into_entry(self) -> Entry {
        Entry {
            value: self.value,
            timestamp: self.timestamp,
            in_flight: self.in_flight,
            stale: self.stale,
            claimed_at: self.claimed_at,
            claim: self.claim,
        }
    }
}

/// A handle on the external store with write permission.
///
/// Implementations must execute each method atomically with respect to
/// concurrent calls for the same `(function_id, key)`; across distinct keys
/// no ordering is required. The backend layers no locking on top.
pub trait DocumentStore: Send + Sync + 'static {
    /// Returns the document for `(function_id, key)`, if any.
    fn find(&self, function_id: &str, key: &str)
        -> Result<Option<EntryDocument>, BackendError>;

    /// Unconditionally inserts or replaces the document identified by
    /// `doc.function_id`/`doc.key`.
    fn upsert(&self, doc: EntryDocument) -> Result<(), BackendError>;

    /// Claims the in-flight marker: inserts a marker document if absent, or
    /// updates an existing document iff `in_flight` is false or the marker's
    /// `claimed_at` is older than `lease`. Returns whether the caller became
    /// the holder.
    fn claim_in_flight(
        &self,
        function_id: &str,
        key: &str,
        claim: u64,
        now: SystemTime,
        lease: Option<Duration>,
    ) -> Result<bool, BackendError>;

    /// Replaces the document iff its recorded claim equals `claim`. Returns
    /// whether the replacement happened.
    fn publish_claimed(&self, doc: EntryDocument, claim: u64) -> Result<bool, BackendError>;

    /// Clears the in-flight marker unconditionally. Marker-only documents
    /// (no value) are deleted outright.
    fn release_in_flight(&self, function_id: &str, key: &str) -> Result<(), BackendError>;

    /// Clears every in-flight marker under `function_id`.
    fn release_all_in_flight(&self, function_id: &str) -> Result<(), BackendError>;

    /// Sets the stale flag iff it is not already set; returns whether this
    /// call set it.
    fn mark_stale(&self, function_id: &str, key: &str) -> Result<bool, BackendError>;

    /// Clears the stale flag.
    fn clear_stale(&self, function_id: &str, key: &str) -> Result<(), BackendError>;

    /// Deletes one document.
    fn delete(&self, function_id: &str, key: &str) -> Result<(), BackendError>;

    /// Deletes every document under `function_id`.
    fn delete_function(&self, function_id: &str) -> Result<(), BackendError>;

    /// Deletes documents under `function_id` whose timestamp is older than
    /// `cutoff`, skipping in-flight ones.
    fn delete_older_than(&self, function_id: &str, cutoff: SystemTime)
        -> Result<(), BackendError>;
}

/// Builds the store handle; invoked lazily on the backend's first use.
pub type ConnectorFactory =
    Arc<dyn Fn() -> Result<Arc<dyn DocumentStore>, BackendError> + Send + Sync>;

pub struct SharedBackend {
    function_id: String,
    factory: ConnectorFactory,
    store: OnceCell<Arc<dyn DocumentStore>>,
    /// Wrapper-level wait override; `None` falls back to the live global.
    wait_override: Option<Duration>,
}

impl SharedBackend {
    pub fn new(
        function_id: String,
        factory: ConnectorFactory,
        wait_override: Option<Duration>,
    ) -> SharedBackend {
        SharedBackend {
            function_id,
            factory,
            store: OnceCell::new(),
            wait_override,
        }
    }

    fn store(&self) -> Result<&Arc<dyn DocumentStore>, BackendError> {
        self.store.get_or_try_init(|| (self.factory)())
    }

    /// The lease on in-flight markers. Zero configures an unbounded lease,
    /// otherwise the wait timeout doubles as the reclaim threshold.
    fn lease(&self) -> Option<Duration> {
        let wait = self
            .wait_override
            .unwrap_or_else(|| config::snapshot().wait_for_calc_timeout);
        (!wait.is_zero()).then_some(wait)
    }
}

impl Backend for SharedBackend {
    fn get(&self, key: &Fingerprint) -> Result<Option<Entry>, BackendError> {
        let doc = self.store()?.find(&self.function_id, &key.as_hex())?;
        Ok(doc.map(EntryDocument::into_entry))
    }

    fn put(&self, key: &Fingerprint, value: Blob, timestamp: SystemTime)
        -> Result<(), BackendError> {
        let doc = EntryDocument::from_entry(
            &self.function_id,
            &key.as_hex(),
            Entry::published(value, timestamp),
        );
        self.store()?.upsert(doc)
    }

    fn publish(
        &self,
        key: &Fingerprint,
        claim: Claim,
        value: Blob,
        timestamp: SystemTime,
    ) -> Result<bool, BackendError> {
        let doc = EntryDocument::from_entry(
            &self.function_id,
            &key.as_hex(),
            Entry::published(value, timestamp),
        );
        self.store()?.publish_claimed(doc, claim.0)
    }

    fn mark_in_flight(&self, key: &Fingerprint) -> Result<Option<Claim>, BackendError> {
        let claim = Claim::next();
        let acquired = self.store()?.claim_in_flight(
            &self.function_id,
            &key.as_hex(),
            claim.0,
            SystemTime::now(),
            self.lease(),
        )?;
        Ok(acquired.then_some(claim))
    }

    fn clear_in_flight(&self, key: &Fingerprint) -> Result<(), BackendError> {
        self.store()?.release_in_flight(&self.function_id, &key.as_hex())
    }

    fn clear_all_in_flight(&self) -> Result<(), BackendError> {
        self.store()?.release_all_in_flight(&self.function_id)
    }

    fn mark_stale(&self, key: &Fingerprint) -> Result<bool, BackendError> {
        self.store()?.mark_stale(&self.function_id, &key.as_hex())
    }

    fn clear_stale(&self, key: &Fingerprint) -> Result<(), BackendError> {
        self.store()?.clear_stale(&self.function_id, &key.as_hex())
    }

    fn clear(&self, key: &Fingerprint) -> Result<(), BackendError> {
        self.store()?.delete(&self.function_id, &key.as_hex())
    }

    fn clear_all(&self) -> Result<(), BackendError> {
        self.store()?.delete_function(&self.function_id)
    }

    fn wait_until_ready(
        &self,
        key: &Fingerprint,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome, BackendError> {
        let hex = key.as_hex();
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match self.store()?.find(&self.function_id, &hex)? {
                None => return Ok(WaitOutcome::Gone),
                Some(doc) if !doc.in_flight => {
                    return Ok(WaitOutcome::Ready(doc.into_entry()))
                }
                Some(_) => {}
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(WaitOutcome::TimedOut);
                }
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    fn delete_stale_entries(&self, older_than: Duration) -> Result<(), BackendError> {
        let Some(cutoff) = SystemTime::now().checked_sub(older_than) else {
            return Ok(());
        };
        self.store()?.delete_older_than(&self.function_id, cutoff)
    }
}

/// An in-process [`DocumentStore`]: the reference implementation of the
/// conditional-operation contract, and the store behind most of the test
/// suite.
#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<(String, String), EntryDocument>>,
}

impl MemoryStore {
    pub fn new() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::default())
    }

    /// A connector factory handing out this store.
    pub fn connector(self: &Arc<Self>) -> ConnectorFactory {
        let store = Arc::clone(self);
        Arc::new(move || Ok(Arc::clone(&store) as Arc<dyn DocumentStore>))
    }

    /// The number of documents held, across all functions.
    pub fn len(&self) -> usize {
        self.docs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DocumentStore for MemoryStore {
    fn find(&self, function_id: &str, key: &str)
        -> Result<Option<EntryDocument>, BackendError> {
        let docs = self.docs.lock();
        Ok(docs.get(&(function_id.to_owned(), key.to_owned())).cloned())
    }

    fn upsert(&self, doc: EntryDocument) -> Result<(), BackendError> {
        let mut docs = self.docs.lock();
        docs.insert((doc.function_id.clone(), doc.key.clone()), doc);
        Ok(())
    }

    fn claim_in_flight(
        &self,
        function_id: &str,
        key: &str,
        claim: u64,
        now: SystemTime,
        lease: Option<Duration>,
    ) -> Result<bool, BackendError> {
        let mut docs = self.docs.lock();
        let slot = (function_id.to_owned(), key.to_owned());
        match docs.get_mut(&slot) {
            Some(doc) if doc.in_flight && !doc.clone().into_entry().claim_expired(lease, now) => {
                Ok(false)
            }
            Some(doc) => {
                doc.in_flight = true;
                doc.claimed_at = Some(now);
                doc.claim = Some(claim);
                Ok(true)
            }
            None => {
                docs.insert(
                    slot,
                    EntryDocument::from_entry(function_id, key, Entry::claimed(Claim(claim), now)),
                );
                Ok(true)
            }
        }
    }

    fn publish_claimed(&self, doc: EntryDocument, claim: u64) -> Result<bool, BackendError> {
        let mut docs = self.docs.lock();
        let slot = (doc.function_id.clone(), doc.key.clone());
        match docs.get(&slot) {
            Some(existing) if existing.claim == Some(claim) => {
                docs.insert(slot, doc);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release_in_flight(&self, function_id: &str, key: &str) -> Result<(), BackendError> {
        let mut docs = self.docs.lock();
        let slot = (function_id.to_owned(), key.to_owned());
        if let Some(doc) = docs.get_mut(&slot) {
            if doc.value.is_some() {
                doc.in_flight = false;
                doc.claimed_at = None;
                doc.claim = None;
            } else {
                docs.remove(&slot);
            }
        }
        Ok(())
    }

    fn release_all_in_flight(&self, function_id: &str) -> Result<(), BackendError> {
        let mut docs = self.docs.lock();
        docs.retain(|(func, _), doc| func != function_id || doc.value.is_some());
        for ((func, _), doc) in docs.iter_mut() {
            if func == function_id {
                doc.in_flight = false;
                doc.claimed_at = None;
                doc.claim = None;
            }
        }
        Ok(())
    }

    fn mark_stale(&self, function_id: &str, key: &str) -> Result<bool, BackendError> {
        let mut docs = self.docs.lock();
        match docs.get_mut(&(function_id.to_owned(), key.to_owned())) {
            Some(doc) if !doc.stale => {
                doc.stale = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn clear_stale(&self, function_id: &str, key: &str) -> Result<(), BackendError> {
        let mut docs = self.docs.lock();
        if let Some(doc) = docs.get_mut(&(function_id.to_owned(), key.to_owned())) {
            doc.stale = false;
        }
        Ok(())
    }

    fn delete(&self, function_id: &str, key: &str) -> Result<(), BackendError> {
        self.docs
            .lock()
            .remove(&(function_id.to_owned(), key.to_owned()));
        Ok(())
    }

    fn delete_function(&self, function_id: &str) -> Result<(), BackendError> {
        self.docs.lock().retain(|(func, _), _| func != function_id);
        Ok(())
    }

    fn delete_older_than(&self, function_id: &str, cutoff: SystemTime)
        -> Result<(), BackendError> {
        self.docs.lock().retain(|(func, _), doc| {
            func != function_id
                || doc.in_flight
                || doc.timestamp.map_or(true, |ts| ts >= cutoff)
        });
        Ok(())
    }
}

/// A connector factory that fails on every dial; the backend surfaces it as
/// unavailability on first use.
pub fn unavailable_connector(reason: impl Into<String>) -> ConnectorFactory {
    let reason = reason.into();
    Arc::new(move || Err(BackendError::Unavailable(reason.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> Fingerprint {
        Fingerprint::from_bytes([byte; 32])
    }

    fn backend(store: &Arc<MemoryStore>, function: &str) -> SharedBackend {
        SharedBackend::new(function.to_owned(), store.connector(), None)
    }

    #[test]
    fn functions_do_not_collide() {
        let store = MemoryStore::new();
        let a = backend(&store, "demo::a");
        let b = backend(&store, "demo::b");
        let now = SystemTime::now();

        a.put(&key(1), b"from-a".to_vec(), now).unwrap();
        assert!(b.get(&key(1)).unwrap().is_none());

        b.put(&key(1), b"from-b".to_vec(), now).unwrap();
        a.clear_all().unwrap();
        assert!(a.get(&key(1)).unwrap().is_none());
        assert_eq!(
            b.get(&key(1)).unwrap().unwrap().value.as_deref(),
            Some(&b"from-b"[..])
        );
    }

    #[test]
    fn claim_is_conditional() {
        let store = MemoryStore::new();
        let backend = backend(&store, "demo::f");

        let claim = backend.mark_in_flight(&key(1)).unwrap().unwrap();
        assert!(backend.mark_in_flight(&key(1)).unwrap().is_none());

        assert!(backend
            .publish(&key(1), claim, b"v".to_vec(), SystemTime::now())
            .unwrap());
        // published entries are claimable again
        assert!(backend.mark_in_flight(&key(1)).unwrap().is_some());
    }

    #[test]
    fn expired_lease_is_reclaimable() {
        let store = MemoryStore::new();
        let backend = SharedBackend::new(
            "demo::f".to_owned(),
            store.connector(),
            Some(Duration::from_millis(50)),
        );

        let stale_claim = backend.mark_in_flight(&key(1)).unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(100));

        // the first producer looks dead; the marker is forcibly reclaimed
        let fresh_claim = backend.mark_in_flight(&key(1)).unwrap().unwrap();

        // and the dead producer's late publish is dropped
        assert!(!backend
            .publish(&key(1), stale_claim, b"late".to_vec(), SystemTime::now())
            .unwrap());
        assert!(backend
            .publish(&key(1), fresh_claim, b"fresh".to_vec(), SystemTime::now())
            .unwrap());
        assert_eq!(
            backend.get(&key(1)).unwrap().unwrap().value.as_deref(),
            Some(&b"fresh"[..])
        );
    }

    #[test]
    fn unbounded_lease_never_reclaims() {
        let store = MemoryStore::new();
        let backend = backend(&store, "demo::f");

        backend.mark_in_flight(&key(1)).unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(backend.mark_in_flight(&key(1)).unwrap().is_none());
    }

    #[test]
    fn lazy_connector_failure_surfaces_as_unavailable() {
        let backend = SharedBackend::new(
            "demo::f".to_owned(),
            unavailable_connector("store is down"),
            None,
        );
        match backend.get(&key(1)) {
            Err(BackendError::Unavailable(reason)) => assert_eq!(reason, "store is down"),
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }

    #[test]
    fn release_in_flight_drops_marker_only_documents() {
        let store = MemoryStore::new();
        let backend = backend(&store, "demo::f");

        backend.mark_in_flight(&key(1)).unwrap().unwrap();
        backend.clear_in_flight(&key(1)).unwrap();
        assert!(backend.get(&key(1)).unwrap().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn delete_older_than_spares_in_flight() {
        let store = MemoryStore::new();
        let backend = backend(&store, "demo::f");
        let now = SystemTime::now();

        backend.put(&key(1), b"old".to_vec(), now - Duration::from_secs(120)).unwrap();
        backend.put(&key(2), b"new".to_vec(), now).unwrap();
        backend.mark_in_flight(&key(3)).unwrap().unwrap();

        backend.delete_stale_entries(Duration::from_secs(60)).unwrap();
        assert!(backend.get(&key(1)).unwrap().is_none());
        assert!(backend.get(&key(2)).unwrap().is_some());
        assert!(backend.get(&key(3)).unwrap().is_some());
    }
}
