//! Storage backends.
//!
//! A backend stores the entries of exactly one function; its scope is fixed
//! at construction. The orchestrator drives it through the [`Backend`] trait
//! and treats values as opaque bytes.
//!
//! Backends may relax timeliness but not atomicity: [`Backend::put`],
//! [`Backend::publish`] and [`Backend::mark_in_flight`] are linearizable per
//! key, while [`Backend::get`] may observe a slightly stale but never torn
//! record.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use crate::entry::{Blob, Claim, Entry};
use crate::error::BackendError;
use crate::key::Fingerprint;

pub mod fs;
pub mod memory;
pub mod shared;

/// The result of waiting on another producer's in-flight computation.
#[derive(Debug)]
pub enum WaitOutcome {
    /// The producer finished; this is the entry it left behind.
    Ready(Entry),
    /// The wait deadline elapsed with the computation still in flight.
    TimedOut,
    /// The entry vanished mid-wait (a concurrent clear).
    Gone,
}

/// Storage operations over one function's entries.
pub trait Backend: Send + Sync + 'static {
    /// Returns the latest published state visible to this process. The
    /// record may still carry an in-flight marker.
    fn get(&self, key: &Fingerprint) -> Result<Option<Entry>, BackendError>;

    /// Atomic unconditional replace: the entry becomes
    /// `(value, timestamp, in_flight=false, stale=false)`. Used by precache
    /// and overwrite, which are user-initiated replacements.
    fn put(&self, key: &Fingerprint, value: Blob, timestamp: SystemTime)
        -> Result<(), BackendError>;

    /// A producer's conditional replace: stores like [`put`](Self::put) iff
    /// the backend still records `claim` as the holder of the in-flight
    /// marker. Returns whether the value was stored; a `false` means the
    /// entry was cleared or reclaimed while computing and the result is
    /// silently dropped.
    fn publish(
        &self,
        key: &Fingerprint,
        claim: Claim,
        value: Blob,
        timestamp: SystemTime,
    ) -> Result<bool, BackendError>;

    /// Atomically claims the in-flight marker. Returns the claim when the
    /// caller became the sole producer, `None` when another producer holds
    /// it.
    fn mark_in_flight(&self, key: &Fingerprint) -> Result<Option<Claim>, BackendError>;

    /// Unconditionally clears the in-flight marker; used after abandonment.
    fn clear_in_flight(&self, key: &Fingerprint) -> Result<(), BackendError>;

    /// Clears every in-flight marker under this function's scope; recovery
    /// after crashed producers.
    fn clear_all_in_flight(&self) -> Result<(), BackendError>;

    /// Atomically sets the stale flag. A `true` return means the caller
    /// should dispatch the fire-and-forget recomputation; `false` means one
    /// is already pending.
    fn mark_stale(&self, key: &Fingerprint) -> Result<bool, BackendError>;

    /// Clears the stale flag without storing; used when a background
    /// recomputation fails or declines to store.
    fn clear_stale(&self, key: &Fingerprint) -> Result<(), BackendError>;

    /// Removes the entry for `key`.
    fn clear(&self, key: &Fingerprint) -> Result<(), BackendError>;

    /// Removes every entry under this function's scope.
    fn clear_all(&self) -> Result<(), BackendError>;

    /// Blocks until the in-flight marker for `key` clears, the entry
    /// disappears, or the deadline elapses. `None` means the backend's own
    /// default wait.
    fn wait_until_ready(
        &self,
        key: &Fingerprint,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome, BackendError>;

    /// Removes entries whose value is older than `older_than`.
    fn delete_stale_entries(&self, older_than: Duration) -> Result<(), BackendError>;

    /// The on-disk directory backing this function, for backends that have
    /// one.
    fn cache_dir(&self) -> Option<PathBuf> {
        None
    }
}
