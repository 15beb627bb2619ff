use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::utils::age_of;

/// The serialized bytes of a cached value.
///
/// Backends treat values as opaque; the orchestrator owns the codec.
pub type Blob = Vec<u8>;

/// A producer's claim on an in-flight computation.
///
/// Handed out by [`Backend::mark_in_flight`](crate::backend::Backend::mark_in_flight)
/// and required to publish the result. A claim becomes worthless when the
/// entry is cleared or the claim is reclaimed after a lease expiry, which is
/// how a cleared entry wins over a late producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim(pub(crate) u64);

impl Claim {
    /// Produces a token unique across processes sharing a backend.
    pub(crate) fn next() -> Claim {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let count = COUNTER.fetch_add(1, Ordering::Relaxed);
        Claim(((process::id() as u64) << 32) | (count & 0xffff_ffff))
    }

    pub fn token(&self) -> u64 {
        self.0
    }
}

/// The stored record for one (function identity, fingerprint) pair.
///
/// At most one logical entry exists per pair; backends replace it atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The serialized result, absent until a producer has published one.
    #[serde(default)]
    pub value: Option<Blob>,

    /// When the value was produced. Set at completion of the producing call,
    /// never when the claim is placed.
    #[serde(default)]
    pub timestamp: Option<SystemTime>,

    /// True while a producer has claimed this key and not yet published.
    #[serde(default)]
    pub in_flight: bool,

    /// True while a background recomputation is running for an entry that
    /// still serves its previous value. Suppresses duplicate refresh
    /// dispatches.
    #[serde(default)]
    pub stale: bool,

    /// When the current in-flight claim was placed; lease bookkeeping.
    #[serde(default)]
    pub claimed_at: Option<SystemTime>,

    /// The token of the current in-flight claim.
    #[serde(default)]
    pub claim: Option<u64>,
}

impl Entry {
    /// A marker-only entry for a fresh claim.
    pub(crate) fn claimed(claim: Claim, now: SystemTime) -> Entry {
        Entry {
            value: None,
            timestamp: None,
            in_flight: true,
            stale: false,
            claimed_at: Some(now),
            claim: Some(claim.0),
        }
    }

    /// A published entry holding a completed result.
    pub(crate) fn published(value: Blob, timestamp: SystemTime) -> Entry {
        Entry {
            value: Some(value),
            timestamp: Some(timestamp),
            in_flight: false,
            stale: false,
            claimed_at: None,
            claim: None,
        }
    }

    /// Places an in-flight claim on this entry, retaining any published value
    /// so waiters relying on the return-old-value policy keep working.
    pub(crate) fn with_claim(mut self, claim: Claim, now: SystemTime) -> Entry {
        self.in_flight = true;
        self.claimed_at = Some(now);
        self.claim = Some(claim.0);
        self
    }

    /// Drops the in-flight marker without touching the value.
    pub(crate) fn released(mut self) -> Entry {
        self.in_flight = false;
        self.claimed_at = None;
        self.claim = None;
        self
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    /// The age of the published value, if one exists.
    pub fn age(&self, now: SystemTime) -> Option<Duration> {
        self.timestamp.map(|ts| age_of(ts, now))
    }

    /// Whether the in-flight claim has outlived the given lease.
    pub(crate) fn claim_expired(&self, lease: Option<Duration>, now: SystemTime) -> bool {
        match (self.in_flight, self.claimed_at, lease) {
            (true, Some(claimed_at), Some(lease)) => age_of(claimed_at, now) > lease,
            _ => false,
        }
    }
}
