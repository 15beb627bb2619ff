//! The memoization orchestrator.
//!
//! [`Memoized`] wraps a function and drives every call through the decision
//! machine: consult the effective configuration, fingerprint the arguments,
//! look the entry up, and serve a hit, coalesce onto another producer, or
//! claim the key and compute. Concurrent callers of a cold key agree on a
//! single producer through the backend's in-flight marker; stale hits under
//! the serve-stale policy return the old value and dispatch a deduplicated
//! background refresh.
//!
//! Caching failures are deliberately quieter than user-function failures: a
//! result that cannot be serialized or stored is still returned to the
//! caller with a warning, while an error from the wrapped function releases
//! the claim and propagates unchanged.

use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::backend::fs::FsBackend;
use crate::backend::memory::MemoryBackend;
use crate::backend::shared::{ConnectorFactory, SharedBackend};
use crate::backend::{Backend, WaitOutcome};
use crate::config::{self, BackendSelector};
use crate::entry::{Blob, Claim, Entry};
use crate::error::{BackendError, Error, Result};
use crate::key::{Args, DefaultKeyMaker, Fingerprint, FunctionId, KeyMaker, ResolvedArgs, Signature};
use crate::metrics::{FunctionStats, StatsSnapshot};
use crate::pool;
use crate::utils::CallOnDrop;

/// Per-call overrides. None of these reach the wrapped function.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Bypass the cache entirely: no read, no write, just invoke.
    pub ignore_cache: bool,
    /// Invoke, then unconditionally replace the stored entry on success.
    /// Loses to `ignore_cache` when both are set.
    pub overwrite_cache: bool,
    /// Emit the decision taken for this call as an info-level trace event.
    pub verbose: bool,
    /// Store a null result for this call, overriding the configured policy.
    pub allow_none: Option<bool>,
    /// An additional freshness cap for this call; the effective staleness
    /// bound becomes `min(stale_after, max_age)`. Zero forces recomputation.
    pub max_age: Option<Duration>,
}

/// Wrapper-level overrides of the live global parameters.
#[derive(Debug, Clone, Default)]
struct Overrides {
    stale_after: Option<Duration>,
    serve_stale: Option<bool>,
    wait_for_calc_timeout: Option<Duration>,
    allow_none: Option<bool>,
    entry_size_limit: Option<u64>,
    cleanup_stale: Option<bool>,
    cleanup_interval: Option<Duration>,
}

/// The parameters one call runs under, resolved from per-call options,
/// wrapper overrides, and the live globals, in that order.
struct EffectiveParams {
    caching_enabled: bool,
    stale_after: Duration,
    /// `min(stale_after, max_age)`.
    stale_bound: Duration,
    /// A zero `max_age` unconditionally forces recomputation.
    force_stale: bool,
    serve_stale: bool,
    /// `None` leaves the backend its own default wait.
    wait_timeout: Option<Duration>,
    allow_none: bool,
    entry_size_limit: Option<u64>,
    cleanup_stale: bool,
    cleanup_interval: Duration,
    verbose: bool,
}

struct Inner<T> {
    id: FunctionId,
    signature: Signature,
    key_maker: Arc<dyn KeyMaker>,
    backend: Arc<dyn Backend>,
    func: Box<dyn Fn(&ResolvedArgs) -> anyhow::Result<T> + Send + Sync>,
    overrides: Overrides,
    stats: FunctionStats,
    last_cleanup: parking_lot::Mutex<Option<Instant>>,
}

/// A memoized function.
///
/// Cheap to clone; clones share the cache, the statistics, and the wrapped
/// function.
pub struct Memoized<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Memoized<T> {
    fn clone(&self) -> Self {
        Memoized {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Memoized<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memoized")
            .field("id", &self.inner.id)
            .field("backend_dir", &self.inner.backend.cache_dir())
            .finish()
    }
}

impl<T> Memoized<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    /// Starts building a wrapper for the function identified by `id`.
    pub fn builder(id: FunctionId) -> MemoizedBuilder<T> {
        MemoizedBuilder {
            id,
            params: Vec::new(),
            defaults: Vec::new(),
            bad_default: None,
            is_method: false,
            key_maker: None,
            backend: None,
            cache_dir: None,
            separate_files: None,
            watch: None,
            connector: None,
            overrides: Overrides::default(),
            _output: PhantomData,
        }
    }

    /// Calls the wrapped function through the cache.
    pub fn call(&self, args: Args) -> Result<T> {
        self.call_with(args, CallOptions::default())
    }

    /// Calls the wrapped function through the cache with per-call overrides.
    pub fn call_with(&self, args: Args, opts: CallOptions) -> Result<T> {
        let resolved = self.inner.signature.resolve(args)?;
        self.call_resolved(&resolved, &opts)
    }

    fn call_resolved(&self, args: &ResolvedArgs, opts: &CallOptions) -> Result<T> {
        let eff = self.effective(opts);
        self.maybe_schedule_cleanup(&eff);

        if opts.ignore_cache || !eff.caching_enabled {
            self.trace(&eff, None, "bypass");
            return self.invoke(args);
        }

        let key = self.inner.key_maker.make_key(args)?;

        if opts.overwrite_cache {
            self.trace(&eff, Some(&key), "overwrite");
            self.inner.stats.record_recomputation();
            let value = self.invoke(args)?;
            self.try_store_unconditional(&key, &value, &eff);
            return Ok(value);
        }

        let entry = match self.inner.backend.get(&key) {
            Ok(entry) => entry,
            Err(BackendError::Unavailable(reason)) => {
                return Err(Error::BackendUnavailable(BackendError::Unavailable(reason)))
            }
            Err(err) => {
                tracing::warn!(
                    function = %self.inner.id,
                    error = &err as &dyn std::error::Error,
                    "cache read failed, treating as miss",
                );
                None
            }
        };

        let Some(entry) = entry else {
            self.inner.stats.record_miss();
            self.trace(&eff, Some(&key), "miss");
            return self.compute_claimed(args, &key, &eff);
        };

        match self.decode_usable(&entry, &eff) {
            Some(value) => {
                let now = SystemTime::now();
                let fresh = !eff.force_stale
                    && entry.age(now).is_some_and(|age| age <= eff.stale_bound);
                if fresh {
                    self.inner.stats.record_hit();
                    self.trace(&eff, Some(&key), "hit");
                    return Ok(value);
                }

                if eff.serve_stale {
                    if entry.in_flight {
                        self.trace(&eff, Some(&key), "stale-served, recompute in flight");
                    } else {
                        match self.inner.backend.mark_stale(&key) {
                            Ok(true) => {
                                self.trace(&eff, Some(&key), "stale-served, refresh dispatched");
                                self.spawn_refresh(args, key);
                            }
                            Ok(false) => {
                                self.trace(&eff, Some(&key), "stale-served, refresh pending")
                            }
                            Err(err) => tracing::warn!(
                                function = %self.inner.id,
                                error = &err as &dyn std::error::Error,
                                "failed to flag stale entry, skipping refresh",
                            ),
                        }
                    }
                    self.inner.stats.record_stale_served();
                    return Ok(value);
                }

                if entry.in_flight {
                    self.trace(&eff, Some(&key), "stale, joining recompute");
                    return match self.wait_for_producer(args, &key, &eff)? {
                        Waited::Value(value) => Ok(value),
                        Waited::Retry => self.compute_claimed(args, &key, &eff),
                    };
                }

                self.trace(&eff, Some(&key), "stale, recomputing");
                self.compute_claimed(args, &key, &eff)
            }
            None => {
                if entry.in_flight {
                    self.trace(&eff, Some(&key), "in flight, waiting");
                    return match self.wait_for_producer(args, &key, &eff)? {
                        Waited::Value(value) => Ok(value),
                        Waited::Retry => self.compute_claimed(args, &key, &eff),
                    };
                }
                self.inner.stats.record_miss();
                self.trace(&eff, Some(&key), "miss, no usable value");
                self.compute_claimed(args, &key, &eff)
            }
        }
    }

    /// Claims the key and computes, or coalesces onto whoever holds the
    /// claim.
    fn compute_claimed(
        &self,
        args: &ResolvedArgs,
        key: &Fingerprint,
        eff: &EffectiveParams,
    ) -> Result<T> {
        loop {
            match self.inner.backend.mark_in_flight(key) {
                Ok(Some(claim)) => return self.produce(args, key, claim, eff),
                Ok(None) => match self.wait_for_producer(args, key, eff)? {
                    Waited::Value(value) => return Ok(value),
                    Waited::Retry => continue,
                },
                Err(BackendError::Unavailable(reason)) => {
                    return Err(Error::BackendUnavailable(BackendError::Unavailable(reason)))
                }
                Err(err) => {
                    tracing::warn!(
                        function = %self.inner.id,
                        error = &err as &dyn std::error::Error,
                        "cannot coordinate producers, invoking uncoordinated",
                    );
                    self.inner.stats.record_recomputation();
                    let value = self.invoke(args)?;
                    self.try_store_unconditional(key, &value, eff);
                    return Ok(value);
                }
            }
        }
    }

    /// The sole-producer path: invoke, then publish under the claim.
    ///
    /// The claim is released on every exit path, including a panicking user
    /// function, via a drop guard; a successful publish clears it itself and
    /// disarms the guard.
    fn produce(
        &self,
        args: &ResolvedArgs,
        key: &Fingerprint,
        claim: Claim,
        eff: &EffectiveParams,
    ) -> Result<T> {
        self.inner.stats.record_recomputation();

        let release = {
            let backend = Arc::clone(&self.inner.backend);
            let id = self.inner.id.clone();
            let key = *key;
            CallOnDrop::new(move || {
                if let Err(err) = backend.clear_in_flight(&key) {
                    tracing::warn!(
                        function = %id,
                        error = &err as &dyn std::error::Error,
                        "failed to release abandoned claim",
                    );
                }
            })
        };

        let value = self.invoke(args)?;

        match self.encode_for_store(&value, eff) {
            Some(bytes) => {
                match self
                    .inner
                    .backend
                    .publish(key, claim, bytes, SystemTime::now())
                {
                    Ok(true) => release.disarm(),
                    Ok(false) => {
                        // The claim is already gone; clearing again could
                        // release a successor's marker.
                        release.disarm();
                        self.trace(eff, Some(key), "publish dropped, entry was cleared");
                    }
                    Err(err) => tracing::warn!(
                        function = %self.inner.id,
                        error = &err as &dyn std::error::Error,
                        "failed to store result, returning it uncached",
                    ),
                }
            }
            None => {}
        }
        Ok(value)
    }

    /// Waits on another producer. A timeout degrades to direct invocation
    /// without storing; the owning producer will publish.
    fn wait_for_producer(
        &self,
        args: &ResolvedArgs,
        key: &Fingerprint,
        eff: &EffectiveParams,
    ) -> Result<Waited<T>> {
        match self.inner.backend.wait_until_ready(key, eff.wait_timeout) {
            Ok(WaitOutcome::Ready(entry)) => match self.decode_usable(&entry, eff) {
                Some(value) => {
                    self.inner.stats.record_hit();
                    self.trace(eff, Some(key), "coalesced on another producer");
                    Ok(Waited::Value(value))
                }
                None => Ok(Waited::Retry),
            },
            Ok(WaitOutcome::Gone) => Ok(Waited::Retry),
            Ok(WaitOutcome::TimedOut) => {
                self.inner.stats.record_wait_timeout();
                self.trace(eff, Some(key), "wait timed out, invoking directly");
                self.inner.stats.record_recomputation();
                self.invoke(args).map(Waited::Value)
            }
            Err(BackendError::Unavailable(reason)) => {
                Err(Error::BackendUnavailable(BackendError::Unavailable(reason)))
            }
            Err(err) => {
                tracing::warn!(
                    function = %self.inner.id,
                    error = &err as &dyn std::error::Error,
                    "wait on producer failed, invoking directly",
                );
                self.inner.stats.record_recomputation();
                self.invoke(args).map(Waited::Value)
            }
        }
    }

    /// Dispatches the fire-and-forget recomputation of a stale entry.
    ///
    /// The task recomputes and unconditionally replaces the entry; if it
    /// fails or declines to store, the stale flag is dropped so a later call
    /// can dispatch again.
    fn spawn_refresh(&self, args: &ResolvedArgs, key: Fingerprint) {
        self.inner.stats.record_background_refresh();
        let this = self.clone();
        let args = args.clone();
        pool::submit(Box::new(move || {
            let eff = this.effective(&CallOptions::default());
            this.inner.stats.record_recomputation();
            let stored = match this.invoke(&args) {
                Ok(value) => this.try_store_unconditional(&key, &value, &eff),
                Err(err) => {
                    tracing::error!(
                        function = %this.inner.id,
                        error = %err,
                        "background recomputation failed",
                    );
                    false
                }
            };
            if !stored {
                if let Err(err) = this.inner.backend.clear_stale(&key) {
                    tracing::warn!(
                        function = %this.inner.id,
                        error = &err as &dyn std::error::Error,
                        "failed to unflag stale entry",
                    );
                }
            }
        }));
    }

    /// Runs the wrapped function, timing it whether it succeeds or fails.
    fn invoke(&self, args: &ResolvedArgs) -> Result<T> {
        let started = Instant::now();
        let result = (self.inner.func)(args).map_err(Error::UserFunction);
        self.inner.stats.record_invocation(started.elapsed());
        result
    }

    /// Serializes a value for storage, or `None` when the value must not be
    /// stored (unserializable, null without `allow_none`, or over the size
    /// limit). Only the first case is abnormal enough to warn about.
    fn encode_for_store(&self, value: &T, eff: &EffectiveParams) -> Option<Blob> {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.inner.stats.record_serialization_error();
                tracing::warn!(
                    function = %self.inner.id,
                    error = &err as &dyn std::error::Error,
                    "result cannot be serialized, returning it uncached",
                );
                return None;
            }
        };
        if bytes == b"null" && !eff.allow_none {
            return None;
        }
        if let Some(limit) = eff.entry_size_limit {
            if bytes.len() as u64 > limit {
                self.inner.stats.record_size_limit_rejection();
                tracing::debug!(
                    function = %self.inner.id,
                    size = bytes.len(),
                    limit,
                    "result exceeds the entry size limit, not cached",
                );
                return None;
            }
        }
        Some(bytes)
    }

    /// Stores outside any claim (overwrite, precache-like paths, background
    /// refresh). Returns whether a value was stored.
    fn try_store_unconditional(&self, key: &Fingerprint, value: &T, eff: &EffectiveParams) -> bool {
        let Some(bytes) = self.encode_for_store(value, eff) else {
            return false;
        };
        match self.inner.backend.put(key, bytes, SystemTime::now()) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(
                    function = %self.inner.id,
                    error = &err as &dyn std::error::Error,
                    "failed to store result, returning it uncached",
                );
                false
            }
        }
    }

    /// Decodes the entry's value, unless it is absent, a null the policy
    /// refuses to serve, or undecodable (all of which read as "no result").
    fn decode_usable(&self, entry: &Entry, eff: &EffectiveParams) -> Option<T> {
        let bytes = entry.value.as_ref()?;
        if bytes == b"null" && !eff.allow_none {
            return None;
        }
        match serde_json::from_slice(bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(
                    function = %self.inner.id,
                    error = &err as &dyn std::error::Error,
                    "stored value is undecodable, recomputing",
                );
                None
            }
        }
    }

    fn effective(&self, opts: &CallOptions) -> EffectiveParams {
        let global = config::snapshot();
        let over = &self.inner.overrides;

        let stale_after = over.stale_after.unwrap_or(global.stale_after);
        let (stale_bound, force_stale) = match opts.max_age {
            Some(max_age) if max_age.is_zero() => (Duration::ZERO, true),
            Some(max_age) => (stale_after.min(max_age), false),
            None => (stale_after, false),
        };
        let wait = over
            .wait_for_calc_timeout
            .unwrap_or(global.wait_for_calc_timeout);

        EffectiveParams {
            caching_enabled: global.caching_enabled,
            stale_after,
            stale_bound,
            force_stale,
            serve_stale: over.serve_stale.unwrap_or(global.serve_stale),
            wait_timeout: (!wait.is_zero()).then_some(wait),
            allow_none: opts
                .allow_none
                .or(over.allow_none)
                .unwrap_or(global.allow_none),
            entry_size_limit: over.entry_size_limit.or(global.entry_size_limit),
            cleanup_stale: over.cleanup_stale.unwrap_or(global.cleanup_stale),
            cleanup_interval: over.cleanup_interval.unwrap_or(global.cleanup_interval),
            verbose: opts.verbose,
        }
    }

    fn maybe_schedule_cleanup(&self, eff: &EffectiveParams) {
        if !eff.cleanup_stale {
            return;
        }
        {
            let mut last = self.inner.last_cleanup.lock();
            let now = Instant::now();
            let due = last.map_or(true, |at| now.duration_since(at) >= eff.cleanup_interval);
            if !due {
                return;
            }
            *last = Some(now);
        }
        let this = self.clone();
        let older_than = eff.stale_after;
        pool::submit(Box::new(move || {
            if let Err(err) = this.inner.backend.delete_stale_entries(older_than) {
                tracing::warn!(
                    function = %this.inner.id,
                    error = &err as &dyn std::error::Error,
                    "stale-entry cleanup failed",
                );
            }
        }));
    }

    fn trace(&self, eff: &EffectiveParams, key: Option<&Fingerprint>, decision: &str) {
        let key = key.map(|k| k.to_string());
        let key = key.as_deref().unwrap_or("-");
        if eff.verbose {
            tracing::info!(function = %self.inner.id, key, decision, "cache decision");
        } else {
            tracing::trace!(function = %self.inner.id, key, decision, "cache decision");
        }
    }

    /// Removes every entry of this function.
    pub fn clear_cache(&self) -> Result<()> {
        self.inner.backend.clear_all().map_err(Error::BackendUnavailable)
    }

    /// Removes the entry for one argument tuple.
    pub fn clear_cache_by_args(&self, args: Args) -> Result<()> {
        let resolved = self.inner.signature.resolve(args)?;
        let key = self.inner.key_maker.make_key(&resolved)?;
        self.inner.backend.clear(&key).map_err(Error::BackendUnavailable)
    }

    /// Clears every in-flight marker of this function; recovery after a
    /// producer died without releasing its claim.
    pub fn clear_in_flight(&self) -> Result<()> {
        self.inner
            .backend
            .clear_all_in_flight()
            .map_err(Error::BackendUnavailable)
    }

    /// Inserts a value without invoking the function, timestamped now. A
    /// precached value is indistinguishable from a computed one.
    pub fn precache(&self, args: Args, value: &T) -> Result<()> {
        let resolved = self.inner.signature.resolve(args)?;
        let key = self.inner.key_maker.make_key(&resolved)?;
        let bytes =
            serde_json::to_vec(value).map_err(|err| Error::Serialization(err.to_string()))?;
        self.inner
            .backend
            .put(&key, bytes, SystemTime::now())
            .map_err(Error::BackendUnavailable)
    }

    /// Deletes entries older than `older_than`.
    pub fn delete_stale_entries(&self, older_than: Duration) -> Result<()> {
        self.inner
            .backend
            .delete_stale_entries(older_than)
            .map_err(Error::BackendUnavailable)
    }

    /// The directory backing this function's cache, for the file backend.
    pub fn cache_dpath(&self) -> Option<PathBuf> {
        self.inner.backend.cache_dir()
    }

    /// This function's cache counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// The identity this wrapper caches under.
    pub fn id(&self) -> &FunctionId {
        &self.inner.id
    }
}

enum Waited<T> {
    Value(T),
    Retry,
}

/// Configures and builds a [`Memoized`] wrapper.
pub struct MemoizedBuilder<T> {
    id: FunctionId,
    params: Vec<String>,
    defaults: Vec<(String, Value)>,
    bad_default: Option<String>,
    is_method: bool,
    key_maker: Option<Arc<dyn KeyMaker>>,
    backend: Option<BackendSelector>,
    cache_dir: Option<PathBuf>,
    separate_files: Option<bool>,
    watch: Option<bool>,
    connector: Option<ConnectorFactory>,
    overrides: Overrides,
    _output: PhantomData<fn() -> T>,
}

impl<T> MemoizedBuilder<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    /// Declares the function's parameter names, in order. Positional
    /// arguments bind to these names for fingerprinting.
    pub fn params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    /// Declares a default for a parameter, so calls relying on the default
    /// and calls passing it explicitly share an entry.
    pub fn default_arg(mut self, name: impl Into<String>, value: impl Serialize) -> Self {
        let name = name.into();
        match serde_json::to_value(value) {
            Ok(value) => self.defaults.push((name, value)),
            Err(err) => {
                self.bad_default
                    .get_or_insert_with(|| format!("default for `{name}`: {err}"));
            }
        }
        self
    }

    /// Marks the first declared parameter as the receiver: it is passed to
    /// the function but excluded from the fingerprint, so caching is per
    /// function, not per receiver.
    pub fn is_method(mut self, is_method: bool) -> Self {
        self.is_method = is_method;
        self
    }

    /// Replaces the fingerprinter for this wrapper.
    pub fn key_maker(mut self, key_maker: Arc<dyn KeyMaker>) -> Self {
        self.key_maker = Some(key_maker);
        self
    }

    /// Chooses the storage backend. An explicit choice always wins; without
    /// one, a supplied connector factory selects the shared backend.
    pub fn backend(mut self, backend: BackendSelector) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Root directory for the file backend.
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// File backend layout: one file per entry.
    pub fn separate_files(mut self, separate_files: bool) -> Self {
        self.separate_files = Some(separate_files);
        self
    }

    /// Whether the file backend watches its directory for external changes.
    pub fn watch(mut self, watch: bool) -> Self {
        self.watch = Some(watch);
        self
    }

    /// Supplies the shared-store connector factory. Wrappers without an
    /// explicit backend choice then bind to the shared backend.
    pub fn connector(mut self, factory: ConnectorFactory) -> Self {
        self.connector = Some(factory);
        self
    }

    /// Age beyond which a cached value counts as stale.
    pub fn stale_after(mut self, stale_after: Duration) -> Self {
        self.overrides.stale_after = Some(stale_after);
        self
    }

    /// On a stale hit, return the old value and refresh in the background.
    pub fn serve_stale(mut self, serve_stale: bool) -> Self {
        self.overrides.serve_stale = Some(serve_stale);
        self
    }

    /// How long to wait on another producer before computing directly.
    /// Zero restores the backend default; see
    /// [`GlobalConfig::wait_for_calc_timeout`](crate::GlobalConfig::wait_for_calc_timeout).
    pub fn wait_for_calc_timeout(mut self, timeout: Duration) -> Self {
        self.overrides.wait_for_calc_timeout = Some(timeout);
        self
    }

    /// Store null results instead of recomputing them every call.
    pub fn allow_none(mut self, allow_none: bool) -> Self {
        self.overrides.allow_none = Some(allow_none);
        self
    }

    /// Largest serialized value to store, in bytes.
    pub fn entry_size_limit(mut self, limit: u64) -> Self {
        self.overrides.entry_size_limit = Some(limit);
        self
    }

    /// Periodically delete entries older than the staleness window.
    pub fn cleanup_stale(mut self, cleanup_stale: bool) -> Self {
        self.overrides.cleanup_stale = Some(cleanup_stale);
        self
    }

    /// Minimum time between cleanup runs.
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.overrides.cleanup_interval = Some(interval);
        self
    }

    /// Builds the wrapper around `func`.
    ///
    /// Build-time parameters (backend, location, layout, fingerprinter) are
    /// resolved against the globals now; live parameters are re-resolved on
    /// every call.
    pub fn build<F>(self, func: F) -> Result<Memoized<T>>
    where
        F: Fn(&ResolvedArgs) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        if let Some(reason) = self.bad_default {
            return Err(Error::Config(reason));
        }

        let global = config::snapshot();
        let connector = self.connector.or_else(config::default_connector_factory);
        // An explicit backend choice wins, like every other build-time
        // parameter; a connector implies the shared backend only for
        // wrappers that left the choice open.
        let selector = self.backend.unwrap_or_else(|| {
            if connector.is_some() {
                BackendSelector::SharedDoc
            } else {
                global.backend
            }
        });

        let backend: Arc<dyn Backend> = match selector {
            BackendSelector::File => {
                let root = self.cache_dir.unwrap_or(global.cache_dir);
                let dir = root.join(self.id.dir_name());
                let separate = self.separate_files.unwrap_or(global.separate_files);
                let watch = self.watch.unwrap_or(global.watch);
                Arc::new(
                    FsBackend::new(dir, separate, watch).map_err(Error::BackendUnavailable)?,
                )
            }
            BackendSelector::InMemory => Arc::new(MemoryBackend::new()),
            BackendSelector::SharedDoc | BackendSelector::Relational => {
                let factory = connector.ok_or_else(|| {
                    Error::Config(format!(
                        "the {selector} backend needs a store connector factory"
                    ))
                })?;
                Arc::new(SharedBackend::new(
                    self.id.qualified(),
                    factory,
                    self.overrides.wait_for_calc_timeout,
                ))
            }
        };

        let key_maker = self
            .key_maker
            .or_else(config::default_key_maker)
            .unwrap_or_else(|| Arc::new(DefaultKeyMaker));

        Ok(Memoized {
            inner: Arc::new(Inner {
                id: self.id,
                signature: Signature::new(self.params, self.defaults, self.is_method),
                key_maker,
                backend,
                func: Box::new(func),
                overrides: self.overrides,
                stats: FunctionStats::default(),
                last_cleanup: parking_lot::Mutex::new(None),
            }),
        })
    }
}
