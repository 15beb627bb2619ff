//! # Persistent, stale-aware function memoization
//!
//! permacache wraps expensive functions and persists their results, keyed by
//! a deterministic fingerprint of the call arguments. Results survive the
//! process, can be shared between processes through the filesystem, and
//! between hosts through an external store. Concurrent callers of a cold key
//! coalesce onto a single computation.
//!
//! ## Layers
//!
//! A call travels through the following pieces:
//!
//! - The [`Memoized`] orchestrator resolves the effective configuration,
//!   fingerprints the arguments (positional and named spellings of the same
//!   call canonicalize to the same [`Fingerprint`], and a declared receiver
//!   parameter is elided), and runs the hit/miss/stale/in-flight decision
//!   machine.
//! - A storage [`Backend`](backend::Backend) owns the entries of one
//!   function. The file backend keeps per-function directories with advisory
//!   file locks, atomic-by-rename writes, and a directory watch; the shared
//!   backend talks to an external document store through a
//!   [`DocumentStore`](backend::shared::DocumentStore) connector with
//!   lease-based in-flight markers; the in-memory backend is a mutexed map
//!   with condvar coalescing.
//! - The [`config`] registry holds process-wide defaults. Live parameters
//!   (staleness policy, wait timeout, null caching, the global kill switch)
//!   apply to every wrapper immediately; build-time parameters (backend,
//!   location, layout) bind when a wrapper is built.
//! - The background [`pool`] runs fire-and-forget recomputations for the
//!   serve-stale policy and periodic stale-entry cleanup.
//!
//! ## Staleness
//!
//! An entry older than `stale_after` is stale. A stale hit either recomputes
//! synchronously (the default) or, under the serve-stale policy, returns the
//! old value immediately and refreshes in the background, deduplicated
//! across callers and processes by the backend's stale flag.
//!
//! ## Example
//!
//! ```
//! use std::time::Duration;
//! use permacache::{args, BackendSelector, FunctionId, Memoized};
//!
//! # fn main() -> permacache::Result<()> {
//! let add = Memoized::builder(FunctionId::new("docs::demo", "add"))
//!     .params(["x", "y"])
//!     .backend(BackendSelector::InMemory)
//!     .stale_after(Duration::from_secs(3600))
//!     .build(|args| {
//!         let x: i64 = args.get("x")?;
//!         let y: i64 = args.get("y")?;
//!         Ok(x + y)
//!     })?;
//!
//! assert_eq!(add.call(args![2, 3])?, 5);
//! // positional and named spellings share one cache entry
//! assert_eq!(add.call(args![2, "y" => 3])?, 5);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
mod entry;
mod error;
mod key;
mod memoized;
mod metrics;
pub mod pool;
mod utils;

pub use config::{
    configure, default_cache_root, disable_caching, enable_caching, load_from_path,
    set_connector_factory, set_default_key_maker, snapshot, BackendSelector, GlobalConfig,
};
pub use entry::{Blob, Claim, Entry};
pub use error::{BackendError, Error, KeyError, Result};
pub use key::{
    Args, DefaultKeyMaker, Fingerprint, FunctionId, KeyMaker, ResolvedArgs, Signature,
};
pub use memoized::{CallOptions, Memoized, MemoizedBuilder};
pub use metrics::StatsSnapshot;
pub use utils::{parse_bytes, CallOnDrop};

#[cfg(test)]
mod tests;
