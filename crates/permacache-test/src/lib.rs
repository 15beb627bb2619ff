//! Helpers for testing permacache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This sets up the logger so that console
//!    output is captured by the test runner.
//!
//!  - When using [`tempdir`], hold the handle for the entire lifetime of the
//!    test; dropping it deletes the directory under the cache's feet. Assign
//!    it to a variable in the test function (e.g. `let _dir = tempdir()`).
//!
//!  - Tests that *mutate* the process-wide cache configuration must hold
//!    [`exclusive_config`] for their duration; tests that merely rely on the
//!    defaults being in place hold [`shared_config`]. The cache config is
//!    process-global, and the test harness runs tests in parallel threads.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Sets up the test environment: a logger capturing permacache traces into
/// the test runner's output.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("permacache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory, deleted when the handle drops.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

static CONFIG_GUARD: RwLock<()> = RwLock::new(());

/// Taken by tests that rely on the global cache configuration holding its
/// defaults while they run.
pub fn shared_config() -> RwLockReadGuard<'static, ()> {
    CONFIG_GUARD.read()
}

/// Taken by tests that mutate the global cache configuration; excludes every
/// [`shared_config`] holder until dropped.
pub fn exclusive_config() -> RwLockWriteGuard<'static, ()> {
    CONFIG_GUARD.write()
}
