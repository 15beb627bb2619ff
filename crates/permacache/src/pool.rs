//! The background worker pool.
//!
//! Serves fire-and-forget recomputations dispatched by the serve-stale
//! policy, and the periodic stale-entry cleanup. Built lazily on first
//! submission; bounded by the `MAX_BACKGROUND_WORKERS` environment variable.
//! Deduplication of refreshes for the same key is not this module's job:
//! the backends' stale flag takes care of it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// Environment variable capping the pool size.
pub const MAX_WORKERS_ENV: &str = "MAX_BACKGROUND_WORKERS";

const DEFAULT_MAX_WORKERS: usize = 8;

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

struct Pool {
    sender: Sender<Task>,
    workers: Vec<JoinHandle<()>>,
}

static POOL: Lazy<Mutex<Option<Pool>>> = Lazy::new(|| Mutex::new(None));

fn max_workers() -> usize {
    std::env::var(MAX_WORKERS_ENV)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_MAX_WORKERS)
}

fn build_pool(size: usize) -> Pool {
    static GENERATION: AtomicUsize = AtomicUsize::new(0);
    let generation = GENERATION.fetch_add(1, Ordering::Relaxed);

    let (sender, receiver) = crossbeam_channel::unbounded::<Task>();
    let workers = (0..size)
        .map(|index| {
            let receiver: Receiver<Task> = receiver.clone();
            std::thread::Builder::new()
                .name(format!("permacache-{generation}-{index}"))
                .spawn(move || {
                    while let Ok(task) = receiver.recv() {
                        // A panicking task must not take the worker with it.
                        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)).is_err() {
                            tracing::error!("background cache task panicked");
                        }
                    }
                })
                .expect("failed to spawn cache worker thread")
        })
        .collect();

    Pool { sender, workers }
}

/// Queues a task on the pool, building it first if necessary.
pub(crate) fn submit(task: Task) {
    let mut pool = POOL.lock();
    let pool = pool.get_or_insert_with(|| build_pool(max_workers()));
    if pool.sender.send(task).is_err() {
        tracing::error!("background cache task dropped, worker pool is gone");
    }
}

/// Resizes the pool. Existing workers finish the tasks they already picked
/// up and exit; queued tasks migrate to the next submission's pool.
pub fn set_max_workers(workers: usize) {
    std::env::set_var(MAX_WORKERS_ENV, workers.to_string());
    POOL.lock().take();
}

/// Shuts the pool down. With `drain` set, blocks until queued tasks have
/// run; otherwise workers are detached and exit after their current task.
pub fn shutdown(drain: bool) {
    let Some(pool) = POOL.lock().take() else {
        return;
    };
    drop(pool.sender);
    if drain {
        for worker in pool.workers {
            if worker.join().is_err() {
                tracing::error!("cache worker thread panicked during shutdown");
            }
        }
    }
}
