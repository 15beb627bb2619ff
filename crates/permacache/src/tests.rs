use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::backend::shared::MemoryStore;
use crate::test::{exclusive_config, setup, shared_config, tempdir};
use crate::utils::CallOnDrop;
use crate::{args, config};
use crate::{
    Args, BackendSelector, CallOptions, Error, Fingerprint, FunctionId, Memoized, ResolvedArgs,
};

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

/// A function that adds its arguments and counts its invocations.
fn adder(
    calls: &Arc<AtomicUsize>,
) -> impl Fn(&ResolvedArgs) -> anyhow::Result<i64> + Send + Sync + 'static {
    let calls = Arc::clone(calls);
    move |args| {
        calls.fetch_add(1, Ordering::SeqCst);
        let x: i64 = args.get("x")?;
        let y: i64 = args.get("y")?;
        Ok(x + y)
    }
}

/// A function that returns its invocation ordinal, so tests can tell which
/// computation produced a value.
fn ordinal(
    calls: &Arc<AtomicUsize>,
) -> impl Fn(&ResolvedArgs) -> anyhow::Result<i64> + Send + Sync + 'static {
    let calls = Arc::clone(calls);
    move |_| Ok(calls.fetch_add(1, Ordering::SeqCst) as i64 + 1)
}

fn wait_for(mut probe: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !probe() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(25));
    }
}

#[test]
fn basic_hit_and_clear() {
    setup();
    let _config = shared_config();
    let dir = tempdir();
    let calls = counter();

    let add = Memoized::builder(FunctionId::new("tests::basic", "add"))
        .params(["x", "y"])
        .cache_dir(dir.path())
        .build(adder(&calls))
        .unwrap();

    assert_eq!(add.call(args![2, 3]).unwrap(), 5);
    assert_eq!(add.call(args![2, 3]).unwrap(), 5);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    add.clear_cache().unwrap();
    assert_eq!(add.call(args![2, 3]).unwrap(), 5);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let stats = add.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 2);
}

#[test]
fn results_survive_a_new_wrapper() {
    setup();
    let _config = shared_config();
    let dir = tempdir();

    let build = |calls: &Arc<AtomicUsize>| {
        Memoized::builder(FunctionId::new("tests::persist", "add"))
            .params(["x", "y"])
            .cache_dir(dir.path())
            .build(adder(calls))
            .unwrap()
    };

    let calls = counter();
    let first = build(&calls);
    assert_eq!(first.call(args![20, 1]).unwrap(), 21);
    drop(first);

    // a fresh wrapper over the same directory reads the persisted entry
    let second = build(&calls);
    assert_eq!(second.call(args![20, 1]).unwrap(), 21);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn argument_shapes_share_one_entry() {
    setup();
    let _config = shared_config();
    let calls = counter();

    let add = Memoized::builder(FunctionId::new("tests::shapes", "add"))
        .params(["x", "y"])
        .backend(BackendSelector::InMemory)
        .build(adder(&calls))
        .unwrap();

    assert_eq!(add.call(args![1, 2]).unwrap(), 3);
    assert_eq!(add.call(args![1, "y" => 2]).unwrap(), 3);
    assert_eq!(add.call(args!["x" => 1, "y" => 2]).unwrap(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // a different tuple is a different entry
    assert_eq!(add.call(args![2, 1]).unwrap(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn receivers_share_the_cache() {
    setup();
    let _config = shared_config();
    let calls = counter();
    let calls_in_fn = Arc::clone(&calls);

    let render = Memoized::builder(FunctionId::new("tests::Tiler", "render"))
        .params(["self", "zoom"])
        .is_method(true)
        .backend(BackendSelector::InMemory)
        .build(move |args| {
            calls_in_fn.fetch_add(1, Ordering::SeqCst);
            let zoom: i64 = args.get("zoom")?;
            Ok(zoom * 10)
        })
        .unwrap();

    assert_eq!(render.call(args!["tiler-a", 3]).unwrap(), 30);
    assert_eq!(render.call(args!["tiler-b", 3]).unwrap(), 30);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn staleness_triggers_recompute() {
    setup();
    let _config = shared_config();
    let calls = counter();

    let tick = Memoized::builder(FunctionId::new("tests::stale", "tick"))
        .backend(BackendSelector::InMemory)
        .stale_after(Duration::from_millis(100))
        .build(ordinal(&calls))
        .unwrap();

    let first = tick.call(args![]).unwrap();
    assert_eq!(first, 1);
    assert_eq!(tick.call(args![]).unwrap(), 1);

    thread::sleep(Duration::from_millis(250));
    let second = tick.call(args![]).unwrap();
    assert_eq!(second, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn stale_after_zero_always_recomputes() {
    setup();
    let _config = shared_config();
    let calls = counter();

    let tick = Memoized::builder(FunctionId::new("tests::stale_zero", "tick"))
        .backend(BackendSelector::InMemory)
        .stale_after(Duration::ZERO)
        .build(ordinal(&calls))
        .unwrap();

    assert_eq!(tick.call(args![]).unwrap(), 1);
    thread::sleep(Duration::from_millis(5));
    assert_eq!(tick.call(args![]).unwrap(), 2);
}

#[test]
fn serve_stale_returns_old_value_then_refreshes() {
    setup();
    let _config = shared_config();
    let calls = counter();

    let tick = Memoized::builder(FunctionId::new("tests::serve_stale", "tick"))
        .backend(BackendSelector::InMemory)
        .stale_after(Duration::from_millis(50))
        .serve_stale(true)
        .build(ordinal(&calls))
        .unwrap();

    assert_eq!(tick.call(args![]).unwrap(), 1);
    thread::sleep(Duration::from_millis(150));

    // the stale value comes back immediately; the refresh runs behind us
    assert_eq!(tick.call(args![]).unwrap(), 1);

    wait_for(|| tick.call(args![]).unwrap() == 2, "background refresh");
    assert!(tick.stats().background_refreshes >= 1);
    assert!(tick.stats().stale_served >= 1);
}

#[test]
fn concurrent_cold_calls_coalesce() {
    setup();
    let _config = shared_config();
    for backend in [BackendSelector::InMemory, BackendSelector::File] {
        let dir = tempdir();
        let calls = counter();
        let calls_in_fn = Arc::clone(&calls);

        let slow = Memoized::builder(FunctionId::new("tests::coalesce", "slow"))
            .params(["x"])
            .backend(backend)
            .cache_dir(dir.path())
            .build(move |args| {
                calls_in_fn.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(300));
                let x: i64 = args.get("x")?;
                Ok(x * 2)
            })
            .unwrap();

        let threads: Vec<_> = (0..2)
            .map(|_| {
                let slow = slow.clone();
                thread::spawn(move || slow.call(args![21]).unwrap())
            })
            .collect();
        let results: Vec<i64> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        assert_eq!(results, vec![42, 42]);
        assert_eq!(
            calls.load(Ordering::SeqCst),
            1,
            "function ran more than once on the {backend} backend",
        );
    }
}

#[test]
fn wait_timeout_falls_through_to_direct_invocation() {
    setup();
    let _config = shared_config();
    let dir = tempdir();
    let calls = counter();
    let calls_in_fn = Arc::clone(&calls);

    let slow = Memoized::builder(FunctionId::new("tests::wait_timeout", "slow"))
        .params(["x"])
        .cache_dir(dir.path())
        .wait_for_calc_timeout(Duration::from_millis(150))
        .build(move |args| {
            calls_in_fn.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(800));
            let x: i64 = args.get("x")?;
            Ok(x + 1)
        })
        .unwrap();

    let owner = {
        let slow = slow.clone();
        thread::spawn(move || slow.call(args![1]).unwrap())
    };
    thread::sleep(Duration::from_millis(100));

    // the waiter gives up after 150ms and computes on its own, without
    // publishing; the owner's result is the one that lands in the cache
    let started = Instant::now();
    assert_eq!(slow.call(args![1]).unwrap(), 2);
    assert!(started.elapsed() >= Duration::from_millis(150));

    assert_eq!(owner.join().unwrap(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(slow.stats().wait_timeouts, 1);
}

#[test]
fn ignore_cache_bypasses_read_and_write() {
    setup();
    let _config = shared_config();
    let calls = counter();

    let tick = Memoized::builder(FunctionId::new("tests::ignore", "tick"))
        .backend(BackendSelector::InMemory)
        .build(ordinal(&calls))
        .unwrap();

    assert_eq!(tick.call(args![]).unwrap(), 1);

    let opts = CallOptions {
        ignore_cache: true,
        ..Default::default()
    };
    assert_eq!(tick.call_with(args![], opts).unwrap(), 2);

    // the bypass left the cached entry untouched
    assert_eq!(tick.call(args![]).unwrap(), 1);
}

#[test]
fn overwrite_cache_replaces_the_entry() {
    setup();
    let _config = shared_config();
    let calls = counter();

    let tick = Memoized::builder(FunctionId::new("tests::overwrite", "tick"))
        .backend(BackendSelector::InMemory)
        .build(ordinal(&calls))
        .unwrap();

    assert_eq!(tick.call(args![]).unwrap(), 1);

    let opts = CallOptions {
        overwrite_cache: true,
        ..Default::default()
    };
    assert_eq!(tick.call_with(args![], opts).unwrap(), 2);

    assert_eq!(tick.call(args![]).unwrap(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn ignore_cache_beats_overwrite_cache() {
    setup();
    let _config = shared_config();
    let calls = counter();

    let tick = Memoized::builder(FunctionId::new("tests::tiebreak", "tick"))
        .backend(BackendSelector::InMemory)
        .build(ordinal(&calls))
        .unwrap();

    assert_eq!(tick.call(args![]).unwrap(), 1);

    let opts = CallOptions {
        ignore_cache: true,
        overwrite_cache: true,
        ..Default::default()
    };
    assert_eq!(tick.call_with(args![], opts).unwrap(), 2);

    // no write happened
    assert_eq!(tick.call(args![]).unwrap(), 1);
}

#[test]
fn max_age_tightens_freshness_per_call() {
    setup();
    let _config = shared_config();
    let calls = counter();

    let tick = Memoized::builder(FunctionId::new("tests::max_age", "tick"))
        .backend(BackendSelector::InMemory)
        .build(ordinal(&calls))
        .unwrap();

    assert_eq!(tick.call(args![]).unwrap(), 1);
    thread::sleep(Duration::from_millis(100));

    // the wrapper's stale_after is infinite, but this call demands fresher
    let strict = CallOptions {
        max_age: Some(Duration::from_millis(10)),
        ..Default::default()
    };
    assert_eq!(tick.call_with(args![], strict).unwrap(), 2);

    let lenient = CallOptions {
        max_age: Some(Duration::from_secs(100)),
        ..Default::default()
    };
    assert_eq!(tick.call_with(args![], lenient).unwrap(), 2);

    let zero = CallOptions {
        max_age: Some(Duration::ZERO),
        ..Default::default()
    };
    assert_eq!(tick.call_with(args![], zero).unwrap(), 3);
}

#[test]
fn null_results_recompute_unless_allowed() {
    setup();
    let _config = shared_config();

    let calls = counter();
    let calls_in_fn = Arc::clone(&calls);
    let nothing = Memoized::builder(FunctionId::new("tests::null", "nothing"))
        .backend(BackendSelector::InMemory)
        .build(move |_| {
            calls_in_fn.fetch_add(1, Ordering::SeqCst);
            Ok(None::<i32>)
        })
        .unwrap();

    assert_eq!(nothing.call(args![]).unwrap(), None);
    assert_eq!(nothing.call(args![]).unwrap(), None);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let calls = counter();
    let calls_in_fn = Arc::clone(&calls);
    let cached_nothing = Memoized::builder(FunctionId::new("tests::null", "cached_nothing"))
        .backend(BackendSelector::InMemory)
        .allow_none(true)
        .build(move |_| {
            calls_in_fn.fetch_add(1, Ordering::SeqCst);
            Ok(None::<i32>)
        })
        .unwrap();

    assert_eq!(cached_nothing.call(args![]).unwrap(), None);
    assert_eq!(cached_nothing.call(args![]).unwrap(), None);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn precache_skips_the_function() {
    setup();
    let _config = shared_config();
    let dir = tempdir();
    let calls = counter();

    let add = Memoized::builder(FunctionId::new("tests::precache", "add"))
        .params(["x", "y"])
        .cache_dir(dir.path())
        .build(adder(&calls))
        .unwrap();

    add.precache(args![2, 3], &99).unwrap();
    assert_eq!(add.call(args![2, 3]).unwrap(), 99);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // a precached value is an ordinary entry: clearing brings the function back
    add.clear_cache_by_args(args![2, 3]).unwrap();
    assert_eq!(add.call(args![2, 3]).unwrap(), 5);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn clear_one_entry_leaves_the_rest() {
    setup();
    let _config = shared_config();
    let calls = counter();

    let add = Memoized::builder(FunctionId::new("tests::clear_one", "add"))
        .params(["x", "y"])
        .backend(BackendSelector::InMemory)
        .build(adder(&calls))
        .unwrap();

    assert_eq!(add.call(args![1, 1]).unwrap(), 2);
    assert_eq!(add.call(args![2, 2]).unwrap(), 4);

    add.clear_cache_by_args(args![1, 1]).unwrap();

    assert_eq!(add.call(args![2, 2]).unwrap(), 4);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(add.call(args![1, 1]).unwrap(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn clear_during_computation_wins() {
    setup();
    let _config = shared_config();
    let dir = tempdir();
    let calls = counter();
    let calls_in_fn = Arc::clone(&calls);

    let slow = Memoized::builder(FunctionId::new("tests::clear_wins", "slow"))
        .params(["x"])
        .cache_dir(dir.path())
        .build(move |args| {
            calls_in_fn.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(300));
            args.get::<i64>("x")
        })
        .unwrap();

    let producer = {
        let slow = slow.clone();
        thread::spawn(move || slow.call(args![7]).unwrap())
    };
    thread::sleep(Duration::from_millis(100));
    slow.clear_cache().unwrap();

    // the producer still returns its result to its caller,
    assert_eq!(producer.join().unwrap(), 7);
    // but its publish was dropped: the next call computes again
    assert_eq!(slow.call(args![7]).unwrap(), 7);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn user_errors_release_the_claim_and_propagate() {
    setup();
    let _config = shared_config();
    let calls = counter();
    let calls_in_fn = Arc::clone(&calls);

    let flaky = Memoized::builder(FunctionId::new("tests::flaky", "once"))
        .backend(BackendSelector::InMemory)
        .build(move |_| {
            let attempt = calls_in_fn.fetch_add(1, Ordering::SeqCst);
            if attempt == 0 {
                anyhow::bail!("transient failure");
            }
            Ok(attempt as i64)
        })
        .unwrap();

    let err = flaky.call(args![]).unwrap_err();
    match err {
        Error::UserFunction(inner) => assert_eq!(inner.to_string(), "transient failure"),
        other => panic!("expected UserFunction, got {other:?}"),
    }

    // nothing was stored and the claim is free again
    assert_eq!(flaky.call(args![]).unwrap(), 1);
    assert_eq!(flaky.call(args![]).unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn unfingerprintable_arguments_do_not_invoke() {
    setup();
    let _config = shared_config();
    let calls = counter();

    let add = Memoized::builder(FunctionId::new("tests::unfingerprintable", "add"))
        .params(["x", "y"])
        .backend(BackendSelector::InMemory)
        .build(adder(&calls))
        .unwrap();

    // a map with non-string keys has no canonical encoding
    let mut bad = std::collections::HashMap::new();
    bad.insert(vec![1u8], "v");
    let err = add.call(Args::new().arg(bad).arg(2)).unwrap_err();
    assert!(matches!(err, Error::ArgumentNotFingerprintable(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn oversized_results_are_returned_but_not_stored() {
    setup();
    let _config = shared_config();
    let calls = counter();
    let calls_in_fn = Arc::clone(&calls);

    let big = Memoized::builder(FunctionId::new("tests::oversized", "big"))
        .backend(BackendSelector::InMemory)
        .entry_size_limit(8)
        .build(move |_| {
            calls_in_fn.fetch_add(1, Ordering::SeqCst);
            Ok("a value far beyond eight serialized bytes".to_owned())
        })
        .unwrap();

    assert_eq!(
        big.call(args![]).unwrap(),
        "a value far beyond eight serialized bytes"
    );
    big.call(args![]).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(big.stats().size_limit_rejections, 2);
}

#[test]
fn separate_files_layout_works_end_to_end() {
    setup();
    let _config = shared_config();
    let dir = tempdir();
    let calls = counter();

    let add = Memoized::builder(FunctionId::new("tests::separate", "add"))
        .params(["x", "y"])
        .cache_dir(dir.path())
        .separate_files(true)
        .build(adder(&calls))
        .unwrap();

    assert_eq!(add.call(args![4, 4]).unwrap(), 8);
    assert_eq!(add.call(args![4, 4]).unwrap(), 8);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // one data file, named by the fingerprint's hex form
    let cache_dir = add.cache_dpath().unwrap();
    let data_files: Vec<_> = std::fs::read_dir(&cache_dir)
        .unwrap()
        .filter_map(|dirent| dirent.ok())
        .filter(|dirent| {
            let name = dirent.file_name();
            let name = name.to_string_lossy().into_owned();
            name.len() == 64 && name.bytes().all(|b| b.is_ascii_hexdigit())
        })
        .collect();
    assert_eq!(data_files.len(), 1);

    add.clear_cache().unwrap();
    assert_eq!(add.call(args![4, 4]).unwrap(), 8);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn corrupt_cache_state_reads_as_a_miss() {
    setup();
    let _config = shared_config();
    let dir = tempdir();
    let calls = counter();

    let add = Memoized::builder(FunctionId::new("tests::corrupt", "add"))
        .params(["x", "y"])
        .cache_dir(dir.path())
        .watch(false)
        .build(adder(&calls))
        .unwrap();

    assert_eq!(add.call(args![1, 2]).unwrap(), 3);

    let entries = add.cache_dpath().unwrap().join("entries");
    std::fs::write(entries, b"\x7f definitely not a cache map").unwrap();

    // a second wrapper reads the mangled file from scratch and recomputes
    let fresh = Memoized::builder(FunctionId::new("tests::corrupt", "add"))
        .params(["x", "y"])
        .cache_dir(dir.path())
        .watch(false)
        .build(adder(&calls))
        .unwrap();
    assert_eq!(fresh.call(args![1, 2]).unwrap(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn shared_backend_memoizes_across_wrappers() {
    setup();
    let _config = shared_config();
    let store = MemoryStore::new();
    let calls = counter();

    let build = |name: &str, calls: &Arc<AtomicUsize>| {
        Memoized::builder(FunctionId::new("tests::shared", name))
            .params(["x", "y"])
            .connector(store.connector())
            .build(adder(calls))
            .unwrap()
    };

    let add = build("add", &calls);
    assert_eq!(add.call(args![5, 6]).unwrap(), 11);
    assert_eq!(add.call(args![5, 6]).unwrap(), 11);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // another wrapper over the same store shares the entries
    let twin = build("add", &counter());
    assert_eq!(twin.call(args![5, 6]).unwrap(), 11);
    assert_eq!(twin.stats().hits, 1);

    // a differently named function does not
    let other = build("other_add", &calls);
    assert_eq!(other.call(args![5, 6]).unwrap(), 11);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn connector_failure_surfaces_as_backend_unavailable() {
    setup();
    let _config = shared_config();
    let calls = counter();

    let add = Memoized::builder(FunctionId::new("tests::unavailable", "add"))
        .params(["x", "y"])
        .connector(crate::backend::shared::unavailable_connector("store down"))
        .build(adder(&calls))
        .unwrap();

    let err = add.call(args![1, 2]).unwrap_err();
    assert!(matches!(err, Error::BackendUnavailable(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn selecting_a_shared_backend_without_connector_fails() {
    setup();
    let _config = shared_config();

    let result = Memoized::builder(FunctionId::new("tests::no_connector", "add"))
        .params(["x", "y"])
        .backend(BackendSelector::SharedDoc)
        .build(|args: &ResolvedArgs| args.get::<i64>("x"));
    assert!(matches!(result, Err(Error::Config(_))));

    let result = Memoized::builder(FunctionId::new("tests::no_connector", "add"))
        .params(["x", "y"])
        .backend(BackendSelector::Relational)
        .build(|args: &ResolvedArgs| args.get::<i64>("x"));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn disabling_caching_short_circuits_every_wrapper() {
    setup();
    let _config = exclusive_config();
    let _restore = CallOnDrop::new(config::enable_caching);
    let calls = counter();

    let tick = Memoized::builder(FunctionId::new("tests::disable", "tick"))
        .backend(BackendSelector::InMemory)
        .build(ordinal(&calls))
        .unwrap();

    assert_eq!(tick.call(args![]).unwrap(), 1);

    config::disable_caching();
    assert_eq!(tick.call(args![]).unwrap(), 2);
    assert_eq!(tick.call(args![]).unwrap(), 3);

    config::enable_caching();
    // the entry cached before the toggle is intact
    assert_eq!(tick.call(args![]).unwrap(), 1);
}

#[test]
fn live_parameters_apply_to_existing_wrappers() {
    setup();
    let _config = exclusive_config();
    let original = config::snapshot().stale_after;
    let _restore = CallOnDrop::new(move || config::configure(|c| c.stale_after = original));
    let calls = counter();

    // no wrapper-level stale_after: the global is consulted on every call
    let tick = Memoized::builder(FunctionId::new("tests::live", "tick"))
        .backend(BackendSelector::InMemory)
        .build(ordinal(&calls))
        .unwrap();

    assert_eq!(tick.call(args![]).unwrap(), 1);
    assert_eq!(tick.call(args![]).unwrap(), 1);

    config::configure(|c| c.stale_after = Duration::ZERO);
    thread::sleep(Duration::from_millis(5));
    assert_eq!(tick.call(args![]).unwrap(), 2);
}

#[test]
fn cleanup_deletes_old_entries_in_the_background() {
    setup();
    let _config = shared_config();
    let dir = tempdir();
    let calls = counter();

    let add = Memoized::builder(FunctionId::new("tests::cleanup", "add"))
        .params(["x", "y"])
        .cache_dir(dir.path())
        .stale_after(Duration::from_millis(50))
        .cleanup_stale(true)
        .cleanup_interval(Duration::ZERO)
        .build(adder(&calls))
        .unwrap();

    assert_eq!(add.call(args![1, 2]).unwrap(), 3);
    thread::sleep(Duration::from_millis(150));

    // any call now schedules a sweep that removes the aged entry
    assert_eq!(add.call(args![9, 9]).unwrap(), 18);
    let add2 = add.clone();
    wait_for(
        move || {
            let entries = add2.cache_dpath().unwrap().join("entries");
            let bytes = std::fs::read(entries).unwrap_or_default();
            let map: std::collections::HashMap<String, crate::Entry> =
                bincode::deserialize(&bytes).unwrap_or_default();
            !map.iter().any(|(_, entry)| {
                entry
                    .age(std::time::SystemTime::now())
                    .is_some_and(|age| age > Duration::from_millis(150))
            })
        },
        "stale entry cleanup",
    );
}

#[test]
fn stats_track_decisions() {
    setup();
    let _config = shared_config();
    let calls = counter();

    let add = Memoized::builder(FunctionId::new("tests::stats", "add"))
        .params(["x", "y"])
        .backend(BackendSelector::InMemory)
        .build(adder(&calls))
        .unwrap();

    add.call(args![1, 1]).unwrap();
    add.call(args![1, 1]).unwrap();
    add.call(args![1, 1]).unwrap();
    add.call(args![2, 2]).unwrap();

    let stats = add.stats();
    assert_eq!(stats.misses, 2);
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.recomputations, 2);
    assert_eq!(stats.invocations, 2);
    assert_eq!(stats.total_calls(), 4);
    assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
}

#[test]
fn verbose_calls_trace_without_changing_results() {
    setup();
    let _config = shared_config();
    let calls = counter();

    let add = Memoized::builder(FunctionId::new("tests::verbose", "add"))
        .params(["x", "y"])
        .backend(BackendSelector::InMemory)
        .build(adder(&calls))
        .unwrap();

    let verbose = || CallOptions {
        verbose: true,
        ..Default::default()
    };
    assert_eq!(add.call_with(args![3, 4], verbose()).unwrap(), 7);
    assert_eq!(add.call_with(args![3, 4], verbose()).unwrap(), 7);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn custom_key_maker_controls_the_fingerprint() {
    setup();
    let _config = shared_config();
    let calls = counter();
    let calls_in_fn = Arc::clone(&calls);

    // fingerprint only `query`, deliberately ignoring `trace_id`
    let key_maker = |args: &ResolvedArgs| {
        let mut partial = std::collections::BTreeMap::new();
        if let Some(query) = args.named().get("query") {
            partial.insert("query".to_owned(), query.clone());
        }
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(&partial).map_err(|err| {
            crate::KeyError::Custom(err.to_string())
        })?);
        Ok(Fingerprint::from_bytes(hasher.finalize().into()))
    };

    let search = Memoized::builder(FunctionId::new("tests::custom_key", "search"))
        .params(["query", "trace_id"])
        .key_maker(Arc::new(key_maker))
        .backend(BackendSelector::InMemory)
        .build(move |args| {
            calls_in_fn.fetch_add(1, Ordering::SeqCst);
            let query: String = args.get("query")?;
            Ok(query.to_uppercase())
        })
        .unwrap();

    assert_eq!(search.call(args!["rust", "trace-1"]).unwrap(), "RUST");
    assert_eq!(search.call(args!["rust", "trace-2"]).unwrap(), "RUST");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_eq!(search.call(args!["cache", "trace-3"]).unwrap(), "CACHE");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn explicit_backend_choice_beats_a_configured_connector() {
    setup();
    let _config = exclusive_config();
    let store = MemoryStore::new();
    config::set_connector_factory(Some(store.connector()));
    let _restore = CallOnDrop::new(|| config::set_connector_factory(None));
    let dir = tempdir();
    let calls = counter();

    // leaving the backend open, the global connector implies shared-doc
    let implied = Memoized::builder(FunctionId::new("tests::connector_wins", "implied"))
        .params(["x", "y"])
        .build(adder(&calls))
        .unwrap();
    assert_eq!(implied.call(args![1, 2]).unwrap(), 3);
    assert_eq!(store.len(), 1);

    // an explicit in-memory choice is honored, connector or not
    let local = Memoized::builder(FunctionId::new("tests::connector_wins", "local"))
        .params(["x", "y"])
        .backend(BackendSelector::InMemory)
        .build(adder(&calls))
        .unwrap();
    assert_eq!(local.call(args![1, 2]).unwrap(), 3);
    assert_eq!(local.call(args![1, 2]).unwrap(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.len(), 1, "local entries leaked into the shared store");

    // and so is an explicit file choice
    let file_backed = Memoized::builder(FunctionId::new("tests::connector_wins", "file_backed"))
        .params(["x", "y"])
        .backend(BackendSelector::File)
        .cache_dir(dir.path())
        .build(adder(&calls))
        .unwrap();
    assert_eq!(file_backed.call(args![1, 2]).unwrap(), 3);
    assert!(file_backed.cache_dpath().unwrap().is_dir());
    assert_eq!(store.len(), 1);
}

#[test]
fn stats_measure_invocation_latency() {
    setup();
    let _config = shared_config();

    let slow = Memoized::builder(FunctionId::new("tests::latency", "slow"))
        .backend(BackendSelector::InMemory)
        .build(|_| {
            thread::sleep(Duration::from_millis(50));
            anyhow::Ok(1)
        })
        .unwrap();

    assert_eq!(slow.call(args![]).unwrap(), 1);
    // the hit never invokes, so it adds no invocation time
    assert_eq!(slow.call(args![]).unwrap(), 1);

    let stats = slow.stats();
    assert_eq!(stats.invocations, 1);
    assert!(stats.invoke_time >= Duration::from_millis(40));
    assert!(stats.avg_invoke_latency() >= Duration::from_millis(40));
}
