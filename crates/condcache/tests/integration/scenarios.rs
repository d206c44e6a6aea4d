use std::sync::Barrier;
use std::thread;
use std::time::Duration;

use condcache::{CacheConfig, ConditionsCache, RunLumi, ValidityInterval};

use crate::{CallCounter, cache, iv, key, setup};

#[tokio::test]
async fn test_hit_within_interval() {
    setup();
    let cache = cache();
    let chamber = key("chamberA");
    let calls = CallCounter::new();

    let first = cache
        .get(&chamber, 10, |_, _| {
            calls.hit();
            async { Ok((42, iv(0, 100))) }
        })
        .await
        .unwrap();
    assert_eq!(*first, 42);

    let second = cache
        .get(&chamber, 50, |_, _| {
            calls.hit();
            async { Ok((99, iv(0, 100))) }
        })
        .await
        .unwrap();
    assert_eq!(*second, 42);
    assert_eq!(calls.get(), 1);
}

#[tokio::test]
async fn test_recompute_after_expiry() {
    setup();
    let cache = cache();
    let chamber = key("chamberA");

    let first = cache
        .get(&chamber, 10, |_, _| async { Ok((42, iv(0, 100))) })
        .await
        .unwrap();
    let hit = cache
        .get(&chamber, 50, |_, _| async { Ok((99, iv(0, 100))) })
        .await
        .unwrap();
    assert_eq!(*hit, 42);

    let next = cache
        .get(&chamber, 150, |_, _| async { Ok((7, iv(100, 200))) })
        .await
        .unwrap();
    assert_eq!(*next, 7);
    assert_eq!(next.generation(), first.generation() + 1);
    assert_eq!(next.interval(), iv(100, 200));
}

#[test]
fn test_two_threads_share_one_production() {
    setup();
    let cache = cache();
    let calls = CallCounter::new();
    let barrier = Barrier::new(2);

    let slow = |_: &String, _: u64| {
        calls.hit();
        thread::sleep(Duration::from_millis(50));
        Ok((1, ValidityInterval::starting_at(0)))
    };

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    cache.get_blocking(&key("k"), 0, slow)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for result in &results {
        assert_eq!(**result.as_ref().unwrap(), 1);
    }
    assert_eq!(calls.get(), 1);
}

#[tokio::test]
async fn test_run_lumi_conditions() {
    setup();
    let cache: ConditionsCache<&str, RunLumi, f64, String> =
        ConditionsCache::new(CacheConfig::named("beamspot"));

    // valid from the start of run 1 up to lumi block 10 of run 2
    let interval = ValidityInterval::new(RunLumi::start_of_run(1), RunLumi::new(2, 10)).unwrap();

    let view = cache
        .get(&"beamspot", RunLumi::new(1, 400), |_, _| async move {
            Ok((0.5, interval))
        })
        .await
        .unwrap();
    assert_eq!(*view, 0.5);
    assert_eq!(view.interval().to_string(), "[1/0, 2/10)");

    assert!(cache.store().lookup(&"beamspot", RunLumi::new(2, 9)).is_some());
    assert!(cache.store().lookup(&"beamspot", RunLumi::new(2, 10)).is_none());
}
