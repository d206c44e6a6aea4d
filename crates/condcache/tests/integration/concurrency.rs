use std::sync::Arc;
use std::time::Duration;

use condcache::ValidityInterval;
use futures::future::join_all;

use crate::{CallCounter, Gate, cache, iv, key, setup};

const CALLERS: usize = 16;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_flight() {
    setup();
    let cache = Arc::new(cache());
    let calls = CallCounter::new();
    let gate = Gate::new();

    let tasks: Vec<_> = (0..CALLERS)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let calls = calls.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                cache
                    .get(&key("k"), 0, |_, _| async move {
                        calls.hit();
                        gate.wait().await;
                        Ok((1, ValidityInterval::starting_at(0)))
                    })
                    .await
            })
        })
        .collect();

    // give every caller the chance to queue up behind the producer
    tokio::time::sleep(Duration::from_millis(50)).await;
    gate.open();

    let views: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|result| result.unwrap().unwrap())
        .collect();

    assert_eq!(calls.get(), 1);
    assert!(views.iter().all(|view| view.same_value(&views[0])));
    assert!(views.iter().all(|view| view.generation() == 1));

    let stats = cache.stats();
    assert_eq!(stats.accesses, CALLERS as u64);
    assert_eq!(stats.computations, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_waiters_share_error() {
    setup();
    let cache = Arc::new(cache());
    let calls = CallCounter::new();
    let gate = Gate::new();

    let tasks: Vec<_> = (0..CALLERS)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let calls = calls.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                cache
                    .get(&key("k"), 0, |_, _| async move {
                        calls.hit();
                        gate.wait().await;
                        Err("conditions database unreachable".to_owned())
                    })
                    .await
            })
        })
        .collect();

    // wait until the producer runs and everyone else is queued up behind it
    while cache.stats().coalesced < CALLERS as u64 - 1 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    gate.open();

    for task in join_all(tasks).await {
        assert_eq!(
            task.unwrap().unwrap_err(),
            "conditions database unreachable"
        );
    }
    assert_eq!(calls.get(), 1);
    assert_eq!(cache.stats().failures, 1);

    // failures are not cached
    let view = cache
        .get(&key("k"), 0, |_, _| async { Ok((2, iv(0, 1))) })
        .await
        .unwrap();
    assert_eq!(*view, 2);
    assert_eq!(view.generation(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_keys_are_independent() {
    setup();
    let cache = Arc::new(cache());
    let gate = Gate::new();
    let (started_tx, started_rx) = tokio::sync::oneshot::channel();

    let slow = tokio::spawn({
        let cache = Arc::clone(&cache);
        let gate = gate.clone();
        async move {
            cache
                .get(&key("k1"), 0, |_, _| async move {
                    started_tx.send(()).ok();
                    gate.wait().await;
                    Ok((1, iv(0, 10)))
                })
                .await
        }
    });
    started_rx.await.unwrap();

    let fast = tokio::time::timeout(
        Duration::from_secs(5),
        cache.get(&key("k2"), 0, |_, _| async { Ok((2, iv(0, 10))) }),
    )
    .await
    .expect("k2 must not wait for the production of k1")
    .unwrap();
    assert_eq!(*fast, 2);
    assert!(!gate.is_open());

    gate.open();
    assert_eq!(*slow.await.unwrap().unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_waiter_does_not_cancel_production() {
    setup();
    let cache = Arc::new(cache());
    let calls = CallCounter::new();
    let gate = Gate::new();
    let (started_tx, started_rx) = tokio::sync::oneshot::channel();

    let producing = tokio::spawn({
        let cache = Arc::clone(&cache);
        let calls = calls.clone();
        let gate = gate.clone();
        async move {
            cache
                .get(&key("k"), 0, |_, _| async move {
                    calls.hit();
                    started_tx.send(()).ok();
                    gate.wait().await;
                    Ok((1, iv(0, 10)))
                })
                .await
        }
    });
    started_rx.await.unwrap();

    let impatient = tokio::time::timeout(
        Duration::from_millis(20),
        cache.get(&key("k"), 0, |_, _| async { Ok((2, iv(0, 10))) }),
    )
    .await;
    assert!(impatient.is_err());

    gate.open();
    let view = producing.await.unwrap().unwrap();
    assert_eq!(*view, 1);
    assert_eq!(calls.get(), 1);
    assert_eq!(cache.stats().coalesced, 1);
}
