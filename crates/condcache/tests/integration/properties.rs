use condcache::{InvalidInterval, RunLumi, TimePoint, ValidityInterval};

use crate::{CallCounter, cache, iv, key, setup};

#[tokio::test]
async fn test_hits_share_generation() {
    setup();
    let cache = cache();
    let calls = CallCounter::new();
    let k = key("muon_alignment");

    let intervals = [(0u64, 1u64), (5, 40), (1_000, 1_001), (u64::MAX - 2, u64::MAX)];
    for (start, end) in intervals {
        let mut views = Vec::new();
        for t in [start, end - 1] {
            let view = cache
                .get(&k, t, |_, _| {
                    calls.hit();
                    async move { Ok((start as i32, iv(start, end))) }
                })
                .await
                .unwrap();
            views.push(view);
        }

        assert_eq!(views[0].generation(), views[1].generation());
        assert!(views[0].same_value(&views[1]));
    }

    // one production per interval, the second time point was always a hit
    assert_eq!(calls.get(), 4);
}

#[tokio::test]
async fn test_expiry_triggers_recompute() {
    setup();
    let cache = cache();
    let calls = CallCounter::new();
    let k = key("pixel_charge");

    let mut previous = 0;
    for t in [10u64, 100, 250, 100] {
        let view = cache
            .get(&k, t, |_, t| {
                calls.hit();
                let start = t - t % 100;
                async move { Ok((t as i32, iv(start, start + 100))) }
            })
            .await
            .unwrap();
        assert!(view.generation() > previous);
        assert!(view.interval().contains(t));
        previous = view.generation();
    }

    // going back in time recomputes as well, there is only one entry per key
    assert_eq!(calls.get(), 4);
    assert_eq!(cache.stats().hits, 0);
}

#[tokio::test]
async fn test_invalidate_forces_recompute() {
    setup();
    let cache = cache();
    let calls = CallCounter::new();
    let k = key("trt_dead_straws");

    let producer = |_: &String, _: u64| {
        calls.hit();
        async { Ok((1, ValidityInterval::starting_at(0))) }
    };

    let first = cache.get(&k, 5, producer).await.unwrap();
    let hit = cache.get(&k, 5, producer).await.unwrap();
    assert_eq!(hit.generation(), first.generation());
    assert_eq!(calls.get(), 1);

    assert_eq!(cache.invalidate(&k), Ok(true));
    let fresh = cache.get(&k, 5, producer).await.unwrap();
    assert_eq!(calls.get(), 2);
    assert!(fresh.generation() > first.generation());
    assert!(!fresh.same_value(&first));

    // invalidating an unknown key is not an error
    assert_eq!(cache.invalidate(&key("unknown")), Ok(false));
}

/// Checks that `[start, end)` contains exactly the points from `start` up to, excluding, `end`.
fn assert_right_open<T: TimePoint>(start: T, end: T, before: Option<T>, last: Option<T>) {
    let interval = ValidityInterval::new(start, end).unwrap();
    assert_eq!(interval.is_empty(), start == end, "{interval}");
    assert_eq!(interval.contains(start), start != end, "{interval}");
    assert!(!interval.contains(end), "{interval}");
    if let Some(before) = before {
        assert!(!interval.contains(before), "{interval}");
    }
    if let Some(last) = last {
        assert!(interval.contains(last), "{interval}");
    }
}

#[test]
fn test_interval_invariant() {
    assert_eq!(
        ValidityInterval::new(10u64, 9),
        Err(InvalidInterval { start: 10, end: 9 })
    );
    assert!(ValidityInterval::new(i64::MAX, i64::MIN).is_err());
    assert!(ValidityInterval::new(RunLumi::new(2, 0), RunLumi::new(1, u32::MAX)).is_err());

    // (start, end, the point before start, the last point inside)
    let unsigned = [
        (0u64, 0u64, None, None),
        (0, 1, None, Some(0)),
        (5, 5, Some(4), None),
        (3, 7, Some(2), Some(6)),
        (u64::MAX - 1, u64::MAX, Some(u64::MAX - 2), Some(u64::MAX - 1)),
        (u64::MAX, u64::MAX, Some(u64::MAX - 1), None),
        (0, u64::MAX, None, Some(u64::MAX - 1)),
    ];
    for (start, end, before, last) in unsigned {
        assert_right_open(start, end, before, last);
    }

    let signed = [
        (i64::MIN, i64::MIN, None, None),
        (i64::MIN, i64::MIN + 1, None, Some(i64::MIN)),
        (-1, 0, Some(-2), Some(-1)),
        (i64::MIN, i64::MAX, None, Some(i64::MAX - 1)),
    ];
    for (start, end, before, last) in signed {
        assert_right_open(start, end, before, last);
    }

    let narrow = [
        (u32::MIN, 1u32, None, Some(0)),
        (u32::MAX - 1, u32::MAX, None, Some(u32::MAX - 1)),
    ];
    for (start, end, before, last) in narrow {
        assert_right_open(start, end, before, last);
    }

    // a run boundary: the last lumi block of run 1 is before the first of run 2
    assert_right_open(
        RunLumi::new(1, 0),
        RunLumi::start_of_run(2),
        Some(RunLumi::new(0, u32::MAX)),
        Some(RunLumi::new(1, u32::MAX)),
    );

    for start in [0u64, 1, u64::MAX - 1, u64::MAX] {
        let open = ValidityInterval::starting_at(start);
        assert!(open.contains(start));
        assert!(open.contains(u64::MAX));
        assert!(!open.is_empty());
    }
    let everything = ValidityInterval::<i64>::infinite();
    assert!(everything.contains(i64::MIN));
    assert!(everything.contains(i64::MAX));
    assert!(ValidityInterval::<RunLumi>::infinite().contains(RunLumi::MIN));
}
