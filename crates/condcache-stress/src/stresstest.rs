use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use condcache::CacheConfig;
use parking_lot::Mutex;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{StressCache, WorkloadsConfig, prepare_payload, process_payload};

/// How often expired entries are purged while the workloads run.
const PURGE_INTERVAL: Duration = Duration::from_secs(1);

pub async fn perform_stresstest(
    cache_config: CacheConfig,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let cache = Arc::new(StressCache::new(cache_config));

    // initialize workloads
    let workloads = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| {
            let payload = prepare_payload(i, workload.payload)?;
            Ok((workload.concurrency.max(1), Arc::new(payload)))
        })
        .collect::<Result<Vec<_>>>()
        .context("invalid workload definition")?;

    // warmup: run each workload once to make sure caches are warm
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|(_, workload)| {
            let cache = Arc::clone(&cache);
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                process_payload(&cache, &workload).await;
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // keep the cache from growing without bounds, the way a conditions cleaner would
    let cleaner = tokio::spawn({
        let cache = Arc::clone(&cache);
        let workloads: Vec<_> = workloads.iter().map(|(_, w)| Arc::clone(w)).collect();
        async move {
            let mut interval = tokio::time::interval(PURGE_INTERVAL);
            loop {
                interval.tick().await;
                let Some(oldest) = workloads.iter().map(|w| w.now()).min() else {
                    break;
                };
                cache.purge_expired(oldest);
            }
        }
    });

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (concurrency, workload) in workloads.into_iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let cache = Arc::clone(&cache);

        let task = tokio::spawn(async move {
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let failures = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let cache = Arc::clone(&cache);
                        let task_durations = Arc::clone(&task_durations);
                        let failures = Arc::clone(&failures);
                        let task_start = Instant::now();

                        tokio::spawn(async move {
                            if !process_payload(&cache, &workload).await {
                                failures.fetch_add(1, Ordering::Relaxed);
                            }

                            task_durations.lock().add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        });
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = {
                let mut task_durations = task_durations.lock();
                std::mem::take(&mut *task_durations)
            };

            (concurrency, task_durations, failures.load(Ordering::Relaxed))
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;
    cleaner.abort();

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, task_durations, failures) = task.context("workload panicked")?;

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!(
            "Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s, {failures} failed"
        );

        if ops == 0 {
            continue;
        }
        let quantile = |q| {
            let secs = task_durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let p50 = quantile(0.5);
        let p90 = quantile(0.9);
        let p99 = quantile(0.99);
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    let stats = cache.stats();
    println!();
    println!(
        "Cache {:?}: {} accesses, {} hits, {} computations, {} coalesced, {} failures, {} entries",
        cache.name(),
        stats.accesses,
        stats.hits,
        stats.computations,
        stats.coalesced,
        stats.failures,
        stats.entries,
    );

    Ok(())
}
