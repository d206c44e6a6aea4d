use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::config::CacheConfig;
use crate::interval::ValidityInterval;
use crate::store::{Busy, Completion, ConditionsStore, Production, ProductionTicket, ValueView};
use crate::time::TimePoint;

/// A snapshot of the counters of a [`ConditionsCache`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// All calls to [`get`](ConditionsCache::get).
    pub accesses: u64,
    /// Calls served by an entry that was already valid.
    pub hits: u64,
    /// Producer invocations.
    pub computations: u64,
    /// Times a caller had to wait for someone else's production.
    pub coalesced: u64,
    /// Producer invocations that returned an error.
    pub failures: u64,
    /// Keys that currently have an entry.
    pub entries: usize,
}

#[derive(Debug, Default)]
struct Counters {
    accesses: AtomicU64,
    hits: AtomicU64,
    computations: AtomicU64,
    coalesced: AtomicU64,
    failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A read-through cache of conditions data, keyed by `K` and validated against time points `T`.
///
/// Values are computed on demand by a `producer` supplied with every [`get`](Self::get). The
/// cache guarantees that for any key at most one producer runs at a time: callers that miss
/// while a production is in flight wait for it and share its result, or its error.
///
/// Producer errors are handed back to the callers and never retried by the cache. The very
/// next `get` for the same key starts a fresh production.
pub struct ConditionsCache<K, T, V, E> {
    config: CacheConfig,
    store: ConditionsStore<K, T, V, E>,
    counters: Counters,
}

impl<K, T, V, E> fmt::Debug for ConditionsCache<K, T, V, E>
where
    K: Eq + Hash + Clone,
    T: TimePoint,
    E: Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionsCache")
            .field("config", &self.config)
            .field("entries", &self.store.len())
            .finish()
    }
}

impl<K, T, V, E> ConditionsCache<K, T, V, E>
where
    K: Eq + Hash + Clone + fmt::Debug,
    T: TimePoint,
    E: Clone,
{
    pub fn new(config: CacheConfig) -> Self {
        let store = ConditionsStore::new(config.shards);
        Self {
            config,
            store,
            counters: Counters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The underlying store, for callers that want to drive productions themselves.
    pub fn store(&self) -> &ConditionsStore<K, T, V, E> {
        &self.store
    }

    /// Returns the value for `key` that is valid at `t`, computing it with `producer` if needed.
    ///
    /// On a miss, `producer` is invoked at most once, and only if no other caller is already
    /// producing `key`. Otherwise this waits for that production to finish and tries again.
    ///
    /// The value returned by `producer` is committed even if its interval does not contain
    /// `t`, and it is returned to this caller regardless.
    ///
    /// Dropping the returned future while it waits on another caller's production does not
    /// affect that production. Dropping it while its own `producer` runs releases the key, and
    /// one of the waiters takes over.
    ///
    /// # Errors
    ///
    /// Returns the error of the producer, both to the caller that ran it and to all callers
    /// that were waiting on it.
    pub async fn get<F, Fut>(&self, key: &K, t: T, producer: F) -> Result<ValueView<T, V>, E>
    where
        F: FnOnce(&K, T) -> Fut,
        Fut: Future<Output = Result<(V, ValidityInterval<T>), E>>,
    {
        let name = self.name();
        metric!(counter("conditions.access") += 1, "cache" => name);
        Counters::bump(&self.counters.accesses);

        loop {
            if let Some(view) = self.store.lookup(key, t) {
                return Ok(self.hit(view));
            }

            match self.store.begin_production(key) {
                Production::Ticket(ticket) => {
                    // Someone may have committed a covering entry since our lookup.
                    if let Some(view) = self.store.lookup(key, t) {
                        return Ok(self.hit(view));
                    }
                    return self.produce(ticket, t, producer).await;
                }
                Production::InProgress(pending) => {
                    metric!(counter("conditions.channel.hit") += 1, "cache" => name);
                    Counters::bump(&self.counters.coalesced);
                    tracing::trace!(cache = name, ?key, %t, "waiting for in-flight production");

                    match pending.wait().await {
                        Completion::Committed | Completion::Abandoned => continue,
                        Completion::Aborted(err) => return Err(err),
                    }
                }
            }
        }
    }

    fn hit(&self, view: ValueView<T, V>) -> ValueView<T, V> {
        metric!(counter("conditions.memory.hit") += 1, "cache" => self.name());
        Counters::bump(&self.counters.hits);
        view
    }

    async fn produce<F, Fut>(
        &self,
        ticket: ProductionTicket<'_, K, T, V, E>,
        t: T,
        producer: F,
    ) -> Result<ValueView<T, V>, E>
    where
        F: FnOnce(&K, T) -> Fut,
        Fut: Future<Output = Result<(V, ValidityInterval<T>), E>>,
    {
        let name = self.name();
        metric!(counter("conditions.computation") += 1, "cache" => name);
        Counters::bump(&self.counters.computations);
        tracing::trace!(cache = name, key = ?ticket.key(), %t, "computing conditions entry");

        let start = Instant::now();
        let result = producer(ticket.key(), t).await;
        metric!(timer("conditions.computation.duration") = start.elapsed(), "cache" => name);

        match result {
            Ok((value, interval)) => {
                let view = self.store.commit(ticket, value, interval);
                tracing::debug!(
                    cache = name,
                    %t,
                    interval = %view.interval(),
                    generation = view.generation(),
                    "committed conditions entry"
                );
                Ok(view)
            }
            Err(err) => {
                metric!(counter("conditions.computation.failed") += 1, "cache" => name);
                Counters::bump(&self.counters.failures);
                self.store.abort(ticket, err.clone());
                Err(err)
            }
        }
    }

    /// A blocking version of [`get`](Self::get) for callers outside of an async runtime.
    ///
    /// The calling thread is parked while it waits for another caller's production.
    pub fn get_blocking<F>(&self, key: &K, t: T, producer: F) -> Result<ValueView<T, V>, E>
    where
        F: FnOnce(&K, T) -> Result<(V, ValidityInterval<T>), E>,
    {
        futures::executor::block_on(
            self.get(key, t, |key, t| std::future::ready(producer(key, t))),
        )
    }

    /// Drops the current entry for `key`, so that the next [`get`](Self::get) recomputes it.
    ///
    /// Returns whether there was an entry to drop.
    ///
    /// # Errors
    ///
    /// Fails with [`Busy`] if `key` is being produced right now. The caller may retry later, or
    /// simply let the production finish.
    pub fn invalidate(&self, key: &K) -> Result<bool, Busy> {
        let result = self.store.invalidate(key);
        tracing::trace!(cache = self.name(), ?key, ?result, "invalidating conditions entry");
        result
    }

    /// Extends the interval of the current entry for `key`, keeping its value.
    ///
    /// See [`ConditionsStore::extend`].
    pub fn extend(
        &self,
        key: &K,
        interval: ValidityInterval<T>,
    ) -> Result<Option<ValueView<T, V>>, Busy> {
        self.store.extend(key, interval)
    }

    /// Drops all entries that are no longer valid at or after `t`.
    pub fn purge_expired(&self, t: T) -> usize {
        let purged = self.store.purge_expired(t);
        if purged > 0 {
            tracing::debug!(cache = self.name(), %t, purged, "purged expired conditions");
        }
        metric!(histogram("conditions.purged") = purged as u64, "cache" => self.name());
        metric!(gauge("conditions.entries") = self.store.len() as u64, "cache" => self.name());
        purged
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CacheStats {
            accesses: load(&self.counters.accesses),
            hits: load(&self.counters.hits),
            computations: load(&self.counters.computations),
            coalesced: load(&self.counters.coalesced),
            failures: load(&self.counters.failures),
            entries: self.store.len(),
        }
    }
}

impl<K, T, V, E> Default for ConditionsCache<K, T, V, E>
where
    K: Eq + Hash + Clone + fmt::Debug,
    T: TimePoint,
    E: Clone,
{
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
