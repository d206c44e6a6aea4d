use std::hash::{BuildHasher, Hash};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rustc_hash::{FxBuildHasher, FxHashMap};
use thiserror::Error;

use crate::interval::ValidityInterval;
use crate::time::TimePoint;

/// What waiters receive once an in-flight production finishes.
type Outcome<E> = Result<(), E>;
type ProductionChannel<E> = Shared<oneshot::Receiver<Outcome<E>>>;

/// Returned when trying to mutate the entry of a key that is currently being produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("a production for this key is in progress")]
pub struct Busy;

/// An immutable handle to a committed conditions value.
///
/// Views are snapshots: a later commit for the same key replaces the stored entry but never
/// touches a view that was already handed out.
#[derive(Debug)]
pub struct ValueView<T, V> {
    value: Arc<V>,
    interval: ValidityInterval<T>,
    generation: u64,
}

impl<T: Copy, V> Clone for ValueView<T, V> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            interval: self.interval,
            generation: self.generation,
        }
    }
}

impl<T: Copy, V> ValueView<T, V> {
    pub fn value(&self) -> &V {
        &self.value
    }

    /// The interval this value was committed with.
    pub fn interval(&self) -> ValidityInterval<T> {
        self.interval
    }

    /// How many times the entry for this key had been replaced when this value was committed.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether both views refer to the very same committed value.
    pub fn same_value(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }

    /// Returns the shared value, detached from its validity metadata.
    pub fn into_value(self) -> Arc<V> {
        self.value
    }
}

impl<T, V> Deref for ValueView<T, V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.value
    }
}

/// The single current entry stored for a key.
#[derive(Debug)]
struct CacheEntry<T, V> {
    value: Arc<V>,
    interval: ValidityInterval<T>,
    generation: u64,
}

impl<T: Copy, V> CacheEntry<T, V> {
    fn view(&self) -> ValueView<T, V> {
        ValueView {
            value: Arc::clone(&self.value),
            interval: self.interval,
            generation: self.generation,
        }
    }
}

struct InFlight<E> {
    id: u64,
    channel: ProductionChannel<E>,
}

/// Everything the store knows about one key.
///
/// A slot only exists while it holds an entry or a production is in flight.
struct Slot<T, V, E> {
    entry: Option<CacheEntry<T, V>>,
    generation: u64,
    in_flight: Option<InFlight<E>>,
}

impl<T, V, E> Slot<T, V, E> {
    fn is_producing(&self, id: u64) -> bool {
        self.in_flight.as_ref().is_some_and(|f| f.id == id)
    }

    fn is_idle(&self) -> bool {
        self.entry.is_none() && self.in_flight.is_none()
    }
}

/// The keys of one shard.
struct Shard<K, T, V, E> {
    slots: FxHashMap<K, Slot<T, V, E>>,
    /// The highest generation of any slot removed from this shard.
    ///
    /// New slots continue counting from here, so that a key never sees its generation go
    /// backwards after its slot was removed.
    retired_generation: u64,
}

impl<K, T, V, E> Default for Shard<K, T, V, E> {
    fn default() -> Self {
        Self {
            slots: FxHashMap::default(),
            retired_generation: 0,
        }
    }
}

impl<K: Eq + Hash + Clone, T, V, E> Shard<K, T, V, E> {
    fn get(&self, key: &K) -> Option<&Slot<T, V, E>> {
        self.slots.get(key)
    }

    fn get_mut(&mut self, key: &K) -> Option<&mut Slot<T, V, E>> {
        self.slots.get_mut(key)
    }

    fn slot(&mut self, key: &K) -> &mut Slot<T, V, E> {
        let generation = self.retired_generation;
        self.slots.entry(key.clone()).or_insert_with(|| Slot {
            entry: None,
            generation,
            in_flight: None,
        })
    }

    fn retire(&mut self, slot: &Slot<T, V, E>) {
        self.retired_generation = self.retired_generation.max(slot.generation);
    }

    /// Drops the slot of `key` if it has neither an entry nor a production in flight.
    fn remove_if_idle(&mut self, key: &K) {
        if !self.slots.get(key).is_some_and(Slot::is_idle) {
            return;
        }
        if let Some(slot) = self.slots.remove(key) {
            self.retire(&slot);
        }
    }
}

/// The result of [`ConditionsStore::begin_production`].
pub enum Production<'a, K, T, V, E>
where
    K: Eq + Hash + Clone,
    T: TimePoint,
    E: Clone,
{
    /// The caller is now the sole producer for the key.
    Ticket(ProductionTicket<'a, K, T, V, E>),
    /// Someone else is producing the key; wait on this before trying again.
    InProgress(Pending<E>),
}

/// Entitles its holder to [`commit`](ConditionsStore::commit) or
/// [`abort`](ConditionsStore::abort) the production of one key.
///
/// Dropping a ticket without doing either releases the key. Waiters are then woken with
/// [`Completion::Abandoned`] and one of them takes over the production.
pub struct ProductionTicket<'a, K, T, V, E>
where
    K: Eq + Hash + Clone,
    T: TimePoint,
    E: Clone,
{
    store: &'a ConditionsStore<K, T, V, E>,
    key: K,
    id: u64,
    sender: Option<oneshot::Sender<Outcome<E>>>,
}

impl<K, T, V, E> ProductionTicket<'_, K, T, V, E>
where
    K: Eq + Hash + Clone,
    T: TimePoint,
    E: Clone,
{
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K, T, V, E> Drop for ProductionTicket<'_, K, T, V, E>
where
    K: Eq + Hash + Clone,
    T: TimePoint,
    E: Clone,
{
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            // clear the marker before waking anyone, so waiters can immediately take over
            self.store.release(&self.key, self.id);
            drop(sender);
        }
    }
}

/// How an in-flight production that a caller waited on ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion<E> {
    /// A new entry was committed.
    Committed,
    /// The producer failed with this error.
    Aborted(E),
    /// The ticket was dropped without commit or abort.
    Abandoned,
}

/// A handle on someone else's in-flight production.
///
/// Dropping it only unregisters this waiter; the production itself carries on.
pub struct Pending<E> {
    channel: ProductionChannel<E>,
}

impl<E: Clone> Pending<E> {
    /// Suspends until the in-flight production commits, aborts or is abandoned.
    pub async fn wait(self) -> Completion<E> {
        match self.channel.await {
            Ok(Ok(())) => Completion::Committed,
            Ok(Err(err)) => Completion::Aborted(err),
            Err(oneshot::Canceled) => Completion::Abandoned,
        }
    }
}

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// Concurrency-safe storage of at most one current entry per key.
///
/// Keys are spread over a fixed number of shards, each guarded by its own [`RwLock`]. Locks
/// are only held to read an entry, flip an in-flight marker or swap an entry, never while a
/// value is being produced.
pub struct ConditionsStore<K, T, V, E> {
    id: u64,
    shards: Box<[RwLock<Shard<K, T, V, E>>]>,
    hasher: FxBuildHasher,
    next_production: AtomicU64,
}

impl<K, T, V, E> std::fmt::Debug for ConditionsStore<K, T, V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionsStore")
            .field("id", &self.id)
            .field("shards", &self.shards.len())
            .finish()
    }
}

impl<K, T, V, E> ConditionsStore<K, T, V, E>
where
    K: Eq + Hash + Clone,
    T: TimePoint,
    E: Clone,
{
    /// Creates a store with the given number of shards (at least one).
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| RwLock::new(Shard::default()))
            .collect();
        Self {
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            shards,
            hasher: FxBuildHasher,
            next_production: AtomicU64::new(1),
        }
    }

    fn shard(&self, key: &K) -> &RwLock<Shard<K, T, V, E>> {
        // the low bits are what the map inside the shard uses
        let hash = self.hasher.hash_one(key) >> 40;
        &self.shards[hash as usize % self.shards.len()]
    }

    fn read(&self, key: &K) -> RwLockReadGuard<'_, Shard<K, T, V, E>> {
        self.shard(key).read()
    }

    fn write(&self, key: &K) -> RwLockWriteGuard<'_, Shard<K, T, V, E>> {
        self.shard(key).write()
    }

    /// Returns the current value for `key` if it is valid at `t`.
    pub fn lookup(&self, key: &K, t: T) -> Option<ValueView<T, V>> {
        let shard = self.read(key);
        let entry = shard.get(key)?.entry.as_ref()?;
        entry.interval.contains(t).then(|| entry.view())
    }

    /// The generation of the current entry for `key`, if there is one.
    pub fn generation(&self, key: &K) -> Option<u64> {
        let shard = self.read(key);
        shard.get(key)?.entry.as_ref().map(|entry| entry.generation)
    }

    /// Whether `view` is still the current entry for `key`.
    pub fn is_current(&self, key: &K, view: &ValueView<T, V>) -> bool {
        self.generation(key) == Some(view.generation())
    }

    /// Tries to become the sole producer for `key`.
    pub fn begin_production(&self, key: &K) -> Production<'_, K, T, V, E> {
        let mut shard = self.write(key);
        let slot = shard.slot(key);

        if let Some(in_flight) = &slot.in_flight {
            return Production::InProgress(Pending {
                channel: in_flight.channel.clone(),
            });
        }

        let id = self.next_production.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        slot.in_flight = Some(InFlight {
            id,
            channel: receiver.shared(),
        });
        drop(shard);

        Production::Ticket(ProductionTicket {
            store: self,
            key: key.clone(),
            id,
            sender: Some(sender),
        })
    }

    fn check_ticket(&self, ticket: &ProductionTicket<'_, K, T, V, E>) {
        assert!(
            std::ptr::eq(ticket.store, self),
            "production ticket was issued by another conditions store"
        );
    }

    /// Installs a freshly produced value for the ticket's key and wakes all waiters.
    ///
    /// # Panics
    ///
    /// Panics if the ticket belongs to another store, or if the production it stands for was
    /// already completed.
    pub fn commit(
        &self,
        mut ticket: ProductionTicket<'_, K, T, V, E>,
        value: V,
        interval: ValidityInterval<T>,
    ) -> ValueView<T, V> {
        self.check_ticket(&ticket);
        let sender = ticket.sender.take();

        let view = {
            let mut shard = self.write(&ticket.key);
            let Some(slot) = shard
                .get_mut(&ticket.key)
                .filter(|slot| slot.is_producing(ticket.id))
            else {
                panic!("commit without ticket: the production was already completed");
            };

            if let Some(previous) = &slot.entry {
                if previous.interval.intersects(&interval) {
                    tracing::debug!(
                        previous = %previous.interval,
                        new = %interval,
                        "replacing conditions entry with an overlapping interval"
                    );
                }
            }

            slot.generation += 1;
            let entry = CacheEntry {
                value: Arc::new(value),
                interval,
                generation: slot.generation,
            };
            let view = entry.view();
            slot.entry = Some(entry);
            slot.in_flight = None;
            view
        };

        if let Some(sender) = sender {
            sender.send(Ok(())).ok();
        }
        view
    }

    /// Ends the ticket's production without installing anything, handing `error` to all
    /// waiters.
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`commit`](Self::commit).
    pub fn abort(&self, mut ticket: ProductionTicket<'_, K, T, V, E>, error: E) {
        self.check_ticket(&ticket);
        let sender = ticket.sender.take();

        {
            let mut shard = self.write(&ticket.key);
            let Some(slot) = shard
                .get_mut(&ticket.key)
                .filter(|slot| slot.is_producing(ticket.id))
            else {
                panic!("abort without ticket: the production was already completed");
            };
            slot.in_flight = None;
            shard.remove_if_idle(&ticket.key);
        }

        if let Some(sender) = sender {
            sender.send(Err(error)).ok();
        }
    }

    fn release(&self, key: &K, id: u64) {
        let mut shard = self.write(key);
        if let Some(slot) = shard.get_mut(key) {
            if slot.is_producing(id) {
                slot.in_flight = None;
                shard.remove_if_idle(key);
            }
        }
    }

    /// Removes the current entry for `key`, returning whether there was one.
    ///
    /// # Errors
    ///
    /// Fails with [`Busy`] while the key is being produced.
    pub fn invalidate(&self, key: &K) -> Result<bool, Busy> {
        let mut shard = self.write(key);
        let Some(slot) = shard.get_mut(key) else {
            return Ok(false);
        };
        if slot.in_flight.is_some() {
            return Err(Busy);
        }
        let existed = slot.entry.take().is_some();
        shard.remove_if_idle(key);
        Ok(existed)
    }

    /// Extends the end of the current entry for `key` to that of `interval`.
    ///
    /// This only applies if `interval` starts where the current entry starts and ends later.
    /// The value and generation stay the same. Returns the updated view, or `None` if nothing
    /// was extended.
    ///
    /// # Errors
    ///
    /// Fails with [`Busy`] while the key is being produced.
    pub fn extend(
        &self,
        key: &K,
        interval: ValidityInterval<T>,
    ) -> Result<Option<ValueView<T, V>>, Busy> {
        let mut shard = self.write(key);
        let Some(slot) = shard.get_mut(key) else {
            return Ok(None);
        };
        if slot.in_flight.is_some() {
            return Err(Busy);
        }
        let Some(entry) = slot.entry.as_mut() else {
            return Ok(None);
        };
        if !interval.extends(&entry.interval) {
            return Ok(None);
        }
        entry.interval = interval;
        Ok(Some(entry.view()))
    }

    /// Drops every entry whose interval ends at or before `t`.
    ///
    /// Keys that are being produced are skipped. Returns the number of removed entries.
    pub fn purge_expired(&self, t: T) -> usize {
        let mut purged = 0;
        for shard in self.shards.iter() {
            let mut shard = shard.write();
            let mut retired = shard.retired_generation;
            shard.slots.retain(|_, slot| {
                if slot.in_flight.is_some() {
                    return true;
                }
                let expired = slot
                    .entry
                    .as_ref()
                    .is_none_or(|entry| entry.interval.ends_at_or_before(t));
                if expired {
                    purged += usize::from(slot.entry.is_some());
                    retired = retired.max(slot.generation);
                }
                !expired
            });
            shard.retired_generation = retired;
        }
        purged
    }

    /// The number of keys that currently have an entry.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                let shard = shard.read();
                shard.slots.values().filter(|slot| slot.entry.is_some()).count()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().slots.len()).sum()
    }
}
