//! Size-bounded in-process cache with per-entry expiry and least-recently-used eviction.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    hash::Hash,
    rc::Rc,
    time::Duration,
};

use readmark_host::Clock;
use tracing::{debug, trace};

use super::serializer::{OperationSerializer, Ticket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Why an entry left the cache without an explicit `remove`/`clear`.
pub enum EvictionCause {
    /// Dropped to make room for a new key.
    Capacity,
    /// Found past its expiry during a sweep or a read.
    Expired,
}

/// Hook invoked for every evicted entry, from inside the evicting operation.
pub type EvictionHook<K, V> = Rc<dyn Fn(&K, &V, EvictionCause)>;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Recency metadata for one resident entry.
pub struct RecencyEntry<K> {
    /// Entry key.
    pub key: K,
    /// Last `set`/`get` time in unix milliseconds.
    pub touched_at_ms: u64,
    /// Absolute expiry in unix milliseconds.
    pub expires_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Diagnostic snapshot of a [`BoundedTtlCache`].
pub struct CacheStats<K> {
    /// Resident entries, including expired ones not yet swept.
    pub size: usize,
    /// Configured capacity.
    pub capacity: usize,
    /// Resident keys, least recently touched first.
    pub keys: Vec<K>,
    /// Recency metadata in the same order as `keys`.
    pub recency: Vec<RecencyEntry<K>>,
    /// Reads that returned a value.
    pub hits: u64,
    /// Reads that found nothing or an expired entry.
    pub misses: u64,
    /// Entries dropped for capacity.
    pub evictions: u64,
    /// Entries dropped for expiry.
    pub expirations: u64,
}

impl<K> Default for CacheStats<K> {
    fn default() -> Self {
        Self {
            size: 0,
            capacity: 0,
            keys: Vec::new(),
            recency: Vec::new(),
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
        }
    }
}

struct CacheEntry<V> {
    value: V,
    expires_at_ms: u64,
    touched_at_ms: u64,
    tick: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

struct CacheCore<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    // tick -> key; the first entry is the least recently touched.
    recency: BTreeMap<u64, K>,
    next_tick: u64,
    capacity: usize,
    clock: Rc<dyn Clock>,
    hooks: Vec<EvictionHook<K, V>>,
    counters: Counters,
}

impl<K: Eq + Hash + Clone, V: Clone> CacheCore<K, V> {
    fn next_tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn detach(&mut self, key: &K) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        Some(entry)
    }

    fn sweep_expired(&mut self, now_ms: u64) -> Vec<(K, V)> {
        let expired = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now_ms))
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        expired
            .into_iter()
            .filter_map(|key| self.detach(&key).map(|entry| (key, entry.value)))
            .collect()
    }

    fn evict_least_recent(&mut self, count: usize) -> Vec<(K, V)> {
        let mut evicted = Vec::with_capacity(count);
        for _ in 0..count {
            let Some((_, key)) = self.recency.pop_first() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&key) {
                evicted.push((key, entry.value));
            }
        }
        evicted
    }

    fn set(&mut self, key: K, value: V, ttl: Duration) {
        let now_ms = self.clock.now_ms();
        let expired = self.sweep_expired(now_ms);

        let mut evicted = Vec::new();
        let len = self.entries.len();
        if len >= self.capacity && !self.entries.contains_key(&key) {
            let count = (len + 1 - self.capacity).max(1);
            evicted = self.evict_least_recent(count);
            debug!(count = evicted.len(), capacity = self.capacity, "evicted least recently used entries");
        }

        if let Some(previous) = self.entries.get(&key) {
            self.recency.remove(&previous.tick);
        }
        let tick = self.next_tick();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self.recency.insert(tick, key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at_ms: now_ms.saturating_add(ttl_ms),
                touched_at_ms: now_ms,
                tick,
            },
        );

        self.counters.expirations += expired.len() as u64;
        self.counters.evictions += evicted.len() as u64;
        self.notify(&expired, EvictionCause::Expired);
        self.notify(&evicted, EvictionCause::Capacity);
    }

    fn get(&mut self, key: &K) -> Option<V> {
        let now_ms = self.clock.now_ms();
        let expired = match self.entries.get(key) {
            None => {
                self.counters.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now_ms),
        };
        if expired {
            self.counters.misses += 1;
            self.counters.expirations += 1;
            if let Some(entry) = self.detach(key) {
                trace!("purged expired entry on read");
                self.notify(&[(key.clone(), entry.value)], EvictionCause::Expired);
            }
            return None;
        }

        let tick = self.next_tick();
        let entry = self.entries.get_mut(key)?;
        let previous_tick = std::mem::replace(&mut entry.tick, tick);
        entry.touched_at_ms = now_ms;
        let value = entry.value.clone();
        self.recency.remove(&previous_tick);
        self.recency.insert(tick, key.clone());
        self.counters.hits += 1;
        Some(value)
    }

    fn live(&self, key: &K) -> bool {
        let now_ms = self.clock.now_ms();
        self.entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now_ms))
    }

    fn live_len(&self) -> usize {
        let now_ms = self.clock.now_ms();
        self.entries
            .values()
            .filter(|entry| !entry.is_expired(now_ms))
            .count()
    }

    fn purge_expired(&mut self) {
        let now_ms = self.clock.now_ms();
        let expired = self.sweep_expired(now_ms);
        self.counters.expirations += expired.len() as u64;
        self.notify(&expired, EvictionCause::Expired);
    }

    fn notify(&self, dropped: &[(K, V)], cause: EvictionCause) {
        for (key, value) in dropped {
            for hook in &self.hooks {
                hook(key, value, cause);
            }
        }
    }

    fn stats(&self) -> CacheStats<K> {
        let recency = self
            .recency
            .values()
            .filter_map(|key| {
                self.entries.get(key).map(|entry| RecencyEntry {
                    key: key.clone(),
                    touched_at_ms: entry.touched_at_ms,
                    expires_at_ms: entry.expires_at_ms,
                })
            })
            .collect::<Vec<_>>();
        CacheStats {
            size: self.entries.len(),
            capacity: self.capacity,
            keys: recency.iter().map(|entry| entry.key.clone()).collect(),
            recency,
            hits: self.counters.hits,
            misses: self.counters.misses,
            evictions: self.counters.evictions,
            expirations: self.counters.expirations,
        }
    }
}

/// In-process cache bounded by entry count, with per-entry TTL and LRU eviction.
///
/// Clones are handles to the same cache. Every operation goes through an
/// [`OperationSerializer`]: calls made from inside another cache operation (an eviction hook
/// calling back in) are queued and applied, in order, after that operation completes. Such a
/// deferred [`Self::get`] returns `None`; use [`Self::get_deferred`] to collect its result.
pub struct BoundedTtlCache<K, V> {
    serializer: Rc<OperationSerializer<CacheCore<K, V>>>,
}

impl<K, V> Clone for BoundedTtlCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            serializer: self.serializer.clone(),
        }
    }
}

impl<K, V> fmt::Debug for BoundedTtlCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedTtlCache")
            .field("serializer", &self.serializer)
            .finish()
    }
}

impl<K, V> BoundedTtlCache<K, V>
where
    K: Eq + Hash + Clone + 'static,
    V: Clone + 'static,
{
    /// Creates an empty cache holding at most `capacity` entries (at least one).
    pub fn new(capacity: usize, clock: Rc<dyn Clock>) -> Self {
        Self {
            serializer: Rc::new(OperationSerializer::new(CacheCore {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                next_tick: 0,
                capacity: capacity.max(1),
                clock,
                hooks: Vec::new(),
                counters: Counters::default(),
            })),
        }
    }

    /// Inserts or refreshes `key`, expiring `ttl` from now.
    ///
    /// Expired entries are swept first; if the cache is still full and `key` is new, the least
    /// recently touched entries are evicted until one slot is free. A zero `ttl` stores an entry
    /// that is already expired.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        self.serializer
            .submit(move |core| core.set(key, value, ttl));
    }

    /// Returns the live value for `key`, marking it most recently used.
    ///
    /// Expired entries are purged and reported absent.
    pub fn get(&self, key: &K) -> Option<V> {
        let ticket = self.get_deferred(key.clone());
        if !ticket.is_ready() {
            debug!("re-entrant cache read deferred; reporting a miss");
        }
        ticket.take().flatten()
    }

    /// Like [`Self::get`], but hands back the ticket so a re-entrant caller can collect the
    /// result once the queued read has run.
    pub fn get_deferred(&self, key: K) -> Ticket<Option<V>> {
        self.serializer.submit(move |core| core.get(&key))
    }

    /// Returns whether `key` holds a live entry, without touching its recency.
    pub fn contains_key(&self, key: &K) -> bool {
        let key = key.clone();
        self.serializer
            .submit(move |core| core.live(&key))
            .take()
            .unwrap_or(false)
    }

    /// Returns the number of live entries.
    pub fn len(&self) -> usize {
        self.serializer
            .submit(|core| core.live_len())
            .take()
            .unwrap_or(0)
    }

    /// Returns whether no live entry remains.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops `key` and its recency metadata.
    pub fn remove(&self, key: &K) {
        let key = key.clone();
        self.serializer.submit(move |core| {
            core.detach(&key);
        });
    }

    /// Drops every entry; counters are kept.
    pub fn clear(&self) {
        self.serializer.submit(|core| {
            core.entries.clear();
            core.recency.clear();
        });
    }

    /// Sweeps every expired entry now.
    pub fn purge_expired(&self) {
        self.serializer.submit(|core| core.purge_expired());
    }

    /// Changes the capacity (at least one) without evicting; the next insert of a new key
    /// evicts enough entries to get back under the bound.
    pub fn set_capacity(&self, capacity: usize) {
        self.serializer
            .submit(move |core| core.capacity = capacity.max(1));
    }

    /// Registers a hook called for every entry evicted for capacity or expiry.
    pub fn on_evict(&self, hook: impl Fn(&K, &V, EvictionCause) + 'static) {
        let hook: EvictionHook<K, V> = Rc::new(hook);
        self.serializer.submit(move |core| core.hooks.push(hook));
    }

    /// Returns a diagnostic snapshot; empty when requested from inside another operation.
    pub fn stats(&self) -> CacheStats<K> {
        self.serializer
            .submit(|core| core.stats())
            .take()
            .unwrap_or_default()
    }

    /// Returns whether a cache operation is running right now.
    pub fn is_busy(&self) -> bool {
        self.serializer.is_busy()
    }
}
