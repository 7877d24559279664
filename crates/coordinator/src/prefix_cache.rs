//! Prefix reuse cache
//!
//! Maps the hash of a prompt prefix to a backend's reusable computed-state
//! handle. Keys are chained SHA-256 digests over the prefix messages, so
//! every shorter prefix of a conversation has its own key and the longest
//! previously seen prefix can be found without storing message text.
//!
//! Slots are either `Ready` (a handle) or `Pending` (one request is
//! computing it). Concurrent lookups of a pending key wait for the result
//! instead of issuing duplicate backend work. The pending marker belongs to
//! a [`PrefixReservation`] and carries its outcome to the waiters:
//!
//! - published: waiters look again and hit
//! - finished without a handle: waiters bypass the cache and dispatch at once
//! - dropped (caller gone, request failed): waiters look again and one of
//!   them takes over the computation
//!
//! Expired entries are never served, whatever their recency. Capacity is
//! measured in prefix tokens and enforced by evicting the least recently
//! used entries after each insertion.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use switchyard_common::config::{CacheScope, PrefixCacheConfig};
use switchyard_common::METRICS;
use switchyard_proto::{ChatMessage, InferenceRequest};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

/// Content hash of an ordered prefix
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrefixKey([u8; 32]);

impl fmt::Display for PrefixKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PrefixKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrefixKey({})", &hex::encode(self.0)[..12])
    }
}

/// Keys for every leading slice of a request's prefix, shortest first
#[derive(Debug, Clone, Default)]
pub struct PrefixChain {
    keys: Vec<PrefixKey>,
    /// Cumulative estimated tokens for each key
    costs: Vec<u64>,
}

impl PrefixChain {
    /// Hash `messages` under `namespace`.
    ///
    /// Each link is `sha256(previous || role || content)` with length
    /// framing, seeded by the namespace so sessions never share keys
    /// unless the cache scope is global.
    pub fn from_messages(namespace: &str, messages: &[ChatMessage], chars_per_token: u32) -> Self {
        let mut seed = Sha256::new();
        seed.update(b"switchyard-prefix/v1");
        seed.update((namespace.len() as u64).to_le_bytes());
        seed.update(namespace.as_bytes());
        let mut previous: [u8; 32] = seed.finalize().into();

        let chars_per_token = chars_per_token.max(1) as u64;
        let mut chars = 0u64;
        let mut chain = PrefixChain::default();

        for message in messages {
            let mut hasher = Sha256::new();
            hasher.update(previous);
            hasher.update((message.role.len() as u64).to_le_bytes());
            hasher.update(message.role.as_bytes());
            hasher.update((message.content.len() as u64).to_le_bytes());
            hasher.update(message.content.as_bytes());
            previous = hasher.finalize().into();

            chars += message.content.chars().count() as u64;
            chain.keys.push(PrefixKey(previous));
            chain.costs.push(chars.div_ceil(chars_per_token));
        }
        chain
    }

    /// Chain for the stable prefix of a request.
    ///
    /// The prefix ends at the last message flagged `cache`; without flags it
    /// is every message before the final turn.
    pub fn for_request(request: &InferenceRequest, scope: CacheScope, chars_per_token: u32) -> Self {
        let prefix_len = request
            .messages
            .iter()
            .rposition(|m| m.cache)
            .map(|i| i + 1)
            .unwrap_or_else(|| request.messages.len().saturating_sub(1));

        let namespace = match scope {
            CacheScope::Global => "",
            CacheScope::Session => request.session_id.as_deref().unwrap_or(&request.caller),
        };
        Self::from_messages(namespace, &request.messages[..prefix_len], chars_per_token)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Key of the whole prefix
    pub fn full_key(&self) -> Option<PrefixKey> {
        self.keys.last().copied()
    }

    /// Estimated tokens of the whole prefix
    pub fn cost(&self) -> u64 {
        self.costs.last().copied().unwrap_or(0)
    }
}

/// A cached computed-state handle
#[derive(Debug)]
pub struct PrefixCacheEntry {
    pub key: PrefixKey,
    /// Opaque handle understood by the backend that produced it
    pub handle: String,
    pub backend_id: String,
    pub cost: u64,
    pub created_at: Instant,
    last_access: Mutex<Instant>,
}

impl PrefixCacheEntry {
    fn new(key: PrefixKey, handle: String, backend_id: String, cost: u64) -> Self {
        let now = Instant::now();
        Self {
            key,
            handle,
            backend_id,
            cost,
            created_at: now,
            last_access: Mutex::new(now),
        }
    }

    pub fn last_access(&self) -> Instant {
        *self.last_access.lock()
    }

    fn touch(&self, now: Instant) {
        *self.last_access.lock() = now;
    }
}

/// What the owner of a pending slot ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingOutcome {
    Computing,
    Published,
    Uncached,
}

enum Slot {
    Ready(Arc<PrefixCacheEntry>),
    Pending {
        owner: u64,
        done: watch::Receiver<PendingOutcome>,
    },
}

/// Outcome of a cache lookup
pub enum CacheLookup {
    /// The whole prefix is cached
    Hit(Arc<PrefixCacheEntry>),

    /// Caller now owns the computation of this prefix; `partial` is the
    /// longest shorter prefix still cached, if any
    Miss {
        reservation: PrefixReservation,
        partial: Option<Arc<PrefixCacheEntry>>,
    },

    /// Nothing to cache, the computation we waited on produced no handle,
    /// or waiting on it timed out
    Bypass,
}

/// Exclusive right to populate one key
pub struct PrefixReservation {
    cache: Arc<PrefixCache>,
    key: PrefixKey,
    owner: u64,
    cost: u64,
    released: bool,
    done: watch::Sender<PendingOutcome>,
}

impl PrefixReservation {
    pub fn key(&self) -> PrefixKey {
        self.key
    }

    pub fn cost(&self) -> u64 {
        self.cost
    }

    /// Publish the computed handle and wake waiters
    pub fn complete(mut self, handle: impl Into<String>, backend_id: impl Into<String>) -> Arc<PrefixCacheEntry> {
        let entry = Arc::new(PrefixCacheEntry::new(self.key, handle.into(), backend_id.into(), self.cost));
        self.released = true;
        let outcome = if self.cache.publish(self.owner, entry.clone()) {
            PendingOutcome::Published
        } else {
            PendingOutcome::Uncached
        };
        self.done.send_replace(outcome);
        entry
    }

    /// Give the key up without a handle; waiters stop waiting and run uncached
    pub fn finish_uncached(mut self) {
        self.released = true;
        self.cache.release(&self.key, self.owner);
        self.done.send_replace(PendingOutcome::Uncached);
    }
}

impl Drop for PrefixReservation {
    fn drop(&mut self) {
        if !self.released {
            debug!("Prefix {} abandoned before completion", self.key);
            self.cache.release(&self.key, self.owner);
        }
    }
}

impl fmt::Debug for PrefixReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrefixReservation")
            .field("key", &self.key)
            .field("cost", &self.cost)
            .finish()
    }
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub cost: u64,
    pub hits: u64,
    pub misses: u64,
    pub joined: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub tokens_saved: u64,
    pub hit_rate: f64,
}

/// Prefix cache shared by all requests
pub struct PrefixCache {
    config: PrefixCacheConfig,
    slots: DashMap<PrefixKey, Slot>,
    total_cost: AtomicU64,
    next_owner: AtomicU64,

    hits: AtomicU64,
    misses: AtomicU64,
    joined: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    tokens_saved: AtomicU64,
}

impl PrefixCache {
    pub fn new(config: PrefixCacheConfig) -> Self {
        Self {
            config,
            slots: DashMap::new(),
            total_cost: AtomicU64::new(0),
            next_owner: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            joined: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            tokens_saved: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PrefixCacheConfig {
        &self.config
    }

    fn is_expired(&self, entry: &PrefixCacheEntry, now: Instant) -> bool {
        now.duration_since(entry.created_at) >= self.config.ttl()
    }

    /// Look up the prefix, joining an in-flight computation if there is one
    pub async fn resolve(self: &Arc<Self>, chain: &PrefixChain) -> CacheLookup {
        enum Step {
            Hit(Arc<PrefixCacheEntry>),
            Reserved(PrefixReservation),
            Wait(watch::Receiver<PendingOutcome>),
        }

        let Some(key) = chain.full_key() else {
            return CacheLookup::Bypass;
        };
        let deadline = Instant::now() + self.config.wait_timeout();

        loop {
            let now = Instant::now();
            let step = match self.slots.entry(key) {
                Entry::Occupied(mut slot) => match slot.get() {
                    Slot::Ready(entry) if !self.is_expired(entry, now) => {
                        entry.touch(now);
                        Step::Hit(entry.clone())
                    }
                    Slot::Ready(_) => {
                        let (reservation, pending) = self.reserve(key, chain.cost());
                        if let Slot::Ready(stale) = slot.insert(pending) {
                            self.forget(&stale, false);
                        }
                        Step::Reserved(reservation)
                    }
                    Slot::Pending { done, .. } => Step::Wait(done.clone()),
                },
                Entry::Vacant(slot) => {
                    let (reservation, pending) = self.reserve(key, chain.cost());
                    slot.insert(pending);
                    Step::Reserved(reservation)
                }
            };

            match step {
                Step::Hit(entry) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    self.tokens_saved.fetch_add(entry.cost, Ordering::Relaxed);
                    METRICS.cache.hits.inc();
                    METRICS.cache.tokens_saved.inc_by(entry.cost);
                    return CacheLookup::Hit(entry);
                }
                Step::Reserved(reservation) => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    METRICS.cache.misses.inc();
                    let partial = self.longest_cached(chain, now);
                    return CacheLookup::Miss { reservation, partial };
                }
                Step::Wait(mut done) => {
                    self.joined.fetch_add(1, Ordering::Relaxed);
                    METRICS.cache.joined.inc();
                    match tokio::time::timeout_at(deadline, done.changed()).await {
                        Err(_) => {
                            debug!("Gave up waiting on prefix {}", key);
                            return CacheLookup::Bypass;
                        }
                        Ok(Ok(())) if *done.borrow() == PendingOutcome::Uncached => {
                            debug!("Prefix {} produced no handle, dispatching uncached", key);
                            return CacheLookup::Bypass;
                        }
                        // Published, or dropped by its owner: look again
                        Ok(_) => {}
                    }
                }
            }
        }
    }

    fn reserve(self: &Arc<Self>, key: PrefixKey, cost: u64) -> (PrefixReservation, Slot) {
        let owner = self.next_owner.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(PendingOutcome::Computing);
        let reservation = PrefixReservation {
            cache: self.clone(),
            key,
            owner,
            cost,
            released: false,
            done: tx,
        };
        (reservation, Slot::Pending { owner, done: rx })
    }

    /// Longest cached proper prefix of the chain
    fn longest_cached(&self, chain: &PrefixChain, now: Instant) -> Option<Arc<PrefixCacheEntry>> {
        let shorter = chain.keys.len().saturating_sub(1);
        chain.keys[..shorter].iter().rev().find_map(|key| {
            let slot = self.slots.get(key)?;
            match slot.value() {
                Slot::Ready(entry) if !self.is_expired(entry, now) => {
                    entry.touch(now);
                    Some(entry.clone())
                }
                _ => None,
            }
        })
    }

    /// Replace the pending slot with `entry`; false when it was not cached
    fn publish(&self, owner: u64, entry: Arc<PrefixCacheEntry>) -> bool {
        let key = entry.key;
        let cost = entry.cost;

        if cost > self.config.capacity_tokens {
            debug!("Prefix {} ({} tokens) exceeds cache capacity, not cached", key, cost);
            self.release(&key, owner);
            return false;
        }

        let published = match self.slots.get_mut(&key) {
            Some(mut slot) if matches!(*slot, Slot::Pending { owner: o, .. } if o == owner) => {
                *slot = Slot::Ready(entry);
                true
            }
            _ => false,
        };
        if !published {
            return false;
        }

        self.total_cost.fetch_add(cost, Ordering::AcqRel);
        self.evict_to_capacity(&key);
        self.update_gauges();
        true
    }

    /// Swap a ready entry that cannot be served for a fresh reservation.
    ///
    /// Returns `None` when the slot no longer holds `stale`.
    pub fn supersede(self: &Arc<Self>, stale: &Arc<PrefixCacheEntry>) -> Option<PrefixReservation> {
        let reservation = {
            let mut slot = self.slots.get_mut(&stale.key)?;
            if !matches!(&*slot, Slot::Ready(current) if Arc::ptr_eq(current, stale)) {
                return None;
            }
            let (reservation, pending) = self.reserve(stale.key, stale.cost);
            *slot = pending;
            reservation
        };

        debug!("Prefix {} on {} superseded", stale.key, stale.backend_id);
        self.total_cost.fetch_sub(stale.cost, Ordering::AcqRel);
        self.update_gauges();
        Some(reservation)
    }

    fn release(&self, key: &PrefixKey, owner: u64) {
        self.slots
            .remove_if(key, |_, slot| matches!(slot, Slot::Pending { owner: o, .. } if *o == owner));
    }

    fn forget(&self, entry: &PrefixCacheEntry, evicted: bool) {
        self.total_cost.fetch_sub(entry.cost, Ordering::AcqRel);
        if evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            METRICS.cache.evictions.inc();
        } else {
            self.expirations.fetch_add(1, Ordering::Relaxed);
            METRICS.cache.expirations.inc();
        }
    }

    /// Evict least recently used entries until the cache fits its budget
    fn evict_to_capacity(&self, keep: &PrefixKey) {
        while self.total_cost.load(Ordering::Acquire) > self.config.capacity_tokens {
            let victim = self
                .slots
                .iter()
                .filter_map(|slot| match slot.value() {
                    Slot::Ready(entry) if entry.key != *keep => Some(entry.clone()),
                    _ => None,
                })
                .min_by_key(|entry| entry.last_access());

            let Some(victim) = victim else {
                break;
            };
            let removed = self.slots.remove_if(&victim.key, |_, slot| {
                matches!(slot, Slot::Ready(current) if Arc::ptr_eq(current, &victim))
            });
            if removed.is_some() {
                debug!("Evicted prefix {} ({} tokens)", victim.key, victim.cost);
                self.forget(&victim, true);
            }
        }
    }

    /// Remove every entry older than the TTL
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.slots.retain(|_, slot| match slot {
            Slot::Ready(entry) if self.is_expired(entry, now) => {
                expired.push(entry.clone());
                false
            }
            _ => true,
        });

        for entry in &expired {
            self.forget(entry, false);
        }
        if !expired.is_empty() {
            self.update_gauges();
        }
        expired.len()
    }

    /// Drop cached entries whose hex key starts with `prefix`, or all of them
    pub fn invalidate(&self, prefix: Option<&str>) -> usize {
        let mut removed = Vec::new();
        self.slots.retain(|key, slot| match slot {
            Slot::Ready(entry) if prefix.map_or(true, |p| key.to_string().starts_with(p)) => {
                removed.push(entry.clone());
                false
            }
            _ => true,
        });

        for entry in &removed {
            self.total_cost.fetch_sub(entry.cost, Ordering::AcqRel);
        }
        self.update_gauges();
        info!("Invalidated {} prefix cache entries", removed.len());
        removed.len()
    }

    /// Periodic TTL sweep
    pub fn start_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.sweep_interval());
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let expired = self.sweep_expired();
                        if expired > 0 {
                            debug!("Swept {} expired prefixes", expired);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    fn update_gauges(&self) {
        let entries = self
            .slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Ready(_)))
            .count();
        METRICS.cache.entries.set(entries as i64);
        METRICS
            .cache
            .cost_tokens
            .set(self.total_cost.load(Ordering::Acquire) as i64);
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            entries: self
                .slots
                .iter()
                .filter(|slot| matches!(slot.value(), Slot::Ready(_)))
                .count(),
            cost: self.total_cost.load(Ordering::Acquire),
            hits,
            misses,
            joined: self.joined.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            tokens_saved: self.tokens_saved.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}
