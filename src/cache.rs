// Namespaced TTL cache shared by the session manager and the background jobs.
// Expiry is the only removal path the rest of the crate relies on.

use crate::provider::ReferenceKind;
use crate::tour::Fingerprint;
use crate::wire::ReferenceItem;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{de::DeserializeOwned, Serialize};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

pub const HOT_TOURS_TTL: Duration = DAY;
pub const POPULAR_SEARCH_TTL: Duration = DAY;
pub const REFERENCE_TTL: Duration = DAY;
pub const RANDOM_TOURS_TTL: Duration = DAY;
pub const SITEMAP_TTL: Duration = Duration::from_secs(6 * 60 * 60);
pub const APPLICATION_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
pub const JOB_REPORT_TTL: Duration = Duration::from_secs(48 * 60 * 60);

// Stats for the cache
#[derive(Debug, Default)]
pub struct CacheStats {
    pub size_bytes: AtomicUsize,
    pub items_count: AtomicUsize,
    pub hit_count: AtomicUsize,
    pub miss_count: AtomicUsize,
    pub expired_count: AtomicUsize,
    pub rejected_count: AtomicUsize,
    pub average_lookup_time_ns: AtomicU64,
    pub total_lookups: AtomicUsize,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CacheStatsReport {
    pub size_bytes: usize,
    pub items_count: usize,
    pub hit_count: usize,
    pub miss_count: usize,
    pub expired_count: usize,
    pub rejected_count: usize,
    pub average_lookup_time_ns: u64,
    pub total_lookups: usize,
}

impl CacheStatsReport {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}

// Live entries are never dropped to make room: once expired entries are
// purged, a write that still does not fit is rejected.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_size_mb: usize,
    pub shards_count: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_mb: 256,
            shards_count: 16,
        }
    }
}

// TTLs that are configurable rather than fixed by namespace
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    pub search: Duration,
    pub direction: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            search: 2 * HOUR,
            direction: DAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    HotToursCity { city: u32 },
    HotToursCityCountry { city: u32, country: u32 },
    PopularSearch(Fingerprint),
    Reference(String),
    RandomTours { hotel_type: String },
    Sitemap(String),
    Application(String),
    SearchSession(String),
    SearchResults(String),
    Direction { city: u32, country: u32 },
    JobReport(&'static str),
}

impl CacheKey {
    pub fn render(&self) -> String {
        match self {
            CacheKey::HotToursCity { city } => format!("hot_tours:city_{}", city),
            CacheKey::HotToursCityCountry { city, country } => {
                format!("hot_tours:city_{}_country_{}", city, country)
            }
            CacheKey::PopularSearch(fingerprint) => format!("popular_search:{}", fingerprint),
            CacheKey::Reference(kind) => format!("reference:{}", kind),
            CacheKey::RandomTours { hotel_type } => format!("random_tours_{}", hotel_type),
            CacheKey::Sitemap(kind) => format!("sitemap:{}", kind),
            CacheKey::Application(id) => format!("application:{}", id),
            CacheKey::SearchSession(id) => format!("search_session:{}", id),
            CacheKey::SearchResults(id) => format!("search_results:{}", id),
            CacheKey::Direction { city, country } => {
                format!("directions:{}_{}", city, country)
            }
            CacheKey::JobReport(name) => (*name).to_string(),
        }
    }

    pub fn ttl(&self, policy: &TtlPolicy) -> Duration {
        match self {
            CacheKey::HotToursCity { .. } | CacheKey::HotToursCityCountry { .. } => HOT_TOURS_TTL,
            CacheKey::PopularSearch(_) => POPULAR_SEARCH_TTL,
            CacheKey::Reference(_) => REFERENCE_TTL,
            CacheKey::RandomTours { .. } => RANDOM_TOURS_TTL,
            CacheKey::Sitemap(_) => SITEMAP_TTL,
            CacheKey::Application(_) => APPLICATION_TTL,
            CacheKey::SearchSession(_) | CacheKey::SearchResults(_) => policy.search,
            CacheKey::Direction { .. } => policy.direction,
            CacheKey::JobReport(_) => JOB_REPORT_TTL,
        }
    }
}

// Raw byte store. Implementations must treat expired entries as misses.
pub trait CacheStore: Send + Sync + 'static {
    fn new(config: CacheConfig) -> Self
    where
        Self: Sized;

    fn get(&self, key: &str) -> Option<Bytes>;

    // Returns false when the write was rejected (e.g., capacity limits)
    fn set(&self, key: &str, value: Bytes, ttl: Duration) -> bool;

    fn stats(&self) -> CacheStatsReport;
}

pub fn calculate_item_size(key: &str, data: &[u8]) -> usize {
    key.len() + data.len() + std::mem::size_of::<CacheEntry>()
}

pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
    max_size_bytes: usize,
    stats: CacheStats,
}

struct CacheEntry {
    data: Bytes,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) >= self.ttl
    }
}

impl MemoryCache {
    // Returns whether an entry was there
    fn remove_entry(&self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((key, removed)) => {
                self.stats
                    .size_bytes
                    .fetch_sub(calculate_item_size(&key, &removed.data), Ordering::SeqCst);
                self.stats.items_count.fetch_sub(1, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    fn remove_expired(&self, key: &str) {
        if self.remove_entry(key) {
            self.stats.expired_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Drops every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        for key in &expired {
            self.remove_expired(key);
        }
        expired.len()
    }

    fn store_lookup_time(&self, started: Instant) {
        let duration_ns: u64 = started.elapsed().as_nanos() as u64;
        let total_lookups = self.stats.total_lookups.load(Ordering::SeqCst) as u64;
        let current_avg = self.stats.average_lookup_time_ns.load(Ordering::SeqCst);

        let new_avg = if total_lookups <= 1 {
            duration_ns
        } else {
            (current_avg * (total_lookups - 1) + duration_ns) / total_lookups
        };

        self.stats
            .average_lookup_time_ns
            .store(new_avg, Ordering::SeqCst);
    }
}

impl CacheStore for MemoryCache {
    fn new(config: CacheConfig) -> Self {
        let shards = config.shards_count.max(2).next_power_of_two();
        Self {
            entries: DashMap::with_shard_amount(shards),
            max_size_bytes: config.max_size_mb * 1024 * 1024,
            stats: CacheStats::default(),
        }
    }

    fn get(&self, key: &str) -> Option<Bytes> {
        let started = Instant::now();
        self.stats.total_lookups.fetch_add(1, Ordering::SeqCst);

        let mut expired = false;
        let hit = match self.entries.get(key) {
            Some(entry) if entry.is_expired(started) => {
                expired = true;
                None
            }
            Some(entry) => Some(entry.data.clone()),
            None => None,
        };

        // The shard guard is released before removing
        if expired {
            self.remove_expired(key);
        }

        if hit.is_some() {
            self.stats.hit_count.fetch_add(1, Ordering::SeqCst);
        } else {
            self.stats.miss_count.fetch_add(1, Ordering::SeqCst);
        }
        self.store_lookup_time(started);
        hit
    }

    fn set(&self, key: &str, value: Bytes, ttl: Duration) -> bool {
        let item_size = calculate_item_size(key, &value);
        let max_size_bytes = self.max_size_bytes;

        if item_size > max_size_bytes {
            self.stats.rejected_count.fetch_add(1, Ordering::SeqCst);
            return false;
        }

        // The entry being replaced does not count against the new one
        let replaced = self
            .entries
            .get(key)
            .map(|entry| calculate_item_size(key, &entry.data))
            .unwrap_or(0);
        let fits = |cache: &Self| {
            cache.stats.size_bytes.load(Ordering::SeqCst).saturating_sub(replaced) + item_size
                <= max_size_bytes
        };

        if !fits(self) {
            let purged = self.purge_expired();
            debug!(key = %key, purged, "purged expired entries to make room");
        }
        if !fits(self) {
            self.stats.rejected_count.fetch_add(1, Ordering::SeqCst);
            return false;
        }

        let entry = CacheEntry {
            data: value,
            created_at: Instant::now(),
            ttl,
        };
        if let Some(previous) = self.entries.insert(key.to_string(), entry) {
            // Replaced entry, last write wins
            self.stats
                .size_bytes
                .fetch_sub(calculate_item_size(key, &previous.data), Ordering::SeqCst);
            self.stats.items_count.fetch_sub(1, Ordering::SeqCst);
        }
        self.stats.items_count.fetch_add(1, Ordering::SeqCst);
        self.stats.size_bytes.fetch_add(item_size, Ordering::SeqCst);

        true
    }

    fn stats(&self) -> CacheStatsReport {
        CacheStatsReport {
            size_bytes: self.stats.size_bytes.load(Ordering::SeqCst),
            items_count: self.stats.items_count.load(Ordering::SeqCst),
            hit_count: self.stats.hit_count.load(Ordering::SeqCst),
            miss_count: self.stats.miss_count.load(Ordering::SeqCst),
            expired_count: self.stats.expired_count.load(Ordering::SeqCst),
            rejected_count: self.stats.rejected_count.load(Ordering::SeqCst),
            average_lookup_time_ns: self.stats.average_lookup_time_ns.load(Ordering::SeqCst),
            total_lookups: self.stats.total_lookups.load(Ordering::SeqCst),
        }
    }
}

type InFlight<T, E> = Shared<BoxFuture<'static, Result<Arc<T>, E>>>;

/// Typed, namespaced view over a [`CacheStore`].
///
/// Values are stored as JSON bytes. Decoding failures are treated as misses and
/// write failures are logged and reported as `false`; the cache never fails a
/// caller that already holds the value.
#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn CacheStore>,
    ttl: TtlPolicy,
    in_flight: Arc<DashMap<String, Box<dyn Any + Send + Sync>>>,
}

impl Cache {
    pub fn new(store: Arc<dyn CacheStore>, ttl: TtlPolicy) -> Self {
        Self {
            store,
            ttl,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn in_memory(config: CacheConfig, ttl: TtlPolicy) -> Self {
        Self::new(Arc::new(MemoryCache::new(config)), ttl)
    }

    pub fn ttl_policy(&self) -> &TtlPolicy {
        &self.ttl
    }

    pub fn stats(&self) -> CacheStatsReport {
        self.store.stats()
    }

    pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let rendered = key.render();
        let bytes = self.store.get(&rendered)?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key = %rendered, error = %err, "undecodable cache entry treated as miss");
                None
            }
        }
    }

    /// Name of a departure city from the cached reference list.
    pub fn departure_name(&self, city: u32) -> Option<String> {
        let departures: Vec<ReferenceItem> =
            self.get(&CacheKey::Reference(ReferenceKind::Departure.cache_name()))?;
        let id = city.to_string();
        departures
            .into_iter()
            .find(|item| item.id == id)
            .map(|item| item.name)
            .filter(|name| !name.is_empty())
    }

    pub fn set<T: Serialize + ?Sized>(&self, key: &CacheKey, value: &T) -> bool {
        let ttl = key.ttl(&self.ttl);
        write_json(self.store.as_ref(), &key.render(), value, ttl)
    }

    /// Returns the cached value or runs `compute` to produce it.
    ///
    /// Concurrent callers for the same key share a single execution of the
    /// first caller's `compute`; later callers' closures are never invoked.
    /// If that execution panics, the callers waiting on it panic as well and
    /// the next call for the key starts a fresh computation.
    pub async fn get_or_compute<T, E, F, Fut>(&self, key: &CacheKey, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if let Some(hit) = self.get::<T>(key) {
            return Ok(hit);
        }

        let rendered = key.render();
        let ttl = key.ttl(&self.ttl);

        let shared: InFlight<T, E> = match self.in_flight.entry(rendered.clone()) {
            Entry::Occupied(occupied) => {
                match occupied.get().downcast_ref::<InFlight<T, E>>() {
                    Some(shared) => shared.clone(),
                    None => {
                        warn!(key = %rendered, "in-flight computation has a different type");
                        drop(occupied);
                        return compute().await;
                    }
                }
            }
            Entry::Vacant(vacant) => {
                // The previous computation may have finished between our miss and now
                if let Some(hit) = self.get::<T>(key) {
                    return Ok(hit);
                }

                let store = Arc::clone(&self.store);
                let in_flight = Arc::clone(&self.in_flight);
                let owned_key = rendered.clone();
                let pending = compute();

                let shared = async move {
                    let slot = InFlightSlot {
                        in_flight,
                        key: owned_key.clone(),
                    };
                    let outcome = match AssertUnwindSafe(pending).catch_unwind().await {
                        Ok(outcome) => outcome.map(Arc::new),
                        Err(panic) => {
                            // Free the key before waiters see the panic
                            drop(slot);
                            std::panic::resume_unwind(panic);
                        }
                    };
                    if let Ok(value) = &outcome {
                        write_json(store.as_ref(), &owned_key, value.as_ref(), ttl);
                    }
                    drop(slot);
                    outcome
                }
                .boxed()
                .shared();

                vacant.insert(Box::new(shared.clone()));
                shared
            }
        };

        shared.await.map(|value| value.as_ref().clone())
    }
}

struct InFlightSlot {
    in_flight: Arc<DashMap<String, Box<dyn Any + Send + Sync>>>,
    key: String,
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

fn write_json<T: Serialize + ?Sized>(
    store: &dyn CacheStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> bool {
    let payload = match serde_json::to_vec(value) {
        Ok(payload) => Bytes::from(payload),
        Err(err) => {
            warn!(key = %key, error = %err, "failed to serialize cache value");
            return false;
        }
    };

    let stored = store.set(key, payload, ttl);
    if stored {
        debug!(key = %key, ttl_secs = ttl.as_secs(), "cache entry written");
    } else {
        warn!(key = %key, "cache write rejected");
    }
    stored
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn small_cache(max_size_mb: usize) -> MemoryCache {
        MemoryCache::new(CacheConfig {
            max_size_mb,
            shards_count: 4,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = small_cache(5);

        assert!(cache.set("long", Bytes::from_static(b"a"), Duration::from_secs(5)));
        assert!(cache.set("short", Bytes::from_static(b"b"), Duration::from_secs(2)));

        assert_eq!(cache.get("long"), Some(Bytes::from_static(b"a")));
        assert_eq!(cache.get("short"), Some(Bytes::from_static(b"b")));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(cache.get("long").is_some());
        assert!(cache.get("short").is_none());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(cache.get("long").is_none());

        let stats = cache.stats();
        assert_eq!(stats.expired_count, 2);
        assert_eq!(stats.items_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn read_before_expiry_returns_last_write() {
        let cache = small_cache(5);
        cache.set("k", Bytes::from_static(b"first"), Duration::from_secs(10));
        cache.set("k", Bytes::from_static(b"second"), Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get("k"), Some(Bytes::from_static(b"second")));
        assert_eq!(cache.stats().items_count, 1);
    }

    #[test]
    fn full_cache_rejects_writes_and_keeps_live_entries() {
        let cache = small_cache(1);
        let large = Bytes::from(vec![0u8; 250 * 1024]);

        for i in 0..4 {
            assert!(cache.set(&format!("hotel{}", i), large.clone(), DAY));
        }

        assert!(!cache.set("hotel4", large.clone(), DAY));
        assert!(cache.get("hotel4").is_none());
        for i in 0..4 {
            assert!(cache.get(&format!("hotel{}", i)).is_some());
        }
        assert_eq!(cache.stats().rejected_count, 1);
        assert_eq!(cache.stats().items_count, 4);

        // Overwriting an entry with a same-sized value still fits
        assert!(cache.set("hotel0", large.clone(), DAY));
        assert_eq!(cache.stats().items_count, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_purged_to_make_room() {
        let cache = small_cache(1);
        let large = Bytes::from(vec![0u8; 250 * 1024]);

        assert!(cache.set("stale", large.clone(), Duration::from_secs(10)));
        for i in 0..3 {
            assert!(cache.set(&format!("hotel{}", i), large.clone(), DAY));
        }

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.set("fresh", large.clone(), DAY));

        assert!(cache.get("fresh").is_some());
        for i in 0..3 {
            assert!(cache.get(&format!("hotel{}", i)).is_some());
        }
        let stats = cache.stats();
        assert_eq!(stats.expired_count, 1);
        assert_eq!(stats.rejected_count, 0);
    }

    #[test]
    fn oversized_write_is_rejected() {
        let cache = small_cache(1);
        let huge = Bytes::from(vec![0u8; 2 * 1024 * 1024]);
        assert!(!cache.set("big", huge, DAY));
        assert_eq!(cache.stats().rejected_count, 1);
        assert!(cache.get("big").is_none());
    }

    #[test]
    fn namespace_ttls_follow_the_table() {
        let policy = TtlPolicy::default();
        assert_eq!(CacheKey::HotToursCity { city: 1 }.ttl(&policy), DAY);
        assert_eq!(
            CacheKey::HotToursCityCountry { city: 1, country: 4 }.ttl(&policy),
            DAY
        );
        assert_eq!(CacheKey::Reference("meal".into()).ttl(&policy), DAY);
        assert_eq!(
            CacheKey::RandomTours {
                hotel_type: "any".into()
            }
            .ttl(&policy),
            DAY
        );
        assert_eq!(
            CacheKey::Sitemap("hotels".into()).ttl(&policy),
            Duration::from_secs(21_600)
        );
        assert_eq!(
            CacheKey::Application("a1".into()).ttl(&policy),
            Duration::from_secs(2_592_000)
        );
        assert_eq!(
            CacheKey::HotToursCityCountry { city: 3, country: 22 }.render(),
            "hot_tours:city_3_country_22"
        );
    }

    #[tokio::test]
    async fn typed_round_trip_and_undecodable_miss() {
        let cache = Cache::in_memory(CacheConfig::default(), TtlPolicy::default());
        let key = CacheKey::Reference("meal".into());
        assert!(cache.set(&key, &vec!["AI".to_string(), "BB".to_string()]));

        let meals: Option<Vec<String>> = cache.get(&key);
        assert_eq!(meals, Some(vec!["AI".to_string(), "BB".to_string()]));

        let wrong: Option<u64> = cache.get(&key);
        assert!(wrong.is_none());
    }

    #[tokio::test]
    async fn get_or_compute_runs_once_under_concurrency() {
        let cache = Cache::in_memory(CacheConfig::default(), TtlPolicy::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::HotToursCity { city: 1 };

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute::<Vec<u32>, String, _, _>(&key, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(vec![1, 2, 3])
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(vec![1, 2, 3]));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let cached: Option<Vec<u32>> = cache.get(&key);
        assert_eq!(cached, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn panicking_computation_releases_the_key() {
        let cache = Cache::in_memory(CacheConfig::default(), TtlPolicy::default());
        let key = CacheKey::Reference("countries".into());

        let failing = cache.clone();
        let failing_key = key.clone();
        let joined = tokio::spawn(async move {
            failing
                .get_or_compute::<Vec<u8>, String, _, _>(&failing_key, || async {
                    let broken: Option<Vec<u8>> = None;
                    Ok(broken.unwrap())
                })
                .await
        })
        .await;
        assert!(joined.unwrap_err().is_panic());
        assert!(cache.in_flight.is_empty());

        let recovered = cache
            .get_or_compute::<Vec<u8>, String, _, _>(&key, || async { Ok(vec![7]) })
            .await;
        assert_eq!(recovered, Ok(vec![7]));
    }

    #[tokio::test]
    async fn get_or_compute_does_not_cache_errors() {
        let cache = Cache::in_memory(CacheConfig::default(), TtlPolicy::default());
        let key = CacheKey::Reference("stars".into());

        let failed = cache
            .get_or_compute::<Vec<u8>, String, _, _>(&key, || async { Err("down".to_string()) })
            .await;
        assert_eq!(failed, Err("down".to_string()));

        let recovered = cache
            .get_or_compute::<Vec<u8>, String, _, _>(&key, || async { Ok(vec![5]) })
            .await;
        assert_eq!(recovered, Ok(vec![5]));
    }
}
