use coexa_model::{GeneId, LinkResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Disabled caches short-circuit every operation to a no-op.
    pub enabled: bool,
    pub max_entries: usize,
    pub ttl: Duration,
    pub idle_ttl: Duration,
}

struct CacheSlot<V> {
    value: V,
    inserted_at: Instant,
    last_access: Instant,
}

/// A bounded gene-keyed cache with TTL and idle expiry. Values are owned
/// snapshots: `get` clones, so callers can never mutate a shared entry.
///
/// One mutex guards the whole map, which also gives `clear` the required
/// exclusion against concurrent `put`/`evict`.
pub(crate) struct GeneKeyedCache<V> {
    cfg: CacheConfig,
    shut_down: AtomicBool,
    entries: Mutex<HashMap<GeneId, CacheSlot<V>>>,
}

impl<V: Clone> GeneKeyedCache<V> {
    pub(crate) fn new(cfg: CacheConfig) -> Self {
        Self {
            cfg,
            shut_down: AtomicBool::new(false),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn active(&self) -> bool {
        self.cfg.enabled && !self.shut_down.load(Ordering::Relaxed)
    }

    fn expired(&self, slot: &CacheSlot<V>, now: Instant) -> bool {
        now.duration_since(slot.inserted_at) > self.cfg.ttl
            || now.duration_since(slot.last_access) > self.cfg.idle_ttl
    }

    pub(crate) async fn get(&self, gene: GeneId) -> Option<V> {
        if !self.active() {
            return None;
        }
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, slot| !self.expired(slot, now));
        let slot = entries.get_mut(&gene)?;
        slot.last_access = now;
        Some(slot.value.clone())
    }

    pub(crate) async fn put(&self, gene: GeneId, value: V) {
        if !self.active() {
            return;
        }
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, slot| !self.expired(slot, now));
        if entries.len() >= self.cfg.max_entries && !entries.contains_key(&gene) {
            if let Some(victim) = entries
                .iter()
                .min_by_key(|(_, slot)| slot.inserted_at)
                .map(|(k, _)| *k)
            {
                entries.remove(&victim);
            }
        }
        entries.insert(
            gene,
            CacheSlot {
                value,
                inserted_at: now,
                last_access: now,
            },
        );
    }

    pub(crate) async fn evict<I>(&self, genes: I) -> usize
    where
        I: IntoIterator<Item = GeneId>,
    {
        if !self.active() {
            return 0;
        }
        let mut entries = self.entries.lock().await;
        let mut removed = 0;
        for gene in genes {
            if entries.remove(&gene).is_some() {
                removed += 1;
            }
        }
        removed
    }

    pub(crate) async fn clear(&self) {
        if !self.active() {
            return;
        }
        self.entries.lock().await.clear();
    }

    /// Idempotent; afterwards every operation behaves as disabled.
    pub(crate) fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// The per-gene result cache. Only default-shape results are stored: no
/// dataset restriction, no result cap, stringency at most the cache
/// stringency. Entries hold links at or above the cache stringency with
/// query-specific annotations stripped, so they are safe to reuse for any
/// narrower future query.
pub(crate) struct ResultCache {
    inner: GeneKeyedCache<Vec<LinkResult>>,
    cache_stringency: u64,
}

impl ResultCache {
    pub(crate) fn new(cfg: CacheConfig, cache_stringency: u64) -> Self {
        Self {
            inner: GeneKeyedCache::new(cfg),
            cache_stringency,
        }
    }

    /// Returns a defensive copy tagged as cache-sourced.
    pub(crate) async fn get(&self, gene: GeneId) -> Option<Vec<LinkResult>> {
        let mut list = self.inner.get(gene).await?;
        for result in &mut list {
            result.mark_from_cache();
        }
        Some(list)
    }

    /// Stores the cacheable subset of an (unconstrained, pre-trim) result
    /// list. Empty lists are stored too: knowing a gene has no coexpression
    /// is exactly what saves the next query.
    pub(crate) async fn put(&self, gene: GeneId, results: &[LinkResult]) {
        let mut kept: Vec<LinkResult> = results
            .iter()
            .filter(|r| r.support() >= self.cache_stringency)
            .cloned()
            .collect();
        for result in &mut kept {
            result.clear_annotations();
        }
        kept.sort_by(LinkResult::descending_support);
        self.inner.put(gene, kept).await;
    }

    pub(crate) async fn evict<I>(&self, genes: I) -> usize
    where
        I: IntoIterator<Item = GeneId>,
    {
        self.inner.evict(genes).await
    }

    #[allow(dead_code)]
    pub(crate) async fn clear(&self) {
        self.inner.clear().await;
    }

    pub(crate) fn shutdown(&self) {
        self.inner.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coexa_model::Correlation;

    fn cfg(enabled: bool, max_entries: usize) -> CacheConfig {
        CacheConfig {
            enabled,
            max_entries,
            ttl: Duration::from_secs(3600),
            idle_ttl: Duration::from_secs(3600),
        }
    }

    fn result(gene: u64, coex: u64, datasets: &[u64]) -> LinkResult {
        LinkResult::new(
            GeneId::new(gene),
            GeneId::new(coex),
            Correlation::Positive,
            datasets.iter().copied().collect(),
        )
    }

    #[tokio::test]
    async fn get_returns_owned_tagged_copies() {
        let cache = ResultCache::new(cfg(true, 16), 1);
        cache.put(GeneId::new(1), &[result(1, 2, &[10])]).await;
        let got = cache.get(GeneId::new(1)).await.expect("hit");
        assert!(got[0].is_from_cache());
        // The stored entry itself stays untagged.
        let again = cache.get(GeneId::new(1)).await.expect("hit");
        assert!(again[0].is_from_cache());
    }

    #[tokio::test]
    async fn put_filters_below_cache_stringency() {
        let cache = ResultCache::new(cfg(true, 16), 2);
        cache
            .put(
                GeneId::new(1),
                &[result(1, 2, &[10]), result(1, 3, &[10, 11])],
            )
            .await;
        let got = cache.get(GeneId::new(1)).await.expect("hit");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].coex_gene(), GeneId::new(3));
    }

    #[tokio::test]
    async fn disabled_cache_is_a_noop() {
        let cache: GeneKeyedCache<u32> = GeneKeyedCache::new(cfg(false, 16));
        cache.put(GeneId::new(1), 7).await;
        assert_eq!(cache.get(GeneId::new(1)).await, None);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_disables() {
        let cache: GeneKeyedCache<u32> = GeneKeyedCache::new(cfg(true, 16));
        cache.put(GeneId::new(1), 7).await;
        cache.shutdown();
        cache.shutdown();
        assert_eq!(cache.get(GeneId::new(1)).await, None);
        cache.put(GeneId::new(2), 8).await;
        assert_eq!(cache.get(GeneId::new(2)).await, None);
    }

    #[tokio::test]
    async fn capacity_evicts_oldest_entry() {
        let cache: GeneKeyedCache<u32> = GeneKeyedCache::new(cfg(true, 2));
        cache.put(GeneId::new(1), 1).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.put(GeneId::new(2), 2).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.put(GeneId::new(3), 3).await;
        assert_eq!(cache.get(GeneId::new(1)).await, None);
        assert_eq!(cache.get(GeneId::new(2)).await, Some(2));
        assert_eq!(cache.get(GeneId::new(3)).await, Some(3));
    }

    #[tokio::test]
    async fn ttl_expires_entries() {
        let cache: GeneKeyedCache<u32> = GeneKeyedCache::new(CacheConfig {
            enabled: true,
            max_entries: 16,
            ttl: Duration::from_millis(10),
            idle_ttl: Duration::from_secs(3600),
        });
        cache.put(GeneId::new(1), 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get(GeneId::new(1)).await, None);
    }

    #[tokio::test]
    async fn evict_reports_removed_count() {
        let cache: GeneKeyedCache<u32> = GeneKeyedCache::new(cfg(true, 16));
        cache.put(GeneId::new(1), 1).await;
        cache.put(GeneId::new(2), 2).await;
        let removed = cache
            .evict([GeneId::new(1), GeneId::new(9)])
            .await;
        assert_eq!(removed, 1);
        assert_eq!(cache.len().await, 1);
    }
}
