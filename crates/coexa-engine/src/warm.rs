use crate::query::convert_links;
use crate::{CoexpressionEngine, EngineError};
use coexa_model::{GeneId, TaxonId};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Bounded FIFO of genes waiting for a cache warm-up. `enqueue` never
/// blocks: once the queue is full, further genes are dropped and only
/// counted, trading completeness of warming for availability.
pub(crate) struct WarmQueue {
    capacity: usize,
    inner: Mutex<VecDeque<(TaxonId, GeneId)>>,
    dropped: AtomicU64,
}

impl WarmQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            dropped: AtomicU64::new(0),
        }
    }

    pub(crate) async fn enqueue(&self, taxon: TaxonId, genes: &[GeneId]) -> usize {
        let mut queue = self.inner.lock().await;
        let mut accepted = 0;
        for gene in genes {
            if queue.len() >= self.capacity {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 1000 == 1 {
                    debug!(dropped, "cache-warm queue full; dropping requests");
                }
                continue;
            }
            if queue.contains(&(taxon, *gene)) {
                continue;
            }
            queue.push_back((taxon, *gene));
            accepted += 1;
        }
        accepted
    }

    pub(crate) async fn dequeue(&self, taxon: TaxonId, genes: &[GeneId]) {
        if genes.is_empty() {
            return;
        }
        let genes: BTreeSet<GeneId> = genes.iter().copied().collect();
        let mut queue = self.inner.lock().await;
        queue.retain(|(t, g)| *t != taxon || !genes.contains(g));
    }

    pub(crate) async fn pop(&self) -> Option<(TaxonId, GeneId)> {
        self.inner.lock().await.pop_front()
    }

    pub(crate) async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// Handle to the single background warm worker. Dropping it leaves the
/// worker running for the process lifetime; `shutdown` stops it.
pub struct WarmWorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WarmWorkerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}

impl CoexpressionEngine {
    /// Spawn the background worker that pops queued genes and runs the
    /// default-shape query for each so later real queries hit the cache.
    /// Exactly one worker runs per engine; further calls return None.
    pub fn spawn_warm_worker(self: &Arc<Self>) -> Option<WarmWorkerHandle> {
        if self
            .warm_worker_spawned
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return None;
        }
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let me = Arc::clone(self);
        let join = tokio::spawn(async move {
            info!("cache-warm worker started");
            let mut consecutive_errors: u64 = 0;
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                match me.warm_queue.pop().await {
                    None => {
                        tokio::select! {
                            changed = shutdown_rx.changed() => {
                                if changed.is_err() || *shutdown_rx.borrow() {
                                    break;
                                }
                            }
                            _ = tokio::time::sleep(me.cfg.warm_poll_interval) => {}
                        }
                    }
                    Some((taxon, gene)) => {
                        // One bad gene must not stop the worker; errors are
                        // swallowed, and logging is capped so a persistent
                        // failure cannot flood the logs.
                        match me.warm_gene(taxon, gene).await {
                            Ok(warmed) => {
                                consecutive_errors = 0;
                                if warmed {
                                    debug!(%gene, "warmed result cache");
                                }
                            }
                            Err(e) => {
                                consecutive_errors += 1;
                                if consecutive_errors <= me.cfg.warm_error_log_cap {
                                    warn!(%gene, error = %e, "cache warm failed; skipping gene");
                                } else if consecutive_errors == me.cfg.warm_error_log_cap + 1 {
                                    warn!("suppressing further cache-warm error logs");
                                }
                            }
                        }
                        tokio::time::sleep(me.cfg.warm_pause).await;
                    }
                }
            }
            info!("cache-warm worker stopped");
        });
        Some(WarmWorkerHandle { shutdown_tx, join })
    }

    /// Run the default-shape query for one gene and cache the outcome.
    /// Returns false when the gene was already cached. Empty results are
    /// cached too, so genes with truly no coexpression are not re-queried.
    pub(crate) async fn warm_gene(
        &self,
        taxon: TaxonId,
        gene: GeneId,
    ) -> Result<bool, EngineError> {
        if self.result_cache.get(gene).await.is_some() {
            return Ok(false);
        }
        let raw = self
            .store
            .links_for_genes(taxon, &[gene], self.cfg.cache_stringency)?;
        let genes = BTreeSet::from([gene]);
        let converted = convert_links(raw, Some(&genes), &genes);
        let list = converted.get(&gene).cloned().unwrap_or_default();
        self.result_cache.put(gene, &list).await;
        Ok(true)
    }
}
