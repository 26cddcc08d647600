#![forbid(unsafe_code)]

use coexa_model::{ExperimentId, GeneId, IdSet, TaxonId, UnorderedLink};
use coexa_store::{RelationStore, StoreError};
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const CRATE_NAME: &str = "coexa-engine";

mod cache;
mod node_degree_job;
mod query;
mod trim;
mod warm;

pub use cache::CacheConfig;
pub use coexa_store::{AppliedLinks, PrunePolicy, RetractOutcome, StoreConfig};
pub use node_degree_job::NodeDegreeUpdateSummary;
pub use query::{QueryRequest, QueryResults};
pub use warm::WarmWorkerHandle;

#[derive(Debug)]
pub enum EngineError {
    /// Rejected before touching the store; no partial result exists.
    InvalidArgument(String),
    /// Caller misuse against current store state (e.g. re-ingesting an
    /// experiment that still has support).
    StateConflict(String),
    /// The store contradicts itself (a supported link whose gene has no
    /// tested-in data, a missing mirror row). Fatal for the operation.
    Consistency(String),
    Storage(String),
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::StateConflict(msg) => write!(f, "state conflict: {msg}"),
            Self::Consistency(msg) => write!(f, "consistency violation: {msg}"),
            Self::Storage(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidArgument(msg) => Self::InvalidArgument(msg),
            StoreError::StateConflict(msg) => Self::StateConflict(msg),
            StoreError::Corrupt(msg) => Self::Consistency(msg),
            StoreError::Storage(msg) => Self::Storage(msg),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Results are cached only for the default query shape at this
    /// stringency; lower-stringency queries bypass the cache entirely.
    pub cache_stringency: u64,
    /// Above this many datasets, experiment-first querying stops paying off.
    pub max_datasets_for_dataset_first: usize,
    /// A gene-less query is allowed against at most this many datasets.
    pub max_datasets_for_dataset_only: usize,
    /// Below this many genes, gene-first querying wins even for few datasets.
    pub min_genes_for_dataset_first: usize,
    pub result_cache: CacheConfig,
    pub tested_in_cache: CacheConfig,
    pub warm_queue_capacity: usize,
    /// How long the warm worker sleeps when the queue is empty.
    pub warm_poll_interval: Duration,
    /// Pause between warmed genes, to rate-limit background store load.
    pub warm_pause: Duration,
    /// After this many consecutive warm failures, further ones are only
    /// counted, not logged.
    pub warm_error_log_cap: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_stringency: 5,
            max_datasets_for_dataset_first: 50,
            max_datasets_for_dataset_only: 20,
            min_genes_for_dataset_first: 10,
            result_cache: CacheConfig {
                enabled: true,
                max_entries: 100_000,
                ttl: Duration::from_secs(6 * 3600),
                idle_ttl: Duration::from_secs(1800),
            },
            tested_in_cache: CacheConfig {
                enabled: true,
                max_entries: 100_000,
                ttl: Duration::from_secs(6 * 3600),
                idle_ttl: Duration::from_secs(1800),
            },
            warm_queue_capacity: 1000,
            warm_poll_interval: Duration::from_millis(200),
            warm_pause: Duration::from_millis(20),
            warm_error_log_cap: 10,
        }
    }
}

/// The coexpression service facade: bulk ingest/retract, the two-strategy
/// query engine with its result and tested-in caches, background cache
/// warming, and node-degree maintenance.
///
/// Reads may run concurrently from any number of tasks; ingest and retract
/// for one experiment are expected to be serialized by the caller, and each
/// runs as a single store transaction.
pub struct CoexpressionEngine {
    cfg: EngineConfig,
    store: Arc<RelationStore>,
    result_cache: cache::ResultCache,
    tested_in_cache: cache::GeneKeyedCache<IdSet>,
    warm_queue: warm::WarmQueue,
    warm_worker_spawned: AtomicBool,
}

impl CoexpressionEngine {
    #[must_use]
    pub fn new(store: Arc<RelationStore>, cfg: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            result_cache: cache::ResultCache::new(
                cfg.result_cache.clone(),
                cfg.cache_stringency,
            ),
            tested_in_cache: cache::GeneKeyedCache::new(cfg.tested_in_cache.clone()),
            warm_queue: warm::WarmQueue::new(cfg.warm_queue_capacity),
            warm_worker_spawned: AtomicBool::new(false),
            cfg,
            store,
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    /// The underlying relation store, shared with maintenance tooling.
    #[must_use]
    pub fn store_handle(&self) -> Arc<RelationStore> {
        Arc::clone(&self.store)
    }

    /// Ingest the complete link set computed for one experiment. The store
    /// mutation is all-or-nothing; caches are evicted only after it commits,
    /// so a concurrent read cannot repopulate them with pre-mutation data.
    pub async fn ingest(
        &self,
        taxon: TaxonId,
        experiment: ExperimentId,
        links: Vec<UnorderedLink>,
        tested_genes: BTreeSet<GeneId>,
    ) -> Result<AppliedLinks, EngineError> {
        let mut touched: Vec<GeneId> = links
            .iter()
            .flat_map(|l| [l.first(), l.second()])
            .collect();
        touched.sort_unstable();
        touched.dedup();
        // Pending warm-ups for these genes would be wasted work.
        self.warm_queue.dequeue(taxon, &touched).await;

        let store = Arc::clone(&self.store);
        let tested_for_store = tested_genes.clone();
        let applied = tokio::task::spawn_blocking(move || {
            store.apply(taxon, experiment, &links, &tested_for_store)
        })
        .await
        .map_err(|e| EngineError::Storage(e.to_string()))??;

        let mut to_evict: Vec<GeneId> = applied.affected_genes.iter().copied().collect();
        to_evict.extend(tested_genes.iter().copied());
        to_evict.sort_unstable();
        to_evict.dedup();
        let evicted = self.result_cache.evict(to_evict.clone()).await;
        self.tested_in_cache.evict(to_evict).await;
        if evicted > 0 {
            info!(evicted, "results evicted from cache after ingest");
        }
        Ok(applied)
    }

    /// Remove one experiment's contribution entirely. Node-degree statistics
    /// are left to the maintenance job, which runs on its own schedule.
    pub async fn retract(
        &self,
        taxon: TaxonId,
        experiment: ExperimentId,
    ) -> Result<RetractOutcome, EngineError> {
        let store = Arc::clone(&self.store);
        let outcome = tokio::task::spawn_blocking(move || store.retract(taxon, experiment))
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))??;

        let affected: Vec<GeneId> = outcome.affected_genes.iter().copied().collect();
        self.warm_queue.dequeue(taxon, &affected).await;
        let evicted = self.result_cache.evict(affected).await;
        // Retract touches the tested-in set of every gene of the taxon, not
        // just genes with links, so that cache is cleared wholesale.
        self.tested_in_cache.clear().await;
        if evicted > 0 {
            info!(evicted, "results evicted from cache after retract");
        }
        Ok(outcome)
    }

    pub async fn node_degree(
        &self,
        taxon: TaxonId,
        gene: GeneId,
    ) -> Result<Option<coexa_model::NodeDegreeStats>, EngineError> {
        Ok(self.store.node_degree(taxon, gene)?)
    }

    pub async fn node_degrees(
        &self,
        taxon: TaxonId,
        genes: &[GeneId],
    ) -> Result<std::collections::HashMap<GeneId, coexa_model::NodeDegreeStats>, EngineError> {
        Ok(self.store.node_degrees(taxon, genes)?)
    }

    /// Best-effort hint; genes beyond the queue capacity are silently
    /// dropped. Returns how many were accepted.
    pub async fn enqueue_for_warm(&self, taxon: TaxonId, genes: &[GeneId]) -> usize {
        self.warm_queue.enqueue(taxon, genes).await
    }

    /// Drop pending warm-up work for the given genes.
    pub async fn dequeue_warm(&self, taxon: TaxonId, genes: &[GeneId]) {
        self.warm_queue.dequeue(taxon, genes).await;
    }

    /// Number of genes currently waiting to be warmed.
    pub async fn warm_backlog(&self) -> usize {
        self.warm_queue.len().await
    }

    /// Idempotent: afterwards both caches behave as disabled. The warm
    /// worker, if spawned, is stopped through its own handle.
    pub async fn shutdown(&self) {
        self.result_cache.shutdown();
        self.tested_in_cache.shutdown();
        info!("coexpression caches shut down");
    }
}
