#![allow(dead_code)]

use coexa_engine::{CoexpressionEngine, EngineConfig, PrunePolicy, QueryRequest, StoreConfig};
use coexa_model::{Correlation, ExperimentId, GeneId, TaxonId, UnorderedLink};
use coexa_store::RelationStore;
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;

pub const TAXON: TaxonId = TaxonId::new(9606);

pub fn engine_with(
    policy: PrunePolicy,
    cfg: EngineConfig,
) -> (TempDir, Arc<CoexpressionEngine>) {
    let dir = TempDir::new().expect("tempdir");
    let store_cfg = StoreConfig {
        prune_policy: policy,
        ..Default::default()
    };
    let store =
        RelationStore::open(&dir.path().join("coexa.sqlite"), store_cfg).expect("open store");
    let engine = CoexpressionEngine::new(Arc::new(store), cfg);
    (dir, engine)
}

/// Engine with the cache active for low-stringency test queries.
pub fn engine(policy: PrunePolicy) -> (TempDir, Arc<CoexpressionEngine>) {
    engine_with(
        policy,
        EngineConfig {
            cache_stringency: 1,
            ..Default::default()
        },
    )
}

pub fn gene(id: u64) -> GeneId {
    GeneId::new(id)
}

pub fn experiment(id: u64) -> ExperimentId {
    ExperimentId::new(id)
}

pub fn link(a: u64, b: u64, positive: bool) -> UnorderedLink {
    UnorderedLink::new(gene(a), gene(b), Correlation::from_positive(positive)).expect("link")
}

pub fn genes(ids: &[u64]) -> BTreeSet<GeneId> {
    ids.iter().map(|id| gene(*id)).collect()
}

pub fn datasets(ids: &[u64]) -> BTreeSet<ExperimentId> {
    ids.iter().map(|id| experiment(*id)).collect()
}

pub fn request(gene_ids: &[u64], dataset_ids: &[u64], stringency: u64) -> QueryRequest {
    QueryRequest {
        taxon: TAXON,
        genes: genes(gene_ids),
        datasets: datasets(dataset_ids),
        stringency,
        max_results_per_gene: 0,
        quick: false,
    }
}
