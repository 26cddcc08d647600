#![forbid(unsafe_code)]

use coexa_model::{Correlation, ExperimentId, GeneId, IdSet, IdSetDecodeError, TaxonId};
use rusqlite::{Connection, OpenFlags};
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const CRATE_NAME: &str = "coexa-store";

mod coexpressed_with;
mod ingest;
mod links;
mod node_degree;
mod retract;
mod schema;
mod tested_in;

pub use links::{ExperimentLinkRow, RawLink};

/// Batch sizes for IN-clause queries; keeping them bounded keeps statement
/// size and memory flat regardless of input size.
pub(crate) const LINK_ID_BATCH: usize = 1024;
pub(crate) const SUPPORT_BATCH: usize = 2048;
pub(crate) const GENE_BATCH: usize = 64;
pub(crate) const SET_BATCH: usize = 512;
pub(crate) const EXPERIMENT_BATCH: usize = 8;

#[derive(Debug)]
pub enum StoreError {
    /// Caller handed us something unusable; nothing was touched.
    InvalidArgument(String),
    /// Precondition violation (e.g. re-ingesting an experiment that already
    /// has support). The enclosing transaction is rolled back in full.
    StateConflict(String),
    /// The store contradicts its own invariants (missing mirror row,
    /// undecodable support set). Never repaired silently.
    Corrupt(String),
    Storage(String),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::StateConflict(msg) => write!(f, "state conflict: {msg}"),
            Self::Corrupt(msg) => write!(f, "store corruption: {msg}"),
            Self::Storage(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<IdSetDecodeError> for StoreError {
    fn from(e: IdSetDecodeError) -> Self {
        Self::Corrupt(e.to_string())
    }
}

/// What to do with a link whose support drops to zero during retract.
/// Keeping dormant rows avoids write amplification when the experiment is
/// re-analyzed; every read path then filters on support > 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrunePolicy {
    KeepDormant,
    DeleteOrphans,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub prune_policy: PrunePolicy,
    pub sqlite_pragma_cache_kib: i64,
    pub sqlite_pragma_mmap_bytes: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            prune_policy: PrunePolicy::KeepDormant,
            sqlite_pragma_cache_kib: 32 * 1024,
            sqlite_pragma_mmap_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Outcome of one bulk ingest, reported so the caller can evict caches for
/// exactly the genes whose links changed.
#[derive(Debug, Clone, Default)]
pub struct AppliedLinks {
    pub created: u64,
    pub updated: u64,
    pub affected_genes: BTreeSet<GeneId>,
}

#[derive(Debug, Clone, Default)]
pub struct RetractOutcome {
    pub adjusted: u64,
    pub pruned: u64,
    pub affected_genes: BTreeSet<GeneId>,
}

/// The relation store: symmetric gene-level links, experiment-level link
/// indexes, per-gene tested-in and coexpressed-with sets, and node-degree
/// statistics, all in one WAL-mode SQLite file.
///
/// Mutations run on a single guarded writer connection, each inside one
/// transaction; reads open short-lived read-only connections so concurrent
/// queries never contend with each other.
pub struct RelationStore {
    path: PathBuf,
    cfg: StoreConfig,
    writer: Mutex<Connection>,
}

impl RelationStore {
    pub fn open(path: &Path, cfg: StoreConfig) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA temp_store=MEMORY;
             PRAGMA foreign_keys=ON;",
        )?;
        schema::initialize(&conn)?;
        Ok(Self {
            path: path.to_path_buf(),
            cfg,
            writer: Mutex::new(conn),
        })
    }

    #[must_use]
    pub fn prune_policy(&self) -> PrunePolicy {
        self.cfg.prune_policy
    }

    pub(crate) fn reader(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let pragma_sql = format!(
            "PRAGMA query_only=ON; PRAGMA temp_store=MEMORY; PRAGMA cache_size=-{}; PRAGMA mmap_size={};",
            self.cfg.sqlite_pragma_cache_kib, self.cfg.sqlite_pragma_mmap_bytes
        );
        conn.execute_batch(&pragma_sql)?;
        Ok(conn)
    }

    pub(crate) fn with_writer<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| StoreError::Storage("writer connection lock poisoned".to_string()))?;
        f(&mut guard)
    }

    /// Bulk-ingest the complete link set discovered for one experiment, plus
    /// the genes the experiment's analysis covered. All-or-nothing.
    pub fn apply(
        &self,
        taxon: TaxonId,
        experiment: ExperimentId,
        links: &[coexa_model::UnorderedLink],
        tested_genes: &BTreeSet<GeneId>,
    ) -> Result<AppliedLinks, StoreError> {
        self.with_writer(|conn| ingest::apply(conn, taxon, experiment, links, tested_genes))
    }

    /// Remove one experiment's support everywhere it appears. All-or-nothing.
    pub fn retract(
        &self,
        taxon: TaxonId,
        experiment: ExperimentId,
    ) -> Result<RetractOutcome, StoreError> {
        let policy = self.cfg.prune_policy;
        self.with_writer(|conn| retract::retract(conn, policy, taxon, experiment))
    }

    pub fn has_links(
        &self,
        taxon: TaxonId,
        experiment: ExperimentId,
    ) -> Result<bool, StoreError> {
        Ok(self.count_links(taxon, experiment)? > 0)
    }

    /// Number of logical links the experiment supports. Both directions are
    /// stored, so an odd raw row count means the index is corrupt.
    pub fn count_links(
        &self,
        taxon: TaxonId,
        experiment: ExperimentId,
    ) -> Result<u64, StoreError> {
        let conn = self.reader()?;
        links::count_experiment_links(&conn, taxon, experiment)
    }

    /// Links the experiment supports for one gene; counting a single
    /// direction avoids double counting.
    pub fn count_links_for_gene(
        &self,
        taxon: TaxonId,
        gene: GeneId,
        experiment: ExperimentId,
    ) -> Result<u64, StoreError> {
        let conn = self.reader()?;
        links::count_experiment_links_for_gene(&conn, taxon, gene, experiment)
    }

    /// All links whose first gene is in `genes` at the given minimum support,
    /// with support sets hydrated. Batched over genes and support rows.
    pub fn links_for_genes(
        &self,
        taxon: TaxonId,
        genes: &[GeneId],
        min_support: u64,
    ) -> Result<Vec<RawLink>, StoreError> {
        let conn = self.reader()?;
        links::links_for_genes(&conn, taxon, genes, min_support)
    }

    /// Links where *both* genes are in `genes`, at the given minimum support.
    pub fn inter_links_for_genes(
        &self,
        taxon: TaxonId,
        genes: &[GeneId],
        min_support: u64,
    ) -> Result<Vec<RawLink>, StoreError> {
        let conn = self.reader()?;
        links::inter_links_for_genes(&conn, taxon, genes, min_support)
    }

    /// Experiment-index rows for the given experiments restricted to the
    /// given first genes; the caller counts per-link occurrences in memory.
    pub fn experiment_links_for_genes(
        &self,
        taxon: TaxonId,
        experiments: &[ExperimentId],
        genes: &[GeneId],
    ) -> Result<Vec<ExperimentLinkRow>, StoreError> {
        let conn = self.reader()?;
        links::experiment_links_for_genes(&conn, taxon, experiments, genes)
    }

    /// Distinct gene-link ids touched by any of the given experiments.
    pub fn link_ids_for_experiments(
        &self,
        taxon: TaxonId,
        experiments: &[ExperimentId],
    ) -> Result<Vec<i64>, StoreError> {
        let conn = self.reader()?;
        links::link_ids_for_experiments(&conn, taxon, experiments)
    }

    /// Distinct gene-link ids touched by the experiments where both genes are
    /// in `genes`.
    pub fn inter_link_ids_for_experiments(
        &self,
        taxon: TaxonId,
        experiments: &[ExperimentId],
        genes: &[GeneId],
    ) -> Result<Vec<i64>, StoreError> {
        let conn = self.reader()?;
        links::inter_link_ids_for_experiments(&conn, taxon, experiments, genes)
    }

    /// Hydrate gene-link rows by id, support sets included. Ids are sorted
    /// before querying for locality; unsupported (dormant) rows are skipped.
    pub fn load_links(&self, taxon: TaxonId, link_ids: &[i64]) -> Result<Vec<RawLink>, StoreError> {
        let conn = self.reader()?;
        links::load_links(&conn, taxon, link_ids)
    }

    /// Per-gene tested-in sets for the given genes. Genes with no tested-in
    /// row are simply absent from the map.
    pub fn tested_in(
        &self,
        taxon: TaxonId,
        genes: &[GeneId],
    ) -> Result<std::collections::HashMap<GeneId, IdSet>, StoreError> {
        let conn = self.reader()?;
        tested_in::tested_in_for_genes(&conn, taxon, genes)
    }

    /// Every gene of the taxon known to the store (i.e. tested in at least
    /// one experiment at some point).
    pub fn gene_ids(&self, taxon: TaxonId) -> Result<Vec<GeneId>, StoreError> {
        let conn = self.reader()?;
        tested_in::gene_ids_for_taxon(&conn, taxon)
    }

    pub fn node_degree(
        &self,
        taxon: TaxonId,
        gene: GeneId,
    ) -> Result<Option<coexa_model::NodeDegreeStats>, StoreError> {
        let conn = self.reader()?;
        node_degree::node_degree(&conn, taxon, gene)
    }

    pub fn node_degrees(
        &self,
        taxon: TaxonId,
        genes: &[GeneId],
    ) -> Result<std::collections::HashMap<GeneId, coexa_model::NodeDegreeStats>, StoreError> {
        let conn = self.reader()?;
        node_degree::node_degrees(&conn, taxon, genes)
    }

    pub fn upsert_node_degree(
        &self,
        taxon: TaxonId,
        gene: GeneId,
        stats: &coexa_model::NodeDegreeStats,
    ) -> Result<(), StoreError> {
        self.with_writer(|conn| node_degree::upsert_node_degree(conn, taxon, gene, stats))
    }

    /// Persist the per-gene relative rank vectors computed by the node-degree
    /// maintenance job, in one transaction per call.
    pub fn update_relative_ranks(
        &self,
        taxon: TaxonId,
        pos: &std::collections::BTreeMap<GeneId, Vec<f64>>,
        neg: &std::collections::BTreeMap<GeneId, Vec<f64>>,
    ) -> Result<(), StoreError> {
        self.with_writer(|conn| node_degree::update_relative_ranks(conn, taxon, pos, neg))
    }
}

pub(crate) fn gene_to_sql(gene: GeneId) -> i64 {
    gene.as_u64() as i64
}

pub(crate) fn gene_from_sql(raw: i64) -> GeneId {
    GeneId::new(raw as u64)
}

pub(crate) fn experiment_to_sql(experiment: ExperimentId) -> i64 {
    experiment.as_u64() as i64
}

pub(crate) fn taxon_to_sql(taxon: TaxonId) -> i64 {
    taxon.as_u64() as i64
}

pub(crate) fn correlation_to_sql(correlation: Correlation) -> i64 {
    i64::from(correlation.is_positive())
}

pub(crate) fn placeholders(n: usize) -> String {
    let mut out = String::with_capacity(n * 2);
    for i in 0..n {
        if i > 0 {
            out.push(',');
        }
        out.push('?');
    }
    out
}

#[cfg(test)]
mod store_tests;
