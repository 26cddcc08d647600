use crate::id_set::IdSet;
use crate::ids::GeneId;
use crate::link::Correlation;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// One coexpression query result, oriented from the query gene outward.
///
/// `support` is always `supporting_datasets.len()`; after
/// [`LinkResult::trim_to_datasets`] both reflect only the datasets the caller
/// asked about. `tested_in_datasets` is populated only for non-quick queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkResult {
    query_gene: GeneId,
    coex_gene: GeneId,
    correlation: Correlation,
    support: u64,
    supporting_datasets: IdSet,
    tested_in_datasets: Option<IdSet>,
    inter_query: bool,
    from_cache: bool,
}

impl LinkResult {
    #[must_use]
    pub fn new(
        query_gene: GeneId,
        coex_gene: GeneId,
        correlation: Correlation,
        supporting_datasets: IdSet,
    ) -> Self {
        Self {
            query_gene,
            coex_gene,
            correlation,
            support: supporting_datasets.len() as u64,
            supporting_datasets,
            tested_in_datasets: None,
            inter_query: false,
            from_cache: false,
        }
    }

    #[must_use]
    pub const fn query_gene(&self) -> GeneId {
        self.query_gene
    }

    #[must_use]
    pub const fn coex_gene(&self) -> GeneId {
        self.coex_gene
    }

    #[must_use]
    pub const fn correlation(&self) -> Correlation {
        self.correlation
    }

    #[must_use]
    pub const fn support(&self) -> u64 {
        self.support
    }

    #[must_use]
    pub const fn supporting_datasets(&self) -> &IdSet {
        &self.supporting_datasets
    }

    #[must_use]
    pub const fn tested_in_datasets(&self) -> Option<&IdSet> {
        self.tested_in_datasets.as_ref()
    }

    #[must_use]
    pub const fn is_inter_query(&self) -> bool {
        self.inter_query
    }

    #[must_use]
    pub const fn is_from_cache(&self) -> bool {
        self.from_cache
    }

    pub fn mark_inter_query(&mut self) {
        self.inter_query = true;
    }

    pub fn mark_from_cache(&mut self) {
        self.from_cache = true;
    }

    pub fn set_tested_in(&mut self, tested_in: IdSet) {
        self.tested_in_datasets = Some(tested_in);
    }

    /// Strip query-specific state before a snapshot is stored for reuse:
    /// tested-in annotation, cache provenance, and the inter-query flag all
    /// depend on the query that produced the result.
    pub fn clear_annotations(&mut self) {
        self.tested_in_datasets = None;
        self.from_cache = false;
        self.inter_query = false;
    }

    /// Identity of the underlying unordered pair, for removing the mirror
    /// representation of a link fetched in both directions.
    #[must_use]
    pub fn unordered_key(&self) -> (GeneId, GeneId, Correlation) {
        let (a, b) = if self.query_gene < self.coex_gene {
            (self.query_gene, self.coex_gene)
        } else {
            (self.coex_gene, self.query_gene)
        };
        (a, b, self.correlation)
    }

    /// Restricts the supporting set to `datasets` and recomputes the support
    /// count. Returns false when the restricted support falls below
    /// `stringency`, meaning the link should be dropped.
    pub fn trim_to_datasets(&mut self, datasets: &IdSet, stringency: u64) -> bool {
        self.support = self.supporting_datasets.restrict_to(datasets) as u64;
        self.support >= stringency
    }

    /// Pre-trim output ordering: descending support, then coexpressed gene id
    /// for a deterministic total order.
    #[must_use]
    pub fn descending_support(a: &Self, b: &Self) -> Ordering {
        b.support
            .cmp(&a.support)
            .then_with(|| a.coex_gene.cmp(&b.coex_gene))
            .then_with(|| a.correlation.cmp(&b.correlation))
    }
}
