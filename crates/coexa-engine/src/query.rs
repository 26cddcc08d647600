use crate::{CoexpressionEngine, EngineError};
use coexa_model::{Correlation, ExperimentId, GeneId, LinkResult, TaxonId};
use coexa_store::RawLink;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info};

/// One coexpression query. `genes` may be empty (dataset-only mode, bounded
/// by the dataset limit); `datasets` must not be, and is assumed to be
/// security-filtered already by the caller.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub taxon: TaxonId,
    pub genes: BTreeSet<GeneId>,
    pub datasets: BTreeSet<ExperimentId>,
    pub stringency: u64,
    /// 0 means unlimited. Inter-query links are exempt from the cap.
    pub max_results_per_gene: usize,
    /// Quick results skip the tested-in annotation.
    pub quick: bool,
}

pub type QueryResults = BTreeMap<GeneId, Vec<LinkResult>>;

impl CoexpressionEngine {
    /// Key entry point. Depending on the input the query runs dataset-only,
    /// experiment-first or gene-first; results are merged from cache and
    /// store, trimmed to the requested datasets/stringency/cap, and (unless
    /// `quick`) annotated with tested-in denominators.
    pub async fn query(&self, req: &QueryRequest) -> Result<QueryResults, EngineError> {
        self.validate(req)?;

        let mut results = if req.genes.is_empty() {
            info!(
                datasets = req.datasets.len(),
                stringency = req.stringency,
                "query in dataset-only mode, no gene constraint"
            );
            self.dataset_only(req)?
        } else if req.datasets.len() < self.cfg.max_datasets_for_dataset_first
            && req.genes.len() > self.cfg.min_genes_for_dataset_first
        {
            if req.genes.len() > 1 {
                info!(
                    genes = req.genes.len(),
                    datasets = req.datasets.len(),
                    stringency = req.stringency,
                    "query in experiment-first mode"
                );
            }
            self.experiment_first(req).await?
        } else {
            if req.genes.len() > 1 {
                info!(
                    genes = req.genes.len(),
                    datasets = req.datasets.len(),
                    stringency = req.stringency,
                    "query in gene-first mode"
                );
            }
            self.gene_first(req).await?
        };

        self.trim_and_finish(
            req.taxon,
            &mut results,
            &req.datasets,
            req.stringency,
            req.max_results_per_gene,
            req.quick,
        )
        .await?;
        Ok(results)
    }

    /// Coexpression partners of a single gene within the given datasets.
    pub async fn links_of_gene(
        &self,
        taxon: TaxonId,
        gene: GeneId,
        datasets: BTreeSet<ExperimentId>,
        stringency: u64,
        max_results: usize,
        quick: bool,
    ) -> Result<Vec<LinkResult>, EngineError> {
        let req = QueryRequest {
            taxon,
            genes: BTreeSet::from([gene]),
            datasets,
            stringency,
            max_results_per_gene: max_results,
            quick,
        };
        let mut results = self.query(&req).await?;
        Ok(results.remove(&gene).unwrap_or_default())
    }

    /// Links common to the given datasets, without any gene constraint.
    pub async fn links_common_to_datasets(
        &self,
        taxon: TaxonId,
        datasets: BTreeSet<ExperimentId>,
        stringency: u64,
        quick: bool,
    ) -> Result<QueryResults, EngineError> {
        let req = QueryRequest {
            taxon,
            genes: BTreeSet::new(),
            datasets,
            stringency,
            max_results_per_gene: 0,
            quick,
        };
        self.query(&req).await
    }

    /// Links among a specific gene set only: both endpoints must be query
    /// genes. No result cap applies.
    pub async fn inter_gene_links(
        &self,
        taxon: TaxonId,
        genes: BTreeSet<GeneId>,
        datasets: BTreeSet<ExperimentId>,
        stringency: u64,
        quick: bool,
    ) -> Result<QueryResults, EngineError> {
        if genes.is_empty() {
            return Err(EngineError::InvalidArgument(
                "at least one gene must be supplied".to_string(),
            ));
        }
        self.validate(&QueryRequest {
            taxon,
            genes: genes.clone(),
            datasets: datasets.clone(),
            stringency,
            max_results_per_gene: 0,
            quick,
        })?;

        let (mut results, missing) = self.inter_cache_hits(&genes, stringency).await;

        if !missing.is_empty() {
            let db_results = if datasets.len() > self.cfg.max_datasets_for_dataset_first
                || genes.len() < self.cfg.min_genes_for_dataset_first
            {
                let missing_vec: Vec<GeneId> = missing.iter().copied().collect();
                let raw = self
                    .store
                    .inter_links_for_genes(taxon, &missing_vec, stringency)?;
                convert_links(raw, Some(&missing), &genes)
            } else {
                let dataset_vec: Vec<ExperimentId> = datasets.iter().copied().collect();
                let gene_vec: Vec<GeneId> = genes.iter().copied().collect();
                let link_ids =
                    self.store
                        .inter_link_ids_for_experiments(taxon, &dataset_vec, &gene_vec)?;
                debug!(
                    links = link_ids.len(),
                    "distinct link ids from experiment-level inter-gene query"
                );
                if link_ids.is_empty() {
                    QueryResults::new()
                } else {
                    let raw = self.store.load_links(taxon, &link_ids)?;
                    convert_links(raw, Some(&genes), &genes)
                }
            };
            merge_results(&mut results, db_results);
        }

        // Inter-gene results were fetched with a constraint on the found
        // gene, so they are not written back to the cache.
        self.trim_and_finish(taxon, &mut results, &datasets, stringency, 0, quick)
            .await?;
        Ok(results)
    }

    fn validate(&self, req: &QueryRequest) -> Result<(), EngineError> {
        if req.datasets.is_empty() {
            return Err(EngineError::InvalidArgument(
                "at least one dataset must be supplied".to_string(),
            ));
        }
        if req.stringency == 0 {
            return Err(EngineError::InvalidArgument(
                "stringency must be at least 1".to_string(),
            ));
        }
        if req.stringency as usize > req.datasets.len() {
            return Err(EngineError::InvalidArgument(format!(
                "stringency {} exceeds the {} datasets supplied",
                req.stringency,
                req.datasets.len()
            )));
        }
        if req.genes.is_empty() && req.datasets.len() >= self.cfg.max_datasets_for_dataset_only {
            return Err(EngineError::InvalidArgument(format!(
                "query cannot be safely constructed: no genes and {} datasets (limit {}); \
                 add gene constraints or reduce the dataset set",
                req.datasets.len(),
                self.cfg.max_datasets_for_dataset_only
            )));
        }
        Ok(())
    }

    /// Find links common to the experiments via the experiment index alone.
    fn dataset_only(&self, req: &QueryRequest) -> Result<QueryResults, EngineError> {
        let dataset_vec: Vec<ExperimentId> = req.datasets.iter().copied().collect();
        let link_ids = self
            .store
            .link_ids_for_experiments(req.taxon, &dataset_vec)?;
        if link_ids.is_empty() {
            return Ok(QueryResults::new());
        }
        let raw = self.store.load_links(req.taxon, &link_ids)?;
        Ok(convert_links(raw, None, &req.genes))
    }

    /// Fetch experiment-index rows for the requested datasets restricted to
    /// the query genes, count per-link occurrences in memory, and hydrate
    /// only links meeting the stringency. Results are dataset-constrained in
    /// shape and therefore never written back to the cache.
    async fn experiment_first(&self, req: &QueryRequest) -> Result<QueryResults, EngineError> {
        let (mut results, missing) = self.cache_hits(req).await;
        if missing.is_empty() {
            return Ok(results);
        }

        let dataset_vec: Vec<ExperimentId> = req.datasets.iter().copied().collect();
        let missing_vec: Vec<GeneId> = missing.iter().copied().collect();
        let rows = self
            .store
            .experiment_links_for_genes(req.taxon, &dataset_vec, &missing_vec)?;

        // Both directions of a link carry the same link id, so occurrences
        // are counted per distinct (link, experiment).
        let mut seen: HashSet<(i64, ExperimentId)> = HashSet::with_capacity(rows.len());
        let mut counts: HashMap<i64, u64> = HashMap::new();
        for row in &rows {
            if seen.insert((row.link_id, row.experiment)) {
                *counts.entry(row.link_id).or_insert(0) += 1;
            }
        }
        let keepers: Vec<i64> = counts
            .iter()
            .filter(|(_, count)| **count >= req.stringency)
            .map(|(link_id, _)| *link_id)
            .collect();
        debug!(
            rows = rows.len(),
            keepers = keepers.len(),
            "experiment-first occurrence counting"
        );
        if keepers.is_empty() {
            return Ok(results);
        }

        let raw = self.store.load_links(req.taxon, &keepers)?;
        merge_results(&mut results, convert_links(raw, Some(&missing), &req.genes));
        Ok(results)
    }

    /// Fetch all links of the query genes at the requested support directly,
    /// then write qualifying per-gene lists back into the result cache.
    async fn gene_first(&self, req: &QueryRequest) -> Result<QueryResults, EngineError> {
        let (mut results, missing) = self.cache_hits(req).await;
        if missing.is_empty() {
            return Ok(results);
        }

        let missing_vec: Vec<GeneId> = missing.iter().copied().collect();
        let raw = self
            .store
            .links_for_genes(req.taxon, &missing_vec, req.stringency)?;

        // Only the default shape is cacheable: not quick, no result cap, no
        // dataset restriction baked in (these lists are pre-trim), and a
        // stringency at or below the cache stringency so nothing the cache
        // would serve later is missing from the list. Each gene's entry is
        // built from its own directional rows, before mirror deduplication,
        // so every cached list is complete for its gene.
        if !req.quick
            && req.max_results_per_gene == 0
            && req.stringency <= self.cfg.cache_stringency
        {
            let mut per_gene: QueryResults = QueryResults::new();
            for link in &raw {
                if missing.contains(&link.first_gene) {
                    per_gene.entry(link.first_gene).or_default().push(
                        LinkResult::new(
                            link.first_gene,
                            link.second_gene,
                            link.correlation,
                            link.support_ids.clone(),
                        ),
                    );
                }
            }
            for (gene, list) in &per_gene {
                self.result_cache.put(*gene, list).await;
            }
        }

        merge_results(&mut results, convert_links(raw, Some(&missing), &req.genes));
        Ok(results)
    }

    /// Split query genes into cache hits and misses. The cache only models
    /// the unconstrained all-dataset denominator, so it is usable only at or
    /// above the cache stringency.
    async fn cache_hits(&self, req: &QueryRequest) -> (QueryResults, BTreeSet<GeneId>) {
        let mut results = QueryResults::new();
        let mut missing = BTreeSet::new();
        if req.stringency < self.cfg.cache_stringency {
            missing.extend(req.genes.iter().copied());
            return (results, missing);
        }
        for gene in &req.genes {
            match self.result_cache.get(*gene).await {
                Some(mut list) => {
                    for result in &mut list {
                        if req.genes.contains(&result.coex_gene()) {
                            result.mark_inter_query();
                        }
                    }
                    results.insert(*gene, list);
                }
                None => {
                    missing.insert(*gene);
                }
            }
        }
        if !missing.is_empty() && missing.len() < req.genes.len() {
            info!(
                hits = req.genes.len() - missing.len(),
                misses = missing.len(),
                "partial result-cache hit"
            );
        }
        (results, missing)
    }

    /// Cache check for the inter-gene query shape: cached lists are filtered
    /// down to links between query genes at the requested stringency.
    async fn inter_cache_hits(
        &self,
        genes: &BTreeSet<GeneId>,
        stringency: u64,
    ) -> (QueryResults, BTreeSet<GeneId>) {
        let mut results = QueryResults::new();
        let mut missing = BTreeSet::new();
        if stringency < self.cfg.cache_stringency {
            missing.extend(genes.iter().copied());
            return (results, missing);
        }
        for gene in genes {
            match self.result_cache.get(*gene).await {
                Some(list) => {
                    let mut kept: Vec<LinkResult> = list
                        .into_iter()
                        .filter(|r| r.support() >= stringency && genes.contains(&r.coex_gene()))
                        .collect();
                    for result in &mut kept {
                        result.mark_inter_query();
                    }
                    if !kept.is_empty() {
                        results.insert(*gene, kept);
                    }
                }
                None => {
                    missing.insert(*gene);
                }
            }
        }
        (results, missing)
    }
}

/// Convert raw store rows into per-gene result lists: remove the mirror
/// representation of each unordered pair, orient every kept link toward a
/// gene of `orient_to` (the forward row's first gene may be the partner when
/// rows were hydrated by link id), mark inter-query links against
/// `query_genes`, and sort each list by descending support.
pub(crate) fn convert_links(
    raw: Vec<RawLink>,
    orient_to: Option<&BTreeSet<GeneId>>,
    query_genes: &BTreeSet<GeneId>,
) -> QueryResults {
    let mut results = QueryResults::new();
    let mut seen: HashSet<(GeneId, GeneId, Correlation)> = HashSet::with_capacity(raw.len());
    let mut removed = 0usize;

    for link in raw {
        let (query_gene, coex_gene) = match orient_to {
            None => (link.first_gene, link.second_gene),
            Some(targets) => {
                let first_in = targets.contains(&link.first_gene);
                let second_in = targets.contains(&link.second_gene);
                match (first_in, second_in) {
                    // Both genes are query genes: orient toward the smaller
                    // id so both mirror rows collapse onto one deterministic
                    // representation regardless of row order.
                    (true, true) => {
                        if link.first_gene < link.second_gene {
                            (link.first_gene, link.second_gene)
                        } else {
                            (link.second_gene, link.first_gene)
                        }
                    }
                    (true, false) => (link.first_gene, link.second_gene),
                    (false, true) => (link.second_gene, link.first_gene),
                    (false, false) => continue,
                }
            }
        };

        let canonical = if query_gene < coex_gene {
            (query_gene, coex_gene, link.correlation)
        } else {
            (coex_gene, query_gene, link.correlation)
        };
        if !seen.insert(canonical) {
            removed += 1;
            continue;
        }

        let mut result = LinkResult::new(query_gene, coex_gene, link.correlation, link.support_ids);
        if query_genes.contains(&result.query_gene()) && query_genes.contains(&result.coex_gene())
        {
            result.mark_inter_query();
        }
        results.entry(query_gene).or_default().push(result);
    }

    if removed > 0 {
        debug!(removed, "duplicate mirror links removed during conversion");
    }
    for list in results.values_mut() {
        list.sort_by(LinkResult::descending_support);
    }
    results
}

pub(crate) fn merge_results(into: &mut QueryResults, from: QueryResults) {
    for (gene, list) in from {
        into.entry(gene).or_default().extend(list);
    }
}
