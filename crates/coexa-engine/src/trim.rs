use crate::query::QueryResults;
use crate::{CoexpressionEngine, EngineError};
use coexa_model::{ExperimentId, GeneId, IdSet, TaxonId};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

impl CoexpressionEngine {
    /// Trim merged results to what the caller asked for: keep one
    /// representation per unordered pair across the whole map, restrict
    /// support to the queried datasets at the requested stringency, apply
    /// the per-gene cap (inter-query links are never capped away), drop
    /// genes left empty, and annotate survivors with tested-in denominators
    /// unless the query is quick.
    pub(crate) async fn trim_and_finish(
        &self,
        taxon: TaxonId,
        results: &mut QueryResults,
        datasets: &BTreeSet<ExperimentId>,
        stringency: u64,
        max_results_per_gene: usize,
        quick: bool,
    ) -> Result<(), EngineError> {
        // A pair can surface under both of its genes when cache hits and
        // store fetches are merged; keep the copy under the smaller gene id
        // so the outcome does not depend on which source produced it.
        let mut seen: HashSet<(GeneId, GeneId, coexa_model::Correlation)> = HashSet::new();
        for list in results.values_mut() {
            list.retain(|r| seen.insert(r.unordered_key()));
        }

        let dataset_set: IdSet = datasets.iter().map(|d| d.as_u64()).collect();
        for list in results.values_mut() {
            let mut kept = 0usize;
            list.retain_mut(|result| {
                if !result.trim_to_datasets(&dataset_set, stringency) {
                    return false;
                }
                if max_results_per_gene > 0
                    && kept >= max_results_per_gene
                    && !result.is_inter_query()
                {
                    return false;
                }
                kept += 1;
                true
            });
        }

        let before = results.len();
        results.retain(|_, list| !list.is_empty());
        if results.len() < before {
            debug!(
                dropped = before - results.len(),
                stringency, "genes with no results left after trimming"
            );
        }

        if !quick {
            self.annotate_tested_in(taxon, results, &dataset_set).await?;
        }
        Ok(())
    }

    /// Every returned link implies both its genes were tested somewhere, so
    /// missing tested-in data (or an empty intersection) is store
    /// inconsistency, not a recoverable condition.
    async fn annotate_tested_in(
        &self,
        taxon: TaxonId,
        results: &mut QueryResults,
        dataset_set: &IdSet,
    ) -> Result<(), EngineError> {
        if results.is_empty() {
            return Ok(());
        }

        let mut genes: BTreeSet<GeneId> = BTreeSet::new();
        for (gene, list) in results.iter() {
            genes.insert(*gene);
            for result in list {
                genes.insert(result.coex_gene());
            }
        }
        let tested = self.tested_in_for(taxon, &genes).await?;

        for list in results.values_mut() {
            for result in list.iter_mut() {
                let query_tested = tested.get(&result.query_gene()).ok_or_else(|| {
                    EngineError::Consistency(format!(
                        "no tested-in data for gene {} despite a supported link",
                        result.query_gene()
                    ))
                })?;
                let coex_tested = tested.get(&result.coex_gene()).ok_or_else(|| {
                    EngineError::Consistency(format!(
                        "no tested-in data for gene {} despite a supported link",
                        result.coex_gene()
                    ))
                })?;
                let mut common = query_tested.intersect(coex_tested);
                common.restrict_to(dataset_set);
                if common.is_empty() {
                    return Err(EngineError::Consistency(format!(
                        "genes {} and {} share a supported link but no tested-in datasets",
                        result.query_gene(),
                        result.coex_gene()
                    )));
                }
                result.set_tested_in(common);
            }
        }
        Ok(())
    }

    /// Tested-in sets for the given genes, served from the tested-in cache
    /// with store fallback; fetched sets are cached for the next query.
    pub(crate) async fn tested_in_for(
        &self,
        taxon: TaxonId,
        genes: &BTreeSet<GeneId>,
    ) -> Result<HashMap<GeneId, IdSet>, EngineError> {
        let mut out = HashMap::with_capacity(genes.len());
        let mut missing: Vec<GeneId> = Vec::new();
        for gene in genes {
            match self.tested_in_cache.get(*gene).await {
                Some(set) => {
                    out.insert(*gene, set);
                }
                None => missing.push(*gene),
            }
        }
        if !missing.is_empty() {
            let fetched = self.store.tested_in(taxon, &missing)?;
            for (gene, set) in &fetched {
                self.tested_in_cache.put(*gene, set.clone()).await;
            }
            out.extend(fetched);
        }
        Ok(out)
    }
}
