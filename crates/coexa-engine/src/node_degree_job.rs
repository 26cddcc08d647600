use crate::{CoexpressionEngine, EngineError};
use coexa_model::{Correlation, GeneId, NodeDegreeStats, TaxonId};
use std::collections::BTreeMap;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct NodeDegreeUpdateSummary {
    pub genes_processed: u64,
    pub genes_failed: u64,
}

impl CoexpressionEngine {
    /// Maintenance job: rebuild every gene's link-count histogram from
    /// current links, then recompute the rank-normalized relative node
    /// degrees across the taxon. Reads the store directly and touches
    /// neither cache, so it is safe to run while queries are being served.
    /// Individual gene failures are logged and skipped.
    pub async fn update_node_degrees(
        &self,
        taxon: TaxonId,
    ) -> Result<NodeDegreeUpdateSummary, EngineError> {
        let genes = self.store.gene_ids(taxon)?;
        info!(genes = genes.len(), "recomputing node degrees");

        let mut summary = NodeDegreeUpdateSummary::default();
        let mut histograms: BTreeMap<GeneId, NodeDegreeStats> = BTreeMap::new();
        for gene in genes {
            match self.rebuild_histogram(taxon, gene) {
                Ok(stats) => {
                    histograms.insert(gene, stats);
                    summary.genes_processed += 1;
                }
                Err(e) => {
                    warn!(%gene, error = %e, "node-degree recompute failed; skipping gene");
                    summary.genes_failed += 1;
                }
            }
        }
        if histograms.is_empty() {
            return Ok(summary);
        }

        let rel_pos = relative_ranks(&histograms, Correlation::Positive);
        let rel_neg = relative_ranks(&histograms, Correlation::Negative);
        self.store.update_relative_ranks(taxon, &rel_pos, &rel_neg)?;

        info!(
            processed = summary.genes_processed,
            failed = summary.genes_failed,
            "node-degree recompute finished"
        );
        Ok(summary)
    }

    fn rebuild_histogram(
        &self,
        taxon: TaxonId,
        gene: GeneId,
    ) -> Result<NodeDegreeStats, EngineError> {
        // The default, dataset-unconstrained view of the gene's links.
        let raw = self.store.links_for_genes(taxon, &[gene], 1)?;
        let mut stats = NodeDegreeStats::new();
        for link in raw {
            stats.increment(link.support, link.correlation);
        }
        self.store.upsert_node_degree(taxon, gene, &stats)?;
        Ok(stats)
    }
}

/// For each support level, rank every gene's cumulative link count and
/// normalize by the maximum rank observed. Ties break by gene id, which
/// keeps reruns over unchanged data byte-identical.
fn relative_ranks(
    histograms: &BTreeMap<GeneId, NodeDegreeStats>,
    correlation: Correlation,
) -> BTreeMap<GeneId, Vec<f64>> {
    let max_level = histograms
        .values()
        .map(|s| s.max_support(correlation))
        .max()
        .unwrap_or(0);

    let mut ranks: BTreeMap<GeneId, Vec<f64>> = histograms
        .keys()
        .map(|gene| (*gene, vec![0.0; max_level as usize + 1]))
        .collect();

    let max_rank = histograms.len().saturating_sub(1).max(1) as f64;
    for level in 0..=max_level {
        let mut counts: Vec<(u64, GeneId)> = histograms
            .iter()
            .map(|(gene, stats)| (stats.links_at_or_above(level, correlation), *gene))
            .collect();
        counts.sort_unstable();
        for (rank, (_, gene)) in counts.iter().enumerate() {
            if let Some(levels) = ranks.get_mut(gene) {
                levels[level as usize] = rank as f64 / max_rank;
            }
        }
    }
    ranks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats_with(pos_links: &[u64]) -> NodeDegreeStats {
        let mut stats = NodeDegreeStats::new();
        for support in pos_links {
            stats.increment(*support, Correlation::Positive);
        }
        stats
    }

    #[test]
    fn hub_gene_ranks_highest() {
        let mut histograms = BTreeMap::new();
        histograms.insert(GeneId::new(1), stats_with(&[1]));
        histograms.insert(GeneId::new(2), stats_with(&[1, 2]));
        histograms.insert(GeneId::new(3), stats_with(&[1, 2, 3]));

        let ranks = relative_ranks(&histograms, Correlation::Positive);
        assert_eq!(ranks[&GeneId::new(1)][1], 0.0);
        assert_eq!(ranks[&GeneId::new(2)][1], 0.5);
        assert_eq!(ranks[&GeneId::new(3)][1], 1.0);
        // At level 3 only gene 3 has any links left.
        assert_eq!(ranks[&GeneId::new(3)][3], 1.0);
    }

    #[test]
    fn ranks_cover_every_level_up_to_max() {
        let mut histograms = BTreeMap::new();
        histograms.insert(GeneId::new(1), stats_with(&[4]));
        histograms.insert(GeneId::new(2), stats_with(&[1]));
        let ranks = relative_ranks(&histograms, Correlation::Positive);
        assert_eq!(ranks[&GeneId::new(1)].len(), 5);
        assert_eq!(ranks[&GeneId::new(2)].len(), 5);
        // Negative side has no links at all: single level, equal ranks.
        let neg = relative_ranks(&histograms, Correlation::Negative);
        assert_eq!(neg[&GeneId::new(1)].len(), 1);
    }
}
