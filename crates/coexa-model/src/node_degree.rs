use crate::link::Correlation;
use serde::{Deserialize, Serialize};

/// Per-gene link-count statistics, kept separately for positive and negative
/// correlation.
///
/// `counts[k]` holds the number of links whose support is exactly `k`; the
/// cumulative view [`NodeDegreeStats::links_at_or_above`] answers "how many
/// links at support ≥ k". `relative_ranks[k]` is this gene's rank of that
/// cumulative count among all genes of the taxon, normalized to [0,1]; hub
/// genes sit near 1.0. Ranks are filled in by the maintenance job after all
/// genes' histograms are rebuilt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeDegreeStats {
    pos_counts: Vec<u64>,
    neg_counts: Vec<u64>,
    #[serde(default)]
    rel_pos: Vec<f64>,
    #[serde(default)]
    rel_neg: Vec<f64>,
}

impl NodeDegreeStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.pos_counts.clear();
        self.neg_counts.clear();
        self.rel_pos.clear();
        self.rel_neg.clear();
    }

    pub fn increment(&mut self, support: u64, correlation: Correlation) {
        let counts = match correlation {
            Correlation::Positive => &mut self.pos_counts,
            Correlation::Negative => &mut self.neg_counts,
        };
        let idx = support as usize;
        if counts.len() <= idx {
            counts.resize(idx + 1, 0);
        }
        counts[idx] += 1;
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.pos_counts.iter().sum::<u64>() + self.neg_counts.iter().sum::<u64>()
    }

    #[must_use]
    pub fn max_support(&self, correlation: Correlation) -> u64 {
        let counts = self.counts(correlation);
        counts
            .iter()
            .rposition(|c| *c > 0)
            .map_or(0, |idx| idx as u64)
    }

    /// Number of links with support ≥ `level`.
    #[must_use]
    pub fn links_at_or_above(&self, level: u64, correlation: Correlation) -> u64 {
        let counts = self.counts(correlation);
        counts.iter().skip(level as usize).sum()
    }

    #[must_use]
    pub fn counts(&self, correlation: Correlation) -> &[u64] {
        match correlation {
            Correlation::Positive => &self.pos_counts,
            Correlation::Negative => &self.neg_counts,
        }
    }

    pub fn set_relative_ranks(&mut self, correlation: Correlation, ranks: Vec<f64>) {
        match correlation {
            Correlation::Positive => self.rel_pos = ranks,
            Correlation::Negative => self.rel_neg = ranks,
        }
    }

    /// Normalized rank of this gene's cumulative link count at the given
    /// support level, or None when the maintenance job has not covered it.
    #[must_use]
    pub fn relative_rank(&self, level: u64, correlation: Correlation) -> Option<f64> {
        let ranks = match correlation {
            Correlation::Positive => &self.rel_pos,
            Correlation::Negative => &self.rel_neg,
        };
        ranks.get(level as usize).copied()
    }
}
