//! Value histograms and statistics for k-mer databases.
//!
//! A histogram maps each value to the number of distinct k-mers carrying it.
//! From it we derive the cumulative occurrence mass, summary statistics, and
//! the quantile thresholds that back the `distinct=` and `word-frequency=`
//! filter constants.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::kmer::KmerValue;

/// Value histogram: value -> number of distinct k-mers with that value.
///
/// `BTreeMap` keeps iteration in ascending value order, which every consumer
/// (printing, quantiles, statistics) relies on.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueHistogram {
    counts: BTreeMap<KmerValue, u64>,
}

impl ValueHistogram {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one distinct k-mer with the given value.
    pub fn record(&mut self, value: KmerValue) {
        *self.counts.entry(value).or_insert(0) += 1;
    }

    /// Folds another histogram into this one (shard join).
    pub fn merge(&mut self, other: &ValueHistogram) {
        for (&value, &distinct) in &other.counts {
            *self.counts.entry(value).or_insert(0) += distinct;
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Number of distinct k-mers with the given value.
    #[must_use]
    pub fn distinct_at(&self, value: KmerValue) -> u64 {
        self.counts.get(&value).copied().unwrap_or(0)
    }

    /// Total distinct k-mers.
    #[must_use]
    pub fn distinct_kmers(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Total k-mer occurrences (sum of value * distinct).
    #[must_use]
    pub fn total_occurrences(&self) -> u64 {
        self.counts
            .iter()
            .map(|(&v, &d)| u64::from(v) * d)
            .sum()
    }

    /// Rows of `(value, distinct, cumulative occurrences)` in ascending
    /// value order, the shape the histogram output sink prints.
    #[must_use]
    pub fn rows(&self) -> Vec<(KmerValue, u64, u64)> {
        let mut cumulative = 0u64;
        self.counts
            .iter()
            .map(|(&value, &distinct)| {
                cumulative += u64::from(value) * distinct;
                (value, distinct, cumulative)
            })
            .collect()
    }

    /// The smallest value `v` such that the fraction of distinct k-mers
    /// with value >= `v` is at most `fraction`.
    #[must_use]
    pub fn threshold_distinct(&self, fraction: f64) -> KmerValue {
        self.threshold_by(fraction, |_, d| d)
    }

    /// The smallest value `v` such that the fraction of total occurrences
    /// carried by k-mers with value >= `v` is at most `fraction`.
    #[must_use]
    pub fn threshold_word_frequency(&self, fraction: f64) -> KmerValue {
        self.threshold_by(fraction, |v, d| u64::from(v) * d)
    }

    #[allow(clippy::cast_precision_loss)]
    fn threshold_by(&self, fraction: f64, weight: impl Fn(KmerValue, u64) -> u64) -> KmerValue {
        let total: u64 = self.counts.iter().map(|(&v, &d)| weight(v, d)).sum();
        if total == 0 {
            return 0;
        }

        let mut remaining = total;
        for (&value, &distinct) in &self.counts {
            if remaining as f64 / total as f64 <= fraction {
                return value;
            }
            remaining -= weight(value, distinct);
        }

        // Nothing at or above the last value satisfies the fraction until
        // the mass runs out entirely.
        self.counts.keys().last().map_or(0, |&v| v.saturating_add(1))
    }

    /// Summary statistics for the statistics output sink.
    #[must_use]
    pub fn statistics(&self) -> HistogramStatistics {
        const QUANTILES: [f64; 4] = [0.5, 0.9, 0.95, 0.99];

        HistogramStatistics {
            total_kmers: self.total_occurrences(),
            distinct_kmers: self.distinct_kmers(),
            distinct_cutoffs: QUANTILES.map(|q| (q, self.threshold_distinct(q))),
            word_frequency_cutoffs: QUANTILES.map(|q| (q, self.threshold_word_frequency(q))),
        }
    }
}

/// Summary statistics derived from a [`ValueHistogram`].
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramStatistics {
    pub total_kmers: u64,
    pub distinct_kmers: u64,
    pub distinct_cutoffs: [(f64, KmerValue); 4],
    pub word_frequency_cutoffs: [(f64, KmerValue); 4],
}

#[cfg(test)]
mod tests {
    use super::*;

    fn histogram(pairs: &[(KmerValue, u64)]) -> ValueHistogram {
        let mut h = ValueHistogram::new();
        for &(value, distinct) in pairs {
            for _ in 0..distinct {
                h.record(value);
            }
        }
        h
    }

    #[test]
    fn record_and_totals() {
        let h = histogram(&[(1, 2), (2, 2)]);
        assert_eq!(h.distinct_kmers(), 4);
        assert_eq!(h.total_occurrences(), 6);
        assert_eq!(h.distinct_at(1), 2);
        assert_eq!(h.distinct_at(3), 0);
    }

    #[test]
    fn rows_ascending_with_cumulative() {
        let h = histogram(&[(2, 1), (1, 3), (5, 2)]);
        assert_eq!(h.rows(), vec![(1, 3, 3), (2, 1, 5), (5, 2, 15)]);
    }

    #[test]
    fn merge_adds_counts() {
        let mut a = histogram(&[(1, 2), (3, 1)]);
        let b = histogram(&[(1, 1), (4, 5)]);
        a.merge(&b);
        assert_eq!(a.distinct_at(1), 3);
        assert_eq!(a.distinct_at(3), 1);
        assert_eq!(a.distinct_at(4), 5);
    }

    #[test]
    fn threshold_distinct_basic() {
        // 10 distinct kmers: 5 at value 1, 3 at value 2, 2 at value 10.
        let h = histogram(&[(1, 5), (2, 3), (10, 2)]);

        // All 10 kmers have value >= 1 (fraction 1.0), 5 have >= 2 (0.5),
        // 2 have >= 10 (0.2).
        assert_eq!(h.threshold_distinct(1.0), 1);
        assert_eq!(h.threshold_distinct(0.5), 2);
        assert_eq!(h.threshold_distinct(0.3), 10);
        assert_eq!(h.threshold_distinct(0.1), 11);
    }

    #[test]
    fn threshold_word_frequency_basic() {
        // Occurrence mass: 5 at value 1, 6 at value 2, 20 at value 10; 31 total.
        let h = histogram(&[(1, 5), (2, 3), (10, 2)]);

        assert_eq!(h.threshold_word_frequency(1.0), 1);
        // Mass at value >= 2 is 26/31 ~ 0.84.
        assert_eq!(h.threshold_word_frequency(0.9), 2);
        // Mass at value >= 10 is 20/31 ~ 0.65.
        assert_eq!(h.threshold_word_frequency(0.7), 10);
    }

    #[test]
    fn threshold_on_empty_histogram() {
        let h = ValueHistogram::new();
        assert_eq!(h.threshold_distinct(0.5), 0);
        assert_eq!(h.threshold_word_frequency(0.5), 0);
    }

    #[test]
    fn statistics_totals() {
        let h = histogram(&[(1, 2), (2, 2)]);
        let stats = h.statistics();
        assert_eq!(stats.total_kmers, 6);
        assert_eq!(stats.distinct_kmers, 4);
        assert_eq!(stats.distinct_cutoffs[0].0, 0.5);
    }
}
