use rayon::prelude::*;
use statrs::statistics::Statistics;

use crate::core::data::cls::PhenotypeAssignment;
use crate::core::data::gct::ExpressionMatrix;
use crate::error::{GseaError, Result};
use crate::utils::general::{argsort_desc, first_duplicate};

///////////
// Enums //
///////////

/// Gene level metric used to rank genes between the two phenotypes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RankingMetric {
    /// (mean_a - mean_b) / (sd_a + sd_b)
    SignalToNoise,
    /// |(mean_a - mean_b) / (sd_a + sd_b)|
    AbsSignalToNoise,
    /// Welch's t statistic
    TTest,
    /// mean_a / mean_b
    RatioOfClasses,
    /// mean_a - mean_b
    DiffOfClasses,
    /// log2(mean_a / mean_b)
    Log2RatioOfClasses,
}

/// Parsing the ranking metric
///
/// ### Params
///
/// * `s` - string defining the metric
///
/// ### Returns
///
/// The `RankingMetric`.
pub fn parse_ranking_metric(s: &str) -> Option<RankingMetric> {
    match s.to_lowercase().as_str() {
        "signal_to_noise" | "s2n" => Some(RankingMetric::SignalToNoise),
        "abs_signal_to_noise" | "abs_s2n" => Some(RankingMetric::AbsSignalToNoise),
        "t_test" | "ttest" => Some(RankingMetric::TTest),
        "ratio_of_classes" => Some(RankingMetric::RatioOfClasses),
        "diff_of_classes" => Some(RankingMetric::DiffOfClasses),
        "log2_ratio_of_classes" => Some(RankingMetric::Log2RatioOfClasses),
        _ => None,
    }
}

////////////////
// Structures //
////////////////

/// Genes with their ranking scores, sorted descending by score
///
/// ### Fields
///
/// * `genes` - The gene identifiers in rank order.
/// * `scores` - The ranking metric in rank order.
#[derive(Clone, Debug, PartialEq)]
pub struct RankingStatistic {
    genes: Vec<String>,
    scores: Vec<f64>,
}

impl RankingStatistic {
    /// Build a ranking from unsorted (gene, score) pairs
    ///
    /// The pairs are sorted descending by score. The sort is stable, so genes
    /// with equal scores keep their input order.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let (genes, scores): (Vec<String>, Vec<f64>) =
            pairs.into_iter().map(|(g, s)| (g.into(), s)).unzip();
        Self::from_unsorted(genes, &scores)
    }

    fn from_unsorted(genes: Vec<String>, scores: &[f64]) -> Self {
        crate::assert_same_len!(genes, scores);
        let order = argsort_desc(scores);
        let mut genes: Vec<Option<String>> = genes.into_iter().map(Some).collect();
        Self {
            genes: order.iter().map(|&i| genes[i].take().unwrap_or_default()).collect(),
            scores: order.iter().map(|&i| scores[i]).collect(),
        }
    }

    pub fn genes(&self) -> &[String] {
        &self.genes
    }

    pub fn scores(&self) -> &[f64] {
        &self.scores
    }

    pub fn len(&self) -> usize {
        self.genes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }

    /// Iterate over (gene, score) pairs in rank order
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.genes
            .iter()
            .map(String::as_str)
            .zip(self.scores.iter().copied())
    }

    /// Check the ranking is usable for enrichment
    ///
    /// ### Returns
    ///
    /// `Data` error if the ranking is empty, holds duplicated genes or
    /// non-finite scores.
    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(GseaError::Data("the ranking is empty".into()));
        }
        if let Some(dup) = first_duplicate(&self.genes) {
            return Err(GseaError::Data(format!(
                "the ranking contains gene '{}' more than once",
                dup
            )));
        }
        if let Some(pos) = self.scores.iter().position(|s| !s.is_finite()) {
            return Err(GseaError::Data(format!(
                "gene '{}' has a non-finite ranking score",
                self.genes[pos]
            )));
        }
        Ok(())
    }
}

//////////////////////
// Helper functions //
//////////////////////

/// Standard deviation with the GSEA minimum sigma correction
///
/// ### Params
///
/// * `sd` - The sample standard deviation (NaN for less than two samples)
/// * `mean` - The group mean
///
/// ### Returns
///
/// `max(sd, 0.2 * |mean|)`, with 0.2 used when the mean is zero.
#[inline]
fn min_sigma(sd: f64, mean: f64) -> f64 {
    let sd = if sd.is_nan() { 0.0 } else { sd };
    let floor = if mean == 0.0 { 0.2 } else { 0.2 * mean.abs() };
    sd.max(floor)
}

/// Calculate the metric for a single gene
///
/// ### Params
///
/// * `values` - Expression values of the gene across all samples
/// * `positive` - Mask with `true` for samples of the positive phenotype
/// * `metric` - The ranking metric
///
/// ### Returns
///
/// The metric value; may be non-finite for the ratio based metrics.
pub fn gene_metric(values: &[f64], positive: &[bool], metric: RankingMetric) -> f64 {
    crate::assert_same_len!(values, positive);
    let mut pos: Vec<f64> = Vec::with_capacity(values.len());
    let mut neg: Vec<f64> = Vec::with_capacity(values.len());
    for (&v, &is_pos) in values.iter().zip(positive) {
        if is_pos {
            pos.push(v)
        } else {
            neg.push(v)
        }
    }

    let pos_mean = pos.iter().mean();
    let neg_mean = neg.iter().mean();

    match metric {
        RankingMetric::SignalToNoise | RankingMetric::AbsSignalToNoise => {
            let pos_sd = min_sigma(pos.iter().std_dev(), pos_mean);
            let neg_sd = min_sigma(neg.iter().std_dev(), neg_mean);
            let s2n = (pos_mean - neg_mean) / (pos_sd + neg_sd);
            if metric == RankingMetric::AbsSignalToNoise {
                s2n.abs()
            } else {
                s2n
            }
        }
        RankingMetric::TTest => {
            let pos_sd = min_sigma(pos.iter().std_dev(), pos_mean);
            let neg_sd = min_sigma(neg.iter().std_dev(), neg_mean);
            (pos_mean - neg_mean)
                / (pos_sd * pos_sd / pos.len() as f64 + neg_sd * neg_sd / neg.len() as f64).sqrt()
        }
        RankingMetric::RatioOfClasses => pos_mean / neg_mean,
        RankingMetric::DiffOfClasses => pos_mean - neg_mean,
        RankingMetric::Log2RatioOfClasses => (pos_mean / neg_mean).log2(),
    }
}

/// Calculate the metric for all genes of the matrix (in matrix row order)
///
/// ### Params
///
/// * `matrix` - The expression matrix
/// * `positive` - Mask with `true` for samples of the positive phenotype
/// * `metric` - The ranking metric
///
/// ### Returns
///
/// One (unsorted) metric value per gene.
pub fn gene_metrics(matrix: &ExpressionMatrix, positive: &[bool], metric: RankingMetric) -> Vec<f64> {
    (0..matrix.n_genes())
        .map(|i| gene_metric(&matrix.row(i), positive, metric))
        .collect()
}

////////////////////
// Main functions //
////////////////////

/// Rank the genes of the matrix between the two phenotypes
///
/// ### Params
///
/// * `matrix` - The expression matrix
/// * `phenotypes` - Phenotype labels aligned to the matrix columns
/// * `metric` - The ranking metric
///
/// ### Returns
///
/// The `RankingStatistic`, one entry per gene, sorted descending. Ties keep
/// the matrix row order.
pub fn compute_ranking(
    matrix: &ExpressionMatrix,
    phenotypes: &PhenotypeAssignment,
    metric: RankingMetric,
) -> Result<RankingStatistic> {
    matrix.validate_phenotypes(phenotypes)?;
    let positive = phenotypes.positive_mask();

    let scores: Vec<f64> = (0..matrix.n_genes())
        .into_par_iter()
        .map(|i| gene_metric(&matrix.row(i), &positive, metric))
        .collect();

    let ranking = RankingStatistic::from_unsorted(matrix.genes().to_vec(), &scores);
    ranking.validate()?;

    tracing::debug!(
        genes = ranking.len(),
        top = ranking.scores().first().copied().unwrap_or(f64::NAN),
        bottom = ranking.scores().last().copied().unwrap_or(f64::NAN),
        "computed gene ranking"
    );

    Ok(ranking)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn toy_data() -> (ExpressionMatrix, PhenotypeAssignment) {
        let genes = vec!["G1", "G2", "G3", "G4"]
            .into_iter()
            .map(String::from)
            .collect();
        let samples = (1..=4).map(|i| format!("s{i}")).collect();
        let rows = vec![
            vec![5.0, 6.0, 1.0, 2.0],
            vec![1.0, 1.0, 1.0, 1.0],
            vec![1.0, 2.0, 5.0, 6.0],
            vec![2.0, 2.0, 2.0, 2.0],
        ];
        let matrix = ExpressionMatrix::from_rows(genes, samples, &rows).unwrap();
        let labels = vec!["A", "A", "B", "B"].into_iter().map(String::from).collect();
        let pheno = PhenotypeAssignment::new(labels, None).unwrap();
        (matrix, pheno)
    }

    #[test]
    fn test_parse_ranking_metric() {
        assert_eq!(
            parse_ranking_metric("signal_to_noise"),
            Some(RankingMetric::SignalToNoise)
        );
        assert_eq!(parse_ranking_metric("T_TEST"), Some(RankingMetric::TTest));
        assert_eq!(parse_ranking_metric("nope"), None);
    }

    #[test]
    fn test_signal_to_noise_value() {
        let v = [5.0, 6.0, 1.0, 2.0];
        let mask = [true, true, false, false];
        // means 5.5 / 1.5, sd 0.7071 each, min sigma 1.1 / 0.3
        let s2n = gene_metric(&v, &mask, RankingMetric::SignalToNoise);
        let expected = 4.0 / (1.1 + 0.5_f64.sqrt());
        assert_relative_eq!(s2n, expected, epsilon = 1e-12);
    }

    #[test]
    fn test_diff_and_ratio() {
        let v = [4.0, 4.0, 2.0, 2.0];
        let mask = [true, true, false, false];
        assert_relative_eq!(gene_metric(&v, &mask, RankingMetric::DiffOfClasses), 2.0);
        assert_relative_eq!(gene_metric(&v, &mask, RankingMetric::RatioOfClasses), 2.0);
        assert_relative_eq!(
            gene_metric(&v, &mask, RankingMetric::Log2RatioOfClasses),
            1.0
        );
    }

    #[test]
    fn test_compute_ranking_sorted_and_complete() {
        let (matrix, pheno) = toy_data();
        let ranking = compute_ranking(&matrix, &pheno, RankingMetric::SignalToNoise).unwrap();
        assert_eq!(ranking.len(), matrix.n_genes());
        assert!(ranking.scores().windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(ranking.genes().first().unwrap(), "G1");
        assert_eq!(ranking.genes().last().unwrap(), "G3");
    }

    #[test]
    fn test_ranking_ties_keep_input_order() {
        // G2 and G4 are flat, so both score zero; G2 comes first in the matrix
        let (matrix, pheno) = toy_data();
        let ranking = compute_ranking(&matrix, &pheno, RankingMetric::DiffOfClasses).unwrap();
        assert_eq!(ranking.genes(), &["G1", "G2", "G4", "G3"]);

        let ranking = RankingStatistic::from_pairs(vec![("X", 1.0), ("Y", 2.0), ("Z", 1.0)]);
        assert_eq!(ranking.genes(), &["Y", "X", "Z"]);
    }

    #[test]
    fn test_compute_ranking_mismatched_phenotypes() {
        let (matrix, _) = toy_data();
        let labels = vec!["A", "B", "A"].into_iter().map(String::from).collect();
        let pheno = PhenotypeAssignment::new(labels, None).unwrap();
        let err = compute_ranking(&matrix, &pheno, RankingMetric::SignalToNoise).unwrap_err();
        assert!(matches!(err, GseaError::Data(_)));
    }

    #[test]
    fn test_validate_ranking() {
        assert!(RankingStatistic::from_pairs(Vec::<(String, f64)>::new())
            .validate()
            .is_err());
        let dup = RankingStatistic::from_pairs(vec![("A", 1.0), ("A", 0.5)]);
        assert!(dup.validate().unwrap_err().to_string().contains("'A'"));
        let nan = RankingStatistic::from_pairs(vec![("A", f64::NAN), ("B", 0.5)]);
        assert!(nan.validate().is_err());
    }
}
