use rand::prelude::*;
use rayon::prelude::*;
use rustc_hash::{FxBuildHasher, FxHashMap};

use crate::core::base::stats::calc_fdr;
use crate::core::data::cls::PhenotypeAssignment;
use crate::core::data::gct::ExpressionMatrix;
use crate::core::data::gmt::{GeneSet, GeneSetLibrary};
use crate::core::enrichment::ranking::{
    compute_ranking, gene_metrics, RankingMetric, RankingStatistic,
};
use crate::core::enrichment::results::{EnrichmentResult, GseaResults};
use crate::error::{GseaError, Result};
use crate::utils::general::{argsort_desc, index_map, ranks_from_order, unique};
use crate::{ensure_config, ensure_data};

///////////
// Enums //
///////////

/// How the null distribution of the enrichment scores is generated
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermutationType {
    /// Random gene sets of the same size against the fixed ranking
    GeneSet,
    /// Shuffle the phenotype labels and re-rank the genes
    Phenotype,
}

/// Parsing the permutation type
///
/// ### Params
///
/// * `s` - string defining the permutation type
///
/// ### Returns
///
/// The `PermutationType`.
pub fn parse_permutation_type(s: &str) -> Option<PermutationType> {
    match s.to_lowercase().as_str() {
        "gene_set" | "geneset" => Some(PermutationType::GeneSet),
        "phenotype" => Some(PermutationType::Phenotype),
        _ => None,
    }
}

////////////
// Params //
////////////

/// Structure to store GSEA params
///
/// ### Fields
///
/// * `weight` - The GSEA weight parameter `p`; hits contribute `|r|^p`.
/// * `min_size` - The minimum overlap of a gene set with the ranking.
/// * `max_size` - The maximum overlap of a gene set with the ranking.
/// * `permutations` - Number of permutations for the null distribution.
/// * `permutation_type` - Gene set or phenotype permutations.
/// * `metric` - Ranking metric (used for phenotype permutations and
///   `run_gsea`).
/// * `seed` - Seed for reproducibility purposes.
/// * `threads` - Size of the permutation worker pool.
#[derive(Clone, Debug, PartialEq)]
pub struct GseaParams {
    pub weight: f64,
    pub min_size: usize,
    pub max_size: usize,
    pub permutations: usize,
    pub permutation_type: PermutationType,
    pub metric: RankingMetric,
    pub seed: u64,
    pub threads: usize,
}

impl Default for GseaParams {
    fn default() -> Self {
        Self {
            weight: 1.0,
            min_size: 15,
            max_size: 500,
            permutations: 1000,
            permutation_type: PermutationType::GeneSet,
            metric: RankingMetric::SignalToNoise,
            seed: 123,
            threads: default_threads(),
        }
    }
}

impl GseaParams {
    /// Check the parameter combination
    ///
    /// ### Returns
    ///
    /// `Config` error naming the offending parameter.
    pub fn validate(&self) -> Result<()> {
        ensure_config!(
            self.min_size <= self.max_size,
            "min_size ({}) must not exceed max_size ({})",
            self.min_size,
            self.max_size
        );
        ensure_config!(
            self.permutations > 0,
            "permutations must be positive, got {}",
            self.permutations
        );
        ensure_config!(
            self.weight.is_finite() && self.weight >= 0.0,
            "weight must be a finite, non-negative number, got {}",
            self.weight
        );
        ensure_config!(self.threads > 0, "threads must be positive, got 0");
        Ok(())
    }
}

/// Default worker count: available cores minus two reserved ones, at least 1
pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .saturating_sub(2)
        .max(1)
}

/// Expression data needed to re-rank genes under phenotype permutations
#[derive(Clone, Copy, Debug)]
pub struct PhenotypeData<'a> {
    pub matrix: &'a ExpressionMatrix,
    pub phenotypes: &'a PhenotypeAssignment,
}

/////////////
// Results //
/////////////

/// Structure to store GSEA stats of a single gene set
///
/// ### Fields
///
/// * `es` - Enrichment score
/// * `peak` - Rank position where the running sum deviates most from zero
/// * `running_es` - The running sum at every rank position
/// * `hit_profile` - Signed weight of every rank position; `0` for genes
///   outside of the gene set
/// * `leading_edge` - The rank positions of the leading edge genes
#[derive(Clone, Debug)]
pub struct GseaStats {
    pub es: f64,
    pub peak: usize,
    pub running_es: Vec<f64>,
    pub hit_profile: Vec<f64>,
    pub leading_edge: Vec<usize>,
}

/// Result of a single gene set permutation test
///
/// ### Fields
///
/// * `es` - Observed enrichment score
/// * `nes` - Normalised enrichment score (None if the null has no values
///   of the same sign)
/// * `pval` - Nominal p-value
/// * `es_null` - The permuted enrichment scores
#[derive(Clone, Debug)]
pub struct PermutationTest {
    pub es: f64,
    pub nes: Option<f64>,
    pub pval: f64,
    pub es_null: Vec<f64>,
}

/// A gene set after matching it against the ranking
///
/// ### Fields
///
/// * `lib_idx` - Position of the set in the library
/// * `hits` - Sorted rank positions of the member genes
#[derive(Clone, Debug)]
struct PreparedSet {
    lib_idx: usize,
    hits: Vec<usize>,
}

//////////////////////
// Helper functions //
//////////////////////

/// Weight of a single hit
#[inline]
fn hit_weight(score: f64, weight: f64) -> f64 {
    if weight == 0.0 {
        1.0
    } else {
        score.abs().powf(weight)
    }
}

/// Update the running extreme; ties in absolute value go to the positive side
#[inline]
fn update_extreme(best: &mut f64, cur: f64) {
    if cur.abs() > best.abs() || (cur.abs() == best.abs() && cur > *best) {
        *best = cur;
    }
}

/// Calculate the enrichment score from the hit positions only
///
/// Walks the gaps between consecutive hits, so the cost is linear in the gene
/// set size rather than the ranking length.
///
/// ### Params
///
/// * `scores` - Ranking scores, sorted descending
/// * `hits` - Sorted rank positions of the gene set genes
/// * `weight` - The GSEA weight parameter
///
/// ### Returns
///
/// The enrichment score
pub fn calculate_es(scores: &[f64], hits: &[usize], weight: f64) -> f64 {
    let n = scores.len();
    let k = hits.len();
    if k == 0 || k >= n {
        return 0.0;
    }
    let nr: f64 = hits.iter().map(|&h| hit_weight(scores[h], weight)).sum();
    let miss = 1.0 / (n - k) as f64;
    let uniform = 1.0 / k as f64;

    let mut cur: f64 = 0.0;
    let mut best: f64 = 0.0;
    let mut last: i64 = -1;
    for &h in hits {
        let gap = h as i64 - last - 1;
        if gap > 0 {
            cur -= miss * gap as f64;
            update_extreme(&mut best, cur);
        }
        cur += if nr > 0.0 {
            hit_weight(scores[h], weight) / nr
        } else {
            uniform
        };
        update_extreme(&mut best, cur);
        last = h as i64;
    }
    best
}

/// Calculate the ES together with the running sum and the leading edge
///
/// Hits step up by `|r_j|^p / N_R`, misses step down by `1 / (N - N_H)`.
/// When all hits have a zero score the hits are weighted uniformly.
///
/// ### Params
///
/// * `scores` - Ranking scores, sorted descending
/// * `hits` - Sorted rank positions of the gene set genes
/// * `weight` - The GSEA weight parameter
///
/// ### Returns
///
/// The `GseaStats`
pub fn enrichment_score(scores: &[f64], hits: &[usize], weight: f64) -> GseaStats {
    let n = scores.len();
    let k = hits.len();

    let mut hit_profile = vec![0.0; n];
    let mut running_es = vec![0.0; n];
    if k == 0 || k >= n {
        return GseaStats {
            es: 0.0,
            peak: 0,
            running_es,
            hit_profile,
            leading_edge: Vec::new(),
        };
    }

    let nr: f64 = hits.iter().map(|&h| hit_weight(scores[h], weight)).sum();
    for &h in hits {
        let w = if nr > 0.0 {
            hit_weight(scores[h], weight) / nr
        } else {
            1.0 / k as f64
        };
        hit_profile[h] = w * scores[h].signum();
    }

    let miss = 1.0 / (n - k) as f64;
    let mut cur = 0.0;
    let mut hit_iter = hits.iter().peekable();
    for (i, value) in running_es.iter_mut().enumerate() {
        if hit_iter.peek() == Some(&&i) {
            hit_iter.next();
            cur += hit_profile[i].abs();
        } else {
            cur -= miss;
        }
        *value = cur;
    }

    // peak is taken on the side of the ES, first occurrence
    let es = calculate_es(scores, hits, weight);
    let mut peak = 0;
    for (i, &v) in running_es.iter().enumerate() {
        let best = running_es[peak];
        if (es >= 0.0 && v > best) || (es < 0.0 && v < best) {
            peak = i;
        }
    }

    let leading_edge: Vec<usize> = if es >= 0.0 {
        hits.iter().copied().filter(|&h| h <= peak).collect()
    } else {
        hits.iter().copied().filter(|&h| h >= peak).collect()
    };

    GseaStats {
        es,
        peak,
        running_es,
        hit_profile,
        leading_edge,
    }
}

/// Nominal p-value of an ES against its null distribution
///
/// ### Params
///
/// * `es` - Observed enrichment score
/// * `es_null` - Permuted enrichment scores
///
/// ### Returns
///
/// `#{null ≥ es} / #{null ≥ 0}` for positive scores, `#{null ≤ es} /
/// #{null < 0}` for negative ones; 1.0 if no null value has the same sign.
pub fn nominal_pval(es: f64, es_null: &[f64]) -> f64 {
    let (more_extreme, same_sign) = if es >= 0.0 {
        (
            es_null.iter().filter(|&&x| x >= es).count(),
            es_null.iter().filter(|&&x| x >= 0.0).count(),
        )
    } else {
        (
            es_null.iter().filter(|&&x| x <= es).count(),
            es_null.iter().filter(|&&x| x < 0.0).count(),
        )
    };
    if same_sign == 0 {
        1.0
    } else {
        more_extreme as f64 / same_sign as f64
    }
}

/// Means of the positive and the negative part of a null distribution
///
/// ### Returns
///
/// Tuple of (mean of values ≥ 0, |mean of values < 0|); `None` if there are
/// no such values or the mean is zero.
fn null_means(es_null: &[f64]) -> (Option<f64>, Option<f64>) {
    let mean = |it: Vec<f64>| -> Option<f64> {
        if it.is_empty() {
            return None;
        }
        let m = (it.iter().sum::<f64>() / it.len() as f64).abs();
        if m > 0.0 {
            Some(m)
        } else {
            None
        }
    };
    (
        mean(es_null.iter().copied().filter(|&x| x >= 0.0).collect()),
        mean(es_null.iter().copied().filter(|&x| x < 0.0).collect()),
    )
}

/// Normalise a score by the null mean of the same sign
#[inline]
fn normalise(x: f64, means: (Option<f64>, Option<f64>)) -> Option<f64> {
    if x >= 0.0 {
        means.0.map(|m| x / m)
    } else {
        means.1.map(|m| x / m)
    }
}

/// Draw random rank positions for the gene set permutations
///
/// Partial Fisher-Yates shuffle with an RNG seeded per permutation, so a set of
/// size `k` always sees the same first `k` draws regardless of `max_len` or the
/// thread it runs on.
///
/// ### Params
///
/// * `iter` - The permutation index
/// * `max_len` - Number of positions to draw
/// * `universe_length` - Number of genes in the ranking
/// * `seed` - Random seed
///
/// ### Returns
///
/// Vector of `max_len` distinct rank positions
fn random_positions(iter: usize, max_len: usize, universe_length: usize, seed: u64) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(iter as u64));
    let actual_len = max_len.min(universe_length);
    let mut indices: Vec<usize> = (0..universe_length).collect();
    for i in 0..actual_len {
        let j = rng.random_range(i..universe_length);
        indices.swap(i, j);
    }
    indices.truncate(actual_len);
    indices
}

/// Match the library against the ranking and apply the size filter
///
/// ### Returns
///
/// The prepared sets and the number of skipped sets
fn prepare_sets(
    ranking: &RankingStatistic,
    gene_sets: &[&GeneSet],
    min_size: usize,
    max_size: usize,
) -> (Vec<PreparedSet>, usize) {
    let rank_pos = index_map(ranking.genes());
    let n = ranking.len();
    let mut prepared = Vec::with_capacity(gene_sets.len());
    let mut skipped = 0;

    for (lib_idx, gs) in gene_sets.iter().enumerate() {
        let mut hits: Vec<usize> = gs
            .genes
            .iter()
            .filter_map(|g| rank_pos.get(g.as_str()).copied())
            .collect();
        hits.sort_unstable();
        let k = hits.len();
        if k < min_size || k > max_size || k == 0 || k >= n {
            tracing::trace!(term = %gs.name, overlap = k, "gene set skipped by size filter");
            skipped += 1;
            continue;
        }
        prepared.push(PreparedSet { lib_idx, hits });
    }

    (prepared, skipped)
}

/////////////////////
// Null generation //
/////////////////////

/// Enrichment scores for random gene sets of the sizes needed
///
/// Sets of equal size share their null (the ES only depends on the positions),
/// so every unique size is evaluated once per permutation.
///
/// ### Params
///
/// * `scores` - Ranking scores, sorted descending
/// * `sets` - The prepared sets
/// * `permutations` - Number of permutations
/// * `weight` - The GSEA weight parameter
/// * `seed` - Random seed
///
/// ### Returns
///
/// Null enrichment scores with shape [permutation][set]
fn gene_set_null(
    scores: &[f64],
    sets: &[PreparedSet],
    permutations: usize,
    weight: f64,
    seed: u64,
) -> Result<Vec<Vec<f64>>> {
    let sizes: Vec<usize> = sets.iter().map(|s| s.hits.len()).collect();
    let unique_sizes = unique(&sizes);
    let max_len = unique_sizes.iter().copied().max().unwrap_or(0);
    let n = scores.len();

    (0..permutations)
        .into_par_iter()
        .map(|i| {
            let positions = random_positions(i, max_len, n, seed);
            let mut by_size: FxHashMap<usize, f64> =
                FxHashMap::with_capacity_and_hasher(unique_sizes.len(), FxBuildHasher);
            for &size in &unique_sizes {
                let mut hits = positions[..size].to_vec();
                hits.sort_unstable();
                by_size.insert(size, calculate_es(scores, &hits, weight));
            }
            sizes
                .iter()
                .map(|s| {
                    by_size.get(s).copied().ok_or_else(|| {
                        GseaError::Data(format!("no null score for gene set size {}", s))
                    })
                })
                .collect::<Result<Vec<f64>>>()
        })
        .collect()
}

/// Enrichment scores after shuffling the phenotype labels
///
/// ### Params
///
/// * `ranking` - The observed ranking
/// * `sets` - The prepared sets (hits relative to `ranking`)
/// * `data` - Expression matrix and phenotypes
/// * `params` - The GSEA params
///
/// ### Returns
///
/// Null enrichment scores with shape [permutation][set]
fn phenotype_null(
    ranking: &RankingStatistic,
    sets: &[PreparedSet],
    data: PhenotypeData<'_>,
    params: &GseaParams,
) -> Result<Vec<Vec<f64>>> {
    data.matrix.validate_phenotypes(data.phenotypes)?;
    let matrix_index = data.matrix.gene_index();

    // rows of the matrix for the genes of every set
    let set_rows: Vec<Vec<usize>> = sets
        .iter()
        .map(|s| {
            s.hits
                .iter()
                .map(|&h| {
                    let gene = &ranking.genes()[h];
                    matrix_index.get(gene.as_str()).copied().ok_or_else(|| {
                        GseaError::Data(format!(
                            "ranked gene '{}' is missing from the expression matrix",
                            gene
                        ))
                    })
                })
                .collect::<Result<Vec<usize>>>()
        })
        .collect::<Result<_>>()?;

    let positive = data.phenotypes.positive_mask();

    (0..params.permutations)
        .into_par_iter()
        .map(|i| {
            let mut rng = StdRng::seed_from_u64(params.seed.wrapping_add(i as u64));
            let mut mask = positive.clone();
            mask.shuffle(&mut rng);

            let mut metric = gene_metrics(data.matrix, &mask, params.metric);
            let mut finite = 0;
            for m in metric.iter_mut() {
                if m.is_finite() {
                    finite += 1;
                } else {
                    *m = 0.0;
                }
            }
            ensure_data!(
                finite > 0,
                "permutation {} produced no finite ranking scores",
                i
            );

            let order = argsort_desc(&metric);
            let ranks = ranks_from_order(&order);
            let sorted: Vec<f64> = order.iter().map(|&r| metric[r]).collect();

            Ok(set_rows
                .iter()
                .map(|rows| {
                    let mut hits: Vec<usize> = rows.iter().map(|&r| ranks[r]).collect();
                    hits.sort_unstable();
                    calculate_es(&sorted, &hits, params.weight)
                })
                .collect::<Vec<f64>>())
        })
        .collect()
}

/// Build the worker pool all parallel work of a run executes on
fn build_pool(threads: usize) -> Result<rayon::ThreadPool> {
    Ok(rayon::ThreadPoolBuilder::new().num_threads(threads).build()?)
}

/// Run the permutations on the worker pool
///
/// ### Returns
///
/// Null enrichment scores with shape [set][permutation]
fn permutation_null(
    pool: &rayon::ThreadPool,
    ranking: &RankingStatistic,
    sets: &[PreparedSet],
    params: &GseaParams,
    phenotype_data: Option<PhenotypeData<'_>>,
) -> Result<Vec<Vec<f64>>> {
    if sets.is_empty() {
        return Ok(Vec::new());
    }

    let by_perm: Vec<Vec<f64>> = pool.install(|| match params.permutation_type {
        PermutationType::GeneSet => gene_set_null(
            ranking.scores(),
            sets,
            params.permutations,
            params.weight,
            params.seed,
        ),
        PermutationType::Phenotype => match phenotype_data {
            Some(data) => phenotype_null(ranking, sets, data, params),
            None => Err(GseaError::Config(
                "phenotype permutation needs the expression matrix and phenotypes".into(),
            )),
        },
    })?;

    // transpose to [set][permutation]
    let mut by_set = vec![Vec::with_capacity(params.permutations); sets.len()];
    for perm in by_perm {
        for (set_null, es) in by_set.iter_mut().zip(perm) {
            set_null.push(es);
        }
    }
    Ok(by_set)
}

///////////////////////////////
// Multiple testing (pooled) //
///////////////////////////////

/// FDR q-values from the pooled normalised null (GSEA style)
///
/// For NES ≥ 0 the q-value is the fraction of normalised null scores ≥ NES
/// (among null scores ≥ 0) divided by the same fraction among the observed
/// NES; mirrored for negative NES. q-values are then made monotone from the
/// extremes towards zero. Sets without NES get 1.0.
///
/// ### Params
///
/// * `nes` - Observed normalised enrichment scores
/// * `nes_null` - All normalised null scores, pooled over gene sets
///
/// ### Returns
///
/// The FDR q-values
pub fn pooled_fdr(nes: &[Option<f64>], nes_null: &[f64]) -> Vec<f64> {
    let mut null_sorted: Vec<f64> = nes_null.iter().copied().filter(|x| x.is_finite()).collect();
    null_sorted.sort_unstable_by(|a, b| a.total_cmp(b));
    let mut obs_sorted: Vec<f64> = nes.iter().flatten().copied().collect();
    obs_sorted.sort_unstable_by(|a, b| a.total_cmp(b));

    let null_neg = null_sorted.partition_point(|&x| x < 0.0);
    let null_pos = null_sorted.len() - null_neg;
    let obs_neg = obs_sorted.partition_point(|&x| x < 0.0);
    let obs_pos = obs_sorted.len() - obs_neg;

    let ratio = |a: usize, b: usize| if b == 0 { 0.0 } else { a as f64 / b as f64 };

    let mut fdr: Vec<f64> = nes
        .iter()
        .map(|n| match *n {
            None => 1.0,
            Some(n) if n >= 0.0 => {
                let null_higher = null_sorted.len() - null_sorted.partition_point(|&x| x < n);
                let obs_higher = obs_sorted.len() - obs_sorted.partition_point(|&x| x < n);
                let pi_obs = ratio(obs_higher, obs_pos);
                if pi_obs == 0.0 {
                    1.0
                } else {
                    (ratio(null_higher, null_pos) / pi_obs).min(1.0)
                }
            }
            Some(n) => {
                let null_lower = null_sorted.partition_point(|&x| x <= n);
                let obs_lower = obs_sorted.partition_point(|&x| x <= n);
                let pi_obs = ratio(obs_lower, obs_neg);
                if pi_obs == 0.0 {
                    1.0
                } else {
                    (ratio(null_lower, null_neg) / pi_obs).min(1.0)
                }
            }
        })
        .collect();

    // monotone: a more extreme NES never gets a larger q-value
    let mut pos_idx: Vec<usize> = (0..nes.len())
        .filter(|&i| matches!(nes[i], Some(n) if n >= 0.0))
        .collect();
    pos_idx.sort_by(|&a, &b| nes[a].unwrap_or(0.0).total_cmp(&nes[b].unwrap_or(0.0)));
    let mut neg_idx: Vec<usize> = (0..nes.len())
        .filter(|&i| matches!(nes[i], Some(n) if n < 0.0))
        .collect();
    neg_idx.sort_by(|&a, &b| nes[b].unwrap_or(0.0).total_cmp(&nes[a].unwrap_or(0.0)));

    for idx in [pos_idx, neg_idx] {
        let mut running_min = 1.0_f64;
        for i in idx {
            running_min = running_min.min(fdr[i]);
            fdr[i] = running_min;
        }
    }

    fdr
}

/// Family-wise error rate p-values
///
/// ### Params
///
/// * `nes` - Observed normalised enrichment scores
/// * `nes_null` - Normalised null scores with shape [set][permutation]; NaN
///   where no normalisation was possible
/// * `permutations` - Number of permutations
///
/// ### Returns
///
/// For each set, the fraction of permutations whose most extreme normalised
/// null score (over all sets, same sign) is at least as extreme as its NES.
pub fn fwer_pval(nes: &[Option<f64>], nes_null: &[Vec<f64>], permutations: usize) -> Vec<f64> {
    let mut max_pos = vec![0.0_f64; permutations];
    let mut min_neg = vec![0.0_f64; permutations];
    for set_null in nes_null {
        for (j, &x) in set_null.iter().enumerate() {
            if x.is_nan() {
                continue;
            }
            if x >= 0.0 {
                max_pos[j] = max_pos[j].max(x);
            } else {
                min_neg[j] = min_neg[j].min(x);
            }
        }
    }
    nes.iter()
        .map(|n| match *n {
            None => 1.0,
            Some(n) if n >= 0.0 => {
                max_pos.iter().filter(|&&x| x >= n).count() as f64 / permutations as f64
            }
            Some(n) => min_neg.iter().filter(|&&x| x <= n).count() as f64 / permutations as f64,
        })
        .collect()
}

////////////////////
// Main functions //
////////////////////

/// Run the enrichment analysis of a library against a ranking
///
/// ### Params
///
/// * `ranking` - The gene ranking
/// * `library` - The gene set library
/// * `params` - The GSEA params
/// * `phenotype_data` - Expression data; required for phenotype permutations
///
/// ### Returns
///
/// The `GseaResults`. Gene sets whose overlap with the ranking is outside of
/// `[min_size, max_size]` are skipped; an empty library yields empty results.
pub fn enrich(
    ranking: &RankingStatistic,
    library: &GeneSetLibrary,
    params: &GseaParams,
    phenotype_data: Option<PhenotypeData<'_>>,
) -> Result<GseaResults> {
    params.validate()?;
    let pool = build_pool(params.threads)?;
    enrich_in_pool(&pool, ranking, library, params, phenotype_data)
}

/// `enrich` on an existing worker pool
fn enrich_in_pool(
    pool: &rayon::ThreadPool,
    ranking: &RankingStatistic,
    library: &GeneSetLibrary,
    params: &GseaParams,
    phenotype_data: Option<PhenotypeData<'_>>,
) -> Result<GseaResults> {
    ranking.validate()?;
    ensure_config!(
        params.permutation_type == PermutationType::GeneSet || phenotype_data.is_some(),
        "phenotype permutation needs the expression matrix and phenotypes"
    );

    let gene_sets: Vec<&GeneSet> = library.iter().collect();
    let (sets, skipped) = prepare_sets(ranking, &gene_sets, params.min_size, params.max_size);

    tracing::info!(
        gene_sets = library.len(),
        tested = sets.len(),
        skipped,
        genes = ranking.len(),
        permutations = params.permutations,
        permutation_type = ?params.permutation_type,
        threads = params.threads,
        "running enrichment analysis"
    );

    if sets.is_empty() {
        if !library.is_empty() {
            tracing::warn!("no gene set passed the size filter");
        }
        return Ok(GseaResults::new(Vec::new(), params.clone()));
    }

    let observed: Vec<GseaStats> = pool.install(|| {
        sets.par_iter()
            .map(|s| enrichment_score(ranking.scores(), &s.hits, params.weight))
            .collect()
    });

    let es_null = permutation_null(pool, ranking, &sets, params, phenotype_data)?;
    tracing::debug!(sets = es_null.len(), "null distributions done");

    let pvals: Vec<f64> = observed
        .iter()
        .zip(&es_null)
        .map(|(obs, null)| nominal_pval(obs.es, null))
        .collect();

    let means: Vec<(Option<f64>, Option<f64>)> = es_null.iter().map(|n| null_means(n.as_slice())).collect();
    let nes: Vec<Option<f64>> = observed
        .iter()
        .zip(&means)
        .map(|(obs, &m)| normalise(obs.es, m))
        .collect();
    let nes_null: Vec<Vec<f64>> = es_null
        .iter()
        .zip(&means)
        .map(|(null, &m)| {
            null.iter()
                .map(|&x| normalise(x, m).unwrap_or(f64::NAN))
                .collect()
        })
        .collect();

    let pooled: Vec<f64> = nes_null.iter().flatten().copied().collect();
    let fdr = pooled_fdr(&nes, &pooled);
    let fwer = fwer_pval(&nes, &nes_null, params.permutations);
    let padj = pool.install(|| calc_fdr(&pvals));

    let n = ranking.len() as f64;
    let results: Vec<EnrichmentResult> = sets
        .into_iter()
        .zip(observed)
        .enumerate()
        .map(|(i, (set, stats))| {
            let gs = gene_sets[set.lib_idx];
            let k = set.hits.len();
            let gene_pct = if stats.es >= 0.0 {
                (stats.peak + 1) as f64 / n
            } else {
                (n - stats.peak as f64) / n
            };
            EnrichmentResult {
                term: gs.name.clone(),
                es: stats.es,
                nes: nes[i],
                pval: pvals[i],
                fdr: fdr[i],
                fwer_pval: fwer[i],
                padj: padj[i],
                size: k,
                set_size: gs.len(),
                tag_pct: stats.leading_edge.len() as f64 / k as f64,
                gene_pct,
                leading_edge: stats
                    .leading_edge
                    .iter()
                    .map(|&h| ranking.genes()[h].clone())
                    .collect(),
                running_es: stats.running_es,
                hits: set.hits,
            }
        })
        .collect();

    Ok(GseaResults::new(results, params.clone()))
}

/// Permutation test of a single gene set
///
/// Uses the same null generation as `enrich`; the size filter is not applied.
///
/// ### Params
///
/// * `ranking` - The gene ranking
/// * `gene_set` - The gene set to test
/// * `params` - The GSEA params (permutations, type, weight, seed, threads)
/// * `phenotype_data` - Expression data; required for phenotype permutations
///
/// ### Returns
///
/// The `PermutationTest`
pub fn permutation_test(
    ranking: &RankingStatistic,
    gene_set: &GeneSet,
    params: &GseaParams,
    phenotype_data: Option<PhenotypeData<'_>>,
) -> Result<PermutationTest> {
    params.validate()?;
    ranking.validate()?;
    ensure_config!(
        params.permutation_type == PermutationType::GeneSet || phenotype_data.is_some(),
        "phenotype permutation needs the expression matrix and phenotypes"
    );

    let (sets, _) = prepare_sets(ranking, &[gene_set], 1, ranking.len().saturating_sub(1));
    let set = sets.into_iter().next().ok_or_else(|| {
        GseaError::Data(format!(
            "gene set '{}' needs between 1 and {} genes in the ranking",
            gene_set.name,
            ranking.len().saturating_sub(1)
        ))
    })?;

    let pool = build_pool(params.threads)?;
    let es = calculate_es(ranking.scores(), &set.hits, params.weight);
    let es_null = permutation_null(
        &pool,
        ranking,
        std::slice::from_ref(&set),
        params,
        phenotype_data,
    )?
    .pop()
    .unwrap_or_default();

    Ok(PermutationTest {
        es,
        nes: normalise(es, null_means(&es_null)),
        pval: nominal_pval(es, &es_null),
        es_null,
    })
}

/// Rank the genes and run the enrichment in one go
///
/// ### Params
///
/// * `matrix` - The expression matrix
/// * `phenotypes` - Phenotype labels aligned to the matrix columns
/// * `library` - The gene set library
/// * `params` - The GSEA params
///
/// ### Returns
///
/// Tuple of the ranking and the `GseaResults`
pub fn run_gsea(
    matrix: &ExpressionMatrix,
    phenotypes: &PhenotypeAssignment,
    library: &GeneSetLibrary,
    params: &GseaParams,
) -> Result<(RankingStatistic, GseaResults)> {
    params.validate()?;
    let pool = build_pool(params.threads)?;
    let ranking = pool.install(|| compute_ranking(matrix, phenotypes, params.metric))?;
    let data = PhenotypeData { matrix, phenotypes };
    let results = enrich_in_pool(&pool, &ranking, library, params, Some(data))?;
    Ok((ranking, results))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::synthetic_data::generate_two_group_data;
    use approx::assert_relative_eq;

    fn genes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn linear_ranking(n: usize) -> RankingStatistic {
        RankingStatistic::from_pairs((0..n).map(|i| (format!("G{i}"), (n - i) as f64 - n as f64 / 2.0)))
    }

    fn small_params() -> GseaParams {
        GseaParams {
            min_size: 1,
            max_size: 500,
            permutations: 200,
            seed: 7,
            threads: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_permutation_type() {
        assert_eq!(
            parse_permutation_type("gene_set"),
            Some(PermutationType::GeneSet)
        );
        assert_eq!(
            parse_permutation_type("Phenotype"),
            Some(PermutationType::Phenotype)
        );
        assert_eq!(parse_permutation_type("sample"), None);
    }

    #[test]
    fn test_scenario_running_sum() {
        let ranking = RankingStatistic::from_pairs(vec![("G1", 5.0), ("G2", 3.0), ("G3", -2.0)]);
        let stats = enrichment_score(ranking.scores(), &[0, 2], 1.0);

        // signed step of every rank position
        assert!(stats.hit_profile[0] > 0.0);
        assert_eq!(stats.hit_profile[1], 0.0);
        assert!(stats.hit_profile[2] < 0.0);
        assert_relative_eq!(stats.hit_profile[0], 5.0 / 7.0);
        assert_relative_eq!(stats.hit_profile[2], -2.0 / 7.0);

        // running sum: +5/7, miss of 1, +2/7
        assert_relative_eq!(stats.running_es[0], 5.0 / 7.0, epsilon = 1e-12);
        assert_relative_eq!(stats.running_es[1], -2.0 / 7.0, epsilon = 1e-12);
        assert_relative_eq!(stats.running_es[2], 0.0, epsilon = 1e-12);

        assert_relative_eq!(stats.es, 5.0 / 7.0, epsilon = 1e-12);
        assert_eq!(stats.peak, 0);
        assert_eq!(stats.leading_edge, vec![0]);
    }

    #[test]
    fn test_calculate_es_matches_trace() {
        let ranking = linear_ranking(50);
        for hits in [vec![0, 3, 7, 20], vec![30, 40, 45, 49], vec![1, 25, 48]] {
            let stats = enrichment_score(ranking.scores(), &hits, 1.0);
            let es = calculate_es(ranking.scores(), &hits, 1.0);
            assert_relative_eq!(stats.running_es[stats.peak], es, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_negative_es_leading_edge() {
        let ranking = linear_ranking(20);
        let stats = enrichment_score(ranking.scores(), &[15, 17, 19], 1.0);
        assert!(stats.es < 0.0);
        assert!(stats.leading_edge.iter().all(|&h| h >= stats.peak));
        assert_eq!(stats.leading_edge.len(), 3);
    }

    #[test]
    fn test_zero_weight_is_classic_ks() {
        let ranking = linear_ranking(10);
        let stats = enrichment_score(ranking.scores(), &[0, 1], 0.0);
        assert_relative_eq!(stats.hit_profile[0], 0.5);
        assert_relative_eq!(stats.es, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_peak_follows_es_sign_on_ties() {
        // trace 0.5, 0, -0.5, 0: both extremes have the same magnitude
        let scores = [1.0, 0.5, -0.5, -1.0];
        let stats = enrichment_score(&scores, &[0, 3], 1.0);
        assert_relative_eq!(stats.es, 0.5, epsilon = 1e-12);
        assert_eq!(stats.peak, 0);
        assert_eq!(stats.leading_edge, vec![0]);

        let ranking = linear_ranking(60);
        for hits in [vec![0, 29, 30, 59], vec![2, 5, 54, 57], vec![10, 20, 40, 50]] {
            let stats = enrichment_score(ranking.scores(), &hits, 1.0);
            let at_peak = stats.running_es[stats.peak];
            assert!(at_peak == 0.0 || at_peak.signum() == stats.es.signum());
            assert_relative_eq!(at_peak, stats.es, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_nominal_pval() {
        let null = [0.1, 0.5, 0.7, -0.2, -0.6];
        assert_relative_eq!(nominal_pval(0.6, &null), 1.0 / 3.0);
        assert_relative_eq!(nominal_pval(-0.3, &null), 0.5);
        assert_relative_eq!(nominal_pval(-0.3, &[0.1, 0.2]), 1.0);
    }

    #[test]
    fn test_params_validation() {
        let mut p = small_params();
        assert!(p.validate().is_ok());
        p.min_size = 600;
        assert!(matches!(p.validate(), Err(GseaError::Config(_))));
        let p = GseaParams {
            permutations: 0,
            ..small_params()
        };
        assert!(p.validate().unwrap_err().to_string().contains("permutations"));
        let p = GseaParams {
            weight: -1.0,
            ..small_params()
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_enrich_config_and_data_errors() {
        let ranking = linear_ranking(30);
        let library = GeneSetLibrary::new();
        let bad = GseaParams {
            min_size: 10,
            max_size: 5,
            ..small_params()
        };
        assert!(matches!(
            enrich(&ranking, &library, &bad, None),
            Err(GseaError::Config(_))
        ));

        let empty = RankingStatistic::from_pairs(Vec::<(String, f64)>::new());
        assert!(matches!(
            enrich(&empty, &library, &small_params(), None),
            Err(GseaError::Data(_))
        ));

        let dup = RankingStatistic::from_pairs(vec![("A", 2.0), ("B", 1.0), ("A", 0.0)]);
        assert!(matches!(
            enrich(&dup, &library, &small_params(), None),
            Err(GseaError::Data(_))
        ));

        let pheno = GseaParams {
            permutation_type: PermutationType::Phenotype,
            ..small_params()
        };
        assert!(matches!(
            enrich(&ranking, &library, &pheno, None),
            Err(GseaError::Config(_))
        ));
    }

    #[test]
    fn test_enrich_empty_library() {
        let ranking = linear_ranking(30);
        let res = enrich(&ranking, &GeneSetLibrary::new(), &small_params(), None).unwrap();
        assert!(res.is_empty());
    }

    #[test]
    fn test_enrich_skips_small_sets() {
        let ranking = linear_ranking(100);
        let mut library = GeneSetLibrary::new();
        library
            .insert(GeneSet::new("TINY", "", &genes(&["G3"])))
            .unwrap();
        library
            .insert(GeneSet::new(
                "BIG",
                "",
                &(0..20).map(|i| format!("G{i}")).collect::<Vec<_>>(),
            ))
            .unwrap();
        let params = GseaParams {
            min_size: 15,
            ..small_params()
        };
        let res = enrich(&ranking, &library, &params, None).unwrap();
        assert_eq!(res.len(), 1);
        assert!(res.lookup("TINY").is_err());
        let big = res.lookup("BIG").unwrap();
        assert!(big.es > 0.9);
        assert!(big.pval < 0.05);
        assert_eq!(big.size, 20);
        assert!(big.nes.unwrap() > 1.0);
    }

    #[test]
    fn test_overlap_counts_only_ranked_genes() {
        let ranking = linear_ranking(40);
        let mut library = GeneSetLibrary::new();
        let mut members: Vec<String> = (0..5).map(|i| format!("G{i}")).collect();
        members.extend((0..20).map(|i| format!("NOT_RANKED_{i}")));
        library.insert(GeneSet::new("PARTIAL", "", &members)).unwrap();
        let params = GseaParams {
            min_size: 15,
            ..small_params()
        };
        assert!(enrich(&ranking, &library, &params, None).unwrap().is_empty());
    }

    #[test]
    fn test_gene_set_permutation_deterministic() {
        let ranking = linear_ranking(200);
        let mut library = GeneSetLibrary::new();
        for (name, start) in [("A", 0), ("B", 50), ("C", 180)] {
            let members: Vec<String> = (start..start + 15).map(|i| format!("G{i}")).collect();
            library.insert(GeneSet::new(name, "", &members)).unwrap();
        }
        let params = GseaParams {
            min_size: 10,
            ..small_params()
        };
        let a = enrich(&ranking, &library, &params, None).unwrap();
        let b = enrich(&ranking, &library, &params, None).unwrap();
        let single_thread = GseaParams {
            threads: 1,
            ..params.clone()
        };
        let c = enrich(&ranking, &library, &single_thread, None).unwrap();
        for name in ["A", "B", "C"] {
            let (ra, rb, rc) = (
                a.lookup(name).unwrap(),
                b.lookup(name).unwrap(),
                c.lookup(name).unwrap(),
            );
            assert_eq!(ra.pval, rb.pval);
            assert_eq!(ra.fdr, rb.fdr);
            assert_eq!(ra.pval, rc.pval);
            assert_eq!(ra.nes, rc.nes);
        }
    }

    #[test]
    fn test_permutation_test_deterministic_and_consistent() {
        let ranking = linear_ranking(150);
        let members: Vec<String> = (10..30).map(|i| format!("G{i}")).collect();
        let gs = GeneSet::new("SET", "", &members);
        let params = small_params();

        let a = permutation_test(&ranking, &gs, &params, None).unwrap();
        let b = permutation_test(&ranking, &gs, &params, None).unwrap();
        assert_eq!(a.pval, b.pval);
        assert_eq!(a.es_null, b.es_null);
        assert_eq!(a.es_null.len(), params.permutations);

        // same null as inside a library run
        let mut library = GeneSetLibrary::new();
        library.insert(gs.clone()).unwrap();
        let res = enrich(&ranking, &library, &params, None).unwrap();
        assert_eq!(res.lookup("SET").unwrap().pval, a.pval);

        let other_seed = GseaParams {
            seed: 8,
            ..params.clone()
        };
        let c = permutation_test(&ranking, &gs, &other_seed, None).unwrap();
        assert_ne!(a.es_null, c.es_null);
    }

    #[test]
    fn test_permutation_test_no_overlap() {
        let ranking = linear_ranking(10);
        let gs = GeneSet::new("NONE", "", &genes(&["X", "Y"]));
        assert!(matches!(
            permutation_test(&ranking, &gs, &small_params(), None),
            Err(GseaError::Data(_))
        ));
    }

    #[test]
    fn test_pooled_fdr_bounds_and_monotone() {
        let nes = vec![Some(2.5), Some(1.2), Some(0.3), Some(-1.8), Some(-0.4), None];
        let null: Vec<f64> = (-20..=20).map(|i| i as f64 / 10.0).collect();
        let fdr = pooled_fdr(&nes, &null);
        assert!(fdr.iter().all(|&q| (0.0..=1.0).contains(&q)));
        assert!(fdr[0] <= fdr[1] && fdr[1] <= fdr[2]);
        assert!(fdr[3] <= fdr[4]);
        assert_eq!(fdr[5], 1.0);
        // nothing in the null reaches 2.5
        assert_eq!(fdr[0], 0.0);
    }

    #[test]
    fn test_fwer_pval() {
        let nes = vec![Some(1.5), Some(-1.0)];
        let null = vec![vec![1.0, 2.0, -0.5, f64::NAN], vec![-2.0, 0.1, -0.2, -1.5]];
        let fwer = fwer_pval(&nes, &null, 4);
        // per permutation max_pos = [1.0, 2.0, 0.0, 0.0]; min_neg = [-2.0, 0.0, -0.5, -1.5]
        assert_relative_eq!(fwer[0], 0.25);
        assert_relative_eq!(fwer[1], 0.5);
    }

    #[test]
    fn test_enrich_worker_failure_is_fatal() {
        // permutations with both B samples in the numerator divide by zero for every gene
        let genes: Vec<String> = (0..4).map(|i| format!("G{i}")).collect();
        let samples: Vec<String> = (0..4).map(|j| format!("s{j}")).collect();
        let rows: Vec<Vec<f64>> = (0..4)
            .map(|i| vec![0.0, 0.0, 1.0 + i as f64, 1.0 + i as f64])
            .collect();
        let matrix = ExpressionMatrix::from_rows(genes.clone(), samples, &rows).unwrap();
        let labels = ["A", "A", "B", "B"].iter().map(|s| s.to_string()).collect();
        let phenotypes = PhenotypeAssignment::new(labels, None).unwrap();
        let mut library = GeneSetLibrary::new();
        library.insert(GeneSet::new("PAIR", "", &genes[..2])).unwrap();

        let params = GseaParams {
            min_size: 1,
            permutations: 100,
            permutation_type: PermutationType::Phenotype,
            metric: RankingMetric::RatioOfClasses,
            seed: 1,
            threads: 2,
            ..Default::default()
        };
        match run_gsea(&matrix, &phenotypes, &library, &params) {
            Err(GseaError::Data(msg)) => assert!(msg.contains("no finite ranking scores")),
            other => panic!("expected a data error, got {other:?}"),
        }
    }

    #[test]
    fn test_worker_pool_size_and_thread_independence() {
        let pool = build_pool(1).unwrap();
        assert_eq!(pool.install(rayon::current_num_threads), 1);
        assert!(matches!(
            build_pool(3).map(|p| p.current_num_threads()),
            Ok(3)
        ));

        let data = generate_two_group_data(120, 4, 15, 2.0, 5).unwrap();
        let params = GseaParams {
            min_size: 10,
            permutations: 50,
            permutation_type: PermutationType::Phenotype,
            seed: 9,
            threads: 1,
            ..Default::default()
        };
        let (rank_a, res_a) =
            run_gsea(&data.matrix, &data.phenotypes, &data.library, &params).unwrap();
        let four = GseaParams {
            threads: 4,
            ..params.clone()
        };
        let (rank_b, res_b) =
            run_gsea(&data.matrix, &data.phenotypes, &data.library, &four).unwrap();
        assert_eq!(rank_a, rank_b);
        for r in res_a.results() {
            let other = res_b.lookup(&r.term).unwrap();
            assert_eq!(r.pval, other.pval);
            assert_eq!(r.nes, other.nes);
        }
    }

    #[test]
    fn test_phenotype_permutation_detects_planted_sets() {
        let data = generate_two_group_data(300, 8, 20, 3.0, 11).unwrap();
        let params = GseaParams {
            min_size: 10,
            permutations: 100,
            permutation_type: PermutationType::Phenotype,
            seed: 3,
            threads: 2,
            ..Default::default()
        };
        let (ranking, res) = run_gsea(&data.matrix, &data.phenotypes, &data.library, &params).unwrap();
        assert_eq!(ranking.len(), 300);
        assert_eq!(res.len(), 3);

        let up = res.lookup("UP_IN_A").unwrap();
        let down = res.lookup("DOWN_IN_A").unwrap();
        assert!(up.es > 0.5);
        assert!(down.es < -0.5);
        assert!(up.pval < 0.05);
        assert!(down.pval < 0.05);

        let (_, again) = run_gsea(&data.matrix, &data.phenotypes, &data.library, &params).unwrap();
        assert_eq!(again.lookup("RANDOM").unwrap().pval, res.lookup("RANDOM").unwrap().pval);
    }
}
