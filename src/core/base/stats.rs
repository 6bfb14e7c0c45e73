use rayon::prelude::*;

/// Calculate the Benjamini-Hochberg FDR
///
/// ### Params
///
/// * `pvals` - P-values for which to calculate the FDR
///
/// ### Returns
///
/// The adjusted p-values in the input order
pub fn calc_fdr(pvals: &[f64]) -> Vec<f64> {
    let n = pvals.len();
    if n == 0 {
        return Vec::new();
    }
    let n_f64 = n as f64;

    let mut indexed_pval: Vec<(usize, f64)> =
        pvals.par_iter().enumerate().map(|(i, &x)| (i, x)).collect();

    indexed_pval.sort_unstable_by(|a, b| a.1.total_cmp(&b.1));

    let adj_pvals_tmp: Vec<f64> = indexed_pval
        .par_iter()
        .enumerate()
        .map(|(i, (_, p))| (n_f64 / (i + 1) as f64) * p)
        .collect();

    let mut current_min = adj_pvals_tmp[n - 1].min(1.0);
    let mut monotonic_adj = vec![current_min; n];

    for i in (0..n - 1).rev() {
        current_min = current_min.min(adj_pvals_tmp[i]).min(1.0);
        monotonic_adj[i] = current_min;
    }

    let mut adj_pvals = vec![0.0; n];
    for (i, &(original_idx, _)) in indexed_pval.iter().enumerate() {
        adj_pvals[original_idx] = monotonic_adj[i];
    }

    adj_pvals
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_calc_fdr() {
        // p.adjust(c(0.01, 0.04, 0.03, 0.5), "BH")
        let adj = calc_fdr(&[0.01, 0.04, 0.03, 0.5]);
        let expected = [0.04, 0.05333333, 0.05333333, 0.5];
        for (a, e) in adj.iter().zip(expected) {
            assert_relative_eq!(*a, e, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_calc_fdr_capped_and_empty() {
        let adj = calc_fdr(&[0.9, 0.95, 1.0]);
        assert!(adj.iter().all(|&p| p <= 1.0));
        assert!(calc_fdr(&[]).is_empty());
    }
}
