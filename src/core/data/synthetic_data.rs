use rand::prelude::*;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;

use crate::core::data::cls::PhenotypeAssignment;
use crate::core::data::gct::ExpressionMatrix;
use crate::core::data::gmt::{GeneSet, GeneSetLibrary};
use crate::ensure_data;
use crate::error::{GseaError, Result};

////////////////
// Structures //
////////////////

/// Structure for a synthetic two-phenotype data set
///
/// ### Fields
///
/// * `matrix` - The synthetic expression values.
/// * `phenotypes` - Sample labels; the first half is `GroupA`, the second
///   half `GroupB`.
/// * `library` - Gene sets: `UP_IN_A` (shifted up in `GroupA`), `DOWN_IN_A`
///   (shifted down in `GroupA`) and `RANDOM` (background genes only).
#[derive(Clone, Debug)]
pub struct SyntheticGseaData {
    pub matrix: ExpressionMatrix,
    pub phenotypes: PhenotypeAssignment,
    pub library: GeneSetLibrary,
}

/////////////////////////
// Synthetic GSEA data //
/////////////////////////

/// Generate synthetic two-group expression data with planted gene sets
///
/// ### Params
///
/// * `num_genes` - Number of genes in the data. Needs to be ≥ 3 * `set_size`.
/// * `samples_per_group` - Number of samples in each of the two groups.
/// * `set_size` - Size of each of the three gene sets.
/// * `effect_size` - Mean shift applied to the planted gene sets.
/// * `seed` - Seed for reproducibility purposes.
///
/// ### Returns
///
/// The `SyntheticGseaData`.
pub fn generate_two_group_data(
    num_genes: usize,
    samples_per_group: usize,
    set_size: usize,
    effect_size: f64,
    seed: u64,
) -> Result<SyntheticGseaData> {
    ensure_data!(
        set_size > 0 && 3 * set_size <= num_genes,
        "three gene sets of size {} do not fit into {} genes",
        set_size,
        num_genes
    );
    ensure_data!(samples_per_group > 0, "need at least one sample per group");
    let num_samples = 2 * samples_per_group;

    let genes: Vec<String> = (0..num_genes).map(|i| format!("GENE_{:05}", i)).collect();
    let samples: Vec<String> = (0..num_samples).map(|j| format!("S{}", j + 1)).collect();
    let labels: Vec<String> = (0..num_samples)
        .map(|j| {
            if j < samples_per_group {
                "GroupA".to_string()
            } else {
                "GroupB".to_string()
            }
        })
        .collect();

    let base_dist = Normal::new(8.0, 2.0).map_err(|e| GseaError::Data(e.to_string()))?;
    let noise = Normal::new(0.0, 1.0).map_err(|e| GseaError::Data(e.to_string()))?;

    let rows: Vec<Vec<f64>> = (0..num_genes)
        .into_par_iter()
        .map(|i| {
            let mut local_rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
            let base = base_dist.sample(&mut local_rng);
            let shift = if i < set_size {
                effect_size
            } else if i < 2 * set_size {
                -effect_size
            } else {
                0.0
            };
            (0..num_samples)
                .map(|j| {
                    let group_shift = if j < samples_per_group { shift } else { 0.0 };
                    base + group_shift + noise.sample(&mut local_rng)
                })
                .collect()
        })
        .collect();

    // random background set from the genes that carry no signal
    let mut rng = StdRng::seed_from_u64(seed);
    let mut background: Vec<usize> = (2 * set_size..num_genes).collect();
    background.shuffle(&mut rng);
    let random_genes: Vec<String> = background
        .iter()
        .take(set_size)
        .map(|&i| genes[i].clone())
        .collect();

    let mut library = GeneSetLibrary::new();
    library.insert(GeneSet::new("UP_IN_A", "planted", &genes[..set_size]))?;
    library.insert(GeneSet::new(
        "DOWN_IN_A",
        "planted",
        &genes[set_size..2 * set_size],
    ))?;
    library.insert(GeneSet::new("RANDOM", "background", &random_genes))?;

    let matrix = ExpressionMatrix::from_rows(genes, samples, &rows)?;
    let phenotypes = PhenotypeAssignment::new(
        labels,
        Some(["GroupA".to_string(), "GroupB".to_string()]),
    )?;

    Ok(SyntheticGseaData {
        matrix,
        phenotypes,
        library,
    })
}
