//! Gene set enrichment analysis (GSEA) of two-phenotype expression data.
//!
//! Loads expression (GCT), phenotype (CLS) and gene set (GMT) files, ranks the
//! genes, scores every gene set with the weighted running-sum statistic and
//! assesses significance via gene set or phenotype permutations.

pub mod core;
pub mod error;
pub mod utils;

pub use crate::core::data::cls::{read_cls, PhenotypeAssignment};
pub use crate::core::data::gct::{read_expression, ExpressionMatrix};
pub use crate::core::data::gmt::{read_gmt, write_gmt, GeneSet, GeneSetLibrary};
pub use crate::core::enrichment::gsea::{
    enrich, enrichment_score, permutation_test, run_gsea, GseaParams, GseaStats,
    PermutationTest, PermutationType, PhenotypeData,
};
pub use crate::core::enrichment::ranking::{compute_ranking, RankingMetric, RankingStatistic};
pub use crate::core::enrichment::results::{
    write_results_tsv, EnrichmentResult, GseaResults, RankedTerms,
};
pub use crate::core::plot::{plot, GseaPlot, PlotImage};
pub use crate::error::{GseaError, Result};
