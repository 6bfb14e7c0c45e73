//! Module contains the gene set enrichment analysis: gene ranking, the
//! permutation based enrichment engine and its results

pub mod gsea;
pub mod ranking;
pub mod results;
