//! Core functionality: input loading, the enrichment engine and plotting.

pub mod base;
pub mod data;
pub mod enrichment;
pub mod plot;
