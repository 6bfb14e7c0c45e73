//! Shared statistical helpers used by the enrichment engine.

pub mod stats;
