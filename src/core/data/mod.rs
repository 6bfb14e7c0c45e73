//! Module containing the input loaders (CLS, GCT, GMT) and their data
//! structures

pub mod cls;
pub mod gct;
pub mod gmt;
pub mod synthetic_data;
