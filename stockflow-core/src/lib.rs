//! stockflow core: the daily market-data ingestion pipeline.
//!
//! A run downloads price history for a list of tickers and proceeds in
//! four steps over a shared staging directory:
//! - Fetch: one CSV artifact per ticker with data
//! - Load: CSV rows inserted into a staging table, ignoring duplicates
//! - Merge: a configured SQL script run against the database
//! - Archive: the staged CSVs bundled into a timestamped zip

pub mod archive;
pub mod artifact;
pub mod config;
pub mod data;
pub mod domain;
pub mod fetch;
pub mod load;
pub mod merge;
pub mod pipeline;
pub mod staging;
pub mod store;

pub use config::PipelineConfig;
pub use pipeline::{Pipeline, PipelineError, RunReport};
