//! # minestudy
//!
//! Incremental pipeline for a software-mining study: runs remote queries only
//! when their expanded text changed, verifies and converts their output, loads
//! the resulting tables through a Parquet cache, and removes exact and near
//! duplicate files before analysis. Tables are Polars DataFrames throughout.

pub mod clones;
pub mod config;
pub mod convert;
pub mod dedup;
pub mod driver;
pub mod error;
pub mod fingerprint;
pub mod jobs;
pub mod service;
pub mod store;
pub mod tables;
pub mod tokens;

// Re-export main API types
pub use clones::{ClonePair, CloneDetector, Similarity};
pub use config::{Layout, StudyConfig};
pub use driver::{Driver, TargetState};
pub use error::{StudyError, StudyResult};
pub use jobs::JobCache;
pub use service::{HttpService, QueryService, ServiceSession};
pub use store::{CacheLookup, DataStore, LoadOptions};
