//! Error types for manyshot-eval

use crate::dataset::Subgroup;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the harness.
///
/// Sampling precondition failures (`InsufficientDemoPool`, `QuotaUnmet`) are
/// fatal and abort before any API call. Transient model-call failures never
/// surface here; they become error-marked checkpoint entries and the run
/// continues.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error(
        "insufficient demo pool for class '{class}': {requested} shots requested, {available} eligible rows"
    )]
    InsufficientDemoPool {
        class: String,
        requested: usize,
        available: usize,
    },

    #[error(
        "class '{class}' cannot fill its {subgroup} quota: {needed} needed, {available} eligible"
    )]
    QuotaUnmet {
        class: String,
        subgroup: Subgroup,
        needed: usize,
        available: usize,
    },

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid model args: {0}")]
    InvalidModelArgs(String),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("run cancelled; checkpoint flushed")]
    Cancelled,

    #[error("checkpoint persistence failed at {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for the harness.
pub type Result<T> = std::result::Result<T, HarnessError>;
