//! Error types for winetrack-core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WinetrackError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Tracking server returned {status} ({code}): {message}")]
    Tracking {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    #[error("Column '{column}' is not numeric ({data_type})")]
    NonNumericColumn { column: String, data_type: String },

    #[error("Column '{column}' has a null value at row {row}")]
    NullValue { column: String, row: usize },

    #[error("Column '{column}' has a non-finite value ({value}) at row {row}")]
    NonFiniteValue { column: String, row: usize, value: f64 },

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Unsupported URI: {0}")]
    UnsupportedUri(String),

    #[error("Dataset is empty")]
    EmptyDataset,

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Experiment not found: {0}")]
    ExperimentNotFound(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, WinetrackError>;
