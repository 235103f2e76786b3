//! winetrack-core: decision-tree training on tabular data with run tracking.
//!
//! A training job loads a CSV, splits it, fits a vector-assembler plus
//! regression-tree pipeline, evaluates it, and records tags, params,
//! metrics and model artifacts against a tracking backend (a tracking
//! server over REST, or a local directory store).

pub mod dataset;
pub mod error;
pub mod evaluation;
pub mod export;
pub mod models;
pub mod pipeline;
pub mod storage;
pub mod tracking;
pub mod train;
pub mod tree;

pub use error::{Result, WinetrackError};
pub use evaluation::{RegressionEvaluator, RegressionMetric};
pub use models::{Experiment, Metric, Run, RunInfo, RunStatus};
pub use pipeline::{Pipeline, PipelineModel, VectorAssembler};
pub use tracking::{connect, FileTrackingStore, RestTrackingClient, TrackingClient};
pub use train::{train, TrainOptions, TrainSummary};
pub use tree::{DecisionTreeRegressionModel, DecisionTreeRegressor};

/// Library version, recorded in run tags and exported model metadata.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// `<prefix>_<12 hex chars>`, the uid form used for pipeline stages.
pub(crate) fn new_uid(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &id[..12])
}
