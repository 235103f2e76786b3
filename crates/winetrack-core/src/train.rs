//! One tracked training job: load, split, fit, evaluate, export, log.

use std::path::PathBuf;

use arrow::record_batch::RecordBatch;
use tracing::info;

use crate::dataset::{load_csv, random_split, require_column};
use crate::error::{Result, WinetrackError};
use crate::evaluation::{RegressionEvaluator, RegressionMetric};
use crate::export::{save_bundle, save_native};
use crate::models::RunStatus;
use crate::pipeline::{Pipeline, PipelineModel, PREDICTION_COL};
use crate::tracking::{now_millis, TrackingClient};
use crate::tree::DecisionTreeRegressor;

pub const DEFAULT_SEED: u64 = 2019;
pub const SPLIT_WEIGHTS: [f64; 2] = [0.7, 0.3];

/// Metrics logged for every run, in logging order.
pub const LOGGED_METRICS: [RegressionMetric; 3] = [RegressionMetric::Rmse, RegressionMetric::R2, RegressionMetric::Mae];

pub const TREE_DETAILS_FILE: &str = "treeModel.txt";
pub const TREE_DETAILS_PATH: &str = "details";
pub const NATIVE_MODEL_DIR: &str = "spark-model";
pub const BUNDLE_MODEL_DIR: &str = "mleap-model";
pub const BUNDLE_ARTIFACT_PATH: &str = "mleap-model/mleap/model";

/// Inputs of a training job.
#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub data_path: PathBuf,
    /// Local output directory; models are written to subdirectories of it.
    pub model_path: PathBuf,
    pub max_depth: usize,
    pub max_bins: usize,
    /// Free-text label recorded as the `runOrigin` param.
    pub run_origin: String,
    pub label_col: String,
    pub delimiter: u8,
    pub seed: u64,
    /// Recorded as the `mlflow.source.name` tag.
    pub source_name: String,
}

impl TrainOptions {
    pub fn new(data_path: impl Into<PathBuf>, model_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
            model_path: model_path.into(),
            max_depth: 5,
            max_bins: 32,
            run_origin: "None".to_string(),
            label_col: "quality".to_string(),
            delimiter: b',',
            seed: DEFAULT_SEED,
            source_name: "winetrack".to_string(),
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_max_bins(mut self, max_bins: usize) -> Self {
        self.max_bins = max_bins;
        self
    }

    pub fn with_run_origin(mut self, run_origin: impl Into<String>) -> Self {
        self.run_origin = run_origin.into();
        self
    }

    pub fn with_label_col(mut self, label_col: impl Into<String>) -> Self {
        self.label_col = label_col.into();
        self
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_source_name(mut self, source_name: impl Into<String>) -> Self {
        self.source_name = source_name.into();
        self
    }
}

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct TrainSummary {
    pub run_id: String,
    /// `(name, value)` in logging order.
    pub metrics: Vec<(String, f64)>,
    pub depth: usize,
    pub num_nodes: usize,
    pub train_rows: usize,
    pub test_rows: usize,
}

impl TrainSummary {
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.iter().find(|(k, _)| k == name).map(|(_, v)| *v)
    }
}

/// Run one training job against `client`, logging into `experiment_id`.
///
/// The run is marked `FINISHED` only on success; an error leaves it as the
/// backend last saw it.
pub async fn train(client: &dyn TrackingClient, experiment_id: &str, opts: &TrainOptions) -> Result<TrainSummary> {
    let data = load_csv(&opts.data_path, opts.delimiter)?;
    require_column(&data, &opts.label_col)?;

    let mut parts = random_split(&data, &SPLIT_WEIGHTS, opts.seed)?.into_iter();
    let (Some(train_set), Some(test_set)) = (parts.next(), parts.next()) else {
        return Err(WinetrackError::Other("Split produced fewer than two parts".to_string()));
    };
    if train_set.num_rows() == 0 || test_set.num_rows() == 0 {
        return Err(WinetrackError::EmptyDataset);
    }

    let run = client.create_run(experiment_id).await?;
    let run_id = run.run_id.as_str();
    info!(run_id, experiment_id, "Started run");

    client
        .set_tag(run_id, "dataPath", &opts.data_path.display().to_string())
        .await?;
    client.set_tag(run_id, "clientVersion", crate::VERSION).await?;
    client.set_tag(run_id, "mlflow.source.name", &opts.source_name).await?;

    info!(max_depth = opts.max_depth, max_bins = opts.max_bins, run_origin = %opts.run_origin, "Params");
    client.log_param(run_id, "maxDepth", &opts.max_depth.to_string()).await?;
    client.log_param(run_id, "maxBins", &opts.max_bins.to_string()).await?;
    client.log_param(run_id, "runOrigin", &opts.run_origin).await?;

    let regressor = DecisionTreeRegressor::new()
        .with_max_depth(opts.max_depth)
        .with_max_bins(opts.max_bins);
    let pipeline = Pipeline::for_label(&data, &opts.label_col, regressor)?;
    let model = fit_blocking(pipeline, train_set.clone()).await?;
    let predictions = model.transform(&test_set)?;

    let mut metrics = Vec::with_capacity(LOGGED_METRICS.len());
    for metric in LOGGED_METRICS {
        let value = RegressionEvaluator::new(&opts.label_col, metric)
            .with_prediction_col(PREDICTION_COL)
            .evaluate(&predictions)?;
        info!(metric = %metric, value, "Evaluated");
        client.log_metric(run_id, metric.name(), value).await?;
        metrics.push((metric.name().to_string(), value));
    }

    let scratch = tempfile::tempdir()?;
    let details = scratch.path().join(TREE_DETAILS_FILE);
    tokio::fs::write(&details, model.tree.to_debug_string()).await?;
    client.log_artifact(run_id, &details, Some(TREE_DETAILS_PATH)).await?;

    let native_dir = opts.model_path.join(NATIVE_MODEL_DIR);
    save_native(&model, &native_dir)?;
    client.log_artifacts(run_id, &native_dir, Some(NATIVE_MODEL_DIR)).await?;

    let bundle_dir = opts.model_path.join(BUNDLE_MODEL_DIR);
    save_bundle(&model, &bundle_dir)?;
    client.log_artifacts(run_id, &bundle_dir, Some(BUNDLE_ARTIFACT_PATH)).await?;

    client.set_terminated(run_id, RunStatus::Finished, now_millis()).await?;
    info!(run_id, depth = model.tree.depth(), nodes = model.tree.num_nodes(), "Run finished");

    Ok(TrainSummary {
        run_id: run.run_id.clone(),
        metrics,
        depth: model.tree.depth(),
        num_nodes: model.tree.num_nodes(),
        train_rows: train_set.num_rows(),
        test_rows: test_set.num_rows(),
    })
}

/// Fit on tokio's blocking pool; the split search fans out over rayon.
async fn fit_blocking(pipeline: Pipeline, train_set: RecordBatch) -> Result<PipelineModel> {
    tokio::task::spawn_blocking(move || pipeline.fit(&train_set))
        .await
        .map_err(|e| WinetrackError::Other(format!("Model fitting task failed: {e}")))?
}
