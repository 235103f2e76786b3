//! Regression metrics over a predictions batch.

use std::fmt;
use std::str::FromStr;

use arrow::record_batch::RecordBatch;

use crate::dataset::column_as_f64;
use crate::error::{Result, WinetrackError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegressionMetric {
    Rmse,
    Mse,
    R2,
    Mae,
    /// Explained variance.
    Var,
}

impl RegressionMetric {
    pub fn name(&self) -> &'static str {
        match self {
            RegressionMetric::Rmse => "rmse",
            RegressionMetric::Mse => "mse",
            RegressionMetric::R2 => "r2",
            RegressionMetric::Mae => "mae",
            RegressionMetric::Var => "var",
        }
    }
}

impl fmt::Display for RegressionMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RegressionMetric {
    type Err = WinetrackError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rmse" => Ok(RegressionMetric::Rmse),
            "mse" => Ok(RegressionMetric::Mse),
            "r2" => Ok(RegressionMetric::R2),
            "mae" => Ok(RegressionMetric::Mae),
            "var" => Ok(RegressionMetric::Var),
            other => Err(WinetrackError::InvalidParam(format!(
                "Unknown regression metric: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegressionEvaluator {
    pub label_col: String,
    pub prediction_col: String,
    pub metric: RegressionMetric,
}

impl RegressionEvaluator {
    pub fn new(label_col: impl Into<String>, metric: RegressionMetric) -> Self {
        Self {
            label_col: label_col.into(),
            prediction_col: "prediction".to_string(),
            metric,
        }
    }

    pub fn with_prediction_col(mut self, col: impl Into<String>) -> Self {
        self.prediction_col = col.into();
        self
    }

    pub fn is_larger_better(&self) -> bool {
        matches!(self.metric, RegressionMetric::R2 | RegressionMetric::Var)
    }

    pub fn evaluate(&self, predictions: &RecordBatch) -> Result<f64> {
        let labels = column_as_f64(predictions, &self.label_col)?;
        let preds = column_as_f64(predictions, &self.prediction_col)?;
        compute(self.metric, &labels, &preds)
    }
}

/// Metric value for paired labels and predictions.
pub fn compute(metric: RegressionMetric, labels: &[f64], preds: &[f64]) -> Result<f64> {
    if labels.is_empty() {
        return Err(WinetrackError::EmptyDataset);
    }
    if labels.len() != preds.len() {
        return Err(WinetrackError::InvalidParam(format!(
            "{} labels but {} predictions",
            labels.len(),
            preds.len()
        )));
    }

    let n = labels.len() as f64;
    let label_mean = labels.iter().sum::<f64>() / n;
    let residuals = labels.iter().zip(preds).map(|(y, p)| y - p);
    let mse = residuals.clone().map(|r| r * r).sum::<f64>() / n;

    let value = match metric {
        RegressionMetric::Mse => mse,
        RegressionMetric::Rmse => mse.sqrt(),
        RegressionMetric::Mae => residuals.map(f64::abs).sum::<f64>() / n,
        RegressionMetric::R2 => {
            let ss_tot: f64 = labels.iter().map(|y| (y - label_mean).powi(2)).sum();
            1.0 - mse * n / ss_tot
        }
        RegressionMetric::Var => preds.iter().map(|p| (p - label_mean).powi(2)).sum::<f64>() / n,
    };
    Ok(value)
}
