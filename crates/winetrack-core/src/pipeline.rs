//! Two-stage pipeline: vector assembler followed by a decision-tree regressor.

use std::sync::Arc;

use arrow::array::Float64Array;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dataset::{finite_column, require_column};
use crate::error::{Result, WinetrackError};
use crate::tree::{DecisionTreeRegressionModel, DecisionTreeRegressor};

pub const FEATURES_COL: &str = "features";
pub const PREDICTION_COL: &str = "prediction";

/// Concatenates numeric input columns into one feature matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorAssembler {
    pub uid: String,
    pub input_cols: Vec<String>,
    pub output_col: String,
}

impl VectorAssembler {
    pub fn new(input_cols: Vec<String>) -> Self {
        Self {
            uid: crate::new_uid("vecAssembler"),
            input_cols,
            output_col: FEATURES_COL.to_string(),
        }
    }

    /// Rows × input columns, in `input_cols` order. NaN or infinite inputs are rejected.
    pub fn assemble(&self, batch: &RecordBatch) -> Result<Array2<f64>> {
        let columns = self
            .input_cols
            .iter()
            .map(|name| finite_column(batch, name))
            .collect::<Result<Vec<_>>>()?;
        let n_rows = batch.num_rows();
        Ok(Array2::from_shape_fn((n_rows, columns.len()), |(r, c)| columns[c][r]))
    }
}

/// Unfitted pipeline.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub assembler: VectorAssembler,
    pub label_col: String,
    pub regressor: DecisionTreeRegressor,
}

impl Pipeline {
    pub fn new(assembler: VectorAssembler, label_col: impl Into<String>, regressor: DecisionTreeRegressor) -> Self {
        Self {
            assembler,
            label_col: label_col.into(),
            regressor,
        }
    }

    /// Assemble every column except `label_col` into features.
    pub fn for_label(batch: &RecordBatch, label_col: &str, regressor: DecisionTreeRegressor) -> Result<Self> {
        require_column(batch, label_col)?;
        let feature_cols: Vec<String> = batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .filter(|name| name != label_col)
            .collect();
        if feature_cols.is_empty() {
            return Err(WinetrackError::InvalidParam(format!(
                "No feature columns besides label '{label_col}'"
            )));
        }
        Ok(Self::new(VectorAssembler::new(feature_cols), label_col, regressor))
    }

    pub fn fit(&self, train: &RecordBatch) -> Result<PipelineModel> {
        if train.num_rows() == 0 {
            return Err(WinetrackError::EmptyDataset);
        }
        let x = self.assembler.assemble(train)?;
        let y = Array1::from_vec(finite_column(train, &self.label_col)?);
        debug!(rows = x.nrows(), features = x.ncols(), "Fitting decision tree");
        let tree = self.regressor.fit(&x, &y)?;

        Ok(PipelineModel {
            uid: crate::new_uid("pipeline"),
            label_col: self.label_col.clone(),
            assembler: self.assembler.clone(),
            tree,
        })
    }
}

/// Fitted pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineModel {
    pub uid: String,
    pub label_col: String,
    pub assembler: VectorAssembler,
    pub tree: DecisionTreeRegressionModel,
}

impl PipelineModel {
    /// Append a `prediction` column to `batch`.
    pub fn transform(&self, batch: &RecordBatch) -> Result<RecordBatch> {
        let x = self.assembler.assemble(batch)?;
        let predictions = self.tree.predict(&x)?;

        let schema = batch.schema();
        let mut fields: Vec<Field> = schema.fields().iter().map(|f| f.as_ref().clone()).collect();
        fields.push(Field::new(PREDICTION_COL, DataType::Float64, false));

        let mut columns = batch.columns().to_vec();
        columns.push(Arc::new(Float64Array::from(predictions.to_vec())));

        Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
    }

    /// Stage uids in execution order.
    pub fn stage_uids(&self) -> [&str; 2] {
        [self.assembler.uid.as_str(), self.tree.uid.as_str()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::column_as_f64;
    use arrow::array::Int64Array;

    fn wine_like() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("alcohol", DataType::Float64, false),
            Field::new("quality", DataType::Int64, false),
            Field::new("sulphates", DataType::Float64, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Float64Array::from(vec![9.0, 9.5, 12.0, 12.5])),
                Arc::new(Int64Array::from(vec![5, 5, 7, 7])),
                Arc::new(Float64Array::from(vec![0.5, 0.6, 0.5, 0.6])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn assembler_skips_label_and_keeps_order() {
        let batch = wine_like();
        let pipeline = Pipeline::for_label(&batch, "quality", DecisionTreeRegressor::new()).unwrap();
        assert_eq!(pipeline.assembler.input_cols, vec!["alcohol", "sulphates"]);
        assert_eq!(pipeline.assembler.output_col, "features");

        let x = pipeline.assembler.assemble(&batch).unwrap();
        assert_eq!(x.dim(), (4, 2));
        assert_eq!(x[[2, 0]], 12.0);
        assert_eq!(x[[1, 1]], 0.6);
    }

    #[test]
    fn missing_label_is_an_error() {
        let err = Pipeline::for_label(&wine_like(), "score", DecisionTreeRegressor::new()).unwrap_err();
        assert!(matches!(err, WinetrackError::ColumnNotFound(c) if c == "score"));
    }

    #[test]
    fn transform_appends_prediction() {
        let batch = wine_like();
        let model = Pipeline::for_label(&batch, "quality", DecisionTreeRegressor::new())
            .unwrap()
            .fit(&batch)
            .unwrap();

        let out = model.transform(&batch).unwrap();
        assert_eq!(out.num_columns(), 4);
        assert_eq!(out.schema().field(3).name(), "prediction");
        assert_eq!(column_as_f64(&out, "prediction").unwrap(), vec![5.0, 5.0, 7.0, 7.0]);
        assert!(model.uid.starts_with("pipeline_"));
        assert!(model.stage_uids()[0].starts_with("vecAssembler_"));
    }

    fn with_nan_feature() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("x", DataType::Float64, false),
            Field::new("quality", DataType::Float64, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Float64Array::from(vec![1.0, 2.0, f64::NAN, f64::NAN, 8.0, 9.0])),
                Arc::new(Float64Array::from(vec![1.0, 1.0, 1.0, 1.0, 9.0, 9.0])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn nan_features_are_rejected_on_fit_and_transform() {
        let batch = with_nan_feature();
        let pipeline = Pipeline::for_label(&batch, "quality", DecisionTreeRegressor::new()).unwrap();
        let err = pipeline.fit(&batch).unwrap_err();
        assert!(matches!(
            err,
            WinetrackError::NonFiniteValue { ref column, row: 2, .. } if column == "x"
        ));

        let clean = batch.slice(4, 2);
        let model = pipeline.fit(&batch.slice(0, 2)).unwrap();
        assert!(model.transform(&clean).is_ok());
        assert!(model.transform(&batch).is_err());
    }

    #[test]
    fn infinite_label_is_rejected() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("x", DataType::Float64, false),
            Field::new("quality", DataType::Float64, false),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Float64Array::from(vec![1.0, 2.0])),
                Arc::new(Float64Array::from(vec![1.0, f64::INFINITY])),
            ],
        )
        .unwrap();
        let err = Pipeline::for_label(&batch, "quality", DecisionTreeRegressor::new())
            .unwrap()
            .fit(&batch)
            .unwrap_err();
        assert!(matches!(err, WinetrackError::NonFiniteValue { row: 1, .. }));
    }
}
