//! Native pipeline directory: JSON metadata per stage plus a Parquet node table.
//!
//! ```text
//! metadata/part-00000
//! stages/0_<assembler uid>/metadata/part-00000
//! stages/1_<tree uid>/metadata/part-00000
//! stages/1_<tree uid>/data/part-00000.parquet
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Float64Array, Int32Array, Int64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{flatten_tree, unflatten_tree, FlatNode};
use crate::error::{Result, WinetrackError};
use crate::pipeline::{PipelineModel, VectorAssembler, PREDICTION_COL};
use crate::storage::{self, typed_column};
use crate::tree::{DecisionTreeRegressionModel, DecisionTreeRegressor};

const PIPELINE_CLASS: &str = "winetrack.pipeline.PipelineModel";
const ASSEMBLER_CLASS: &str = "winetrack.pipeline.VectorAssembler";
const TREE_CLASS: &str = "winetrack.tree.DecisionTreeRegressionModel";

#[derive(Debug, Serialize, Deserialize)]
struct Metadata {
    class: String,
    timestamp: i64,
    version: String,
    uid: String,
    #[serde(rename = "paramMap")]
    param_map: serde_json::Value,
    #[serde(rename = "numFeatures", default, skip_serializing_if = "Option::is_none")]
    num_features: Option<usize>,
}

impl Metadata {
    fn new(class: &str, uid: &str, param_map: serde_json::Value) -> Self {
        Self {
            class: class.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            version: crate::VERSION.to_string(),
            uid: uid.to_string(),
            param_map,
            num_features: None,
        }
    }

    fn expect_class(&self, class: &str) -> Result<()> {
        if self.class != class {
            return Err(WinetrackError::Other(format!(
                "Expected {class} metadata, found {}",
                self.class
            )));
        }
        Ok(())
    }

    fn param<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .param_map
            .get(key)
            .cloned()
            .ok_or_else(|| WinetrackError::Other(format!("{} metadata lacks '{key}'", self.class)))?;
        Ok(serde_json::from_value(value)?)
    }
}

fn metadata_path(dir: &Path) -> PathBuf {
    dir.join("metadata").join("part-00000")
}

fn stage_dir(dir: &Path, index: usize, uid: &str) -> PathBuf {
    dir.join("stages").join(format!("{index}_{uid}"))
}

fn node_table_path(stage: &Path) -> PathBuf {
    stage.join("data").join("part-00000.parquet")
}

/// Write `model` to `dir`, replacing anything already there.
pub fn save_native(model: &PipelineModel, dir: &Path) -> Result<()> {
    storage::reset_dir(dir)?;

    let stage_uids = model.stage_uids();
    storage::save_json(
        &metadata_path(dir),
        &Metadata::new(PIPELINE_CLASS, &model.uid, json!({ "stageUids": stage_uids })),
    )?;

    let assembler = &model.assembler;
    storage::save_json(
        &metadata_path(&stage_dir(dir, 0, &assembler.uid)),
        &Metadata::new(
            ASSEMBLER_CLASS,
            &assembler.uid,
            json!({ "inputCols": assembler.input_cols, "outputCol": assembler.output_col }),
        ),
    )?;

    let tree = &model.tree;
    let tree_dir = stage_dir(dir, 1, &tree.uid);
    let mut tree_meta = Metadata::new(
        TREE_CLASS,
        &tree.uid,
        json!({
            "maxDepth": tree.params.max_depth,
            "maxBins": tree.params.max_bins,
            "minInstancesPerNode": tree.params.min_instances_per_node,
            "minInfoGain": tree.params.min_info_gain,
            "labelCol": model.label_col,
            "featuresCol": assembler.output_col,
            "predictionCol": PREDICTION_COL,
        }),
    );
    tree_meta.num_features = Some(tree.num_features);
    storage::save_json(&metadata_path(&tree_dir), &tree_meta)?;
    storage::write_parquet(&node_table_path(&tree_dir), &nodes_to_batch(&flatten_tree(&tree.root))?)?;

    debug!(dir = %dir.display(), uid = %model.uid, "Saved native pipeline");
    Ok(())
}

/// Read a pipeline written by [`save_native`].
pub fn load_native(dir: &Path) -> Result<PipelineModel> {
    let meta: Metadata = storage::read_json(&metadata_path(dir))?;
    meta.expect_class(PIPELINE_CLASS)?;
    let stage_uids: Vec<String> = meta.param("stageUids")?;
    let [assembler_uid, tree_uid] = <[String; 2]>::try_from(stage_uids).map_err(|uids| {
        WinetrackError::Other(format!("Expected 2 pipeline stages, found {}", uids.len()))
    })?;

    let assembler_meta: Metadata = storage::read_json(&metadata_path(&stage_dir(dir, 0, &assembler_uid)))?;
    assembler_meta.expect_class(ASSEMBLER_CLASS)?;
    let assembler = VectorAssembler {
        uid: assembler_uid,
        input_cols: assembler_meta.param("inputCols")?,
        output_col: assembler_meta.param("outputCol")?,
    };

    let tree_dir = stage_dir(dir, 1, &tree_uid);
    let tree_meta: Metadata = storage::read_json(&metadata_path(&tree_dir))?;
    tree_meta.expect_class(TREE_CLASS)?;
    let params = DecisionTreeRegressor {
        max_depth: tree_meta.param("maxDepth")?,
        max_bins: tree_meta.param("maxBins")?,
        min_instances_per_node: tree_meta.param("minInstancesPerNode")?,
        min_info_gain: tree_meta.param("minInfoGain")?,
    };
    let num_features = tree_meta
        .num_features
        .ok_or_else(|| WinetrackError::Other("Tree metadata lacks numFeatures".to_string()))?;

    let batch = storage::read_parquet(&node_table_path(&tree_dir))?
        .ok_or_else(|| WinetrackError::Other("Tree node table is empty".to_string()))?;
    let root = unflatten_tree(&batch_to_nodes(&batch)?)?;

    Ok(PipelineModel {
        uid: meta.uid,
        label_col: tree_meta.param("labelCol")?,
        assembler,
        tree: DecisionTreeRegressionModel {
            uid: tree_uid,
            num_features,
            params,
            root,
        },
    })
}

fn node_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int32, false),
        Field::new("prediction", DataType::Float64, false),
        Field::new("impurity", DataType::Float64, false),
        Field::new("count", DataType::Int64, false),
        Field::new("gain", DataType::Float64, false),
        Field::new("leftChild", DataType::Int32, false),
        Field::new("rightChild", DataType::Int32, false),
        Field::new("featureIndex", DataType::Int32, false),
        Field::new("threshold", DataType::Float64, false),
    ]))
}

fn nodes_to_batch(nodes: &[FlatNode]) -> Result<RecordBatch> {
    Ok(RecordBatch::try_new(
        node_schema(),
        vec![
            Arc::new(Int32Array::from_iter_values(nodes.iter().map(|n| n.id))),
            Arc::new(Float64Array::from_iter_values(nodes.iter().map(|n| n.prediction))),
            Arc::new(Float64Array::from_iter_values(nodes.iter().map(|n| n.impurity))),
            Arc::new(Int64Array::from_iter_values(nodes.iter().map(|n| n.count))),
            Arc::new(Float64Array::from_iter_values(nodes.iter().map(|n| n.gain))),
            Arc::new(Int32Array::from_iter_values(nodes.iter().map(|n| n.left_child))),
            Arc::new(Int32Array::from_iter_values(nodes.iter().map(|n| n.right_child))),
            Arc::new(Int32Array::from_iter_values(nodes.iter().map(|n| n.feature_index))),
            Arc::new(Float64Array::from_iter_values(nodes.iter().map(|n| n.threshold))),
        ],
    )?)
}

fn batch_to_nodes(batch: &RecordBatch) -> Result<Vec<FlatNode>> {
    let id = typed_column::<Int32Array>(batch, "id")?;
    let prediction = typed_column::<Float64Array>(batch, "prediction")?;
    let impurity = typed_column::<Float64Array>(batch, "impurity")?;
    let count = typed_column::<Int64Array>(batch, "count")?;
    let gain = typed_column::<Float64Array>(batch, "gain")?;
    let left = typed_column::<Int32Array>(batch, "leftChild")?;
    let right = typed_column::<Int32Array>(batch, "rightChild")?;
    let feature = typed_column::<Int32Array>(batch, "featureIndex")?;
    let threshold = typed_column::<Float64Array>(batch, "threshold")?;

    Ok((0..batch.num_rows())
        .map(|i| FlatNode {
            id: id.value(i),
            prediction: prediction.value(i),
            impurity: impurity.value(i),
            count: count.value(i),
            gain: gain.value(i),
            left_child: left.value(i),
            right_child: right.value(i),
            feature_index: feature.value(i),
            threshold: threshold.value(i),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use tempfile::TempDir;

    fn training_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Float64, false),
            Field::new("b", DataType::Float64, false),
            Field::new("quality", DataType::Float64, false),
        ]));
        let a: Vec<f64> = (0..40).map(|i| i as f64).collect();
        let b: Vec<f64> = (0..40).map(|i| ((i * 7) % 11) as f64).collect();
        let y: Vec<f64> = a.iter().zip(&b).map(|(a, b)| if *a < 20.0 { 3.0 + b } else { 8.0 }).collect();
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Float64Array::from(a)),
                Arc::new(Float64Array::from(b)),
                Arc::new(Float64Array::from(y)),
            ],
        )
        .unwrap()
    }

    #[test]
    fn saved_model_loads_with_identical_predictions() {
        let batch = training_batch();
        let model = Pipeline::for_label(&batch, "quality", DecisionTreeRegressor::new().with_max_depth(4))
            .unwrap()
            .fit(&batch)
            .unwrap();

        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("spark-model");
        save_native(&model, &dir).unwrap();

        assert!(dir.join("metadata/part-00000").is_file());
        assert!(dir
            .join(format!("stages/1_{}/data/part-00000.parquet", model.tree.uid))
            .is_file());

        let loaded = load_native(&dir).unwrap();
        assert_eq!(loaded, model);
    }

    #[test]
    fn save_overwrites_previous_model() {
        let batch = training_batch();
        let pipeline = Pipeline::for_label(&batch, "quality", DecisionTreeRegressor::new()).unwrap();
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("spark-model");

        let first = pipeline.fit(&batch).unwrap();
        save_native(&first, &dir).unwrap();
        let second = pipeline.fit(&batch).unwrap();
        save_native(&second, &dir).unwrap();

        let stages = storage::list_subdirs(&dir.join("stages")).unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(load_native(&dir).unwrap().uid, second.uid);
    }
}
