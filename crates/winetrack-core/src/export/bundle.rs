//! Portable JSON bundle of a fitted pipeline.

use std::path::Path;

use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::error::Result;
use crate::pipeline::{PipelineModel, PREDICTION_COL};
use crate::storage;
use crate::tree::Node;

const BUNDLE_FORMAT: &str = "json";

#[derive(Debug, Serialize)]
struct BundleInfo<'a> {
    uid: String,
    name: &'a str,
    format: &'static str,
    version: &'static str,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct Port<'a> {
    name: &'a str,
    port: String,
}

#[derive(Debug, Serialize)]
struct NodeShape<'a> {
    name: &'a str,
    shape: Shape<'a>,
}

#[derive(Debug, Serialize)]
struct Shape<'a> {
    inputs: Vec<Port<'a>>,
    outputs: Vec<Port<'a>>,
}

#[derive(Debug, Serialize)]
struct TreeNodes {
    nodes: Vec<TreeNode>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum TreeNode {
    Internal { split: Split },
    Leaf { values: Vec<f64> },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum Split {
    Continuous {
        #[serde(rename = "featureIndex")]
        feature_index: usize,
        threshold: f64,
    },
}

fn collect_nodes(node: &Node, out: &mut Vec<TreeNode>) {
    match node {
        Node::Leaf { prediction, .. } => out.push(TreeNode::Leaf {
            values: vec![*prediction],
        }),
        Node::Split {
            feature,
            threshold,
            left,
            right,
            ..
        } => {
            out.push(TreeNode::Internal {
                split: Split::Continuous {
                    feature_index: *feature,
                    threshold: *threshold,
                },
            });
            collect_nodes(left, out);
            collect_nodes(right, out);
        }
    }
}

fn string_list(values: &[&str]) -> serde_json::Value {
    json!({ "type": { "type": "list", "base": "string" }, "value": values })
}

/// Write `model` as a JSON bundle under `dir`, replacing anything already there.
pub fn save_bundle(model: &PipelineModel, dir: &Path) -> Result<()> {
    storage::reset_dir(dir)?;
    let root = dir.join("root");
    let assembler = &model.assembler;
    let tree = &model.tree;

    storage::save_json(
        &dir.join("bundle.json"),
        &BundleInfo {
            uid: uuid::Uuid::new_v4().to_string(),
            name: &model.uid,
            format: BUNDLE_FORMAT,
            version: crate::VERSION,
            timestamp: chrono::Utc::now().to_rfc3339(),
        },
    )?;

    storage::save_json(
        &root.join("model.json"),
        &json!({
            "op": "pipeline",
            "attributes": { "nodes": string_list(&model.stage_uids()) },
        }),
    )?;
    storage::save_json(
        &root.join("node.json"),
        &NodeShape {
            name: &model.uid,
            shape: Shape {
                inputs: vec![],
                outputs: vec![],
            },
        },
    )?;

    let assembler_dir = root.join(format!("{}.node", assembler.uid));
    let input_cols: Vec<&str> = assembler.input_cols.iter().map(String::as_str).collect();
    storage::save_json(
        &assembler_dir.join("model.json"),
        &json!({
            "op": "vector_assembler",
            "attributes": { "input_cols": string_list(&input_cols) },
        }),
    )?;
    storage::save_json(
        &assembler_dir.join("node.json"),
        &NodeShape {
            name: &assembler.uid,
            shape: Shape {
                inputs: input_cols
                    .iter()
                    .enumerate()
                    .map(|(i, name)| Port {
                        name: *name,
                        port: format!("input{i}"),
                    })
                    .collect(),
                outputs: vec![Port {
                    name: &assembler.output_col,
                    port: "output".to_string(),
                }],
            },
        },
    )?;

    let tree_dir = root.join(format!("{}.node", tree.uid));
    storage::save_json(
        &tree_dir.join("model.json"),
        &json!({
            "op": "decision_tree_regression",
            "attributes": {
                "num_features": { "long": tree.num_features },
                "max_depth": { "long": tree.params.max_depth },
            },
        }),
    )?;
    storage::save_json(
        &tree_dir.join("node.json"),
        &NodeShape {
            name: &tree.uid,
            shape: Shape {
                inputs: vec![Port {
                    name: &assembler.output_col,
                    port: "features".to_string(),
                }],
                outputs: vec![Port {
                    name: PREDICTION_COL,
                    port: "prediction".to_string(),
                }],
            },
        },
    )?;
    let mut nodes = Vec::with_capacity(tree.num_nodes());
    collect_nodes(&tree.root, &mut nodes);
    let count = nodes.len();
    storage::save_json(&tree_dir.join("tree.json"), &TreeNodes { nodes })?;

    debug!(dir = %dir.display(), nodes = count, "Saved model bundle");
    Ok(())
}
