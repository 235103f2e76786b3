//! On-disk model formats.
//!
//! `native` is the directory layout this crate reads back; `bundle` is a
//! portable JSON bundle for tools that serve models outside this crate.

pub mod bundle;
pub mod native;

pub use bundle::save_bundle;
pub use native::{load_native, save_native};

use crate::error::{Result, WinetrackError};
use crate::tree::Node;

/// One tree node in pre-order, with children referenced by id.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatNode {
    pub id: i32,
    pub prediction: f64,
    pub impurity: f64,
    pub count: i64,
    /// `-1.0` for leaves.
    pub gain: f64,
    /// `-1` for leaves.
    pub left_child: i32,
    /// `-1` for leaves.
    pub right_child: i32,
    /// `-1` for leaves.
    pub feature_index: i32,
    pub threshold: f64,
}

impl FlatNode {
    pub fn is_leaf(&self) -> bool {
        self.left_child < 0
    }
}

/// Flatten a tree in pre-order; the root gets id 0.
pub fn flatten_tree(root: &Node) -> Vec<FlatNode> {
    let mut out = Vec::new();
    push_node(root, &mut out);
    out
}

fn push_node(node: &Node, out: &mut Vec<FlatNode>) -> i32 {
    let id = out.len() as i32;
    match node {
        Node::Leaf {
            prediction,
            impurity,
            count,
        } => out.push(FlatNode {
            id,
            prediction: *prediction,
            impurity: *impurity,
            count: *count as i64,
            gain: -1.0,
            left_child: -1,
            right_child: -1,
            feature_index: -1,
            threshold: 0.0,
        }),
        Node::Split {
            feature,
            threshold,
            gain,
            prediction,
            impurity,
            count,
            left,
            right,
        } => {
            out.push(FlatNode {
                id,
                prediction: *prediction,
                impurity: *impurity,
                count: *count as i64,
                gain: *gain,
                left_child: -1,
                right_child: -1,
                feature_index: *feature as i32,
                threshold: *threshold,
            });
            let left_id = push_node(left, out);
            let right_id = push_node(right, out);
            let slot = &mut out[id as usize];
            slot.left_child = left_id;
            slot.right_child = right_id;
        }
    }
    id
}

/// Rebuild a tree from nodes indexed by id.
pub fn unflatten_tree(nodes: &[FlatNode]) -> Result<Node> {
    let mut by_id: Vec<Option<&FlatNode>> = vec![None; nodes.len()];
    for node in nodes {
        let slot = usize::try_from(node.id)
            .ok()
            .and_then(|i| by_id.get_mut(i))
            .ok_or_else(|| WinetrackError::Other(format!("Node id {} out of range", node.id)))?;
        *slot = Some(node);
    }
    build_node(&by_id, 0, 0)
}

fn build_node(by_id: &[Option<&FlatNode>], id: i32, depth: usize) -> Result<Node> {
    if depth > crate::tree::MAX_SUPPORTED_DEPTH {
        return Err(WinetrackError::Other("Tree node table contains a cycle".to_string()));
    }
    let node = usize::try_from(id)
        .ok()
        .and_then(|i| by_id.get(i).copied().flatten())
        .ok_or_else(|| WinetrackError::Other(format!("Missing tree node {id}")))?;

    if node.is_leaf() {
        return Ok(Node::Leaf {
            prediction: node.prediction,
            impurity: node.impurity,
            count: node.count as usize,
        });
    }
    Ok(Node::Split {
        feature: node.feature_index as usize,
        threshold: node.threshold,
        gain: node.gain,
        prediction: node.prediction,
        impurity: node.impurity,
        count: node.count as usize,
        left: Box::new(build_node(by_id, node.left_child, depth + 1)?),
        right: Box::new(build_node(by_id, node.right_child, depth + 1)?),
    })
}
