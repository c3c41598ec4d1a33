// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    histogram::Histogram,
    split::{Split, SplitSignature},
    types::{DocId, TreeNodeId},
};
use serde::{Deserialize, Serialize};

/// Optional per-node diagnostics embedded in the serialized ensemble when
/// `--tree_debug_info` is set.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TreeNodeDebugInfo {
    /// Documents that reached this node during training.
    pub n_docs: DocId,
    /// Spread of the split that produced this node's children.
    pub spread: f64,
    /// Name of the feature this node splits on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub split_feature: Option<String>,
    /// Threshold of the split, in the feature's value domain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub split_threshold: Option<String>,
}

/// One node of a growing tree.
///
/// Children always sit at consecutive indices `(N, N + 1)` allocated at
/// split time, so only the left child id is stored.
#[derive(Debug)]
pub struct TreeNode {
    /// Index of this node in the tree's node array.
    pub node_id: TreeNodeId,
    /// Parent node, if any.
    pub parent: Option<TreeNodeId>,
    /// Left child; the right child is `left + 1`.
    pub left: Option<TreeNodeId>,
    /// Documents reaching this node, in ascending doc-id order.
    pub doc_ids: Vec<DocId>,
    /// Best split candidate found for this node.
    pub split: Option<Split>,
    /// Leaf value, set at finalize.
    pub leaf_value: f32,
    /// Per-feature histograms, computed lazily.
    pub histograms: Option<Vec<Option<Histogram>>>,
    /// Diagnostics for the serialized ensemble.
    pub debug_info: Option<TreeNodeDebugInfo>,
    /// Sum of gradients over `doc_ids`.
    pub sum_gradient: f64,
    /// Sum of hessians over `doc_ids` (Newton step only).
    pub sum_hessian: f64,
    /// The committed split's direction bitmap, kept while the children's
    /// histograms are being computed.
    pub split_signature: Option<SplitSignature>,
    /// Maps a document's position in this node to its position in the child
    /// it went to; kept alongside `split_signature`.
    pub split_mapping: Option<Vec<DocId>>,
}

impl TreeNode {
    fn new(node_id: TreeNodeId, parent: Option<TreeNodeId>, debug_info: bool) -> Self {
        Self {
            node_id,
            parent,
            left: None,
            doc_ids: Vec::new(),
            split: None,
            leaf_value: 0.0,
            histograms: None,
            debug_info: debug_info.then(TreeNodeDebugInfo::default),
            sum_gradient: 0.0,
            sum_hessian: 0.0,
            split_signature: None,
            split_mapping: None,
        }
    }

    /// Whether this node has no children.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.left.is_none()
    }

    /// The right child, if any.
    #[must_use]
    pub fn right(&self) -> Option<TreeNodeId> {
        self.left.map(|left| left + 1)
    }
}

/// A tree under construction: an append-only array of nodes, the root at
/// index 0 holding every document.
#[derive(Debug)]
pub struct Tree {
    nodes: Vec<TreeNode>,
    debug_info: bool,
}

impl Tree {
    /// Creates a single-root tree over `n_docs` documents.
    #[must_use]
    pub fn new(n_docs: DocId, debug_info: bool) -> Self {
        let mut root = TreeNode::new(0, None, debug_info);
        root.doc_ids = (0..n_docs).collect();

        Self {
            nodes: vec![root],
            debug_info,
        }
    }

    /// All nodes in creation order.
    #[must_use]
    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    /// Mutable access to all nodes.
    pub fn nodes_mut(&mut self) -> &mut [TreeNode] {
        &mut self.nodes
    }

    /// Borrows one node.
    #[must_use]
    pub fn node(&self, id: TreeNodeId) -> &TreeNode {
        &self.nodes[id as usize]
    }

    /// Mutably borrows one node.
    pub fn node_mut(&mut self, id: TreeNodeId) -> &mut TreeNode {
        &mut self.nodes[id as usize]
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// A tree always has at least its root.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Distance from `id` to the root.
    #[must_use]
    pub fn depth_of(&self, id: TreeNodeId) -> u32 {
        let mut depth = 0;
        let mut node = self.node(id);
        while let Some(parent) = node.parent {
            depth += 1;
            node = self.node(parent);
        }
        depth
    }

    /// Splits `node_id` along `signature`, appending the two children and
    /// partitioning the node's documents between them (bit 0 goes left).
    pub fn split_node(&mut self, node_id: TreeNodeId, signature: &SplitSignature) -> (TreeNodeId, TreeNodeId) {
        debug_assert_eq!(self.node(node_id).doc_ids.len(), signature.len() as usize);

        #[allow(clippy::cast_possible_truncation)]
        let left_id = self.nodes.len() as TreeNodeId;
        let right_id = left_id + 1;

        let mut left = TreeNode::new(left_id, Some(node_id), self.debug_info);
        let mut right = TreeNode::new(right_id, Some(node_id), self.debug_info);

        let mut cursor = signature.cursor(0);
        for &doc_id in &self.nodes[node_id as usize].doc_ids {
            if cursor.next(signature) == 0 {
                left.doc_ids.push(doc_id);
            } else {
                right.doc_ids.push(doc_id);
            }
        }

        self.nodes[node_id as usize].left = Some(left_id);
        self.nodes.push(left);
        self.nodes.push(right);

        (left_id, right_id)
    }
}

#[cfg(test)]
mod tests {
    use super::Tree;
    use crate::split::SplitSignature;
    use test_log::test;

    #[test]
    fn split_partitions_documents_in_order() {
        let mut tree = Tree::new(6, false);

        let mut signature = SplitSignature::new();
        for bit in [0u16, 1, 0, 1, 1, 0] {
            signature.push(bit);
        }
        signature.flush();

        let (left, right) = tree.split_node(0, &signature);
        assert_eq!((1, 2), (left, right));
        assert_eq!(vec![0, 2, 5], tree.node(left).doc_ids);
        assert_eq!(vec![1, 3, 4], tree.node(right).doc_ids);
        assert_eq!(Some(right), tree.node(0).right());
        assert!(!tree.node(0).is_leaf());
        assert_eq!(1, tree.depth_of(left));
    }
}
