// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    compact_vector::CompactVector,
    types::{Bucket, FeatureIndex, TreeNodeId},
};

/// Bitmap over a node's document list: 0 = goes left, 1 = goes right.
pub type SplitSignature = CompactVector<1>;

/// A candidate (or committed) split of one tree node.
///
/// When `inverse` is false, documents with `bucket >= threshold` go right;
/// when it is true the comparison is flipped, which keeps the left child at
/// least as large as the right one.
#[derive(Clone, Debug, PartialEq)]
pub struct Split {
    /// Split score; negative means "no viable split found".
    pub spread: f64,
    /// Feature the split tests.
    pub feature: FeatureIndex,
    /// Node being split.
    pub node: TreeNodeId,
    /// Bucket index separating the sides.
    pub threshold: Bucket,
    /// Whether the comparison is flipped.
    pub inverse: bool,
}

impl Split {
    /// An empty candidate for `node`, to be beaten by any real split.
    #[must_use]
    pub fn none(node: TreeNodeId) -> Self {
        Self {
            spread: -1.0,
            feature: 0,
            node,
            threshold: 0,
            inverse: false,
        }
    }

    /// Whether this candidate is worth splitting on.
    #[must_use]
    pub fn is_viable(&self) -> bool {
        self.spread > 0.0
    }
}
