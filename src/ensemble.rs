// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    metadata::FeatureMetadata,
    tree::{Tree, TreeNodeDebugInfo},
    types::{Bucket, FeatureIndex, TreeNodeId},
};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// A serialized split: the threshold is the decimal text of the actual
/// feature-domain value, so the file is interpretable without the
/// bucketizer.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SplitLite {
    /// Index into the ensemble's feature list.
    pub feature: FeatureIndex,
    /// Threshold in the feature's value domain, as text.
    pub threshold: String,
    /// Whether the `>=` comparison is flipped.
    pub inverse: bool,

    /// The threshold re-parsed under the feature's declared type, widened
    /// to `f64`. Filled by [`Ensemble::validate`].
    #[serde(skip)]
    pub threshold_value: f64,
}

/// A serialized tree node: a leaf carries a value, an internal node its
/// children and split.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum NodeLite {
    /// Leaf node
    Leaf {
        /// The leaf's contribution to the model score.
        value: f32,
        /// Training diagnostics, if `--tree_debug_info` was set.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        debug_info: Option<TreeNodeDebugInfo>,
    },
    /// Internal node
    Internal {
        /// Left child index.
        left_id: TreeNodeId,
        /// Right child index.
        right_id: TreeNodeId,
        /// The node's split.
        split: SplitLite,
        /// Training diagnostics, if `--tree_debug_info` was set.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        debug_info: Option<TreeNodeDebugInfo>,
    },
}

/// A frozen tree: the node array with all training state stripped.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(transparent)]
pub struct TreeLite {
    /// Nodes in creation order; the root is node 0.
    pub nodes: Vec<NodeLite>,
}

impl TreeLite {
    /// Freezes a grown tree, rendering thresholds through
    /// `threshold_string` (bucket index to feature-domain text).
    pub fn from_tree(
        tree: &mut Tree,
        threshold_string: impl Fn(FeatureIndex, Bucket) -> String,
    ) -> crate::Result<Self> {
        let mut nodes = Vec::with_capacity(tree.len());

        for id in 0..tree.len() {
            #[allow(clippy::cast_possible_truncation)]
            let node = tree.node_mut(id as TreeNodeId);
            let debug_info = node.debug_info.take();

            if let Some(left_id) = node.left {
                let split = node.split.as_ref().ok_or_else(|| {
                    crate::Error::Train("an internal node lost its split".into())
                })?;

                nodes.push(NodeLite::Internal {
                    left_id,
                    right_id: left_id + 1,
                    split: SplitLite {
                        feature: split.feature,
                        threshold: threshold_string(split.feature, split.threshold),
                        inverse: split.inverse,
                        threshold_value: 0.0,
                    },
                    debug_info,
                });
            } else {
                nodes.push(NodeLite::Leaf {
                    value: node.leaf_value,
                    debug_info,
                });
            }
        }

        Ok(Self { nodes })
    }

    /// Walks the tree for one document's feature values (widened to `f64`).
    /// Requires a validated ensemble.
    #[must_use]
    pub fn evaluate(&self, values: &[f64]) -> f32 {
        let mut current = 0usize;

        loop {
            match &self.nodes[current] {
                NodeLite::Leaf { value, .. } => return *value,
                NodeLite::Internal {
                    left_id,
                    right_id,
                    split,
                    ..
                } => {
                    let mut condition = values[split.feature as usize] >= split.threshold_value;
                    if split.inverse {
                        condition = !condition;
                    }
                    let next = if condition { *right_id } else { *left_id };
                    current = next as usize;
                }
            }
        }
    }
}

/// A trained model: the cost function it was trained under, the feature
/// table, and the trees.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Ensemble {
    /// Cost function name, e.g. `regression`.
    pub cost_function: String,
    /// Features in training order.
    pub features: Vec<FeatureMetadata>,
    /// Trees in training order.
    pub trees: Vec<TreeLite>,
}

impl Ensemble {
    /// Checks structural integrity and re-parses every threshold under its
    /// feature's declared type.
    pub fn validate(&mut self) -> crate::Result<()> {
        let features = &self.features;

        for tree in &mut self.trees {
            let n_nodes = tree.nodes.len();
            for node in &mut tree.nodes {
                let NodeLite::Internal {
                    left_id,
                    right_id,
                    split,
                    ..
                } = node
                else {
                    continue;
                };

                if *left_id as usize >= n_nodes || *right_id as usize >= n_nodes {
                    return Err(crate::Error::CorruptEnsemble(format!(
                        "child id out of range: {left_id}/{right_id}"
                    )));
                }

                let meta = features.get(split.feature as usize).ok_or_else(|| {
                    crate::Error::CorruptEnsemble(format!(
                        "split references unknown feature {}",
                        split.feature
                    ))
                })?;

                split.threshold_value = meta.parse_value(&split.threshold).map_err(|_| {
                    crate::Error::CorruptEnsemble(format!(
                        "threshold '{}' does not parse as {} (feature '{}')",
                        split.threshold, meta.feature_type, meta.name
                    ))
                })?;
            }
        }

        Ok(())
    }

    /// Names of all features, in order.
    #[must_use]
    pub fn feature_names(&self) -> Vec<String> {
        self.features.iter().map(|f| f.name.clone()).collect()
    }
}

/// Accumulates the ensemble during training and writes it out atomically on
/// close.
pub struct TreeWriter {
    path: PathBuf,
    ensemble: Ensemble,
    closed: bool,
}

impl TreeWriter {
    /// Creates a writer targeting `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ensemble: Ensemble::default(),
            closed: false,
        }
    }

    /// Records the cost function name.
    pub fn set_cost_function(&mut self, name: impl Into<String>) {
        self.ensemble.cost_function = name.into();
    }

    /// Appends one feature's metadata.
    pub fn add_feature(&mut self, feature: FeatureMetadata) {
        self.ensemble.features.push(feature);
    }

    /// Appends one frozen tree.
    pub fn add_tree(&mut self, tree: TreeLite) {
        self.ensemble.trees.push(tree);
    }

    /// Seeds the writer with a previously trained ensemble's trees (warm
    /// start).
    pub fn seed_trees(&mut self, trees: Vec<TreeLite>) {
        debug_assert!(self.ensemble.trees.is_empty());
        self.ensemble.trees = trees;
    }

    /// Serializes the ensemble to the target path via a temp file in the
    /// same directory, so the output is never observable half-written.
    pub fn close(&mut self) -> crate::Result<()> {
        debug_assert!(!self.closed);
        self.closed = true;

        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut file = tempfile::NamedTempFile::new_in(parent)?;
        serde_json::to_writer_pretty(&mut file, &self.ensemble)?;
        file.write_all(b"\n")?;
        file.persist(&self.path)
            .map_err(|e| crate::Error::Io(e.error))?;

        log::info!("Wrote ensemble to {}", self.path.display());
        Ok(())
    }
}

/// Loads and validates an ensemble JSON file.
pub fn load_ensemble(path: impl AsRef<Path>) -> crate::Result<Ensemble> {
    let file = std::fs::File::open(path)?;
    let mut ensemble: Ensemble = serde_json::from_reader(std::io::BufReader::new(file))?;
    ensemble.validate()?;
    Ok(ensemble)
}

#[cfg(test)]
mod tests {
    use super::{Ensemble, NodeLite, SplitLite, TreeLite};
    use crate::metadata::FeatureMetadata;
    use crate::types::RawFeatureType;
    use test_log::test;

    fn stump(threshold: &str, inverse: bool) -> TreeLite {
        TreeLite {
            nodes: vec![
                NodeLite::Internal {
                    left_id: 1,
                    right_id: 2,
                    split: SplitLite {
                        feature: 0,
                        threshold: threshold.into(),
                        inverse,
                        threshold_value: 0.0,
                    },
                    debug_info: None,
                },
                NodeLite::Leaf {
                    value: -1.0,
                    debug_info: None,
                },
                NodeLite::Leaf {
                    value: 1.0,
                    debug_info: None,
                },
            ],
        }
    }

    fn ensemble_of(tree: TreeLite) -> Ensemble {
        Ensemble {
            cost_function: "regression".into(),
            features: vec![FeatureMetadata::new("x", RawFeatureType::Uint8)],
            trees: vec![tree],
        }
    }

    #[test]
    fn json_round_trip_preserves_structure() {
        let mut ensemble = ensemble_of(stump("5", false));
        ensemble.validate().unwrap();

        let json = serde_json::to_string_pretty(&ensemble).unwrap();
        let mut loaded: Ensemble = serde_json::from_str(&json).unwrap();
        loaded.validate().unwrap();

        assert_eq!("regression", loaded.cost_function);
        assert_eq!(ensemble.features, loaded.features);
        assert!((loaded.trees[0].evaluate(&[7.0]) - 1.0).abs() < f32::EPSILON);
        assert!((loaded.trees[0].evaluate(&[3.0]) + 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn inverse_split_flips_direction() {
        let mut ensemble = ensemble_of(stump("5", true));
        ensemble.validate().unwrap();
        assert!((ensemble.trees[0].evaluate(&[7.0]) + 1.0).abs() < f32::EPSILON);
        assert!((ensemble.trees[0].evaluate(&[3.0]) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn bad_threshold_is_corrupt() {
        let mut ensemble = ensemble_of(stump("300", false));
        assert!(ensemble.validate().is_err());

        let mut ensemble = ensemble_of(stump("abc", false));
        assert!(ensemble.validate().is_err());
    }

    #[test]
    fn leaf_and_internal_nodes_deserialize_untagged() {
        let json = r#"{
            "cost_function": "regression",
            "features": [{"name": "x", "type": "float"}],
            "trees": [[
                {"left_id": 1, "right_id": 2,
                 "split": {"feature": 0, "threshold": "0.5", "inverse": false}},
                {"value": 0.25},
                {"value": -0.25}
            ]]
        }"#;

        let mut ensemble: Ensemble = serde_json::from_str(json).unwrap();
        ensemble.validate().unwrap();
        assert!((ensemble.trees[0].evaluate(&[0.75]) - 0.25).abs() < f32::EPSILON);
    }
}
