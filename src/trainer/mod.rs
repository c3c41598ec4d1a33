// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The training driver: owns the shared state, the features and the cost
//! function, and sequences node splits.
//!
//! The driver is sequential at the node-split granularity; inside one
//! (node, sibling) batch the per-feature histogram tasks run in parallel on
//! the pool and hand their results back over a channel. Workers only ever
//! read the shared [`TrainerData`] (and mutate their own feature under its
//! mutex); every write to documents and tree nodes happens on the driver
//! between batches.

pub mod data;

use crate::{
    cost::{AnyCostFunction, CostFunction},
    ensemble::TreeLite,
    feature::Feature,
    histogram::Histogram,
    pool::ThreadPool,
    split::{Split, SplitSignature},
    tree::Tree,
    types::{Bucket, DocId, TreeNodeId},
};
use data::TrainerData;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// Knobs of the split search and leaf-value computation.
#[derive(Clone, Copy, Debug)]
pub struct TrainerParams {
    /// Weight histograms by hessian instead of document count.
    pub newton_step: bool,
    /// Use the quadratic (variance-reduction) spread formula.
    pub quadratic_spread: bool,
    /// Regularization term, applied under quadratic spread only.
    pub regularization_lambda: f32,
    /// Minimum documents per side of a split (gradient step).
    pub min_node_docs: DocId,
    /// Minimum hessian mass per side of a split (Newton step).
    pub min_node_hessian: f32,
    /// Record per-node diagnostics into the ensemble.
    pub tree_debug_info: bool,
}

impl Default for TrainerParams {
    fn default() -> Self {
        Self {
            newton_step: true,
            quadratic_spread: true,
            regularization_lambda: 1.0,
            min_node_docs: 1,
            min_node_hessian: 1.0,
            tree_debug_info: false,
        }
    }
}

struct FeatureTaskResult {
    hist: Histogram,
    best: (f64, Bucket),
    sibling: Option<(Histogram, (f64, Bucket))>,
}

/// Scans one histogram's prefix sums for the best threshold.
///
/// Returns `(spread, bucket)`; a negative spread means no split cleared the
/// minimum-weight constraint.
fn find_best_split(
    hist: &Histogram,
    total_gradient: f64,
    total_weight: f64,
    params: &TrainerParams,
) -> (f64, Bucket) {
    let lambda = if params.quadratic_spread {
        f64::from(params.regularization_lambda)
    } else {
        0.0
    };
    let min_weight = if params.newton_step {
        f64::from(params.min_node_hessian)
    } else {
        f64::from(params.min_node_docs)
    };

    let mut best_spread = -1.0f64;
    let mut best_bucket: Bucket = 0;

    let mut left_weight = 0.0f64;
    let mut left_gradient = 0.0f64;

    for (i, item) in hist.data.iter().enumerate().take(hist.data.len() - 1) {
        left_weight += item.weight;
        left_gradient += item.gradient;
        let right_weight = total_weight - left_weight;
        let right_gradient = total_gradient - left_gradient;

        if left_weight < min_weight || right_weight < min_weight {
            continue;
        }

        let left_mean = left_gradient / (left_weight + lambda);
        let right_mean = right_gradient / (right_weight + lambda);

        let spread = if params.quadratic_spread {
            left_mean * left_gradient + right_mean * right_gradient
                - (total_gradient / total_weight) * total_gradient
        } else {
            (left_mean - right_mean).abs()
        };

        if spread > best_spread {
            best_spread = spread;
            #[allow(clippy::cast_possible_truncation)]
            {
                best_bucket = (i + 1) as Bucket;
            }
        }
    }

    (best_spread, best_bucket)
}

/// The training engine for one run.
pub struct Trainer {
    data: Arc<RwLock<TrainerData>>,
    features: Vec<Arc<Mutex<Box<dyn Feature>>>>,
    pool: Arc<ThreadPool>,
    cost: AnyCostFunction,
    params: TrainerParams,
}

impl Trainer {
    /// Creates an empty trainer.
    #[must_use]
    pub fn new(cost: AnyCostFunction, pool: Arc<ThreadPool>, params: TrainerParams) -> Self {
        Self {
            data: Arc::new(RwLock::new(TrainerData::default())),
            features: Vec::new(),
            pool,
            cost,
            params,
        }
    }

    /// Installs the document array.
    pub fn load_documents(&self, labels: &[f32], query_limits: Vec<DocId>) {
        *self.data.write() = TrainerData::new(labels, query_limits);
    }

    /// Appends a cooked feature.
    pub fn add_feature(&mut self, feature: Box<dyn Feature>) {
        self.features.push(Arc::new(Mutex::new(feature)));
    }

    /// Number of features.
    #[must_use]
    pub fn n_features(&self) -> usize {
        self.features.len()
    }

    /// The shared training state.
    #[must_use]
    pub fn data(&self) -> &Arc<RwLock<TrainerData>> {
        &self.data
    }

    /// The training parameters.
    #[must_use]
    pub fn params(&self) -> &TrainerParams {
        &self.params
    }

    /// One-time cost-function setup.
    pub fn start_ensemble(&self) {
        self.cost.precompute(&mut self.data.write());
    }

    /// Opens a new tree: a fresh root over all documents, shard bookkeeping,
    /// and recomputed gradients.
    pub fn start_new_tree(&self) -> crate::Result<()> {
        {
            let mut guard = self.data.write();
            debug_assert!(guard.current_tree.is_none());
            let n_docs = guard.n_docs();
            guard.current_tree = Some(Tree::new(n_docs, self.params.tree_debug_info));
            guard.shard_map.on_start_new_tree();
        }

        self.cost
            .compute_gradient_pooled(&self.data, self.params.newton_step, &self.pool)?;

        #[cfg(debug_assertions)]
        {
            let guard = self.data.read();
            for doc in &guard.documents {
                debug_assert!(doc.gradient.is_finite());
                if self.params.newton_step {
                    debug_assert!(doc.hessian.is_finite());
                    debug_assert!(doc.hessian >= 0.0);
                }
            }
        }

        Ok(())
    }

    /// Computes all per-feature histograms and best splits for `node` (and,
    /// by parent-minus-node subtraction, for its sibling).
    ///
    /// `node` is the right child of the previous split; `last_signature` is
    /// that split's direction bitmap, which the sharded sparse features
    /// consume while repartitioning their streams.
    pub fn compute_histograms(
        &self,
        node: TreeNodeId,
        sibling: Option<TreeNodeId>,
        last_signature: Option<SplitSignature>,
    ) -> crate::Result<()> {
        let n_features = self.features.len();

        let (node_totals, sibling_totals) = {
            let mut guard = self.data.write();
            self.prepare_node_batch(&mut guard, node, sibling, last_signature)?
        };

        let (tx, rx) = crossbeam_channel::unbounded::<(usize, crate::Result<FeatureTaskResult>)>();
        let newton_step = self.params.newton_step;
        let params = self.params;

        for (index, feature) in self.features.iter().enumerate() {
            let data = Arc::clone(&self.data);
            let feature = Arc::clone(feature);
            let tx = tx.clone();

            self.pool.execute(move || {
                let result = (|| -> crate::Result<FeatureTaskResult> {
                    let guard = data.read();
                    let mut feature = feature.lock();

                    let hist = feature.compute_histogram(node, newton_step, &guard)?;
                    let best = find_best_split(&hist, node_totals.0, node_totals.1, &params);

                    let sibling_part = if let Some(sibling) = sibling {
                        // The parent's histogram was moved into the sibling's
                        // slot before this batch; subtract to derive the
                        // sibling's own histogram.
                        let parent_hist = guard
                            .node(sibling)
                            .histograms
                            .as_ref()
                            .and_then(|h| h[index].as_ref())
                            .ok_or_else(|| {
                                crate::Error::Train("parent histogram is missing".into())
                            })?;

                        let mut sibling_hist = parent_hist.clone();
                        sibling_hist.subtract(&hist, newton_step);
                        let sibling_best =
                            find_best_split(&sibling_hist, sibling_totals.0, sibling_totals.1, &params);
                        Some((sibling_hist, sibling_best))
                    } else {
                        None
                    };

                    Ok(FeatureTaskResult {
                        hist,
                        best,
                        sibling: sibling_part,
                    })
                })();

                let _ = tx.send((index, result));
            })?;
        }
        drop(tx);

        let mut results: Vec<Option<FeatureTaskResult>> = (0..n_features).map(|_| None).collect();
        let mut first_error = None;
        for _ in 0..n_features {
            let Some((index, result)) = rx.recv().ok() else {
                break;
            };
            match result {
                Ok(result) => results[index] = Some(result),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        self.commit_node_batch(node, sibling, results)
    }

    /// Pre-batch bookkeeping under the write lock: histogram slots, the
    /// parent-to-child position mapping, and node gradient totals.
    fn prepare_node_batch(
        &self,
        guard: &mut TrainerData,
        node: TreeNodeId,
        sibling: Option<TreeNodeId>,
        last_signature: Option<SplitSignature>,
    ) -> crate::Result<((f64, f64), (f64, f64))> {
        let n_features = self.features.len();
        let empty_slots = || (0..n_features).map(|_| None).collect::<Vec<Option<Histogram>>>();

        let parent = guard.node(node).parent;

        {
            let tree = guard.tree_mut();
            let entry = tree.node_mut(node);
            entry.histograms = Some(empty_slots());
            entry.split = None;
        }

        if let Some(sibling) = sibling {
            let parent = parent
                .ok_or_else(|| crate::Error::Train("sibling batch without a parent".into()))?;
            let signature = last_signature
                .ok_or_else(|| crate::Error::Train("sibling batch without a signature".into()))?;

            let tree = guard.tree_mut();
            let parent_hists = tree.node_mut(parent).histograms.take().ok_or_else(|| {
                crate::Error::Train("parent histograms were dropped too early".into())
            })?;

            {
                let entry = tree.node_mut(sibling);
                entry.histograms = Some(parent_hists);
                entry.split = None;
            }

            // Each document's position within the child it went to
            let n = signature.len();
            let mut mapping: Vec<DocId> = vec![0; n as usize];
            let mut counters: [DocId; 2] = [0, 0];
            let mut cursor = signature.cursor(0);
            for slot in &mut mapping {
                let side = cursor.next(&signature) as usize;
                *slot = counters[side];
                counters[side] += 1;
            }

            let entry = tree.node_mut(parent);
            entry.split_signature = Some(signature);
            entry.split_mapping = Some(mapping);
        }

        let (sum_gradient, sum_hessian) = {
            let node_docs = &guard.node(node).doc_ids;
            let mut gradient = 0.0f64;
            let mut hessian = 0.0f64;
            for &doc in node_docs {
                gradient += f64::from(guard.documents[doc as usize].gradient);
                hessian += f64::from(guard.documents[doc as usize].hessian);
            }
            (gradient, hessian)
        };

        let n_docs = guard.node(node).doc_ids.len();
        {
            let entry = guard.tree_mut().node_mut(node);
            entry.sum_gradient = sum_gradient;
            if self.params.newton_step {
                entry.sum_hessian = sum_hessian;
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let node_totals = (
            sum_gradient,
            if self.params.newton_step {
                sum_hessian
            } else {
                n_docs as f64
            },
        );

        let mut sibling_totals = (0.0, 0.0);
        if let Some(sibling) = sibling {
            let parent =
                parent.ok_or_else(|| crate::Error::Train("sibling batch without a parent".into()))?;
            let parent_gradient = guard.node(parent).sum_gradient;
            let parent_hessian = guard.node(parent).sum_hessian;
            let sibling_docs = guard.node(sibling).doc_ids.len();

            let entry = guard.tree_mut().node_mut(sibling);
            entry.sum_gradient = parent_gradient - sum_gradient;
            if self.params.newton_step {
                entry.sum_hessian = parent_hessian - sum_hessian;
            }

            #[allow(clippy::cast_precision_loss)]
            {
                sibling_totals = (
                    parent_gradient - sum_gradient,
                    if self.params.newton_step {
                        parent_hessian - sum_hessian
                    } else {
                        sibling_docs as f64
                    },
                );
            }
        }

        Ok((node_totals, sibling_totals))
    }

    /// Post-batch commit under the write lock: stores the histograms, picks
    /// the best split per node (feature order breaks ties), and retires the
    /// parent's transient split state.
    fn commit_node_batch(
        &self,
        node: TreeNodeId,
        sibling: Option<TreeNodeId>,
        results: Vec<Option<FeatureTaskResult>>,
    ) -> crate::Result<()> {
        let mut guard = self.data.write();

        let mut node_split = Split::none(node);
        let mut sibling_split = sibling.map(Split::none);

        for (index, result) in results.into_iter().enumerate() {
            let result =
                result.ok_or_else(|| crate::Error::Train("a histogram task vanished".into()))?;

            #[allow(clippy::cast_possible_truncation)]
            let feature = index as u32;

            if result.best.0 > node_split.spread {
                node_split = Split {
                    spread: result.best.0,
                    feature,
                    node,
                    threshold: result.best.1,
                    inverse: false,
                };
            }

            let tree = guard.tree_mut();
            if let Some(slots) = tree.node_mut(node).histograms.as_mut() {
                slots[index] = Some(result.hist);
            }

            if let (Some(sibling), Some((sibling_hist, sibling_best))) = (sibling, result.sibling) {
                if let Some(best) = sibling_split.as_mut() {
                    if sibling_best.0 > best.spread {
                        *best = Split {
                            spread: sibling_best.0,
                            feature,
                            node: sibling,
                            threshold: sibling_best.1,
                            inverse: false,
                        };
                    }
                }
                if let Some(slots) = tree.node_mut(sibling).histograms.as_mut() {
                    slots[index] = Some(sibling_hist);
                }
            }
        }

        guard.tree_mut().node_mut(node).split = Some(node_split);
        if let (Some(sibling), Some(split)) = (sibling, sibling_split) {
            guard.tree_mut().node_mut(sibling).split = Some(split);

            let parent = guard
                .node(node)
                .parent
                .ok_or_else(|| crate::Error::Train("sibling batch without a parent".into()))?;
            let entry = guard.tree_mut().node_mut(parent);
            entry.split_signature = None;
            entry.split_mapping = None;
            entry.doc_ids = Vec::new();
        }

        Ok(())
    }

    /// The committed best split of a node, if it is viable.
    #[must_use]
    pub fn best_split_of(&self, node: TreeNodeId) -> Option<Split> {
        let guard = self.data.read();
        guard.node(node).split.clone().filter(Split::is_viable)
    }

    /// Computes the direction bitmap for `split`, flipping it (and setting
    /// `inverse`) when the right side would outweigh the left. The direct
    /// histogram pass runs on the right child, so keeping the left child at
    /// least as large makes that pass the cheaper one.
    pub fn split_signature(&self, split: &mut Split) -> crate::Result<SplitSignature> {
        let mut signature = {
            let guard = self.data.read();
            let feature = self.features[split.feature as usize].lock();
            feature.split_signature(split.node, split, &guard)?
        };

        let mut sides = [0u64; 2];
        let mut cursor = signature.cursor(0);
        for _ in 0..signature.len() {
            sides[cursor.next(&signature) as usize] += 1;
        }

        if sides[1] > sides[0] {
            split.inverse = true;

            {
                let guard = self.data.read();
                let feature = self.features[split.feature as usize].lock();
                signature = feature.split_signature(split.node, split, &guard)?;
            }

            // Keep the committed copy in sync for serialization
            let mut guard = self.data.write();
            if let Some(committed) = guard.tree_mut().node_mut(split.node).split.as_mut() {
                committed.inverse = true;
            }
        }

        Ok(signature)
    }

    /// Commits a split: partitions the node's documents into two children
    /// and, when their histograms will be computed, registers the new shard.
    pub fn split_node(
        &self,
        split: &Split,
        signature: &SplitSignature,
        will_compute_children: bool,
    ) -> crate::Result<(TreeNodeId, TreeNodeId)> {
        let mut guard = self.data.write();

        #[allow(clippy::cast_possible_truncation)]
        let n_docs = guard.node(split.node).doc_ids.len() as DocId;
        if let Some(info) = guard.tree_mut().node_mut(split.node).debug_info.as_mut() {
            info.n_docs = n_docs;
            info.spread = split.spread;
        }

        let (left, right) = guard.tree_mut().split_node(split.node, signature);

        if will_compute_children {
            guard.shard_map.split_tree_node(split.node, left, right);
        }

        Ok((left, right))
    }

    /// Number of documents in a node.
    #[must_use]
    pub fn node_size(&self, node: TreeNodeId) -> usize {
        self.data.read().node(node).doc_ids.len()
    }

    /// Depth of a node in the current tree.
    #[must_use]
    pub fn node_depth(&self, node: TreeNodeId) -> u32 {
        self.data.read().tree().depth_of(node)
    }

    /// Number of nodes in the current tree.
    #[must_use]
    pub fn tree_size(&self) -> usize {
        self.data.read().tree().len()
    }

    /// Applies a constant base score through a single-leaf pseudo-tree.
    pub fn set_base_score(&self, base_score: f32) {
        let mut guard = self.data.write();
        debug_assert_eq!(1, guard.tree().len());
        guard.tree_mut().node_mut(0).leaf_value = base_score;
        for doc in &mut guard.documents {
            doc.score += base_score;
        }
        guard.shard_map.on_finalize_tree();
    }

    /// Finalizes the tree: every leaf's value is computed and added to its
    /// documents' scores, and every sparse feature merges its shards back
    /// into one stream. Both run as one task batch on the pool.
    pub fn finalize_tree(&self, learning_rate: f32) -> crate::Result<()> {
        enum Outcome {
            Feature,
            Leaf(TreeNodeId, f32),
        }

        let leaves: Vec<TreeNodeId> = {
            let guard = self.data.read();
            guard
                .tree()
                .nodes()
                .iter()
                .filter(|n| n.is_leaf())
                .map(|n| n.node_id)
                .collect()
        };

        let (tx, rx) = crossbeam_channel::unbounded::<crate::Result<Outcome>>();

        for feature in &self.features {
            let data = Arc::clone(&self.data);
            let feature = Arc::clone(feature);
            let tx = tx.clone();
            self.pool.execute(move || {
                let result = (|| -> crate::Result<Outcome> {
                    let guard = data.read();
                    feature.lock().finalize_tree(&guard)?;
                    Ok(Outcome::Feature)
                })();
                let _ = tx.send(result);
            })?;
        }

        let newton_step = self.params.newton_step;
        let lambda = if self.params.quadratic_spread {
            self.params.regularization_lambda
        } else {
            0.0
        };
        for &leaf in &leaves {
            let data = Arc::clone(&self.data);
            let tx = tx.clone();
            self.pool.execute(move || {
                let result = (|| -> crate::Result<Outcome> {
                    let guard = data.read();
                    let value = leaf_value(&guard, leaf, newton_step, lambda, learning_rate)?;
                    Ok(Outcome::Leaf(leaf, value))
                })();
                let _ = tx.send(result);
            })?;
        }
        drop(tx);

        let expected = self.features.len() + leaves.len();
        let mut leaf_values: Vec<(TreeNodeId, f32)> = Vec::with_capacity(leaves.len());
        let mut first_error = None;
        for _ in 0..expected {
            let Some(result) = rx.recv().ok() else {
                break;
            };
            match result {
                Ok(Outcome::Leaf(leaf, value)) => leaf_values.push((leaf, value)),
                Ok(Outcome::Feature) => {}
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        // Leaf-value writeback is serial per document: it happens here,
        // after every task of the batch has completed.
        let mut guard = self.data.write();
        for (leaf, value) in leaf_values {
            guard.tree_mut().node_mut(leaf).leaf_value = value;
            let doc_ids = std::mem::take(&mut guard.tree_mut().node_mut(leaf).doc_ids);
            for &doc in &doc_ids {
                guard.documents[doc as usize].score += value;
            }
            guard.tree_mut().node_mut(leaf).doc_ids = doc_ids;
        }

        if self.params.tree_debug_info {
            self.fill_debug_info(&mut guard);
        }

        guard.shard_map.on_finalize_tree();
        Ok(())
    }

    fn fill_debug_info(&self, guard: &mut TrainerData) {
        let node_count = guard.tree().len();
        for id in 0..node_count {
            #[allow(clippy::cast_possible_truncation)]
            let id = id as TreeNodeId;

            let (is_leaf, n_docs, split) = {
                let node = guard.node(id);
                #[allow(clippy::cast_possible_truncation)]
                let n_docs = node.doc_ids.len() as DocId;
                (node.is_leaf(), n_docs, node.split.clone())
            };
            if !is_leaf {
                // Split nodes were annotated when they split
                continue;
            }

            let annotation = split.filter(Split::is_viable).map(|split| {
                let feature = self.features[split.feature as usize].lock();
                (
                    split.spread,
                    feature.name().to_owned(),
                    feature.buckets().display_string(split.threshold),
                )
            });

            if let Some(info) = guard.tree_mut().node_mut(id).debug_info.as_mut() {
                info.n_docs = n_docs;
                if let Some((spread, feature, threshold)) = annotation {
                    info.spread = spread;
                    info.split_feature = Some(feature);
                    info.split_threshold = Some(threshold);
                }
            }
        }
    }

    /// Freezes the current tree for serialization, rendering thresholds
    /// through the feature bucket tables.
    pub fn build_tree_lite(&self) -> crate::Result<TreeLite> {
        let mut guard = self.data.write();
        let features = &self.features;
        TreeLite::from_tree(guard.tree_mut(), |feature, bucket| {
            features[feature as usize].lock().buckets().value_string(bucket)
        })
    }

    /// Drops the current tree's training state.
    pub fn clear_tree(&self) {
        self.data.write().current_tree = None;
    }

    /// Metadata of one feature.
    #[must_use]
    pub fn feature_metadata(&self, index: usize) -> crate::FeatureMetadata {
        self.features[index].lock().metadata()
    }

    /// Encoding tag of one feature, for logging.
    #[must_use]
    pub fn feature_encoding(&self, index: usize) -> String {
        self.features[index].lock().encoding()
    }
}

/// `-learning_rate * avg_grad`, where the average is per document under
/// gradient step and hessian-weighted under Newton step.
fn leaf_value(
    data: &TrainerData,
    leaf: TreeNodeId,
    newton_step: bool,
    lambda: f32,
    learning_rate: f32,
) -> crate::Result<f32> {
    let doc_ids = &data.node(leaf).doc_ids;

    let mut gradient = 0.0f64;
    for &doc in doc_ids {
        gradient += f64::from(data.documents[doc as usize].gradient);
    }

    if newton_step {
        let mut hessian = 0.0f64;
        for &doc in doc_ids {
            hessian += f64::from(data.documents[doc as usize].hessian);
        }
        gradient /= hessian + f64::from(lambda);
    } else {
        #[allow(clippy::cast_precision_loss)]
        {
            gradient /= doc_ids.len() as f64;
        }
    }

    if !gradient.is_finite() {
        return Err(crate::Error::Train(
            "leaf value is not a number; this is not supposed to happen".into(),
        ));
    }

    // The cost is minimized, so the step opposes the gradient
    #[allow(clippy::cast_possible_truncation)]
    let value = (-gradient * f64::from(learning_rate)) as f32;
    Ok(value)
}
