// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod dense;
pub mod sharded;
pub mod sparse;

use crate::{
    buckets::BucketsCollection,
    histogram::Histogram,
    metadata::FeatureMetadata,
    raw_feature::CookedColumn,
    split::{Split, SplitSignature},
    trainer::data::TrainerData,
    types::TreeNodeId,
};
use dense::DenseFeature;
use sparse::SparseFeature;

/// Construction-time settings shared by all sparse features.
#[derive(Clone, Copy, Debug)]
pub struct FeatureConfig {
    /// Use the sharded (v2) sparse layout.
    pub sparse_v2: bool,
    /// Minimum reserve tail, in offset-stream bytes.
    pub fixed_tail: usize,
    /// Initial reserve tail as a fraction of the offset stream.
    pub initial_tail_fraction: f32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            sparse_v2: false,
            fixed_tail: 16,
            initial_tail_fraction: 0.05,
        }
    }
}

/// A bucketized feature engaged in training.
///
/// The implementations form a static specialization table: dense or sparse
/// layout crossed with the five supported code widths, chosen once per
/// feature at construction.
pub trait Feature: Send {
    /// Feature name.
    fn name(&self) -> &str;

    /// Short encoding tag for logging, e.g. `d4` or `s8`.
    fn encoding(&self) -> String;

    /// The bucket bound table.
    fn buckets(&self) -> &BucketsCollection;

    /// Number of buckets.
    fn n_buckets(&self) -> u32;

    /// Metadata for the serialized ensemble.
    fn metadata(&self) -> FeatureMetadata {
        FeatureMetadata::new(self.name(), self.buckets().feature_type())
    }

    /// Computes the direction bitmap of `split` over `leaf`'s documents.
    fn split_signature(
        &self,
        leaf: TreeNodeId,
        split: &Split,
        data: &TrainerData,
    ) -> crate::Result<SplitSignature>;

    /// Accumulates the per-bucket (gradient, weight) histogram of `leaf`.
    ///
    /// For a sharded sparse feature on a freshly split leaf this call also
    /// rewrites the feature's streams so the new leaves own contiguous
    /// shards.
    fn compute_histogram(
        &mut self,
        leaf: TreeNodeId,
        newton_step: bool,
        data: &TrainerData,
    ) -> crate::Result<Histogram>;

    /// Restores the feature's resting layout after a tree is finished.
    fn finalize_tree(&mut self, data: &TrainerData) -> crate::Result<()> {
        let _ = data;
        Ok(())
    }
}

const CODE_WIDTHS: [u8; 5] = [1, 2, 4, 8, 16];

/// Picks layout and code width for a cooked column and builds the feature.
///
/// Layout: dense when the column's sparsity exceeds the threshold, sparse
/// otherwise. Width: the narrowest of 1/2/4/8/16 bits that fits the bucket
/// count.
pub fn build_feature(
    cooked: CookedColumn,
    sparsity_threshold: f32,
    config: FeatureConfig,
) -> crate::Result<Box<dyn Feature>> {
    let dense = cooked.sparsity > sparsity_threshold;

    let Some(bits) = CODE_WIDTHS
        .iter()
        .copied()
        .find(|&bits| cooked.n_buckets <= 1u32 << bits)
    else {
        return Err(crate::Error::Bucketize(format!(
            "feature '{}' has {} buckets, which no supported code width fits",
            cooked.name, cooked.n_buckets
        )));
    };

    let feature: Box<dyn Feature> = match (dense, bits) {
        (true, 1) => Box::new(DenseFeature::<1>::new(cooked)),
        (true, 2) => Box::new(DenseFeature::<2>::new(cooked)),
        (true, 4) => Box::new(DenseFeature::<4>::new(cooked)),
        (true, 8) => Box::new(DenseFeature::<8>::new(cooked)),
        (true, 16) => Box::new(DenseFeature::<16>::new(cooked)),
        (false, 1) => Box::new(SparseFeature::<1>::new(cooked, config)?),
        (false, 2) => Box::new(SparseFeature::<2>::new(cooked, config)?),
        (false, 4) => Box::new(SparseFeature::<4>::new(cooked, config)?),
        (false, 8) => Box::new(SparseFeature::<8>::new(cooked, config)?),
        (false, 16) => Box::new(SparseFeature::<16>::new(cooked, config)?),
        _ => unreachable!("width comes from CODE_WIDTHS"),
    };

    Ok(feature)
}

/// Document weight under the current step mode: 1 per document for gradient
/// step, the hessian for Newton step.
pub(crate) fn document_weight(doc: &crate::trainer::data::Document, newton_step: bool) -> f64 {
    if newton_step {
        f64::from(doc.hessian)
    } else {
        1.0
    }
}
