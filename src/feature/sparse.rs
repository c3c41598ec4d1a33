// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{document_weight, Feature, FeatureConfig};
use crate::{
    buckets::BucketsCollection,
    compact_vector::CompactVector,
    histogram::{Histogram, HistogramItem},
    raw_feature::CookedColumn,
    split::{Split, SplitSignature},
    trainer::data::TrainerData,
    tree::TreeNode,
    types::{Bucket, DocId, TreeNodeId},
    var_int_buffer::VarIntBuffer,
};

#[cfg(debug_assertions)]
use crate::checksum::Checksum;

use super::sharded::Shard;

/// A sparse feature: the most frequent bucket is implicit, explicit
/// documents live in a code stream plus a var-int stream of doc-id deltas.
///
/// With [`FeatureConfig::sparse_v2`] set, a shard table partitions the
/// streams by live tree leaf so that splitting a leaf only touches that
/// leaf's slice of the streams.
pub struct SparseFeature<const BITS: u8> {
    pub(super) name: String,
    pub(super) buckets: BucketsCollection,
    pub(super) n_buckets: u32,
    pub(super) default_value: Bucket,
    pub(super) values: CompactVector<BITS>,
    pub(super) offsets: VarIntBuffer,
    pub(super) shards: Vec<Shard>,
    pub(super) config: FeatureConfig,
    #[cfg(debug_assertions)]
    pub(super) values_checksum: Checksum,
    #[cfg(debug_assertions)]
    pub(super) offsets_checksum: Checksum,
}

impl<const BITS: u8> SparseFeature<BITS> {
    /// Encodes a cooked column into the two sparse streams, then lays out
    /// the root shard when the sharded layout is requested.
    pub fn new(cooked: CookedColumn, config: FeatureConfig) -> crate::Result<Self> {
        debug_assert!(cooked.n_buckets <= 1u32 << BITS);

        let mut values = CompactVector::new();
        let mut offsets = VarIntBuffer::new();

        let mut last_doc_id: DocId = 0;
        for (i, &code) in cooked.data.iter().enumerate() {
            if code == cooked.default_bucket {
                continue;
            }
            #[allow(clippy::cast_possible_truncation)]
            let doc_id = i as DocId;
            values.push(code);
            offsets.append(doc_id - last_doc_id)?;
            last_doc_id = doc_id;
        }
        values.flush();

        let mut feature = Self {
            name: cooked.name,
            buckets: cooked.buckets,
            n_buckets: cooked.n_buckets,
            default_value: cooked.default_bucket,
            values,
            offsets,
            shards: Vec::new(),
            config,
            #[cfg(debug_assertions)]
            values_checksum: Checksum::default(),
            #[cfg(debug_assertions)]
            offsets_checksum: Checksum::default(),
        };

        if config.sparse_v2 {
            feature.init_shards();
        }

        Ok(feature)
    }

    /// Walks the explicit documents that fall inside `doc_ids`, calling
    /// `on_value(position_in_leaf, code)` for each. Documents not visited
    /// hold the default bucket.
    pub(super) fn walk_explicit(
        &self,
        doc_ids: &[DocId],
        mut on_value: impl FnMut(usize, Bucket),
    ) -> crate::Result<()> {
        let n_explicit = self.values.len();
        if n_explicit == 0 {
            return Ok(());
        }

        let mut offset_cursor = self.offsets.cursor(0);
        let mut stream_index: DocId = 0;
        let mut current_doc = offset_cursor.next(&self.offsets)?;

        for (i, &leaf_doc) in doc_ids.iter().enumerate() {
            while current_doc < leaf_doc {
                stream_index += 1;
                if stream_index >= n_explicit {
                    return Ok(());
                }
                current_doc += offset_cursor.next(&self.offsets)?;
            }
            if current_doc == leaf_doc {
                on_value(i, self.values.get(stream_index));
            }
        }

        Ok(())
    }

    /// Reconstructs the default bucket's slot from the leaf totals: whatever
    /// weight and gradient the explicit buckets do not account for belongs
    /// to the default bucket.
    pub(super) fn fix_default_bucket(&self, hist: &mut Histogram, leaf: &TreeNode, newton_step: bool) {
        #[allow(clippy::cast_precision_loss)]
        let total_weight = if newton_step {
            leaf.sum_hessian
        } else {
            leaf.doc_ids.len() as f64
        };

        let mut item = HistogramItem {
            gradient: leaf.sum_gradient,
            weight: total_weight,
        };

        for (bucket, slot) in hist.data.iter().enumerate() {
            if bucket != self.default_value as usize {
                item.gradient -= slot.gradient;
                item.weight -= slot.weight;
            }
        }

        hist.data[self.default_value as usize] = item;
    }

    fn histogram_v1(
        &self,
        leaf: TreeNodeId,
        newton_step: bool,
        data: &TrainerData,
    ) -> crate::Result<Histogram> {
        let node = data.node(leaf);
        let mut hist = Histogram::new(self.n_buckets);

        self.walk_explicit(&node.doc_ids, |i, value| {
            let doc = &data.documents[node.doc_ids[i] as usize];
            hist.accumulate(value, doc.gradient, document_weight(doc, newton_step));
        })?;

        self.fix_default_bucket(&mut hist, node, newton_step);
        Ok(hist)
    }

    fn signature_v1(
        &self,
        leaf: TreeNodeId,
        split: &Split,
        data: &TrainerData,
    ) -> crate::Result<SplitSignature> {
        let doc_ids = &data.node(leaf).doc_ids;

        #[allow(clippy::cast_possible_truncation)]
        let mut signature = SplitSignature::filled(
            doc_ids.len() as DocId,
            u16::from(self.default_value >= split.threshold),
        );

        let threshold = split.threshold;
        self.walk_explicit(doc_ids, |i, value| {
            #[allow(clippy::cast_possible_truncation)]
            signature.set(i as DocId, u16::from(value >= threshold));
        })?;

        if split.inverse {
            signature.invert();
        }

        Ok(signature)
    }
}

impl<const BITS: u8> Feature for SparseFeature<BITS> {
    fn name(&self) -> &str {
        &self.name
    }

    fn encoding(&self) -> String {
        format!("s{BITS}")
    }

    fn buckets(&self) -> &BucketsCollection {
        &self.buckets
    }

    fn n_buckets(&self) -> u32 {
        self.n_buckets
    }

    fn split_signature(
        &self,
        leaf: TreeNodeId,
        split: &Split,
        data: &TrainerData,
    ) -> crate::Result<SplitSignature> {
        if self.config.sparse_v2 {
            self.signature_v2(leaf, split, data)
        } else {
            self.signature_v1(leaf, split, data)
        }
    }

    fn compute_histogram(
        &mut self,
        leaf: TreeNodeId,
        newton_step: bool,
        data: &TrainerData,
    ) -> crate::Result<Histogram> {
        // The root has no parent shard to rewrite; it reads the whole
        // stream like a v1 feature does.
        if !self.config.sparse_v2 || data.node(leaf).parent.is_none() {
            return self.histogram_v1(leaf, newton_step, data);
        }
        self.histogram_v2(leaf, newton_step, data)
    }

    fn finalize_tree(&mut self, data: &TrainerData) -> crate::Result<()> {
        if self.config.sparse_v2 {
            self.finalize_merge(data)?;
        }
        Ok(())
    }
}
