// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{document_weight, Feature};
use crate::{
    buckets::BucketsCollection,
    compact_vector::CompactVector,
    histogram::Histogram,
    raw_feature::CookedColumn,
    split::{Split, SplitSignature},
    trainer::data::TrainerData,
    types::TreeNodeId,
};

/// A dense feature: one `BITS`-wide bucket code per document.
pub struct DenseFeature<const BITS: u8> {
    name: String,
    buckets: BucketsCollection,
    n_buckets: u32,
    values: CompactVector<BITS>,
}

impl<const BITS: u8> DenseFeature<BITS> {
    /// Packs a cooked column into dense storage.
    #[must_use]
    pub fn new(cooked: CookedColumn) -> Self {
        debug_assert!(cooked.n_buckets <= 1u32 << BITS);

        let mut values = CompactVector::new();
        #[allow(clippy::cast_possible_truncation)]
        values.reserve(cooked.data.len() as u32);
        for &code in &cooked.data {
            values.push(code);
        }
        values.flush();

        Self {
            name: cooked.name,
            buckets: cooked.buckets,
            n_buckets: cooked.n_buckets,
            values,
        }
    }
}

impl<const BITS: u8> Feature for DenseFeature<BITS> {
    fn name(&self) -> &str {
        &self.name
    }

    fn encoding(&self) -> String {
        format!("d{BITS}")
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
        let doc_ids = &data.node(leaf).doc_ids;

        // Baking the inverse flag into the truth table saves the invert pass
        // the sparse layouts need.
        let truth_bits: [u16; 2] = if split.inverse { [1, 0] } else { [0, 1] };

        let mut signature = SplitSignature::new();
        #[allow(clippy::cast_possible_truncation)]
        signature.reserve(doc_ids.len() as u32);
        for &doc_id in doc_ids {
            let value = self.values.get(doc_id);
            signature.push(truth_bits[usize::from(value >= split.threshold)]);
        }
        signature.flush();

        Ok(signature)
    }

    fn compute_histogram(
        &mut self,
        leaf: TreeNodeId,
        newton_step: bool,
        data: &TrainerData,
    ) -> crate::Result<Histogram> {
        let mut hist = Histogram::new(self.n_buckets);

        for &doc_id in &data.node(leaf).doc_ids {
            let doc = &data.documents[doc_id as usize];
            let value = self.values.get(doc_id);
            hist.accumulate(value, doc.gradient, document_weight(doc, newton_step));
        }

        Ok(hist)
    }
}
