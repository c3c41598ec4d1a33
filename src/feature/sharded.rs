// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::sparse::SparseFeature;
use crate::{
    compact_vector::{CompactCursor, CompactVector},
    histogram::Histogram,
    scratch::with_scratch,
    split::{Split, SplitSignature},
    trainer::data::TrainerData,
    types::{Bucket, DocId, TreeNodeId},
    var_int_buffer::VarIntCursor,
};
use interval_heap::IntervalHeap;

/// Shard id marking "no shard".
pub const NULL_SHARD: u32 = u32::MAX;

/// The sentinel shard whose `o_ptr` equals the stream end. Always id 1: it
/// is created right after the root shard and never splits.
pub const FINAL_FAKE_SHARD: u32 = 1;

/// A contiguous slice of a sparse feature's streams owned by one live leaf.
#[derive(Clone, Copy, Debug)]
pub struct Shard {
    /// Start position in the value stream, in codes.
    pub v_ptr: usize,
    /// Start position in the offset stream, in bytes.
    pub o_ptr: usize,
    /// Reserved empty bytes between this shard's data and the next shard.
    pub tail: usize,
}

/// Tree-side shard bookkeeping, shared by every sharded feature.
///
/// Shard ids are allocated in lock-step with node splits, so one table
/// serves all features: each feature's `shards` vector is indexed by the
/// same ids. Mutated only by the training driver between task batches;
/// worker tasks read it.
#[derive(Debug, Default)]
pub struct ShardMapping {
    /// Maps tree node id to shard id.
    pub nodes_to_shards: Vec<u32>,
    /// Maps shard id to the tree node owning it.
    pub shards_to_nodes: Vec<TreeNodeId>,
    /// Next shard in stream order.
    pub next_shard: Vec<u32>,
    /// Previous shard in stream order.
    pub previous_shard: Vec<u32>,
}

impl ShardMapping {
    /// Lays out the root shard and the final fake shard for a new tree.
    pub fn on_start_new_tree(&mut self) {
        debug_assert!(self.nodes_to_shards.is_empty());
        debug_assert!(self.shards_to_nodes.is_empty());

        self.nodes_to_shards.push(0);
        self.shards_to_nodes.push(0);
        self.shards_to_nodes.push(NULL_SHARD);
        self.next_shard = vec![FINAL_FAKE_SHARD, NULL_SHARD];
        self.previous_shard = vec![NULL_SHARD, 0];
    }

    /// Registers a committed node split: the left child inherits the parent
    /// shard in place, the right child gets a fresh shard id inserted after
    /// it in stream order.
    pub fn split_tree_node(&mut self, parent: TreeNodeId, left: TreeNodeId, right: TreeNodeId) {
        debug_assert_eq!(left + 1, right);
        debug_assert!(left as usize >= self.nodes_to_shards.len());

        let old_shard = self.nodes_to_shards[parent as usize];

        #[allow(clippy::cast_possible_truncation)]
        let new_shard = self.next_shard.len() as u32;

        self.nodes_to_shards.resize(right as usize + 1, NULL_SHARD);
        self.nodes_to_shards[left as usize] = old_shard;
        self.nodes_to_shards[right as usize] = new_shard;

        self.shards_to_nodes[old_shard as usize] = left;
        debug_assert_eq!(new_shard as usize, self.shards_to_nodes.len());
        self.shards_to_nodes.push(right);

        let following = self.next_shard[old_shard as usize];
        self.next_shard.push(following);
        self.next_shard[old_shard as usize] = new_shard;
        self.previous_shard[following as usize] = new_shard;
        self.previous_shard.push(old_shard);
    }

    /// Clears the table after a tree is finished.
    pub fn on_finalize_tree(&mut self) {
        self.nodes_to_shards.clear();
        self.shards_to_nodes.clear();
        self.next_shard.clear();
        self.previous_shard.clear();
    }
}

#[derive(Eq, Ord, PartialEq, PartialOrd)]
struct MergeEntry {
    doc_id: DocId,
    cursor: usize,
}

struct ShardCursor<const BITS: u8> {
    value_cursor: CompactCursor<BITS>,
    offset_cursor: VarIntCursor,
    node: TreeNodeId,
    remaining: DocId,
    relative: DocId,
    current_doc: DocId,
    current_value: Bucket,
}

impl<const BITS: u8> ShardCursor<BITS> {
    fn advance(
        &mut self,
        values: &CompactVector<BITS>,
        offsets: &crate::var_int_buffer::VarIntBuffer,
        data: &TrainerData,
    ) -> crate::Result<()> {
        self.relative += self.offset_cursor.next(offsets)?;
        self.current_doc = data.node(self.node).doc_ids[self.relative as usize];
        self.current_value = self.value_cursor.next(values);
        self.remaining -= 1;
        Ok(())
    }
}

impl<const BITS: u8> SparseFeature<BITS> {
    /// Lays out the root shard plus its reserve tail, the final fake shard,
    /// and the fidelity checksums.
    pub(super) fn init_shards(&mut self) {
        debug_assert!(self.shards.is_empty());

        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_precision_loss,
            clippy::cast_sign_loss
        )]
        let fraction_tail = (self.config.initial_tail_fraction * self.offsets.len() as f32) as usize;
        let initial_tail = fraction_tail.max(self.config.fixed_tail);

        self.offsets.append_tail(initial_tail);

        self.shards.push(Shard {
            v_ptr: 0,
            o_ptr: 0,
            tail: initial_tail,
        });
        self.shards.push(Shard {
            v_ptr: self.values.len() as usize,
            o_ptr: self.offsets.len(),
            tail: 0,
        });

        #[cfg(debug_assertions)]
        {
            self.values_checksum = self.values.checksum();
            let packed = self.shards[1].o_ptr - self.shards[0].tail;
            self.offsets_checksum = self.offsets.checksum(0, packed);
        }
    }

    /// Bytes of the offset stream owned by `shard`, optionally counting its
    /// reserve tail.
    fn shard_size(&self, map: &ShardMapping, shard: usize, with_tail: bool) -> usize {
        debug_assert_ne!(FINAL_FAKE_SHARD as usize, shard);

        let next = map.next_shard[shard] as usize;
        let mut size = self.shards[next].o_ptr - self.shards[shard].o_ptr;
        if !with_tail {
            size -= self.shards[shard].tail;
        }
        size
    }

    /// Computes a split signature by scanning only the leaf's own shard:
    /// offsets inside a shard are deltas in the leaf's local doc order, so
    /// they index the signature directly.
    pub(super) fn signature_v2(
        &self,
        leaf: TreeNodeId,
        split: &Split,
        data: &TrainerData,
    ) -> crate::Result<SplitSignature> {
        let doc_ids = &data.node(leaf).doc_ids;
        let map = &data.shard_map;

        let shard = map.nodes_to_shards[leaf as usize] as usize;
        let following = map.next_shard[shard] as usize;
        let n_docs = self.shards[following].v_ptr - self.shards[shard].v_ptr;

        #[allow(clippy::cast_possible_truncation)]
        let mut signature = SplitSignature::filled(
            doc_ids.len() as DocId,
            u16::from(self.default_value >= split.threshold),
        );

        #[allow(clippy::cast_possible_truncation)]
        let mut value_cursor = self.values.cursor(self.shards[shard].v_ptr as DocId);
        let mut offset_cursor = self.offsets.cursor(self.shards[shard].o_ptr);

        let mut relative: DocId = 0;
        for _ in 0..n_docs {
            relative += offset_cursor.next(&self.offsets)?;
            let value = value_cursor.next(&self.values);
            signature.set(relative, u16::from(value >= split.threshold));
        }

        if split.inverse {
            signature.invert();
        }

        Ok(signature)
    }

    /// Accumulates the right child's histogram in the same pass that
    /// repartitions the parent shard into the two child shards.
    ///
    /// The retained (left) child overwrites the parent's slice in place; the
    /// right child is staged in the worker's scratch buffers and copied into
    /// its allocated slice afterwards. Only explicit documents routed right
    /// are accumulated; the default bucket is reconstructed from the leaf
    /// totals at the end.
    pub(super) fn histogram_v2(
        &mut self,
        leaf: TreeNodeId,
        newton_step: bool,
        data: &TrainerData,
    ) -> crate::Result<Histogram> {
        let map = &data.shard_map;
        let node = data.node(leaf);
        let parent_id = node.parent.ok_or_else(|| {
            crate::Error::Train("sharded histogram requested for the root".into())
        })?;
        let parent = data.node(parent_id);
        debug_assert_eq!(Some(leaf), parent.right());

        let new_shard = map.nodes_to_shards[leaf as usize] as usize;
        let old_shard = map.previous_shard[new_shard] as usize;
        let following_shard = map.next_shard[new_shard] as usize;
        debug_assert_eq!(self.shards.len(), new_shard);

        let signature = parent.split_signature.as_ref().ok_or_else(|| {
            crate::Error::Train("parent split signature is gone".into())
        })?;
        let mapping = parent.split_mapping.as_ref().ok_or_else(|| {
            crate::Error::Train("parent split mapping is gone".into())
        })?;

        let mut hist = Histogram::new(self.n_buckets);

        #[allow(clippy::cast_possible_truncation)]
        let n_docs = (self.shards[following_shard].v_ptr - self.shards[old_shard].v_ptr) as DocId;
        let max_spill =
            self.shards[following_shard].o_ptr - self.shards[old_shard].o_ptr - self.shards[old_shard].tail;

        let old_o_ptr = self.shards[old_shard].o_ptr;
        #[allow(clippy::cast_possible_truncation)]
        let old_v_ptr = self.shards[old_shard].v_ptr as DocId;

        with_scratch(|scratch| -> crate::Result<()> {
            scratch.offsets.resize(max_spill);
            let mut right_offset_writer = scratch.offsets.writer(0);

            let buffer = std::mem::take(&mut scratch.values);
            let mut tmp_values = CompactVector::<BITS>::from_scratch(buffer, n_docs);
            let mut right_value_writer = tmp_values.writer(0);

            let (mut offset_cursor, mut left_offset_writer) =
                self.offsets.cursor_and_writer(old_o_ptr, max_spill);
            let mut value_cursor = self.values.cursor(old_v_ptr);
            let mut left_value_writer = self.values.writer(old_v_ptr);

            let mut relative: DocId = 0;
            let mut last_relative: [DocId; 2] = [0, 0];

            for _ in 0..n_docs {
                let value = value_cursor.next(&self.values);
                relative += offset_cursor.next(&self.offsets)?;
                let doc_id = parent.doc_ids[relative as usize];
                let direction = signature.get(relative);

                if direction == 1 {
                    let doc = &data.documents[doc_id as usize];
                    hist.accumulate(value, doc.gradient, super::document_weight(doc, newton_step));
                }

                let new_relative = mapping[relative as usize];
                let side = direction as usize;
                let delta = new_relative - last_relative[side];
                last_relative[side] = new_relative;

                if direction == 0 {
                    left_value_writer.write(&mut self.values, value);
                    left_offset_writer.write(&mut self.offsets, offset_cursor.pos(), delta)?;
                } else {
                    right_value_writer.write(&mut tmp_values, value);
                    right_offset_writer.write(&mut scratch.offsets, usize::MAX, delta)?;
                }
            }

            left_value_writer.flush(&mut self.values);
            right_value_writer.flush(&mut tmp_values);
            left_offset_writer.flush(&mut self.offsets, offset_cursor.pos())?;
            right_offset_writer.flush(&mut scratch.offsets, usize::MAX)?;

            let left_size = left_offset_writer.pos() - old_o_ptr;
            let right_size = right_offset_writer.pos();
            let available = self.shards[following_shard].o_ptr - old_o_ptr;

            if available < left_size + right_size {
                self.shards.push(Shard {
                    v_ptr: 0,
                    o_ptr: old_o_ptr + left_size,
                    tail: 0,
                });
                self.shards[old_shard].tail = 0;

                let shortage = self.rearrange_shards(map, new_shard, right_size);
                if shortage > 0 {
                    self.resize_offsets(map, shortage + self.config.fixed_tail);
                    let shortage = self.rearrange_shards(map, new_shard, right_size);
                    if shortage > 0 {
                        return Err(crate::Error::Train(
                            "sharded offset stream could not make room for a split".into(),
                        ));
                    }
                }
            } else {
                let tail_to_split = available - (left_size + right_size);
                let right_tail = tail_to_split / 2;
                let left_tail = tail_to_split - right_tail;
                self.shards[old_shard].tail = left_tail;
                self.shards.push(Shard {
                    v_ptr: 0,
                    o_ptr: old_o_ptr + left_tail + left_size,
                    tail: right_tail,
                });
            }

            debug_assert_eq!(left_size, self.shard_size(map, old_shard, false));
            debug_assert_eq!(right_size, self.shard_size(map, new_shard, false));

            let new_o_ptr = self.shards[new_shard].o_ptr;
            self.offsets.copy_from(&scratch.offsets, 0, new_o_ptr, right_size);

            self.shards[new_shard].v_ptr = left_value_writer.pos() as usize;
            #[allow(clippy::cast_possible_truncation)]
            self.values
                .copy_from(&tmp_values, 0, self.shards[new_shard].v_ptr as DocId, right_value_writer.pos());

            scratch.values = tmp_values.into_scratch();
            scratch.offsets.clear();
            Ok(())
        })?;

        self.fix_default_bucket(&mut hist, node, newton_step);
        Ok(hist)
    }

    /// Seeks `required` bytes of room for `shard`, walking outward
    /// alternately and preferring whichever side has less data to shift.
    /// Returns the unmet shortage, 0 on success.
    fn rearrange_shards(&mut self, map: &ShardMapping, shard: usize, required: usize) -> usize {
        #[allow(clippy::cast_possible_truncation)]
        let shard_u32 = shard as u32;
        let left_neighbor = map.previous_shard[shard] as usize;
        let right_neighbor = map.next_shard[shard];

        let available = self.shard_size(map, shard, true);
        if available >= required {
            self.shards[shard].tail = available - required;
            return 0;
        }

        let mut left = map.previous_shard[left_neighbor];
        let mut right = right_neighbor;
        let mut left2 = NULL_SHARD;
        let mut right2 = NULL_SHARD;
        let mut left_moved = 0usize;
        let mut right_moved = 0usize;
        let mut gained = 0usize;

        while available + gained < required {
            if left == NULL_SHARD && right == FINAL_FAKE_SHARD {
                return required - (available + gained);
            }

            let expand_right = if left == NULL_SHARD {
                true
            } else if right == FINAL_FAKE_SHARD {
                false
            } else {
                let left_to_move =
                    self.shard_size(map, map.next_shard[left as usize] as usize, false);
                let right_to_move = self.shard_size(map, right as usize, false);
                left_moved + left_to_move > right_moved + right_to_move
            };

            if expand_right {
                gained += self.shards[right as usize].tail;
                right_moved += self.shard_size(map, right as usize, false);
                right2 = right;
                right = map.next_shard[right as usize];
            } else {
                gained += self.shards[left as usize].tail;
                left_moved += self.shard_size(map, map.next_shard[left as usize] as usize, false);
                left2 = left;
                left = map.previous_shard[left as usize];
            }
        }

        // Sizes must be snapshotted before any shard moves.
        let shard_sizes: Vec<usize> = (0..self.shards.len())
            .map(|i| {
                if i == FINAL_FAKE_SHARD as usize {
                    0
                } else {
                    self.shard_size(map, i, false)
                }
            })
            .collect();

        let mut left_shift = 0usize;
        if left2 != NULL_SHARD {
            let mut current = left2;
            while current != shard_u32 {
                let i = current as usize;
                if left_shift > 0 {
                    self.offsets
                        .move_within(self.shards[i].o_ptr, self.shards[i].o_ptr - left_shift, shard_sizes[i]);
                    self.shards[i].o_ptr -= left_shift;
                }
                left_shift += self.shards[i].tail;
                self.shards[i].tail = 0;
                current = map.next_shard[i];
            }
        }

        let mut right_shift = 0usize;
        if right2 != NULL_SHARD {
            let mut current = right2;
            while current != shard_u32 {
                let i = current as usize;
                right_shift += self.shards[i].tail;
                if right_shift > 0 {
                    self.offsets
                        .move_within(self.shards[i].o_ptr, self.shards[i].o_ptr + right_shift, shard_sizes[i]);
                    self.shards[i].o_ptr += right_shift;
                    self.shards[i].tail = 0;
                }
                current = map.previous_shard[i];
            }
        }

        debug_assert_eq!(gained, left_shift + right_shift);
        self.shards[shard].o_ptr -= left_shift;
        self.shards[shard].tail = available + gained - required;
        debug_assert!(self.shard_size(map, shard, true) >= required);
        0
    }

    fn resize_offsets(&mut self, map: &ShardMapping, increment: usize) {
        debug_assert_eq!(self.offsets.len(), self.shards[FINAL_FAKE_SHARD as usize].o_ptr);

        self.offsets.resize(self.offsets.len() + increment);
        self.shards[FINAL_FAKE_SHARD as usize].o_ptr += increment;
        let before_fake = map.previous_shard[FINAL_FAKE_SHARD as usize] as usize;
        self.shards[before_fake].tail += increment;

        log::warn!(
            "resizing the offsets buffer for feature '{}'; if this message appears often, consider increasing --initial_tail_size",
            self.name
        );
    }

    /// Merges all per-leaf shards back into a single doc-id-ordered stream
    /// via a k-way heap merge over shard cursors, then resets the shard
    /// table to a lone root shard.
    pub(super) fn finalize_merge(&mut self, data: &TrainerData) -> crate::Result<()> {
        let map = &data.shard_map;

        with_scratch(|scratch| -> crate::Result<()> {
            scratch.offsets.resize(self.offsets.len());
            let mut offsets_writer = scratch.offsets.writer(0);

            let buffer = std::mem::take(&mut scratch.values);
            let mut tmp_values = CompactVector::<BITS>::from_scratch(buffer, self.values.len());
            let mut values_writer = tmp_values.writer(0);

            let mut cursors: Vec<ShardCursor<BITS>> = Vec::new();
            let mut heap: IntervalHeap<MergeEntry> = IntervalHeap::with_capacity(self.shards.len());

            for (i, shard) in self.shards.iter().enumerate() {
                if map.next_shard[i] == NULL_SHARD {
                    continue;
                }
                let next = map.next_shard[i] as usize;

                #[allow(clippy::cast_possible_truncation)]
                let n_docs = (self.shards[next].v_ptr - shard.v_ptr) as DocId;
                if n_docs == 0 {
                    continue;
                }

                #[allow(clippy::cast_possible_truncation)]
                let mut cursor = ShardCursor {
                    value_cursor: self.values.cursor(shard.v_ptr as DocId),
                    offset_cursor: self.offsets.cursor(shard.o_ptr),
                    node: map.shards_to_nodes[i],
                    remaining: n_docs,
                    relative: 0,
                    current_doc: 0,
                    current_value: 0,
                };
                cursor.advance(&self.values, &self.offsets, data)?;

                heap.push(MergeEntry {
                    doc_id: cursor.current_doc,
                    cursor: cursors.len(),
                });
                cursors.push(cursor);
            }

            let mut last_doc: DocId = 0;
            while let Some(entry) = heap.pop_min() {
                let cursor = &mut cursors[entry.cursor];

                offsets_writer.write(&mut scratch.offsets, usize::MAX, cursor.current_doc - last_doc)?;
                values_writer.write(&mut tmp_values, cursor.current_value);
                last_doc = cursor.current_doc;

                if cursor.remaining > 0 {
                    cursor.advance(&self.values, &self.offsets, data)?;
                    heap.push(MergeEntry {
                        doc_id: cursor.current_doc,
                        cursor: entry.cursor,
                    });
                }
            }

            values_writer.flush(&mut tmp_values);
            offsets_writer.flush(&mut scratch.offsets, usize::MAX)?;
            debug_assert_eq!(self.values.len(), values_writer.pos());

            let written = offsets_writer.pos();
            debug_assert!(written <= self.offsets.len());

            self.offsets.copy_from(&scratch.offsets, 0, 0, written);
            self.values.copy_from(&tmp_values, 0, 0, values_writer.pos());

            self.shards.truncate(2);
            self.shards[0] = Shard {
                v_ptr: 0,
                o_ptr: 0,
                tail: self.offsets.len() - written,
            };
            debug_assert_eq!(self.offsets.len(), self.shards[1].o_ptr);
            debug_assert_eq!(self.values.len() as usize, self.shards[1].v_ptr);

            scratch.values = tmp_values.into_scratch();
            scratch.offsets.clear();
            Ok(())
        })?;

        #[cfg(debug_assertions)]
        {
            debug_assert_eq!(self.values_checksum, self.values.checksum());
            let packed = self.shards[1].o_ptr - self.shards[0].tail;
            debug_assert_eq!(self.offsets_checksum, self.offsets.checksum(0, packed));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Feature, FeatureConfig};
    use super::SparseFeature;
    use crate::{
        buckets::BucketsCollection,
        raw_feature::CookedColumn,
        split::Split,
        trainer::data::TrainerData,
        tree::Tree,
        types::{Bucket, DocId, TreeNodeId},
    };
    use test_log::test;

    const N_DOCS: DocId = 300;
    const N_BUCKETS: u32 = 9;

    fn codes() -> Vec<Bucket> {
        // Mostly default bucket (0), explicit values scattered around
        (0..N_DOCS)
            .map(|i| {
                if i % 3 == 0 {
                    (1 + (i.wrapping_mul(2_654_435_761) % (N_BUCKETS - 1))) as Bucket
                } else {
                    0
                }
            })
            .collect()
    }

    fn cooked() -> CookedColumn {
        CookedColumn {
            name: "probe".into(),
            buckets: BucketsCollection::Uint16((0..N_BUCKETS as u16).collect()),
            data: codes(),
            n_buckets: N_BUCKETS,
            default_bucket: 0,
            sparsity: 0.05,
        }
    }

    fn make_data() -> TrainerData {
        let labels: Vec<f32> = (0..N_DOCS).map(|i| (i as f32).sin()).collect();
        let mut data = TrainerData::new(&labels, vec![0, N_DOCS]);
        for doc in &mut data.documents {
            doc.gradient = doc.target_score * 0.5 - 0.1;
            doc.hessian = 1.0;
        }
        data
    }

    fn set_sums(data: &mut TrainerData, node: TreeNodeId) {
        let (grad, hess) = {
            let docs = &data.node(node).doc_ids;
            let grad: f64 = docs.iter().map(|&d| f64::from(data.documents[d as usize].gradient)).sum();
            let hess: f64 = docs.iter().map(|&d| f64::from(data.documents[d as usize].hessian)).sum();
            (grad, hess)
        };
        let node = data.tree_mut().node_mut(node);
        node.sum_gradient = grad;
        node.sum_hessian = hess;
    }

    /// Grows a tree with both sparse layouts side by side; every signature
    /// and right-child histogram must match exactly, and the v2 finalize
    /// merge must restore the original streams (checked by the debug
    /// checksums inside `finalize_merge`).
    #[test]
    fn sharded_layout_matches_plain_sparse() {
        let mut v1 = SparseFeature::<4>::new(cooked(), FeatureConfig::default()).unwrap();
        let mut v2 = SparseFeature::<4>::new(
            cooked(),
            FeatureConfig {
                sparse_v2: true,
                fixed_tail: 16,
                // No proportional reserve, to force rearrange_shards runs
                initial_tail_fraction: 0.0,
            },
        )
        .unwrap();

        let mut data = make_data();
        data.current_tree = Some(Tree::new(N_DOCS, false));
        data.shard_map.on_start_new_tree();
        set_sums(&mut data, 0);

        let root_v1 = v1.compute_histogram(0, false, &data).unwrap();
        let root_v2 = v2.compute_histogram(0, false, &data).unwrap();
        for (a, b) in root_v1.data.iter().zip(&root_v2.data) {
            assert_eq!(a.weight.to_bits(), b.weight.to_bits());
            assert_eq!(a.gradient.to_bits(), b.gradient.to_bits());
        }

        // Split leaves round-robin on rotating thresholds
        let mut open: Vec<TreeNodeId> = vec![0];
        let mut threshold: Bucket = 1;
        for _ in 0..6 {
            let leaf = open.remove(0);
            if data.node(leaf).doc_ids.len() < 4 {
                continue;
            }

            let split = Split {
                spread: 1.0,
                feature: 0,
                node: leaf,
                threshold,
                inverse: false,
            };
            threshold = 1 + (threshold % (N_BUCKETS as Bucket - 1));

            let sig_v1 = v1.split_signature(leaf, &split, &data).unwrap();
            let sig_v2 = v2.split_signature(leaf, &split, &data).unwrap();
            let n = data.node(leaf).doc_ids.len() as DocId;
            for i in 0..n {
                assert_eq!(sig_v1.get(i), sig_v2.get(i), "signature mismatch at {i}");
            }

            // One side may be empty under a rotating threshold; skip those
            let mut sides = [0u32; 2];
            let mut cursor = sig_v1.cursor(0);
            for _ in 0..n {
                sides[cursor.next(&sig_v1) as usize] += 1;
            }
            if sides[0] == 0 || sides[1] == 0 {
                continue;
            }

            let (left, right) = data.tree_mut().split_node(leaf, &sig_v1);
            data.shard_map.split_tree_node(leaf, left, right);
            set_sums(&mut data, left);
            set_sums(&mut data, right);

            let mut mapping: Vec<DocId> = vec![0; n as usize];
            let mut counters: [DocId; 2] = [0, 0];
            let mut cursor = sig_v1.cursor(0);
            for slot in mapping.iter_mut() {
                let side = cursor.next(&sig_v1) as usize;
                *slot = counters[side];
                counters[side] += 1;
            }
            {
                let parent = data.tree_mut().node_mut(leaf);
                parent.split_signature = Some(sig_v1);
                parent.split_mapping = Some(mapping);
            }

            let hist_v1 = v1.compute_histogram(right, false, &data).unwrap();
            let hist_v2 = v2.compute_histogram(right, false, &data).unwrap();
            for (bucket, (a, b)) in hist_v1.data.iter().zip(&hist_v2.data).enumerate() {
                assert_eq!(a.weight.to_bits(), b.weight.to_bits(), "bucket {bucket}");
                assert_eq!(a.gradient.to_bits(), b.gradient.to_bits(), "bucket {bucket}");
            }

            {
                let parent = data.tree_mut().node_mut(leaf);
                parent.split_signature = None;
                parent.split_mapping = None;
            }

            open.push(left);
            open.push(right);
        }

        // The debug checksums inside assert stream fidelity
        v2.finalize_tree(&data).unwrap();
        v1.finalize_tree(&data).unwrap();
        data.shard_map.on_finalize_tree();

        // A second tree over the merged streams must behave identically
        data.current_tree = Some(Tree::new(N_DOCS, false));
        data.shard_map.on_start_new_tree();
        set_sums(&mut data, 0);
        let again_v1 = v1.compute_histogram(0, false, &data).unwrap();
        let again_v2 = v2.compute_histogram(0, false, &data).unwrap();
        for (a, b) in again_v1.data.iter().zip(&again_v2.data) {
            assert_eq!(a.weight.to_bits(), b.weight.to_bits());
            assert_eq!(a.gradient.to_bits(), b.gradient.to_bits());
        }
    }
}
