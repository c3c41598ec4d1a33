// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    feature::sharded::ShardMapping,
    tree::{Tree, TreeNode},
    types::{DocId, TreeNodeId},
};

/// One training document.
#[derive(Clone, Copy, Debug, Default)]
pub struct Document {
    /// Position in the training set.
    pub doc_id: DocId,
    /// Index of the query this document belongs to.
    pub query_id: DocId,
    /// The label.
    pub target_score: f32,
    /// Running model prediction.
    pub score: f32,
    /// Current cost gradient.
    pub gradient: f32,
    /// Current cost hessian (Newton step only).
    pub hessian: f32,
}

/// Shared training state: the documents, the per-query tables used by
/// LambdaRank, the tree being grown and the sparse shard map.
///
/// Lives behind an `RwLock`: worker tasks read it while computing
/// histograms and gradients; the driver takes the write lock between task
/// batches to commit splits, scores and shard bookkeeping.
#[derive(Debug, Default)]
pub struct TrainerData {
    /// All documents, indexed by doc id.
    pub documents: Vec<Document>,
    /// Doc id of each query's first document, plus a final total-count entry.
    pub query_limits: Vec<DocId>,
    /// Per-query doc ids sorted by label descending (LambdaRank).
    pub sorted_doc_ids: Vec<DocId>,
    /// Each document's rank in its query's ideal order (LambdaRank).
    pub ranks: Vec<DocId>,
    /// Per-query ideal DCG (LambdaRank).
    pub idcgs: Vec<f32>,
    /// The tree currently being grown.
    pub current_tree: Option<Tree>,
    /// Live-leaf shard bookkeeping for sparse v2 features.
    pub shard_map: ShardMapping,
}

impl TrainerData {
    /// Builds the document array from labels and query boundaries.
    #[must_use]
    pub fn new(labels: &[f32], query_limits: Vec<DocId>) -> Self {
        let mut documents: Vec<Document> = labels
            .iter()
            .enumerate()
            .map(|(i, &label)| {
                #[allow(clippy::cast_possible_truncation)]
                let doc_id = i as DocId;
                Document {
                    doc_id,
                    target_score: label,
                    ..Document::default()
                }
            })
            .collect();

        for (query, window) in query_limits.windows(2).enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let query_id = query as DocId;
            for doc in &mut documents[window[0] as usize..window[1] as usize] {
                doc.query_id = query_id;
            }
        }

        Self {
            documents,
            query_limits,
            ..Self::default()
        }
    }

    /// Number of documents.
    #[must_use]
    pub fn n_docs(&self) -> DocId {
        #[allow(clippy::cast_possible_truncation)]
        let n = self.documents.len() as DocId;
        n
    }

    /// Number of queries.
    #[must_use]
    pub fn n_queries(&self) -> usize {
        self.query_limits.len().saturating_sub(1)
    }

    /// Half-open doc-id range of one query.
    #[must_use]
    pub fn query_range(&self, query: usize) -> (DocId, DocId) {
        (self.query_limits[query], self.query_limits[query + 1])
    }

    /// The tree currently being grown.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tree's lifetime.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn tree(&self) -> &Tree {
        self.current_tree.as_ref().expect("no tree is being grown")
    }

    /// Mutable access to the tree currently being grown.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tree's lifetime.
    #[allow(clippy::expect_used)]
    pub fn tree_mut(&mut self) -> &mut Tree {
        self.current_tree.as_mut().expect("no tree is being grown")
    }

    /// Borrows one node of the current tree.
    #[must_use]
    pub fn node(&self, id: TreeNodeId) -> &TreeNode {
        self.tree().node(id)
    }
}

#[cfg(test)]
mod tests {
    use super::TrainerData;
    use test_log::test;

    #[test]
    fn documents_carry_query_ids() {
        let data = TrainerData::new(&[1.0, 2.0, 3.0, 4.0], vec![0, 2, 4]);
        assert_eq!(2, data.n_queries());
        assert_eq!(0, data.documents[1].query_id);
        assert_eq!(1, data.documents[2].query_id);
        assert_eq!((2, 4), data.query_range(1));
    }
}
