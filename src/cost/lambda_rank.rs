// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{sigmoid, sigmoid_prime, CostFunction};
use crate::{pool::ThreadPool, trainer::data::TrainerData, types::DocId};
use parking_lot::RwLock;
use std::cell::RefCell;
use std::sync::{Arc, LazyLock};

const DCG_CACHE_SIZE: usize = 10_000;

fn dcg_coefficient_explicit(pos: usize) -> f32 {
    #[allow(clippy::cast_precision_loss)]
    let coefficient = 1.0 / (2.0 + pos as f32).log2();
    coefficient
}

static DCG_CACHE: LazyLock<Vec<f32>> =
    LazyLock::new(|| (0..DCG_CACHE_SIZE).map(dcg_coefficient_explicit).collect());

/// `1 / log2(2 + pos)`, from the precomputed table where possible.
pub(crate) fn dcg_coefficient(pos: usize) -> f32 {
    DCG_CACHE
        .get(pos)
        .copied()
        .unwrap_or_else(|| dcg_coefficient_explicit(pos))
}

thread_local! {
    // Per-worker sort scratch, reused across queries
    static SORT_SCRATCH: RefCell<(Vec<DocId>, Vec<DocId>)> = RefCell::new((Vec::new(), Vec::new()));
}

/// LambdaRank: pairwise ranking gradients weighted by each pair's NDCG
/// impact at the model's current ranking.
#[derive(Clone, Copy, Debug, Default)]
pub struct LambdaRank {
    depth: DocId,
}

impl LambdaRank {
    /// `depth` caps the NDCG truncation; 0 means the full list.
    #[must_use]
    pub fn new(depth: DocId) -> Self {
        Self { depth }
    }

    /// Computes one query's (gradient, hessian) pairs into `out`, indexed by
    /// query-local document position.
    fn query_gradients(
        self,
        data: &TrainerData,
        query: usize,
        newton_step: bool,
        out: &mut Vec<(f32, f32)>,
        by_score: &mut Vec<DocId>,
        model_ranks: &mut Vec<DocId>,
    ) {
        let documents = &data.documents;
        let (begin, end) = data.query_range(query);
        let n = (end - begin) as usize;

        out.clear();
        out.resize(n, (0.0, 0.0));

        let idcg = data.idcgs[query];
        if idcg == 0.0 {
            // No relevant results; nothing to gain from this query
            return;
        }

        by_score.clear();
        by_score.extend(begin..end);
        by_score.sort_by(|&a, &b| {
            documents[b as usize]
                .score
                .total_cmp(&documents[a as usize].score)
        });

        // model_ranks[i] is the model rank of the i-th best document in the
        // ideal (label-sorted) order; delta-NDCG is a function of model
        // ranks, but the pair loop walks documents in ideal order.
        model_ranks.clear();
        model_ranks.resize(n, 0);
        for (model_rank, &doc) in by_score.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let rank = model_rank as DocId;
            model_ranks[data.ranks[doc as usize] as usize] = rank;
        }

        let sorted = &data.sorted_doc_ids[begin as usize..end as usize];

        let mut index = 0usize;
        while index < n {
            let mut index2 = index;
            while index2 < n
                && documents[sorted[index2] as usize]
                    .target_score
                    .total_cmp(&documents[sorted[index] as usize].target_score)
                    .is_eq()
            {
                index2 += 1;
            }
            if index2 >= n {
                break;
            }

            for i in index..index2 {
                for j in index2..n {
                    let di = sorted[i] as usize;
                    let dj = sorted[j] as usize;
                    let rank_i = model_ranks[i];
                    let rank_j = model_ranks[j];

                    if self.depth > 0 && rank_i >= self.depth && rank_j >= self.depth {
                        continue;
                    }

                    let delta_ndcg = ((documents[di].target_score - documents[dj].target_score)
                        * (dcg_coefficient(rank_i as usize) - dcg_coefficient(rank_j as usize))
                        / idcg)
                        .abs();

                    let score_i = documents[di].score;
                    let score_j = documents[dj].score;
                    let grad_delta = delta_ndcg * sigmoid(score_j - score_i);

                    out[di - begin as usize].0 -= grad_delta;
                    out[dj - begin as usize].0 += grad_delta;

                    if newton_step {
                        let hessian_delta = delta_ndcg * sigmoid_prime(score_i - score_j);
                        out[di - begin as usize].1 += hessian_delta;
                        out[dj - begin as usize].1 += hessian_delta;
                    }
                }
            }

            index = index2;
        }
    }

    fn apply(data: &mut TrainerData, query: usize, gradients: &[(f32, f32)]) {
        let (begin, _) = data.query_range(query);
        for (i, &(gradient, hessian)) in gradients.iter().enumerate() {
            let doc = &mut data.documents[begin as usize + i];
            doc.gradient = gradient;
            doc.hessian = hessian;
        }
    }
}

impl CostFunction for LambdaRank {
    fn name(&self) -> String {
        "lambda_rank".into()
    }

    fn is_query_based(&self) -> bool {
        true
    }

    /// Builds the per-query ideal order, each document's ideal rank, and the
    /// ideal DCG truncated at `depth`.
    fn precompute(&self, data: &mut TrainerData) {
        let n = data.documents.len();
        data.sorted_doc_ids = vec![0; n];
        data.ranks = vec![0; n];
        data.idcgs.clear();

        for query in 0..data.n_queries() {
            let (begin, end) = data.query_range(query);

            for doc in begin..end {
                data.sorted_doc_ids[doc as usize] = doc;
            }

            let documents = &data.documents;
            data.sorted_doc_ids[begin as usize..end as usize].sort_by(|&a, &b| {
                documents[b as usize]
                    .target_score
                    .total_cmp(&documents[a as usize].target_score)
            });

            for (rank, &doc) in data.sorted_doc_ids[begin as usize..end as usize]
                .iter()
                .enumerate()
            {
                #[allow(clippy::cast_possible_truncation)]
                let rank = rank as DocId;
                data.ranks[doc as usize] = rank;
            }

            let mut top = (end - begin) as usize;
            if self.depth > 0 {
                top = top.min(self.depth as usize);
            }

            let mut idcg = 0.0f32;
            for i in 0..top {
                let doc = data.sorted_doc_ids[begin as usize + i];
                idcg += dcg_coefficient(i) * data.documents[doc as usize].target_score;
            }
            data.idcgs.push(idcg);
        }
    }

    fn compute_gradient(&self, data: &mut TrainerData, newton_step: bool) {
        let mut out = Vec::new();
        let mut by_score = Vec::new();
        let mut model_ranks = Vec::new();

        for query in 0..data.n_queries() {
            self.query_gradients(data, query, newton_step, &mut out, &mut by_score, &mut model_ranks);
            Self::apply(data, query, &out);
        }
    }

    /// One task per query; each worker reads the shared state, computes its
    /// query's gradient vector into thread-local scratch and hands the
    /// result back, so every document is written by the driver alone.
    fn compute_gradient_pooled(
        &self,
        data: &Arc<RwLock<TrainerData>>,
        newton_step: bool,
        pool: &ThreadPool,
    ) -> crate::Result<()> {
        let n_queries = data.read().n_queries();
        let (tx, rx) = crossbeam_channel::unbounded::<(usize, Vec<(f32, f32)>)>();

        let this = *self;
        for query in 0..n_queries {
            let data = Arc::clone(data);
            let tx = tx.clone();
            pool.execute(move || {
                let guard = data.read();
                let gradients = SORT_SCRATCH.with(|scratch| {
                    let (by_score, model_ranks) = &mut *scratch.borrow_mut();
                    let mut out = Vec::new();
                    this.query_gradients(&guard, query, newton_step, &mut out, by_score, model_ranks);
                    out
                });
                let _ = tx.send((query, gradients));
            })?;
        }
        drop(tx);

        // Collect every result before taking the write lock: pending
        // workers still need read access.
        let mut results: Vec<Option<Vec<(f32, f32)>>> = (0..n_queries).map(|_| None).collect();
        for _ in 0..n_queries {
            let (query, gradients) = rx.recv().map_err(|_| crate::Error::QueueAborted)?;
            results[query] = Some(gradients);
        }

        let mut guard = data.write();
        for (query, gradients) in results.into_iter().enumerate() {
            let gradients =
                gradients.ok_or_else(|| crate::Error::Train("a query task vanished".into()))?;
            Self::apply(&mut guard, query, &gradients);
        }

        Ok(())
    }

    fn default_metric_name(&self) -> String {
        if self.depth == 0 {
            "ndcg".into()
        } else {
            format!("ndcg@{}", self.depth)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LambdaRank;
    use crate::cost::CostFunction;
    use crate::trainer::data::TrainerData;
    use test_log::test;

    fn ranked_data(labels: &[f32]) -> TrainerData {
        #[allow(clippy::cast_possible_truncation)]
        let n = labels.len() as u32;
        TrainerData::new(labels, vec![0, n])
    }

    #[test]
    fn higher_labels_get_negative_gradients() {
        // Gradients are descent directions: negative gradient means the
        // model should push the score up.
        let mut data = ranked_data(&[2.0, 1.0, 1.0, 0.0]);
        let cost = LambdaRank::new(0);
        cost.precompute(&mut data);
        cost.compute_gradient(&mut data, false);

        assert!(data.documents[0].gradient < 0.0);
        assert!(data.documents[3].gradient > 0.0);
    }

    #[test]
    fn label_ties_share_gradients_at_equal_scores() {
        let mut data = ranked_data(&[2.0, 1.0, 1.0, 0.0]);
        let cost = LambdaRank::new(0);
        cost.precompute(&mut data);
        cost.compute_gradient(&mut data, false);

        // Docs 1 and 2 carry the same label and the same (zero) score, so
        // their gradients must agree exactly.
        assert_eq!(
            data.documents[1].gradient.to_bits(),
            data.documents[2].gradient.to_bits()
        );
    }

    #[test]
    fn zero_idcg_query_contributes_nothing() {
        let mut data = ranked_data(&[0.0, 0.0, 0.0]);
        let cost = LambdaRank::new(0);
        cost.precompute(&mut data);
        cost.compute_gradient(&mut data, true);

        for doc in &data.documents {
            assert!((doc.gradient).abs() < f32::EPSILON);
            assert!((doc.hessian).abs() < f32::EPSILON);
        }
    }

    #[test]
    fn depth_limits_the_pair_set() {
        let labels: Vec<f32> = (0..20).map(|i| (19 - i) as f32).collect();
        let mut full = ranked_data(&labels);
        let mut truncated = ranked_data(&labels);

        let cost = LambdaRank::new(0);
        cost.precompute(&mut full);
        cost.compute_gradient(&mut full, false);

        let cost = LambdaRank::new(3);
        cost.precompute(&mut truncated);
        cost.compute_gradient(&mut truncated, false);

        // Pairs entirely below the cutoff vanish, so the tail documents see
        // weaker gradients under truncation.
        let tail_full: f32 = full.documents[10..].iter().map(|d| d.gradient.abs()).sum();
        let tail_truncated: f32 = truncated.documents[10..].iter().map(|d| d.gradient.abs()).sum();
        assert!(tail_truncated < tail_full);
    }
}
