// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod lambda_rank;
pub mod regression;

use crate::{pool::ThreadPool, trainer::data::TrainerData};
use enum_dispatch::enum_dispatch;
use parking_lot::RwLock;
use std::sync::Arc;

pub use lambda_rank::LambdaRank;
pub use regression::{LinearRegression, LogisticRegression};

pub(crate) fn sigmoid(x: f32) -> f32 {
    let e = x.exp();
    e / (1.0 + e)
}

pub(crate) fn sigmoid_prime(x: f32) -> f32 {
    let s = sigmoid(x);
    s * (1.0 - s)
}

/// A training objective: computes per-document gradients (and hessians) and
/// defines how raw model scores map to predictions.
#[enum_dispatch]
pub trait CostFunction {
    /// Stable name, persisted in the ensemble.
    fn name(&self) -> String;

    /// Whether gradients are computed per query rather than per document.
    fn is_query_based(&self) -> bool {
        false
    }

    /// One-time setup before the first tree.
    fn precompute(&self, data: &mut TrainerData) {
        let _ = data;
    }

    /// Recomputes every document's gradient (and hessian, under Newton
    /// step) from its current score.
    fn compute_gradient(&self, data: &mut TrainerData, newton_step: bool);

    /// Like [`CostFunction::compute_gradient`], but allowed to fan work out
    /// over the pool. The default just takes the write lock and runs
    /// serially.
    fn compute_gradient_pooled(
        &self,
        data: &Arc<RwLock<TrainerData>>,
        newton_step: bool,
        pool: &ThreadPool,
    ) -> crate::Result<()> {
        let _ = pool;
        self.compute_gradient(&mut data.write(), newton_step);
        Ok(())
    }

    /// Maps accumulated scores into prediction space (e.g. sigmoid for
    /// logistic regression).
    fn transform_scores(&self, scores: &mut [f32]) {
        let _ = scores;
    }

    /// The metric evaluation defaults to for this objective.
    fn default_metric_name(&self) -> String;
}

/// The closed set of supported cost functions.
#[enum_dispatch(CostFunction)]
#[derive(Clone, Copy)]
pub enum AnyCostFunction {
    /// Squared-error regression
    LinearRegression,
    /// Binary classification via log loss
    LogisticRegression,
    /// Learning-to-rank
    LambdaRank,
}

/// Resolves a `--cost_function` value, e.g. `regression` or
/// `lambda_rank@10`.
pub fn create_cost_function(name: &str) -> crate::Result<AnyCostFunction> {
    match name {
        "regression" => return Ok(LinearRegression.into()),
        "binary_classification" => return Ok(LogisticRegression.into()),
        _ => {}
    }

    if let Some(rest) = name.strip_prefix("lambda_rank") {
        let depth = if rest.is_empty() {
            0
        } else if let Some(depth) = rest.strip_prefix('@') {
            depth
                .parse()
                .map_err(|_| crate::Error::Config(format!("bad lambda_rank depth: {name}")))?
        } else {
            return Err(crate::Error::Config(format!("unknown cost function: {name}")));
        };
        return Ok(LambdaRank::new(depth).into());
    }

    Err(crate::Error::Config(format!("unknown cost function: {name}")))
}
