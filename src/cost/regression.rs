// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{sigmoid, sigmoid_prime, CostFunction};
use crate::{trainer::data::TrainerData, types::EPSILON};

/// Squared-error regression: `gradient = score - label`, unit hessian.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinearRegression;

impl CostFunction for LinearRegression {
    fn name(&self) -> String {
        "regression".into()
    }

    fn compute_gradient(&self, data: &mut TrainerData, newton_step: bool) {
        for doc in &mut data.documents {
            doc.gradient = doc.score - doc.target_score;
            if newton_step {
                doc.hessian = 1.0;
            }
        }
    }

    fn default_metric_name(&self) -> String {
        "rmse".into()
    }
}

/// Binary classification via log loss: `gradient = sigmoid(score) - label`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogisticRegression;

impl CostFunction for LogisticRegression {
    fn name(&self) -> String {
        "binary_classification".into()
    }

    fn compute_gradient(&self, data: &mut TrainerData, newton_step: bool) {
        for doc in &mut data.documents {
            doc.gradient = sigmoid(doc.score) - doc.target_score;
            if newton_step {
                doc.hessian = sigmoid_prime(doc.score).max(EPSILON);
            }
        }
    }

    fn transform_scores(&self, scores: &mut [f32]) {
        for score in scores {
            *score = sigmoid(*score);
        }
    }

    fn default_metric_name(&self) -> String {
        "accuracy".into()
    }
}

#[cfg(test)]
mod tests {
    use super::{CostFunction, LinearRegression, LogisticRegression};
    use crate::trainer::data::TrainerData;
    use test_log::test;

    #[test]
    fn regression_gradient_is_residual() {
        let mut data = TrainerData::new(&[1.0, 2.0], vec![0, 2]);
        data.documents[0].score = 3.0;
        data.documents[1].score = 2.0;

        LinearRegression.compute_gradient(&mut data, true);
        assert!((data.documents[0].gradient - 2.0).abs() < 1e-6);
        assert!((data.documents[1].gradient).abs() < 1e-6);
        assert!((data.documents[0].hessian - 1.0).abs() < 1e-6);
    }

    #[test]
    fn logistic_gradient_points_towards_label() {
        let mut data = TrainerData::new(&[1.0, 0.0], vec![0, 2]);

        LogisticRegression.compute_gradient(&mut data, true);
        assert!(data.documents[0].gradient < 0.0);
        assert!(data.documents[1].gradient > 0.0);
        assert!(data.documents[0].hessian > 0.0);

        let mut scores = vec![0.0];
        LogisticRegression.transform_scores(&mut scores);
        assert!((scores[0] - 0.5).abs() < 1e-6);
    }
}
