// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod common;

use common::{read_predictions, tsv, write_file};
use tealtree::{workflow, Step};
use test_log::test;

/// Balanced labels with one perfectly separating feature: training accuracy
/// must reach 1.0.
#[test]
fn separable_data_is_learned_exactly() {
    let dir = tempfile::tempdir().unwrap();

    let mut rows = Vec::new();
    let mut labels = Vec::new();
    for i in 0..40u32 {
        let label = u32::from(i % 2 == 0);
        let separating = 10 + 5 * label;
        let noise = i.wrapping_mul(2_654_435_761) % 17;
        rows.push(format!("{label},{separating},{noise}"));
        labels.push(label);
    }
    let data = write_file(dir.path(), "train.tsv", &tsv("Label,good,noise", &rows));
    let model = dir.path().join("model.json");

    let mut options = common::train_options(&data, &model);
    options.cost_function = "binary_classification".into();
    options.step = Step::Newton;
    options.n_trees = 10;
    options.n_leaves = 2;
    workflow::run(options).unwrap();

    let predictions = dir.path().join("predictions.txt");
    let mut options = common::evaluate_options(&data, &model);
    options.output_predictions = Some(predictions.clone());
    workflow::run(options).unwrap();

    for (prediction, label) in read_predictions(&predictions).iter().zip(labels) {
        // Predictions are sigmoid-transformed scores
        assert_eq!(
            label == 1,
            *prediction >= 0.5,
            "prediction {prediction} misclassifies label {label}"
        );
    }
}
