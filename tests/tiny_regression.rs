// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod common;

use common::{read_predictions, tsv, write_file};
use tealtree::{workflow, Spread, Step};
use test_log::test;

/// Three documents, one feature equal to the label. Boosted 2-leaf stumps
/// must drive the predictions onto the labels.
#[test]
fn stumps_fit_three_points() {
    let dir = tempfile::tempdir().unwrap();

    let rows: Vec<String> = [(0, 0), (1, 1), (2, 2)]
        .iter()
        .map(|(label, x)| format!("{label},{x}"))
        .collect();
    let data = write_file(dir.path(), "train.tsv", &tsv("Label,x", &rows));
    let model = dir.path().join("model.json");

    let mut options = common::train_options(&data, &model);
    options.cost_function = "regression".into();
    options.step = Step::Gradient;
    options.spread = Spread::Linear;
    options.n_trees = 60;
    options.n_leaves = 2;
    options.learning_rate = 0.3;
    workflow::run(options).unwrap();

    let ensemble = tealtree::load_ensemble(&model).unwrap();
    assert_eq!("regression", ensemble.cost_function);
    assert_eq!(60, ensemble.trees.len());

    // The root split of the first tree separates on x at 1 or 2
    let first = serde_json::to_string(&ensemble.trees[0]).unwrap();
    assert!(
        first.contains(r#""threshold":"1""#) || first.contains(r#""threshold":"2""#),
        "unexpected first split: {first}"
    );

    let predictions = dir.path().join("predictions.txt");
    let mut options = common::evaluate_options(&data, &model);
    options.output_predictions = Some(predictions.clone());
    workflow::run(options).unwrap();

    let predictions = read_predictions(&predictions);
    for (prediction, label) in predictions.iter().zip([0.0f32, 1.0, 2.0]) {
        assert!(
            (prediction - label).abs() < 0.05,
            "prediction {prediction} too far from label {label}"
        );
    }
}
