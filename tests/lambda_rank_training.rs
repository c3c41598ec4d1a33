// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod common;

use common::{tsv, write_file};
use tealtree::workflow;
use test_log::test;

/// Learning-to-rank end to end: with a feature that orders documents
/// perfectly, NDCG on the training queries approaches 1 and improves over
/// the epochs.
#[test]
fn ranking_converges_on_informative_feature() {
    let dir = tempfile::tempdir().unwrap();

    let mut rows = Vec::new();
    for query in 0..8u32 {
        for doc in 0..6u32 {
            let label = doc % 3;
            let informative = 1 + label * 7 + (doc % 2);
            let noise = (query * 31 + doc * 17) % 13;
            rows.push(format!("{label},q{query},{informative},{noise}"));
        }
    }
    let data = write_file(dir.path(), "train.tsv", &tsv("Label,Query,f,g", &rows));
    let model = dir.path().join("model.json");

    let mut options = common::train_options(&data, &model);
    options.cost_function = "lambda_rank".into();
    options.exponentiate_label = true;
    options.n_trees = 30;
    options.n_leaves = 4;
    options.learning_rate = 0.2;
    workflow::run(options).unwrap();

    let epochs_path = dir.path().join("epochs.txt");
    let mut options = common::evaluate_options(&data, &model);
    options.exponentiate_label = true;
    options.output_epochs = Some(epochs_path.clone());
    workflow::run(options).unwrap();

    let epochs: Vec<f32> = std::fs::read_to_string(&epochs_path)
        .unwrap()
        .lines()
        .map(|line| line.parse().unwrap())
        .collect();

    assert_eq!(30, epochs.len());
    let last = *epochs.last().unwrap();
    assert!(last > 0.95, "final NDCG too low: {last}");
    assert!(last >= epochs[0], "NDCG regressed over training");
}
