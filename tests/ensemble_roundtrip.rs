// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod common;

use common::{read_predictions, tsv, write_file};
use tealtree::workflow;
use test_log::test;

fn dataset() -> String {
    let mut rows = Vec::new();
    for i in 0..200u32 {
        let hash = i.wrapping_mul(2_654_435_761);
        let x = hash % 50;
        let y = (hash >> 8) % 11;
        let label = (x as f32).mul_add(0.1, (y as f32) * -0.2);
        rows.push(format!("{label},{x},{y}"));
    }
    tsv("Label,x,y", &rows)
}

fn train(data: &std::path::Path, model: &std::path::Path, n_trees: u32, warm: Option<&std::path::Path>) {
    let mut options = common::train_options(data, model);
    options.cost_function = "regression".into();
    options.n_trees = n_trees;
    options.n_leaves = 6;
    options.input_tree = warm.map(std::path::Path::to_path_buf);
    workflow::run(options).unwrap();
}

/// Training 4 trees in one run must serialize identically to training 2,
/// reloading, and training 2 more on top.
#[test]
fn warm_start_continues_byte_for_byte() {
    let dir = tempfile::tempdir().unwrap();
    let data = write_file(dir.path(), "train.tsv", &dataset());

    let full = dir.path().join("full.json");
    train(&data, &full, 4, None);

    let half = dir.path().join("half.json");
    train(&data, &half, 2, None);

    let resumed = dir.path().join("resumed.json");
    train(&data, &resumed, 2, Some(&half));

    assert_eq!(
        std::fs::read_to_string(&full).unwrap(),
        std::fs::read_to_string(&resumed).unwrap(),
        "warm-started run diverged from the uninterrupted run"
    );
}

/// Serialize -> load -> evaluate on the training data reproduces the scores
/// the ensemble would produce in memory.
#[test]
fn saved_model_replays_its_own_scores() {
    let dir = tempfile::tempdir().unwrap();
    let data = write_file(dir.path(), "train.tsv", &dataset());

    let model = dir.path().join("model.json");
    train(&data, &model, 5, None);

    let predictions_path = dir.path().join("predictions.txt");
    let mut options = common::evaluate_options(&data, &model);
    options.output_predictions = Some(predictions_path.clone());
    workflow::run(options).unwrap();
    let predictions = read_predictions(&predictions_path);

    // Replay the loaded ensemble by hand over the same rows
    let ensemble = tealtree::load_ensemble(&model).unwrap();
    let content = std::fs::read_to_string(&data).unwrap();
    for (line, prediction) in content.lines().skip(1).zip(&predictions) {
        let cells: Vec<f64> = line
            .split(',')
            .skip(1)
            .map(|cell| cell.parse().unwrap())
            .collect();

        let mut score = 0.0f32;
        for tree in &ensemble.trees {
            score += tree.evaluate(&cells);
        }
        assert!(
            (score - prediction).abs() < 1e-6,
            "replayed score {score} vs evaluated {prediction}"
        );
    }
    assert_eq!(200, predictions.len());
}
