// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

// Not every test binary uses every helper
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use tealtree::Options;

/// Writes a dataset file into `dir` and returns its path.
pub fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

/// Builds a TSV out of a header and rows.
pub fn tsv(header: &str, rows: &[String]) -> String {
    let mut content = String::from(header);
    content.push('\n');
    for row in rows {
        content.push_str(row);
        content.push('\n');
    }
    content
}

/// Common training options against a TSV file.
pub fn train_options(input: &Path, output: &Path) -> Options {
    Options {
        train: true,
        input_file: Some(input.to_path_buf()),
        output_tree: Some(output.to_path_buf()),
        n_threads: 2,
        ..Options::default()
    }
}

/// Common evaluation options against a TSV file.
pub fn evaluate_options(input: &Path, model: &Path) -> Options {
    Options {
        evaluate: true,
        input_file: Some(input.to_path_buf()),
        input_tree: Some(model.to_path_buf()),
        n_threads: 2,
        ..Options::default()
    }
}

/// Reads a predictions file written by `--output_predictions`.
pub fn read_predictions(path: &Path) -> Vec<f32> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| line.parse().unwrap())
        .collect()
}
