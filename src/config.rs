// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Run configuration: every command line flag, with defaults, plus the
//! cross-flag validation the parser cannot express.

use crate::types::RawFeatureType;
use clap::Parser;
use std::path::PathBuf;
use std::str::FromStr;

/// Input file format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum InputFormat {
    /// Header-described separated columns
    Tsv,
    /// SVM-light rows (`label qid:Q idx:val ...`)
    Svm,
}

/// Which sparse feature layout to use.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum SparseFeatureVersion {
    /// Plain streams, rescanned per split
    V1,
    /// Sharded streams, split work proportional to the leaf
    V2,
    /// v1 for small trees (`n_leaves < 100`), v2 otherwise
    Auto,
}

/// Gradient descent step flavor.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum Step {
    /// First-order step; histograms weigh documents equally
    Gradient,
    /// Second-order step; histograms weigh documents by hessian
    Newton,
}

/// Split scoring formula.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum Spread {
    /// Absolute difference of the sides' mean gradients
    Linear,
    /// Reduction of variance, with regularization
    Quadratic,
}

fn parse_raw_feature_type(s: &str) -> Result<RawFeatureType, String> {
    RawFeatureType::from_str(s).map_err(|e| e.to_string())
}

/// All run options.
#[derive(Clone, Debug, Parser)]
#[command(name = "tealtree", about = "TealTree gradient boosting decision tree toolkit", version)]
pub struct Options {
    /// Train a model.
    #[arg(long, conflicts_with = "evaluate")]
    pub train: bool,

    /// Evaluate a model.
    #[arg(long)]
    pub evaluate: bool,

    /// Minimum severity of logging messages; 0=trace, 1=debug, 2=info, 3=warning, 4=error.
    #[arg(long, default_value_t = 2)]
    pub logging_severity: u32,

    /// Input file to read data from.
    #[arg(long)]
    pub input_file: Option<PathBuf>,

    /// Command whose output is read as input data.
    #[arg(long, conflicts_with = "input_file")]
    pub input_pipe: Option<String>,

    /// Input file format.
    #[arg(long, value_enum, default_value_t = InputFormat::Tsv)]
    pub input_format: InputFormat,

    /// File containing feature names, one per line (SVM format).
    #[arg(long)]
    pub feature_names_file: Option<PathBuf>,

    /// Output file for the trained ensemble.
    #[arg(long)]
    pub output_tree: Option<PathBuf>,

    /// Separator of the input TSV file.
    #[arg(long, default_value_t = ',')]
    pub tsv_separator: char,

    /// Name of the label column in the input TSV file.
    #[arg(long, default_value = "Label")]
    pub tsv_label: String,

    /// Name of the query column in the input TSV file.
    #[arg(long, default_value = "Query")]
    pub tsv_query: String,

    /// Query id prefix in the input SVM file.
    #[arg(long, default_value = "qid")]
    pub svm_query: String,

    /// Default type to parse feature values as.
    #[arg(long, value_parser = parse_raw_feature_type, default_value = "uint8")]
    pub default_raw_feature_type: RawFeatureType,

    /// Seed for the random number generator; 0 draws one from the OS.
    #[arg(long, default_value_t = 1)]
    pub random_seed: u64,

    /// Subsample only a fraction of input documents.
    #[arg(long, default_value_t = 1.0)]
    pub input_sample_rate: f32,

    /// Base score of the model.
    #[arg(long, default_value_t = 0.0)]
    pub base_score: f32,

    /// Bucketize each feature into at most 2^bucket_max_bits values (1..16).
    #[arg(long, default_value_t = 12)]
    pub bucket_max_bits: u32,

    /// Features sparser than this are encoded in sparse format.
    #[arg(long, default_value_t = 0.1)]
    pub sparsity_threshold: f32,

    /// Initial tail fraction for sharded sparse features.
    #[arg(long, default_value_t = 0.03)]
    pub initial_tail_size: f32,

    /// Which sparse feature implementation to use.
    #[arg(long, value_enum, default_value_t = SparseFeatureVersion::Auto)]
    pub sparse_feature_version: SparseFeatureVersion,

    /// Number of worker threads; 0 uses all hardware threads.
    #[arg(long, default_value_t = 0)]
    pub n_threads: u32,

    /// Cost function: regression, binary_classification, or lambda_rank@N.
    #[arg(long, default_value = "")]
    pub cost_function: String,

    /// Gradient descent step flavor.
    #[arg(long, value_enum, default_value_t = Step::Newton)]
    pub step: Step,

    /// Transform labels as 2^label - 1 (often used for LambdaRank).
    #[arg(long)]
    pub exponentiate_label: bool,

    /// Number of leaves per tree.
    #[arg(long, default_value_t = 0)]
    pub n_leaves: u32,

    /// Maximum tree depth; 0 disables the limit.
    #[arg(long, default_value_t = 0)]
    pub max_depth: u32,

    /// Number of trees in the ensemble.
    #[arg(long, default_value_t = 0)]
    pub n_trees: u32,

    /// Minimum number of documents in a node.
    #[arg(long, default_value_t = 1)]
    pub min_node_docs: u32,

    /// Minimum cumulative hessian in a node.
    #[arg(long, default_value_t = 1.0)]
    pub min_node_hessian: f32,

    /// Step size coefficient.
    #[arg(long, default_value_t = 0.1)]
    pub learning_rate: f32,

    /// Split scoring formula.
    #[arg(long, value_enum, default_value_t = Spread::Quadratic)]
    pub spread: Spread,

    /// Regularization parameter for the quadratic spread.
    #[arg(long, default_value_t = 1.0)]
    pub regularization_lambda: f32,

    /// Store per-node debug information in the output ensemble.
    #[arg(long)]
    pub tree_debug_info: bool,

    /// A trained ensemble: the model to evaluate, or the warm start state
    /// for training.
    #[arg(long)]
    pub input_tree: Option<PathBuf>,

    /// Metric to compute, if different from the cost function's default.
    #[arg(long)]
    pub metric: Option<String>,

    /// Optional output file for per-epoch metric values.
    #[arg(long)]
    pub output_epochs: Option<PathBuf>,

    /// Optional output file for per-row predictions.
    #[arg(long)]
    pub output_predictions: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            train: false,
            evaluate: false,
            logging_severity: 2,
            input_file: None,
            input_pipe: None,
            input_format: InputFormat::Tsv,
            feature_names_file: None,
            output_tree: None,
            tsv_separator: ',',
            tsv_label: "Label".into(),
            tsv_query: "Query".into(),
            svm_query: "qid".into(),
            default_raw_feature_type: RawFeatureType::Uint8,
            random_seed: 1,
            input_sample_rate: 1.0,
            base_score: 0.0,
            bucket_max_bits: 12,
            sparsity_threshold: 0.1,
            initial_tail_size: 0.03,
            sparse_feature_version: SparseFeatureVersion::Auto,
            n_threads: 0,
            cost_function: String::new(),
            step: Step::Newton,
            exponentiate_label: false,
            n_leaves: 0,
            max_depth: 0,
            n_trees: 0,
            min_node_docs: 1,
            min_node_hessian: 1.0,
            learning_rate: 0.1,
            spread: Spread::Quadratic,
            regularization_lambda: 1.0,
            tree_debug_info: false,
            input_tree: None,
            metric: None,
            output_epochs: None,
            output_predictions: None,
        }
    }
}

impl Options {
    /// Cross-flag validation.
    pub fn validate(&self) -> crate::Result<()> {
        let fail = |msg: &str| Err(crate::Error::Config(msg.into()));

        if self.train == self.evaluate {
            return fail("exactly one of --train / --evaluate must be set");
        }
        if self.input_file.is_some() && self.input_pipe.is_some() {
            return fail("--input_file and --input_pipe are mutually exclusive");
        }
        if !(1..=16).contains(&self.bucket_max_bits) {
            return fail("--bucket_max_bits must be in 1..16");
        }
        if !(0.0..=1.0).contains(&self.input_sample_rate) {
            return fail("--input_sample_rate must be in 0..1");
        }
        if !(0.0..=1.0).contains(&self.sparsity_threshold) {
            return fail("--sparsity_threshold must be in 0..1");
        }
        if !(0.0..=1.0).contains(&self.initial_tail_size) {
            return fail("--initial_tail_size must be in 0..1");
        }
        if self.regularization_lambda < 0.0 {
            return fail("--regularization_lambda must not be negative");
        }

        if self.train {
            if self.output_tree.is_none() {
                return fail("--output_tree must be set");
            }
            if self.n_trees == 0 {
                return fail("--n_trees must be set");
            }
            if self.n_leaves < 2 {
                return fail("--n_leaves must be at least 2");
            }
            if self.cost_function.is_empty() {
                return fail("--cost_function must be set");
            }
            if self.learning_rate <= 0.0 {
                return fail("--learning_rate must be positive");
            }
            if self.min_node_docs == 0 {
                return fail("--min_node_docs must be positive");
            }
            if self.min_node_hessian <= 0.0 {
                return fail("--min_node_hessian must be positive");
            }
        }

        if self.evaluate && self.input_tree.is_none() {
            return fail("--input_tree must be set");
        }

        Ok(())
    }

    /// Whether sparse features use the sharded layout for this run.
    #[must_use]
    pub fn sparse_v2(&self) -> bool {
        match self.sparse_feature_version {
            SparseFeatureVersion::V1 => false,
            SparseFeatureVersion::V2 => true,
            SparseFeatureVersion::Auto => self.n_leaves >= 100,
        }
    }
}
