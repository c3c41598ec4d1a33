// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A gradient boosted decision tree (GBDT) toolkit.
//!
//! ##### About
//!
//! TealTree trains tree ensembles for regression, binary classification and
//! learning-to-rank (LambdaRank), and evaluates trained ensembles against
//! held-out data.
//!
//! Raw feature columns are bucketized into at most `2^bucket_max_bits`
//! discrete buckets, then stored either densely (a bit-packed vector of
//! bucket codes) or sparsely (a default bucket plus explicit
//! (doc-id-delta, code) streams). Tree growth is histogram based: for every
//! open leaf and feature a per-bucket (gradient, weight) histogram is
//! accumulated, the best threshold is found by a prefix-sum scan, and the
//! sibling leaf's histogram is derived by subtraction from its parent.
//!
//! The sharded sparse layout ("sparse v2") keeps each live leaf's documents
//! contiguous inside the feature streams, so a split touches only the
//! documents of the leaf being split instead of the whole stream.
//!
//! # Example usage
//!
//! ```no_run
//! use tealtree::{Options, workflow};
//!
//! let mut options = Options::default();
//! options.train = true;
//! options.input_file = Some("train.tsv".into());
//! options.input_format = tealtree::InputFormat::Tsv;
//! options.cost_function = "regression".into();
//! options.n_trees = 10;
//! options.n_leaves = 8;
//! options.output_tree = Some("ensemble.json".into());
//!
//! workflow::run(options)?;
//! # Ok::<(), tealtree::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

mod binary_search;
mod bucketizer;

pub mod buckets;

mod checksum;
mod compact_vector;

pub mod config;
pub mod cost;

mod ensemble;
mod error;

pub mod evaluate;
pub mod feature;

mod histogram;
mod metadata;

pub mod metric;

mod pool;

pub mod queue;
pub mod raw_feature;
pub mod reader;

mod scratch;
mod split;

pub mod trainer;

mod tree;
mod types;
mod var_int_buffer;

pub mod workflow;

pub use checksum::Checksum;
pub use compact_vector::{CompactCursor, CompactVector, CompactWriter};
pub use config::{InputFormat, Options, SparseFeatureVersion, Spread, Step};
pub use ensemble::{load_ensemble, Ensemble, NodeLite, SplitLite, TreeLite, TreeWriter};
pub use error::{Error, Result};
pub use histogram::{Histogram, HistogramItem};
pub use metadata::FeatureMetadata;
pub use pool::ThreadPool;
pub use split::{Split, SplitSignature};
pub use tree::{Tree, TreeNode, TreeNodeDebugInfo};
pub use types::{Bucket, DocId, FeatureIndex, NumberFormatError, RawFeatureType, RawValue, TreeNodeId};
pub use var_int_buffer::{VarIntBuffer, VarIntCursor, VarIntWriter};
