// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod svm;
pub mod tsv;

use crate::{
    raw_feature::{DynamicRawColumn, QueryColumn},
    types::{DocId, RawFeatureType, RawValue},
};
use rand::{rngs::StdRng, Rng};
use std::io::BufRead;
use std::path::Path;
use std::process::{Child, Command, Stdio};

/// Where training or evaluation rows come from: a file, a shell command's
/// stdout, or stdin.
pub enum LineSource {
    /// A regular file
    File(std::io::BufReader<std::fs::File>),
    /// A spawned command's stdout
    Pipe(Child, std::io::BufReader<std::process::ChildStdout>),
    /// Standard input
    Stdin(std::io::BufReader<std::io::Stdin>),
}

impl LineSource {
    /// Opens the configured source; returns it with a printable name.
    pub fn open(input_file: Option<&Path>, input_pipe: Option<&str>) -> crate::Result<(Self, String)> {
        if let Some(path) = input_file {
            let file = std::fs::File::open(path)?;
            return Ok((
                Self::File(std::io::BufReader::new(file)),
                path.display().to_string(),
            ));
        }

        if let Some(command) = input_pipe {
            let mut child = Command::new("sh")
                .arg("-c")
                .arg(command)
                .stdout(Stdio::piped())
                .spawn()?;
            let stdout = child.stdout.take().ok_or_else(|| {
                crate::Error::InputParse("input pipe has no stdout".into())
            })?;
            return Ok((
                Self::Pipe(child, std::io::BufReader::new(stdout)),
                "pipe".into(),
            ));
        }

        Ok((
            Self::Stdin(std::io::BufReader::new(std::io::stdin())),
            "stdin".into(),
        ))
    }

    /// The next line without its trailing newline; `None` at end of stream.
    pub fn next_line(&mut self) -> crate::Result<Option<String>> {
        let mut line = String::new();
        let n = match self {
            Self::File(reader) => reader.read_line(&mut line)?,
            Self::Pipe(_, reader) => reader.read_line(&mut line)?,
            Self::Stdin(reader) => reader.read_line(&mut line)?,
        };

        if n == 0 {
            return Ok(None);
        }

        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }
}

impl Drop for LineSource {
    fn drop(&mut self) {
        if let Self::Pipe(child, _) = self {
            let _ = child.wait();
        }
    }
}


/// Receives the parsed cells of a data stream.
///
/// Implemented by the training-side column collector and by the
/// evaluation-side row builder.
pub trait RowSink {
    /// Registers a feature column; returns its index.
    fn add_feature(&mut self, name: &str) -> crate::Result<usize>;

    /// One row's label cell.
    fn label(&mut self, cell: &str) -> crate::Result<()>;

    /// One row's query cell.
    fn query(&mut self, cell: &str) -> crate::Result<()>;

    /// One feature cell. `doc_id` is the row's document id; rows may skip
    /// feature indices (SVM), which default to zero.
    fn feature(&mut self, index: usize, cell: &str, doc_id: DocId) -> crate::Result<()>;

    /// Marks the end of a row.
    fn end_row(&mut self, doc_id: DocId) -> crate::Result<()>;

    /// Marks the end of the stream.
    fn finish(&mut self, n_docs: DocId) -> crate::Result<()>;
}

/// Row subsampling driven by the run's seeded RNG; optionally keeps or
/// drops whole queries together.
pub struct Sampler {
    rate: f32,
    rng: StdRng,
    group_by_query: bool,
    last_query: String,
    currently_sampling: bool,
}

impl Sampler {
    /// A sampler keeping each row (or query) with probability `rate`.
    #[must_use]
    pub fn new(rate: f32, rng: StdRng, group_by_query: bool) -> Self {
        Self {
            rate,
            rng,
            group_by_query,
            last_query: String::new(),
            currently_sampling: true,
        }
    }

    /// Whether the sampler groups decisions by query.
    #[must_use]
    pub fn group_by_query(&self) -> bool {
        self.rate < 1.0 && self.group_by_query
    }

    /// Decides whether to keep a row.
    pub fn is_sampled(&mut self, query_id: &str) -> bool {
        if self.rate >= 1.0 {
            return true;
        }

        if self.group_by_query {
            if query_id == self.last_query {
                return self.currently_sampling;
            }
            self.last_query = query_id.to_owned();
        }

        self.currently_sampling = self.rate > self.rng.random::<f32>();
        self.currently_sampling
    }
}

/// Collects a training set: one label column, optional query boundaries,
/// and the dynamic raw feature columns.
pub struct TrainingSink {
    default_type: RawFeatureType,
    labels: Vec<f32>,
    query: Option<QueryColumn>,
    features: Vec<DynamicRawColumn>,
}

impl TrainingSink {
    /// Creates a sink whose feature columns start at `default_type`.
    #[must_use]
    pub fn new(default_type: RawFeatureType) -> Self {
        Self {
            default_type,
            labels: Vec::new(),
            query: None,
            features: Vec::new(),
        }
    }

    /// Tears the sink apart into labels, query limits and feature columns.
    /// Without a query column every document lands in one query.
    #[must_use]
    pub fn into_parts(self) -> (Vec<f32>, Vec<DocId>, Vec<DynamicRawColumn>) {
        #[allow(clippy::cast_possible_truncation)]
        let n_docs = self.labels.len() as DocId;

        let query_limits = self
            .query
            .map_or_else(|| vec![0, n_docs], QueryColumn::into_limits);

        (self.labels, query_limits, self.features)
    }
}

impl RowSink for TrainingSink {
    fn add_feature(&mut self, name: &str) -> crate::Result<usize> {
        self.features
            .push(DynamicRawColumn::new(name, self.default_type));
        Ok(self.features.len() - 1)
    }

    fn label(&mut self, cell: &str) -> crate::Result<()> {
        let label = f32::parse_cell(cell).map_err(|_| {
            crate::Error::InputParse(format!("cannot parse label '{cell}'"))
        })?;
        self.labels.push(label);
        Ok(())
    }

    fn query(&mut self, cell: &str) -> crate::Result<()> {
        self.query.get_or_insert_with(QueryColumn::default).consume(cell);
        Ok(())
    }

    fn feature(&mut self, index: usize, cell: &str, doc_id: DocId) -> crate::Result<()> {
        self.features[index].put(cell, doc_id)
    }

    fn end_row(&mut self, _doc_id: DocId) -> crate::Result<()> {
        Ok(())
    }

    fn finish(&mut self, n_docs: DocId) -> crate::Result<()> {
        for feature in &mut self.features {
            feature.finalize(n_docs);
        }
        if let Some(query) = self.query.as_mut() {
            query.finalize();
        }
        Ok(())
    }
}
