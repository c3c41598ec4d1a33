// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{LineSource, RowSink, Sampler};
use crate::types::DocId;

enum Role {
    Label,
    Query,
    Feature(usize),
}

/// TSV ingest: the first line names the columns; one matches the label
/// column, optionally one the query column, the rest are features.
pub struct TsvReader {
    source: LineSource,
    separator: char,
    label_column: String,
    query_column: Option<String>,
    sampler: Sampler,
}

impl TsvReader {
    /// A reader over `source`. With `query_column` unset, a column carrying
    /// the query name is treated as an ordinary feature.
    #[must_use]
    pub fn new(
        source: LineSource,
        separator: char,
        label_column: impl Into<String>,
        query_column: Option<String>,
        sampler: Sampler,
    ) -> Self {
        Self {
            source,
            separator,
            label_column: label_column.into(),
            query_column,
            sampler,
        }
    }

    /// Streams the whole file into `sink`.
    pub fn read(&mut self, sink: &mut dyn RowSink) -> crate::Result<()> {
        let header = self.source.next_line()?.ok_or_else(|| {
            crate::Error::InputParse("cannot read header line in TSV stream".into())
        })?;

        let mut roles: Vec<Role> = Vec::new();
        let mut query_index: Option<usize> = None;

        for (i, token) in header.split(self.separator).enumerate() {
            if token == self.label_column {
                if roles.iter().any(|r| matches!(r, Role::Label)) {
                    return Err(crate::Error::InputParse(
                        "TSV header names the label column twice".into(),
                    ));
                }
                roles.push(Role::Label);
            } else if Some(token) == self.query_column.as_deref() {
                if query_index.is_some() {
                    return Err(crate::Error::InputParse(
                        "TSV header names the query column twice".into(),
                    ));
                }
                query_index = Some(i);
                roles.push(Role::Query);
            } else {
                let index = sink.add_feature(token)?;
                roles.push(Role::Feature(index));
            }
        }

        if !roles.iter().any(|r| matches!(r, Role::Label)) {
            return Err(crate::Error::InputParse(format!(
                "could not find label column in TSV file header: {}",
                self.label_column
            )));
        }

        let mut n_docs: DocId = 0;
        while let Some(line) = self.source.next_line()? {
            if line.is_empty() {
                continue;
            }

            let cells: Vec<&str> = line.split(self.separator).collect();

            let query_cell = if self.sampler.group_by_query() {
                query_index.and_then(|i| cells.get(i).copied()).unwrap_or("")
            } else {
                ""
            };
            if !self.sampler.is_sampled(query_cell) {
                continue;
            }

            if cells.len() > roles.len() {
                return Err(crate::Error::InputParse(
                    "TSV file contains a row with more columns than header".into(),
                ));
            }
            if cells.len() < roles.len() {
                return Err(crate::Error::InputParse(
                    "TSV file contains a row with less columns than header".into(),
                ));
            }

            for (role, &cell) in roles.iter().zip(&cells) {
                match role {
                    Role::Label => sink.label(cell)?,
                    Role::Query => sink.query(cell)?,
                    Role::Feature(index) => sink.feature(*index, cell, n_docs)?,
                }
            }

            sink.end_row(n_docs)?;
            n_docs += 1;
        }

        sink.finish(n_docs)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{LineSource, Sampler, TrainingSink};
    use super::TsvReader;
    use crate::types::RawFeatureType;
    use rand::{rngs::StdRng, SeedableRng};
    use std::io::Write;
    use test_log::test;

    fn source_from(content: &str) -> (LineSource, tempfile::TempPath) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        let path = file.into_temp_path();
        let (source, _) = LineSource::open(Some(path.as_ref()), None).unwrap();
        (source, path)
    }

    fn sampler() -> Sampler {
        Sampler::new(1.0, StdRng::seed_from_u64(1), false)
    }

    #[test]
    fn reads_labels_queries_and_features() {
        let (source, _guard) = source_from("Label,Query,a,b\n1,q1,2,3\n0,q1,5,6\n\n1,q2,8,9\n");
        let mut reader = TsvReader::new(source, ',', "Label", Some("Query".into()), sampler());

        let mut sink = TrainingSink::new(RawFeatureType::Uint8);
        reader.read(&mut sink).unwrap();

        let (labels, query_limits, features) = sink.into_parts();
        assert_eq!(vec![1.0, 0.0, 1.0], labels);
        assert_eq!(vec![0, 2, 3], query_limits);
        assert_eq!(2, features.len());
        assert_eq!("a", features[0].name());
        assert!((features[1].column().value_as_f64(2) - 9.0).abs() < f64::EPSILON);
    }

    #[test]
    fn query_column_without_query_mode_is_a_feature() {
        let (source, _guard) = source_from("Label,Query,a\n1,7,2\n");
        let mut reader = TsvReader::new(source, ',', "Label", None, sampler());

        let mut sink = TrainingSink::new(RawFeatureType::Uint8);
        reader.read(&mut sink).unwrap();

        let (_, query_limits, features) = sink.into_parts();
        assert_eq!(vec![0, 1], query_limits);
        assert_eq!(2, features.len());
        assert_eq!("Query", features[0].name());
    }

    #[test]
    fn row_arity_mismatch_fails() {
        let (source, _guard) = source_from("Label,a\n1,2,3\n");
        let mut reader = TsvReader::new(source, ',', "Label", None, sampler());
        assert!(reader.read(&mut TrainingSink::new(RawFeatureType::Uint8)).is_err());

        let (source, _guard) = source_from("Label,a\n1\n");
        let mut reader = TsvReader::new(source, ',', "Label", None, sampler());
        assert!(reader.read(&mut TrainingSink::new(RawFeatureType::Uint8)).is_err());
    }

    #[test]
    fn missing_label_column_fails() {
        let (source, _guard) = source_from("x,y\n1,2\n");
        let mut reader = TsvReader::new(source, ',', "Label", None, sampler());
        assert!(reader.read(&mut TrainingSink::new(RawFeatureType::Uint8)).is_err());
    }
}
