// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{LineSource, RowSink, Sampler};
use crate::types::DocId;

/// SVM-light ingest: `label [qid:Q] idx:val idx:val ... [# comment]`.
///
/// Feature indices are 0-based and sparse; absent cells default to zero.
/// Without a name table, features are named `Feature0`, `Feature1`, ... as
/// they first appear.
pub struct SvmReader {
    source: LineSource,
    query_prefix: Option<String>,
    feature_names: Option<Vec<String>>,
    sampler: Sampler,
}

impl SvmReader {
    /// A reader over `source`. `query_prefix` is typically `qid`; when set,
    /// every data row must carry it.
    #[must_use]
    pub fn new(
        source: LineSource,
        query_prefix: Option<String>,
        feature_names: Option<Vec<String>>,
        sampler: Sampler,
    ) -> Self {
        Self {
            source,
            query_prefix,
            feature_names,
            sampler,
        }
    }

    /// Streams the whole file into `sink`.
    pub fn read(&mut self, sink: &mut dyn RowSink) -> crate::Result<()> {
        let mut n_features = 0usize;
        let dynamic_features = self.feature_names.is_none();

        if let Some(names) = self.feature_names.take() {
            for name in &names {
                sink.add_feature(name)?;
            }
            n_features = names.len();
        }

        let mut n_docs: DocId = 0;
        let mut line_number = 0usize;

        while let Some(line) = self.source.next_line()? {
            let query_cell = if self.sampler.group_by_query() {
                self.query_id_of(&line)
            } else {
                String::new()
            };

            if self.sampler.is_sampled(&query_cell) {
                self.read_row(&line, line_number, sink, &mut n_features, dynamic_features, &mut n_docs)?;
            }
            line_number += 1;
        }

        sink.finish(n_docs)
    }

    #[allow(clippy::too_many_lines)]
    fn read_row(
        &self,
        line: &str,
        line_number: usize,
        sink: &mut dyn RowSink,
        n_features: &mut usize,
        dynamic_features: bool,
        n_docs: &mut DocId,
    ) -> crate::Result<()> {
        let mut tokens = line.split(' ').filter(|t| !t.is_empty());

        let Some(first) = tokens.next() else {
            // Blank line
            return Ok(());
        };
        if first.starts_with('#') {
            return Ok(());
        }
        sink.label(first)?;

        let mut query_found = false;
        for token in tokens {
            if token.starts_with('#') {
                break;
            }

            let Some((prefix, value)) = token.split_once(':') else {
                return Err(crate::Error::InputParse(format!(
                    "cannot parse invalid SVM token '{token}' in line {line_number}"
                )));
            };

            let Ok(index) = prefix.parse::<usize>() else {
                if Some(prefix) == self.query_prefix.as_deref() {
                    sink.query(value)?;
                    query_found = true;
                    continue;
                }
                return Err(crate::Error::InputParse(format!(
                    "cannot parse: invalid prefix '{prefix}' in line {line_number}"
                )));
            };

            if index >= *n_features {
                if !dynamic_features {
                    return Err(crate::Error::InputParse(format!(
                        "feature id {index} is too large in line {line_number}"
                    )));
                }
                while *n_features <= index {
                    let name = format!("Feature{n_features}");
                    sink.add_feature(&name)?;
                    *n_features += 1;
                }
            }

            sink.feature(index, value, *n_docs)?;
        }

        if !query_found && self.query_prefix.is_some() {
            return Err(crate::Error::InputParse(format!(
                "query id not found in line {line_number}"
            )));
        }

        sink.end_row(*n_docs)?;
        *n_docs += 1;
        Ok(())
    }

    fn query_id_of(&self, line: &str) -> String {
        let Some(prefix) = self.query_prefix.as_deref() else {
            return String::new();
        };

        let marker = format!(" {prefix}:");
        let Some(start) = line.find(&marker) else {
            return String::new();
        };

        let rest = &line[start + marker.len()..];
        rest.split(' ').next().unwrap_or("").to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::super::{LineSource, Sampler, TrainingSink};
    use super::SvmReader;
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
    fn sparse_rows_and_comments() {
        let (source, _guard) = source_from(
            "# a comment line\n2 qid:1 0:7 3:4\n1 qid:1 1:2 # trailing words\n0 qid:2 2:5\n",
        );
        let mut reader = SvmReader::new(source, Some("qid".into()), None, sampler());

        let mut sink = TrainingSink::new(RawFeatureType::Uint8);
        reader.read(&mut sink).unwrap();

        let (labels, query_limits, features) = sink.into_parts();
        assert_eq!(vec![2.0, 1.0, 0.0], labels);
        assert_eq!(vec![0, 2, 3], query_limits);
        assert_eq!(4, features.len());
        assert_eq!("Feature2", features[2].name());

        // Missing cells are zero
        assert!((features[0].column().value_as_f64(0) - 7.0).abs() < f64::EPSILON);
        assert!(features[0].column().value_as_f64(1).abs() < f64::EPSILON);
        assert!((features[3].column().value_as_f64(0) - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_colon_fails() {
        let (source, _guard) = source_from("1 qid:1 banana\n");
        let mut reader = SvmReader::new(source, Some("qid".into()), None, sampler());
        assert!(reader.read(&mut TrainingSink::new(RawFeatureType::Uint8)).is_err());
    }

    #[test]
    fn missing_query_id_fails_when_required() {
        let (source, _guard) = source_from("1 0:2\n");
        let mut reader = SvmReader::new(source, Some("qid".into()), None, sampler());
        assert!(reader.read(&mut TrainingSink::new(RawFeatureType::Uint8)).is_err());
    }

    #[test]
    fn fixed_name_table_bounds_feature_ids() {
        let (source, _guard) = source_from("1 0:2 1:3\n");
        let names = vec!["alpha".into(), "beta".into()];
        let mut reader = SvmReader::new(source, None, Some(names), sampler());

        let mut sink = TrainingSink::new(RawFeatureType::Uint8);
        reader.read(&mut sink).unwrap();
        let (_, _, features) = sink.into_parts();
        assert_eq!("alpha", features[0].name());

        let (source, _guard) = source_from("1 5:2\n");
        let names = vec!["alpha".into(), "beta".into()];
        let mut reader = SvmReader::new(source, None, Some(names), sampler());
        assert!(reader.read(&mut TrainingSink::new(RawFeatureType::Uint8)).is_err());
    }
}
