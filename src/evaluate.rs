// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Evaluation of a trained ensemble against a labeled stream.
//!
//! A reader thread parses rows into a bounded pipeline; each row is scored
//! by a pooled task; scored rows flow to the metric through a second
//! bounded pipeline of single-use receivers, which preserves input order
//! while letting rows complete out of order.

use crate::{
    cost::{AnyCostFunction, CostFunction},
    ensemble::Ensemble,
    metadata::FeatureMetadata,
    metric::EvaluatedRow,
    pool::ThreadPool,
    queue::{oneshot, pipeline, PipeReceiver, PipeSender},
    reader::RowSink,
    types::{DocId, RawValue},
};
use std::sync::Arc;

/// One parsed evaluation row: the label, the query id, and every feature
/// value widened to `f64` under its declared type.
#[derive(Clone, Debug)]
pub struct InputRow {
    /// Document position in the input stream.
    pub doc_id: DocId,
    /// The label.
    pub label: f32,
    /// Query id text; empty when unused.
    pub query: String,
    /// Feature values by feature index; absent cells are zero.
    pub values: Vec<f64>,
}

/// The evaluation-side [`RowSink`]: typed parsing against the ensemble's
/// feature table, rows pushed into the scoring pipeline.
pub struct EvalSink {
    features: Vec<FeatureMetadata>,
    exponentiate_label: bool,
    registered: usize,
    row: InputRow,
    tx: PipeSender<InputRow>,
}

impl EvalSink {
    /// A sink validating and parsing against `features`.
    #[must_use]
    pub fn new(features: Vec<FeatureMetadata>, exponentiate_label: bool, tx: PipeSender<InputRow>) -> Self {
        let n_features = features.len();
        Self {
            features,
            exponentiate_label,
            registered: 0,
            row: InputRow {
                doc_id: 0,
                label: 0.0,
                query: String::new(),
                values: vec![0.0; n_features],
            },
            tx,
        }
    }

    fn reset_row(&mut self) -> InputRow {
        let n_features = self.features.len();
        std::mem::replace(
            &mut self.row,
            InputRow {
                doc_id: 0,
                label: 0.0,
                query: String::new(),
                values: vec![0.0; n_features],
            },
        )
    }
}

impl RowSink for EvalSink {
    fn add_feature(&mut self, name: &str) -> crate::Result<usize> {
        let Some(expected) = self.features.get(self.registered) else {
            return Err(crate::Error::InputParse(format!(
                "input has more features than the ensemble ({})",
                self.features.len()
            )));
        };
        if expected.name != name {
            return Err(crate::Error::InputParse(format!(
                "mismatched feature name; expected '{}', actually got '{}'",
                expected.name, name
            )));
        }
        self.registered += 1;
        Ok(self.registered - 1)
    }

    fn label(&mut self, cell: &str) -> crate::Result<()> {
        let mut label = f32::parse_cell(cell).map_err(|_| {
            crate::Error::InputParse(format!("cannot parse label '{cell}'"))
        })?;
        if self.exponentiate_label {
            label = 2.0f32.powf(label) - 1.0;
        }
        self.row.label = label;
        Ok(())
    }

    fn query(&mut self, cell: &str) -> crate::Result<()> {
        self.row.query = cell.to_owned();
        Ok(())
    }

    fn feature(&mut self, index: usize, cell: &str, doc_id: DocId) -> crate::Result<()> {
        let meta = &self.features[index];
        match meta.parse_value(cell) {
            Ok(value) => {
                self.row.values[index] = value;
                Ok(())
            }
            Err(_) => {
                log::error!(
                    "cannot parse value '{}' as type {} (doc_id={}, feature='{}')",
                    cell,
                    meta.feature_type,
                    doc_id,
                    meta.name
                );
                log::error!(
                    "this can happen when a feature fits a small integer type in the training data \
                     but overflows it in the testing data"
                );
                log::error!(
                    "work around it by raising --default_raw_feature_type during training, or by \
                     editing the feature's type in the ensemble json"
                );
                Err(crate::Error::InputParse(format!(
                    "cannot parse feature value '{cell}'"
                )))
            }
        }
    }

    fn end_row(&mut self, doc_id: DocId) -> crate::Result<()> {
        let mut row = self.reset_row();
        row.doc_id = doc_id;
        self.tx.send(row)
    }

    fn finish(&mut self, _n_docs: DocId) -> crate::Result<()> {
        Ok(())
    }
}

/// Scores one row against every tree: cumulative sums in tree order, then
/// the cost function's score transform.
fn evaluate_row(ensemble: &Ensemble, cost: AnyCostFunction, row: &InputRow, all_epochs: bool) -> EvaluatedRow {
    let mut scores: Vec<f32> = Vec::with_capacity(ensemble.trees.len());
    let mut total = 0.0f32;

    for tree in &ensemble.trees {
        total += tree.evaluate(&row.values);
        scores.push(total);
    }

    cost.transform_scores(&mut scores);

    if !all_epochs {
        scores = scores.last().copied().into_iter().collect();
    }

    EvaluatedRow {
        label: row.label,
        query: row.query.clone(),
        scores,
    }
}

/// Fans evaluation out over the pool.
///
/// Returns the ordered stream of per-row result receivers; the filler
/// thread dispatches one blocking-enqueued task per input row.
pub fn evaluate_stream(
    ensemble: Arc<Ensemble>,
    cost: AnyCostFunction,
    input: PipeReceiver<InputRow>,
    pool: Arc<ThreadPool>,
    all_epochs: bool,
    capacity: usize,
) -> PipeReceiver<PipeReceiver<EvaluatedRow>> {
    let (out_tx, out_rx) = pipeline::<PipeReceiver<EvaluatedRow>>(capacity);

    std::thread::spawn(move || {
        for row in input {
            let (row_tx, row_rx) = oneshot::<EvaluatedRow>();
            if out_tx.send(row_rx).is_err() {
                // Consumer is gone; stop pulling input
                return;
            }

            let ensemble = Arc::clone(&ensemble);
            let task = move || {
                let result = evaluate_row(&ensemble, cost, &row, all_epochs);
                let _ = row_tx.send(result);
            };
            if pool.execute_blocking(task).is_err() {
                return;
            }
        }
    });

    out_rx
}

#[cfg(test)]
mod tests {
    use super::{evaluate_row, InputRow};
    use crate::cost::create_cost_function;
    use crate::ensemble::{Ensemble, NodeLite, SplitLite, TreeLite};
    use crate::metadata::FeatureMetadata;
    use crate::types::RawFeatureType;
    use test_log::test;

    fn stump(value_right: f32) -> TreeLite {
        TreeLite {
            nodes: vec![
                NodeLite::Internal {
                    left_id: 1,
                    right_id: 2,
                    split: SplitLite {
                        feature: 0,
                        threshold: "1".into(),
                        inverse: false,
                        threshold_value: 0.0,
                    },
                    debug_info: None,
                },
                NodeLite::Leaf {
                    value: -value_right,
                    debug_info: None,
                },
                NodeLite::Leaf {
                    value: value_right,
                    debug_info: None,
                },
            ],
        }
    }

    #[test]
    fn scores_accumulate_across_trees() {
        let mut ensemble = Ensemble {
            cost_function: "regression".into(),
            features: vec![FeatureMetadata::new("x", RawFeatureType::Uint8)],
            trees: vec![stump(1.0), stump(0.5)],
        };
        ensemble.validate().unwrap();

        let cost = create_cost_function("regression").unwrap();
        let row = InputRow {
            doc_id: 0,
            label: 0.0,
            query: String::new(),
            values: vec![2.0],
        };

        let result = evaluate_row(&ensemble, cost, &row, true);
        assert_eq!(2, result.scores.len());
        assert!((result.scores[0] - 1.0).abs() < 1e-6);
        assert!((result.scores[1] - 1.5).abs() < 1e-6);

        let result = evaluate_row(&ensemble, cost, &row, false);
        assert_eq!(1, result.scores.len());
        assert!((result.scores[0] - 1.5).abs() < 1e-6);
    }
}
