// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::cost::lambda_rank::dcg_coefficient;

/// One evaluated document: its label, query id, and the model's cumulative
/// score after each epoch (tree).
#[derive(Clone, Debug)]
pub struct EvaluatedRow {
    /// The label.
    pub label: f32,
    /// Query id text; empty for non-ranking metrics.
    pub query: String,
    /// Transformed scores, one per requested epoch.
    pub scores: Vec<f32>,
}

/// An evaluation metric accumulator.
pub trait Metric {
    /// Consumes one evaluated row. Rows of the same query arrive adjacent.
    fn consume_row(&mut self, row: EvaluatedRow);

    /// The metric value after each epoch.
    fn epochs(&mut self) -> Vec<f32>;

    /// The final metric value.
    fn value(&mut self) -> f32 {
        self.epochs().last().copied().unwrap_or(f32::NAN)
    }

    /// Display name, e.g. `NDCG@10`.
    fn name(&self) -> String;

    /// Whether the metric needs query grouping.
    fn is_query_based(&self) -> bool {
        false
    }
}

/// Resolves a `--metric` value: `rmse`, `accuracy`, `ndcg` or `ndcg@N`.
pub fn create_metric(name: &str) -> crate::Result<Box<dyn Metric>> {
    match name {
        "rmse" => return Ok(Box::new(RmseMetric::default())),
        "accuracy" => return Ok(Box::new(AccuracyMetric::default())),
        _ => {}
    }

    if let Some(rest) = name.strip_prefix("ndcg") {
        let depth = if rest.is_empty() {
            0
        } else if let Some(depth) = rest.strip_prefix('@') {
            depth
                .parse()
                .map_err(|_| crate::Error::Config(format!("bad ndcg depth: {name}")))?
        } else {
            return Err(crate::Error::Config(format!("unknown metric: {name}")));
        };
        return Ok(Box::new(NdcgMetric::new(depth)));
    }

    Err(crate::Error::Config(format!("unknown metric: {name}")))
}

/// Running per-epoch means.
#[derive(Debug, Default)]
struct Averager {
    sums: Vec<f64>,
    count: u64,
}

impl Averager {
    fn add(&mut self, values: &[f32]) {
        if self.sums.is_empty() {
            self.sums = vec![0.0; values.len()];
        }
        debug_assert_eq!(self.sums.len(), values.len());

        for (sum, &value) in self.sums.iter_mut().zip(values) {
            *sum += f64::from(value);
        }
        self.count += 1;
    }

    fn averages(&self) -> Vec<f32> {
        #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
        self.sums
            .iter()
            .map(|&sum| (sum / self.count.max(1) as f64) as f32)
            .collect()
    }
}

/// Root-mean-square error.
#[derive(Debug, Default)]
pub struct RmseMetric {
    averager: Averager,
}

impl Metric for RmseMetric {
    fn consume_row(&mut self, row: EvaluatedRow) {
        let errors: Vec<f32> = row
            .scores
            .iter()
            .map(|&score| {
                let error = score - row.label;
                error * error
            })
            .collect();
        self.averager.add(&errors);
    }

    fn epochs(&mut self) -> Vec<f32> {
        self.averager.averages().iter().map(|&e| e.sqrt()).collect()
    }

    fn name(&self) -> String {
        "RMSE".into()
    }
}

/// Fraction of rows whose prediction lands on the label's side of 0.5.
#[derive(Debug, Default)]
pub struct AccuracyMetric {
    averager: Averager,
}

impl Metric for AccuracyMetric {
    fn consume_row(&mut self, row: EvaluatedRow) {
        let correct: Vec<f32> = row
            .scores
            .iter()
            .map(|&score| f32::from((score >= 0.5) == (row.label >= 0.5)))
            .collect();
        self.averager.add(&correct);
    }

    fn epochs(&mut self) -> Vec<f32> {
        self.averager.averages()
    }

    fn name(&self) -> String {
        "Accuracy".into()
    }
}

/// Normalized discounted cumulative gain, averaged over queries.
#[derive(Debug)]
pub struct NdcgMetric {
    depth: u32,
    averager: Averager,
    last_query: Option<String>,
    labels: Vec<f32>,
    score_rows: Vec<Vec<f32>>,
}

impl NdcgMetric {
    /// `depth` truncates the gain; 0 means the full ranking.
    #[must_use]
    pub fn new(depth: u32) -> Self {
        Self {
            depth,
            averager: Averager::default(),
            last_query: None,
            labels: Vec::new(),
            score_rows: Vec::new(),
        }
    }

    fn dcg(&self, labels: &[f32], order: &[usize]) -> f32 {
        let mut top = order.len();
        if self.depth > 0 {
            top = top.min(self.depth as usize);
        }

        (0..top).map(|i| dcg_coefficient(i) * labels[order[i]]).sum()
    }

    fn flush(&mut self) {
        if self.labels.is_empty() {
            return;
        }

        let labels = std::mem::take(&mut self.labels);
        let rows = std::mem::take(&mut self.score_rows);
        let n_epochs = rows[0].len();

        let mut order: Vec<usize> = (0..labels.len()).collect();
        order.sort_by(|&a, &b| labels[b].total_cmp(&labels[a]));
        let idcg = self.dcg(&labels, &order);

        let mut ndcgs = vec![0.0f32; n_epochs];
        for (epoch, slot) in ndcgs.iter_mut().enumerate() {
            let scores: Vec<f32> = rows.iter().map(|row| row[epoch]).collect();

            for (i, index) in order.iter_mut().enumerate() {
                *index = i;
            }
            order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

            let dcg = self.dcg(&labels, &order);
            *slot = if idcg > 0.0 { dcg / idcg } else { 0.0 };
        }

        self.averager.add(&ndcgs);
    }
}

impl Metric for NdcgMetric {
    fn consume_row(&mut self, row: EvaluatedRow) {
        if self.last_query.as_deref() != Some(row.query.as_str()) {
            self.flush();
            self.last_query = Some(row.query);
        }
        self.labels.push(row.label);
        self.score_rows.push(row.scores);
    }

    fn epochs(&mut self) -> Vec<f32> {
        self.flush();
        self.averager.averages()
    }

    fn name(&self) -> String {
        if self.depth == 0 {
            "NDCG".into()
        } else {
            format!("NDCG@{}", self.depth)
        }
    }

    fn is_query_based(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::{create_metric, EvaluatedRow, Metric, NdcgMetric};
    use test_log::test;

    fn row(label: f32, query: &str, scores: &[f32]) -> EvaluatedRow {
        EvaluatedRow {
            label,
            query: query.into(),
            scores: scores.to_vec(),
        }
    }

    #[test]
    fn rmse_over_two_epochs() {
        let mut metric = create_metric("rmse").unwrap();
        metric.consume_row(row(1.0, "", &[0.0, 1.0]));
        metric.consume_row(row(3.0, "", &[0.0, 3.0]));

        let epochs = metric.epochs();
        assert!((epochs[0] - (5.0f32).sqrt()).abs() < 1e-6);
        assert!(epochs[1].abs() < 1e-6);
        assert!(metric.value().abs() < 1e-6);
    }

    #[test]
    fn accuracy_thresholds_at_half() {
        let mut metric = create_metric("accuracy").unwrap();
        metric.consume_row(row(1.0, "", &[0.9]));
        metric.consume_row(row(0.0, "", &[0.2]));
        metric.consume_row(row(1.0, "", &[0.3]));

        assert!((metric.value() - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn perfect_ranking_scores_full_ndcg() {
        let mut metric = NdcgMetric::new(0);
        metric.consume_row(row(2.0, "q1", &[0.9]));
        metric.consume_row(row(1.0, "q1", &[0.5]));
        metric.consume_row(row(0.0, "q1", &[0.1]));

        assert!((metric.value() - 1.0).abs() < 1e-6);
        assert!(metric.is_query_based());
    }

    #[test]
    fn reversed_ranking_scores_below_one() {
        let mut metric = NdcgMetric::new(0);
        metric.consume_row(row(0.0, "q1", &[0.9]));
        metric.consume_row(row(2.0, "q1", &[0.1]));

        let value = metric.value();
        assert!(value > 0.0 && value < 1.0);
    }

    #[test]
    fn ndcg_averages_across_queries() {
        let mut metric = NdcgMetric::new(0);
        // q1 ranked perfectly, q2 reversed
        metric.consume_row(row(1.0, "q1", &[0.9]));
        metric.consume_row(row(0.0, "q1", &[0.1]));
        metric.consume_row(row(0.0, "q2", &[0.9]));
        metric.consume_row(row(1.0, "q2", &[0.1]));

        let value = metric.value();
        assert!(value < 1.0);
        assert!(value > 0.5);
    }

    #[test]
    fn metric_names() {
        assert_eq!("RMSE", create_metric("rmse").unwrap().name());
        assert_eq!("NDCG@5", create_metric("ndcg@5").unwrap().name());
        assert!(create_metric("f1").is_err());
    }
}
