// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Run orchestration: ingest, feature cooking, the tree-growth loop, and
//! the evaluation pipeline.

use crate::{
    config::{InputFormat, Options, Step, Spread},
    cost::{create_cost_function, AnyCostFunction, CostFunction},
    ensemble::{load_ensemble, Ensemble, TreeWriter},
    evaluate::{evaluate_stream, EvalSink, InputRow},
    feature::{build_feature, FeatureConfig},
    metadata::FeatureMetadata,
    metric::create_metric,
    pool::{concurrency, ThreadPool},
    queue::{pipeline, PipeReceiver},
    raw_feature::DynamicRawColumn,
    reader::{svm::SvmReader, tsv::TsvReader, LineSource, Sampler, TrainingSink},
    split::Split,
    trainer::{Trainer, TrainerParams},
};
use interval_heap::IntervalHeap;
use rand::{rngs::StdRng, SeedableRng};
use std::io::Write;
use std::sync::Arc;

/// Runs one training or evaluation pass described by `options`.
pub fn run(options: Options) -> crate::Result<()> {
    options.validate()?;

    let concurrency = concurrency(options.n_threads);
    let pool = Arc::new(ThreadPool::new(concurrency));
    log::info!("Thread pool initialized with {concurrency} threads.");

    let rng = if options.random_seed == 0 {
        StdRng::from_os_rng()
    } else {
        StdRng::seed_from_u64(options.random_seed)
    };

    let mut workflow = Workflow {
        options,
        pool,
        rng,
        msg_tree_too_short: false,
        msg_score_too_large: false,
    };

    if workflow.options.train {
        workflow.run_train()
    } else {
        workflow.run_evaluate()
    }
}

struct Workflow {
    options: Options,
    pool: Arc<ThreadPool>,
    rng: StdRng,
    msg_tree_too_short: bool,
    msg_score_too_large: bool,
}

/// Open-splits heap entry: best spread wins, ties resolved by node then
/// feature so runs are reproducible.
#[derive(PartialEq)]
struct OpenSplit(Split);

impl Eq for OpenSplit {}

impl Ord for OpenSplit {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .spread
            .total_cmp(&other.0.spread)
            .then_with(|| other.0.node.cmp(&self.0.node))
            .then_with(|| other.0.feature.cmp(&self.0.feature))
    }
}

impl PartialOrd for OpenSplit {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

fn format_significant(value: f32, digits: i32) -> String {
    if value == 0.0 || !value.is_finite() {
        return format!("{value}");
    }

    #[allow(clippy::cast_possible_truncation)]
    let magnitude = value.abs().log10().floor() as i32;
    let precision = (digits - 1 - magnitude).max(0);

    #[allow(clippy::cast_sign_loss)]
    format!("{value:.precision$}", precision = precision as usize)
}

impl Workflow {
    fn pipeline_capacity(&self) -> usize {
        2 * self.pool.size()
    }

    fn feature_names_from_file(&self) -> crate::Result<Option<Vec<String>>> {
        let Some(path) = self.options.feature_names_file.as_ref() else {
            return Ok(None);
        };
        let content = std::fs::read_to_string(path)?;
        Ok(Some(content.lines().map(str::to_owned).collect()))
    }

    fn read_data(
        &self,
        sink: &mut dyn crate::reader::RowSink,
        with_query: bool,
        svm_feature_names: Option<Vec<String>>,
    ) -> crate::Result<()> {
        let (source, source_name) = LineSource::open(
            self.options.input_file.as_deref(),
            self.options.input_pipe.as_deref(),
        )?;

        let sampler = Sampler::new(self.options.input_sample_rate, self.rng.clone(), with_query);
        let sample_clause = if self.options.input_sample_rate < 1.0 {
            format!(" with {} subsample rate", self.options.input_sample_rate)
        } else {
            String::new()
        };
        let format_name = match self.options.input_format {
            InputFormat::Tsv => "tsv",
            InputFormat::Svm => "svm",
        };
        log::info!("Reading data from {source_name} in {format_name} format{sample_clause} ...");

        match self.options.input_format {
            InputFormat::Tsv => {
                let query_column = with_query.then(|| self.options.tsv_query.clone());
                TsvReader::new(
                    source,
                    self.options.tsv_separator,
                    self.options.tsv_label.clone(),
                    query_column,
                    sampler,
                )
                .read(sink)
            }
            InputFormat::Svm => {
                let query_prefix = with_query.then(|| self.options.svm_query.clone());
                SvmReader::new(source, query_prefix, svm_feature_names, sampler).read(sink)
            }
        }
    }

    // ----------------------------------------------------- training

    fn run_train(&mut self) -> crate::Result<()> {
        let cost = create_cost_function(&self.options.cost_function)?;

        let warm_start: Option<Ensemble> = match self.options.input_tree.as_ref() {
            Some(path) => Some(load_ensemble(path)?),
            None => None,
        };

        let svm_names = match self.feature_names_from_file()? {
            Some(names) => Some(names),
            None => warm_start.as_ref().map(Ensemble::feature_names),
        };

        let mut sink = TrainingSink::new(self.options.default_raw_feature_type);
        self.read_data(&mut sink, cost.is_query_based(), svm_names)?;
        let (labels, query_limits, raw_columns) = sink.into_parts();

        log::info!(
            "Loaded {} documents, {} queries and {} features.",
            labels.len(),
            query_limits.len().saturating_sub(1),
            raw_columns.len()
        );

        let labels = self.preprocess_labels(labels);

        // Warm start replays the loaded ensemble over the raw columns
        // before cooking consumes them.
        let initial_scores = warm_start
            .as_ref()
            .map(|ensemble| Self::replay_scores(ensemble, &raw_columns, labels.len()));

        let output_tree = self.options.output_tree.clone().ok_or_else(|| {
            crate::Error::Config("--output_tree must be set".into())
        })?;
        let cost_name = cost.name();
        let mut writer = TreeWriter::new(output_tree);
        writer.set_cost_function(cost_name.clone());

        let params = TrainerParams {
            newton_step: self.options.step == Step::Newton,
            quadratic_spread: self.options.spread == Spread::Quadratic,
            regularization_lambda: self.options.regularization_lambda,
            min_node_docs: self.options.min_node_docs,
            min_node_hessian: self.options.min_node_hessian,
            tree_debug_info: self.options.tree_debug_info,
        };
        let mut trainer = Trainer::new(cost, Arc::clone(&self.pool), params);
        trainer.load_documents(&labels, query_limits);

        log::info!("Cooking features...");
        let cooked = self.cook_features(raw_columns)?;
        let mut encoding_counts: std::collections::BTreeMap<String, usize> =
            std::collections::BTreeMap::new();
        let mut metadata: Vec<FeatureMetadata> = Vec::new();
        for receiver in cooked {
            let feature = receiver.recv().ok_or(crate::Error::QueueAborted)??;
            *encoding_counts.entry(feature.encoding()).or_default() += 1;
            metadata.push(feature.metadata());
            writer.add_feature(feature.metadata());
            trainer.add_feature(feature);
        }
        self.log_feature_encodings(&encoding_counts, 'd', "Dense features encodings: ");
        self.log_feature_encodings(&encoding_counts, 's', "Sparse features encodings: ");

        if let Some(ensemble) = warm_start {
            if ensemble.cost_function != cost_name {
                return Err(crate::Error::Config(format!(
                    "warm start cost function mismatch: {} vs {cost_name}",
                    ensemble.cost_function
                )));
            }
            if ensemble.features != metadata {
                return Err(crate::Error::Config(
                    "warm start requires the same features the ensemble was trained on".into(),
                ));
            }
            writer.seed_trees(ensemble.trees);
        }

        if let Some(scores) = initial_scores {
            let data = Arc::clone(trainer.data());
            let mut guard = data.write();
            for (doc, score) in guard.documents.iter_mut().zip(scores) {
                doc.score = score;
            }
        }

        log::info!("Training started ...");
        trainer.start_ensemble();

        if self.options.base_score != 0.0 {
            trainer.start_new_tree()?;
            trainer.set_base_score(self.options.base_score);
            let tree = trainer.build_tree_lite()?;
            trainer.clear_tree();
            writer.add_tree(tree);
            self.check_for_overflow(&trainer);
        }

        for tree_index in 0..self.options.n_trees {
            self.train_a_tree(&trainer, tree_index, &mut writer)?;
        }
        log::info!("Training finished.");

        writer.close()
    }

    fn train_a_tree(
        &mut self,
        trainer: &Trainer,
        tree_index: u32,
        writer: &mut TreeWriter,
    ) -> crate::Result<()> {
        let started = std::time::Instant::now();
        let n_tree_nodes = (2 * self.options.n_leaves - 1) as usize;

        trainer.start_new_tree()?;
        self.log_gradients(trainer);

        trainer.compute_histograms(0, None, None)?;

        let mut heap: IntervalHeap<OpenSplit> =
            IntervalHeap::with_capacity(self.options.n_leaves as usize);
        if let Some(split) = trainer.best_split_of(0) {
            heap.push(OpenSplit(split));
        } else {
            log::warn!("Warning: cannot split root in this tree. This might indicate overfitting.");
        }

        while trainer.tree_size() < n_tree_nodes {
            let Some(OpenSplit(mut best)) = heap.pop_max() else {
                if !self.msg_tree_too_short {
                    self.msg_tree_too_short = true;
                    log::warn!("Terminating tree before max leaves reached.");
                }
                break;
            };

            let signature = trainer.split_signature(&mut best)?;
            log::trace!(
                "Node #{} has {} docs, splitting by feature {} inverse={} bucket={}",
                best.node,
                trainer.node_size(best.node),
                best.feature,
                best.inverse,
                best.threshold
            );

            let compute_children = self.options.max_depth == 0
                || trainer.node_depth(best.node) + 1 < self.options.max_depth;

            let (left, right) = trainer.split_node(&best, &signature, compute_children)?;
            let (left_size, right_size) = (trainer.node_size(left), trainer.node_size(right));
            log::trace!(
                "Left Node #{left} has {left_size} docs, Right Node #{right} has {right_size}"
            );
            if left_size == 0 || right_size == 0 {
                return Err(crate::Error::Train(
                    "either left or right child has 0 documents; this is not supposed to happen"
                        .into(),
                ));
            }

            if compute_children {
                trainer.compute_histograms(right, Some(left), Some(signature))?;
                for child in [left, right] {
                    if let Some(split) = trainer.best_split_of(child) {
                        heap.push(OpenSplit(split));
                    }
                }
            }
        }

        trainer.finalize_tree(self.options.learning_rate)?;
        let tree = trainer.build_tree_lite()?;
        trainer.clear_tree();

        log::info!("Tree #{tree_index} trained in {:.3?}.", started.elapsed());
        writer.add_tree(tree);

        self.check_for_overflow(trainer);
        Ok(())
    }

    fn cook_features(
        &self,
        columns: Vec<DynamicRawColumn>,
    ) -> crate::Result<PipeReceiver<PipeReceiver<crate::Result<Box<dyn crate::feature::Feature>>>>> {
        let sparse_v2 = self.options.sparse_v2();
        if sparse_v2 {
            log::warn!("Using sparse features v2.");
        }

        let config = FeatureConfig {
            sparse_v2,
            fixed_tail: 16,
            initial_tail_fraction: self.options.initial_tail_size,
        };
        let max_buckets = 1u32 << self.options.bucket_max_bits;
        let sparsity_threshold = self.options.sparsity_threshold;

        let (tx, rx) = pipeline(self.pipeline_capacity());
        let pool = Arc::clone(&self.pool);

        std::thread::spawn(move || {
            for column in columns {
                let (result_tx, result_rx) = crate::queue::oneshot();
                if tx.send(result_rx).is_err() {
                    return;
                }

                let task = move || {
                    let cooked = column
                        .cook(max_buckets)
                        .and_then(|cooked| build_feature(cooked, sparsity_threshold, config));
                    let _ = result_tx.send(cooked);
                };
                if pool.execute(task).is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }

    fn preprocess_labels(&self, labels: Vec<f32>) -> Vec<f32> {
        if !self.options.exponentiate_label {
            return labels;
        }
        labels
            .into_iter()
            .map(|label| 2.0f32.powf(label) - 1.0)
            .collect()
    }

    /// Initial document scores for a warm start: the loaded ensemble
    /// replayed over the raw columns tree by tree, accumulating in the same
    /// order training did.
    fn replay_scores(ensemble: &Ensemble, columns: &[DynamicRawColumn], n_docs: usize) -> Vec<f32> {
        let mut scores = vec![0.0f32; n_docs];
        let mut values = vec![0.0f64; columns.len()];

        for (doc, score) in scores.iter_mut().enumerate() {
            for (value, column) in values.iter_mut().zip(columns) {
                *value = column.column().value_as_f64(doc);
            }
            for tree in &ensemble.trees {
                *score += tree.evaluate(&values);
            }
        }

        scores
    }

    fn log_feature_encodings(
        &self,
        counts: &std::collections::BTreeMap<String, usize>,
        prefix: char,
        message: &str,
    ) {
        let summary: Vec<String> = [1u8, 2, 4, 8, 16]
            .iter()
            .map(|bits| {
                let key = format!("{prefix}{bits}");
                format!("{key}:{}", counts.get(&key).copied().unwrap_or(0))
            })
            .collect();
        log::info!("{message}{}.", summary.join(", "));
    }

    fn log_gradients(&self, trainer: &Trainer) {
        if !log::log_enabled!(log::Level::Trace) {
            return;
        }

        let guard = trainer.data().read();
        let shown: Vec<String> = guard
            .documents
            .iter()
            .take(100)
            .map(|doc| doc.gradient.to_string())
            .collect();
        let ellipsis = if guard.documents.len() > 100 { ", ..." } else { "." };
        log::trace!("Computed gradients: {}{}", shown.join(", "), ellipsis);

        if self.options.step == Step::Newton {
            let shown: Vec<String> = guard
                .documents
                .iter()
                .take(100)
                .map(|doc| doc.hessian.to_string())
                .collect();
            log::trace!("Computed hessians: {}{}", shown.join(", "), ellipsis);
        }
    }

    fn check_for_overflow(&mut self, trainer: &Trainer) {
        let guard = trainer.data().read();
        let max_score = guard
            .documents
            .iter()
            .map(|doc| doc.score.abs())
            .fold(0.0f32, f32::max);

        if max_score > 1e12 && !self.msg_score_too_large {
            self.msg_score_too_large = true;
            log::warn!(
                "Document scores are getting too large. For a ranker this might indicate overfitting."
            );
        }
    }

    // ----------------------------------------------------- evaluation

    fn run_evaluate(&self) -> crate::Result<()> {
        let input_tree = self.options.input_tree.clone().ok_or_else(|| {
            crate::Error::Config("--input_tree must be set".into())
        })?;
        let ensemble = Arc::new(load_ensemble(input_tree)?);
        let cost: AnyCostFunction = create_cost_function(&ensemble.cost_function)?;

        let metric_name = self
            .options
            .metric
            .clone()
            .unwrap_or_else(|| cost.default_metric_name());
        let mut metric = create_metric(&metric_name)?;

        let (row_tx, row_rx) = pipeline::<InputRow>(self.pipeline_capacity());

        let svm_names = match self.feature_names_from_file()? {
            Some(names) => Some(names),
            None => Some(ensemble.feature_names()),
        };
        let with_query = metric.is_query_based();
        let mut sink = EvalSink::new(
            ensemble.features.clone(),
            self.options.exponentiate_label,
            row_tx,
        );

        // The reader runs beside the scoring pipeline; its errors surface
        // after the rows stop flowing.
        let reader_result = std::thread::scope(|scope| -> crate::Result<f32> {
            // The sink owns the pipeline sender; moving it into the reader
            // thread closes the pipeline when reading ends.
            let reader = scope.spawn(move || self.read_data(&mut sink, with_query, svm_names));

            let all_epochs = self.options.output_epochs.is_some();
            let results = evaluate_stream(
                Arc::clone(&ensemble),
                cost,
                row_rx,
                Arc::clone(&self.pool),
                all_epochs,
                self.pipeline_capacity(),
            );

            let mut predictions = match self.options.output_predictions.as_ref() {
                Some(path) => Some(std::io::BufWriter::new(std::fs::File::create(path)?)),
                None => None,
            };

            for receiver in results {
                let row = receiver.recv().ok_or(crate::Error::QueueAborted)?;
                if let (Some(out), Some(score)) = (predictions.as_mut(), row.scores.last()) {
                    writeln!(out, "{score}")?;
                }
                metric.consume_row(row);
            }

            match reader.join() {
                Ok(result) => result?,
                Err(_) => {
                    return Err(crate::Error::Train("the reader thread panicked".into()));
                }
            }

            Ok(metric.value())
        });
        let value = reader_result?;

        println!("{} = {}", metric.name(), format_significant(value, 5));

        if let Some(path) = self.options.output_epochs.as_ref() {
            let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
            for epoch in metric.epochs() {
                writeln!(out, "{epoch}")?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::format_significant;
    use test_log::test;

    #[test]
    fn significant_digit_formatting() {
        assert_eq!("0.87654", format_significant(0.876_543, 5));
        assert_eq!("123.46", format_significant(123.456, 5));
        assert_eq!("1.0000", format_significant(1.0, 5));
        assert_eq!("0", format_significant(0.0, 5));
    }
}
