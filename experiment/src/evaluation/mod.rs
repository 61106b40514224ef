//! Held-out evaluation, sample prediction grid, and single-meme prediction.
//!
//! Evaluation never mutates model state: the forward pass runs without
//! dropout and batches are built without augmentation.

pub mod predict;
pub mod visualize;

use std::path::{Path, PathBuf};

use candle_core::{Tensor, D};
use memesense_core::{ExperimentConfig, MemeSenseError, Result, Sentiment, NUM_CLASSES};
use memesense_data::Vocabulary;
use memesense_model::{select_device, weighted_cross_entropy, FusionClassifier};
use serde::Serialize;
use tracing::info;

use crate::training::class_weights::ClassWeights;
use crate::training::data::{prepare_dataset, BatchIterator, Partition, PreparedData};
use crate::training::metrics::{compute_classification_metrics, ClassificationReport};
use crate::training::trainer::argmax;

pub use predict::{predict_single, SinglePrediction};
pub use visualize::render_grid;

const REPORT_FILE: &str = "evaluation.json";
const SAMPLES_FILE: &str = "sample_predictions.json";
const GRID_FILE: &str = "prediction_grid.png";

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Model outputs over a whole partition, in partition order.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionScores {
    /// Unweighted cross-entropy plus the L2 penalty.
    pub loss: f64,
    pub probabilities: Vec<[f32; NUM_CLASSES]>,
    pub predictions: Vec<u32>,
}

impl PartitionScores {
    /// Fraction of `predictions` equal to `labels`.
    pub fn accuracy(&self, labels: &[u32]) -> f64 {
        if labels.is_empty() {
            return 0.0;
        }
        let correct = self
            .predictions
            .iter()
            .zip(labels)
            .filter(|(p, l)| p == l)
            .count();
        correct as f64 / labels.len() as f64
    }
}

fn score_batches(
    model: &FusionClassifier,
    partition: &Partition,
    batch_size: usize,
) -> candle_core::Result<PartitionScores> {
    let device = model.device();
    let uniform = ClassWeights::uniform().to_tensor(device)?;
    let mut batches = BatchIterator::new(partition.len(), batch_size);
    let mut ce_sum = 0.0;
    let mut probabilities = Vec::with_capacity(partition.len());

    while let Some(positions) = batches.next_positions() {
        let batch = partition.batch(&positions, None, device)?;
        let logits = model.forward_logits(&batch.images, &batch.tokens)?;
        let ce = weighted_cross_entropy(&logits, &batch.labels, &uniform)?;
        ce_sum += ce.to_scalar::<f32>()? as f64 * positions.len() as f64;

        let probs: Vec<Vec<f32>> = candle_nn::ops::softmax(&logits, D::Minus1)?.to_vec2()?;
        for row in probs {
            let mut p = [0f32; NUM_CLASSES];
            p.copy_from_slice(&row);
            probabilities.push(p);
        }
    }

    let n = partition.len();
    let loss = if n == 0 {
        0.0
    } else {
        ce_sum / n as f64 + model.l2_penalty()?.to_scalar::<f32>()? as f64
    };
    let predictions = probabilities.iter().map(|p| argmax(p)).collect();
    Ok(PartitionScores {
        loss,
        probabilities,
        predictions,
    })
}

/// Run `model` over `partition` in sequential batches.
pub fn score_partition(
    model: &FusionClassifier,
    partition: &Partition,
    batch_size: usize,
) -> Result<PartitionScores> {
    score_batches(model, partition, batch_size)
        .map_err(|e| MemeSenseError::Model(format!("Scoring failed: {e}")))
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Test-set metrics written to `evaluation.json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub samples: usize,
    pub loss: f64,
    pub accuracy: f64,
    pub metrics: ClassificationReport,
}

impl std::fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "test loss={:.4} accuracy={:.4} (n={})",
            self.loss, self.accuracy, self.samples
        )?;
        write!(f, "{}", self.metrics)
    }
}

/// One rendered sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    /// Position within the evaluated partition.
    pub position: usize,
    pub image: PathBuf,
    pub caption: String,
    pub predicted: Sentiment,
    pub actual: Sentiment,
    /// Probability of the predicted class.
    pub confidence: f32,
    pub probabilities: [f32; NUM_CLASSES],
}

impl Prediction {
    pub fn is_correct(&self) -> bool {
        self.predicted == self.actual
    }
}

/// Metrics and per-sample outputs of one evaluation pass.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub report: EvaluationReport,
    pub scores: PartitionScores,
}

/// Evaluate `model` on `partition`.
pub fn evaluate(
    model: &FusionClassifier,
    partition: &Partition,
    batch_size: usize,
) -> Result<Evaluation> {
    let scores = score_partition(model, partition, batch_size)?;
    let metrics = compute_classification_metrics(&scores.predictions, &partition.labels);
    let report = EvaluationReport {
        samples: partition.len(),
        loss: scores.loss,
        accuracy: metrics.accuracy,
        metrics,
    };
    Ok(Evaluation { report, scores })
}

/// The first `count` samples of an evaluated partition.
pub fn sample_predictions(
    data: &PreparedData,
    partition: &Partition,
    scores: &PartitionScores,
    count: usize,
) -> Vec<Prediction> {
    (0..partition.len().min(count))
        .filter_map(|position| {
            let row = partition.rows[position];
            let predicted = Sentiment::from_code(scores.predictions[position])?;
            let actual = Sentiment::from_code(partition.labels[position])?;
            let probabilities = scores.probabilities[position];
            Some(Prediction {
                position,
                image: data.samples[row].image_path.clone(),
                caption: data.samples[row].raw_caption.clone(),
                predicted,
                actual,
                confidence: probabilities[predicted.code() as usize],
                probabilities,
            })
        })
        .collect()
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(value)?)?;
    Ok(())
}

/// Evaluate on the test split and write the report, the sample predictions
/// and the prediction grid to `output.report_dir`.
pub fn report_test_set(
    model: &FusionClassifier,
    data: &PreparedData,
    vocabulary: &Vocabulary,
    config: &ExperimentConfig,
) -> Result<EvaluationReport> {
    let test = Partition::new(data, &data.split.test, vocabulary);
    let evaluation = evaluate(model, &test, config.training.batch_size)?;
    let report_dir = &config.output.report_dir;

    info!(
        samples = evaluation.report.samples,
        loss = evaluation.report.loss,
        accuracy = evaluation.report.accuracy,
        macro_f1 = evaluation.report.metrics.macro_f1,
        "Test set evaluated"
    );
    write_json(&report_dir.join(REPORT_FILE), &evaluation.report)?;

    let samples = sample_predictions(data, &test, &evaluation.scores, config.output.grid_samples);
    for p in &samples {
        info!(
            image = %p.image.display(),
            predicted = %p.predicted,
            actual = %p.actual,
            confidence = p.confidence,
            "Sample prediction"
        );
    }
    write_json(&report_dir.join(SAMPLES_FILE), &samples)?;
    if !samples.is_empty() {
        render_grid(&test.images, &samples, &report_dir.join(GRID_FILE))?;
    }

    Ok(evaluation.report)
}

/// Rebuild the split, reload the vocabulary and checkpoint, and report on
/// the test set. `checkpoint` overrides `output.checkpoint_path`.
pub fn run_evaluation(
    config: &ExperimentConfig,
    checkpoint: Option<&Path>,
) -> Result<EvaluationReport> {
    let checkpoint = checkpoint.unwrap_or(config.output.checkpoint_path.as_path());
    let data = prepare_dataset(config)?;
    let vocabulary = Vocabulary::load(&config.output.vocabulary_path)?;
    let device = select_device(config.device);
    let model = FusionClassifier::load(checkpoint, &config.model, vocabulary.len(), &device)?;
    info!(checkpoint = %checkpoint.display(), "Loaded checkpoint");
    report_test_set(&model, &data, &vocabulary, config)
}

/// Class probabilities for a single already-built batch.
pub(crate) fn probabilities_of(
    model: &FusionClassifier,
    images: &Tensor,
    tokens: &Tensor,
) -> Result<Vec<[f32; NUM_CLASSES]>> {
    let rows: Vec<Vec<f32>> = model
        .predict_proba(images, tokens)
        .and_then(|p| p.to_vec2())
        .map_err(|e| MemeSenseError::Model(format!("Prediction failed: {e}")))?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let mut p = [0f32; NUM_CLASSES];
            p.copy_from_slice(&row);
            p
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accuracy_of_scores() {
        let scores = PartitionScores {
            loss: 1.0,
            probabilities: vec![[0.2; NUM_CLASSES]; 4],
            predictions: vec![0, 1, 2, 2],
        };
        assert!((scores.accuracy(&[0, 1, 3, 2]) - 0.75).abs() < 1e-12);
        assert_eq!(scores.accuracy(&[]), 0.0);
    }

    #[test]
    fn test_prediction_correctness() {
        let p = Prediction {
            position: 0,
            image: PathBuf::from("a.png"),
            caption: "caption".to_string(),
            predicted: Sentiment::Neutral,
            actual: Sentiment::Positive,
            confidence: 0.6,
            probabilities: [0.1, 0.1, 0.6, 0.1, 0.1],
        };
        assert!(!p.is_correct());
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["predicted"], "neutral");
        assert_eq!(json["actual"], "positive");
    }
}
