//! Training loop for the fusion classifier.
//!
//! One epoch is a shuffled pass over the training partition with augmented
//! images, followed by an unaugmented pass over the validation partition. The
//! per-epoch policies in [`super::callbacks`] then run in a fixed order:
//! learning-rate reduction, early stopping, checkpointing, metric logging.

use std::path::PathBuf;

use candle_core::{Device, Tensor, D};
use candle_nn::{Optimizer, VarMap};
use memesense_core::{ExperimentConfig, MemeSenseError, Result};
use memesense_data::{take_validation_tail, ImageAugmenter, Vocabulary};
use memesense_model::{select_device, trainable_vars, FusionClassifier};
use serde::Serialize;
use tracing::{debug, info};

use crate::evaluation::score_partition;
use crate::training::callbacks::{
    Checkpointer, EarlyStopping, EarlyStoppingDecision, ReduceLrOnPlateau, WeightSnapshot,
};
use crate::training::class_weights::ClassWeights;
use crate::training::data::{
    prepare_dataset, require_non_empty, BatchIterator, Partition, PreparedData,
};
use crate::training::logging::MetricsLogger;

/// Per-epoch metrics logged during training.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochMetrics {
    /// Zero-based.
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    /// Learning rate in effect during the epoch.
    pub learning_rate: f64,
}

impl std::fmt::Display for EpochMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "epoch {:3} | train_loss={:.4} train_acc={:.4} | val_loss={:.4} val_acc={:.4} | lr={:.2e}",
            self.epoch + 1,
            self.train_loss,
            self.train_accuracy,
            self.val_loss,
            self.val_accuracy,
            self.learning_rate,
        )
    }
}

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum StopReason {
    /// Ran every configured epoch.
    MaxEpochs,
    /// Early stopping fired after `epoch`.
    EarlyStopped { epoch: usize },
}

/// Result of [`fit`].
#[derive(Debug, Clone, Serialize)]
pub struct TrainingOutcome {
    pub history: Vec<EpochMetrics>,
    pub stop_reason: StopReason,
    /// Epoch with the lowest validation loss.
    pub best_epoch: Option<usize>,
    pub best_val_loss: f64,
    /// Whether the best-epoch weights were written back before returning.
    pub restored_best_weights: bool,
    /// Metric log directory of this run.
    pub run_dir: PathBuf,
}

fn training_error(context: &str) -> impl Fn(candle_core::Error) -> MemeSenseError + '_ {
    move |e| MemeSenseError::Training(format!("{context}: {e}"))
}

/// Index of the largest value; the first one wins ties.
pub(crate) fn argmax(values: &[f32]) -> u32 {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best as u32
}

/// One optimizer pass over `train`. Returns mean loss and accuracy.
fn train_epoch(
    model: &FusionClassifier,
    optimizer: &mut candle_nn::AdamW,
    train: &Partition,
    batches: &mut BatchIterator,
    augmenter: &mut ImageAugmenter,
    class_weights: &Tensor,
    device: &Device,
) -> candle_core::Result<(f64, f64)> {
    let mut loss_sum = 0.0;
    let mut correct = 0usize;
    let mut seen = 0usize;

    while let Some(positions) = batches.next_positions() {
        let batch = train.batch(&positions, Some(&mut *augmenter), device)?;
        let logits = model.forward_t(&batch.images, &batch.tokens, true)?;
        let loss = model.loss(&logits, &batch.labels, class_weights)?;
        optimizer.backward_step(&loss)?;

        let b = positions.len();
        loss_sum += loss.to_scalar::<f32>()? as f64 * b as f64;
        let predicted: Vec<u32> = logits.argmax(D::Minus1)?.to_vec1()?;
        correct += predicted
            .iter()
            .zip(positions.iter())
            .filter(|(p, pos)| **p == train.labels[**pos])
            .count();
        seen += b;
    }

    if seen == 0 {
        return Ok((0.0, 0.0));
    }
    Ok((loss_sum / seen as f64, correct as f64 / seen as f64))
}

/// Train `model` until early stopping fires or the epoch cap is reached.
///
/// `varmap` must hold every variable of `model`. On return the variables hold
/// the best-validation-loss weights when `restore_best_weights` is set, and
/// the best weights are also on disk at `output.checkpoint_path`.
pub fn fit(
    model: &FusionClassifier,
    varmap: &VarMap,
    train: &Partition,
    val: &Partition,
    class_weights: &ClassWeights,
    config: &ExperimentConfig,
) -> Result<TrainingOutcome> {
    require_non_empty(train, "training")?;
    require_non_empty(val, "validation")?;
    let training = &config.training;
    let device = model.device();

    let (vars, _plan) = trainable_vars(varmap, config.model.backbone.fine_tune_layers)?;
    let mut optimizer = candle_nn::AdamW::new(
        vars,
        candle_nn::ParamsAdamW {
            lr: training.learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        },
    )
    .map_err(training_error("Failed to create optimizer"))?;
    let weights = class_weights
        .to_tensor(device)
        .map_err(training_error("Failed to build class weights"))?;

    let mut plateau = ReduceLrOnPlateau::new(&training.reduce_lr);
    let mut early_stopping = EarlyStopping::new(&training.early_stopping);
    let mut checkpointer = Checkpointer::new(&config.output.checkpoint_path);
    let mut logger = MetricsLogger::create(
        &config.output.log_dir,
        training.histograms,
        training.histogram_bins,
    )?;
    let mut augmenter = ImageAugmenter::new(&config.image, config.seed);
    let mut batches = BatchIterator::new(train.len(), training.batch_size);
    let mut best_snapshot: Option<WeightSnapshot> = None;
    let mut history = Vec::new();
    let mut stop_reason = StopReason::MaxEpochs;

    info!(
        train = train.len(),
        validation = val.len(),
        batches = batches.num_batches(),
        lr = training.learning_rate,
        max_epochs = training.max_epochs,
        run_dir = %logger.run_dir().display(),
        "Starting training"
    );

    for epoch in 0..training.max_epochs {
        batches.reshuffle(config.seed, epoch);
        let learning_rate = optimizer.learning_rate();

        let (train_loss, train_accuracy) = train_epoch(
            model,
            &mut optimizer,
            train,
            &mut batches,
            &mut augmenter,
            &weights,
            device,
        )
        .map_err(training_error("Training step failed"))?;

        let scores = score_partition(model, val, training.batch_size)?;
        let metrics = EpochMetrics {
            epoch,
            train_loss,
            train_accuracy,
            val_loss: scores.loss,
            val_accuracy: scores.accuracy(&val.labels),
            learning_rate,
        };
        info!("{metrics}");
        logger.log_epoch(&metrics)?;

        if let Some(lr) = plateau.step(metrics.val_loss, learning_rate) {
            optimizer.set_learning_rate(lr);
        }

        let decision = early_stopping.update(epoch, metrics.val_loss);
        let restore_best = training.early_stopping.restore_best_weights;
        if decision == EarlyStoppingDecision::Improved && restore_best {
            best_snapshot = Some(WeightSnapshot::capture(varmap)?);
        }

        if checkpointer.observe(varmap, metrics.val_loss)? {
            info!(
                path = %checkpointer.path().display(),
                val_loss = metrics.val_loss,
                "Validation loss improved, saved checkpoint"
            );
        }

        logger.log_histograms(epoch, varmap);
        history.push(metrics);

        if decision == EarlyStoppingDecision::Stop {
            info!(
                epoch = epoch + 1,
                patience = training.early_stopping.patience,
                "Early stopping"
            );
            stop_reason = StopReason::EarlyStopped { epoch };
            break;
        }
    }

    let restored_best_weights = match &best_snapshot {
        Some(snapshot) => {
            snapshot.restore(varmap)?;
            debug!(best_epoch = ?early_stopping.best_epoch(), "Restored best weights");
            true
        }
        None => false,
    };

    info!(
        epochs = history.len(),
        best_epoch = ?early_stopping.best_epoch().map(|e| e + 1),
        best_val_loss = early_stopping.best_loss(),
        checkpoint = %checkpointer.path().display(),
        "Training finished"
    );

    Ok(TrainingOutcome {
        history,
        stop_reason,
        best_epoch: early_stopping.best_epoch(),
        best_val_loss: early_stopping.best_loss(),
        restored_best_weights,
        run_dir: logger.run_dir().to_path_buf(),
    })
}

// ---------------------------------------------------------------------------
// Full pipeline
// ---------------------------------------------------------------------------

/// Everything a finished run produced, kept in memory for evaluation.
pub struct TrainingRun {
    pub data: PreparedData,
    pub vocabulary: Vocabulary,
    pub varmap: VarMap,
    pub model: FusionClassifier,
    pub class_weights: ClassWeights,
    pub outcome: TrainingOutcome,
}

/// Load and split the data, fit and save the vocabulary, build the model and
/// train it.
pub fn train(config: &ExperimentConfig) -> Result<TrainingRun> {
    let data = prepare_dataset(config)?;
    let (train_rows, val_rows) =
        take_validation_tail(&data.split.train, config.training.validation_fraction);

    let vocabulary = Vocabulary::fit(
        &data.captions_of(&data.split.train),
        config.text.max_tokens,
        config.text.sequence_length,
    );
    vocabulary.save(&config.output.vocabulary_path)?;

    let train_part = Partition::new(&data, &train_rows, &vocabulary);
    let val_part = Partition::new(&data, &val_rows, &vocabulary);

    // weights cover the whole training partition, validation tail included
    let class_weights = if config.training.class_weighting {
        ClassWeights::balanced(&data.labels_of(&data.split.train))
    } else {
        ClassWeights::uniform()
    };
    info!(weights = ?class_weights.dense(), "Class weights");

    let device = select_device(config.device);
    let varmap = VarMap::new();
    let model = FusionClassifier::new_trainable(&varmap, &config.model, vocabulary.len(), &device)?;

    let outcome = fit(
        &model,
        &varmap,
        &train_part,
        &val_part,
        &class_weights,
        config,
    )?;

    Ok(TrainingRun {
        data,
        vocabulary,
        varmap,
        model,
        class_weights,
        outcome,
    })
}
