//! Experiment configuration.
//!
//! Every path and hyperparameter of a run lives in [`ExperimentConfig`]. The
//! defaults reproduce the reference experiment; a YAML file only needs to list
//! the fields it overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::{MemeSenseError, Result};

/// Environment variable consulted when no config path is given explicitly.
pub const CONFIG_ENV_VAR: &str = "MEMESENSE_CONFIG";

/// Top-level configuration for a training / evaluation run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Seed for the split, batch shuffling, and augmentation.
    pub seed: u64,
    /// Compute device.
    pub device: DevicePreference,
    /// Dataset location and row-filtering rules.
    pub data: DataConfig,
    /// Caption vectorization.
    pub text: TextConfig,
    /// Image decoding and augmentation.
    pub image: ImageConfig,
    /// Fusion network shape.
    pub model: ModelConfig,
    /// Optimizer, batching, and training policies.
    pub training: TrainingConfig,
    /// Artifact locations.
    pub output: OutputConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            device: DevicePreference::Auto,
            data: DataConfig::default(),
            text: TextConfig::default(),
            image: ImageConfig::default(),
            model: ModelConfig::default(),
            training: TrainingConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

/// Where tensors live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePreference {
    /// First available accelerator compiled in, else CPU.
    Auto,
    /// Always CPU.
    Cpu,
}

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

/// Which cells make a row incomplete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingValuePolicy {
    /// Drop a row when any retained column is empty.
    AnyColumn,
    /// Drop a row only when the image, caption, or label cell is empty.
    RequiredColumns,
}

/// What to do when a referenced image cannot be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingImagePolicy {
    /// Fail the run.
    Abort,
    /// Log a warning and drop the sample.
    Skip,
}

/// Dataset location and row-filtering rules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DataConfig {
    /// CSV label table.
    pub labels_path: PathBuf,
    /// Directory the image column is relative to.
    pub images_dir: PathBuf,
    /// Column holding the image file name.
    pub image_column: String,
    /// Column holding the caption.
    pub text_column: String,
    /// Column holding the sentiment label.
    pub label_column: String,
    /// Row-dropping rule for missing cells.
    pub missing_values: MissingValuePolicy,
    /// Handling of unreadable images.
    pub on_missing_image: MissingImagePolicy,
    /// Fraction of samples held out for testing.
    pub test_fraction: f64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            labels_path: PathBuf::from("data/labels.csv"),
            images_dir: PathBuf::from("data/images"),
            image_column: "image_name".to_string(),
            text_column: "text_corrected".to_string(),
            label_column: "overall_sentiment".to_string(),
            missing_values: MissingValuePolicy::AnyColumn,
            on_missing_image: MissingImagePolicy::Abort,
            test_fraction: 0.2,
        }
    }
}

// ---------------------------------------------------------------------------
// Text / image preprocessing
// ---------------------------------------------------------------------------

/// Caption vectorization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TextConfig {
    /// Vocabulary cap, including the padding and OOV entries.
    pub max_tokens: usize,
    /// Fixed token sequence length.
    pub sequence_length: usize,
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            max_tokens: 100_000,
            sequence_length: 50,
        }
    }
}

/// Resampling filter used when resizing images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeFilter {
    /// Nearest neighbour.
    Nearest,
    /// Bilinear.
    Triangle,
    /// Bicubic.
    CatmullRom,
    /// Lanczos with window 3.
    Lanczos3,
}

/// Image decoding and augmentation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ImageConfig {
    /// Target height in pixels.
    pub height: u32,
    /// Target width in pixels.
    pub width: u32,
    /// Resize filter; aspect ratio is never preserved.
    pub resize_filter: ResizeFilter,
    /// Probability of a horizontal flip during training.
    pub flip_probability: f64,
    /// Maximum rotation as a fraction of a full turn, applied symmetrically.
    pub rotation_factor: f64,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            height: 100,
            width: 100,
            resize_filter: ResizeFilter::Nearest,
            flip_probability: 0.5,
            rotation_factor: 0.2,
        }
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// ResNet variant used as the image backbone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResNetDepth {
    /// ResNet-18.
    #[serde(rename = "18")]
    R18,
    /// ResNet-34.
    #[serde(rename = "34")]
    R34,
    /// ResNet-50.
    #[serde(rename = "50")]
    R50,
    /// ResNet-101.
    #[serde(rename = "101")]
    R101,
    /// ResNet-152.
    #[serde(rename = "152")]
    R152,
}

impl ResNetDepth {
    /// Number of layers in the architecture name.
    pub fn layers(self) -> usize {
        match self {
            ResNetDepth::R18 => 18,
            ResNetDepth::R34 => 34,
            ResNetDepth::R50 => 50,
            ResNetDepth::R101 => 101,
            ResNetDepth::R152 => 152,
        }
    }
}

/// Pretrained convolutional backbone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackboneConfig {
    /// Architecture.
    pub depth: ResNetDepth,
    /// Number of trailing parameterized layers left trainable; the rest are frozen.
    pub fine_tune_layers: usize,
    /// Load pretrained weights. When `false` the backbone starts from random init.
    pub pretrained: bool,
    /// Local safetensors file; takes precedence over the hub download.
    pub weights_path: Option<PathBuf>,
    /// HuggingFace repository holding `resnet{depth}.safetensors`.
    pub hub_repo: String,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            depth: ResNetDepth::R50,
            fine_tune_layers: 50,
            pretrained: true,
            weights_path: None,
            hub_repo: "lmz/candle-resnet".to_string(),
        }
    }
}

/// Fusion network shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    /// Image backbone.
    pub backbone: BackboneConfig,
    /// Width of the image projection layer.
    pub image_projection_dim: usize,
    /// Token embedding width.
    pub embedding_dim: usize,
    /// LSTM hidden size per direction.
    pub lstm_hidden: usize,
    /// Width of the text projection layer.
    pub text_projection_dim: usize,
    /// Dropout after each branch projection.
    pub branch_dropout: f32,
    /// Width of the fused hidden layer.
    pub fusion_dim: usize,
    /// Dropout after the fused hidden layer.
    pub fusion_dropout: f32,
    /// L2 penalty applied to the two branch projection kernels.
    pub l2: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backbone: BackboneConfig::default(),
            image_projection_dim: 512,
            embedding_dim: 300,
            lstm_hidden: 256,
            text_projection_dim: 128,
            branch_dropout: 0.4,
            fusion_dim: 512,
            fusion_dropout: 0.5,
            l2: 0.01,
        }
    }
}

// ---------------------------------------------------------------------------
// Training
// ---------------------------------------------------------------------------

/// Learning-rate reduction when validation loss stops improving.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlateauConfig {
    /// Multiplier applied to the learning rate.
    pub factor: f64,
    /// Epochs without improvement before reducing.
    pub patience: usize,
    /// Minimum decrease that counts as an improvement.
    pub min_delta: f64,
    /// Epochs to wait after a reduction before counting again.
    pub cooldown: usize,
    /// Lower bound for the learning rate.
    pub min_lr: f64,
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            factor: 0.1,
            patience: 5,
            min_delta: 1e-4,
            cooldown: 0,
            min_lr: 0.0,
        }
    }
}

/// Early stopping on validation loss.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EarlyStoppingConfig {
    /// Epochs without improvement before stopping.
    pub patience: usize,
    /// Minimum decrease that counts as an improvement.
    pub min_delta: f64,
    /// Restore the best-seen weights when training ends.
    pub restore_best_weights: bool,
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self {
            patience: 10,
            min_delta: 0.0,
            restore_best_weights: true,
        }
    }
}

/// Whether per-epoch weight histograms go to the TensorBoard log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistogramLogging {
    /// One histogram per variable per epoch.
    Enabled,
    /// Scalars only.
    Disabled,
}

/// Optimizer, batching, and training policies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingConfig {
    /// Initial Adam learning rate.
    pub learning_rate: f64,
    /// Mini-batch size.
    pub batch_size: usize,
    /// Epoch cap.
    pub max_epochs: usize,
    /// Tail fraction of the training partition used for validation.
    pub validation_fraction: f64,
    /// Weight the loss by inverse class frequency.
    pub class_weighting: bool,
    /// Learning-rate reduction policy.
    pub reduce_lr: PlateauConfig,
    /// Early stopping policy.
    pub early_stopping: EarlyStoppingConfig,
    /// Weight histogram logging.
    pub histograms: HistogramLogging,
    /// Number of buckets per weight histogram.
    pub histogram_bins: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 5e-4,
            batch_size: 32,
            max_epochs: 50,
            validation_fraction: 0.2,
            class_weighting: true,
            reduce_lr: PlateauConfig::default(),
            early_stopping: EarlyStoppingConfig::default(),
            histograms: HistogramLogging::Enabled,
            histogram_bins: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Artifact locations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    /// Best-validation-loss checkpoint (safetensors).
    pub checkpoint_path: PathBuf,
    /// Fitted vocabulary (JSON).
    pub vocabulary_path: PathBuf,
    /// Root of the metric log directories.
    pub log_dir: PathBuf,
    /// Evaluation report and prediction grid directory.
    pub report_dir: PathBuf,
    /// Number of test samples rendered in the prediction grid.
    pub grid_samples: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            checkpoint_path: PathBuf::from("models/memesense_best.safetensors"),
            vocabulary_path: PathBuf::from("models/vocabulary.json"),
            log_dir: PathBuf::from("logs"),
            report_dir: PathBuf::from("reports"),
            grid_samples: 9,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl ExperimentConfig {
    /// Reject values that would make the run meaningless.
    ///
    /// # Errors
    ///
    /// Returns [`MemeSenseError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let fraction_ok = |v: f64| v > 0.0 && v < 1.0;
        if !fraction_ok(self.data.test_fraction) {
            return Err(config_error("data.test_fraction must be in (0, 1)"));
        }
        if !fraction_ok(self.training.validation_fraction) {
            return Err(config_error(
                "training.validation_fraction must be in (0, 1)",
            ));
        }
        if self.text.max_tokens < 3 {
            return Err(config_error(
                "text.max_tokens must leave room for at least one real token",
            ));
        }
        if self.text.sequence_length == 0 {
            return Err(config_error("text.sequence_length must be positive"));
        }
        if self.image.height == 0 || self.image.width == 0 {
            return Err(config_error("image.height and image.width must be positive"));
        }
        if !(0.0..=1.0).contains(&self.image.flip_probability) {
            return Err(config_error("image.flip_probability must be in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.image.rotation_factor) {
            return Err(config_error("image.rotation_factor must be in [0, 1]"));
        }
        for (name, p) in [
            ("model.branch_dropout", self.model.branch_dropout),
            ("model.fusion_dropout", self.model.fusion_dropout),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(config_error(&format!("{name} must be in [0, 1)")));
            }
        }
        if self.model.l2 < 0.0 {
            return Err(config_error("model.l2 must be non-negative"));
        }
        if self.training.learning_rate <= 0.0 {
            return Err(config_error("training.learning_rate must be positive"));
        }
        if self.training.batch_size == 0 {
            return Err(config_error("training.batch_size must be positive"));
        }
        if self.training.max_epochs == 0 {
            return Err(config_error("training.max_epochs must be positive"));
        }
        if !(self.training.reduce_lr.factor > 0.0 && self.training.reduce_lr.factor < 1.0) {
            return Err(config_error("training.reduce_lr.factor must be in (0, 1)"));
        }
        if self.training.histogram_bins == 0 {
            return Err(config_error("training.histogram_bins must be positive"));
        }
        Ok(())
    }
}

fn config_error(msg: &str) -> MemeSenseError {
    MemeSenseError::Config(msg.to_string())
}

/// Load an [`ExperimentConfig`] from a YAML file at `path` and validate it.
///
/// # Errors
///
/// Returns an error if the file cannot be read, the YAML is invalid, or a
/// value fails [`ExperimentConfig::validate`].
pub fn load_config(path: &Path) -> Result<ExperimentConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        MemeSenseError::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    let config: ExperimentConfig = serde_yaml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

/// Resolve the run configuration.
///
/// Checks (in order):
/// 1. The explicit path (usually the `--config` flag)
/// 2. The [`CONFIG_ENV_VAR`] environment variable
/// 3. Default configuration
pub fn resolve_config(explicit: Option<&Path>) -> Result<ExperimentConfig> {
    let path: Option<PathBuf> = explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from));

    match path {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration from file");
            load_config(&path)
        }
        None => {
            info!("No config file specified, using defaults");
            let config = ExperimentConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}
