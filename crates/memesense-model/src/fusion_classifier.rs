//! Image + caption fusion classifier.
//!
//! # Architecture
//!
//! ```text
//! image [B,3,H,W] in [0,1] → ×2−1 → ResNet (pooled)
//!     → Linear(512) → ReLU → Dropout(0.4)                      ┐
//!                                                              ├ concat
//! tokens [B,T] → Embedding(300) → BiLSTM(2×256) → max over T   │
//!     → Linear(128) → ReLU → Dropout(0.4)                      ┘
//!
//! concat [B,640] → Linear(512) → ReLU → Dropout(0.5) → Linear(5)
//! ```
//!
//! The two branch projections carry an L2 penalty that is added to the loss.
//! Variables live under `image.*`, `text.*` and `fusion.*`; the backbone is
//! under [`IMAGE_BACKBONE_PREFIX`].

use std::path::Path;

use candle_core::{DType, Device, Module, Tensor, Var, D};
use candle_nn::{Dropout, Linear, VarBuilder, VarMap};
use memesense_core::config::ModelConfig;
use memesense_core::{MemeSenseError, Result, NUM_CLASSES};
use tracing::info;

use crate::backbone::{self, is_running_stat, FreezePlan, ImageBackbone};
use crate::loss::{l2_penalty, weighted_cross_entropy};
use crate::text_encoder::TextEncoder;

/// Variable prefix of the pretrained backbone.
pub const IMAGE_BACKBONE_PREFIX: &str = "image.backbone";

/// Two-branch sentiment classifier.
pub struct FusionClassifier {
    backbone: ImageBackbone,
    image_projection: Linear,
    text_encoder: TextEncoder,
    text_projection: Linear,
    fusion_hidden: Linear,
    output: Linear,
    branch_dropout: Dropout,
    fusion_dropout: Dropout,
    l2: f64,
    device: Device,
}

impl FusionClassifier {
    fn build(
        config: &ModelConfig,
        vocab_size: usize,
        vb: VarBuilder<'static>,
        device: &Device,
    ) -> candle_core::Result<Self> {
        let image = vb.pp("image");
        let backbone = ImageBackbone::new(config.backbone.depth, image.pp("backbone"))?;
        let image_projection = candle_nn::linear(
            backbone.feature_dim(),
            config.image_projection_dim,
            image.pp("projection"),
        )?;

        let text = vb.pp("text");
        let text_encoder = TextEncoder::new(
            vocab_size,
            config.embedding_dim,
            config.lstm_hidden,
            text.clone(),
        )?;
        let text_projection = candle_nn::linear(
            text_encoder.output_dim(),
            config.text_projection_dim,
            text.pp("projection"),
        )?;

        let fusion = vb.pp("fusion");
        let fusion_hidden = candle_nn::linear(
            config.image_projection_dim + config.text_projection_dim,
            config.fusion_dim,
            fusion.pp("hidden"),
        )?;
        let output = candle_nn::linear(config.fusion_dim, NUM_CLASSES, fusion.pp("output"))?;

        Ok(Self {
            backbone,
            image_projection,
            text_encoder,
            text_projection,
            fusion_hidden,
            output,
            branch_dropout: Dropout::new(config.branch_dropout),
            fusion_dropout: Dropout::new(config.fusion_dropout),
            l2: config.l2,
            device: device.clone(),
        })
    }

    /// Create a trainable classifier whose variables live in `varmap`.
    ///
    /// When the backbone is configured as pretrained, its weights are resolved
    /// (local file or hub) and copied in; everything else starts from random
    /// initialisation.
    pub fn new_trainable(
        varmap: &VarMap,
        config: &ModelConfig,
        vocab_size: usize,
        device: &Device,
    ) -> Result<Self> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        let model = Self::build(config, vocab_size, vb, device)
            .map_err(|e| MemeSenseError::Model(format!("Failed to create fusion model: {e}")))?;

        if let Some(path) = backbone::resolve_weights(&config.backbone)? {
            backbone::load_pretrained(varmap, IMAGE_BACKBONE_PREFIX, &path, device)?;
        }

        info!(
            depth = config.backbone.depth.layers(),
            vocab_size,
            variables = varmap.all_vars().len(),
            "Created fusion model"
        );
        Ok(model)
    }

    /// Load a classifier from a checkpoint written by [`VarMap::save`].
    ///
    /// Returns an error if the file cannot be read or the weights do not
    /// match the configured architecture.
    pub fn load(
        path: &Path,
        config: &ModelConfig,
        vocab_size: usize,
        device: &Device,
    ) -> Result<Self> {
        if !path.is_file() {
            return Err(MemeSenseError::Model(format!(
                "Checkpoint not found at {}",
                path.display()
            )));
        }
        // SAFETY: memory-mapping safetensors is the standard candle pattern.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device).map_err(|e| {
                MemeSenseError::Model(format!("Failed to load checkpoint: {e}"))
            })?
        };
        Self::build(config, vocab_size, vb, device).map_err(|e| {
            MemeSenseError::Model(format!(
                "Checkpoint {} does not match the model configuration: {}",
                path.display(),
                e
            ))
        })
    }

    /// Logits `[B, 5]`. Dropout is active only when `train` is set.
    ///
    /// * `images`: `[B, 3, H, W]`, values in `[0, 1]`
    /// * `token_ids`: `[B, T]`, `u32`
    pub fn forward_t(
        &self,
        images: &Tensor,
        token_ids: &Tensor,
        train: bool,
    ) -> candle_core::Result<Tensor> {
        let pixels = images.affine(2.0, -1.0)?;
        let image = self.backbone.forward(&pixels)?;
        let image = self.image_projection.forward(&image)?.relu()?;
        let image = self.branch_dropout.forward(&image, train)?;

        let text = self.text_encoder.forward(token_ids)?;
        let text = self.text_projection.forward(&text)?.relu()?;
        let text = self.branch_dropout.forward(&text, train)?;

        let fused = Tensor::cat(&[&image, &text], 1)?;
        let hidden = self.fusion_hidden.forward(&fused)?.relu()?;
        let hidden = self.fusion_dropout.forward(&hidden, train)?;
        self.output.forward(&hidden)
    }

    /// Inference logits (no dropout).
    pub fn forward_logits(
        &self,
        images: &Tensor,
        token_ids: &Tensor,
    ) -> candle_core::Result<Tensor> {
        self.forward_t(images, token_ids, false)
    }

    /// Class probabilities `[B, 5]`.
    pub fn predict_proba(
        &self,
        images: &Tensor,
        token_ids: &Tensor,
    ) -> candle_core::Result<Tensor> {
        let logits = self.forward_logits(images, token_ids)?;
        candle_nn::ops::softmax(&logits, D::Minus1)
    }

    /// L2 penalty over the two branch projection kernels.
    pub fn l2_penalty(&self) -> candle_core::Result<Tensor> {
        l2_penalty(
            &[self.image_projection.weight(), self.text_projection.weight()],
            self.l2,
        )
    }

    /// Full training objective: weighted cross-entropy plus the L2 penalty.
    pub fn loss(
        &self,
        logits: &Tensor,
        labels: &Tensor,
        class_weights: &Tensor,
    ) -> candle_core::Result<Tensor> {
        weighted_cross_entropy(logits, labels, class_weights)? + self.l2_penalty()?
    }

    /// Returns a reference to the device this classifier runs on.
    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// Variables the optimizer updates, sorted by name.
///
/// Everything outside the backbone is trainable; inside it, the
/// [`FreezePlan`] decides. Batch-norm running statistics are always excluded.
///
/// # Errors
///
/// Returns [`MemeSenseError::Model`] if the variable map lock is poisoned.
pub fn trainable_vars(varmap: &VarMap, fine_tune_layers: usize) -> Result<(Vec<Var>, FreezePlan)> {
    let plan = FreezePlan::from_varmap(varmap, IMAGE_BACKBONE_PREFIX, fine_tune_layers)?;
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| MemeSenseError::Model("variable map lock poisoned".to_string()))?;
    let scope = format!("{IMAGE_BACKBONE_PREFIX}.");

    let mut selected: Vec<(&String, &Var)> = vars
        .iter()
        .filter(|(name, _)| match name.strip_prefix(&scope) {
            Some(local) => plan.is_trainable(local),
            None => !is_running_stat(name),
        })
        .collect();
    selected.sort_by(|a, b| a.0.cmp(b.0));

    info!(
        trainable = selected.len(),
        total = vars.len(),
        frozen_backbone_layers = plan.frozen_layers().len(),
        trainable_backbone_layers = plan.trainable_layers().len(),
        "Selected trainable variables"
    );
    let selected = selected.into_iter().map(|(_, v)| v.clone()).collect();
    Ok((selected, plan))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use memesense_core::config::{BackboneConfig, ResNetDepth};

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            backbone: BackboneConfig {
                depth: ResNetDepth::R18,
                pretrained: false,
                fine_tune_layers: 4,
                ..BackboneConfig::default()
            },
            image_projection_dim: 8,
            embedding_dim: 6,
            lstm_hidden: 4,
            text_projection_dim: 4,
            fusion_dim: 8,
            ..ModelConfig::default()
        }
    }

    fn inputs() -> (Tensor, Tensor) {
        let images = Tensor::rand(0f32, 1f32, (2, 3, 32, 32), &Device::Cpu).unwrap();
        let tokens = Tensor::new(&[[2u32, 3, 4, 0, 0], [5, 1, 1, 6, 0]], &Device::Cpu).unwrap();
        (images, tokens)
    }

    #[test]
    fn test_logits_and_probabilities() {
        let varmap = VarMap::new();
        let model = FusionClassifier::new_trainable(&varmap, &tiny_config(), 10, &Device::Cpu)
            .unwrap();
        let (images, tokens) = inputs();

        let logits = model.forward_logits(&images, &tokens).unwrap();
        assert_eq!(logits.dims(), &[2, NUM_CLASSES]);

        let probs: Vec<Vec<f32>> = model
            .predict_proba(&images, &tokens)
            .unwrap()
            .to_vec2()
            .unwrap();
        for row in probs {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
            assert!(row.iter().all(|p| (0.0..=1.0).contains(p)));
        }
    }

    #[test]
    fn test_inference_is_deterministic() {
        let varmap = VarMap::new();
        let model = FusionClassifier::new_trainable(&varmap, &tiny_config(), 10, &Device::Cpu)
            .unwrap();
        let (images, tokens) = inputs();
        let a: Vec<Vec<f32>> = model.forward_logits(&images, &tokens).unwrap().to_vec2().unwrap();
        let b: Vec<Vec<f32>> = model.forward_logits(&images, &tokens).unwrap().to_vec2().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_trainable_vars_respect_freeze_plan() {
        let varmap = VarMap::new();
        let config = tiny_config();
        FusionClassifier::new_trainable(&varmap, &config, 10, &Device::Cpu).unwrap();
        let (vars, plan) = trainable_vars(&varmap, config.backbone.fine_tune_layers).unwrap();

        assert_eq!(plan.trainable_layers().len(), 4);
        // last basic block of layer4: conv1, bn1, conv2, bn2
        assert_eq!(
            plan.trainable_layers(),
            &[
                "layer4.1.conv1",
                "layer4.1.bn1",
                "layer4.1.conv2",
                "layer4.1.bn2"
            ]
        );

        let all = varmap.all_vars().len();
        // conv1/conv2 weights + bn1/bn2 weight and bias
        let backbone_trainable = 2 + 4;
        let backbone_total = varmap
            .data()
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with("image.backbone."))
            .count();
        assert_eq!(vars.len(), all - backbone_total + backbone_trainable);
    }

    #[test]
    fn test_l2_penalty_is_positive_and_scaled() {
        let varmap = VarMap::new();
        let mut config = tiny_config();
        let model = FusionClassifier::new_trainable(&varmap, &config, 10, &Device::Cpu).unwrap();
        let base = model.l2_penalty().unwrap().to_scalar::<f32>().unwrap();
        assert!(base > 0.0);

        config.l2 = 0.0;
        let varmap = VarMap::new();
        let model = FusionClassifier::new_trainable(&varmap, &config, 10, &Device::Cpu).unwrap();
        assert_eq!(model.l2_penalty().unwrap().to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_load_missing_checkpoint_fails() {
        let result = FusionClassifier::load(
            Path::new("/nonexistent/memesense.safetensors"),
            &tiny_config(),
            10,
            &Device::Cpu,
        );
        assert!(matches!(result, Err(MemeSenseError::Model(_))));
    }
}
