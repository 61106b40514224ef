//! Single image + caption prediction from a saved checkpoint.

use std::path::Path;

use candle_core::Tensor;
use memesense_core::{ExperimentConfig, MemeSenseError, Result, Sentiment, NUM_CLASSES};
use memesense_data::images::decode_image;
use memesense_data::{normalise_caption, Vocabulary};
use memesense_model::{select_device, FusionClassifier};
use serde::Serialize;
use tracing::info;

use super::probabilities_of;
use crate::training::trainer::argmax;

/// Predicted class and the full distribution for one meme.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SinglePrediction {
    pub sentiment: Sentiment,
    pub confidence: f32,
    pub probabilities: [f32; NUM_CLASSES],
    /// Caption after normalisation, as the model saw it.
    pub normalised_caption: String,
}

impl std::fmt::Display for SinglePrediction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} ({:.2}%)", self.sentiment, self.confidence * 100.0)?;
        for (class, p) in Sentiment::ALL.iter().zip(self.probabilities.iter()) {
            writeln!(f, "  {:<14} {:.4}", class.as_str(), p)?;
        }
        Ok(())
    }
}

/// Predict with an already-loaded model and vocabulary.
pub fn predict_with(
    model: &FusionClassifier,
    vocabulary: &Vocabulary,
    config: &ExperimentConfig,
    image_path: &Path,
    caption: &str,
) -> Result<SinglePrediction> {
    let pixels = decode_image(image_path, &config.image)?;
    let normalised_caption = normalise_caption(caption);
    let tokens = vocabulary.encode(&normalised_caption);

    let device = model.device();
    let (h, w) = (config.image.height as usize, config.image.width as usize);
    let t = tokens.len();
    let images = Tensor::from_vec(pixels, (1, 3, h, w), device)
        .map_err(|e| MemeSenseError::Model(format!("Failed to build image tensor: {e}")))?;
    let tokens = Tensor::from_vec(tokens, (1, t), device)
        .map_err(|e| MemeSenseError::Model(format!("Failed to build token tensor: {e}")))?;

    let probabilities = probabilities_of(model, &images, &tokens)?
        .into_iter()
        .next()
        .ok_or_else(|| MemeSenseError::Model("model returned no prediction".to_string()))?;
    let code = argmax(&probabilities);
    let sentiment = Sentiment::from_code(code)
        .ok_or_else(|| MemeSenseError::Model(format!("class code {code} out of range")))?;

    Ok(SinglePrediction {
        sentiment,
        confidence: probabilities[code as usize],
        probabilities,
        normalised_caption,
    })
}

/// Load the vocabulary and checkpoint named by `config` (or `checkpoint`)
/// and classify one image + caption pair.
pub fn predict_single(
    config: &ExperimentConfig,
    checkpoint: Option<&Path>,
    image_path: &Path,
    caption: &str,
) -> Result<SinglePrediction> {
    let checkpoint = checkpoint.unwrap_or(config.output.checkpoint_path.as_path());
    let vocabulary = Vocabulary::load(&config.output.vocabulary_path)?;
    let device = select_device(config.device);
    let model = FusionClassifier::load(checkpoint, &config.model, vocabulary.len(), &device)?;

    let prediction = predict_with(&model, &vocabulary, config, image_path, caption)?;
    info!(
        image = %image_path.display(),
        sentiment = %prediction.sentiment,
        confidence = prediction.confidence,
        "Predicted"
    );
    Ok(prediction)
}
