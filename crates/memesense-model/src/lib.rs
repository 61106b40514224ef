//! Fusion network for memesense.
//!
//! Two branches meet in a small fully-connected head:
//!
//! - [`backbone`]: pretrained ResNet feature extractor and its [`FreezePlan`]
//! - [`text_encoder`]: embedding + bidirectional LSTM + max pooling
//! - [`fusion_classifier`]: the combined [`FusionClassifier`]
//! - [`loss`]: class-weighted cross-entropy and the L2 penalty
//! - [`device`]: compute device selection

pub mod backbone;
pub mod device;
pub mod fusion_classifier;
pub mod loss;
pub mod text_encoder;

pub use backbone::{FreezePlan, ImageBackbone};
pub use device::select_device;
pub use fusion_classifier::{trainable_vars, FusionClassifier, IMAGE_BACKBONE_PREFIX};
pub use loss::weighted_cross_entropy;
pub use text_encoder::TextEncoder;
