//! Fusion classifier training pipeline.
//!
//! Prepares the dataset (table, images, captions, stratified split), fits the
//! caption vocabulary on the training partition, and trains the fusion model
//! with class weighting, learning-rate reduction on plateau, early stopping,
//! best-checkpoint saving, and per-epoch metric logging.

pub mod callbacks;
pub mod class_weights;
pub mod data;
pub mod logging;
pub mod metrics;
pub mod trainer;
