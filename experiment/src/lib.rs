//! memesense experiment pipeline
//!
//! Trains the image + caption fusion classifier on a labelled meme table,
//! evaluates it on the held-out partition, and renders sample predictions.
//!
//! # Modules
//!
//! - [`training`]: dataset preparation, batching, class weights, callbacks,
//!   metric logging, and the training loop
//! - [`evaluation`]: test-set metrics, prediction grid, single-sample prediction

pub mod evaluation;
pub mod training;
