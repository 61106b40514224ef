//! Data preparation for memesense.
//!
//! Everything that happens before a tensor is built: reading the label table,
//! normalising captions, decoding images, splitting, vectorizing captions, and
//! training-time image augmentation.
//!
//! # Modules
//!
//! - [`loader`]: CSV label table → [`Sample`]s
//! - [`normalise`]: caption normalisation
//! - [`images`]: image decoding into a contiguous CHW store
//! - [`split`]: stratified train/test split and validation tail
//! - [`vectorizer`]: vocabulary fitting and fixed-length token sequences
//! - [`augment`]: random flip and rotation for training batches

use memesense_core::{Sample, Sentiment, NUM_CLASSES};

pub mod augment;
pub mod images;
pub mod loader;
pub mod normalise;
pub mod split;
pub mod vectorizer;

pub use augment::ImageAugmenter;
pub use images::{load_images, ImageSet, LoadedImages};
pub use loader::{load_samples, LabelTable};
pub use normalise::{normalise_caption, normalise_captions};
pub use split::{stratified_split, take_validation_tail, Split};
pub use vectorizer::Vocabulary;

/// Count the members of each class, indexed by class code.
pub fn class_counts<I>(labels: I) -> [usize; NUM_CLASSES]
where
    I: IntoIterator<Item = Sentiment>,
{
    let mut counts = [0usize; NUM_CLASSES];
    for label in labels {
        counts[label.code() as usize] += 1;
    }
    counts
}

/// Labels of `samples`, in order.
pub fn labels_of(samples: &[Sample]) -> Vec<Sentiment> {
    samples.iter().map(|s| s.sentiment).collect()
}
