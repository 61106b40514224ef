//! Dataset preparation, partitions, and batch iteration.

use candle_core::{Device, Tensor};
use memesense_core::{ExperimentConfig, MemeSenseError, Result, Sample, Sentiment};
use memesense_data::{
    labels_of, load_images, load_samples, normalise_caption, stratified_split, ImageAugmenter,
    ImageSet, Split, Vocabulary,
};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::info;

/// Every usable sample of the table with its decoded image, normalised
/// caption, and the train/test split over them.
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub samples: Vec<Sample>,
    pub captions: Vec<String>,
    pub labels: Vec<Sentiment>,
    pub images: ImageSet,
    pub split: Split,
}

impl PreparedData {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Normalised captions of `rows`, in order.
    pub fn captions_of(&self, rows: &[usize]) -> Vec<&str> {
        rows.iter().map(|&i| self.captions[i].as_str()).collect()
    }

    /// Labels of `rows`, in order.
    pub fn labels_of(&self, rows: &[usize]) -> Vec<Sentiment> {
        rows.iter().map(|&i| self.labels[i]).collect()
    }
}

/// Load the table and images, normalise captions, and split.
///
/// Rows whose image is skipped (see `data.on_missing_image`) are dropped
/// from every parallel array before splitting.
pub fn prepare_dataset(config: &ExperimentConfig) -> Result<PreparedData> {
    let table = load_samples(&config.data)?;
    let loaded = load_images(&table.samples, &config.data, &config.image)?;

    let samples: Vec<Sample> = loaded
        .kept
        .iter()
        .map(|&i| table.samples[i].clone())
        .collect();
    let captions: Vec<String> = samples
        .iter()
        .map(|s| normalise_caption(&s.raw_caption))
        .collect();
    let labels = labels_of(&samples);

    let split = stratified_split(&labels, config.data.test_fraction, config.seed)?;
    info!(
        samples = samples.len(),
        train = split.train.len(),
        test = split.test.len(),
        seed = config.seed,
        "Prepared dataset"
    );

    Ok(PreparedData {
        samples,
        captions,
        labels,
        images: loaded.images,
        split,
    })
}

// ---------------------------------------------------------------------------
// Partitions & batches
// ---------------------------------------------------------------------------

/// A subset of the prepared data in model-ready form.
#[derive(Debug, Clone)]
pub struct Partition {
    /// Row indices into [`PreparedData`].
    pub rows: Vec<usize>,
    pub images: ImageSet,
    /// Row-major `len × sequence_length` token ids.
    pub tokens: Vec<u32>,
    /// Class codes.
    pub labels: Vec<u32>,
    pub sequence_length: usize,
}

/// One mini-batch of tensors.
pub struct Batch {
    /// `[B, 3, H, W]`, f32 in `[0, 1]`.
    pub images: Tensor,
    /// `[B, T]`, u32.
    pub tokens: Tensor,
    /// `[B]`, u32.
    pub labels: Tensor,
    /// Positions within the partition, in batch order.
    pub positions: Vec<usize>,
}

impl Partition {
    /// Gather `rows` of `data`, encoding captions with `vocabulary`.
    pub fn new(data: &PreparedData, rows: &[usize], vocabulary: &Vocabulary) -> Self {
        let images = data.images.gather(rows);
        let tokens = vocabulary.encode_batch(&data.captions_of(rows));
        let labels = rows.iter().map(|&i| data.labels[i].code()).collect();
        Self {
            rows: rows.to_vec(),
            images,
            tokens,
            labels,
            sequence_length: vocabulary.sequence_length(),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Build tensors for `positions`, augmenting images when an augmenter is given.
    pub fn batch(
        &self,
        positions: &[usize],
        augmenter: Option<&mut ImageAugmenter>,
        device: &Device,
    ) -> candle_core::Result<Batch> {
        let b = positions.len();
        let mut images = self.images.gather(positions);
        if let Some(augmenter) = augmenter {
            augmenter.augment_set(&mut images);
        }
        let (h, w) = (images.height, images.width);

        let t = self.sequence_length;
        let mut tokens = Vec::with_capacity(b * t);
        for &p in positions {
            tokens.extend_from_slice(&self.tokens[p * t..(p + 1) * t]);
        }
        let labels: Vec<u32> = positions.iter().map(|&p| self.labels[p]).collect();

        Ok(Batch {
            images: Tensor::from_vec(images.data, (b, 3, h, w), device)?,
            tokens: Tensor::from_vec(tokens, (b, t), device)?,
            labels: Tensor::from_vec(labels, b, device)?,
            positions: positions.to_vec(),
        })
    }
}

/// Mini-batch position iterator. Reshuffles positions each epoch.
pub struct BatchIterator {
    indices: Vec<usize>,
    batch_size: usize,
    pos: usize,
}

impl BatchIterator {
    /// Iterate `0..len` in order, `batch_size` at a time.
    pub fn new(len: usize, batch_size: usize) -> Self {
        Self {
            indices: (0..len).collect(),
            batch_size: batch_size.max(1),
            pos: 0,
        }
    }

    /// Reshuffle for a new epoch using a seeded RNG derived from base seed + epoch.
    pub fn reshuffle(&mut self, seed: u64, epoch: usize) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(epoch as u64));
        self.indices.sort_unstable();
        self.indices.shuffle(&mut rng);
        self.pos = 0;
    }

    /// Number of batches per pass.
    pub fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }

    /// Positions of the next mini-batch, or None if the epoch is exhausted.
    pub fn next_positions(&mut self) -> Option<Vec<usize>> {
        let n = self.indices.len();
        if self.pos >= n {
            return None;
        }
        let end = (self.pos + self.batch_size).min(n);
        let batch = self.indices[self.pos..end].to_vec();
        self.pos = end;
        Some(batch)
    }
}

/// Fail with a training error when `partition` is empty.
pub fn require_non_empty(partition: &Partition, name: &str) -> Result<()> {
    if partition.is_empty() {
        return Err(MemeSenseError::Training(format!(
            "{name} partition is empty; the dataset is too small for the configured fractions"
        )));
    }
    Ok(())
}
