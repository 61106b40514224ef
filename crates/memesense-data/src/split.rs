//! Stratified train/test splitting.
//!
//! Splits operate on row indices so that images, captions and labels are
//! partitioned jointly by the caller.

use memesense_core::{Sentiment, SplitError, NUM_CLASSES};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::class_counts;

/// Disjoint train and test row indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    /// Training rows, shuffled.
    pub train: Vec<usize>,
    /// Test rows, shuffled.
    pub test: Vec<usize>,
}

/// Split rows `0..labels.len()` so both partitions keep the class proportions.
///
/// The test partition holds `ceil(test_fraction × n)` rows. Per-class test
/// counts are allocated by largest remainder, so every class's share differs
/// from its exact proportional share by less than one row. The same labels,
/// fraction and seed always give the same split.
///
/// # Errors
///
/// - [`SplitError::InvalidFraction`] if `test_fraction` is not in `(0, 1)`
/// - [`SplitError::ClassTooSmall`] if a present class has fewer than 2 rows
/// - [`SplitError::PartitionTooSmall`] if either partition would be smaller
///   than the number of classes present
pub fn stratified_split(
    labels: &[Sentiment],
    test_fraction: f64,
    seed: u64,
) -> Result<Split, SplitError> {
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(SplitError::InvalidFraction(test_fraction));
    }

    let counts = class_counts(labels.iter().copied());
    for class in Sentiment::ALL {
        let count = counts[class.code() as usize];
        if count == 1 {
            return Err(SplitError::ClassTooSmall { class, count });
        }
    }

    let n = labels.len();
    let classes = counts.iter().filter(|&&c| c > 0).count();
    let n_test = (test_fraction * n as f64).ceil() as usize;
    let n_train = n - n_test;
    if n_test < classes {
        return Err(SplitError::PartitionTooSmall {
            partition: "test",
            size: n_test,
            classes,
        });
    }
    if n_train < classes {
        return Err(SplitError::PartitionTooSmall {
            partition: "train",
            size: n_train,
            classes,
        });
    }

    let test_counts = allocate(&counts, n_test);
    debug!(?counts, ?test_counts, n_test, n_train, "Stratified allocation");

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut train = Vec::with_capacity(n_train);
    let mut test = Vec::with_capacity(n_test);
    for class in Sentiment::ALL {
        let mut members: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|(_, &l)| l == class)
            .map(|(i, _)| i)
            .collect();
        members.shuffle(&mut rng);
        let take = test_counts[class.code() as usize];
        test.extend_from_slice(&members[..take]);
        train.extend_from_slice(&members[take..]);
    }
    train.shuffle(&mut rng);
    test.shuffle(&mut rng);

    Ok(Split { train, test })
}

/// Largest-remainder allocation of `total` rows across classes.
///
/// Exact arithmetic on `count × total / n`; remainder ties go to the larger
/// class, then to the lower code.
fn allocate(counts: &[usize; NUM_CLASSES], total: usize) -> [usize; NUM_CLASSES] {
    let n: usize = counts.iter().sum();
    let mut out = [0usize; NUM_CLASSES];
    if n == 0 {
        return out;
    }
    let mut remainders = Vec::with_capacity(NUM_CLASSES);
    for (code, &count) in counts.iter().enumerate() {
        out[code] = count * total / n;
        remainders.push((count * total % n, count, code));
    }
    let assigned: usize = out.iter().sum();
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)).then(a.2.cmp(&b.2)));
    for &(_, count, code) in remainders.iter().take(total - assigned) {
        if count > out[code] {
            out[code] += 1;
        }
    }
    out
}

/// Split `train` into a fitting part and a validation tail.
///
/// The first `floor(len × (1 - fraction))` rows are kept for fitting and the
/// rest become validation rows, so validation gets the rounded-up share.
/// Order is preserved in both parts.
pub fn take_validation_tail(train: &[usize], fraction: f64) -> (Vec<usize>, Vec<usize>) {
    let cut = ((train.len() as f64 * (1.0 - fraction)).floor() as usize).min(train.len());
    (train[..cut].to_vec(), train[cut..].to_vec())
}
