//! Balanced class weights.

use candle_core::{Device, Tensor};
use memesense_core::{Sentiment, NUM_CLASSES};
use memesense_data::class_counts;
use serde::Serialize;

/// Per-class loss weights. Classes absent from the training labels have no
/// weight.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassWeights {
    weights: [Option<f64>; NUM_CLASSES],
}

impl ClassWeights {
    /// `w_c = n / (k × count_c)` over the `k` classes present in `labels`.
    pub fn balanced(labels: &[Sentiment]) -> Self {
        let counts = class_counts(labels.iter().copied());
        let n = labels.len() as f64;
        let k = counts.iter().filter(|&&c| c > 0).count() as f64;
        let mut weights = [None; NUM_CLASSES];
        for (slot, &count) in weights.iter_mut().zip(counts.iter()) {
            if count > 0 {
                *slot = Some(n / (k * count as f64));
            }
        }
        Self { weights }
    }

    /// Weight 1.0 for every class.
    pub fn uniform() -> Self {
        Self {
            weights: [Some(1.0); NUM_CLASSES],
        }
    }

    pub fn get(&self, class: Sentiment) -> Option<f64> {
        self.weights[class.code() as usize]
    }

    /// Dense weights indexed by class code; absent classes get 1.0.
    pub fn dense(&self) -> [f32; NUM_CLASSES] {
        let mut out = [1.0f32; NUM_CLASSES];
        for (o, w) in out.iter_mut().zip(self.weights.iter()) {
            if let Some(w) = w {
                *o = *w as f32;
            }
        }
        out
    }

    /// [`Self::dense`] as a `[5]` tensor.
    pub fn to_tensor(&self, device: &Device) -> candle_core::Result<Tensor> {
        Tensor::new(&self.dense(), device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(counts: [usize; NUM_CLASSES]) -> Vec<Sentiment> {
        Sentiment::ALL
            .iter()
            .zip(counts)
            .flat_map(|(&s, c)| std::iter::repeat(s).take(c))
            .collect()
    }

    #[test]
    fn test_weights_decrease_with_frequency() {
        let w = ClassWeights::balanced(&labels([5, 10, 40, 20, 25]));
        let by_count = [
            Sentiment::VeryNegative,
            Sentiment::Negative,
            Sentiment::Positive,
            Sentiment::VeryPositive,
            Sentiment::Neutral,
        ];
        for pair in by_count.windows(2) {
            assert!(w.get(pair[0]).unwrap() > w.get(pair[1]).unwrap());
        }
    }

    #[test]
    fn test_count_times_weight_is_constant() {
        let counts = [5, 10, 40, 20, 25];
        let w = ClassWeights::balanced(&labels(counts));
        // n / k = 100 / 5
        for class in Sentiment::ALL {
            let product = counts[class.code() as usize] as f64 * w.get(class).unwrap();
            assert!((product - 20.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_absent_classes_have_no_weight() {
        let w = ClassWeights::balanced(&labels([0, 3, 0, 1, 0]));
        assert_eq!(w.get(Sentiment::VeryNegative), None);
        // n=4, k=2
        assert!((w.get(Sentiment::Negative).unwrap() - 4.0 / 6.0).abs() < 1e-12);
        assert!((w.get(Sentiment::Positive).unwrap() - 2.0).abs() < 1e-12);
        let dense = w.dense();
        assert_eq!(dense[0], 1.0);
        assert_eq!(dense[4], 1.0);
    }

    #[test]
    fn test_balanced_classes_get_unit_weight() {
        let w = ClassWeights::balanced(&labels([3, 3, 3, 3, 3]));
        assert_eq!(w, ClassWeights::uniform());
    }

    #[test]
    fn test_tensor_matches_dense() {
        let w = ClassWeights::balanced(&labels([1, 2, 3, 4, 5]));
        let t = w.to_tensor(&Device::Cpu).unwrap();
        assert_eq!(t.to_vec1::<f32>().unwrap(), w.dense().to_vec());
    }
}
