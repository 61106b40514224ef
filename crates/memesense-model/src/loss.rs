//! Training objective.

use candle_core::{Tensor, D};

/// Class-weighted sparse categorical cross-entropy.
///
/// Each sample's negative log-likelihood is scaled by the weight of its true
/// class, and the result is averaged over the batch.
///
/// * `logits`: `[B, C]`
/// * `labels`: `[B]`, `u32` class codes
/// * `class_weights`: `[C]`
pub fn weighted_cross_entropy(
    logits: &Tensor,
    labels: &Tensor,
    class_weights: &Tensor,
) -> candle_core::Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let picked = log_probs
        .gather(&labels.unsqueeze(1)?.contiguous()?, 1)?
        .squeeze(1)?;
    let weights = class_weights.index_select(labels, 0)?;
    (picked * weights)?.mean(0)?.neg()
}

/// `l2 × Σ W²` over `kernels`.
pub fn l2_penalty(kernels: &[&Tensor], l2: f64) -> candle_core::Result<Tensor> {
    let mut total: Option<Tensor> = None;
    for kernel in kernels {
        let term = kernel.sqr()?.sum_all()?;
        total = Some(match total {
            Some(acc) => (acc + term)?,
            None => term,
        });
    }
    match total {
        Some(t) => t.affine(l2, 0.0),
        None => candle_core::bail!("l2 penalty needs at least one kernel"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    fn batch() -> (Tensor, Tensor) {
        let logits = Tensor::new(
            &[[2.0f32, 0.5, -1.0, 0.0, 0.3], [0.1, 0.2, 0.3, 0.4, 0.5]],
            &Device::Cpu,
        )
        .unwrap();
        let labels = Tensor::new(&[0u32, 4], &Device::Cpu).unwrap();
        (logits, labels)
    }

    #[test]
    fn test_unit_weights_match_plain_cross_entropy() {
        let (logits, labels) = batch();
        let ones = Tensor::ones(5, candle_core::DType::F32, &Device::Cpu).unwrap();
        let weighted = weighted_cross_entropy(&logits, &labels, &ones).unwrap();
        let plain = candle_nn::loss::cross_entropy(&logits, &labels).unwrap();
        assert!((scalar(&weighted) - scalar(&plain)).abs() < 1e-6);
    }

    #[test]
    fn test_weights_scale_each_sample() {
        let (logits, labels) = batch();
        let weights = Tensor::new(&[2.0f32, 1.0, 1.0, 1.0, 0.5], &Device::Cpu).unwrap();
        let got = scalar(&weighted_cross_entropy(&logits, &labels, &weights).unwrap());

        let nll = |row: &[f32], label: usize| -> f32 {
            let max = row.iter().copied().fold(f32::MIN, f32::max);
            let lse = row.iter().map(|v| (v - max).exp()).sum::<f32>().ln() + max;
            lse - row[label]
        };
        let expected = (2.0 * nll(&[2.0, 0.5, -1.0, 0.0, 0.3], 0)
            + 0.5 * nll(&[0.1, 0.2, 0.3, 0.4, 0.5], 4))
            / 2.0;
        assert!((got - expected).abs() < 1e-5, "{got} vs {expected}");
    }

    #[test]
    fn test_l2_penalty() {
        let a = Tensor::new(&[[1.0f32, 2.0], [3.0, 0.0]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[[-1.0f32]], &Device::Cpu).unwrap();
        let penalty = l2_penalty(&[&a, &b], 0.01).unwrap();
        assert!((scalar(&penalty) - 0.15).abs() < 1e-6);
        assert!(l2_penalty(&[], 0.01).is_err());
    }
}
