//! Multi-class metrics for the five sentiment classes.
//!
//! Computes confusion-matrix-derived metrics from predicted and ground-truth
//! class codes.

use memesense_core::{Sentiment, NUM_CLASSES};
use serde::{Deserialize, Serialize};

/// 5×5 confusion matrix. `counts[actual][predicted]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub counts: [[usize; NUM_CLASSES]; NUM_CLASSES],
}

impl ConfusionMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a prediction. Codes outside `0..5` are ignored.
    pub fn record(&mut self, actual: u32, predicted: u32) {
        let (a, p) = (actual as usize, predicted as usize);
        if a < NUM_CLASSES && p < NUM_CLASSES {
            self.counts[a][p] += 1;
        }
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    pub fn correct(&self) -> usize {
        (0..NUM_CLASSES).map(|c| self.counts[c][c]).sum()
    }

    /// Samples whose true class is `class`.
    pub fn support(&self, class: usize) -> usize {
        self.counts[class].iter().sum()
    }

    /// Samples predicted as `class`.
    pub fn predicted(&self, class: usize) -> usize {
        self.counts.iter().map(|row| row[class]).sum()
    }
}

/// Precision, recall and F1 for one class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub class: Sentiment,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// Accuracy, per-class metrics and the confusion matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub accuracy: f64,
    /// Unweighted mean of the per-class F1 scores over classes with support.
    pub macro_f1: f64,
    pub per_class: Vec<ClassMetrics>,
    pub confusion_matrix: ConfusionMatrix,
}

fn ratio(num: usize, den: usize) -> f64 {
    if den > 0 {
        num as f64 / den as f64
    } else {
        0.0
    }
}

/// Compute metrics from predicted and ground-truth class codes.
pub fn compute_classification_metrics(predictions: &[u32], labels: &[u32]) -> ClassificationReport {
    assert_eq!(
        predictions.len(),
        labels.len(),
        "predictions and labels must have same length"
    );

    let mut cm = ConfusionMatrix::new();
    for (&pred, &label) in predictions.iter().zip(labels.iter()) {
        cm.record(label, pred);
    }

    let per_class: Vec<ClassMetrics> = Sentiment::ALL
        .iter()
        .map(|&class| {
            let c = class.code() as usize;
            let tp = cm.counts[c][c];
            let precision = ratio(tp, cm.predicted(c));
            let recall = ratio(tp, cm.support(c));
            let f1 = if precision + recall > 0.0 {
                2.0 * precision * recall / (precision + recall)
            } else {
                0.0
            };
            ClassMetrics {
                class,
                precision,
                recall,
                f1,
                support: cm.support(c),
            }
        })
        .collect();

    let supported: Vec<f64> = per_class
        .iter()
        .filter(|m| m.support > 0)
        .map(|m| m.f1)
        .collect();
    let macro_f1 = if supported.is_empty() {
        0.0
    } else {
        supported.iter().sum::<f64>() / supported.len() as f64
    };

    ClassificationReport {
        accuracy: ratio(cm.correct(), cm.total()),
        macro_f1,
        per_class,
        confusion_matrix: cm,
    }
}

impl std::fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "accuracy={:.4} macro_f1={:.4} (n={})",
            self.accuracy,
            self.macro_f1,
            self.confusion_matrix.total()
        )?;
        writeln!(
            f,
            "{:<14} {:>9} {:>9} {:>9} {:>8}",
            "class", "precision", "recall", "f1", "support"
        )?;
        for m in &self.per_class {
            writeln!(
                f,
                "{:<14} {:>9.4} {:>9.4} {:>9.4} {:>8}",
                m.class.as_str(),
                m.precision,
                m.recall,
                m.f1,
                m.support
            )?;
        }
        writeln!(f, "confusion matrix (rows = actual, columns = predicted):")?;
        for (class, row) in Sentiment::ALL.iter().zip(self.confusion_matrix.counts.iter()) {
            let cells: Vec<String> = row.iter().map(|n| format!("{n:>5}")).collect();
            writeln!(f, "{:<14} {}", class.as_str(), cells.join(""))?;
        }
        Ok(())
    }
}
