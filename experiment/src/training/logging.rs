//! Per-run metric logs.
//!
//! Each run writes to `<log_dir>/fit/<YYYYmmdd-HHMMSS>/`:
//!
//! - `train/` and `validation/`: TensorBoard event files. Both carry
//!   `epoch_loss` and `epoch_accuracy` so the two curves overlay in the
//!   dashboard; `train/` also carries `epoch_learning_rate` and, when enabled,
//!   one weight histogram per variable.
//! - `scalars.jsonl`: one [`EpochMetrics`] object per line.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use candle_nn::VarMap;
use memesense_core::config::HistogramLogging;
use memesense_core::{MemeSenseError, Result};
use tensorboard_rs::summary_writer::SummaryWriter;
use tracing::{debug, warn};

use super::trainer::EpochMetrics;

const SCALARS_FILE: &str = "scalars.jsonl";
const TRAIN_DIR: &str = "train";
const VALIDATION_DIR: &str = "validation";

/// Bucketed distribution of one variable's values, in the shape TensorBoard
/// histograms expect.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    pub min: f64,
    pub max: f64,
    pub num: f64,
    pub sum: f64,
    pub sum_squares: f64,
    /// Right edge of each bucket; the last edge is `max`.
    pub bucket_limits: Vec<f64>,
    pub bucket_counts: Vec<f64>,
}

/// Bucket `values` into `bins` equal-width buckets.
///
/// Returns `None` for an empty slice or when any value is not finite.
pub fn histogram(values: &[f32], bins: usize) -> Option<Histogram> {
    if values.is_empty() || bins == 0 || values.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let min = values.iter().copied().fold(f32::INFINITY, f32::min) as f64;
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    let width = (max - min) / bins as f64;

    let mut bucket_counts = vec![0.0; bins];
    let (mut sum, mut sum_squares) = (0.0, 0.0);
    for &v in values {
        let v = v as f64;
        let bucket = if width > 0.0 {
            (((v - min) / width) as usize).min(bins - 1)
        } else {
            0
        };
        bucket_counts[bucket] += 1.0;
        sum += v;
        sum_squares += v * v;
    }
    let bucket_limits = (1..=bins)
        .map(|k| if k == bins { max } else { min + width * k as f64 })
        .collect();

    Some(Histogram {
        min,
        max,
        num: values.len() as f64,
        sum,
        sum_squares,
        bucket_limits,
        bucket_counts,
    })
}

/// TensorBoard and JSON-lines writer for one training run.
pub struct MetricsLogger {
    run_dir: PathBuf,
    train: SummaryWriter,
    validation: SummaryWriter,
    scalars: BufWriter<File>,
    histograms: HistogramLogging,
    bins: usize,
}

impl MetricsLogger {
    /// Create a fresh timestamped run directory under `<log_dir>/fit/`.
    pub fn create(log_dir: &Path, histograms: HistogramLogging, bins: usize) -> Result<Self> {
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();
        let run_dir = log_dir.join("fit").join(stamp);
        Self::create_in(run_dir, histograms, bins)
    }

    fn create_in(run_dir: PathBuf, histograms: HistogramLogging, bins: usize) -> Result<Self> {
        // SummaryWriter::new panics on I/O errors
        let train_dir = run_dir.join(TRAIN_DIR);
        let validation_dir = run_dir.join(VALIDATION_DIR);
        std::fs::create_dir_all(&train_dir)?;
        std::fs::create_dir_all(&validation_dir)?;

        let scalars = OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join(SCALARS_FILE))?;
        debug!(run_dir = %run_dir.display(), "Created metric log directory");
        Ok(Self {
            train: SummaryWriter::new(&train_dir),
            validation: SummaryWriter::new(&validation_dir),
            scalars: BufWriter::new(scalars),
            run_dir,
            histograms,
            bins,
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Record one epoch's scalars.
    pub fn log_epoch(&mut self, metrics: &EpochMetrics) -> Result<()> {
        let step = metrics.epoch;
        self.train.add_scalar("epoch_loss", metrics.train_loss as f32, step);
        self.train.add_scalar("epoch_accuracy", metrics.train_accuracy as f32, step);
        self.train.add_scalar("epoch_learning_rate", metrics.learning_rate as f32, step);
        self.validation.add_scalar("epoch_loss", metrics.val_loss as f32, step);
        self.validation.add_scalar("epoch_accuracy", metrics.val_accuracy as f32, step);
        self.train.flush();
        self.validation.flush();

        serde_json::to_writer(&mut self.scalars, metrics)?;
        self.scalars.write_all(b"\n")?;
        self.scalars.flush()?;
        Ok(())
    }

    /// Record a weight histogram for every variable. Failures are logged and
    /// never propagated.
    pub fn log_histograms(&mut self, epoch: usize, varmap: &VarMap) {
        if self.histograms == HistogramLogging::Disabled {
            return;
        }
        match self.write_histograms(epoch, varmap) {
            Ok(written) => debug!(epoch, written, "Wrote weight histograms"),
            Err(e) => warn!(epoch, error = %e, "Failed to write weight histograms"),
        }
    }

    fn write_histograms(&mut self, epoch: usize, varmap: &VarMap) -> Result<usize> {
        let mut named: Vec<(String, Vec<f32>)> = {
            let vars = varmap
                .data()
                .lock()
                .map_err(|_| MemeSenseError::Training("variable map lock poisoned".to_string()))?;
            let mut named = Vec::with_capacity(vars.len());
            for (name, var) in vars.iter() {
                let values = var
                    .as_tensor()
                    .flatten_all()
                    .and_then(|t| t.to_dtype(candle_core::DType::F32))
                    .and_then(|t| t.to_vec1::<f32>())
                    .map_err(|e| {
                        MemeSenseError::Training(format!("Failed to read '{name}': {e}"))
                    })?;
                named.push((name.clone(), values));
            }
            named
        };
        named.sort_by(|a, b| a.0.cmp(&b.0));

        let mut written = 0;
        for (name, values) in named {
            let Some(h) = histogram(&values, self.bins) else {
                warn!(
                    epoch,
                    variable = %name,
                    "Skipping histogram of empty or non-finite variable"
                );
                continue;
            };
            self.train.add_histogram_raw(
                &name,
                h.min,
                h.max,
                h.num,
                h.sum,
                h.sum_squares,
                &h.bucket_limits,
                &h.bucket_counts,
                epoch,
            );
            written += 1;
        }
        self.train.flush();
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::Init;

    fn epoch(epoch: usize) -> EpochMetrics {
        EpochMetrics {
            epoch,
            train_loss: 1.5,
            train_accuracy: 0.25,
            val_loss: 1.4,
            val_accuracy: 0.3,
            learning_rate: 5e-4,
        }
    }

    fn event_files(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("events.out.tfevents"))
            })
            .collect()
    }

    fn event_bytes(dir: &Path) -> u64 {
        event_files(dir)
            .iter()
            .map(|p| std::fs::metadata(p).unwrap().len())
            .sum()
    }

    fn sample_varmap() -> VarMap {
        let varmap = VarMap::new();
        let randn = Init::Randn {
            mean: 0.0,
            stdev: 1.0,
        };
        varmap
            .get((4, 3), "a.weight", randn, DType::F32, &Device::Cpu)
            .unwrap();
        varmap
            .get(3, "a.bias", Init::Const(0.5), DType::F32, &Device::Cpu)
            .unwrap();
        varmap
    }

    #[test]
    fn test_histogram_buckets() {
        let h = histogram(&[0.0, 0.1, 0.5, 0.9, 1.0], 2).unwrap();
        assert_eq!(h.min, 0.0);
        assert_eq!(h.max, 1.0);
        assert_eq!(h.num, 5.0);
        assert_eq!(h.bucket_counts, vec![2.0, 3.0]);
        assert_eq!(h.bucket_limits, vec![0.5, 1.0]);
        assert!((h.sum - 2.5).abs() < 1e-6);
        assert!((h.sum_squares - 2.07).abs() < 1e-6);
    }

    #[test]
    fn test_histogram_constant_and_invalid() {
        let h = histogram(&[2.0, 2.0], 4).unwrap();
        assert_eq!(h.bucket_counts, vec![2.0, 0.0, 0.0, 0.0]);
        assert_eq!(h.bucket_limits.len(), 4);
        assert!(histogram(&[], 4).is_none());
        assert!(histogram(&[1.0, f32::NAN], 4).is_none());
    }

    #[test]
    fn test_run_directory_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger =
            MetricsLogger::create(dir.path(), HistogramLogging::Enabled, 10).unwrap();
        logger.log_epoch(&epoch(0)).unwrap();

        let run = logger.run_dir().to_path_buf();
        assert_eq!(run.parent().unwrap(), dir.path().join("fit"));
        let stamp = run.file_name().unwrap().to_str().unwrap();
        assert_eq!(stamp.len(), "20240101-120000".len());
        assert!(run.join(SCALARS_FILE).is_file());
        assert_eq!(event_files(&run.join(TRAIN_DIR)).len(), 1);
        assert_eq!(event_files(&run.join(VALIDATION_DIR)).len(), 1);
    }

    #[test]
    fn test_epochs_reach_event_files_and_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger =
            MetricsLogger::create_in(dir.path().join("run"), HistogramLogging::Disabled, 10)
                .unwrap();
        logger.log_epoch(&epoch(0)).unwrap();
        let validation = logger.run_dir().join(VALIDATION_DIR);
        let after_first = event_bytes(&validation);
        logger.log_epoch(&epoch(1)).unwrap();
        assert!(event_bytes(&validation) > after_first);

        let text = std::fs::read_to_string(logger.run_dir().join(SCALARS_FILE)).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["epoch"], 1);
        assert!(lines[0]["learning_rate"].is_number());
    }

    #[test]
    fn test_histograms_follow_the_flag() {
        let dir = tempfile::tempdir().unwrap();
        let varmap = sample_varmap();

        let mut enabled =
            MetricsLogger::create_in(dir.path().join("on"), HistogramLogging::Enabled, 5).unwrap();
        enabled.log_epoch(&epoch(0)).unwrap();
        let train = enabled.run_dir().join(TRAIN_DIR);
        let before = event_bytes(&train);
        assert_eq!(enabled.write_histograms(0, &varmap).unwrap(), 2);
        assert!(event_bytes(&train) > before);

        let mut disabled =
            MetricsLogger::create_in(dir.path().join("off"), HistogramLogging::Disabled, 5)
                .unwrap();
        disabled.log_epoch(&epoch(0)).unwrap();
        let train = disabled.run_dir().join(TRAIN_DIR);
        let before = event_bytes(&train);
        disabled.log_histograms(0, &varmap);
        assert_eq!(event_bytes(&train), before);
    }
}
