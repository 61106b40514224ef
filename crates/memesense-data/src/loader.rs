//! Label table loading.
//!
//! Reads the CSV table that pairs each image with its caption and sentiment
//! label. Unnamed index columns (what pandas writes for a saved index) are
//! dropped, labels are mapped to [`Sentiment`], and incomplete rows are
//! removed according to [`MissingValuePolicy`].

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use memesense_core::config::{DataConfig, MissingValuePolicy};
use memesense_core::{MemeSenseError, Result, Sample, Sentiment};
use regex::Regex;
use tracing::{debug, info};

use crate::class_counts;

static UNNAMED_COLUMN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^unnamed").expect("unnamed column regex"));

/// Cell values read as missing, mirroring pandas' default NA markers.
const NA_MARKERS: &[&str] = &[
    "", "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

/// Result of loading the label table.
#[derive(Debug, Clone)]
pub struct LabelTable {
    /// Complete rows, in file order.
    pub samples: Vec<Sample>,
    /// Header names kept after dropping unnamed columns.
    pub columns: Vec<String>,
    /// Rows dropped because a cell was missing.
    pub dropped_missing: usize,
    /// Rows dropped because the label did not name a sentiment.
    pub dropped_unknown_label: usize,
}

impl LabelTable {
    /// Total rows read, kept or not.
    pub fn rows_read(&self) -> usize {
        self.samples.len() + self.dropped_missing + self.dropped_unknown_label
    }
}

/// Load the label table named by `config.labels_path`.
///
/// # Errors
///
/// Returns [`MemeSenseError::Dataset`] if the file is missing or unreadable,
/// a required column is absent, or a record is malformed.
pub fn load_samples(config: &DataConfig) -> Result<LabelTable> {
    let path = &config.labels_path;
    let file = std::fs::File::open(path).map_err(|e| {
        MemeSenseError::Dataset(format!(
            "Failed to open label table {}: {}",
            path.display(),
            e
        ))
    })?;
    let table = load_samples_from_reader(file, config)?;

    info!(
        path = %path.display(),
        rows = table.rows_read(),
        kept = table.samples.len(),
        dropped_missing = table.dropped_missing,
        dropped_unknown_label = table.dropped_unknown_label,
        "Loaded label table"
    );
    let counts = class_counts(table.samples.iter().map(|s| s.sentiment));
    for class in Sentiment::ALL {
        debug!(class = %class, count = counts[class.code() as usize], "Class count");
    }

    Ok(table)
}

/// Load a label table from any reader. See [`load_samples`].
pub fn load_samples_from_reader<R: Read>(reader: R, config: &DataConfig) -> Result<LabelTable> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let headers = rdr
        .headers()
        .map_err(|e| MemeSenseError::Dataset(format!("Failed to read table header: {e}")))?
        .clone();

    // (original index, name) of every retained column
    let kept: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| (i, h.trim().trim_start_matches('\u{feff}').to_string()))
        .filter(|(_, name)| !is_unnamed_column(name))
        .collect();

    let find = |wanted: &str| -> Result<usize> {
        kept.iter()
            .find(|(_, name)| name == wanted)
            .map(|(i, _)| *i)
            .ok_or_else(|| {
                MemeSenseError::Dataset(format!("Label table has no '{wanted}' column"))
            })
    };
    let image_idx = find(&config.image_column)?;
    let text_idx = find(&config.text_column)?;
    let label_idx = find(&config.label_column)?;

    let mut samples = Vec::new();
    let mut dropped_missing = 0usize;
    let mut dropped_unknown_label = 0usize;

    for (row, record) in rdr.records().enumerate() {
        let record = record.map_err(|e| {
            MemeSenseError::Dataset(format!("Malformed record at data row {}: {}", row + 1, e))
        })?;

        let cell = |i: usize| record.get(i).filter(|v| !is_missing(v));

        let incomplete = match config.missing_values {
            MissingValuePolicy::AnyColumn => kept.iter().any(|(i, _)| cell(*i).is_none()),
            MissingValuePolicy::RequiredColumns => [image_idx, text_idx, label_idx]
                .iter()
                .any(|i| cell(*i).is_none()),
        };
        if incomplete {
            dropped_missing += 1;
            continue;
        }

        let (Some(image), Some(text), Some(label)) =
            (cell(image_idx), cell(text_idx), cell(label_idx))
        else {
            dropped_missing += 1;
            continue;
        };

        let Ok(sentiment) = label.parse::<Sentiment>() else {
            debug!(row = row + 1, label, "Dropping row with unknown sentiment label");
            dropped_unknown_label += 1;
            continue;
        };

        samples.push(Sample {
            image_path: PathBuf::from(image.trim()),
            raw_caption: text.to_string(),
            sentiment,
        });
    }

    Ok(LabelTable {
        samples,
        columns: kept.into_iter().map(|(_, name)| name).collect(),
        dropped_missing,
        dropped_unknown_label,
    })
}

/// Whether a header names a pandas-style unnamed index column.
pub fn is_unnamed_column(name: &str) -> bool {
    name.is_empty() || UNNAMED_COLUMN_RE.is_match(name)
}

fn is_missing(value: &str) -> bool {
    NA_MARKERS.contains(&value.trim())
}

/// Resolve a sample's image path against the image directory.
pub fn resolve_image_path(images_dir: &Path, sample: &Sample) -> PathBuf {
    images_dir.join(&sample.image_path)
}
