//! Caption vectorization.
//!
//! A [`Vocabulary`] is fitted on training captions only and maps any caption
//! to a fixed-length sequence of token ids. Id 0 is padding and id 1 stands in
//! for every word the vocabulary does not know.

use std::collections::HashMap;
use std::path::Path;

use memesense_core::{MemeSenseError, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Padding token, id 0.
pub const PAD_TOKEN: &str = "";
/// Out-of-vocabulary token, id 1.
pub const OOV_TOKEN: &str = "[UNK]";
/// Id of [`PAD_TOKEN`].
pub const PAD_ID: u32 = 0;
/// Id of [`OOV_TOKEN`].
pub const OOV_ID: u32 = 1;

/// Fitted token table.
#[derive(Debug, Clone, PartialEq)]
pub struct Vocabulary {
    tokens: Vec<String>,
    index: HashMap<String, u32>,
    sequence_length: usize,
}

#[derive(Serialize, Deserialize)]
struct VocabularyFile {
    tokens: Vec<String>,
    sequence_length: usize,
}

impl Vocabulary {
    /// Fit on whitespace-separated `captions`.
    ///
    /// Tokens are ranked by descending frequency, ties broken by first
    /// occurrence, and the table is capped at `max_tokens` entries including
    /// the two reserved ones.
    pub fn fit<S: AsRef<str>>(captions: &[S], max_tokens: usize, sequence_length: usize) -> Self {
        // token -> (count, first occurrence)
        let mut stats: HashMap<&str, (usize, usize)> = HashMap::new();
        let mut seen = 0usize;
        for caption in captions {
            for token in caption.as_ref().split_whitespace() {
                let entry = stats.entry(token).or_insert((0, seen));
                entry.0 += 1;
                seen += 1;
            }
        }

        let mut ranked: Vec<(&str, usize, usize)> = stats
            .into_iter()
            .filter(|(token, _)| *token != OOV_TOKEN)
            .map(|(token, (count, first))| (token, count, first))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

        let capacity = max_tokens.saturating_sub(2);
        let distinct = ranked.len();
        let mut tokens = Vec::with_capacity(capacity.min(distinct) + 2);
        tokens.push(PAD_TOKEN.to_string());
        tokens.push(OOV_TOKEN.to_string());
        tokens.extend(ranked.into_iter().take(capacity).map(|(t, _, _)| t.to_string()));

        info!(
            captions = captions.len(),
            distinct_tokens = distinct,
            vocabulary_size = tokens.len(),
            "Fitted vocabulary"
        );
        Self::from_tokens(tokens, sequence_length)
    }

    fn from_tokens(tokens: Vec<String>, sequence_length: usize) -> Self {
        let index = tokens
            .iter()
            .enumerate()
            .skip(2)
            .map(|(i, t)| (t.clone(), i as u32))
            .collect();
        Self {
            tokens,
            index,
            sequence_length,
        }
    }

    /// Number of entries, reserved tokens included.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Always `false`; the reserved tokens are present in every vocabulary.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Length of every encoded sequence.
    pub fn sequence_length(&self) -> usize {
        self.sequence_length
    }

    /// Token for `id`, if in range.
    pub fn token(&self, id: u32) -> Option<&str> {
        self.tokens.get(id as usize).map(String::as_str)
    }

    /// Id for `token`; unknown tokens map to [`OOV_ID`].
    pub fn id(&self, token: &str) -> u32 {
        self.index.get(token).copied().unwrap_or(OOV_ID)
    }

    /// Encode one caption into exactly [`Self::sequence_length`] ids,
    /// truncating or padding with [`PAD_ID`].
    pub fn encode(&self, caption: &str) -> Vec<u32> {
        let mut ids: Vec<u32> = caption
            .split_whitespace()
            .take(self.sequence_length)
            .map(|t| self.id(t))
            .collect();
        ids.resize(self.sequence_length, PAD_ID);
        ids
    }

    /// Encode captions into one row-major `len × sequence_length` buffer.
    pub fn encode_batch<S: AsRef<str>>(&self, captions: &[S]) -> Vec<u32> {
        let mut out = Vec::with_capacity(captions.len() * self.sequence_length);
        for caption in captions {
            out.extend(self.encode(caption.as_ref()));
        }
        out
    }

    /// Write the vocabulary as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = VocabularyFile {
            tokens: self.tokens.clone(),
            sequence_length: self.sequence_length,
        };
        std::fs::write(path, serde_json::to_vec(&file)?)?;
        info!(path = %path.display(), size = self.len(), "Saved vocabulary");
        Ok(())
    }

    /// Read a vocabulary written by [`Self::save`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable, not valid JSON, or does not
    /// start with the reserved tokens.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            MemeSenseError::Dataset(format!(
                "Failed to read vocabulary {}: {}",
                path.display(),
                e
            ))
        })?;
        let file: VocabularyFile = serde_json::from_slice(&bytes)?;
        if file.tokens.len() < 2 || file.tokens[0] != PAD_TOKEN || file.tokens[1] != OOV_TOKEN {
            return Err(MemeSenseError::Dataset(format!(
                "Vocabulary {} does not start with the padding and OOV tokens",
                path.display()
            )));
        }
        if file.sequence_length == 0 {
            return Err(MemeSenseError::Dataset(format!(
                "Vocabulary {} has a zero sequence length",
                path.display()
            )));
        }
        Ok(Self::from_tokens(file.tokens, file.sequence_length))
    }
}
