//! Caption normalisation.
//!
//! Applied to every caption before vectorization:
//!
//! 1. Lowercase
//! 2. Remove digit runs
//! 3. Remove the literal substring `.com`
//! 4. Remove punctuation: the ASCII set plus Unicode punctuation such as
//!    curly quotes and `…`
//! 5. Collapse whitespace runs and trim
//!
//! The pipeline is idempotent: its output contains no uppercase letters, digits,
//! punctuation, or `.com`, so a second pass changes nothing.

use std::sync::LazyLock;

use regex::Regex;

static DIGIT_RUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("digit run regex"));

static PUNCTUATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[[:punct:]\p{P}]+").expect("punctuation regex"));

/// Normalise a single caption.
///
/// # Examples
///
/// ```
/// use memesense_data::normalise::normalise_caption;
///
/// assert_eq!(
///     normalise_caption("Check THIS out!! www.example.com 123"),
///     "check this out wwwexample"
/// );
/// ```
pub fn normalise_caption(input: &str) -> String {
    let lowered = input.to_lowercase();
    let without_digits = DIGIT_RUN_RE.replace_all(&lowered, "");
    let without_domains = without_digits.replace(".com", "");
    let without_punctuation = PUNCTUATION_RE.replace_all(&without_domains, "");
    collapse_whitespace(&without_punctuation)
}

/// Normalise a batch of captions, preserving order.
pub fn normalise_captions<S: AsRef<str>>(captions: &[S]) -> Vec<String> {
    captions
        .iter()
        .map(|c| normalise_caption(c.as_ref()))
        .collect()
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}
