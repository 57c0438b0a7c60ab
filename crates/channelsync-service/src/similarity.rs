//! Fuzzy matching of search keys.

/// The normalized edit distance similarity from which two longer keys count as similar.
pub const SIMILARITY_THRESHOLD: f64 = 0.85;

/// Keys up to this many characters are compared by raw edit distance instead.
const SHORT_KEY_LEN: usize = 4;

/// `1 - levenshtein(a, b) / max(len(a), len(b))`, counted in characters.
///
/// Two empty strings are identical and score `1.0`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - strsim::levenshtein(a, b) as f64 / max_len as f64
}

/// Whether two keys are close enough to share one cached result.
///
/// Short keys allow a single edit, so that `cat` and `cats` match. Longer keys need a
/// [`similarity`] of at least [`SIMILARITY_THRESHOLD`].
pub fn is_similar(a: &str, b: &str) -> bool {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len <= SHORT_KEY_LEN {
        strsim::levenshtein(a, b) <= 1
    } else {
        similarity(a, b) >= SIMILARITY_THRESHOLD
    }
}

/// Finds the candidate most similar to `key`, if any is similar at all.
///
/// Ties are broken towards the candidate that comes first.
pub fn most_similar<'a, I>(key: &str, candidates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<(&str, f64)> = None;
    for candidate in candidates {
        if !is_similar(key, candidate) {
            continue;
        }
        let score = similarity(key, candidate);
        if best.is_none_or(|(_, best_score)| score > best_score) {
            best = Some((candidate, score));
        }
    }
    best.map(|(candidate, _)| candidate)
}
