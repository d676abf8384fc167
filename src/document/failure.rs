//! Start-failure classification
//!
//! The engine reports start failures as free text. Failures caused by the
//! cache file (ownership changes, read-only storage) are recognised by a
//! handful of substrings so the caller can retry without caching.

/// Substrings that mark a failure as cache related (matched lowercase).
const CACHE_FAILURE_TOKENS: [&str; 4] = ["cache-file", "chown", "read-only", "cache.db"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retrying with caching removed may succeed
    CacheRelated,
    Other,
}

/// True if the error text contains any cache-failure token, ignoring case.
pub fn is_cache_failure_signature(text: &str) -> bool {
    let lowered = text.to_lowercase();
    CACHE_FAILURE_TOKENS
        .iter()
        .any(|token| lowered.contains(token))
}

pub fn classify(text: &str) -> FailureKind {
    if is_cache_failure_signature(text) {
        FailureKind::CacheRelated
    } else {
        FailureKind::Other
    }
}
