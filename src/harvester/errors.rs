// Error taxonomy for the harvesting pipeline

use std::fmt;

use thiserror::Error;

/// Classified outcome of a failed network operation.
///
/// Only `Timeout`, `RateLimited` and `ServiceUnavailable` accumulate toward
/// circuit-breaker trips. `Private`, `Unavailable`, `GeoBlocked` and
/// `Blocked` are terminal for the item: retrying cannot change the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network timeout while talking to the target service
    Timeout,

    /// HTTP 429 / explicit rate limiting
    RateLimited,

    /// HTTP 503 / service temporarily unavailable
    ServiceUnavailable,

    /// Private or members-only video
    Private,

    /// Video removed or otherwise not available
    Unavailable,

    /// Region-locked content
    GeoBlocked,

    /// Captions disabled or request blocked outright
    Blocked,

    /// Anything we could not classify
    Other,
}

impl ErrorKind {
    /// Derive a kind from raw error text.
    ///
    /// Rate-limit patterns are checked first: a message mentioning both
    /// "429" and "unavailable" is a throttle, not a dead video.
    pub fn classify(text: &str) -> Self {
        let s = text.to_lowercase();

        // Transient-retryable (breaker-trippable)
        if s.contains("429") || s.contains("too many requests") {
            return Self::RateLimited;
        }
        if s.contains("503") || s.contains("service unavailable") {
            return Self::ServiceUnavailable;
        }
        if s.contains("timeout") || s.contains("timed out") {
            return Self::Timeout;
        }

        // Terminal for this item
        if s.contains("private") || s.contains("members-only") {
            return Self::Private;
        }
        if s.contains("unavailable") || s.contains("not available") {
            return Self::Unavailable;
        }
        if s.contains("region") || s.contains("geo") || s.contains("country") {
            return Self::GeoBlocked;
        }
        if s.contains("disabled") || s.contains("blocked") {
            return Self::Blocked;
        }

        Self::Other
    }

    /// Whether this kind counts toward circuit-breaker failure accumulation.
    pub fn is_trippable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimited | Self::ServiceUnavailable
        )
    }

    /// Whether retrying this item is pointless.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Private | Self::Unavailable | Self::GeoBlocked | Self::Blocked
        )
    }

    /// Status string used in run records and list files.
    pub fn as_status(&self) -> &'static str {
        match self {
            Self::Timeout => "error_timeout",
            Self::RateLimited => "error_429",
            Self::ServiceUnavailable => "error_503",
            Self::Private => "error_private",
            Self::Unavailable => "error_unavailable",
            Self::GeoBlocked => "error_geo",
            Self::Blocked => "error_blocked",
            Self::Other => "error_other",
        }
    }

    /// Backoff multiplier for this kind: throttling gets the longest waits.
    pub fn backoff_factor(&self) -> f64 {
        match self {
            Self::RateLimited | Self::ServiceUnavailable => 3.5,
            Self::Timeout => 2.5,
            _ => 2.0,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "network timeout"),
            Self::RateLimited => write!(f, "rate limited (429)"),
            Self::ServiceUnavailable => write!(f, "service unavailable (503)"),
            Self::Private => write!(f, "private video"),
            Self::Unavailable => write!(f, "video unavailable"),
            Self::GeoBlocked => write!(f, "geo-blocked"),
            Self::Blocked => write!(f, "blocked"),
            Self::Other => write!(f, "unclassified error"),
        }
    }
}

/// Error returned by capability providers: the raw text plus its
/// classification, performed once at the I/O boundary.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub text: String,
}

impl ProviderError {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            kind: ErrorKind::classify(&text),
            text,
        }
    }

    /// Raw error text truncated for records.
    pub fn truncated(&self, max: usize) -> &str {
        let end = self
            .text
            .char_indices()
            .nth(max)
            .map(|(i, _)| i)
            .unwrap_or(self.text.len());
        &self.text[..end]
    }
}

impl From<String> for ProviderError {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for ProviderError {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.text)
    }
}

impl std::error::Error for ProviderError {}

/// Run-aborting conditions. Per-item failures never become one of these;
/// they are converted into result records and the batch continues.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("a metadata provider is required but none was configured")]
    MissingProvider,

    #[error("run stopped by caller")]
    Stopped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_transient_kinds() {
        assert_eq!(
            ErrorKind::classify("HTTP Error 429: Too Many Requests"),
            ErrorKind::RateLimited
        );
        assert_eq!(
            ErrorKind::classify("503 Service Unavailable"),
            ErrorKind::ServiceUnavailable
        );
        assert_eq!(
            ErrorKind::classify("read operation timed out"),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn test_classify_terminal_kinds() {
        assert_eq!(
            ErrorKind::classify("This video is private"),
            ErrorKind::Private
        );
        assert_eq!(
            ErrorKind::classify("Video unavailable"),
            ErrorKind::Unavailable
        );
        assert_eq!(
            ErrorKind::classify("not available in your country"),
            ErrorKind::GeoBlocked
        );
        assert_eq!(
            ErrorKind::classify("Subtitles are disabled for this video"),
            ErrorKind::Blocked
        );
    }

    #[test]
    fn test_rate_limit_wins_over_unavailable() {
        // A 429 message often also says "unavailable"; throttle must win.
        assert_eq!(
            ErrorKind::classify("429: video temporarily unavailable"),
            ErrorKind::RateLimited
        );
    }

    #[test]
    fn test_trippable_split() {
        assert!(ErrorKind::RateLimited.is_trippable());
        assert!(ErrorKind::Timeout.is_trippable());
        assert!(!ErrorKind::Private.is_trippable());
        assert!(!ErrorKind::Other.is_trippable());
        assert!(ErrorKind::GeoBlocked.is_terminal());
        assert!(!ErrorKind::Other.is_terminal());
    }

    #[test]
    fn test_provider_error_truncation() {
        let e = ProviderError::new("x".repeat(500));
        assert_eq!(e.truncated(200).len(), 200);
        let short = ProviderError::new("short");
        assert_eq!(short.truncated(200), "short");
    }
}
