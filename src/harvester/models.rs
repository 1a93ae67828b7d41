// Common data models for the harvesting pipeline

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize, Serializer};

use super::errors::ErrorKind;

/// Progress sink: `(current, total, message)`. `current == -1` marks a
/// phase message rather than an item update.
pub type ProgressSink = Arc<dyn Fn(i64, usize, &str) + Send + Sync>;

/// Outcome classification of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    /// At least one caption track (manual or auto) exists
    HasSubs,
    /// Probed successfully, no caption tracks at all
    NoSubs,
    /// All attempts failed with this kind
    Error(ErrorKind),
    /// Worker observed the stop signal before finishing
    Stopped,
}

impl ProbeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HasSubs => "has_subs",
            Self::NoSubs => "no_subs",
            Self::Error(kind) => kind.as_status(),
            Self::Stopped => "stopped",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ProbeStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Video metadata returned by the metadata provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VideoMeta {
    pub title: Option<String>,
    pub channel: Option<String>,
    pub uploader: Option<String>,
    /// `YYYYMMDD`
    pub upload_date: Option<String>,
    pub duration_seconds: Option<u64>,
    pub view_count: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Normalized caption languages grouped into coarse buckets.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LangBuckets {
    pub zh: Vec<String>,
    pub en: Vec<String>,
    pub other: Vec<String>,
}

/// Result of probing one URL. Immutable once returned; owned by the
/// orchestrator for the lifetime of the run.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub url: String,
    pub video_id: String,
    pub status: ProbeStatus,
    /// Normalized manual caption languages
    pub manual_langs: Vec<String>,
    /// Normalized auto caption languages
    pub auto_langs: Vec<String>,
    /// Union of the two, sorted
    pub all_langs: Vec<String>,
    /// Raw (unnormalized) track codes as advertised, for negotiation
    #[serde(skip)]
    pub raw_langs: Vec<String>,
    pub buckets: LangBuckets,
    pub attempts: u32,
    pub latency_ms: f64,
    /// Secondary-provider error, if any (does not fail the probe)
    pub api_error: Option<String>,
    /// Raw primary error text, truncated, when status is an error
    pub error_text: Option<String>,
    pub meta: VideoMeta,
}

impl ProbeResult {
    pub fn failed(url: &str, video_id: &str, kind: ErrorKind, text: &str, attempts: u32) -> Self {
        Self {
            url: url.to_string(),
            video_id: video_id.to_string(),
            status: ProbeStatus::Error(kind),
            manual_langs: Vec::new(),
            auto_langs: Vec::new(),
            all_langs: Vec::new(),
            raw_langs: Vec::new(),
            buckets: LangBuckets::default(),
            attempts,
            latency_ms: 0.0,
            api_error: None,
            error_text: Some(text.to_string()),
            meta: VideoMeta::default(),
        }
    }

    pub fn stopped(url: &str, video_id: &str) -> Self {
        Self {
            status: ProbeStatus::Stopped,
            ..Self::failed(url, video_id, ErrorKind::Other, "", 0)
        }
    }
}

/// Caption file format requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptionFormat {
    Srt,
    Vtt,
    /// Plain text, produced by converting a fetched srt payload
    Txt,
}

impl CaptionFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Srt => "srt",
            Self::Vtt => "vtt",
            Self::Txt => "txt",
        }
    }

    /// Extension of the file actually fetched over the network.
    /// `txt` is derived from an srt payload locally.
    pub fn payload_ext(&self) -> &'static str {
        match self {
            Self::Vtt => "vtt",
            _ => "srt",
        }
    }
}

impl fmt::Display for CaptionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which caption source to prefer when both exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtitlePreference {
    Manual,
    Auto,
    Both,
}

impl SubtitlePreference {
    pub fn wants_manual(&self) -> bool {
        matches!(self, Self::Manual | Self::Both)
    }

    pub fn wants_auto(&self) -> bool {
        matches!(self, Self::Auto | Self::Both)
    }
}

/// Probe depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectMode {
    /// Metadata provider plus the dedicated transcript provider
    #[default]
    Standard,
    /// Metadata provider only
    Fast,
}

/// One retrieved caption file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptionFile {
    pub path: PathBuf,
    pub lang: String,
    pub format: CaptionFormat,
}

/// Summary returned to the caller at the end of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_dir: PathBuf,
    pub total: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Newest upload date seen (`YYYYMMDD`), for the channel watermark
    pub last_seen: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        assert_eq!(ProbeStatus::HasSubs.as_str(), "has_subs");
        assert_eq!(
            ProbeStatus::Error(ErrorKind::RateLimited).as_str(),
            "error_429"
        );
        assert!(ProbeStatus::Error(ErrorKind::Other).is_error());
        assert!(!ProbeStatus::NoSubs.is_error());
    }

    #[test]
    fn test_format_payload_ext() {
        assert_eq!(CaptionFormat::Txt.payload_ext(), "srt");
        assert_eq!(CaptionFormat::Srt.payload_ext(), "srt");
        assert_eq!(CaptionFormat::Vtt.payload_ext(), "vtt");
    }

    #[test]
    fn test_preference_flags() {
        assert!(SubtitlePreference::Both.wants_manual());
        assert!(SubtitlePreference::Both.wants_auto());
        assert!(!SubtitlePreference::Auto.wants_manual());
    }
}
