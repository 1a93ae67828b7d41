// Capability provider traits and common request/response types
//
// The pipeline never talks to the network directly for probing or caption
// retrieval; it goes through these two seams. Provider A (metadata) is
// mandatory. Provider B (dedicated transcript listing) is optional and is
// skipped entirely in fast detect mode.

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;

use super::errors::ProviderError;
use super::models::{CaptionFile, CaptionFormat, SubtitlePreference, VideoMeta};

/// Per-call context for provider requests.
#[derive(Debug, Clone, Default)]
pub struct ProviderContext {
    /// Egress proxy for this call, empty for a direct connection
    pub proxy: String,
    pub user_agent: String,
    pub cookie_file: String,
}

/// Raw probe outcome from the metadata provider. Track codes are as
/// advertised by the service (`zh-TW`, `en-US`, ...), not normalized.
#[derive(Debug, Clone, Default)]
pub struct ProbeOutcome {
    pub manual_langs: HashSet<String>,
    pub auto_langs: HashSet<String>,
    pub meta: VideoMeta,
    pub latency_ms: f64,
}

/// Advertised caption tracks, used for language negotiation before a
/// download.
#[derive(Debug, Clone, Default)]
pub struct CaptionTracks {
    pub manual: HashSet<String>,
    pub auto: HashSet<String>,
}

impl CaptionTracks {
    pub fn all_keys(&self) -> impl Iterator<Item = &String> {
        self.manual.iter().chain(self.auto.iter())
    }
}

/// One caption download request.
#[derive(Debug, Clone)]
pub struct CaptionRequest {
    pub url: String,
    pub video_id: String,
    pub out_dir: PathBuf,
    /// Concrete negotiated track codes to fetch
    pub languages: Vec<String>,
    pub prefer: SubtitlePreference,
    /// Payload format on the wire (srt or vtt; txt is derived locally)
    pub format: CaptionFormat,
}

/// Provider A: general metadata plus caption retrieval.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Name of the provider (for logging)
    fn name(&self) -> &'static str;

    /// Probe one URL for metadata and caption availability.
    async fn probe(&self, url: &str, ctx: &ProviderContext)
        -> Result<ProbeOutcome, ProviderError>;

    /// Expand a channel or playlist URL into individual video URLs.
    async fn list_videos(
        &self,
        url: &str,
        ctx: &ProviderContext,
    ) -> Result<Vec<String>, ProviderError>;

    /// Advertised caption tracks for one video.
    async fn list_caption_tracks(
        &self,
        url: &str,
        ctx: &ProviderContext,
    ) -> Result<CaptionTracks, ProviderError>;

    /// Fetch caption files into `req.out_dir`, named
    /// `<video_id>.<lang>.<ext>`. May return fewer languages than
    /// requested; the fetcher verifies what actually materialized.
    async fn fetch_captions(
        &self,
        req: &CaptionRequest,
        ctx: &ProviderContext,
    ) -> Result<Vec<CaptionFile>, ProviderError>;
}

/// Listing from the dedicated transcript provider.
#[derive(Debug, Clone, Default)]
pub struct TranscriptListing {
    pub manual_langs: HashSet<String>,
    pub auto_langs: HashSet<String>,
    /// Listing-level error (transcripts disabled etc.); recorded as
    /// `api_error`, never fails the probe on its own
    pub error: Option<String>,
}

/// Provider B: dedicated transcript listing and retrieval, used to widen
/// probe coverage and as the fetcher's fallback path.
#[async_trait]
pub trait TranscriptProvider: Send + Sync {
    /// Name of the provider (for logging)
    fn name(&self) -> &'static str;

    async fn list_transcripts(&self, video_id: &str)
        -> Result<TranscriptListing, ProviderError>;

    /// Retrieve one transcript as an SRT payload.
    async fn fetch_transcript(
        &self,
        video_id: &str,
        lang: &str,
    ) -> Result<String, ProviderError>;
}
