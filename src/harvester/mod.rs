// Harvester module - caption detection and retrieval pipeline

pub mod config;
pub mod control;
pub mod convert;
pub mod errors;
pub mod fetcher;
pub mod models;
pub mod net;
pub mod notify;
pub mod orchestrator;
pub mod probe;
pub mod providers;
pub mod records;
pub mod utils;

pub use config::{AdaptiveTuning, HarvestConfig, ProxyConfig};
pub use control::RunControls;
pub use errors::{ErrorKind, HarvestError, ProviderError};
pub use fetcher::{CaptionFetcher, FetchItem, FetchOutcome, FetchPolicy, FetchStatus};
pub use models::{
    CaptionFile, CaptionFormat, DetectMode, ProbeResult, ProbeStatus, ProgressSink, RunSummary,
    SubtitlePreference, VideoMeta,
};
pub use net::{CircuitBreaker, ProxyPool, ProxyPoolOptions, RateLimiter};
pub use notify::{WebhookConfig, WebhookNotifier};
pub use orchestrator::{Harvester, HarvestInput};
pub use probe::{CaptionProbe, DetectPolicy};
pub use providers::{MetadataProvider, ProviderContext, TranscriptProvider};
pub use records::{ChannelIndex, RunRecorder};
