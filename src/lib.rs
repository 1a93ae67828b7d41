//! Resilient caption harvesting for large video batches.
//!
//! The pipeline probes videos for caption availability, downloads the
//! selected tracks, and records everything into a per-run directory.
//! Network access is mediated by a token-bucket rate limiter, a scored
//! proxy pool and a circuit breaker shared across the whole run.

pub mod harvester;

pub use harvester::{
    CaptionFetcher, CaptionProbe, ErrorKind, HarvestConfig, HarvestError, HarvestInput, Harvester,
    MetadataProvider, ProbeResult, ProbeStatus, RunControls, RunSummary, TranscriptProvider,
};
