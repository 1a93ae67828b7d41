// Run orchestration: resolve input, detect, download, finalize

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use super::config::HarvestConfig;
use super::control::RunControls;
use super::fetcher::{CaptionFetcher, FetchItem, FetchOutcome, FetchPolicy, FetchStatus, MIN_EFFECTIVE_LINES};
use super::errors::HarvestError;
use super::models::{ProbeResult, ProbeStatus, ProgressSink, RunSummary};
use super::net::{CircuitBreaker, ProxyPool, ProxyPoolOptions, RateLimiter};
use super::notify::WebhookNotifier;
use super::probe::{CaptionProbe, DetectPolicy};
use super::providers::{MetadataProvider, ProviderContext, TranscriptProvider};
use super::records::{
    create_run_dir, save_config_snapshot, save_link_lists, validate_subtitles_dir, ChannelIndex,
    RunRecorder, SUBS_DIR,
};
use super::utils::{ensure_channel_videos_url, extract_video_id, normalize_url, ts_utc};

/// What to harvest.
#[derive(Debug, Clone)]
pub enum HarvestInput {
    /// Explicit video URLs
    Urls(Vec<String>),
    /// Text file with one URL per line (`#` comments and blanks skipped)
    File(PathBuf),
    /// A channel whose videos page is expanded via the metadata provider
    Channel(String),
}

/// Drives one full harvesting run: input resolution, availability
/// detection, caption retrieval, validation and record keeping. All
/// network admission (rate limiter, proxy pool, circuit breaker) is
/// shared between the detect and download phases.
pub struct Harvester {
    config: HarvestConfig,
    provider: Arc<dyn MetadataProvider>,
    transcripts: Option<Arc<dyn TranscriptProvider>>,
    controls: RunControls,
    progress: Option<ProgressSink>,
    config_warnings: Vec<String>,
}

impl Harvester {
    pub fn new(config: HarvestConfig, provider: Arc<dyn MetadataProvider>) -> Self {
        Self {
            config,
            provider,
            transcripts: None,
            controls: RunControls::new(),
            progress: None,
            config_warnings: Vec::new(),
        }
    }

    pub fn with_transcripts(mut self, transcripts: Option<Arc<dyn TranscriptProvider>>) -> Self {
        self.transcripts = transcripts;
        self
    }

    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Warnings carried over from config loading (missing env vars etc.);
    /// they end up in the run's warnings file.
    pub fn with_config_warnings(mut self, warnings: Vec<String>) -> Self {
        self.config_warnings = warnings;
        self
    }

    /// Handle for stopping or pausing the run from another task.
    pub fn controls(&self) -> RunControls {
        self.controls.clone()
    }

    fn phase(&self, msg: &str) {
        tracing::info!(target: "harvester::run", "{msg}");
        if let Some(p) = &self.progress {
            p(-1, 0, msg);
        }
    }

    /// Execute one run. Per-item failures become records, never errors;
    /// the result is `Err` only for run-level conditions (unwritable
    /// output root, unreadable input file).
    pub async fn run(&self, input: HarvestInput) -> Result<RunSummary, HarvestError> {
        self.phase("preparing run");
        fs::create_dir_all(&self.config.output_root)?;
        let run_dir = create_run_dir(&self.config.output_root)?;
        let recorder = Arc::new(RunRecorder::create(&run_dir)?);
        save_config_snapshot(&run_dir, &self.config)?;
        for w in &self.config_warnings {
            recorder.warn(w.clone());
        }

        let notifier = WebhookNotifier::new(self.config.webhook.clone()).map(|n| {
            let rec = recorder.clone();
            n.with_warn_sink(Arc::new(move |w| rec.warn(w)))
        });
        if let Some(n) = &notifier {
            n.fire("run_start", json!({ "run_dir": run_dir.display().to_string() }));
        }

        let ctx = ProviderContext {
            proxy: String::new(),
            user_agent: self.config.user_agent.clone(),
            cookie_file: self.config.cookie_file.clone(),
        };
        let pool = ProxyPool::from_entries(
            &self.config.proxy.entries,
            ProxyPoolOptions {
                cool_down: Duration::from_secs(self.config.proxy.cool_down_sec),
                max_fail: self.config.proxy.max_fails,
                window: self.config.proxy.window,
                blacklist_recovery: Duration::from_secs(self.config.proxy.blacklist_recovery_sec),
            },
        )
        .map(Arc::new);
        let limiter = Arc::new(RateLimiter::new(self.config.req_rate));
        let breaker = Arc::new(CircuitBreaker::new(
            self.config.breaker_threshold,
            Duration::from_secs_f64(self.config.breaker_cooldown_sec.max(0.0)),
        ));

        // Resolve the input into concrete video URLs.
        let (urls, channel_key) = self.resolve_input(&input, &ctx, &recorder).await?;
        let total = urls.len();
        tracing::info!(target: "harvester::run", total, "input resolved");

        // The watermark is consulted only under incremental detect; the
        // index itself stays loaded so the run can still advance it.
        let mut index = ChannelIndex::load(&self.config.output_root);
        let last_seen = if self.config.incremental_detect {
            channel_key
                .as_deref()
                .and_then(|k| index.last_seen(k))
                .map(|s| s.to_string())
        } else {
            None
        };

        // Detect
        self.phase("detecting caption availability");
        let probe = CaptionProbe::new(
            self.provider.clone(),
            limiter.clone(),
            breaker.clone(),
            DetectPolicy::from(&self.config),
        )
        .with_transcripts(self.transcripts.clone())
        .with_proxy_pool(pool.clone())
        .with_controls(self.controls.clone())
        .with_context(ctx.clone());
        let results = probe.detect(&urls, self.progress.clone()).await;

        for r in &results {
            recorder.record(&detect_record(r))?;
        }
        let probe_errors = save_link_lists(&run_dir, &results)?;

        // Download
        let mut downloaded = 0usize;
        let mut skipped = 0usize;
        let mut failed = probe_errors;
        if self.config.do_download && !self.config.dry_run && !self.controls.is_stopped() {
            self.phase("downloading captions");
            let (items, watermark_skips) =
                self.build_fetch_queue(&results, last_seen.as_deref(), &run_dir, &recorder);
            skipped += watermark_skips;

            let fetcher = CaptionFetcher::new(
                self.provider.clone(),
                limiter.clone(),
                breaker.clone(),
                FetchPolicy::from(&self.config),
            )
            .with_transcripts(self.transcripts.clone())
            .with_proxy_pool(pool.clone())
            .with_controls(self.controls.clone())
            .with_context(ctx.clone());

            let outcomes = fetcher.fetch_many(&items).await;
            for o in &outcomes {
                recorder.record(&download_record(o))?;
                for w in &o.warnings {
                    recorder.warn(w.clone());
                }
                match &o.status {
                    FetchStatus::Downloaded => downloaded += 1,
                    FetchStatus::Skipped => skipped += 1,
                    FetchStatus::Failed(_) => failed += 1,
                    FetchStatus::Stopped => {}
                }
            }
        } else if self.config.do_download && self.config.dry_run {
            self.phase("dry run: skipping downloads");
        }

        // Post-processing
        self.phase("validating caption files");
        for w in validate_subtitles_dir(&run_dir.join(SUBS_DIR), MIN_EFFECTIVE_LINES) {
            recorder.warn(w);
        }

        // Finalize
        self.phase("finalizing run");

        // Defensive recount: a retry that succeeded after its worker already
        // tallied a failure leaves valid files the counters missed. The disk
        // is authoritative upward; downloaded is never lowered.
        let on_disk = downloaded_on_disk(&run_dir.join(SUBS_DIR));
        if on_disk > downloaded {
            let gain = on_disk - downloaded;
            tracing::info!(
                target: "harvester::run",
                counted = downloaded,
                on_disk,
                "reconciling counters against filesystem"
            );
            downloaded = on_disk;
            failed = failed.saturating_sub(gain);
        }
        // Items that never reached the download queue count as skipped.
        let accounted = downloaded + skipped + failed;
        if accounted < total {
            skipped += total - accounted;
        }
        let newest = newest_upload_date(&results);
        if let (Some(key), Some(seen)) = (channel_key.as_deref(), newest.as_deref()) {
            if !self.config.dry_run && !self.controls.is_stopped() {
                index.advance(key, seen);
                index.save(&self.config.output_root)?;
            }
        }
        recorder.flush_warnings()?;

        let summary = RunSummary {
            run_dir: run_dir.clone(),
            total,
            downloaded,
            skipped,
            failed,
            // A run that saw nothing newer still reports the watermark.
            last_seen: newest.or(last_seen),
        };
        if let Some(n) = &notifier {
            n.fire(
                "run_end",
                json!({
                    "run_dir": run_dir.display().to_string(),
                    "total": summary.total,
                    "downloaded": summary.downloaded,
                    "skipped": summary.skipped,
                    "failed": summary.failed,
                }),
            );
        }
        tracing::info!(
            target: "harvester::run",
            total = summary.total,
            downloaded = summary.downloaded,
            skipped = summary.skipped,
            failed = summary.failed,
            "run finished"
        );
        Ok(summary)
    }

    /// Turn the input into a list of video URLs, plus the channel-index key
    /// when the input is a channel.
    async fn resolve_input(
        &self,
        input: &HarvestInput,
        ctx: &ProviderContext,
        recorder: &RunRecorder,
    ) -> Result<(Vec<String>, Option<String>), HarvestError> {
        let (raw, channel_key) = match input {
            HarvestInput::Urls(urls) => (urls.clone(), None),
            HarvestInput::File(path) => {
                let body = fs::read_to_string(path)?;
                let urls = body
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(str::to_string)
                    .collect();
                (urls, None)
            }
            HarvestInput::Channel(url) => {
                let key = ensure_channel_videos_url(url);
                self.phase("expanding channel video list");
                let listed = self
                    .provider
                    .list_videos(&key, ctx)
                    .await
                    .map_err(|e| HarvestError::Config(format!("channel listing failed: {e}")))?;
                (listed, Some(key))
            }
        };

        let mut urls = Vec::with_capacity(raw.len());
        let mut seen = std::collections::HashSet::new();
        for u in &raw {
            match normalize_url(u) {
                Some(n) => {
                    if seen.insert(n.clone()) {
                        urls.push(n);
                    }
                }
                None => recorder.warn(format!("invalid_url\t{u}")),
            }
        }
        if self.config.max_items > 0 && urls.len() > self.config.max_items {
            urls.truncate(self.config.max_items);
        }
        Ok((urls, channel_key))
    }

    /// Build the download queue from detect results: only items with
    /// captions, deduplicated by video id, filtered by the channel
    /// watermark, each with its per-item language selection.
    fn build_fetch_queue(
        &self,
        results: &[ProbeResult],
        last_seen: Option<&str>,
        run_dir: &std::path::Path,
        recorder: &RunRecorder,
    ) -> (Vec<FetchItem>, usize) {
        let policy = FetchPolicy::from(&self.config);
        let out_dir = run_dir.join(SUBS_DIR);
        let mut queued = std::collections::HashSet::new();
        let mut items = Vec::new();
        let mut watermark_skips = 0usize;

        // Requested languages keep no_subs items in the queue: detection
        // can miss tracks the download path still finds. Errors stay out.
        let wants_langs = !policy.languages.is_empty();
        for r in results {
            let eligible = match r.status {
                ProbeStatus::HasSubs => true,
                ProbeStatus::NoSubs => self.config.force_refresh || wants_langs,
                _ => false,
            };
            if !eligible {
                continue;
            }
            if !self.config.force_refresh
                && self.config.incremental_detect
                && !is_new(r.meta.upload_date.as_deref(), last_seen)
            {
                watermark_skips += 1;
                continue;
            }
            let vid = if r.video_id.is_empty() {
                extract_video_id(&r.url).unwrap_or_default()
            } else {
                r.video_id.clone()
            };
            if vid.is_empty() || !queued.insert(vid.clone()) {
                continue;
            }

            let (languages, fell_back) = select_langs(
                &policy.languages,
                self.config.preferred_langs.as_deref(),
                &r.all_langs,
            );
            if fell_back {
                recorder.warn(format!(
                    "lang_not_detected\t{vid}\t{}",
                    policy.languages.join(",")
                ));
            }
            items.push(FetchItem {
                url: r.url.clone(),
                video_id: vid,
                languages,
                out_dir: out_dir.clone(),
            });
        }
        (items, watermark_skips)
    }
}

/// Distinct video ids with at least one valid caption file on disk.
/// Files are named `<video_id>.<track-code>.<ext>`.
fn downloaded_on_disk(subs_dir: &std::path::Path) -> usize {
    let mut vids = std::collections::HashSet::new();
    let entries = match fs::read_dir(subs_dir) {
        Ok(e) => e,
        Err(_) => return 0,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".part") || name.ends_with(".tmp") {
            continue;
        }
        let Some(vid) = name.split('.').next() else {
            continue;
        };
        if vid.len() == 11
            && super::utils::has_min_effective_lines(&path, MIN_EFFECTIVE_LINES)
        {
            vids.insert(vid.to_string());
        }
    }
    vids.len()
}

/// Newest upload date among successfully probed items. Error and stopped
/// items are excluded so a half-processed run cannot push the watermark
/// past videos it never handled.
fn newest_upload_date(results: &[ProbeResult]) -> Option<String> {
    results
        .iter()
        .filter(|r| matches!(r.status, ProbeStatus::HasSubs | ProbeStatus::NoSubs))
        .filter_map(|r| r.meta.upload_date.clone())
        .max()
}

/// Whether an item is newer than the channel watermark. Unknown dates are
/// always treated as new so nothing silently falls through the filter.
fn is_new(upload_date: Option<&str>, last_seen: Option<&str>) -> bool {
    match (upload_date, last_seen) {
        (Some(d), Some(w)) => d > w,
        _ => true,
    }
}

/// Per-item language selection. Preferred and requested languages that the
/// probe detected come first; when none matched, the first detected
/// language substitutes (flagged so a warning is recorded). Unmatched
/// requested languages are appended afterward either way, since detection
/// can miss tracks the download path still finds.
fn select_langs(
    requested: &[String],
    preferred: Option<&[String]>,
    detected: &[String],
) -> (Vec<String>, bool) {
    let mut selected: Vec<String> = Vec::new();
    if let Some(pref) = preferred {
        for l in pref {
            let l = super::utils::norm_lang(l);
            if !l.is_empty() && detected.contains(&l) && !selected.contains(&l) {
                selected.push(l);
            }
        }
    }
    for l in requested {
        if detected.contains(l) && !selected.contains(l) {
            selected.push(l.clone());
        }
    }
    let fell_back = selected.is_empty();
    if fell_back {
        if let Some(first) = detected.first() {
            selected.push(first.clone());
        }
    }
    for l in requested {
        if !selected.contains(l) {
            selected.push(l.clone());
        }
    }
    (selected, fell_back)
}

fn detect_record(r: &ProbeResult) -> serde_json::Value {
    let mut v = serde_json::to_value(r).unwrap_or_else(|_| json!({}));
    if let Some(obj) = v.as_object_mut() {
        obj.insert("type".to_string(), json!("detect"));
        obj.insert("ts".to_string(), json!(ts_utc()));
    }
    v
}

fn download_record(o: &FetchOutcome) -> serde_json::Value {
    let status = match &o.status {
        FetchStatus::Downloaded => "downloaded".to_string(),
        FetchStatus::Skipped => "skipped".to_string(),
        FetchStatus::Failed(kind) => kind.as_status().to_string(),
        FetchStatus::Stopped => "stopped".to_string(),
    };
    json!({
        "type": "download",
        "ts": ts_utc(),
        "url": o.url,
        "video_id": o.video_id,
        "status": status,
        "files": o.files.iter().map(|f| f.path.display().to_string()).collect::<Vec<_>>(),
        "langs": o.files.iter().map(|f| f.lang.clone()).collect::<Vec<_>>(),
        "attempts": o.attempts,
        "error": o.error_text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvester::errors::ProviderError;
    use crate::harvester::models::{CaptionFile, CaptionFormat, VideoMeta};
    use crate::harvester::providers::{CaptionRequest, CaptionTracks, ProbeOutcome};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SRT_BODY: &str = "\
1
00:00:01,000 --> 00:00:02,000
one

2
00:00:03,000 --> 00:00:04,000
two

3
00:00:05,000 --> 00:00:06,000
three

4
00:00:07,000 --> 00:00:08,000
four

5
00:00:09,000 --> 00:00:10,000
five
";

    struct MockProvider {
        /// video id -> upload date ("" means the provider has no date)
        dates: HashMap<String, String>,
        channel_videos: Vec<String>,
        fetch_calls: AtomicUsize,
        /// Probe advertises no caption tracks; listing/fetching still works
        hide_tracks_in_probe: bool,
    }

    impl MockProvider {
        fn new(dates: &[(&str, &str)]) -> Self {
            Self {
                dates: dates
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                channel_videos: dates
                    .iter()
                    .map(|(k, _)| format!("https://www.youtube.com/watch?v={k}"))
                    .collect(),
                fetch_calls: AtomicUsize::new(0),
                hide_tracks_in_probe: false,
            }
        }

        fn hidden_tracks(dates: &[(&str, &str)]) -> Self {
            Self {
                hide_tracks_in_probe: true,
                ..Self::new(dates)
            }
        }
    }

    #[async_trait]
    impl MetadataProvider for MockProvider {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn probe(
            &self,
            url: &str,
            _ctx: &ProviderContext,
        ) -> Result<ProbeOutcome, ProviderError> {
            let vid = extract_video_id(url).unwrap_or_default();
            let mut manual = std::collections::HashSet::new();
            if !self.hide_tracks_in_probe {
                manual.insert("en-US".to_string());
            }
            Ok(ProbeOutcome {
                manual_langs: manual,
                auto_langs: Default::default(),
                meta: VideoMeta {
                    upload_date: self.dates.get(&vid).filter(|d| !d.is_empty()).cloned(),
                    ..Default::default()
                },
                latency_ms: 5.0,
            })
        }

        async fn list_videos(
            &self,
            _url: &str,
            _ctx: &ProviderContext,
        ) -> Result<Vec<String>, ProviderError> {
            Ok(self.channel_videos.clone())
        }

        async fn list_caption_tracks(
            &self,
            _url: &str,
            _ctx: &ProviderContext,
        ) -> Result<CaptionTracks, ProviderError> {
            let mut manual = std::collections::HashSet::new();
            manual.insert("en-US".to_string());
            Ok(CaptionTracks {
                manual,
                auto: Default::default(),
            })
        }

        async fn fetch_captions(
            &self,
            req: &CaptionRequest,
            _ctx: &ProviderContext,
        ) -> Result<Vec<CaptionFile>, ProviderError> {
            self.fetch_calls.fetch_add(1, Ordering::Relaxed);
            let mut out = Vec::new();
            for lang in &req.languages {
                let path = req
                    .out_dir
                    .join(format!("{}.{lang}.srt", req.video_id));
                std::fs::write(&path, SRT_BODY).map_err(|e| ProviderError::new(e.to_string()))?;
                out.push(CaptionFile {
                    path,
                    lang: lang.clone(),
                    format: CaptionFormat::Srt,
                });
            }
            Ok(out)
        }
    }

    fn test_config(root: &std::path::Path) -> HarvestConfig {
        HarvestConfig {
            output_root: root.to_path_buf(),
            sleep_between: 0.0,
            req_rate: 0.0,
            do_download: true,
            download_langs: vec!["en".to_string()],
            detect_mode: crate::harvester::models::DetectMode::Fast,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_full_run_produces_artifacts() {
        let root = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockProvider::new(&[
            ("AAAAAAAAAA1", "20240501"),
            ("AAAAAAAAAA2", "20240502"),
        ]));
        let h = Harvester::new(test_config(root.path()), provider.clone());

        let summary = h
            .run(HarvestInput::Urls(vec![
                "https://www.youtube.com/watch?v=AAAAAAAAAA1".to_string(),
                "https://youtu.be/AAAAAAAAAA2".to_string(),
            ]))
            .await
            .unwrap();

        assert_eq!(summary.total, 2);
        assert_eq!(summary.downloaded, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.last_seen.as_deref(), Some("20240502"));

        let run_dir = &summary.run_dir;
        assert!(run_dir.join("run.jsonl").exists());
        assert!(run_dir.join("all_links.txt").exists());
        assert!(run_dir.join("config.final.json").exists());
        assert!(run_dir
            .join(SUBS_DIR)
            .join("AAAAAAAAAA1.en-us.srt")
            .exists());

        let body = std::fs::read_to_string(run_dir.join("run.jsonl")).unwrap();
        // Two detect records plus two download records.
        assert_eq!(body.lines().count(), 4);
        assert!(body.contains(r#""type":"detect""#));
        assert!(body.contains(r#""status":"downloaded""#));
    }

    #[tokio::test]
    async fn test_channel_watermark_skips_old_videos() {
        let root = tempfile::tempdir().unwrap();
        let channel = "https://www.youtube.com/@somechannel";
        let key = ensure_channel_videos_url(channel);

        let mut index = ChannelIndex::default();
        index.advance(&key, "20240101");
        index.save(root.path()).unwrap();

        let provider = Arc::new(MockProvider::new(&[
            ("AAAAAAAAAA1", "20231215"),
            ("AAAAAAAAAA2", "20240401"),
        ]));
        let h = Harvester::new(test_config(root.path()), provider.clone());
        let summary = h
            .run(HarvestInput::Channel(channel.to_string()))
            .await
            .unwrap();

        // Only the post-watermark video is downloaded.
        assert_eq!(summary.total, 2);
        assert_eq!(summary.downloaded, 1);
        assert_eq!(summary.skipped, 1);
        assert!(summary
            .run_dir
            .join(SUBS_DIR)
            .join("AAAAAAAAAA2.en-us.srt")
            .exists());
        assert!(!summary
            .run_dir
            .join(SUBS_DIR)
            .join("AAAAAAAAAA1.en-us.srt")
            .exists());

        // Watermark advanced to the newest date seen.
        let index = ChannelIndex::load(root.path());
        assert_eq!(index.last_seen(&key), Some("20240401"));
    }

    #[tokio::test]
    async fn test_dry_run_never_advances_watermark() {
        let root = tempfile::tempdir().unwrap();
        let channel = "https://www.youtube.com/@somechannel";
        let key = ensure_channel_videos_url(channel);

        let provider = Arc::new(MockProvider::new(&[("AAAAAAAAAA1", "20240401")]));
        let cfg = HarvestConfig {
            dry_run: true,
            ..test_config(root.path())
        };
        let h = Harvester::new(cfg, provider);
        let summary = h
            .run(HarvestInput::Channel(channel.to_string()))
            .await
            .unwrap();

        assert_eq!(summary.downloaded, 0);
        let index = ChannelIndex::load(root.path());
        assert_eq!(index.last_seen(&key), None);
    }

    #[tokio::test]
    async fn test_url_file_input_skips_comments() {
        let root = tempfile::tempdir().unwrap();
        let list = root.path().join("links.txt");
        std::fs::write(
            &list,
            "# header\nhttps://www.youtube.com/watch?v=AAAAAAAAAA1\n\nnot-a-url\n",
        )
        .unwrap();

        let provider = Arc::new(MockProvider::new(&[("AAAAAAAAAA1", "20240101")]));
        let h = Harvester::new(test_config(root.path()), provider);
        let summary = h.run(HarvestInput::File(list)).await.unwrap();

        assert_eq!(summary.total, 1);
        // The invalid line surfaces in warnings.txt, not as a failure.
        assert_eq!(summary.failed, 0);
        let warnings =
            std::fs::read_to_string(summary.run_dir.join("warnings.txt")).unwrap();
        assert!(warnings.contains("invalid_url\tnot-a-url"));
    }

    #[tokio::test]
    async fn test_watermark_gate_follows_incremental_detect() {
        let channel = "https://www.youtube.com/@somechannel";
        let key = ensure_channel_videos_url(channel);

        // incremental_detect on, incremental_download off: the watermark
        // still filters the old video out.
        let root = tempfile::tempdir().unwrap();
        let mut index = ChannelIndex::default();
        index.advance(&key, "20240101");
        index.save(root.path()).unwrap();
        let cfg = HarvestConfig {
            incremental_detect: true,
            incremental_download: false,
            ..test_config(root.path())
        };
        let provider = Arc::new(MockProvider::new(&[("AAAAAAAAAA1", "20231215")]));
        let h = Harvester::new(cfg, provider);
        let summary = h
            .run(HarvestInput::Channel(channel.to_string()))
            .await
            .unwrap();
        assert_eq!(summary.downloaded, 0);
        assert_eq!(summary.skipped, 1);

        // incremental_detect off: the same old video downloads even though
        // incremental_download is on.
        let root = tempfile::tempdir().unwrap();
        let mut index = ChannelIndex::default();
        index.advance(&key, "20240101");
        index.save(root.path()).unwrap();
        let cfg = HarvestConfig {
            incremental_detect: false,
            incremental_download: true,
            ..test_config(root.path())
        };
        let provider = Arc::new(MockProvider::new(&[("AAAAAAAAAA1", "20231215")]));
        let h = Harvester::new(cfg, provider);
        let summary = h
            .run(HarvestInput::Channel(channel.to_string()))
            .await
            .unwrap();
        assert_eq!(summary.downloaded, 1);
        // The watermark never regresses to the older date.
        let index = ChannelIndex::load(root.path());
        assert_eq!(index.last_seen(&key), Some("20240101"));
    }

    #[tokio::test]
    async fn test_no_subs_item_still_fetched_for_requested_langs() {
        let root = tempfile::tempdir().unwrap();
        // Probe sees no tracks; the download path still finds one.
        let provider = Arc::new(MockProvider::hidden_tracks(&[("AAAAAAAAAA1", "20240501")]));
        let h = Harvester::new(test_config(root.path()), provider.clone());

        let summary = h
            .run(HarvestInput::Urls(vec![
                "https://www.youtube.com/watch?v=AAAAAAAAAA1".to_string(),
            ]))
            .await
            .unwrap();

        assert_eq!(summary.downloaded, 1);
        assert!(summary
            .run_dir
            .join(SUBS_DIR)
            .join("AAAAAAAAAA1.en-us.srt")
            .exists());
        let body = std::fs::read_to_string(summary.run_dir.join("run.jsonl")).unwrap();
        assert!(body.contains(r#""status":"no_subs""#));
        assert!(body.contains(r#""status":"downloaded""#));
    }

    #[tokio::test]
    async fn test_unchanged_run_reports_existing_watermark() {
        let root = tempfile::tempdir().unwrap();
        let channel = "https://www.youtube.com/@somechannel";
        let key = ensure_channel_videos_url(channel);
        let mut index = ChannelIndex::default();
        index.advance(&key, "20240505");
        index.save(root.path()).unwrap();

        // The provider reports no upload date at all.
        let provider = Arc::new(MockProvider::new(&[("AAAAAAAAAA1", "")]));
        let h = Harvester::new(test_config(root.path()), provider);
        let summary = h
            .run(HarvestInput::Channel(channel.to_string()))
            .await
            .unwrap();

        // No newer date seen: the summary echoes the existing watermark
        // instead of dropping it, and the index is untouched.
        assert_eq!(summary.last_seen.as_deref(), Some("20240505"));
        let index = ChannelIndex::load(root.path());
        assert_eq!(index.last_seen(&key), Some("20240505"));
    }

    #[test]
    fn test_is_new_watermark_comparison() {
        assert!(is_new(Some("20240102"), Some("20240101")));
        assert!(!is_new(Some("20240101"), Some("20240101")));
        assert!(!is_new(Some("20231215"), Some("20240101")));
        // Unknown on either side never filters.
        assert!(is_new(None, Some("20240101")));
        assert!(is_new(Some("20240101"), None));
    }

    #[test]
    fn test_select_langs_fallback() {
        let req = vec!["zh".to_string(), "en".to_string()];
        let det = vec!["en".to_string(), "ja".to_string()];
        // Detected requested language first, missed one re-added after.
        assert_eq!(
            select_langs(&req, None, &det),
            (vec!["en".to_string(), "zh".to_string()], false)
        );

        // Nothing detected at all: the full requested set, flagged.
        let (langs, fell_back) = select_langs(&req, None, &[]);
        assert_eq!(langs, req);
        assert!(fell_back);

        // No requested language detected: the first detected one
        // substitutes, requested ones still appended.
        let det_ja = vec!["ja".to_string()];
        let (langs, fell_back) = select_langs(&req, None, &det_ja);
        assert_eq!(langs, vec!["ja", "zh", "en"]);
        assert!(fell_back);

        // Preferred languages come first when detected.
        let pref = vec!["ja".to_string()];
        let (langs, fell_back) = select_langs(&req, Some(&pref), &det);
        assert_eq!(langs, vec!["ja", "en", "zh"]);
        assert!(!fell_back);
    }
}
