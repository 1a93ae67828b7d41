// Caption availability probing: two providers, retries, adaptive workers

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::config::{AdaptiveTuning, HarvestConfig};
use super::control::RunControls;
use super::errors::ProviderError;
use super::models::{DetectMode, LangBuckets, ProbeResult, ProbeStatus, ProgressSink, VideoMeta};
use super::net::{CircuitBreaker, ProxyPool, RateLimiter};
use super::providers::{MetadataProvider, ProviderContext, TranscriptProvider};
use super::utils::{extract_video_id, flatten_langs, norm_lang};

/// Maximum single backoff sleep between probe retries.
const MAX_BACKOFF_SECS: f64 = 16.0;
/// Error-rate ceiling for the small +1 growth branch.
const ERR_MODERATE: f64 = 0.10;

/// Detection policy for one batch run.
#[derive(Debug, Clone)]
pub struct DetectPolicy {
    pub max_workers: usize,
    pub sleep_between: f64,
    pub retry_times: u32,
    /// 0 disables batching (single pool over the full URL list)
    pub batch_size: usize,
    pub detect_mode: DetectMode,
    pub adaptive_concurrency: bool,
    pub min_workers: usize,
    pub max_workers_cap: usize,
    pub tuning: AdaptiveTuning,
}

impl Default for DetectPolicy {
    fn default() -> Self {
        Self {
            max_workers: 5,
            sleep_between: 0.5,
            retry_times: 2,
            batch_size: 0,
            detect_mode: DetectMode::Standard,
            adaptive_concurrency: false,
            min_workers: 2,
            max_workers_cap: 20,
            tuning: AdaptiveTuning::default(),
        }
    }
}

impl From<&HarvestConfig> for DetectPolicy {
    fn from(cfg: &HarvestConfig) -> Self {
        Self {
            max_workers: cfg.max_workers,
            sleep_between: cfg.sleep_between,
            retry_times: cfg.retry_times,
            batch_size: cfg.batch_size,
            detect_mode: cfg.detect_mode,
            adaptive_concurrency: cfg.adaptive_concurrency,
            min_workers: cfg.min_workers,
            max_workers_cap: cfg.max_workers_cap,
            tuning: cfg.adaptive,
        }
    }
}

/// Probes URL batches for caption availability. Provider A is always
/// consulted; provider B only in standard mode. All network calls go
/// through the shared rate limiter, proxy pool and circuit breaker.
#[derive(Clone)]
pub struct CaptionProbe {
    provider: Arc<dyn MetadataProvider>,
    transcripts: Option<Arc<dyn TranscriptProvider>>,
    limiter: Arc<RateLimiter>,
    pool: Option<Arc<ProxyPool>>,
    breaker: Arc<CircuitBreaker>,
    controls: RunControls,
    ctx: ProviderContext,
    policy: DetectPolicy,
}

impl CaptionProbe {
    pub fn new(
        provider: Arc<dyn MetadataProvider>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        policy: DetectPolicy,
    ) -> Self {
        Self {
            provider,
            transcripts: None,
            limiter,
            pool: None,
            breaker,
            controls: RunControls::new(),
            ctx: ProviderContext::default(),
            policy,
        }
    }

    pub fn with_transcripts(mut self, transcripts: Option<Arc<dyn TranscriptProvider>>) -> Self {
        self.transcripts = transcripts;
        self
    }

    pub fn with_proxy_pool(mut self, pool: Option<Arc<ProxyPool>>) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_controls(mut self, controls: RunControls) -> Self {
        self.controls = controls;
        self
    }

    pub fn with_context(mut self, ctx: ProviderContext) -> Self {
        self.ctx = ctx;
        self
    }

    /// Detect caption availability for all URLs. Results are collected in
    /// completion order, not submission order. In batched mode, batches
    /// run strictly sequentially; the seam between them is where breaker
    /// cooldowns are waited out and worker counts adapt.
    pub async fn detect(&self, urls: &[String], progress: Option<ProgressSink>) -> Vec<ProbeResult> {
        let total = urls.len();
        let counter = Arc::new(AtomicUsize::new(0));
        let floor = self.policy.min_workers.max(1);
        let cap = self.policy.max_workers_cap.max(floor);
        let mut workers = self.policy.max_workers.clamp(floor, cap);

        if self.policy.batch_size == 0 {
            return self
                .run_batch(urls, workers, total, &counter, progress.as_ref())
                .await;
        }

        let mut results = Vec::with_capacity(total);
        let batch_count = (total + self.policy.batch_size - 1) / self.policy.batch_size;
        for (i, chunk) in urls.chunks(self.policy.batch_size).enumerate() {
            if self.controls.is_stopped() {
                break;
            }
            if self.breaker.should_cooldown() {
                let remaining = self.breaker.remaining();
                if let Some(p) = &progress {
                    p(
                        -1,
                        total,
                        &format!("breaker cooldown: waiting {}s", remaining.as_secs()),
                    );
                }
                self.controls.nap(remaining).await;
            }
            if let Some(p) = &progress {
                p(-1, total, &format!("detecting batch {}/{batch_count}", i + 1));
            }

            let batch = self
                .run_batch(chunk, workers, total, &counter, progress.as_ref())
                .await;

            if self.policy.adaptive_concurrency && !batch.is_empty() {
                let (err_rate, avg_latency) = batch_stats(&batch);
                let next = next_worker_count(workers, err_rate, avg_latency, &self.policy);
                if next != workers {
                    tracing::info!(
                        target: "harvester::probe",
                        err_rate,
                        avg_latency,
                        from = workers,
                        to = next,
                        "adjusting detect concurrency"
                    );
                    if let Some(p) = &progress {
                        p(-1, total, &format!("concurrency {workers} -> {next}"));
                    }
                    workers = next;
                }
            }
            results.extend(batch);

            // Inter-batch pacing shrinks as concurrency grows.
            let delay = (1.0 - (workers as f64 / self.policy.max_workers_cap.max(1) as f64) * 0.5)
                .max(0.3);
            let jitter = rand::thread_rng().gen_range(0.0..0.2);
            self.controls
                .nap(Duration::from_secs_f64(delay + jitter))
                .await;
        }
        results
    }

    async fn run_batch(
        &self,
        batch: &[String],
        workers: usize,
        total: usize,
        counter: &Arc<AtomicUsize>,
        progress: Option<&ProgressSink>,
    ) -> Vec<ProbeResult> {
        let sem = Arc::new(Semaphore::new(workers.max(1)));
        let mut join = JoinSet::new();
        for url in batch {
            let probe = self.clone();
            let sem = sem.clone();
            let url = url.clone();
            join.spawn(async move {
                let _permit = match sem.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return ProbeResult::stopped(&url, ""),
                };
                probe.probe_one(&url).await
            });
        }

        let pace = Duration::from_secs_f64(self.policy.sleep_between.max(0.2));
        let mut out = Vec::with_capacity(batch.len());
        while let Some(joined) = join.join_next().await {
            let r = match joined {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(target: "harvester::probe", error = %e, "probe worker panicked");
                    continue;
                }
            };
            let done = counter.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(p) = progress {
                p(done as i64, total, &r.url);
            }
            out.push(r);
            if !self.controls.is_stopped() {
                self.controls.nap(pace).await;
            }
        }
        out
    }

    /// Probe one URL with kind-specific retry. Terminal kinds (private,
    /// geo-blocked, unavailable, blocked) short-circuit immediately since
    /// retrying cannot change the outcome.
    async fn probe_one(&self, url: &str) -> ProbeResult {
        let vid = extract_video_id(url).unwrap_or_default();
        let base = self.policy.sleep_between.max(0.2);
        let mut attempt: u32 = 0;
        let mut last_err: Option<ProviderError> = None;

        while attempt <= self.policy.retry_times {
            if self.controls.is_stopped() {
                return ProbeResult::stopped(url, &vid);
            }
            self.controls.wait_if_paused().await;
            if self.controls.is_stopped() {
                return ProbeResult::stopped(url, &vid);
            }

            attempt += 1;
            let proxy = self
                .pool
                .as_ref()
                .and_then(|p| p.get())
                .unwrap_or_default();
            self.limiter.acquire().await;

            let ctx = ProviderContext {
                proxy: proxy.clone(),
                ..self.ctx.clone()
            };
            let t0 = Instant::now();
            match self.provider.probe(url, &ctx).await {
                Ok(outcome) => {
                    let mut manual = flatten_langs(outcome.manual_langs.iter());
                    let mut auto = flatten_langs(outcome.auto_langs.iter());
                    let mut api_error = None;

                    if self.policy.detect_mode == DetectMode::Standard && !vid.is_empty() {
                        if let Some(tp) = &self.transcripts {
                            match tp.list_transcripts(&vid).await {
                                Ok(listing) => {
                                    manual.extend(flatten_langs(listing.manual_langs.iter()));
                                    auto.extend(flatten_langs(listing.auto_langs.iter()));
                                    api_error = listing.error;
                                }
                                // Secondary listing failures widen nothing
                                // but never fail the probe.
                                Err(e) => api_error = Some(e.text),
                            }
                        }
                    }

                    let latency = t0.elapsed().as_secs_f64() * 1000.0;
                    if let (Some(pool), false) = (&self.pool, proxy.is_empty()) {
                        pool.ok(&proxy, latency);
                    }
                    self.breaker.record(true, None);
                    return build_result(
                        url, &vid, &manual, &auto, outcome.meta, attempt, latency, api_error,
                    );
                }
                Err(e) => {
                    let latency = t0.elapsed().as_secs_f64() * 1000.0;
                    if let (Some(pool), false) = (&self.pool, proxy.is_empty()) {
                        pool.bad(&proxy, latency);
                    }
                    if e.kind.is_trippable() {
                        self.breaker.record(false, Some(e.kind));
                    }
                    if e.kind.is_terminal() || attempt > self.policy.retry_times {
                        return ProbeResult::failed(url, &vid, e.kind, e.truncated(200), attempt);
                    }

                    let delay = (base * e.kind.backoff_factor().powi(attempt as i32 - 1))
                        .min(MAX_BACKOFF_SECS);
                    let jitter = rand::thread_rng().gen_range(0.0..(base * 0.3).max(0.001));
                    last_err = Some(e);
                    self.controls
                        .nap(Duration::from_secs_f64(delay + jitter))
                        .await;
                }
            }
        }

        match last_err {
            Some(e) => ProbeResult::failed(url, &vid, e.kind, e.truncated(200), attempt),
            None => ProbeResult::failed(
                url,
                &vid,
                super::errors::ErrorKind::Other,
                "",
                attempt,
            ),
        }
    }
}

/// Error rate and mean latency over one batch. Latency averages only the
/// items that actually measured one.
fn batch_stats(batch: &[ProbeResult]) -> (f64, f64) {
    let errors = batch.iter().filter(|r| r.status.is_error()).count();
    let err_rate = errors as f64 / batch.len() as f64;
    let latencies: Vec<f64> = batch
        .iter()
        .filter(|r| r.latency_ms > 0.0)
        .map(|r| r.latency_ms)
        .collect();
    let avg = if latencies.is_empty() {
        0.0
    } else {
        latencies.iter().sum::<f64>() / latencies.len() as f64
    };
    (err_rate, avg)
}

/// Additive-increase/additive-decrease worker controller. Deliberately not
/// AIMD: the target service penalizes burstiness, so predictability wins
/// over throughput-seeking.
fn next_worker_count(
    curr: usize,
    err_rate: f64,
    avg_latency_ms: f64,
    policy: &DetectPolicy,
) -> usize {
    let t = &policy.tuning;
    let floor = policy.min_workers.max(1);
    let cap = policy.max_workers_cap.max(floor);
    if err_rate > t.err_high {
        curr.saturating_sub(2).max(floor)
    } else if err_rate < t.err_low && avg_latency_ms < t.latency_ok_ms {
        (curr + 2).min(cap)
    } else if avg_latency_ms > t.latency_slow_ms {
        curr.saturating_sub(1).max(floor)
    } else if avg_latency_ms < t.latency_fast_ms && err_rate < ERR_MODERATE {
        (curr + 1).min(cap)
    } else {
        curr
    }
}

#[allow(clippy::too_many_arguments)]
fn build_result(
    url: &str,
    video_id: &str,
    manual: &std::collections::HashSet<String>,
    auto: &std::collections::HashSet<String>,
    meta: VideoMeta,
    attempts: u32,
    latency_ms: f64,
    api_error: Option<String>,
) -> ProbeResult {
    let manual_norm: BTreeSet<String> = manual
        .iter()
        .map(|l| norm_lang(l))
        .filter(|l| !l.is_empty())
        .collect();
    let auto_norm: BTreeSet<String> = auto
        .iter()
        .map(|l| norm_lang(l))
        .filter(|l| !l.is_empty())
        .collect();
    let all: Vec<String> = manual_norm.union(&auto_norm).cloned().collect();

    let mut buckets = LangBuckets::default();
    for lang in &all {
        match lang.as_str() {
            "zh" => buckets.zh.push(lang.clone()),
            "en" => buckets.en.push(lang.clone()),
            _ => buckets.other.push(lang.clone()),
        }
    }

    let mut raw_langs: Vec<String> = manual.union(auto).cloned().collect();
    raw_langs.sort();

    let status = if all.is_empty() {
        ProbeStatus::NoSubs
    } else {
        ProbeStatus::HasSubs
    };
    ProbeResult {
        url: url.to_string(),
        video_id: video_id.to_string(),
        status,
        manual_langs: manual_norm.into_iter().collect(),
        auto_langs: auto_norm.into_iter().collect(),
        all_langs: all,
        raw_langs,
        buckets,
        attempts,
        latency_ms,
        api_error,
        error_text: None,
        meta,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvester::errors::ErrorKind;
    use crate::harvester::providers::{CaptionRequest, CaptionTracks, ProbeOutcome};
    use crate::harvester::models::CaptionFile;
    use async_trait::async_trait;
    use std::collections::HashSet;

    struct MockMeta {
        fail_with: std::collections::HashMap<String, String>,
        calls: AtomicUsize,
    }

    impl MockMeta {
        fn new() -> Self {
            Self {
                fail_with: Default::default(),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing(urls: &[(&str, &str)]) -> Self {
            let mut m = Self::new();
            for (u, e) in urls {
                m.fail_with.insert(u.to_string(), e.to_string());
            }
            m
        }
    }

    #[async_trait]
    impl MetadataProvider for MockMeta {
        fn name(&self) -> &'static str {
            "mock-meta"
        }

        async fn probe(
            &self,
            url: &str,
            _ctx: &ProviderContext,
        ) -> Result<ProbeOutcome, ProviderError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if let Some(e) = self.fail_with.get(url) {
                return Err(ProviderError::new(e.clone()));
            }
            let mut manual = HashSet::new();
            manual.insert("en-US".to_string());
            let mut auto = HashSet::new();
            auto.insert("zh-TW".to_string());
            Ok(ProbeOutcome {
                manual_langs: manual,
                auto_langs: auto,
                meta: VideoMeta {
                    title: Some("t".into()),
                    upload_date: Some("20240501".into()),
                    ..Default::default()
                },
                latency_ms: 10.0,
            })
        }

        async fn list_videos(
            &self,
            _url: &str,
            _ctx: &ProviderContext,
        ) -> Result<Vec<String>, ProviderError> {
            Ok(Vec::new())
        }

        async fn list_caption_tracks(
            &self,
            _url: &str,
            _ctx: &ProviderContext,
        ) -> Result<CaptionTracks, ProviderError> {
            Ok(CaptionTracks::default())
        }

        async fn fetch_captions(
            &self,
            _req: &CaptionRequest,
            _ctx: &ProviderContext,
        ) -> Result<Vec<CaptionFile>, ProviderError> {
            Ok(Vec::new())
        }
    }

    fn policy(retry_times: u32) -> DetectPolicy {
        DetectPolicy {
            retry_times,
            sleep_between: 0.0,
            detect_mode: DetectMode::Fast,
            max_workers: 4,
            ..Default::default()
        }
    }

    fn probe_with(provider: Arc<dyn MetadataProvider>, breaker: Arc<CircuitBreaker>, p: DetectPolicy) -> CaptionProbe {
        CaptionProbe::new(provider, Arc::new(RateLimiter::new(0.0)), breaker, p)
    }

    #[tokio::test]
    async fn test_batch_with_429_errors_still_completes() {
        let urls: Vec<String> = (0..10)
            .map(|i| format!("https://www.youtube.com/watch?v=AAAAAAAAAA{i}"))
            .collect();
        let provider = Arc::new(MockMeta::failing(&[
            (urls[1].as_str(), "HTTP Error 429: Too Many Requests"),
            (urls[4].as_str(), "HTTP Error 429: Too Many Requests"),
            (urls[7].as_str(), "HTTP Error 429: Too Many Requests"),
        ]));
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_secs(300)));
        let probe = probe_with(provider, breaker.clone(), policy(0));

        let results = probe.detect(&urls, None).await;

        assert_eq!(results.len(), 10);
        let errors: Vec<_> = results.iter().filter(|r| r.status.is_error()).collect();
        assert_eq!(errors.len(), 3);
        for e in &errors {
            assert_eq!(e.status, ProbeStatus::Error(ErrorKind::RateLimited));
        }
        // Trippable failures reached the threshold; cooldown is active.
        assert!(breaker.should_cooldown());
        // Non-429 items completed normally.
        assert_eq!(
            results.iter().filter(|r| r.status == ProbeStatus::HasSubs).count(),
            7
        );
    }

    #[tokio::test]
    async fn test_terminal_kind_short_circuits() {
        let url = "https://www.youtube.com/watch?v=BBBBBBBBBB1".to_string();
        let provider = Arc::new(MockMeta::failing(&[(url.as_str(), "This video is private")]));
        let breaker = Arc::new(CircuitBreaker::new(8, Duration::from_secs(60)));
        let probe = probe_with(provider.clone(), breaker.clone(), policy(5));

        let results = probe.detect(std::slice::from_ref(&url), None).await;

        assert_eq!(results[0].status, ProbeStatus::Error(ErrorKind::Private));
        assert_eq!(results[0].attempts, 1);
        // Exactly one network call despite a generous retry budget.
        assert_eq!(provider.calls.load(Ordering::Relaxed), 1);
        // Terminal kinds never feed the breaker.
        assert!(!breaker.should_cooldown());
    }

    #[tokio::test]
    async fn test_langs_are_normalized_and_bucketed() {
        let url = "https://www.youtube.com/watch?v=CCCCCCCCCC1".to_string();
        let provider = Arc::new(MockMeta::new());
        let breaker = Arc::new(CircuitBreaker::new(8, Duration::from_secs(60)));
        let probe = probe_with(provider, breaker, policy(0));

        let results = probe.detect(std::slice::from_ref(&url), None).await;
        let r = &results[0];
        assert_eq!(r.status, ProbeStatus::HasSubs);
        assert_eq!(r.manual_langs, vec!["en"]);
        assert_eq!(r.auto_langs, vec!["zh"]);
        assert_eq!(r.all_langs, vec!["en", "zh"]);
        assert_eq!(r.buckets.zh, vec!["zh"]);
        assert_eq!(r.buckets.en, vec!["en"]);
        assert!(r.raw_langs.contains(&"en-US".to_string()));
    }

    #[test]
    fn test_adaptive_controller_branches() {
        let p = DetectPolicy {
            min_workers: 2,
            max_workers_cap: 20,
            ..Default::default()
        };
        // Healthy batch: +2
        assert_eq!(next_worker_count(5, 0.01, 500.0, &p), 7);
        // Error storm: -2
        assert_eq!(next_worker_count(5, 0.30, 500.0, &p), 3);
        // Slow but not failing: -1
        assert_eq!(next_worker_count(5, 0.15, 6000.0, &p), 4);
        // Fast with moderate errors: +1
        assert_eq!(next_worker_count(5, 0.08, 800.0, &p), 6);
        // Middle ground: unchanged
        assert_eq!(next_worker_count(5, 0.15, 3000.0, &p), 5);
        // Floor and cap respected
        assert_eq!(next_worker_count(2, 0.9, 500.0, &p), 2);
        assert_eq!(next_worker_count(20, 0.0, 100.0, &p), 20);
    }
}
