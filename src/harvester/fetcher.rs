// Caption retrieval: negotiation, incremental skip, provider fallback

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::config::HarvestConfig;
use super::control::RunControls;
use super::convert::convert_to_txt;
use super::errors::{ErrorKind, ProviderError};
use super::models::{CaptionFile, CaptionFormat, SubtitlePreference};
use super::net::{CircuitBreaker, ProxyPool, RateLimiter};
use super::providers::{CaptionRequest, MetadataProvider, ProviderContext, TranscriptProvider};
use super::utils::{has_min_effective_lines, norm_lang};

/// A caption file below this many non-empty lines is treated as absent.
pub const MIN_EFFECTIVE_LINES: usize = 5;

const MAX_BACKOFF_SECS: f64 = 16.0;

/// Download policy for one run.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    /// Requested languages, normalized (`zh`, `en`, ...)
    pub languages: Vec<String>,
    pub prefer: SubtitlePreference,
    pub format: CaptionFormat,
    pub incremental: bool,
    pub force_refresh: bool,
    pub retry_times: u32,
    pub sleep_between: f64,
    pub max_workers: usize,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            languages: vec!["zh".to_string(), "en".to_string()],
            prefer: SubtitlePreference::Both,
            format: CaptionFormat::Srt,
            incremental: true,
            force_refresh: false,
            retry_times: 2,
            sleep_between: 0.5,
            max_workers: 5,
        }
    }
}

impl From<&HarvestConfig> for FetchPolicy {
    fn from(cfg: &HarvestConfig) -> Self {
        Self {
            languages: cfg
                .download_langs
                .iter()
                .map(|l| norm_lang(l))
                .filter(|l| !l.is_empty())
                .collect(),
            prefer: cfg.download_prefer,
            format: cfg.download_format,
            incremental: cfg.incremental_download,
            force_refresh: cfg.force_refresh,
            retry_times: cfg.retry_times,
            sleep_between: cfg.sleep_between,
            max_workers: cfg.max_workers,
        }
    }
}

/// One item queued for caption retrieval. `languages` is the per-item
/// selection decided by the orchestrator (requested langs intersected with
/// what the probe saw, with fallbacks applied).
#[derive(Debug, Clone)]
pub struct FetchItem {
    pub url: String,
    pub video_id: String,
    pub languages: Vec<String>,
    pub out_dir: PathBuf,
}

/// Outcome classification of one fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStatus {
    Downloaded,
    /// Every requested language already had a valid local file
    Skipped,
    /// Nothing materialized and the last error was this kind
    Failed(ErrorKind),
    Stopped,
}

/// Result of fetching captions for one item. `files` may be a partial set
/// when some languages succeeded and others did not; the misses are listed
/// in `warnings`.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub url: String,
    pub video_id: String,
    pub status: FetchStatus,
    pub files: Vec<CaptionFile>,
    pub warnings: Vec<String>,
    pub error_text: Option<String>,
    pub attempts: u32,
}

impl FetchOutcome {
    fn skipped(item: &FetchItem) -> Self {
        Self {
            url: item.url.clone(),
            video_id: item.video_id.clone(),
            status: FetchStatus::Skipped,
            files: Vec::new(),
            warnings: Vec::new(),
            error_text: None,
            attempts: 0,
        }
    }

    fn stopped(item: &FetchItem) -> Self {
        Self {
            status: FetchStatus::Stopped,
            ..Self::skipped(item)
        }
    }
}

/// Retrieves caption files for probed items. Provider A does the heavy
/// lifting; provider B fills in languages A could not deliver. Shares the
/// run's rate limiter, proxy pool and breaker with the probe.
#[derive(Clone)]
pub struct CaptionFetcher {
    provider: Arc<dyn MetadataProvider>,
    transcripts: Option<Arc<dyn TranscriptProvider>>,
    limiter: Arc<RateLimiter>,
    pool: Option<Arc<ProxyPool>>,
    breaker: Arc<CircuitBreaker>,
    controls: RunControls,
    ctx: ProviderContext,
    policy: FetchPolicy,
}

impl CaptionFetcher {
    pub fn new(
        provider: Arc<dyn MetadataProvider>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        policy: FetchPolicy,
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

    /// Fetch all items through a bounded worker pool, completion order.
    pub async fn fetch_many(&self, items: &[FetchItem]) -> Vec<FetchOutcome> {
        let sem = Arc::new(Semaphore::new(self.policy.max_workers.max(1)));
        let mut join = JoinSet::new();
        for item in items {
            let fetcher = self.clone();
            let sem = sem.clone();
            let item = item.clone();
            join.spawn(async move {
                let _permit = match sem.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return FetchOutcome::stopped(&item),
                };
                fetcher.fetch_one(&item).await
            });
        }
        let mut out = Vec::with_capacity(items.len());
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok(r) => out.push(r),
                Err(e) => {
                    tracing::warn!(target: "harvester::fetch", error = %e, "fetch worker panicked");
                }
            }
        }
        out
    }

    /// Fetch captions for one item.
    pub async fn fetch_one(&self, item: &FetchItem) -> FetchOutcome {
        if self.controls.is_stopped() {
            return FetchOutcome::stopped(item);
        }

        let ext = self.policy.format.as_str();
        let mut wanted: Vec<String> = item.languages.clone();
        if !self.policy.force_refresh && self.policy.incremental {
            let valid = existing_valid_langs(&item.out_dir, &item.video_id, ext);
            wanted.retain(|l| !valid.contains(l));
            if wanted.is_empty() {
                return FetchOutcome::skipped(item);
            }
        }

        if let Err(e) = fs::create_dir_all(&item.out_dir) {
            return FetchOutcome {
                url: item.url.clone(),
                video_id: item.video_id.clone(),
                status: FetchStatus::Failed(ErrorKind::Other),
                files: Vec::new(),
                warnings: Vec::new(),
                error_text: Some(e.to_string()),
                attempts: 0,
            };
        }

        let mut warnings = Vec::new();
        let mut files = Vec::new();
        let mut attempts = 0;
        let mut last_err: Option<ProviderError> = None;

        match self
            .fetch_via_metadata(item, &wanted, &mut warnings, &mut attempts)
            .await
        {
            Ok(mut got) => files.append(&mut got),
            Err(e) => last_err = Some(e),
        }

        // Languages still without a valid file go to the fallback provider.
        let missing = missing_after(&item.out_dir, &item.video_id, ext, &wanted);
        if !missing.is_empty() {
            if let Some(mut got) = self.fetch_via_transcripts(item, &missing, &mut warnings).await
            {
                files.append(&mut got);
            }
        }

        let missing = missing_after(&item.out_dir, &item.video_id, ext, &wanted);
        for lang in &missing {
            warnings.push(format!("lang_unavailable\t{}\t{}", item.video_id, lang));
        }

        if files.is_empty() {
            // A provider error with nothing materialized fails the item.
            // No error and no files means nothing was advertised for the
            // requested languages; the misses are already in warnings.
            if let Some(e) = last_err {
                return FetchOutcome {
                    url: item.url.clone(),
                    video_id: item.video_id.clone(),
                    status: FetchStatus::Failed(e.kind),
                    files,
                    warnings,
                    error_text: Some(e.truncated(200).to_string()),
                    attempts,
                };
            }
            return FetchOutcome {
                url: item.url.clone(),
                video_id: item.video_id.clone(),
                status: FetchStatus::Skipped,
                files,
                warnings,
                error_text: None,
                attempts,
            };
        }

        FetchOutcome {
            url: item.url.clone(),
            video_id: item.video_id.clone(),
            status: FetchStatus::Downloaded,
            files,
            warnings,
            error_text: None,
            attempts,
        }
    }

    /// Provider A path: list advertised tracks, negotiate concrete codes,
    /// fetch, verify what materialized. Retries with kind-specific backoff;
    /// terminal kinds short-circuit.
    async fn fetch_via_metadata(
        &self,
        item: &FetchItem,
        wanted: &[String],
        warnings: &mut Vec<String>,
        attempts: &mut u32,
    ) -> Result<Vec<CaptionFile>, ProviderError> {
        let base = self.policy.sleep_between.max(0.2);
        let mut attempt: u32 = 0;

        loop {
            if self.controls.is_stopped() {
                return Ok(Vec::new());
            }
            self.controls.wait_if_paused().await;

            attempt += 1;
            *attempts = attempt;
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
            let result = async {
                let tracks = self.provider.list_caption_tracks(&item.url, &ctx).await?;
                let advertised = advertised_for(&tracks, self.policy.prefer);
                let sources: Vec<String> = advertised
                    .iter()
                    .map(|k| norm_lang(k))
                    .filter(|l| !l.is_empty())
                    .collect();

                let mut codes = Vec::new();
                for lang in wanted {
                    match negotiate_track(lang, &advertised, &sources) {
                        Some(code) => {
                            if &code != lang {
                                warnings
                                    .push(format!("lang_fallback\t{}\t{lang}->{code}", item.video_id));
                            }
                            codes.push(code);
                        }
                        None => {
                            tracing::debug!(
                                target: "harvester::fetch",
                                video_id = %item.video_id,
                                lang = %lang,
                                "no advertised track for language"
                            );
                        }
                    }
                }
                if codes.is_empty() {
                    return Ok(Vec::new());
                }

                let req = CaptionRequest {
                    url: item.url.clone(),
                    video_id: item.video_id.clone(),
                    out_dir: item.out_dir.clone(),
                    languages: codes,
                    prefer: self.policy.prefer,
                    format: self.policy.format,
                };
                self.provider.fetch_captions(&req, &ctx).await
            }
            .await;

            let latency = t0.elapsed().as_secs_f64() * 1000.0;
            match result {
                Ok(fetched) => {
                    if let (Some(pool), false) = (&self.pool, proxy.is_empty()) {
                        pool.ok(&proxy, latency);
                    }
                    self.breaker.record(true, None);
                    return Ok(self.verify_and_convert(item, fetched));
                }
                Err(e) => {
                    if let (Some(pool), false) = (&self.pool, proxy.is_empty()) {
                        pool.bad(&proxy, latency);
                    }
                    if e.kind.is_trippable() {
                        self.breaker.record(false, Some(e.kind));
                    }
                    if e.kind.is_terminal() || attempt > self.policy.retry_times {
                        return Err(e);
                    }
                    let delay = (base * e.kind.backoff_factor().powi(attempt as i32 - 1))
                        .min(MAX_BACKOFF_SECS);
                    let jitter = rand::thread_rng().gen_range(0.0..(base * 0.3).max(0.001));
                    self.controls
                        .nap(Duration::from_secs_f64(delay + jitter))
                        .await;
                }
            }
        }
    }

    /// Provider B fallback: per-language transcript retrieval. Payloads are
    /// SRT; they land under the same naming scheme as provider A's files.
    async fn fetch_via_transcripts(
        &self,
        item: &FetchItem,
        missing: &[String],
        warnings: &mut Vec<String>,
    ) -> Option<Vec<CaptionFile>> {
        let tp = self.transcripts.as_ref()?;
        if item.video_id.is_empty() {
            return None;
        }

        let mut files = Vec::new();
        for lang in missing {
            if self.controls.is_stopped() {
                break;
            }
            self.limiter.acquire().await;
            match tp.fetch_transcript(&item.video_id, lang).await {
                Ok(payload) if !payload.trim().is_empty() => {
                    let srt = item.out_dir.join(format!("{}.{lang}.srt", item.video_id));
                    if write_atomic(&srt, &payload).is_err() {
                        continue;
                    }
                    match self.finalize_payload(item, &srt, lang) {
                        Some(file) => files.push(file),
                        None => warnings.push(format!(
                            "too_short\t{}\t{lang}",
                            item.video_id
                        )),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(
                        target: "harvester::fetch",
                        provider = tp.name(),
                        video_id = %item.video_id,
                        lang = %lang,
                        error = %e,
                        "transcript fallback failed"
                    );
                }
            }
        }
        Some(files)
    }

    /// Verify files reported by provider A actually exist with enough
    /// content, converting to plain text when that is the target format.
    fn verify_and_convert(&self, item: &FetchItem, fetched: Vec<CaptionFile>) -> Vec<CaptionFile> {
        let mut out = Vec::new();
        for f in fetched {
            if !has_min_effective_lines(&f.path, MIN_EFFECTIVE_LINES) {
                let _ = fs::remove_file(&f.path);
                continue;
            }
            if self.policy.format == CaptionFormat::Txt && f.format != CaptionFormat::Txt {
                match self.finalize_payload(item, &f.path, &f.lang) {
                    Some(file) => out.push(file),
                    None => {}
                }
            } else {
                out.push(f);
            }
        }
        out
    }

    /// Turn one on-disk SRT payload into the final artifact for `lang`.
    /// For txt runs this converts and drops the intermediate payload.
    fn finalize_payload(&self, item: &FetchItem, payload: &Path, lang: &str) -> Option<CaptionFile> {
        if !has_min_effective_lines(payload, MIN_EFFECTIVE_LINES) {
            let _ = fs::remove_file(payload);
            return None;
        }
        if self.policy.format != CaptionFormat::Txt {
            return Some(CaptionFile {
                path: payload.to_path_buf(),
                lang: lang.to_string(),
                format: self.policy.format,
            });
        }
        let txt = item.out_dir.join(format!("{}.{lang}.txt", item.video_id));
        match convert_to_txt(payload, &txt) {
            Ok(()) if has_min_effective_lines(&txt, MIN_EFFECTIVE_LINES) => {
                let _ = fs::remove_file(payload);
                Some(CaptionFile {
                    path: txt,
                    lang: lang.to_string(),
                    format: CaptionFormat::Txt,
                })
            }
            Ok(()) => {
                let _ = fs::remove_file(&txt);
                let _ = fs::remove_file(payload);
                None
            }
            Err(e) => {
                tracing::warn!(
                    target: "harvester::fetch",
                    video_id = %item.video_id,
                    lang = %lang,
                    error = %e,
                    "txt conversion failed"
                );
                None
            }
        }
    }
}

/// Advertised track keys permitted by the subtitle preference, lowercased.
fn advertised_for(
    tracks: &super::providers::CaptionTracks,
    prefer: SubtitlePreference,
) -> HashSet<String> {
    let mut out = HashSet::new();
    if prefer.wants_manual() {
        out.extend(tracks.manual.iter().map(|k| k.to_lowercase()));
    }
    if prefer.wants_auto() {
        out.extend(tracks.auto.iter().map(|k| k.to_lowercase()));
    }
    out.retain(|k| !k.is_empty());
    out
}

/// Well-known regional variants tried before generic prefix matching.
/// Order encodes preference.
fn variant_candidates(lang: &str) -> Vec<String> {
    let base: &[&str] = match lang {
        "zh" => &["zh", "zh-tw", "zh-hans", "zh-hant", "zh-cn"],
        "en" => &["en", "en-us", "en-gb", "en-orig"],
        other => return vec![other.to_string()],
    };
    base.iter().map(|s| s.to_string()).collect()
}

/// Pick a concrete advertised track for a requested (normalized) language.
///
/// Priority: the known variant table, then translated tracks built as
/// `target-source` from the languages actually present, then any advertised
/// key whose primary subtag matches.
fn negotiate_track(
    lang: &str,
    advertised: &HashSet<String>,
    sources: &[String],
) -> Option<String> {
    for cand in variant_candidates(lang) {
        if advertised.contains(&cand) {
            return Some(cand);
        }
    }
    for src in sources {
        if src != lang {
            let translated = format!("{lang}-{src}");
            if advertised.contains(&translated) {
                return Some(translated);
            }
        }
    }
    let mut general: Vec<&String> = advertised
        .iter()
        .filter(|k| norm_lang(k) == lang)
        .collect();
    general.sort();
    general.first().map(|s| (*s).clone())
}

/// Normalized languages that already have a valid file for this video in
/// `out_dir`. Scans `<vid>.<code>.<ext>` so regional and translated codes
/// satisfy their base language.
fn existing_valid_langs(out_dir: &Path, video_id: &str, ext: &str) -> HashSet<String> {
    let mut out = HashSet::new();
    if video_id.is_empty() {
        return out;
    }
    let prefix = format!("{video_id}.");
    let suffix = format!(".{ext}");
    let entries = match fs::read_dir(out_dir) {
        Ok(e) => e,
        Err(_) => return out,
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(&prefix) || !name.ends_with(&suffix) {
            continue;
        }
        let code = &name[prefix.len()..name.len() - suffix.len()];
        if code.is_empty() {
            continue;
        }
        if has_min_effective_lines(&entry.path(), MIN_EFFECTIVE_LINES) {
            let norm = norm_lang(code);
            if !norm.is_empty() {
                out.insert(norm);
            }
        }
    }
    out
}

fn missing_after(out_dir: &Path, video_id: &str, ext: &str, wanted: &[String]) -> Vec<String> {
    let valid = existing_valid_langs(out_dir, video_id, ext);
    wanted
        .iter()
        .filter(|l| !valid.contains(*l))
        .cloned()
        .collect()
}

fn write_atomic(dst: &Path, body: &str) -> std::io::Result<()> {
    let mut tmp = dst.as_os_str().to_owned();
    tmp.push(".part");
    let tmp = PathBuf::from(tmp);
    if let Err(e) = fs::write(&tmp, body).and_then(|_| fs::rename(&tmp, dst)) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}
