// Run configuration: typed options, defaults, env-marker resolution

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::errors::HarvestError;
use super::models::{CaptionFormat, DetectMode, SubtitlePreference};
use super::notify::WebhookConfig;

/// Proxy pool configuration. Entries are literal proxy URLs or
/// `file:<path>` indirections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub entries: Vec<String>,
    pub cool_down_sec: u64,
    pub max_fails: u32,
    pub window: usize,
    pub blacklist_recovery_sec: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            cool_down_sec: 300,
            max_fails: 2,
            window: 30,
            blacklist_recovery_sec: 600,
        }
    }
}

/// Thresholds for the adaptive concurrency controller. Empirically chosen
/// defaults, kept configurable rather than hard-coded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveTuning {
    /// Error rate below which workers grow by 2 (with ok latency)
    pub err_low: f64,
    /// Error rate above which workers shrink by 2
    pub err_high: f64,
    /// Latency below this plus err < 10% grows workers by 1
    pub latency_fast_ms: f64,
    /// Latency ceiling for the +2 growth branch
    pub latency_ok_ms: f64,
    /// Latency above this shrinks workers by 1
    pub latency_slow_ms: f64,
}

impl Default for AdaptiveTuning {
    fn default() -> Self {
        Self {
            err_low: 0.05,
            err_high: 0.25,
            latency_fast_ms: 1000.0,
            latency_ok_ms: 2000.0,
            latency_slow_ms: 5000.0,
        }
    }
}

/// Full configuration for one harvesting run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub output_root: PathBuf,

    // Concurrency / pacing
    pub max_workers: usize,
    pub sleep_between: f64,
    pub retry_times: u32,
    pub batch_size: usize,
    pub adaptive_concurrency: bool,
    pub min_workers: usize,
    pub max_workers_cap: usize,
    pub adaptive: AdaptiveTuning,

    // Admission control
    pub req_rate: f64,
    pub breaker_threshold: u32,
    pub breaker_cooldown_sec: f64,

    // Detection
    pub detect_mode: DetectMode,
    /// Skip channel items at or below the persisted upload-date watermark
    pub incremental_detect: bool,
    /// 0 means unbounded
    pub max_items: usize,

    // Download
    pub do_download: bool,
    pub download_langs: Vec<String>,
    pub download_prefer: SubtitlePreference,
    pub download_format: CaptionFormat,
    /// Skip languages that already have a valid local caption file
    pub incremental_download: bool,
    pub force_refresh: bool,
    /// Preferred languages tried before `download_langs` during selection
    pub preferred_langs: Option<Vec<String>>,

    // Run semantics
    pub dry_run: bool,

    // Network identity
    pub user_agent: String,
    pub cookie_file: String,

    pub proxy: ProxyConfig,
    pub webhook: WebhookConfig,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            output_root: dirs::download_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("caption-harvester"),
            max_workers: 5,
            sleep_between: 0.5,
            retry_times: 2,
            batch_size: 0,
            adaptive_concurrency: false,
            min_workers: 2,
            max_workers_cap: 20,
            adaptive: AdaptiveTuning::default(),
            req_rate: 4.0,
            breaker_threshold: 8,
            breaker_cooldown_sec: 120.0,
            detect_mode: DetectMode::Standard,
            incremental_detect: true,
            max_items: 0,
            do_download: false,
            download_langs: vec!["zh".to_string(), "en".to_string()],
            download_prefer: SubtitlePreference::Both,
            download_format: CaptionFormat::Srt,
            incremental_download: true,
            force_refresh: false,
            preferred_langs: None,
            dry_run: false,
            user_agent: String::new(),
            cookie_file: String::new(),
            proxy: ProxyConfig::default(),
            webhook: WebhookConfig::default(),
        }
    }
}

impl HarvestConfig {
    /// Load from a JSON file and resolve env markers. Returns the config
    /// plus any configuration warnings (missing environment variables).
    pub fn load(path: &Path) -> Result<(Self, Vec<String>), HarvestError> {
        let body = fs::read_to_string(path)?;
        let mut cfg: Self = serde_json::from_str(&body)?;
        let warnings = cfg.resolve_env_markers();
        Ok((cfg, warnings))
    }

    /// Resolve `env:NAME` markers in string-valued fields. A missing
    /// variable yields a `missing_env` warning instead of a silent empty
    /// string, so misconfiguration is visible in the run's warnings file.
    pub fn resolve_env_markers(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();
        resolve_one(&mut self.user_agent, &mut warnings);
        resolve_one(&mut self.cookie_file, &mut warnings);
        resolve_one(&mut self.webhook.url, &mut warnings);
        for entry in &mut self.proxy.entries {
            resolve_one(entry, &mut warnings);
        }
        warnings
    }
}

fn resolve_one(value: &mut String, warnings: &mut Vec<String>) {
    if let Some(name) = value.strip_prefix("env:") {
        let name = name.trim().to_string();
        match std::env::var(&name) {
            Ok(v) if !v.is_empty() => *value = v,
            _ => {
                warnings.push(format!("missing_env\t{name}"));
                value.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_expected() {
        let cfg = HarvestConfig::default();
        assert_eq!(cfg.max_workers, 5);
        assert_eq!(cfg.retry_times, 2);
        assert_eq!(cfg.download_langs, vec!["zh", "en"]);
        assert_eq!(cfg.req_rate, 4.0);
        assert_eq!(cfg.breaker_threshold, 8);
        assert_eq!(cfg.breaker_cooldown_sec, 120.0);
        assert!(cfg.incremental_detect);
        assert!(cfg.incremental_download);
        assert!(!cfg.dry_run);
    }

    #[test]
    fn test_env_marker_resolution() {
        std::env::set_var("CAPTION_HARVESTER_TEST_UA", "agent/1.0");
        let mut cfg = HarvestConfig {
            user_agent: "env:CAPTION_HARVESTER_TEST_UA".to_string(),
            cookie_file: "env:CAPTION_HARVESTER_TEST_MISSING".to_string(),
            ..Default::default()
        };
        let warnings = cfg.resolve_env_markers();
        assert_eq!(cfg.user_agent, "agent/1.0");
        assert_eq!(cfg.cookie_file, "");
        assert_eq!(
            warnings,
            vec!["missing_env\tCAPTION_HARVESTER_TEST_MISSING".to_string()]
        );
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let cfg: HarvestConfig =
            serde_json::from_str(r#"{"max_workers": 9, "download_format": "txt"}"#).unwrap();
        assert_eq!(cfg.max_workers, 9);
        assert_eq!(cfg.download_format, CaptionFormat::Txt);
        assert_eq!(cfg.retry_times, 2);
    }
}
