// Rotating proxy pool with health scoring, auto-blacklist and recovery

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Score below which a proxy is blacklisted once enough samples exist.
const SCORE_BLACKLIST_THRESHOLD: f64 = 0.3;
/// Latency prior (ms) used before any latency sample arrives.
const LATENCY_PRIOR_MS: f64 = 1200.0;
/// Latency normalization knee (ms): score 0.5 at this latency.
const LATENCY_KNEE_MS: f64 = 800.0;

#[derive(Debug, Clone)]
pub struct ProxyPoolOptions {
    /// Short-term pause after `max_fail` consecutive raw failures
    pub cool_down: Duration,
    pub max_fail: u32,
    /// Rolling window size for outcome/latency samples
    pub window: usize,
    /// Longer-term reputational pause once the score collapses
    pub blacklist_recovery: Duration,
}

impl Default for ProxyPoolOptions {
    fn default() -> Self {
        Self {
            cool_down: Duration::from_secs(300),
            max_fail: 2,
            window: 30,
            blacklist_recovery: Duration::from_secs(600),
        }
    }
}

struct ProxyState {
    fails: u32,
    cool_until: Option<Instant>,
    blacklisted: bool,
    blacklist_until: Option<Instant>,
    outcomes: VecDeque<bool>,
    latencies: VecDeque<f64>,
    avg_latency: Option<f64>,
    score: f64,
    success: u64,
    total: u64,
}

impl ProxyState {
    fn new() -> Self {
        Self {
            fails: 0,
            cool_until: None,
            blacklisted: false,
            blacklist_until: None,
            outcomes: VecDeque::new(),
            latencies: VecDeque::new(),
            avg_latency: None,
            score: 1.0,
            success: 0,
            total: 0,
        }
    }
}

/// Per-proxy stats exposed for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ProxySnapshot {
    pub blacklisted: bool,
    pub cooling_secs: f64,
    pub blacklist_secs: f64,
    pub success_rate: Option<f64>,
    pub latency_ms: Option<f64>,
    pub score: f64,
    pub success: u64,
    pub total: u64,
}

struct PoolInner {
    items: Vec<String>,
    state: HashMap<String, ProxyState>,
    cursor: usize,
}

/// Health-scored proxy pool. Cooling is a short circuit-style pause after
/// consecutive raw failures; blacklisting is a slower reputational judgment
/// over a rolling window. Transient failures and systemic bans have
/// different time constants, hence both mechanisms.
///
/// `get()` never blocks: with no proxy available the caller falls back to a
/// direct connection.
pub struct ProxyPool {
    inner: Mutex<PoolInner>,
    opts: ProxyPoolOptions,
}

impl ProxyPool {
    /// Build from raw entries. Entries are literal proxy URLs or
    /// `file:<path>` indirections (one proxy per line); duplicates are
    /// dropped. Returns `None` when nothing usable remains.
    pub fn from_entries(entries: &[String], opts: ProxyPoolOptions) -> Option<Self> {
        let items = Self::parse_entries(entries);
        if items.is_empty() {
            return None;
        }
        let state = items
            .iter()
            .map(|p| (p.clone(), ProxyState::new()))
            .collect();
        Some(Self {
            inner: Mutex::new(PoolInner {
                items,
                state,
                cursor: 0,
            }),
            opts,
        })
    }

    /// Expand `file:` indirections and deduplicate, preserving order.
    pub fn parse_entries(entries: &[String]) -> Vec<String> {
        let mut out = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for raw in entries {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            if let Some(path) = raw
                .to_lowercase()
                .starts_with("file:")
                .then(|| raw[5..].trim())
            {
                if let Ok(body) = fs::read_to_string(path) {
                    for ln in body.lines() {
                        let v = ln.trim();
                        if !v.is_empty() && seen.insert(v.to_string()) {
                            out.push(v.to_string());
                        }
                    }
                }
            } else if seen.insert(raw.to_string()) {
                out.push(raw.to_string());
            }
        }
        out
    }

    /// Highest-scoring currently available proxy, rotating among the
    /// sorted candidates, or `None` when all are cooling or blacklisted.
    pub fn get(&self) -> Option<String> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        let mut avail: Vec<String> = Vec::new();
        // Split borrow: collect availability first, clearing expired
        // blacklists as we go.
        let items = inner.items.clone();
        for p in &items {
            let st = match inner.state.get_mut(p) {
                Some(st) => st,
                None => continue,
            };
            if st.blacklisted && st.blacklist_until.map_or(true, |u| u <= now) {
                st.blacklisted = false;
                st.blacklist_until = None;
                tracing::info!(target: "harvester::proxy", proxy = %truncate(p), "proxy recovered from blacklist");
            }
            let cooling = st.cool_until.map_or(false, |u| u > now);
            if !cooling && !st.blacklisted {
                avail.push(p.clone());
            }
        }
        if avail.is_empty() {
            return None;
        }
        avail.sort_by(|a, b| {
            let sa = inner.state.get(a).map_or(0.0, |s| s.score);
            let sb = inner.state.get(b).map_or(0.0, |s| s.score);
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        });
        inner.cursor = (inner.cursor + 1) % avail.len();
        Some(avail[inner.cursor].clone())
    }

    /// Feed one successful outcome; resets the consecutive-failure count.
    pub fn ok(&self, proxy: &str, latency_ms: f64) {
        if proxy.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let window = self.opts.window;
        let recovery = self.opts.blacklist_recovery;
        if let Some(st) = inner.state.get_mut(proxy) {
            st.fails = 0;
            push_outcome(st, proxy, true, latency_ms, window, recovery);
        }
    }

    /// Feed one failed outcome; `max_fail` consecutive failures start the
    /// short-term cooling pause.
    pub fn bad(&self, proxy: &str, latency_ms: f64) {
        if proxy.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let window = self.opts.window;
        let recovery = self.opts.blacklist_recovery;
        let (max_fail, cool) = (self.opts.max_fail, self.opts.cool_down);
        if let Some(st) = inner.state.get_mut(proxy) {
            st.fails += 1;
            push_outcome(st, proxy, false, latency_ms, window, recovery);
            if st.fails >= max_fail {
                st.cool_until = Some(Instant::now() + cool);
                st.fails = 0;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .items
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stats snapshot for run-end reporting.
    pub fn snapshot(&self) -> HashMap<String, ProxySnapshot> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        inner
            .items
            .iter()
            .filter_map(|p| {
                let st = inner.state.get(p)?;
                let success_rate = (!st.outcomes.is_empty()).then(|| {
                    st.outcomes.iter().filter(|&&o| o).count() as f64 / st.outcomes.len() as f64
                });
                Some((
                    p.clone(),
                    ProxySnapshot {
                        blacklisted: st.blacklisted,
                        cooling_secs: st
                            .cool_until
                            .map_or(0.0, |u| u.saturating_duration_since(now).as_secs_f64()),
                        blacklist_secs: st
                            .blacklist_until
                            .map_or(0.0, |u| u.saturating_duration_since(now).as_secs_f64()),
                        success_rate,
                        latency_ms: st.avg_latency,
                        score: st.score,
                        success: st.success,
                        total: st.total,
                    },
                ))
            })
            .collect()
    }
}

/// Push an outcome into the rolling windows and recompute the score:
/// `score = 0.7 * success_rate + 0.3 * latency_score`. A proxy is
/// blacklisted exactly when the score drops below the threshold with at
/// least `window / 2` samples recorded.
fn push_outcome(
    st: &mut ProxyState,
    proxy: &str,
    ok: bool,
    latency_ms: f64,
    window: usize,
    recovery: Duration,
) {
    st.total += 1;
    if ok {
        st.success += 1;
    }

    st.outcomes.push_back(ok);
    while st.outcomes.len() > window {
        st.outcomes.pop_front();
    }

    if latency_ms > 0.0 {
        st.latencies.push_back(latency_ms);
        while st.latencies.len() > window {
            st.latencies.pop_front();
        }
        st.avg_latency =
            Some(st.latencies.iter().sum::<f64>() / st.latencies.len() as f64);
    }

    let rate = if st.outcomes.is_empty() {
        1.0
    } else {
        st.outcomes.iter().filter(|&&o| o).count() as f64 / st.outcomes.len() as f64
    };
    let latency = st.avg_latency.unwrap_or(LATENCY_PRIOR_MS);
    let latency_score = 1.0 / (1.0 + latency / LATENCY_KNEE_MS);
    st.score = 0.7 * rate + 0.3 * latency_score;

    if st.score < SCORE_BLACKLIST_THRESHOLD && st.outcomes.len() >= window / 2 && !st.blacklisted {
        st.blacklisted = true;
        st.blacklist_until = Some(Instant::now() + recovery);
        tracing::warn!(
            target: "harvester::proxy",
            proxy = %truncate(proxy),
            score = st.score,
            "proxy score collapsed, blacklisting"
        );
    }
}

fn truncate(p: &str) -> &str {
    let end = p
        .char_indices()
        .nth(20)
        .map(|(i, _)| i)
        .unwrap_or(p.len());
    &p[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(entries: &[&str], opts: ProxyPoolOptions) -> ProxyPool {
        let entries: Vec<String> = entries.iter().map(|s| s.to_string()).collect();
        ProxyPool::from_entries(&entries, opts).unwrap()
    }

    #[test]
    fn test_empty_entries_yield_no_pool() {
        assert!(ProxyPool::from_entries(&[], ProxyPoolOptions::default()).is_none());
        assert!(ProxyPool::from_entries(
            &["   ".to_string()],
            ProxyPoolOptions::default()
        )
        .is_none());
    }

    #[test]
    fn test_dedup_on_load() {
        let items = ProxyPool::parse_entries(&[
            "socks5://a:1080".to_string(),
            "socks5://a:1080".to_string(),
            "socks5://b:1080".to_string(),
        ]);
        assert_eq!(items, vec!["socks5://a:1080", "socks5://b:1080"]);
    }

    #[test]
    fn test_file_indirection() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("proxies.txt");
        std::fs::write(&list, "socks5://x:1\n\nsocks5://y:2\nsocks5://x:1\n").unwrap();
        let items =
            ProxyPool::parse_entries(&[format!("file:{}", list.display())]);
        assert_eq!(items, vec!["socks5://x:1", "socks5://y:2"]);
    }

    #[test]
    fn test_score_stays_in_unit_interval() {
        // Property over synthetic outcome histories.
        let p = pool(&["p1"], ProxyPoolOptions::default());
        let outcomes = [true, false, false, true, false, false, false, true];
        let latencies = [50.0, 12_000.0, 0.0, 300.0, 9_999.0, 1.0, 700.0, 80.0];
        for i in 0..200 {
            let ok = outcomes[i % outcomes.len()];
            let lat = latencies[i % latencies.len()];
            if ok {
                p.ok("p1", lat);
            } else {
                p.bad("p1", lat);
            }
            let snap = p.snapshot().remove("p1").unwrap();
            assert!((0.0..=1.0).contains(&snap.score), "score {}", snap.score);
        }
    }

    #[test]
    fn test_blacklist_requires_half_window_of_samples() {
        let opts = ProxyPoolOptions {
            window: 10,
            max_fail: 100, // keep cooling out of the way
            ..Default::default()
        };
        let p = pool(&["p1"], opts);
        // 4 failures: score is already terrible but samples < window/2.
        for _ in 0..4 {
            p.bad("p1", 5_000.0);
        }
        assert!(!p.snapshot()["p1"].blacklisted);
        // Fifth sample crosses window/2 with score < 0.3.
        p.bad("p1", 5_000.0);
        let snaps = p.snapshot();
        let snap = &snaps["p1"];
        assert!(snap.score < 0.3);
        assert!(snap.blacklisted);
        assert!(p.get().is_none());
    }

    #[test]
    fn test_blacklist_auto_recovery() {
        let opts = ProxyPoolOptions {
            window: 4,
            max_fail: 100,
            blacklist_recovery: Duration::from_millis(20),
            ..Default::default()
        };
        let p = pool(&["p1"], opts);
        for _ in 0..4 {
            p.bad("p1", 8_000.0);
        }
        assert!(p.get().is_none());
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(p.get().as_deref(), Some("p1"));
    }

    #[test]
    fn test_consecutive_failures_trigger_cooling() {
        let opts = ProxyPoolOptions {
            max_fail: 2,
            cool_down: Duration::from_secs(300),
            ..Default::default()
        };
        let p = pool(&["p1", "p2"], opts);
        p.bad("p1", 100.0);
        p.bad("p1", 100.0);
        // p1 cooling; only p2 remains available.
        for _ in 0..5 {
            assert_eq!(p.get().as_deref(), Some("p2"));
        }
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let opts = ProxyPoolOptions {
            max_fail: 2,
            ..Default::default()
        };
        let p = pool(&["p1"], opts);
        p.bad("p1", 100.0);
        p.ok("p1", 100.0);
        p.bad("p1", 100.0);
        // Never two consecutive failures, so never cooling.
        assert_eq!(p.get().as_deref(), Some("p1"));
    }

    #[test]
    fn test_get_prefers_higher_score() {
        let p = pool(&["good", "bad"], ProxyPoolOptions::default());
        for _ in 0..6 {
            p.ok("good", 100.0);
        }
        p.bad("bad", 4_000.0);
        // Rotation cursor moves over the sorted list; with two distinct
        // scores the better proxy is returned at least as often.
        let mut good = 0;
        for _ in 0..10 {
            if p.get().as_deref() == Some("good") {
                good += 1;
            }
        }
        assert!(good >= 5);
    }
}
