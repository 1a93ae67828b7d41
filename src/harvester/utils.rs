// URL / language / filesystem helpers shared across the pipeline

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use time::macros::format_description;
use time::OffsetDateTime;

lazy_static! {
    static ref ID_RE: Regex = Regex::new(r"^[A-Za-z0-9_-]{11}$").unwrap();
    static ref WATCH_V_RE: Regex = Regex::new(r"[?&]v=([A-Za-z0-9_-]{11})").unwrap();
}

/// Extract the canonical 11-character video id from any supported URL shape.
///
/// Priority order: `watch?v=`, `youtu.be/`, `/shorts/`, `/live/`, `/embed/`,
/// `/v/`, then the trailing path segment. Query strings and fragments are
/// stripped before matching.
pub fn extract_video_id(url: &str) -> Option<String> {
    if url.is_empty() {
        return None;
    }
    let url = url.split('#').next().unwrap_or("");

    // watch?v=ID
    if let Some(caps) = WATCH_V_RE.captures(url) {
        return Some(caps[1].to_string());
    }

    // youtu.be/ID
    if let Some(idx) = url.find("youtu.be/") {
        let seg = url[idx + "youtu.be/".len()..]
            .split(['/', '?'])
            .next()
            .unwrap_or("");
        if ID_RE.is_match(seg) {
            return Some(seg.to_string());
        }
    }

    // Path-based shapes
    let path = url
        .split("://")
        .nth(1)
        .and_then(|rest| rest.find('/').map(|i| &rest[i..]))
        .unwrap_or(url);
    let path = path.split('?').next().unwrap_or("");
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();

    if parts.len() >= 2 {
        let head = parts[0].to_lowercase();
        if matches!(head.as_str(), "shorts" | "live" | "embed" | "v") && ID_RE.is_match(parts[1]) {
            return Some(parts[1].to_string());
        }
    }

    // Fallback: trailing path segment
    if let Some(tail) = parts.last() {
        if ID_RE.is_match(tail) {
            return Some(tail.to_string());
        }
    }

    None
}

/// Canonical watch URL for a video id, or `None` if no id can be extracted.
pub fn normalize_url(url: &str) -> Option<String> {
    extract_video_id(url).map(|vid| format!("https://www.youtube.com/watch?v={vid}"))
}

/// Canonicalize a channel URL to its `/videos` page. Used as the stable
/// channel-index key.
pub fn ensure_channel_videos_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let path = trimmed
        .split("://")
        .nth(1)
        .and_then(|rest| rest.find('/').map(|i| &rest[i + 1..]))
        .unwrap_or("");
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();

    if parts.len() == 1 && parts[0].starts_with('@') {
        return format!("https://www.youtube.com/{}/videos", parts[0]);
    }
    if parts.len() == 2 && matches!(parts[0], "channel" | "c" | "user") {
        return format!("https://www.youtube.com/{}/{}/videos", parts[0], parts[1]);
    }
    url.to_string()
}

/// Normalize a language code to its coarse prefix:
/// `zh*/cmn*/yue*/nan*` map to `zh`, `en*` to `en`, anything else keeps
/// its primary subtag.
pub fn norm_lang(code: &str) -> String {
    let code = code.trim().to_lowercase();
    if code.is_empty() {
        return String::new();
    }
    if ["zh", "cmn", "yue", "nan"].iter().any(|p| code.starts_with(p)) {
        return "zh".to_string();
    }
    if code.starts_with("en") {
        return "en".to_string();
    }
    code.split('-').next().unwrap_or("").to_string()
}

/// Lowercased set of track keys, dropping empties.
pub fn flatten_langs<'a, I: IntoIterator<Item = &'a String>>(keys: I) -> HashSet<String> {
    keys.into_iter()
        .filter(|k| !k.is_empty())
        .map(|k| k.to_lowercase())
        .collect()
}

/// Count non-empty lines of a text file. Returns 0 if unreadable.
pub fn count_effective_lines(path: &Path) -> usize {
    match fs::read_to_string(path) {
        Ok(text) => text.lines().filter(|ln| !ln.trim().is_empty()).count(),
        Err(_) => 0,
    }
}

/// Validity floor for previously downloaded caption files: existence alone
/// is not trusted, a truncated file must be re-fetched.
pub fn has_min_effective_lines(path: &Path, min_lines: usize) -> bool {
    path.exists() && count_effective_lines(path) >= min_lines
}

/// Atomic JSON write: temp file in the same directory, then rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);
    let body = serde_json::to_string_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if let Err(e) = fs::write(&tmp, body).and_then(|_| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// Compact UTC timestamp for records: `YYYYMMDDTHHMMSSZ`.
pub fn ts_utc() -> String {
    let fmt = format_description!("[year][month][day]T[hour][minute][second]Z");
    OffsetDateTime::now_utc().format(&fmt).unwrap_or_default()
}

/// Timestamp used for run directory names: `YYYYMMDD_HHMMSS`.
pub fn run_dir_stamp() -> String {
    let fmt = format_description!("[year][month][day]_[hour][minute][second]");
    OffsetDateTime::now_utc().format(&fmt).unwrap_or_default()
}
