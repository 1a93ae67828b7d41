// Run artifacts: run.jsonl, link lists, channel index, warnings

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::models::ProbeResult;
use super::utils::{count_effective_lines, ts_utc, write_json_atomic};

/// Subdirectory of a run dir where caption files land.
pub const SUBS_DIR: &str = "subtitles";
/// Per-item results, one JSON object per line.
pub const RUN_RECORDS: &str = "run.jsonl";
/// Channel watermark index, kept at the output root (shared across runs).
pub const CHANNEL_INDEX: &str = "channel_index.json";

/// Create a fresh timestamped run directory (with its subtitles subdir)
/// under the output root.
pub fn create_run_dir(output_root: &Path) -> io::Result<PathBuf> {
    let mut dir = output_root.join(super::utils::run_dir_stamp());
    // Two runs inside the same second get distinct directories.
    let mut n = 1;
    while dir.exists() {
        dir = output_root.join(format!("{}_{n}", super::utils::run_dir_stamp()));
        n += 1;
    }
    fs::create_dir_all(dir.join(SUBS_DIR))?;
    Ok(dir)
}

/// Appends per-item records to `run.jsonl` and collects run warnings.
/// Records survive a crash up to the last completed item; the warnings
/// file is written once at the end of the run.
pub struct RunRecorder {
    run_dir: PathBuf,
    records: Mutex<fs::File>,
    warnings: Mutex<Vec<String>>,
}

impl RunRecorder {
    pub fn create(run_dir: &Path) -> io::Result<Self> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join(RUN_RECORDS))?;
        Ok(Self {
            run_dir: run_dir.to_path_buf(),
            records: Mutex::new(file),
            warnings: Mutex::new(Vec::new()),
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Append one record as a JSON line.
    pub fn record<T: Serialize>(&self, value: &T) -> io::Result<()> {
        let line = serde_json::to_string(value)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut file = self.records.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(file, "{line}")
    }

    /// Queue one tab-separated warning line.
    pub fn warn(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::warn!(target: "harvester::records", warning = %line);
        self.warnings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(line);
    }

    pub fn warning_count(&self) -> usize {
        self.warnings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Write `warnings.txt` if any warnings accumulated.
    pub fn flush_warnings(&self) -> io::Result<()> {
        let warnings = self.warnings.lock().unwrap_or_else(|e| e.into_inner());
        if warnings.is_empty() {
            return Ok(());
        }
        let body = warnings.join("\n") + "\n";
        fs::write(self.run_dir.join("warnings.txt"), body)
    }
}

/// Write the detect-phase link lists into the run dir. Returns the number
/// of error items.
pub fn save_link_lists(run_dir: &Path, results: &[ProbeResult]) -> io::Result<usize> {
    let mut all = String::new();
    let mut has_subs = String::new();
    let mut no_subs = String::new();
    let mut errors = String::new();
    let mut error_count = 0;

    for r in results {
        all.push_str(&r.url);
        all.push('\n');
        match r.status {
            super::models::ProbeStatus::HasSubs => {
                has_subs.push_str(&r.url);
                has_subs.push('\n');
            }
            super::models::ProbeStatus::NoSubs => {
                no_subs.push_str(&r.url);
                no_subs.push('\n');
            }
            super::models::ProbeStatus::Error(_) => {
                error_count += 1;
                errors.push_str(&format!("{}\t{}\n", r.url, r.status));
            }
            super::models::ProbeStatus::Stopped => {}
        }
    }

    fs::write(run_dir.join("all_links.txt"), all)?;
    fs::write(run_dir.join("has_subs.txt"), has_subs)?;
    fs::write(run_dir.join("no_subs.txt"), no_subs)?;
    fs::write(run_dir.join("errors.txt"), errors)?;
    Ok(error_count)
}

/// One channel's incremental-detect watermark.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEntry {
    /// Newest upload date (`YYYYMMDD`) fully processed
    pub last_seen: String,
    pub updated_at: String,
}

/// Channel watermark index keyed by canonical channel URL. Lexicographic
/// comparison of `YYYYMMDD` dates doubles as chronological comparison.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelIndex(pub BTreeMap<String, ChannelEntry>);

impl ChannelIndex {
    /// Load from the output root; a missing or unreadable index is empty,
    /// never an error (first run, or a wiped root).
    pub fn load(output_root: &Path) -> Self {
        let path = output_root.join(CHANNEL_INDEX);
        match fs::read_to_string(&path) {
            Ok(body) => serde_json::from_str(&body).unwrap_or_else(|e| {
                tracing::warn!(
                    target: "harvester::records",
                    path = %path.display(),
                    error = %e,
                    "channel index unreadable, starting empty"
                );
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn last_seen(&self, channel_url: &str) -> Option<&str> {
        self.0.get(channel_url).map(|e| e.last_seen.as_str())
    }

    /// Advance a channel's watermark. Monotonic: an older date never
    /// replaces a newer one.
    pub fn advance(&mut self, channel_url: &str, seen: &str) {
        if seen.is_empty() {
            return;
        }
        match self.0.get_mut(channel_url) {
            Some(entry) if entry.last_seen.as_str() >= seen => {}
            Some(entry) => {
                entry.last_seen = seen.to_string();
                entry.updated_at = ts_utc();
            }
            None => {
                self.0.insert(
                    channel_url.to_string(),
                    ChannelEntry {
                        last_seen: seen.to_string(),
                        updated_at: ts_utc(),
                    },
                );
            }
        }
    }

    pub fn save(&self, output_root: &Path) -> io::Result<()> {
        write_json_atomic(&output_root.join(CHANNEL_INDEX), self)
    }
}

/// Post-run validation of the subtitles directory. Flags empty files and
/// files under the effective-line floor as `reason\tlines\tfile` warnings.
pub fn validate_subtitles_dir(dir: &Path, min_lines: usize) -> Vec<String> {
    let mut out = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return out,
    };
    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    for path in paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name.ends_with(".part") || name.ends_with(".tmp") {
            out.push(format!("leftover_temp\t0\t{name}"));
            continue;
        }
        let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            out.push(format!("empty\t0\t{name}"));
            continue;
        }
        let lines = count_effective_lines(&path);
        if lines < min_lines {
            out.push(format!("too_short\t{lines}\t{name}"));
        }
    }
    out
}

/// Snapshot the effective configuration into the run dir, after env-marker
/// resolution and any CLI overrides.
pub fn save_config_snapshot<T: Serialize>(run_dir: &Path, cfg: &T) -> io::Result<()> {
    write_json_atomic(&run_dir.join("config.final.json"), cfg)
}
