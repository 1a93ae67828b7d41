// SRT/VTT cue parsing and plain-text conversion

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref TIMECODE_RE: Regex =
        Regex::new(r"(\d{2}):(\d{2}):(\d{2})[,.](\d{1,3})").unwrap();
}

/// One subtitle cue: start/end in seconds plus the joined text.
#[derive(Debug, Clone, PartialEq)]
pub struct Cue {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

fn timecode_to_seconds(caps: &regex::Captures<'_>) -> f64 {
    let h: f64 = caps[1].parse().unwrap_or(0.0);
    let m: f64 = caps[2].parse().unwrap_or(0.0);
    let s: f64 = caps[3].parse().unwrap_or(0.0);
    let ms: f64 = caps[4].parse().unwrap_or(0.0);
    h * 3600.0 + m * 60.0 + s + ms / 1000.0
}

/// Parse SRT or VTT content into cues. Numeric cue counters, blank lines
/// and the WEBVTT header are skipped; wrapped text lines are joined with a
/// space. The same parser handles both formats since the timecode shape
/// only differs in the millisecond separator.
pub fn parse_cues(content: &str) -> Vec<Cue> {
    let mut out = Vec::new();
    let mut text: Vec<String> = Vec::new();
    let mut window: Option<(f64, f64)> = None;

    for line in content.lines() {
        let t = line.trim();
        if t.contains("-->") {
            let times: Vec<_> = TIMECODE_RE.captures_iter(t).collect();
            if times.len() >= 2 {
                if let Some((start, end)) = window.take() {
                    if !text.is_empty() {
                        out.push(Cue {
                            start,
                            end,
                            text: text.join(" ").trim().to_string(),
                        });
                        text.clear();
                    }
                }
                window = Some((
                    timecode_to_seconds(&times[0]),
                    timecode_to_seconds(&times[1]),
                ));
            }
            continue;
        }
        if t.is_empty()
            || t.chars().all(|c| c.is_ascii_digit())
            || t.to_uppercase().starts_with("WEBVTT")
        {
            continue;
        }
        text.push(t.to_string());
    }
    if let Some((start, end)) = window {
        if !text.is_empty() {
            out.push(Cue {
                start,
                end,
                text: text.join(" ").trim().to_string(),
            });
        }
    }
    out
}

/// Cue text only, one line per cue.
pub fn extract_text(content: &str) -> Vec<String> {
    parse_cues(content).into_iter().map(|c| c.text).collect()
}

fn part_path(dst: &Path) -> PathBuf {
    let mut name = dst.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Convert an SRT or VTT file to plain text. The output is written to a
/// `.part` temp file and renamed into place, so a crash mid-conversion
/// never leaves a half-written target.
pub fn convert_to_txt(src: &Path, dst: &Path) -> io::Result<()> {
    let content = fs::read_to_string(src)?;
    let lines = extract_text(&content);
    let tmp = part_path(dst);
    let body = lines.join("\n") + "\n";
    if let Err(e) = fs::write(&tmp, body).and_then(|_| fs::rename(&tmp, dst)) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}
