use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::error::StageError;
use super::event::{CiSource, RawLogRef};

/// Bounded excerpt of a raw build log, dense enough for model consumption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedSummary {
    pub text: String,
    pub low_confidence: bool,
    pub lines_scanned: usize,
}

/// Resolves a `RawLogRef` to the raw log text. Inline refs are trivial;
/// URL refs go over HTTP and may fail retryably (`Transient`) or not
/// (`NotFound` for a 404).
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn fetch(&self, log_ref: &RawLogRef) -> Result<String, StageError>;
}

#[derive(Debug, Clone)]
pub struct ExtractConfig {
    /// Hard cap on summary size in bytes. Output never exceeds this.
    pub cap_bytes: usize,
    /// How far back from the end of the log to look for a signal line.
    pub lookback_lines: usize,
    /// Verbatim tail size when no signal line is found.
    pub fallback_tail_lines: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            cap_bytes: 6144,
            lookback_lines: 2000,
            fallback_tail_lines: 200,
        }
    }
}

const DEFAULT_SIGNALS: &[&str] = &[
    r"(?i)\berror\b",
    r"(?i)\bfail(ed|ure|ing)?\b",
    r"(?i)\bexception\b",
    r"(?i)\btraceback\b",
    r"(?i)\bfatal\b",
    r"(?i)\bpanic(ked)?\b",
    r"exit(ed)? (with )?(code|status) [1-9]",
    r"(?i)non-zero exit",
];

fn signal_patterns(source: CiSource) -> Vec<Regex> {
    let mut patterns: Vec<&str> = DEFAULT_SIGNALS.to_vec();
    match source {
        CiSource::Jenkins => {
            patterns.push(r"^Finished: (FAILURE|UNSTABLE|ABORTED)");
            patterns.push(r"^ERROR:");
        }
        CiSource::GithubActions => {
            patterns.push(r"##\[error\]");
            patterns.push(r"(?i)Process completed with exit code [1-9]");
        }
        CiSource::Other => {}
    }
    patterns
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
}

/// Reduce a raw log to a bounded excerpt that preserves the failure signal.
///
/// Scans the lookback window from the end of the log for the earliest
/// strong-signal line and keeps everything from there to the end,
/// de-duplicating immediately repeated lines. Falls back to the last N
/// lines verbatim (marked low-confidence) when nothing matches. The result
/// is middle-truncated to the cap; the tail always survives.
pub fn extract_summary(raw: &str, source: CiSource, cfg: &ExtractConfig) -> ExtractedSummary {
    let ansi = Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").unwrap();
    let lines: Vec<String> = raw
        .lines()
        .map(|l| ansi.replace_all(l, "").into_owned())
        .collect();
    let total = lines.len();

    let patterns = signal_patterns(source);
    let window_start = total.saturating_sub(cfg.lookback_lines);
    let first_signal = lines[window_start..]
        .iter()
        .position(|l| patterns.iter().any(|p| p.is_match(l)))
        .map(|i| window_start + i);

    let (start, low_confidence) = match first_signal {
        Some(idx) => (idx, false),
        None => (total.saturating_sub(cfg.fallback_tail_lines), true),
    };

    // Collapse retry-loop noise: immediately repeated lines become one.
    let mut collected: Vec<&str> = Vec::with_capacity(total - start);
    let mut prev: Option<&str> = None;
    for line in &lines[start..] {
        if prev != Some(line.as_str()) {
            collected.push(line);
        }
        prev = Some(line);
    }

    let mut text = collected.join("\n");
    if low_confidence && !text.is_empty() {
        text = format!("[low-confidence extraction: no failure signal found]\n{}", text);
    }

    ExtractedSummary {
        text: truncate_middle(&text, cfg.cap_bytes),
        low_confidence,
        lines_scanned: total,
    }
}

/// Truncate to at most `cap` bytes, dropping from the middle so both the
/// head of the failure window and the tail of the log survive.
fn truncate_middle(s: &str, cap: usize) -> String {
    if s.len() <= cap {
        return s.to_string();
    }
    const MARKER: &str = "\n... [truncated] ...\n";
    if cap <= MARKER.len() {
        return s[ceil_char_boundary(s, s.len() - cap)..].to_string();
    }
    let budget = cap - MARKER.len();
    let head_len = budget / 2;
    let tail_len = budget - head_len;

    let head = &s[..floor_char_boundary(s, head_len)];
    let tail = &s[ceil_char_boundary(s, s.len() - tail_len)..];
    format!("{}{}{}", head, MARKER, tail)
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ExtractConfig {
        ExtractConfig::default()
    }

    #[test]
    fn finds_fatal_line_near_end_of_huge_log() {
        let mut log = String::new();
        for i in 0..49_997 {
            log.push_str(&format!("building module {}\n", i));
        }
        log.push_str("FATAL: OutOfMemoryError\n");
        log.push_str("shutting down worker\n");
        log.push_str("build step exited\n");

        let summary = extract_summary(&log, CiSource::Jenkins, &cfg());
        assert!(summary.text.contains("FATAL: OutOfMemoryError"));
        assert!(summary.text.contains("build step exited"));
        assert!(summary.text.len() <= cfg().cap_bytes);
        assert!(!summary.low_confidence);
    }

    #[test]
    fn output_never_exceeds_cap() {
        for size in [0usize, 1, 100, 10_000, 1_000_000] {
            let log = "x".repeat(size);
            let summary = extract_summary(&log, CiSource::Other, &cfg());
            assert!(
                summary.text.len() <= cfg().cap_bytes,
                "len {} exceeded cap for input size {}",
                summary.text.len(),
                size
            );
        }
    }

    #[test]
    fn tail_survives_truncation() {
        let mut log = String::new();
        log.push_str("error: everything is broken\n");
        for i in 0..5000 {
            log.push_str(&format!("useless diagnostic line number {}\n", i));
        }
        log.push_str("THE ACTUAL FAILURE IS HERE\n");
        let summary = extract_summary(&log, CiSource::Other, &cfg());
        assert!(summary.text.contains("THE ACTUAL FAILURE IS HERE"));
        assert!(summary.text.len() <= cfg().cap_bytes);
    }

    #[test]
    fn no_signal_falls_back_to_tail_marked_low_confidence() {
        let log = (0..500)
            .map(|i| format!("benign line {}", i))
            .collect::<Vec<_>>()
            .join("\n");
        let summary = extract_summary(&log, CiSource::Other, &cfg());
        assert!(summary.low_confidence);
        assert!(summary.text.starts_with("[low-confidence extraction"));
        assert!(summary.text.contains("benign line 499"));
    }

    #[test]
    fn immediately_repeated_lines_are_deduplicated() {
        let mut log = String::from("error: connection refused\n");
        for _ in 0..50 {
            log.push_str("retrying in 5s\n");
        }
        log.push_str("giving up\n");
        let summary = extract_summary(&log, CiSource::Other, &cfg());
        assert_eq!(summary.text.matches("retrying in 5s").count(), 1);
        assert!(summary.text.contains("giving up"));
    }

    #[test]
    fn ansi_codes_are_stripped() {
        let log = "\x1b[31merror:\x1b[0m compile failed\n";
        let summary = extract_summary(log, CiSource::Other, &cfg());
        assert!(summary.text.contains("error: compile failed"));
        assert!(!summary.text.contains('\x1b'));
    }

    #[test]
    fn empty_log_yields_empty_low_confidence_summary() {
        let summary = extract_summary("", CiSource::Jenkins, &cfg());
        assert!(summary.low_confidence);
        assert!(summary.text.is_empty());
        assert_eq!(summary.lines_scanned, 0);
    }

    #[test]
    fn github_error_annotation_is_a_signal() {
        let mut log = String::new();
        for _ in 0..100 {
            log.push_str("ok\n");
        }
        log.push_str("##[error]Process completed with exit code 1.\n");
        let summary = extract_summary(&log, CiSource::GithubActions, &cfg());
        assert!(!summary.low_confidence);
        assert!(summary.text.contains("##[error]"));
    }
}
