//! Shared formatting and parsing helpers for byte sizes and round transcripts.

use crate::collector::snapshot::{Metric, MetricDiff};

const KB: u64 = 1024;
const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * 1024 * 1024;
const TB: u64 = 1024 * 1024 * 1024 * 1024;

/// Format byte count as human-readable size with one decimal.
///
/// `"1.5G"`, `"100.3M"`, `"50.0K"`, `"512B"`
pub fn format_bytes(bytes: u64) -> String {
    let f = bytes as f64;
    if bytes >= GB {
        format!("{:.1}G", f / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}M", f / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}K", f / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Format byte count truncated to an integer of the largest fitting unit.
///
/// `"4K"`, `"2M"`, `"1023B"`. Used in round diagnostics where decimals are noise.
pub fn format_bytes_int(bytes: u64) -> String {
    for (unit, suffix) in [(TB, "T"), (GB, "G"), (MB, "M"), (KB, "K")] {
        if bytes >= unit {
            return format!("{}{}", bytes / unit, suffix);
        }
    }
    format!("{}B", bytes)
}

/// Formats one unstable measurement round.
///
/// `Run # 1: heap=+4K    | rss=+2M     (calls=  200, avg/call=+20B)`
///
/// Only metrics that grew are listed; the per-call average is computed from
/// the first metric that grew.
pub fn format_run_line(idx: usize, diff: &MetricDiff, times: usize) -> String {
    let grown: Vec<(Metric, u64)> = Metric::ALL
        .iter()
        .filter_map(|&m| {
            let v = diff.get(m);
            (v > 0).then_some((m, v as u64))
        })
        .collect();

    let metrics = grown
        .iter()
        .map(|(m, v)| format!("{}={:<6}", m.as_str(), format!("+{}", format_bytes_int(*v))))
        .collect::<Vec<_>>()
        .join(" | ");

    let avg = match grown.first() {
        Some((_, v)) => format_bytes_int(v / times.max(1) as u64),
        None => "0B".to_string(),
    };

    format!(
        "Run #{:>2}: {:<50} (calls={:>5}, avg/call=+{})",
        idx, metrics, times, avg
    )
}

/// Parses a human-readable size string (e.g., "1G", "500M", "1024K", "64B") into bytes.
///
/// Negative values are reported separately so callers can produce a
/// "must be >= 0" message instead of a generic parse failure.
pub fn parse_size(s: &str) -> Result<u64, SizeParseError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(SizeParseError::Invalid(s.to_string()));
    }

    let (num_str, multiplier) = if let Some(num) = s.strip_suffix(['G', 'g']) {
        (num, GB)
    } else if let Some(num) = s.strip_suffix(['M', 'm']) {
        (num, MB)
    } else if let Some(num) = s.strip_suffix(['K', 'k']) {
        (num, KB)
    } else if let Some(num) = s.strip_suffix(['B', 'b']) {
        (num, 1)
    } else {
        (s, 1)
    };

    let n: i64 = num_str
        .trim()
        .parse()
        .map_err(|_| SizeParseError::Invalid(s.to_string()))?;
    if n < 0 {
        return Err(SizeParseError::Negative(n));
    }
    (n as u64)
        .checked_mul(multiplier)
        .ok_or_else(|| SizeParseError::Invalid(s.to_string()))
}

/// Why a size string was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizeParseError {
    Negative(i64),
    Invalid(String),
}
