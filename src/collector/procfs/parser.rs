//! Parsers for `/proc` filesystem files.
//!
//! These are pure functions that parse the content of various `/proc` files
//! into structured data. They are designed to be easily testable with string inputs.

use std::collections::HashMap;

/// Error type for parsing failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Parse error: {}", self.message)
    }
}

impl std::error::Error for ParseError {}

/// Parsed data from `/proc/[pid]/status`.
///
/// Memory fields are in KiB, as reported by the kernel.
#[derive(Debug, Clone, Default)]
pub struct ProcStatus {
    pub vm_size: u64,
    pub vm_rss: u64,
    pub threads: u32,
}

/// Parses `/proc/[pid]/status` content.
///
/// Format is key:\tvalue pairs, one per line.
pub fn parse_proc_status(content: &str) -> Result<ProcStatus, ParseError> {
    let mut fields: HashMap<&str, &str> = HashMap::new();

    for line in content.lines() {
        if let Some((key, value)) = line.split_once(':') {
            fields.insert(key.trim(), value.trim());
        }
    }

    if fields.is_empty() {
        return Err(ParseError::new("empty status"));
    }

    // Memory fields are in kB format: "12345 kB"
    let parse_kb = |key: &str| -> u64 {
        fields
            .get(key)
            .and_then(|s| s.split_whitespace().next())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    };

    Ok(ProcStatus {
        vm_size: parse_kb("VmSize"),
        vm_rss: parse_kb("VmRSS"),
        threads: fields
            .get("Threads")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
    })
}

/// Parsed data from `/proc/[pid]/smaps_rollup`, in KiB.
#[derive(Debug, Clone, Default)]
pub struct SmapsRollup {
    pub private_clean: u64,
    pub private_dirty: u64,
}

impl SmapsRollup {
    /// Unique set size: memory that would be freed if the process exited now.
    pub fn uss(&self) -> u64 {
        self.private_clean + self.private_dirty
    }
}

/// Parses `/proc/[pid]/smaps_rollup` content.
///
/// The first line is the address range header; the rest are `Key:  N kB`.
pub fn parse_smaps_rollup(content: &str) -> Result<SmapsRollup, ParseError> {
    let mut rollup = SmapsRollup::default();
    let mut seen = false;

    let parse_kb = |value: &str| -> u64 {
        value
            .split_whitespace()
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    };

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "Private_Clean" => rollup.private_clean = parse_kb(value),
            "Private_Dirty" => rollup.private_dirty = parse_kb(value),
            _ => continue,
        }
        seen = true;
    }

    if !seen {
        return Err(ParseError::new("no known fields in smaps_rollup"));
    }
    Ok(rollup)
}

/// Name and scheduler state from `/proc/[pid]/stat`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatState {
    pub pid: u32,
    pub comm: String,
    pub state: char,
}

/// Parses the leading `pid (comm) state` fields of `/proc/[pid]/stat`.
///
/// The comm field can contain spaces and parentheses, so it is delimited by
/// the first '(' and the last ')'.
pub fn parse_stat_state(content: &str) -> Result<StatState, ParseError> {
    let content = content.trim();

    let open_paren = content
        .find('(')
        .ok_or_else(|| ParseError::new("missing '(' in stat"))?;
    let close_paren = content
        .rfind(')')
        .ok_or_else(|| ParseError::new("missing ')' in stat"))?;

    if close_paren <= open_paren {
        return Err(ParseError::new("invalid parentheses in stat"));
    }

    let pid: u32 = content[..open_paren]
        .trim()
        .parse()
        .map_err(|_| ParseError::new("invalid pid"))?;

    let state = content[close_paren + 1..]
        .split_whitespace()
        .next()
        .and_then(|s| s.chars().next())
        .ok_or_else(|| ParseError::new("missing state in stat"))?;

    Ok(StatState {
        pid,
        comm: content[open_paren + 1..close_paren].to_string(),
        state,
    })
}
