//! Which check categories a leak test runs.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// One check category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checker {
    Memory,
    Fds,
    Handles,
    CThreads,
    PyThreads,
    GcGarbage,
}

impl Checker {
    pub const ALL: [Checker; 6] = [
        Checker::Memory,
        Checker::Fds,
        Checker::Handles,
        Checker::CThreads,
        Checker::PyThreads,
        Checker::GcGarbage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Checker::Memory => "memory",
            Checker::Fds => "fds",
            Checker::Handles => "handles",
            Checker::CThreads => "c_threads",
            Checker::PyThreads => "py_threads",
            Checker::GcGarbage => "gcgarbage",
        }
    }
}

impl fmt::Display for Checker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Checker {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Checker::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ConfigError::Checker(s.to_string()))
    }
}

/// Boolean switch per check category. All enabled by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkers {
    pub memory: bool,
    pub fds: bool,
    pub handles: bool,
    pub c_threads: bool,
    pub py_threads: bool,
    pub gcgarbage: bool,
}

impl Default for Checkers {
    fn default() -> Self {
        Self {
            memory: true,
            fds: true,
            handles: true,
            c_threads: true,
            py_threads: true,
            gcgarbage: true,
        }
    }
}

impl Checkers {
    fn none() -> Self {
        Self {
            memory: false,
            fds: false,
            handles: false,
            c_threads: false,
            py_threads: false,
            gcgarbage: false,
        }
    }

    /// Returns the switch for `checker`.
    pub fn enabled(&self, checker: Checker) -> bool {
        match checker {
            Checker::Memory => self.memory,
            Checker::Fds => self.fds,
            Checker::Handles => self.handles,
            Checker::CThreads => self.c_threads,
            Checker::PyThreads => self.py_threads,
            Checker::GcGarbage => self.gcgarbage,
        }
    }

    fn set(mut self, checker: Checker, on: bool) -> Self {
        match checker {
            Checker::Memory => self.memory = on,
            Checker::Fds => self.fds = on,
            Checker::Handles => self.handles = on,
            Checker::CThreads => self.c_threads = on,
            Checker::PyThreads => self.py_threads = on,
            Checker::GcGarbage => self.gcgarbage = on,
        }
        self
    }

    /// Only `checkers` enabled.
    pub fn only_checkers(checkers: &[Checker]) -> Self {
        checkers.iter().fold(Self::none(), |acc, &c| acc.set(c, true))
    }

    /// Everything except `checkers` enabled.
    pub fn exclude_checkers(checkers: &[Checker]) -> Self {
        checkers
            .iter()
            .fold(Self::default(), |acc, &c| acc.set(c, false))
    }

    /// Only the named checkers enabled. Unknown names are rejected.
    pub fn only<S: AsRef<str>>(names: &[S]) -> Result<Self, ConfigError> {
        Ok(Self::only_checkers(&parse_names(names)?))
    }

    /// The named checkers disabled, the rest enabled. Unknown names are rejected.
    pub fn exclude<S: AsRef<str>>(names: &[S]) -> Result<Self, ConfigError> {
        Ok(Self::exclude_checkers(&parse_names(names)?))
    }

    /// Parses a comma-separated list, as used by environment overrides.
    pub fn parse_list(list: &str) -> Result<Vec<Checker>, ConfigError> {
        let names: Vec<&str> = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        parse_names(&names)
    }
}

fn parse_names<S: AsRef<str>>(names: &[S]) -> Result<Vec<Checker>, ConfigError> {
    names.iter().map(|n| n.as_ref().parse()).collect()
}
