//! Leak test parameters and their validation.
//!
//! Defaults can be overlaid from the environment:
//!
//! | Variable                     | Example                |
//! |------------------------------|------------------------|
//! | `LEAKPROBE_TIMES`            | `200`                  |
//! | `LEAKPROBE_WARMUP_TIMES`     | `10`                   |
//! | `LEAKPROBE_RETRIES`          | `5`                    |
//! | `LEAKPROBE_TOLERANCE`        | `4M` or `rss=1M,heap=0`|
//! | `LEAKPROBE_CHECKERS_ONLY`    | `fds,py_threads`       |
//! | `LEAKPROBE_CHECKERS_EXCLUDE` | `memory`               |

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::checkers::Checkers;
use crate::collector::snapshot::Metric;
use crate::error::ConfigError;
use crate::fmt::{SizeParseError, parse_size};

/// Called by the quiescer before free pages are returned to the OS.
pub type TrimCallback = Arc<dyn Fn() + Send + Sync>;

/// Allowed growth (bytes) before a round counts as unstable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tolerance {
    /// Same allowance for every metric.
    Uniform(u64),
    /// Allowance per metric name; unnamed metrics get 0.
    PerMetric(BTreeMap<String, u64>),
}

impl Default for Tolerance {
    fn default() -> Self {
        Tolerance::Uniform(0)
    }
}

impl From<u64> for Tolerance {
    fn from(bytes: u64) -> Self {
        Tolerance::Uniform(bytes)
    }
}

impl Tolerance {
    /// Builds a per-metric tolerance from `(name, bytes)` pairs.
    pub fn per_metric<S: Into<String>>(pairs: impl IntoIterator<Item = (S, u64)>) -> Self {
        Tolerance::PerMetric(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Expands into one allowance per [`Metric`], validating metric names.
    pub fn resolve(&self) -> Result<ResolvedTolerance, ConfigError> {
        match self {
            Tolerance::Uniform(bytes) => Ok(ResolvedTolerance([*bytes; 5])),
            Tolerance::PerMetric(map) => {
                let mut resolved = ResolvedTolerance::default();
                for (name, &bytes) in map {
                    let metric: Metric = name.parse()?;
                    resolved.0[metric as usize] = bytes;
                }
                Ok(resolved)
            }
        }
    }
}

impl FromStr for Tolerance {
    type Err = ConfigError;

    /// `"4M"` for a uniform tolerance, `"rss=1M,heap=0"` per metric.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let size = |v: &str| match parse_size(v) {
            Ok(n) => Ok(n),
            Err(SizeParseError::Negative(n)) => Err(ConfigError::Tolerance(n)),
            Err(SizeParseError::Invalid(v)) => Err(ConfigError::ToleranceValue(v)),
        };

        if !s.contains('=') {
            return size(s).map(Tolerance::Uniform);
        }

        let mut map = BTreeMap::new();
        for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ConfigError::ToleranceValue(pair.to_string()))?;
            let key = key.trim();
            key.parse::<Metric>()?;
            map.insert(key.to_string(), size(value)?);
        }
        Ok(Tolerance::PerMetric(map))
    }
}

/// Allowance per metric, indexed by [`Metric`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolvedTolerance([u64; 5]);

impl ResolvedTolerance {
    pub fn get(&self, metric: Metric) -> u64 {
        self.0[metric as usize]
    }
}

/// Parameters of one leak test execution.
#[derive(Clone)]
pub struct Options {
    /// Calls per measurement round (first round; later rounds add this again).
    pub times: usize,
    /// Unmeasured calls before the memory check.
    pub warmup_times: usize,
    /// Maximum measurement rounds.
    pub retries: usize,
    pub tolerance: Tolerance,
    pub checkers: Checkers,
    pub trim_callback: Option<TrimCallback>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            times: 200,
            warmup_times: 10,
            retries: 5,
            tolerance: Tolerance::default(),
            checkers: Checkers::default(),
            trim_callback: None,
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("times", &self.times)
            .field("warmup_times", &self.warmup_times)
            .field("retries", &self.retries)
            .field("tolerance", &self.tolerance)
            .field("checkers", &self.checkers)
            .field("trim_callback", &self.trim_callback.is_some())
            .finish()
    }
}

impl Options {
    /// Checks parameters; returns the resolved tolerance on success.
    pub fn validate(&self) -> Result<ResolvedTolerance, ConfigError> {
        if self.times < 1 {
            return Err(ConfigError::Times(self.times as i64));
        }
        self.tolerance.resolve()
    }

    /// Defaults overlaid with `LEAKPROBE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Overlays values returned by `lookup` (keyed by variable name).
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(v) = lookup("LEAKPROBE_TIMES") {
            let n = parse_int("LEAKPROBE_TIMES", &v)?;
            if n < 1 {
                return Err(ConfigError::Times(n));
            }
            self.times = n as usize;
        }
        if let Some(v) = lookup("LEAKPROBE_WARMUP_TIMES") {
            let n = parse_int("LEAKPROBE_WARMUP_TIMES", &v)?;
            if n < 0 {
                return Err(ConfigError::WarmupTimes(n));
            }
            self.warmup_times = n as usize;
        }
        if let Some(v) = lookup("LEAKPROBE_RETRIES") {
            let n = parse_int("LEAKPROBE_RETRIES", &v)?;
            if n < 0 {
                return Err(ConfigError::Retries(n));
            }
            self.retries = n as usize;
        }
        if let Some(v) = lookup("LEAKPROBE_TOLERANCE") {
            self.tolerance = v.parse()?;
        }
        if let Some(v) = lookup("LEAKPROBE_CHECKERS_ONLY") {
            self.checkers = Checkers::only_checkers(&Checkers::parse_list(&v)?);
        }
        if let Some(v) = lookup("LEAKPROBE_CHECKERS_EXCLUDE") {
            self.checkers = Checkers::exclude_checkers(&Checkers::parse_list(&v)?);
        }
        Ok(self)
    }
}

fn parse_int(key: &'static str, value: &str) -> Result<i64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        key,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_validate() {
        let opts = Options::default();
        assert_eq!(opts.times, 200);
        assert_eq!(opts.warmup_times, 10);
        assert_eq!(opts.retries, 5);
        assert_eq!(opts.validate().unwrap(), ResolvedTolerance::default());
    }

    #[test]
    fn test_zero_times_rejected() {
        let opts = Options {
            times: 0,
            ..Options::default()
        };
        assert_eq!(opts.validate().unwrap_err(), ConfigError::Times(0));
    }

    #[test]
    fn test_uniform_tolerance_applies_to_all_metrics() {
        let resolved = Tolerance::Uniform(10).resolve().unwrap();
        for m in Metric::ALL {
            assert_eq!(resolved.get(m), 10);
        }
    }

    #[test]
    fn test_per_metric_tolerance_defaults_missing_to_zero() {
        let resolved = Tolerance::per_metric([("rss", 100), ("mmap", 7)])
            .resolve()
            .unwrap();
        assert_eq!(resolved.get(Metric::Rss), 100);
        assert_eq!(resolved.get(Metric::Mmap), 7);
        assert_eq!(resolved.get(Metric::Heap), 0);
    }

    #[test]
    fn test_per_metric_tolerance_rejects_unknown_key() {
        let err = Tolerance::per_metric([("nonexistent", 10)])
            .resolve()
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid tolerance key 'nonexistent'");
    }

    #[test]
    fn test_tolerance_from_str() {
        assert_eq!("4K".parse::<Tolerance>().unwrap(), Tolerance::Uniform(4096));
        assert_eq!(
            "rss=1M, heap=0".parse::<Tolerance>().unwrap(),
            Tolerance::per_metric([("rss", 1024 * 1024), ("heap", 0)])
        );
        assert_eq!(
            "-1".parse::<Tolerance>().unwrap_err().to_string(),
            "tolerance must be >= 0 (got -1)"
        );
        assert_eq!(
            "bogus=1".parse::<Tolerance>().unwrap_err(),
            ConfigError::ToleranceKey("bogus".into())
        );
        assert!(matches!(
            "invalid".parse::<Tolerance>(),
            Err(ConfigError::ToleranceValue(_))
        ));
    }

    #[test]
    fn test_overlay_from_env() {
        let opts = Options::default()
            .overlay(env(&[
                ("LEAKPROBE_TIMES", "50"),
                ("LEAKPROBE_WARMUP_TIMES", "0"),
                ("LEAKPROBE_RETRIES", "3"),
                ("LEAKPROBE_TOLERANCE", "1M"),
                ("LEAKPROBE_CHECKERS_EXCLUDE", "memory"),
            ]))
            .unwrap();
        assert_eq!(opts.times, 50);
        assert_eq!(opts.warmup_times, 0);
        assert_eq!(opts.retries, 3);
        assert_eq!(opts.tolerance, Tolerance::Uniform(1024 * 1024));
        assert!(!opts.checkers.memory);
        assert!(opts.checkers.fds);
    }

    #[test]
    fn test_overlay_rejects_negative_counts() {
        let err = Options::default()
            .overlay(env(&[("LEAKPROBE_TIMES", "-1")]))
            .unwrap_err();
        assert_eq!(err.to_string(), "times must be >= 1 (got -1)");

        let err = Options::default()
            .overlay(env(&[("LEAKPROBE_WARMUP_TIMES", "-1")]))
            .unwrap_err();
        assert_eq!(err.to_string(), "warmup_times must be >= 0 (got -1)");

        let err = Options::default()
            .overlay(env(&[("LEAKPROBE_RETRIES", "-1")]))
            .unwrap_err();
        assert_eq!(err.to_string(), "retries must be >= 0 (got -1)");

        let err = Options::default()
            .overlay(env(&[("LEAKPROBE_RETRIES", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { key: "LEAKPROBE_RETRIES", .. }));
    }

    #[test]
    fn test_overlay_rejects_unknown_checker() {
        let err = Options::default()
            .overlay(env(&[("LEAKPROBE_CHECKERS_ONLY", "fds,nope")]))
            .unwrap_err();
        assert_eq!(err, ConfigError::Checker("nope".into()));
    }
}
