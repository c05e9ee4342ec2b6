//! Error taxonomy surfaced to callers.
//!
//! Callers (usually test functions) assert on these variants: a detected leak
//! is always one of [`LeakError::Unclosed`], [`LeakError::UncollectableGarbage`]
//! or [`LeakError::MemoryLeak`]. Invalid parameters are reported as
//! [`ConfigError`] before any instrumentation runs.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Invalid parameters passed to the harness.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("times must be >= 1 (got {0})")]
    Times(i64),
    #[error("warmup_times must be >= 0 (got {0})")]
    WarmupTimes(i64),
    #[error("retries must be >= 0 (got {0})")]
    Retries(i64),
    #[error("tolerance must be >= 0 (got {0})")]
    Tolerance(i64),
    #[error("invalid tolerance key '{0}'")]
    ToleranceKey(String),
    #[error("invalid tolerance value '{0}'")]
    ToleranceValue(String),
    #[error("invalid checker name '{0}'")]
    Checker(String),
    #[error("invalid counter name '{0}'")]
    Counter(String),
    #[error("invalid value for {key}: '{value}'")]
    Env { key: &'static str, value: String },
}

/// Kind of resource left behind by a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    FileDescriptor,
    Handle,
    HeapCreate,
    NativeThread,
    ManagedThread,
    TempFile,
    TempDir,
    Subprocess,
}

impl Resource {
    /// Singular, human-readable name used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            Resource::FileDescriptor => "file descriptor",
            Resource::Handle => "handle",
            Resource::HeapCreate => "native heap object",
            Resource::NativeThread => "native thread",
            Resource::ManagedThread => "managed thread",
            Resource::TempFile => "temporary file",
            Resource::TempDir => "temporary directory",
            Resource::Subprocess => "subprocess",
        }
    }

    fn plural(self) -> String {
        match self {
            Resource::TempDir => "temporary directories".to_string(),
            other => format!("{}s", other.name()),
        }
    }

    /// Verb describing what the caller forgot to do.
    fn state(self) -> &'static str {
        match self {
            Resource::TempFile | Resource::TempDir => "undeleted",
            _ => "unclosed",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What was leaked, by whom.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LeakEvidence {
    /// Number of leaked instances.
    pub count: usize,
    /// Qualified name of the target.
    pub fun_name: String,
    /// Identifiers of the leaked items (paths, pids, thread names, ...).
    pub extras: Vec<String>,
}

impl LeakEvidence {
    pub fn new(count: usize, fun_name: impl Into<String>, extras: Vec<String>) -> Self {
        Self {
            count,
            fun_name: fun_name.into(),
            extras,
        }
    }
}

/// Uncollectable garbage created by one call, tallied by type name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GarbageEvidence {
    pub count: usize,
    pub fun_name: String,
    pub by_type: BTreeMap<String, usize>,
}

impl GarbageEvidence {
    fn describe(&self) -> String {
        let tally = self
            .by_type
            .iter()
            .map(|(name, n)| format!("{name}={n}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "detected {} uncollectable object{} after calling '{}' 1 time ({})",
            self.count,
            if self.count > 1 { "s" } else { "" },
            self.fun_name,
            tally
        )
    }
}

fn describe_unclosed(resource: &Resource, evidence: &LeakEvidence) -> String {
    let resource = *resource;
    let name = if evidence.count > 1 {
        resource.plural()
    } else {
        resource.name().to_string()
    };
    format!(
        "detected {} {} {} after calling '{}' 1 time",
        evidence.count,
        resource.state(),
        name,
        evidence.fun_name
    )
}

/// Failure raised by the harness.
#[derive(Debug, Error)]
pub enum LeakError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{}", describe_unclosed(.resource, .evidence))]
    Unclosed {
        resource: Resource,
        evidence: LeakEvidence,
    },

    #[error("{}", .0.describe())]
    UncollectableGarbage(GarbageEvidence),

    #[error("{transcript}")]
    MemoryLeak { fun_name: String, transcript: String },

    /// Garbage left over from an earlier step, found while quiescing.
    #[error("{count} objects were left in the garbage register before measuring")]
    PendingGarbage { count: usize },

    /// The target itself failed.
    #[error("'{fun_name}' failed: {source}")]
    Target {
        fun_name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("'{fun_name}' did not fail")]
    DidNotFail { fun_name: String },
}

impl LeakError {
    pub fn unclosed(resource: Resource, evidence: LeakEvidence) -> Self {
        LeakError::Unclosed { resource, evidence }
    }

    /// Resource kind, for unclosed/undeleted resource errors.
    pub fn resource(&self) -> Option<Resource> {
        match self {
            LeakError::Unclosed { resource, .. } => Some(*resource),
            _ => None,
        }
    }

    /// Evidence attached to a resource leak.
    pub fn evidence(&self) -> Option<&LeakEvidence> {
        match self {
            LeakError::Unclosed { evidence, .. } => Some(evidence),
            _ => None,
        }
    }

    /// Returns `true` for every confirmed leak category.
    pub fn is_leak(&self) -> bool {
        matches!(
            self,
            LeakError::Unclosed { .. }
                | LeakError::UncollectableGarbage(_)
                | LeakError::MemoryLeak { .. }
        )
    }
}
