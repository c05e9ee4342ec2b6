//! Tracked child processes.
//!
//! [`spawn`] wraps [`Command::spawn`]. While a [`SubprocessTracker`] is
//! installed it records each child's pid together with the identities of the
//! stdio pipes the parent holds (`pipe:[inode]`, as shown in
//! `/proc/self/fd`). A child counts as leaked while `/proc/<pid>` exists
//! (running, or exited but never waited on) or while any of our descriptors
//! still refers to one of its pipes.

use std::io;
use std::path::PathBuf;
use std::process::{Child, Command};

use tracing::debug;

use super::{EntryPoint, Hook, ResourceTracker, TrackedLeak};
use crate::collector::procfs::parser::parse_stat_state;
use crate::collector::traits::{FileSystem, RealFs};
use crate::error::Resource;

/// A spawned child as recorded at creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEntry {
    pub pid: u32,
    pub program: String,
    /// Link targets of the parent's stdio pipe ends.
    pub pipes: Vec<String>,
}

static CHILDREN: EntryPoint<ChildEntry> = EntryPoint::new();

/// Spawns `command`, recording the child if tracking is active.
pub fn spawn(command: &mut Command) -> io::Result<Child> {
    let child = command.spawn()?;
    let entry = ChildEntry {
        pid: child.id(),
        program: command.get_program().to_string_lossy().into_owned(),
        pipes: pipe_identities(&RealFs::new(), &child),
    };
    debug!(pid = entry.pid, program = %entry.program, "child spawned");
    CHILDREN.record(entry);
    Ok(child)
}

#[cfg(unix)]
fn pipe_identities(fs: &impl FileSystem, child: &Child) -> Vec<String> {
    use std::os::fd::AsRawFd;

    [
        child.stdin.as_ref().map(|p| p.as_raw_fd()),
        child.stdout.as_ref().map(|p| p.as_raw_fd()),
        child.stderr.as_ref().map(|p| p.as_raw_fd()),
    ]
    .into_iter()
    .flatten()
    .filter_map(|fd| fs.read_link(&PathBuf::from(format!("/proc/self/fd/{fd}"))).ok())
    .map(|target| target.display().to_string())
    .collect()
}

#[cfg(not(unix))]
fn pipe_identities(_fs: &impl FileSystem, _child: &Child) -> Vec<String> {
    Vec::new()
}

/// Reports children that are still running or whose streams are still open.
#[derive(Debug)]
pub struct SubprocessTracker<F: FileSystem = RealFs> {
    hook: Hook<ChildEntry>,
    fs: F,
    proc_root: PathBuf,
}

impl SubprocessTracker<RealFs> {
    pub fn new() -> Self {
        Self::with_fs(RealFs::new(), "/proc")
    }
}

impl Default for SubprocessTracker<RealFs> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: FileSystem> SubprocessTracker<F> {
    /// Tracker reading process state under `proc_root` through `fs`.
    pub fn with_fs(fs: F, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            hook: Hook::new(&CHILDREN),
            fs,
            proc_root: proc_root.into(),
        }
    }

    /// Scheduler state letter, if the process still has a `/proc` entry.
    fn state(&self, pid: u32) -> Option<char> {
        let dir = self.proc_root.join(pid.to_string());
        if !self.fs.exists(&dir) {
            return None;
        }
        let state = self
            .fs
            .read_to_string(&dir.join("stat"))
            .ok()
            .and_then(|s| parse_stat_state(&s).ok())
            .map(|s| s.state);
        Some(state.unwrap_or('?'))
    }

    /// Link targets of every descriptor this process holds.
    fn open_targets(&self) -> Vec<String> {
        let fd_dir = self.proc_root.join("self").join("fd");
        self.fs
            .read_dir(&fd_dir)
            .unwrap_or_default()
            .iter()
            .filter_map(|fd| self.fs.read_link(fd).ok())
            .map(|target| target.display().to_string())
            .collect()
    }
}

impl<F: FileSystem> ResourceTracker for SubprocessTracker<F> {
    fn install(&mut self) {
        self.hook.install();
    }

    fn uninstall(&mut self) {
        self.hook.uninstall();
    }

    fn tracked_leaks(&self) -> Vec<TrackedLeak> {
        let tracked = self.hook.tracked();
        if tracked.is_empty() {
            return Vec::new();
        }
        let open = self.open_targets();

        tracked
            .iter()
            .filter_map(|child| {
                let state = self.state(child.pid);
                let streams = child.pipes.iter().filter(|p| open.contains(p)).count();
                if state.is_none() && streams == 0 {
                    return None;
                }
                let state = state.map_or_else(|| "exited".to_string(), |s| format!("state={s}"));
                Some(TrackedLeak {
                    resource: Resource::Subprocess,
                    ident: format!(
                        "pid {} ({}): {}, open streams={}",
                        child.pid, child.program, state, streams
                    ),
                })
            })
            .collect()
    }
}
