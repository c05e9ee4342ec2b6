//! Interception of resource creation entry points.
//!
//! Each resource category exposes its creation functions through an
//! [`EntryPoint`]: a global redirection slot that, while a tracker is
//! installed, forwards the identity of every created resource to that
//! tracker's sink. Trackers check after the call which recorded resources are
//! still alive.
//!
//! New categories plug in by implementing [`ResourceTracker`] and passing the
//! tracker to [`crate::LeakTest::tracker`].

pub mod subprocess;
pub mod tempfiles;

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::checkers::Checkers;
use crate::error::{LeakError, LeakEvidence, Resource};

pub use subprocess::SubprocessTracker;
pub use tempfiles::TempFileTracker;

/// Shared list a tracker collects created identities into.
pub type Sink<T> = Arc<Mutex<Vec<T>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Global redirection slot for one creation entry point.
#[derive(Debug)]
pub struct EntryPoint<T> {
    sink: Mutex<Option<Sink<T>>>,
}

impl<T> EntryPoint<T> {
    pub const fn new() -> Self {
        Self {
            sink: Mutex::new(None),
        }
    }

    /// Routes records to `sink`; returns the sink it replaced.
    pub fn redirect(&self, sink: Sink<T>) -> Option<Sink<T>> {
        lock(&self.sink).replace(sink)
    }

    /// Puts back a sink previously returned by [`EntryPoint::redirect`].
    pub fn restore(&self, previous: Option<Sink<T>>) {
        *lock(&self.sink) = previous;
    }

    pub fn is_redirected(&self) -> bool {
        lock(&self.sink).is_some()
    }

    /// Forwards `item` to the active sink, if any.
    pub fn record(&self, item: T) {
        let sink = lock(&self.sink).clone();
        if let Some(sink) = sink {
            lock(&sink).push(item);
        }
    }
}

impl<T> Default for EntryPoint<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Installation state shared by the concrete trackers: the sink they own plus
/// the sink they displaced.
#[derive(Debug)]
pub(crate) struct Hook<T: 'static> {
    entry: &'static EntryPoint<T>,
    sink: Sink<T>,
    saved: Option<Option<Sink<T>>>,
}

impl<T: 'static> Hook<T> {
    pub(crate) fn new(entry: &'static EntryPoint<T>) -> Self {
        Self {
            entry,
            sink: Arc::default(),
            saved: None,
        }
    }

    pub(crate) fn install(&mut self) {
        if self.saved.is_none() {
            self.saved = Some(self.entry.redirect(self.sink.clone()));
        }
    }

    pub(crate) fn uninstall(&mut self) {
        if let Some(previous) = self.saved.take() {
            self.entry.restore(previous);
        }
        lock(&self.sink).clear();
    }

    pub(crate) fn is_installed(&self) -> bool {
        self.saved.is_some()
    }

    pub(crate) fn tracked(&self) -> MutexGuard<'_, Vec<T>> {
        lock(&self.sink)
    }
}

/// A tracked resource that is still alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedLeak {
    pub resource: Resource,
    /// Human-readable identity (path, pid, ...).
    pub ident: String,
}

/// One resource category whose creations are intercepted during a call.
pub trait ResourceTracker: Send {
    /// Starts recording. Calling twice without `uninstall` is a no-op.
    fn install(&mut self);

    /// Stops recording and forgets tracked identities. Safe to call when
    /// never installed.
    fn uninstall(&mut self);

    /// Tracked resources still alive, in creation order.
    fn tracked_leaks(&self) -> Vec<TrackedLeak>;

    /// Whether this tracker runs under `checkers`.
    fn enabled(&self, _checkers: &Checkers) -> bool {
        true
    }

    /// Raises for the first resource kind with live leftovers.
    fn check(&self, fun_name: &str) -> Result<(), LeakError> {
        let leaks = self.tracked_leaks();
        let Some(first) = leaks.first() else {
            return Ok(());
        };
        let resource = first.resource;
        let extras: Vec<String> = leaks
            .iter()
            .filter(|l| l.resource == resource)
            .map(|l| l.ident.clone())
            .collect();
        Err(LeakError::unclosed(
            resource,
            LeakEvidence::new(extras.len(), fun_name, extras),
        ))
    }
}

/// Trackers installed for one execution; uninstalls all of them on drop.
pub struct TrackerSet {
    trackers: Vec<Box<dyn ResourceTracker>>,
}

impl TrackerSet {
    /// Installs every tracker enabled by `checkers`, dropping the rest.
    pub fn install(trackers: Vec<Box<dyn ResourceTracker>>, checkers: &Checkers) -> Self {
        let mut trackers: Vec<_> = trackers
            .into_iter()
            .filter(|t| t.enabled(checkers))
            .collect();
        for tracker in &mut trackers {
            tracker.install();
        }
        debug!(count = trackers.len(), "resource trackers installed");
        Self { trackers }
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    /// Runs every tracker's check, stopping at the first failure.
    pub fn check(&self, fun_name: &str) -> Result<(), LeakError> {
        self.trackers.iter().try_for_each(|t| t.check(fun_name))
    }
}

impl Drop for TrackerSet {
    fn drop(&mut self) {
        for tracker in &mut self.trackers {
            tracker.uninstall();
        }
    }
}

/// Trackers for the built-in categories: temporary files/directories and
/// child processes.
pub fn default_trackers() -> Vec<Box<dyn ResourceTracker>> {
    vec![
        Box::new(TempFileTracker::new()),
        Box::new(SubprocessTracker::new()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    static WIDGETS: EntryPoint<String> = EntryPoint::new();

    struct WidgetTracker {
        hook: Hook<String>,
        closed: Arc<Mutex<Vec<String>>>,
    }

    impl WidgetTracker {
        fn new() -> Self {
            Self {
                hook: Hook::new(&WIDGETS),
                closed: Arc::default(),
            }
        }
    }

    impl ResourceTracker for WidgetTracker {
        fn install(&mut self) {
            self.hook.install();
        }
        fn uninstall(&mut self) {
            self.hook.uninstall();
        }
        fn tracked_leaks(&self) -> Vec<TrackedLeak> {
            let closed = lock(&self.closed);
            self.hook
                .tracked()
                .iter()
                .filter(|w| !closed.contains(w))
                .map(|w| TrackedLeak {
                    resource: Resource::Handle,
                    ident: w.clone(),
                })
                .collect()
        }
    }

    #[test]
    fn test_record_without_tracker_is_dropped() {
        static LONELY: EntryPoint<u32> = EntryPoint::new();
        assert!(!LONELY.is_redirected());
        LONELY.record(1);
    }

    #[test]
    fn test_install_is_idempotent_and_uninstall_restores() {
        static POINT: EntryPoint<u32> = EntryPoint::new();
        let outer: Sink<u32> = Arc::default();
        POINT.redirect(outer.clone());

        let mut hook = Hook::new(&POINT);
        hook.install();
        hook.install();
        POINT.record(7);
        assert_eq!(*hook.tracked(), vec![7]);

        hook.uninstall();
        hook.uninstall();
        assert!(hook.tracked().is_empty());
        POINT.record(8);
        assert_eq!(*lock(&outer), vec![8]);
    }

    #[test]
    fn test_check_reports_live_resources() {
        let mut tracker = WidgetTracker::new();
        tracker.install();
        WIDGETS.record("w1".into());
        WIDGETS.record("w2".into());
        lock(&tracker.closed).push("w1".into());

        let err = tracker.check("make_widgets").unwrap_err();
        assert_eq!(err.resource(), Some(Resource::Handle));
        let evidence = err.evidence().unwrap();
        assert_eq!(evidence.count, 1);
        assert_eq!(evidence.extras, vec!["w2".to_string()]);

        lock(&tracker.closed).push("w2".into());
        assert!(tracker.check("make_widgets").is_ok());
        tracker.uninstall();
        assert!(!WIDGETS.is_redirected());
    }

    static UNINSTALLED: AtomicBool = AtomicBool::new(false);

    struct Flagging;

    impl ResourceTracker for Flagging {
        fn install(&mut self) {}
        fn uninstall(&mut self) {
            UNINSTALLED.store(true, Ordering::SeqCst);
        }
        fn tracked_leaks(&self) -> Vec<TrackedLeak> {
            vec![TrackedLeak {
                resource: Resource::Subprocess,
                ident: "pid 1".into(),
            }]
        }
    }

    #[test]
    fn test_tracker_set_uninstalls_on_failure() {
        let result = {
            let set = TrackerSet::install(vec![Box::new(Flagging)], &Checkers::default());
            assert_eq!(set.len(), 1);
            set.check("f")
        };
        assert!(result.is_err());
        assert!(UNINSTALLED.load(Ordering::SeqCst));
    }
}
