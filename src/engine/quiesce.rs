//! Drives the process into a low-noise state before a measurement.

use std::io::Write;

use tracing::debug;

use crate::collector::MetricsProvider;
use crate::error::LeakError;
use crate::gc;
use crate::options::TrimCallback;

/// Flushes, collects and trims before every memory snapshot.
pub struct Quiescer<'a> {
    provider: &'a dyn MetricsProvider,
    trim_callback: Option<TrimCallback>,
}

impl<'a> Quiescer<'a> {
    pub fn new(provider: &'a dyn MetricsProvider) -> Self {
        Self {
            provider,
            trim_callback: None,
        }
    }

    /// Runs `callback` after collection and before pages go back to the OS.
    pub fn with_trim_callback(mut self, callback: Option<TrimCallback>) -> Self {
        self.trim_callback = callback;
        self
    }

    pub fn provider(&self) -> &'a dyn MetricsProvider {
        self.provider
    }

    /// Fails with [`LeakError::PendingGarbage`] if the collector's garbage
    /// register is not empty after a full collection; that garbage belongs to
    /// an earlier step and must not be folded into this measurement.
    pub fn quiesce(&self) -> Result<(), LeakError> {
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();

        let unreachable = gc::collect();
        let pending = gc::garbage().len();
        if pending > 0 {
            return Err(LeakError::PendingGarbage { count: pending });
        }

        if let Some(callback) = &self.trim_callback {
            callback();
        }
        self.provider.heap_trim();
        debug!(unreachable, "quiesced");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::ScriptedProvider;
    use crate::gc::Gc;
    use crate::global_state_lock;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_quiesce_trims_and_calls_back() {
        let _guard = global_state_lock();
        let provider = ScriptedProvider::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let quiescer = Quiescer::new(&provider).with_trim_callback(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        quiescer.quiesce().unwrap();
        quiescer.quiesce().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(provider.trims(), 2);
    }

    #[test]
    fn test_quiesce_collects_unrooted_cycles() {
        let _guard = global_state_lock();
        let provider = ScriptedProvider::new();
        let a = Gc::instance("Node");
        a.set_attr("me", &a).unwrap();
        let id = a.id();
        drop(a);

        Quiescer::new(&provider).quiesce().unwrap();
        assert!(gc::inspect(id).is_none());
    }

    #[test]
    fn test_quiesce_fails_on_pending_garbage() {
        let _guard = global_state_lock();
        let provider = ScriptedProvider::new();
        let previous = gc::set_retain(true);
        let a = Gc::instance("Node");
        a.set_attr("me", &a).unwrap();
        drop(a);

        let err = Quiescer::new(&provider).quiesce().unwrap_err();
        assert!(matches!(err, LeakError::PendingGarbage { count: 1 }));
        assert_eq!(provider.trims(), 0);

        gc::set_retain(previous);
        gc::clear_garbage();
        gc::collect();
    }
}
