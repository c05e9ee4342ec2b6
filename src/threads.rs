//! Managed threads.
//!
//! Threads started through [`spawn`] or [`Builder`] are registered in a
//! process-global table from the moment `spawn` returns until their body
//! finishes (normally or by unwinding). [`active_count`] and [`enumerate`]
//! read that table; the `py_threads` counter is built on top of them.
//!
//! ```
//! let handle = leakprobe::threads::spawn(|| 2 + 2).unwrap();
//! assert_eq!(handle.join().unwrap(), 4);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{LazyLock, Mutex, MutexGuard};
use std::thread::JoinHandle;

static REGISTRY: LazyLock<Mutex<BTreeMap<u64, ThreadInfo>>> =
    LazyLock::new(|| Mutex::new(BTreeMap::new()));
static NEXT_IDENT: AtomicU64 = AtomicU64::new(1);

fn registry() -> MutexGuard<'static, BTreeMap<u64, ThreadInfo>> {
    REGISTRY.lock().unwrap_or_else(|e| e.into_inner())
}

/// A running managed thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    /// Registry identifier, never reused.
    pub ident: u64,
    pub name: String,
}

impl fmt::Display for ThreadInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Thread({}, started {})>", self.name, self.ident)
    }
}

/// Removes the registry entry when the thread body ends.
struct Registration(u64);

impl Drop for Registration {
    fn drop(&mut self) {
        registry().remove(&self.0);
    }
}

/// Managed counterpart of [`std::thread::Builder`].
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names the thread; defaults to `Thread-<ident>`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Spawns and registers the thread.
    pub fn spawn<F, T>(self, f: F) -> io::Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let ident = NEXT_IDENT.fetch_add(1, Ordering::Relaxed);
        let name = self.name.unwrap_or_else(|| format!("Thread-{ident}"));

        let mut inner = std::thread::Builder::new().name(name.clone());
        if let Some(size) = self.stack_size {
            inner = inner.stack_size(size);
        }

        // Registered before the OS thread exists so the count is exact once
        // spawn returns.
        registry().insert(ident, ThreadInfo { ident, name });
        let registration = Registration(ident);

        inner.spawn(move || {
            let _registration = registration;
            f()
        })
    }
}

/// Spawns a managed thread with default settings.
pub fn spawn<F, T>(f: F) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Builder::new().spawn(f)
}

/// Number of managed threads currently running.
pub fn active_count() -> usize {
    registry().len()
}

/// Managed threads currently running, oldest first.
pub fn enumerate() -> Vec<ThreadInfo> {
    registry().values().cloned().collect()
}
