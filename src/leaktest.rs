//! Leak test orchestration.
//!
//! A [`LeakTest`] holds default [`Options`], the metrics provider and the
//! resource tracker factories. Each `execute*` call runs, in order:
//!
//! 1. option validation (before anything is installed),
//! 2. resource tracker installation,
//! 3. a single call wrapped by the counter check and, if enabled, the
//!    garbage window,
//! 4. tracker checks, then the garbage check,
//! 5. tracker removal (always, also on failure),
//! 6. if memory checking is enabled, warm-up and growth stabilization.
//!
//! The first failing stage aborts the rest.
//!
//! ```no_run
//! use leakprobe::LeakTest;
//!
//! let test = LeakTest::new();
//! test.execute(|| {
//!     let v: Vec<u8> = Vec::with_capacity(128);
//!     drop(v);
//! })
//! .unwrap();
//!
//! // Per-call overrides leave the defaults untouched.
//! test.call().times(50).tolerance(4096u64).execute(|| {}).unwrap();
//! ```

use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use crate::checkers::Checkers;
use crate::collector::{self, MetricsProvider};
use crate::engine::{Quiescer, check_memory, check_oneshot, warmup};
use crate::error::{ConfigError, LeakError};
use crate::gc::GcWindow;
use crate::options::{Options, Tolerance, TrimCallback};
use crate::threads;
use crate::tracking::{ResourceTracker, TrackerSet, default_trackers};

type TrackerFactory = Arc<dyn Fn() -> Box<dyn ResourceTracker> + Send + Sync>;

/// Boxed error produced by a fallible target.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Runs leak checks against targets.
pub struct LeakTest {
    options: Options,
    provider: Arc<dyn MetricsProvider>,
    builtin_trackers: bool,
    trackers: Vec<TrackerFactory>,
    warned_threads: AtomicBool,
}

impl Default for LeakTest {
    fn default() -> Self {
        Self::new()
    }
}

impl LeakTest {
    /// Default options, the platform metrics provider and the built-in
    /// trackers.
    pub fn new() -> Self {
        Self::with_options(Options::default())
    }

    pub fn with_options(options: Options) -> Self {
        Self {
            options,
            provider: Arc::from(collector::default_provider()),
            builtin_trackers: true,
            trackers: Vec::new(),
            warned_threads: AtomicBool::new(false),
        }
    }

    /// Defaults overlaid with `LEAKPROBE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::with_options(Options::from_env()?))
    }

    /// Replaces the metrics provider.
    pub fn provider(mut self, provider: Arc<dyn MetricsProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// Adds a resource category. `factory` creates a fresh tracker for every
    /// execution.
    pub fn tracker<T, F>(mut self, factory: F) -> Self
    where
        T: ResourceTracker + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.trackers
            .push(Arc::new(move || Box::new(factory()) as Box<dyn ResourceTracker>));
        self
    }

    /// Drops every resource tracker, built-in ones included.
    pub fn without_trackers(mut self) -> Self {
        self.builtin_trackers = false;
        self.trackers.clear();
        self
    }

    pub fn times(mut self, times: usize) -> Self {
        self.options.times = times;
        self
    }

    pub fn warmup_times(mut self, warmup_times: usize) -> Self {
        self.options.warmup_times = warmup_times;
        self
    }

    pub fn retries(mut self, retries: usize) -> Self {
        self.options.retries = retries;
        self
    }

    pub fn tolerance(mut self, tolerance: impl Into<Tolerance>) -> Self {
        self.options.tolerance = tolerance.into();
        self
    }

    pub fn checkers(mut self, checkers: Checkers) -> Self {
        self.options.checkers = checkers;
        self
    }

    pub fn trim_callback(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.options.trim_callback = Some(Arc::new(callback));
        self
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Starts a single execution with per-call overrides.
    pub fn call(&self) -> Call<'_> {
        Call {
            test: self,
            options: self.options.clone(),
            name: None,
        }
    }

    /// Full leak test of an infallible target.
    pub fn execute<F: FnMut()>(&self, fun: F) -> Result<(), LeakError> {
        self.call().execute(fun)
    }

    /// Like [`LeakTest::execute`] with an explicit target name.
    pub fn execute_named<F: FnMut()>(&self, name: &str, fun: F) -> Result<(), LeakError> {
        self.call().name(name).execute(fun)
    }

    /// Full leak test of a fallible target; a target error aborts the test as
    /// [`LeakError::Target`].
    pub fn execute_fallible<F, E>(&self, fun: F) -> Result<(), LeakError>
    where
        F: FnMut() -> Result<(), E>,
        E: Into<BoxError>,
    {
        self.call().execute_fallible(fun)
    }

    /// Full leak test of a target that must fail on every call with an error
    /// accepted by `expected`.
    pub fn execute_expect_err<F, T, E, P>(&self, fun: F, expected: P) -> Result<(), LeakError>
    where
        F: FnMut() -> Result<T, E>,
        E: Into<BoxError>,
        P: Fn(&E) -> bool,
    {
        self.call().execute_expect_err(fun, expected)
    }

    fn warn_preexisting_threads(&self) {
        if self.warned_threads.load(Ordering::Relaxed) {
            return;
        }
        let running = threads::enumerate();
        if running.is_empty() {
            return;
        }
        self.warned_threads.store(true, Ordering::Relaxed);
        let names: Vec<String> = running.iter().map(ToString::to_string).collect();
        warn!(
            "{} managed thread(s) already running before the leak test; thread counts may be unreliable: {}",
            running.len(),
            names.join(", ")
        );
    }

    fn run(
        &self,
        options: &Options,
        fun_name: &str,
        call: &mut dyn FnMut() -> Result<(), LeakError>,
    ) -> Result<(), LeakError> {
        let tolerance = options.validate()?;
        self.warn_preexisting_threads();

        let provider = &*self.provider;
        let checkers = &options.checkers;

        {
            let mut trackers = if self.builtin_trackers {
                default_trackers()
            } else {
                Vec::new()
            };
            trackers.extend(self.trackers.iter().map(|factory| factory()));
            let trackers = TrackerSet::install(trackers, checkers);
            let mut window = checkers.gcgarbage.then(GcWindow::open);

            check_oneshot(provider, checkers, fun_name, call)?;
            if let Some(window) = window.as_mut() {
                window.close();
            }

            trackers.check(fun_name)?;
            if let Some(window) = &window {
                window.check(fun_name)?;
            }
        }

        if checkers.memory {
            let quiescer =
                Quiescer::new(provider).with_trim_callback(options.trim_callback.clone());
            warmup(call, options.warmup_times)?;
            check_memory(
                &quiescer,
                fun_name,
                call,
                options.times,
                options.retries,
                &tolerance,
            )?;
        }
        Ok(())
    }
}

/// One execution with its own copy of the options.
pub struct Call<'a> {
    test: &'a LeakTest,
    options: Options,
    name: Option<String>,
}

impl Call<'_> {
    pub fn times(mut self, times: usize) -> Self {
        self.options.times = times;
        self
    }

    pub fn warmup_times(mut self, warmup_times: usize) -> Self {
        self.options.warmup_times = warmup_times;
        self
    }

    pub fn retries(mut self, retries: usize) -> Self {
        self.options.retries = retries;
        self
    }

    pub fn tolerance(mut self, tolerance: impl Into<Tolerance>) -> Self {
        self.options.tolerance = tolerance.into();
        self
    }

    pub fn checkers(mut self, checkers: Checkers) -> Self {
        self.options.checkers = checkers;
        self
    }

    pub fn trim_callback(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        let callback: TrimCallback = Arc::new(callback);
        self.options.trim_callback = Some(callback);
        self
    }

    /// Names the target in errors; defaults to the closure's type name.
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    fn fun_name<F>(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| std::any::type_name::<F>().to_string())
    }

    pub fn execute<F: FnMut()>(self, mut fun: F) -> Result<(), LeakError> {
        let fun_name = self.fun_name::<F>();
        self.test.run(&self.options, &fun_name, &mut || {
            fun();
            Ok(())
        })
    }

    pub fn execute_fallible<F, E>(self, mut fun: F) -> Result<(), LeakError>
    where
        F: FnMut() -> Result<(), E>,
        E: Into<BoxError>,
    {
        let fun_name = self.fun_name::<F>();
        let name = fun_name.clone();
        self.test.run(&self.options, &fun_name, &mut || {
            fun().map_err(|e| LeakError::Target {
                fun_name: name.clone(),
                source: e.into(),
            })
        })
    }

    pub fn execute_expect_err<F, T, E, P>(self, mut fun: F, expected: P) -> Result<(), LeakError>
    where
        F: FnMut() -> Result<T, E>,
        E: Into<BoxError>,
        P: Fn(&E) -> bool,
    {
        let fun_name = self.fun_name::<F>();
        let name = fun_name.clone();
        self.test.run(&self.options, &fun_name, &mut || match fun() {
            Ok(_) => Err(LeakError::DidNotFail {
                fun_name: name.clone(),
            }),
            Err(e) if expected(&e) => Ok(()),
            Err(e) => Err(LeakError::Target {
                fun_name: name.clone(),
                source: e.into(),
            }),
        })
    }
}
