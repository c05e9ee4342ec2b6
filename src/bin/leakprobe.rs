//! leakprobe - runs a built-in scenario under the leak test harness.
//!
//! Useful to check how the harness behaves on this machine: the `noop`
//! scenario must pass, every `leak-*` scenario must fail with the matching
//! error.

use std::fs::File;
use std::io;
use std::process::{Command, ExitCode, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
use leakprobe::collector::jemalloc::Jemalloc;
use leakprobe::gc::Gc;
use leakprobe::tracking::{subprocess, tempfiles};
use leakprobe::{
    Checkers, GarbageEvidence, LeakError, LeakEvidence, LeakTest, Options, Resource, Tolerance,
    threads,
};

#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Objects kept alive on purpose by the leaking scenarios.
static HOARD: Mutex<Vec<Box<dyn std::any::Any + Send>>> = Mutex::new(Vec::new());

fn hoard<T: Send + 'static>(value: T) {
    HOARD
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(Box::new(value));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Allocates and frees a buffer.
    Noop,
    /// Keeps 1K per call.
    LeakHeap,
    /// Opens /dev/null and never closes it.
    LeakFd,
    /// Starts a managed thread that outlives the call.
    LeakThread,
    /// Creates a temporary file and never deletes it.
    LeakTempfile,
    /// Spawns `sleep` and never waits for it.
    LeakChild,
    /// Builds an unreachable reference cycle.
    Cycle,
}

/// Leak test harness demo.
#[derive(Parser)]
#[command(name = "leakprobe", about = "Runs a scenario under the leak test harness", version)]
struct Args {
    /// Scenario to run.
    #[arg(value_enum)]
    scenario: Scenario,

    /// Calls per measurement round.
    #[arg(long)]
    times: Option<usize>,

    /// Unmeasured calls before the memory check.
    #[arg(long)]
    warmup_times: Option<usize>,

    /// Maximum measurement rounds.
    #[arg(long)]
    retries: Option<usize>,

    /// Allowed growth per round (e.g., "4K", "1M" or "rss=1M,heap=0").
    #[arg(long, value_parser = parse_tolerance)]
    tolerance: Option<Tolerance>,

    /// Run only these checkers (comma-separated).
    #[arg(long, value_delimiter = ',', conflicts_with = "exclude")]
    only: Vec<String>,

    /// Skip these checkers (comma-separated).
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,

    /// Print the failure as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

fn parse_tolerance(s: &str) -> Result<Tolerance, String> {
    s.parse().map_err(|e: leakprobe::ConfigError| e.to_string())
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = format!("leakprobe={}", level).parse() {
        filter = filter.add_directive(directive);
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Failure report printed with `--json`.
#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Report<'a> {
    Unclosed {
        resource: Resource,
        #[serde(flatten)]
        evidence: &'a LeakEvidence,
    },
    UncollectableGarbage(&'a GarbageEvidence),
    MemoryLeak {
        fun_name: &'a str,
        transcript: Vec<&'a str>,
    },
    Error {
        message: String,
    },
}

impl<'a> From<&'a LeakError> for Report<'a> {
    fn from(err: &'a LeakError) -> Self {
        match err {
            LeakError::Unclosed { resource, evidence } => Report::Unclosed {
                resource: *resource,
                evidence,
            },
            LeakError::UncollectableGarbage(evidence) => Report::UncollectableGarbage(evidence),
            LeakError::MemoryLeak {
                fun_name,
                transcript,
            } => Report::MemoryLeak {
                fun_name,
                transcript: transcript.lines().collect(),
            },
            other => Report::Error {
                message: other.to_string(),
            },
        }
    }
}

fn options(args: &Args) -> Result<Options, LeakError> {
    let mut options = Options::from_env()?;
    if let Some(times) = args.times {
        options.times = times;
    }
    if let Some(warmup_times) = args.warmup_times {
        options.warmup_times = warmup_times;
    }
    if let Some(retries) = args.retries {
        options.retries = retries;
    }
    if let Some(tolerance) = &args.tolerance {
        options.tolerance = tolerance.clone();
    }
    if !args.only.is_empty() {
        options.checkers = Checkers::only(args.only.as_slice())?;
    } else if !args.exclude.is_empty() {
        options.checkers = Checkers::exclude(args.exclude.as_slice())?;
    }
    Ok(options)
}

fn run(scenario: Scenario, test: &LeakTest) -> Result<(), LeakError> {
    let name = scenario
        .to_possible_value()
        .map(|v| v.get_name().to_string())
        .unwrap_or_default();

    let named = || test.call().name(&name);

    match scenario {
        Scenario::Noop => test.execute_named(&name, || {
            let buf = vec![0u8; 4096];
            std::hint::black_box(&buf);
        }),
        Scenario::LeakHeap => test.execute_named(&name, || hoard(vec![0u8; 1024])),
        Scenario::LeakFd => named().execute_fallible(|| -> io::Result<()> {
            hoard(File::open("/dev/null")?);
            Ok(())
        }),
        Scenario::LeakThread => named().execute_fallible(|| -> io::Result<()> {
            threads::Builder::new()
                .name("sleeper")
                .spawn(|| std::thread::sleep(Duration::from_secs(2)))?;
            Ok(())
        }),
        Scenario::LeakTempfile => named().execute_fallible(|| -> io::Result<()> {
            // Only the path survives; the descriptor is closed here.
            let (_file, path) = tempfiles::mkstemp()?;
            hoard(path);
            Ok(())
        }),
        Scenario::LeakChild => named().execute_fallible(|| -> io::Result<()> {
            let child = subprocess::spawn(
                Command::new("sleep")
                    .arg("2")
                    .stdin(Stdio::null())
                    .stdout(Stdio::null()),
            )?;
            hoard(child);
            Ok(())
        }),
        Scenario::Cycle => test.execute_named(&name, || {
            let a = Gc::instance("Leaky");
            let b = Gc::instance("Leaky");
            let _ = a.set_attr("other", &b);
            let _ = b.set_attr("other", &a);
        }),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let result = options(&args).and_then(|options| {
        info!("running '{:?}' with {:?}", args.scenario, options);
        run(args.scenario, &LeakTest::with_options(options))
    });

    match result {
        Ok(()) => {
            info!("no leaks detected");
            ExitCode::SUCCESS
        }
        Err(err) => {
            if args.json {
                match serde_json::to_string_pretty(&Report::from(&err)) {
                    Ok(json) => println!("{json}"),
                    Err(e) => error!("failed to serialize report: {}", e),
                }
            }
            error!("{}", err);
            if err.is_leak() {
                ExitCode::from(1)
            } else {
                ExitCode::from(2)
            }
        }
    }
}
