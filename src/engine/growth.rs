//! Multi-round memory growth stabilization.
//!
//! A single batch of calls is dominated by allocator and OS noise. Each
//! round therefore runs a larger batch than the previous one (the batch grows
//! by the base size every round): a real leak grows with the call count, while
//! one-time warm allocations reach a ceiling. A round is accepted as stable
//! when no metric grew beyond its tolerance or beyond the previous round.

use std::time::Instant;

use tracing::{debug, info, warn};

use super::quiesce::Quiescer;
use crate::collector::snapshot::{Metric, MetricDiff};
use crate::error::LeakError;
use crate::fmt::format_run_line;
use crate::options::ResolvedTolerance;

/// Invokes `call` `times` times outside any measurement.
pub fn warmup(
    call: &mut dyn FnMut() -> Result<(), LeakError>,
    times: usize,
) -> Result<(), LeakError> {
    for _ in 0..times {
        call()?;
    }
    Ok(())
}

/// Returns `true` if no metric grew beyond its tolerance and beyond the
/// previous round's growth (zero before the first round).
pub fn is_stable(diff: &MetricDiff, prev: Option<&MetricDiff>, tolerance: &ResolvedTolerance) -> bool {
    Metric::ALL.iter().all(|&m| {
        let d = diff.get(m);
        let allowed = i64::try_from(tolerance.get(m)).unwrap_or(i64::MAX);
        d <= allowed || d <= prev.map_or(0, |p| p.get(m))
    })
}

/// Measures memory growth across one batch of `times` calls.
fn call_ntimes(
    quiescer: &Quiescer<'_>,
    call: &mut dyn FnMut() -> Result<(), LeakError>,
    times: usize,
) -> Result<MetricDiff, LeakError> {
    quiescer.quiesce()?;
    let mem1 = quiescer.provider().memory();

    for _ in 0..times {
        call()?;
    }

    quiescer.quiesce()?;
    let mem2 = quiescer.provider().memory();
    Ok(mem2.diff(&mem1))
}

/// Runs up to `retries` measurement rounds and fails with
/// [`LeakError::MemoryLeak`] if none of them is stable.
pub fn check_memory(
    quiescer: &Quiescer<'_>,
    fun_name: &str,
    call: &mut dyn FnMut() -> Result<(), LeakError>,
    times: usize,
    retries: usize,
    tolerance: &ResolvedTolerance,
) -> Result<(), LeakError> {
    let mut prev: Option<MetricDiff> = None;
    let mut messages = Vec::new();
    let mut batch = times;

    for idx in 1..=retries {
        let started = Instant::now();
        let diff = call_ntimes(quiescer, call, batch)?;
        debug!(
            "round {} of '{}': {} calls in {:?}",
            idx,
            fun_name,
            batch,
            started.elapsed()
        );

        let grew = diff.any_growth();
        if grew {
            let line = format_run_line(idx, &diff, batch);
            warn!("{}", line);
            messages.push(line);
        }

        if is_stable(&diff, prev.as_ref(), tolerance) {
            if idx > 1 && grew {
                info!("memory stabilized (no further growth detected)");
            }
            return Ok(());
        }

        prev = Some(diff);
        batch += times;
    }

    let mut transcript = format!("memory kept increasing after {} runs", retries);
    for line in &messages {
        transcript.push('\n');
        transcript.push_str(line);
    }
    Err(LeakError::MemoryLeak {
        fun_name: fun_name.to_string(),
        transcript,
    })
}
