//! Measurement stages composed by [`crate::LeakTest`].
//!
//! Every stage drives the target through a `&mut dyn FnMut() -> Result<(),
//! LeakError>`; adapting user closures (naming, error mapping, expected
//! failures) happens in the orchestrator.

pub mod growth;
pub mod oneshot;
pub mod quiesce;

pub use growth::{check_memory, is_stable, warmup};
pub use oneshot::{check_oneshot, counter_snapshot};
pub use quiesce::Quiescer;
