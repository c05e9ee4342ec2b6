//! Mock implementations for testing.
//!
//! This module provides `MockFs` for driving the procfs provider without a
//! real `/proc`, and `ScriptedProvider` for driving the leak engine with
//! exact, repeatable readings.

mod filesystem;
mod provider;

pub use filesystem::MockFs;
pub use provider::ScriptedProvider;
