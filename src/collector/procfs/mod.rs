//! Metrics provider backed by the Linux `/proc` filesystem.
//!
//! This module provides parsers for `/proc/self` files and the
//! [`ProcfsProvider`] that turns them into snapshots.

pub mod parser;
mod provider;

pub use parser::ParseError;
pub use provider::ProcfsProvider;
