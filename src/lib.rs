//! This library crate contains everything needed to distribute the statistics of hydrologic-forecast evaluations
//! to independent output consumers and to drive evaluation jobs on a remote execution endpoint.
//!
//! Submodules have been introduced to split responsibilities. Each module has a specific focus
//! and they together form a chain of dependencies from the low-level [`library`], over the evaluation [`domain`]
//! specific types, through the executable [`harness`] which also owns the broker connection, up to the
//! high-level [`modules`](module) that publish, consume and orchestrate.

#![deny(missing_docs)]

pub mod constants;
pub mod domain;
pub mod harness;
pub mod library;
pub mod module;
