//! Runtime harness to execute modules and connect them to the broker

pub mod broker;

mod heart;
mod module;

pub use heart::*;
pub use module::*;
