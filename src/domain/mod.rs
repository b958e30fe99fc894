//! Domain specific structures, implementations, and logic

mod consumer;
mod evaluation;
mod job;

pub mod event;

pub use consumer::*;
pub use evaluation::*;
pub use job::*;
