//! In-memory implementations for tests
//!
//! The [`MockBroker`] delivers payloads to every active subscription of a destination
//! just like a real broker would, and additionally records everything that has been published
//! so that tests can assert on the traffic afterwards.

mod broker;
mod factory;

pub use broker::*;
pub use factory::*;
