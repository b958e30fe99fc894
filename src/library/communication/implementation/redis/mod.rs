//! Trait implementations using [`redis`](::redis)
//!
//! Notifications are transported over Redis PubSub channels named after the physical
//! address of their [`Destination`](super::super::Destination). Any server speaking the
//! Redis protocol, including the embedded broker, can be used.

mod publisher;
mod subscription;

pub use publisher::*;
pub use subscription::*;
