//! Structures to communicate between components over a message broker
//!
//! Communication is based on publish and subscribe. Components never talk to each other
//! directly; instead, they publish [`Notifications`](event::Notification) to named
//! [`Destinations`](Destination) and everybody interested may subscribe to them.
//!
//! Destinations are addressed by a logical name (e.g. `statistics`) which is resolved
//! through a naming context into a physical address on the broker. This allows
//! deployments to remap addresses without touching code. Most destinations are further
//! [extended](Destination::extend) by an identifier (e.g. an evaluation or job id) so
//! that every evaluation or job gets its own channel.
//!
//! Concrete implementations live in the [`implementation`] module and are provided to
//! consumers of this module through a [`CommunicationFactory`].

mod communication_factory;
mod destination;
mod error;

pub mod event;
pub mod implementation;

pub use communication_factory::CommunicationFactory;
pub use destination::{Destination, DestinationNotFoundError, DestinationResolver, NamingContext};
pub use error::BlackboxError;
