//! Structures to realise event-driven communication
//!
//! Components have no direct knowledge of each other. Whenever something noteworthy
//! happens, a [`Notification`] describing it is published to a [`Destination`](super::Destination)
//! and every interested party that [subscribed](SubscriptionProvider) to the same destination
//! receives it.
//!
//! Delivery is fire-and-forget: a notification published before somebody subscribed is not
//! delivered to them. Protocols built on top of this module therefore subscribe first and
//! announce their presence afterwards, so that the counterpart knows when it is safe to publish.
//! Notifications published from one publisher to one destination arrive in order.

mod notification;
mod publisher;
mod subscription;

pub use notification::*;
pub use publisher::*;
pub use subscription::*;
