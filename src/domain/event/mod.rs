//! Notifications exchanged between publishers, subscribers and orchestrators
//!
//! The distribution of one evaluation follows a small protocol:
//!
//! 1. The publisher subscribes to the evaluation's [acknowledgement](SubscriberNotification) destination
//!    and sends an [`EvaluationAnnouncedNotification`], repeating it until the evaluation is done.
//! 2. Every subscriber class that can write one of the declared formats subscribes to its own
//!    [statistics](EvaluationFrame) destination and answers with [`SubscriberNotification::Ready`].
//! 3. The publisher replays every frame of the evaluation to the new subscriber and forwards
//!    later frames as they are produced.
//! 4. Subscribers answer each [`EvaluationFrame::GroupComplete`] with [`SubscriberNotification::GroupConsumed`]
//!    listing the artifacts written, or report [`SubscriberNotification::Failed`].
//! 5. While the evaluation is open the publisher sends [`EvaluationFrame::KeepAlive`] frames and
//!    every subscriber sends [`SubscriberNotification::Alive`] heartbeats, so both sides notice
//!    when the other one went away.

mod announcement;
mod frame;
mod job;
mod subscriber;

pub use announcement::*;
pub use frame::*;
pub use job::*;
pub use subscriber::*;
