//! Publishing side of an evaluation
//!
//! An [`EvaluationSession`] announces an evaluation, streams its statistics to every
//! subscriber class that registers and tracks which groups have been consumed by whom.
//! Subscribers may join at any time as every frame is replayed to late joiners.

mod error;
mod session;
mod tracker;

pub use error::{EvaluationTimeoutError, PendingAcknowledgement, PublisherError};
pub use session::{EvaluationPublisher, EvaluationSession, PublisherOptions};
