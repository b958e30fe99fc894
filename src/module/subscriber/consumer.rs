use crate::domain::{ConsumerDescription, EvaluationDescriptor, StatisticsMessage};
use crate::library::{BoxedError, EmptyResult};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Failure of a consumer, classified by whether consumption may continue
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// The offending input is skipped and consumption continues
    #[error("recoverable consumer error")]
    Recoverable(#[source] BoxedError),
    /// Consumption of the evaluation has to be aborted
    #[error("unrecoverable consumer error")]
    Unrecoverable(#[source] BoxedError),
}

impl ConsumerError {
    /// Wraps an error as recoverable
    pub fn recoverable(error: impl Into<BoxedError>) -> Self {
        ConsumerError::Recoverable(error.into())
    }

    /// Wraps an error as unrecoverable
    pub fn unrecoverable(error: impl Into<BoxedError>) -> Self {
        ConsumerError::Unrecoverable(error.into())
    }

    /// Whether consumption may continue after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ConsumerError::Recoverable(_))
    }
}

/// Set of artifacts written by a consumer
pub type Artifacts = BTreeSet<PathBuf>;

/// Function consuming one statistics message at a time
///
/// May be invoked from multiple threads, implementations serialize access to shared writers themselves.
pub type MessageConsumer =
    Arc<dyn Fn(&StatisticsMessage) -> Result<Artifacts, ConsumerError> + Send + Sync>;

/// Function consuming every message of a group once the group is complete
pub type GroupConsumer =
    Arc<dyn Fn(&[StatisticsMessage]) -> Result<Artifacts, ConsumerError> + Send + Sync>;

/// Output technology plugged into a subscriber
///
/// A factory builds fresh consumers for every evaluation, consumers of different evaluations never share state.
pub trait ConsumerFactory: Send + Sync {
    /// Identity and formats of this subscriber class, stable for the lifetime of the factory
    fn describe(&self) -> ConsumerDescription;

    /// Builds the consumer invoked for every message of an evaluation
    fn build_message_consumer(
        &self,
        evaluation: &Arc<EvaluationDescriptor>,
        output_dir: &Path,
    ) -> Result<MessageConsumer, ConsumerError>;

    /// Builds the consumer invoked for every completed group of an evaluation
    fn build_group_consumer(
        &self,
        evaluation: &Arc<EvaluationDescriptor>,
        output_dir: &Path,
    ) -> Result<GroupConsumer, ConsumerError>;

    /// Releases resources held across evaluations
    ///
    /// Safe to call without any prior use. Implementations attempt to release every resource
    /// even when releasing an earlier one fails.
    fn close(&self) -> EmptyResult {
        Ok(())
    }
}
