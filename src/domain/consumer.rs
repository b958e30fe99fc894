use super::Format;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Unique identifier of a subscriber class instance
pub type ConsumerIdentifier = String;

/// Identity and capabilities of a subscriber class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerDescription {
    /// Unique identifier, stable for the lifetime of the subscriber
    pub consumer_id: ConsumerIdentifier,
    /// Formats the subscriber is able to write
    pub formats: BTreeSet<Format>,
}

impl ConsumerDescription {
    /// Creates a description with an identifier derived from the first format and a random suffix
    pub fn new(formats: impl IntoIterator<Item = Format>) -> Self {
        let formats: BTreeSet<Format> = formats.into_iter().collect();
        let prefix = formats
            .iter()
            .next()
            .map(Format::tag)
            .unwrap_or("consumer");

        Self {
            consumer_id: format!("{}-{}", prefix, Uuid::new_v4().to_simple()),
            formats,
        }
    }
}
