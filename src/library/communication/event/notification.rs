use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// Entity to notify other components about an event that took place
pub trait Notification: Serialize + DeserializeOwned + Debug {
    /// Logical name of the destination on which this type is sent and received
    const DESTINATION: &'static str;
}
