//! Serialization and deserialization provided by [`serde_json`] using marker traits
//!
//! This module allows implementors of traits that allow raw access to underlying messaging systems
//! to provide the higher-level traits relying on serialization. It does so by providing a number of
//! marker traits which, when implemented, provide default implementations of the higher-level traits
//! by translating between lower-level serialized data and higher-level strongly typed data by using
//! [`serde_json`]. Exchanging the serialization format only requires changing the marker traits.

use super::super::event::{
    Notification, NotificationPublisher, RawNotificationPublisher, RawSubscriptionProvider,
    Subscription, SubscriptionProvider,
};
use super::super::Destination;
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::StreamExt;

/// Marker trait providing a default [`NotificationPublisher`] implementation based on [`serde_json`]
pub trait JsonNotificationPublisher: RawNotificationPublisher + Send + Sync {}

#[async_trait]
impl<P> NotificationPublisher for P
where
    P: JsonNotificationPublisher,
{
    /// Serializes the notification using [`serde_json::to_vec`]
    async fn publish<N: Notification + Send + Sync>(
        &self,
        notification: &N,
        destination: &Destination,
    ) -> EmptyResult {
        let data = serde_json::to_vec(notification)?;
        self.publish_raw(&data, destination).await
    }
}

/// Marker trait providing a default [`SubscriptionProvider`] implementation based on [`serde_json`]
pub trait JsonSubscriptionProvider: RawSubscriptionProvider + Send + Sync {}

#[async_trait]
impl<P> SubscriptionProvider for P
where
    P: JsonSubscriptionProvider,
{
    /// Parses every payload using [`serde_json::from_slice`]
    async fn subscribe<N: Notification + Send + 'static>(
        &self,
        destination: &Destination,
    ) -> Result<Subscription<N>, BoxedError> {
        let stream = self
            .subscribe_raw(destination)
            .await?
            .map(|payload| serde_json::from_slice::<N>(&payload).map_err(Into::into))
            .boxed();

        Ok(stream)
    }
}
