use super::super::super::EmptyResult;
use super::super::Destination;
use super::Notification;
use async_trait::async_trait;

/// Structure which allows publishing of serialized data to a destination
#[async_trait]
pub trait RawNotificationPublisher {
    /// Sends an opaque payload to a [`Destination`]
    async fn publish_raw(&self, data: &[u8], destination: &Destination) -> EmptyResult;
}

/// Publisher for [`Notifications`](Notification)
#[async_trait]
pub trait NotificationPublisher {
    /// Publishes a [`Notification`] to the given destination
    async fn publish<N: Notification + Send + Sync>(
        &self,
        notification: &N,
        destination: &Destination,
    ) -> EmptyResult;
}
