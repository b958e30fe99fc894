use super::super::super::BoxedError;
use super::super::Destination;
use super::Notification;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Stream of raw payloads received on a subscription
///
/// The stream ends when the underlying connection is closed. Dropping it unsubscribes.
pub type RawSubscription = BoxStream<'static, Vec<u8>>;

/// Stream of notifications received on a subscription
///
/// Individual items fail when a payload can not be decoded, the stream continues afterwards.
pub type Subscription<N> = BoxStream<'static, Result<N, BoxedError>>;

/// Structure which allows subscribing to destinations and receiving raw payloads
#[async_trait]
pub trait RawSubscriptionProvider {
    /// Subscribes to a [`Destination`]
    ///
    /// The returned future only resolves once the subscription is active on the broker,
    /// thus anything published afterwards is guaranteed to be received.
    async fn subscribe_raw(&self, destination: &Destination)
        -> Result<RawSubscription, BoxedError>;
}

/// Provider of typed [`Subscriptions`](Subscription)
#[async_trait]
pub trait SubscriptionProvider {
    /// Subscribes to a [`Destination`] and decodes every payload into a [`Notification`]
    async fn subscribe<N: Notification + Send + 'static>(
        &self,
        destination: &Destination,
    ) -> Result<Subscription<N>, BoxedError>;
}
