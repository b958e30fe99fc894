use super::event::{NotificationPublisher, SubscriptionProvider};
use super::DestinationResolver;

/// Factory to provide implementations for the traits from this module
///
/// Instances are shared between all sessions of a process, thus the provided
/// publishers and subscription providers have to be cheap to clone and safe to use concurrently.
pub trait CommunicationFactory: DestinationResolver {
    /// [`NotificationPublisher`] implementation type
    type NotificationPublisher: NotificationPublisher + Clone + Send + Sync + 'static;
    /// [`SubscriptionProvider`] implementation type
    type SubscriptionProvider: SubscriptionProvider + Clone + Send + Sync + 'static;

    /// Instantiates a new [`NotificationPublisher`]
    fn notification_publisher(&self) -> Self::NotificationPublisher;
    /// Instantiates a new [`SubscriptionProvider`]
    fn subscription_provider(&self) -> Self::SubscriptionProvider;
}
