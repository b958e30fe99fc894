use super::MockBroker;
use crate::constants::destinations::DEFAULT_ADDRESSES;
use crate::library::communication::{
    CommunicationFactory, Destination, DestinationNotFoundError, DestinationResolver,
    NamingContext,
};

/// [`CommunicationFactory`] backed by a shared [`MockBroker`]
///
/// Clones share the same broker, so multiple components talking through different
/// factory instances still see each other's notifications.
#[derive(Clone)]
pub struct MockCommunicationFactory {
    broker: MockBroker,
    naming: NamingContext,
}

impl Default for MockCommunicationFactory {
    fn default() -> Self {
        Self {
            broker: MockBroker::default(),
            naming: DEFAULT_ADDRESSES.iter().copied().collect(),
        }
    }
}

impl MockCommunicationFactory {
    /// Broker shared by all clones of this factory
    pub fn broker(&self) -> &MockBroker {
        &self.broker
    }
}

impl DestinationResolver for MockCommunicationFactory {
    fn lookup(&self, name: &str) -> Result<Destination, DestinationNotFoundError> {
        self.naming.lookup(name)
    }
}

impl CommunicationFactory for MockCommunicationFactory {
    type NotificationPublisher = MockBroker;
    type SubscriptionProvider = MockBroker;

    fn notification_publisher(&self) -> Self::NotificationPublisher {
        self.broker.clone()
    }

    fn subscription_provider(&self) -> Self::SubscriptionProvider {
        self.broker.clone()
    }
}
