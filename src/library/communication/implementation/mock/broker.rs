use super::super::json::{JsonNotificationPublisher, JsonSubscriptionProvider};
use crate::library::communication::event::{
    Notification, RawNotificationPublisher, RawSubscription, RawSubscriptionProvider,
};
use crate::library::communication::Destination;
use crate::library::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct MockBrokerState {
    subscribers: HashMap<String, Vec<UnboundedSender<Vec<u8>>>>,
    published: Vec<(String, Vec<u8>)>,
}

/// In-memory broker delivering payloads to subscriptions of the same address
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<MockBrokerState>>,
}

impl MockBroker {
    /// Notifications of the given type published to an address, in publication order
    pub fn published<N: Notification>(&self, address: &str) -> Vec<N> {
        self.state
            .lock()
            .unwrap()
            .published
            .iter()
            .filter(|(target, _)| target == address)
            .filter_map(|(_, payload)| serde_json::from_slice(payload).ok())
            .collect()
    }

    /// Addresses to which anything was published, in publication order
    pub fn addresses(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .published
            .iter()
            .map(|(address, _)| address.clone())
            .collect()
    }

    /// Number of subscriptions to an address that are still alive
    pub fn subscriber_count(&self, address: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .subscribers
            .get(address)
            .map(|senders| senders.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or_default()
    }

    /// Injects a raw payload as if it had been published by somebody else
    pub fn inject(&self, address: &str, payload: Vec<u8>) {
        self.deliver(address, payload);
    }

    fn deliver(&self, address: &str, payload: Vec<u8>) {
        let mut state = self.state.lock().unwrap();

        if let Some(senders) = state.subscribers.get_mut(address) {
            senders.retain(|sender| sender.unbounded_send(payload.clone()).is_ok());
        }

        state.published.push((address.to_owned(), payload));
    }
}

impl JsonNotificationPublisher for MockBroker {}
impl JsonSubscriptionProvider for MockBroker {}

#[async_trait]
impl RawNotificationPublisher for MockBroker {
    async fn publish_raw(&self, data: &[u8], destination: &Destination) -> EmptyResult {
        self.deliver(destination.address(), data.to_vec());
        Ok(())
    }
}

#[async_trait]
impl RawSubscriptionProvider for MockBroker {
    async fn subscribe_raw(
        &self,
        destination: &Destination,
    ) -> Result<RawSubscription, BoxedError> {
        let (tx, rx) = unbounded();

        self.state
            .lock()
            .unwrap()
            .subscribers
            .entry(destination.address().to_owned())
            .or_default()
            .push(tx);

        Ok(rx.boxed())
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::library::communication::event::{NotificationPublisher, SubscriptionProvider};
    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct MockNotification(usize);

    impl Notification for MockNotification {
        const DESTINATION: &'static str = "mock";
    }

    #[tokio::test]
    async fn deliver_to_active_subscriptions() {
        let broker = MockBroker::default();
        let destination = Destination::new("mock", "mock.1");

        let mut first = broker
            .subscribe::<MockNotification>(&destination)
            .await
            .unwrap();
        let mut second = broker
            .subscribe::<MockNotification>(&destination)
            .await
            .unwrap();

        broker
            .publish(&MockNotification(42), &destination)
            .await
            .unwrap();

        assert_eq!(first.next().await.unwrap().unwrap(), MockNotification(42));
        assert_eq!(second.next().await.unwrap().unwrap(), MockNotification(42));
    }

    #[tokio::test]
    async fn record_publications() {
        let broker = MockBroker::default();
        let destination = Destination::new("mock", "mock.2");

        broker
            .publish(&MockNotification(1), &destination)
            .await
            .unwrap();
        broker
            .publish(&MockNotification(2), &destination)
            .await
            .unwrap();

        assert_eq!(
            broker.published::<MockNotification>("mock.2"),
            vec![MockNotification(1), MockNotification(2)]
        );
        assert!(broker.published::<MockNotification>("mock.1").is_empty());
    }

    #[tokio::test]
    async fn forget_dropped_subscriptions() {
        let broker = MockBroker::default();
        let destination = Destination::new("mock", "mock.3");

        let subscription = broker.subscribe_raw(&destination).await.unwrap();
        assert_eq!(broker.subscriber_count("mock.3"), 1);

        drop(subscription);
        assert_eq!(broker.subscriber_count("mock.3"), 0);
    }

    #[tokio::test]
    async fn surface_malformed_payloads() {
        let broker = MockBroker::default();
        let destination = Destination::new("mock", "mock.4");

        let mut subscription = broker
            .subscribe::<MockNotification>(&destination)
            .await
            .unwrap();
        broker.inject("mock.4", b"not json".to_vec());

        assert!(subscription.next().await.unwrap().is_err());
    }
}
