use super::super::super::super::BoxedError;
use super::super::super::event::{RawSubscription, RawSubscriptionProvider};
use super::super::super::Destination;
use super::super::json::JsonSubscriptionProvider;
use async_trait::async_trait;
use futures::StreamExt;
use redis::Client;
use tracing::debug;

/// [`SubscriptionProvider`](super::super::super::event::SubscriptionProvider) implementation using [`SUBSCRIBE`](https://redis.io/commands/subscribe)
///
/// Every subscription opens a dedicated connection as Redis does not permit
/// regular commands on a connection in subscriber mode.
#[derive(Clone)]
pub struct RedisSubscriptionProvider {
    client: Client,
}

impl RedisSubscriptionProvider {
    /// Creates a new instance opening connections through the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl JsonSubscriptionProvider for RedisSubscriptionProvider {}

#[async_trait]
impl RawSubscriptionProvider for RedisSubscriptionProvider {
    async fn subscribe_raw(
        &self,
        destination: &Destination,
    ) -> Result<RawSubscription, BoxedError> {
        let con = self.client.get_async_connection().await?;
        let mut pubsub = con.into_pubsub();

        pubsub.subscribe(destination.address()).await?;
        debug!(%destination, "Subscribed");

        let stream = pubsub
            .into_on_message()
            .map(|message| message.get_payload_bytes().to_vec())
            .boxed();

        Ok(stream)
    }
}
