use super::super::super::super::EmptyResult;
use super::super::super::event::RawNotificationPublisher;
use super::super::super::Destination;
use super::super::json::JsonNotificationPublisher;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::trace;

/// [`NotificationPublisher`](super::super::super::event::NotificationPublisher) implementation using [`PUBLISH`](https://redis.io/commands/publish)
///
/// All clones share one multiplexed connection which may be used concurrently.
#[derive(Clone)]
pub struct RedisPublisher {
    con: MultiplexedConnection,
}

impl RedisPublisher {
    /// Creates a new instance from an existing multiplexed connection
    pub fn new(con: MultiplexedConnection) -> Self {
        Self { con }
    }
}

impl JsonNotificationPublisher for RedisPublisher {}

#[async_trait]
impl RawNotificationPublisher for RedisPublisher {
    async fn publish_raw(&self, data: &[u8], destination: &Destination) -> EmptyResult {
        let mut con = self.con.clone();
        let receivers: usize = con.publish(destination.address(), data).await?;

        trace!(%destination, receivers, "Published notification");

        Ok(())
    }
}
