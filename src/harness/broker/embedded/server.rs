use super::protocol::{read_command, Frame, ProtocolError};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, instrument, trace, warn};

type ClientIdentifier = u64;

/// Frames a client may have queued before it is considered too slow and disconnected
const OUTBOX_CAPACITY: usize = 1024;

/// Bounded queue of encoded frames waiting to be written to one client
#[derive(Clone)]
struct Outbox {
    client: ClientIdentifier,
    sender: mpsc::Sender<Vec<u8>>,
    evicted: Arc<Notify>,
}

impl Outbox {
    fn new(client: ClientIdentifier, capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let outbox = Self {
            client,
            sender,
            evicted: Arc::new(Notify::new()),
        };

        (outbox, receiver)
    }

    /// Queues data for the client and returns whether it was accepted
    ///
    /// A client whose queue is full gets evicted instead of growing the queue.
    fn push(&self, data: Vec<u8>) -> bool {
        match self.sender.try_send(data) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(client = self.client, "Disconnecting broker client which fell behind");
                self.evicted.notify_one();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

type Channels = HashMap<Vec<u8>, HashMap<ClientIdentifier, Outbox>>;

/// Channel subscriptions of all connected clients
#[derive(Default, Clone)]
struct Registry {
    channels: Arc<Mutex<Channels>>,
}

impl Registry {
    fn channels(&self) -> MutexGuard<'_, Channels> {
        self.channels.lock().unwrap_or_else(|poisoned| {
            warn!("Broker registry lock poisoned, continuing with its last state");
            poisoned.into_inner()
        })
    }

    fn subscribe(&self, channel: &[u8], outbox: Outbox) {
        self.channels()
            .entry(channel.to_vec())
            .or_default()
            .insert(outbox.client, outbox);
    }

    fn unsubscribe(&self, channel: &[u8], client: ClientIdentifier) {
        let mut channels = self.channels();

        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.remove(&client);

            if subscribers.is_empty() {
                channels.remove(channel);
            }
        }
    }

    /// Delivers the payload to every subscriber and returns how many received it
    fn publish(&self, channel: &[u8], payload: &[u8]) -> usize {
        let mut message = Vec::with_capacity(payload.len() + channel.len() + 32);
        Frame::Array(vec![
            Frame::bulk("message"),
            Frame::bulk(channel),
            Frame::bulk(payload),
        ])
        .encode(&mut message);

        match self.channels().get_mut(channel) {
            Some(subscribers) => {
                subscribers.retain(|_, outbox| outbox.push(message.clone()));
                subscribers.len()
            }
            None => 0,
        }
    }
}

/// Accepts clients until the shutdown signal flips
pub(super) async fn serve(listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    let registry = Registry::default();
    let mut next_client: ClientIdentifier = 0;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    next_client += 1;
                    let connection = Connection::new(next_client, registry.clone());
                    tokio::spawn(connection.handle(stream, peer, shutdown.clone()));
                }
                Err(e) => warn!(error = %e, "Failed to accept broker client"),
            },
            _ = shutdown.changed() => break,
        }
    }

    debug!("Embedded broker stopped accepting clients");
}

struct Connection {
    id: ClientIdentifier,
    registry: Registry,
    subscriptions: BTreeSet<Vec<u8>>,
}

impl Connection {
    fn new(id: ClientIdentifier, registry: Registry) -> Self {
        Self {
            id,
            registry,
            subscriptions: BTreeSet::new(),
        }
    }

    #[instrument(name = "broker_client", skip(self, stream, peer, shutdown), fields(client = self.id, %peer))]
    async fn handle(
        mut self,
        stream: TcpStream,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) {
        trace!("Client connected");

        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        let (outbox, mut inbox) = Outbox::new(self.id, OUTBOX_CAPACITY);
        let evicted = outbox.evicted.clone();

        let writer = tokio::spawn(async move {
            while let Some(data) = inbox.recv().await {
                if write.write_all(&data).await.is_err() {
                    break;
                }
            }

            write.shutdown().await.ok();
        });

        let mut lagging = false;

        loop {
            let command = tokio::select! {
                command = read_command(&mut reader) => command,
                _ = shutdown.changed() => break,
                _ = evicted.notified() => {
                    lagging = true;
                    break;
                }
            };

            match command {
                Ok(Some(arguments)) if arguments.is_empty() => {}
                Ok(Some(arguments)) => {
                    if !self.execute(arguments, &outbox) {
                        break;
                    }
                }
                Ok(None) => break,
                Err(ProtocolError::Malformed(message)) => {
                    debug!(%message, "Client sent malformed command");
                    reply(&outbox, Frame::Error(format!("ERR {}", message)));
                    break;
                }
                Err(ProtocolError::Io(e)) => {
                    trace!(error = %e, "Client connection failed");
                    break;
                }
            }
        }

        for channel in std::mem::take(&mut self.subscriptions) {
            self.registry.unsubscribe(&channel, self.id);
        }

        drop(outbox);

        if lagging {
            // Nobody reads the socket, draining the queue would block forever
            writer.abort();
        } else {
            writer.await.ok();
        }

        trace!("Client disconnected");
    }

    /// Runs one command and returns whether the connection stays open
    fn execute(&mut self, mut arguments: Vec<Vec<u8>>, outbox: &Outbox) -> bool {
        let name = String::from_utf8_lossy(&arguments[0]).to_uppercase();
        let parameters = arguments.split_off(1);

        if !self.subscriptions.is_empty()
            && !matches!(name.as_str(), "SUBSCRIBE" | "UNSUBSCRIBE" | "PING" | "QUIT")
        {
            reply(
                outbox,
                Frame::Error(format!(
                    "ERR Can't execute '{}': only SUBSCRIBE / UNSUBSCRIBE / PING / QUIT are allowed in this context",
                    name.to_lowercase()
                )),
            );
            return true;
        }

        match (name.as_str(), parameters.len()) {
            ("PING", 0) if !self.subscriptions.is_empty() => {
                reply(outbox, Frame::Array(vec![Frame::bulk("pong"), Frame::bulk("")]))
            }
            ("PING", 0) => reply(outbox, Frame::Simple("PONG")),
            ("PING", 1) if !self.subscriptions.is_empty() => reply(
                outbox,
                Frame::Array(vec![Frame::bulk("pong"), Frame::bulk(parameters[0].clone())]),
            ),
            ("PING", 1) | ("ECHO", 1) => reply(outbox, Frame::bulk(parameters[0].clone())),
            ("PUBLISH", 2) => {
                let receivers = self.registry.publish(&parameters[0], &parameters[1]);
                reply(outbox, Frame::Integer(receivers as i64));
            }
            ("SUBSCRIBE", count) if count > 0 => {
                for channel in parameters {
                    self.subscriptions.insert(channel.clone());

                    // Confirmation has to be queued before any message of the channel
                    reply(
                        outbox,
                        Frame::Array(vec![
                            Frame::bulk("subscribe"),
                            Frame::bulk(channel.clone()),
                            Frame::Integer(self.subscriptions.len() as i64),
                        ]),
                    );

                    self.registry.subscribe(&channel, outbox.clone());
                }
            }
            ("UNSUBSCRIBE", _) => self.unsubscribe(parameters, outbox),
            ("SELECT", 1) | ("AUTH", 1) | ("AUTH", 2) | ("CLIENT", _) => {
                reply(outbox, Frame::Simple("OK"))
            }
            ("QUIT", _) => {
                reply(outbox, Frame::Simple("OK"));
                return false;
            }
            ("PING", _) | ("ECHO", _) | ("PUBLISH", _) | ("SUBSCRIBE", _) | ("SELECT", _)
            | ("AUTH", _) => reply(
                outbox,
                Frame::Error(format!(
                    "ERR wrong number of arguments for '{}' command",
                    name.to_lowercase()
                )),
            ),
            _ => reply(
                outbox,
                Frame::Error(format!("ERR unknown command '{}'", name.to_lowercase())),
            ),
        }

        true
    }

    fn unsubscribe(&mut self, channels: Vec<Vec<u8>>, outbox: &Outbox) {
        let channels: Vec<Vec<u8>> = if channels.is_empty() {
            self.subscriptions.iter().cloned().collect()
        } else {
            channels
        };

        if channels.is_empty() {
            reply(
                outbox,
                Frame::Array(vec![
                    Frame::bulk("unsubscribe"),
                    Frame::Bulk(None),
                    Frame::Integer(0),
                ]),
            );
            return;
        }

        for channel in channels {
            self.registry.unsubscribe(&channel, self.id);
            self.subscriptions.remove(&channel);

            reply(
                outbox,
                Frame::Array(vec![
                    Frame::bulk("unsubscribe"),
                    Frame::bulk(channel),
                    Frame::Integer(self.subscriptions.len() as i64),
                ]),
            );
        }
    }
}

fn reply(outbox: &Outbox, frame: Frame) {
    let mut buffer = Vec::new();
    frame.encode(&mut buffer);
    outbox.push(buffer);
}
