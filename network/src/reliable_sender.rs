use bytes::Bytes;
use futures::sink::SinkExt as _;
use futures::stream::StreamExt as _;
use log::{debug, warn};
use rand::prelude::SliceRandom as _;
use rand::rngs::SmallRng;
use rand::SeedableRng as _;
use std::{collections::HashMap, net::SocketAddr};
use tokio::net::TcpStream;
use tokio::sync::{
    mpsc::{channel, Receiver, Sender},
    oneshot,
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Resolves once the receiver has answered with a reply frame. Dropping it
/// cancels the delivery attempt.
pub type CancelHandler = oneshot::Receiver<Bytes>;

/// The size of per-connection delivery queues.
const CHANNEL_SIZE: usize = 1_000;

/// A sender that keeps one connection task per destination, reconnects with
/// exponential backoff, and hands the caller a handler resolving on the
/// destination's reply.
pub struct ReliableSender {
    /// One delivery queue per destination.
    connections: HashMap<SocketAddr, Sender<(Bytes, oneshot::Sender<Bytes>)>>,
    /// Used to pick random destinations in `lucky_broadcast`.
    rng: SmallRng,
}

impl Default for ReliableSender {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliableSender {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
            rng: SmallRng::from_entropy(),
        }
    }

    /// Reliably send a message, returning a handler resolving on the reply.
    pub async fn send(&mut self, address: SocketAddr, data: Bytes) -> CancelHandler {
        let (sender, receiver) = oneshot::channel();
        let connection = self.connections.entry(address).or_insert_with(|| {
            let (tx, rx) = channel(CHANNEL_SIZE);
            Connection::spawn(address, rx);
            tx
        });
        connection
            .send((data, sender))
            .await
            .expect("Connection task exited while its queue was still held");
        receiver
    }

    /// Send the same message to many destinations.
    pub async fn broadcast(
        &mut self,
        addresses: Vec<SocketAddr>,
        data: Bytes,
    ) -> Vec<CancelHandler> {
        let mut handlers = Vec::new();
        for address in addresses {
            handlers.push(self.send(address, data.clone()).await);
        }
        handlers
    }

    /// Send the message to a random subset of destinations.
    pub async fn lucky_broadcast(
        &mut self,
        mut addresses: Vec<SocketAddr>,
        data: Bytes,
        nodes: usize,
    ) -> Vec<CancelHandler> {
        addresses.shuffle(&mut self.rng);
        addresses.truncate(nodes);
        self.broadcast(addresses, data).await
    }
}

/// One connection task: drains its delivery queue, writing each frame and
/// waiting for the matching reply before resolving the caller's handler.
/// Undelivered messages survive reconnections.
struct Connection {
    address: SocketAddr,
    receiver: Receiver<(Bytes, oneshot::Sender<Bytes>)>,
}

impl Connection {
    fn spawn(address: SocketAddr, receiver: Receiver<(Bytes, oneshot::Sender<Bytes>)>) {
        tokio::spawn(async move {
            Self { address, receiver }.run().await;
        });
    }

    async fn run(&mut self) {
        let mut delay = 200u64;
        let mut retry: Option<(Bytes, oneshot::Sender<Bytes>)> = None;
        loop {
            let (data, handler) = match self.next_message(retry.take()).await {
                Some(message) => message,
                None => return,
            };
            // The caller gave up on this delivery.
            if handler.is_closed() {
                continue;
            }

            let stream = match TcpStream::connect(self.address).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to connect to {}: {}", self.address, e);
                    retry = Some((data, handler));
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                    delay = std::cmp::min(2 * delay, 10_000);
                    continue;
                }
            };
            delay = 200;
            debug!("Connected to {}", self.address);
            let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

            // Drain the queue for as long as the connection survives.
            let mut current = Some((data, handler));
            loop {
                let (data, handler) = match self.next_message(current.take()).await {
                    Some(message) => message,
                    None => return,
                };
                if handler.is_closed() {
                    continue;
                }
                if let Err(e) = framed.send(data.clone()).await {
                    warn!("Failed to send to {}: {}", self.address, e);
                    retry = Some((data, handler));
                    break;
                }
                match framed.next().await {
                    Some(Ok(reply)) => {
                        let _ = handler.send(reply.freeze());
                    }
                    _ => {
                        warn!("Lost connection with {}", self.address);
                        retry = Some((data, handler));
                        break;
                    }
                }
            }
        }
    }

    async fn next_message(
        &mut self,
        carried: Option<(Bytes, oneshot::Sender<Bytes>)>,
    ) -> Option<(Bytes, oneshot::Sender<Bytes>)> {
        match carried {
            Some(message) => Some(message),
            None => self.receiver.recv().await,
        }
    }
}
