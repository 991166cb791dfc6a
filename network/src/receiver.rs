use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, StreamExt as _};
use log::{debug, info, warn};
use std::{error::Error, net::SocketAddr};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// The half of the connection a handler writes its replies into.
pub type Writer = SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>;

/// Defines how the network receiver handles incoming messages.
#[async_trait]
pub trait MessageHandler: Clone + Send + Sync + 'static {
    /// Process one length-delimited frame; replies (if any) go out through
    /// the writer.
    async fn dispatch(&self, writer: &mut Writer, message: Bytes) -> Result<(), Box<dyn Error>>;
}

/// A TCP server forwarding every received frame to a message handler. One
/// task per connection; connections are independent.
pub struct Receiver;

impl Receiver {
    pub fn spawn<Handler: MessageHandler>(address: SocketAddr, handler: Handler) -> JoinHandle<()> {
        tokio::spawn(async move {
            let listener = TcpListener::bind(&address)
                .await
                .unwrap_or_else(|e| panic!("Failed to bind to {}: {}", address, e));
            info!("Listening on {}", address);
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                };
                debug!("Incoming connection from {}", peer);
                Self::spawn_runner(socket, peer, handler.clone());
            }
        })
    }

    fn spawn_runner<Handler: MessageHandler>(socket: TcpStream, peer: SocketAddr, handler: Handler) {
        tokio::spawn(async move {
            let framed = Framed::new(socket, LengthDelimitedCodec::new());
            let (mut writer, mut reader) = framed.split();
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(message) => {
                        if let Err(e) = handler.dispatch(&mut writer, message.freeze()).await {
                            warn!("{}", e);
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Error receiving from {}: {}", peer, e);
                        break;
                    }
                }
            }
            debug!("Connection with {} closed", peer);
        });
    }
}
