pub mod state;

use crate::state::DirectoryState;
use async_trait::async_trait;
use bytes::Bytes;
use config::{PrivateConfig, Realm, ReplicaConfig};
use futures::sink::SinkExt as _;
use log::{info, warn};
use messages::{
    entry::SignedEntryUpdate,
    error::{MessageError, MessageResult},
    proof::LookupProof,
    ClientToServerMessage, ServerToClientMessage,
};
use network::receiver::{MessageHandler, Receiver as NetworkReceiver, Writer};
use replication::{LogEntry, Replicator};
use std::{error::Error, net::SocketAddr};
use storage::Storage;
use tokio::sync::{
    mpsc::{channel, Receiver, Sender},
    oneshot,
};

/// The key prefix of the replicated log inside the provider's store.
const LOG_PREFIX: &[u8] = b"raft";

/// The default size of inter-tasks channels.
const DEFAULT_CHANNEL_SIZE: usize = 1_000;

/// One-shot channel delivering the outcome of a client request.
type Replier<T> = oneshot::Sender<MessageResult<T>>;

/// Handle to a running keyserver replica.
#[derive(Clone)]
pub struct Keyserver {
    tx_lookup: Sender<(String, Replier<LookupProof>)>,
    tx_update: Sender<(SignedEntryUpdate, Replier<()>)>,
    replicator: Replicator,
}

impl Keyserver {
    /// Spawn a keyserver replica: the replication log, the directory state
    /// machine, and the client-facing RPC server on `client_addr`.
    pub fn spawn(
        private: PrivateConfig,
        realm: Realm,
        replica: ReplicaConfig,
        db: Storage,
        client_addr: SocketAddr,
    ) -> Result<Self, Box<dyn Error>> {
        // The state machine is rebuilt from the log on every boot, so the
        // replicator replays from the beginning.
        let (replicator, rx_committed, rx_leader) =
            Replicator::spawn(replica, db, LOG_PREFIX, /* applied */ 0)?;

        let (tx_lookup, rx_lookup) = channel(DEFAULT_CHANNEL_SIZE);
        let (tx_update, rx_update) = channel(DEFAULT_CHANNEL_SIZE);

        Core::spawn(
            DirectoryState::new(realm.realm.clone(), private.secret, private.vrf_secret),
            replicator.clone(),
            rx_committed,
            rx_leader,
            rx_lookup,
            rx_update,
        );

        NetworkReceiver::spawn(
            client_addr,
            ClientHandler {
                tx_lookup: tx_lookup.clone(),
            },
        );

        info!(
            "Keyserver for realm {} successfully booted on {}",
            realm.realm, client_addr
        );
        Ok(Self {
            tx_lookup,
            tx_update,
            replicator,
        })
    }

    /// Resolve a lookup against the local replica's latest ratified state.
    pub async fn lookup_profile(&self, user_id: &str) -> MessageResult<LookupProof> {
        let (sender, receiver) = oneshot::channel();
        self.tx_lookup
            .send((user_id.to_string(), sender))
            .await
            .map_err(|_| MessageError::InternalError("keyserver stopped".to_string()))?;
        receiver
            .await
            .map_err(|_| MessageError::InternalError("keyserver stopped".to_string()))?
    }

    /// Validate an update against the current state and submit it for
    /// replication. Returns once the replication log has accepted the
    /// proposal; the update takes effect when its entry commits.
    pub async fn propose_update(&self, update: SignedEntryUpdate) -> MessageResult<()> {
        let (sender, receiver) = oneshot::channel();
        self.tx_update
            .send((update, sender))
            .await
            .map_err(|_| MessageError::InternalError("keyserver stopped".to_string()))?;
        receiver
            .await
            .map_err(|_| MessageError::InternalError("keyserver stopped".to_string()))?
    }

    /// Shut down the replication loop. Idempotent.
    pub async fn stop(&self) {
        self.replicator.stop().await;
    }
}

/// The task owning the directory state: applies committed entries in log
/// order and answers lookups and update admissions.
struct Core {
    state: DirectoryState,
    replicator: Replicator,
    rx_committed: Receiver<LogEntry>,
    rx_leader: Receiver<bool>,
    rx_lookup: Receiver<(String, Replier<LookupProof>)>,
    rx_update: Receiver<(SignedEntryUpdate, Replier<()>)>,
}

impl Core {
    fn spawn(
        state: DirectoryState,
        replicator: Replicator,
        rx_committed: Receiver<LogEntry>,
        rx_leader: Receiver<bool>,
        rx_lookup: Receiver<(String, Replier<LookupProof>)>,
        rx_update: Receiver<(SignedEntryUpdate, Replier<()>)>,
    ) {
        tokio::spawn(async move {
            Self {
                state,
                replicator,
                rx_committed,
                rx_leader,
                rx_lookup,
                rx_update,
            }
            .run()
            .await;
        });
    }

    async fn run(&mut self) {
        loop {
            tokio::select! {
                // Committed log entries, in strictly increasing index order.
                Some(entry) = self.rx_committed.recv() => match entry {
                    LogEntry::Data(data) => {
                        if let Err(e) = self.state.apply_committed(&data) {
                            warn!("Rejected committed update: {}", e);
                        }
                    }
                    LogEntry::Reconfiguration(_) => {
                        warn!("Ignoring membership change entry");
                    }
                },

                Some((user_id, replier)) = self.rx_lookup.recv() => {
                    let _ = replier.send(self.state.lookup(&user_id));
                },

                Some((update, replier)) = self.rx_update.recv() => {
                    let result = self.admit(update).await;
                    let _ = replier.send(result);
                },

                Some(is_leader) = self.rx_leader.recv() => {
                    info!("Leadership changed: leader = {}", is_leader);
                },

                else => break,
            }
        }
    }

    /// Leader-side admission: check the update against the current state,
    /// then hand it to the replication log.
    async fn admit(&mut self, update: SignedEntryUpdate) -> MessageResult<()> {
        self.state.verify_update(&update)?;
        let serialized = bincode::serialize(&update)
            .map_err(|e| MessageError::InternalError(e.to_string()))?;
        self.replicator
            .propose(serialized)
            .await
            .map_err(|e| MessageError::InternalError(e.to_string()))
    }
}

/// Defines how the network receiver handles incoming client messages.
#[derive(Clone)]
struct ClientHandler {
    tx_lookup: Sender<(String, Replier<LookupProof>)>,
}

#[async_trait]
impl MessageHandler for ClientHandler {
    async fn dispatch(&self, writer: &mut Writer, serialized: Bytes) -> Result<(), Box<dyn Error>> {
        let reply = match bincode::deserialize(&serialized).map_err(MessageError::from)? {
            ClientToServerMessage::LookupProfile(request) => {
                let (sender, receiver) = oneshot::channel();
                self.tx_lookup
                    .send((request.user_id, sender))
                    .await
                    .map_err(|_| "failed to forward lookup request")?;
                receiver.await.map_err(|_| "lookup request dropped")?
            }
            // The intended admission policy, ordering relative to the
            // replication log, and response timing for client-submitted
            // updates are still undefined.
            ClientToServerMessage::UpdateProfile(_) => Err(MessageError::NotImplemented(
                "UpdateProfile".to_string(),
            )),
        };

        let bytes = bincode::serialize(&ServerToClientMessage::LookupProof(Box::new(reply)))
            .expect("Failed to serialize reply");
        writer.send(Bytes::from(bytes)).await?;
        Ok(())
    }
}
