//! The directory replication log.
//!
//! Wraps the consensus engine into a single event loop that owns all local
//! replication state (CSP style): ticks, proposals, inbound peer messages,
//! and ready batches are multiplexed over channels; committed entries are
//! delivered downstream in strictly increasing log-index order. Slow
//! consumers of the committed channel backpressure the loop and stall
//! consensus by design.

use crate::{
    error::{ReplicationError, ReplicationResult},
    storage::RaftLogStore,
};
use async_trait::async_trait;
use bytes::Bytes;
use config::ReplicaConfig;
use futures::sink::SinkExt as _;
use log::{debug, info, warn};
use network::receiver::{MessageHandler, Receiver as NetworkReceiver, Writer};
use prost::Message as _;
use raft::{
    eraftpb::{ConfChange, ConfState, Entry, EntryType, HardState, Message, Snapshot},
    Config as RaftConfig, RawNode, StateRole, Storage as _,
};
use slog::Drain as _;
use std::{
    collections::HashMap,
    error::Error,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::net::TcpStream;
use tokio::sync::{
    mpsc::{channel, Receiver, Sender},
    oneshot,
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// The capacity of the committed-entry and leader-hint channels. It is fine
/// to let commit run asynchronously ahead of apply.
const COMMITTED_BUFFER: usize = 10;

/// The size of the internal proposal and step queues.
const DEFAULT_CHANNEL_SIZE: usize = 1_000;

/// A committed log entry delivered to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    Data(Vec<u8>),
    Reconfiguration(Vec<u8>),
}

type Proposal = (Vec<u8>, oneshot::Sender<ReplicationResult<()>>);

/// Handle to a running replication log. Cheap to clone; all methods funnel
/// into the event loop through channels.
#[derive(Clone)]
pub struct Replicator {
    tx_propose: Sender<Proposal>,
    tx_step: Sender<Message>,
    store: RaftLogStore,
    stop: Arc<Mutex<Option<(oneshot::Sender<()>, oneshot::Receiver<()>)>>>,
}

impl Replicator {
    /// Start the replication log. On fresh storage this writes the sentinel
    /// entry and boots with the configured peer set; on existing storage it
    /// restarts the engine with `applied` as the state machine's watermark.
    ///
    /// Returns the handle, the committed-entry channel, and the leader-hint
    /// channel publishing transitions of this node's leadership.
    pub fn spawn(
        config: ReplicaConfig,
        db: storage::Storage,
        prefix: &[u8],
        applied: u64,
    ) -> ReplicationResult<(Self, Receiver<LogEntry>, Receiver<bool>)> {
        let initial_conf = ConfState {
            voters: config.peer_ids(),
            ..Default::default()
        };
        let store = RaftLogStore::open(db, prefix, initial_conf);

        if store.is_initialized()? {
            debug!("Restarting replication from persisted state");
        } else {
            if applied != 0 {
                panic!(
                    "storage uninitialized but state machine not fresh: applied = {}",
                    applied
                );
            }
            // The zeroth log slot holds a sentinel entry.
            store.save(&HardState::default(), &[Entry::default()])?;
        }

        let raft_config = RaftConfig {
            id: config.node_id,
            election_tick: config.election_tick,
            heartbeat_tick: config.heartbeat_tick,
            max_size_per_msg: config.max_msg_size,
            max_inflight_msgs: config.max_inflight_msgs,
            applied,
            ..Default::default()
        };
        raft_config
            .validate()
            .map_err(|e| ReplicationError::EngineError(e.to_string()))?;

        // The engine logs through slog; route it into the `log` facade used
        // everywhere else.
        let logger = slog::Logger::root(slog_stdlog::StdLog.fuse(), slog::o!());
        let node = RawNode::new(&raft_config, store.clone(), &logger)
            .map_err(|e| ReplicationError::EngineError(e.to_string()))?;

        let (tx_propose, rx_propose) = channel(DEFAULT_CHANNEL_SIZE);
        let (tx_step, rx_step) = channel(DEFAULT_CHANNEL_SIZE);
        let (tx_unreachable, rx_unreachable) = channel(DEFAULT_CHANNEL_SIZE);
        let (tx_committed, rx_committed) = channel(COMMITTED_BUFFER);
        let (tx_leader, rx_leader) = channel(COMMITTED_BUFFER);
        let (tx_stop, rx_stop) = oneshot::channel();
        let (tx_stopped, rx_stopped) = oneshot::channel();

        // Accept consensus messages from our peers.
        NetworkReceiver::spawn(
            config.listen_addr,
            StepHandler {
                tx_step: tx_step.clone(),
            },
        );

        let last_hard_state = store
            .initial_state()
            .map_err(|e| ReplicationError::EngineError(e.to_string()))?
            .hard_state;

        ReplicatorCore {
            node,
            store: store.clone(),
            config,
            rx_propose,
            rx_step,
            rx_unreachable,
            tx_unreachable,
            rx_stop,
            tx_stopped,
            tx_committed,
            tx_leader,
            leader_hint: false,
            last_hard_state,
            peers: HashMap::new(),
        }
        .spawn();

        Ok((
            Self {
                tx_propose,
                tx_step,
                store,
                stop: Arc::new(Mutex::new(Some((tx_stop, rx_stopped)))),
            },
            rx_committed,
            rx_leader,
        ))
    }

    /// Submit a command for replication. Returns once the engine has
    /// accepted the proposal; commitment is observed separately through the
    /// committed-entry channel, and acceptance implies no ordering relative
    /// to later proposals.
    pub async fn propose(&self, data: Vec<u8>) -> ReplicationResult<()> {
        let (sender, receiver) = oneshot::channel();
        self.tx_propose
            .send((data, sender))
            .await
            .map_err(|_| ReplicationError::Stopped)?;
        receiver.await.map_err(|_| ReplicationError::Stopped)?
    }

    /// Membership changes are out of scope until specified.
    pub fn propose_conf_change(&self, _change: Vec<u8>) -> ReplicationResult<()> {
        Err(ReplicationError::NotImplemented("membership change"))
    }

    /// Hand a peer's consensus message to the engine.
    pub async fn step(&self, message: Message) -> ReplicationResult<()> {
        self.tx_step
            .send(message)
            .await
            .map_err(|_| ReplicationError::Stopped)
    }

    /// Read back committed entries for state-machine catch-up, bounded by
    /// the accumulated serialized size.
    pub fn get_committed(
        &self,
        low: u64,
        high: u64,
        max_size: u64,
    ) -> ReplicationResult<Vec<LogEntry>> {
        Ok(self
            .store
            .typed_entries(low, high, max_size)?
            .into_iter()
            .map(|entry| LogEntry::Data(entry.data.to_vec()))
            .collect())
    }

    /// Shut the event loop down and wait for it to exit. Idempotent:
    /// subsequent calls return immediately.
    pub async fn stop(&self) {
        let taken = self.stop.lock().unwrap().take();
        if let Some((tx_stop, rx_stopped)) = taken {
            let _ = tx_stop.send(());
            let _ = rx_stopped.await;
        }
    }
}

/// Forwards peer consensus messages into the event loop.
#[derive(Clone)]
struct StepHandler {
    tx_step: Sender<Message>,
}

#[async_trait]
impl MessageHandler for StepHandler {
    async fn dispatch(&self, _writer: &mut Writer, serialized: Bytes) -> Result<(), Box<dyn Error>> {
        let message = Message::decode(&serialized[..])?;
        self.tx_step
            .send(message)
            .await
            .map_err(|_| "failed to forward step message")?;
        Ok(())
    }
}

/// A lazily dialled connection to one peer. Sends are dispatched on
/// independent tasks; the mutex keeps frames whole.
#[derive(Clone)]
struct PeerClient {
    address: SocketAddr,
    connection: Arc<tokio::sync::Mutex<Option<Framed<TcpStream, LengthDelimitedCodec>>>>,
}

impl PeerClient {
    fn new(address: SocketAddr) -> Self {
        Self {
            address,
            connection: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }
}

/// The event loop. All fields belong exclusively to `run` while it is
/// running; method invocations are signalled through channels.
struct ReplicatorCore {
    node: RawNode<RaftLogStore>,
    store: RaftLogStore,
    config: ReplicaConfig,
    rx_propose: Receiver<Proposal>,
    rx_step: Receiver<Message>,
    rx_unreachable: Receiver<u64>,
    tx_unreachable: Sender<u64>,
    rx_stop: oneshot::Receiver<()>,
    tx_stopped: oneshot::Sender<()>,
    tx_committed: Sender<LogEntry>,
    tx_leader: Sender<bool>,
    leader_hint: bool,
    last_hard_state: HardState,
    peers: HashMap<u64, PeerClient>,
}

impl ReplicatorCore {
    fn spawn(self) {
        tokio::spawn(async move {
            self.run().await;
        });
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut self.rx_stop => break,

                // The virtual clock driving elections and heartbeats.
                _ = ticker.tick() => {
                    self.node.tick();
                },

                Some((data, ack)) = self.rx_propose.recv() => {
                    let result = self
                        .node
                        .propose(Vec::new(), data)
                        .map_err(|e| ReplicationError::EngineError(e.to_string()));
                    let _ = ack.send(result);
                },

                Some(message) = self.rx_step.recv() => {
                    if let Err(e) = self.node.step(message) {
                        debug!("Engine rejected peer message: {}", e);
                    }
                },

                Some(peer) = self.rx_unreachable.recv() => {
                    self.node.report_unreachable(peer);
                },
            }

            if self.node.has_ready() {
                self.on_ready().await;
            }
        }
        info!("Replication loop shutting down");
        let ReplicatorCore { tx_stopped, .. } = self;
        let _ = tx_stopped.send(());
    }

    /// Process one ready batch: persist, dispatch messages, deliver
    /// committed entries, publish leadership transitions, advance.
    async fn on_ready(&mut self) {
        let mut ready = self.node.ready();

        if *ready.snapshot() != Snapshot::default() {
            panic!("snapshots not supported");
        }

        // Persist the hard state and new entries in a single atomic batch
        // before anything downstream can observe them.
        if let Some(hard_state) = ready.hs() {
            self.last_hard_state = hard_state.clone();
        }
        self.store
            .save(&self.last_hard_state, ready.entries())
            .expect("Failed to persist consensus state");

        for message in ready.take_messages() {
            self.send(message);
        }
        for message in ready.take_persisted_messages() {
            self.send(message);
        }

        for entry in ready.take_committed_entries() {
            self.deliver(entry).await;
        }

        if let Some(soft_state) = ready.ss() {
            let leader_hint = soft_state.raft_state == StateRole::Leader;
            if self.leader_hint != leader_hint {
                self.leader_hint = leader_hint;
                let _ = self.tx_leader.send(leader_hint).await;
            }
        }

        let mut light_ready = self.node.advance(ready);
        if let Some(commit) = light_ready.commit_index() {
            self.last_hard_state.commit = commit;
            self.store
                .save(&self.last_hard_state, &[])
                .expect("Failed to persist commit index");
        }
        for message in light_ready.take_messages() {
            self.send(message);
        }
        for entry in light_ready.take_committed_entries() {
            self.deliver(entry).await;
        }
        self.node.advance_apply();
    }

    /// Deliver one committed entry downstream, applying configuration
    /// changes to the engine on the way.
    async fn deliver(&mut self, entry: Entry) {
        match entry.entry_type() {
            EntryType::EntryConfChange => {
                let change = ConfChange::decode(&entry.data[..])
                    .expect("Failed to decode committed configuration change");
                let conf_state = self
                    .node
                    .apply_conf_change(&change)
                    .expect("Failed to apply configuration change");
                self.store
                    .save_conf_state(&conf_state)
                    .expect("Failed to persist membership");
                if self
                    .tx_committed
                    .send(LogEntry::Reconfiguration(entry.data.to_vec()))
                    .await
                    .is_err()
                {
                    warn!("Committed-entry consumer is gone");
                }
            }
            _ => {
                if self
                    .tx_committed
                    .send(LogEntry::Data(entry.data.to_vec()))
                    .await
                    .is_err()
                {
                    warn!("Committed-entry consumer is gone");
                }
            }
        }
    }

    /// Dispatch one outgoing consensus message on its own task. Failures
    /// are reported to the engine, never fatal.
    fn send(&mut self, message: Message) {
        let to = message.to;
        let client = match self.peers.get(&to).cloned() {
            Some(client) => client,
            None => match self.config.peer_address(to) {
                Some(address) => {
                    let client = PeerClient::new(address);
                    self.peers.insert(to, client.clone());
                    client
                }
                None => {
                    warn!("No address known for peer {}", to);
                    self.node.report_unreachable(to);
                    return;
                }
            },
        };

        let tx_unreachable = self.tx_unreachable.clone();
        tokio::spawn(async move {
            let mut guard = client.connection.lock().await;
            if guard.is_none() {
                match TcpStream::connect(client.address).await {
                    Ok(stream) => {
                        *guard = Some(Framed::new(stream, LengthDelimitedCodec::new()));
                    }
                    Err(e) => {
                        warn!("Failed to dial peer {} at {}: {}", to, client.address, e);
                        drop(guard);
                        let _ = tx_unreachable.send(to).await;
                        return;
                    }
                }
            }
            let framed = guard.as_mut().unwrap();
            let bytes = Bytes::from(message.encode_to_vec());
            if let Err(e) = framed.send(bytes).await {
                warn!("Failed to send to peer {}: {}", to, e);
                *guard = None;
                drop(guard);
                let _ = tx_unreachable.send(to).await;
            }
        });
    }
}
