use crypto::{KeyPair, PublicKey};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fs::{self, OpenOptions},
    io::{BufWriter, Write as _},
    net::SocketAddr,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{file}': {message}")]
    ImportError { file: String, message: String },

    #[error("Failed to write config file '{file}': {message}")]
    ExportError { file: String, message: String },
}

/// Read from file a configuration.
pub trait Import: DeserializeOwned {
    fn import(path: &str) -> Result<Self, ConfigError> {
        let reader = || -> Result<Self, std::io::Error> {
            let data = fs::read(path)?;
            Ok(serde_json::from_slice(data.as_slice())?)
        };
        reader().map_err(|e| ConfigError::ImportError {
            file: path.to_string(),
            message: e.to_string(),
        })
    }
}

/// Write to file a configuration (in JSON format).
pub trait Export: Serialize {
    fn export(&self, path: &str) -> Result<(), ConfigError> {
        let writer = || -> Result<(), std::io::Error> {
            let file = OpenOptions::new().create(true).write(true).open(path)?;
            let mut writer = BufWriter::new(file);
            let data = serde_json::to_string_pretty(self).unwrap();
            writer.write_all(data.as_ref())?;
            writer.write_all(b"\n")?;
            Ok(())
        };
        writer().map_err(|e| ConfigError::ExportError {
            file: path.to_string(),
            message: e.to_string(),
        })
    }
}

/// The public information of the serving provider.
#[derive(Clone, Serialize, Deserialize)]
pub struct Provider {
    /// The signing (ratification) key of the provider.
    pub name: PublicKey,
    /// The VRF public key mapping user identifiers to directory indexes.
    pub vrf_public_key: PublicKey,
    /// The network address receiving client lookups and updates.
    pub address: SocketAddr,
}

/// The (public) description of a realm: the administrative scope of one
/// directory, the provider serving it, and the client trust policy over the
/// ratifiers signing its epoch summaries. The provider serves every
/// ratifier's latest signature with its lookup proofs.
#[derive(Clone, Serialize, Deserialize)]
pub struct Realm {
    /// Fully qualified domain name of the realm.
    pub realm: String,
    pub provider: Provider,
    /// The public keys of the ratifiers clients may count towards a quorum.
    pub ratifiers: BTreeSet<PublicKey>,
    /// How many distinct ratifiers must vouch for an epoch before a client
    /// accepts it.
    pub quorum: u32,
}

impl Import for Realm {}
impl Export for Realm {}

impl Realm {
    /// Whether `id` identifies a known ratifier, returning its public key.
    pub fn ratifier_key(&self, id: u64) -> Option<&PublicKey> {
        self.ratifiers.iter().find(|key| key.id() == id)
    }
}

/// A replication peer.
#[derive(Clone, Serialize, Deserialize)]
pub struct Peer {
    /// The consensus id of the peer (non-zero).
    pub id: u64,
    /// The address the peer listens on for consensus messages.
    pub address: SocketAddr,
}

/// The configuration of this replica's consensus participation.
#[derive(Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// The consensus id of this node (non-zero).
    pub node_id: u64,
    /// The initial cluster membership, this node included.
    pub peers: Vec<Peer>,
    /// Election timeout, in ticks.
    pub election_tick: usize,
    /// Heartbeat interval, in ticks.
    pub heartbeat_tick: usize,
    /// Upper bound on the size of a single consensus message (bytes).
    pub max_msg_size: u64,
    /// Upper bound on in-flight append messages per follower.
    pub max_inflight_msgs: usize,
    /// Wall-clock duration of one tick, in milliseconds.
    pub tick_interval_ms: u64,
    /// The address this node listens on for consensus messages.
    pub listen_addr: SocketAddr,
}

impl Import for ReplicaConfig {}
impl Export for ReplicaConfig {}

impl ReplicaConfig {
    /// The address of a peer, by consensus id.
    pub fn peer_address(&self, id: u64) -> Option<SocketAddr> {
        self.peers
            .iter()
            .find(|peer| peer.id == id)
            .map(|peer| peer.address)
    }

    /// The consensus ids of the initial membership.
    pub fn peer_ids(&self) -> Vec<u64> {
        self.peers.iter().map(|peer| peer.id).collect()
    }
}

/// The private configuration of a provider: its ratification signing key and
/// its VRF key.
#[derive(Serialize, Deserialize)]
pub struct PrivateConfig {
    /// The public key of this entity.
    pub name: PublicKey,
    /// The signing key of this entity.
    pub secret: KeyPair,
    /// The VRF keypair deriving directory indexes.
    pub vrf_secret: KeyPair,
}

impl Default for PrivateConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PrivateConfig {
    /// Creates a new private configuration.
    pub fn new() -> Self {
        let (name, secret) = KeyPair::generate_production_keypair();
        let (_, vrf_secret) = KeyPair::generate_production_keypair();
        Self {
            name,
            secret,
            vrf_secret,
        }
    }
}

impl Import for PrivateConfig {}
impl Export for PrivateConfig {}
