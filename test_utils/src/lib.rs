use bytes::Bytes;
use config::{PrivateConfig, Provider, Realm, ReplicaConfig};
use crypto::{vrf, KeyPair, PublicKey};
use keyserver::Keyserver;
use messages::{
    entry::{Entry, EntryUpdate, Profile, SignedEntryUpdate},
    error::MessageResult,
    preserve::Preserved,
    proof::LookupProof,
    ClientToServerMessage, LookupProfileRequest, ServerToClientMessage,
};
use network::reliable_sender::ReliableSender;
use rand::{rngs::StdRng, SeedableRng as _};
use replication::{LogEntry, Replicator};
use std::{collections::BTreeMap, net::SocketAddr};
use storage::Storage;
use tokio::sync::mpsc::Receiver;

// The provider's signing keypair (deterministic for tests).
pub fn provider_keypair() -> (PublicKey, KeyPair) {
    let mut rng = StdRng::from_seed([0; 32]);
    KeyPair::generate_keypair(&mut rng)
}

// The provider's VRF keypair.
pub fn vrf_keypair() -> (PublicKey, KeyPair) {
    let mut rng = StdRng::from_seed([1; 32]);
    KeyPair::generate_keypair(&mut rng)
}

// A user's update keypair, derived from its identifier.
pub fn user_keypair(user_id: &str) -> (PublicKey, KeyPair) {
    let mut seed = [2u8; 32];
    for (position, byte) in user_id.bytes().enumerate().take(24) {
        seed[position] ^= byte;
    }
    let mut rng = StdRng::from_seed(seed);
    KeyPair::generate_keypair(&mut rng)
}

// Test private configuration of the provider.
pub fn private_config() -> PrivateConfig {
    let (name, secret) = provider_keypair();
    let (_, vrf_secret) = vrf_keypair();
    PrivateConfig {
        name,
        secret,
        vrf_secret,
    }
}

// A test realm with the provider as its only ratifier.
pub fn realm(base_port: u16) -> Realm {
    let (name, _) = provider_keypair();
    let (vrf_public_key, _) = vrf_keypair();
    Realm {
        realm: "example.org".to_string(),
        provider: Provider {
            name,
            vrf_public_key,
            address: format!("127.0.0.1:{}", base_port).parse().unwrap(),
        },
        ratifiers: std::iter::once(name).collect(),
        quorum: 1,
    }
}

// Replica configurations for an n-node cluster.
pub fn replica_configs(nodes: usize, base_port: u16) -> Vec<ReplicaConfig> {
    let peers: Vec<_> = (0..nodes)
        .map(|i| config::Peer {
            id: i as u64 + 1,
            address: format!("127.0.0.1:{}", base_port + i as u16).parse().unwrap(),
        })
        .collect();
    (0..nodes)
        .map(|i| ReplicaConfig {
            node_id: i as u64 + 1,
            peers: peers.clone(),
            election_tick: 10,
            heartbeat_tick: 1,
            max_msg_size: 1_024 * 1_024,
            max_inflight_msgs: 256,
            tick_interval_ms: 20,
            listen_addr: peers[i].address,
        })
        .collect()
}

// A signed profile update for `user_id` at the given version. The previous
// version's key signs the old signature when a prior entry exists.
pub fn signed_update(user_id: &str, version: u64, has_previous: bool) -> SignedEntryUpdate {
    let (public_key, keypair) = user_keypair(user_id);
    let (_, vrf_secret) = vrf_keypair();

    let index_proof = vrf::prove(&vrf_secret, user_id.as_bytes()).unwrap();
    let index = vrf::proof_to_hash(&index_proof).unwrap();

    let mut rng = StdRng::from_seed([version as u8; 32]);
    let mut keys = BTreeMap::new();
    keys.insert(
        user_id.to_string(),
        format!("pgp-key-packet-v{}", version).into_bytes(),
    );
    let profile = Preserved::new(Profile::new(keys, &mut rng)).unwrap();

    let entry = Preserved::new(Entry {
        version,
        update_key: crypto::verifier::SignatureVerifier::Ed25519(public_key),
        profile_hash: profile.hash(),
    })
    .unwrap();
    let update = Preserved::new(EntryUpdate {
        index,
        new_entry: entry,
    })
    .unwrap();

    let old_keypair = has_previous.then(|| user_keypair(user_id).1);
    SignedEntryUpdate::new(update, &keypair, old_keypair.as_ref(), Some(profile))
}

// Spawn a cluster of keyserver replicas sharing one realm.
pub fn spawn_test_keyservers(
    test_id: &str,
    nodes: usize,
    raft_base_port: u16,
    client_base_port: u16,
) -> Vec<Keyserver> {
    delete_storage(test_id, nodes);
    let realm = realm(client_base_port);
    replica_configs(nodes, raft_base_port)
        .into_iter()
        .enumerate()
        .map(|(i, replica)| {
            let path = test_storage_path(test_id, i);
            let db = Storage::new(&path).unwrap();
            let client_addr: SocketAddr = format!("127.0.0.1:{}", client_base_port + i as u16)
                .parse()
                .unwrap();
            Keyserver::spawn(private_config(), realm.clone(), replica, db, client_addr).unwrap()
        })
        .collect()
}

// Spawn a cluster of bare replicators (no keyserver on top).
pub fn spawn_test_replicators(
    test_id: &str,
    nodes: usize,
    base_port: u16,
) -> Vec<(Replicator, Receiver<LogEntry>, Receiver<bool>)> {
    delete_storage(test_id, nodes);
    replica_configs(nodes, base_port)
        .into_iter()
        .enumerate()
        .map(|(i, replica)| {
            let path = test_storage_path(test_id, i);
            let db = Storage::new(&path).unwrap();
            Replicator::spawn(replica, db, b"raft", 0).unwrap()
        })
        .collect()
}

// Helper function giving the storage path of a test node.
pub fn test_storage_path(test_id: &str, node: usize) -> String {
    format!(".test_storage_{}_{}", test_id, node)
}

// Helper function deleting a test storage.
pub fn delete_storage(test_id: &str, nodes: usize) {
    for node in 0..nodes {
        let _ = std::fs::remove_dir_all(&test_storage_path(test_id, node));
    }
}

// Look up a profile over the client RPC interface.
pub async fn lookup_profile(address: SocketAddr, user_id: &str) -> MessageResult<LookupProof> {
    let request = ClientToServerMessage::LookupProfile(LookupProfileRequest {
        user_id: user_id.to_string(),
    });
    let serialized = bincode::serialize(&request).unwrap();
    let mut sender = ReliableSender::new();
    let reply = sender
        .send(address, Bytes::from(serialized))
        .await
        .await
        .unwrap();
    match bincode::deserialize(&reply).unwrap() {
        ServerToClientMessage::LookupProof(result) => *result,
    }
}
