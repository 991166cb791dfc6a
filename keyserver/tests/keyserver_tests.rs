use messages::error::MessageError;
use messages::proof::LookupProof;
use std::time::Duration;
use test_utils::{
    delete_storage, lookup_profile, realm, signed_update, spawn_test_keyservers, user_keypair,
};
use tokio::time::{sleep, timeout};

const TEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Submit an update, retrying while the cluster elects a leader.
async fn propose_retrying(keyserver: &keyserver::Keyserver, user_id: &str, version: u64) {
    let update = signed_update(user_id, version, version > 1);
    loop {
        match keyserver.propose_update(update.clone()).await {
            Ok(()) => return,
            Err(MessageError::InternalError(_)) => sleep(Duration::from_millis(50)).await,
            Err(e) => panic!("Update rejected: {}", e),
        }
    }
}

/// Poll lookups until the update has been applied.
async fn lookup_retrying(keyserver: &keyserver::Keyserver, user_id: &str) -> LookupProof {
    loop {
        match keyserver.lookup_profile(user_id).await {
            Ok(proof) => return proof,
            Err(MessageError::NotFound) => sleep(Duration::from_millis(50)).await,
            Err(e) => panic!("Lookup failed: {}", e),
        }
    }
}

#[tokio::test]
async fn lookup_proof_end_to_end() {
    let test_id = "lookup_proof_end_to_end";
    let mut servers = spawn_test_keyservers(test_id, 1, 5_000, 6_000);
    let keyserver = servers.pop().unwrap();

    timeout(TEST_TIMEOUT, async {
        propose_retrying(&keyserver, "alice@example.org", 1).await;
        let proof = lookup_retrying(&keyserver, "alice@example.org").await;

        // The proof is self-contained and checks out under the realm's
        // trust policy.
        assert!(proof.verify(&realm(6_000)).is_ok());
        assert_eq!(proof.entry.version, 1);
        assert!(proof
            .profile
            .keys
            .contains_key("alice@example.org"));
    })
    .await
    .expect("Test timed out");

    keyserver.stop().await;
    delete_storage(test_id, 1);
}

#[tokio::test]
async fn updates_replace_entries_in_place() {
    let test_id = "updates_replace_entries_in_place";
    let mut servers = spawn_test_keyservers(test_id, 1, 5_100, 6_100);
    let keyserver = servers.pop().unwrap();

    timeout(TEST_TIMEOUT, async {
        propose_retrying(&keyserver, "alice@example.org", 1).await;
        let first = lookup_retrying(&keyserver, "alice@example.org").await;

        propose_retrying(&keyserver, "alice@example.org", 2).await;
        loop {
            let proof = lookup_retrying(&keyserver, "alice@example.org").await;
            if proof.entry.version == 2 {
                assert!(proof.verify(&realm(6_100)).is_ok());
                assert_ne!(proof.entry.profile_hash, first.entry.profile_hash);
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("Test timed out");

    keyserver.stop().await;
    delete_storage(test_id, 1);
}

#[tokio::test]
async fn version_regression_is_rejected() {
    let test_id = "version_regression_is_rejected";
    let mut servers = spawn_test_keyservers(test_id, 1, 5_200, 6_200);
    let keyserver = servers.pop().unwrap();

    timeout(TEST_TIMEOUT, async {
        propose_retrying(&keyserver, "alice@example.org", 2).await;
        lookup_retrying(&keyserver, "alice@example.org").await;

        // Replaying an update at the same version must be refused.
        let stale = signed_update("alice@example.org", 2, true);
        match keyserver.propose_update(stale).await {
            Err(MessageError::VersionRegression { prior: 2, got: 2 }) => (),
            other => panic!("Expected version regression, got {:?}", other),
        }
    })
    .await
    .expect("Test timed out");

    keyserver.stop().await;
    delete_storage(test_id, 1);
}

#[tokio::test]
async fn unauthorized_update_is_rejected() {
    let test_id = "unauthorized_update_is_rejected";
    let mut servers = spawn_test_keyservers(test_id, 1, 5_300, 6_300);
    let keyserver = servers.pop().unwrap();

    timeout(TEST_TIMEOUT, async {
        propose_retrying(&keyserver, "alice@example.org", 1).await;
        lookup_retrying(&keyserver, "alice@example.org").await;

        // A replacement whose old signature comes from a different key.
        let mut forged = signed_update("alice@example.org", 2, false);
        let (_, mallory) = user_keypair("mallory@example.org");
        forged.old_sig = crypto::Signature::new(&forged.digest(), &mallory).to_bytes();
        match keyserver.propose_update(forged).await {
            Err(MessageError::Unauthorized(_)) => (),
            other => panic!("Expected unauthorized, got {:?}", other),
        }
    })
    .await
    .expect("Test timed out");

    keyserver.stop().await;
    delete_storage(test_id, 1);
}

#[tokio::test]
async fn lookup_over_rpc() {
    let test_id = "lookup_over_rpc";
    let mut servers = spawn_test_keyservers(test_id, 1, 5_400, 6_400);
    let keyserver = servers.pop().unwrap();

    timeout(TEST_TIMEOUT, async {
        propose_retrying(&keyserver, "alice@example.org", 1).await;
        lookup_retrying(&keyserver, "alice@example.org").await;

        let address = "127.0.0.1:6400".parse().unwrap();
        let proof = lookup_profile(address, "alice@example.org")
            .await
            .expect("RPC lookup failed");
        assert!(proof.verify(&realm(6_400)).is_ok());

        // Unknown identifiers answer not-found.
        match lookup_profile(address, "nobody@example.org").await {
            Err(MessageError::NotFound) => (),
            other => panic!("Expected not found, got {:?}", other),
        }

        // Client-submitted updates are deliberately unimplemented.
        let update = messages::ClientToServerMessage::UpdateProfile(Box::new(signed_update(
            "alice@example.org",
            3,
            true,
        )));
        let serialized = bincode::serialize(&update).unwrap();
        let mut sender = network::reliable_sender::ReliableSender::new();
        let reply = sender
            .send(address, bytes::Bytes::from(serialized))
            .await
            .await
            .unwrap();
        match bincode::deserialize(&reply).unwrap() {
            messages::ServerToClientMessage::LookupProof(result) => match *result {
                Err(MessageError::NotImplemented(_)) => (),
                other => panic!("Expected not implemented, got {:?}", other),
            },
        }
    })
    .await
    .expect("Test timed out");

    keyserver.stop().await;
    delete_storage(test_id, 1);
}

#[tokio::test]
async fn three_replicas_serve_identical_proofs() {
    let test_id = "three_replicas_serve_identical_proofs";
    let servers = spawn_test_keyservers(test_id, 3, 5_500, 6_500);

    timeout(TEST_TIMEOUT, async {
        // Submit through whichever replica accepts the proposal first.
        let update = signed_update("alice@example.org", 1, false);
        'submitted: loop {
            for keyserver in &servers {
                if keyserver.propose_update(update.clone()).await.is_ok() {
                    break 'submitted;
                }
            }
            sleep(Duration::from_millis(50)).await;
        }

        // Every replica converges to the same ratified entry.
        let mut proofs = Vec::new();
        for keyserver in &servers {
            let proof = lookup_retrying(keyserver, "alice@example.org").await;
            assert!(proof.verify(&realm(6_500)).is_ok());
            proofs.push(proof);
        }
        assert!(proofs
            .windows(2)
            .all(|pair| pair[0].entry == pair[1].entry && pair[0].index == pair[1].index));
    })
    .await
    .expect("Test timed out");

    for keyserver in &servers {
        keyserver.stop().await;
    }
    delete_storage(test_id, 3);
}
