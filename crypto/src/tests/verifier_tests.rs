use super::*;
use crate::KeyPair;
use rand::rngs::StdRng;
use rand::SeedableRng as _;

fn keys() -> Vec<(PublicKey, KeyPair)> {
    let mut rng = StdRng::from_seed([0; 32]);
    (0..3).map(|_| KeyPair::generate_keypair(&mut rng)).collect()
}

fn two_of_three() -> SignatureVerifier {
    SignatureVerifier::Threshold {
        threshold: 2,
        verifiers: keys()
            .iter()
            .map(|(public_key, _)| SignatureVerifier::Ed25519(*public_key))
            .collect(),
    }
}

fn sub_signature(index: usize, value: &Digest) -> Vec<u8> {
    Signature::new(value, &keys()[index].1).to_bytes()
}

fn blob(signatures: Vec<(u32, Vec<u8>)>) -> Vec<u8> {
    let (key_indexes, signatures) = signatures.into_iter().unzip();
    bincode::serialize(&ThresholdSignature {
        key_indexes,
        signatures,
    })
    .unwrap()
}

#[test]
fn ed25519_accepts_valid_signature() {
    let (public_key, keypair) = keys().pop().unwrap();
    let value = Digest::of(b"entry update");
    let signature = Signature::new(&value, &keypair).to_bytes();
    assert!(SignatureVerifier::Ed25519(public_key)
        .verify(&value, &signature)
        .is_ok());
}

#[test]
fn ed25519_rejects_garbage() {
    let (public_key, _) = keys().pop().unwrap();
    let value = Digest::of(b"entry update");
    assert!(SignatureVerifier::Ed25519(public_key)
        .verify(&value, &[0u8; 7])
        .is_err());
}

#[test]
fn threshold_accepts_two_distinct_signers() {
    let value = Digest::of(b"entry update");
    let blob = blob(vec![
        (0, sub_signature(0, &value)),
        (2, sub_signature(2, &value)),
    ]);
    assert!(two_of_three().verify(&value, &blob).is_ok());
}

#[test]
fn threshold_rejects_one_valid_one_invalid() {
    let value = Digest::of(b"entry update");
    let blob = blob(vec![
        (0, sub_signature(0, &value)),
        // Signed by the wrong sub-verifier's key.
        (1, sub_signature(2, &value)),
    ]);
    assert!(matches!(
        two_of_three().verify(&value, &blob),
        Err(VerifierError::VerificationFailed)
    ));
}

#[test]
fn threshold_rejects_duplicate_indexes() {
    let value = Digest::of(b"entry update");
    let blob = blob(vec![
        (0, sub_signature(0, &value)),
        (0, sub_signature(0, &value)),
    ]);
    assert!(matches!(
        two_of_three().verify(&value, &blob),
        Err(VerifierError::DuplicateIndex(0))
    ));
}

#[test]
fn threshold_rejects_out_of_range_index() {
    let value = Digest::of(b"entry update");
    let blob = blob(vec![
        (0, sub_signature(0, &value)),
        (3, sub_signature(1, &value)),
    ]);
    assert!(matches!(
        two_of_three().verify(&value, &blob),
        Err(VerifierError::IndexOutOfRange(3))
    ));
}

#[test]
fn threshold_rejects_too_few_signatures() {
    let value = Digest::of(b"entry update");
    let blob = blob(vec![(1, sub_signature(1, &value))]);
    assert!(matches!(
        two_of_three().verify(&value, &blob),
        Err(VerifierError::NotEnoughSignatures { threshold: 2, got: 1 })
    ));
}

#[test]
fn nested_threshold_verifies() {
    let value = Digest::of(b"entry update");
    let inner_blob = blob(vec![
        (0, sub_signature(0, &value)),
        (1, sub_signature(1, &value)),
    ]);
    let outer = SignatureVerifier::Threshold {
        threshold: 1,
        verifiers: vec![two_of_three()],
    };
    let outer_blob = bincode::serialize(&ThresholdSignature {
        key_indexes: vec![0],
        signatures: vec![inner_blob],
    })
    .unwrap();
    assert!(outer.verify(&value, &outer_blob).is_ok());
}

#[test]
fn excessive_nesting_is_rejected() {
    let value = Digest::of(b"entry update");
    let (public_key, keypair) = keys().pop().unwrap();
    let mut verifier = SignatureVerifier::Ed25519(public_key);
    let mut signature_blob = Signature::new(&value, &keypair).to_bytes();
    for _ in 0..9 {
        verifier = SignatureVerifier::Threshold {
            threshold: 1,
            verifiers: vec![verifier],
        };
        signature_blob = bincode::serialize(&ThresholdSignature {
            key_indexes: vec![0],
            signatures: vec![signature_blob],
        })
        .unwrap();
    }
    assert!(verifier.verify(&value, &signature_blob).is_err());
}
