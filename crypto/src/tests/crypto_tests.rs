use super::*;
use rand::rngs::StdRng;
use rand::SeedableRng as _;

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.public() == other.public()
    }
}

fn keys() -> Vec<(PublicKey, KeyPair)> {
    let mut rng = StdRng::from_seed([0; 32]);
    (0..4).map(|_| KeyPair::generate_keypair(&mut rng)).collect()
}

#[test]
fn import_export_public_key() {
    let (public_key, _) = keys().pop().unwrap();
    let export = public_key.encode_base64();
    let import = PublicKey::decode_base64(&export);
    assert!(import.is_ok());
    assert_eq!(import.unwrap(), public_key);
}

#[test]
fn import_export_keypair() {
    let (_, keypair) = keys().pop().unwrap();
    let export = serde_json::to_string(&keypair).unwrap();
    let import: Result<KeyPair, _> = serde_json::from_str(&export);
    assert!(import.is_ok());
    assert_eq!(import.unwrap(), keypair);
}

#[test]
fn digest_of_is_deterministic() {
    assert_eq!(Digest::of(b"alice@example"), Digest::of(b"alice@example"));
    assert_ne!(Digest::of(b"alice@example"), Digest::of(b"bob@example"));
}

#[test]
fn ratifier_ids_are_distinct() {
    let ids: Vec<_> = keys().iter().map(|(public_key, _)| public_key.id()).collect();
    let mut deduped = ids.clone();
    deduped.sort_unstable();
    deduped.dedup();
    assert_eq!(ids.len(), deduped.len());
}

#[test]
fn verify_valid_signature() {
    let (public_key, keypair) = keys().pop().unwrap();
    let digest = Digest::of(b"message");
    let signature = Signature::new(&digest, &keypair);
    assert!(signature.verify(&digest, &public_key).is_ok());
}

#[test]
fn verify_invalid_signature() {
    let (public_key, keypair) = keys().pop().unwrap();
    let digest = Digest::of(b"message");
    let signature = Signature::new(&digest, &keypair);
    let other = Digest::of(b"other message");
    assert!(signature.verify(&other, &public_key).is_err());
}
