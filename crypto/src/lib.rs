//! Keys, digests, and detached signatures for the directory.
//!
//! Every signature in the system is computed over the SHA-256 digest of a
//! preserved byte encoding, never over a re-serialized value. Public keys
//! and keypairs serialize as base64 strings so they can live in JSON
//! configuration files.

use ed25519_dalek as dalek;
use ed25519_dalek::{Signer, Verifier};
use rand::{rngs::OsRng, CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::convert::TryInto;

pub mod verifier;
pub mod vrf;

#[cfg(test)]
#[path = "tests/crypto_tests.rs"]
pub mod crypto_tests;

/// Convenient name for Dalek's signature error.
pub type CryptoError = dalek::SignatureError;

/// A SHA-256 digest (32 bytes).
#[derive(Hash, PartialEq, Default, Eq, Clone, Copy, Deserialize, Serialize, Ord, PartialOrd)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// Hash a byte slice into a digest.
    pub fn of(data: &[u8]) -> Self {
        Digest(Sha256::digest(data).as_slice().try_into().unwrap())
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{}", base64::encode(self.0))
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{:.16}", base64::encode(self.0))
    }
}

/// The public identity of a provider or ratifier.
#[derive(Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Hash)]
pub struct PublicKey(pub [u8; dalek::PUBLIC_KEY_LENGTH]);

impl PublicKey {
    /// Encode a public key in base64 (human-readable).
    pub fn encode_base64(&self) -> String {
        base64::encode(self.0)
    }

    /// Decode a base64-encoded public key, rejecting wrong-length input.
    pub fn decode_base64(s: &str) -> Result<Self, base64::DecodeError> {
        base64::decode(s)?
            .as_slice()
            .try_into()
            .map(Self)
            .map_err(|_| base64::DecodeError::InvalidLength)
    }

    /// The 64-bit identifier of a ratifier: the first 8 bytes (big-endian)
    /// of the SHA-256 hash of its public key.
    pub fn id(&self) -> u64 {
        let digest = Sha256::digest(&self.0);
        u64::from_be_bytes(digest.as_slice()[..8].try_into().unwrap())
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.encode_base64())
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{:.16}", self.encode_base64())
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        self.encode_base64().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        Self::decode_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

/// A public and secret key pair.
/// TODO: Make sure secrets are not copyable and movable to control where they are in memory
pub struct KeyPair(dalek::Keypair);

impl KeyPair {
    /// Returns the public key part of the keypair.
    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.public.to_bytes())
    }

    /// Returns the 32-byte secret seed, as produced by the standard Ed25519
    /// key schedule. The VRF derives its scalar from this seed.
    pub(crate) fn seed(&self) -> [u8; 32] {
        self.0.secret.to_bytes()
    }

    /// Generate a new keypair.
    pub fn generate_production_keypair() -> (PublicKey, KeyPair) {
        Self::generate_keypair(&mut OsRng)
    }

    /// Generate a keypair from the specified RNG (useful for testing).
    pub fn generate_keypair<R>(csprng: &mut R) -> (PublicKey, KeyPair)
    where
        R: CryptoRng + RngCore,
    {
        let keypair = dalek::Keypair::generate(csprng);
        (PublicKey(keypair.public.to_bytes()), KeyPair(keypair))
    }
}

impl Serialize for KeyPair {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        base64::encode(self.0.to_bytes()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for KeyPair {
    fn deserialize<D>(deserializer: D) -> Result<KeyPair, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = base64::decode(&encoded).map_err(serde::de::Error::custom)?;
        dalek::Keypair::from_bytes(&bytes)
            .map(KeyPair)
            .map_err(serde::de::Error::custom)
    }
}

/// A detached signature over a digest, held in its 64-byte wire form.
#[derive(Clone)]
pub struct Signature([u8; dalek::SIGNATURE_LENGTH]);

impl Signature {
    /// Sign a digest with the specified private key.
    pub fn new(value: &Digest, secret: &KeyPair) -> Self {
        Signature(secret.0.sign(value.as_ref()).to_bytes())
    }

    /// Verify the signature over a digest.
    pub fn verify(&self, value: &Digest, author: &PublicKey) -> Result<(), CryptoError> {
        let signature = dalek::Signature::from_bytes(&self.0)?;
        let public_key = dalek::PublicKey::from_bytes(author.as_ref())?;
        public_key.verify(value.as_ref(), &signature)
    }

    /// The detached form carried inside signed directory messages.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Parse a detached signature blob, rejecting malformed input at the
    /// boundary.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        dalek::Signature::from_bytes(bytes).map(|signature| Signature(signature.to_bytes()))
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}", base64::encode(&self.0[..]))
    }
}
