//! Per-user directory records and the commands that replace them.

use crate::{preserve::Preserved, Index};
use crypto::{verifier::SignatureVerifier, Digest, KeyPair, Signature};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The user-visible payload bound to an identifier: one PGP public key
/// packet per email address, with room for per-application keys keyed by
/// port number. The random nonce keeps honest profiles distinct under
/// hashing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Profile {
    pub nonce: [u8; 16],
    pub keys: BTreeMap<String, Vec<u8>>,
}

impl Profile {
    /// Build a profile with a fresh nonce.
    pub fn new<R>(keys: BTreeMap<String, Vec<u8>>, csprng: &mut R) -> Self
    where
        R: CryptoRng + RngCore,
    {
        let mut nonce = [0u8; 16];
        csprng.fill_bytes(&mut nonce);
        Self { nonce, keys }
    }
}

/// The authenticated per-index record served to clients. Profiles are never
/// embedded: they may carry private data not exposed to ratifiers, so the
/// entry holds only a content-addressed reference.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Entry {
    /// Strictly increases across updates of the same index.
    pub version: u64,
    /// The verifier authorized to replace this entry.
    pub update_key: SignatureVerifier,
    /// Hash of the preserved encoding of the referenced profile.
    pub profile_hash: Digest,
}

/// A replacement of the entry at one directory index.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryUpdate {
    pub index: Index,
    pub new_entry: Preserved<Entry>,
}

/// The replicated command mutating the directory. `new_sig` must verify
/// under the new entry's update key; `old_sig` must verify under the
/// previous entry's update key whenever a previous entry exists.
#[derive(Serialize, Deserialize, Clone, PartialEq)]
pub struct SignedEntryUpdate {
    pub update: Preserved<EntryUpdate>,
    pub new_sig: Vec<u8>,
    pub old_sig: Vec<u8>,
    /// The profile referenced by the new entry, so the provider can store
    /// it. Not exposed to auditors.
    pub profile: Option<Preserved<Profile>>,
}

impl SignedEntryUpdate {
    /// Sign an update with single-key verifiers: `new_keypair` must match
    /// the new entry's update key and `old_keypair` the previous entry's,
    /// when one exists.
    pub fn new(
        update: Preserved<EntryUpdate>,
        new_keypair: &KeyPair,
        old_keypair: Option<&KeyPair>,
        profile: Option<Preserved<Profile>>,
    ) -> Self {
        let digest = update.hash();
        let new_sig = Signature::new(&digest, new_keypair).to_bytes();
        let old_sig = old_keypair
            .map(|keypair| Signature::new(&digest, keypair).to_bytes())
            .unwrap_or_default();
        Self {
            update,
            new_sig,
            old_sig,
            profile,
        }
    }

    /// The digest both signatures are computed over: the hash of the
    /// preserved update bytes.
    pub fn digest(&self) -> Digest {
        self.update.hash()
    }
}

impl std::fmt::Debug for SignedEntryUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "U{}({}, v{})",
            self.digest(),
            base64::encode(&self.update.index),
            self.update.new_entry.version,
        )
    }
}
