//! Epoch summaries and the ratifications vouching for them.

use crate::{
    ensure,
    error::{MessageError, MessageResult},
    preserve::Preserved,
    Epoch,
};
use config::Realm;
use crypto::{Digest, KeyPair, Signature};
use serde::{Deserialize, Serialize};

/// The per-epoch commitment to the directory: the root of the authenticated
/// tree and the hash of the previous epoch's summary, forming a chain. A
/// single ratification of a later summary implicitly vouches for every
/// preceding epoch in the chain.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyserverStateSummary {
    pub root_hash: Digest,
    pub previous_summary_hash: Digest,
}

/// The statement a ratifier signs about one epoch.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ratification {
    /// Fully qualified domain name of the directory's administrative scope.
    pub realm: String,
    pub epoch: Epoch,
    pub summary: Preserved<KeyserverStateSummary>,
    /// Seconds since the Unix epoch at signing time.
    pub timestamp: u64,
}

/// A ratification together with the signature of one ratifier, identified
/// by the 64-bit hash of its public key. The provider retains only the
/// latest signature per ratifier.
#[derive(Serialize, Deserialize, Clone, PartialEq)]
pub struct SignedRatification {
    pub ratifier: u64,
    pub ratification: Preserved<Ratification>,
    pub signature: Vec<u8>,
}

impl SignedRatification {
    /// Ratify an epoch summary with this node's signing key.
    pub fn new(
        realm: String,
        epoch: Epoch,
        summary: Preserved<KeyserverStateSummary>,
        timestamp: u64,
        keypair: &KeyPair,
    ) -> MessageResult<Self> {
        let ratification = Preserved::new(Ratification {
            realm,
            epoch,
            summary,
            timestamp,
        })?;
        let signature = Signature::new(&ratification.hash(), keypair).to_bytes();
        Ok(Self {
            ratifier: keypair.public().id(),
            ratification,
            signature,
        })
    }

    /// The digest the ratifier signed: the hash of the preserved
    /// ratification bytes.
    pub fn digest(&self) -> Digest {
        self.ratification.hash()
    }

    /// Check the signature against the realm's ratifier set.
    pub fn verify(&self, realm: &Realm) -> MessageResult<()> {
        let public_key = realm
            .ratifier_key(self.ratifier)
            .ok_or(MessageError::UnknownRatifier(self.ratifier))?;
        ensure!(
            self.ratification.realm == realm.realm,
            MessageError::VerificationFailed(format!(
                "ratification for foreign realm {}",
                self.ratification.realm
            ))
        );
        let signature = Signature::from_bytes(&self.signature)?;
        signature
            .verify(&self.digest(), public_key)
            .map_err(MessageError::from)
    }
}

impl std::fmt::Debug for SignedRatification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "R{}({:x}, {})",
            self.ratification.epoch,
            self.ratifier,
            self.ratification.summary.root_hash,
        )
    }
}
