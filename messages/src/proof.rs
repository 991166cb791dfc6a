//! Self-contained lookup proofs and their client-side verification.

use crate::{
    ensure,
    entry::{Entry, Profile},
    error::{MessageError, MessageResult},
    preserve::Preserved,
    ratification::SignedRatification,
    Index,
};
use config::Realm;
use crypto::vrf;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Everything a client needs to check that `profile` is the unique, latest
/// profile bound to `user_id` at a ratified epoch, assuming at least a
/// quorum's worth of honest ratifiers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LookupProof {
    pub user_id: String,
    /// The directory index, i.e. the VRF output for `user_id`.
    pub index: Index,
    /// The 81-byte VRF proof binding `index` to `user_id`.
    pub index_proof: Vec<u8>,
    /// Authenticated tree proof for the entry at `index`; opaque bytes
    /// produced and checked by the tree layer.
    pub tree_proof: Vec<u8>,
    /// `ratifications[0]` covers the epoch the lookup was resolved in; each
    /// following ratification covers the next epoch and chains back through
    /// its summary hash.
    pub ratifications: Vec<SignedRatification>,
    pub entry: Preserved<Entry>,
    pub profile: Preserved<Profile>,
}

impl LookupProof {
    /// Verify the proof in full. Any failure renders the enclosed profile
    /// unusable for any purpose other than debugging.
    pub fn verify(&self, realm: &Realm) -> MessageResult<()> {
        // The index is the correct VRF output for the identifier.
        ensure!(
            vrf::verify(
                &realm.provider.vrf_public_key.0,
                &self.index_proof,
                self.user_id.as_bytes(),
            )?,
            MessageError::VerificationFailed("vrf proof does not match user id".to_string())
        );
        ensure!(
            vrf::proof_to_hash(&self.index_proof)? == self.index,
            MessageError::VerificationFailed("index does not match vrf output".to_string())
        );

        // The entry at the index, authenticated against the ratified root.
        let resolved = self
            .ratifications
            .first()
            .ok_or_else(|| MessageError::VerificationFailed("no ratifications".to_string()))?;
        let root_hash = resolved.ratification.summary.root_hash;
        let leaf = tree::verify(&root_hash, &self.index, &self.tree_proof)?
            .ok_or(MessageError::NotFound)?;
        ensure!(
            leaf == self.entry.hash(),
            MessageError::VerificationFailed("tree leaf does not match entry".to_string())
        );

        // The profile is the one the entry commits to.
        ensure!(
            self.profile.hash() == self.entry.profile_hash,
            MessageError::VerificationFailed("profile does not match entry hash".to_string())
        );

        // Every ratification verifies and the summaries chain, so each
        // signature vouches for the resolved epoch as well.
        let mut ratifiers = HashSet::new();
        for ratification in &self.ratifications {
            ratification.verify(realm)?;
            ratifiers.insert(ratification.ratifier);
        }
        for window in self.ratifications.windows(2) {
            let (previous, next) = (&window[0], &window[1]);
            ensure!(
                next.ratification.epoch == previous.ratification.epoch + 1,
                MessageError::VerificationFailed("ratification epochs not consecutive".to_string())
            );
            ensure!(
                next.ratification.summary.previous_summary_hash
                    == previous.ratification.summary.hash(),
                MessageError::VerificationFailed("broken summary hash chain".to_string())
            );
        }

        // Quorum under the client's trust policy.
        ensure!(
            ratifiers.len() as u32 >= realm.quorum,
            MessageError::VerificationFailed(format!(
                "{} distinct ratifiers below quorum {}",
                ratifiers.len(),
                realm.quorum
            ))
        );
        Ok(())
    }
}
