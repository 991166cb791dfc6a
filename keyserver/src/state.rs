//! The replicated directory state machine.
//!
//! Applies committed entry updates in log order, maintains the
//! authenticated tree, assigns epochs, and signs a ratification of every
//! epoch summary. Rebuilt from the replicated log on startup; the log is
//! the authority.

use crypto::{vrf, Digest, KeyPair};
use log::debug;
use messages::{
    ensure,
    entry::{Entry, Profile, SignedEntryUpdate},
    error::{MessageError, MessageResult},
    preserve::Preserved,
    proof::LookupProof,
    ratification::{KeyserverStateSummary, SignedRatification},
    Epoch, Index,
};
use std::{
    collections::{BTreeMap, HashMap},
    time::{SystemTime, UNIX_EPOCH},
};
use tree::MerkleTree;

pub struct DirectoryState {
    /// The administrative scope every ratification names.
    realm: String,
    /// Signs this provider's ratifications.
    keypair: KeyPair,
    /// Derives directory indexes from user identifiers.
    vrf_keypair: KeyPair,
    tree: MerkleTree,
    entries: HashMap<Index, Preserved<Entry>>,
    /// Content-addressed profile store: hash of preserved bytes -> profile.
    profiles: HashMap<Digest, Preserved<Profile>>,
    epoch: Epoch,
    /// Hash of the latest epoch's summary, chaining the next one.
    latest_summary_hash: Digest,
    /// The latest valid signature per ratifier; earlier ones are implied by
    /// the summary chain and need not be served.
    ratifications: BTreeMap<u64, SignedRatification>,
}

impl DirectoryState {
    pub fn new(realm: String, keypair: KeyPair, vrf_keypair: KeyPair) -> Self {
        Self {
            realm,
            keypair,
            vrf_keypair,
            tree: MerkleTree::new(),
            entries: HashMap::new(),
            profiles: HashMap::new(),
            epoch: 0,
            latest_summary_hash: Digest::default(),
            ratifications: BTreeMap::new(),
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn root_hash(&self) -> Digest {
        self.tree.root()
    }

    /// Admission check for an update against the current state: the new
    /// version must strictly exceed the prior one, the new signature must
    /// verify under the new entry's update key, and, when a prior entry
    /// exists, the old signature must verify under its update key.
    pub fn verify_update(&self, signed: &SignedEntryUpdate) -> MessageResult<()> {
        let digest = signed.digest();
        let new_entry = &signed.update.new_entry;

        if let Some(previous) = self.entries.get(&signed.update.index) {
            ensure!(
                new_entry.version > previous.version,
                MessageError::VersionRegression {
                    prior: previous.version,
                    got: new_entry.version,
                }
            );
            previous
                .update_key
                .verify(&digest, &signed.old_sig)
                .map_err(|e| MessageError::Unauthorized(format!("old signature: {}", e)))?;
        }
        new_entry
            .update_key
            .verify(&digest, &signed.new_sig)
            .map_err(|e| MessageError::Unauthorized(format!("new signature: {}", e)))?;

        if let Some(profile) = &signed.profile {
            ensure!(
                profile.hash() == new_entry.profile_hash,
                MessageError::MalformedInput("profile does not match entry hash".to_string())
            );
        }
        Ok(())
    }

    /// Apply one committed log entry. Empty entries are consensus no-ops
    /// and advance nothing; invalid updates are rejected deterministically
    /// on every replica.
    pub fn apply_committed(&mut self, data: &[u8]) -> MessageResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let signed: SignedEntryUpdate = bincode::deserialize(data)?;
        self.verify_update(&signed)?;

        let index = signed.update.index;
        if let Some(profile) = &signed.profile {
            self.profiles.insert(profile.hash(), profile.clone());
        }
        self.tree.insert(index, signed.update.new_entry.hash());
        self.entries.insert(index, signed.update.new_entry.clone());
        debug!(
            "Applied update for {} at epoch {}",
            base64_index(&index),
            self.epoch + 1
        );
        self.advance_epoch()
    }

    /// Seal the new directory state into the next epoch: chain its summary
    /// to the previous one and ratify it with this provider's key.
    fn advance_epoch(&mut self) -> MessageResult<()> {
        self.epoch += 1;
        let summary = Preserved::new(KeyserverStateSummary {
            root_hash: self.tree.root(),
            previous_summary_hash: self.latest_summary_hash,
        })?;
        let summary_hash = summary.hash();
        let ratification = SignedRatification::new(
            self.realm.clone(),
            self.epoch,
            summary,
            unix_timestamp(),
            &self.keypair,
        )?;
        self.ratifications
            .insert(ratification.ratifier, ratification);
        self.latest_summary_hash = summary_hash;
        Ok(())
    }

    /// Resolve a lookup at the latest ratified epoch, assembling the
    /// self-contained proof: VRF proof, authenticated tree branch,
    /// ratifications, and the referenced profile.
    pub fn lookup(&self, user_id: &str) -> MessageResult<LookupProof> {
        let index_proof = vrf::prove(&self.vrf_keypair, user_id.as_bytes())?;
        let index = vrf::proof_to_hash(&index_proof)?;

        let entry = self.entries.get(&index).ok_or(MessageError::NotFound)?;
        let profile = self
            .profiles
            .get(&entry.profile_hash)
            .ok_or(MessageError::NotFound)?;
        let tree_proof = self.tree.prove(&index);

        // Serve every ratifier's latest signature covering the resolved
        // epoch.
        let ratifications: Vec<_> = self
            .ratifications
            .values()
            .filter(|ratification| ratification.ratification.epoch == self.epoch)
            .cloned()
            .collect();

        Ok(LookupProof {
            user_id: user_id.to_string(),
            index,
            index_proof,
            tree_proof,
            ratifications,
            entry: entry.clone(),
            profile: profile.clone(),
        })
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Clock is before the Unix epoch")
        .as_secs()
}

fn base64_index(index: &Index) -> String {
    base64::encode(index)
}
