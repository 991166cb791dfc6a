//! Polymorphic signature verifiers.
//!
//! An entry's `update_key` and a realm's ratifier policy are both expressed
//! as a [`SignatureVerifier`]: either a single Ed25519 public key or a
//! threshold over a list of sub-verifiers. Threshold verification is not
//! aggregatable; it enumerates the supplied sub-signatures and checks each
//! one independently.

use crate::{Digest, PublicKey, Signature};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

#[cfg(test)]
#[path = "tests/verifier_tests.rs"]
pub mod verifier_tests;

/// Threshold hierarchies deeper than this fail verification outright.
const MAX_VERIFIER_DEPTH: usize = 8;

#[derive(Debug, Error)]
pub enum VerifierError {
    #[error("Signature blob failed decoding: {0}")]
    MalformedSignature(String),

    #[error("Threshold signature arrays have mismatched lengths")]
    MismatchedArrays,

    #[error("Sub-verifier index {0} out of range")]
    IndexOutOfRange(u32),

    #[error("Sub-verifier index {0} supplied more than once")]
    DuplicateIndex(u32),

    #[error("Got {got} sub-signatures but the threshold is {threshold}")]
    NotEnoughSignatures { threshold: u32, got: u32 },

    #[error("Verifier nesting exceeds depth {MAX_VERIFIER_DEPTH}")]
    DepthExceeded,

    #[error("Signature verification failed")]
    VerificationFailed,
}

/// A verifier authorized to replace a directory entry or ratify an epoch.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub enum SignatureVerifier {
    /// A single Ed25519 public key checking a detached 64-byte signature.
    Ed25519(PublicKey),
    /// Accepts iff at least `threshold` of the sub-verifiers accept the same
    /// message under the sub-signatures carried in a [`ThresholdSignature`].
    Threshold {
        threshold: u32,
        verifiers: Vec<SignatureVerifier>,
    },
}

/// The signature blob consumed by a threshold verifier: parallel arrays
/// mapping sub-verifier indexes to detached sub-signatures.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ThresholdSignature {
    pub key_indexes: Vec<u32>,
    pub signatures: Vec<Vec<u8>>,
}

impl SignatureVerifier {
    /// Verify `signature_blob` over the digest of a signed message.
    pub fn verify(&self, value: &Digest, signature_blob: &[u8]) -> Result<(), VerifierError> {
        self.verify_at_depth(value, signature_blob, 0)
    }

    fn verify_at_depth(
        &self,
        value: &Digest,
        signature_blob: &[u8],
        depth: usize,
    ) -> Result<(), VerifierError> {
        if depth >= MAX_VERIFIER_DEPTH {
            return Err(VerifierError::DepthExceeded);
        }
        match self {
            SignatureVerifier::Ed25519(public_key) => {
                let signature = Signature::from_bytes(signature_blob)
                    .map_err(|e| VerifierError::MalformedSignature(e.to_string()))?;
                signature
                    .verify(value, public_key)
                    .map_err(|_| VerifierError::VerificationFailed)
            }
            SignatureVerifier::Threshold {
                threshold,
                verifiers,
            } => {
                let decoded: ThresholdSignature = bincode::deserialize(signature_blob)
                    .map_err(|e| VerifierError::MalformedSignature(e.to_string()))?;
                if decoded.key_indexes.len() != decoded.signatures.len() {
                    return Err(VerifierError::MismatchedArrays);
                }
                let mut used = HashSet::new();
                for index in &decoded.key_indexes {
                    if *index as usize >= verifiers.len() {
                        return Err(VerifierError::IndexOutOfRange(*index));
                    }
                    if !used.insert(*index) {
                        return Err(VerifierError::DuplicateIndex(*index));
                    }
                }
                if (decoded.key_indexes.len() as u32) < *threshold {
                    return Err(VerifierError::NotEnoughSignatures {
                        threshold: *threshold,
                        got: decoded.key_indexes.len() as u32,
                    });
                }

                let mut accepted = 0u32;
                for (index, signature) in decoded.key_indexes.iter().zip(&decoded.signatures) {
                    if verifiers[*index as usize]
                        .verify_at_depth(value, signature, depth + 1)
                        .is_ok()
                    {
                        accepted += 1;
                    }
                }
                if accepted >= *threshold {
                    Ok(())
                } else {
                    Err(VerifierError::VerificationFailed)
                }
            }
        }
    }
}
