//! ECVRF over edwards25519.
//!
//! Maps user identifiers to opaque directory indexes: `index` is the 32-byte
//! output of `proof_to_hash(prove(keypair, user_id))`, and anyone holding the
//! public key can check with `verify` that an index is the unique correct
//! output for an identifier. Proofs are 81 bytes:
//! `point(gamma) || c (16 bytes, big-endian) || s (32 bytes, big-endian)`.

use crate::KeyPair;
use curve25519_dalek::{
    constants::{BASEPOINT_ORDER, ED25519_BASEPOINT_POINT},
    edwards::{CompressedEdwardsY, EdwardsPoint},
    scalar::Scalar,
    traits::{Identity, VartimeMultiscalarMul},
};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};
use std::{convert::TryInto, iter};
use thiserror::Error;

#[cfg(test)]
#[path = "tests/vrf_tests.rs"]
pub mod vrf_tests;

/// The size of a serialized proof: sign-prefixed gamma, challenge, response.
pub const PROOF_SIZE: usize = 33 + CHALLENGE_SIZE + SCALAR_SIZE;

/// The size of the VRF output (the directory index).
pub const OUTPUT_SIZE: usize = 32;

/// The challenge is the SHA-256 of the six protocol points, truncated to 16
/// bytes and interpreted big-endian.
const CHALLENGE_SIZE: usize = 16;

/// Scalars serialize as 32-byte big-endian integers mod the group order.
const SCALAR_SIZE: usize = 32;

/// Give up hashing to the curve after this many counter increments. Reaching
/// it is infeasible for well-formed inputs: each attempt succeeds with
/// probability about one half.
const HASH_TO_CURVE_LIMIT: u32 = 10_000;

#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum VrfError {
    #[error("Public key is not a valid curve point")]
    MalformedInput,

    #[error("Failed to decode proof")]
    DecodeError,

    #[error("Randomness source unavailable")]
    InternalError,
}

/// Produce a proof that `proof_to_hash(proof)` is the correct VRF output for
/// `message` under `keypair`.
pub fn prove(keypair: &KeyPair, message: &[u8]) -> Result<Vec<u8>, VrfError> {
    let pk = keypair.public().0;
    let x = expand_secret(&keypair.seed());
    let h = hash_to_curve(message, &pk);
    let gamma = h * x;

    // A fresh ephemeral key, expanded through the same schedule as the
    // long-term secret.
    let mut ephemeral_seed = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut ephemeral_seed)
        .map_err(|_| VrfError::InternalError)?;
    let k = expand_secret(&ephemeral_seed);
    let k_public = (k * ED25519_BASEPOINT_POINT).compress().to_bytes();

    // c = H(g, h, g^x, h^x, g^k, h^k) where public keys stand in for g^x
    // and g^k.
    let c = hash_points(&[
        &point_to_os(&ED25519_BASEPOINT_POINT),
        &point_to_os(&h),
        &sign_prefixed(&pk),
        &point_to_os(&gamma),
        &sign_prefixed(&k_public),
        &point_to_os(&(h * k)),
    ]);

    // s = k - c*x mod q
    let s = k - challenge_to_scalar(&c) * x;

    let mut proof = Vec::with_capacity(PROOF_SIZE);
    proof.extend_from_slice(&point_to_os(&gamma));
    proof.extend_from_slice(&c);
    proof.extend_from_slice(&scalar_to_be(&s));
    Ok(proof)
}

/// Check that `proof` is a valid VRF proof for `message` under `public_key`.
/// Well-formed inputs that fail the cryptographic check return `Ok(false)`.
pub fn verify(public_key: &[u8; 32], proof: &[u8], message: &[u8]) -> Result<bool, VrfError> {
    let (gamma, c, s) = decode_proof(proof)?;
    let p = os_to_point(public_key, public_key[31] >> 7).ok_or(VrfError::MalformedInput)?;

    let c_scalar = challenge_to_scalar(&c);

    // u = P^c * g^s
    let u = EdwardsPoint::vartime_double_scalar_mul_basepoint(&c_scalar, &p, &s);

    // v = gamma^c * h^s
    let h = hash_to_curve(message, public_key);
    let v = EdwardsPoint::vartime_multiscalar_mul(
        iter::once(c_scalar).chain(iter::once(s)),
        iter::once(gamma).chain(iter::once(h)),
    );

    let expected = hash_points(&[
        &point_to_os(&ED25519_BASEPOINT_POINT),
        &point_to_os(&h),
        &sign_prefixed(public_key),
        &point_to_os(&gamma),
        &point_to_os(&u),
        &point_to_os(&v),
    ]);
    Ok(expected == c)
}

/// The 32-byte VRF output embedded in a proof: the encoded gamma point,
/// which serves as the directory index.
pub fn proof_to_hash(proof: &[u8]) -> Result<[u8; OUTPUT_SIZE], VrfError> {
    if proof.len() != PROOF_SIZE || (proof[0] != 2 && proof[0] != 3) {
        return Err(VrfError::DecodeError);
    }
    let mut output = [0u8; OUTPUT_SIZE];
    output.copy_from_slice(&proof[1..33]);
    Ok(output)
}

fn decode_proof(proof: &[u8]) -> Result<(EdwardsPoint, [u8; CHALLENGE_SIZE], Scalar), VrfError> {
    if proof.len() != PROOF_SIZE {
        return Err(VrfError::DecodeError);
    }
    let sign = proof[0];
    if sign != 2 && sign != 3 {
        return Err(VrfError::DecodeError);
    }
    let mut gamma_bytes = [0u8; 32];
    gamma_bytes.copy_from_slice(&proof[1..33]);
    let gamma = os_to_point(&gamma_bytes, sign - 2).ok_or(VrfError::DecodeError)?;

    let mut c = [0u8; CHALLENGE_SIZE];
    c.copy_from_slice(&proof[33..33 + CHALLENGE_SIZE]);

    let mut s_be = [0u8; SCALAR_SIZE];
    s_be.copy_from_slice(&proof[33 + CHALLENGE_SIZE..]);
    let s = be_to_scalar(&s_be).ok_or(VrfError::DecodeError)?;

    Ok((gamma, c, s))
}

/// Map a message to a curve point by try-and-increment: hash the message,
/// the public key, and a 32-bit big-endian counter, and attempt to decode
/// the digest as a point with sign 0, then sign 1.
fn hash_to_curve(message: &[u8], public_key: &[u8; 32]) -> EdwardsPoint {
    for i in 0..HASH_TO_CURVE_LIMIT {
        let mut hasher = Sha256::new();
        hasher.update(message);
        hasher.update(public_key);
        hasher.update(&i.to_be_bytes());
        let digest: [u8; 32] = hasher.finalize().as_slice().try_into().unwrap();
        for sign in 0..2 {
            if let Some(point) = os_to_point(&digest, sign) {
                return point;
            }
        }
    }
    panic!(
        "hash_to_curve: no valid point within {} attempts",
        HASH_TO_CURVE_LIMIT
    )
}

/// SHA-256 over the concatenated point encodings, truncated to the first 16
/// bytes (big-endian integer).
fn hash_points(points: &[&[u8]]) -> [u8; CHALLENGE_SIZE] {
    let mut hasher = Sha256::new();
    for point in points {
        hasher.update(point);
    }
    let digest = hasher.finalize();
    let mut truncated = [0u8; CHALLENGE_SIZE];
    truncated.copy_from_slice(&digest.as_slice()[..CHALLENGE_SIZE]);
    truncated
}

/// The standard Ed25519 secret expansion: SHA-512 of the seed, clamped and
/// reduced into a scalar.
fn expand_secret(seed: &[u8; 32]) -> Scalar {
    let digest = Sha512::digest(seed);
    let mut scalar_bytes = [0u8; 32];
    scalar_bytes.copy_from_slice(&digest.as_slice()[..32]);
    scalar_bytes[0] &= 248;
    scalar_bytes[31] &= 127;
    scalar_bytes[31] |= 64;
    Scalar::from_bytes_mod_order(scalar_bytes)
}

/// Decode a 32-byte encoding with an explicit sign bit (0 or 1), rejecting
/// points off the curve or outside the prime-order subgroup: multiplying by
/// the group order must give the identity.
fn os_to_point(bytes: &[u8; 32], sign: u8) -> Option<EdwardsPoint> {
    let mut buf = *bytes;
    buf[31] = (sign << 7) | (buf[31] & 0x7f);
    let point = CompressedEdwardsY(buf).decompress()?;
    if point * BASEPOINT_ORDER != EdwardsPoint::identity() {
        return None;
    }
    Some(point)
}

/// Encode a point as its compressed form with a leading sign octet:
/// 0x02 if the sign of x is positive, 0x03 if negative.
fn point_to_os(point: &EdwardsPoint) -> [u8; 33] {
    sign_prefixed(&point.compress().to_bytes())
}

fn sign_prefixed(encoded: &[u8; 32]) -> [u8; 33] {
    let mut out = [0u8; 33];
    out[0] = (encoded[31] >> 7) + 2;
    out[1..].copy_from_slice(encoded);
    out
}

/// The 16-byte big-endian challenge as a scalar.
fn challenge_to_scalar(c: &[u8; CHALLENGE_SIZE]) -> Scalar {
    let mut le = [0u8; 32];
    for (i, byte) in c.iter().rev().enumerate() {
        le[i] = *byte;
    }
    Scalar::from_bytes_mod_order(le)
}

fn scalar_to_be(s: &Scalar) -> [u8; SCALAR_SIZE] {
    let mut be = s.to_bytes();
    be.reverse();
    be
}

fn be_to_scalar(be: &[u8; SCALAR_SIZE]) -> Option<Scalar> {
    let mut le = *be;
    le.reverse();
    Scalar::from_canonical_bytes(le)
}
