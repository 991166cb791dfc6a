//! Encoding-preserving wrapper for signed and hashed values.
//!
//! Any value whose bytes cross a signature or hash boundary is carried as a
//! pair of the decoded view and the exact bytes it was decoded from.
//! Re-serialization emits the preserved bytes verbatim, so signatures and
//! hashes stay valid across arbitrary intermediate handling even if the
//! serializer is not byte-stable. Mutating the decoded view requires an
//! explicit re-encode.

use crate::error::{MessageError, MessageResult};
use crypto::Digest;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::ops::Deref;

#[derive(Clone)]
pub struct Preserved<T> {
    decoded: T,
    encoding: Vec<u8>,
}

impl<T: Serialize> Preserved<T> {
    /// Wrap a freshly built value, fixing its canonical encoding now.
    pub fn new(decoded: T) -> MessageResult<Self> {
        let encoding = bincode::serialize(&decoded)
            .map_err(|e| MessageError::InternalError(e.to_string()))?;
        Ok(Self { decoded, encoding })
    }

    /// Mutate the decoded view and refresh the preserved encoding. The old
    /// bytes are discarded; any signature over them no longer applies.
    pub fn modify<F>(&mut self, mutate: F) -> MessageResult<()>
    where
        F: FnOnce(&mut T),
    {
        mutate(&mut self.decoded);
        self.update_encoding()
    }

    /// Re-serialize the decoded view into the preserved encoding.
    pub fn update_encoding(&mut self) -> MessageResult<()> {
        self.encoding = bincode::serialize(&self.decoded)
            .map_err(|e| MessageError::InternalError(e.to_string()))?;
        Ok(())
    }
}

impl<T: DeserializeOwned> Preserved<T> {
    /// Parse a value, keeping the input bytes verbatim.
    pub fn from_bytes(encoding: Vec<u8>) -> MessageResult<Self> {
        let decoded =
            bincode::deserialize(&encoding).map_err(|e| MessageError::DecodeError(e.to_string()))?;
        Ok(Self { decoded, encoding })
    }
}

impl<T> Preserved<T> {
    /// The exact bytes signatures and hashes are computed over.
    pub fn encoding(&self) -> &[u8] {
        &self.encoding
    }

    /// The SHA-256 hash of the preserved encoding.
    pub fn hash(&self) -> Digest {
        Digest::of(&self.encoding)
    }
}

impl<T> Deref for Preserved<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.decoded
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Preserved<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        self.decoded.fmt(f)
    }
}

// Equality and hashing are structural: values generated in tests compare by
// content, never by raw bytes.
impl<T: PartialEq> PartialEq for Preserved<T> {
    fn eq(&self, other: &Self) -> bool {
        self.decoded == other.decoded
    }
}

impl<T: Eq> Eq for Preserved<T> {}

impl<T: std::hash::Hash> std::hash::Hash for Preserved<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.decoded.hash(state)
    }
}

impl<T> Serialize for Preserved<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_bytes(&self.encoding)
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Preserved<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        struct BytesVisitor;

        impl<'de> serde::de::Visitor<'de> for BytesVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, "a preserved byte encoding")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                Ok(v.to_vec())
            }

            fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                Ok(v)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(byte) = seq.next_element()? {
                    bytes.push(byte);
                }
                Ok(bytes)
            }
        }

        let encoding = deserializer.deserialize_byte_buf(BytesVisitor)?;
        Preserved::from_bytes(encoding).map_err(|e| serde::de::Error::custom(e.to_string()))
    }
}
