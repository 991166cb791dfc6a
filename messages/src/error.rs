use crypto::{verifier::VerifierError, vrf::VrfError, CryptoError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[macro_export]
macro_rules! bail {
    ($e:expr) => {
        return Err($e);
    };
}

#[macro_export(local_inner_macros)]
macro_rules! ensure {
    ($cond:expr, $e:expr) => {
        if !($cond) {
            bail!($e);
        }
    };
}

/// Convenient result wrapper.
pub type MessageResult<T> = Result<T, MessageError>;

/// Errors triggered when parsing and verifying directory messages. These are
/// transport-independent: a cryptographic failure is reported to the caller
/// and never retried.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq)]
pub enum MessageError {
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Failed to decode message ({0})")]
    DecodeError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("New entry version {got} does not exceed prior version {prior}")]
    VersionRegression { prior: u64, got: u64 },

    #[error("Update not authorized: {0}")]
    Unauthorized(String),

    #[error("Not found")]
    NotFound,

    #[error("Proposed entry at {proposed} skips the log (last index {last})")]
    ConsensusGap { last: u64, proposed: u64 },

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Ratification signed by unknown ratifier {0:x}")]
    UnknownRatifier(u64),
}

impl From<VrfError> for MessageError {
    fn from(error: VrfError) -> Self {
        match error {
            VrfError::MalformedInput => MessageError::MalformedInput("vrf public key".to_string()),
            VrfError::DecodeError => MessageError::DecodeError("vrf proof".to_string()),
            VrfError::InternalError => MessageError::InternalError("vrf randomness".to_string()),
        }
    }
}

impl From<VerifierError> for MessageError {
    fn from(error: VerifierError) -> Self {
        MessageError::VerificationFailed(error.to_string())
    }
}

impl From<CryptoError> for MessageError {
    fn from(error: CryptoError) -> Self {
        MessageError::VerificationFailed(error.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for MessageError {
    fn from(error: Box<bincode::ErrorKind>) -> Self {
        MessageError::DecodeError(error.to_string())
    }
}

impl From<tree::TreeError> for MessageError {
    fn from(error: tree::TreeError) -> Self {
        MessageError::VerificationFailed(error.to_string())
    }
}
