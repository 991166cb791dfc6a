pub mod entry;
pub mod error;
pub mod preserve;
pub mod proof;
pub mod ratification;

use entry::SignedEntryUpdate;
use error::MessageResult;
use proof::LookupProof;
use serde::{Deserialize, Serialize};

/// The 32-byte VRF output keying the authenticated directory tree.
pub type Index = [u8; 32];

/// A monotonically increasing label of successive published directory
/// states.
pub type Epoch = u64;

/// Requests sent by clients to the serving provider.
#[derive(Serialize, Deserialize, Debug)]
pub enum ClientToServerMessage {
    LookupProfile(LookupProfileRequest),
    UpdateProfile(Box<SignedEntryUpdate>),
}

/// A lookup of the latest profile bound to a user identifier.
#[derive(Serialize, Deserialize, Debug)]
pub struct LookupProfileRequest {
    pub user_id: String,
}

/// Replies sent by the provider to clients. Both lookups and updates answer
/// with a self-contained proof of the resulting state.
#[derive(Serialize, Deserialize, Debug)]
pub enum ServerToClientMessage {
    LookupProof(Box<MessageResult<LookupProof>>),
}
