mod error;
mod replicator;
mod storage;

pub use crate::{
    error::{ReplicationError, ReplicationResult},
    replicator::{LogEntry, Replicator},
    storage::RaftLogStore,
};

// The engine's wire types and storage contract, re-exported for the few
// callers that construct or inspect raw consensus state.
pub use raft::eraftpb::{ConfState, Entry, HardState, Message};
pub use raft::{GetEntriesContext, Storage as EngineStorage};
