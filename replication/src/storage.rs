//! Persistence for the consensus engine.
//!
//! Three key families live under a configurable prefix in the ordered
//! key-value store: the hard state at `P || "HS"`, the cluster membership at
//! `P || "CS"`, and one entry per log slot at `P || "E" || u64_be(index)`.
//! Values are the engine's own serialized forms.

use crate::error::ReplicationError;
use prost::Message as _;
use raft::{
    eraftpb::{ConfState, Entry, HardState, Snapshot},
    GetEntriesContext, RaftState, Storage as RaftStorage, StorageError,
};
use std::convert::TryInto;
use storage::{BatchOp, Storage, StoreError};

const HARD_STATE_KEY: &[u8] = b"HS";
const CONF_STATE_KEY: &[u8] = b"CS";
const ENTRY_KEY_PREFIX: &[u8] = b"E";

/// Log index 0 holds a sentinel entry so that the first real slot is 1,
/// matching the engine's expectations for a fresh log.
pub const SENTINEL_INDEX: u64 = 0;

/// The engine's persistent storage. Carries no in-memory mutable state, so
/// reads are safe to call concurrently with [`save`](RaftLogStore::save);
/// `save` itself must have a single caller.
#[derive(Clone)]
pub struct RaftLogStore {
    hard_state_key: Vec<u8>,
    conf_state_key: Vec<u8>,
    entry_key_prefix: Vec<u8>,
    db: Storage,
    initial_conf: ConfState,
}

impl RaftLogStore {
    /// Attach to an already open key-value store. `initial_conf` is the
    /// configured membership reported until a conf state is persisted.
    pub fn open(db: Storage, prefix: &[u8], initial_conf: ConfState) -> Self {
        Self {
            hard_state_key: [prefix, HARD_STATE_KEY].concat(),
            conf_state_key: [prefix, CONF_STATE_KEY].concat(),
            entry_key_prefix: [prefix, ENTRY_KEY_PREFIX].concat(),
            db,
            initial_conf,
        }
    }

    /// Whether a previous incarnation persisted any state here.
    pub fn is_initialized(&self) -> Result<bool, StoreError> {
        Ok(self.db.read(&self.hard_state_key)?.is_some())
    }

    fn entry_key(&self, index: u64) -> Vec<u8> {
        let mut key = self.entry_key_prefix.clone();
        key.extend_from_slice(&index.to_be_bytes());
        key
    }

    fn entry_index(&self, key: &[u8]) -> u64 {
        let suffix = &key[self.entry_key_prefix.len()..];
        u64::from_be_bytes(suffix.try_into().expect("Malformed entry key"))
    }

    /// Atomically persist the hard state and append `entries`, truncating
    /// any uncommitted tail they overlap. A gap between the new entries and
    /// the existing log violates the engine's contract and is fatal. Must
    /// not be called concurrently with itself.
    pub fn save(&self, hard_state: &HardState, entries: &[Entry]) -> Result<(), StoreError> {
        let mut operations = vec![BatchOp::Put(
            self.hard_state_key.clone(),
            hard_state.encode_to_vec(),
        )];
        if !entries.is_empty() {
            let last_index = self.last_entry_index()?;
            if entries[0].index > last_index + 1 {
                panic!(
                    "missing log entries [last: {}, append at: {}]",
                    last_index, entries[0].index
                );
            }
            // Clear all old entries past the new index, if any.
            for index in entries[0].index..=last_index {
                operations.push(BatchOp::Delete(self.entry_key(index)));
            }
            for entry in entries {
                operations.push(BatchOp::Put(
                    self.entry_key(entry.index),
                    entry.encode_to_vec(),
                ));
            }
        }
        self.db.write_batch(operations)
    }

    /// Persist a new cluster membership after a configuration change.
    pub fn save_conf_state(&self, conf_state: &ConfState) -> Result<(), StoreError> {
        self.db
            .write(&self.conf_state_key, &conf_state.encode_to_vec())
    }

    /// The index of the last persisted entry, or 0 when only the sentinel
    /// (or nothing) is present.
    fn last_entry_index(&self) -> Result<u64, StoreError> {
        Ok(self
            .db
            .last_in_prefix(&self.entry_key_prefix)?
            .map(|(key, _)| self.entry_index(&key))
            .unwrap_or(SENTINEL_INDEX))
    }

    /// Decode the entries in `[low, high)`, accumulating until the
    /// serialized size strictly exceeds `max_size`; at least one entry is
    /// returned whenever the range is non-empty.
    pub(crate) fn typed_entries(
        &self,
        low: u64,
        high: u64,
        max_size: u64,
    ) -> Result<Vec<Entry>, ReplicationError> {
        let mut entries = Vec::new();
        let mut size_so_far = 0u64;
        for (_, value) in self
            .db
            .iter_range(&self.entry_key(low), &self.entry_key(high))?
        {
            let entry = Entry::decode(value.as_slice())
                .map_err(|e| ReplicationError::CorruptEntry(e.to_string()))?;
            size_so_far += entry.encoded_len() as u64;
            // Only stop if we already have at least one entry.
            if size_so_far > max_size && !entries.is_empty() {
                break;
            }
            entries.push(entry);
            if size_so_far >= max_size {
                break;
            }
        }
        Ok(entries)
    }
}

impl RaftStorage for RaftLogStore {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let conf_state = match self.db.read(&self.conf_state_key).map_err(other)? {
            Some(bytes) => ConfState::decode(bytes.as_slice()).map_err(other)?,
            None => self.initial_conf.clone(),
        };
        let hard_state = match self.db.read(&self.hard_state_key).map_err(other)? {
            Some(bytes) => HardState::decode(bytes.as_slice()).map_err(other)?,
            None => HardState::default(),
        };
        Ok(RaftState {
            hard_state,
            conf_state,
        })
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let max_size = max_size.into().unwrap_or(u64::MAX);
        self.typed_entries(low, high, max_size).map_err(other)
    }

    fn term(&self, index: u64) -> raft::Result<u64> {
        let entries = self.typed_entries(index, index + 1, u64::MAX).map_err(other)?;
        if entries.len() != 1 {
            panic!(
                "number of entries with index {} not 1: {}",
                index,
                entries.len()
            );
        }
        Ok(entries[0].term)
    }

    fn first_index(&self) -> raft::Result<u64> {
        // The zeroth slot holds the sentinel.
        Ok(SENTINEL_INDEX + 1)
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.last_entry_index().map_err(other)
    }

    fn snapshot(&self, _request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        // Snapshots are out of scope; the log is never compacted, so the
        // engine never needs one.
        Err(raft::Error::Store(
            StorageError::SnapshotTemporarilyUnavailable,
        ))
    }
}

fn other<E: std::error::Error + Send + Sync + 'static>(error: E) -> raft::Error {
    raft::Error::Store(StorageError::Other(Box::new(error)))
}
