// Message store - Persistent state of the sync engine
//
// MessageStore is the contract the engine needs:
// - Content-addressed blobs (message envelopes and auxiliary content)
// - Per-friend root pointers, one per conversation direction
// - The friend set
//
// SledStore implements it on sled, plus keypair persistence for the node identity.

use crate::identity::{Keypair, PublicKey};
use crate::sync::{ContentHash, Pointer};
use std::path::Path;
use thiserror::Error;

/// Key prefixes for organizing data
mod keys {
    pub const IDENTITY_KEYPAIR: &[u8] = b"identity:keypair";
    pub const BLOB_PREFIX: &[u8] = b"blob:";
    pub const ROOT_OUT_PREFIX: &[u8] = b"root:out:";
    pub const ROOT_IN_PREFIX: &[u8] = b"root:in:";
    pub const FRIEND_PREFIX: &[u8] = b"friend:";
}

/// Errors from storage operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to open database: {0}")]
    OpenFailed(String),

    #[error("Database operation failed: {0}")]
    DatabaseError(String),

    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Flush failed: {0}")]
    FlushFailed(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::DatabaseError(err.to_string())
    }
}

/// Which side of a conversation a root pointer tracks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Messages this node sent to the friend
    Outgoing,
    /// Messages the friend sent to this node (trusted tier only)
    Incoming,
}

impl Direction {
    fn prefix(self) -> &'static [u8] {
        match self {
            Direction::Outgoing => keys::ROOT_OUT_PREFIX,
            Direction::Incoming => keys::ROOT_IN_PREFIX,
        }
    }
}

/// Durable state the sync engine relies on across restarts
pub trait MessageStore: Send + Sync {
    /// Store a blob under the hash of its bytes
    fn put_blob(&self, bytes: &[u8]) -> Result<ContentHash, StoreError>;

    fn blob(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, StoreError>;

    fn has_blob(&self, hash: &ContentHash) -> Result<bool, StoreError>;

    fn root(
        &self,
        direction: Direction,
        friend: &PublicKey,
    ) -> Result<Option<Pointer>, StoreError>;

    fn set_root(
        &self,
        direction: Direction,
        friend: &PublicKey,
        pointer: &Pointer,
    ) -> Result<(), StoreError>;

    /// Forget both conversation pointers for a friend
    fn clear_roots(&self, friend: &PublicKey) -> Result<(), StoreError>;

    fn add_friend(&self, friend: &PublicKey) -> Result<(), StoreError>;

    fn remove_friend(&self, friend: &PublicKey) -> Result<(), StoreError>;

    fn friends(&self) -> Result<Vec<PublicKey>, StoreError>;
}

/// Statistics about the storage
#[derive(Clone, Debug)]
pub struct StorageStats {
    /// Number of keys in the database
    pub key_count: usize,
    /// Approximate disk size in bytes
    pub disk_size_bytes: u64,
}

/// sled-backed message store
///
/// All writes are atomic; they are durable after `flush` (sled also
/// flushes periodically on its own).
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| StoreError::OpenFailed(e.to_string()))?;
        Ok(Self { db })
    }

    /// Open a throwaway store that is deleted when dropped
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StoreError::OpenFailed(e.to_string()))?;
        Ok(Self { db })
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::FlushFailed(e.to_string()))?;
        Ok(())
    }

    /// Get storage statistics
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            key_count: self.db.len(),
            disk_size_bytes: self.db.size_on_disk().unwrap_or(0),
        }
    }

    fn key(prefix: &[u8], id: &[u8]) -> Vec<u8> {
        [prefix, id].concat()
    }

    // ========================================================================
    // IDENTITY PERSISTENCE
    // ========================================================================

    /// Save the node keypair
    pub fn save_keypair(&self, keypair: &Keypair) -> Result<(), StoreError> {
        self.db.insert(keys::IDENTITY_KEYPAIR, keypair.to_bytes())?;
        Ok(())
    }

    /// Load the node keypair
    pub fn load_keypair(&self) -> Result<Option<Keypair>, StoreError> {
        match self.db.get(keys::IDENTITY_KEYPAIR)? {
            Some(bytes) => {
                let keypair = Keypair::from_bytes(&bytes)
                    .map_err(|e| StoreError::DeserializationFailed(e.to_string()))?;
                Ok(Some(keypair))
            }
            None => Ok(None),
        }
    }

    /// Get the node keypair, creating one if it doesn't exist
    pub fn get_or_create_keypair(&self) -> Result<Keypair, StoreError> {
        if let Some(keypair) = self.load_keypair()? {
            return Ok(keypair);
        }

        let keypair = Keypair::generate();
        self.save_keypair(&keypair)?;
        Ok(keypair)
    }
}

impl MessageStore for SledStore {
    fn put_blob(&self, bytes: &[u8]) -> Result<ContentHash, StoreError> {
        let hash = ContentHash::of(bytes);
        self.db.insert(Self::key(keys::BLOB_PREFIX, hash.as_bytes()), bytes)?;
        Ok(hash)
    }

    fn blob(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .db
            .get(Self::key(keys::BLOB_PREFIX, hash.as_bytes()))?
            .map(|v| v.to_vec()))
    }

    fn has_blob(&self, hash: &ContentHash) -> Result<bool, StoreError> {
        Ok(self.db.contains_key(Self::key(keys::BLOB_PREFIX, hash.as_bytes()))?)
    }

    fn root(
        &self,
        direction: Direction,
        friend: &PublicKey,
    ) -> Result<Option<Pointer>, StoreError> {
        match self.db.get(Self::key(direction.prefix(), friend.as_bytes()))? {
            Some(bytes) => {
                let pointer = postcard::from_bytes(&bytes)
                    .map_err(|e| StoreError::DeserializationFailed(e.to_string()))?;
                Ok(Some(pointer))
            }
            None => Ok(None),
        }
    }

    fn set_root(
        &self,
        direction: Direction,
        friend: &PublicKey,
        pointer: &Pointer,
    ) -> Result<(), StoreError> {
        let bytes = postcard::to_allocvec(pointer)
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        self.db.insert(Self::key(direction.prefix(), friend.as_bytes()), bytes)?;
        Ok(())
    }

    fn clear_roots(&self, friend: &PublicKey) -> Result<(), StoreError> {
        self.db.remove(Self::key(keys::ROOT_OUT_PREFIX, friend.as_bytes()))?;
        self.db.remove(Self::key(keys::ROOT_IN_PREFIX, friend.as_bytes()))?;
        Ok(())
    }

    fn add_friend(&self, friend: &PublicKey) -> Result<(), StoreError> {
        self.db.insert(Self::key(keys::FRIEND_PREFIX, friend.as_bytes()), &[] as &[u8])?;
        Ok(())
    }

    fn remove_friend(&self, friend: &PublicKey) -> Result<(), StoreError> {
        self.db.remove(Self::key(keys::FRIEND_PREFIX, friend.as_bytes()))?;
        Ok(())
    }

    fn friends(&self) -> Result<Vec<PublicKey>, StoreError> {
        let mut friends = Vec::new();
        for result in self.db.scan_prefix(keys::FRIEND_PREFIX) {
            let (key, _) = result?;
            let friend = PublicKey::from_bytes(&key[keys::FRIEND_PREFIX.len()..])
                .map_err(|e| StoreError::DeserializationFailed(e.to_string()))?;
            friends.push(friend);
        }
        Ok(friends)
    }
}
