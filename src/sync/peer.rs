// Friend Management - Track friends, their conversation pointers, and who to poll
//
// Each friend has two conversation directions. Our own direction is trusted
// by construction. The friend's direction is two-tier: a trusted pointer
// only moved by a verified fetch, and an observed-timestamp watermark moved
// by gossip.

use crate::identity::PublicKey;
use crate::sync::ContentHash;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

/// Friend-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("Cannot add self as a friend")]
    CannotAddSelf,

    #[error("Unknown friend: {0}")]
    UnknownFriend(PublicKey),
}

/// Head of a conversation chain
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pointer {
    timestamp: u64,
    root: ContentHash,
}

impl Pointer {
    pub fn new(timestamp: u64, root: ContentHash) -> Self {
        Self { timestamp, root }
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn root(&self) -> &ContentHash {
        &self.root
    }
}

/// The friend→me pointer, split into what we verified and what we heard
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IncomingPointer {
    trusted: Option<Pointer>,
    observed_ts: u64,
}

impl IncomingPointer {
    /// Restore from a persisted trusted pointer
    pub fn from_trusted(trusted: Option<Pointer>) -> Self {
        Self {
            observed_ts: trusted.map(|p| p.timestamp).unwrap_or(0),
            trusted,
        }
    }

    pub fn trusted(&self) -> Option<&Pointer> {
        self.trusted.as_ref()
    }

    pub fn trusted_ts(&self) -> u64 {
        self.trusted.map(|p| p.timestamp).unwrap_or(0)
    }

    pub fn observed_ts(&self) -> u64 {
        self.observed_ts
    }

    /// Raise the watermark. Returns true if `timestamp` was newer.
    pub fn observe(&mut self, timestamp: u64) -> bool {
        if timestamp > self.observed_ts {
            self.observed_ts = timestamp;
            true
        } else {
            false
        }
    }

    /// Replace the trusted pointer if `pointer` is newer. Returns true on change.
    pub fn promote(&mut self, pointer: Pointer) -> bool {
        if pointer.timestamp <= self.trusted_ts() && self.trusted.is_some() {
            return false;
        }
        self.trusted = Some(pointer);
        self.observe(pointer.timestamp);
        true
    }
}

/// Everything the engine knows about one friend
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FriendRecord {
    key: PublicKey,
    outgoing: Option<Pointer>,
    incoming: IncomingPointer,
    demand: Option<ContentHash>,
}

impl FriendRecord {
    pub fn new(key: PublicKey) -> Self {
        Self {
            key,
            outgoing: None,
            incoming: IncomingPointer::default(),
            demand: None,
        }
    }

    /// Rebuild from persisted pointers
    pub fn restored(key: PublicKey, outgoing: Option<Pointer>, incoming: Option<Pointer>) -> Self {
        Self {
            key,
            outgoing,
            incoming: IncomingPointer::from_trusted(incoming),
            demand: None,
        }
    }

    pub fn key(&self) -> &PublicKey {
        &self.key
    }

    /// Head of our chain of messages to this friend
    pub fn outgoing(&self) -> Option<&Pointer> {
        self.outgoing.as_ref()
    }

    pub fn set_outgoing(&mut self, pointer: Pointer) {
        self.outgoing = Some(pointer);
    }

    pub fn incoming(&self) -> &IncomingPointer {
        &self.incoming
    }

    pub fn incoming_mut(&mut self) -> &mut IncomingPointer {
        &mut self.incoming
    }

    /// A hash this friend asked us to republish
    pub fn demand(&self) -> Option<&ContentHash> {
        self.demand.as_ref()
    }

    pub fn set_demand(&mut self, hash: ContentHash) {
        self.demand = Some(hash);
    }

    pub fn take_demand(&mut self) -> Option<ContentHash> {
        self.demand.take()
    }
}

/// All friends of the local node
#[derive(Clone, Debug)]
pub struct FriendBook {
    me: PublicKey,
    friends: HashMap<PublicKey, FriendRecord>,
}

impl FriendBook {
    pub fn new(me: PublicKey) -> Self {
        Self {
            me,
            friends: HashMap::new(),
        }
    }

    pub fn me(&self) -> &PublicKey {
        &self.me
    }

    pub fn len(&self) -> usize {
        self.friends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.friends.is_empty()
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.friends.contains_key(key)
    }

    /// Add a friend. Returns false if already present.
    pub fn add(&mut self, key: PublicKey) -> Result<bool, PeerError> {
        self.insert(FriendRecord::new(key))
    }

    /// Add a fully built record (used when loading from storage)
    pub fn insert(&mut self, record: FriendRecord) -> Result<bool, PeerError> {
        if record.key == self.me {
            return Err(PeerError::CannotAddSelf);
        }
        if self.friends.contains_key(&record.key) {
            return Ok(false);
        }
        self.friends.insert(record.key.clone(), record);
        Ok(true)
    }

    pub fn remove(&mut self, key: &PublicKey) -> Option<FriendRecord> {
        self.friends.remove(key)
    }

    pub fn get(&self, key: &PublicKey) -> Option<&FriendRecord> {
        self.friends.get(key)
    }

    pub fn get_mut(&mut self, key: &PublicKey) -> Option<&mut FriendRecord> {
        self.friends.get_mut(key)
    }

    /// Friend keys in a stable order
    pub fn keys(&self) -> Vec<PublicKey> {
        let mut keys: Vec<PublicKey> = self.friends.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Records in a stable order
    pub fn records(&self) -> Vec<&FriendRecord> {
        let mut records: Vec<&FriendRecord> = self.friends.values().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }
}

/// Friends believed to have unseen data, oldest suspicion first
#[derive(Clone, Debug, Default)]
pub struct ActiveFriendSet {
    order: VecDeque<PublicKey>,
}

impl ActiveFriendSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if already active
    pub fn insert(&mut self, key: PublicKey) -> bool {
        if self.order.contains(&key) {
            return false;
        }
        self.order.push_back(key);
        true
    }

    pub fn take_next(&mut self) -> Option<PublicKey> {
        self.order.pop_front()
    }

    pub fn remove(&mut self, key: &PublicKey) -> bool {
        let before = self.order.len();
        self.order.retain(|k| k != key);
        before != self.order.len()
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.order.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Picks the one friend whose gossip channel is polled each tick
#[derive(Clone, Debug, Default)]
pub struct PeerSelector {
    active: ActiveFriendSet,
}

impl PeerSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> &ActiveFriendSet {
        &self.active
    }

    pub fn mark_active(&mut self, key: PublicKey) -> bool {
        self.active.insert(key)
    }

    pub fn forget(&mut self, key: &PublicKey) {
        self.active.remove(key);
    }

    /// Prefer an active friend (consumed); otherwise a uniformly random one
    pub fn select<R: Rng + ?Sized>(&mut self, book: &FriendBook, rng: &mut R) -> Option<PublicKey> {
        while let Some(key) = self.active.take_next() {
            if book.contains(&key) {
                return Some(key);
            }
        }

        book.keys().choose(rng).cloned()
    }
}
