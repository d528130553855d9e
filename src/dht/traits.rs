// DHT Traits and Core Types
// Defines the abstract DHT transport the sync engine drives, plus the request/put shapes

use crate::identity::{Keypair, PublicKey, Signature, SigningDomain};
use crate::sync::ContentHash;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// REQUESTS
// ============================================================================

/// What to look up in the DHT
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestSpec {
    /// Immutable blob addressed by the hash of its bytes
    Hash(ContentHash),
    /// Mutable slot owned by `identity`, distinguished by `salt`
    Channel { identity: PublicKey, salt: Vec<u8> },
}

impl fmt::Display for RequestSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hash(hash) => write!(f, "hash:{}", hash),
            Self::Channel { identity, .. } => write!(f, "channel:{}", identity),
        }
    }
}

/// Completion callback of a DHT get. Called exactly once, with `None` on
/// timeout or failure.
pub type FetchCallback = Box<dyn FnOnce(Option<Vec<u8>>) + Send + 'static>;

// ============================================================================
// PUTS
// ============================================================================

#[derive(Serialize)]
struct ChannelSignedFields<'a> {
    salt: &'a [u8],
    sequence: u64,
    value: &'a [u8],
}

/// Signed content of a mutable channel slot. A DHT keeps the record with
/// the highest sequence number and rejects records whose signature does
/// not verify against `identity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    identity: PublicKey,
    salt: Vec<u8>,
    sequence: u64,
    value: Vec<u8>,
    signature: Signature,
}

impl ChannelRecord {
    /// Build and sign a record for the keypair's own channel
    pub fn signed(keypair: &Keypair, salt: &[u8], sequence: u64, value: Vec<u8>) -> Self {
        let signature =
            keypair.sign(SigningDomain::Channel, &Self::signed_bytes(salt, sequence, &value));
        Self {
            identity: keypair.public_key(),
            salt: salt.to_vec(),
            sequence,
            value,
            signature,
        }
    }

    fn signed_bytes(salt: &[u8], sequence: u64, value: &[u8]) -> Vec<u8> {
        postcard::to_allocvec(&ChannelSignedFields { salt, sequence, value }).unwrap_or_default()
    }

    pub fn verify(&self) -> bool {
        self.identity.verify(
            SigningDomain::Channel,
            &Self::signed_bytes(&self.salt, self.sequence, &self.value),
            &self.signature,
        )
    }

    pub fn identity(&self) -> &PublicKey {
        &self.identity
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

/// What to store in the DHT
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutSpec {
    /// Immutable, content-addressed blob
    Blob(Vec<u8>),
    /// Replacement for a mutable channel slot
    Channel(ChannelRecord),
}

impl PutSpec {
    /// Where the put lands
    pub fn target(&self) -> RequestSpec {
        match self {
            Self::Blob(bytes) => RequestSpec::Hash(ContentHash::of(bytes)),
            Self::Channel(record) => RequestSpec::Channel {
                identity: record.identity.clone(),
                salt: record.salt.clone(),
            },
        }
    }
}

// ============================================================================
// TRANSPORT TRAIT
// ============================================================================

/// Abstract DHT transport. Every call is fire-and-forget; results of gets
/// come back through the callback on a transport-owned thread or task.
pub trait DhtTransport: Send + Sync {
    /// Start an asynchronous get
    fn request(&self, spec: RequestSpec, on_done: FetchCallback);

    /// Start an asynchronous put
    fn distribute(&self, put: PutSpec);

    /// Operations currently in flight inside the transport (approximate)
    fn queue_occupation(&self) -> usize;

    /// Occupancy at which the transport is considered full
    fn capacity(&self) -> usize;

    /// Occupancy as a fraction of capacity
    fn load_ratio(&self) -> f64 {
        let capacity = self.capacity().max(1);
        self.queue_occupation() as f64 / capacity as f64
    }
}
