// Protocol - Wire types for DHT-carried sync data
//
// Everything here is postcard-encoded and content-addressed by SHA-256:
// - GossipAssertion: a claim about the newest pointer (or a demand) between two identities
// - GossipBatch: a bounded, back-linked list of assertions
// - MessageEnvelope: one signed message in a per-conversation hash chain

use crate::identity::{Keypair, PublicKey, Signature, SigningDomain};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Bad envelope signature")]
    BadSignature,
}

/// SHA-256 of a blob's bytes; the blob's DHT address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash arbitrary bytes
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self)
    }
}

// ============================================================================
// GOSSIP ASSERTION
// ============================================================================

/// What a gossip assertion claims
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssertionKind {
    /// `hash` is the newest message from asserter to subject
    Message,
    /// asserter wants the blob `hash` from subject
    Demand,
}

/// A claim made by `asserter` about its conversation with `subject`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipAssertion {
    asserter: PublicKey,
    subject: PublicKey,
    timestamp: u64,
    kind: AssertionKind,
    hash: ContentHash,
}

impl GossipAssertion {
    pub fn new(
        asserter: PublicKey,
        subject: PublicKey,
        timestamp: u64,
        kind: AssertionKind,
        hash: ContentHash,
    ) -> Self {
        Self {
            asserter,
            subject,
            timestamp,
            kind,
            hash,
        }
    }

    /// Shorthand for a message-pointer assertion
    pub fn message(
        asserter: PublicKey,
        subject: PublicKey,
        timestamp: u64,
        hash: ContentHash,
    ) -> Self {
        Self::new(asserter, subject, timestamp, AssertionKind::Message, hash)
    }

    /// Shorthand for a demand assertion
    pub fn demand(
        asserter: PublicKey,
        subject: PublicKey,
        timestamp: u64,
        hash: ContentHash,
    ) -> Self {
        Self::new(asserter, subject, timestamp, AssertionKind::Demand, hash)
    }

    pub fn asserter(&self) -> &PublicKey {
        &self.asserter
    }

    pub fn subject(&self) -> &PublicKey {
        &self.subject
    }

    /// Milliseconds since the unix epoch
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn kind(&self) -> AssertionKind {
        self.kind
    }

    pub fn hash(&self) -> &ContentHash {
        &self.hash
    }

    /// Age relative to `now_ms`; zero for assertions from the future
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.timestamp)
    }
}

// ============================================================================
// GOSSIP BATCH
// ============================================================================

/// One published unit of gossip. Batches chain backward through `back_link`
/// when a node has more assertions than fit in one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipBatch {
    back_link: Option<ContentHash>,
    assertions: Vec<GossipAssertion>,
}

impl GossipBatch {
    pub fn new(back_link: Option<ContentHash>, assertions: Vec<GossipAssertion>) -> Self {
        Self {
            back_link,
            assertions,
        }
    }

    pub fn back_link(&self) -> Option<&ContentHash> {
        self.back_link.as_ref()
    }

    pub fn assertions(&self) -> &[GossipAssertion] {
        &self.assertions
    }

    pub fn into_assertions(self) -> Vec<GossipAssertion> {
        self.assertions
    }

    pub fn len(&self) -> usize {
        self.assertions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assertions.is_empty()
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        postcard::to_allocvec(self).unwrap_or_default()
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        postcard::from_bytes(bytes).map_err(|e| ProtocolError::DeserializationFailed(e.to_string()))
    }

    /// Content address of the encoded batch
    pub fn hash(&self) -> ContentHash {
        ContentHash::of(&self.to_bytes())
    }
}

// ============================================================================
// MESSAGE ENVELOPE
// ============================================================================

/// Fields covered by the author's signature
#[derive(Serialize)]
struct SignedFields<'a> {
    author: &'a PublicKey,
    recipient: &'a PublicKey,
    previous: &'a Option<ContentHash>,
    timestamp: u64,
    payload: &'a [u8],
    content: &'a Option<ContentHash>,
}

/// A signed message from `author` to `recipient`.
///
/// `previous` is the hash of the author's prior message in the same
/// conversation, so each conversation direction forms a backward-linked
/// chain whose head is the author's root pointer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    author: PublicKey,
    recipient: PublicKey,
    previous: Option<ContentHash>,
    timestamp: u64,
    payload: Vec<u8>,
    content: Option<ContentHash>,
    signature: Signature,
}

impl MessageEnvelope {
    /// Build and sign a new envelope
    pub fn sign(
        keypair: &Keypair,
        recipient: PublicKey,
        previous: Option<ContentHash>,
        timestamp: u64,
        payload: Vec<u8>,
        content: Option<ContentHash>,
    ) -> Self {
        let author = keypair.public_key();
        let signed =
            Self::signed_bytes(&author, &recipient, &previous, timestamp, &payload, &content);
        let signature = keypair.sign(SigningDomain::Message, &signed);

        Self {
            author,
            recipient,
            previous,
            timestamp,
            payload,
            content,
            signature,
        }
    }

    fn signed_bytes(
        author: &PublicKey,
        recipient: &PublicKey,
        previous: &Option<ContentHash>,
        timestamp: u64,
        payload: &[u8],
        content: &Option<ContentHash>,
    ) -> Vec<u8> {
        let fields = SignedFields {
            author,
            recipient,
            previous,
            timestamp,
            payload,
            content,
        };
        postcard::to_allocvec(&fields).unwrap_or_default()
    }

    /// Check the author's signature over all other fields
    pub fn verify_signature(&self) -> Result<(), ProtocolError> {
        let signed = Self::signed_bytes(
            &self.author,
            &self.recipient,
            &self.previous,
            self.timestamp,
            &self.payload,
            &self.content,
        );
        if self.author.verify(SigningDomain::Message, &signed, &self.signature) {
            Ok(())
        } else {
            Err(ProtocolError::BadSignature)
        }
    }

    pub fn author(&self) -> &PublicKey {
        &self.author
    }

    pub fn recipient(&self) -> &PublicKey {
        &self.recipient
    }

    pub fn previous(&self) -> Option<&ContentHash> {
        self.previous.as_ref()
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Reference to auxiliary content stored as a separate blob
    pub fn content(&self) -> Option<&ContentHash> {
        self.content.as_ref()
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        postcard::to_allocvec(self).unwrap_or_default()
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        postcard::from_bytes(bytes).map_err(|e| ProtocolError::DeserializationFailed(e.to_string()))
    }

    /// Content address of the encoded envelope
    pub fn hash(&self) -> ContentHash {
        ContentHash::of(&self.to_bytes())
    }
}
