// Message Assembler - Resolves the per-conversation message DAG
//
// Fetched envelopes and content are staged, then promoted on drain:
// persisted, delivered once, and their predecessor scheduled for fetching.
// Each drain walks every discovered chain one hop further back.

use crate::dht::RequestSpec;
use crate::identity::PublicKey;
use crate::storage::{Direction, MessageStore, StoreError};
use crate::sync::peer::{FriendBook, Pointer};
use crate::sync::protocol::{ContentHash, MessageEnvelope, ProtocolError};
use crate::sync::queue::{FetchPurpose, OutboundRequest};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Receives what the engine assembles
pub trait MessageListener: Send + Sync {
    /// A message not seen before. No ordering across friends.
    fn on_new_message(&self, sender: &PublicKey, message: &MessageEnvelope);

    /// Non-fatal diagnostic
    fn on_msg_error(&self, reason: &str);
}

#[derive(Error, Debug)]
pub enum AssemblerError {
    #[error("Malformed envelope: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Envelope authored by {author} but attributed to {attributed}")]
    WrongAuthor {
        author: PublicKey,
        attributed: PublicKey,
    },

    #[error("Envelope from {0} is addressed to another node")]
    WrongRecipient(PublicKey),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

/// Statistics about the assembler
#[derive(Clone, Debug, Default)]
pub struct AssemblerStats {
    pub messages_delivered: u64,
    pub contents_persisted: u64,
    pub predecessor_fetches: u64,
    pub envelopes_rejected: u64,
}

/// Result of one drain. Work produced by a drain that failed partway is
/// carried into the next successful one.
#[derive(Debug, Default)]
pub struct DrainOutcome {
    /// Predecessor fetches to queue
    pub fetches: Vec<OutboundRequest>,
    /// Hashes that became durable during this drain
    pub persisted: Vec<ContentHash>,
    /// Messages handed to the listener
    pub delivered: usize,
}

struct PendingMessage {
    envelope: MessageEnvelope,
    bytes: Vec<u8>,
    sender: PublicKey,
    /// Not yet handed to the listener. Decided when staged, so a drain
    /// that persisted the blob but failed later still delivers on retry.
    fresh: bool,
}

pub struct MessageAssembler {
    me: PublicKey,
    messages: HashMap<ContentHash, PendingMessage>,
    contents: HashMap<ContentHash, Vec<u8>>,
    /// Hashes with a fetch queued or outstanding, with the friend a message
    /// fetch is attributed to
    in_flight: HashMap<ContentHash, Option<PublicKey>>,
    ready: DrainOutcome,
    stats: AssemblerStats,
}

impl MessageAssembler {
    pub fn new(me: PublicKey) -> Self {
        Self {
            me,
            messages: HashMap::new(),
            contents: HashMap::new(),
            in_flight: HashMap::new(),
            ready: DrainOutcome::default(),
            stats: AssemblerStats::default(),
        }
    }

    pub fn stats(&self) -> &AssemblerStats {
        &self.stats
    }

    pub fn staged_messages(&self) -> usize {
        self.messages.len()
    }

    pub fn staged_contents(&self) -> usize {
        self.contents.len()
    }

    pub fn is_in_flight(&self, hash: &ContentHash) -> bool {
        self.in_flight.contains_key(hash)
    }

    fn is_known(&self, hash: &ContentHash, store: &dyn MessageStore) -> Result<bool, StoreError> {
        if self.in_flight.contains_key(hash)
            || self.messages.contains_key(hash)
            || self.contents.contains_key(hash)
        {
            return Ok(true);
        }
        store.has_blob(hash)
    }

    /// A fetch for message `hash` attributed to `sender`, unless it is
    /// already durable, staged, or being fetched
    pub fn request_message(
        &mut self,
        hash: ContentHash,
        sender: PublicKey,
        store: &dyn MessageStore,
    ) -> Result<Option<OutboundRequest>, StoreError> {
        if self.is_known(&hash, store)? {
            return Ok(None);
        }
        self.in_flight.insert(hash, Some(sender.clone()));
        Ok(Some(OutboundRequest::fetch(
            RequestSpec::Hash(hash),
            FetchPurpose::Message { sender },
        )))
    }

    fn request_content(
        &mut self,
        hash: ContentHash,
        store: &dyn MessageStore,
    ) -> Result<Option<OutboundRequest>, StoreError> {
        if self.is_known(&hash, store)? {
            return Ok(None);
        }
        self.in_flight.insert(hash, None);
        Ok(Some(OutboundRequest::fetch(RequestSpec::Hash(hash), FetchPurpose::Content)))
    }

    /// Stage a fetched envelope. Returns a content fetch if the envelope
    /// references content we do not have.
    pub fn on_message_fetched(
        &mut self,
        bytes: Vec<u8>,
        sender: PublicKey,
        store: &dyn MessageStore,
    ) -> Result<Option<OutboundRequest>, AssemblerError> {
        let hash = ContentHash::of(&bytes);
        self.in_flight.remove(&hash);

        let envelope = match Self::verify(&self.me, &bytes, &sender) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.stats.envelopes_rejected += 1;
                return Err(e);
            }
        };

        let content = envelope.content().copied();
        if !self.messages.contains_key(&hash) {
            let fresh = !store.has_blob(&hash)?;
            self.messages.insert(
                hash,
                PendingMessage {
                    envelope,
                    bytes,
                    sender,
                    fresh,
                },
            );
        }

        match content {
            Some(content) => Ok(self.request_content(content, store)?),
            None => Ok(None),
        }
    }

    fn verify(
        me: &PublicKey,
        bytes: &[u8],
        sender: &PublicKey,
    ) -> Result<MessageEnvelope, AssemblerError> {
        let envelope = MessageEnvelope::from_bytes(bytes)?;
        if envelope.author() != sender {
            return Err(AssemblerError::WrongAuthor {
                author: envelope.author().clone(),
                attributed: sender.clone(),
            });
        }
        if envelope.recipient() != me {
            return Err(AssemblerError::WrongRecipient(sender.clone()));
        }
        envelope.verify_signature()?;
        Ok(envelope)
    }

    /// Stage fetched auxiliary content under its own hash
    pub fn on_content_fetched(&mut self, bytes: Vec<u8>) -> ContentHash {
        let hash = ContentHash::of(&bytes);
        self.in_flight.remove(&hash);
        self.contents.insert(hash, bytes);
        hash
    }

    /// A fetch came back empty or was never queued; allow it to be
    /// requested again later
    pub fn on_fetch_failed(&mut self, hash: &ContentHash) {
        self.in_flight.remove(hash);
    }

    /// Drop staged messages, fetch markers and pending predecessor fetches
    /// attributed to `friend`
    pub fn forget(&mut self, friend: &PublicKey) {
        self.messages.retain(|_, pending| &pending.sender != friend);
        self.in_flight.retain(|_, sender| sender.as_ref() != Some(friend));
        self.ready.fetches.retain(|fetch| match fetch {
            OutboundRequest::Fetch(fetch) => fetch.purpose.friend() != Some(friend),
            OutboundRequest::Put(_) => true,
        });
    }

    /// Persist staged content, then persist and deliver staged messages in
    /// timestamp order, advancing trusted pointers and scheduling one fetch
    /// per missing predecessor.
    ///
    /// On a storage error, whatever was not yet persisted or delivered stays
    /// staged, and fetches already produced are returned by the next drain.
    pub fn drain(
        &mut self,
        store: &dyn MessageStore,
        book: &mut FriendBook,
        listener: &dyn MessageListener,
    ) -> Result<DrainOutcome, StoreError> {
        let staged: Vec<ContentHash> = self.contents.keys().copied().collect();
        for hash in staged {
            if let Some(bytes) = self.contents.get(&hash) {
                store.put_blob(bytes)?;
            }
            self.contents.remove(&hash);
            self.ready.persisted.push(hash);
            self.stats.contents_persisted += 1;
        }

        let mut order: Vec<(u64, ContentHash)> = self
            .messages
            .iter()
            .map(|(hash, pending)| (pending.envelope.timestamp(), *hash))
            .collect();
        order.sort();

        for (_, hash) in order {
            let Some(pending) = self.messages.get_mut(&hash) else {
                continue;
            };

            let Some(record) = book.get_mut(&pending.sender) else {
                debug!(sender = %pending.sender, "Dropping message from removed friend");
                self.messages.remove(&hash);
                continue;
            };

            if pending.fresh {
                store.put_blob(&pending.bytes)?;

                let pointer = Pointer::new(pending.envelope.timestamp(), hash);
                if record.incoming().trusted().is_none()
                    || pointer.timestamp() > record.incoming().trusted_ts()
                {
                    store.set_root(Direction::Incoming, &pending.sender, &pointer)?;
                    record.incoming_mut().promote(pointer);
                }

                listener.on_new_message(&pending.sender, &pending.envelope);
                pending.fresh = false;
                self.ready.persisted.push(hash);
                self.ready.delivered += 1;
                self.stats.messages_delivered += 1;
            }

            let previous = pending.envelope.previous().copied();
            let sender = pending.sender.clone();

            if let Some(previous) = previous {
                let wanted = !self.in_flight.contains_key(&previous)
                    && !self.messages.contains_key(&previous)
                    && !store.has_blob(&previous)?;
                if wanted {
                    self.in_flight.insert(previous, Some(sender.clone()));
                    self.stats.predecessor_fetches += 1;
                    self.ready.fetches.push(OutboundRequest::fetch(
                        RequestSpec::Hash(previous),
                        FetchPurpose::Message { sender },
                    ));
                }
            }

            self.messages.remove(&hash);
        }

        Ok(std::mem::take(&mut self.ready))
    }
}
