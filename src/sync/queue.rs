// Request Backpressure Queue - Local FIFO of pending DHT work
//
// Couples three things:
// - dedup of equal requests while they wait
// - occupancy-gated draining into the transport
// - admission control for caller-facing publishes

use crate::dht::{DhtTransport, FetchCallback, PutSpec, RequestSpec};
use crate::identity::PublicKey;
use std::collections::VecDeque;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Outbound queue full: {queued} queued, cap {cap}")]
    Full { queued: usize, cap: usize },
}

/// Why a fetch was issued; decides where its result goes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FetchPurpose {
    /// Head batch of a friend's own gossip channel
    GossipHead { friend: PublicKey },
    /// Older batch reached through back-links from a friend's channel
    GossipChain { friend: PublicKey, depth: usize },
    /// Message envelope expected to be authored by `sender`
    Message { sender: PublicKey },
    /// Auxiliary content referenced by a message
    Content,
}

impl FetchPurpose {
    /// The friend this fetch is on behalf of, if any
    pub fn friend(&self) -> Option<&PublicKey> {
        match self {
            Self::GossipHead { friend } | Self::GossipChain { friend, .. } => Some(friend),
            Self::Message { sender } => Some(sender),
            Self::Content => None,
        }
    }
}

/// A get plus the reason for it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchRequest {
    pub spec: RequestSpec,
    pub purpose: FetchPurpose,
}

/// One unit of DHT work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundRequest {
    Fetch(FetchRequest),
    Put(PutSpec),
}

impl OutboundRequest {
    pub fn fetch(spec: RequestSpec, purpose: FetchPurpose) -> Self {
        Self::Fetch(FetchRequest { spec, purpose })
    }

    pub fn put(put: PutSpec) -> Self {
        Self::Put(put)
    }

    pub fn is_put(&self) -> bool {
        matches!(self, Self::Put(_))
    }
}

/// FIFO of outbound DHT work
#[derive(Debug)]
pub struct RequestBackpressureQueue {
    items: VecDeque<OutboundRequest>,
    publish_cap: usize,
    hard_limit: usize,
}

impl RequestBackpressureQueue {
    pub fn new(publish_cap: usize, hard_limit: usize) -> Self {
        Self {
            items: VecDeque::new(),
            publish_cap,
            hard_limit,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutboundRequest> {
        self.items.iter()
    }

    pub fn contains(&self, req: &OutboundRequest) -> bool {
        self.items.contains(req)
    }

    /// Append unless an equal request is already queued or the hard limit
    /// is reached. Returns true if appended.
    pub fn offer(&mut self, req: OutboundRequest) -> bool {
        if self.items.contains(&req) {
            return false;
        }
        if self.items.len() >= self.hard_limit {
            debug!(queued = self.items.len(), "Outbound queue at hard limit, dropping request");
            return false;
        }
        self.items.push_back(req);
        true
    }

    /// Append work belonging to a publish that already passed
    /// `admit_publish`. Only dedup applies.
    pub fn offer_admitted(&mut self, req: OutboundRequest) -> bool {
        if self.items.contains(&req) {
            return false;
        }
        self.items.push_back(req);
        true
    }

    /// Admission check for a caller-facing publish
    pub fn admit_publish(&self) -> Result<(), QueueError> {
        if self.items.len() >= self.publish_cap {
            return Err(QueueError::Full {
                queued: self.items.len(),
                cap: self.publish_cap,
            });
        }
        Ok(())
    }

    /// Drop queued fetches made on behalf of `friend`
    pub fn forget(&mut self, friend: &PublicKey) {
        self.items.retain(|item| match item {
            OutboundRequest::Fetch(fetch) => fetch.purpose.friend() != Some(friend),
            OutboundRequest::Put(_) => true,
        });
    }

    /// Forward items FIFO while transport occupancy stays under `threshold`
    /// (a fraction of capacity). `on_fetch` builds the completion callback of
    /// each forwarded get. Returns the number forwarded.
    pub fn flush_if_room<F>(
        &mut self,
        transport: &dyn DhtTransport,
        threshold: f64,
        mut on_fetch: F,
    ) -> usize
    where
        F: FnMut(&FetchRequest) -> FetchCallback,
    {
        let mut sent = 0;

        while !self.items.is_empty() && transport.load_ratio() < threshold {
            let Some(item) = self.items.pop_front() else {
                break;
            };
            match item {
                OutboundRequest::Fetch(fetch) => {
                    let callback = on_fetch(&fetch);
                    transport.request(fetch.spec, callback);
                }
                OutboundRequest::Put(put) => transport.distribute(put),
            }
            sent += 1;
        }

        if !self.items.is_empty() {
            debug!(sent, deferred = self.items.len(), "Transport busy, deferring queued requests");
        }

        sent
    }
}
