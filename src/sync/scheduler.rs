// Sync Scheduler - The single loop that owns all engine state
//
// Each tick runs, in order:
//   drain -> absorb -> prune -> select & poll -> flush -> regulate
// then sleeps an interval that doubles under transport congestion and halves
// (down to the floor) otherwise. Everything external reaches the scheduler
// as a Command on its inbox, so no engine state is shared across tasks.

use crate::config::EngineConfig;
use crate::dht::{DhtTransport, FetchCallback, PutSpec, RequestSpec};
use crate::identity::{Keypair, PublicKey};
use crate::storage::{Direction, MessageStore, StoreError};
use crate::sync::assembler::{MessageAssembler, MessageListener};
use crate::sync::gossip::GossipProtocol;
use crate::sync::peer::{FriendBook, FriendRecord, PeerError, PeerSelector, Pointer};
use crate::sync::protocol::{ContentHash, GossipBatch, MessageEnvelope};
use crate::sync::queue::{
    FetchPurpose, FetchRequest, OutboundRequest, QueueError, RequestBackpressureQueue,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Errors that abort a tick or a friend-set change
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Friend error: {0}")]
    Peer(#[from] PeerError),

    #[error("Engine is not running")]
    NotRunning,
}

/// Why a publish was refused
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Unknown friend: {0}")]
    UnknownFriend(PublicKey),

    #[error("Publish rejected: {0}")]
    QueueFull(#[from] QueueError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Engine is not running")]
    NotRunning,
}

/// Everything that may mutate engine state from outside the scheduler task
pub enum Command {
    Publish {
        friend: PublicKey,
        payload: Vec<u8>,
        content: Option<Vec<u8>>,
        reply: oneshot::Sender<Result<ContentHash, PublishError>>,
    },
    AddFriend {
        friend: PublicKey,
        reply: oneshot::Sender<Result<bool, SyncError>>,
    },
    RemoveFriend {
        friend: PublicKey,
        reply: oneshot::Sender<Result<bool, SyncError>>,
    },
    /// Completion of a DHT get issued by this scheduler
    Fetched {
        request: FetchRequest,
        result: Option<Vec<u8>>,
    },
}

/// Current wall-clock time in milliseconds since the unix epoch
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// REGULATOR
// ============================================================================

/// Adaptive tick interval
#[derive(Clone, Debug)]
pub struct Regulator {
    interval: Duration,
    floor: Duration,
    threshold: f64,
}

impl Regulator {
    pub fn new(floor: Duration, threshold: f64) -> Self {
        Self {
            interval: floor,
            floor,
            threshold,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn floor(&self) -> Duration {
        self.floor
    }

    /// Double when the transport is over the threshold, otherwise halve
    /// down to the floor. Returns the new interval.
    pub fn adjust(&mut self, load_ratio: f64) -> Duration {
        self.interval = if load_ratio > self.threshold {
            self.interval.saturating_mul(2)
        } else {
            (self.interval / 2).max(self.floor)
        };
        self.interval
    }

    pub fn reset(&mut self) {
        self.interval = self.floor;
    }
}

/// What one tick did
#[derive(Clone, Debug, Default)]
pub struct TickReport {
    pub delivered: usize,
    pub polled: Option<PublicKey>,
    pub flushed: usize,
    pub pruned: usize,
    pub interval: Duration,
}

// ============================================================================
// SCHEDULER
// ============================================================================

pub struct SyncScheduler {
    keypair: Keypair,
    config: EngineConfig,
    store: Arc<dyn MessageStore>,
    transport: Arc<dyn DhtTransport>,
    listener: Arc<dyn MessageListener>,
    inbox: mpsc::UnboundedSender<Command>,
    book: FriendBook,
    gossip: GossipProtocol,
    assembler: MessageAssembler,
    selector: PeerSelector,
    queue: RequestBackpressureQueue,
    regulator: Regulator,
    rng: StdRng,
}

impl SyncScheduler {
    /// Create a scheduler and the receiving end of its inbox
    pub fn new(
        keypair: Keypair,
        config: EngineConfig,
        store: Arc<dyn MessageStore>,
        transport: Arc<dyn DhtTransport>,
        listener: Arc<dyn MessageListener>,
    ) -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let me = keypair.public_key();

        let scheduler = Self {
            book: FriendBook::new(me.clone()),
            gossip: GossipProtocol::new(me.clone(), &config),
            assembler: MessageAssembler::new(me),
            selector: PeerSelector::new(),
            queue: RequestBackpressureQueue::new(config.publish_queue_cap, config.queue_hard_limit),
            regulator: Regulator::new(config.tick_floor(), config.congestion_threshold),
            rng: StdRng::from_entropy(),
            keypair,
            config,
            store,
            transport,
            listener,
            inbox,
        };

        (scheduler, inbox_rx)
    }

    /// Use a deterministic peer-selection RNG
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Another handle to the inbox
    pub fn sender(&self) -> mpsc::UnboundedSender<Command> {
        self.inbox.clone()
    }

    pub fn me(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn book(&self) -> &FriendBook {
        &self.book
    }

    pub fn gossip(&self) -> &GossipProtocol {
        &self.gossip
    }

    pub fn gossip_mut(&mut self) -> &mut GossipProtocol {
        &mut self.gossip
    }

    pub fn assembler(&self) -> &MessageAssembler {
        &self.assembler
    }

    pub fn selector(&self) -> &PeerSelector {
        &self.selector
    }

    pub fn queue(&self) -> &RequestBackpressureQueue {
        &self.queue
    }

    pub fn regulator(&self) -> &Regulator {
        &self.regulator
    }

    /// Load friends and their pointers from the store
    pub fn load(&mut self) -> Result<usize, StoreError> {
        let mut loaded = 0;
        for friend in self.store.friends()? {
            let outgoing = self.store.root(Direction::Outgoing, &friend)?;
            let incoming = self.store.root(Direction::Incoming, &friend)?;
            match self.book.insert(FriendRecord::restored(friend.clone(), outgoing, incoming)) {
                Ok(true) => loaded += 1,
                Ok(false) => {}
                Err(e) => warn!(friend = %friend, error = %e, "Skipping stored friend"),
            }
        }
        info!(friends = loaded, "Loaded friend state");
        Ok(loaded)
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    /// Apply every command currently waiting in `inbox` without blocking
    pub fn process_inbox(
        &mut self,
        inbox: &mut mpsc::UnboundedReceiver<Command>,
        now_ms: u64,
    ) -> usize {
        let mut handled = 0;
        while let Ok(cmd) = inbox.try_recv() {
            self.handle(cmd, now_ms);
            handled += 1;
        }
        handled
    }

    pub fn handle(&mut self, cmd: Command, now_ms: u64) {
        match cmd {
            Command::Publish {
                friend,
                payload,
                content,
                reply,
            } => {
                let _ = reply.send(self.publish(friend, payload, content, now_ms));
            }
            Command::AddFriend { friend, reply } => {
                let _ = reply.send(self.add_friend(friend));
            }
            Command::RemoveFriend { friend, reply } => {
                let _ = reply.send(self.remove_friend(&friend));
            }
            Command::Fetched { request, result } => self.on_fetched(request, result, now_ms),
        }
    }

    /// Add a friend. Returns false if it already was one.
    ///
    /// The new friend is active, so it is polled ahead of the random
    /// fallback.
    pub fn add_friend(&mut self, friend: PublicKey) -> Result<bool, SyncError> {
        if self.book.contains(&friend) {
            return Ok(false);
        }
        if friend == self.keypair.public_key() {
            return Err(PeerError::CannotAddSelf.into());
        }

        self.store.add_friend(&friend)?;
        self.book.add(friend.clone())?;
        self.selector.mark_active(friend.clone());
        self.gossip.mark_dirty();

        info!(friend = %friend, "Friend added");
        Ok(true)
    }

    /// Remove a friend and every piece of state derived from it
    pub fn remove_friend(&mut self, friend: &PublicKey) -> Result<bool, SyncError> {
        if !self.book.contains(friend) {
            return Ok(false);
        }

        self.store.remove_friend(friend)?;
        self.store.clear_roots(friend)?;

        self.book.remove(friend);
        self.gossip.forget(friend);
        self.assembler.forget(friend);
        self.selector.forget(friend);
        self.queue.forget(friend);

        info!(friend = %friend, "Friend removed");
        Ok(true)
    }

    /// Append a message to our conversation with `friend`.
    ///
    /// Refused without any side effect when the outbound queue is at its
    /// publish cap.
    pub fn publish(
        &mut self,
        friend: PublicKey,
        payload: Vec<u8>,
        content: Option<Vec<u8>>,
        now_ms: u64,
    ) -> Result<ContentHash, PublishError> {
        let previous = match self.book.get(&friend) {
            Some(record) => record.outgoing().copied(),
            None => return Err(PublishError::UnknownFriend(friend)),
        };
        self.queue.admit_publish()?;

        let timestamp = match previous {
            Some(p) => now_ms.max(p.timestamp() + 1),
            None => now_ms,
        };

        let content_hash = match &content {
            Some(bytes) => Some(self.store.put_blob(bytes)?),
            None => None,
        };

        let envelope = MessageEnvelope::sign(
            &self.keypair,
            friend.clone(),
            previous.map(|p| *p.root()),
            timestamp,
            payload,
            content_hash,
        );
        let bytes = envelope.to_bytes();
        let hash = self.store.put_blob(&bytes)?;
        let pointer = Pointer::new(timestamp, hash);
        self.store.set_root(Direction::Outgoing, &friend, &pointer)?;

        if let Some(record) = self.book.get_mut(&friend) {
            record.set_outgoing(pointer);
        }

        self.queue.offer_admitted(OutboundRequest::put(PutSpec::Blob(bytes)));
        if let Some(content) = content {
            self.queue.offer_admitted(OutboundRequest::put(PutSpec::Blob(content)));
        }
        self.gossip.mark_dirty();

        debug!(friend = %friend, hash = %hash, "Message published");
        Ok(hash)
    }

    /// Route a completed DHT get to the staging area it belongs to
    pub fn on_fetched(&mut self, request: FetchRequest, result: Option<Vec<u8>>, now_ms: u64) {
        let requested = match &request.spec {
            RequestSpec::Hash(hash) => Some(*hash),
            RequestSpec::Channel { .. } => None,
        };

        if let Some(friend) = request.purpose.friend() {
            if !self.book.contains(friend) {
                debug!(friend = %friend, "Ignoring fetch result for removed friend");
                if let Some(hash) = requested {
                    self.assembler.on_fetch_failed(&hash);
                }
                return;
            }
        }

        let result = match (result, requested) {
            (Some(bytes), Some(hash)) if ContentHash::of(&bytes) != hash => {
                warn!(hash = %hash, "DHT returned bytes that do not match the requested hash");
                self.listener
                    .on_msg_error(&format!("content hash mismatch for {}", hash));
                None
            }
            (result, _) => result,
        };

        match (request.purpose, result) {
            (FetchPurpose::GossipHead { friend }, Some(bytes)) => {
                self.stage_gossip(friend, 0, &bytes)
            }
            (FetchPurpose::GossipChain { friend, depth }, Some(bytes)) => {
                self.stage_gossip(friend, depth, &bytes)
            }
            (FetchPurpose::GossipHead { friend }, None)
            | (FetchPurpose::GossipChain { friend, .. }, None) => {
                debug!(friend = %friend, "No gossip found");
            }
            (FetchPurpose::Message { sender }, Some(bytes)) => {
                match self.assembler.on_message_fetched(bytes, sender, self.store.as_ref()) {
                    Ok(Some(content_fetch)) => self.offer_fetch(content_fetch),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "Rejected fetched message");
                        self.listener.on_msg_error(&e.to_string());
                    }
                }
            }
            (FetchPurpose::Message { sender }, None) => {
                if let Some(hash) = requested {
                    self.assembler.on_fetch_failed(&hash);
                    self.gossip.record_demand(sender, hash, now_ms);
                }
            }
            (FetchPurpose::Content, Some(bytes)) => {
                self.assembler.on_content_fetched(bytes);
            }
            (FetchPurpose::Content, None) => {
                if let Some(hash) = requested {
                    self.assembler.on_fetch_failed(&hash);
                }
            }
        }
    }

    fn stage_gossip(&mut self, friend: PublicKey, depth: usize, bytes: &[u8]) {
        match GossipBatch::from_bytes(bytes) {
            Ok(batch) => self.gossip.stage_batch(friend, depth, batch),
            Err(e) => {
                warn!(friend = %friend, error = %e, "Undecodable gossip batch");
                self.listener
                    .on_msg_error(&format!("bad gossip batch from {}: {}", friend, e));
            }
        }
    }

    // ========================================================================
    // TICK
    // ========================================================================

    /// One pass of the pipeline. Returns how long to sleep next.
    pub fn tick(&mut self, now_ms: u64) -> Result<TickReport, SyncError> {
        let mut report = TickReport::default();

        // 1. Drain
        let drained = self
            .assembler
            .drain(self.store.as_ref(), &mut self.book, self.listener.as_ref())?;
        report.delivered = drained.delivered;
        for hash in &drained.persisted {
            self.gossip.satisfy_demand(hash);
        }
        for fetch in drained.fetches {
            self.offer_fetch(fetch);
        }

        // 2. Absorb. Staging is already consumed, so a storage error is held
        // until the rest of the tick has run.
        let mut failure: Option<StoreError> = None;
        let outcome = self.gossip.absorb_staged(&mut self.book);
        for (hash, sender) in outcome.fetches {
            match self.assembler.request_message(hash, sender, self.store.as_ref()) {
                Ok(Some(fetch)) => self.offer_fetch(fetch),
                Ok(None) => {}
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        for (owner, hash, depth) in outcome.chain_fetches {
            self.queue.offer(OutboundRequest::fetch(
                RequestSpec::Hash(hash),
                FetchPurpose::GossipChain { friend: owner, depth },
            ));
        }
        if let Err(e) = self.serve_demands() {
            failure.get_or_insert(e);
        }

        // 3. Prune
        report.pruned = self.gossip.prune(now_ms);

        // 4. Select & poll. Friends activated by this tick's gossip become
        // eligible from the next tick; we are already fetching what they announced.
        report.polled = self.selector.select(&self.book, &mut self.rng);
        for friend in outcome.activated {
            self.selector.mark_active(friend);
        }
        if let Some(peer) = report.polled.clone() {
            self.queue.offer(OutboundRequest::fetch(
                RequestSpec::Channel {
                    identity: peer.clone(),
                    salt: self.config.gossip_salt.clone(),
                },
                FetchPurpose::GossipHead { friend: peer.clone() },
            ));
            if let Some(hash) = self.gossip.demand_for(&peer) {
                match self.assembler.request_message(hash, peer, self.store.as_ref()) {
                    Ok(Some(fetch)) => self.offer_fetch(fetch),
                    Ok(None) => {}
                    Err(e) => {
                        failure.get_or_insert(e);
                    }
                }
            }
        }

        // 5. Flush
        if self.gossip.needs_publish(now_ms) {
            for put in self.gossip.publish(&self.keypair, &self.book, now_ms) {
                self.queue.offer(OutboundRequest::put(put));
            }
        }
        let inbox = self.inbox.clone();
        report.flushed = self.queue.flush_if_room(
            self.transport.as_ref(),
            self.config.congestion_threshold,
            |fetch| Self::completion(&inbox, fetch),
        );

        // 6. Regulate
        report.interval = self.regulator.adjust(self.transport.load_ratio());

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(report),
        }
    }

    /// Queue a hash fetch. If the queue refuses it, release the assembler's
    /// marker so the hash can be requested again.
    fn offer_fetch(&mut self, fetch: OutboundRequest) {
        if self.queue.offer(fetch.clone()) || self.queue.contains(&fetch) {
            return;
        }
        if let OutboundRequest::Fetch(FetchRequest {
            spec: RequestSpec::Hash(hash),
            ..
        }) = &fetch
        {
            self.assembler.on_fetch_failed(hash);
        }
    }

    fn completion(inbox: &mpsc::UnboundedSender<Command>, fetch: &FetchRequest) -> FetchCallback {
        let inbox = inbox.clone();
        let request = fetch.clone();
        Box::new(move |result| {
            // The scheduler may be gone; late results are dropped
            let _ = inbox.send(Command::Fetched { request, result });
        })
    }

    /// Republish blobs friends asked us for. A demand is only cleared once
    /// its blob was read; the first read error is returned after every
    /// friend was visited.
    fn serve_demands(&mut self) -> Result<(), StoreError> {
        let mut failure = None;
        for friend in self.book.keys() {
            let Some(hash) = self.book.get(&friend).and_then(|r| r.demand().copied()) else {
                continue;
            };
            let blob = match self.store.blob(&hash) {
                Ok(blob) => blob,
                Err(e) => {
                    failure.get_or_insert(e);
                    continue;
                }
            };
            if let Some(record) = self.book.get_mut(&friend) {
                record.take_demand();
            }
            match blob {
                Some(bytes) => {
                    debug!(friend = %friend, hash = %hash, "Serving demand");
                    self.queue.offer(OutboundRequest::put(PutSpec::Blob(bytes)));
                }
                None => debug!(friend = %friend, hash = %hash, "Demanded blob not held"),
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ========================================================================
    // LOOP
    // ========================================================================

    /// Run until `shutdown` flips to true or its sender is dropped.
    ///
    /// Commands are applied as they arrive; the pipeline runs when the
    /// current sleep completes. The sleep is the only place the loop waits.
    pub async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<Command>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(me = %self.me(), friends = self.book.len(), "Sync scheduler started");
        let mut interval = self.regulator.interval();

        loop {
            let sleep = tokio::time::sleep(interval);
            tokio::pin!(sleep);

            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Sync scheduler stopped");
                            return;
                        }
                    }
                    () = &mut sleep => break,
                    cmd = inbox.recv() => match cmd {
                        Some(cmd) => self.handle(cmd, unix_millis()),
                        None => return,
                    },
                }
            }

            interval = match self.tick(unix_millis()) {
                Ok(report) => {
                    if report.delivered > 0 || report.flushed > 0 {
                        debug!(
                            delivered = report.delivered,
                            flushed = report.flushed,
                            queued = self.queue.len(),
                            interval_ms = report.interval.as_millis() as u64,
                            "Tick"
                        );
                    }
                    report.interval
                }
                Err(e) => {
                    warn!(error = %e, "Sync tick failed");
                    self.listener.on_msg_error(&format!("sync tick failed: {}", e));
                    self.regulator.reset();
                    self.regulator.floor()
                }
            };
        }
    }
}
