// Gossip Protocol - Who has new data, disseminated over the DHT
//
// Anti-entropy over identity-keyed channels:
// - Build: one Message assertion per conversation we own, our open demands,
//   and a bounded relay of fresh third-party assertions about our friends
// - Absorb: newest-wins index per (asserter, subject), filtered to friends
// - Trust tiers: assertions from a friend's own channel may activate that
//   friend; relayed ones only move the observed watermark

use crate::config::EngineConfig;
use crate::dht::{ChannelRecord, PutSpec};
use crate::identity::{Keypair, PublicKey};
use crate::sync::peer::FriendBook;
use crate::sync::protocol::{AssertionKind, ContentHash, GossipAssertion, GossipBatch};
use std::collections::HashMap;
use tracing::debug;

/// Statistics about the gossip protocol
#[derive(Clone, Debug, Default)]
pub struct GossipStats {
    pub batches_absorbed: u64,
    pub assertions_indexed: u64,
    pub assertions_discarded: u64,
    pub assertions_pruned: u64,
    pub batches_published: u64,
    pub relays_emitted: u64,
}

/// Follow-up work produced by absorbing gossip
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AbsorbOutcome {
    /// Messages to fetch, with the friend they are attributed to
    pub fetches: Vec<(ContentHash, PublicKey)>,
    /// Older batches to fetch: (channel owner, batch hash, chain depth)
    pub chain_fetches: Vec<(PublicKey, ContentHash, usize)>,
    /// Friends that should be polled soon
    pub activated: Vec<PublicKey>,
    /// Whether anything we relay changed
    pub index_changed: bool,
}

impl AbsorbOutcome {
    fn merge(&mut self, other: AbsorbOutcome) {
        self.fetches.extend(other.fetches);
        self.chain_fetches.extend(other.chain_fetches);
        self.activated.extend(other.activated);
        self.index_changed |= other.index_changed;
    }
}

/// Gossip batches ready to publish, newest last
#[derive(Clone, Debug)]
pub struct OutgoingGossip {
    pub batches: Vec<GossipBatch>,
}

impl OutgoingGossip {
    /// The batch that goes into our mutable channel
    pub fn head(&self) -> Option<&GossipBatch> {
        self.batches.last()
    }
}

struct StagedBatch {
    owner: PublicKey,
    depth: usize,
    batch: GossipBatch,
}

/// Total order used to pick the newest of two assertions for the same pair,
/// independent of arrival order
fn recency_key(a: &GossipAssertion) -> (u64, u8, [u8; 32]) {
    let kind = match a.kind() {
        AssertionKind::Message => 0,
        AssertionKind::Demand => 1,
    };
    (a.timestamp(), kind, *a.hash().as_bytes())
}

/// Builds and absorbs gossip for one node
pub struct GossipProtocol {
    me: PublicKey,
    batch_size: usize,
    staleness_window_ms: u64,
    republish_interval_ms: u64,
    max_batch_chain: usize,
    salt: Vec<u8>,
    /// Newest assertion per (asserter, subject) about our friends
    index: HashMap<(PublicKey, PublicKey), GossipAssertion>,
    /// Batches received since the last absorb
    staged: Vec<StagedBatch>,
    /// Our own open demands: friend -> (hash, since)
    demands: HashMap<PublicKey, (ContentHash, u64)>,
    dirty: bool,
    last_published_ms: Option<u64>,
    channel_seq: u64,
    stats: GossipStats,
}

impl GossipProtocol {
    pub fn new(me: PublicKey, config: &EngineConfig) -> Self {
        Self {
            me,
            batch_size: config.batch_size.max(1),
            staleness_window_ms: config.staleness_window_ms(),
            republish_interval_ms: config.republish_interval_ms(),
            max_batch_chain: config.max_batch_chain,
            salt: config.gossip_salt.clone(),
            index: HashMap::new(),
            staged: Vec::new(),
            demands: HashMap::new(),
            dirty: true,
            last_published_ms: None,
            channel_seq: 0,
            stats: GossipStats::default(),
        }
    }

    pub fn stats(&self) -> &GossipStats {
        &self.stats
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn index_len(&self) -> usize {
        self.index.len()
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// The retained assertion for an (asserter, subject) pair
    pub fn assertion(&self, asserter: &PublicKey, subject: &PublicKey) -> Option<&GossipAssertion> {
        self.index.get(&(asserter.clone(), subject.clone()))
    }

    /// Whether any index entry or demand mentions `key`
    pub fn mentions(&self, key: &PublicKey) -> bool {
        self.demands.contains_key(key)
            || self
                .index
                .keys()
                .any(|(asserter, subject)| asserter == key || subject == key)
    }

    /// Something we publish changed
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    // ========================================================================
    // DEMANDS
    // ========================================================================

    /// Ask `friend` to republish `hash`
    pub fn record_demand(&mut self, friend: PublicKey, hash: ContentHash, now_ms: u64) {
        let replaced = self.demands.insert(friend, (hash, now_ms));
        if replaced.map(|(h, _)| h) != Some(hash) {
            self.dirty = true;
        }
    }

    /// Our open demand toward `friend`
    pub fn demand_for(&self, friend: &PublicKey) -> Option<ContentHash> {
        self.demands.get(friend).map(|(hash, _)| *hash)
    }

    /// Close any demand for `hash`
    pub fn satisfy_demand(&mut self, hash: &ContentHash) {
        let before = self.demands.len();
        self.demands.retain(|_, (h, _)| *h != *hash);
        if self.demands.len() != before {
            self.dirty = true;
        }
    }

    // ========================================================================
    // ABSORB
    // ========================================================================

    /// Hold a fetched batch until the next absorb step
    pub fn stage_batch(&mut self, owner: PublicKey, depth: usize, batch: GossipBatch) {
        self.staged.push(StagedBatch { owner, depth, batch });
    }

    /// Absorb every staged batch. Batches from removed friends are dropped.
    pub fn absorb_staged(&mut self, book: &mut FriendBook) -> AbsorbOutcome {
        let mut outcome = AbsorbOutcome::default();

        for staged in std::mem::take(&mut self.staged) {
            if !book.contains(&staged.owner) {
                continue;
            }
            self.stats.batches_absorbed += 1;

            let assertions = staged.batch.assertions();
            outcome.merge(self.absorb_incoming(book, &staged.owner, assertions));
            outcome.merge(self.absorb_from_own_channel(book, &staged.owner, assertions));

            if let Some(back_link) = staged.batch.back_link() {
                if staged.depth < self.max_batch_chain {
                    outcome
                        .chain_fetches
                        .push((staged.owner.clone(), *back_link, staged.depth + 1));
                }
            }
        }

        if outcome.index_changed {
            self.dirty = true;
        }
        outcome
    }

    /// Merge assertions from any batch (`owner` is whose channel it came from).
    ///
    /// Assertions about our friends go into the newest-wins index. Message
    /// assertions addressed to us but relayed by someone other than their
    /// asserter only raise the asserter's observed watermark and ask for a fetch.
    pub fn absorb_incoming(
        &mut self,
        book: &mut FriendBook,
        owner: &PublicKey,
        assertions: &[GossipAssertion],
    ) -> AbsorbOutcome {
        let mut outcome = AbsorbOutcome::default();

        for assertion in assertions {
            if assertion.asserter() == &self.me {
                continue;
            }

            if assertion.subject() == &self.me {
                if assertion.asserter() != owner && assertion.kind() == AssertionKind::Message {
                    if let Some(record) = book.get_mut(assertion.asserter()) {
                        let incoming = record.incoming_mut();
                        incoming.observe(assertion.timestamp());
                        if assertion.timestamp() > incoming.trusted_ts() {
                            outcome
                                .fetches
                                .push((*assertion.hash(), assertion.asserter().clone()));
                        }
                    }
                }
                continue;
            }

            if !book.contains(assertion.subject()) {
                self.stats.assertions_discarded += 1;
                continue;
            }

            let pair = (assertion.asserter().clone(), assertion.subject().clone());
            let newer = match self.index.get(&pair) {
                Some(existing) => recency_key(assertion) > recency_key(existing),
                None => true,
            };
            if newer {
                self.index.insert(pair, assertion.clone());
                self.stats.assertions_indexed += 1;
                outcome.index_changed = true;
            }
        }

        outcome
    }

    /// Handle what a friend says to us on its own channel
    pub fn absorb_from_own_channel(
        &mut self,
        book: &mut FriendBook,
        owner: &PublicKey,
        assertions: &[GossipAssertion],
    ) -> AbsorbOutcome {
        let mut outcome = AbsorbOutcome::default();
        let Some(record) = book.get_mut(owner) else {
            return outcome;
        };

        for assertion in assertions {
            if assertion.asserter() != owner || assertion.subject() != &self.me {
                continue;
            }

            match assertion.kind() {
                AssertionKind::Demand => {
                    debug!(friend = %owner, hash = %assertion.hash(), "Friend demands a blob");
                    record.set_demand(*assertion.hash());
                }
                AssertionKind::Message => {
                    let incoming = record.incoming_mut();
                    if incoming.observe(assertion.timestamp()) {
                        outcome.activated.push(owner.clone());
                    }
                    if assertion.timestamp() > incoming.trusted_ts() {
                        outcome.fetches.push((*assertion.hash(), owner.clone()));
                    }
                }
            }
        }

        outcome
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    /// Drop assertions older than the staleness window
    pub fn prune(&mut self, now_ms: u64) -> usize {
        let window = self.staleness_window_ms;
        let before = self.index.len();
        self.index.retain(|_, a| a.age_ms(now_ms) < window);
        let pruned = before - self.index.len();
        self.stats.assertions_pruned += pruned as u64;
        pruned
    }

    /// Remove every trace of `friend`
    pub fn forget(&mut self, friend: &PublicKey) {
        self.index
            .retain(|(asserter, subject), _| asserter != friend && subject != friend);
        self.demands.remove(friend);
        self.staged.retain(|s| &s.owner != friend);
        self.dirty = true;
    }

    // ========================================================================
    // BUILD
    // ========================================================================

    /// Whether gossip should be rebuilt and published now
    pub fn needs_publish(&self, now_ms: u64) -> bool {
        match self.last_published_ms {
            None => true,
            Some(last) => self.dirty || now_ms.saturating_sub(last) >= self.republish_interval_ms,
        }
    }

    /// Assemble every assertion we currently publish, split into a
    /// back-linked chain of batches. Own conversation pointers come last so
    /// they land in the head batch.
    pub fn build_outgoing(&mut self, book: &FriendBook, now_ms: u64) -> OutgoingGossip {
        let mut relays: Vec<&GossipAssertion> = self
            .index
            .values()
            .filter(|a| book.contains(a.subject()) && a.age_ms(now_ms) < self.staleness_window_ms)
            .collect();
        relays.sort_by_key(|a| recency_key(a));
        self.stats.relays_emitted += relays.len() as u64;

        let mut assertions: Vec<GossipAssertion> = relays.into_iter().cloned().collect();

        let mut demands: Vec<(&PublicKey, &(ContentHash, u64))> = self
            .demands
            .iter()
            .filter(|(friend, _)| book.contains(friend))
            .collect();
        demands.sort_by(|a, b| a.0.cmp(b.0));
        for (friend, (hash, since)) in demands {
            assertions.push(GossipAssertion::demand(
                self.me.clone(),
                friend.clone(),
                *since,
                *hash,
            ));
        }

        for record in book.records() {
            if let Some(pointer) = record.outgoing() {
                assertions.push(GossipAssertion::message(
                    self.me.clone(),
                    record.key().clone(),
                    pointer.timestamp(),
                    *pointer.root(),
                ));
            }
        }

        let mut batches: Vec<GossipBatch> = Vec::new();
        for chunk in assertions.chunks(self.batch_size) {
            let back_link = batches.last().map(|b| b.hash());
            batches.push(GossipBatch::new(back_link, chunk.to_vec()));
        }

        OutgoingGossip { batches }
    }

    /// Build outgoing gossip and turn it into DHT puts: older batches as
    /// content-addressed blobs, the head as a signed record in our channel.
    pub fn publish(&mut self, keypair: &Keypair, book: &FriendBook, now_ms: u64) -> Vec<PutSpec> {
        let outgoing = self.build_outgoing(book, now_ms);
        self.dirty = false;
        self.last_published_ms = Some(now_ms);

        let Some((head, older)) = outgoing.batches.split_last() else {
            return Vec::new();
        };

        self.channel_seq = now_ms.max(self.channel_seq + 1);
        self.stats.batches_published += outgoing.batches.len() as u64;

        let mut puts: Vec<PutSpec> = older.iter().map(|b| PutSpec::Blob(b.to_bytes())).collect();
        puts.push(PutSpec::Channel(ChannelRecord::signed(
            keypair,
            &self.salt,
            self.channel_seq,
            head.to_bytes(),
        )));

        debug!(
            batches = outgoing.batches.len(),
            sequence = self.channel_seq,
            "Publishing gossip"
        );
        puts
    }
}
