// Gossip Tests
// Tests for building, absorbing, and pruning gossip

use dhtchat::dht::PutSpec;
use dhtchat::identity::{Keypair, PublicKey};
use dhtchat::sync::{
    AssertionKind, ContentHash, FriendBook, GossipAssertion, GossipBatch, GossipProtocol, Pointer,
};
use dhtchat::EngineConfig;

const DAY_MS: u64 = 86_400_000;

fn key() -> PublicKey {
    Keypair::generate().public_key()
}

fn setup(n_friends: usize) -> (Keypair, FriendBook, Vec<PublicKey>, GossipProtocol) {
    setup_with(n_friends, EngineConfig::default())
}

fn setup_with(
    n_friends: usize,
    config: EngineConfig,
) -> (Keypair, FriendBook, Vec<PublicKey>, GossipProtocol) {
    let me = Keypair::generate();
    let mut book = FriendBook::new(me.public_key());
    let friends: Vec<PublicKey> = (0..n_friends).map(|_| key()).collect();
    for friend in &friends {
        book.add(friend.clone()).unwrap();
    }
    let gossip = GossipProtocol::new(me.public_key(), &config);
    (me, book, friends, gossip)
}

fn h(n: u64) -> ContentHash {
    ContentHash::of(&n.to_le_bytes())
}

// ============================================================================
// NEWEST WINS
// ============================================================================

#[test]
fn test_newest_assertion_wins_in_any_order() {
    let (_, mut book, friends, _) = setup(2);
    let relayer = friends[0].clone();
    let subject = friends[1].clone();
    let asserter = key();

    let assertions: Vec<GossipAssertion> = [5u64, 30, 12, 30, 1, 29]
        .iter()
        .map(|ts| GossipAssertion::message(asserter.clone(), subject.clone(), *ts, h(*ts)))
        .collect();

    let orders: Vec<Vec<usize>> = vec![
        vec![0, 1, 2, 3, 4, 5],
        vec![5, 4, 3, 2, 1, 0],
        vec![2, 0, 4, 1, 5, 3],
        vec![3, 3, 1, 1, 0, 0],
    ];

    for order in orders {
        let (_, _, _, mut gossip) = setup(0);
        for i in order {
            gossip.absorb_incoming(&mut book, &relayer, &[assertions[i].clone()]);
        }
        let kept = gossip.assertion(&asserter, &subject).unwrap();
        assert_eq!(kept.timestamp(), 30);
        assert_eq!(kept.hash(), &h(30));
        assert_eq!(gossip.index_len(), 1);
    }
}

#[test]
fn test_equal_timestamps_resolve_deterministically() {
    let (_, mut book, friends, _) = setup(2);
    let asserter = key();
    let subject = friends[1].clone();
    let a = GossipAssertion::message(asserter.clone(), subject.clone(), 10, ContentHash::of(b"a"));
    let b = GossipAssertion::message(asserter.clone(), subject, 10, ContentHash::of(b"b"));

    let (_, _, _, mut first) = setup(0);
    first.absorb_incoming(&mut book, &friends[0], &[a.clone(), b.clone()]);
    let (_, _, _, mut second) = setup(0);
    second.absorb_incoming(&mut book, &friends[0], &[b, a]);

    assert_eq!(
        first.assertion(&asserter, &friends[1]),
        second.assertion(&asserter, &friends[1])
    );
}

#[test]
fn test_own_assertions_not_indexed() {
    let (me, mut book, friends, mut gossip) = setup(1);
    gossip.absorb_incoming(
        &mut book,
        &friends[0],
        &[GossipAssertion::message(me.public_key(), friends[0].clone(), 10, h(1))],
    );
    assert_eq!(gossip.index_len(), 0);
}

// ============================================================================
// TRUST TIERS
// ============================================================================

#[test]
fn test_own_channel_message_activates_and_fetches() {
    let (me, mut book, friends, mut gossip) = setup(1);
    let b = friends[0].clone();
    let batch = GossipBatch::new(
        None,
        vec![GossipAssertion::message(b.clone(), me.public_key(), 500, h(7))],
    );

    gossip.stage_batch(b.clone(), 0, batch);
    let outcome = gossip.absorb_staged(&mut book);

    assert_eq!(outcome.activated, vec![b.clone()]);
    assert_eq!(outcome.fetches, vec![(h(7), b.clone())]);
    let incoming = book.get(&b).unwrap().incoming();
    assert_eq!(incoming.observed_ts(), 500);
    assert!(incoming.trusted().is_none());
}

#[test]
fn test_own_channel_old_message_does_not_activate() {
    let (me, mut book, friends, mut gossip) = setup(1);
    let b = friends[0].clone();
    book.get_mut(&b)
        .unwrap()
        .incoming_mut()
        .promote(Pointer::new(500, h(7)));

    let outcome = gossip.absorb_from_own_channel(
        &mut book,
        &b,
        &[GossipAssertion::message(b.clone(), me.public_key(), 500, h(7))],
    );

    assert!(outcome.activated.is_empty());
    assert!(outcome.fetches.is_empty());
}

#[test]
fn test_relayed_message_never_activates() {
    let (me, mut book, friends, mut gossip) = setup(2);
    let relayer = friends[0].clone();
    let author = friends[1].clone();

    gossip.stage_batch(
        relayer,
        0,
        GossipBatch::new(
            None,
            vec![GossipAssertion::message(author.clone(), me.public_key(), 900, h(9))],
        ),
    );
    let outcome = gossip.absorb_staged(&mut book);

    assert!(outcome.activated.is_empty());
    assert_eq!(outcome.fetches, vec![(h(9), author.clone())]);
    assert_eq!(book.get(&author).unwrap().incoming().observed_ts(), 900);
    assert!(book.get(&author).unwrap().incoming().trusted().is_none());
}

#[test]
fn test_relayed_message_from_stranger_ignored() {
    let (me, mut book, friends, mut gossip) = setup(1);
    let stranger = key();
    let outcome = gossip.absorb_incoming(
        &mut book,
        &friends[0],
        &[GossipAssertion::message(stranger, me.public_key(), 900, h(9))],
    );
    assert!(outcome.fetches.is_empty());
}

#[test]
fn test_own_channel_demand_recorded_on_friend() {
    let (me, mut book, friends, mut gossip) = setup(1);
    let b = friends[0].clone();

    gossip.absorb_from_own_channel(
        &mut book,
        &b,
        &[GossipAssertion::demand(b.clone(), me.public_key(), 1, h(3))],
    );

    assert_eq!(book.get(&b).unwrap().demand(), Some(&h(3)));
}

#[test]
fn test_batches_from_removed_friend_dropped() {
    let (me, mut book, friends, mut gossip) = setup(1);
    let b = friends[0].clone();
    gossip.stage_batch(
        b.clone(),
        0,
        GossipBatch::new(None, vec![GossipAssertion::message(b.clone(), me.public_key(), 5, h(1))]),
    );
    book.remove(&b);

    let outcome = gossip.absorb_staged(&mut book);
    assert!(outcome.fetches.is_empty());
    assert_eq!(gossip.staged_len(), 0);
}

// ============================================================================
// CHAINING
// ============================================================================

#[test]
fn test_back_link_followed_up_to_limit() {
    let config = EngineConfig::default().with_max_batch_chain(2);
    let (_, mut book, friends, mut gossip) = setup_with(1, config);
    let b = friends[0].clone();
    let older = ContentHash::of(b"older batch");

    gossip.stage_batch(b.clone(), 0, GossipBatch::new(Some(older), Vec::new()));
    gossip.stage_batch(b.clone(), 1, GossipBatch::new(Some(older), Vec::new()));
    gossip.stage_batch(b.clone(), 2, GossipBatch::new(Some(older), Vec::new()));
    let outcome = gossip.absorb_staged(&mut book);

    assert_eq!(
        outcome.chain_fetches,
        vec![(b.clone(), older, 1), (b.clone(), older, 2)]
    );
}

#[test]
fn test_build_splits_into_linked_batches() {
    let config = EngineConfig::default().with_batch_size(2);
    let (me, mut book, friends, mut gossip) = setup_with(5, config);
    for (i, friend) in friends.iter().enumerate() {
        book.get_mut(friend)
            .unwrap()
            .set_outgoing(Pointer::new(100 + i as u64, h(i as u64)));
    }

    let outgoing = gossip.build_outgoing(&book, 1_000);
    assert_eq!(outgoing.batches.len(), 3);
    assert!(outgoing.batches[0].back_link().is_none());
    for pair in outgoing.batches.windows(2) {
        assert_eq!(pair[1].back_link(), Some(&pair[0].hash()));
    }

    let total: usize = outgoing.batches.iter().map(|b| b.len()).sum();
    assert_eq!(total, 5);
    assert!(outgoing
        .batches
        .iter()
        .flat_map(|b| b.assertions())
        .all(|a| a.asserter() == &me.public_key() && a.kind() == AssertionKind::Message));
}

#[test]
fn test_own_pointers_land_in_head_batch() {
    let config = EngineConfig::default().with_batch_size(2);
    let (me, mut book, friends, mut gossip) = setup_with(3, config);
    let mine = friends[0].clone();
    book.get_mut(&mine).unwrap().set_outgoing(Pointer::new(999, h(99)));

    // Fill the index with relayable assertions about friends
    let asserter = key();
    let relays: Vec<GossipAssertion> = (0..5)
        .map(|i| {
            let subject = friends[1 + (i % 2)].clone();
            GossipAssertion::message(asserter.clone(), subject, 10 + i as u64, h(i as u64))
        })
        .collect();
    gossip.absorb_incoming(&mut book, &friends[1], &relays);

    let outgoing = gossip.build_outgoing(&book, 1_000);
    let head = outgoing.head().unwrap();
    assert!(head
        .assertions()
        .iter()
        .any(|a| a.asserter() == &me.public_key() && a.subject() == &mine && a.hash() == &h(99)));
}

#[test]
fn test_publish_puts_older_batches_then_channel() {
    let config = EngineConfig::default().with_batch_size(1);
    let (me, mut book, friends, mut gossip) = setup_with(3, config);
    for (i, friend) in friends.iter().enumerate() {
        book.get_mut(friend).unwrap().set_outgoing(Pointer::new(i as u64 + 1, h(i as u64)));
    }

    let puts = gossip.publish(&me, &book, 5_000);
    assert_eq!(puts.len(), 3);
    assert!(matches!(puts[0], PutSpec::Blob(_)));
    assert!(matches!(puts[1], PutSpec::Blob(_)));
    let PutSpec::Channel(record) = &puts[2] else {
        panic!("head must go to the channel");
    };
    assert!(record.verify());
    assert_eq!(record.identity(), &me.public_key());
    assert_eq!(record.salt(), gossip.salt());

    let head = GossipBatch::from_bytes(record.value()).unwrap();
    let PutSpec::Blob(previous) = &puts[1] else {
        unreachable!()
    };
    assert_eq!(head.back_link(), Some(&ContentHash::of(previous)));
}

#[test]
fn test_channel_sequence_strictly_increases() {
    let (me, mut book, friends, mut gossip) = setup(1);
    book.get_mut(&friends[0]).unwrap().set_outgoing(Pointer::new(1, h(1)));

    let seq = |puts: Vec<PutSpec>| match puts.last() {
        Some(PutSpec::Channel(record)) => record.sequence(),
        _ => panic!("expected a channel put"),
    };

    let first = seq(gossip.publish(&me, &book, 1_000));
    let second = seq(gossip.publish(&me, &book, 1_000));
    let third = seq(gossip.publish(&me, &book, 500));
    assert!(first < second && second < third);
}

// ============================================================================
// REPUBLISH SCHEDULE
// ============================================================================

#[test]
fn test_needs_publish_when_dirty_or_due() {
    let (me, mut book, friends, mut gossip) = setup(1);
    book.get_mut(&friends[0]).unwrap().set_outgoing(Pointer::new(1, h(1)));

    assert!(gossip.needs_publish(0));
    gossip.publish(&me, &book, 10_000);
    assert!(!gossip.needs_publish(10_001));

    gossip.mark_dirty();
    assert!(gossip.needs_publish(10_001));
    gossip.publish(&me, &book, 10_001);

    assert!(!gossip.needs_publish(10_001 + 29_999));
    assert!(gossip.needs_publish(10_001 + 30_000));
}

// ============================================================================
// DEMANDS
// ============================================================================

#[test]
fn test_demand_published_until_satisfied() {
    let (me, book, friends, mut gossip) = setup(1);
    let b = friends[0].clone();

    gossip.record_demand(b.clone(), h(4), 100);
    assert_eq!(gossip.demand_for(&b), Some(h(4)));

    let outgoing = gossip.build_outgoing(&book, 200);
    let demand = outgoing
        .batches
        .iter()
        .flat_map(|batch| batch.assertions())
        .find(|a| a.kind() == AssertionKind::Demand)
        .unwrap();
    assert_eq!(demand.asserter(), &me.public_key());
    assert_eq!(demand.subject(), &b);
    assert_eq!(demand.hash(), &h(4));

    gossip.satisfy_demand(&h(4));
    assert_eq!(gossip.demand_for(&b), None);
    assert!(gossip.is_dirty());
}

// ============================================================================
// PRUNE & FORGET
// ============================================================================

#[test]
fn test_prune_drops_stale_assertions() {
    let (_, mut book, friends, mut gossip) = setup(2);
    let asserter = key();
    let now = 10 * DAY_MS;
    gossip.absorb_incoming(
        &mut book,
        &friends[0],
        &[
            GossipAssertion::message(asserter.clone(), friends[0].clone(), now - DAY_MS - 1, h(1)),
            GossipAssertion::message(asserter.clone(), friends[1].clone(), now - 1_000, h(2)),
        ],
    );
    assert_eq!(gossip.index_len(), 2);

    assert_eq!(gossip.prune(now), 1);
    assert!(gossip.assertion(&asserter, &friends[0]).is_none());
    assert!(gossip.assertion(&asserter, &friends[1]).is_some());
}

#[test]
fn test_stale_relays_not_published() {
    let (_, mut book, friends, mut gossip) = setup(1);
    let asserter = key();
    gossip.absorb_incoming(
        &mut book,
        &friends[0],
        &[GossipAssertion::message(asserter, friends[0].clone(), 0, h(1))],
    );

    let outgoing = gossip.build_outgoing(&book, 2 * DAY_MS);
    assert!(outgoing.batches.iter().all(|b| b.is_empty()));
}

#[test]
fn test_forget_leaves_no_trace() {
    let (_, mut book, friends, mut gossip) = setup(2);
    let gone = friends[0].clone();
    let kept = friends[1].clone();

    gossip.absorb_incoming(
        &mut book,
        &kept,
        &[
            GossipAssertion::message(key(), gone.clone(), 10, h(1)),
            GossipAssertion::message(gone.clone(), kept.clone(), 10, h(2)),
            GossipAssertion::message(key(), kept.clone(), 10, h(3)),
        ],
    );
    gossip.record_demand(gone.clone(), h(4), 10);
    gossip.stage_batch(gone.clone(), 0, GossipBatch::new(None, Vec::new()));
    assert!(gossip.mentions(&gone));

    gossip.forget(&gone);

    assert!(!gossip.mentions(&gone));
    assert_eq!(gossip.index_len(), 1);
    assert_eq!(gossip.staged_len(), 0);
    assert_eq!(gossip.demand_for(&gone), None);
}
