// Queue Tests
// Tests for the outbound request queue: dedup, admission, and gated flushing

use dhtchat::dht::{DhtCall, FetchCallback, MemoryDht, PutSpec, RequestSpec};
use dhtchat::identity::Keypair;
use dhtchat::sync::{
    ContentHash, FetchPurpose, FetchRequest, OutboundRequest, QueueError, RequestBackpressureQueue,
};

const THRESHOLD: f64 = 0.8;

fn noop(_: &FetchRequest) -> FetchCallback {
    Box::new(|_| {})
}

fn put(n: u8) -> OutboundRequest {
    OutboundRequest::put(PutSpec::Blob(vec![n]))
}

fn content_fetch(n: u8) -> OutboundRequest {
    OutboundRequest::fetch(RequestSpec::Hash(ContentHash::of(&[n])), FetchPurpose::Content)
}

// ============================================================================
// OFFER
// ============================================================================

#[test]
fn test_offer_keeps_fifo_order() {
    let mut queue = RequestBackpressureQueue::new(100, 1000);
    queue.offer(put(1));
    queue.offer(content_fetch(2));
    queue.offer(put(3));

    let items: Vec<&OutboundRequest> = queue.iter().collect();
    assert_eq!(items, vec![&put(1), &content_fetch(2), &put(3)]);
}

#[test]
fn test_offer_dedups_puts_and_fetches() {
    let mut queue = RequestBackpressureQueue::new(100, 1000);
    assert!(queue.offer(put(1)));
    assert!(!queue.offer(put(1)));
    assert!(queue.offer(content_fetch(1)));
    assert!(!queue.offer(content_fetch(1)));
    assert_eq!(queue.len(), 2);
}

#[test]
fn test_same_hash_different_purpose_not_deduped() {
    let mut queue = RequestBackpressureQueue::new(100, 1000);
    let sender = Keypair::generate().public_key();
    let hash = ContentHash::of(b"m");

    queue.offer(OutboundRequest::fetch(RequestSpec::Hash(hash), FetchPurpose::Content));
    queue.offer(OutboundRequest::fetch(RequestSpec::Hash(hash), FetchPurpose::Message { sender }));
    assert_eq!(queue.len(), 2);
}

#[test]
fn test_admitted_work_ignores_hard_limit() {
    let mut queue = RequestBackpressureQueue::new(2, 2);
    queue.offer(put(1));
    assert!(queue.admit_publish().is_ok());
    assert!(queue.offer_admitted(put(2)));
    assert!(queue.offer_admitted(put(3)));
    assert_eq!(queue.len(), 3);
    assert!(!queue.offer(put(4)));
}

// ============================================================================
// ADMISSION
// ============================================================================

#[test]
fn test_admission_below_cap() {
    let mut queue = RequestBackpressureQueue::new(100, 1000);
    for n in 0..99 {
        queue.offer(put(n));
    }
    assert!(queue.admit_publish().is_ok());
}

#[test]
fn test_admission_at_cap_rejected() {
    let mut queue = RequestBackpressureQueue::new(100, 1000);
    for n in 0..100 {
        queue.offer(put(n));
    }
    assert_eq!(
        queue.admit_publish(),
        Err(QueueError::Full { queued: 100, cap: 100 })
    );
}

// ============================================================================
// FLUSH
// ============================================================================

#[test]
fn test_flush_below_threshold_sends() {
    let dht = MemoryDht::manual(100);
    dht.set_extra_load(79);
    let mut queue = RequestBackpressureQueue::new(100, 1000);
    queue.offer(put(1));
    queue.offer(put(2));

    // 79% has room for one; after it 80% withholds the rest
    assert_eq!(queue.flush_if_room(&dht, THRESHOLD, noop), 1);
    assert_eq!(queue.len(), 1);
    assert_eq!(dht.calls().len(), 1);
}

#[test]
fn test_flush_at_threshold_withholds() {
    let dht = MemoryDht::manual(100);
    dht.set_extra_load(80);
    let mut queue = RequestBackpressureQueue::new(100, 1000);
    queue.offer(put(1));

    assert_eq!(queue.flush_if_room(&dht, THRESHOLD, noop), 0);
    assert_eq!(queue.len(), 1);
    assert!(dht.calls().is_empty());
}

#[test]
fn test_flush_above_threshold_withholds() {
    let dht = MemoryDht::manual(100);
    dht.set_extra_load(81);
    let mut queue = RequestBackpressureQueue::new(100, 1000);
    queue.offer(put(1));

    assert_eq!(queue.flush_if_room(&dht, THRESHOLD, noop), 0);
    assert_eq!(queue.len(), 1);
}

#[test]
fn test_flush_resumes_when_load_drops() {
    let dht = MemoryDht::manual(10);
    let mut queue = RequestBackpressureQueue::new(100, 1000);
    for n in 0..12 {
        queue.offer(put(n));
    }

    // Capacity 10 at 0.8: eight operations fit
    assert_eq!(queue.flush_if_room(&dht, THRESHOLD, noop), 8);
    assert_eq!(queue.len(), 4);

    dht.complete_pending();
    assert_eq!(queue.flush_if_room(&dht, THRESHOLD, noop), 4);
    assert!(queue.is_empty());

    // Every item reached the transport exactly once, in order
    let expected: Vec<DhtCall> = (0..12u8)
        .map(|n| DhtCall::Distribute(RequestSpec::Hash(ContentHash::of(&[n]))))
        .collect();
    assert_eq!(dht.calls(), expected);
}

#[test]
fn test_flush_builds_callback_per_fetch() {
    let dht = MemoryDht::manual(100);
    let mut queue = RequestBackpressureQueue::new(100, 1000);
    queue.offer(content_fetch(1));
    queue.offer(put(2));
    queue.offer(content_fetch(3));

    let mut seen = Vec::new();
    queue.flush_if_room(&dht, THRESHOLD, |fetch| {
        seen.push(fetch.clone());
        noop(fetch)
    });

    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].spec, RequestSpec::Hash(ContentHash::of(&[1])));
    assert_eq!(seen[1].spec, RequestSpec::Hash(ContentHash::of(&[3])));
}

// ============================================================================
// FORGET
// ============================================================================

#[test]
fn test_forget_drops_only_that_friends_fetches() {
    let mut queue = RequestBackpressureQueue::new(100, 1000);
    let alice = Keypair::generate().public_key();
    let bob = Keypair::generate().public_key();

    queue.offer(OutboundRequest::fetch(
        RequestSpec::Channel {
            identity: alice.clone(),
            salt: b"s".to_vec(),
        },
        FetchPurpose::GossipHead { friend: alice.clone() },
    ));
    queue.offer(OutboundRequest::fetch(
        RequestSpec::Hash(ContentHash::of(b"m")),
        FetchPurpose::Message { sender: bob.clone() },
    ));
    queue.offer(put(9));

    queue.forget(&alice);
    assert_eq!(queue.len(), 2);
    assert!(queue.iter().all(|item| match item {
        OutboundRequest::Fetch(f) => f.purpose.friend() != Some(&alice),
        OutboundRequest::Put(_) => true,
    }));
}
