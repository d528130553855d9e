// Store Tests
// Tests for the sled-backed message store

use dhtchat::identity::Keypair;
use dhtchat::storage::{Direction, MessageStore, SledStore};
use dhtchat::sync::{ContentHash, Pointer};
use tempfile::TempDir;

// ============================================================================
// BLOBS
// ============================================================================

#[test]
fn test_store_open_new() {
    let temp_dir = TempDir::new().unwrap();
    let store = SledStore::open(temp_dir.path()).unwrap();
    assert!(store.is_empty());
}

#[test]
fn test_put_blob_returns_content_hash() {
    let store = SledStore::temporary().unwrap();
    let hash = store.put_blob(b"message bytes").unwrap();
    assert_eq!(hash, ContentHash::of(b"message bytes"));
}

#[test]
fn test_blob_missing() {
    let store = SledStore::temporary().unwrap();
    let hash = ContentHash::of(b"never stored");
    assert!(!store.has_blob(&hash).unwrap());
    assert_eq!(store.blob(&hash).unwrap(), None);
}

#[test]
fn test_put_blob_is_idempotent() {
    let store = SledStore::temporary().unwrap();
    let first = store.put_blob(b"same").unwrap();
    let second = store.put_blob(b"same").unwrap();
    assert_eq!(first, second);
    assert_eq!(store.stats().key_count, 1);
}

#[test]
fn test_blobs_persist_across_reopens() {
    let temp_dir = TempDir::new().unwrap();
    let hash = {
        let store = SledStore::open(temp_dir.path()).unwrap();
        let hash = store.put_blob(b"durable").unwrap();
        store.flush().unwrap();
        hash
    };

    let store = SledStore::open(temp_dir.path()).unwrap();
    assert_eq!(store.blob(&hash).unwrap(), Some(b"durable".to_vec()));
}

// ============================================================================
// ROOTS
// ============================================================================

#[test]
fn test_roots_are_per_direction() {
    let store = SledStore::temporary().unwrap();
    let friend = Keypair::generate().public_key();
    let out = Pointer::new(1, ContentHash::of(b"out"));
    let inc = Pointer::new(2, ContentHash::of(b"in"));

    store.set_root(Direction::Outgoing, &friend, &out).unwrap();
    store.set_root(Direction::Incoming, &friend, &inc).unwrap();

    assert_eq!(store.root(Direction::Outgoing, &friend).unwrap(), Some(out));
    assert_eq!(store.root(Direction::Incoming, &friend).unwrap(), Some(inc));
}

#[test]
fn test_set_root_overwrites() {
    let store = SledStore::temporary().unwrap();
    let friend = Keypair::generate().public_key();

    store
        .set_root(Direction::Outgoing, &friend, &Pointer::new(1, ContentHash::of(b"a")))
        .unwrap();
    store
        .set_root(Direction::Outgoing, &friend, &Pointer::new(2, ContentHash::of(b"b")))
        .unwrap();

    let root = store.root(Direction::Outgoing, &friend).unwrap().unwrap();
    assert_eq!(root.timestamp(), 2);
    assert_eq!(root.root(), &ContentHash::of(b"b"));
}

#[test]
fn test_clear_roots_only_touches_that_friend() {
    let store = SledStore::temporary().unwrap();
    let alice = Keypair::generate().public_key();
    let bob = Keypair::generate().public_key();
    let pointer = Pointer::new(5, ContentHash::of(b"m"));

    for friend in [&alice, &bob] {
        store.set_root(Direction::Outgoing, friend, &pointer).unwrap();
        store.set_root(Direction::Incoming, friend, &pointer).unwrap();
    }
    store.clear_roots(&alice).unwrap();

    assert_eq!(store.root(Direction::Outgoing, &alice).unwrap(), None);
    assert_eq!(store.root(Direction::Incoming, &alice).unwrap(), None);
    assert_eq!(store.root(Direction::Outgoing, &bob).unwrap(), Some(pointer));
}

// ============================================================================
// FRIENDS
// ============================================================================

#[test]
fn test_friend_set() {
    let store = SledStore::temporary().unwrap();
    let alice = Keypair::generate().public_key();
    let bob = Keypair::generate().public_key();

    store.add_friend(&alice).unwrap();
    store.add_friend(&bob).unwrap();
    store.add_friend(&alice).unwrap();

    let mut friends = store.friends().unwrap();
    friends.sort();
    let mut expected = vec![alice.clone(), bob.clone()];
    expected.sort();
    assert_eq!(friends, expected);

    store.remove_friend(&alice).unwrap();
    assert_eq!(store.friends().unwrap(), vec![bob]);
}

#[test]
fn test_friends_not_confused_with_blobs() {
    let store = SledStore::temporary().unwrap();
    store.put_blob(b"blob").unwrap();
    assert!(store.friends().unwrap().is_empty());
}

// ============================================================================
// IDENTITY
// ============================================================================

#[test]
fn test_load_keypair_none_when_empty() {
    let store = SledStore::temporary().unwrap();
    assert!(store.load_keypair().unwrap().is_none());
}

#[test]
fn test_keypair_persists_across_reopens() {
    let temp_dir = TempDir::new().unwrap();
    let public_key = {
        let store = SledStore::open(temp_dir.path()).unwrap();
        let kp = store.get_or_create_keypair().unwrap();
        store.flush().unwrap();
        kp.public_key()
    };

    let store = SledStore::open(temp_dir.path()).unwrap();
    let kp = store.get_or_create_keypair().unwrap();
    assert_eq!(kp.public_key(), public_key);
}
