// Storage module - PERSISTENCE
// Durable blobs, conversation pointers and the friend set, backed by sled

mod store;

pub use store::{Direction, MessageStore, SledStore, StorageStats, StoreError};
