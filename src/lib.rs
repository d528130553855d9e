//! dhtchat - serverless friend-to-friend messaging over a shared DHT
//!
//! Every node publishes gossip about the conversations it knows into a
//! signed channel keyed by its identity. Friends poll those channels, fetch
//! the messages they learn about, and walk each conversation's hash chain
//! backwards until it is complete. One scheduler task per node paces all of
//! this against the shared transport's occupancy.

pub mod config;
pub mod dht;
pub mod identity;
pub mod storage;
pub mod sync;

pub use config::{ConfigError, EngineConfig};
pub use sync::{MessageListener, PublishError, SyncEngine};
