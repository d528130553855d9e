// Sync module - HOW CONVERSATIONS CONVERGE
// Gossip over DHT channels, message DAG assembly, and the single scheduler
// loop that drives both under transport backpressure

mod assembler;
mod engine;
mod gossip;
mod peer;
mod protocol;
mod queue;
mod scheduler;

pub use assembler::{
    AssemblerError, AssemblerStats, DrainOutcome, MessageAssembler, MessageListener,
};
pub use engine::{EngineError, SyncEngine};
pub use gossip::{AbsorbOutcome, GossipProtocol, GossipStats, OutgoingGossip};
pub use peer::{
    ActiveFriendSet, FriendBook, FriendRecord, IncomingPointer, PeerError, PeerSelector, Pointer,
};
pub use protocol::{
    AssertionKind, ContentHash, GossipAssertion, GossipBatch, MessageEnvelope, ProtocolError,
};
pub use queue::{
    FetchPurpose, FetchRequest, OutboundRequest, QueueError, RequestBackpressureQueue,
};
pub use scheduler::{
    unix_millis, Command, PublishError, Regulator, SyncError, SyncScheduler, TickReport,
};
