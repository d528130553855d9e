// DHT module - THE WIRE (abstract)
// The shared hash table is the only transport; the engine drives it through DhtTransport

mod memory;
mod traits;

pub use memory::{DhtCall, MemoryDht};
pub use traits::{ChannelRecord, DhtTransport, FetchCallback, PutSpec, RequestSpec};
