// In-memory DHT
// A shared, in-process stand-in for the real DHT session. Every node holding a
// clone sees the same blobs and channel slots, and the same occupancy.

use crate::dht::{ChannelRecord, DhtTransport, FetchCallback, PutSpec, RequestSpec};
use crate::identity::PublicKey;
use crate::sync::ContentHash;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

/// A call observed by the DHT, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtCall {
    Request(RequestSpec),
    Distribute(RequestSpec),
}

enum PendingOp {
    Get(RequestSpec, FetchCallback),
    Put(PutSpec),
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    /// Operations wait for `complete_pending`
    Manual,
    /// Operations complete on a tokio task after the latency
    Timed(Duration),
}

struct Inner {
    mode: Mode,
    capacity: usize,
    blobs: Mutex<HashMap<ContentHash, Vec<u8>>>,
    channels: Mutex<HashMap<(PublicKey, Vec<u8>), ChannelRecord>>,
    pending: Mutex<VecDeque<PendingOp>>,
    log: Mutex<Vec<DhtCall>>,
    in_flight: AtomicUsize,
    extra_load: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn lookup(&self, spec: &RequestSpec) -> Option<Vec<u8>> {
        match spec {
            RequestSpec::Hash(hash) => lock(&self.blobs).get(hash).cloned(),
            RequestSpec::Channel { identity, salt } => lock(&self.channels)
                .get(&(identity.clone(), salt.clone()))
                .map(|record| record.value().to_vec()),
        }
    }

    fn apply(&self, put: PutSpec) {
        match put {
            PutSpec::Blob(bytes) => {
                lock(&self.blobs).insert(ContentHash::of(&bytes), bytes);
            }
            PutSpec::Channel(record) => {
                if !record.verify() {
                    warn!(
                        identity = %record.identity(),
                        "Rejected channel record with bad signature"
                    );
                    return;
                }
                let key = (record.identity().clone(), record.salt().to_vec());
                let mut channels = lock(&self.channels);
                match channels.get(&key) {
                    Some(existing) if existing.sequence() >= record.sequence() => {
                        debug!(
                            identity = %record.identity(),
                            sequence = record.sequence(),
                            current = existing.sequence(),
                            "Ignored stale channel record"
                        );
                    }
                    _ => {
                        channels.insert(key, record);
                    }
                }
            }
        }
    }
}

/// Shared in-process DHT
#[derive(Clone)]
pub struct MemoryDht {
    inner: Arc<Inner>,
}

impl MemoryDht {
    fn with_mode(mode: Mode, capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                mode,
                capacity,
                blobs: Mutex::new(HashMap::new()),
                channels: Mutex::new(HashMap::new()),
                pending: Mutex::new(VecDeque::new()),
                log: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                extra_load: AtomicUsize::new(0),
            }),
        }
    }

    /// A DHT whose operations only complete when `complete_pending` is called
    pub fn manual(capacity: usize) -> Self {
        Self::with_mode(Mode::Manual, capacity)
    }

    /// A DHT whose operations complete on tokio tasks after `latency`
    pub fn timed(capacity: usize, latency: Duration) -> Self {
        Self::with_mode(Mode::Timed(latency), capacity)
    }

    /// Simulated traffic from other users of the shared network
    pub fn set_extra_load(&self, load: usize) {
        self.inner.extra_load.store(load, Ordering::Relaxed);
    }

    /// Run every parked operation in arrival order. Returns how many ran.
    pub fn complete_pending(&self) -> usize {
        let ops: Vec<PendingOp> = lock(&self.inner.pending).drain(..).collect();
        let count = ops.len();

        for op in ops {
            match op {
                PendingOp::Put(put) => self.inner.apply(put),
                PendingOp::Get(spec, on_done) => {
                    let result = self.inner.lookup(&spec);
                    on_done(result);
                }
            }
            self.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
        }

        count
    }

    /// Number of parked operations
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Every request/distribute call seen so far
    pub fn calls(&self) -> Vec<DhtCall> {
        lock(&self.inner.log).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.inner.log).clear();
    }

    /// Store a blob directly, bypassing the queue
    pub fn seed_blob(&self, bytes: Vec<u8>) -> ContentHash {
        let hash = ContentHash::of(&bytes);
        lock(&self.inner.blobs).insert(hash, bytes);
        hash
    }

    pub fn blob(&self, hash: &ContentHash) -> Option<Vec<u8>> {
        lock(&self.inner.blobs).get(hash).cloned()
    }

    pub fn channel(&self, identity: &PublicKey, salt: &[u8]) -> Option<ChannelRecord> {
        lock(&self.inner.channels)
            .get(&(identity.clone(), salt.to_vec()))
            .cloned()
    }

    fn submit(&self, op: PendingOp) {
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);

        let latency = match self.inner.mode {
            Mode::Manual => None,
            Mode::Timed(latency) => Some(latency),
        };

        let handle = match latency {
            Some(_) => tokio::runtime::Handle::try_current().ok(),
            None => None,
        };

        match (latency, handle) {
            (Some(latency), Some(handle)) => {
                let inner = Arc::clone(&self.inner);
                handle.spawn(async move {
                    tokio::time::sleep(latency).await;
                    match op {
                        PendingOp::Put(put) => inner.apply(put),
                        PendingOp::Get(spec, on_done) => {
                            let result = inner.lookup(&spec);
                            inner.in_flight.fetch_sub(1, Ordering::Relaxed);
                            on_done(result);
                            return;
                        }
                    }
                    inner.in_flight.fetch_sub(1, Ordering::Relaxed);
                });
            }
            (Some(_), None) => {
                warn!("Timed MemoryDht used outside a tokio runtime, parking operation");
                lock(&self.inner.pending).push_back(op);
            }
            (None, _) => lock(&self.inner.pending).push_back(op),
        }
    }
}

impl DhtTransport for MemoryDht {
    fn request(&self, spec: RequestSpec, on_done: FetchCallback) {
        lock(&self.inner.log).push(DhtCall::Request(spec.clone()));
        self.submit(PendingOp::Get(spec, on_done));
    }

    fn distribute(&self, put: PutSpec) {
        lock(&self.inner.log).push(DhtCall::Distribute(put.target()));
        self.submit(PendingOp::Put(put));
    }

    fn queue_occupation(&self) -> usize {
        self.inner.in_flight.load(Ordering::Relaxed) + self.inner.extra_load.load(Ordering::Relaxed)
    }

    fn capacity(&self) -> usize {
        self.inner.capacity
    }
}
