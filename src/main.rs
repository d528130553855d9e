// dhtchat demo - a few nodes talking over an in-process DHT
//
// Every node befriends every other node, each sends a handful of messages
// to each friend, and deliveries are logged as they are assembled.

use clap::Parser;
use dhtchat::dht::MemoryDht;
use dhtchat::identity::PublicKey;
use dhtchat::storage::SledStore;
use dhtchat::sync::{MessageEnvelope, MessageListener, SyncEngine};
use dhtchat::EngineConfig;
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "dhtchat")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of simulated nodes
    #[arg(short, long, default_value = "3")]
    nodes: usize,

    /// Messages each node sends to each friend
    #[arg(short, long, default_value = "5")]
    messages: usize,

    /// Simulated DHT latency in milliseconds
    #[arg(short, long, default_value = "20")]
    latency_ms: u64,

    /// Operations the shared DHT accepts before it counts as full
    #[arg(long, default_value = "64")]
    capacity: usize,

    /// Minimum scheduler tick interval in milliseconds
    #[arg(long, default_value = "50")]
    tick_floor_ms: u64,

    /// How long to let the nodes sync, in seconds
    #[arg(short, long, default_value = "5")]
    duration_secs: u64,

    /// Keep node databases under this directory instead of temp dirs
    #[arg(long)]
    data_dir: Option<std::path::PathBuf>,
}

struct LoggingListener {
    me: PublicKey,
    delivered: AtomicUsize,
}

impl MessageListener for LoggingListener {
    fn on_new_message(&self, sender: &PublicKey, message: &MessageEnvelope) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        info!(
            to = %self.me,
            from = %sender,
            timestamp = message.timestamp(),
            text = %String::from_utf8_lossy(message.payload()),
            "delivered"
        );
    }

    fn on_msg_error(&self, reason: &str) {
        warn!(node = %self.me, reason, "sync error");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dhtchat=info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let dht = MemoryDht::timed(args.capacity, Duration::from_millis(args.latency_ms));
    let config = EngineConfig::default().with_tick_floor_ms(args.tick_floor_ms);
    config.validate()?;

    let mut engines = Vec::new();
    let mut listeners = Vec::new();
    for i in 0..args.nodes {
        let store = match &args.data_dir {
            Some(dir) => SledStore::open(dir.join(format!("node-{}", i)))?,
            None => SledStore::temporary()?,
        };
        let keypair = store.get_or_create_keypair()?;
        let listener = Arc::new(LoggingListener {
            me: keypair.public_key(),
            delivered: AtomicUsize::new(0),
        });

        let mut engine = SyncEngine::new(
            keypair,
            config.clone(),
            Arc::new(store),
            Arc::new(dht.clone()),
            listener.clone(),
        );
        engine.start()?;
        info!(node = i, identity = %engine.public_key(), "node up");

        engines.push(engine);
        listeners.push(listener);
    }

    let keys: Vec<PublicKey> = engines.iter().map(|e| e.public_key()).collect();
    for engine in &engines {
        for key in &keys {
            if *key != engine.public_key() {
                engine.add_friend(key).await?;
            }
        }
    }

    for round in 0..args.messages {
        for engine in &engines {
            for key in &keys {
                if *key == engine.public_key() {
                    continue;
                }
                let text = format!("hello #{} from {}", round, engine.public_key());
                if let Err(e) = engine.publish(key, text.into_bytes(), None).await {
                    warn!(error = %e, "publish refused");
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(args.tick_floor_ms)).await;
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        _ = tokio::time::sleep(Duration::from_secs(args.duration_secs)) => {}
    }

    let expected = args.messages * args.nodes.saturating_sub(1);
    for (engine, listener) in engines.iter_mut().zip(&listeners) {
        engine.stop().await?;
        info!(
            identity = %engine.public_key(),
            delivered = listener.delivered.load(Ordering::Relaxed),
            expected,
            "node down"
        );
    }

    Ok(())
}
