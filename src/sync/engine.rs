// Sync Engine - Public face of one node
//
// Owns the scheduler task. Every call is turned into a Command and answered
// by the task, so callers never touch engine state directly.

use crate::config::{ConfigError, EngineConfig};
use crate::dht::DhtTransport;
use crate::identity::{Keypair, PublicKey};
use crate::storage::{MessageStore, StoreError};
use crate::sync::assembler::MessageListener;
use crate::sync::protocol::ContentHash;
use crate::sync::scheduler::{Command, PublishError, SyncError, SyncScheduler};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Engine lifecycle errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine already running")]
    AlreadyRunning,

    #[error("Engine not running")]
    NotRunning,

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to load state: {0}")]
    Load(#[from] StoreError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Scheduler task failed: {0}")]
    TaskFailed(String),
}

struct Running {
    inbox: mpsc::UnboundedSender<Command>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// A gossip synchronization engine for one identity
pub struct SyncEngine {
    keypair: Keypair,
    config: EngineConfig,
    store: Arc<dyn MessageStore>,
    transport: Arc<dyn DhtTransport>,
    listener: Arc<dyn MessageListener>,
    seed: Option<u64>,
    running: Option<Running>,
}

impl SyncEngine {
    pub fn new(
        keypair: Keypair,
        config: EngineConfig,
        store: Arc<dyn MessageStore>,
        transport: Arc<dyn DhtTransport>,
        listener: Arc<dyn MessageListener>,
    ) -> Self {
        Self {
            keypair,
            config,
            store,
            transport,
            listener,
            seed: None,
            running: None,
        }
    }

    /// Seed peer selection (for reproducible runs)
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.as_ref().is_some_and(|r| !r.task.is_finished())
    }

    /// Load persisted state and spawn the scheduler task.
    ///
    /// Must be called inside a tokio runtime. Fails without spawning
    /// anything if the configuration is invalid or state cannot be loaded.
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.running.is_some() {
            return Err(EngineError::AlreadyRunning);
        }
        self.config.validate()?;

        let (mut scheduler, inbox_rx) = SyncScheduler::new(
            self.keypair.clone(),
            self.config.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.transport),
            Arc::clone(&self.listener),
        );
        if let Some(seed) = self.seed {
            scheduler = scheduler.with_rng_seed(seed);
        }
        scheduler.load()?;

        let inbox = scheduler.sender();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(scheduler.run(inbox_rx, shutdown_rx));

        info!(me = %self.public_key(), "Sync engine started");
        self.running = Some(Running { inbox, shutdown, task });
        Ok(())
    }

    /// Signal the scheduler and wait for its task to exit
    pub async fn stop(&mut self) -> Result<(), EngineError> {
        let running = self.running.take().ok_or(EngineError::NotRunning)?;
        let _ = running.shutdown.send(true);
        running
            .task
            .await
            .map_err(|e| EngineError::TaskFailed(e.to_string()))?;
        info!(me = %self.public_key(), "Sync engine stopped");
        Ok(())
    }

    /// Append a message to the conversation with `friend`.
    /// Returns the hash of the new message.
    pub async fn publish(
        &self,
        friend: &PublicKey,
        payload: Vec<u8>,
        content: Option<Vec<u8>>,
    ) -> Result<ContentHash, PublishError> {
        let running = self.running.as_ref().ok_or(PublishError::NotRunning)?;
        let (reply, rx) = oneshot::channel();
        running
            .inbox
            .send(Command::Publish {
                friend: friend.clone(),
                payload,
                content,
                reply,
            })
            .map_err(|_| PublishError::NotRunning)?;

        let result = rx.await.map_err(|_| PublishError::NotRunning)?;
        if let Err(e) = &result {
            warn!(friend = %friend, error = %e, "Publish refused");
        }
        result
    }

    /// Returns false if `friend` already was one
    pub async fn add_friend(&self, friend: &PublicKey) -> Result<bool, EngineError> {
        let friend = friend.clone();
        self.request(|reply| Command::AddFriend { friend, reply }).await
    }

    /// Returns false if `friend` was not a friend
    pub async fn remove_friend(&self, friend: &PublicKey) -> Result<bool, EngineError> {
        let friend = friend.clone();
        self.request(|reply| Command::RemoveFriend { friend, reply }).await
    }

    async fn request<F>(&self, build: F) -> Result<bool, EngineError>
    where
        F: FnOnce(oneshot::Sender<Result<bool, SyncError>>) -> Command,
    {
        let running = self.running.as_ref().ok_or(EngineError::NotRunning)?;
        let (reply, rx) = oneshot::channel();
        running
            .inbox
            .send(build(reply))
            .map_err(|_| EngineError::NotRunning)?;
        Ok(rx.await.map_err(|_| EngineError::NotRunning)??)
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(true);
        }
    }
}
