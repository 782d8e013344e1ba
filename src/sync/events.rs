//! In-process event bus.
//!
//! Publishes externally visible state changes by topic. Synchronous handlers
//! are registered per topic with an identity for bulk removal; async
//! consumers can instead subscribe to the broadcast stream of all events.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;

use super::router::invoke_guarded;

/// Published after the bookmark collection changed.
pub const BOOKMARKS_UPDATED: &str = "bookmarks.updated";
/// Published by the host application once it finished initializing.
pub const APP_INITIALIZED: &str = "app.initialized";
/// Published whenever the channel changes state.
pub const CONNECTION_CHANGED: &str = "rtu.connection";

const CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub struct BusEvent {
    pub topic: String,
    pub args: Value,
}

pub type BusHandler = Arc<dyn Fn(&Value) -> Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct EventBus {
    handlers: Arc<RwLock<HashMap<String, Vec<(String, BusHandler)>>>>,
    tx: broadcast::Sender<BusEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            tx,
        }
    }

    /// Publish `args` under `topic`. Returns the number of synchronous
    /// handlers that ran.
    pub fn broadcast(&self, topic: &str, args: Value) -> usize {
        let handlers: Vec<(String, BusHandler)> = self
            .handlers
            .read()
            .get(topic)
            .cloned()
            .unwrap_or_default();

        for (identity, handler) in &handlers {
            invoke_guarded(identity, || handler(&args));
        }

        // No receivers is fine
        let _ = self.tx.send(BusEvent {
            topic: topic.to_string(),
            args,
        });
        handlers.len()
    }

    pub fn on<F>(&self, topic: &str, identity: &str, handler: F)
    where
        F: Fn(&Value) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .entry(topic.to_string())
            .or_default()
            .push((identity.to_string(), Arc::new(handler)));
    }

    pub fn off(&self, topic: &str, identity: &str) -> usize {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(topic) else {
            return 0;
        };
        let before = list.len();
        list.retain(|(id, _)| id != identity);
        let removed = before - list.len();
        if list.is_empty() {
            handlers.remove(topic);
        }
        removed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}
