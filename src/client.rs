//! The assembled client: one router, one channel, one broker and the
//! bookmark collection, behind a single `open` / `start` / `stop` lifecycle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use serde_json::json;

use crate::config::RtuConfig;
use crate::http::{HttpTransport, ReqwestTransport};
use crate::protocol::OutboundRequest;
use crate::reconcile::{Bookmark, CollectionSpec, ReconciliationEngine};
use crate::storage::{KeyValueStore, MemoryEntityCache, MemoryStore, SqliteStore};
use crate::sync::events::APP_INITIALIZED;
use crate::sync::{
    ConnectionHooks, ConnectionManager, ConnectionState, Delivery, EventBus, MessageRouter,
    OutboundBroker, StartOutcome,
};

/// Identity under which the client registers its own handlers.
const CLIENT_IDENTITY: &str = "rtu-client";

pub struct RtuClient {
    config: RtuConfig,
    router: MessageRouter,
    bus: EventBus,
    connection: ConnectionManager,
    broker: Arc<OutboundBroker>,
    bookmarks: Arc<ReconciliationEngine<Bookmark>>,
    entities: Arc<MemoryEntityCache>,
}

impl RtuClient {
    /// Build a client with the storage named by `config.storage_path` and
    /// the reqwest transport.
    pub fn new(config: RtuConfig) -> Result<Self> {
        let storage: Arc<dyn KeyValueStore> = match &config.storage_path {
            Some(path) => Arc::new(
                SqliteStore::open(path)
                    .with_context(|| format!("storage: cannot open {}", path.display()))?,
            ),
            None => Arc::new(MemoryStore::new()),
        };
        let http = Arc::new(ReqwestTransport::new(config.request_timeout())?);
        Ok(Self::with_parts(config, storage, http))
    }

    pub fn with_parts(
        config: RtuConfig,
        storage: Arc<dyn KeyValueStore>,
        http: Arc<dyn HttpTransport>,
    ) -> Self {
        let router = MessageRouter::new().verbose(config.verbose);
        let bus = EventBus::new();
        let connection = ConnectionManager::new(config.clone(), router.clone(), bus.clone());
        let broker = Arc::new(OutboundBroker::new(&config, connection.clone(), http));
        let entities = Arc::new(MemoryEntityCache::new());

        let mut spec = CollectionSpec::bookmarks();
        spec.fetch_stagger = config.fetch_stagger();
        let bookmarks = Arc::new(
            ReconciliationEngine::new(spec, storage, broker.clone(), bus.clone())
                .with_reference_cache(entities.clone()),
        );

        Self {
            config,
            router,
            bus,
            connection,
            broker,
            bookmarks,
            entities,
        }
    }

    /// Restore persisted records and subscribe everything to the router.
    /// The channel itself starts on [`start`](Self::start) or when the host
    /// publishes `app.initialized`.
    pub async fn open(&self) -> Result<usize> {
        let restored = self.bookmarks.load().await?;
        self.bookmarks.attach(&self.router, CLIENT_IDENTITY);

        self.connection.set_hooks(
            ConnectionHooks::default()
                .on_open(|| {
                    tracing::info!("{} channel open", "✓".green());
                    Ok(())
                })
                .on_close(|code| {
                    tracing::info!(?code, "{} channel closed", "✗".red());
                    Ok(())
                }),
        );

        let connection = self.connection.clone();
        self.bus.on(APP_INITIALIZED, CLIENT_IDENTITY, move |_| {
            connection.start(false);
            Ok(())
        });

        tracing::info!(
            base = %self.config.base_url,
            device = %self.config.device_id,
            restored,
            "client opened"
        );
        Ok(restored)
    }

    pub fn start(&self) -> StartOutcome {
        self.connection.start(false)
    }

    /// Close the channel and drop every handler the client registered.
    pub fn stop(&self) {
        self.connection.stop();
        self.bookmarks.detach(&self.router, CLIENT_IDENTITY);
        self.bus.off(APP_INITIALIZED, CLIENT_IDENTITY);
    }

    /// Publish `app.initialized`, the host's signal to go online.
    pub fn announce_initialized(&self) {
        self.bus.broadcast(APP_INITIALIZED, json!({}));
    }

    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        self.connection.wait_ready(timeout).await
    }

    pub async fn send(&self, request: &OutboundRequest) -> Delivery {
        self.broker.send(request).await
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn config(&self) -> &RtuConfig {
        &self.config
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn broker(&self) -> &Arc<OutboundBroker> {
        &self.broker
    }

    pub fn bookmarks(&self) -> &Arc<ReconciliationEngine<Bookmark>> {
        &self.bookmarks
    }

    pub fn entities(&self) -> &Arc<MemoryEntityCache> {
        &self.entities
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::RecordingTransport;
    use crate::protocol::{builtin, MessageEnvelope};
    use crate::storage::EntityCache;

    fn client(base: &str) -> (RtuClient, RecordingTransport) {
        let transport = RecordingTransport::answering(json!({}));
        let client = RtuClient::with_parts(
            RtuConfig::new(base).unwrap(),
            Arc::new(MemoryStore::new()),
            Arc::new(transport.clone()),
        );
        (client, transport)
    }

    #[tokio::test]
    async fn test_open_wires_collection_handlers() {
        let (client, _) = client("http://api.test");
        assert_eq!(client.open().await.unwrap(), 0);

        assert_eq!(client.router().object_scope_len("Books", "Bookmarks"), 1);
        assert_eq!(client.router().object_scope_len("Books", "Items"), 1);
        assert_eq!(client.router().service_scope_len(builtin::SCHEDULER), 1);

        client.router().dispatch(&MessageEnvelope::new(
            "Books",
            "Items",
            "Push",
            json!({ "Id": "k1", "Title": "Dune" }),
        ));
        assert!(client.entities().contains("k1"));

        client.stop();
        assert_eq!(client.router().object_scope_len("Books", "Bookmarks"), 0);
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_app_initialized_starts_channel() {
        let (client, _) = client("ftp://api.test");
        client.open().await.unwrap();

        client.announce_initialized();
        assert_eq!(client.start(), StartOutcome::Unsupported);
        assert_eq!(client.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_send_without_channel_uses_http() {
        let (client, transport) = client("http://api.test");
        let delivery = client.send(&OutboundRequest::get("books", "bookmarks")).await;
        assert_eq!(delivery, Delivery::Fallback(json!({})));
        assert_eq!(transport.calls()[0].url.path(), "/books/bookmarks");
    }
}
