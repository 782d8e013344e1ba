use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

use super::{merge_records, MergeReport, Reconcilable, RecordPush};
use crate::protocol::{builtin, MessageEnvelope, OutboundRequest};
use crate::storage::{EntityCache, KeyValueStore};
use crate::sync::events::{EventBus, BOOKMARKS_UPDATED};
use crate::sync::{Delivery, MessageRouter, OutboundBroker};

/// Most records sent by one flush.
pub const FLUSH_BATCH_LIMIT: usize = 30;

/// Event name of server-side deletions.
pub const DELETE_EVENT: &str = "Delete";

/// Where the entities referenced by a collection's records live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSpec {
    pub service_name: String,
    pub object_name: String,
}

/// Wiring of one reconciled collection.
#[derive(Debug, Clone)]
pub struct CollectionSpec {
    pub service_name: String,
    pub object_name: String,
    /// Key of the persisted dictionary in durable storage
    pub storage_key: String,
    /// Event bus topic published after every change
    pub updated_topic: String,
    pub reference: Option<ReferenceSpec>,
    pub flush_limit: usize,
    /// Delay between consecutive lazy reference fetches
    pub fetch_stagger: Duration,
}

impl CollectionSpec {
    pub fn bookmarks() -> Self {
        Self {
            service_name: "Books".to_string(),
            object_name: "Bookmarks".to_string(),
            storage_key: "rtu.bookmarks".to_string(),
            updated_topic: BOOKMARKS_UPDATED.to_string(),
            reference: Some(ReferenceSpec {
                service_name: "Books".to_string(),
                object_name: "Items".to_string(),
            }),
            flush_limit: FLUSH_BATCH_LIMIT,
            fetch_stagger: Duration::from_millis(50),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PersistedCollection<R> {
    records: Vec<R>,
    #[serde(default)]
    dirty: Vec<String>,
}

struct State<R> {
    records: HashMap<String, R>,
    /// Ids written locally and not yet flushed
    dirty: HashSet<String>,
}

enum Command<R> {
    Push(RecordPush<R>),
    Delete(Vec<String>),
    Flush,
}

/// Keeps one user-owned collection consistent with server pushes.
///
/// Local calls and the inbound worker share the dictionary through an async
/// mutex; inbound pushes are applied one by one in arrival order by the
/// worker started in [`ReconciliationEngine::attach`].
pub struct ReconciliationEngine<R: Reconcilable> {
    spec: CollectionSpec,
    state: Mutex<State<R>>,
    storage: Arc<dyn KeyValueStore>,
    broker: Arc<OutboundBroker>,
    bus: EventBus,
    references: Option<Arc<dyn EntityCache>>,
    commands: parking_lot::Mutex<Option<mpsc::UnboundedSender<Command<R>>>>,
}

impl<R: Reconcilable> ReconciliationEngine<R> {
    pub fn new(
        spec: CollectionSpec,
        storage: Arc<dyn KeyValueStore>,
        broker: Arc<OutboundBroker>,
        bus: EventBus,
    ) -> Self {
        Self {
            spec,
            state: Mutex::new(State {
                records: HashMap::new(),
                dirty: HashSet::new(),
            }),
            storage,
            broker,
            bus,
            references: None,
            commands: parking_lot::Mutex::new(None),
        }
    }

    /// Resolve record references against `cache`, fetching missing entities.
    pub fn with_reference_cache(mut self, cache: Arc<dyn EntityCache>) -> Self {
        self.references = Some(cache);
        self
    }

    pub fn spec(&self) -> &CollectionSpec {
        &self.spec
    }

    /// Restore the dictionary from durable storage. Returns the record count.
    pub async fn load(&self) -> Result<usize> {
        let Some(text) = self.storage.get(&self.spec.storage_key).await? else {
            return Ok(0);
        };
        let persisted: PersistedCollection<R> = serde_json::from_str(&text)
            .with_context(|| format!("storage: corrupt collection {}", self.spec.storage_key))?;

        let records: HashMap<String, R> = persisted
            .records
            .into_iter()
            .map(|r| (r.id().to_string(), r))
            .collect();
        let dirty: HashSet<String> = persisted
            .dirty
            .into_iter()
            .filter(|id| records.contains_key(id))
            .collect();

        let mut state = self.state.lock().await;
        state.records = records;
        state.dirty = dirty;
        tracing::info!(
            collection = %self.spec.storage_key,
            records = state.records.len(),
            dirty = state.dirty.len(),
            "collection restored"
        );
        Ok(state.records.len())
    }

    /// Snapshot of all records, newest first.
    pub async fn records(&self) -> Vec<R> {
        let state = self.state.lock().await;
        newest_first(state.records.values().cloned().collect())
    }

    pub async fn get(&self, id: &str) -> Option<R> {
        self.state.lock().await.records.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Ids written locally since the last flush, sorted.
    pub async fn dirty_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().await.dirty.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Merge a server push. Persistence failures are logged; the in-memory
    /// dictionary keeps the merged state.
    pub async fn apply_push(&self, push: RecordPush<R>) -> MergeReport {
        let references: Vec<String> = push
            .objects
            .iter()
            .filter_map(|r| r.reference().map(str::to_string))
            .collect();

        let (report, count) = {
            let mut state = self.state.lock().await;
            let written: HashMap<String, i64> = state
                .dirty
                .iter()
                .filter_map(|id| state.records.get(id).map(|r| (id.clone(), r.timestamp())))
                .collect();
            let report = merge_records(&mut state.records, push.objects, push.sync);
            // A local write replaced by the server's copy has nothing left to send
            let State { records, dirty } = &mut *state;
            dirty.retain(|id| records.get(id).map(|r| r.timestamp()) == written.get(id).copied());
            if report.changed() {
                self.persist_logged(&state).await;
            }
            (report, state.records.len())
        };

        tracing::debug!(
            collection = %self.spec.storage_key,
            full_sync = push.sync,
            ?report,
            "push merged"
        );
        if report.changed() {
            self.announce(count);
        }
        self.resolve_references(references);
        report
    }

    /// Write a local record: stamped with the current time, persisted
    /// immediately and queued for the next flush.
    pub async fn upsert(&self, mut record: R) -> Result<R> {
        record.touch(chrono::Utc::now().timestamp_millis());
        let reference = record.reference().map(str::to_string);

        let count = {
            let mut state = self.state.lock().await;
            let id = record.id().to_string();
            let was_dirty = !state.dirty.insert(id.clone());
            let previous = state.records.insert(id.clone(), record.clone());
            if let Err(err) = self.persist(&state).await {
                match previous {
                    Some(previous) => state.records.insert(id.clone(), previous),
                    None => state.records.remove(&id),
                };
                if !was_dirty {
                    state.dirty.remove(&id);
                }
                return Err(err);
            }
            state.records.len()
        };

        self.announce(count);
        self.resolve_references(reference.into_iter().collect());
        Ok(record)
    }

    /// Delete locally and tell the server. The DELETE is sent even when the
    /// local write fails, so the next push cannot resurrect the record.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let (removed, count) = {
            let mut state = self.state.lock().await;
            state.dirty.remove(id);
            let removed = state.records.remove(id).is_some();
            if removed {
                self.persist_logged(&state).await;
            }
            (removed, state.records.len())
        };

        if removed {
            self.announce(count);
        }
        let request = OutboundRequest::new(&self.spec.service_name, &self.spec.object_name, "DELETE")
            .with_identity(id);
        self.broker.send(&request).await;
        Ok(removed)
    }

    /// Apply a server-side deletion. Absent ids are ignored.
    pub async fn apply_remote_delete(&self, ids: &[String]) -> usize {
        let (removed, count) = {
            let mut state = self.state.lock().await;
            let mut removed = 0;
            for id in ids {
                state.dirty.remove(id);
                if state.records.remove(id).is_some() {
                    removed += 1;
                }
            }
            if removed > 0 {
                self.persist_logged(&state).await;
            }
            (removed, state.records.len())
        };

        if removed > 0 {
            self.announce(count);
        }
        removed
    }

    /// Send up to `flush_limit` dirty records, newest first, in one request.
    /// Best effort: records that could not be sent at all stay dirty for the
    /// next flush; partial application on the server is reconciled by the
    /// next push. Returns the number of records sent.
    pub async fn flush(&self) -> usize {
        let batch = {
            let mut state = self.state.lock().await;
            let dirty: Vec<R> = state
                .dirty
                .iter()
                .filter_map(|id| state.records.get(id).cloned())
                .collect();
            let batch: Vec<R> = newest_first(dirty)
                .into_iter()
                .take(self.spec.flush_limit)
                .collect();
            for record in &batch {
                state.dirty.remove(record.id());
            }
            if !batch.is_empty() {
                self.persist_logged(&state).await;
            }
            batch
        };

        if batch.is_empty() {
            return 0;
        }

        let body = match serde_json::to_value(&batch) {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode flush batch");
                self.mark_dirty(&batch).await;
                return 0;
            }
        };
        let request = OutboundRequest::new(&self.spec.service_name, &self.spec.object_name, "PUT")
            .with_body(body);

        let sent = batch.len();
        match self.broker.send(&request).await {
            Delivery::Channel => {}
            Delivery::Fallback(response) => {
                if let Ok(push) = serde_json::from_value::<RecordPush<R>>(response) {
                    if !push.objects.is_empty() || push.sync {
                        self.apply_push(push).await;
                    }
                }
            }
            Delivery::Failed => {
                self.mark_dirty(&batch).await;
                return 0;
            }
        }
        tracing::info!(collection = %self.spec.storage_key, sent, "flushed local changes");
        sent
    }

    /// Subscribe to the collection's pushes and to the scheduler signal.
    /// Inbound work is queued to a worker task so it is applied in order.
    pub fn attach(self: &Arc<Self>, router: &MessageRouter, identity: &str) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command<R>>();
        *self.commands.lock() = Some(tx.clone());

        let engine: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                match command {
                    Command::Push(push) => {
                        engine.apply_push(push).await;
                    }
                    Command::Delete(ids) => {
                        engine.apply_remote_delete(&ids).await;
                    }
                    Command::Flush => {
                        engine.flush().await;
                    }
                }
            }
        });

        let pushes = tx.clone();
        router.register_object_scope(
            &self.spec.service_name,
            &self.spec.object_name,
            identity,
            move |envelope| {
                let command = if envelope.event_name() == DELETE_EVENT {
                    Command::Delete(deleted_ids(&envelope.payload))
                } else {
                    let push = serde_json::from_value::<RecordPush<R>>(envelope.payload.clone())
                        .context("invalid collection push")?;
                    Command::Push(push)
                };
                pushes
                    .send(command)
                    .map_err(|_| anyhow::anyhow!("collection worker stopped"))
            },
        );

        router.register_service_scope(builtin::SCHEDULER, identity, move |_| {
            tx.send(Command::Flush)
                .map_err(|_| anyhow::anyhow!("collection worker stopped"))
        });

        if let (Some(reference), Some(cache)) = (&self.spec.reference, &self.references) {
            let cache = cache.clone();
            router.register_object_scope(
                &reference.service_name,
                &reference.object_name,
                identity,
                move |envelope| {
                    cache_entities(cache.as_ref(), envelope);
                    Ok(())
                },
            );
        }
    }

    /// Undo [`attach`](Self::attach) for `identity`.
    pub fn detach(&self, router: &MessageRouter, identity: &str) {
        router.unregister(identity, &self.spec.service_name, Some(&self.spec.object_name));
        router.unregister(identity, builtin::SCHEDULER, None);
        if let Some(reference) = &self.spec.reference {
            router.unregister(identity, &reference.service_name, Some(&reference.object_name));
        }
        self.commands.lock().take();
    }

    /// Queue a flush on the worker, or run it inline when not attached.
    pub async fn request_flush(&self) -> usize {
        let queued = self
            .commands
            .lock()
            .as_ref()
            .map(|tx| tx.send(Command::Flush).is_ok())
            .unwrap_or(false);
        if queued {
            0
        } else {
            self.flush().await
        }
    }

    async fn mark_dirty(&self, batch: &[R]) {
        let mut state = self.state.lock().await;
        for record in batch {
            if state.records.contains_key(record.id()) {
                state.dirty.insert(record.id().to_string());
            }
        }
        self.persist_logged(&state).await;
    }

    async fn persist(&self, state: &State<R>) -> Result<()> {
        let mut dirty: Vec<String> = state.dirty.iter().cloned().collect();
        dirty.sort();
        let mut records: Vec<R> = state.records.values().cloned().collect();
        records.sort_by(|a, b| a.id().cmp(b.id()));

        let text = serde_json::to_string(&PersistedCollection { records, dirty })
            .context("storage: failed to encode collection")?;
        self.storage
            .set(&self.spec.storage_key, text)
            .await
            .with_context(|| format!("storage: failed to persist {}", self.spec.storage_key))
    }

    async fn persist_logged(&self, state: &State<R>) {
        if let Err(err) = self.persist(state).await {
            tracing::warn!(error = %format!("{err:#}"), "keeping collection in memory only");
        }
    }

    fn announce(&self, count: usize) {
        self.bus.broadcast(
            &self.spec.updated_topic,
            json!({ "collection": self.spec.storage_key, "count": count }),
        );
    }

    /// Fetch referenced entities missing from the cache, one request per
    /// entity, spaced by `fetch_stagger`.
    fn resolve_references(&self, ids: Vec<String>) {
        let (Some(reference), Some(cache)) = (&self.spec.reference, &self.references) else {
            return;
        };

        let mut seen = HashSet::new();
        let missing: Vec<String> = ids
            .into_iter()
            .filter(|id| !cache.contains(id) && seen.insert(id.clone()))
            .collect();

        for (index, id) in missing.into_iter().enumerate() {
            let delay = self.spec.fetch_stagger * index as u32;
            let broker = self.broker.clone();
            let cache = cache.clone();
            let request = OutboundRequest::get(&reference.service_name, &reference.object_name)
                .with_identity(id.clone());

            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if cache.contains(&id) {
                    return;
                }
                if let Delivery::Fallback(entity) = broker.send(&request).await {
                    if !entity.is_null() {
                        cache.upsert(&id, entity);
                    }
                }
            });
        }
    }
}

fn newest_first<R: Reconcilable>(mut records: Vec<R>) -> Vec<R> {
    records.sort_by(|a, b| {
        b.timestamp()
            .cmp(&a.timestamp())
            .then_with(|| a.id().cmp(b.id()))
    });
    records
}

fn deleted_ids(payload: &Value) -> Vec<String> {
    if let Some(id) = payload.get("Id").and_then(Value::as_str) {
        return vec![id.to_string()];
    }
    payload
        .get("Ids")
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Store pushed entities (`{"Id": …}` or `{"Objects": [{"Id": …}]}`).
fn cache_entities(cache: &dyn EntityCache, envelope: &MessageEnvelope) {
    let payload = &envelope.payload;
    let entities = match payload.get("Objects").and_then(Value::as_array) {
        Some(objects) => objects.iter().collect::<Vec<_>>(),
        None => vec![payload],
    };
    for entity in entities {
        if let Some(id) = entity.get("Id").and_then(Value::as_str) {
            cache.upsert(id, entity.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RtuConfig;
    use crate::http::testing::RecordingTransport;
    use crate::reconcile::Bookmark;
    use crate::storage::{MemoryEntityCache, MemoryStore};
    use crate::sync::ConnectionManager;

    struct Fixture {
        engine: Arc<ReconciliationEngine<Bookmark>>,
        transport: RecordingTransport,
        storage: Arc<MemoryStore>,
        cache: Arc<MemoryEntityCache>,
        router: MessageRouter,
    }

    fn fixture(response: Value) -> Fixture {
        let config = RtuConfig::new("http://api.test").unwrap();
        let router = MessageRouter::new();
        let bus = EventBus::new();
        let connection = ConnectionManager::new(config.clone(), router.clone(), bus.clone());
        let transport = RecordingTransport::answering(response);
        let broker = Arc::new(OutboundBroker::new(&config, connection, Arc::new(transport.clone())));
        let storage = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryEntityCache::new());

        let mut spec = CollectionSpec::bookmarks();
        spec.fetch_stagger = Duration::from_millis(1);
        let engine = Arc::new(
            ReconciliationEngine::new(spec, storage.clone(), broker, bus)
                .with_reference_cache(cache.clone()),
        );
        Fixture {
            engine,
            transport,
            storage,
            cache,
            router,
        }
    }

    fn mark(id: &str, book: &str, ts: i64) -> Bookmark {
        let mut bookmark = Bookmark::new(id, book, format!("loc-{ts}"), 0.1);
        bookmark.timestamp = ts;
        bookmark
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_upsert_persists_and_marks_dirty() {
        let fx = fixture(Value::Null);
        fx.cache.upsert("k1", json!({ "Id": "k1" }));

        let saved = fx.engine.upsert(Bookmark::new("b1", "k1", "cfi", 0.3)).await.unwrap();

        assert!(saved.timestamp > 0);
        assert_eq!(fx.engine.dirty_ids().await, vec!["b1".to_string()]);
        let stored = fx.storage.get("rtu.bookmarks").await.unwrap().unwrap();
        assert!(stored.contains("\"b1\""));
        assert!(fx.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_load_restores_records_and_dirty_flags() {
        let fx = fixture(Value::Null);
        fx.cache.upsert("k1", json!({}));
        fx.engine.upsert(Bookmark::new("b1", "k1", "a", 0.1)).await.unwrap();
        fx.engine.apply_push(RecordPush::incremental(vec![mark("b2", "k1", 5)])).await;

        let config = RtuConfig::new("http://api.test").unwrap();
        let connection = ConnectionManager::new(config.clone(), MessageRouter::new(), EventBus::new());
        let broker = Arc::new(OutboundBroker::new(&config, connection, Arc::new(RecordingTransport::default())));
        let restored: ReconciliationEngine<Bookmark> = ReconciliationEngine::new(
            CollectionSpec::bookmarks(),
            fx.storage.clone(),
            broker,
            EventBus::new(),
        );

        assert_eq!(restored.load().await.unwrap(), 2);
        assert_eq!(restored.dirty_ids().await, vec!["b1".to_string()]);
    }

    #[tokio::test]
    async fn test_local_write_wins_until_newer_push() {
        let fx = fixture(Value::Null);
        fx.cache.upsert("k1", json!({}));
        let local = fx.engine.upsert(Bookmark::new("b1", "k1", "mine", 0.4)).await.unwrap();

        fx.engine
            .apply_push(RecordPush::incremental(vec![mark("b1", "k1", local.timestamp - 1)]))
            .await;
        assert_eq!(fx.engine.get("b1").await.unwrap().location, "mine");

        fx.engine
            .apply_push(RecordPush::incremental(vec![mark("b1", "k1", local.timestamp + 1)]))
            .await;
        assert_eq!(
            fx.engine.get("b1").await.unwrap().location,
            format!("loc-{}", local.timestamp + 1)
        );
    }

    #[tokio::test]
    async fn test_flush_sends_thirty_newest_dirty_records() {
        let fx = fixture(json!({}));
        fx.cache.upsert("k1", json!({}));
        for i in 0..35 {
            fx.engine.upsert(Bookmark::new(format!("b{i:02}"), "k1", "x", 0.0)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert_eq!(fx.engine.flush().await, FLUSH_BATCH_LIMIT);

        let calls = fx.transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].verb, "PUT");
        assert_eq!(calls[0].url.path(), "/Books/Bookmarks");
        let sent: Vec<Bookmark> = serde_json::from_str(calls[0].body.as_deref().unwrap()).unwrap();
        assert_eq!(sent.len(), FLUSH_BATCH_LIMIT);
        assert_eq!(sent[0].id, "b34");
        assert!(sent.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
        assert_eq!(fx.engine.dirty_ids().await.len(), 5);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_records_dirty() {
        let fx = fixture(Value::Null);
        *fx.transport.response.lock() = None;
        fx.cache.upsert("k1", json!({}));
        fx.engine.upsert(Bookmark::new("b1", "k1", "x", 0.0)).await.unwrap();

        assert_eq!(fx.engine.flush().await, 0);
        assert_eq!(fx.engine.dirty_ids().await, vec!["b1".to_string()]);
    }

    #[tokio::test]
    async fn test_remote_delete_is_idempotent() {
        let fx = fixture(Value::Null);
        fx.cache.upsert("k1", json!({}));
        fx.engine.apply_push(RecordPush::incremental(vec![mark("b1", "k1", 1)])).await;

        assert_eq!(fx.engine.apply_remote_delete(&["b1".to_string()]).await, 1);
        assert_eq!(fx.engine.apply_remote_delete(&["b1".to_string()]).await, 0);
        assert!(fx.engine.is_empty().await);
    }

    #[tokio::test]
    async fn test_local_remove_notifies_server() {
        let fx = fixture(Value::Null);
        fx.cache.upsert("k1", json!({}));
        fx.engine.upsert(Bookmark::new("b1", "k1", "x", 0.0)).await.unwrap();

        assert!(fx.engine.remove("b1").await.unwrap());

        let calls = fx.transport.calls();
        assert_eq!(calls[0].verb, "DELETE");
        assert_eq!(calls[0].url.path(), "/Books/Bookmarks/b1");
        assert!(fx.engine.dirty_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_references_are_fetched() {
        let fx = fixture(json!({ "Id": "k9", "Title": "Dune" }));

        fx.engine
            .apply_push(RecordPush::incremental(vec![mark("b1", "k9", 1), mark("b2", "k9", 2)]))
            .await;

        let cache = fx.cache.clone();
        eventually(|| {
            let cache = cache.clone();
            async move { cache.contains("k9") }
        })
        .await;
        let gets: Vec<_> = fx
            .transport
            .calls()
            .into_iter()
            .filter(|c| c.verb == "GET")
            .collect();
        assert_eq!(gets.len(), 1);
        assert_eq!(gets[0].url.path(), "/Books/Items/k9");
    }

    #[tokio::test]
    async fn test_attached_engine_follows_router() {
        let fx = fixture(json!({}));
        fx.engine.attach(&fx.router, "bookmarks");
        fx.cache.upsert("k1", json!({}));

        fx.router.dispatch(&MessageEnvelope::new(
            "Books",
            "Bookmarks",
            "Push",
            json!({ "Sync": false, "Objects": [ { "Id": "b1", "BookId": "k1", "Timestamp": 7 } ] }),
        ));
        let engine = fx.engine.clone();
        eventually(|| {
            let engine = engine.clone();
            async move { engine.len().await == 1 }
        })
        .await;

        fx.engine.upsert(Bookmark::new("b2", "k1", "y", 0.2)).await.unwrap();
        fx.router
            .dispatch(&MessageEnvelope::new(builtin::SCHEDULER, "", "", Value::Null));
        let transport = fx.transport.clone();
        eventually(|| {
            let transport = transport.clone();
            async move { transport.calls().iter().any(|c| c.verb == "PUT") }
        })
        .await;

        fx.router.dispatch(&MessageEnvelope::new(
            "Books",
            "Bookmarks",
            DELETE_EVENT,
            json!({ "Ids": ["b1", "missing"] }),
        ));
        let engine = fx.engine.clone();
        eventually(|| {
            let engine = engine.clone();
            async move { engine.get("b1").await.is_none() }
        })
        .await;

        fx.router.dispatch(&MessageEnvelope::new(
            "Books",
            "Items",
            "Push",
            json!({ "Objects": [ { "Id": "k2", "Title": "Emma" } ] }),
        ));
        assert!(fx.cache.contains("k2"));

        fx.engine.detach(&fx.router, "bookmarks");
        assert_eq!(fx.router.object_scope_len("Books", "Bookmarks"), 0);
        assert_eq!(fx.router.service_scope_len(builtin::SCHEDULER), 0);
    }

    #[tokio::test]
    async fn test_empty_full_sync_clears_local_dictionary() {
        let fx = fixture(Value::Null);
        fx.cache.upsert("k1", json!({}));
        fx.engine.upsert(Bookmark::new("b1", "k1", "x", 0.0)).await.unwrap();

        let report = fx.engine.apply_push(RecordPush::full(Vec::new())).await;

        assert_eq!(report.cleared, 1);
        assert!(fx.engine.is_empty().await);
        assert!(fx.engine.dirty_ids().await.is_empty());
    }

    struct FailingStore;

    impl KeyValueStore for FailingStore {
        fn get(&self, _key: &str) -> futures::future::BoxFuture<'_, Result<Option<String>>> {
            Box::pin(async { Ok(None) })
        }

        fn set(&self, _key: &str, _value: String) -> futures::future::BoxFuture<'_, Result<()>> {
            Box::pin(async { Err(anyhow::anyhow!("disk full")) })
        }
    }

    fn engine_without_disk() -> (ReconciliationEngine<Bookmark>, RecordingTransport) {
        let config = RtuConfig::new("http://api.test").unwrap();
        let connection = ConnectionManager::new(config.clone(), MessageRouter::new(), EventBus::new());
        let transport = RecordingTransport::answering(json!({}));
        let broker = Arc::new(OutboundBroker::new(&config, connection, Arc::new(transport.clone())));
        let engine = ReconciliationEngine::new(
            CollectionSpec::bookmarks(),
            Arc::new(FailingStore),
            broker,
            EventBus::new(),
        );
        (engine, transport)
    }

    #[tokio::test]
    async fn test_failed_upsert_leaves_no_trace() {
        let (engine, _transport) = engine_without_disk();
        engine.apply_push(RecordPush::incremental(vec![mark("b1", "", 5)])).await;

        assert!(engine.upsert(Bookmark::new("b1", "", "edited", 0.9)).await.is_err());
        assert!(engine.upsert(Bookmark::new("b2", "", "new", 0.2)).await.is_err());

        assert_eq!(engine.get("b1").await.unwrap().location, "loc-5");
        assert!(engine.get("b2").await.is_none());
        assert!(engine.dirty_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_reaches_server_when_disk_fails() {
        let (engine, transport) = engine_without_disk();
        engine.apply_push(RecordPush::incremental(vec![mark("b1", "", 5)])).await;

        assert!(engine.remove("b1").await.unwrap());

        assert!(engine.get("b1").await.is_none());
        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].verb, "DELETE");
        assert_eq!(calls[0].url.path(), "/Books/Bookmarks/b1");
    }

    #[tokio::test]
    async fn test_newer_push_clears_dirty_flag() {
        let fx = fixture(Value::Null);
        fx.cache.upsert("k1", json!({}));
        let local = fx.engine.upsert(Bookmark::new("b1", "k1", "mine", 0.4)).await.unwrap();
        fx.engine.upsert(Bookmark::new("b2", "k1", "also mine", 0.5)).await.unwrap();

        fx.engine
            .apply_push(RecordPush::incremental(vec![mark("b1", "k1", local.timestamp + 1)]))
            .await;

        assert_eq!(fx.engine.dirty_ids().await, vec!["b2".to_string()]);
    }
}
