use dashmap::DashMap;
use serde_json::Value;

/// Read-through cache of one entity kind (e.g. books), keyed by id.
pub trait EntityCache: Send + Sync {
    fn get(&self, id: &str) -> Option<Value>;
    fn upsert(&self, id: &str, entity: Value);
    fn remove(&self, id: &str) -> Option<Value>;
    fn contains(&self, id: &str) -> bool;
}

#[derive(Debug, Default)]
pub struct MemoryEntityCache {
    entities: DashMap<String, Value>,
}

impl MemoryEntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl EntityCache for MemoryEntityCache {
    fn get(&self, id: &str) -> Option<Value> {
        self.entities.get(id).map(|e| e.clone())
    }

    fn upsert(&self, id: &str, entity: Value) {
        self.entities.insert(id.to_string(), entity);
    }

    fn remove(&self, id: &str) -> Option<Value> {
        self.entities.remove(id).map(|(_, e)| e)
    }

    fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }
}
