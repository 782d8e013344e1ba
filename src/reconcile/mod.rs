//! Last-write-wins reconciliation of user-owned collections.
//!
//! A collection is an id-keyed dictionary of [`Reconcilable`] records. Server
//! pushes are merged by timestamp, local writes are stamped with the current
//! time and flushed back in batches.

pub mod bookmark;
pub mod engine;

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use bookmark::Bookmark;
pub use engine::{CollectionSpec, ReconciliationEngine, ReferenceSpec};

/// A record owned by the user and synced by timestamp.
pub trait Reconcilable: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Unix milliseconds of the last write; the only tie-breaker.
    fn timestamp(&self) -> i64;

    fn touch(&mut self, timestamp: i64);

    /// Id of an entity this record points at, if any.
    fn reference(&self) -> Option<&str> {
        None
    }
}

/// A server push of records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RecordPush<R> {
    /// Full sync: the local dictionary is cleared before merging
    #[serde(default)]
    pub sync: bool,
    #[serde(default = "Vec::new")]
    pub objects: Vec<R>,
}

impl<R> RecordPush<R> {
    pub fn incremental(objects: Vec<R>) -> Self {
        Self {
            sync: false,
            objects,
        }
    }

    pub fn full(objects: Vec<R>) -> Self {
        Self {
            sync: true,
            objects,
        }
    }
}

/// What a merge changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub cleared: usize,
    pub inserted: usize,
    pub replaced: usize,
    pub ignored: usize,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        self.cleared + self.inserted + self.replaced > 0
    }
}

/// Merge pushed records into `local`: unknown ids are inserted, known ids
/// are replaced only by a strictly newer timestamp. `full_sync` clears
/// `local` first.
pub fn merge_records<R: Reconcilable>(
    local: &mut HashMap<String, R>,
    pushed: Vec<R>,
    full_sync: bool,
) -> MergeReport {
    let mut report = MergeReport::default();
    if full_sync {
        report.cleared = local.len();
        local.clear();
    }

    for record in pushed {
        match local.get(record.id()) {
            None => {
                local.insert(record.id().to_string(), record);
                report.inserted += 1;
            }
            Some(existing) if record.timestamp() > existing.timestamp() => {
                local.insert(record.id().to_string(), record);
                report.replaced += 1;
            }
            Some(_) => report.ignored += 1,
        }
    }
    report
}
