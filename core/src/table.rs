//! Key-value tables with a replayable change log.
//!
//! Each table is an in-memory map split into shards, one mutex per shard, so a
//! read-modify-write of one key is atomic. Every change is also appended to a
//! single sled tree (the change log) under a sequence number taken while the
//! shard lock is held; replaying the log in sequence order rebuilds the tables.
//!
//! In-memory values change as soon as a [`WorkUnit`] records them. If writing
//! the unit to the log fails, every value it wrote is rolled back unless another
//! unit has changed that key since.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::PipelineError;
use crate::persist::StateStore;
use crate::topic::partition_for;

pub const DOCUMENT_COUNT: &str = "document_count";
pub const DOCUMENT_FREQUENCY: &str = "document_frequency";
pub const TERM_OCCURRENCE: &str = "term_occurrence";
pub const MOST_IMPORTANT_SCORE: &str = "most_important_score";

const CHANGELOG_TREE: &str = "changelog";

#[derive(Debug, Serialize, Deserialize)]
struct ChangeEvent {
    table: String,
    key: String,
    value: Vec<u8>,
}

/// Append side of the change log.
#[derive(Clone, Debug)]
pub struct Changelog {
    tree: sled::Tree,
    next_seq: Arc<AtomicU64>,
}

impl Changelog {
    fn open(store: &StateStore) -> Result<Self, PipelineError> {
        let tree = store.tree(CHANGELOG_TREE)?;
        let next = match tree.last()? {
            Some((key, _)) => decode_seq(&key)? + 1,
            None => 0,
        };
        Ok(Self { tree, next_seq: Arc::new(AtomicU64::new(next)) })
    }

    /// Start collecting the changes caused by one message.
    pub fn begin(&self) -> WorkUnit {
        WorkUnit { changelog: self.clone(), batch: sled::Batch::default(), changes: 0, undo: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    fn event_bytes(&self, table: &str, key: &str, value: Vec<u8>) -> Result<(Vec<u8>, Vec<u8>), PipelineError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let event = bincode::serialize(&ChangeEvent { table: table.to_string(), key: key.to_string(), value })?;
        Ok((seq.to_be_bytes().to_vec(), event))
    }
}

fn decode_seq(key: &[u8]) -> Result<u64, PipelineError> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| PipelineError::Codec(Box::new(bincode::ErrorKind::Custom(format!("bad change log key of {} bytes", key.len())))))?;
    Ok(u64::from_be_bytes(bytes))
}

type Undo = Box<dyn FnOnce() + Send>;

/// The table changes of one message, written to the change log atomically.
pub struct WorkUnit {
    changelog: Changelog,
    batch: sled::Batch,
    changes: usize,
    undo: Vec<Undo>,
}

impl WorkUnit {
    fn record(&mut self, table: &str, key: &str, value: Vec<u8>, undo: Undo) -> Result<(), PipelineError> {
        let (seq, event) = self.changelog.event_bytes(table, key, value)?;
        self.batch.insert(seq, event);
        self.changes += 1;
        self.undo.push(undo);
        Ok(())
    }

    /// Number of changes recorded so far.
    pub fn changes(&self) -> usize {
        self.changes
    }

    /// Write the changes to the log. On failure the in-memory values are rolled back.
    pub fn commit(self) -> Result<usize, PipelineError> {
        if self.changes == 0 {
            return Ok(0);
        }
        let Self { changelog, batch, changes, undo } = self;
        if let Err(err) = changelog.tree.apply_batch(batch) {
            tracing::error!(changes, error = %err, "change log write failed, rolling back");
            rollback(undo);
            return Err(err.into());
        }
        Ok(changes)
    }

    /// Drop the unit without logging it and roll back its in-memory values.
    pub fn abort(self) -> usize {
        let changes = self.changes;
        rollback(self.undo);
        changes
    }
}

fn rollback(undo: Vec<Undo>) {
    for restore in undo.into_iter().rev() {
        restore();
    }
}

#[derive(Debug)]
struct TableInner<V> {
    name: &'static str,
    default: V,
    shards: Vec<Mutex<HashMap<String, V>>>,
}

impl<V: Clone> TableInner<V> {
    fn shard(&self, key: &str) -> &Mutex<HashMap<String, V>> {
        &self.shards[partition_for(key, self.shards.len())]
    }

    fn get(&self, key: &str) -> V {
        self.shard(key).lock().get(key).cloned().unwrap_or_else(|| self.default.clone())
    }

    fn entries(&self) -> Vec<(String, V)> {
        let mut all: Vec<(String, V)> =
            self.shards.iter().flat_map(|s| s.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect::<Vec<_>>()).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

/// A table with a declared default; unseen keys read as the default.
#[derive(Debug)]
pub struct Table<V> {
    inner: Arc<TableInner<V>>,
}

impl<V> Clone for Table<V> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<V> Table<V>
where
    V: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(name: &'static str, default: V, shards: usize) -> Self {
        let shards = (0..shards.max(1)).map(|_| Mutex::new(HashMap::new())).collect();
        Self { inner: Arc::new(TableInner { name, default, shards }) }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn get(&self, key: &str) -> V {
        self.inner.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.shard(key).lock().contains_key(key)
    }

    /// Atomic read-modify-write of one key. `f` sees the current value (or the
    /// default); a changed value is stored and recorded in `unit`.
    pub fn update<R>(&self, unit: &mut WorkUnit, key: &str, f: impl FnOnce(&mut V) -> R) -> Result<R, PipelineError> {
        let mut shard = self.inner.shard(key).lock();
        let previous = shard.get(key).cloned();
        let current = previous.clone().unwrap_or_else(|| self.inner.default.clone());
        let mut next = current.clone();
        let out = f(&mut next);
        if next != current {
            let undo = self.undo(key, previous, next.clone());
            unit.record(self.inner.name, key, bincode::serialize(&next)?, undo)?;
            shard.insert(key.to_string(), next);
        }
        Ok(out)
    }

    /// Store `value` unless the key already has an entry. Returns whether it was inserted.
    pub fn insert_if_absent(&self, unit: &mut WorkUnit, key: &str, value: V) -> Result<bool, PipelineError> {
        let mut shard = self.inner.shard(key).lock();
        if shard.contains_key(key) {
            return Ok(false);
        }
        let undo = self.undo(key, None, value.clone());
        unit.record(self.inner.name, key, bincode::serialize(&value)?, undo)?;
        shard.insert(key.to_string(), value);
        Ok(true)
    }

    /// Restores `previous` if the key still holds `written`.
    fn undo(&self, key: &str, previous: Option<V>, written: V) -> Undo {
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        Box::new(move || {
            let mut shard = inner.shard(&key).lock();
            if shard.get(&key) != Some(&written) {
                return;
            }
            match previous {
                Some(value) => {
                    shard.insert(key, value);
                }
                None => {
                    shard.remove(&key);
                }
            }
        })
    }

    /// All entries, sorted by key.
    pub fn entries(&self) -> Vec<(String, V)> {
        self.inner.entries()
    }

    pub fn len(&self) -> usize {
        self.inner.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reader(&self) -> TableReader<V> {
        TableReader { inner: Arc::clone(&self.inner) }
    }

    fn restore(&self, key: &str, bytes: &[u8]) -> Result<(), PipelineError> {
        let value: V = bincode::deserialize(bytes)?;
        self.inner.shard(key).lock().insert(key.to_string(), value);
        Ok(())
    }
}

/// Read-only view of a table owned by another stage.
pub struct TableReader<V> {
    inner: Arc<TableInner<V>>,
}

impl<V> Clone for TableReader<V> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<V: Clone> TableReader<V> {
    pub fn get(&self, key: &str) -> V {
        self.inner.get(key)
    }

    pub fn entries(&self) -> Vec<(String, V)> {
        self.inner.entries()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub applied: usize,
    pub skipped: usize,
}

/// The four pipeline tables and their shared change log.
#[derive(Clone, Debug)]
pub struct Tables {
    pub document_count: Table<u64>,
    pub document_frequency: Table<u64>,
    pub term_occurrence: Table<u64>,
    pub most_important_score: Table<f64>,
    pub changelog: Changelog,
}

impl Tables {
    /// Open the tables and rebuild them from the change log.
    pub fn open(store: &StateStore, shards: usize) -> Result<Self, PipelineError> {
        let tables = Self {
            document_count: Table::new(DOCUMENT_COUNT, 0, shards),
            document_frequency: Table::new(DOCUMENT_FREQUENCY, 0, shards),
            term_occurrence: Table::new(TERM_OCCURRENCE, 0, shards),
            most_important_score: Table::new(MOST_IMPORTANT_SCORE, 0.0, shards),
            changelog: Changelog::open(store)?,
        };
        let stats = tables.replay()?;
        tracing::info!(applied = stats.applied, skipped = stats.skipped, "replayed change log");
        Ok(tables)
    }

    fn replay(&self) -> Result<ReplayStats, PipelineError> {
        let mut stats = ReplayStats::default();
        for item in self.changelog.tree.iter() {
            let (seq, bytes) = item?;
            let event: ChangeEvent = match bincode::deserialize(&bytes) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(seq = ?decode_seq(&seq).ok(), error = %e, "skipping undecodable change log entry");
                    stats.skipped += 1;
                    continue;
                }
            };
            let restored = match event.table.as_str() {
                DOCUMENT_COUNT => self.document_count.restore(&event.key, &event.value),
                DOCUMENT_FREQUENCY => self.document_frequency.restore(&event.key, &event.value),
                TERM_OCCURRENCE => self.term_occurrence.restore(&event.key, &event.value),
                MOST_IMPORTANT_SCORE => self.most_important_score.restore(&event.key, &event.value),
                other => {
                    tracing::warn!(table = other, "skipping change for unknown table");
                    stats.skipped += 1;
                    continue;
                }
            };
            match restored {
                Ok(()) => stats.applied += 1,
                Err(e) => {
                    tracing::warn!(table = %event.table, key = %event.key, error = %e, "skipping unreadable value");
                    stats.skipped += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Rewrite the change log as one entry per live key. Must only run while no
    /// stage is processing messages.
    pub fn checkpoint(&self) -> Result<usize, PipelineError> {
        let mut batch = sled::Batch::default();
        for key in self.changelog.tree.iter().keys() {
            batch.remove(key?);
        }
        let mut written = 0;
        written += self.snapshot_into(&mut batch, &self.document_count)?;
        written += self.snapshot_into(&mut batch, &self.document_frequency)?;
        written += self.snapshot_into(&mut batch, &self.term_occurrence)?;
        written += self.snapshot_into(&mut batch, &self.most_important_score)?;
        self.changelog.tree.apply_batch(batch)?;
        self.changelog.tree.flush()?;
        tracing::info!(entries = written, "checkpointed change log");
        Ok(written)
    }

    fn snapshot_into<V>(&self, batch: &mut sled::Batch, table: &Table<V>) -> Result<usize, PipelineError>
    where
        V: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let entries = table.entries();
        for (key, value) in &entries {
            let (seq, event) = self.changelog.event_bytes(table.name(), key, bincode::serialize(value)?)?;
            batch.insert(seq, event);
        }
        Ok(entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> Tables {
        Tables::open(&StateStore::temporary().unwrap(), 4).unwrap()
    }

    #[test]
    fn unseen_keys_read_as_default() {
        let tables = tables();
        assert_eq!(tables.document_frequency.get("nobody"), 0);
        assert_eq!(tables.most_important_score.get("d1"), 0.0);
        assert!(!tables.most_important_score.contains("d1"));
    }

    #[test]
    fn update_returns_post_value_and_records_change() {
        let tables = tables();
        let mut unit = tables.changelog.begin();
        let first = tables.document_frequency.update(&mut unit, "Foo Bar", |c| { *c += 1; *c }).unwrap();
        let second = tables.document_frequency.update(&mut unit, "Foo Bar", |c| { *c += 1; *c }).unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(unit.commit().unwrap(), 2);
        assert_eq!(tables.changelog.len(), 2);
    }

    #[test]
    fn unchanged_values_are_not_recorded() {
        let tables = tables();
        let mut unit = tables.changelog.begin();
        tables.most_important_score.update(&mut unit, "d1", |best| if 0.0 > *best { *best = 0.0 }).unwrap();
        assert_eq!(unit.changes(), 0);
        assert!(!tables.most_important_score.contains("d1"));
    }

    #[test]
    fn insert_if_absent_keeps_existing_value() {
        let tables = tables();
        let mut unit = tables.changelog.begin();
        assert!(tables.most_important_score.insert_if_absent(&mut unit, "d1", 0.0).unwrap());
        tables.most_important_score.update(&mut unit, "d1", |best| *best = 0.5).unwrap();
        assert!(!tables.most_important_score.insert_if_absent(&mut unit, "d1", 0.0).unwrap());
        assert_eq!(tables.most_important_score.get("d1"), 0.5);
    }

    #[test]
    fn aborted_unit_restores_previous_values() {
        let tables = tables();
        let mut first = tables.changelog.begin();
        tables.document_frequency.update(&mut first, "Foo Bar", |c| *c += 1).unwrap();
        first.commit().unwrap();

        let mut unit = tables.changelog.begin();
        tables.document_frequency.update(&mut unit, "Foo Bar", |c| *c += 1).unwrap();
        tables.document_frequency.update(&mut unit, "Foo Bar", |c| *c += 1).unwrap();
        tables.most_important_score.insert_if_absent(&mut unit, "d1", 0.0).unwrap();
        assert_eq!(tables.document_frequency.get("Foo Bar"), 3);

        assert_eq!(unit.abort(), 3);
        assert_eq!(tables.document_frequency.get("Foo Bar"), 1);
        assert!(!tables.most_important_score.contains("d1"));
        assert_eq!(tables.changelog.len(), 1);
    }

    #[test]
    fn rollback_leaves_later_changes_alone() {
        let tables = tables();
        let mut unit = tables.changelog.begin();
        tables.document_count.update(&mut unit, crate::DOCUMENTS_KEY, |c| *c += 1).unwrap();

        let mut other = tables.changelog.begin();
        tables.document_count.update(&mut other, crate::DOCUMENTS_KEY, |c| *c += 1).unwrap();
        other.commit().unwrap();

        unit.abort();
        assert_eq!(tables.document_count.get(crate::DOCUMENTS_KEY), 2);
    }

    #[test]
    fn reader_sees_live_values() {
        let tables = tables();
        let reader = tables.document_count.reader();
        let mut unit = tables.changelog.begin();
        tables.document_count.update(&mut unit, crate::DOCUMENTS_KEY, |c| *c += 3).unwrap();
        assert_eq!(reader.get(crate::DOCUMENTS_KEY), 3);
    }
}
