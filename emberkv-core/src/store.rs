//! The store engine: three independent namespaces behind three independent
//! reader-writer locks, a persistence queue per namespace, and one change
//! observer.
//!
//! Every mutating operation follows the same order: take the namespace
//! write lock, mutate, snapshot old/new, release the lock, send the
//! persistence op, invoke the observer. No lock is ever held across a
//! queue send or filesystem I/O.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::event::{ChangeEvent, ChangeObserver};
use crate::persist::{self, DbPaths, PersistOp, PersistWriter, PERSIST_QUEUE_DEPTH};
use crate::record::{
    deadline_after, now_nanos, HashRecord, Item, ListRecord, OpKind, ScalarRecord, EXPIRE_FOREVER,
};
use crate::sweeper;

/// Longest key accepted by mutating operations.
const MAX_KEY_LENGTH: usize = 1024;

/// Keys double as file names, so anything a filesystem would reinterpret is
/// rejected rather than escaped.
fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidArgument("key must not be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(StoreError::InvalidArgument(format!(
            "key exceeds maximum length of {MAX_KEY_LENGTH} bytes"
        )));
    }
    if key == "." || key == ".." {
        return Err(StoreError::InvalidArgument(format!(
            "key {key:?} is not usable as a file name"
        )));
    }
    if key.chars().any(|c| c == '/' || c == '\\' || c.is_control()) {
        return Err(StoreError::InvalidArgument(format!(
            "key {key:?} is not usable as a file name"
        )));
    }
    Ok(())
}

pub(crate) struct Shared {
    scalars: RwLock<HashMap<String, ScalarRecord>>,
    hashes: RwLock<HashMap<String, HashRecord>>,
    lists: RwLock<HashMap<String, ListRecord>>,

    observer: RwLock<Option<Arc<dyn ChangeObserver>>>,

    scalar_tx: mpsc::Sender<PersistOp<ScalarRecord>>,
    hash_tx: mpsc::Sender<PersistOp<HashRecord>>,
    list_tx: mpsc::Sender<PersistOp<ListRecord>>,

    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Persistent in-memory key-value store with three value shapes: scalar
/// strings, field maps (hashes), and ordered string lists.
///
/// Cloning is cheap; clones share the same state, background persistence
/// writer, and expiry sweeper.
///
/// # Example
///
/// ```rust,no_run
/// use emberkv_core::{Store, StoreConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), emberkv_core::StoreError> {
///     let store = Store::open(StoreConfig::default()).await?;
///
///     store.put("user:1", "ada", 60).await?;
///     assert_eq!(store.get("user:1")?, "ada");
///
///     store.shutdown().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Store {
    inner: Arc<Shared>,
}

impl Store {
    /// Opens the database under `config.db_root`, loads every decodable
    /// on-disk record, and starts the persistence writer and the expiry
    /// sweeper.
    pub async fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let paths = DbPaths::new(&config.db_root);
        paths.create_dirs().await?;

        let loaded = persist::load_db(&paths).await;

        let (scalar_tx, scalar_rx) = mpsc::channel(PERSIST_QUEUE_DEPTH);
        let (hash_tx, hash_rx) = mpsc::channel(PERSIST_QUEUE_DEPTH);
        let (list_tx, list_rx) = mpsc::channel(PERSIST_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let writer = PersistWriter::new(paths, scalar_rx, hash_rx, list_rx, shutdown_rx.clone());
        let writer_task = tokio::spawn(writer.run());

        let store = Store {
            inner: Arc::new(Shared {
                scalars: RwLock::new(loaded.scalars),
                hashes: RwLock::new(loaded.hashes),
                lists: RwLock::new(loaded.lists),
                observer: RwLock::new(None),
                scalar_tx,
                hash_tx,
                list_tx,
                shutdown_tx,
                tasks: Mutex::new(vec![writer_task]),
            }),
        };

        let sweeper_task = tokio::spawn(sweeper::run(
            Arc::downgrade(&store.inner),
            config.sweep_interval,
            shutdown_rx,
        ));
        store.inner.tasks.lock().push(sweeper_task);

        Ok(store)
    }

    pub(crate) fn from_shared(inner: Arc<Shared>) -> Self {
        Self { inner }
    }

    /// Signals the background tasks to stop and waits for the persistence
    /// queue to drain. Safe to call more than once.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Registers the change observer. A second registration replaces the
    /// first; only one observer is active at a time.
    pub fn set_observer(&self, observer: Arc<dyn ChangeObserver>) {
        *self.inner.observer.write() = Some(observer);
    }

    fn notify(&self, op: OpKind, old: Option<Item>, new: Option<Item>) {
        let observer = self.inner.observer.read().clone();
        let Some(observer) = observer else { return };
        let event = ChangeEvent { op, old, new };
        // A panicking observer must not take the mutator down with it.
        if panic::catch_unwind(AssertUnwindSafe(|| observer.on_change(event))).is_err() {
            error!("change observer panicked; event dropped");
        }
    }

    async fn enqueue_scalar(&self, op: PersistOp<ScalarRecord>) {
        if self.inner.scalar_tx.send(op).await.is_err() {
            error!("persistence writer is gone; scalar op dropped");
        }
    }

    async fn enqueue_hash(&self, op: PersistOp<HashRecord>) {
        if self.inner.hash_tx.send(op).await.is_err() {
            error!("persistence writer is gone; hash op dropped");
        }
    }

    async fn enqueue_list(&self, op: PersistOp<ListRecord>) {
        if self.inner.list_tx.send(op).await.is_err() {
            error!("persistence writer is gone; list op dropped");
        }
    }

    // ------------------------------------------------------------------
    // scalars
    // ------------------------------------------------------------------

    /// Upserts a scalar. `expire_seconds == 0` stores the value forever;
    /// otherwise it expires `expire_seconds` from now.
    pub async fn put(&self, key: &str, data: &str, expire_seconds: i64) -> Result<(), StoreError> {
        validate_key(key)?;
        let record = ScalarRecord {
            key: key.to_string(),
            data: data.to_string(),
            expire_at: deadline_after(expire_seconds),
        };

        let (old, dirty) = {
            let mut scalars = self.inner.scalars.write();
            let old = scalars.insert(key.to_string(), record.clone());
            let dirty = scalar_put_is_dirty(old.as_ref(), &record);
            (old, dirty)
        };

        debug!(key, expire_seconds, "put");
        if dirty {
            self.enqueue_scalar(PersistOp {
                kind: OpKind::Add,
                record: record.clone(),
            })
            .await;
        }
        self.notify(OpKind::Add, old.map(Item::Scalar), Some(Item::Scalar(record)));
        Ok(())
    }

    /// Fetches a scalar. Expired records read as missing; the sweeper is
    /// the one that actually removes them.
    pub fn get(&self, key: &str) -> Result<String, StoreError> {
        let scalars = self.inner.scalars.read();
        match scalars.get(key) {
            Some(record) if !record.is_expired(now_nanos()) => Ok(record.data.clone()),
            _ => Err(StoreError::NotFound(format!("no value for key {key:?}"))),
        }
    }

    /// Removes a scalar. Returns whether the key existed; deleting an
    /// absent key is a silent no-op.
    pub async fn delete(&self, key: &str) -> bool {
        let old = self.inner.scalars.write().remove(key);
        let Some(old) = old else { return false };

        debug!(key, "delete");
        let tombstone = ScalarRecord {
            key: key.to_string(),
            data: String::new(),
            expire_at: EXPIRE_FOREVER,
        };
        self.enqueue_scalar(PersistOp {
            kind: OpKind::Del,
            record: tombstone,
        })
        .await;
        self.notify(OpKind::Del, Some(Item::Scalar(old)), None);
        true
    }

    // ------------------------------------------------------------------
    // hashes
    // ------------------------------------------------------------------

    /// Merges `names`/`values` pairs into the hash at `hkey`, creating it
    /// if absent. The hash's expiry is replaced (not merged) on every call.
    pub async fn hm_put(
        &self,
        hkey: &str,
        names: Vec<String>,
        values: Vec<String>,
        expire_seconds: i64,
    ) -> Result<(), StoreError> {
        validate_key(hkey)?;
        if names.len() != values.len() {
            return Err(StoreError::InvalidArgument(format!(
                "hash {hkey:?}: {} field names for {} values",
                names.len(),
                values.len()
            )));
        }

        let (old, record) = {
            let mut hashes = self.inner.hashes.write();
            let old = hashes.get(hkey).cloned();
            let mut record = old.clone().unwrap_or_else(|| HashRecord {
                key: hkey.to_string(),
                fields: HashMap::new(),
                expire_at: EXPIRE_FOREVER,
            });
            record.expire_at = deadline_after(expire_seconds);
            for (name, value) in names.into_iter().zip(values) {
                record.fields.insert(name, value);
            }
            hashes.insert(hkey.to_string(), record.clone());
            (old, record)
        };

        debug!(key = hkey, expire_seconds, "hash put");
        self.enqueue_hash(PersistOp {
            kind: OpKind::Add,
            record: record.clone(),
        })
        .await;
        self.notify(OpKind::Add, old.map(Item::Hash), Some(Item::Hash(record)));
        Ok(())
    }

    /// Returns the full field map of the hash, serialized as JSON.
    pub fn hm_get(&self, hkey: &str) -> Result<String, StoreError> {
        let hashes = self.inner.hashes.read();
        let record = hashes
            .get(hkey)
            .filter(|r| !r.is_expired(now_nanos()))
            .ok_or_else(|| StoreError::NotFound(format!("no hash for key {hkey:?}")))?;
        Ok(serde_json::to_string(&record.fields)?)
    }

    /// Returns a single field of the hash. A missing hash and a missing
    /// field are reported distinctly; both are NotFound.
    pub fn hm_get_member(&self, hkey: &str, field: &str) -> Result<String, StoreError> {
        let hashes = self.inner.hashes.read();
        let record = hashes
            .get(hkey)
            .filter(|r| !r.is_expired(now_nanos()))
            .ok_or_else(|| StoreError::NotFound(format!("no hash for key {hkey:?}")))?;
        record
            .fields
            .get(field)
            .cloned()
            .ok_or_else(|| {
                StoreError::NotFound(format!("hash {hkey:?} has no field {field:?}"))
            })
    }

    /// Removes one field. The hash itself must exist; removing an absent
    /// field is a no-op.
    pub async fn hm_del_member(&self, hkey: &str, field: &str) -> Result<(), StoreError> {
        let (old, record) = {
            let mut hashes = self.inner.hashes.write();
            let Some(current) = hashes.get(hkey) else {
                return Err(StoreError::NotFound(format!("no hash for key {hkey:?}")));
            };
            if !current.fields.contains_key(field) {
                return Ok(());
            }
            let old = current.clone();
            let mut record = old.clone();
            record.fields.remove(field);
            hashes.insert(hkey.to_string(), record.clone());
            (old, record)
        };

        debug!(key = hkey, field, "hash field delete");
        // The reduced hash is rewritten in place on disk.
        self.enqueue_hash(PersistOp {
            kind: OpKind::Add,
            record: record.clone(),
        })
        .await;
        self.notify(
            OpKind::Del,
            Some(Item::Hash(old)),
            Some(Item::Hash(record)),
        );
        Ok(())
    }

    /// Removes the whole hash. Returns whether it existed.
    pub async fn hm_del(&self, hkey: &str) -> bool {
        let old = self.inner.hashes.write().remove(hkey);
        let Some(old) = old else { return false };

        debug!(key = hkey, "hash delete");
        let tombstone = HashRecord {
            key: hkey.to_string(),
            fields: HashMap::new(),
            expire_at: EXPIRE_FOREVER,
        };
        self.enqueue_hash(PersistOp {
            kind: OpKind::Del,
            record: tombstone,
        })
        .await;
        self.notify(OpKind::Del, Some(Item::Hash(old)), None);
        true
    }

    // ------------------------------------------------------------------
    // lists
    // ------------------------------------------------------------------

    /// Appends `items` to the list at `key`, creating it if absent. The
    /// list's expiry is replaced on every call, under the same zero-means-
    /// forever rule as scalars and hashes.
    pub async fn l_put(
        &self,
        key: &str,
        items: Vec<String>,
        expire_seconds: i64,
    ) -> Result<(), StoreError> {
        validate_key(key)?;

        let (old, record) = {
            let mut lists = self.inner.lists.write();
            let old = lists.get(key).cloned();
            let mut record = old.clone().unwrap_or_else(|| ListRecord {
                key: key.to_string(),
                items: Vec::new(),
                expire_at: EXPIRE_FOREVER,
            });
            record.expire_at = deadline_after(expire_seconds);
            record.items.extend(items);
            lists.insert(key.to_string(), record.clone());
            (old, record)
        };

        debug!(key, expire_seconds, "list put");
        self.enqueue_list(PersistOp {
            kind: OpKind::Add,
            record: record.clone(),
        })
        .await;
        self.notify(OpKind::Add, old.map(Item::List), Some(Item::List(record)));
        Ok(())
    }

    /// Returns the whole list, serialized as JSON.
    pub fn l_get(&self, key: &str) -> Result<String, StoreError> {
        let lists = self.inner.lists.read();
        let record = lists
            .get(key)
            .filter(|r| !r.is_expired(now_nanos()))
            .ok_or_else(|| StoreError::NotFound(format!("no list for key {key:?}")))?;
        Ok(serde_json::to_string(&record.items)?)
    }

    /// Serializes the slice `[begin, min(end, len))` as JSON. Fails with
    /// InvalidArgument when `begin > end` or `begin >= len`.
    pub fn l_get_range(&self, key: &str, begin: usize, end: usize) -> Result<String, StoreError> {
        if begin > end {
            return Err(StoreError::InvalidArgument(format!(
                "list {key:?}: begin {begin} is past end {end}"
            )));
        }
        let lists = self.inner.lists.read();
        let record = lists
            .get(key)
            .filter(|r| !r.is_expired(now_nanos()))
            .ok_or_else(|| StoreError::NotFound(format!("no list for key {key:?}")))?;
        if begin >= record.items.len() {
            return Err(StoreError::InvalidArgument(format!(
                "list {key:?}: begin {begin} is out of range"
            )));
        }
        let end = end.min(record.items.len());
        Ok(serde_json::to_string(&record.items[begin..end])?)
    }

    /// Excises `[begin, min(end, len))` from the list, preserving the order
    /// of the surviving elements. The list entry itself survives even when
    /// emptied.
    pub async fn l_del_range(
        &self,
        key: &str,
        begin: usize,
        end: usize,
    ) -> Result<(), StoreError> {
        if begin > end {
            return Err(StoreError::InvalidArgument(format!(
                "list {key:?}: begin {begin} is past end {end}"
            )));
        }

        let (old, record) = {
            let mut lists = self.inner.lists.write();
            let Some(current) = lists.get(key) else {
                return Err(StoreError::NotFound(format!("no list for key {key:?}")));
            };
            if begin >= current.items.len() {
                return Err(StoreError::InvalidArgument(format!(
                    "list {key:?}: begin {begin} is out of range"
                )));
            }
            let old = current.clone();
            let mut record = old.clone();
            let end = end.min(record.items.len());
            record.items.drain(begin..end);
            lists.insert(key.to_string(), record.clone());
            (old, record)
        };

        debug!(key, begin, end, "list range delete");
        // The surviving items are rewritten in place on disk.
        self.enqueue_list(PersistOp {
            kind: OpKind::Add,
            record: record.clone(),
        })
        .await;
        self.notify(
            OpKind::Del,
            Some(Item::List(old)),
            Some(Item::List(record)),
        );
        Ok(())
    }

    /// Removes the whole list. Returns whether it existed. Scalars and
    /// hashes under the same key are untouched.
    pub async fn l_del(&self, key: &str) -> bool {
        let old = self.inner.lists.write().remove(key);
        let Some(old) = old else { return false };

        debug!(key, "list delete");
        let tombstone = ListRecord {
            key: key.to_string(),
            items: Vec::new(),
            expire_at: EXPIRE_FOREVER,
        };
        self.enqueue_list(PersistOp {
            kind: OpKind::Del,
            record: tombstone,
        })
        .await;
        self.notify(OpKind::Del, Some(Item::List(old)), None);
        true
    }

    // ------------------------------------------------------------------
    // expiry sweeps
    // ------------------------------------------------------------------

    pub(crate) async fn sweep_scalars(&self) {
        let now = now_nanos();
        let expired: Vec<ScalarRecord> = {
            let mut scalars = self.inner.scalars.write();
            let keys: Vec<String> = scalars
                .iter()
                .filter(|(_, record)| record.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| scalars.remove(key)).collect()
        };

        for old in expired {
            debug!(key = %old.key, "scalar expired");
            let tombstone = ScalarRecord {
                key: old.key.clone(),
                data: String::new(),
                expire_at: EXPIRE_FOREVER,
            };
            self.enqueue_scalar(PersistOp {
                kind: OpKind::Del,
                record: tombstone,
            })
            .await;
            self.notify(OpKind::Del, Some(Item::Scalar(old)), None);
        }
    }

    pub(crate) async fn sweep_hashes(&self) {
        let now = now_nanos();
        let expired: Vec<HashRecord> = {
            let mut hashes = self.inner.hashes.write();
            let keys: Vec<String> = hashes
                .iter()
                .filter(|(_, record)| record.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| hashes.remove(key)).collect()
        };

        for old in expired {
            debug!(key = %old.key, "hash expired");
            let tombstone = HashRecord {
                key: old.key.clone(),
                fields: HashMap::new(),
                expire_at: EXPIRE_FOREVER,
            };
            self.enqueue_hash(PersistOp {
                kind: OpKind::Del,
                record: tombstone,
            })
            .await;
            self.notify(OpKind::Del, Some(Item::Hash(old)), None);
        }
    }

    pub(crate) async fn sweep_lists(&self) {
        let now = now_nanos();
        let expired: Vec<ListRecord> = {
            let mut lists = self.inner.lists.write();
            let keys: Vec<String> = lists
                .iter()
                .filter(|(_, record)| record.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| lists.remove(key)).collect()
        };

        for old in expired {
            debug!(key = %old.key, "list expired");
            let tombstone = ListRecord {
                key: old.key.clone(),
                items: Vec::new(),
                expire_at: EXPIRE_FOREVER,
            };
            self.enqueue_list(PersistOp {
                kind: OpKind::Del,
                record: tombstone,
            })
            .await;
            self.notify(OpKind::Del, Some(Item::List(old)), None);
        }
    }

    /// Plants an already-expired scalar, bypassing persistence.
    #[cfg(test)]
    pub(crate) fn put_expired(&self, key: &str, data: &str) {
        let record = ScalarRecord {
            key: key.to_string(),
            data: data.to_string(),
            expire_at: now_nanos() - 1,
        };
        self.inner.scalars.write().insert(key.to_string(), record);
    }

    /// Plants an already-expired hash, bypassing persistence.
    #[cfg(test)]
    pub(crate) fn hm_put_expired(&self, hkey: &str, field: &str, value: &str) {
        let mut fields = HashMap::new();
        fields.insert(field.to_string(), value.to_string());
        let record = HashRecord {
            key: hkey.to_string(),
            fields,
            expire_at: now_nanos() - 1,
        };
        self.inner.hashes.write().insert(hkey.to_string(), record);
    }

    /// Plants an already-expired list, bypassing persistence.
    #[cfg(test)]
    pub(crate) fn l_put_expired(&self, key: &str, items: Vec<String>) {
        let record = ListRecord {
            key: key.to_string(),
            items,
            expire_at: now_nanos() - 1,
        };
        self.inner.lists.write().insert(key.to_string(), record);
    }
}

/// An identical immortal overwrite leaves the on-disk file as-is.
fn scalar_put_is_dirty(old: Option<&ScalarRecord>, new: &ScalarRecord) -> bool {
    !(new.expire_at == EXPIRE_FOREVER
        && old.is_some_and(|o| o.expire_at == EXPIRE_FOREVER && o.data == new.data))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use tempfile::TempDir;

    use super::*;

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<ChangeEvent>>,
    }

    impl RecordingObserver {
        fn events(&self) -> Vec<ChangeEvent> {
            self.events.lock().clone()
        }
    }

    impl ChangeObserver for RecordingObserver {
        fn on_change(&self, event: ChangeEvent) {
            self.events.lock().push(event);
        }
    }

    async fn open_store(dir: &TempDir) -> Store {
        // Long sweep interval so the sweeper never interferes with a test.
        Store::open(
            StoreConfig::default()
                .with_db_root(dir.path())
                .with_sweep_interval(Duration::from_secs(3600)),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store.put("a", "1", 0).await.unwrap();
        assert_eq!(store.get("a").unwrap(), "1");

        assert!(store.delete("a").await);
        assert!(store.get("a").unwrap_err().is_not_found());

        store.shutdown().await;
    }

    #[tokio::test]
    async fn deleting_an_absent_key_is_a_silent_no_op() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let observer = Arc::new(RecordingObserver::default());
        store.set_observer(observer.clone());

        assert!(!store.delete("ghost").await);
        assert!(observer.events().is_empty());

        store.shutdown().await;
    }

    #[tokio::test]
    async fn expired_scalar_reads_as_missing_before_the_sweeper_runs() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store.put_expired("a", "1");
        assert!(store.get("a").unwrap_err().is_not_found());

        store.shutdown().await;
    }

    #[tokio::test]
    async fn rejects_keys_unusable_as_file_names() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        for key in ["", "a/b", "a\\b", "..", ".", "a\nb"] {
            let err = store.put(key, "v", 0).await.unwrap_err();
            assert!(
                matches!(err, StoreError::InvalidArgument(_)),
                "key {key:?} should be rejected"
            );
        }
        let long = "x".repeat(1025);
        assert!(matches!(
            store.put(&long, "v", 0).await.unwrap_err(),
            StoreError::InvalidArgument(_)
        ));

        store.shutdown().await;
    }

    #[tokio::test]
    async fn every_mutation_reaches_the_observer_in_commit_order() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let observer = Arc::new(RecordingObserver::default());
        store.set_observer(observer.clone());

        store.put("k", "v1", 0).await.unwrap();
        store.put("k", "v2", 0).await.unwrap();
        store.delete("k").await;

        let events = observer.events();
        assert_eq!(events.len(), 3);

        assert_eq!(events[0].op, OpKind::Add);
        assert!(events[0].old.is_none());
        assert!(matches!(&events[0].new, Some(Item::Scalar(r)) if r.data == "v1"));

        assert_eq!(events[1].op, OpKind::Add);
        assert!(matches!(&events[1].old, Some(Item::Scalar(r)) if r.data == "v1"));
        assert!(matches!(&events[1].new, Some(Item::Scalar(r)) if r.data == "v2"));

        assert_eq!(events[2].op, OpKind::Del);
        assert!(matches!(&events[2].old, Some(Item::Scalar(r)) if r.data == "v2"));
        assert!(events[2].new.is_none());

        store.shutdown().await;
    }

    #[tokio::test]
    async fn identical_immortal_overwrite_still_notifies() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let observer = Arc::new(RecordingObserver::default());
        store.set_observer(observer.clone());

        store.put("k", "v", 0).await.unwrap();
        store.put("k", "v", 0).await.unwrap();
        assert_eq!(observer.events().len(), 2);

        store.shutdown().await;
    }

    #[test]
    fn identical_immortal_overwrite_skips_persistence() {
        let forever = ScalarRecord {
            key: "k".to_string(),
            data: "v".to_string(),
            expire_at: EXPIRE_FOREVER,
        };

        assert!(!scalar_put_is_dirty(Some(&forever), &forever));
        assert!(scalar_put_is_dirty(None, &forever));

        let other_data = ScalarRecord {
            data: "w".to_string(),
            ..forever.clone()
        };
        assert!(scalar_put_is_dirty(Some(&forever), &other_data));

        let mortal = ScalarRecord {
            expire_at: now_nanos() + 1_000_000_000,
            ..forever.clone()
        };
        assert!(scalar_put_is_dirty(Some(&forever), &mortal));
        assert!(scalar_put_is_dirty(Some(&mortal), &forever));
    }

    #[tokio::test]
    async fn a_panicking_observer_does_not_poison_the_store() {
        struct PanickingObserver;
        impl ChangeObserver for PanickingObserver {
            fn on_change(&self, _event: ChangeEvent) {
                panic!("observer bug");
            }
        }

        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        store.set_observer(Arc::new(PanickingObserver));

        store.put("k", "v", 0).await.unwrap();
        assert_eq!(store.get("k").unwrap(), "v");

        store.shutdown().await;
    }

    #[tokio::test]
    async fn reregistering_the_observer_replaces_it() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let first = Arc::new(RecordingObserver::default());
        let second = Arc::new(RecordingObserver::default());

        store.set_observer(first.clone());
        store.put("a", "1", 0).await.unwrap();
        store.set_observer(second.clone());
        store.put("b", "2", 0).await.unwrap();

        assert_eq!(first.events().len(), 1);
        assert_eq!(second.events().len(), 1);

        store.shutdown().await;
    }

    #[tokio::test]
    async fn hash_put_get_and_field_ops() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store
            .hm_put(
                "h",
                vec!["x".to_string(), "y".to_string()],
                vec!["1".to_string(), "2".to_string()],
                0,
            )
            .await
            .unwrap();

        assert_eq!(store.hm_get_member("h", "x").unwrap(), "1");
        assert_eq!(store.hm_get_member("h", "y").unwrap(), "2");

        store.hm_del_member("h", "x").await.unwrap();
        assert!(store.hm_get_member("h", "x").unwrap_err().is_not_found());
        assert_eq!(store.hm_get_member("h", "y").unwrap(), "2");

        let serialized = store.hm_get("h").unwrap();
        let fields: std::collections::HashMap<String, String> =
            serde_json::from_str(&serialized).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["y"], "2");

        store.shutdown().await;
    }

    #[tokio::test]
    async fn hash_put_rejects_mismatched_arrays_without_side_effects() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let observer = Arc::new(RecordingObserver::default());
        store.set_observer(observer.clone());

        let err = store
            .hm_put("h", vec!["k".to_string()], vec![], 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
        assert!(store.hm_get("h").unwrap_err().is_not_found());
        assert!(observer.events().is_empty());

        store.shutdown().await;
    }

    #[tokio::test]
    async fn hash_missing_hash_and_missing_field_read_distinctly() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let no_hash = store.hm_get_member("h", "x").unwrap_err();
        assert!(no_hash.is_not_found());
        assert!(no_hash.to_string().contains("no hash"));

        store
            .hm_put("h", vec!["x".to_string()], vec!["1".to_string()], 0)
            .await
            .unwrap();
        let no_field = store.hm_get_member("h", "missing").unwrap_err();
        assert!(no_field.is_not_found());
        assert!(no_field.to_string().contains("has no field"));

        store.shutdown().await;
    }

    #[tokio::test]
    async fn hash_field_delete_of_absent_field_emits_nothing() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        store
            .hm_put("h", vec!["x".to_string()], vec!["1".to_string()], 0)
            .await
            .unwrap();

        let observer = Arc::new(RecordingObserver::default());
        store.set_observer(observer.clone());
        store.hm_del_member("h", "ghost").await.unwrap();
        assert!(observer.events().is_empty());

        store.shutdown().await;
    }

    #[tokio::test]
    async fn hash_merge_keeps_existing_fields() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store
            .hm_put("h", vec!["x".to_string()], vec!["1".to_string()], 0)
            .await
            .unwrap();
        store
            .hm_put("h", vec!["y".to_string()], vec!["2".to_string()], 0)
            .await
            .unwrap();

        assert_eq!(store.hm_get_member("h", "x").unwrap(), "1");
        assert_eq!(store.hm_get_member("h", "y").unwrap(), "2");

        store.shutdown().await;
    }

    #[tokio::test]
    async fn list_push_range_reads_and_range_delete() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let items: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        store.l_put("L", items, 0).await.unwrap();

        assert_eq!(store.l_get_range("L", 1, 3).unwrap(), r#"["b","c"]"#);

        store.l_del_range("L", 1, 3).await.unwrap();
        assert_eq!(store.l_get("L").unwrap(), r#"["a","d"]"#);

        store.shutdown().await;
    }

    #[tokio::test]
    async fn list_range_validation() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store
            .l_put("L", vec!["a".to_string(), "b".to_string()], 0)
            .await
            .unwrap();

        // begin past end
        assert!(matches!(
            store.l_get_range("L", 2, 1).unwrap_err(),
            StoreError::InvalidArgument(_)
        ));
        // begin past the list
        assert!(matches!(
            store.l_get_range("L", 2, 5).unwrap_err(),
            StoreError::InvalidArgument(_)
        ));
        // end clamps to the list length
        assert_eq!(store.l_get_range("L", 0, 100).unwrap(), r#"["a","b"]"#);
        // missing list
        assert!(store.l_get_range("M", 0, 1).unwrap_err().is_not_found());

        store.shutdown().await;
    }

    #[tokio::test]
    async fn emptied_list_entry_survives_range_delete() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store.l_put("L", vec!["a".to_string()], 0).await.unwrap();
        store.l_del_range("L", 0, 1).await.unwrap();

        assert_eq!(store.l_get("L").unwrap(), "[]");

        store.shutdown().await;
    }

    #[tokio::test]
    async fn list_expiry_counts_from_now() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store.l_put("L", vec!["a".to_string()], 60).await.unwrap();
        // A deadline taken literally from the argument would already have
        // passed; counted from now it has not.
        assert_eq!(store.l_get("L").unwrap(), r#"["a"]"#);

        store.shutdown().await;
    }

    #[tokio::test]
    async fn namespaces_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store.put("k", "scalar", 0).await.unwrap();
        store
            .hm_put("k", vec!["f".to_string()], vec!["1".to_string()], 0)
            .await
            .unwrap();
        store.l_put("k", vec!["item".to_string()], 0).await.unwrap();

        // Deleting the list must leave the scalar and the hash alone.
        assert!(store.l_del("k").await);
        assert_eq!(store.get("k").unwrap(), "scalar");
        assert_eq!(store.hm_get_member("k", "f").unwrap(), "1");
        assert!(store.l_get("k").unwrap_err().is_not_found());

        store.shutdown().await;
    }

    #[tokio::test]
    async fn restart_preserves_last_committed_state() {
        let dir = TempDir::new().unwrap();

        {
            let store = open_store(&dir).await;
            store.put("a", "1", 0).await.unwrap();
            store
                .hm_put("h", vec!["x".to_string()], vec!["1".to_string()], 0)
                .await
                .unwrap();
            store
                .l_put("L", vec!["a".to_string(), "b".to_string()], 0)
                .await
                .unwrap();
            store.shutdown().await;
        }

        {
            let store = open_store(&dir).await;
            assert_eq!(store.get("a").unwrap(), "1");
            assert_eq!(store.hm_get_member("h", "x").unwrap(), "1");
            assert_eq!(store.l_get("L").unwrap(), r#"["a","b"]"#);

            store.delete("a").await;
            store.shutdown().await;
        }

        let store = open_store(&dir).await;
        assert!(store.get("a").unwrap_err().is_not_found());
        assert_eq!(store.hm_get_member("h", "x").unwrap(), "1");
        store.shutdown().await;
    }

    #[tokio::test]
    async fn restart_sees_hash_field_removal() {
        let dir = TempDir::new().unwrap();

        {
            let store = open_store(&dir).await;
            store
                .hm_put(
                    "h",
                    vec!["x".to_string(), "y".to_string()],
                    vec!["1".to_string(), "2".to_string()],
                    0,
                )
                .await
                .unwrap();
            store.hm_del_member("h", "x").await.unwrap();
            store.shutdown().await;
        }

        let store = open_store(&dir).await;
        assert!(store.hm_get_member("h", "x").unwrap_err().is_not_found());
        assert_eq!(store.hm_get_member("h", "y").unwrap(), "2");
        store.shutdown().await;
    }

    #[tokio::test]
    async fn startup_skips_a_corrupt_file() {
        let dir = TempDir::new().unwrap();

        {
            let store = open_store(&dir).await;
            store.put("good", "1", 0).await.unwrap();
            store.shutdown().await;
        }

        std::fs::write(dir.path().join("Value").join("bad"), b"garbage").unwrap();

        let store = open_store(&dir).await;
        assert_eq!(store.get("good").unwrap(), "1");
        assert!(store.get("bad").unwrap_err().is_not_found());
        store.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_puts_settle_on_one_winner() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let observer = Arc::new(RecordingObserver::default());
        store.set_observer(observer.clone());

        let mut handles = Vec::new();
        for task in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for round in 0..25 {
                    let value = format!("task{task}-round{round}");
                    store.put("contested", &value, 0).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let winner = store.get("contested").unwrap();
        let events = observer.events();
        assert_eq!(events.len(), 200);
        assert!(events.iter().any(
            |event| matches!(&event.new, Some(Item::Scalar(r)) if r.data == winner)
        ));

        store.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_on_distinct_keys() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let mut handles = Vec::new();
        for task in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    let key = format!("task{task}-key{i}");
                    store.put(&key, "value", 0).await.unwrap();
                    assert_eq!(store.get(&key).unwrap(), "value");
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for task in 0..4 {
            for i in 0..50 {
                assert!(store.get(&format!("task{task}-key{i}")).is_ok());
            }
        }

        store.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drains_pending_persistence() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        for i in 0..32 {
            store.put(&format!("k{i}"), "v", 0).await.unwrap();
        }
        store.shutdown().await;

        for i in 0..32 {
            assert!(dir.path().join("Value").join(format!("k{i}")).exists());
        }
    }
}
