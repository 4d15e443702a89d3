//! Background persistence: after startup, a single writer task owns every
//! filesystem mutation under the database root.
//!
//! The writer multiplexes three per-namespace op queues. Within one queue
//! ops apply in arrival order; across queues the order is unspecified. A
//! failed write is logged and not retried; the in-memory state stays
//! authoritative until restart.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::record::{HashRecord, ListRecord, OpKind, ScalarRecord};

/// Depth of each per-namespace op queue. A mutator's send completes only
/// once the writer has taken the previous op, so burst load blocks the
/// mutator rather than piling up memory.
pub(crate) const PERSIST_QUEUE_DEPTH: usize = 1;

/// One queued mutation: a full record snapshot plus what happened to it.
#[derive(Debug)]
pub(crate) struct PersistOp<R> {
    pub kind: OpKind,
    pub record: R,
}

/// Directory layout under the database root.
#[derive(Debug, Clone)]
pub(crate) struct DbPaths {
    pub value_dir: PathBuf,
    pub map_dir: PathBuf,
    pub list_dir: PathBuf,
}

impl DbPaths {
    pub fn new(root: &Path) -> Self {
        Self {
            value_dir: root.join("Value"),
            map_dir: root.join("map"),
            list_dir: root.join("list"),
        }
    }

    pub async fn create_dirs(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.value_dir).await?;
        tokio::fs::create_dir_all(&self.map_dir).await?;
        tokio::fs::create_dir_all(&self.list_dir).await?;
        Ok(())
    }
}

pub(crate) struct PersistWriter {
    paths: DbPaths,
    scalar_rx: mpsc::Receiver<PersistOp<ScalarRecord>>,
    hash_rx: mpsc::Receiver<PersistOp<HashRecord>>,
    list_rx: mpsc::Receiver<PersistOp<ListRecord>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl PersistWriter {
    pub fn new(
        paths: DbPaths,
        scalar_rx: mpsc::Receiver<PersistOp<ScalarRecord>>,
        hash_rx: mpsc::Receiver<PersistOp<HashRecord>>,
        list_rx: mpsc::Receiver<PersistOp<ListRecord>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            paths,
            scalar_rx,
            hash_rx,
            list_rx,
            shutdown_rx,
        }
    }

    /// Applies ops until shutdown is signalled, then drains whatever is
    /// already queued and exits.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                Some(op) = self.scalar_rx.recv() => self.apply_scalar(op).await,
                Some(op) = self.hash_rx.recv() => self.apply_hash(op).await,
                Some(op) = self.list_rx.recv() => self.apply_list(op).await,
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        while let Ok(op) = self.scalar_rx.try_recv() {
            self.apply_scalar(op).await;
        }
        while let Ok(op) = self.hash_rx.try_recv() {
            self.apply_hash(op).await;
        }
        while let Ok(op) = self.list_rx.try_recv() {
            self.apply_list(op).await;
        }

        debug!("persistence writer stopped");
    }

    async fn apply_scalar(&self, op: PersistOp<ScalarRecord>) {
        match op.kind {
            OpKind::Add => write_record(&self.paths.value_dir, &op.record.key, &op.record).await,
            OpKind::Del => remove_record(&self.paths.value_dir, &op.record.key).await,
        }
    }

    async fn apply_hash(&self, op: PersistOp<HashRecord>) {
        match op.kind {
            OpKind::Add => write_record(&self.paths.map_dir, &op.record.key, &op.record).await,
            // A Del carrying surviving fields rewrites the reduced hash;
            // only an empty snapshot unlinks the file.
            OpKind::Del if op.record.fields.is_empty() => {
                remove_record(&self.paths.map_dir, &op.record.key).await
            }
            OpKind::Del => write_record(&self.paths.map_dir, &op.record.key, &op.record).await,
        }
    }

    async fn apply_list(&self, op: PersistOp<ListRecord>) {
        match op.kind {
            OpKind::Add => write_record(&self.paths.list_dir, &op.record.key, &op.record).await,
            OpKind::Del if op.record.items.is_empty() => {
                remove_record(&self.paths.list_dir, &op.record.key).await
            }
            OpKind::Del => write_record(&self.paths.list_dir, &op.record.key, &op.record).await,
        }
    }
}

async fn write_record<R: Serialize>(dir: &Path, key: &str, record: &R) {
    let bytes = match codec::encode(record) {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(key, %err, "failed to encode record");
            return;
        }
    };
    if let Err(err) = tokio::fs::create_dir_all(dir).await {
        error!(key, %err, "failed to create database directory");
        return;
    }
    if let Err(err) = tokio::fs::write(dir.join(key), bytes).await {
        error!(key, %err, "failed to write record");
    }
}

async fn remove_record(dir: &Path, key: &str) {
    if let Err(err) = tokio::fs::remove_file(dir.join(key)).await {
        if err.kind() != io::ErrorKind::NotFound {
            error!(key, %err, "failed to remove record");
        }
    }
}

/// In-memory state reconstructed from the database directories.
pub(crate) struct LoadedDb {
    pub scalars: HashMap<String, ScalarRecord>,
    pub hashes: HashMap<String, HashRecord>,
    pub lists: HashMap<String, ListRecord>,
}

/// Walks the three namespace directories and decodes every regular file.
/// Undecodable files and walk errors are logged and skipped; the entry key
/// is the one inside the decoded record, not the file name.
pub(crate) async fn load_db(paths: &DbPaths) -> LoadedDb {
    let scalars = load_namespace(&paths.value_dir, |r: &ScalarRecord| r.key.as_str()).await;
    let hashes = load_namespace(&paths.map_dir, |r: &HashRecord| r.key.as_str()).await;
    let lists = load_namespace(&paths.list_dir, |r: &ListRecord| r.key.as_str()).await;
    info!(
        records = scalars.len() + hashes.len() + lists.len(),
        "database load finished"
    );
    LoadedDb {
        scalars,
        hashes,
        lists,
    }
}

async fn load_namespace<R: DeserializeOwned>(
    dir: &Path,
    key_of: impl Fn(&R) -> &str,
) -> HashMap<String, R> {
    let mut records = HashMap::new();

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), %err, "skipping unreadable database directory");
            return records;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                warn!(dir = %dir.display(), %err, "database directory walk failed");
                break;
            }
        };

        match entry.file_type().await {
            Ok(file_type) if file_type.is_file() => {}
            _ => continue,
        }

        let path = entry.path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(path = %path.display(), %err, "skipping unreadable record file");
                continue;
            }
        };

        match codec::decode::<R>(&bytes) {
            Ok(record) => {
                records.insert(key_of(&record).to_string(), record);
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "skipping undecodable record file");
            }
        }
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::EXPIRE_FOREVER;
    use tempfile::TempDir;

    fn scalar(key: &str, data: &str) -> ScalarRecord {
        ScalarRecord {
            key: key.to_string(),
            data: data.to_string(),
            expire_at: EXPIRE_FOREVER,
        }
    }

    #[tokio::test]
    async fn write_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let record = scalar("a", "1");
        write_record(dir.path(), "a", &record).await;

        let loaded = load_namespace(dir.path(), |r: &ScalarRecord| r.key.as_str()).await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["a"], record);
    }

    #[tokio::test]
    async fn load_keys_by_record_key_not_file_name() {
        let dir = TempDir::new().unwrap();
        let record = scalar("real-key", "1");
        write_record(dir.path(), "file-name", &record).await;

        let loaded = load_namespace(dir.path(), |r: &ScalarRecord| r.key.as_str()).await;
        assert!(loaded.contains_key("real-key"));
        assert!(!loaded.contains_key("file-name"));
    }

    #[tokio::test]
    async fn corrupt_file_is_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        write_record(dir.path(), "good", &scalar("good", "1")).await;
        std::fs::write(dir.path().join("bad"), b"definitely not a record").unwrap();

        let loaded = load_namespace(dir.path(), |r: &ScalarRecord| r.key.as_str()).await;
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("good"));
    }

    #[tokio::test]
    async fn missing_directory_loads_empty() {
        let dir = TempDir::new().unwrap();
        let loaded =
            load_namespace(&dir.path().join("absent"), |r: &ScalarRecord| r.key.as_str()).await;
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn remove_record_tolerates_missing_file() {
        let dir = TempDir::new().unwrap();
        remove_record(dir.path(), "never-written").await;
    }

    #[tokio::test]
    async fn hash_del_with_survivors_rewrites_the_file() {
        let dir = TempDir::new().unwrap();
        let paths = DbPaths::new(dir.path());
        paths.create_dirs().await.unwrap();

        let (_scalar_tx, scalar_rx) = mpsc::channel(1);
        let (_hash_tx, hash_rx) = mpsc::channel(1);
        let (_list_tx, list_rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let writer = PersistWriter::new(paths.clone(), scalar_rx, hash_rx, list_rx, shutdown_rx);

        let mut fields = HashMap::new();
        fields.insert("x".to_string(), "1".to_string());
        let survivor = HashRecord {
            key: "h".to_string(),
            fields,
            expire_at: EXPIRE_FOREVER,
        };

        writer
            .apply_hash(PersistOp {
                kind: OpKind::Del,
                record: survivor.clone(),
            })
            .await;
        let loaded = load_namespace(&paths.map_dir, |r: &HashRecord| r.key.as_str()).await;
        assert_eq!(loaded["h"], survivor);

        let empty = HashRecord {
            key: "h".to_string(),
            fields: HashMap::new(),
            expire_at: EXPIRE_FOREVER,
        };
        writer
            .apply_hash(PersistOp {
                kind: OpKind::Del,
                record: empty,
            })
            .await;
        assert!(!paths.map_dir.join("h").exists());
    }
}
