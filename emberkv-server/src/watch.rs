//! Fan-out of store change events to watching connections.
//!
//! The hub is the store's production observer. On every change event it
//! walks the registered sessions, filters by top-level key, and hands a
//! rendered event to each interested session's bounded queue with a
//! non-blocking send, so the store's mutators are never back-pressured by
//! slow watchers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use emberkv_core::{ChangeEvent, ChangeObserver, Item, OpKind};
use emberkv_proto::{EventKind, WatchAction, WatchEvent, WatchRequest};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Depth of each session's outbound event queue.
pub const SESSION_QUEUE_DEPTH: usize = 1024;

/// One watching connection.
struct Session {
    watched_keys: RwLock<HashSet<String>>,
    watched_hashes: RwLock<HashMap<String, HashSet<String>>>,
    events_tx: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
}

impl Session {
    fn wants_scalar(&self, key: &str) -> bool {
        self.watched_keys.read().contains(key)
    }

    fn wants_hash(&self, key: &str) -> bool {
        self.watched_hashes.read().contains_key(key)
    }
}

/// Registry of watching connections.
#[derive(Default)]
pub struct WatchHub {
    sessions: DashMap<u64, Session>,
    next_id: AtomicU64,
}

impl WatchHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection. Returns its id, the outbound event receiver,
    /// and the cancellation handle for the connection's tasks.
    pub fn register(&self) -> (u64, mpsc::Receiver<WatchEvent>, CancellationToken) {
        self.register_with_queue_depth(SESSION_QUEUE_DEPTH)
    }

    fn register_with_queue_depth(
        &self,
        depth: usize,
    ) -> (u64, mpsc::Receiver<WatchEvent>, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::channel(depth);
        let cancel = CancellationToken::new();
        self.sessions.insert(
            id,
            Session {
                watched_keys: RwLock::new(HashSet::new()),
                watched_hashes: RwLock::new(HashMap::new()),
                events_tx,
                cancel: cancel.clone(),
            },
        );
        debug!(session_id = id, "watch session registered");
        (id, events_rx, cancel)
    }

    /// Removes the connection from the registry, then cancels its tasks.
    /// The ordering matters: once removed, no dispatch can enqueue onto the
    /// dying session's queue. Safe to call more than once.
    pub fn deregister(&self, id: u64) {
        if let Some((_, session)) = self.sessions.remove(&id) {
            session.cancel.cancel();
            debug!(session_id = id, "watch session removed");
        }
    }

    /// Applies one watch/unwatch command from a connection's inbound stream.
    pub fn apply(&self, id: u64, command: WatchRequest) {
        match command.action() {
            WatchAction::WatchKey => self.watch_key(id, &command.key),
            WatchAction::UnwatchKey => self.unwatch_key(id, &command.key),
            WatchAction::WatchHash => self.watch_hash(id, &command.key, &command.field),
            WatchAction::UnwatchHash => self.unwatch_hash(id, &command.key, &command.field),
            WatchAction::Unspecified => {
                warn!(session_id = id, "watch command without an action")
            }
        }
    }

    pub fn watch_key(&self, id: u64, key: &str) {
        if let Some(session) = self.sessions.get(&id) {
            session.watched_keys.write().insert(key.to_string());
        }
    }

    pub fn unwatch_key(&self, id: u64, key: &str) {
        if let Some(session) = self.sessions.get(&id) {
            session.watched_keys.write().remove(key);
        }
    }

    /// Starts watching a hash key. `field` narrows the bookkeeping but not
    /// the filtering; any change to the hash is delivered.
    pub fn watch_hash(&self, id: u64, hash_key: &str, field: &str) {
        if let Some(session) = self.sessions.get(&id) {
            let mut hashes = session.watched_hashes.write();
            let fields = hashes.entry(hash_key.to_string()).or_default();
            if !field.is_empty() {
                fields.insert(field.to_string());
            }
        }
    }

    /// Drops a field from a hash watch; the watch itself ends when its last
    /// field is dropped or when `field` is empty.
    pub fn unwatch_hash(&self, id: u64, hash_key: &str, field: &str) {
        if let Some(session) = self.sessions.get(&id) {
            let mut hashes = session.watched_hashes.write();
            if field.is_empty() {
                hashes.remove(hash_key);
            } else if let Some(fields) = hashes.get_mut(hash_key) {
                fields.remove(field);
                if fields.is_empty() {
                    hashes.remove(hash_key);
                }
            }
        }
    }

    fn dispatch(&self, event: WatchEvent, for_hash: bool) {
        let mut dead = Vec::new();

        for entry in self.sessions.iter() {
            let session = entry.value();
            let wants = if for_hash {
                session.wants_hash(&event.hash_key)
            } else {
                session.wants_scalar(&event.key)
            };
            if !wants {
                continue;
            }

            match session.events_tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        session_id = *entry.key(),
                        key = %event.key,
                        "watch queue full; event dropped"
                    );
                }
                Err(TrySendError::Closed(_)) => dead.push(*entry.key()),
            }
        }

        for id in dead {
            self.deregister(id);
        }
    }
}

impl ChangeObserver for WatchHub {
    fn on_change(&self, event: ChangeEvent) {
        let kind = match event.op {
            OpKind::Add => EventKind::Add,
            OpKind::Del => EventKind::Delete,
        };

        match event.new.as_ref().or(event.old.as_ref()) {
            Some(Item::Scalar(record)) => {
                let value = match &event.new {
                    Some(Item::Scalar(new)) => new.data.clone(),
                    _ => String::new(),
                };
                self.dispatch(
                    WatchEvent {
                        kind: kind as i32,
                        key: record.key.clone(),
                        hash_key: String::new(),
                        value,
                    },
                    false,
                );
            }
            Some(Item::Hash(record)) => {
                let value = match &event.new {
                    Some(Item::Hash(new)) => {
                        serde_json::to_string(&new.fields).unwrap_or_default()
                    }
                    _ => String::new(),
                };
                self.dispatch(
                    WatchEvent {
                        kind: kind as i32,
                        key: record.key.clone(),
                        hash_key: record.key.clone(),
                        value,
                    },
                    true,
                );
            }
            // List changes are not watchable.
            Some(Item::List(_)) | None => {}
        }
    }
}
