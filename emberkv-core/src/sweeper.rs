//! Periodic eviction of expired records.
//!
//! Each cycle sweeps the three namespaces one at a time, with a one-second
//! gap between phases so a long sweep never holds more than one namespace's
//! write lock at a stretch. Evictions run through the same delete path as
//! the user API: a Del persistence op and a change event per record.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::store::{Shared, Store};

const PHASE_GAP: Duration = Duration::from_secs(1);

pub(crate) async fn run(
    shared: Weak<Shared>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if !sleep_or_shutdown(interval, &mut shutdown_rx).await {
            break;
        }
        let Some(inner) = shared.upgrade() else { break };
        let store = Store::from_shared(inner);

        store.sweep_scalars().await;
        if !sleep_or_shutdown(PHASE_GAP, &mut shutdown_rx).await {
            break;
        }
        store.sweep_hashes().await;
        if !sleep_or_shutdown(PHASE_GAP, &mut shutdown_rx).await {
            break;
        }
        store.sweep_lists().await;
    }

    debug!("expiry sweeper stopped");
}

/// Returns `false` when shutdown was signalled (or the store is gone)
/// before the delay elapsed.
async fn sleep_or_shutdown(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown_rx.changed() => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use tempfile::TempDir;

    use crate::config::StoreConfig;
    use crate::event::{ChangeEvent, ChangeObserver};
    use crate::record::{Item, OpKind};
    use crate::store::Store;

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<ChangeEvent>>,
    }

    impl ChangeObserver for RecordingObserver {
        fn on_change(&self, event: ChangeEvent) {
            self.events.lock().push(event);
        }
    }

    #[tokio::test]
    async fn sweeper_evicts_all_three_shapes_and_notifies() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(
            StoreConfig::default()
                .with_db_root(dir.path())
                .with_sweep_interval(Duration::from_secs(1)),
        )
        .await
        .unwrap();

        let observer = Arc::new(RecordingObserver::default());
        store.set_observer(observer.clone());

        store.put_expired("s", "1");
        store.hm_put_expired("h", "x", "1");
        store.l_put_expired("L", vec!["a".to_string()]);
        store.put("keep", "alive", 0).await.unwrap();

        // One interval plus the two phase gaps covers all three namespaces.
        tokio::time::sleep(Duration::from_millis(3600)).await;

        assert!(store.get("s").unwrap_err().is_not_found());
        assert!(store.hm_get("h").unwrap_err().is_not_found());
        assert!(store.l_get("L").unwrap_err().is_not_found());
        assert_eq!(store.get("keep").unwrap(), "alive");

        let events = observer.events.lock().clone();
        let deletions: Vec<&ChangeEvent> =
            events.iter().filter(|e| e.op == OpKind::Del).collect();
        assert_eq!(deletions.len(), 3);
        assert!(deletions.iter().all(|e| e.new.is_none()));
        assert!(deletions
            .iter()
            .any(|e| matches!(&e.old, Some(Item::Scalar(r)) if r.key == "s" && r.data == "1")));
        assert!(deletions
            .iter()
            .any(|e| matches!(&e.old, Some(Item::Hash(r)) if r.key == "h")));
        assert!(deletions
            .iter()
            .any(|e| matches!(&e.old, Some(Item::List(r)) if r.key == "L")));

        store.shutdown().await;
    }

    #[tokio::test]
    async fn sweeper_eviction_unlinks_the_record_file() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(
            StoreConfig::default()
                .with_db_root(dir.path())
                .with_sweep_interval(Duration::from_secs(1)),
        )
        .await
        .unwrap();

        store.put("s", "1", 1).await.unwrap();
        assert_eq!(store.get("s").unwrap(), "1");

        // Far enough past the deadline that a full sweep cycle has run.
        tokio::time::sleep(Duration::from_millis(4500)).await;

        assert!(store.get("s").unwrap_err().is_not_found());
        store.shutdown().await;
        assert!(!dir.path().join("Value").join("s").exists());
    }
}
