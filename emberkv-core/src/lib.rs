//! # emberkv core
//!
//! A small, embeddable, persistent in-memory key-value store with a
//! streaming change-notification hook.
//!
//! ## Features
//!
//! - Three value shapes per key space: scalar strings, field maps
//!   (hashes), and ordered string lists; the three namespaces never collide
//! - Per-record expiry: lazy on read, eager via a background sweeper
//! - One file per record under a configurable database root, maintained by
//!   a single background persistence writer
//! - A change bus: one registered observer sees every committed mutation
//!
//! ## Example
//!
//! ```rust,no_run
//! use emberkv_core::{Store, StoreConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), emberkv_core::StoreError> {
//!     let config = StoreConfig::default()
//!         .with_db_root("db")
//!         .with_sweep_interval(Duration::from_secs(30));
//!     let store = Store::open(config).await?;
//!
//!     // Scalar with a 60 second lifetime
//!     store.put("session:42", "alive", 60).await?;
//!     assert_eq!(store.get("session:42")?, "alive");
//!
//!     // Hash fields merge into the existing map
//!     store
//!         .hm_put(
//!             "user:1",
//!             vec!["name".into(), "role".into()],
//!             vec!["ada".into(), "admin".into()],
//!             0,
//!         )
//!         .await?;
//!     assert_eq!(store.hm_get_member("user:1", "name")?, "ada");
//!
//!     // Lists append
//!     store.l_put("events", vec!["boot".into()], 0).await?;
//!
//!     store.shutdown().await;
//!     Ok(())
//! }
//! ```

mod codec;
mod config;
mod error;
mod event;
mod persist;
mod record;
mod store;
mod sweeper;

pub use config::StoreConfig;
pub use error::StoreError;
pub use event::{ChangeEvent, ChangeObserver};
pub use record::{HashRecord, Item, ListRecord, OpKind, ScalarRecord, EXPIRE_FOREVER};
pub use store::Store;
