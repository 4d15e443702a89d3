//! # emberkv Client
//!
//! A high-level Rust client for the emberkv key-value store service.
//!
//! This crate provides a simple, ergonomic API for interacting with an
//! emberkv server, hiding the underlying gRPC plumbing.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use emberkv_client::EmberKvClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), emberkv_client::Error> {
//!     // Connect to the server
//!     let client = EmberKvClient::connect("http://localhost:9980").await?;
//!
//!     // Store a value with a 5-minute lifetime
//!     client.put("my-key", "my-value", 300).await?;
//!
//!     // Retrieve the value
//!     if let Some(value) = client.get("my-key").await? {
//!         println!("Got: {}", value);
//!     }
//!
//!     // Delete the key
//!     client.delete("my-key").await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Watching for changes
//!
//! ```rust,no_run
//! use emberkv_client::EmberKvClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), emberkv_client::Error> {
//!     let client = EmberKvClient::connect("http://localhost:9980").await?;
//!
//!     let mut session = client.watch().await?;
//!     session.watch_key("config:flags").await?;
//!
//!     while let Some(event) = session.next_event().await? {
//!         println!("{} changed to {}", event.key, event.value);
//!     }
//!     Ok(())
//! }
//! ```

mod error;
mod options;

pub use error::Error;
pub use options::EmberKvClientOptions;

use std::sync::Arc;

use emberkv_proto::ember_kv_client::EmberKvClient as GrpcClient;
use emberkv_proto::{
    DeleteRequest, GetRequest, HashDeleteFieldRequest, HashDeleteRequest, HashGetFieldRequest,
    HashGetRequest, HashPutRequest, ListDeleteRangeRequest, ListDeleteRequest,
    ListGetRangeRequest, ListGetRequest, ListPushRequest, PingRequest, PutRequest, WatchAction,
    WatchRequest,
};
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;

pub use emberkv_proto::{EventKind, WatchEvent};

/// A high-level client for the emberkv store service.
///
/// The client is thread-safe and can be cloned cheaply (it uses an internal
/// Arc).
#[derive(Clone)]
pub struct EmberKvClient {
    inner: Arc<RwLock<GrpcClient<Channel>>>,
}

impl EmberKvClient {
    /// Connect to an emberkv server.
    ///
    /// # Arguments
    /// * `url` - The server URL (e.g., "http://localhost:9980")
    pub async fn connect(url: &str) -> Result<Self, Error> {
        Self::with_options(EmberKvClientOptions::new(url)).await
    }

    /// Connect to an emberkv server with custom options.
    pub async fn with_options(options: EmberKvClientOptions) -> Result<Self, Error> {
        let channel = Channel::from_shared(options.url.clone())
            .map_err(|e| Error::Connection(e.to_string()))?
            .connect()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(RwLock::new(GrpcClient::new(channel))),
        })
    }

    /// Round-trips to the server; returns its wall-clock timestamp in
    /// seconds.
    pub async fn ping(&self) -> Result<i64, Error> {
        let mut client = self.inner.write().await;
        let response = client
            .ping(PingRequest {})
            .await
            .map_err(Error::from_status)?;
        Ok(response.into_inner().timestamp)
    }

    /// Store a scalar value. `expire_seconds == 0` keeps it forever.
    pub async fn put(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
        expire_seconds: i64,
    ) -> Result<(), Error> {
        let mut client = self.inner.write().await;
        client
            .put(PutRequest {
                key: key.into(),
                value: value.into(),
                expire_seconds,
            })
            .await
            .map_err(Error::from_status)?;
        Ok(())
    }

    /// Retrieve a scalar value.
    ///
    /// Returns `None` if the key doesn't exist or has expired.
    pub async fn get(&self, key: impl Into<String>) -> Result<Option<String>, Error> {
        let mut client = self.inner.write().await;
        match client.get(GetRequest { key: key.into() }).await {
            Ok(response) => Ok(Some(response.into_inner().value)),
            Err(status) if status.code() == tonic::Code::NotFound => Ok(None),
            Err(status) => Err(Error::from_status(status)),
        }
    }

    /// Delete a scalar key.
    ///
    /// Returns `true` if the key existed and was deleted, `false` otherwise.
    pub async fn delete(&self, key: impl Into<String>) -> Result<bool, Error> {
        let mut client = self.inner.write().await;
        let response = client
            .delete(DeleteRequest { key: key.into() })
            .await
            .map_err(Error::from_status)?;
        Ok(response.into_inner().deleted)
    }

    /// Merge field/value pairs into a hash. The arrays must be the same
    /// length.
    pub async fn hash_put(
        &self,
        hash_key: impl Into<String>,
        field_names: Vec<String>,
        field_values: Vec<String>,
        expire_seconds: i64,
    ) -> Result<(), Error> {
        let mut client = self.inner.write().await;
        client
            .hash_put(HashPutRequest {
                hash_key: hash_key.into(),
                field_names,
                field_values,
                expire_seconds,
            })
            .await
            .map_err(Error::from_status)?;
        Ok(())
    }

    /// Retrieve a whole hash as a JSON object string, or `None` if it
    /// doesn't exist.
    pub async fn hash_get(&self, hash_key: impl Into<String>) -> Result<Option<String>, Error> {
        let mut client = self.inner.write().await;
        match client
            .hash_get(HashGetRequest {
                hash_key: hash_key.into(),
            })
            .await
        {
            Ok(response) => Ok(Some(response.into_inner().value)),
            Err(status) if status.code() == tonic::Code::NotFound => Ok(None),
            Err(status) => Err(Error::from_status(status)),
        }
    }

    /// Retrieve one field of a hash, or `None` if the hash or the field is
    /// absent.
    pub async fn hash_get_field(
        &self,
        hash_key: impl Into<String>,
        field: impl Into<String>,
    ) -> Result<Option<String>, Error> {
        let mut client = self.inner.write().await;
        match client
            .hash_get_field(HashGetFieldRequest {
                hash_key: hash_key.into(),
                field: field.into(),
            })
            .await
        {
            Ok(response) => Ok(Some(response.into_inner().value)),
            Err(status) if status.code() == tonic::Code::NotFound => Ok(None),
            Err(status) => Err(Error::from_status(status)),
        }
    }

    /// Remove one field from a hash.
    pub async fn hash_delete_field(
        &self,
        hash_key: impl Into<String>,
        field: impl Into<String>,
    ) -> Result<(), Error> {
        let mut client = self.inner.write().await;
        client
            .hash_delete_field(HashDeleteFieldRequest {
                hash_key: hash_key.into(),
                field: field.into(),
            })
            .await
            .map_err(Error::from_status)?;
        Ok(())
    }

    /// Delete a whole hash.
    ///
    /// Returns `true` if it existed.
    pub async fn hash_delete(&self, hash_key: impl Into<String>) -> Result<bool, Error> {
        let mut client = self.inner.write().await;
        let response = client
            .hash_delete(HashDeleteRequest {
                hash_key: hash_key.into(),
            })
            .await
            .map_err(Error::from_status)?;
        Ok(response.into_inner().deleted)
    }

    /// Append items to a list.
    pub async fn list_push(
        &self,
        key: impl Into<String>,
        items: Vec<String>,
        expire_seconds: i64,
    ) -> Result<(), Error> {
        let mut client = self.inner.write().await;
        client
            .list_push(ListPushRequest {
                key: key.into(),
                items,
                expire_seconds,
            })
            .await
            .map_err(Error::from_status)?;
        Ok(())
    }

    /// Retrieve a whole list as a JSON array string, or `None` if it
    /// doesn't exist.
    pub async fn list_get(&self, key: impl Into<String>) -> Result<Option<String>, Error> {
        let mut client = self.inner.write().await;
        match client.list_get(ListGetRequest { key: key.into() }).await {
            Ok(response) => Ok(Some(response.into_inner().value)),
            Err(status) if status.code() == tonic::Code::NotFound => Ok(None),
            Err(status) => Err(Error::from_status(status)),
        }
    }

    /// Retrieve the slice `[begin, end)` of a list as a JSON array string.
    pub async fn list_get_range(
        &self,
        key: impl Into<String>,
        begin: u64,
        end: u64,
    ) -> Result<String, Error> {
        let mut client = self.inner.write().await;
        let response = client
            .list_get_range(ListGetRangeRequest {
                key: key.into(),
                begin,
                end,
            })
            .await
            .map_err(Error::from_status)?;
        Ok(response.into_inner().value)
    }

    /// Remove the slice `[begin, end)` from a list.
    pub async fn list_delete_range(
        &self,
        key: impl Into<String>,
        begin: u64,
        end: u64,
    ) -> Result<(), Error> {
        let mut client = self.inner.write().await;
        client
            .list_delete_range(ListDeleteRangeRequest {
                key: key.into(),
                begin,
                end,
            })
            .await
            .map_err(Error::from_status)?;
        Ok(())
    }

    /// Delete a whole list.
    ///
    /// Returns `true` if it existed.
    pub async fn list_delete(&self, key: impl Into<String>) -> Result<bool, Error> {
        let mut client = self.inner.write().await;
        let response = client
            .list_delete(ListDeleteRequest { key: key.into() })
            .await
            .map_err(Error::from_status)?;
        Ok(response.into_inner().deleted)
    }

    /// Open a change-notification stream.
    ///
    /// The returned session starts with an empty watch set; use
    /// [`WatchSession::watch_key`] and [`WatchSession::watch_hash`] to
    /// subscribe.
    pub async fn watch(&self) -> Result<WatchSession, Error> {
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let outbound = ReceiverStream::new(commands_rx);

        let mut client = self.inner.write().await;
        let response = client.watch(outbound).await.map_err(Error::from_status)?;

        Ok(WatchSession {
            commands: commands_tx,
            events: response.into_inner(),
        })
    }
}

// JSON extension methods (only available with the "json" feature)
#[cfg(feature = "json")]
impl EmberKvClient {
    /// Store a JSON-serializable value under a scalar key.
    pub async fn put_json<T: serde::Serialize>(
        &self,
        key: impl Into<String>,
        value: &T,
        expire_seconds: i64,
    ) -> Result<(), Error> {
        let json = serde_json::to_string(value).map_err(Error::Serialization)?;
        self.put(key, json, expire_seconds).await
    }

    /// Retrieve and deserialize a JSON value from a scalar key.
    ///
    /// Returns `None` if the key doesn't exist.
    pub async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        key: impl Into<String>,
    ) -> Result<Option<T>, Error> {
        match self.get(key).await? {
            Some(json) => {
                let value = serde_json::from_str(&json).map_err(Error::Deserialization)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

/// An open change-notification stream plus its command channel.
pub struct WatchSession {
    commands: mpsc::Sender<WatchRequest>,
    events: tonic::Streaming<WatchEvent>,
}

impl WatchSession {
    /// Start watching a scalar key.
    pub async fn watch_key(&self, key: impl Into<String>) -> Result<(), Error> {
        self.send(WatchAction::WatchKey, key.into(), String::new())
            .await
    }

    /// Stop watching a scalar key.
    pub async fn unwatch_key(&self, key: impl Into<String>) -> Result<(), Error> {
        self.send(WatchAction::UnwatchKey, key.into(), String::new())
            .await
    }

    /// Start watching a hash. Events are delivered for any change to the
    /// hash, whatever `field` says.
    pub async fn watch_hash(
        &self,
        hash_key: impl Into<String>,
        field: impl Into<String>,
    ) -> Result<(), Error> {
        self.send(WatchAction::WatchHash, hash_key.into(), field.into())
            .await
    }

    /// Drop a field from a hash watch.
    pub async fn unwatch_hash(
        &self,
        hash_key: impl Into<String>,
        field: impl Into<String>,
    ) -> Result<(), Error> {
        self.send(WatchAction::UnwatchHash, hash_key.into(), field.into())
            .await
    }

    async fn send(&self, action: WatchAction, key: String, field: String) -> Result<(), Error> {
        self.commands
            .send(WatchRequest {
                action: action as i32,
                key,
                field,
            })
            .await
            .map_err(|_| Error::Connection("watch stream closed".to_string()))
    }

    /// The next change event, or `None` when the server closes the stream.
    pub async fn next_event(&mut self) -> Result<Option<WatchEvent>, Error> {
        self.events.message().await.map_err(Error::from_status)
    }
}
