use std::pin::Pin;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use emberkv_core::{Store, StoreError};
use emberkv_proto::ember_kv_server::EmberKv;
use emberkv_proto::{
    DeleteRequest, DeleteResponse, GetRequest, GetResponse, HashDeleteFieldRequest,
    HashDeleteFieldResponse, HashDeleteRequest, HashDeleteResponse, HashGetFieldRequest,
    HashGetFieldResponse, HashGetRequest, HashGetResponse, HashPutRequest, HashPutResponse,
    ListDeleteRangeRequest, ListDeleteRangeResponse, ListDeleteRequest, ListDeleteResponse,
    ListGetRangeRequest, ListGetRangeResponse, ListGetRequest, ListGetResponse, ListPushRequest,
    ListPushResponse, PingRequest, PingResponse, PutRequest, PutResponse, WatchEvent,
    WatchRequest,
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

use crate::watch::WatchHub;

/// The gRPC service implementation.
pub struct EmberKvService {
    store: Store,
    hub: Arc<WatchHub>,
}

impl EmberKvService {
    pub fn new(store: Store, hub: Arc<WatchHub>) -> Self {
        Self { store, hub }
    }
}

fn status_from(err: StoreError) -> Status {
    match err {
        StoreError::NotFound(message) => Status::not_found(message),
        StoreError::InvalidArgument(message) => Status::invalid_argument(message),
        StoreError::Io(err) => Status::internal(err.to_string()),
        StoreError::Serialization(err) => Status::internal(err.to_string()),
    }
}

#[tonic::async_trait]
impl EmberKv for EmberKvService {
    async fn ping(
        &self,
        _request: Request<PingRequest>,
    ) -> Result<Response<PingResponse>, Status> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs() as i64);
        Ok(Response::new(PingResponse { timestamp }))
    }

    async fn put(&self, request: Request<PutRequest>) -> Result<Response<PutResponse>, Status> {
        let req = request.into_inner();
        debug!(key = %req.key, expire = req.expire_seconds, "PUT");

        self.store
            .put(&req.key, &req.value, req.expire_seconds)
            .await
            .map_err(status_from)?;
        Ok(Response::new(PutResponse {}))
    }

    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        let key = &request.get_ref().key;
        debug!(key = %key, "GET");

        let value = self.store.get(key).map_err(status_from)?;
        Ok(Response::new(GetResponse { value }))
    }

    async fn delete(
        &self,
        request: Request<DeleteRequest>,
    ) -> Result<Response<DeleteResponse>, Status> {
        let key = &request.get_ref().key;
        debug!(key = %key, "DELETE");

        let deleted = self.store.delete(key).await;
        Ok(Response::new(DeleteResponse { deleted }))
    }

    async fn hash_put(
        &self,
        request: Request<HashPutRequest>,
    ) -> Result<Response<HashPutResponse>, Status> {
        let req = request.into_inner();
        debug!(key = %req.hash_key, fields = req.field_names.len(), "HASH_PUT");

        self.store
            .hm_put(
                &req.hash_key,
                req.field_names,
                req.field_values,
                req.expire_seconds,
            )
            .await
            .map_err(status_from)?;
        Ok(Response::new(HashPutResponse {}))
    }

    async fn hash_get(
        &self,
        request: Request<HashGetRequest>,
    ) -> Result<Response<HashGetResponse>, Status> {
        let key = &request.get_ref().hash_key;
        debug!(key = %key, "HASH_GET");

        let value = self.store.hm_get(key).map_err(status_from)?;
        Ok(Response::new(HashGetResponse { value }))
    }

    async fn hash_get_field(
        &self,
        request: Request<HashGetFieldRequest>,
    ) -> Result<Response<HashGetFieldResponse>, Status> {
        let req = request.get_ref();
        debug!(key = %req.hash_key, field = %req.field, "HASH_GET_FIELD");

        let value = self
            .store
            .hm_get_member(&req.hash_key, &req.field)
            .map_err(status_from)?;
        Ok(Response::new(HashGetFieldResponse { value }))
    }

    async fn hash_delete_field(
        &self,
        request: Request<HashDeleteFieldRequest>,
    ) -> Result<Response<HashDeleteFieldResponse>, Status> {
        let req = request.get_ref();
        debug!(key = %req.hash_key, field = %req.field, "HASH_DELETE_FIELD");

        self.store
            .hm_del_member(&req.hash_key, &req.field)
            .await
            .map_err(status_from)?;
        Ok(Response::new(HashDeleteFieldResponse {}))
    }

    async fn hash_delete(
        &self,
        request: Request<HashDeleteRequest>,
    ) -> Result<Response<HashDeleteResponse>, Status> {
        let key = &request.get_ref().hash_key;
        debug!(key = %key, "HASH_DELETE");

        let deleted = self.store.hm_del(key).await;
        Ok(Response::new(HashDeleteResponse { deleted }))
    }

    async fn list_push(
        &self,
        request: Request<ListPushRequest>,
    ) -> Result<Response<ListPushResponse>, Status> {
        let req = request.into_inner();
        debug!(key = %req.key, items = req.items.len(), "LIST_PUSH");

        self.store
            .l_put(&req.key, req.items, req.expire_seconds)
            .await
            .map_err(status_from)?;
        Ok(Response::new(ListPushResponse {}))
    }

    async fn list_get(
        &self,
        request: Request<ListGetRequest>,
    ) -> Result<Response<ListGetResponse>, Status> {
        let key = &request.get_ref().key;
        debug!(key = %key, "LIST_GET");

        let value = self.store.l_get(key).map_err(status_from)?;
        Ok(Response::new(ListGetResponse { value }))
    }

    async fn list_get_range(
        &self,
        request: Request<ListGetRangeRequest>,
    ) -> Result<Response<ListGetRangeResponse>, Status> {
        let req = request.get_ref();
        debug!(key = %req.key, begin = req.begin, end = req.end, "LIST_GET_RANGE");

        let value = self
            .store
            .l_get_range(&req.key, req.begin as usize, req.end as usize)
            .map_err(status_from)?;
        Ok(Response::new(ListGetRangeResponse { value }))
    }

    async fn list_delete_range(
        &self,
        request: Request<ListDeleteRangeRequest>,
    ) -> Result<Response<ListDeleteRangeResponse>, Status> {
        let req = request.get_ref();
        debug!(key = %req.key, begin = req.begin, end = req.end, "LIST_DELETE_RANGE");

        self.store
            .l_del_range(&req.key, req.begin as usize, req.end as usize)
            .await
            .map_err(status_from)?;
        Ok(Response::new(ListDeleteRangeResponse {}))
    }

    async fn list_delete(
        &self,
        request: Request<ListDeleteRequest>,
    ) -> Result<Response<ListDeleteResponse>, Status> {
        let key = &request.get_ref().key;
        debug!(key = %key, "LIST_DELETE");

        let deleted = self.store.l_del(key).await;
        Ok(Response::new(ListDeleteResponse { deleted }))
    }

    type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchEvent, Status>> + Send>>;

    async fn watch(
        &self,
        request: Request<Streaming<WatchRequest>>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let mut commands = request.into_inner();
        let (session_id, events_rx, cancel) = self.hub.register();
        let hub = Arc::clone(&self.hub);
        debug!(session_id, "WATCH stream opened");

        // Apply watch/unwatch commands until the client goes away, then
        // tear the session down: registry removal first, cancellation
        // second.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = commands.next() => match message {
                        Some(Ok(command)) => hub.apply(session_id, command),
                        Some(Err(status)) => {
                            debug!(session_id, %status, "watch command stream failed");
                            break;
                        }
                        None => break,
                    },
                }
            }
            hub.deregister(session_id);
            debug!(session_id, "WATCH stream closed");
        });

        let events = ReceiverStream::new(events_rx).map(Ok);
        Ok(Response::new(Box::pin(events)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_grpc_codes() {
        let status = status_from(StoreError::NotFound("no value for key \"a\"".to_string()));
        assert_eq!(status.code(), tonic::Code::NotFound);
        assert_eq!(status.message(), "no value for key \"a\"");

        let status = status_from(StoreError::InvalidArgument("bad range".to_string()));
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status = status_from(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "disk on fire",
        )));
        assert_eq!(status.code(), tonic::Code::Internal);
    }
}
