//! gRPC status endpoint served by a running indexer.
//!
//! The indexer process owns its store, which may be private to it (the
//! in-memory backend) or locked by it (RocksDB). Status readers and reindex
//! requests therefore go through this service rather than opening the
//! store themselves.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpListener;
use tonic::transport::server::TcpIncoming;
use tonic::transport::{Channel, Endpoint, Server};
use tonic::{Code, Request, Response, Status};
use tonic_health::server::health_reporter;
use tracing::{debug, info};

use reindex_state::{views, IndexerStateStore, StateError, View};

use crate::pb;
use crate::pb::indexer_status_client::IndexerStatusClient;
use crate::pb::indexer_status_server::{IndexerStatus, IndexerStatusServer};

/// Status handlers over the indexer's own state store.
pub struct IndexerStatusImpl {
    state: IndexerStateStore,
}

impl IndexerStatusImpl {
    pub fn new(state: IndexerStateStore) -> Self {
        Self { state }
    }
}

#[tonic::async_trait]
impl IndexerStatus for IndexerStatusImpl {
    async fn get_status(
        &self,
        request: Request<pb::StatusRequest>,
    ) -> Result<Response<pb::StatusResponse>, Status> {
        let request = request.into_inner();
        let view: View = request.view.parse().map_err(Status::invalid_argument)?;
        let events = Some(request.events.as_str()).filter(|e| !e.is_empty());
        debug!(view = %view, "Status requested");
        let value = views::render(&self.state, view, events).await;
        Ok(Response::new(pb::StatusResponse {
            json: value.to_string(),
        }))
    }

    async fn request_reindex(
        &self,
        request: Request<pb::ReindexRequest>,
    ) -> Result<Response<pb::ReindexResponse>, Status> {
        let requested = request.into_inner().requested;
        let pending = self
            .state
            .request_reindex(&requested)
            .await
            .map_err(|e| match e {
                StateError::InvalidRequest(message) => Status::invalid_argument(message),
                other => Status::internal(other.to_string()),
            })?;
        Ok(Response::new(pb::ReindexResponse {
            pending_json: pending.describe().to_string(),
        }))
    }
}

/// Serve the status endpoint on `listener` until `shutdown` resolves.
pub async fn serve_status<F>(
    listener: TcpListener,
    state: IndexerStateStore,
    shutdown: F,
) -> Result<(), StatusError>
where
    F: Future<Output = ()> + Send,
{
    let local = listener.local_addr().map_err(|e| StatusError::Bind(e.to_string()))?;
    let incoming = TcpIncoming::from_listener(listener, true, None)
        .map_err(|e| StatusError::Bind(e.to_string()))?;

    let (mut health, health_service) = health_reporter();
    health
        .set_serving::<IndexerStatusServer<IndexerStatusImpl>>()
        .await;

    info!(addr = %local, "Status endpoint listening");
    Server::builder()
        .add_service(health_service)
        .add_service(IndexerStatusServer::new(IndexerStatusImpl::new(state)))
        .serve_with_incoming_shutdown(incoming, shutdown)
        .await?;
    info!(addr = %local, "Status endpoint shut down");
    Ok(())
}

/// Errors talking to, or serving, the status endpoint.
#[derive(Error, Debug)]
pub enum StatusError {
    #[error("Could not bind status endpoint: {0}")]
    Bind(String),

    /// Failed to connect to the indexer
    #[error("Connection failed: {0}")]
    Connection(#[from] tonic::transport::Error),

    #[error("RPC failed: {0}")]
    Rpc(#[from] Status),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl StatusError {
    /// No indexer answered, as opposed to one answering with an error.
    pub fn is_unreachable(&self) -> bool {
        match self {
            StatusError::Connection(_) => true,
            StatusError::Rpc(status) => {
                matches!(status.code(), Code::Unavailable | Code::DeadlineExceeded)
            }
            _ => false,
        }
    }
}

/// Client for a running indexer's status endpoint.
pub struct StatusClient {
    inner: IndexerStatusClient<Channel>,
}

impl StatusClient {
    /// Dial `addr` (`host:port`), failing fast when nothing listens there.
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self, StatusError> {
        let endpoint = Endpoint::from_shared(format!("http://{}", addr))
            .map_err(|e| StatusError::InvalidEndpoint(format!("{}: {}", addr, e)))?
            .connect_timeout(timeout)
            .timeout(timeout);
        debug!(addr, "Connecting to indexer status endpoint");
        let channel = endpoint.connect().await?;
        Ok(Self {
            inner: IndexerStatusClient::new(channel),
        })
    }

    pub async fn status(&mut self, view: View, events: Option<&str>) -> Result<Value, StatusError> {
        let response = self
            .inner
            .get_status(pb::StatusRequest {
                view: view.to_string(),
                events: events.unwrap_or_default().to_string(),
            })
            .await?;
        parse_json(&response.into_inner().json)
    }

    /// Ask the indexer to reindex `all` or a comma separated id list.
    /// Returns the pending request after merging.
    pub async fn request_reindex(&mut self, requested: &str) -> Result<Value, StatusError> {
        let response = self
            .inner
            .request_reindex(pb::ReindexRequest {
                requested: requested.to_string(),
            })
            .await?;
        parse_json(&response.into_inner().pending_json)
    }
}

fn parse_json(raw: &str) -> Result<Value, StatusError> {
    serde_json::from_str(raw).map_err(|e| StatusError::Serialization(e.to_string()))
}
