//! gRPC server exposing any [`KvStore`] to remote clients, with a
//! tonic-health endpoint alongside.

use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;
use tonic::transport::server::TcpIncoming;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tonic_health::server::health_reporter;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::kv::{Command, KvStore, Reply};
use crate::pb::kv_service_server::{KvService, KvServiceServer};
use crate::pb::{ExecuteRequest, ExecuteResponse, PipelineRequest, PipelineResponse};
use crate::wire::status_from_error;

/// `KvService` handlers over a backing store.
pub struct KvServiceImpl {
    store: Arc<dyn KvStore>,
}

impl KvServiceImpl {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }
}

fn decode(command: crate::pb::Command) -> Result<Command, Status> {
    Command::try_from(command).map_err(|e| status_from_error(&e))
}

#[tonic::async_trait]
impl KvService for KvServiceImpl {
    async fn execute(
        &self,
        request: Request<ExecuteRequest>,
    ) -> Result<Response<ExecuteResponse>, Status> {
        let command = request
            .into_inner()
            .command
            .ok_or_else(|| Status::invalid_argument("missing command"))?;
        let command = decode(command)?;
        debug!(command = command.name(), "Execute");
        let reply = Reply::from_result(self.store.call(command).await);
        Ok(Response::new(ExecuteResponse {
            reply: Some(reply.into()),
        }))
    }

    async fn pipeline(
        &self,
        request: Request<PipelineRequest>,
    ) -> Result<Response<PipelineResponse>, Status> {
        let commands = request
            .into_inner()
            .commands
            .into_iter()
            .map(decode)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(commands = commands.len(), "Pipeline");
        // A backend that cannot batch fails the whole call.
        let replies = self
            .store
            .pipeline(commands)
            .await
            .map_err(|e| status_from_error(&e))?;
        Ok(Response::new(PipelineResponse {
            replies: replies.into_iter().map(Into::into).collect(),
        }))
    }
}

/// Serves a backing store as `reindex.store.KvService`.
pub struct KvServer {
    store: Arc<dyn KvStore>,
}

impl KvServer {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Bind `addr` and serve until `shutdown` resolves.
    pub async fn run_with_shutdown<F>(&self, addr: &str, shutdown: F) -> Result<(), StoreError>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve an already bound listener until `shutdown` resolves.
    ///
    /// In-flight calls finish before this returns.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), StoreError>
    where
        F: Future<Output = ()> + Send,
    {
        let local = listener.local_addr()?;
        let incoming = TcpIncoming::from_listener(listener, true, None)
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let (mut health, health_service) = health_reporter();
        health
            .set_serving::<KvServiceServer<KvServiceImpl>>()
            .await;

        info!(addr = %local, backend = self.store.name(), "Key/value server listening");
        Server::builder()
            .add_service(health_service)
            .add_service(KvServiceServer::new(KvServiceImpl::new(Arc::clone(
                &self.store,
            ))))
            .serve_with_incoming_shutdown(incoming, shutdown)
            .await?;
        info!(addr = %local, "Key/value server shut down");
        Ok(())
    }
}
