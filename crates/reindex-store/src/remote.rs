//! Client for a store served by [`crate::KvServer`].

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tonic::transport::{Channel, Endpoint};
use tonic::Status;
use tracing::debug;

use crate::error::StoreError;
use crate::kv::{Command, KvStore, Reply};
use crate::pb::kv_service_client::KvServiceClient;
use crate::pb::{ExecuteRequest, PipelineRequest};
use crate::wire::error_from_status;

/// Networked key/value store client.
///
/// The channel is opened on first use and reconnects by itself; every call
/// is bounded by the configured timeout.
pub struct RemoteKvStore {
    addr: String,
    endpoint: Endpoint,
    client: OnceCell<KvServiceClient<Channel>>,
}

impl RemoteKvStore {
    /// `addr` is `host:port`. Nothing is dialled until the first call.
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Result<Self, StoreError> {
        let addr = addr.into();
        let endpoint = Endpoint::from_shared(format!("http://{}", addr))
            .map_err(|e| StoreError::InvalidArgument(format!("{}: {}", addr, e)))?
            .connect_timeout(timeout)
            .timeout(timeout)
            .tcp_nodelay(true);
        Ok(Self {
            addr,
            endpoint,
            client: OnceCell::new(),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn client(&self) -> KvServiceClient<Channel> {
        self.client
            .get_or_init(|| async {
                debug!(addr = %self.addr, "Opening key/value channel");
                KvServiceClient::new(self.endpoint.connect_lazy())
            })
            .await
            .clone()
    }

    fn failed(&self, status: Status) -> StoreError {
        debug!(addr = %self.addr, code = ?status.code(), "Key/value call failed");
        error_from_status(status)
    }
}

#[async_trait]
impl KvStore for RemoteKvStore {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn call(&self, command: Command) -> Result<Reply, StoreError> {
        let request = ExecuteRequest {
            command: Some(command.into()),
        };
        let response = self
            .client()
            .await
            .execute(request)
            .await
            .map_err(|s| self.failed(s))?;
        let reply = response
            .into_inner()
            .reply
            .ok_or_else(|| StoreError::Protocol("empty reply".to_string()))?;
        Reply::try_from(reply)?.into_result()
    }

    async fn pipeline(&self, commands: Vec<Command>) -> Result<Vec<Reply>, StoreError> {
        let expected = commands.len();
        let request = PipelineRequest {
            commands: commands.into_iter().map(Into::into).collect(),
        };
        let response = self
            .client()
            .await
            .pipeline(request)
            .await
            .map_err(|s| self.failed(s))?;
        let replies = response
            .into_inner()
            .replies
            .into_iter()
            .map(Reply::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        if replies.len() != expected {
            return Err(StoreError::Protocol(format!(
                "pipeline of {} commands got {} replies",
                expected,
                replies.len()
            )));
        }
        Ok(replies)
    }
}
