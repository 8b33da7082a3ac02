//! Queues kept in a shared key/value store.
//!
//! The queue is one key holding a list (`LPUSH`/`LPOP`) or a set
//! (`SADD`/`SPOP`). Plain variants issue one store call per value, pipe
//! variants send all commands as one pipeline, and the pipe-exec set
//! variant pops with a single counted `SPOP`.

use std::sync::Arc;

use async_trait::async_trait;
use reindex_store::{Command, KvStore, Reply, StoreError};
use tracing::warn;

use crate::backend::{partition_storable, AddOutcome, GetOutcome, QueueBackend, QueueKind};
use crate::error::QueueError;
use crate::kv_meta::KvQueueMeta;
use crate::meta::QueueMeta;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Structure {
    List,
    Set,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Single,
    Pipe,
    PipeExec,
}

/// Store-backed queue with a store-backed ledger.
pub struct KvQueue {
    name: String,
    kind: QueueKind,
    structure: Structure,
    transport: Transport,
    store: Arc<dyn KvStore>,
    meta: KvQueueMeta,
}

impl KvQueue {
    /// Build a remote queue. Fails for [`QueueKind::BaseInMemory`].
    pub fn new(name: impl Into<String>, kind: QueueKind, store: Arc<dyn KvStore>) -> Result<Self, QueueError> {
        let (structure, transport) = match kind {
            QueueKind::RemoteList => (Structure::List, Transport::Single),
            QueueKind::RemoteListPipe => (Structure::List, Transport::Pipe),
            QueueKind::RemoteSet => (Structure::Set, Transport::Single),
            QueueKind::RemoteSetPipe => (Structure::Set, Transport::Pipe),
            QueueKind::RemoteSetPipeExec => (Structure::Set, Transport::PipeExec),
            QueueKind::BaseInMemory => {
                return Err(QueueError::Config(format!(
                    "{} is not a key/value store queue",
                    kind
                )))
            }
        };
        let name = name.into();
        Ok(Self {
            meta: KvQueueMeta::new(&name, Arc::clone(&store)),
            name,
            kind,
            structure,
            transport,
            store,
        })
    }

    fn add_command(&self, value: &str) -> Command {
        match self.structure {
            Structure::List => Command::LPush {
                key: self.name.clone(),
                values: vec![value.to_string()],
            },
            Structure::Set => Command::SAdd {
                key: self.name.clone(),
                members: vec![value.to_string()],
            },
        }
    }

    fn pop_command(&self) -> Command {
        match self.structure {
            Structure::List => Command::LPop {
                key: self.name.clone(),
            },
            Structure::Set => Command::SPop {
                key: self.name.clone(),
                count: 1,
            },
        }
    }

    /// Run a pipeline, turning a missing pipeline transport into a
    /// configuration error that names it.
    async fn pipeline(&self, commands: Vec<Command>) -> Result<Vec<Reply>, QueueError> {
        self.store.pipeline(commands).await.map_err(|e| match e {
            StoreError::Unsupported(capability) => QueueError::Config(format!(
                "queue '{}' of type {} needs the '{}' capability, which the {} store does not provide",
                self.name,
                self.kind,
                capability,
                self.store.name()
            )),
            other => other.into(),
        })
    }

    async fn pop_one(&self) -> Result<Option<String>, QueueError> {
        let value = match self.structure {
            Structure::List => self.store.lpop(&self.name).await?,
            Structure::Set => self.store.spop(&self.name, 1).await?.into_iter().next(),
        };
        Ok(value)
    }
}

#[async_trait]
impl QueueBackend for KvQueue {
    fn queue_name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> QueueKind {
        self.kind
    }

    fn meta(&self) -> &dyn QueueMeta {
        &self.meta
    }

    async fn add_values(&self, values: &[String]) -> Result<AddOutcome, QueueError> {
        let (storable, failed) = partition_storable(values, self.max_value_size());
        let mut outcome = AddOutcome {
            failed,
            ..Default::default()
        };

        if self.transport == Transport::Single {
            for value in storable {
                match self.store.call(self.add_command(value)).await {
                    Ok(_) => {
                        outcome.bytes_added += value.len();
                        outcome.call_count += 1;
                    }
                    Err(e) if e.is_transient() => return Err(e.into()),
                    Err(e) => {
                        warn!(queue = %self.name, error = %e, "Value not added");
                        outcome.failed.push(value.clone());
                    }
                }
            }
            return Ok(outcome);
        }

        if storable.is_empty() {
            return Ok(outcome);
        }
        let commands: Vec<Command> = storable.iter().map(|v| self.add_command(v)).collect();
        outcome.call_count = commands.len();
        let replies = self.pipeline(commands).await?;
        for (value, reply) in storable.into_iter().zip(replies) {
            match reply.into_result() {
                Ok(_) => outcome.bytes_added += value.len(),
                Err(e) => {
                    warn!(queue = %self.name, error = %e, "Value not added");
                    outcome.failed.push(value.clone());
                }
            }
        }
        Ok(outcome)
    }

    async fn get_values(&self, count: usize) -> Result<GetOutcome, QueueError> {
        let mut outcome = GetOutcome::default();
        if count == 0 {
            return Ok(outcome);
        }
        match self.transport {
            Transport::Single => {
                while outcome.values.len() < count {
                    match self.pop_one().await? {
                        Some(value) => {
                            outcome.values.push(value);
                            outcome.call_count += 1;
                        }
                        None => break,
                    }
                }
            }
            Transport::Pipe => {
                let commands: Vec<Command> = (0..count).map(|_| self.pop_command()).collect();
                outcome.call_count = commands.len();
                for reply in self.pipeline(commands).await? {
                    match reply {
                        Reply::Str(value) => outcome.values.push(value),
                        Reply::List(values) => outcome.values.extend(values),
                        Reply::Nil => {}
                        other => {
                            other.into_result()?;
                        }
                    }
                }
            }
            Transport::PipeExec => {
                outcome.values = self.store.spop(&self.name, count).await?;
                outcome.call_count = 1;
            }
        }
        Ok(outcome)
    }

    async fn does_exist(&self) -> Result<bool, QueueError> {
        Ok(self.store.exists(&self.name).await?)
    }

    async fn queue_length(&self) -> Result<Option<usize>, QueueError> {
        let len = match self.structure {
            Structure::List => self.store.llen(&self.name).await?,
            Structure::Set => self.store.scard(&self.name).await?,
        };
        Ok(Some(len))
    }

    async fn purge(&self) -> Result<(), QueueError> {
        self.store.delete(&[self.name.clone()]).await?;
        Ok(())
    }
}
