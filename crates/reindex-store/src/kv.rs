//! The key/value contract shared by every backend.
//!
//! Backends implement [`KvStore::call`] for a single [`Command`]; the typed
//! Redis-style helpers are provided on top of it, so the in-memory, RocksDB
//! and networked stores all speak the same command set.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::{ErrorKind, StoreError};

/// One primitive operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get { key: String },
    Set { key: String, value: String },
    IncrBy { key: String, delta: i64 },
    Exists { key: String },
    Delete { keys: Vec<String> },
    Keys { prefix: String },
    LPush { key: String, values: Vec<String> },
    LPop { key: String },
    LLen { key: String },
    LRange { key: String, start: i64, stop: i64 },
    LTrim { key: String, start: i64, stop: i64 },
    SAdd { key: String, members: Vec<String> },
    SPop { key: String, count: usize },
    SCard { key: String },
    HSet { key: String, fields: BTreeMap<String, String> },
    HGetAll { key: String },
    Ping,
}

impl Command {
    /// Lowercase command name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "get",
            Command::Set { .. } => "set",
            Command::IncrBy { .. } => "incrby",
            Command::Exists { .. } => "exists",
            Command::Delete { .. } => "delete",
            Command::Keys { .. } => "keys",
            Command::LPush { .. } => "lpush",
            Command::LPop { .. } => "lpop",
            Command::LLen { .. } => "llen",
            Command::LRange { .. } => "lrange",
            Command::LTrim { .. } => "ltrim",
            Command::SAdd { .. } => "sadd",
            Command::SPop { .. } => "spop",
            Command::SCard { .. } => "scard",
            Command::HSet { .. } => "hset",
            Command::HGetAll { .. } => "hgetall",
            Command::Ping => "ping",
        }
    }
}

/// Result of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Nil,
    Ok,
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<String>),
    Map(BTreeMap<String, String>),
    Error { kind: ErrorKind, message: String },
}

impl Reply {
    /// Fold a command outcome into a reply, errors included.
    pub fn from_result(result: Result<Reply, StoreError>) -> Self {
        match result {
            Ok(reply) => reply,
            Err(err) => Reply::from_error(&err),
        }
    }

    pub fn from_error(err: &StoreError) -> Self {
        Reply::Error {
            kind: err.kind(),
            message: err.detail(),
        }
    }

    /// Turn an error reply back into an `Err`.
    pub fn into_result(self) -> Result<Reply, StoreError> {
        match self {
            Reply::Error { kind, message } => Err(kind.into_error(message)),
            other => Ok(other),
        }
    }

    pub fn into_unit(self) -> Result<(), StoreError> {
        match self.into_result()? {
            Reply::Ok | Reply::Nil => Ok(()),
            other => Err(unexpected("ok", &other)),
        }
    }

    pub fn into_opt_string(self) -> Result<Option<String>, StoreError> {
        match self.into_result()? {
            Reply::Nil => Ok(None),
            Reply::Str(value) => Ok(Some(value)),
            other => Err(unexpected("string", &other)),
        }
    }

    pub fn into_int(self) -> Result<i64, StoreError> {
        match self.into_result()? {
            Reply::Int(value) => Ok(value),
            other => Err(unexpected("integer", &other)),
        }
    }

    pub fn into_count(self) -> Result<usize, StoreError> {
        let value = self.into_int()?;
        usize::try_from(value)
            .map_err(|_| StoreError::Protocol(format!("negative count {}", value)))
    }

    pub fn into_bool(self) -> Result<bool, StoreError> {
        match self.into_result()? {
            Reply::Bool(value) => Ok(value),
            other => Err(unexpected("bool", &other)),
        }
    }

    pub fn into_list(self) -> Result<Vec<String>, StoreError> {
        match self.into_result()? {
            Reply::List(values) => Ok(values),
            Reply::Nil => Ok(Vec::new()),
            other => Err(unexpected("list", &other)),
        }
    }

    pub fn into_map(self) -> Result<BTreeMap<String, String>, StoreError> {
        match self.into_result()? {
            Reply::Map(fields) => Ok(fields),
            Reply::Nil => Ok(BTreeMap::new()),
            other => Err(unexpected("map", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &Reply) -> StoreError {
    StoreError::Protocol(format!("expected {} reply, got {:?}", wanted, got))
}

pub(crate) fn count_reply(n: usize) -> Reply {
    Reply::Int(i64::try_from(n).unwrap_or(i64::MAX))
}

/// Redis-like key/value store.
///
/// A key holds exactly one kind of value (string, list, set or hash);
/// using it as another kind fails with [`StoreError::WrongType`]. Empty
/// lists, sets and hashes are removed.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Execute one command.
    async fn call(&self, command: Command) -> Result<Reply, StoreError>;

    /// Execute commands as one batch, returning one reply per command.
    ///
    /// A failing command yields an error reply in its slot; the rest still
    /// run. Backends without a batching transport return `Unsupported`.
    async fn pipeline(&self, commands: Vec<Command>) -> Result<Vec<Reply>, StoreError> {
        let _ = commands;
        Err(StoreError::Unsupported("pipeline".to_string()))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.call(Command::Ping).await?.into_unit()
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.call(Command::Get { key: key.to_string() })
            .await?
            .into_opt_string()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.call(Command::Set {
            key: key.to_string(),
            value: value.to_string(),
        })
        .await?
        .into_unit()
    }

    /// Add `delta` to an integer string (missing keys count as 0).
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.call(Command::IncrBy {
            key: key.to_string(),
            delta,
        })
        .await?
        .into_int()
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.call(Command::Exists { key: key.to_string() })
            .await?
            .into_bool()
    }

    /// Remove keys of any kind; returns how many existed.
    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError> {
        self.call(Command::Delete { keys: keys.to_vec() })
            .await?
            .into_count()
    }

    /// All keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.call(Command::Keys {
            prefix: prefix.to_string(),
        })
        .await?
        .into_list()
    }

    /// Insert each value at the head in turn; returns the new length.
    async fn lpush(&self, key: &str, values: &[String]) -> Result<usize, StoreError> {
        self.call(Command::LPush {
            key: key.to_string(),
            values: values.to_vec(),
        })
        .await?
        .into_count()
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.call(Command::LPop { key: key.to_string() })
            .await?
            .into_opt_string()
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        self.call(Command::LLen { key: key.to_string() })
            .await?
            .into_count()
    }

    /// Inclusive range; negative indices count from the end.
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        self.call(Command::LRange {
            key: key.to_string(),
            start,
            stop,
        })
        .await?
        .into_list()
    }

    /// Keep only the inclusive range.
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError> {
        self.call(Command::LTrim {
            key: key.to_string(),
            start,
            stop,
        })
        .await?
        .into_unit()
    }

    /// Returns the number of members that were not already present.
    async fn sadd(&self, key: &str, members: &[String]) -> Result<usize, StoreError> {
        self.call(Command::SAdd {
            key: key.to_string(),
            members: members.to_vec(),
        })
        .await?
        .into_count()
    }

    /// Remove and return up to `count` arbitrary members.
    async fn spop(&self, key: &str, count: usize) -> Result<Vec<String>, StoreError> {
        self.call(Command::SPop {
            key: key.to_string(),
            count,
        })
        .await?
        .into_list()
    }

    async fn scard(&self, key: &str) -> Result<usize, StoreError> {
        self.call(Command::SCard { key: key.to_string() })
            .await?
            .into_count()
    }

    /// Set hash fields; returns the number of fields that were new.
    async fn hset(&self, key: &str, fields: &BTreeMap<String, String>) -> Result<usize, StoreError> {
        self.call(Command::HSet {
            key: key.to_string(),
            fields: fields.clone(),
        })
        .await?
        .into_count()
    }

    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>, StoreError> {
        self.call(Command::HGetAll { key: key.to_string() })
            .await?
            .into_map()
    }
}

/// Resolve inclusive Redis-style `start..=stop` against a length.
///
/// Returns `None` when the range selects nothing.
pub(crate) fn normalize_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len_i = i64::try_from(len).unwrap_or(i64::MAX);
    let mut start = if start < 0 { start + len_i } else { start };
    let mut stop = if stop < 0 { stop + len_i } else { stop };
    if start < 0 {
        start = 0;
    }
    if stop >= len_i {
        stop = len_i - 1;
    }
    if start > stop || start >= len_i || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}
