//! Conversions between [`crate::kv`] types and their gRPC messages.
//!
//! A failing single command travels as an error [`Reply`], keeping its
//! kind. Failures of a whole call travel as a [`Status`] and are mapped
//! back to the nearest [`StoreError`].

use tonic::{Code, Status};

use crate::error::{ErrorKind, StoreError};
use crate::kv::{Command, Reply};
use crate::pb;

impl From<Command> for pb::Command {
    fn from(command: Command) -> Self {
        let mut out = pb::Command {
            name: command.name().to_string(),
            ..Default::default()
        };
        match command {
            Command::Get { key }
            | Command::Exists { key }
            | Command::LPop { key }
            | Command::LLen { key }
            | Command::SCard { key }
            | Command::HGetAll { key } => out.key = key,
            Command::Keys { prefix } => out.key = prefix,
            Command::Set { key, value } => {
                out.key = key;
                out.values = vec![value];
            }
            Command::IncrBy { key, delta } => {
                out.key = key;
                out.start = delta;
            }
            Command::Delete { keys } => out.values = keys,
            Command::LPush { key, values } => {
                out.key = key;
                out.values = values;
            }
            Command::SAdd { key, members } => {
                out.key = key;
                out.values = members;
            }
            Command::LRange { key, start, stop } | Command::LTrim { key, start, stop } => {
                out.key = key;
                out.start = start;
                out.stop = stop;
            }
            Command::SPop { key, count } => {
                out.key = key;
                out.start = i64::try_from(count).unwrap_or(i64::MAX);
            }
            Command::HSet { key, fields } => {
                out.key = key;
                out.fields = fields;
            }
            Command::Ping => {}
        }
        out
    }
}

impl TryFrom<pb::Command> for Command {
    type Error = StoreError;

    fn try_from(raw: pb::Command) -> Result<Self, Self::Error> {
        let pb::Command {
            name,
            key,
            mut values,
            start,
            stop,
            fields,
        } = raw;
        let command = match name.as_str() {
            "get" => Command::Get { key },
            "set" => {
                if values.len() != 1 {
                    return Err(StoreError::Protocol(format!(
                        "set takes one value, got {}",
                        values.len()
                    )));
                }
                let value = values.pop().unwrap_or_default();
                Command::Set { key, value }
            }
            "incrby" => Command::IncrBy { key, delta: start },
            "exists" => Command::Exists { key },
            "delete" => Command::Delete { keys: values },
            "keys" => Command::Keys { prefix: key },
            "lpush" => Command::LPush { key, values },
            "lpop" => Command::LPop { key },
            "llen" => Command::LLen { key },
            "lrange" => Command::LRange { key, start, stop },
            "ltrim" => Command::LTrim { key, start, stop },
            "sadd" => Command::SAdd {
                key,
                members: values,
            },
            "spop" => Command::SPop {
                key,
                count: usize::try_from(start)
                    .map_err(|_| StoreError::Protocol(format!("negative spop count {}", start)))?,
            },
            "scard" => Command::SCard { key },
            "hset" => Command::HSet { key, fields },
            "hgetall" => Command::HGetAll { key },
            "ping" => Command::Ping,
            other => return Err(StoreError::Protocol(format!("unknown command '{}'", other))),
        };
        Ok(command)
    }
}

impl From<ErrorKind> for pb::ErrorClass {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::WrongType => pb::ErrorClass::WrongType,
            ErrorKind::Unsupported => pb::ErrorClass::Unsupported,
            ErrorKind::InvalidArgument => pb::ErrorClass::InvalidArgument,
            ErrorKind::Connection => pb::ErrorClass::Connection,
            ErrorKind::Other => pb::ErrorClass::Other,
        }
    }
}

impl From<pb::ErrorClass> for ErrorKind {
    fn from(class: pb::ErrorClass) -> Self {
        match class {
            pb::ErrorClass::WrongType => ErrorKind::WrongType,
            pb::ErrorClass::Unsupported => ErrorKind::Unsupported,
            pb::ErrorClass::InvalidArgument => ErrorKind::InvalidArgument,
            pb::ErrorClass::Connection => ErrorKind::Connection,
            pb::ErrorClass::Other => ErrorKind::Other,
        }
    }
}

impl From<Reply> for pb::Reply {
    fn from(reply: Reply) -> Self {
        let mut out = pb::Reply::default();
        let kind = match reply {
            Reply::Nil => pb::ReplyKind::Nil,
            Reply::Ok => pb::ReplyKind::Ok,
            Reply::Bool(value) => {
                out.flag = value;
                pb::ReplyKind::Bool
            }
            Reply::Int(value) => {
                out.integer = value;
                pb::ReplyKind::Int
            }
            Reply::Str(value) => {
                out.text = value;
                pb::ReplyKind::Str
            }
            Reply::List(values) => {
                out.list = values;
                pb::ReplyKind::List
            }
            Reply::Map(fields) => {
                out.map = fields;
                pb::ReplyKind::Map
            }
            Reply::Error { kind, message } => {
                out.set_error_class(kind.into());
                out.text = message;
                pb::ReplyKind::Error
            }
        };
        out.set_kind(kind);
        out
    }
}

impl TryFrom<pb::Reply> for Reply {
    type Error = StoreError;

    fn try_from(raw: pb::Reply) -> Result<Self, Self::Error> {
        let kind = pb::ReplyKind::try_from(raw.kind)
            .map_err(|_| StoreError::Protocol(format!("unknown reply kind {}", raw.kind)))?;
        let class = pb::ErrorClass::try_from(raw.error_class).unwrap_or(pb::ErrorClass::Other);
        Ok(match kind {
            pb::ReplyKind::Nil => Reply::Nil,
            pb::ReplyKind::Ok => Reply::Ok,
            pb::ReplyKind::Bool => Reply::Bool(raw.flag),
            pb::ReplyKind::Int => Reply::Int(raw.integer),
            pb::ReplyKind::Str => Reply::Str(raw.text),
            pb::ReplyKind::List => Reply::List(raw.list),
            pb::ReplyKind::Map => Reply::Map(raw.map),
            pb::ReplyKind::Error => Reply::Error {
                kind: class.into(),
                message: raw.text,
            },
        })
    }
}

pub(crate) fn status_from_error(err: &StoreError) -> Status {
    let detail = err.detail();
    match err.kind() {
        ErrorKind::WrongType => Status::failed_precondition(detail),
        ErrorKind::Unsupported => Status::unimplemented(detail),
        ErrorKind::InvalidArgument => Status::invalid_argument(detail),
        ErrorKind::Connection => Status::unavailable(detail),
        ErrorKind::Other => match err {
            StoreError::Protocol(_) => Status::invalid_argument(err.to_string()),
            _ => Status::internal(err.to_string()),
        },
    }
}

/// Transport failures and timeouts come back as transient connection errors.
pub(crate) fn error_from_status(status: Status) -> StoreError {
    let message = status.message().to_string();
    match status.code() {
        Code::FailedPrecondition => StoreError::WrongType(message),
        Code::Unimplemented => StoreError::Unsupported(message),
        Code::InvalidArgument => StoreError::InvalidArgument(message),
        Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled | Code::Unknown => {
            StoreError::Connection(format!("{:?}: {}", status.code(), message))
        }
        _ => StoreError::Remote(message),
    }
}
