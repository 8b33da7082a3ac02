//! Messages for the `reindex.store.KvService` gRPC service.
//!
//! One generic [`Command`] message carries every key/value operation:
//! `name` selects it and the fields it does not use stay at their
//! defaults. Conversions to and from [`crate::kv`] live in
//! [`crate::wire`].

use std::collections::BTreeMap;

include!(concat!(env!("OUT_DIR"), "/reindex.store.KvService.rs"));

#[derive(Clone, PartialEq, prost::Message)]
pub struct Command {
    #[prost(string, tag = "1")]
    pub name: String,
    /// Key, or the prefix for `keys`
    #[prost(string, tag = "2")]
    pub key: String,
    /// Value for `set`, list values, set members, or keys for `delete`
    #[prost(string, repeated, tag = "3")]
    pub values: Vec<String>,
    /// Range start, `incrby` delta, or `spop` count
    #[prost(int64, tag = "4")]
    pub start: i64,
    #[prost(int64, tag = "5")]
    pub stop: i64,
    #[prost(btree_map = "string, string", tag = "6")]
    pub fields: BTreeMap<String, String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ReplyKind {
    Nil = 0,
    Ok = 1,
    Bool = 2,
    Int = 3,
    Str = 4,
    List = 5,
    Map = 6,
    Error = 7,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ErrorClass {
    Other = 0,
    WrongType = 1,
    Unsupported = 2,
    InvalidArgument = 3,
    Connection = 4,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Reply {
    #[prost(enumeration = "ReplyKind", tag = "1")]
    pub kind: i32,
    #[prost(bool, tag = "2")]
    pub flag: bool,
    #[prost(int64, tag = "3")]
    pub integer: i64,
    /// String value, or the message of an error reply
    #[prost(string, tag = "4")]
    pub text: String,
    #[prost(string, repeated, tag = "5")]
    pub list: Vec<String>,
    #[prost(btree_map = "string, string", tag = "6")]
    pub map: BTreeMap<String, String>,
    #[prost(enumeration = "ErrorClass", tag = "7")]
    pub error_class: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ExecuteRequest {
    #[prost(message, optional, tag = "1")]
    pub command: Option<Command>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ExecuteResponse {
    #[prost(message, optional, tag = "1")]
    pub reply: Option<Reply>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PipelineRequest {
    #[prost(message, repeated, tag = "1")]
    pub commands: Vec<Command>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PipelineResponse {
    #[prost(message, repeated, tag = "1")]
    pub replies: Vec<Reply>,
}
