//! Messages for the `reindex.daemon.IndexerStatus` gRPC service.
//!
//! Views travel as rendered JSON so new view fields need no schema change.

include!(concat!(env!("OUT_DIR"), "/reindex.daemon.IndexerStatus.rs"));

#[derive(Clone, PartialEq, prost::Message)]
pub struct StatusRequest {
    /// raw, split, minimal, events or listener
    #[prost(string, tag = "1")]
    pub view: String,
    /// Event tag or `start:stop` range; empty for the default
    #[prost(string, tag = "2")]
    pub events: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StatusResponse {
    #[prost(string, tag = "1")]
    pub json: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReindexRequest {
    /// `all` or a comma separated id list
    #[prost(string, tag = "1")]
    pub requested: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReindexResponse {
    /// The pending request after merging, as JSON
    #[prost(string, tag = "1")]
    pub pending_json: String,
}
