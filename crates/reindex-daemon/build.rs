//! Build script for reindex-daemon.
//!
//! Generates the `IndexerStatus` gRPC client and server with tonic-build
//! over the hand-written prost messages in `src/pb.rs`.

use tonic_build::manual::{Builder, Method, Service};

fn unary(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("crate::pb::{}", input))
        .output_type(format!("crate::pb::{}", output))
        .codec_path("tonic::codec::ProstCodec")
        .build()
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let service = Service::builder()
        .name("IndexerStatus")
        .package("reindex.daemon")
        .method(unary("get_status", "GetStatus", "StatusRequest", "StatusResponse"))
        .method(unary(
            "request_reindex",
            "RequestReindex",
            "ReindexRequest",
            "ReindexResponse",
        ))
        .build();

    Builder::new().compile(&[service]);
}
