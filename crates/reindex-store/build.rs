//! Build script for reindex-store.
//!
//! Generates the `KvService` gRPC client and server with tonic-build. The
//! messages are hand-written prost structs in `src/pb.rs`, so no protoc
//! is needed.

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
        .name("KvService")
        .package("reindex.store")
        .method(unary("execute", "Execute", "ExecuteRequest", "ExecuteResponse"))
        .method(unary("pipeline", "Pipeline", "PipelineRequest", "PipelineResponse"))
        .build();

    Builder::new().compile(&[service]);
}
