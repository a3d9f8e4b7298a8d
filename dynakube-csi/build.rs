//! Generates the CSI `Identity` and `Node` gRPC server stubs.
//!
//! The message types are hand-written prost structs in `src/csi/proto.rs`, so
//! no `.proto` files (or `protoc`) are needed at build time.

use tonic_build::manual::{Builder, Method, Service};

fn method(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("crate::csi::proto::{input}"))
        .output_type(format!("crate::csi::proto::{output}"))
        .codec_path("tonic::codec::ProstCodec")
        .build()
}

fn main() {
    let identity = Service::builder()
        .name("Identity")
        .package("csi.v1")
        .method(method(
            "get_plugin_info",
            "GetPluginInfo",
            "GetPluginInfoRequest",
            "GetPluginInfoResponse",
        ))
        .method(method(
            "get_plugin_capabilities",
            "GetPluginCapabilities",
            "GetPluginCapabilitiesRequest",
            "GetPluginCapabilitiesResponse",
        ))
        .method(method("probe", "Probe", "ProbeRequest", "ProbeResponse"))
        .build();

    let node = Service::builder()
        .name("Node")
        .package("csi.v1")
        .method(method(
            "node_publish_volume",
            "NodePublishVolume",
            "NodePublishVolumeRequest",
            "NodePublishVolumeResponse",
        ))
        .method(method(
            "node_unpublish_volume",
            "NodeUnpublishVolume",
            "NodeUnpublishVolumeRequest",
            "NodeUnpublishVolumeResponse",
        ))
        .method(method(
            "node_get_capabilities",
            "NodeGetCapabilities",
            "NodeGetCapabilitiesRequest",
            "NodeGetCapabilitiesResponse",
        ))
        .method(method(
            "node_get_info",
            "NodeGetInfo",
            "NodeGetInfoRequest",
            "NodeGetInfoResponse",
        ))
        .build();

    Builder::new()
        .build_client(false)
        .compile(&[identity, node]);
}
