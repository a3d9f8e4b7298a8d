//! The CSI `Identity` and `Node` gRPC services
//!
//! Both services are served on the unix socket the kubelet's plugin
//! registration points at.

use crate::{
    publish::{self, PublishRequest, Publisher},
    DRIVER_NAME,
};
use std::{future::Future, io, path::Path};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::{Request, Response, Status};

pub mod proto;

#[allow(missing_docs, clippy::all)]
mod identity {
    include!(concat!(env!("OUT_DIR"), "/csi.v1.Identity.rs"));
}

#[allow(missing_docs, clippy::all)]
mod node {
    include!(concat!(env!("OUT_DIR"), "/csi.v1.Node.rs"));
}

pub use self::{
    identity::identity_server::{Identity, IdentityServer},
    node::node_server::{Node, NodeServer},
};

/// Errors serving the gRPC services.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The socket could not be bound.
    #[error("failed to bind {path}: {source}")]
    Bind {
        /// The socket path.
        path: String,
        /// The underlying failure.
        source: io::Error,
    },

    /// The server failed.
    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),
}

/// Serves plugin metadata and readiness.
#[derive(Clone, Debug)]
pub struct IdentityService(());

/// Serves volume publication for one node.
#[derive(Clone)]
pub struct NodeService {
    node_id: String,
    publisher: Publisher,
}

/// Serves both services on the unix socket at `endpoint` until `shutdown`
/// completes.
pub async fn serve(
    endpoint: &Path,
    node: NodeService,
    shutdown: impl Future<Output = ()> + Send,
) -> Result<(), Error> {
    let bind_err = |source| Error::Bind {
        path: endpoint.display().to_string(),
        source,
    };
    if let Some(parent) = endpoint.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(bind_err)?;
    }
    match tokio::fs::remove_file(endpoint).await {
        Err(error) if error.kind() != io::ErrorKind::NotFound => return Err(bind_err(error)),
        _ => {}
    }
    let listener = tokio::net::UnixListener::bind(endpoint).map_err(bind_err)?;
    tracing::info!(endpoint = %endpoint.display(), "Serving CSI");

    tonic::transport::Server::builder()
        .add_service(IdentityServer::new(IdentityService::new()))
        .add_service(NodeServer::new(node))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
        .await?;

    tracing::debug!("CSI server stopped");
    Ok(())
}

impl From<publish::Error> for Status {
    fn from(error: publish::Error) -> Self {
        match error {
            publish::Error::FailedPrecondition(msg) => Status::failed_precondition(msg),
            publish::Error::Unavailable(msg) => Status::unavailable(msg),
            publish::Error::Internal(msg) => Status::internal(msg),
            publish::Error::InvalidArgument(msg) => Status::invalid_argument(msg),
        }
    }
}

// === impl IdentityService ===

impl IdentityService {
    /// Creates the identity service.
    pub fn new() -> Self {
        Self(())
    }
}

impl Default for IdentityService {
    fn default() -> Self {
        Self::new()
    }
}

#[tonic::async_trait]
impl Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _: Request<proto::GetPluginInfoRequest>,
    ) -> Result<Response<proto::GetPluginInfoResponse>, Status> {
        Ok(Response::new(proto::GetPluginInfoResponse {
            name: DRIVER_NAME.to_string(),
            vendor_version: env!("CARGO_PKG_VERSION").to_string(),
            manifest: Default::default(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _: Request<proto::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<proto::GetPluginCapabilitiesResponse>, Status> {
        Ok(Response::new(proto::GetPluginCapabilitiesResponse {}))
    }

    async fn probe(
        &self,
        _: Request<proto::ProbeRequest>,
    ) -> Result<Response<proto::ProbeResponse>, Status> {
        Ok(Response::new(proto::ProbeResponse {}))
    }
}

// === impl NodeService ===

impl NodeService {
    /// Serves `publisher` as node `node_id`.
    pub fn new(node_id: impl Into<String>, publisher: Publisher) -> Self {
        Self {
            node_id: node_id.into(),
            publisher,
        }
    }
}

#[tonic::async_trait]
impl Node for NodeService {
    async fn node_publish_volume(
        &self,
        req: Request<proto::NodePublishVolumeRequest>,
    ) -> Result<Response<proto::NodePublishVolumeResponse>, Status> {
        let req = req.into_inner();
        let publish =
            PublishRequest::from_context(&req.volume_id, &req.target_path, &req.volume_context)?;
        self.publisher.publish(&publish).await?;
        Ok(Response::new(proto::NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        req: Request<proto::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<proto::NodeUnpublishVolumeResponse>, Status> {
        let req = req.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("missing volume ID"));
        }
        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("missing target path"));
        }
        self.publisher
            .unpublish(&req.volume_id, Path::new(&req.target_path))
            .await?;
        Ok(Response::new(proto::NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_capabilities(
        &self,
        _: Request<proto::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<proto::NodeGetCapabilitiesResponse>, Status> {
        Ok(Response::new(proto::NodeGetCapabilitiesResponse {}))
    }

    async fn node_get_info(
        &self,
        _: Request<proto::NodeGetInfoRequest>,
    ) -> Result<Response<proto::NodeGetInfoResponse>, Status> {
        Ok(Response::new(proto::NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: 0,
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        bind::Resolver,
        cluster::fake::FakeCluster,
        dtclient::fake::{FakeClient, FakeFactory},
        fs::MemFs,
        layout::Layout,
        metrics::Metrics,
        mount::fake::FakeMounter,
    };
    use std::{sync::Arc, time::Duration};
    use tonic::Code;

    fn node_service() -> NodeService {
        let fs = Arc::new(MemFs::default());
        let layout = Layout::new("/");
        let resolver = Resolver::new(Arc::new(FakeCluster::default()), fs.clone(), layout.clone());
        let publisher = Publisher::new(
            resolver,
            fs,
            Arc::new(FakeMounter::default()),
            Arc::new(FakeFactory(Arc::new(FakeClient::default()))),
            layout,
            "x86",
            Duration::from_secs(1),
            Metrics::default(),
        );
        NodeService::new("node-a", publisher)
    }

    #[test]
    fn maps_error_kinds_to_codes() {
        let cases = [
            (publish::Error::FailedPrecondition("a".into()), Code::FailedPrecondition),
            (publish::Error::Unavailable("b".into()), Code::Unavailable),
            (publish::Error::Internal("c".into()), Code::Internal),
            (publish::Error::InvalidArgument("d".into()), Code::InvalidArgument),
        ];
        for (error, code) in cases {
            let msg = error.to_string();
            let status = Status::from(error);
            assert_eq!(status.code(), code);
            assert_eq!(status.message(), msg);
        }
    }

    #[tokio::test]
    async fn identity() {
        let svc = IdentityService::new();
        let info = svc
            .get_plugin_info(Request::new(proto::GetPluginInfoRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info.name, "csi.oneagent.dynatrace.com");
        assert!(!info.vendor_version.is_empty());
        svc.probe(Request::new(proto::ProbeRequest {})).await.unwrap();
    }

    #[tokio::test]
    async fn node_info() {
        let info = node_service()
            .node_get_info(Request::new(proto::NodeGetInfoRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info.node_id, "node-a");
    }

    #[tokio::test]
    async fn rejects_incomplete_requests() {
        let svc = node_service();
        let status = svc
            .node_publish_volume(Request::new(proto::NodePublishVolumeRequest {
                volume_id: "vol".to_string(),
                target_path: "/t".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);

        let status = svc
            .node_unpublish_volume(Request::new(proto::NodeUnpublishVolumeRequest {
                volume_id: String::new(),
                target_path: "/t".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn unknown_namespace_is_a_failed_precondition() {
        let status = node_service()
            .node_publish_volume(Request::new(proto::NodePublishVolumeRequest {
                volume_id: "vol".to_string(),
                target_path: "/t".to_string(),
                volume_context: [
                    (publish::POD_NAMESPACE_KEY.to_string(), "ns1".to_string()),
                    (publish::POD_UID_KEY.to_string(), "pod1".to_string()),
                ]
                .into_iter()
                .collect(),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn serves_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = dir.path().join("plugin/csi.sock");
        // A stale socket from a previous run is replaced.
        std::fs::create_dir_all(endpoint.parent().unwrap()).unwrap();
        std::fs::write(&endpoint, b"").unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn({
            let endpoint = endpoint.clone();
            async move {
                serve(&endpoint, node_service(), async move {
                    let _ = rx.await;
                })
                .await
            }
        });

        let mut connected = false;
        for _ in 0..100 {
            if tokio::net::UnixStream::connect(&endpoint).await.is_ok() {
                connected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(connected);

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
