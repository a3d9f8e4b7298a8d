//! Publishes agent volumes into pods
//!
//! Publishing a volume resolves the pod's [`BindConfig`], records the pod in
//! the version's usage ledger, installs the payload if it is missing and
//! finally bind-mounts it. Only complete payloads are ever mounted; see
//! [`installer::is_installed`]. The ledger marker is written before anything is
//! mounted so that a concurrent garbage collection pass never removes a
//! version that is about to be used. Every step after the marker is undone
//! if a later step fails.

use crate::{
    bind::{BindConfig, Resolver},
    dtclient::ClientFactory,
    fs::Filesystem,
    installer::{self, Installer, Package, MOUNT_POINTS},
    layout::{Flavor, Layout},
    metrics::{Metrics, VolumeOp},
    mount::Mounter,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::Instrument;

/// The volume context key naming the pod's namespace.
pub const POD_NAMESPACE_KEY: &str = "csi.storage.k8s.io/pod.namespace";

/// The volume context key naming the pod's UID.
pub const POD_UID_KEY: &str = "csi.storage.k8s.io/pod.uid";

/// The volume context key selecting the payload flavor.
pub const FLAVOR_KEY: &str = "flavor";

/// Why a volume could not be published or unpublished.
///
/// Each variant corresponds to the gRPC status code returned to the kubelet.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The namespace is not set up for injection; retrying will not help.
    #[error("{0}")]
    FailedPrecondition(String),

    /// The environment is not ready yet; the kubelet should retry.
    #[error("{0}")]
    Unavailable(String),

    /// An unexpected local failure.
    #[error("{0}")]
    Internal(String),

    /// The request or the downloaded package is malformed.
    #[error("{0}")]
    InvalidArgument(String),
}

/// A request to publish a volume into a pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishRequest {
    /// The volume's ID.
    pub volume_id: String,

    /// Where the kubelet expects the volume to be mounted.
    pub target_path: PathBuf,

    /// The pod's namespace.
    pub namespace: String,

    /// The pod's UID.
    pub pod_uid: String,

    /// The payload flavor to mount.
    pub flavor: Flavor,
}

/// Publishes and unpublishes volumes.
#[derive(Clone)]
pub struct Publisher {
    resolver: Resolver,
    fs: Arc<dyn Filesystem>,
    mounter: Arc<dyn Mounter>,
    clients: Arc<dyn ClientFactory>,
    layout: Layout,
    arch: String,
    api_timeout: Duration,
    package: Package,
    metrics: Metrics,
}

/// Persisted so that unpublishing, which only learns the volume ID, can find
/// what publishing created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumeRecord {
    #[serde(rename = "podUID")]
    pod_uid: String,
    #[serde(rename = "tenantUUID")]
    tenant_uuid: String,
    version: String,
    flavor: String,
    target_path: PathBuf,
}

/// Undoes a partially completed publish unless committed.
struct Rollback<'a> {
    fs: &'a dyn Filesystem,
    mounter: &'a dyn Mounter,
    mounts: Vec<PathBuf>,
    files: Vec<PathBuf>,
    committed: bool,
}

fn internal(error: impl std::fmt::Display) -> Error {
    Error::Internal(error.to_string())
}

// === impl PublishRequest ===

impl PublishRequest {
    /// Builds a request from the CSI volume context.
    pub fn from_context(
        volume_id: &str,
        target_path: &str,
        context: &HashMap<String, String>,
    ) -> Result<Self, Error> {
        fn required<'c>(
            context: &'c HashMap<String, String>,
            key: &str,
        ) -> Result<&'c str, Error> {
            context
                .get(key)
                .map(String::as_str)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::InvalidArgument(format!("missing volume context {key}")))
        }

        if volume_id.is_empty() {
            return Err(Error::InvalidArgument("missing volume ID".to_string()));
        }
        if target_path.is_empty() {
            return Err(Error::InvalidArgument("missing target path".to_string()));
        }
        let flavor = match context.get(FLAVOR_KEY).filter(|f| !f.is_empty()) {
            Some(f) => f
                .parse()
                .map_err(|e| Error::InvalidArgument(format!("{e}")))?,
            None => Flavor::default(),
        };

        Ok(Self {
            volume_id: volume_id.to_string(),
            target_path: PathBuf::from(target_path),
            namespace: required(context, POD_NAMESPACE_KEY)?.to_string(),
            pod_uid: required(context, POD_UID_KEY)?.to_string(),
            flavor,
        })
    }
}

// === impl Publisher ===

impl Publisher {
    /// Creates a publisher.
    ///
    /// `arch` is the architecture passed to the deployment API when a payload
    /// has to be downloaded; `api_timeout` bounds that download.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        resolver: Resolver,
        fs: Arc<dyn Filesystem>,
        mounter: Arc<dyn Mounter>,
        clients: Arc<dyn ClientFactory>,
        layout: Layout,
        arch: impl Into<String>,
        api_timeout: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            resolver,
            fs,
            mounter,
            clients,
            layout,
            arch: arch.into(),
            api_timeout,
            package: Package::default(),
            metrics,
        }
    }

    /// Sets the kind of package missing payloads are installed from.
    pub fn with_package(self, package: Package) -> Self {
        Self { package, ..self }
    }

    /// Publishes a volume. Publishing an already mounted target succeeds
    /// without doing anything.
    pub async fn publish(&self, req: &PublishRequest) -> Result<(), Error> {
        let span = tracing::info_span!(
            "publish",
            volume = %req.volume_id,
            pod = %req.pod_uid,
            namespace = %req.namespace,
        );
        let res = self.publish_inner(req).instrument(span).await;
        self.metrics.volume_op(VolumeOp::Publish, &res);
        res
    }

    /// Unpublishes a volume. Unknown volumes are unpublished successfully.
    ///
    /// Unpublishing only touches the local filesystem and may wait for the
    /// ledger lock, so it runs on the blocking pool.
    pub async fn unpublish(&self, volume_id: &str, target_path: &Path) -> Result<(), Error> {
        let span = tracing::info_span!("unpublish", volume = %volume_id);
        let this = self.clone();
        let volume_id = volume_id.to_string();
        let target_path = target_path.to_path_buf();
        let res = tokio::task::spawn_blocking(move || {
            span.in_scope(|| this.unpublish_inner(&volume_id, &target_path))
        })
        .await
        .unwrap_or_else(|error| Err(internal(error)));
        self.metrics.volume_op(VolumeOp::Unpublish, &res);
        res
    }

    async fn publish_inner(&self, req: &PublishRequest) -> Result<(), Error> {
        if self
            .mounter
            .is_mounted(&req.target_path)
            .map_err(internal)?
        {
            tracing::debug!(target = %req.target_path.display(), "Already mounted");
            return Ok(());
        }

        let config = self.resolver.resolve(&req.namespace, &req.pod_uid).await?;
        let BindConfig {
            ref env_dir,
            ref tenant_uuid,
            ref version,
            ..
        } = config;

        let mut rollback = Rollback::new(&*self.fs, &*self.mounter);
        let marker = env_dir.marker(version, &req.pod_uid);
        self.write_marker(tenant_uuid, env_dir.gc_version_dir(version), marker.clone())
            .await?;
        rollback.files.push(marker);

        let payload = env_dir.flavored_agent_dir(version, req.flavor);
        if !installer::is_installed(&*self.fs, &payload) {
            self.install(&config, req.flavor, &payload).await?;
        }

        let record = VolumeRecord {
            pod_uid: req.pod_uid.clone(),
            tenant_uuid: tenant_uuid.clone(),
            version: version.clone(),
            flavor: req.flavor.to_string(),
            target_path: req.target_path.clone(),
        };
        let record_path = self.layout.volume_record(&req.volume_id);
        self.write_record(&record_path, &record)?;
        rollback.files.push(record_path);

        self.fs
            .create_dir_all(&req.target_path, 0o750)
            .map_err(internal)?;
        self.mounter
            .bind_mount(&payload, &req.target_path, true)
            .map_err(internal)?;
        rollback.mounts.push(req.target_path.clone());

        let per_pod = [
            env_dir.log_dir(&req.pod_uid),
            env_dir.datastorage_dir(&req.pod_uid),
        ];
        for (dir, source) in MOUNT_POINTS.iter().zip(per_pod) {
            let target = req.target_path.join(dir);
            self.mounter
                .bind_mount(&source, &target, false)
                .map_err(internal)?;
            rollback.mounts.push(target);
        }

        rollback.commit();
        tracing::info!(%version, flavor = %req.flavor, "Published volume");
        Ok(())
    }

    async fn install(
        &self,
        config: &BindConfig,
        flavor: Flavor,
        payload: &Path,
    ) -> Result<(), Error> {
        tracing::info!(version = %config.version, %flavor, "Installing missing agent");
        let client = self
            .clients
            .client(&config.dynakube)
            .await
            .map_err(|e| Error::Unavailable(e.to_string()))?;
        let installer = Installer::new(self.fs.clone(), client).with_package(self.package);
        let res = tokio::time::timeout(
            self.api_timeout,
            installer.install(&self.arch, flavor, payload),
        )
        .await;
        self.metrics.install(flavor, matches!(res, Ok(Ok(()))));
        match res {
            Ok(res) => res.map_err(Into::into),
            Err(_) => Err(Error::Unavailable(format!(
                "timed out installing agent after {:?}",
                self.api_timeout
            ))),
        }
    }

    /// Records that the pod uses the version. The ledger lock may be held by
    /// garbage collection, so it is taken off the async runtime.
    async fn write_marker(
        &self,
        tenant_uuid: &str,
        ledger: PathBuf,
        marker: PathBuf,
    ) -> Result<(), Error> {
        let fs = self.fs.clone();
        let layout = self.layout.clone();
        let tenant_uuid = tenant_uuid.to_string();
        tokio::task::spawn_blocking(move || {
            let _ledger = layout.lock_ledger(&tenant_uuid);
            fs.create_dir_all(&ledger, 0o755)?;
            fs.write(&marker, b"")
        })
        .await
        .map_err(internal)?
        .map_err(internal)
    }

    fn write_record(&self, path: &Path, record: &VolumeRecord) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            self.fs.create_dir_all(parent, 0o755).map_err(internal)?;
        }
        let json = serde_json::to_vec(record).map_err(internal)?;
        self.fs.write(path, &json).map_err(internal)
    }

    fn unpublish_inner(&self, volume_id: &str, target_path: &Path) -> Result<(), Error> {
        for dir in MOUNT_POINTS.iter().rev() {
            self.mounter
                .unmount(&target_path.join(dir))
                .map_err(internal)?;
        }
        self.mounter.unmount(target_path).map_err(internal)?;

        let record_path = self.layout.volume_record(volume_id);
        let record = match self.fs.read(&record_path) {
            Ok(bytes) => serde_json::from_slice::<VolumeRecord>(&bytes).map_err(internal)?,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("No volume record");
                return Ok(());
            }
            Err(error) => return Err(internal(error)),
        };

        let env_dir = self.layout.env(&record.tenant_uuid);
        {
            let _ledger = self.layout.lock_ledger(&record.tenant_uuid);
            remove_if_exists(&*self.fs, &env_dir.marker(&record.version, &record.pod_uid))?;
        }
        for dir in [
            env_dir.log_dir(&record.pod_uid),
            env_dir.datastorage_dir(&record.pod_uid),
        ] {
            self.fs.remove_dir_all(&dir).map_err(internal)?;
        }
        remove_if_exists(&*self.fs, &record_path)?;

        tracing::info!(version = %record.version, pod = %record.pod_uid, "Unpublished volume");
        Ok(())
    }
}

fn remove_if_exists(fs: &dyn Filesystem, path: &Path) -> Result<(), Error> {
    match fs.remove_file(path) {
        Err(error) if error.kind() != io::ErrorKind::NotFound => Err(internal(error)),
        _ => Ok(()),
    }
}

// === impl Rollback ===

impl<'a> Rollback<'a> {
    fn new(fs: &'a dyn Filesystem, mounter: &'a dyn Mounter) -> Self {
        Self {
            fs,
            mounter,
            mounts: Vec::new(),
            files: Vec::new(),
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for target in self.mounts.iter().rev() {
            if let Err(error) = self.mounter.unmount(target) {
                tracing::warn!(%error, target = %target.display(), "Failed to roll back mount");
            }
        }
        for file in self.files.iter().rev() {
            if let Err(error) = self.fs.remove_file(file) {
                tracing::warn!(%error, path = %file.display(), "Failed to roll back file");
            }
        }
    }
}
