//! Resolves the paths a pod's volume is built from

use crate::{
    cluster::{self, Cluster},
    crd::DynaKube,
    fs::Filesystem,
    labels::{self, InvalidSelector, Labels},
    layout::{EnvDir, Layout},
    publish,
};
use kube::ResourceExt;
use std::{io, path::PathBuf, sync::Arc};

/// The paths needed to mount agent binaries into one pod.
///
/// Computed per publish request and never persisted.
#[derive(Clone, Debug)]
pub struct BindConfig {
    /// `<env>/bin/<version>`. The payload is installed at this path suffixed
    /// with `-<flavor>`.
    pub agent_dir: PathBuf,

    /// The tenant's directory.
    pub env_dir: EnvDir,

    /// The tenant the pod's namespace belongs to.
    pub tenant_uuid: String,

    /// The version to mount.
    pub version: String,

    /// The DynaKube that selects the pod's namespace.
    pub dynakube: DynaKube,
}

/// Reasons a bind config cannot be resolved.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The pod's namespace could not be read.
    #[error("failed to query namespace {namespace}: {source}")]
    Namespace {
        /// The namespace.
        namespace: String,
        /// The underlying failure.
        source: cluster::Error,
    },

    /// DynaKubes could not be listed.
    #[error("failed to list DynaKubes: {0}")]
    ListDynaKubes(#[source] cluster::Error),

    /// A DynaKube's namespace selector is malformed.
    #[error("DynaKube {dynakube} has an invalid namespace selector: {source}")]
    Selector {
        /// The DynaKube's name.
        dynakube: String,
        /// The malformed requirement.
        source: InvalidSelector,
    },

    /// No DynaKube selects the namespace.
    #[error("namespace '{0}' doesn't have DynaKube assigned")]
    NotAssigned(String),

    /// More than one DynaKube selects the namespace.
    #[error("namespace '{namespace}' is selected by multiple DynaKubes: {dynakubes:?}")]
    Ambiguous {
        /// The namespace.
        namespace: String,
        /// The names of the matching DynaKubes.
        dynakubes: Vec<String>,
    },

    /// The DynaKube's environment has not been provisioned yet.
    #[error("failed to extract tenant for DynaKube {dynakube}: {source}")]
    Tenant {
        /// The DynaKube's name.
        dynakube: String,
        /// The underlying failure.
        source: io::Error,
    },

    /// The per-pod directories could not be created.
    #[error("failed to create pod directories: {0}")]
    PodDirectories(#[source] io::Error),

    /// The environment has no installed version.
    #[error("failed to query agent directory for DynaKube {dynakube}: {source}")]
    Version {
        /// The DynaKube's name.
        dynakube: String,
        /// The underlying failure.
        source: io::Error,
    },
}

/// Resolves [`BindConfig`]s against the cluster and the data directory.
#[derive(Clone)]
pub struct Resolver {
    cluster: Arc<dyn Cluster>,
    fs: Arc<dyn Filesystem>,
    layout: Layout,
}

// === impl Resolver ===

impl Resolver {
    /// Creates a resolver.
    pub fn new(cluster: Arc<dyn Cluster>, fs: Arc<dyn Filesystem>, layout: Layout) -> Self {
        Self {
            cluster,
            fs,
            layout,
        }
    }

    /// Resolves the bind config for a pod, creating its log and data storage
    /// directories.
    pub async fn resolve(&self, namespace: &str, pod_uid: &str) -> Result<BindConfig, Error> {
        let labels = self
            .cluster
            .namespace_labels(namespace)
            .await
            .map_err(|source| Error::Namespace {
                namespace: namespace.to_string(),
                source,
            })?;

        let dynakubes = self
            .cluster
            .dynakubes()
            .await
            .map_err(Error::ListDynaKubes)?;
        let dk = find_for_namespace(&dynakubes, namespace, &labels)?;
        let dynakube = dk.name_any();

        let tenant_uuid = read_trimmed(&*self.fs, &self.layout.tenant_file(&dynakube))
            .map_err(|source| Error::Tenant {
                dynakube: dynakube.clone(),
                source,
            })?;
        let env_dir = self.layout.env(&tenant_uuid);

        for dir in [env_dir.log_dir(pod_uid), env_dir.datastorage_dir(pod_uid)] {
            self.fs
                .create_dir_all(&dir, 0o777)
                .map_err(Error::PodDirectories)?;
        }

        let version =
            read_trimmed(&*self.fs, &env_dir.version_file()).map_err(|source| Error::Version {
                dynakube: dynakube.clone(),
                source,
            })?;

        tracing::debug!(%namespace, %dynakube, %tenant_uuid, %version, "Resolved bind config");
        Ok(BindConfig {
            agent_dir: env_dir.agent_dir(&version),
            env_dir,
            tenant_uuid,
            version,
            dynakube: dk.clone(),
        })
    }
}

/// Finds the DynaKube whose code-modules selector matches the namespace.
pub fn find_for_namespace<'d>(
    dynakubes: &'d [DynaKube],
    namespace: &str,
    labels: &Labels,
) -> Result<&'d DynaKube, Error> {
    let mut matching = Vec::new();
    for dk in dynakubes.iter().filter(|dk| dk.code_modules_enabled()) {
        let selected = labels::selector_matches(&dk.spec.code_modules.selector, labels)
            .map_err(|source| Error::Selector {
                dynakube: dk.name_any(),
                source,
            })?;
        if selected {
            matching.push(dk);
        }
    }

    match matching[..] {
        [] => Err(Error::NotAssigned(namespace.to_string())),
        [dk] => Ok(dk),
        _ => Err(Error::Ambiguous {
            namespace: namespace.to_string(),
            dynakubes: matching.iter().map(|dk| dk.name_any()).collect(),
        }),
    }
}

fn read_trimmed(fs: &dyn Filesystem, path: &std::path::Path) -> io::Result<String> {
    let bytes = fs.read(path)?;
    let s = String::from_utf8(bytes)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        .trim()
        .to_string();
    if s.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} is empty", path.display()),
        ));
    }
    Ok(s)
}

impl From<Error> for publish::Error {
    fn from(error: Error) -> Self {
        let msg = error.to_string();
        match error {
            Error::Namespace { .. } | Error::NotAssigned(_) | Error::Ambiguous { .. } => {
                publish::Error::FailedPrecondition(msg)
            }
            Error::Tenant { .. } => publish::Error::Unavailable(msg),
            Error::ListDynaKubes(_)
            | Error::Selector { .. }
            | Error::PodDirectories(_)
            | Error::Version { .. } => publish::Error::Internal(msg),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        cluster::fake::FakeCluster,
        crd::{CodeModulesSpec, DynaKubeSpec},
        fs::MemFs,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use maplit::{btreemap, convert_args};
    use std::path::Path;

    const NAMESPACE: &str = "test-namespace";
    const POD_UID: &str = "a-pod-uid";
    const DK_NAME: &str = "a-dynakube";
    const TENANT_UUID: &str = "a-tenant-uuid";
    const AGENT_VERSION: &str = "1.2-3";

    fn dynakube(enabled: bool) -> DynaKube {
        let mut dk = DynaKube::new(
            DK_NAME,
            DynaKubeSpec {
                code_modules: CodeModulesSpec {
                    enabled,
                    selector: LabelSelector {
                        match_labels: Some(convert_args!(btreemap!("someLabel" => DK_NAME))),
                        ..Default::default()
                    },
                },
                ..Default::default()
            },
        );
        dk.metadata.namespace = Some("dynatrace".to_string());
        dk
    }

    fn cluster(labels: Option<Labels>, dynakubes: Vec<DynaKube>) -> Arc<FakeCluster> {
        let cluster = FakeCluster::default();
        if let Some(labels) = labels {
            cluster
                .namespaces
                .lock()
                .insert(NAMESPACE.to_string(), labels);
        }
        *cluster.dynakubes.lock() = dynakubes;
        Arc::new(cluster)
    }

    fn labeled() -> Option<Labels> {
        Some(convert_args!(btreemap!("someLabel" => DK_NAME)))
    }

    fn resolver(cluster: Arc<FakeCluster>, fs: &MemFs) -> Resolver {
        Resolver::new(cluster, Arc::new(fs.clone()), Layout::new("/"))
    }

    fn provision(fs: &MemFs, version: bool) {
        fs.create_dir_all(Path::new("/data"), 0o755).unwrap();
        fs.write(Path::new("/data/tenant-a-dynakube"), TENANT_UUID.as_bytes())
            .unwrap();
        if version {
            fs.create_dir_all(Path::new("/data/a-tenant-uuid"), 0o755)
                .unwrap();
            fs.write(
                Path::new("/data/a-tenant-uuid/version"),
                AGENT_VERSION.as_bytes(),
            )
            .unwrap();
        }
    }

    async fn resolve(resolver: &Resolver) -> Result<BindConfig, publish::Error> {
        resolver
            .resolve(NAMESPACE, POD_UID)
            .await
            .map_err(Into::into)
    }

    #[tokio::test]
    async fn no_namespace() {
        let fs = MemFs::default();
        let r = resolver(cluster(None, vec![dynakube(true)]), &fs);
        assert!(matches!(
            resolve(&r).await,
            Err(publish::Error::FailedPrecondition(_))
        ));
    }

    #[tokio::test]
    async fn no_dynakube_assigned() {
        let fs = MemFs::default();
        provision(&fs, true);
        let r = resolver(cluster(Some(Labels::new()), vec![dynakube(true)]), &fs);
        assert!(matches!(
            resolve(&r).await,
            Err(publish::Error::FailedPrecondition(_))
        ));

        // A matching DynaKube without code modules does not count.
        let r = resolver(cluster(labeled(), vec![dynakube(false)]), &fs);
        assert!(matches!(
            resolve(&r).await,
            Err(publish::Error::FailedPrecondition(_))
        ));
    }

    #[tokio::test]
    async fn listing_fails() {
        let fs = MemFs::default();
        let cluster = cluster(labeled(), vec![dynakube(true)]);
        cluster
            .fail_list
            .store(true, std::sync::atomic::Ordering::Relaxed);
        let r = resolver(cluster, &fs);
        assert!(matches!(
            resolve(&r).await,
            Err(publish::Error::Internal(_))
        ));
    }

    #[tokio::test]
    async fn tenant_not_provisioned() {
        let fs = MemFs::default();
        let r = resolver(cluster(labeled(), vec![dynakube(true)]), &fs);
        assert!(matches!(
            resolve(&r).await,
            Err(publish::Error::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn fails_to_create_directories() {
        let fs = MemFs::default();
        provision(&fs, false);
        fs.set_read_only(true);
        let r = resolver(cluster(labeled(), vec![dynakube(true)]), &fs);
        assert!(matches!(
            resolve(&r).await,
            Err(publish::Error::Internal(_))
        ));
    }

    #[tokio::test]
    async fn version_missing() {
        let fs = MemFs::default();
        provision(&fs, false);
        let r = resolver(cluster(labeled(), vec![dynakube(true)]), &fs);
        assert!(matches!(
            resolve(&r).await,
            Err(publish::Error::Internal(_))
        ));
    }

    #[tokio::test]
    async fn ambiguous_selection() {
        let fs = MemFs::default();
        provision(&fs, true);
        let mut other = dynakube(true);
        other.metadata.name = Some("another-dynakube".to_string());
        let r = resolver(cluster(labeled(), vec![dynakube(true), other]), &fs);
        assert!(matches!(
            resolve(&r).await,
            Err(publish::Error::FailedPrecondition(_))
        ));
    }

    #[tokio::test]
    async fn creates_bind_config() {
        let fs = MemFs::default();
        provision(&fs, true);
        let r = resolver(cluster(labeled(), vec![dynakube(true)]), &fs);

        let config = resolve(&r).await.unwrap();
        assert_eq!(
            config.agent_dir,
            PathBuf::from("/data/a-tenant-uuid/bin/1.2-3")
        );
        assert_eq!(config.env_dir.root(), Path::new("/data/a-tenant-uuid"));
        assert_eq!(config.version, AGENT_VERSION);
        assert_eq!(config.tenant_uuid, TENANT_UUID);
        assert!(fs.exists(Path::new("/data/a-tenant-uuid/log/a-pod-uid")));
        assert!(fs.exists(Path::new("/data/a-tenant-uuid/datastorage/a-pod-uid")));

        // Resolving again is idempotent.
        let again = resolve(&r).await.unwrap();
        assert_eq!(again.agent_dir, config.agent_dir);
        assert_eq!(again.dynakube.name_any(), DK_NAME);
    }
}
