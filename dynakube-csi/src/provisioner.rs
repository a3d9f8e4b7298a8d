//! Prepares a tenant's environment directory ahead of pod scheduling
//!
//! For each DynaKube the provisioner records which tenant the instance belongs
//! to, installs the latest agent and then points the `version` file at it.
//! The version file is only updated once the payload is complete, so
//! publishers never resolve a version that is still being downloaded.

use crate::{
    crd::DynaKube,
    dtclient::DynatraceClient,
    fs::Filesystem,
    installer::{self, Installer, Package},
    layout::{Flavor, Layout},
    metrics::Metrics,
};
use kube::ResourceExt;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

/// Provisioning failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A state file or directory could not be written.
    #[error("failed to write {path}: {source}")]
    Write {
        /// The file or directory.
        path: PathBuf,
        /// The underlying failure.
        source: io::Error,
    },

    /// The agent could not be installed.
    #[error("failed to install agent: {0}")]
    Install(#[from] installer::Error),

    /// The install did not finish in time.
    #[error("timed out installing agent after {0:?}")]
    Timeout(Duration),
}

/// Writes tenant mappings and installs agents.
#[derive(Clone)]
pub struct Provisioner {
    fs: Arc<dyn Filesystem>,
    layout: Layout,
    arch: String,
    api_timeout: Duration,
    package: Package,
    metrics: Metrics,
}

/// The architecture name the deployment API uses for this host.
pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "arm",
        "powerpc64" => "ppcle",
        "s390x" => "s390",
        _ => "x86",
    }
}

// === impl Provisioner ===

impl Provisioner {
    /// Creates a provisioner writing below `layout`.
    pub fn new(
        fs: Arc<dyn Filesystem>,
        layout: Layout,
        arch: impl Into<String>,
        api_timeout: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            fs,
            layout,
            arch: arch.into(),
            api_timeout,
            package: Package::default(),
            metrics,
        }
    }

    /// Sets the kind of package agents are installed from.
    pub fn with_package(self, package: Package) -> Self {
        Self { package, ..self }
    }

    /// Makes `version` the current version of `dk`'s environment.
    ///
    /// Returns true if the agent had to be downloaded.
    pub async fn provision(
        &self,
        dk: &DynaKube,
        client: Arc<dyn DynatraceClient>,
        tenant_uuid: &str,
        version: &str,
    ) -> Result<bool, Error> {
        let env = self.layout.env(tenant_uuid);
        self.fs
            .create_dir_all(env.root(), 0o755)
            .map_err(|source| Error::Write {
                path: env.root().to_path_buf(),
                source,
            })?;
        self.replace(&self.layout.tenant_file(&dk.name_any()), tenant_uuid)?;

        let payload = env.flavored_agent_dir(version, Flavor::Default);
        let installed = if installer::is_installed(&*self.fs, &payload) {
            tracing::debug!(%version, "Agent already installed");
            false
        } else {
            self.install(client, &payload).await?;
            true
        };

        self.replace(&env.version_file(), version)?;
        tracing::info!(%version, tenant = %tenant_uuid, "Provisioned environment");
        Ok(installed)
    }

    async fn install(&self, client: Arc<dyn DynatraceClient>, payload: &Path) -> Result<(), Error> {
        let installer = Installer::new(self.fs.clone(), client).with_package(self.package);
        let res = tokio::time::timeout(
            self.api_timeout,
            installer.install(&self.arch, Flavor::Default, payload),
        )
        .await;
        self.metrics.install(Flavor::Default, matches!(res, Ok(Ok(()))));

        match res {
            Ok(res) => res.map_err(Error::from),
            Err(_) => Err(Error::Timeout(self.api_timeout)),
        }
    }

    /// Replaces the contents of `path` unless they are already `contents`.
    fn replace(&self, path: &Path, contents: &str) -> Result<(), Error> {
        match self.fs.read(path) {
            Ok(current) if current == contents.as_bytes() => return Ok(()),
            _ => {}
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        self.fs
            .write(&tmp, contents.as_bytes())
            .and_then(|()| self.fs.rename(&tmp, path))
            .map_err(|source| Error::Write {
                path: path.to_path_buf(),
                source,
            })
    }
}
