//! Removes agent versions that are neither in use nor the latest
//!
//! A version is in use while its `gc/<version>/` ledger directory holds at
//! least one pod marker. Under the ledger lock an unused version's payloads
//! are renamed aside and its ledger entry is removed; the renamed payloads
//! are deleted once the lock is released. A concurrent publish therefore
//! either records its marker first or finds no payload and installs a fresh
//! one.
//!
//! Each pass also deletes staging and trash directories that earlier runs
//! left in the tenant's `bin/` directory.

use crate::{
    fs::Filesystem,
    layout::{self, Flavor, Layout},
};
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

/// Garbage collection failures. Any failure aborts the pass.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The ledger directory exists but cannot be listed.
    #[error("failed to read usage ledger {path}: {source}")]
    ReadLedger {
        /// The ledger directory.
        path: PathBuf,
        /// The underlying failure.
        source: io::Error,
    },

    /// A version's ledger entry cannot be listed.
    #[error("failed to read usage of version {version}: {source}")]
    ReadVersion {
        /// The version.
        version: String,
        /// The underlying failure.
        source: io::Error,
    },

    /// A directory could not be removed.
    #[error("failed to remove {path}: {source}")]
    Remove {
        /// The directory.
        path: PathBuf,
        /// The underlying failure.
        source: io::Error,
    },
}

/// The outcome of a pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    /// Versions whose binaries and ledger entries were removed.
    pub removed: Vec<String>,

    /// Versions that were kept because they are the latest or in use.
    pub retained: Vec<String>,
}

/// Collects unused agent versions.
#[derive(Clone)]
pub struct GarbageCollector {
    fs: Arc<dyn Filesystem>,
    layout: Layout,
}

// === impl GarbageCollector ===

impl GarbageCollector {
    /// Creates a collector over the data directory described by `layout`.
    pub fn new(fs: Arc<dyn Filesystem>, layout: Layout) -> Self {
        Self { fs, layout }
    }

    /// Removes every version of the tenant that has no pod markers and is not
    /// `latest_version`.
    pub fn collect(&self, tenant_uuid: &str, latest_version: &str) -> Result<Summary, Error> {
        let env = self.layout.env(tenant_uuid);
        self.sweep(&env.bin_dir());

        let gc_dir = env.gc_dir();
        let mut versions = match self.fs.read_dir(&gc_dir) {
            Ok(versions) => versions,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %gc_dir.display(), "No usage ledger");
                return Ok(Summary::default());
            }
            Err(source) => {
                return Err(Error::ReadLedger {
                    path: gc_dir,
                    source,
                })
            }
        };
        versions.sort();

        let mut summary = Summary::default();
        for version in versions {
            if version == latest_version {
                tracing::debug!(%version, "Keeping latest version");
                summary.retained.push(version);
                continue;
            }

            let trash = {
                let _ledger = self.layout.lock_ledger(tenant_uuid);
                let markers = self
                    .fs
                    .read_dir(&env.gc_version_dir(&version))
                    .map_err(|source| Error::ReadVersion {
                        version: version.clone(),
                        source,
                    })?;
                if !markers.is_empty() {
                    tracing::debug!(%version, pods = markers.len(), "Version in use");
                    summary.retained.push(version);
                    continue;
                }

                let mut trash = Vec::with_capacity(Flavor::ALL.len());
                for flavor in Flavor::ALL {
                    let path = env.flavored_agent_dir(&version, flavor);
                    let aside = layout::scratch_path(&path, layout::TRASH_SUFFIX);
                    match self.fs.rename(&path, &aside) {
                        Ok(()) => trash.push(aside),
                        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                        Err(source) => return Err(Error::Remove { path, source }),
                    }
                }
                let path = env.gc_version_dir(&version);
                self.fs
                    .remove_dir_all(&path)
                    .map_err(|source| Error::Remove { path, source })?;
                trash
            };

            tracing::info!(%version, "Removing unused version");
            for path in trash {
                self.fs
                    .remove_dir_all(&path)
                    .map_err(|source| Error::Remove { path, source })?;
            }
            summary.removed.push(version);
        }

        Ok(summary)
    }

    /// Deletes scratch directories nobody is working on. Failures are logged
    /// and retried on the next pass.
    fn sweep(&self, bin_dir: &Path) {
        let Ok(names) = self.fs.read_dir(bin_dir) else {
            return;
        };
        for name in names.into_iter().filter(|n| layout::is_stale_scratch(n)) {
            let path = bin_dir.join(&name);
            match self.fs.remove_dir_all(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "Removed stale directory"),
                Err(error) => {
                    tracing::warn!(%error, path = %path.display(), "Failed to remove stale directory");
                }
            }
        }
    }
}
