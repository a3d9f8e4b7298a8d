//! Downloads agent packages and unpacks them into the data directory
//!
//! Two package types are supported: the self-extracting shell installer,
//! which is executed, and the zip package, which is extracted entry by entry.
//! Either way the download lands in a [`TempFile`] and the payload is built
//! in a hidden staging directory next to its final location. Only a complete
//! payload is renamed into place, so a payload directory that exists is
//! always ready to be mounted.

use crate::{
    dtclient::{self, DynatraceClient},
    fs::{Filesystem, TempFile},
    layout::{self, Flavor},
};
use std::{
    fmt,
    io::{self, Read, Seek, Write},
    path::{Component, Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::io::AsyncWriteExt;

/// Entries below this directory are made group-writable.
const AGENT_CONF_PATH: &str = "agent/conf";

/// Mount points created inside every payload for the per-pod directories.
pub const MOUNT_POINTS: [&str; 2] = ["log", "datastorage"];

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

/// Installation failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An archive entry resolves outside of the target directory.
    #[error("illegal file path: {0}")]
    IllegalPath(String),

    /// The package could not be downloaded.
    #[error("failed to fetch latest agent: {0}")]
    Download(#[from] dtclient::Error),

    /// The package is not a readable zip archive.
    #[error("invalid agent archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// The installer script did not succeed.
    #[error("installer script failed with {status}: {stderr}")]
    Script {
        /// The script's exit status.
        status: std::process::ExitStatus,
        /// The tail of the script's standard error.
        stderr: String,
    },

    /// A filesystem operation failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The kind of package agents are installed from.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Package {
    /// The zip package, extracted per flavor.
    #[default]
    Zip,

    /// The self-extracting shell installer.
    Script,
}

/// Indicates that an unknown package type was requested.
#[derive(Debug, thiserror::Error)]
#[error("invalid package type: {0} must be 'zip' or 'script'")]
pub struct InvalidPackage(String);

/// Installs agent packages for one environment.
#[derive(Clone)]
pub struct Installer {
    fs: Arc<dyn Filesystem>,
    client: Arc<dyn DynatraceClient>,
    package: Package,
}

// === impl Package ===

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Package::Zip => f.write_str("zip"),
            Package::Script => f.write_str("script"),
        }
    }
}

impl std::str::FromStr for Package {
    type Err = InvalidPackage;

    fn from_str(s: &str) -> Result<Self, InvalidPackage> {
        match s {
            "zip" => Ok(Package::Zip),
            "script" => Ok(Package::Script),
            s => Err(InvalidPackage(s.to_string())),
        }
    }
}

// === impl Installer ===

impl Installer {
    /// Creates an installer downloading zip packages through `client`.
    pub fn new(fs: Arc<dyn Filesystem>, client: Arc<dyn DynatraceClient>) -> Self {
        Self {
            fs,
            client,
            package: Package::default(),
        }
    }

    /// Sets the kind of package to install from.
    pub fn with_package(self, package: Package) -> Self {
        Self { package, ..self }
    }

    /// Installs the latest agent for `arch` and `flavor` as `target_dir`.
    ///
    /// Once the download has completed the install runs to completion even
    /// if this future is dropped. It then either renames a complete payload
    /// into place or removes its staging directory.
    pub async fn install(
        &self,
        arch: &str,
        flavor: Flavor,
        target_dir: &Path,
    ) -> Result<(), Error> {
        match self.package {
            Package::Zip => self.install_archive(arch, flavor, target_dir).await,
            Package::Script => self.install_script(arch, target_dir).await,
        }
    }

    /// Downloads the shell installer for `arch` and runs it against a
    /// staging directory for `target_dir`.
    pub async fn install_script(&self, arch: &str, target_dir: &Path) -> Result<(), Error> {
        let tmp = self
            .download(
                dtclient::INSTALLER_TYPE_PAAS_SH,
                dtclient::FLAVOR_MULTIDISTRO,
                arch,
            )
            .await?;
        self.fs.set_mode(tmp.path(), 0o500)?;

        let fs = self.fs.clone();
        let target = target_dir.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let res = stage(&*fs, &target, |staging| run_script(tmp.path(), staging));
            drop(tmp);
            res
        })
        .await
        .map_err(io::Error::other)??;
        tracing::info!(target = %target_dir.display(), "Installer script succeeded");
        Ok(())
    }

    /// Downloads the zip package for `arch` and `flavor` and extracts it into
    /// a staging directory for `target_dir`.
    pub async fn install_archive(
        &self,
        arch: &str,
        flavor: Flavor,
        target_dir: &Path,
    ) -> Result<(), Error> {
        let tmp = self
            .download(dtclient::INSTALLER_TYPE_PAAS, flavor.as_str(), arch)
            .await?;
        let archive = self.fs.open(tmp.path())?;
        drop(tmp);

        let fs = self.fs.clone();
        let target = target_dir.to_path_buf();
        tokio::task::spawn_blocking(move || {
            stage(&*fs, &target, |staging| extract(&*fs, archive, staging))
        })
        .await
        .map_err(io::Error::other)??;
        tracing::info!(target = %target_dir.display(), "Extracted OneAgent package");
        Ok(())
    }

    async fn download(
        &self,
        installer_type: &str,
        flavor: &str,
        arch: &str,
    ) -> Result<TempFile, Error> {
        let (tmp, mut file) = TempFile::create(&self.fs, "download")?;
        tracing::info!(%arch, %flavor, installer_type, "Downloading OneAgent package");
        self.client
            .get_latest_agent(dtclient::OS_UNIX, installer_type, flavor, arch, &mut *file)
            .await?;
        file.shutdown().await?;
        drop(file);
        tracing::debug!(path = %tmp.path().display(), "Saved OneAgent package");
        Ok(tmp)
    }
}

/// Returns true if a complete payload is installed at `dir`.
///
/// The mount points are the last thing written to a staged payload, so a
/// directory without them was not produced by a finished install.
pub fn is_installed(fs: &dyn Filesystem, dir: &Path) -> bool {
    fs.exists(dir) && MOUNT_POINTS.iter().all(|p| fs.exists(&dir.join(p)))
}

/// Builds a payload in a fresh staging directory with `build` and renames it
/// to `target_dir`. The staging directory is removed unless it was renamed.
fn stage(
    fs: &dyn Filesystem,
    target_dir: &Path,
    build: impl FnOnce(&Path) -> Result<(), Error>,
) -> Result<(), Error> {
    let staging = layout::scratch_path(target_dir, layout::STAGING_SUFFIX);
    let res = fs
        .create_dir_all(&staging, 0o755)
        .map_err(Error::from)
        .and_then(|()| build(&staging))
        .and_then(|()| prepare_mount_points(fs, &staging))
        .and_then(|()| commit(fs, &staging, target_dir));
    match res {
        Ok(true) => Ok(()),
        Ok(false) => {
            discard(fs, &staging);
            Ok(())
        }
        Err(error) => {
            discard(fs, &staging);
            Err(error)
        }
    }
}

/// Renames a staged payload into place. Returns false if a concurrent install
/// won the race, in which case the staged copy is not needed.
fn commit(fs: &dyn Filesystem, staging: &Path, target_dir: &Path) -> Result<bool, Error> {
    if fs.exists(target_dir) && !is_installed(fs, target_dir) {
        tracing::warn!(target = %target_dir.display(), "Replacing incomplete agent");
        fs.remove_dir_all(target_dir)?;
    }
    match fs.rename(staging, target_dir) {
        Ok(()) => Ok(true),
        Err(_) if is_installed(fs, target_dir) => {
            tracing::debug!(target = %target_dir.display(), "Agent was installed concurrently");
            Ok(false)
        }
        Err(error) => Err(error.into()),
    }
}

fn discard(fs: &dyn Filesystem, staging: &Path) {
    if let Err(error) = fs.remove_dir_all(staging) {
        tracing::warn!(%error, path = %staging.display(), "Failed to remove staged agent");
    }
}

fn run_script(script: &Path, target_dir: &Path) -> Result<(), Error> {
    let output = std::process::Command::new("/bin/sh")
        .arg(script)
        .arg(format!("INSTALL_PATH={}", target_dir.display()))
        .output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail = stderr.lines().rev().take(5).collect::<Vec<_>>();
        return Err(Error::Script {
            status: output.status,
            stderr: tail.into_iter().rev().collect::<Vec<_>>().join("\n"),
        });
    }
    Ok(())
}

/// Extracts a zip archive into `target_dir`.
///
/// Every entry name is validated before anything is written. Each file is
/// written to a sibling temporary file and renamed into place.
pub fn extract(
    fs: &dyn Filesystem,
    archive: impl Read + Seek,
    target_dir: &Path,
) -> Result<(), Error> {
    let mut zip = zip::ZipArchive::new(archive)?;
    for name in zip.file_names() {
        entry_path(name)?;
    }

    fs.create_dir_all(target_dir, 0o755)?;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let rel = entry_path(entry.name())?;
        let path = target_dir.join(&rel);
        let unix_mode = entry.unix_mode().unwrap_or(0);
        let is_conf = rel.starts_with(AGENT_CONF_PATH) && rel != Path::new(AGENT_CONF_PATH);
        let with_conf = |mode: u32| if is_conf { mode | 0o020 } else { mode };

        if entry.is_dir() || unix_mode & S_IFMT == S_IFDIR {
            if rel.as_os_str().is_empty() {
                continue;
            }
            let mode = with_conf(permissions(unix_mode, 0o755));
            fs.create_dir_all(&path, mode)?;
            fs.set_mode(&path, mode)?;
            continue;
        }

        if unix_mode & S_IFMT != 0 && unix_mode & S_IFMT != S_IFREG {
            tracing::debug!(name = %entry.name(), mode = unix_mode, "Skipping special entry");
            continue;
        }

        let mode = with_conf(permissions(unix_mode, 0o644));
        if let Some(parent) = path.parent() {
            fs.create_dir_all(parent, 0o755)?;
        }
        write_atomically(fs, &path, mode, &mut entry)?;
    }

    Ok(())
}

/// Creates the directories the per-pod mounts are attached to.
pub fn prepare_mount_points(fs: &dyn Filesystem, target_dir: &Path) -> Result<(), Error> {
    for dir in MOUNT_POINTS {
        fs.create_dir_all(&target_dir.join(dir), 0o755)?;
    }
    Ok(())
}

/// Returns the entry's path relative to the extraction root, or an error if
/// it would resolve outside of it.
fn entry_path(name: &str) -> Result<PathBuf, Error> {
    let mut path = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(c) => path.push(c),
            Component::CurDir => {}
            Component::ParentDir => {
                if !path.pop() {
                    return Err(Error::IllegalPath(name.to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::IllegalPath(name.to_string()))
            }
        }
    }
    Ok(path)
}

fn permissions(unix_mode: u32, default: u32) -> u32 {
    match unix_mode & 0o7777 {
        0 => default,
        mode => mode,
    }
}

fn write_atomically(
    fs: &dyn Filesystem,
    path: &Path,
    mode: u32,
    contents: &mut dyn Read,
) -> Result<(), Error> {
    static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(
        ".{file_name}.{}.{}.tmp",
        std::process::id(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));

    let res = (|| {
        let mut out = fs.create(&tmp, mode)?;
        io::copy(contents, &mut out)?;
        out.flush()?;
        drop(out);
        fs.rename(&tmp, path)
    })();
    if res.is_err() {
        match fs.remove_file(&tmp) {
            Err(error) if error.kind() != io::ErrorKind::NotFound => {
                tracing::warn!(%error, path = %tmp.display(), "Failed to delete temporary file");
            }
            _ => {}
        }
    }
    Ok(res?)
}

impl From<Error> for crate::publish::Error {
    fn from(error: Error) -> Self {
        match error {
            Error::IllegalPath(_) => Self::InvalidArgument(error.to_string()),
            error => Self::Internal(error.to_string()),
        }
    }
}
