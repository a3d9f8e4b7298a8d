//! An injectable filesystem
//!
//! Everything the plugin does to the shared agent directory goes through
//! [`Filesystem`] so that the interesting logic can be exercised against
//! [`MemFs`] without touching a real disk.

use std::{
    io::{self, Read, Seek, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::io::AsyncWrite;

mod mem;

pub use self::mem::MemFs;

/// A readable, seekable file handle.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// A writer for downloads.
pub type AsyncFile = Box<dyn AsyncWrite + Send + Unpin>;

/// Filesystem operations used by the plugin.
pub trait Filesystem: Send + Sync + 'static {
    /// Reads a whole file.
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Creates or truncates a file with the given contents.
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    /// Opens a file for reading.
    fn open(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>>;

    /// Creates or truncates a file for streaming writes.
    fn create(&self, path: &Path, mode: u32) -> io::Result<Box<dyn Write + Send>>;

    /// Creates a uniquely-named file in the temporary directory.
    fn create_temp(&self, prefix: &str) -> io::Result<(PathBuf, AsyncFile)>;

    /// Creates a directory and all of its missing parents.
    fn create_dir_all(&self, path: &Path, mode: u32) -> io::Result<()>;

    /// Lists the names of a directory's entries.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>>;

    /// Returns true if anything exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// Returns the permission bits of `path`.
    fn mode(&self, path: &Path) -> io::Result<u32>;

    /// Sets the permission bits of `path`.
    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()>;

    /// Atomically replaces `to` with `from`.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Removes a file.
    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Removes a directory and everything beneath it. Missing paths are not an
    /// error.
    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;
}

/// The host filesystem.
#[derive(Copy, Clone, Debug, Default)]
pub struct OsFs(());

/// A temporary file that is removed when dropped.
///
/// Removal failures are logged rather than returned.
pub struct TempFile {
    fs: Arc<dyn Filesystem>,
    path: PathBuf,
}

// === impl OsFs ===

impl OsFs {
    /// Returns a handle to the host filesystem.
    pub fn new() -> Self {
        Self(())
    }
}

impl Filesystem for OsFs {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        std::fs::write(path, contents)
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>> {
        Ok(Box::new(std::fs::File::open(path)?))
    }

    fn create(&self, path: &Path, mode: u32) -> io::Result<Box<dyn Write + Send>> {
        use std::os::unix::fs::OpenOptionsExt;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(path)?;
        Ok(Box::new(io::BufWriter::new(file)))
    }

    fn create_temp(&self, prefix: &str) -> io::Result<(PathBuf, AsyncFile)> {
        let (file, path) = tempfile::Builder::new().prefix(prefix).tempfile()?.keep()?;
        let file = tokio::fs::File::from_std(file);
        Ok((path, Box::new(tokio::io::BufWriter::new(file))))
    }

    fn create_dir_all(&self, path: &Path, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::DirBuilderExt;

        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(mode)
            .create(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        std::fs::read_dir(path)?
            .map(|entry| Ok(entry?.file_name().to_string_lossy().into_owned()))
            .collect()
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn mode(&self, path: &Path) -> io::Result<u32> {
        use std::os::unix::fs::PermissionsExt;

        Ok(std::fs::metadata(path)?.permissions().mode() & 0o7777)
    }

    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        match std::fs::remove_dir_all(path) {
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            res => res,
        }
    }
}

// === impl TempFile ===

impl TempFile {
    /// Creates a temporary file, returning the guard and a writer for it.
    pub fn create(fs: &Arc<dyn Filesystem>, prefix: &str) -> io::Result<(Self, AsyncFile)> {
        let (path, file) = fs.create_temp(prefix)?;
        let fs = fs.clone();
        Ok((Self { fs, path }, file))
    }

    /// The file's location.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if let Err(error) = self.fs.remove_file(&self.path) {
            tracing::warn!(%error, path = %self.path.display(), "Failed to delete temporary file");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn temp_file_is_removed_on_drop() {
        let fs = MemFs::default();
        let fs_dyn: Arc<dyn Filesystem> = Arc::new(fs.clone());
        let path = {
            let (tmp, mut file) = TempFile::create(&fs_dyn, "download").unwrap();
            file.write_all(b"pay").await.unwrap();
            file.write_all(b"load").await.unwrap();
            file.flush().await.unwrap();
            drop(file);
            assert_eq!(fs.read(tmp.path()).unwrap(), b"payload");
            tmp.path().to_path_buf()
        };
        assert!(!fs.exists(&path));
    }

    #[test]
    fn temp_file_is_removed_on_unwind() {
        let fs = MemFs::default();
        let fs_dyn: Arc<dyn Filesystem> = Arc::new(fs.clone());
        let path = std::sync::Mutex::new(None);
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let (tmp, _file) = TempFile::create(&fs_dyn, "download").unwrap();
            *path.lock().unwrap() = Some(tmp.path().to_path_buf());
            panic!("download failed");
        }));
        assert!(res.is_err());
        let path = path.into_inner().unwrap().expect("temp file must be created");
        assert!(!fs.exists(&path));
    }

    #[tokio::test]
    async fn os_fs_streams_downloads() {
        let fs: Arc<dyn Filesystem> = Arc::new(OsFs::new());
        let (tmp, mut file) = TempFile::create(&fs, "download").unwrap();
        file.write_all(b"agent").await.unwrap();
        file.flush().await.unwrap();
        drop(file);
        assert_eq!(std::fs::read(tmp.path()).unwrap(), b"agent");

        let path = tmp.path().to_path_buf();
        drop(tmp);
        assert!(!path.exists());
    }

    #[test]
    fn os_fs_round_trips_modes() {
        let dir = tempfile::tempdir().unwrap();
        let fs = OsFs::new();
        let sub = dir.path().join("a/b");
        fs.create_dir_all(&sub, 0o755).unwrap();
        let file = sub.join("f");
        {
            let mut w = fs.create(&file, 0o640).unwrap();
            w.write_all(b"x").unwrap();
            w.flush().unwrap();
        }
        fs.set_mode(&file, 0o660).unwrap();
        assert_eq!(fs.mode(&file).unwrap(), 0o660);
        assert_eq!(fs.read_dir(&sub).unwrap(), vec!["f".to_string()]);
        fs.remove_dir_all(&dir.path().join("a")).unwrap();
        fs.remove_dir_all(&dir.path().join("a")).unwrap();
        assert!(!fs.exists(&file));
    }
}
