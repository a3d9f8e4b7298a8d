use super::{AsyncFile, Filesystem, ReadSeek};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    io::{self, Write},
    path::{Path, PathBuf},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
};
use tokio::io::AsyncWrite;

/// An in-memory [`Filesystem`] for tests.
///
/// Clones share the same tree. The root directory always exists; every other
/// directory must be created before files are written into it.
#[derive(Clone, Debug, Default)]
pub struct MemFs(Arc<Inner>);

#[derive(Debug, Default)]
struct Inner {
    nodes: Mutex<BTreeMap<PathBuf, Node>>,
    read_only: AtomicBool,
    temps: AtomicU64,
}

#[derive(Clone, Debug)]
enum Node {
    Dir { mode: u32 },
    File { mode: u32, data: Vec<u8> },
}

struct MemWriter {
    fs: Arc<Inner>,
    path: PathBuf,
}

const TEMP_DIR: &str = "/tmp";

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{}: no such file or directory", path.display()),
    )
}

fn not_a_directory(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::Other,
        format!("{}: not a directory", path.display()),
    )
}

fn not_empty(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::DirectoryNotEmpty,
        format!("{}: directory not empty", path.display()),
    )
}

fn is_a_directory(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::Other,
        format!("{}: is a directory", path.display()),
    )
}

// === impl MemFs ===

impl MemFs {
    /// Makes every subsequent mutation fail with `PermissionDenied`.
    pub fn set_read_only(&self, read_only: bool) {
        self.0.read_only.store(read_only, Ordering::Release);
    }

    fn check_writable(&self, path: &Path) -> io::Result<()> {
        if self.0.read_only.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{}: read-only filesystem", path.display()),
            ));
        }
        Ok(())
    }

    fn write_node(&self, path: &Path, node: Node) -> io::Result<()> {
        self.check_writable(path)?;
        let mut nodes = self.0.nodes.lock();
        ensure_parent(&nodes, path)?;
        if let Some(Node::Dir { .. }) = nodes.get(path) {
            return Err(is_a_directory(path));
        }
        nodes.insert(path.to_path_buf(), node);
        Ok(())
    }
}

fn is_dir(nodes: &BTreeMap<PathBuf, Node>, path: &Path) -> bool {
    path.parent().is_none() || matches!(nodes.get(path), Some(Node::Dir { .. }))
}

fn ensure_parent(nodes: &BTreeMap<PathBuf, Node>, path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !is_dir(nodes, parent) => match nodes.get(parent) {
            Some(Node::File { .. }) => Err(not_a_directory(parent)),
            _ => Err(not_found(parent)),
        },
        _ => Ok(()),
    }
}

impl Filesystem for MemFs {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        match self.0.nodes.lock().get(path) {
            Some(Node::File { data, .. }) => Ok(data.clone()),
            Some(Node::Dir { .. }) => Err(is_a_directory(path)),
            None => Err(not_found(path)),
        }
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let mode = match self.0.nodes.lock().get(path) {
            Some(Node::File { mode, .. }) => *mode,
            _ => 0o644,
        };
        self.write_node(
            path,
            Node::File {
                mode,
                data: contents.to_vec(),
            },
        )
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>> {
        let data = self.read(path)?;
        Ok(Box::new(io::Cursor::new(data)))
    }

    fn create(&self, path: &Path, mode: u32) -> io::Result<Box<dyn Write + Send>> {
        self.write_node(path, Node::File { mode, data: vec![] })?;
        Ok(Box::new(MemWriter {
            fs: self.0.clone(),
            path: path.to_path_buf(),
        }))
    }

    fn create_temp(&self, prefix: &str) -> io::Result<(PathBuf, AsyncFile)> {
        self.create_dir_all(Path::new(TEMP_DIR), 0o777)?;
        let n = self.0.temps.fetch_add(1, Ordering::Relaxed);
        let path = Path::new(TEMP_DIR).join(format!("{prefix}{n}"));
        self.write_node(
            &path,
            Node::File {
                mode: 0o600,
                data: vec![],
            },
        )?;
        let file = MemWriter {
            fs: self.0.clone(),
            path: path.clone(),
        };
        Ok((path, Box::new(file)))
    }

    fn create_dir_all(&self, path: &Path, mode: u32) -> io::Result<()> {
        let mut nodes = self.0.nodes.lock();
        let missing = path
            .ancestors()
            .take_while(|p| !is_dir(&nodes, p))
            .map(Path::to_path_buf)
            .collect::<Vec<_>>();
        if missing.is_empty() {
            return Ok(());
        }
        self.check_writable(path)?;
        if let Some(file) = missing.iter().find(|p| nodes.contains_key(*p)) {
            return Err(not_a_directory(file));
        }
        for dir in missing {
            nodes.insert(dir, Node::Dir { mode });
        }
        Ok(())
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let nodes = self.0.nodes.lock();
        if !is_dir(&nodes, path) {
            return match nodes.get(path) {
                Some(_) => Err(not_a_directory(path)),
                None => Err(not_found(path)),
            };
        }
        Ok(nodes
            .keys()
            .filter(|p| p.parent() == Some(path))
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect())
    }

    fn exists(&self, path: &Path) -> bool {
        let nodes = self.0.nodes.lock();
        is_dir(&nodes, path) || nodes.contains_key(path)
    }

    fn mode(&self, path: &Path) -> io::Result<u32> {
        match self.0.nodes.lock().get(path) {
            Some(Node::Dir { mode }) | Some(Node::File { mode, .. }) => Ok(*mode),
            None => Err(not_found(path)),
        }
    }

    fn set_mode(&self, path: &Path, new: u32) -> io::Result<()> {
        self.check_writable(path)?;
        match self.0.nodes.lock().get_mut(path) {
            Some(Node::Dir { mode }) | Some(Node::File { mode, .. }) => {
                *mode = new;
                Ok(())
            }
            None => Err(not_found(path)),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.check_writable(from)?;
        let mut nodes = self.0.nodes.lock();
        ensure_parent(&nodes, to)?;
        let moved = nodes
            .keys()
            .filter(|p| p.starts_with(from))
            .cloned()
            .collect::<Vec<_>>();
        if moved.is_empty() {
            return Err(not_found(from));
        }
        if let Some(Node::Dir { .. }) = nodes.get(to) {
            if nodes.keys().any(|p| p.parent() == Some(to)) {
                return Err(not_empty(to));
            }
        }
        nodes.retain(|p, _| !p.starts_with(to));
        for old in moved {
            if let Some(node) = nodes.remove(&old) {
                let rel = old.strip_prefix(from).unwrap_or(Path::new(""));
                nodes.insert(to.join(rel), node);
            }
        }
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.check_writable(path)?;
        let mut nodes = self.0.nodes.lock();
        match nodes.get(path) {
            Some(Node::File { .. }) => {
                nodes.remove(path);
                Ok(())
            }
            Some(Node::Dir { .. }) => Err(is_a_directory(path)),
            None => Err(not_found(path)),
        }
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        self.check_writable(path)?;
        self.0.nodes.lock().retain(|p, _| !p.starts_with(path));
        Ok(())
    }
}

// === impl MemWriter ===

impl Write for MemWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.fs.nodes.lock().get_mut(&self.path) {
            Some(Node::File { data, .. }) => {
                data.extend_from_slice(buf);
                Ok(buf.len())
            }
            _ => Err(not_found(&self.path)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsyncWrite for MemWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Write::write(self.get_mut(), buf))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn requires_parent_directories() {
        let fs = MemFs::default();
        let err = fs.write(Path::new("/a/b"), b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        fs.create_dir_all(Path::new("/a"), 0o755).unwrap();
        fs.write(Path::new("/a/b"), b"x").unwrap();
        assert_eq!(fs.read(Path::new("/a/b")).unwrap(), b"x");

        // A file is in the way.
        assert!(fs.create_dir_all(Path::new("/a/b/c"), 0o755).is_err());
    }

    #[test]
    fn lists_direct_children() {
        let fs = MemFs::default();
        fs.create_dir_all(Path::new("/gc/v1"), 0o755).unwrap();
        fs.create_dir_all(Path::new("/gc/v2/pod"), 0o755).unwrap();
        fs.write(Path::new("/gc/file"), b"").unwrap();

        let mut names = fs.read_dir(Path::new("/gc")).unwrap();
        names.sort();
        assert_eq!(names, vec!["file", "v1", "v2"]);
        assert!(fs.read_dir(Path::new("/gc/file")).is_err());
        assert_eq!(
            fs.read_dir(Path::new("/missing")).unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[test]
    fn removes_subtrees() {
        let fs = MemFs::default();
        fs.create_dir_all(Path::new("/bin/1-default/agent"), 0o755)
            .unwrap();
        fs.write(Path::new("/bin/1-default/agent/lib.so"), b"elf")
            .unwrap();
        fs.create_dir_all(Path::new("/bin/1-defaultx"), 0o755).unwrap();

        fs.remove_dir_all(Path::new("/bin/1-default")).unwrap();
        assert!(!fs.exists(Path::new("/bin/1-default/agent/lib.so")));
        assert!(!fs.exists(Path::new("/bin/1-default")));
        // Siblings sharing a name prefix are untouched.
        assert!(fs.exists(Path::new("/bin/1-defaultx")));
    }

    #[test]
    fn streams_writes_and_renames() {
        let fs = MemFs::default();
        fs.create_dir_all(Path::new("/d"), 0o755).unwrap();
        {
            let mut w = fs.create(Path::new("/d/.tmp"), 0o640).unwrap();
            w.write_all(b"hello ").unwrap();
            w.write_all(b"world").unwrap();
        }
        fs.rename(Path::new("/d/.tmp"), Path::new("/d/f")).unwrap();
        assert!(!fs.exists(Path::new("/d/.tmp")));
        assert_eq!(fs.read(Path::new("/d/f")).unwrap(), b"hello world");
        assert_eq!(fs.mode(Path::new("/d/f")).unwrap(), 0o640);
    }

    #[test]
    fn renames_directories_like_the_kernel() {
        let fs = MemFs::default();
        fs.create_dir_all(Path::new("/bin/.stage/agent"), 0o755).unwrap();
        fs.create_dir_all(Path::new("/bin/empty"), 0o755).unwrap();

        // An empty directory is replaced.
        fs.rename(Path::new("/bin/.stage"), Path::new("/bin/empty"))
            .unwrap();
        assert!(fs.exists(Path::new("/bin/empty/agent")));

        // A populated one is not.
        fs.create_dir_all(Path::new("/bin/.other/lib"), 0o755).unwrap();
        let err = fs
            .rename(Path::new("/bin/.other"), Path::new("/bin/empty"))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::DirectoryNotEmpty);
        assert!(fs.exists(Path::new("/bin/.other/lib")));
        assert!(!fs.exists(Path::new("/bin/empty/lib")));
    }

    #[test]
    fn read_only_rejects_mutations() {
        let fs = MemFs::default();
        fs.create_dir_all(Path::new("/d"), 0o755).unwrap();
        fs.set_read_only(true);
        assert_eq!(
            fs.create_dir_all(Path::new("/d/e"), 0o755)
                .unwrap_err()
                .kind(),
            io::ErrorKind::PermissionDenied
        );
        // Existing directories are fine.
        fs.create_dir_all(Path::new("/d"), 0o755).unwrap();
        assert!(fs.write(Path::new("/d/f"), b"").is_err());
    }
}
