//! Bind mounts

use std::{
    io,
    path::{Path, PathBuf},
};

/// Mount operations used when publishing volumes.
pub trait Mounter: Send + Sync + 'static {
    /// Bind-mounts `source` onto `target`.
    fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> io::Result<()>;

    /// Lazily unmounts `target`. Paths that are not mounted are ignored.
    fn unmount(&self, target: &Path) -> io::Result<()>;

    /// Returns true if something is mounted at `target`.
    fn is_mounted(&self, target: &Path) -> io::Result<bool>;
}

/// Mounts through the host's kernel.
#[derive(Copy, Clone, Debug, Default)]
pub struct HostMounter(());

const MOUNTINFO: &str = "/proc/self/mountinfo";

// === impl HostMounter ===

impl HostMounter {
    /// Returns a mounter for the host.
    pub fn new() -> Self {
        Self(())
    }
}

#[cfg(target_os = "linux")]
impl Mounter for HostMounter {
    fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> io::Result<()> {
        use nix::mount::{mount, MsFlags};

        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )?;
        if read_only {
            // The read-only flag is ignored on the initial bind and must be
            // applied with a remount.
            let remount = mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            );
            if let Err(error) = remount {
                let _ = self.unmount(target);
                return Err(error.into());
            }
        }
        tracing::debug!(source = %source.display(), target = %target.display(), read_only, "Mounted");
        Ok(())
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        use nix::{
            errno::Errno,
            mount::{umount2, MntFlags},
        };

        match umount2(target, MntFlags::MNT_DETACH) {
            Ok(()) => {
                tracing::debug!(target = %target.display(), "Unmounted");
                Ok(())
            }
            Err(Errno::EINVAL | Errno::ENOENT) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    fn is_mounted(&self, target: &Path) -> io::Result<bool> {
        let mountinfo = std::fs::read_to_string(MOUNTINFO)?;
        let mounted = mount_points(&mountinfo).any(|p| p == target);
        Ok(mounted)
    }
}

#[cfg(not(target_os = "linux"))]
impl Mounter for HostMounter {
    fn bind_mount(&self, _: &Path, _: &Path, _: bool) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }

    fn unmount(&self, _: &Path) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }

    fn is_mounted(&self, _: &Path) -> io::Result<bool> {
        Err(io::ErrorKind::Unsupported.into())
    }
}

/// Iterates over the mount points listed in a `mountinfo` table.
fn mount_points(mountinfo: &str) -> impl Iterator<Item = PathBuf> + '_ {
    mountinfo
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(|p| PathBuf::from(unescape(p)))
}

/// Decodes the octal escapes (`\040` for a space) the kernel uses in mount
/// paths.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let octal = &bytes[i + 1..i + 4];
            if octal.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = octal
                    .iter()
                    .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(b) = u8::try_from(value) {
                    out.push(b);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
