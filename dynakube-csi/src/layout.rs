//! On-disk layout shared by the node plugin, the provisioner and the garbage
//! collector
//!
//! ```text
//! <root>/data/tenant-<instance>                 tenant UUID, raw bytes
//! <root>/data/volumes/<volumeId>                publish record (JSON)
//! <root>/data/<tenant>/version                  current version string
//! <root>/data/<tenant>/bin/<version>-<flavor>/  agent payload
//! <root>/data/<tenant>/bin/.<name>.<run>.<n>.*   install or removal in progress
//! <root>/data/<tenant>/log/<podUID>/
//! <root>/data/<tenant>/datastorage/<podUID>/
//! <root>/data/<tenant>/gc/<version>/<podUID>    usage marker
//! ```

use parking_lot::{Mutex, RawMutex};
use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
    time::{SystemTime, UNIX_EPOCH},
};

/// The directory under the root that holds all tenant data.
pub const DATA_PATH: &str = "data";

/// The usage ledger directory inside a tenant directory.
pub const GARBAGE_COLLECTION_PATH: &str = "gc";

const VERSION_FILE: &str = "version";
const BIN_PATH: &str = "bin";
const LOG_PATH: &str = "log";
const DATASTORAGE_PATH: &str = "datastorage";
const VOLUMES_PATH: &str = "volumes";

/// Suffix of a payload that is still being installed.
pub const STAGING_SUFFIX: &str = "partial";

/// Suffix of a payload that is being removed.
pub const TRASH_SUFFIX: &str = "removing";

/// Node plugin settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CsiOptions {
    /// The node this plugin instance runs on.
    pub node_id: String,

    /// The unix socket the gRPC services listen on.
    pub endpoint: PathBuf,

    /// The plugin's state directory on the host.
    pub root_dir: PathBuf,
}

/// Build variant of the agent payload.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Flavor {
    /// glibc-based payload.
    #[default]
    Default,

    /// musl-based payload.
    Musl,
}

/// Indicates that an unknown flavor was requested.
#[derive(Debug, thiserror::Error)]
#[error("invalid flavor: {0} must be 'default' or 'musl'")]
pub struct InvalidFlavor(String);

/// Resolves paths under the plugin's data directory.
///
/// Cloning a `Layout` is cheap; clones share the per-tenant locks.
#[derive(Clone)]
pub struct Layout {
    data_dir: PathBuf,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

/// Paths inside one tenant's directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvDir(PathBuf);

/// Held while a tenant's usage ledger is being changed.
pub type LedgerGuard = parking_lot::lock_api::ArcMutexGuard<RawMutex, ()>;

// === impl Flavor ===

impl Flavor {
    /// All flavors a version may be installed as.
    pub const ALL: [Flavor; 2] = [Flavor::Default, Flavor::Musl];

    /// The flavor's name, as used in directory names and API queries.
    pub fn as_str(&self) -> &'static str {
        match self {
            Flavor::Default => "default",
            Flavor::Musl => "musl",
        }
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Flavor {
    type Err = InvalidFlavor;

    fn from_str(s: &str) -> Result<Self, InvalidFlavor> {
        match s {
            "default" => Ok(Flavor::Default),
            "musl" => Ok(Flavor::Musl),
            s => Err(InvalidFlavor(s.to_string())),
        }
    }
}

// === impl Layout ===

impl Layout {
    /// Creates a layout rooted at `<root_dir>/data`.
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: root_dir.as_ref().join(DATA_PATH),
            locks: Default::default(),
        }
    }

    /// Returns the data directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Returns the file that maps a DynaKube to its tenant UUID.
    pub fn tenant_file(&self, instance: &str) -> PathBuf {
        self.data_dir.join(format!("tenant-{instance}"))
    }

    /// Returns the publish record for a volume.
    pub fn volume_record(&self, volume_id: &str) -> PathBuf {
        self.data_dir.join(VOLUMES_PATH).join(volume_id)
    }

    /// Returns the directory of the given tenant.
    pub fn env(&self, tenant_uuid: &str) -> EnvDir {
        EnvDir(self.data_dir.join(tenant_uuid))
    }

    /// Locks a tenant's usage ledger.
    ///
    /// Marker creation and the check-and-delete of a version happen under this
    /// lock. It is never held across network calls.
    pub fn lock_ledger(&self, tenant_uuid: &str) -> LedgerGuard {
        let lock = {
            let mut locks = self.locks.lock();
            // Entries only referenced by the map are idle.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(tenant_uuid.to_string()).or_default().clone()
        };
        lock.lock_arc()
    }
}

impl fmt::Debug for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layout")
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}

/// Returns a uniquely named hidden sibling of `path`, ending in `.<suffix>`.
///
/// Names carry an identifier of the current process so that entries left
/// behind by an earlier run can be recognized.
pub fn scratch_path(path: &Path, suffix: &str) -> PathBuf {
    static SEQ: AtomicU64 = AtomicU64::new(0);

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(
        ".{name}.{}.{}.{suffix}",
        run_id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ))
}

/// Returns true if `name` is a scratch entry nobody is working on.
///
/// Staging directories are stale once the run that created them is gone.
/// Trash is always stale: it is only deleted by garbage collection, which
/// never runs concurrently with itself.
pub fn is_stale_scratch(name: &str) -> bool {
    let Some(rest) = name.strip_prefix('.') else {
        return false;
    };
    let mut parts = rest.rsplitn(4, '.');
    let (Some(suffix), Some(seq), Some(run), Some(_)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    if seq.parse::<u64>().is_err() {
        return false;
    }
    match suffix {
        TRASH_SUFFIX => true,
        STAGING_SUFFIX => run != run_id(),
        _ => false,
    }
}

/// Identifies this process, even across restarts that reuse its pid.
fn run_id() -> &'static str {
    static RUN_ID: OnceLock<String> = OnceLock::new();
    RUN_ID.get_or_init(|| {
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        format!("{:x}{started:x}", std::process::id())
    })
}

// === impl EnvDir ===

impl EnvDir {
    /// The tenant directory itself.
    pub fn root(&self) -> &Path {
        &self.0
    }

    /// The file naming the currently installed version.
    pub fn version_file(&self) -> PathBuf {
        self.0.join(VERSION_FILE)
    }

    /// The directory holding all installed payloads.
    pub fn bin_dir(&self) -> PathBuf {
        self.0.join(BIN_PATH)
    }

    /// `bin/<version>`, the unflavored agent directory.
    pub fn agent_dir(&self, version: &str) -> PathBuf {
        self.bin_dir().join(version)
    }

    /// `bin/<version>-<flavor>`, where a payload is actually installed.
    pub fn flavored_agent_dir(&self, version: &str, flavor: Flavor) -> PathBuf {
        self.bin_dir().join(format!("{version}-{flavor}"))
    }

    /// The pod's log directory.
    pub fn log_dir(&self, pod_uid: &str) -> PathBuf {
        self.0.join(LOG_PATH).join(pod_uid)
    }

    /// The pod's data storage directory.
    pub fn datastorage_dir(&self, pod_uid: &str) -> PathBuf {
        self.0.join(DATASTORAGE_PATH).join(pod_uid)
    }

    /// The usage ledger.
    pub fn gc_dir(&self) -> PathBuf {
        self.0.join(GARBAGE_COLLECTION_PATH)
    }

    /// The ledger entry for a version.
    pub fn gc_version_dir(&self, version: &str) -> PathBuf {
        self.gc_dir().join(version)
    }

    /// The marker recording that a pod uses a version.
    pub fn marker(&self, version: &str, pod_uid: &str) -> PathBuf {
        self.gc_version_dir(version).join(pod_uid)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn paths() {
        let layout = Layout::new("/plugin");
        assert_eq!(
            layout.tenant_file("dk"),
            PathBuf::from("/plugin/data/tenant-dk")
        );

        let env = layout.env("abc");
        assert_eq!(env.root(), Path::new("/plugin/data/abc"));
        assert_eq!(env.version_file(), PathBuf::from("/plugin/data/abc/version"));
        assert_eq!(env.agent_dir("1.2"), PathBuf::from("/plugin/data/abc/bin/1.2"));
        assert_eq!(
            env.flavored_agent_dir("1.2", Flavor::Musl),
            PathBuf::from("/plugin/data/abc/bin/1.2-musl")
        );
        assert_eq!(
            env.marker("1.2", "pod"),
            PathBuf::from("/plugin/data/abc/gc/1.2/pod")
        );
        assert_eq!(
            env.datastorage_dir("pod"),
            PathBuf::from("/plugin/data/abc/datastorage/pod")
        );
    }

    #[test]
    fn parses_flavors() {
        assert_eq!("default".parse::<Flavor>().unwrap(), Flavor::Default);
        assert_eq!("musl".parse::<Flavor>().unwrap(), Flavor::Musl);
        assert!("multidistro".parse::<Flavor>().is_err());
    }

    #[test]
    fn ledger_locks_are_per_tenant() {
        let layout = Layout::new("/plugin");
        let a = layout.lock_ledger("a");
        // A different tenant is not blocked.
        let b = layout.clone().lock_ledger("b");
        drop((a, b));
        let _a = layout.lock_ledger("a");
    }

    #[test]
    fn idle_ledger_locks_are_dropped() {
        let layout = Layout::new("/plugin");
        for tenant in ["a", "b", "c"] {
            drop(layout.lock_ledger(tenant));
        }
        let held = layout.lock_ledger("d");
        assert_eq!(layout.locks.lock().len(), 1);

        // A held lock survives other tenants being locked.
        drop(layout.lock_ledger("e"));
        let _e = layout.lock_ledger("e");
        assert_eq!(layout.locks.lock().len(), 2);
        drop(held);
    }

    #[test]
    fn scratch_paths() {
        let payload = Path::new("/data/t/bin/1.2.3-default");
        let a = scratch_path(payload, STAGING_SUFFIX);
        let b = scratch_path(payload, STAGING_SUFFIX);
        assert_ne!(a, b);
        assert_eq!(a.parent(), payload.parent());

        let name = |p: &Path| p.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name(&a).starts_with(".1.2.3-default."));
        assert!(name(&a).ends_with(".partial"));
        // Our own installs are in progress, not stale.
        assert!(!is_stale_scratch(&name(&a)));
        assert!(is_stale_scratch(".1.2.3-default.0.7.partial"));
        assert!(is_stale_scratch(&name(&scratch_path(payload, TRASH_SUFFIX))));

        assert!(!is_stale_scratch("1.2.3-default"));
        assert!(!is_stale_scratch(".1.2.3-default.0.x.partial"));
        assert!(!is_stale_scratch(".hidden"));
        assert!(!is_stale_scratch(".1.2-default.0.1.other"));
    }
}
