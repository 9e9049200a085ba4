//! Versioned filesystem reservation store.
//!
//! Accepted workloads live under a single root directory, one versioned
//! record per workload plus symlink secondary indexes:
//!
//! ```text
//! R/by-id/<id>                         regular file, versioned record
//! R/by-type/<type>/<key>               symlink -> ../../by-id/<id>
//! R/by-user/<user>/by-id/<id>          symlink -> ../../../by-id/<id>
//! R/by-user/<user>/by-type/<type>/<key> symlink -> ../../../../by-id/<id>
//! ```
//!
//! For network workloads the `<key>` under the type index is the derived
//! [`NetworkId`] of `(user, name)`, not the workload id, so a network can be
//! resolved without knowing which workload created it.
//!
//! Records are written with exclusive create and closed before any link is
//! made, so a crash never leaves an indexed but torn record. Mutations hold
//! a write lock across the file, link and counter updates; the counters
//! themselves are atomic so snapshots never take the lock.

use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use plfm_gridtypes::{
    DataError, Network, NetworkId, ResourceUnits, Tag, Workload, WorkloadId, WorkloadType,
};
use semver::Version;
use tracing::{debug, info, warn};

use crate::counters::{CounterSnapshot, Counters};
use crate::janitor::{AuthoritativeLookup, LookupError, LookupStatus};

const PATH_BY_ID: &str = "by-id";
const PATH_BY_TYPE: &str = "by-type";
const PATH_BY_USER: &str = "by-user";

/// Newest record schema this build writes and the highest it accepts.
fn schema_version() -> Version {
    Version::new(1, 0, 0)
}

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// `add` on an id that is already stored.
    #[error("workload {0} already in the store")]
    Exists(WorkloadId),

    /// Lookup or `set` on an id that is not stored.
    #[error("workload {0} not in the store")]
    NotExists(WorkloadId),

    /// Network lookup on a derived id with no matching record.
    #[error("network {0} not in the store")]
    NetworkNotExists(NetworkId),

    /// Record carries a schema version newer than this build understands.
    #[error("unknown record schema version {version} for {id}")]
    UnknownVersion { id: String, version: Version },

    /// Record payload does not decode as a workload.
    #[error("corrupt record {id}: {source}")]
    Corrupt {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    /// Record header is damaged.
    #[error("corrupt record {id}: {source}")]
    CorruptHeader {
        id: String,
        #[source]
        source: plfm_versioned::VersionedError,
    },

    /// The workload payload cannot be accounted.
    #[error(transparent)]
    Data(#[from] DataError),

    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
}

/// Crash-safe reservation store backed by the local filesystem.
pub struct FsStore {
    root: PathBuf,
    lock: RwLock<()>,
    counters: Counters,
}

impl FsStore {
    /// Open the store at `root`, keeping whatever records are present, and
    /// rebuild the counters from disk.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let store = Self {
            root: root.into(),
            lock: RwLock::new(()),
            counters: Counters::default(),
        };

        fs::create_dir_all(store.root.join(PATH_BY_ID))?;
        fs::create_dir_all(store.root.join(PATH_BY_TYPE))?;
        fs::create_dir_all(store.root.join(PATH_BY_USER))?;

        store.sync()?;
        Ok(store)
    }

    /// Open the store honoring the first-boot marker: if `marker` does not
    /// exist yet this is the node's first boot since flash, the store root
    /// is wiped and the marker written; otherwise the cache is kept.
    pub fn open_at_boot(
        root: impl Into<PathBuf>,
        marker: impl AsRef<Path>,
    ) -> Result<Self, StorageError> {
        let root = root.into();
        let marker = marker.as_ref();

        if !marker.exists() {
            info!(root = %root.display(), "first boot, emptying reservation cache");
            match fs::remove_dir_all(&root) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            if let Some(parent) = marker.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(marker, b"")?;
        } else {
            info!(root = %root.display(), "restart detected, keeping reservation cache");
        }

        Self::open(root)
    }

    /// Rebuild the counters from the records under `by-id/`.
    ///
    /// Orphan entries in the index directories are ignored; a record that
    /// fails to decode fails the sync.
    pub fn sync(&self) -> Result<(), StorageError> {
        let _guard = self.lock.write().expect("store lock poisoned");

        self.counters.reset();
        for entry in fs::read_dir(self.root.join(PATH_BY_ID))? {
            let entry = entry?;
            if !is_record(&entry)? {
                continue;
            }

            let workload = self.read_record(&entry.path())?;
            self.counters.increment(workload.kind);
            match ResourceUnits::of(&workload) {
                Ok(units) => self.counters.add_units(units),
                Err(e) => warn!(id = %workload.id, error = %e, "skipping units of unaccountable record"),
            }
        }

        Ok(())
    }

    /// Store a new workload. Fails with [`StorageError::Exists`] when the id
    /// is already present.
    pub fn add(&self, workload: &Workload) -> Result<(), StorageError> {
        let _guard = self.lock.write().expect("store lock poisoned");

        // account first so a bad payload leaves no trace on disk
        let units = ResourceUnits::of(workload)?;
        let key = self.type_key(workload)?;

        let id_path = self.id_path(&workload.id);
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&id_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(StorageError::Exists(workload.id.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        let payload = serde_json::to_vec(workload).map_err(|source| StorageError::Corrupt {
            id: workload.id.to_string(),
            source,
        })?;
        file.write_all(&plfm_versioned::write(&schema_version(), &payload))?;
        file.sync_all()?;
        drop(file);

        self.link(workload, &key)?;

        self.counters.increment(workload.kind);
        self.counters.add_units(units);

        debug!(id = %workload.id, kind = %workload.kind, "stored workload");
        Ok(())
    }

    /// Overwrite a stored workload. Fails with [`StorageError::NotExists`]
    /// when the id is absent.
    pub fn set(&self, workload: &Workload) -> Result<(), StorageError> {
        let _guard = self.lock.write().expect("store lock poisoned");

        let id_path = self.id_path(&workload.id);
        if !id_path.exists() {
            return Err(StorageError::NotExists(workload.id.clone()));
        }

        let payload = serde_json::to_vec(workload).map_err(|source| StorageError::Corrupt {
            id: workload.id.to_string(),
            source,
        })?;

        // replace via rename; the index links address the path, not the inode
        let tmp_path = id_path.with_extension("tmp");
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&plfm_versioned::write(&schema_version(), &payload))?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, &id_path)?;

        debug!(id = %workload.id, "updated workload");
        Ok(())
    }

    /// Fetch a workload by id.
    pub fn get(&self, id: &WorkloadId) -> Result<Workload, StorageError> {
        let _guard = self.lock.read().expect("store lock poisoned");
        self.get_locked(id)
    }

    fn get_locked(&self, id: &WorkloadId) -> Result<Workload, StorageError> {
        let path = self.id_path(id);
        if !path.exists() {
            return Err(StorageError::NotExists(id.clone()));
        }
        self.read_record(&path)
    }

    /// Whether a workload with `id` is stored.
    pub fn exists(&self, id: &WorkloadId) -> Result<bool, StorageError> {
        let _guard = self.lock.read().expect("store lock poisoned");
        match fs::symlink_metadata(self.id_path(id)) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Ids of all stored workloads of `kind`.
    pub fn by_type(&self, kind: WorkloadType) -> Result<Vec<WorkloadId>, StorageError> {
        let _guard = self.lock.read().expect("store lock poisoned");
        self.ids_under(&self.root.join(PATH_BY_TYPE).join(kind.as_str()))
    }

    /// Ids of all stored workloads of `kind` owned by `user`.
    pub fn by_user(&self, user: &str, kind: WorkloadType) -> Result<Vec<WorkloadId>, StorageError> {
        let _guard = self.lock.read().expect("store lock poisoned");
        self.ids_under(
            &self
                .root
                .join(PATH_BY_USER)
                .join(user)
                .join(PATH_BY_TYPE)
                .join(kind.as_str()),
        )
    }

    /// Resolve a network workload by its derived network id.
    pub fn get_network(&self, net_id: &NetworkId) -> Result<Workload, StorageError> {
        let _guard = self.lock.read().expect("store lock poisoned");

        let link = self
            .root
            .join(PATH_BY_TYPE)
            .join(WorkloadType::Network.as_str())
            .join(net_id.as_str());
        let target = match fs::read_link(&link) {
            Ok(target) => target,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NetworkNotExists(net_id.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        let path = link.parent().unwrap_or(Path::new("")).join(target);
        self.read_record(&path)
    }

    /// All stored workloads past their expiry at the time of the call.
    pub fn get_expired(&self) -> Result<Vec<Workload>, StorageError> {
        let _guard = self.lock.read().expect("store lock poisoned");

        let now = Utc::now();
        let mut expired = Vec::new();
        for entry in fs::read_dir(self.root.join(PATH_BY_ID))? {
            let entry = entry?;
            if !is_record(&entry)? {
                continue;
            }
            let workload = self.read_record(&entry.path())?;
            if workload.expired(now) {
                expired.push(workload);
            }
        }

        Ok(expired)
    }

    /// Remove a workload and its index entries. Idempotent: removing an
    /// absent id is not an error and moves no counter.
    pub fn remove(&self, id: &WorkloadId) -> Result<(), StorageError> {
        let _guard = self.lock.write().expect("store lock poisoned");

        let workload = match self.get_locked(id) {
            Ok(workload) => workload,
            Err(StorageError::NotExists(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        let key = self.type_key(&workload)?;
        self.unlink(&workload, &key);

        match fs::remove_file(self.id_path(id)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        self.counters.decrement(workload.kind);
        match ResourceUnits::of(&workload) {
            Ok(units) => self.counters.remove_units(units),
            Err(e) => warn!(id = %id, error = %e, "removed workload with unaccountable units"),
        }

        debug!(id = %id, kind = %workload.kind, "removed workload");
        Ok(())
    }

    /// Atomic snapshot of the live counters. Never blocks on the store lock.
    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    fn id_path(&self, id: &WorkloadId) -> PathBuf {
        self.root.join(PATH_BY_ID).join(id.as_str())
    }

    /// Secondary index key under `by-type/<kind>/` for this workload.
    fn type_key(&self, workload: &Workload) -> Result<String, StorageError> {
        if workload.kind == WorkloadType::Network {
            let network: Network =
                serde_json::from_value(workload.data.clone()).map_err(|source| {
                    StorageError::Corrupt {
                        id: workload.id.to_string(),
                        source,
                    }
                })?;
            Ok(NetworkId::new(&workload.user, &network.name).to_string())
        } else {
            Ok(workload.id.to_string())
        }
    }

    fn link(&self, workload: &Workload, key: &str) -> Result<(), StorageError> {
        let id = workload.id.as_str();
        let kind = workload.kind.as_str();

        let by_type = self.root.join(PATH_BY_TYPE).join(kind);
        let user_by_id = self.root.join(PATH_BY_USER).join(&workload.user).join(PATH_BY_ID);
        let user_by_type = self
            .root
            .join(PATH_BY_USER)
            .join(&workload.user)
            .join(PATH_BY_TYPE)
            .join(kind);

        for dir in [&by_type, &user_by_id, &user_by_type] {
            fs::create_dir_all(dir)?;
        }

        force_symlink(
            Path::new("..").join("..").join(PATH_BY_ID).join(id),
            by_type.join(key),
        )?;
        force_symlink(
            Path::new("..").join("..").join("..").join(PATH_BY_ID).join(id),
            user_by_id.join(id),
        )?;
        force_symlink(
            Path::new("..")
                .join("..")
                .join("..")
                .join("..")
                .join(PATH_BY_ID)
                .join(id),
            user_by_type.join(key),
        )?;

        Ok(())
    }

    fn unlink(&self, workload: &Workload, key: &str) {
        let id = workload.id.as_str();
        let kind = workload.kind.as_str();

        let links = [
            self.root.join(PATH_BY_TYPE).join(kind).join(key),
            self.root
                .join(PATH_BY_USER)
                .join(&workload.user)
                .join(PATH_BY_ID)
                .join(id),
            self.root
                .join(PATH_BY_USER)
                .join(&workload.user)
                .join(PATH_BY_TYPE)
                .join(kind)
                .join(key),
        ];

        for link in links {
            if let Err(e) = fs::remove_file(&link) {
                if e.kind() != ErrorKind::NotFound {
                    warn!(link = %link.display(), error = %e, "failed to drop index link");
                }
            }
        }
    }

    fn ids_under(&self, dir: &Path) -> Result<Vec<WorkloadId>, StorageError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            // resolve through the link so network keys still yield workload ids
            let target = match fs::read_link(entry.path()) {
                Ok(target) => target,
                Err(_) => continue,
            };
            let Some(name) = target.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match WorkloadId::parse(name) {
                Ok(id) => ids.push(id),
                Err(_) => continue,
            }
        }

        ids.sort();
        Ok(ids)
    }

    fn read_record(&self, path: &Path) -> Result<Workload, StorageError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("<unnamed>")
            .to_string();

        let bytes = fs::read(path)?;
        let record =
            plfm_versioned::read(&bytes).map_err(|source| StorageError::CorruptHeader {
                id: name.clone(),
                source,
            })?;

        if record.version > schema_version() {
            return Err(StorageError::UnknownVersion {
                id: name,
                version: record.version,
            });
        }

        let mut workload: Workload =
            serde_json::from_slice(record.payload).map_err(|source| StorageError::Corrupt {
                id: name,
                source,
            })?;
        workload.tag = Tag::single("source", "fs-store");
        Ok(workload)
    }
}

/// The janitor treats the local record as the authority on whether a host
/// resource should stay.
#[async_trait]
impl AuthoritativeLookup for FsStore {
    async fn lookup(&self, id: &WorkloadId) -> Result<LookupStatus, LookupError> {
        match self.get(id) {
            Ok(workload) => Ok(LookupStatus::Found {
                to_delete: workload.to_delete,
            }),
            Err(StorageError::NotExists(_)) => Ok(LookupStatus::NotFound),
            Err(e) => Err(LookupError::Transient(e.to_string())),
        }
    }
}

/// A directory entry that is an actual record: a regular file whose name is
/// a workload id. Filters out subdirectories and interrupted `set` leftovers.
fn is_record(entry: &fs::DirEntry) -> std::io::Result<bool> {
    if entry.file_type()?.is_dir() {
        return Ok(false);
    }
    Ok(entry
        .file_name()
        .to_str()
        .is_some_and(|name| WorkloadId::parse(name).is_ok()))
}

fn force_symlink(target: PathBuf, link: PathBuf) -> std::io::Result<()> {
    match symlink(&target, &link) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            fs::remove_file(&link)?;
            symlink(&target, &link)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use plfm_gridtypes::Tag;
    use tempfile::TempDir;

    use super::*;

    fn store() -> (TempDir, FsStore) {
        let dir = TempDir::new().unwrap();
        let store = FsStore::open(dir.path().join("cache")).unwrap();
        (dir, store)
    }

    fn workload(id: &str, user: &str, kind: WorkloadType, data: serde_json::Value) -> Workload {
        Workload {
            id: WorkloadId::parse(id).unwrap(),
            user: user.to_string(),
            kind,
            data,
            created: Utc::now(),
            duration: Duration::from_secs(3600),
            to_delete: false,
            signature: String::new(),
            tag: Tag::default(),
        }
    }

    fn volume(id: &str, user: &str) -> Workload {
        workload(
            id,
            user,
            WorkloadType::Volume,
            serde_json::json!({"size": 1, "type": "ssd"}),
        )
    }

    #[test]
    fn test_add_creates_record_and_links() {
        let (dir, store) = store();
        store.add(&volume("10-1", "user-1")).unwrap();

        let root = dir.path().join("cache");
        let record = fs::symlink_metadata(root.join("by-id/10-1")).unwrap();
        assert!(record.file_type().is_file());

        for link in [
            root.join("by-type/volume/10-1"),
            root.join("by-user/user-1/by-id/10-1"),
            root.join("by-user/user-1/by-type/volume/10-1"),
        ] {
            let meta = fs::symlink_metadata(&link).unwrap();
            assert!(meta.file_type().is_symlink(), "{link:?}");
            // links must resolve back to the record
            assert!(fs::metadata(&link).unwrap().is_file());
        }
    }

    #[test]
    fn test_add_duplicate_fails() {
        let (_dir, store) = store();
        store.add(&volume("10-1", "user-1")).unwrap();
        assert!(matches!(
            store.add(&volume("10-1", "user-1")),
            Err(StorageError::Exists(_))
        ));
        // counter moved exactly once
        assert_eq!(store.counters().volumes, 1);
    }

    #[test]
    fn test_set_requires_existing() {
        let (_dir, store) = store();
        let wl = volume("10-1", "user-1");
        assert!(matches!(store.set(&wl), Err(StorageError::NotExists(_))));

        store.add(&wl).unwrap();
        let mut updated = wl.clone();
        updated.to_delete = true;
        store.set(&updated).unwrap();

        let loaded = store.get(&wl.id).unwrap();
        assert!(loaded.to_delete);
        assert_eq!(store.counters().volumes, 1);
    }

    #[test]
    fn test_get_round_trip() {
        let (_dir, store) = store();
        let wl = volume("10-1", "user-1");
        store.add(&wl).unwrap();

        let loaded = store.get(&wl.id).unwrap();
        assert_eq!(loaded.id, wl.id);
        assert_eq!(loaded.user, wl.user);
        assert_eq!(loaded.kind, wl.kind);
        assert_eq!(loaded.data, wl.data);
        // tag is store-local, not round-tripped
        assert_eq!(loaded.tag, Tag::single("source", "fs-store"));
    }

    #[test]
    fn test_exists_and_remove() {
        let (_dir, store) = store();
        let wl = volume("10-1", "user-1");

        store.add(&wl).unwrap();
        assert!(store.exists(&wl.id).unwrap());

        store.remove(&wl.id).unwrap();
        assert!(!store.exists(&wl.id).unwrap());
        assert_eq!(store.counters().volumes, 0);

        // idempotent: second remove moves nothing
        store.remove(&wl.id).unwrap();
        assert_eq!(store.counters().volumes, 0);
    }

    #[test]
    fn test_remove_drops_links() {
        let (dir, store) = store();
        store.add(&volume("10-1", "user-1")).unwrap();
        store.remove(&WorkloadId::parse("10-1").unwrap()).unwrap();

        let root = dir.path().join("cache");
        for link in [
            root.join("by-type/volume/10-1"),
            root.join("by-user/user-1/by-id/10-1"),
            root.join("by-user/user-1/by-type/volume/10-1"),
        ] {
            assert!(fs::symlink_metadata(&link).is_err(), "{link:?}");
        }
    }

    #[test]
    fn test_network_indexed_by_net_id() {
        let (dir, store) = store();
        let wl = workload(
            "11-1",
            "user-1",
            WorkloadType::Network,
            serde_json::json!({"name": "mynet"}),
        );
        store.add(&wl).unwrap();

        let nid = NetworkId::new("user-1", "mynet");
        let root = dir.path().join("cache");
        assert!(fs::symlink_metadata(root.join("by-type/network").join(nid.as_str())).is_ok());

        let loaded = store.get_network(&nid).unwrap();
        assert_eq!(loaded.id, wl.id);

        // and by_type still reports the workload id, not the network key
        let ids = store.by_type(WorkloadType::Network).unwrap();
        assert_eq!(ids, vec![wl.id]);
    }

    #[test]
    fn test_by_type_and_by_user() {
        let (_dir, store) = store();
        store.add(&volume("10-1", "user-1")).unwrap();
        store.add(&volume("11-1", "user-2")).unwrap();
        store
            .add(&workload(
                "12-1",
                "user-1",
                WorkloadType::Zdb,
                serde_json::json!({"size": 1, "disk_type": "hdd"}),
            ))
            .unwrap();

        let volumes = store.by_type(WorkloadType::Volume).unwrap();
        assert_eq!(volumes.len(), 2);

        let user1 = store.by_user("user-1", WorkloadType::Volume).unwrap();
        assert_eq!(user1, vec![WorkloadId::parse("10-1").unwrap()]);

        let user2 = store.by_user("user-2", WorkloadType::Volume).unwrap();
        assert_eq!(user2, vec![WorkloadId::parse("11-1").unwrap()]);

        assert!(store.by_type(WorkloadType::Container).unwrap().is_empty());
    }

    #[test]
    fn test_get_expired() {
        let (_dir, store) = store();
        let mut old = volume("10-1", "user-1");
        old.created = Utc::now() - chrono::Duration::hours(3);
        old.duration = Duration::from_secs(3600);
        store.add(&old).unwrap();
        store.add(&volume("11-1", "user-1")).unwrap();

        let expired = store.get_expired().unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, old.id);
    }

    #[test]
    fn test_sync_rebuilds_counters() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("cache");

        {
            let store = FsStore::open(&root).unwrap();
            store.add(&volume("10-1", "user-1")).unwrap();
            store.add(&volume("11-1", "user-1")).unwrap();
            store
                .add(&workload(
                    "12-1",
                    "user-2",
                    WorkloadType::Network,
                    serde_json::json!({"name": "mynet"}),
                ))
                .unwrap();
        }

        // a fresh open replays by-id and arrives at the same tallies
        let reopened = FsStore::open(&root).unwrap();
        let counters = reopened.counters();
        assert_eq!(counters.volumes, 2);
        assert_eq!(counters.networks, 1);
        assert_eq!(counters.sru, 2 * 1024 * 1024 * 1024);

        reopened.remove(&WorkloadId::parse("11-1").unwrap()).unwrap();
        assert_eq!(reopened.counters().volumes, 1);
    }

    #[test]
    fn test_legacy_record_accepted() {
        let (dir, store) = store();
        let wl = volume("10-1", "user-1");

        // unversioned file straight from an old node
        let payload = serde_json::to_vec(&wl).unwrap();
        fs::write(dir.path().join("cache/by-id/10-1"), payload).unwrap();

        let loaded = store.get(&wl.id).unwrap();
        assert_eq!(loaded.id, wl.id);
    }

    #[test]
    fn test_future_version_rejected() {
        let (dir, store) = store();
        let wl = volume("10-1", "user-1");

        let payload = serde_json::to_vec(&wl).unwrap();
        let record = plfm_versioned::write(&Version::new(2, 0, 0), &payload);
        fs::write(dir.path().join("cache/by-id/10-1"), record).unwrap();

        assert!(matches!(
            store.get(&wl.id),
            Err(StorageError::UnknownVersion { .. })
        ));
    }

    #[test]
    fn test_first_boot_wipes_cache() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("cache");
        let marker = dir.path().join("run/provisiond.booted");

        {
            let store = FsStore::open(&root).unwrap();
            store.add(&volume("10-1", "user-1")).unwrap();
        }

        // no marker yet: first boot, the cache goes away
        let store = FsStore::open_at_boot(&root, &marker).unwrap();
        assert!(!store.exists(&WorkloadId::parse("10-1").unwrap()).unwrap());
        store.add(&volume("11-1", "user-1")).unwrap();
        drop(store);

        // marker present: restart, the cache stays
        let store = FsStore::open_at_boot(&root, &marker).unwrap();
        assert!(store.exists(&WorkloadId::parse("11-1").unwrap()).unwrap());
    }

    #[tokio::test]
    async fn test_store_as_authoritative_lookup() {
        let (_dir, store) = store();
        let mut wl = volume("10-1", "user-1");
        store.add(&wl).unwrap();

        let status = store.lookup(&wl.id).await.unwrap();
        assert_eq!(status, LookupStatus::Found { to_delete: false });

        wl.to_delete = true;
        store.set(&wl).unwrap();
        let status = store.lookup(&wl.id).await.unwrap();
        assert_eq!(status, LookupStatus::Found { to_delete: true });

        let missing = WorkloadId::parse("99-9").unwrap();
        assert_eq!(store.lookup(&missing).await.unwrap(), LookupStatus::NotFound);
    }
}
