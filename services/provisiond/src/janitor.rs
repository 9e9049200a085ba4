//! Host resource reconciliation.
//!
//! The janitor walks what is actually present on the machine (0-db
//! namespaces and their hosting containers, public-ip tap interfaces, VMs,
//! subvolumes, virtual disks) and deletes anything whose reservation is
//! gone or flagged for deletion. Host access goes through the narrow
//! [`HostInventory`] contract; per-orphan authority comes from
//! [`AuthoritativeLookup`]. Both are injected, so the janitor never touches
//! the store or the engine directly.
//!
//! Stages run in a fixed order so dependencies are respected (a 0-db
//! namespace goes before the container serving it, a VM before its disks),
//! and each stage is isolated: one failing stage never stops the others.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use plfm_gridtypes::WorkloadId;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Container namespace 0-db hosting containers live in.
const ZDB_NAMESPACE: &str = "zdb";

/// The 0-db namespace every instance serves for itself; never a workload.
const ZDB_DEFAULT_NAMESPACE: &str = "default";

/// Subvolume prefix of the 0-db data pools.
const ZDB_POOL_PREFIX: &str = "zdb";

/// Legacy firecracker scratch subvolume.
const LEGACY_FCVMS: &str = "fcvms";

/// Authoritative status of a reservation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStatus {
    Found { to_delete: bool },
    NotFound,
}

/// Failure asking the authority about an id.
#[derive(Debug, Error)]
pub enum LookupError {
    /// The authority could not answer right now; skip the candidate and
    /// retry on a later cleanup run.
    #[error("transient lookup failure: {0}")]
    Transient(String),
}

/// Answers "does this reservation still exist, and should it go away".
#[async_trait]
pub trait AuthoritativeLookup: Send + Sync {
    async fn lookup(&self, id: &WorkloadId) -> Result<LookupStatus, LookupError>;
}

/// A running container as the host sees it.
#[derive(Debug, Clone)]
pub struct RunningContainer {
    pub id: String,
    /// Mounted root filesystem of the container.
    pub root_fs: PathBuf,
    /// Sources of all other mounts into the container.
    pub mounts: Vec<PathBuf>,
}

/// Listing and deletion primitives over actual host resources.
///
/// Implemented by the host glue (container runtime, storage and network
/// daemons); mocked in tests.
#[async_trait]
pub trait HostInventory: Send + Sync {
    async fn list_container_namespaces(&self) -> anyhow::Result<Vec<String>>;
    async fn list_containers(&self, namespace: &str) -> anyhow::Result<Vec<RunningContainer>>;
    async fn delete_container(&self, namespace: &str, id: &str) -> anyhow::Result<()>;

    /// 0-db namespaces served by a hosting container.
    async fn list_zdb_namespaces(&self, container_id: &str) -> anyhow::Result<Vec<String>>;
    async fn delete_zdb_namespace(&self, container_id: &str, namespace: &str)
        -> anyhow::Result<()>;

    async fn list_tap_interfaces(&self) -> anyhow::Result<Vec<String>>;
    async fn delete_tap_interface(&self, name: &str) -> anyhow::Result<()>;

    async fn list_vms(&self) -> anyhow::Result<Vec<String>>;
    async fn delete_vm(&self, name: &str) -> anyhow::Result<()>;

    /// Paths of all subvolumes on the node.
    async fn list_filesystems(&self) -> anyhow::Result<Vec<PathBuf>>;
    async fn release_filesystem(&self, path: &Path) -> anyhow::Result<()>;

    async fn list_disks(&self) -> anyhow::Result<Vec<String>>;
    async fn delete_disk(&self, name: &str) -> anyhow::Result<()>;
}

/// The cleanup contract the engine drives.
#[async_trait]
pub trait Cleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;
}

/// Reconciles host resources against the authoritative reservation record.
pub struct Janitor {
    inventory: Arc<dyn HostInventory>,
    lookup: Arc<dyn AuthoritativeLookup>,
    tap_pattern: Regex,
    disk_pattern: Regex,
}

impl Janitor {
    pub fn new(inventory: Arc<dyn HostInventory>, lookup: Arc<dyn AuthoritativeLookup>) -> Self {
        Self {
            inventory,
            lookup,
            tap_pattern: Regex::new(r"^p-(\d+-\d+)$").expect("static pattern"),
            disk_pattern: Regex::new(r"^(\d+-\d+)").expect("static pattern"),
        }
    }

    /// Whether the resource behind `id` should be deleted.
    ///
    /// `None` means the authority could not answer; the candidate is skipped
    /// until the next run.
    async fn should_delete(&self, id: &WorkloadId) -> Option<bool> {
        match self.lookup.lookup(id).await {
            Ok(LookupStatus::NotFound) => Some(true),
            Ok(LookupStatus::Found { to_delete }) => Some(to_delete),
            Err(e) => {
                warn!(id = %id, error = %e, "authoritative lookup failed, skipping candidate");
                None
            }
        }
    }

    /// Stage 1: 0-db namespaces and their hosting containers.
    async fn cleanup_zdb(&self) -> anyhow::Result<()> {
        let containers = self.inventory.list_containers(ZDB_NAMESPACE).await?;

        for container in containers {
            let namespaces = match self.inventory.list_zdb_namespaces(&container.id).await {
                Ok(namespaces) => namespaces,
                Err(e) => {
                    warn!(container = %container.id, error = %e, "failed to list 0-db namespaces");
                    continue;
                }
            };

            let mut serving = 0usize;
            for namespace in &namespaces {
                if namespace == ZDB_DEFAULT_NAMESPACE {
                    continue;
                }

                let Ok(id) = WorkloadId::parse(namespace) else {
                    serving += 1;
                    continue;
                };

                match self.should_delete(&id).await {
                    Some(true) => {
                        info!(container = %container.id, namespace = %namespace, "deleting 0-db namespace");
                        if let Err(e) = self
                            .inventory
                            .delete_zdb_namespace(&container.id, namespace)
                            .await
                        {
                            warn!(namespace = %namespace, error = %e, "failed to delete 0-db namespace");
                            serving += 1;
                        }
                    }
                    Some(false) => serving += 1,
                    None => serving += 1,
                }
            }

            if serving == 0 {
                info!(container = %container.id, "0-db container serves nothing, removing");
                if let Err(e) = self.inventory.delete_container(ZDB_NAMESPACE, &container.id).await
                {
                    warn!(container = %container.id, error = %e, "failed to delete 0-db container");
                }
            }
        }

        Ok(())
    }

    /// Stage 2: public-ip tap interfaces, recognised by their `p-<id>` name.
    async fn cleanup_taps(&self) -> anyhow::Result<()> {
        for name in self.inventory.list_tap_interfaces().await? {
            let Some(capture) = self.tap_pattern.captures(&name) else {
                continue;
            };
            let Ok(id) = WorkloadId::parse(&capture[1]) else {
                continue;
            };

            if self.should_delete(&id).await == Some(true) {
                info!(tap = %name, id = %id, "deleting public-ip tap");
                if let Err(e) = self.inventory.delete_tap_interface(&name).await {
                    warn!(tap = %name, error = %e, "failed to delete tap");
                }
            }
        }

        Ok(())
    }

    /// Stage 3: VMs, named by their workload id.
    async fn cleanup_vms(&self) -> anyhow::Result<()> {
        for name in self.inventory.list_vms().await? {
            let Ok(id) = WorkloadId::parse(&name) else {
                continue;
            };

            if self.should_delete(&id).await == Some(true) {
                info!(vm = %name, "deleting vm");
                if let Err(e) = self.inventory.delete_vm(&name).await {
                    warn!(vm = %name, error = %e, "failed to delete vm");
                }
            }
        }

        Ok(())
    }

    /// Stage 4: subvolumes, shielded by the protection set.
    async fn cleanup_filesystems(&self) -> anyhow::Result<()> {
        let protected = self.protected_paths().await?;

        for path in self.inventory.list_filesystems().await? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string)
            else {
                continue;
            };

            if protected.contains(&name) {
                debug!(subvolume = %path.display(), "in use by a running container, keeping");
                continue;
            }

            if is_legacy_name(&name) {
                info!(subvolume = %path.display(), "deleting legacy subvolume");
                if let Err(e) = self.inventory.release_filesystem(&path).await {
                    warn!(subvolume = %path.display(), error = %e, "failed to release subvolume");
                }
                continue;
            }

            let Ok(id) = WorkloadId::parse(&name) else {
                debug!(subvolume = %path.display(), "unattributable name, keeping");
                continue;
            };

            if self.should_delete(&id).await == Some(true) {
                info!(subvolume = %path.display(), "deleting orphaned subvolume");
                if let Err(e) = self.inventory.release_filesystem(&path).await {
                    warn!(subvolume = %path.display(), error = %e, "failed to release subvolume");
                }
            }
        }

        Ok(())
    }

    /// Stage 5: virtual disks with a workload-id name prefix.
    async fn cleanup_disks(&self) -> anyhow::Result<()> {
        for name in self.inventory.list_disks().await? {
            let Some(capture) = self.disk_pattern.captures(&name) else {
                continue;
            };
            let Ok(id) = WorkloadId::parse(&capture[1]) else {
                continue;
            };

            if self.should_delete(&id).await == Some(true) {
                info!(disk = %name, id = %id, "deleting orphaned vdisk");
                if let Err(e) = self.inventory.delete_disk(&name).await {
                    warn!(disk = %name, error = %e, "failed to delete vdisk");
                }
            }
        }

        Ok(())
    }

    /// Basenames of every path a running container depends on: its root fs
    /// and all of its mount sources. These must survive any cleanup.
    async fn protected_paths(&self) -> anyhow::Result<HashSet<String>> {
        let mut protected = HashSet::new();

        for namespace in self.inventory.list_container_namespaces().await? {
            let containers = match self.inventory.list_containers(&namespace).await {
                Ok(containers) => containers,
                Err(e) => {
                    warn!(namespace = %namespace, error = %e, "failed to list containers");
                    continue;
                }
            };

            for container in containers {
                if let Some(name) = container.root_fs.file_name().and_then(|n| n.to_str()) {
                    protected.insert(name.to_string());
                }
                for mount in &container.mounts {
                    if let Some(name) = mount.file_name().and_then(|n| n.to_str()) {
                        protected.insert(name.to_string());
                    }
                }
            }
        }

        Ok(protected)
    }
}

#[async_trait]
impl Cleanup for Janitor {
    async fn cleanup(&self) -> anyhow::Result<()> {
        info!("starting host resource cleanup");

        let mut first_failure = None;
        let stages: [(&str, anyhow::Result<()>); 5] = [
            ("zdb", self.cleanup_zdb().await),
            ("taps", self.cleanup_taps().await),
            ("vms", self.cleanup_vms().await),
            ("filesystems", self.cleanup_filesystems().await),
            ("disks", self.cleanup_disks().await),
        ];

        for (stage, outcome) in stages {
            if let Err(e) = outcome {
                warn!(stage, error = %e, "cleanup stage failed");
                if first_failure.is_none() {
                    first_failure = Some(e.context(format!("cleanup stage {stage}")));
                }
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Names that are always deletable leftovers of older node generations:
/// 64-character random roots, 0-db pools, and the firecracker scratch
/// volume.
fn is_legacy_name(name: &str) -> bool {
    name.len() == 64 || name.starts_with(ZDB_POOL_PREFIX) || name == LEGACY_FCVMS
}

#[cfg(test)]
mod tests {
    use super::mock::{MockInventory, MockLookup};
    use super::*;

    fn id(s: &str) -> WorkloadId {
        WorkloadId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_orphan_tap_deleted() {
        let inventory = Arc::new(MockInventory::default());
        inventory.add_tap("p-10-1");
        inventory.add_tap("eth0");

        let lookup = Arc::new(MockLookup::default());
        let janitor = Janitor::new(inventory.clone(), lookup);

        janitor.cleanup().await.unwrap();
        assert_eq!(inventory.taps(), vec!["eth0".to_string()]);
    }

    #[tokio::test]
    async fn test_live_tap_kept() {
        let inventory = Arc::new(MockInventory::default());
        inventory.add_tap("p-10-1");

        let lookup = Arc::new(MockLookup::default());
        lookup.insert(id("10-1"), LookupStatus::Found { to_delete: false });

        Janitor::new(inventory.clone(), lookup).cleanup().await.unwrap();
        assert_eq!(inventory.taps(), vec!["p-10-1".to_string()]);
    }

    #[tokio::test]
    async fn test_flagged_vm_deleted() {
        let inventory = Arc::new(MockInventory::default());
        inventory.add_vm("12-1");

        let lookup = Arc::new(MockLookup::default());
        lookup.insert(id("12-1"), LookupStatus::Found { to_delete: true });

        Janitor::new(inventory.clone(), lookup).cleanup().await.unwrap();
        assert!(inventory.vms().is_empty());
    }

    #[tokio::test]
    async fn test_transient_lookup_skips_candidate() {
        let inventory = Arc::new(MockInventory::default());
        inventory.add_vm("12-1");
        inventory.add_vm("13-1");

        let lookup = Arc::new(MockLookup::default());
        lookup.fail(id("12-1"));

        Janitor::new(inventory.clone(), lookup).cleanup().await.unwrap();
        // 12-1 survives the transient failure, 13-1 is orphaned and goes
        assert_eq!(inventory.vms(), vec!["12-1".to_string()]);
    }

    #[tokio::test]
    async fn test_protected_subvolume_survives() {
        let inventory = Arc::new(MockInventory::default());
        inventory.add_container(
            "apps",
            RunningContainer {
                id: "c1".to_string(),
                root_fs: PathBuf::from("/mnt/volumes/abc"),
                mounts: vec![PathBuf::from("/mnt/volumes/20-1")],
            },
        );
        inventory.add_filesystem("/mnt/volumes/abc");
        inventory.add_filesystem("/mnt/volumes/20-1");
        inventory.add_filesystem("/mnt/volumes/21-1");

        // every lookup is a 404: only the unprotected orphan may go
        let janitor = Janitor::new(inventory.clone(), Arc::new(MockLookup::default()));
        janitor.cleanup().await.unwrap();
        janitor.cleanup().await.unwrap();

        let kept = inventory.filesystems();
        assert!(kept.contains(&PathBuf::from("/mnt/volumes/abc")));
        assert!(kept.contains(&PathBuf::from("/mnt/volumes/20-1")));
        assert!(!kept.contains(&PathBuf::from("/mnt/volumes/21-1")));
    }

    #[tokio::test]
    async fn test_legacy_names_deleted() {
        let inventory = Arc::new(MockInventory::default());
        let random_root = "a".repeat(64);
        inventory.add_filesystem(format!("/mnt/{random_root}"));
        inventory.add_filesystem("/mnt/zdb-pool-1");
        inventory.add_filesystem("/mnt/fcvms");
        inventory.add_filesystem("/mnt/keepme");

        Janitor::new(inventory.clone(), Arc::new(MockLookup::default()))
            .cleanup()
            .await
            .unwrap();

        assert_eq!(inventory.filesystems(), vec![PathBuf::from("/mnt/keepme")]);
    }

    #[tokio::test]
    async fn test_zdb_namespace_and_container_lifecycle() {
        let inventory = Arc::new(MockInventory::default());
        inventory.add_container(
            ZDB_NAMESPACE,
            RunningContainer {
                id: "zdb-c1".to_string(),
                root_fs: PathBuf::from("/mnt/zdb-c1"),
                mounts: vec![],
            },
        );
        inventory.add_zdb_namespace("zdb-c1", "default");
        inventory.add_zdb_namespace("zdb-c1", "30-1");
        inventory.add_zdb_namespace("zdb-c1", "31-1");

        let lookup = Arc::new(MockLookup::default());
        lookup.insert(id("30-1"), LookupStatus::Found { to_delete: false });
        // 31-1 is gone from the authority

        let janitor = Janitor::new(inventory.clone(), lookup.clone());
        janitor.cleanup().await.unwrap();

        // 31-1 deleted in place, container kept for 30-1
        assert_eq!(inventory.zdb_namespaces("zdb-c1"), vec!["default", "30-1"]);
        assert!(!inventory.containers(ZDB_NAMESPACE).is_empty());

        // once 30-1 goes away too, the container is removed
        lookup.insert(id("30-1"), LookupStatus::NotFound);
        janitor.cleanup().await.unwrap();
        assert!(inventory.containers(ZDB_NAMESPACE).is_empty());
    }

    #[tokio::test]
    async fn test_disk_prefix_match() {
        let inventory = Arc::new(MockInventory::default());
        inventory.add_disk("40-1-disk0");
        inventory.add_disk("40-1");
        inventory.add_disk("scratch");

        let janitor = Janitor::new(inventory.clone(), Arc::new(MockLookup::default()));
        janitor.cleanup().await.unwrap();

        assert_eq!(inventory.disks(), vec!["scratch".to_string()]);
    }

    #[tokio::test]
    async fn test_stage_failure_does_not_stop_others() {
        let inventory = Arc::new(MockInventory::default());
        inventory.fail_listing("vms");
        inventory.add_disk("50-1");

        let janitor = Janitor::new(inventory.clone(), Arc::new(MockLookup::default()));
        let outcome = janitor.cleanup().await;

        assert!(outcome.is_err());
        // the disk stage still ran
        assert!(inventory.disks().is_empty());
    }
}

/// In-memory host state for tests.
pub mod mock {
    use std::collections::{BTreeMap, HashSet};
    use std::sync::Mutex;

    use super::*;

    /// [`HostInventory`] over plain in-memory collections.
    #[derive(Default)]
    pub struct MockInventory {
        containers: Mutex<BTreeMap<String, Vec<RunningContainer>>>,
        zdb_namespaces: Mutex<BTreeMap<String, Vec<String>>>,
        taps: Mutex<Vec<String>>,
        vms: Mutex<Vec<String>>,
        filesystems: Mutex<Vec<PathBuf>>,
        disks: Mutex<Vec<String>>,
        failing: Mutex<HashSet<String>>,
    }

    impl MockInventory {
        pub fn add_container(&self, namespace: &str, container: RunningContainer) {
            self.containers
                .lock()
                .unwrap()
                .entry(namespace.to_string())
                .or_default()
                .push(container);
        }

        pub fn add_zdb_namespace(&self, container: &str, namespace: &str) {
            self.zdb_namespaces
                .lock()
                .unwrap()
                .entry(container.to_string())
                .or_default()
                .push(namespace.to_string());
        }

        pub fn add_tap(&self, name: &str) {
            self.taps.lock().unwrap().push(name.to_string());
        }

        pub fn add_vm(&self, name: &str) {
            self.vms.lock().unwrap().push(name.to_string());
        }

        pub fn add_filesystem(&self, path: impl Into<PathBuf>) {
            self.filesystems.lock().unwrap().push(path.into());
        }

        pub fn add_disk(&self, name: &str) {
            self.disks.lock().unwrap().push(name.to_string());
        }

        /// Make one listing call fail (`"vms"`, `"taps"`, ...).
        pub fn fail_listing(&self, what: &str) {
            self.failing.lock().unwrap().insert(what.to_string());
        }

        pub fn containers(&self, namespace: &str) -> Vec<RunningContainer> {
            self.containers
                .lock()
                .unwrap()
                .get(namespace)
                .cloned()
                .unwrap_or_default()
        }

        pub fn zdb_namespaces(&self, container: &str) -> Vec<String> {
            self.zdb_namespaces
                .lock()
                .unwrap()
                .get(container)
                .cloned()
                .unwrap_or_default()
        }

        pub fn taps(&self) -> Vec<String> {
            self.taps.lock().unwrap().clone()
        }

        pub fn vms(&self) -> Vec<String> {
            self.vms.lock().unwrap().clone()
        }

        pub fn filesystems(&self) -> Vec<PathBuf> {
            self.filesystems.lock().unwrap().clone()
        }

        pub fn disks(&self) -> Vec<String> {
            self.disks.lock().unwrap().clone()
        }

        fn check(&self, what: &str) -> anyhow::Result<()> {
            if self.failing.lock().unwrap().contains(what) {
                anyhow::bail!("mock {what} listing failure");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl HostInventory for MockInventory {
        async fn list_container_namespaces(&self) -> anyhow::Result<Vec<String>> {
            self.check("container_namespaces")?;
            Ok(self.containers.lock().unwrap().keys().cloned().collect())
        }

        async fn list_containers(&self, namespace: &str) -> anyhow::Result<Vec<RunningContainer>> {
            self.check("containers")?;
            Ok(self.containers(namespace))
        }

        async fn delete_container(&self, namespace: &str, id: &str) -> anyhow::Result<()> {
            if let Some(list) = self.containers.lock().unwrap().get_mut(namespace) {
                list.retain(|c| c.id != id);
            }
            Ok(())
        }

        async fn list_zdb_namespaces(&self, container_id: &str) -> anyhow::Result<Vec<String>> {
            self.check("zdb_namespaces")?;
            Ok(self.zdb_namespaces(container_id))
        }

        async fn delete_zdb_namespace(
            &self,
            container_id: &str,
            namespace: &str,
        ) -> anyhow::Result<()> {
            if let Some(list) = self.zdb_namespaces.lock().unwrap().get_mut(container_id) {
                list.retain(|n| n != namespace);
            }
            Ok(())
        }

        async fn list_tap_interfaces(&self) -> anyhow::Result<Vec<String>> {
            self.check("taps")?;
            Ok(self.taps())
        }

        async fn delete_tap_interface(&self, name: &str) -> anyhow::Result<()> {
            self.taps.lock().unwrap().retain(|t| t != name);
            Ok(())
        }

        async fn list_vms(&self) -> anyhow::Result<Vec<String>> {
            self.check("vms")?;
            Ok(self.vms())
        }

        async fn delete_vm(&self, name: &str) -> anyhow::Result<()> {
            self.vms.lock().unwrap().retain(|v| v != name);
            Ok(())
        }

        async fn list_filesystems(&self) -> anyhow::Result<Vec<PathBuf>> {
            self.check("filesystems")?;
            Ok(self.filesystems())
        }

        async fn release_filesystem(&self, path: &Path) -> anyhow::Result<()> {
            self.filesystems.lock().unwrap().retain(|p| p != path);
            Ok(())
        }

        async fn list_disks(&self) -> anyhow::Result<Vec<String>> {
            self.check("disks")?;
            Ok(self.disks())
        }

        async fn delete_disk(&self, name: &str) -> anyhow::Result<()> {
            self.disks.lock().unwrap().retain(|d| d != name);
            Ok(())
        }
    }

    /// [`AuthoritativeLookup`] over a fixed map; unknown ids are not found.
    #[derive(Default)]
    pub struct MockLookup {
        statuses: Mutex<BTreeMap<WorkloadId, LookupStatus>>,
        failing: Mutex<HashSet<WorkloadId>>,
    }

    impl MockLookup {
        pub fn insert(&self, id: WorkloadId, status: LookupStatus) {
            self.statuses.lock().unwrap().insert(id, status);
        }

        /// Make lookups of `id` fail transiently.
        pub fn fail(&self, id: WorkloadId) {
            self.failing.lock().unwrap().insert(id);
        }
    }

    #[async_trait]
    impl AuthoritativeLookup for MockLookup {
        async fn lookup(&self, id: &WorkloadId) -> Result<LookupStatus, LookupError> {
            if self.failing.lock().unwrap().contains(id) {
                return Err(LookupError::Transient("mock outage".to_string()));
            }
            Ok(self
                .statuses
                .lock()
                .unwrap()
                .get(id)
                .copied()
                .unwrap_or(LookupStatus::NotFound))
        }
    }
}
