//! Btrfs CSI driver.
//!
//! [`Driver`] composes the three CSI services around shared collaborators:
//! the [`DriverConfig`], one [`SubvolumeManager`] and one [`VolumeLocks`]
//! map.  Each service is its own type implementing exactly one of
//! [`CsiIdentity`](crate::CsiIdentity), [`CsiController`](crate::CsiController)
//! and [`CsiNode`](crate::CsiNode).
//!
//! # Provisioning policies
//!
//! | | `Immediate` | `WaitForFirstConsumer` |
//! |---|---|---|
//! | subvolume created by | `CreateVolume` | first `NodePublishVolume` |
//! | subvolume deleted by | `DeleteVolume` | `NodeUnpublishVolume` |
//! | publish of a missing subvolume | `NotFound` | creates it |

mod controller;
mod identity;
mod node;

pub use controller::ControllerService;
pub use identity::IdentityService;
pub use node::NodeService;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

use crate::btrfs::{SubvolumeManager, SystemRunner};
use crate::config::{DriverConfig, check_root};
use crate::error::CsiError;
use crate::transport::CsiServices;
use crate::types::VolumeId;

/// Topology segment key pinning a volume to a node.
pub const TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

/// Volume context keys written by `CreateVolume`.
pub const CONTEXT_PROVISIONER_IDENTITY: &str = "storage.kubernetes.io/csiProvisionerIdentity";
pub const CONTEXT_TARGET_NODE: &str = "targetNode";
pub const CONTEXT_CAPACITY: &str = "capacity";
/// Storage-class parameter and volume context key overriding the root path.
pub const PARAM_SUBVOLUME_ROOT: &str = "subvolumeRoot";

pub const PROVISIONER_IDENTITY: &str = "btrfs-csi";

/// Path of the subvolume backing `volume_id` under `root`.
///
/// The id becomes a single path component, so ids that would escape the
/// root are rejected.
pub(crate) fn subvolume_path(root: &Path, volume_id: &VolumeId) -> Result<PathBuf, CsiError> {
    let id = volume_id.as_str();
    if id.contains('/') || id == "." || id == ".." || id.contains('\0') {
        return Err(CsiError::InvalidArgument(format!(
            "volume ID {id:?} is not a valid subvolume name"
        )));
    }
    Ok(root.join(id))
}

/// Volume id handed out by `CreateVolume` for `name` placed under `root`,
/// together with the subvolume path.
///
/// A volume under the configured root keeps its bare name.  One under an
/// overriding root is identified by its absolute subvolume path, so every
/// later RPC can locate it from the id alone.
pub(crate) fn volume_id_for(
    config: &DriverConfig,
    root: &Path,
    name: &str,
) -> Result<(VolumeId, PathBuf), CsiError> {
    let path = subvolume_path(root, &VolumeId::from(name.to_owned()))?;
    let volume_id = if root == config.root_path {
        VolumeId::from(name.to_owned())
    } else {
        VolumeId::from(path.display().to_string())
    };
    Ok((volume_id, path))
}

/// Subvolume backing `volume_id`; the inverse of [`volume_id_for`].
pub(crate) fn resolve_subvolume(
    config: &DriverConfig,
    volume_id: &VolumeId,
) -> Result<PathBuf, CsiError> {
    let id = volume_id.as_str();
    if !id.starts_with('/') {
        return subvolume_path(&config.root_path, volume_id);
    }

    let path = Path::new(id);
    let invalid =
        || CsiError::InvalidArgument(format!("volume ID {id:?} is not a valid subvolume path"));
    check_root(path).map_err(|_| invalid())?;
    match (path.parent(), path.file_name().and_then(|n| n.to_str())) {
        (Some(root), Some(name)) => subvolume_path(root, &VolumeId::from(name.to_owned())),
        _ => Err(invalid()),
    }
}

/// Saturating conversion for CSI's signed byte counts.
pub(crate) fn to_i64(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

/// Per-volume mutual exclusion.
///
/// Held for the duration of create/delete/publish/unpublish so two calls for
/// the same volume id cannot race on the existence check that makes the
/// filesystem primitives idempotent.  Entries are dropped once the last
/// holder or waiter is gone.
#[derive(Default)]
pub struct VolumeLocks {
    locks: DashMap<VolumeId, Arc<Mutex<()>>>,
}

pub struct VolumeGuard<'a> {
    locks: &'a VolumeLocks,
    volume_id: VolumeId,
    _guard: OwnedMutexGuard<()>,
}

impl VolumeLocks {
    pub async fn lock(&self, volume_id: &VolumeId) -> VolumeGuard<'_> {
        let mutex = self.locks.entry(volume_id.clone()).or_default().clone();
        VolumeGuard {
            locks: self,
            volume_id: volume_id.clone(),
            _guard: mutex.lock_owned().await,
        }
    }

    /// Number of volume ids currently locked or waited on.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Drop for VolumeGuard<'_> {
    fn drop(&mut self) {
        // The map and this guard each hold one reference; anything more is
        // a waiter that still needs the entry.
        self.locks
            .locks
            .remove_if(&self.volume_id, |_, m| Arc::strong_count(m) <= 2);
    }
}

/// The plugin: one addressable entity serving Identity, Controller and Node.
pub struct Driver {
    config: Arc<DriverConfig>,
    subvolumes: Arc<SubvolumeManager>,
    locks: Arc<VolumeLocks>,
    identity: Arc<IdentityService>,
    controller: Arc<ControllerService>,
    node: Arc<NodeService>,
}

impl Driver {
    /// Driver that runs the real `btrfs`, `mount` and `umount` binaries.
    pub fn new(config: DriverConfig) -> Result<Self, CsiError> {
        Self::with_subvolumes(config, SubvolumeManager::new(Arc::new(SystemRunner)))
    }

    pub fn with_subvolumes(
        config: DriverConfig,
        subvolumes: SubvolumeManager,
    ) -> Result<Self, CsiError> {
        config.validate()?;
        info!(
            driver = %config.driver_name,
            version = env!("CARGO_PKG_VERSION"),
            node_id = %config.node_id,
            root = %config.root_path.display(),
            provisioning = ?config.provisioning,
            "initializing btrfs CSI driver",
        );

        let config = Arc::new(config);
        let subvolumes = Arc::new(subvolumes);
        let locks = Arc::new(VolumeLocks::default());

        Ok(Self {
            identity: Arc::new(IdentityService::new(Arc::clone(&config))),
            controller: Arc::new(ControllerService::new(
                Arc::clone(&config),
                Arc::clone(&subvolumes),
                Arc::clone(&locks),
            )),
            node: Arc::new(NodeService::new(
                Arc::clone(&config),
                Arc::clone(&subvolumes),
                Arc::clone(&locks),
            )),
            config,
            subvolumes,
            locks,
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn identity(&self) -> &IdentityService {
        &self.identity
    }

    pub fn controller(&self) -> &ControllerService {
        &self.controller
    }

    pub fn node(&self) -> &NodeService {
        &self.node
    }

    /// Handles for serving all three services on one endpoint.
    pub fn services(&self) -> CsiServices {
        CsiServices {
            identity: self.identity.clone(),
            controller: self.controller.clone(),
            node: self.node.clone(),
        }
    }

    /// Per-volume locks shared by the controller and node services.
    pub fn locks(&self) -> &VolumeLocks {
        &self.locks
    }

    /// Ensure the root exists and is backed by btrfs.  Call once at startup.
    pub async fn check_support(&self) -> Result<(), CsiError> {
        let root = &self.config.root_path;
        tokio::fs::create_dir_all(root).await.map_err(|e| {
            CsiError::Internal(format!("failed to create root {}: {e}", root.display()))
        })?;
        self.subvolumes.support_check(root).await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::testing::driver;
    use super::*;
    use crate::config::ProvisioningMode;
    use crate::types::*;
    use crate::{CsiController, CsiNode};

    const GIB: i64 = 1024 * 1024 * 1024;

    fn create_request(name: &str, bytes: i64) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.into(),
            capacity_range: Some(CapacityRange {
                required_bytes: bytes,
                limit_bytes: 0,
            }),
            volume_capabilities: vec![VolumeCapability::default()],
            ..Default::default()
        }
    }

    fn publish_request(
        volume: &Volume,
        staging: &Path,
        target: &Path,
    ) -> NodePublishVolumeRequest {
        NodePublishVolumeRequest {
            volume_id: volume.volume_id.clone(),
            staging_target_path: staging.display().to_string(),
            target_path: target.display().to_string(),
            volume_capability: Some(VolumeCapability::default()),
            volume_context: volume.volume_context.clone(),
            ..Default::default()
        }
    }

    #[test]
    fn subvolume_path_rejects_escapes() {
        let root = Path::new("/pool");
        assert_eq!(
            subvolume_path(root, &"pvc-1".into()).unwrap(),
            Path::new("/pool/pvc-1")
        );
        for bad in ["..", ".", "a/b", "../etc"] {
            assert!(matches!(
                subvolume_path(root, &bad.into()),
                Err(CsiError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn volume_ids_locate_their_subvolume() {
        let config = DriverConfig::new("n").with_root_path("/pool");

        let (id, path) = volume_id_for(&config, Path::new("/pool"), "pvc-1").unwrap();
        assert_eq!(id.as_str(), "pvc-1");
        assert_eq!(path, Path::new("/pool/pvc-1"));
        assert_eq!(resolve_subvolume(&config, &id).unwrap(), path);

        let (id, path) = volume_id_for(&config, Path::new("/mnt/fast"), "pvc-1").unwrap();
        assert_eq!(id.as_str(), "/mnt/fast/pvc-1");
        assert_eq!(path, Path::new("/mnt/fast/pvc-1"));
        assert_eq!(resolve_subvolume(&config, &id).unwrap(), path);

        for bad in ["/", "/mnt/../etc/x", "/mnt/fast/", "/mnt//x", "a/b"] {
            assert!(
                matches!(
                    resolve_subvolume(&config, &bad.into()),
                    Err(CsiError::InvalidArgument(_))
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn overridden_root_lifecycle_immediate() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, runner) = driver(tmp.path(), ProvisioningMode::Immediate);
        let custom = tmp.path().join("custom");
        let subvolume = custom.join("v1");
        let mut req = create_request("v1", GIB);
        req.parameters
            .insert(PARAM_SUBVOLUME_ROOT.into(), custom.display().to_string());

        let volume = driver.controller().create_volume(req).await.unwrap();
        assert!(subvolume.is_dir());

        let found = driver
            .controller()
            .controller_get_volume(ControllerGetVolumeRequest {
                volume_id: volume.volume_id.clone(),
            })
            .await
            .unwrap();
        assert_eq!(found.volume.volume_id, volume.volume_id);

        let staging = tmp.path().join("staging");
        let target = tmp.path().join("pods/uid/mount");
        driver
            .node()
            .node_publish_volume(publish_request(&volume, &staging, &target))
            .await
            .unwrap();
        assert_eq!(
            runner.count(&format!(
                "mount --bind {} {}",
                subvolume.display(),
                target.display()
            )),
            1
        );
        driver
            .node()
            .node_unpublish_volume(NodeUnpublishVolumeRequest {
                volume_id: volume.volume_id.clone(),
                target_path: target.display().to_string(),
            })
            .await
            .unwrap();

        driver
            .controller()
            .delete_volume(DeleteVolumeRequest {
                volume_id: volume.volume_id.clone(),
            })
            .await
            .unwrap();
        assert!(!subvolume.exists());
        assert_eq!(runner.count("btrfs subvolume delete"), 1);

        let err = driver
            .controller()
            .controller_get_volume(ControllerGetVolumeRequest {
                volume_id: volume.volume_id,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::NotFound(_)));
    }

    #[tokio::test]
    async fn overridden_root_lifecycle_wait_for_first_consumer() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, runner) = driver(tmp.path(), ProvisioningMode::WaitForFirstConsumer);
        let custom = tmp.path().join("custom");
        let subvolume = custom.join("v1");
        let mut req = create_request("v1", GIB);
        req.parameters
            .insert(PARAM_SUBVOLUME_ROOT.into(), custom.display().to_string());

        let volume = driver.controller().create_volume(req).await.unwrap();
        let staging = tmp.path().join("staging");
        let target = tmp.path().join("pods/uid/mount");
        driver
            .node()
            .node_publish_volume(publish_request(&volume, &staging, &target))
            .await
            .unwrap();
        assert!(subvolume.is_dir());
        assert!(!tmp.path().join("pool/v1").exists());

        driver
            .node()
            .node_unpublish_volume(NodeUnpublishVolumeRequest {
                volume_id: volume.volume_id,
                target_path: target.display().to_string(),
            })
            .await
            .unwrap();
        assert!(!subvolume.exists());
        assert_eq!(runner.count("btrfs subvolume delete"), 1);
    }

    #[tokio::test]
    async fn full_lifecycle_immediate() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, runner) = driver(tmp.path(), ProvisioningMode::Immediate);
        let staging = tmp.path().join("staging");
        let target = tmp.path().join("pods/uid/mount");
        let subvolume = tmp.path().join("pool/v1");

        let volume = driver
            .controller()
            .create_volume(create_request("v1", GIB))
            .await
            .unwrap();
        assert!(subvolume.is_dir());

        driver
            .node()
            .node_stage_volume(NodeStageVolumeRequest {
                volume_id: "v1".into(),
                staging_target_path: staging.display().to_string(),
                volume_context: volume.volume_context.clone(),
                ..Default::default()
            })
            .await
            .unwrap();

        driver
            .node()
            .node_publish_volume(publish_request(&volume, &staging, &target))
            .await
            .unwrap();
        assert!(target.is_dir());

        let stats = driver
            .node()
            .node_get_volume_stats(NodeGetVolumeStatsRequest {
                volume_id: "v1".into(),
                volume_path: target.display().to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(
            stats.usage,
            vec![VolumeUsage {
                available: 10_183_770_112,
                total: 10_737_418_240,
                used: 393_216,
                unit: UsageUnit::Bytes,
            }]
        );

        driver
            .node()
            .node_unpublish_volume(NodeUnpublishVolumeRequest {
                volume_id: "v1".into(),
                target_path: target.display().to_string(),
            })
            .await
            .unwrap();
        assert!(!target.exists());

        driver
            .node()
            .node_unstage_volume(NodeUnstageVolumeRequest {
                volume_id: "v1".into(),
                staging_target_path: staging.display().to_string(),
            })
            .await
            .unwrap();
        assert!(!staging.exists());

        driver
            .controller()
            .delete_volume(DeleteVolumeRequest {
                volume_id: "v1".into(),
            })
            .await
            .unwrap();
        assert!(!subvolume.exists());

        let mount = format!(
            "mount --bind {} {}",
            subvolume.display(),
            target.display()
        );
        assert_eq!(runner.count(&mount), 1);
        assert_eq!(runner.count(&format!("umount {}", target.display())), 1);
        assert_eq!(runner.count("btrfs subvolume create"), 1);
        assert_eq!(runner.count("btrfs subvolume delete"), 1);
    }

    #[tokio::test]
    async fn full_lifecycle_wait_for_first_consumer() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, runner) = driver(tmp.path(), ProvisioningMode::WaitForFirstConsumer);
        let staging = tmp.path().join("staging");
        let target = tmp.path().join("pods/uid/mount");
        let subvolume = tmp.path().join("pool/v1");

        let volume = driver
            .controller()
            .create_volume(create_request("v1", 2 * GIB))
            .await
            .unwrap();
        assert!(runner.calls().is_empty(), "create must not touch the filesystem");
        assert!(!subvolume.exists());

        driver
            .node()
            .node_publish_volume(publish_request(&volume, &staging, &target))
            .await
            .unwrap();
        assert!(subvolume.is_dir());
        assert_eq!(
            runner.count(&format!("btrfs qgroup limit 2G {}", subvolume.display())),
            1
        );

        driver
            .node()
            .node_unpublish_volume(NodeUnpublishVolumeRequest {
                volume_id: "v1".into(),
                target_path: target.display().to_string(),
            })
            .await
            .unwrap();
        assert!(!subvolume.exists());

        let before = runner.calls().len();
        driver
            .controller()
            .delete_volume(DeleteVolumeRequest {
                volume_id: "v1".into(),
            })
            .await
            .unwrap();
        assert_eq!(runner.calls().len(), before);
    }

    #[tokio::test]
    async fn invalid_create_touches_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, runner) = driver(tmp.path(), ProvisioningMode::Immediate);

        let err = driver
            .controller()
            .create_volume(create_request("", GIB))
            .await
            .unwrap_err();

        assert!(matches!(err, CsiError::InvalidArgument(_)));
        assert!(runner.calls().is_empty());
        assert!(!tmp.path().join("pool").exists());
    }

    #[tokio::test]
    async fn publish_before_provision_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, runner) = driver(tmp.path(), ProvisioningMode::Immediate);
        let volume = Volume {
            volume_id: "never-created".into(),
            volume_context: HashMap::new(),
            ..Default::default()
        };

        let err = driver
            .node()
            .node_publish_volume(publish_request(
                &volume,
                &tmp.path().join("staging"),
                &tmp.path().join("target"),
            ))
            .await
            .unwrap_err();

        assert!(matches!(err, CsiError::NotFound(_)));
        assert_eq!(runner.count("mount"), 0);
    }

    // Without the per-volume lock both calls can pass the existence check
    // before either creates the subvolume, and the second `subvolume create`
    // fails.  The lock serializes them so exactly one create reaches the tool.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_for_same_id_are_serialized() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, runner) = driver(tmp.path(), ProvisioningMode::Immediate);
        let driver = Arc::new(driver);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let driver = Arc::clone(&driver);
                tokio::spawn(async move {
                    driver
                        .controller()
                        .create_volume(create_request("shared", GIB))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(runner.count("btrfs subvolume create"), 1);
        assert!(driver.locks().is_empty());
    }

    #[tokio::test]
    async fn volume_locks_release_entries() {
        let locks = VolumeLocks::default();
        let a: VolumeId = "a".into();
        {
            let _guard = locks.lock(&a).await;
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());

        let guard = locks.lock(&a).await;
        let other = locks.lock(&"b".into()).await;
        assert_eq!(locks.len(), 2);
        drop(guard);
        drop(other);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn check_support_creates_root() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, runner) = driver(tmp.path(), ProvisioningMode::Immediate);
        driver.check_support().await.unwrap();
        assert!(tmp.path().join("pool").is_dir());
        assert_eq!(runner.count("btrfs version"), 1);

        runner.fail("btrfs filesystem show", 1, "ERROR: not a btrfs filesystem\n");
        let err = driver.check_support().await.unwrap_err();
        assert!(matches!(err, CsiError::Internal(msg) if msg.contains("not a btrfs filesystem")));
    }
}
