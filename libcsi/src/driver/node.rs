use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::{CONTEXT_CAPACITY, TOPOLOGY_KEY, VolumeLocks, resolve_subvolume, to_i64};
use crate::btrfs::SubvolumeManager;
use crate::config::{DriverConfig, ProvisioningMode};
use crate::error::CsiError;
use crate::node::CsiNode;
use crate::types::*;
use crate::validate;

pub struct NodeService {
    config: Arc<DriverConfig>,
    subvolumes: Arc<SubvolumeManager>,
    locks: Arc<VolumeLocks>,
}

impl NodeService {
    pub fn new(
        config: Arc<DriverConfig>,
        subvolumes: Arc<SubvolumeManager>,
        locks: Arc<VolumeLocks>,
    ) -> Self {
        Self {
            config,
            subvolumes,
            locks,
        }
    }

    /// Quota for a subvolume created at publish time: the capacity recorded
    /// by `CreateVolume`, or the configured default when absent or zero.
    fn publish_quota(&self, req: &NodePublishVolumeRequest) -> u64 {
        req.volume_context
            .get(CONTEXT_CAPACITY)
            .and_then(|c| c.parse::<u64>().ok())
            .filter(|&c| c > 0)
            .unwrap_or(self.config.default_quota_bytes)
    }
}

#[async_trait]
impl CsiNode for NodeService {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn node_stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        validate::node_stage_volume(&req)?;

        tokio::fs::create_dir_all(&req.staging_target_path)
            .await
            .map_err(|e| {
                CsiError::Internal(format!(
                    "failed to create staging directory {}: {e}",
                    req.staging_target_path
                ))
            })?;
        info!(staging = %req.staging_target_path, "volume staged");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn node_unstage_volume(&self, req: NodeUnstageVolumeRequest) -> Result<(), CsiError> {
        validate::node_unstage_volume(&req)?;

        match tokio::fs::remove_dir_all(&req.staging_target_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CsiError::Internal(format!(
                    "failed to remove staging directory {}: {e}",
                    req.staging_target_path
                )));
            }
        }
        info!(staging = %req.staging_target_path, "volume unstaged");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target = %req.target_path))]
    async fn node_publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        validate::node_publish_volume(&req)?;

        let target = Path::new(&req.target_path);
        let subvolume = resolve_subvolume(&self.config, &req.volume_id)?;
        let _guard = self.locks.lock(&req.volume_id).await;

        if self.subvolumes.is_mounted(target).await {
            debug!("target already mounted");
            return Ok(());
        }

        tokio::fs::create_dir_all(target).await.map_err(|e| {
            CsiError::Internal(format!(
                "failed to create target directory {}: {e}",
                target.display()
            ))
        })?;

        match self.config.provisioning {
            ProvisioningMode::WaitForFirstConsumer => {
                self.subvolumes
                    .create(&subvolume, self.publish_quota(&req))
                    .await
                    .map_err(|e| {
                        CsiError::Internal(format!("failed to create btrfs subvolume: {e}"))
                    })?;
            }
            ProvisioningMode::Immediate => {
                if !self.subvolumes.exists(&subvolume).await? {
                    return Err(CsiError::NotFound(format!(
                        "subvolume {} does not exist",
                        subvolume.display()
                    )));
                }
            }
        }

        self.subvolumes
            .mount(&subvolume, target)
            .await
            .map_err(|e| CsiError::Internal(format!("failed to mount subvolume: {e}")))?;

        if req.readonly
            && let Err(e) = self.subvolumes.remount_read_only(target).await
        {
            if let Err(undo) = self.subvolumes.unmount(target).await {
                warn!(error = %undo, "failed to undo writable mount");
            }
            return Err(CsiError::Internal(format!(
                "failed to remount read-only: {e}"
            )));
        }

        info!(subvolume = %subvolume.display(), readonly = req.readonly, "volume published");
        Ok(())
    }

    /// The target directory is removed with `remove_dir`, never recursively,
    /// so a mount that survived a failed unmount cannot have its contents
    /// deleted; it surfaces as an error instead.
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target = %req.target_path))]
    async fn node_unpublish_volume(&self, req: NodeUnpublishVolumeRequest) -> Result<(), CsiError> {
        validate::node_unpublish_volume(&req)?;

        let target = Path::new(&req.target_path);
        let owned_subvolume = if self.config.provisioning.node_owns_subvolumes() {
            Some(resolve_subvolume(&self.config, &req.volume_id)?)
        } else {
            None
        };
        let _guard = self.locks.lock(&req.volume_id).await;

        if let Err(e) = self.subvolumes.unmount(target).await {
            warn!(error = %e, "failed to unmount volume");
        }

        match tokio::fs::remove_dir(target).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CsiError::Internal(format!(
                    "failed to remove target directory {}: {e}",
                    target.display()
                )));
            }
        }

        if let Some(subvolume) = owned_subvolume
            && let Err(e) = self.subvolumes.delete(&subvolume).await
        {
            warn!(error = %e, subvolume = %subvolume.display(), "failed to delete btrfs subvolume");
        }

        info!("volume unpublished");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn node_get_volume_stats(
        &self,
        req: NodeGetVolumeStatsRequest,
    ) -> Result<NodeGetVolumeStatsResponse, CsiError> {
        validate::node_get_volume_stats(&req)?;

        let path = Path::new(&req.volume_path);
        if !self.subvolumes.exists(path).await? {
            return Err(CsiError::NotFound(format!(
                "volume path {} does not exist",
                path.display()
            )));
        }

        let usage = self
            .subvolumes
            .usage(path)
            .await
            .map_err(|e| CsiError::Internal(format!("failed to get volume stats: {e}")))?;

        Ok(NodeGetVolumeStatsResponse {
            usage: vec![VolumeUsage {
                available: to_i64(usage.free_estimated),
                total: to_i64(usage.device_size),
                used: to_i64(usage.used),
                unit: UsageUnit::Bytes,
            }],
            volume_condition: None,
        })
    }

    async fn node_get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(vec![
            NodeCapability::StageUnstageVolume,
            NodeCapability::GetVolumeStats,
        ])
    }

    async fn node_get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.config.node_id.clone(),
            max_volumes_per_node: self.config.max_volumes_per_node,
            accessible_topology: Some(Topology::single(TOPOLOGY_KEY, &self.config.node_id)),
        })
    }
}
