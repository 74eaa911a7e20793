//! CSI Node service trait.
//!
//! The Node service runs on each worker node and makes a volume visible to
//! its consumer:
//!
//! 1. **Stage**: prepare the node-global staging directory.
//! 2. **Publish**: bind-mount the subvolume into the consumer's target path.
//! 3. **Unpublish**: remove the bind mount and the target directory.
//! 4. **Unstage**: remove the staging directory.
//!
//! Stage/unstage bracket zero or more publish/unpublish cycles.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::*;

/// Node service: local mount / unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume.  Idempotent.
    async fn node_stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unstage a volume.  Idempotent.
    async fn node_unstage_volume(&self, req: NodeUnstageVolumeRequest) -> Result<(), CsiError>;

    /// Publish a volume at `target_path`.  Idempotent for the same target.
    async fn node_publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume from `target_path`.  Idempotent.
    async fn node_unpublish_volume(&self, req: NodeUnpublishVolumeRequest)
    -> Result<(), CsiError>;

    /// Report usage of the filesystem behind `volume_path`.
    async fn node_get_volume_stats(
        &self,
        req: NodeGetVolumeStatsRequest,
    ) -> Result<NodeGetVolumeStatsResponse, CsiError>;

    /// Advertise the node RPCs this plugin supports.
    async fn node_get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;

    /// Return information about the node on which this service is running.
    async fn node_get_info(&self) -> Result<NodeInfo, CsiError>;

    async fn node_expand_volume(&self, _req: NodeExpandVolumeRequest) -> Result<(), CsiError> {
        Err(CsiError::unimplemented("NodeExpandVolume"))
    }
}
