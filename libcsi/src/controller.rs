//! CSI Controller service trait.
//!
//! The Controller service manages the provisioning side of the volume
//! lifecycle: creation, deletion, capability validation and capacity
//! queries.
//!
//! Operations this plugin does not offer have default implementations that
//! return [`CsiError::Unimplemented`].  That answer is permanent: callers
//! must read it as "capability not offered" and must not retry.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::*;

/// Controller service: centralized volume management.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a volume.
    ///
    /// The returned [`Volume`] carries the `volume_context` that the
    /// orchestrator forwards to every subsequent Node call.  Calling this
    /// again with the same name must succeed without provisioning twice.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a volume.  Deleting an unknown or already-deleted volume
    /// succeeds.
    async fn delete_volume(&self, req: DeleteVolumeRequest) -> Result<(), CsiError>;

    /// Check whether the given capabilities are supported for the volume.
    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse, CsiError>;

    /// Return the capacity available for new volumes.
    async fn get_capacity(&self, req: GetCapacityRequest) -> Result<GetCapacityResponse, CsiError>;

    /// Advertise the controller RPCs this plugin supports.
    async fn controller_get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;

    async fn controller_get_volume(
        &self,
        _req: ControllerGetVolumeRequest,
    ) -> Result<ControllerGetVolumeResponse, CsiError> {
        Err(CsiError::unimplemented("ControllerGetVolume"))
    }

    async fn controller_publish_volume(
        &self,
        _req: ControllerPublishVolumeRequest,
    ) -> Result<(), CsiError> {
        Err(CsiError::unimplemented("ControllerPublishVolume"))
    }

    async fn controller_unpublish_volume(
        &self,
        _req: ControllerUnpublishVolumeRequest,
    ) -> Result<(), CsiError> {
        Err(CsiError::unimplemented("ControllerUnpublishVolume"))
    }

    async fn list_volumes(&self, _req: ListVolumesRequest) -> Result<Vec<Volume>, CsiError> {
        Err(CsiError::unimplemented("ListVolumes"))
    }

    async fn create_snapshot(&self, _req: CreateSnapshotRequest) -> Result<(), CsiError> {
        Err(CsiError::unimplemented("CreateSnapshot"))
    }

    async fn delete_snapshot(&self, _req: DeleteSnapshotRequest) -> Result<(), CsiError> {
        Err(CsiError::unimplemented("DeleteSnapshot"))
    }

    async fn list_snapshots(&self, _req: ListSnapshotsRequest) -> Result<(), CsiError> {
        Err(CsiError::unimplemented("ListSnapshots"))
    }

    async fn controller_expand_volume(
        &self,
        _req: ControllerExpandVolumeRequest,
    ) -> Result<(), CsiError> {
        Err(CsiError::unimplemented("ControllerExpandVolume"))
    }
}
