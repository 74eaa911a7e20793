//! Request validation.
//!
//! Pure checks for the fields each RPC requires.  Handlers call these first
//! so a malformed request is rejected with [`CsiError::InvalidArgument`]
//! before any filesystem side effect.

use std::collections::HashMap;
use std::path::Path;

use crate::config::check_root;
use crate::driver::PARAM_SUBVOLUME_ROOT;
use crate::error::CsiError;
use crate::types::*;

fn require(present: bool, what: &str) -> Result<(), CsiError> {
    if present {
        Ok(())
    } else {
        Err(CsiError::InvalidArgument(format!("{what} is required")))
    }
}

fn require_volume_id(id: &VolumeId) -> Result<(), CsiError> {
    require(!id.is_empty(), "volume ID")
}

fn subvolume_root_parameter(parameters: &HashMap<String, String>) -> Result<(), CsiError> {
    match parameters.get(PARAM_SUBVOLUME_ROOT) {
        Some(root) if !root.is_empty() => check_root(Path::new(root)),
        _ => Ok(()),
    }
}

pub fn create_volume(req: &CreateVolumeRequest) -> Result<(), CsiError> {
    require(!req.name.is_empty(), "volume name")?;
    let range = req
        .capacity_range
        .as_ref()
        .ok_or_else(|| CsiError::InvalidArgument("capacity range is required".into()))?;
    if range.required_bytes < 0 || range.limit_bytes < 0 {
        return Err(CsiError::InvalidArgument(
            "capacity range must not be negative".into(),
        ));
    }
    subvolume_root_parameter(&req.parameters)
}

pub fn get_capacity(req: &GetCapacityRequest) -> Result<(), CsiError> {
    subvolume_root_parameter(&req.parameters)
}

pub fn delete_volume(req: &DeleteVolumeRequest) -> Result<(), CsiError> {
    require_volume_id(&req.volume_id)
}

pub fn controller_get_volume(req: &ControllerGetVolumeRequest) -> Result<(), CsiError> {
    require_volume_id(&req.volume_id)
}

pub fn validate_volume_capabilities(
    req: &ValidateVolumeCapabilitiesRequest,
) -> Result<(), CsiError> {
    require_volume_id(&req.volume_id)?;
    require(req.volume_capabilities.is_some(), "volume capabilities")
}

pub fn node_stage_volume(req: &NodeStageVolumeRequest) -> Result<(), CsiError> {
    require_volume_id(&req.volume_id)?;
    require(!req.staging_target_path.is_empty(), "staging target path")
}

pub fn node_unstage_volume(req: &NodeUnstageVolumeRequest) -> Result<(), CsiError> {
    require_volume_id(&req.volume_id)?;
    require(!req.staging_target_path.is_empty(), "staging target path")
}

pub fn node_publish_volume(req: &NodePublishVolumeRequest) -> Result<(), CsiError> {
    require_volume_id(&req.volume_id)?;
    require(!req.staging_target_path.is_empty(), "staging target path")?;
    require(!req.target_path.is_empty(), "target path")
}

pub fn node_unpublish_volume(req: &NodeUnpublishVolumeRequest) -> Result<(), CsiError> {
    require_volume_id(&req.volume_id)?;
    require(!req.target_path.is_empty(), "target path")
}

pub fn node_get_volume_stats(req: &NodeGetVolumeStatsRequest) -> Result<(), CsiError> {
    require_volume_id(&req.volume_id)?;
    require(!req.volume_path.is_empty(), "volume path")
}
