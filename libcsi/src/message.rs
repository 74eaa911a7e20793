//! CSI protocol messages exchanged over the plugin socket.
//!
//! [`CsiMessage`] is the envelope for every request and response.  Each
//! connection carries exactly one JSON-encoded request followed by one
//! response: the matching response variant, [`CsiMessage::Ok`] for RPCs
//! without a payload, or [`CsiMessage::Error`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // ----- Identity requests ----------------------------------------------
    GetPluginInfo,
    GetPluginCapabilities,
    Probe,

    // ----- Controller requests --------------------------------------------
    CreateVolume(CreateVolumeRequest),
    DeleteVolume(DeleteVolumeRequest),
    ControllerGetVolume(ControllerGetVolumeRequest),
    ValidateVolumeCapabilities(ValidateVolumeCapabilitiesRequest),
    GetCapacity(GetCapacityRequest),
    ControllerGetCapabilities,
    ListVolumes(ListVolumesRequest),
    ControllerPublishVolume(ControllerPublishVolumeRequest),
    ControllerUnpublishVolume(ControllerUnpublishVolumeRequest),
    CreateSnapshot(CreateSnapshotRequest),
    DeleteSnapshot(DeleteSnapshotRequest),
    ListSnapshots(ListSnapshotsRequest),
    ControllerExpandVolume(ControllerExpandVolumeRequest),

    // ----- Node requests --------------------------------------------------
    NodeStageVolume(NodeStageVolumeRequest),
    NodeUnstageVolume(NodeUnstageVolumeRequest),
    NodePublishVolume(NodePublishVolumeRequest),
    NodeUnpublishVolume(NodeUnpublishVolumeRequest),
    NodeGetVolumeStats(NodeGetVolumeStatsRequest),
    NodeGetCapabilities,
    NodeGetInfo,
    NodeExpandVolume(NodeExpandVolumeRequest),

    // ----- Responses ------------------------------------------------------
    PluginInfo(PluginInfo),
    PluginCapabilities(Vec<PluginCapability>),
    ProbeResult(bool),
    VolumeCreated(Volume),
    VolumeDescribed(ControllerGetVolumeResponse),
    CapabilitiesValidated(ValidateVolumeCapabilitiesResponse),
    Capacity(GetCapacityResponse),
    ControllerCapabilities(Vec<ControllerCapability>),
    VolumeList(Vec<Volume>),
    VolumeStats(NodeGetVolumeStatsResponse),
    NodeCapabilities(Vec<NodeCapability>),
    NodeInfo(NodeInfo),
    /// Success without a payload.
    Ok,
    Error(CsiError),
}

impl CsiMessage {
    /// Whether this variant is a reply rather than a request.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Self::PluginInfo(_)
                | Self::PluginCapabilities(_)
                | Self::ProbeResult(_)
                | Self::VolumeCreated(_)
                | Self::VolumeDescribed(_)
                | Self::CapabilitiesValidated(_)
                | Self::Capacity(_)
                | Self::ControllerCapabilities(_)
                | Self::VolumeList(_)
                | Self::VolumeStats(_)
                | Self::NodeCapabilities(_)
                | Self::NodeInfo(_)
                | Self::Ok
                | Self::Error(_)
        )
    }

    /// Turn an [`CsiMessage::Error`] reply into `Err`.
    pub fn into_result(self) -> Result<Self, CsiError> {
        match self {
            Self::Error(e) => Err(e),
            other => Ok(other),
        }
    }
}

impl fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GetPluginInfo => f.write_str("GetPluginInfo"),
            Self::GetPluginCapabilities => f.write_str("GetPluginCapabilities"),
            Self::Probe => f.write_str("Probe"),
            Self::CreateVolume(req) => write!(f, "CreateVolume(name={})", req.name),
            Self::DeleteVolume(req) => write!(f, "DeleteVolume({})", req.volume_id),
            Self::ControllerGetVolume(req) => write!(f, "ControllerGetVolume({})", req.volume_id),
            Self::ValidateVolumeCapabilities(req) => {
                write!(f, "ValidateVolumeCapabilities({})", req.volume_id)
            }
            Self::GetCapacity(_) => f.write_str("GetCapacity"),
            Self::ControllerGetCapabilities => f.write_str("ControllerGetCapabilities"),
            Self::ListVolumes(_) => f.write_str("ListVolumes"),
            Self::ControllerPublishVolume(req) => {
                write!(f, "ControllerPublishVolume({})", req.volume_id)
            }
            Self::ControllerUnpublishVolume(req) => {
                write!(f, "ControllerUnpublishVolume({})", req.volume_id)
            }
            Self::CreateSnapshot(_) => f.write_str("CreateSnapshot"),
            Self::DeleteSnapshot(_) => f.write_str("DeleteSnapshot"),
            Self::ListSnapshots(_) => f.write_str("ListSnapshots"),
            Self::ControllerExpandVolume(req) => {
                write!(f, "ControllerExpandVolume({})", req.volume_id)
            }
            Self::NodeStageVolume(req) => write!(f, "NodeStageVolume({})", req.volume_id),
            Self::NodeUnstageVolume(req) => write!(f, "NodeUnstageVolume({})", req.volume_id),
            Self::NodePublishVolume(req) => write!(f, "NodePublishVolume({})", req.volume_id),
            Self::NodeUnpublishVolume(req) => write!(f, "NodeUnpublishVolume({})", req.volume_id),
            Self::NodeGetVolumeStats(req) => write!(f, "NodeGetVolumeStats({})", req.volume_id),
            Self::NodeGetCapabilities => f.write_str("NodeGetCapabilities"),
            Self::NodeGetInfo => f.write_str("NodeGetInfo"),
            Self::NodeExpandVolume(req) => write!(f, "NodeExpandVolume({})", req.volume_id),
            Self::PluginInfo(info) => write!(f, "PluginInfo(name={})", info.name),
            Self::PluginCapabilities(caps) => write!(f, "PluginCapabilities(count={})", caps.len()),
            Self::ProbeResult(ready) => write!(f, "ProbeResult({ready})"),
            Self::VolumeCreated(v) => write!(f, "VolumeCreated({})", v.volume_id),
            Self::VolumeDescribed(resp) => write!(f, "VolumeDescribed({})", resp.volume.volume_id),
            Self::CapabilitiesValidated(resp) => {
                write!(f, "CapabilitiesValidated(confirmed={})", resp.confirmed.is_some())
            }
            Self::Capacity(resp) => write!(f, "Capacity({})", resp.available_capacity),
            Self::ControllerCapabilities(caps) => {
                write!(f, "ControllerCapabilities(count={})", caps.len())
            }
            Self::VolumeList(vs) => write!(f, "VolumeList(count={})", vs.len()),
            Self::VolumeStats(resp) => write!(f, "VolumeStats(entries={})", resp.usage.len()),
            Self::NodeCapabilities(caps) => write!(f, "NodeCapabilities(count={})", caps.len()),
            Self::NodeInfo(info) => write!(f, "NodeInfo({})", info.node_id),
            Self::Ok => f.write_str("Ok"),
            Self::Error(e) => write!(f, "Error({e})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_survives_json() {
        let msg = CsiMessage::CreateVolume(CreateVolumeRequest {
            name: "pvc-1".into(),
            capacity_range: Some(CapacityRange {
                required_bytes: 1024,
                limit_bytes: 0,
            }),
            volume_capabilities: vec![VolumeCapability::default()],
            ..Default::default()
        });
        let json = serde_json::to_string(&msg).expect("serialize");
        let de: CsiMessage = serde_json::from_str(&json).expect("deserialize");
        match de {
            CsiMessage::CreateVolume(req) => {
                assert_eq!(req.name, "pvc-1");
                assert_eq!(req.capacity_range.unwrap().required_bytes, 1024);
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn error_reply_becomes_err() {
        let json = serde_json::to_string(&CsiMessage::Error(CsiError::NotFound("v1".into())))
            .expect("serialize");
        let de: CsiMessage = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(de.into_result().unwrap_err(), CsiError::NotFound("v1".into()));
        assert!(matches!(CsiMessage::Ok.into_result(), Ok(CsiMessage::Ok)));
    }

    #[test]
    fn classifies_responses() {
        assert!(CsiMessage::Ok.is_response());
        assert!(CsiMessage::ProbeResult(true).is_response());
        assert!(!CsiMessage::Probe.is_response());
        assert!(!CsiMessage::NodeGetInfo.is_response());
    }

    #[test]
    fn display_formatting() {
        assert_eq!(CsiMessage::Ok.to_string(), "Ok");
        assert_eq!(CsiMessage::Probe.to_string(), "Probe");
        let msg = CsiMessage::DeleteVolume(DeleteVolumeRequest {
            volume_id: "v1".into(),
        });
        assert_eq!(msg.to_string(), "DeleteVolume(v1)");
    }
}
