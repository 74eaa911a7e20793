//! Core CSI types: volumes, capabilities, topology, requests and responses.
//!
//! Field names and enum values follow the Container Storage Interface
//! protobuf definitions (`csi.v1`) so that a JSON rendering of these types
//! lines up field-for-field with what an orchestrator sends.  Optional
//! message fields are `Option`s; repeated and map fields default to empty.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Orchestrator-assigned unique identifier for a volume.  For this plugin the
/// id is the `name` passed to `CreateVolume`, which also names the subvolume
/// directory under the root path.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct VolumeId(pub String);

impl VolumeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// `VolumeCapability.AccessMode.Mode`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessMode {
    #[default]
    Unknown,
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
    SingleNodeSingleWriter,
    SingleNodeMultiWriter,
}

/// `VolumeCapability.AccessMode`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeAccessMode {
    #[serde(default)]
    pub mode: AccessMode,
}

/// `VolumeCapability.MountVolume`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountVolume {
    /// Filesystem type; empty means "plugin default".
    #[serde(default)]
    pub fs_type: String,
    /// Additional mount flags (e.g. `"noatime"`).
    #[serde(default)]
    pub mount_flags: Vec<String>,
    #[serde(default)]
    pub volume_mount_group: String,
}

/// `VolumeCapability.access_type` oneof.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    Block {},
    Mount(MountVolume),
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCapability {
    pub access_type: AccessType,
    #[serde(default)]
    pub access_mode: VolumeAccessMode,
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self {
            access_type: AccessType::Mount(MountVolume::default()),
            access_mode: VolumeAccessMode {
                mode: AccessMode::SingleNodeWriter,
            },
        }
    }
}

/// Bounds on the size of a volume, in bytes.  Zero means "unspecified".
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapacityRange {
    #[serde(default)]
    pub required_bytes: i64,
    #[serde(default)]
    pub limit_bytes: i64,
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// Topology constraint expressed as key-value segments.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topology {
    /// Topology segments, e.g. `{"kubernetes.io/hostname": "node-01"}`.
    #[serde(default)]
    pub segments: HashMap<String, String>,
}

impl Topology {
    /// A topology consisting of a single segment.
    pub fn single(key: &str, value: &str) -> Self {
        Self {
            segments: HashMap::from([(key.to_owned(), value.to_owned())]),
        }
    }
}

/// `TopologyRequirement` as sent with `CreateVolume`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopologyRequirement {
    #[serde(default)]
    pub requisite: Vec<Topology>,
    #[serde(default)]
    pub preferred: Vec<Topology>,
}

// ---------------------------------------------------------------------------
// Volume metadata
// ---------------------------------------------------------------------------

/// `VolumeContentSource` oneof.  Carried through unchanged; clone and
/// restore-from-snapshot are not offered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VolumeContentSource {
    Snapshot { snapshot_id: String },
    Volume { volume_id: String },
}

/// A provisioned volume as reported to the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    /// Provisioned capacity in bytes (0 = unknown).
    #[serde(default)]
    pub capacity_bytes: i64,
    pub volume_id: VolumeId,
    /// Opaque context passed from Controller to every later Node call.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    #[serde(default)]
    pub content_source: Option<VolumeContentSource>,
    /// Nodes from which the volume is reachable.
    #[serde(default)]
    pub accessible_topology: Vec<Topology>,
}

/// Health report attached to volume lookups and stats.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCondition {
    pub abnormal: bool,
    #[serde(default)]
    pub message: String,
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// `GetPluginInfoResponse`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"btrfs.csi.k8s.io"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
    #[serde(default)]
    pub manifest: HashMap<String, String>,
}

/// `PluginCapability.Service.Type`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
    /// Plugin supports volume topology constraints.
    VolumeAccessibilityConstraints,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// `ControllerServiceCapability.RPC.Type`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerCapability {
    CreateDeleteVolume,
    PublishUnpublishVolume,
    ListVolumes,
    GetCapacity,
    CreateDeleteSnapshot,
    ListSnapshots,
    CloneVolume,
    PublishReadonly,
    ExpandVolume,
    ListVolumesPublishedNodes,
    VolumeCondition,
    GetVolume,
    SingleNodeMultiWriter,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Suggested name; becomes the volume id.
    pub name: String,
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Storage-class parameters, e.g. `subvolumeRoot`.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub volume_content_source: Option<VolumeContentSource>,
    #[serde(default)]
    pub accessibility_requirements: Option<TopologyRequirement>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteVolumeRequest {
    pub volume_id: VolumeId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerGetVolumeRequest {
    pub volume_id: VolumeId,
}

/// `ControllerGetVolumeResponse.VolumeStatus`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeStatus {
    #[serde(default)]
    pub published_node_ids: Vec<String>,
    #[serde(default)]
    pub volume_condition: Option<VolumeCondition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControllerGetVolumeResponse {
    pub volume: Volume,
    pub status: VolumeStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesRequest {
    pub volume_id: VolumeId,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    /// `None` models an absent repeated field, which CSI treats as an error.
    #[serde(default)]
    pub volume_capabilities: Option<Vec<VolumeCapability>>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// `ValidateVolumeCapabilitiesResponse.Confirmed`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Confirmed {
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidateVolumeCapabilitiesResponse {
    /// `None` means "not confirmed"; `message` then says why.
    #[serde(default)]
    pub confirmed: Option<Confirmed>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetCapacityRequest {
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub accessible_topology: Option<Topology>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetCapacityResponse {
    pub available_capacity: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerPublishVolumeRequest {
    pub volume_id: VolumeId,
    pub node_id: String,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerUnpublishVolumeRequest {
    pub volume_id: VolumeId,
    #[serde(default)]
    pub node_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListVolumesRequest {
    #[serde(default)]
    pub max_entries: i32,
    #[serde(default)]
    pub starting_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    pub source_volume_id: VolumeId,
    pub name: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteSnapshotRequest {
    pub snapshot_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListSnapshotsRequest {
    #[serde(default)]
    pub max_entries: i32,
    #[serde(default)]
    pub starting_token: String,
    #[serde(default)]
    pub source_volume_id: String,
    #[serde(default)]
    pub snapshot_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerExpandVolumeRequest {
    pub volume_id: VolumeId,
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// `NodeServiceCapability.RPC.Type`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeCapability {
    StageUnstageVolume,
    GetVolumeStats,
    ExpandVolume,
    VolumeCondition,
    SingleNodeMultiWriter,
    VolumeMountGroup,
}

/// Request to stage a volume on a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    pub volume_id: VolumeId,
    #[serde(default)]
    pub publish_context: HashMap<String, String>,
    /// Node-global staging directory.
    pub staging_target_path: String,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    /// Opaque context carried from `CreateVolume`.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUnstageVolumeRequest {
    pub volume_id: VolumeId,
    pub staging_target_path: String,
}

/// Request to bind a volume into a consumer's target path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    pub volume_id: VolumeId,
    #[serde(default)]
    pub publish_context: HashMap<String, String>,
    pub staging_target_path: String,
    /// Consumer-visible path, e.g.
    /// `/var/lib/kubelet/pods/<uid>/volumes/kubernetes.io~csi/<pv>/mount`.
    pub target_path: String,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    /// Whether the bind mount should be read-only.
    #[serde(default)]
    pub readonly: bool,
    /// Opaque context carried from `CreateVolume`.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUnpublishVolumeRequest {
    pub volume_id: VolumeId,
    pub target_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeGetVolumeStatsRequest {
    pub volume_id: VolumeId,
    /// Any path the volume is published or staged at.
    pub volume_path: String,
    #[serde(default)]
    pub staging_target_path: String,
}

/// `VolumeUsage.Unit`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UsageUnit {
    #[default]
    Unknown,
    Bytes,
    Inodes,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeUsage {
    pub available: i64,
    pub total: i64,
    pub used: i64,
    pub unit: UsageUnit,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeGetVolumeStatsResponse {
    #[serde(default)]
    pub usage: Vec<VolumeUsage>,
    #[serde(default)]
    pub volume_condition: Option<VolumeCondition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeExpandVolumeRequest {
    pub volume_id: VolumeId,
    #[serde(default)]
    pub volume_path: String,
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
}

/// Information about the node on which the Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    /// Unique node identifier.
    pub node_id: String,
    /// Maximum number of volumes the node can host (0 = unlimited).
    #[serde(default)]
    pub max_volumes_per_node: i64,
    /// Topology that pins volumes to this node.
    #[serde(default)]
    pub accessible_topology: Option<Topology>,
}
