//! Driver configuration.
//!
//! A [`DriverConfig`] is built once at startup and shared by `Arc` with every
//! service.  Nothing reads configuration from process-global state after
//! construction.

use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CsiError;

pub const DEFAULT_DRIVER_NAME: &str = "btrfs.csi.k8s.io";
pub const DEFAULT_ENDPOINT: &str = "unix:///tmp/csi.sock";
pub const DEFAULT_ROOT_PATH: &str = "/var/lib/btrfs-csi";
/// 1 GiB.
pub const DEFAULT_QUOTA_BYTES: u64 = 1024 * 1024 * 1024;

/// When the subvolume backing a volume is physically created.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ProvisioningMode {
    /// `CreateVolume` creates the subvolume; `DeleteVolume` removes it.
    #[default]
    Immediate,
    /// `CreateVolume` only records the request; the node creates the
    /// subvolume on first `NodePublishVolume` and removes it on
    /// `NodeUnpublishVolume`.
    WaitForFirstConsumer,
}

impl ProvisioningMode {
    /// Whether the node side owns subvolume lifetime.
    pub fn node_owns_subvolumes(self) -> bool {
        matches!(self, Self::WaitForFirstConsumer)
    }
}

impl FromStr for ProvisioningMode {
    type Err = CsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(Self::Immediate),
            "wait-for-first-consumer" | "WaitForFirstConsumer" => Ok(Self::WaitForFirstConsumer),
            other => Err(CsiError::InvalidArgument(format!(
                "unknown provisioning mode {other:?}"
            ))),
        }
    }
}

/// Process-wide driver identity and defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Name reported by `GetPluginInfo`.
    pub driver_name: String,
    /// This node's identity; also the topology value reported to the
    /// scheduler.
    pub node_id: String,
    /// Socket address, `unix:///path/to/csi.sock`.
    pub endpoint: String,
    /// Directory under which one subvolume per volume id is created.
    pub root_path: PathBuf,
    /// Quota applied when a volume reaches the node without a capacity.
    pub default_quota_bytes: u64,
    pub provisioning: ProvisioningMode,
    /// Reported by `NodeGetInfo`; 0 means unlimited.
    pub max_volumes_per_node: i64,
}

impl DriverConfig {
    /// Configuration with defaults for everything but the node id.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_owned(),
            node_id: node_id.into(),
            endpoint: DEFAULT_ENDPOINT.to_owned(),
            root_path: PathBuf::from(DEFAULT_ROOT_PATH),
            default_quota_bytes: DEFAULT_QUOTA_BYTES,
            provisioning: ProvisioningMode::default(),
            max_volumes_per_node: 0,
        }
    }

    pub fn with_root_path(mut self, root: impl Into<PathBuf>) -> Self {
        self.root_path = root.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_provisioning(mut self, mode: ProvisioningMode) -> Self {
        self.provisioning = mode;
        self
    }

    pub fn with_default_quota(mut self, bytes: u64) -> Self {
        self.default_quota_bytes = bytes;
        self
    }

    /// Reject configurations the driver cannot run with.
    pub fn validate(&self) -> Result<(), CsiError> {
        if self.node_id.is_empty() {
            return Err(CsiError::InvalidArgument("node id is required".into()));
        }
        if !self.root_path.is_absolute() {
            return Err(CsiError::InvalidArgument(format!(
                "root path {} must be absolute",
                self.root_path.display()
            )));
        }
        self.socket_path()?;
        Ok(())
    }

    /// Filesystem path of the Unix socket named by [`Self::endpoint`].
    ///
    /// Both `unix:///abs/path` and the legacy `unix://abs/path` resolve to
    /// `/abs/path`.
    pub fn socket_path(&self) -> Result<PathBuf, CsiError> {
        let rest = self.endpoint.strip_prefix("unix://").ok_or_else(|| {
            CsiError::InvalidArgument(format!(
                "endpoint {:?} must use the unix:// scheme",
                self.endpoint
            ))
        })?;
        if rest.trim_start_matches('/').is_empty() {
            return Err(CsiError::InvalidArgument(format!(
                "endpoint {:?} has no socket path",
                self.endpoint
            )));
        }
        if rest.starts_with('/') {
            Ok(PathBuf::from(rest))
        } else {
            Ok(Path::new("/").join(rest))
        }
    }

    /// Subvolume root for a volume, honouring a per-volume override.
    ///
    /// The override is trusted here; requests carrying one are checked with
    /// [`check_root`] before they reach this point.
    pub fn root_for(&self, override_root: Option<&str>) -> PathBuf {
        match override_root {
            Some(root) if !root.is_empty() => PathBuf::from(root),
            _ => self.root_path.clone(),
        }
    }
}

/// Reject a subvolume root that is relative or not in normal form
/// (`.`/`..` components, repeated or trailing separators).
pub fn check_root(root: &Path) -> Result<(), CsiError> {
    let normal = root.is_absolute()
        && root
            .components()
            .all(|c| matches!(c, Component::RootDir | Component::Normal(_)))
        && root.components().collect::<PathBuf>().as_os_str() == root.as_os_str();
    if normal {
        Ok(())
    } else {
        Err(CsiError::InvalidArgument(format!(
            "subvolume root {} must be an absolute, normalized path",
            root.display()
        )))
    }
}
