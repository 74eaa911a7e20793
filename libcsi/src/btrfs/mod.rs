//! Btrfs subvolume management.
//!
//! [`SubvolumeManager`] is the only component that touches the filesystem on
//! behalf of a volume.  It shells out to `btrfs`, `mount` and `umount`
//! through a [`CommandRunner`] and makes the non-idempotent tools safe to
//! retry by checking on-disk existence before every create or delete.
//!
//! # On-disk layout
//!
//! ```text
//! <root>/
//!   <volume-id>/      # one btrfs subvolume per volume, optionally quota-limited
//! ```
//!
//! There are no sidecar state files: the existence of the subvolume is the
//! whole persisted state.

pub mod command;
pub mod error;
pub mod usage;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashSet;
use tracing::{debug, info, instrument, warn};

pub use command::{CommandOutput, CommandRunner, SystemRunner};
pub use error::{BtrfsError, ParseError};
pub use usage::FilesystemUsage;

use command::command_line;

const BTRFS: &str = "btrfs";
const MOUNT: &str = "mount";
const UMOUNT: &str = "umount";

/// Exit status of `btrfs qgroup show` when quotas are not enabled.
const QGROUP_DISABLED_EXIT: i32 = 1;

/// Kernel mount table consulted by [`SubvolumeManager::is_mounted`].
pub const PROC_MOUNTS: &str = "/proc/self/mounts";

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Render a byte count in the unit-suffixed form `btrfs qgroup limit`
/// accepts, truncating to the largest whole unit.
///
/// ```
/// use libcsi::btrfs::format_quota_size;
/// assert_eq!(format_quota_size(1536 * 1024 * 1024), "1G");
/// assert_eq!(format_quota_size(512), "512B");
/// ```
pub fn format_quota_size(bytes: u64) -> String {
    if bytes >= GIB {
        format!("{}G", bytes / GIB)
    } else if bytes >= MIB {
        format!("{}M", bytes / MIB)
    } else if bytes >= KIB {
        format!("{}K", bytes / KIB)
    } else {
        format!("{bytes}B")
    }
}

/// What `btrfs subvolume show` reports about a subvolume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubvolumeInfo {
    pub id: u64,
    pub path: PathBuf,
}

fn path_arg(path: &Path) -> Result<&str, BtrfsError> {
    path.to_str().ok_or_else(|| {
        BtrfsError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path is not valid UTF-8"),
        )
    })
}

/// Undo the octal escaping `/proc/self/mounts` applies to whitespace and
/// backslashes in mount points.
fn unescape_mount_path(field: &str) -> String {
    field
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

pub struct SubvolumeManager {
    runner: Arc<dyn CommandRunner>,
    /// Roots on which `btrfs qgroup show` has succeeded.  A negative answer
    /// is not remembered, so enabling quotas later takes effect without a
    /// restart.
    quota_roots: DashSet<PathBuf>,
    mount_table: PathBuf,
}

impl SubvolumeManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            quota_roots: DashSet::new(),
            mount_table: PathBuf::from(PROC_MOUNTS),
        }
    }

    /// Read mount points from `path` instead of [`PROC_MOUNTS`].
    pub fn with_mount_table(mut self, path: impl Into<PathBuf>) -> Self {
        self.mount_table = path.into();
        self
    }

    /// Run a command and turn a non-zero exit into
    /// [`BtrfsError::CommandFailed`].
    async fn exec(&self, program: &str, args: &[&str]) -> Result<CommandOutput, BtrfsError> {
        let out = self.runner.run(program, args).await?;
        if out.success() {
            Ok(out)
        } else {
            Err(BtrfsError::CommandFailed {
                command: command_line(program, args),
                code: out.code,
                output: out.output,
            })
        }
    }

    pub async fn exists(&self, path: &Path) -> Result<bool, BtrfsError> {
        tokio::fs::try_exists(path)
            .await
            .map_err(|e| BtrfsError::io(path, e))
    }

    /// Create the subvolume at `path` and, when `quota_bytes > 0`, limit it.
    ///
    /// An existing `path` is success without invoking the tool.  A quota
    /// that cannot be applied is logged and the subvolume is left unmetered.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn create(&self, path: &Path, quota_bytes: u64) -> Result<(), BtrfsError> {
        if self.exists(path).await? {
            info!("subvolume already exists");
            return Ok(());
        }

        if let Some(root) = path.parent() {
            tokio::fs::create_dir_all(root)
                .await
                .map_err(|e| BtrfsError::io(root, e))?;
        }

        self.exec(BTRFS, &["subvolume", "create", path_arg(path)?])
            .await?;
        info!("created btrfs subvolume");

        if quota_bytes > 0
            && let Err(e) = self.set_quota(path, quota_bytes).await
        {
            warn!(error = %e, quota_bytes, "subvolume created without quota; growth is unbounded");
        }
        Ok(())
    }

    /// Delete the subvolume at `path`; a missing path is success.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn delete(&self, path: &Path) -> Result<(), BtrfsError> {
        if !self.exists(path).await? {
            info!("subvolume does not exist, skipping deletion");
            return Ok(());
        }

        self.exec(BTRFS, &["subvolume", "delete", path_arg(path)?])
            .await?;
        info!("deleted btrfs subvolume");
        Ok(())
    }

    /// Apply a qgroup limit of `quota_bytes` to the subvolume at `path`.
    ///
    /// Fails with [`BtrfsError::QuotaUnsupported`] when quotas are not
    /// enabled on the subvolume's root.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn set_quota(&self, path: &Path, quota_bytes: u64) -> Result<(), BtrfsError> {
        let root = path.parent().unwrap_or(path);
        if !self.quotas_enabled(root).await {
            return Err(BtrfsError::QuotaUnsupported(root.to_path_buf()));
        }

        let size = format_quota_size(quota_bytes);
        self.exec(BTRFS, &["qgroup", "limit", &size, path_arg(path)?])
            .await?;
        info!(%size, "set subvolume quota");
        Ok(())
    }

    /// Whether quotas are enabled on the filesystem holding `root`.
    ///
    /// Exit status 1 from `btrfs qgroup show` means "disabled".  Any other
    /// failure is also treated as disabled rather than propagated.
    pub async fn quotas_enabled(&self, root: &Path) -> bool {
        if self.quota_roots.contains(root) {
            return true;
        }
        let Ok(root_arg) = path_arg(root) else {
            return false;
        };

        match self.runner.run(BTRFS, &["qgroup", "show", root_arg]).await {
            Ok(out) if out.success() => {
                self.quota_roots.insert(root.to_path_buf());
                true
            }
            Ok(out) if out.code == Some(QGROUP_DISABLED_EXIT) => {
                debug!(root = %root.display(), "quotas not enabled");
                false
            }
            Ok(out) => {
                warn!(
                    root = %root.display(),
                    code = ?out.code,
                    output = %out.output.trim(),
                    "qgroup show failed, assuming quotas are disabled",
                );
                false
            }
            Err(e) => {
                warn!(root = %root.display(), error = %e, "qgroup show failed, assuming quotas are disabled");
                false
            }
        }
    }

    /// Bind-mount `subvolume` onto `target`.
    #[instrument(skip(self), fields(subvolume = %subvolume.display(), target = %target.display()))]
    pub async fn mount(&self, subvolume: &Path, target: &Path) -> Result<(), BtrfsError> {
        self.exec(MOUNT, &["--bind", path_arg(subvolume)?, path_arg(target)?])
            .await?;
        info!("bind-mounted subvolume");
        Ok(())
    }

    /// Make an existing bind mount at `target` read-only.  Some kernels
    /// ignore `ro` on the initial bind, so this is a separate remount.
    #[instrument(skip(self), fields(target = %target.display()))]
    pub async fn remount_read_only(&self, target: &Path) -> Result<(), BtrfsError> {
        self.exec(MOUNT, &["-o", "remount,bind,ro", path_arg(target)?])
            .await?;
        debug!("remounted read-only");
        Ok(())
    }

    #[instrument(skip(self), fields(target = %target.display()))]
    pub async fn unmount(&self, target: &Path) -> Result<(), BtrfsError> {
        self.exec(UMOUNT, &[path_arg(target)?]).await?;
        info!("unmounted");
        Ok(())
    }

    /// Return `true` if `target` is listed as a mount point in the mount
    /// table.  An unreadable table counts as "not mounted".
    pub async fn is_mounted(&self, target: &Path) -> bool {
        let contents = match tokio::fs::read_to_string(&self.mount_table).await {
            Ok(c) => c,
            Err(e) => {
                debug!(table = %self.mount_table.display(), error = %e, "cannot read mount table");
                return false;
            }
        };
        // Format: <device> <mountpoint> <fstype> <options> <dump> <pass>
        contents.lines().any(|line| {
            line.split_whitespace()
                .nth(1)
                .is_some_and(|mp| Path::new(&unescape_mount_path(mp)) == target)
        })
    }

    /// Usage snapshot of the filesystem holding `path`.
    pub async fn usage(&self, path: &Path) -> Result<FilesystemUsage, BtrfsError> {
        let out = self
            .exec(BTRFS, &["filesystem", "usage", "--raw", path_arg(path)?])
            .await?;
        let usage = FilesystemUsage::parse(&out.output)?;
        debug!(path = %path.display(), ?usage, "btrfs filesystem usage");
        Ok(usage)
    }

    /// Estimated free bytes on the filesystem holding `root`.
    pub async fn available_space(&self, root: &Path) -> Result<u64, BtrfsError> {
        let available = self.usage(root).await?.free_estimated;
        info!(root = %root.display(), available, "available space (free estimated)");
        Ok(available)
    }

    /// Look up the subvolume's numeric id.
    pub async fn info(&self, path: &Path) -> Result<SubvolumeInfo, BtrfsError> {
        let out = self
            .exec(BTRFS, &["subvolume", "show", path_arg(path)?])
            .await?;

        let value = out
            .output
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(key, _)| key.trim() == "Subvolume ID")
            .map(|(_, value)| value.trim())
            .ok_or_else(|| ParseError::MissingField {
                key: "Subvolume ID".to_owned(),
            })?;
        let id = value.parse().map_err(|_| ParseError::InvalidInteger {
            key: "Subvolume ID".to_owned(),
            value: value.to_owned(),
        })?;

        Ok(SubvolumeInfo {
            id,
            path: path.to_path_buf(),
        })
    }

    /// Verify the `btrfs` tool runs and that `root` lives on btrfs.  Meant
    /// to be called once at startup.
    pub async fn support_check(&self, root: &Path) -> Result<(), BtrfsError> {
        let version = self.exec(BTRFS, &["version"]).await?;
        debug!(version = %version.output.trim(), "btrfs tool available");

        let out = self
            .runner
            .run(BTRFS, &["filesystem", "show", path_arg(root)?])
            .await?;
        if !out.success() {
            return Err(BtrfsError::NotBtrfs {
                path: root.to_path_buf(),
                output: out.output,
            });
        }

        info!(root = %root.display(), "btrfs support verified");
        Ok(())
    }
}
