//! # libcsi: btrfs subvolume CSI plugin
//!
//! `libcsi` implements a [Container Storage Interface][csi] plugin that
//! provisions every volume as a btrfs subvolume under one root directory,
//! optionally quota-limited, and bind-mounts it into workloads.  Requests
//! arrive as JSON [`CsiMessage`]s over a Unix socket.  It follows the RK8s
//! conventions: Tokio async runtime, `tracing` for observability and
//! `thiserror` for structured errors.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `Volume`, `VolumeId`, capabilities, requests. |
//! | [`error`] | [`CsiError`] and the status [`Code`](error::Code) it maps to. |
//! | [`config`] | [`DriverConfig`]: driver name, node id, root path, provisioning mode. |
//! | [`validate`] | Required-field checks run before any side effect. |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery & health. |
//! | [`controller`] | [`CsiController`] trait: volume create/delete/capacity. |
//! | [`node`] | [`CsiNode`] trait: stage, publish, unpublish, unstage, stats. |
//! | [`btrfs`] | Subvolume, quota, mount and usage primitives over the btrfs tools. |
//! | [`driver`] | [`Driver`]: the three services implemented on top of [`btrfs`]. |
//! | [`message`] | [`CsiMessage`] protocol envelope. |
//! | [`transport`] | Unix-socket client/server. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod btrfs;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod identity;
pub mod message;
pub mod node;
pub mod transport;
pub mod types;
pub mod validate;

// Re-export the most commonly used items at crate root for convenience.
pub use config::{DriverConfig, ProvisioningMode};
pub use controller::CsiController;
pub use driver::Driver;
pub use error::CsiError;
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use node::CsiNode;
pub use transport::{CsiClient, CsiServer};
pub use types::*;
