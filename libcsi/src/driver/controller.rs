use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use super::{
    CONTEXT_CAPACITY, CONTEXT_PROVISIONER_IDENTITY, CONTEXT_TARGET_NODE, PARAM_SUBVOLUME_ROOT,
    PROVISIONER_IDENTITY, TOPOLOGY_KEY, VolumeLocks, resolve_subvolume, to_i64, volume_id_for,
};
use crate::btrfs::SubvolumeManager;
use crate::config::{DriverConfig, ProvisioningMode};
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::types::*;
use crate::validate;

pub struct ControllerService {
    config: Arc<DriverConfig>,
    subvolumes: Arc<SubvolumeManager>,
    locks: Arc<VolumeLocks>,
}

impl ControllerService {
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

    /// Node the volume is pinned to: the first preferred topology carrying
    /// the hostname key, else the first such requisite, else this node.
    fn target_node(&self, requirements: Option<&TopologyRequirement>) -> String {
        requirements
            .and_then(|req| {
                req.preferred
                    .iter()
                    .chain(req.requisite.iter())
                    .find_map(|t| t.segments.get(TOPOLOGY_KEY))
            })
            .cloned()
            .unwrap_or_else(|| self.config.node_id.clone())
    }
}

#[async_trait]
impl CsiController for ControllerService {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        validate::create_volume(&req)?;

        let capacity = req
            .capacity_range
            .as_ref()
            .map(|r| r.required_bytes)
            .unwrap_or_default();
        let target_node = self.target_node(req.accessibility_requirements.as_ref());
        let root = self
            .config
            .root_for(req.parameters.get(PARAM_SUBVOLUME_ROOT).map(String::as_str));
        let (volume_id, path) = volume_id_for(&self.config, &root, &req.name)?;

        match self.config.provisioning {
            ProvisioningMode::Immediate => {
                let _guard = self.locks.lock(&volume_id).await;
                self.subvolumes
                    .create(&path, u64::try_from(capacity).unwrap_or_default())
                    .await
                    .map_err(|e| {
                        CsiError::Internal(format!("failed to create btrfs subvolume: {e}"))
                    })?;
            }
            ProvisioningMode::WaitForFirstConsumer => {
                info!("subvolume will be created on first publish");
            }
        }

        let volume_context = HashMap::from([
            (
                CONTEXT_PROVISIONER_IDENTITY.to_owned(),
                PROVISIONER_IDENTITY.to_owned(),
            ),
            (CONTEXT_CAPACITY.to_owned(), capacity.to_string()),
            (CONTEXT_TARGET_NODE.to_owned(), target_node.clone()),
            (PARAM_SUBVOLUME_ROOT.to_owned(), root.display().to_string()),
        ]);

        info!(%target_node, capacity, "volume created");
        Ok(Volume {
            capacity_bytes: capacity,
            volume_id,
            volume_context,
            content_source: req.volume_content_source,
            accessible_topology: vec![Topology::single(TOPOLOGY_KEY, &target_node)],
        })
    }

    /// Deletion failures are logged and swallowed so the orchestrator does
    /// not retry forever against a subvolume that cannot be removed.
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn delete_volume(&self, req: DeleteVolumeRequest) -> Result<(), CsiError> {
        validate::delete_volume(&req)?;

        if self.config.provisioning.node_owns_subvolumes() {
            info!("subvolume is removed by the node on unpublish");
            return Ok(());
        }

        let path = resolve_subvolume(&self.config, &req.volume_id)?;
        let _guard = self.locks.lock(&req.volume_id).await;
        if let Err(e) = self.subvolumes.delete(&path).await {
            warn!(error = %e, path = %path.display(), "failed to delete btrfs subvolume");
        }
        Ok(())
    }

    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse, CsiError> {
        validate::validate_volume_capabilities(&req)?;

        Ok(ValidateVolumeCapabilitiesResponse {
            confirmed: Some(Confirmed {
                volume_context: req.volume_context,
                volume_capabilities: req.volume_capabilities.unwrap_or_default(),
                parameters: req.parameters,
            }),
            message: String::new(),
        })
    }

    #[instrument(skip(self, req))]
    async fn get_capacity(&self, req: GetCapacityRequest) -> Result<GetCapacityResponse, CsiError> {
        validate::get_capacity(&req)?;

        let root = self
            .config
            .root_for(req.parameters.get(PARAM_SUBVOLUME_ROOT).map(String::as_str));
        let available = self
            .subvolumes
            .available_space(&root)
            .await
            .map_err(|e| CsiError::Internal(format!("failed to get available capacity: {e}")))?;

        Ok(GetCapacityResponse {
            available_capacity: to_i64(available),
        })
    }

    async fn controller_get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(match self.config.provisioning {
            ProvisioningMode::Immediate => vec![
                ControllerCapability::CreateDeleteVolume,
                ControllerCapability::GetVolume,
                ControllerCapability::GetCapacity,
            ],
            ProvisioningMode::WaitForFirstConsumer => {
                vec![ControllerCapability::CreateDeleteVolume]
            }
        })
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn controller_get_volume(
        &self,
        req: ControllerGetVolumeRequest,
    ) -> Result<ControllerGetVolumeResponse, CsiError> {
        validate::controller_get_volume(&req)?;

        let path = resolve_subvolume(&self.config, &req.volume_id)?;
        if !self.subvolumes.exists(&path).await? {
            return Err(CsiError::NotFound(format!(
                "volume {} does not exist",
                req.volume_id
            )));
        }

        let condition = match self.subvolumes.info(&path).await {
            Ok(_) => VolumeCondition::default(),
            Err(e) => VolumeCondition {
                abnormal: true,
                message: e.to_string(),
            },
        };

        Ok(ControllerGetVolumeResponse {
            volume: Volume {
                volume_id: req.volume_id,
                accessible_topology: vec![Topology::single(TOPOLOGY_KEY, &self.config.node_id)],
                ..Default::default()
            },
            status: VolumeStatus {
                published_node_ids: Vec::new(),
                volume_condition: Some(condition),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::super::testing::driver;
    use super::*;
    use crate::error::Code;

    fn request(name: &str) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.into(),
            capacity_range: Some(CapacityRange {
                required_bytes: 1 << 30,
                limit_bytes: 0,
            }),
            volume_capabilities: vec![VolumeCapability::default()],
            ..Default::default()
        }
    }

    fn hostname(node: &str) -> Topology {
        Topology::single(TOPOLOGY_KEY, node)
    }

    #[tokio::test]
    async fn create_reports_context_and_topology() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, runner) = driver(tmp.path(), ProvisioningMode::Immediate);

        let volume = driver.controller().create_volume(request("v1")).await.unwrap();

        assert_eq!(volume.volume_id.as_str(), "v1");
        assert_eq!(volume.capacity_bytes, 1 << 30);
        assert_eq!(volume.accessible_topology, vec![hostname("test-node")]);
        let ctx = &volume.volume_context;
        assert_eq!(ctx[CONTEXT_PROVISIONER_IDENTITY], "btrfs-csi");
        assert_eq!(ctx[CONTEXT_CAPACITY], "1073741824");
        assert_eq!(ctx[CONTEXT_TARGET_NODE], "test-node");
        assert_eq!(
            Path::new(&ctx[PARAM_SUBVOLUME_ROOT]),
            tmp.path().join("pool")
        );
        assert_eq!(runner.count("btrfs subvolume create"), 1);
        assert_eq!(runner.count("btrfs qgroup limit 1G"), 1);
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, runner) = driver(tmp.path(), ProvisioningMode::Immediate);

        let first = driver.controller().create_volume(request("v1")).await.unwrap();
        let second = driver.controller().create_volume(request("v1")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(runner.count("btrfs subvolume create"), 1);
    }

    #[tokio::test]
    async fn target_node_resolution_order() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, _) = driver(tmp.path(), ProvisioningMode::WaitForFirstConsumer);
        let controller = driver.controller();

        let both = TopologyRequirement {
            requisite: vec![hostname("req-node")],
            preferred: vec![Topology::single("zone", "a"), hostname("pref-node")],
        };
        assert_eq!(controller.target_node(Some(&both)), "pref-node");

        let requisite_only = TopologyRequirement {
            requisite: vec![hostname("req-node")],
            preferred: vec![],
        };
        assert_eq!(controller.target_node(Some(&requisite_only)), "req-node");

        let unrelated = TopologyRequirement {
            requisite: vec![Topology::single("zone", "a")],
            preferred: vec![],
        };
        assert_eq!(controller.target_node(Some(&unrelated)), "test-node");
        assert_eq!(controller.target_node(None), "test-node");
    }

    #[tokio::test]
    async fn create_pins_volume_to_preferred_node() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, _) = driver(tmp.path(), ProvisioningMode::WaitForFirstConsumer);
        let mut req = request("v1");
        req.accessibility_requirements = Some(TopologyRequirement {
            requisite: vec![hostname("node-b"), hostname("node-c")],
            preferred: vec![hostname("node-c")],
        });

        let volume = driver.controller().create_volume(req).await.unwrap();
        assert_eq!(volume.accessible_topology, vec![hostname("node-c")]);
        assert_eq!(volume.volume_context[CONTEXT_TARGET_NODE], "node-c");
    }

    #[tokio::test]
    async fn create_honours_subvolume_root_parameter() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, _) = driver(tmp.path(), ProvisioningMode::Immediate);
        let custom = tmp.path().join("custom");
        let mut req = request("v1");
        req.parameters.insert(
            PARAM_SUBVOLUME_ROOT.into(),
            custom.display().to_string(),
        );

        let volume = driver.controller().create_volume(req).await.unwrap();
        assert!(custom.join("v1").is_dir());
        assert_eq!(
            volume.volume_id.as_str(),
            custom.join("v1").display().to_string()
        );
        assert_eq!(
            volume.volume_context[PARAM_SUBVOLUME_ROOT],
            custom.display().to_string()
        );
    }

    #[tokio::test]
    async fn delete_removes_subvolume_under_overridden_root() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, runner) = driver(tmp.path(), ProvisioningMode::Immediate);
        let custom = tmp.path().join("custom");
        let mut req = request("v1");
        req.parameters.insert(
            PARAM_SUBVOLUME_ROOT.into(),
            custom.display().to_string(),
        );

        let volume = driver.controller().create_volume(req).await.unwrap();
        driver
            .controller()
            .delete_volume(DeleteVolumeRequest {
                volume_id: volume.volume_id,
            })
            .await
            .unwrap();

        assert!(!custom.join("v1").exists());
        assert_eq!(runner.count("btrfs subvolume delete"), 1);
    }

    #[tokio::test]
    async fn create_rejects_relative_subvolume_root() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, runner) = driver(tmp.path(), ProvisioningMode::Immediate);
        let mut req = request("v1");
        req.parameters
            .insert(PARAM_SUBVOLUME_ROOT.into(), "pool".into());

        let err = driver.controller().create_volume(req).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn create_failure_is_internal() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, runner) = driver(tmp.path(), ProvisioningMode::Immediate);
        runner.fail("btrfs subvolume create", 1, "ERROR: cannot create subvolume\n");

        let err = driver.controller().create_volume(request("v1")).await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(err.to_string().contains("cannot create subvolume"));
    }

    #[tokio::test]
    async fn create_rejects_path_like_names() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, runner) = driver(tmp.path(), ProvisioningMode::Immediate);

        let err = driver
            .controller()
            .create_volume(request("../escape"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn delete_swallows_tool_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, runner) = driver(tmp.path(), ProvisioningMode::Immediate);
        driver.controller().create_volume(request("v1")).await.unwrap();
        runner.fail("btrfs subvolume delete", 1, "ERROR: Device or resource busy\n");

        driver
            .controller()
            .delete_volume(DeleteVolumeRequest {
                volume_id: "v1".into(),
            })
            .await
            .unwrap();
        assert_eq!(runner.count("btrfs subvolume delete"), 1);
    }

    #[tokio::test]
    async fn delete_of_missing_volume_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, runner) = driver(tmp.path(), ProvisioningMode::Immediate);

        driver
            .controller()
            .delete_volume(DeleteVolumeRequest {
                volume_id: "gone".into(),
            })
            .await
            .unwrap();
        assert!(runner.calls().is_empty());

        let err = driver
            .controller()
            .delete_volume(DeleteVolumeRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn validate_confirms_requested_capabilities() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, _) = driver(tmp.path(), ProvisioningMode::Immediate);
        let caps = vec![VolumeCapability {
            access_type: AccessType::Block {},
            access_mode: VolumeAccessMode {
                mode: AccessMode::MultiNodeMultiWriter,
            },
        }];

        let resp = driver
            .controller()
            .validate_volume_capabilities(ValidateVolumeCapabilitiesRequest {
                volume_id: "v1".into(),
                volume_context: HashMap::from([("k".into(), "v".into())]),
                volume_capabilities: Some(caps.clone()),
                parameters: HashMap::new(),
            })
            .await
            .unwrap();

        let confirmed = resp.confirmed.unwrap();
        assert_eq!(confirmed.volume_capabilities, caps);
        assert_eq!(confirmed.volume_context["k"], "v");
    }

    #[tokio::test]
    async fn get_capacity_reports_free_estimated() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, runner) = driver(tmp.path(), ProvisioningMode::WaitForFirstConsumer);

        let resp = driver
            .controller()
            .get_capacity(GetCapacityRequest::default())
            .await
            .unwrap();
        assert_eq!(resp.available_capacity, 10_183_770_112);

        runner.set_usage("Device size: 10\n");
        let err = driver
            .controller()
            .get_capacity(GetCapacityRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[tokio::test]
    async fn capabilities_follow_provisioning_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let (immediate, _) = driver(tmp.path(), ProvisioningMode::Immediate);
        assert_eq!(
            immediate.controller().controller_get_capabilities().await.unwrap(),
            vec![
                ControllerCapability::CreateDeleteVolume,
                ControllerCapability::GetVolume,
                ControllerCapability::GetCapacity,
            ]
        );

        let (deferred, _) = driver(tmp.path(), ProvisioningMode::WaitForFirstConsumer);
        assert_eq!(
            deferred.controller().controller_get_capabilities().await.unwrap(),
            vec![ControllerCapability::CreateDeleteVolume]
        );
    }

    #[tokio::test]
    async fn get_volume_reports_condition() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, runner) = driver(tmp.path(), ProvisioningMode::Immediate);
        let get = |id: &str| ControllerGetVolumeRequest {
            volume_id: id.into(),
        };

        let err = driver
            .controller()
            .controller_get_volume(get("v1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);

        driver.controller().create_volume(request("v1")).await.unwrap();
        let resp = driver
            .controller()
            .controller_get_volume(get("v1"))
            .await
            .unwrap();
        assert_eq!(resp.volume.volume_id.as_str(), "v1");
        assert_eq!(resp.status.volume_condition, Some(VolumeCondition::default()));

        runner.fail("btrfs subvolume show", 1, "ERROR: not a subvolume\n");
        let resp = driver
            .controller()
            .controller_get_volume(get("v1"))
            .await
            .unwrap();
        assert!(resp.status.volume_condition.unwrap().abnormal);
    }

    #[tokio::test]
    async fn unsupported_rpcs_are_unimplemented() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, _) = driver(tmp.path(), ProvisioningMode::Immediate);
        let controller = driver.controller();

        let results = [
            controller
                .controller_publish_volume(Default::default())
                .await
                .unwrap_err(),
            controller
                .controller_unpublish_volume(Default::default())
                .await
                .unwrap_err(),
            controller.list_volumes(Default::default()).await.unwrap_err(),
            controller.create_snapshot(Default::default()).await.unwrap_err(),
            controller.delete_snapshot(Default::default()).await.unwrap_err(),
            controller.list_snapshots(Default::default()).await.unwrap_err(),
            controller
                .controller_expand_volume(Default::default())
                .await
                .unwrap_err(),
        ];
        for err in results {
            assert_eq!(err.code(), Code::Unimplemented);
        }
    }
}
