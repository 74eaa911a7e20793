use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::config::DriverConfig;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::types::{PluginCapability, PluginInfo};

pub struct IdentityService {
    config: Arc<DriverConfig>,
}

impl IdentityService {
    pub fn new(config: Arc<DriverConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl CsiIdentity for IdentityService {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.config.driver_name.clone(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
            manifest: HashMap::new(),
        })
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![
            PluginCapability::ControllerService,
            PluginCapability::VolumeAccessibilityConstraints,
        ])
    }

    /// Ready once the subvolume root exists.
    #[instrument(skip(self))]
    async fn probe(&self) -> Result<bool, CsiError> {
        let ready = tokio::fs::metadata(&self.config.root_path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        debug!(ready, root = %self.config.root_path.display(), "probe");
        Ok(ready)
    }
}
