//! Unix-socket server that dispatches incoming CSI requests to the Identity,
//! Controller and Node services.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, instrument, warn};

use super::read_message;
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::message::CsiMessage;
use crate::node::CsiNode;

/// The three service implementations a server dispatches to.
#[derive(Clone)]
pub struct CsiServices {
    pub identity: Arc<dyn CsiIdentity>,
    pub controller: Arc<dyn CsiController>,
    pub node: Arc<dyn CsiNode>,
}

pub struct CsiServer {
    listener: UnixListener,
    socket_path: PathBuf,
    services: CsiServices,
}

impl CsiServer {
    /// Bind the listening socket, replacing a stale socket file left by a
    /// previous run.
    pub async fn bind(
        socket_path: impl Into<PathBuf>,
        services: CsiServices,
    ) -> Result<Self, CsiError> {
        let socket_path = socket_path.into();
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                CsiError::TransportError(format!(
                    "failed to create socket directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        match tokio::fs::remove_file(&socket_path).await {
            Ok(()) => debug!(socket = %socket_path.display(), "removed stale socket"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CsiError::TransportError(format!(
                    "failed to remove stale socket {}: {e}",
                    socket_path.display()
                )));
            }
        }

        let listener = UnixListener::bind(&socket_path).map_err(|e| {
            CsiError::TransportError(format!("failed to bind {}: {e}", socket_path.display()))
        })?;
        info!(socket = %socket_path.display(), "CSI server listening");
        Ok(Self {
            listener,
            socket_path,
            services,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until the process exits.
    pub async fn serve(self) -> Result<(), CsiError> {
        self.serve_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves, then remove the socket
    /// file.  Each connection is handled on its own Tokio task.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<(), CsiError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("CSI server shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let services = self.services.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, &services).await {
                                warn!(error = %e, "CSI connection error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "failed to accept CSI connection"),
                }
            }
        }

        drop(self.listener);
        if let Err(e) = tokio::fs::remove_file(&self.socket_path).await
            && e.kind() != ErrorKind::NotFound
        {
            warn!(socket = %self.socket_path.display(), error = %e, "failed to remove socket");
        }
        Ok(())
    }
}

/// Read request, dispatch, write response.
#[instrument(skip_all)]
async fn handle_connection(mut stream: UnixStream, services: &CsiServices) -> Result<(), CsiError> {
    let request = read_message(&mut stream).await.and_then(|buf| {
        serde_json::from_slice::<CsiMessage>(&buf)
            .map_err(|e| CsiError::InvalidArgument(format!("malformed request: {e}")))
    });

    let response = match request {
        Ok(request) => {
            debug!(%request, "CSI request received");
            let name = request.to_string();
            let response = dispatch(services, request).await;
            if let CsiMessage::Error(e) = &response {
                warn!(request = %name, error = %e, "CSI request failed");
            }
            response
        }
        Err(e) => CsiMessage::Error(e),
    };

    let payload = serde_json::to_vec(&response).map_err(CsiError::internal)?;
    stream
        .write_all(&payload)
        .await
        .map_err(CsiError::transport)?;
    stream.shutdown().await.map_err(CsiError::transport)?;
    Ok(())
}

fn reply<T>(result: Result<T, CsiError>, wrap: impl FnOnce(T) -> CsiMessage) -> CsiMessage {
    match result {
        Ok(value) => wrap(value),
        Err(e) => CsiMessage::Error(e),
    }
}

fn ok(result: Result<(), CsiError>) -> CsiMessage {
    reply(result, |()| CsiMessage::Ok)
}

/// Map a request onto the owning service and wrap its result.
async fn dispatch(services: &CsiServices, request: CsiMessage) -> CsiMessage {
    let CsiServices {
        identity,
        controller,
        node,
    } = services;

    match request {
        // --- Identity -------------------------------------------------------
        CsiMessage::GetPluginInfo => reply(identity.get_plugin_info().await, CsiMessage::PluginInfo),
        CsiMessage::GetPluginCapabilities => reply(
            identity.get_plugin_capabilities().await,
            CsiMessage::PluginCapabilities,
        ),
        CsiMessage::Probe => reply(identity.probe().await, CsiMessage::ProbeResult),

        // --- Controller -----------------------------------------------------
        CsiMessage::CreateVolume(req) => {
            reply(controller.create_volume(req).await, CsiMessage::VolumeCreated)
        }
        CsiMessage::DeleteVolume(req) => ok(controller.delete_volume(req).await),
        CsiMessage::ControllerGetVolume(req) => reply(
            controller.controller_get_volume(req).await,
            CsiMessage::VolumeDescribed,
        ),
        CsiMessage::ValidateVolumeCapabilities(req) => reply(
            controller.validate_volume_capabilities(req).await,
            CsiMessage::CapabilitiesValidated,
        ),
        CsiMessage::GetCapacity(req) => reply(controller.get_capacity(req).await, CsiMessage::Capacity),
        CsiMessage::ControllerGetCapabilities => reply(
            controller.controller_get_capabilities().await,
            CsiMessage::ControllerCapabilities,
        ),
        CsiMessage::ListVolumes(req) => reply(controller.list_volumes(req).await, CsiMessage::VolumeList),
        CsiMessage::ControllerPublishVolume(req) => {
            ok(controller.controller_publish_volume(req).await)
        }
        CsiMessage::ControllerUnpublishVolume(req) => {
            ok(controller.controller_unpublish_volume(req).await)
        }
        CsiMessage::CreateSnapshot(req) => ok(controller.create_snapshot(req).await),
        CsiMessage::DeleteSnapshot(req) => ok(controller.delete_snapshot(req).await),
        CsiMessage::ListSnapshots(req) => ok(controller.list_snapshots(req).await),
        CsiMessage::ControllerExpandVolume(req) => {
            ok(controller.controller_expand_volume(req).await)
        }

        // --- Node -----------------------------------------------------------
        CsiMessage::NodeStageVolume(req) => ok(node.node_stage_volume(req).await),
        CsiMessage::NodeUnstageVolume(req) => ok(node.node_unstage_volume(req).await),
        CsiMessage::NodePublishVolume(req) => ok(node.node_publish_volume(req).await),
        CsiMessage::NodeUnpublishVolume(req) => ok(node.node_unpublish_volume(req).await),
        CsiMessage::NodeGetVolumeStats(req) => {
            reply(node.node_get_volume_stats(req).await, CsiMessage::VolumeStats)
        }
        CsiMessage::NodeGetCapabilities => reply(
            node.node_get_capabilities().await,
            CsiMessage::NodeCapabilities,
        ),
        CsiMessage::NodeGetInfo => reply(node.node_get_info().await, CsiMessage::NodeInfo),
        CsiMessage::NodeExpandVolume(req) => ok(node.node_expand_volume(req).await),

        // --- Response variants never arrive as requests ---------------------
        other => {
            debug_assert!(other.is_response());
            CsiMessage::Error(CsiError::InvalidArgument(format!(
                "unexpected message: {other}"
            )))
        }
    }
}
