//! Client used by sidecars and tests to issue CSI requests.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::{debug, instrument};

use super::read_message;
use crate::error::CsiError;
use crate::message::CsiMessage;

/// Sends [`CsiMessage`] requests to a plugin socket, one connection per
/// request.
#[derive(Debug, Clone)]
pub struct CsiClient {
    socket_path: PathBuf,
}

impl CsiClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send a request and wait for the raw response, which may be
    /// [`CsiMessage::Error`].
    #[instrument(skip(self), fields(msg = %msg))]
    pub async fn request(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| {
                CsiError::TransportError(format!(
                    "failed to connect to {}: {e}",
                    self.socket_path.display()
                ))
            })?;

        let payload = serde_json::to_vec(msg).map_err(CsiError::internal)?;
        stream
            .write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        stream.shutdown().await.map_err(CsiError::transport)?;

        let buf = read_message(&mut stream).await?;
        let response: CsiMessage = serde_json::from_slice(&buf).map_err(CsiError::transport)?;
        debug!(%response, "CSI response received");
        Ok(response)
    }

    /// Like [`Self::request`], with an error reply turned into `Err`.
    pub async fn call(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        self.request(msg).await?.into_result()
    }
}
