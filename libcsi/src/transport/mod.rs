//! Unix-socket transport for CSI messages.
//!
//! [`CsiServer`] listens on the plugin endpoint and [`CsiClient`] talks to
//! it.  Each connection carries one JSON-encoded [`CsiMessage`] request: the
//! client writes it and shuts down its write half, the server replies with
//! one [`CsiMessage`] and closes the connection.
//!
//! [`CsiMessage`]: crate::message::CsiMessage

pub mod client;
pub mod server;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::CsiError;

pub use client::CsiClient;
pub use server::{CsiServer, CsiServices};

/// Upper bound on a single encoded message.
pub const MAX_MESSAGE_SIZE: u64 = 16 * 1024 * 1024;

/// Read one message body until EOF, rejecting anything over
/// [`MAX_MESSAGE_SIZE`].
pub(crate) async fn read_message<R>(reader: R) -> Result<Vec<u8>, CsiError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    reader
        .take(MAX_MESSAGE_SIZE + 1)
        .read_to_end(&mut buf)
        .await
        .map_err(CsiError::transport)?;
    if buf.len() as u64 > MAX_MESSAGE_SIZE {
        return Err(CsiError::TransportError(format!(
            "message exceeds {MAX_MESSAGE_SIZE} bytes"
        )));
    }
    Ok(buf)
}
