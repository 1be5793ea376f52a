//! The `/echo/1.0.0` stream handler.

use crate::error::WireResult;
use crate::router::StreamHandler;
use crate::stream::{read_line, Stream};
use async_trait::async_trait;
use tracing::info;

/// Protocol name served by [`EchoHandler`].
pub const ECHO_PROTOCOL: &str = "/echo/1.0.0";

/// Reads one newline-terminated line and writes it back unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

#[async_trait]
impl StreamHandler for EchoHandler {
    async fn handle(&self, stream: &mut Stream) -> WireResult<()> {
        let line = read_line(stream).await?;
        info!(
            peer = %stream.remote_peer(),
            bytes = line.len(),
            "read: {:?}",
            String::from_utf8_lossy(&line)
        );
        stream.write_all(&line).await
    }
}
