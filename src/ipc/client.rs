//! Thin one-shot client (spec §6): connects, sends exactly one request,
//! reads exactly one response, and disconnects. Used by every non-`serve`
//! CLI subcommand.

use tokio::net::UnixStream;

use crate::error::{Error, Result};
use crate::ipc::protocol::{read_frame, write_frame, Request, Response};

pub struct Client {
    stream: UnixStream,
}

impl Client {
    pub async fn connect(socket_path: &std::path::Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|e| Error::connection_lost(format!("cannot connect to {}: {e}", socket_path.display())))?;
        Ok(Self { stream })
    }

    pub async fn call(&mut self, request: Request) -> Result<Response> {
        write_frame(&mut self.stream, &request).await?;
        read_frame(&mut self.stream).await
    }
}
