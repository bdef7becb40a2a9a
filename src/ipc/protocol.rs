//! Wire protocol (spec §4.5): message shapes plus the length-prefixed,
//! versioned framing every connection reads and writes.
//!
//! `bincode` is the payload codec rather than the `serde_json` the
//! persistence store uses — the two wire formats are independently
//! versioned per §4.7, since request/response framing churns at a different
//! rate than durable session state (see DESIGN.md). Grounded in the pack's
//! broad `serde`-derived-message-enum convention rather than any one
//! single file, since a Tauri app's own IPC (its webview bridge) has no
//! on-the-wire framing of its own to imitate.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};
use crate::pty::Screen;
use crate::session::{Orientation, PaneId, PtyId, Session, SplitId};

/// First byte of every frame. Bumped whenever [`Request`]/[`ServerMessage`]
/// change in a way older clients can't decode.
pub const PROTOCOL_VERSION: u8 = 1;

/// Refuse frames larger than this; a client claiming more is either
/// confused or hostile, not lagging (spec §7 `ProtocolViolation`).
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCaps {
    pub name: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCaps {
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InputEvent {
    Key(Vec<u8>),
    Mouse(Vec<u8>),
    Paste(String),
    Resize { cols: u16, rows: u16 },
    Focus(bool),
}

/// Requests a client may send (spec §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Hello { client_caps: ClientCaps },
    Attach { session: Option<String> },
    Spawn { cwd: Option<String>, split_of: Option<PaneId>, split_direction: Option<Orientation> },
    Input { pane: PaneId, event: InputEvent },
    ResizeSplit { split: SplitId, child_idx: usize, ratio: f32 },
    RenameSession { name: String, new_name: String },
    DeleteSession { name: String },
    ListSessions,
    SwitchSession { name: String },
    Detach,
    Quit,
    /// Administrative, not named in spec.md's client-facing list but
    /// required by the CLI surface §6 names (`pty list`, `pty kill`).
    ListPtys,
    KillPty { pty: PtyId },
}

/// One live PTY, as reported to `prise pty list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtySummary {
    pub pty: PtyId,
    pub pane: PaneId,
    pub session: String,
    pub child_pid: i32,
}

/// Direct replies to a `Request` (spec §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Hello { server_caps: ServerCaps, session: Session },
    SessionList { names: Vec<String> },
    PtyList { ptys: Vec<PtySummary> },
    Error { kind: ErrorKind, message: String },
    Ack,
}

/// Unsolicited server-push notifications (spec §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Push {
    ScreenDelta { pane: PaneId, screen: Screen },
    PaneAdded { pane: PaneId, session: Session },
    PaneRemoved { pane: PaneId },
    LayoutChanged { session: Session },
    SessionRenamed { new_name: String },
    SessionExit,
    WindowResized { cols: u16, rows: u16 },
    /// Not named individually in spec §4.5's push list, but required by its
    /// backpressure rule: replaces any queued deltas for a lagging
    /// connection with one authoritative resync (spec §4.5 "Backpressure").
    FullResync { session: Session, screens: Vec<(PaneId, Screen)> },
}

/// Everything the server ever writes to a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    Response(Response),
    Push(Push),
}

impl From<Error> for Response {
    fn from(e: Error) -> Self {
        Response::Error { kind: e.kind, message: e.message }
    }
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(msg).map_err(|e| Error::protocol_violation(format!("encode failed: {e}")))?;
    if payload.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(Error::protocol_violation("frame too large to encode"));
    }
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.push(PROTOCOL_VERSION);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Writes one framed message: 4-byte big-endian length, version byte,
/// `bincode` payload.
pub async fn write_frame<W: AsyncWriteExt + Unpin, T: Serialize>(writer: &mut W, msg: &T) -> Result<()> {
    let frame = encode(msg)?;
    writer.write_all(&frame).await.map_err(|e| Error::connection_lost(e.to_string()))?;
    Ok(())
}

/// Reads one framed message, rejecting oversized or wrong-version frames as
/// [`ErrorKind::ProtocolViolation`] and EOF/reset as [`ErrorKind::ConnectionLost`].
pub async fn read_frame<R: AsyncReadExt + Unpin, T: for<'de> Deserialize<'de>>(reader: &mut R) -> Result<T> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(map_read_error)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(Error::protocol_violation(format!("frame of {len} bytes exceeds limit")));
    }

    let mut version_buf = [0u8; 1];
    reader.read_exact(&mut version_buf).await.map_err(map_read_error)?;
    if version_buf[0] != PROTOCOL_VERSION {
        return Err(Error::protocol_violation(format!("unsupported protocol version {}", version_buf[0])));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await.map_err(map_read_error)?;
    bincode::deserialize(&payload).map_err(|e| Error::protocol_violation(format!("malformed frame: {e}")))
}

fn map_read_error(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::connection_lost("client closed connection")
    } else {
        Error::connection_lost(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_request_through_a_duplex_pipe() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let req = Request::ListSessions;
        write_frame(&mut client, &req).await.unwrap();
        let decoded: Request = read_frame(&mut server).await.unwrap();
        assert!(matches!(decoded, Request::ListSessions));
    }

    #[tokio::test]
    async fn wrong_version_byte_is_protocol_violation() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let payload = bincode::serialize(&Request::ListSessions).unwrap();
        client.write_all(&(payload.len() as u32).to_be_bytes()).await.unwrap();
        client.write_all(&[PROTOCOL_VERSION + 1]).await.unwrap();
        client.write_all(&payload).await.unwrap();

        let result: Result<Request> = read_frame(&mut server).await;
        assert!(matches!(result, Err(e) if e.kind == ErrorKind::ProtocolViolation));
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected_before_reading_payload() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(&(MAX_FRAME_LEN + 1).to_be_bytes()).await.unwrap();

        let result: Result<Request> = read_frame(&mut server).await;
        assert!(matches!(result, Err(e) if e.kind == ErrorKind::ProtocolViolation));
    }
}
