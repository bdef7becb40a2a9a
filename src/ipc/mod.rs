//! IPC layer (spec §4.5): wire protocol, the listening server, and the
//! one-shot client used by CLI subcommands.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::Client;
pub use protocol::{ClientCaps, InputEvent, Push, Request, Response, ServerCaps, ServerMessage};
pub use server::{IpcServer, PushRouter};
