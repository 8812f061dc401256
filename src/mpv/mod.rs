//! MPV playback backend, driven over JSON IPC.
//!
//! - `process.rs` - MPV binary detection and process spawning
//! - `ipc.rs` - Async IPC connection (Named Pipes on Windows, Unix Sockets elsewhere)
//! - `protocol.rs` - JSON command/response/event types
//! - `player.rs` - `MediaElement` and `AdaptiveEngine` implementations

mod ipc;
mod player;
mod process;
mod protocol;

pub use ipc::IpcError;
pub use player::{classify_fault, MpvAdaptiveEngine, MpvError, MpvPlayer, MpvSession};
pub use process::{find_mpv, ProcessError};
pub use protocol::{EndReason, MpvCommand, MpvEvent};
