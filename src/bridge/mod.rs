//! Process bridge: the orchestrator's operations as JSON lines over
//! stdin/stdout, for a host UI that spawns this binary as a child process.
//! No sockets are opened.

pub mod protocol;
pub mod stdio;

pub use protocol::{BridgeRequest, BridgeResponse, Operation};
pub use stdio::{handle_line, serve};
