//! # runctl-comm
//!
//! Network-facing command/response correlation layer for the runctl
//! run-control system.
//!
//! Each remote application exposes a synchronous "accept command" HTTP
//! endpoint; because the triggered work may be long-running, completion is
//! reported asynchronously to a callback port carried in the request. This
//! crate provides the pieces that make that round trip usable:
//!
//! - [`Commander`]: per-process command sender with a private reply queue
//!   and a synchronous TCP liveness probe.
//! - [`ResponseListener`]: the shared inbound endpoint, split into an
//!   independently restartable network receiver and a single dispatcher
//!   task that routes replies to the matching commander by app name.
//! - [`ProcessManager`]: the consumed interface of the out-of-scope
//!   process bootstrapping backends.

pub mod commander;
pub mod listener;
pub mod process;
pub mod wire;

pub use commander::{Commander, CommanderError, ReplySlot};
pub use listener::{ListenerError, ResponseListener};
pub use process::{
    AppBootInfo, BootInfo, ProcessDescriptor, ProcessHandle, ProcessManager, ProcessManagerError,
};
pub use wire::{CommandReply, CommandRequest, ANSWER_PORT_HEADER};
