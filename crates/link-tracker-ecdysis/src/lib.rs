//! # link-tracker-ecdysis
//!
//! Zero-downtime restarts for link-tracker, following the
//! [Cloudflare Ecdysis pattern](https://blog.cloudflare.com/ecdysis-rust-graceful-restarts/).
//!
//! ## Overview
//!
//! On the restart signal a Primary process:
//! 1. Spawns a Transitional copy of itself carrying duplicates of every
//!    listening socket, and waits for it to report ready
//! 2. Stops accepting and drains in-flight connections
//! 3. Re-execs itself in place, carrying fresh duplicates and the
//!    Transitional's pid
//!
//! The new Primary resumes the inherited sockets without rebinding, then
//! tells the Transitional to drain and exit and reaps it. At every point at
//! least one process is accepting on each socket.
//!
//! ## Signal Conventions
//!
//! - `SIGHUP` — restart (configurable, see [`RestartConfig`])
//! - `SIGTERM` / `SIGINT` — graceful shutdown (drain connections, then exit)
//!
//! ## Environment Variables
//!
//! With the prefix passed to [`EnvironmentChannel::new`]:
//!
//! - `<PREFIX>_LISTENER_FD_<NAME>` — inherited descriptor for listener `<NAME>`
//! - `<PREFIX>_TRANSITIONAL` — present in a Transitional process
//! - `<PREFIX>_TRANSITIONAL_PID` — Transitional to retire after a re-exec
//! - `<PREFIX>_READY_FD` — socket a Transitional reports readiness on
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("link-tracker-ecdysis requires a Unix platform (Linux or macOS)");

mod channel;
mod coordinator;
mod drain;
mod error;
mod launcher;
mod listener;

pub use channel::{listener_suffix, EnvironmentChannel, Generation, GenerationRole, HandoffEnvelope};
pub use coordinator::{
    Completion, Replacement, RestartConfig, RestartCoordinator, RestartPhase, RestartState,
};
pub use drain::{ConnectionGuard, ConnectionTracker};
pub use error::{Error, Result};
pub use launcher::{
    send_signal, wait_for_exit, ExecLauncher, PreparedHandoff, ProcessLauncher, ReadyNotifier,
};
pub use listener::{ConnectionHandler, InheritedDescriptors, ListenerHandle, ListenerSet};
