//! Error taxonomy for the restart machinery.
//!
//! Startup errors (`Bind`, `InheritedDescriptor`, `UnclaimedDescriptors`,
//! `Environment`) are fatal. `Spawn`, `NotReady` and `Duplicate` abort a
//! single restart attempt. `DrainTimeout`, `SignalDelivery` and `Reap` are
//! logged and never stop the service. `ReplaceSelf` is fatal mid-restart.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to bind listener '{name}' on {addr}: {source}")]
    Bind {
        name: String,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("listener '{0}' is configured twice")]
    DuplicateListener(String),

    #[error("inherited descriptor {fd} for '{name}' is not a usable socket")]
    InheritedDescriptor { name: String, fd: RawFd },

    #[error("inherited descriptors were never claimed by a listener: {0:?}")]
    UnclaimedDescriptors(Vec<String>),

    #[error("malformed environment variable {key}={value:?}")]
    Environment { key: String, value: String },

    #[error("listener '{name}' failed while accepting: {source}")]
    Serve {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("listener '{name}' still had {remaining} connection(s) open after {timeout:?}")]
    DrainTimeout {
        name: String,
        remaining: usize,
        timeout: Duration,
    },

    #[error("failed to duplicate descriptor for '{name}': {source}")]
    Duplicate {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn transitional process: {0}")]
    Spawn(#[source] io::Error),

    #[error("transitional process {pid} did not report ready: {reason}")]
    NotReady { pid: i32, reason: String },

    #[error("failed to replace process image: {0}")]
    ReplaceSelf(#[source] io::Error),

    #[error("failed to signal transitional process {pid}: {source}")]
    SignalDelivery {
        pid: i32,
        #[source]
        source: io::Error,
    },

    #[error("failed to reap transitional process {pid}: {source}")]
    Reap {
        pid: i32,
        #[source]
        source: io::Error,
    },

    #[error("failed to subscribe to process signals: {0}")]
    Signal(#[source] io::Error),
}

impl Error {
    /// Whether this error only aborts the current restart attempt, leaving
    /// the running generation untouched.
    pub fn aborts_restart_only(&self) -> bool {
        matches!(
            self,
            Error::Spawn(_) | Error::NotReady { .. } | Error::Duplicate { .. }
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_abort_classification() {
        assert!(Error::Spawn(io::Error::other("fork failed")).aborts_restart_only());
        assert!(Error::NotReady {
            pid: 42,
            reason: "timed out".to_string()
        }
        .aborts_restart_only());
        assert!(!Error::ReplaceSelf(io::Error::other("exec failed")).aborts_restart_only());
        assert!(!Error::UnclaimedDescriptors(vec!["API".to_string()]).aborts_restart_only());
    }

    #[test]
    fn test_drain_timeout_message() {
        let err = Error::DrainTimeout {
            name: "public".to_string(),
            remaining: 3,
            timeout: Duration::from_secs(30),
        };
        assert_eq!(
            err.to_string(),
            "listener 'public' still had 3 connection(s) open after 30s"
        );
    }
}
