//! Process launching with descriptor passing.
//!
//! Two ways to start the next generation, both carrying a
//! [`PreparedHandoff`]:
//!
//! - `spawn_child` forks a Transitional process running the same
//!   executable and arguments
//! - `replace_self` execs the same executable in place, keeping the pid
//!
//! Handed-off descriptors are close-on-exec in this process. The flag is
//! cleared only on the path that crosses an exec: in the forked child for
//! `spawn_child`, in this process right before exec for `replace_self`.

use std::ffi::OsString;
use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus};

use tracing::info;

use crate::channel::{EnvironmentChannel, GenerationRole, HandoffEnvelope};
use crate::error::{Error, Result};

/// Owned descriptors (and the transitional pid) destined for the next
/// generation. Dropping it closes this process's duplicates.
#[derive(Debug, Default)]
pub struct PreparedHandoff {
    listeners: Vec<(String, OwnedFd)>,
    ready: Option<OwnedFd>,
    transitional_pid: Option<i32>,
}

impl PreparedHandoff {
    pub fn new(listeners: Vec<(String, OwnedFd)>) -> Self {
        Self {
            listeners,
            ready: None,
            transitional_pid: None,
        }
    }

    pub fn with_ready(mut self, ready: OwnedFd) -> Self {
        self.ready = Some(ready);
        self
    }

    pub fn with_transitional_pid(mut self, pid: i32) -> Self {
        self.transitional_pid = Some(pid);
        self
    }

    pub fn transitional_pid(&self) -> Option<i32> {
        self.transitional_pid
    }

    /// The descriptor numbers as the receiving process will see them.
    pub fn envelope(&self) -> HandoffEnvelope {
        let mut envelope = HandoffEnvelope::new();
        for (name, fd) in &self.listeners {
            envelope.insert_listener(name, fd.as_raw_fd());
        }
        envelope.set_ready_fd(self.ready.as_ref().map(AsRawFd::as_raw_fd));
        envelope.set_transitional_pid(self.transitional_pid);
        envelope
    }

    /// Every descriptor that must survive the exec.
    pub fn raw_descriptors(&self) -> Vec<RawFd> {
        self.listeners
            .iter()
            .map(|(_, fd)| fd.as_raw_fd())
            .chain(self.ready.as_ref().map(AsRawFd::as_raw_fd))
            .collect()
    }
}

/// Starts the next generation of the process.
pub trait ProcessLauncher: Send + Sync + 'static {
    /// Start a Transitional process that inherits `handoff`.
    fn spawn_child(&self, handoff: &PreparedHandoff) -> Result<Child>;

    /// Replace the current process image, carrying `handoff`.
    ///
    /// Only returns on failure.
    fn replace_self(&self, handoff: PreparedHandoff) -> Error;
}

/// Launches the executable this process was started from.
#[derive(Debug, Clone)]
pub struct ExecLauncher {
    channel: EnvironmentChannel,
    exe: PathBuf,
    args: Vec<OsString>,
}

impl ExecLauncher {
    pub fn new(channel: EnvironmentChannel, exe: PathBuf, args: Vec<OsString>) -> Self {
        Self { channel, exe, args }
    }

    /// Capture the executable path and arguments at startup.
    ///
    /// Captured early because on Linux the executable link reads
    /// `... (deleted)` once a new binary is installed over the old path.
    pub fn from_current_process(channel: EnvironmentChannel) -> io::Result<Self> {
        let exe = std::env::current_exe()?;
        let args = std::env::args_os().skip(1).collect();
        Ok(Self::new(channel, exe, args))
    }

    fn command(&self, env: Vec<(OsString, OsString)>) -> Command {
        let mut cmd = Command::new(&self.exe);
        if let Some(arg0) = std::env::args_os().next() {
            cmd.arg0(arg0);
        }
        cmd.args(&self.args).env_clear().envs(env);
        cmd
    }
}

impl ProcessLauncher for ExecLauncher {
    fn spawn_child(&self, handoff: &PreparedHandoff) -> Result<Child> {
        let envelope = handoff.envelope();
        let env = self
            .channel
            .merge(std::env::vars_os(), &envelope, GenerationRole::Transitional);
        let fds = handoff.raw_descriptors();

        let mut cmd = self.command(env);
        // SAFETY: the hook runs between fork and exec and only calls fcntl,
        // which is async-signal-safe. It allocates nothing.
        unsafe {
            cmd.pre_exec(move || {
                for fd in &fds {
                    clear_cloexec(*fd)?;
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(Error::Spawn)?;
        info!(
            pid = child.id(),
            exe = %self.exe.display(),
            envelope = ?envelope,
            "Spawned transitional process"
        );
        Ok(child)
    }

    fn replace_self(&self, handoff: PreparedHandoff) -> Error {
        let envelope = handoff.envelope();
        for fd in handoff.raw_descriptors() {
            if let Err(e) = clear_cloexec(fd) {
                return Error::ReplaceSelf(e);
            }
        }

        let env = self
            .channel
            .merge(std::env::vars_os(), &envelope, GenerationRole::Primary);

        info!(
            exe = %self.exe.display(),
            envelope = ?envelope,
            "Executing new process image"
        );

        let err = self.command(env).exec();
        // Still here: the descriptors stay open until the caller exits.
        drop(handoff);
        Error::ReplaceSelf(err)
    }
}

/// The Transitional's end of the readiness socket pair.
#[derive(Debug)]
pub struct ReadyNotifier {
    stream: UnixStream,
}

impl ReadyNotifier {
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            stream: UnixStream::from(fd),
        }
    }

    /// Tell the spawning generation this process is serving.
    pub fn notify(mut self) -> io::Result<()> {
        self.stream.write_all(&[READY_BYTE])
    }
}

/// Byte written over the readiness socket.
pub(crate) const READY_BYTE: u8 = 1;

/// Deliver `signo` to `pid`.
pub fn send_signal(pid: i32, signo: libc::c_int) -> Result<()> {
    // SAFETY: kill has no memory-safety requirements.
    if unsafe { libc::kill(pid, signo) } != 0 {
        return Err(Error::SignalDelivery {
            pid,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Block until child `pid` exits and collect its status.
pub fn wait_for_exit(pid: i32) -> Result<ExitStatus> {
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: waitpid only writes into `status`, which we own.
        let result = unsafe { libc::waitpid(pid, &mut status, 0) };
        if result == pid {
            return Ok(ExitStatus::from_raw(status));
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(Error::Reap { pid, source: err });
        }
    }
}

/// Clear `FD_CLOEXEC` so `fd` survives the next exec.
fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor number has no memory-safety requirements.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let result = unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
