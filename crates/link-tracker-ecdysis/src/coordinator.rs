//! Restart coordination for one process generation.
//!
//! The coordinator owns the [`ListenerSet`], runs one serve task per
//! listener and reacts to process signals:
//!
//! - restart signal (default `SIGHUP`) on a Primary: spawn a Transitional,
//!   wait for it to report ready, stop accepting, drain, then hand back a
//!   [`Replacement`] for the caller to exec
//! - restart signal on a Transitional: stop accepting, drain, exit
//! - `SIGTERM` / `SIGINT`: stop accepting, drain, exit. Received during a
//!   restart, the sequence still settles but ends in exit: a Transitional
//!   that already reported ready is retired instead of replaced
//!
//! A Primary started with a transitional pid in its environment signals
//! that process and reaps it in the background.

use std::os::unix::io::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::channel::{Generation, GenerationRole};
use crate::error::{Error, Result};
use crate::launcher::{send_signal, wait_for_exit, PreparedHandoff, ProcessLauncher, ReadyNotifier};
use crate::listener::{ConnectionHandler, ListenerHandle, ListenerSet};

const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a generation is in the restart sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPhase {
    Serving,
    RestartRequested,
    HandoffPrepared,
    Draining,
    /// Primary only: about to exec the successor image.
    ReExecuting,
    Exiting,
}

/// The restart state machine, separate from any I/O.
#[derive(Debug, Clone)]
pub struct RestartState {
    role: GenerationRole,
    phase: RestartPhase,
    transitional_pid: Option<i32>,
    terminate_requested: bool,
}

impl RestartState {
    pub fn new(role: GenerationRole) -> Self {
        Self {
            role,
            phase: RestartPhase::Serving,
            transitional_pid: None,
            terminate_requested: false,
        }
    }

    pub fn role(&self) -> GenerationRole {
        self.role
    }

    pub fn phase(&self) -> RestartPhase {
        self.phase
    }

    pub fn transitional_pid(&self) -> Option<i32> {
        self.transitional_pid
    }

    pub fn termination_requested(&self) -> bool {
        self.terminate_requested
    }

    /// `SIGTERM` or `SIGINT` arrived. Sticky: the generation exits once
    /// drained, whatever phase it is in.
    pub fn request_termination(&mut self) {
        self.terminate_requested = true;
    }

    /// Handle a restart signal. Returns `false` when the signal must be
    /// ignored because a sequence is already under way.
    ///
    /// A Transitional skips the hand-off and goes straight to draining.
    pub fn begin_restart(&mut self) -> bool {
        if self.phase != RestartPhase::Serving {
            return false;
        }
        self.phase = match self.role {
            GenerationRole::Primary => RestartPhase::RestartRequested,
            GenerationRole::Transitional => RestartPhase::Draining,
        };
        true
    }

    /// The Transitional reported ready.
    pub fn handoff_prepared(&mut self, transitional_pid: i32) {
        if self.phase == RestartPhase::RestartRequested {
            self.transitional_pid = Some(transitional_pid);
            self.phase = RestartPhase::HandoffPrepared;
        }
    }

    /// The spawn attempt failed; keep serving on this generation.
    pub fn abort_restart(&mut self) {
        if self.phase == RestartPhase::RestartRequested {
            self.phase = RestartPhase::Serving;
        }
    }

    /// Stop accepting. From `Serving` this is a plain shutdown.
    pub fn begin_drain(&mut self) -> bool {
        match self.phase {
            RestartPhase::Serving | RestartPhase::HandoffPrepared => {
                self.phase = RestartPhase::Draining;
                true
            }
            RestartPhase::Draining => true,
            _ => false,
        }
    }

    /// All serve tasks have returned.
    pub fn finish(&mut self) -> RestartPhase {
        if self.phase == RestartPhase::Draining {
            self.phase = match (self.role, self.transitional_pid) {
                (GenerationRole::Primary, Some(_)) if !self.terminate_requested => {
                    RestartPhase::ReExecuting
                }
                _ => RestartPhase::Exiting,
            };
        }
        self.phase
    }
}

#[derive(Debug, Clone)]
pub struct RestartConfig {
    pub restart_signal: libc::c_int,
    /// How long a Primary waits for a spawned Transitional to report ready.
    pub ready_timeout: Duration,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            restart_signal: libc::SIGHUP,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

/// How a generation finished serving.
pub enum Completion<L> {
    /// Exit the process with status 0.
    Shutdown,
    /// Exec the successor image.
    Replace(Replacement<L>),
}

impl<L> std::fmt::Debug for Completion<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Completion::Shutdown => write!(f, "Shutdown"),
            Completion::Replace(r) => write!(f, "Replace({:?})", r.handoff),
        }
    }
}

/// Everything needed to exec the next Primary.
pub struct Replacement<L> {
    launcher: L,
    handoff: PreparedHandoff,
}

impl<L: ProcessLauncher> Replacement<L> {
    pub fn transitional_pid(&self) -> Option<i32> {
        self.handoff.transitional_pid()
    }

    /// Replace the current process image. Only returns on failure.
    pub fn execute(self) -> Error {
        self.launcher.replace_self(self.handoff)
    }
}

type ServeOutcome = (String, Result<()>);

/// Drives one generation through Serving and, on a signal, the restart or
/// shutdown sequence.
pub struct RestartCoordinator<L> {
    state: RestartState,
    listeners: ListenerSet,
    launcher: L,
    config: RestartConfig,
    ready: Option<ReadyNotifier>,
    inherited_transitional: Option<i32>,
    tasks: JoinSet<ServeOutcome>,
    restart_signal: Signal,
    terminate: Signal,
    interrupt: Signal,
}

impl<L: ProcessLauncher> RestartCoordinator<L> {
    /// Subscribe to signals. Must be called inside a tokio runtime, before
    /// readiness is reported to the spawning generation.
    pub fn new(
        generation: &Generation,
        listeners: ListenerSet,
        launcher: L,
        config: RestartConfig,
        ready: Option<OwnedFd>,
    ) -> Result<Self> {
        let restart_signal =
            signal(SignalKind::from_raw(config.restart_signal)).map_err(Error::Signal)?;
        let terminate = signal(SignalKind::terminate()).map_err(Error::Signal)?;
        let interrupt = signal(SignalKind::interrupt()).map_err(Error::Signal)?;

        let inherited_transitional = match generation.role {
            GenerationRole::Primary => generation.envelope.transitional_pid(),
            GenerationRole::Transitional => None,
        };

        Ok(Self {
            state: RestartState::new(generation.role),
            listeners,
            launcher,
            config,
            ready: ready.map(ReadyNotifier::new),
            inherited_transitional,
            tasks: JoinSet::new(),
            restart_signal,
            terminate,
            interrupt,
        })
    }

    pub fn listeners(&self) -> &ListenerSet {
        &self.listeners
    }

    pub fn state(&self) -> &RestartState {
        &self.state
    }

    /// Start serving `handle` with `handler` on its own task.
    pub fn serve<H>(&mut self, handle: &Arc<ListenerHandle>, handler: H)
    where
        H: ConnectionHandler,
    {
        let handle = Arc::clone(handle);
        let name = handle.name().to_string();
        self.tasks.spawn(async move {
            let result = handle.serve(handler).await;
            (name, result)
        });
    }

    /// Serve until a shutdown or restart completes.
    ///
    /// Returns an error only when a listener failed unexpectedly; the
    /// remaining listeners are stopped and drained first.
    pub async fn run(mut self) -> Result<Completion<L>> {
        if let Some(pid) = self.inherited_transitional {
            tokio::spawn(reap_transitional(pid, self.config.restart_signal));
        }

        if let Some(ready) = self.ready.take() {
            match ready.notify() {
                Ok(()) => debug!("Reported ready to spawning generation"),
                Err(e) => warn!(error = %e, "Failed to report ready to spawning generation"),
            }
        }

        info!(
            role = %self.state.role(),
            pid = std::process::id(),
            listeners = self.listeners.handles().len(),
            "Serving"
        );

        let mut successor = None;
        let mut failure = None;

        loop {
            tokio::select! {
                _ = self.restart_signal.recv() => {
                    if !self.state.begin_restart() {
                        continue;
                    }
                    if self.state.role() == GenerationRole::Transitional {
                        info!("Restart signal received, retiring transitional generation");
                        break;
                    }
                    info!("Restart signal received, spawning transitional generation");
                    match self.attempt_restart().await {
                        Ok((pid, handoff)) => {
                            self.state.handoff_prepared(pid);
                            successor = Some(handoff);
                            break;
                        }
                        Err(e) => {
                            self.state.abort_restart();
                            if self.state.termination_requested() {
                                error!(error = %e, "Restart aborted, shutting down as requested");
                                break;
                            }
                            error!(error = %e, "Restart aborted, continuing to serve");
                        }
                    }
                }
                _ = self.terminate.recv() => {
                    info!("SIGTERM received, shutting down");
                    self.state.request_termination();
                    break;
                }
                _ = self.interrupt.recv() => {
                    info!("SIGINT received, shutting down");
                    self.state.request_termination();
                    break;
                }
                Some(joined) = self.tasks.join_next() => {
                    let err = serve_failure(joined);
                    error!(error = %err, "Listener stopped unexpectedly, shutting down");
                    failure = Some(err);
                    break;
                }
            }
        }

        self.state.begin_drain();
        self.listeners.request_stop();
        self.join_serve_tasks().await;

        if let Some(err) = failure {
            return Err(err);
        }

        match (self.state.finish(), successor) {
            (RestartPhase::ReExecuting, Some(handoff)) => {
                info!(
                    transitional_pid = ?handoff.transitional_pid(),
                    "All listeners drained, replacing process image"
                );
                Ok(Completion::Replace(Replacement {
                    launcher: self.launcher,
                    handoff,
                }))
            }
            (_, successor) => {
                // Closes the successor's duplicates.
                drop(successor);
                if let Some(pid) = self.state.transitional_pid() {
                    info!(pid, "Shutdown requested during restart, retiring transitional process");
                    reap_transitional(pid, self.config.restart_signal).await;
                }
                info!(role = %self.state.role(), "All listeners drained, exiting");
                Ok(Completion::Shutdown)
            }
        }
    }

    /// Spawn a Transitional, ignoring further restart signals and
    /// remembering a termination request for after the attempt settles.
    async fn attempt_restart(&mut self) -> Result<(i32, PreparedHandoff)> {
        let attempt = spawn_transitional(&self.listeners, &self.launcher, self.config.ready_timeout);
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => return result,
                _ = self.restart_signal.recv() => {
                    warn!("Restart already in progress, ignoring signal");
                }
                _ = self.terminate.recv() => {
                    info!("SIGTERM received during restart, exiting once it settles");
                    self.state.request_termination();
                }
                _ = self.interrupt.recv() => {
                    info!("SIGINT received during restart, exiting once it settles");
                    self.state.request_termination();
                }
            }
        }
    }

    /// Wait for every serve task. Restart signals are ignored; a
    /// termination request turns a pending replacement into an exit.
    async fn join_serve_tasks(&mut self) {
        loop {
            tokio::select! {
                joined = self.tasks.join_next() => match joined {
                    None => break,
                    Some(Ok((name, Ok(())))) => debug!(listener = %name, "Serve task finished"),
                    Some(joined) => {
                        let err = serve_failure(joined);
                        warn!(error = %err, "Listener failed while draining");
                    }
                },
                _ = self.restart_signal.recv() => {
                    warn!(phase = ?self.state.phase(), "Already stopping, ignoring restart signal");
                }
                _ = self.terminate.recv() => {
                    info!(phase = ?self.state.phase(), "SIGTERM received while draining, will exit");
                    self.state.request_termination();
                }
                _ = self.interrupt.recv() => {
                    info!(phase = ?self.state.phase(), "SIGINT received while draining, will exit");
                    self.state.request_termination();
                }
            }
        }
    }
}

fn serve_failure(joined: std::result::Result<ServeOutcome, tokio::task::JoinError>) -> Error {
    match joined {
        Ok((_, Err(e))) => e,
        Ok((name, Ok(()))) => Error::Serve {
            name,
            source: std::io::Error::other("accept loop ended before stop was requested"),
        },
        Err(e) => Error::Serve {
            name: "unknown".to_string(),
            source: std::io::Error::other(e.to_string()),
        },
    }
}

/// Launch a Transitional carrying duplicates of every listener and wait for
/// it to report ready.
///
/// The successor's duplicates are prepared up front so a later failure
/// cannot strand a drained Primary. On success returns the Transitional's
/// pid and the hand-off for the successor image.
async fn spawn_transitional<L: ProcessLauncher>(
    listeners: &ListenerSet,
    launcher: &L,
    ready_timeout: Duration,
) -> Result<(i32, PreparedHandoff)> {
    let successor = listeners.prepare_handoff()?;
    let transitional = listeners.prepare_handoff()?;
    let (ours, theirs) = UnixStream::pair().map_err(Error::Spawn)?;

    let handoff = PreparedHandoff::new(transitional).with_ready(OwnedFd::from(theirs));
    let mut child = launcher.spawn_child(&handoff)?;
    // Close our copies so a dead child shows up as EOF.
    drop(handoff);

    let pid = child.id() as i32;
    match await_ready(ours, ready_timeout).await {
        Ok(()) => {
            info!(pid, "Transitional process reported ready");
            Ok((pid, PreparedHandoff::new(successor).with_transitional_pid(pid)))
        }
        Err(reason) => {
            let reaped = tokio::task::spawn_blocking(move || {
                let _ = child.kill();
                child.wait()
            })
            .await;
            match reaped {
                Ok(Ok(status)) => debug!(pid, %status, "Reaped unready transitional process"),
                Ok(Err(e)) => warn!(pid, error = %e, "Failed to reap unready transitional process"),
                Err(e) => warn!(pid, error = %e, "Reaper task failed"),
            }
            Err(Error::NotReady { pid, reason })
        }
    }
}

async fn await_ready(stream: UnixStream, timeout: Duration) -> std::result::Result<(), String> {
    stream.set_nonblocking(true).map_err(|e| e.to_string())?;
    let mut stream = tokio::net::UnixStream::from_std(stream).map_err(|e| e.to_string())?;

    let mut byte = [0u8; 1];
    match tokio::time::timeout(timeout, stream.read(&mut byte)).await {
        Ok(Ok(1)) => Ok(()),
        Ok(Ok(_)) => Err("exited before reporting ready".to_string()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("no readiness notification within {timeout:?}")),
    }
}

/// Tell the retired Transitional to drain and exit, then reap it.
async fn reap_transitional(pid: i32, signo: libc::c_int) {
    info!(pid, "Signalling transitional process to retire");
    if let Err(e) = send_signal(pid, signo) {
        warn!(error = %e, "Giving up on transitional process");
        return;
    }

    match tokio::task::spawn_blocking(move || wait_for_exit(pid)).await {
        Ok(Ok(status)) => info!(pid, %status, "Transitional process exited"),
        Ok(Err(e)) => warn!(error = %e, "Giving up on transitional process"),
        Err(e) => warn!(pid, error = %e, "Reaper task failed"),
    }
}
