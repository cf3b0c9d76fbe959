//! Named listeners that survive across process generations.
//!
//! A listener is either resumed from a descriptor inherited through the
//! [`EnvironmentChannel`](crate::EnvironmentChannel) or bound fresh. While
//! serving, each accepted connection holds a guard so the listener can be
//! drained after it stops accepting.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{listener_suffix, HandoffEnvelope};
use crate::drain::ConnectionTracker;
use crate::error::{Error, Result};

/// Back-off after the process runs out of descriptors or memory while accepting.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Serves one accepted connection.
///
/// `stopping` fires when the listener stops accepting; long-lived
/// connections should wind down gracefully once it does.
pub trait ConnectionHandler: Clone + Send + Sync + 'static {
    fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        stopping: CancellationToken,
    ) -> impl Future<Output = ()> + Send;
}

/// Descriptors inherited from the previous generation, wrapped into owned
/// handles before the process allocates any other descriptor.
#[derive(Debug, Default)]
pub struct InheritedDescriptors {
    listeners: BTreeMap<String, OwnedFd>,
    ready: Option<OwnedFd>,
}

impl InheritedDescriptors {
    /// Take ownership of every descriptor named in `envelope`.
    ///
    /// Fails if any of them is not an open socket: a half-inherited state is
    /// a bug in the parent generation and must not be served.
    pub fn adopt(envelope: &HandoffEnvelope) -> Result<Self> {
        let mut inherited = Self::default();

        for (suffix, fd) in envelope.listeners() {
            let owned = adopt_socket(suffix, fd)?;
            info!(fd, listener = suffix, "Adopted inherited listener descriptor");
            inherited.listeners.insert(suffix.to_string(), owned);
        }

        if let Some(fd) = envelope.ready_fd() {
            inherited.ready = Some(adopt_socket("ready", fd)?);
        }

        Ok(inherited)
    }

    /// Take the inherited descriptor for listener `name`, if any.
    pub fn take(&mut self, name: &str) -> Option<OwnedFd> {
        self.listeners.remove(&listener_suffix(name))
    }

    /// Take the readiness socket handed down by the spawning generation.
    pub fn take_ready(&mut self) -> Option<OwnedFd> {
        self.ready.take()
    }

    /// Fail if an inherited listener was never claimed.
    ///
    /// Catches a listener-name mismatch between the old and new binary.
    pub fn ensure_claimed(self) -> Result<()> {
        if self.listeners.is_empty() {
            Ok(())
        } else {
            Err(Error::UnclaimedDescriptors(
                self.listeners.into_keys().collect(),
            ))
        }
    }
}

fn adopt_socket(name: &str, fd: RawFd) -> Result<OwnedFd> {
    if fd <= 2 || !validate_fd(fd) {
        return Err(Error::InheritedDescriptor {
            name: name.to_string(),
            fd,
        });
    }
    // SAFETY: the descriptor was handed to us by the previous generation,
    // fstat confirmed it is an open socket, and nothing else owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Validate that a file descriptor is an open socket using fstat.
fn validate_fd(fd: RawFd) -> bool {
    // SAFETY: fstat only writes into the zeroed stat buffer we own.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::fstat(fd, &mut stat) };
    if result != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

/// One named listening socket and its serving state.
pub struct ListenerHandle {
    name: String,
    addr: SocketAddr,
    listener: TcpListener,
    inherited: bool,
    stopping: CancellationToken,
    connections: ConnectionTracker,
    drain_timeout: Duration,
}

impl ListenerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether the socket came from the previous generation.
    pub fn was_inherited(&self) -> bool {
        self.inherited
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.is_cancelled()
    }

    pub fn active_connections(&self) -> usize {
        self.connections.active()
    }

    /// Stop accepting new connections. Idempotent; the flag never resets.
    pub fn request_stop(&self) {
        if !self.stopping.is_cancelled() {
            info!(listener = %self.name, addr = %self.addr, "Stopping accept loop");
        }
        self.stopping.cancel();
    }

    /// Wait until every accepted connection finished, or `timeout` elapsed.
    pub async fn wait_for_drain(&self, timeout: Duration) -> Result<()> {
        if self.connections.drain(timeout).await {
            Ok(())
        } else {
            Err(Error::DrainTimeout {
                name: self.name.clone(),
                remaining: self.connections.active(),
                timeout,
            })
        }
    }

    /// Duplicate the listening descriptor for another generation.
    ///
    /// The duplicate is close-on-exec; the launcher clears the flag only
    /// where the descriptor has to cross an exec. It stays valid after this
    /// process closes its own copy.
    pub fn prepare_descriptor_for_handoff(&self) -> Result<OwnedFd> {
        self.listener
            .as_fd()
            .try_clone_to_owned()
            .map_err(|source| Error::Duplicate {
                name: self.name.clone(),
                source,
            })
    }

    /// Accept and dispatch connections until stopped, then drain.
    ///
    /// A drain timeout is logged and does not fail the call; only an
    /// unexpected transport error does.
    pub async fn serve<H>(self: Arc<Self>, handler: H) -> Result<()>
    where
        H: ConnectionHandler,
    {
        info!(listener = %self.name, addr = %self.addr, "Accepting connections");

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.stopping.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let guard = self.connections.guard();
                    let handler = handler.clone();
                    let stopping = self.stopping.clone();
                    tokio::spawn(async move {
                        handler.handle(stream, peer, stopping).await;
                        drop(guard);
                    });
                }
                Err(e) if is_connection_error(&e) => {
                    debug!(listener = %self.name, error = %e, "Connection aborted before accept");
                }
                Err(e) if is_resource_exhaustion(&e) => {
                    warn!(listener = %self.name, error = %e, "Accept failed, backing off");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
                Err(source) => {
                    return Err(Error::Serve {
                        name: self.name.clone(),
                        source,
                    });
                }
            }
        }

        if let Err(e) = self.wait_for_drain(self.drain_timeout).await {
            warn!(error = %e, "Proceeding with connections still open");
        } else {
            info!(listener = %self.name, "Listener drained");
        }

        Ok(())
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

/// The listeners owned by one process.
pub struct ListenerSet {
    handles: Vec<Arc<ListenerHandle>>,
    drain_timeout: Duration,
}

impl ListenerSet {
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            handles: Vec::new(),
            drain_timeout,
        }
    }

    /// Resume listener `name` from an inherited descriptor, or bind `addr`.
    ///
    /// Resuming never rebinds, so the backlog and queued connections carry
    /// over. Binding fails with [`Error::Bind`] if the address is taken.
    pub async fn resume_or_bind(
        &mut self,
        name: &str,
        addr: SocketAddr,
        inherited: Option<OwnedFd>,
    ) -> Result<Arc<ListenerHandle>> {
        if self.get(name).is_some() {
            return Err(Error::DuplicateListener(name.to_string()));
        }

        let bind_error = |source: io::Error| Error::Bind {
            name: name.to_string(),
            addr,
            source,
        };

        let (listener, was_inherited) = match inherited {
            Some(fd) => {
                let std_listener = std::net::TcpListener::from(fd);
                std_listener.set_nonblocking(true).map_err(bind_error)?;
                let listener = TcpListener::from_std(std_listener).map_err(bind_error)?;
                (listener, true)
            }
            None => (TcpListener::bind(addr).await.map_err(bind_error)?, false),
        };

        let local = listener.local_addr().map_err(bind_error)?;
        if was_inherited {
            if local != addr && addr.port() != 0 {
                warn!(
                    listener = name,
                    configured = %addr,
                    inherited = %local,
                    "Inherited listener address differs from configuration, keeping inherited socket"
                );
            }
            info!(listener = name, addr = %local, "Resumed inherited listener");
        } else {
            info!(listener = name, addr = %local, "Bound listener");
        }

        let handle = Arc::new(ListenerHandle {
            name: name.to_string(),
            addr: local,
            listener,
            inherited: was_inherited,
            stopping: CancellationToken::new(),
            connections: ConnectionTracker::new(),
            drain_timeout: self.drain_timeout,
        });
        self.handles.push(Arc::clone(&handle));
        Ok(handle)
    }

    pub fn handles(&self) -> &[Arc<ListenerHandle>] {
        &self.handles
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ListenerHandle>> {
        self.handles.iter().find(|h| h.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop every listener from accepting.
    pub fn request_stop(&self) {
        for handle in &self.handles {
            handle.request_stop();
        }
    }

    /// Duplicate every listening descriptor for the next generation.
    pub fn prepare_handoff(&self) -> Result<Vec<(String, OwnedFd)>> {
        self.handles
            .iter()
            .map(|h| Ok((h.name.clone(), h.prepare_descriptor_for_handoff()?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::{AsRawFd, IntoRawFd};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    /// Echoes a single line back, then closes.
    #[derive(Clone)]
    struct Echo;

    impl ConnectionHandler for Echo {
        async fn handle(&self, mut stream: TcpStream, _peer: SocketAddr, _stopping: CancellationToken) {
            let mut buf = [0u8; 64];
            if let Ok(n) = stream.read(&mut buf).await {
                let _ = stream.write_all(&buf[..n]).await;
            }
        }
    }

    async fn round_trip(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(payload).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_bind_fresh_and_serve() {
        let mut set = ListenerSet::new(Duration::from_secs(1));
        let handle = set.resume_or_bind("public", loopback(), None).await.unwrap();
        assert!(!handle.was_inherited());

        let task = tokio::spawn(Arc::clone(&handle).serve(Echo));
        assert_eq!(round_trip(handle.local_addr(), b"ping").await, b"ping");

        handle.request_stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_resume_from_duplicated_descriptor() {
        let mut old = ListenerSet::new(Duration::from_secs(1));
        let original = old.resume_or_bind("public", loopback(), None).await.unwrap();
        let addr = original.local_addr();

        let dup = original.prepare_descriptor_for_handoff().unwrap();
        assert_ne!(dup.as_raw_fd(), original.listener.as_raw_fd());
        drop(old);
        drop(original);

        let mut new = ListenerSet::new(Duration::from_secs(1));
        let resumed = new.resume_or_bind("public", addr, Some(dup)).await.unwrap();
        assert!(resumed.was_inherited());
        assert_eq!(resumed.local_addr(), addr);

        let task = tokio::spawn(Arc::clone(&resumed).serve(Echo));
        assert_eq!(round_trip(addr, b"still here").await, b"still here");
        resumed.request_stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let mut set = ListenerSet::new(Duration::from_secs(1));
        let first = set.resume_or_bind("public", loopback(), None).await.unwrap();

        let mut other = ListenerSet::new(Duration::from_secs(1));
        let err = other
            .resume_or_bind("public", first.local_addr(), None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Bind { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_listener_name_rejected() {
        let mut set = ListenerSet::new(Duration::from_secs(1));
        set.resume_or_bind("public", loopback(), None).await.unwrap();
        let err = set.resume_or_bind("public", loopback(), None).await.err().unwrap();
        assert!(matches!(err, Error::DuplicateListener(name) if name == "public"));
    }

    #[tokio::test]
    async fn test_request_stop_is_idempotent() {
        let mut set = ListenerSet::new(Duration::from_secs(1));
        let handle = set.resume_or_bind("public", loopback(), None).await.unwrap();
        let task = tokio::spawn(Arc::clone(&handle).serve(Echo));

        handle.request_stop();
        handle.request_stop();
        assert!(handle.is_stopping());

        task.await.unwrap().unwrap();
        set.request_stop();
        assert!(handle.is_stopping());
    }

    /// Waits for a release signal before answering.
    #[derive(Clone)]
    struct Gated {
        accepted: Arc<tokio::sync::Mutex<Option<oneshot::Sender<()>>>>,
        release: Arc<tokio::sync::Mutex<Option<oneshot::Receiver<()>>>>,
    }

    impl ConnectionHandler for Gated {
        async fn handle(&self, mut stream: TcpStream, _peer: SocketAddr, _stopping: CancellationToken) {
            if let Some(tx) = self.accepted.lock().await.take() {
                let _ = tx.send(());
            }
            if let Some(rx) = self.release.lock().await.take() {
                let _ = rx.await;
            }
            let _ = stream.write_all(b"done").await;
        }
    }

    #[tokio::test]
    async fn test_connection_accepted_before_stop_runs_to_completion() {
        let mut set = ListenerSet::new(Duration::from_secs(5));
        let handle = set.resume_or_bind("public", loopback(), None).await.unwrap();

        let (accepted_tx, accepted_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        let handler = Gated {
            accepted: Arc::new(tokio::sync::Mutex::new(Some(accepted_tx))),
            release: Arc::new(tokio::sync::Mutex::new(Some(release_rx))),
        };

        let task = tokio::spawn(Arc::clone(&handle).serve(handler));
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        accepted_rx.await.unwrap();

        handle.request_stop();
        assert_eq!(handle.active_connections(), 1);
        assert!(!task.is_finished());

        release_tx.send(()).unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"done");

        task.await.unwrap().unwrap();
        assert_eq!(handle.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_drain_times_out_with_open_connection() {
        let mut set = ListenerSet::new(Duration::from_millis(50));
        let handle = set.resume_or_bind("public", loopback(), None).await.unwrap();
        let _guard = handle.connections.guard();

        let err = handle
            .wait_for_drain(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DrainTimeout { remaining: 1, .. }));
    }

    #[test]
    fn test_adopt_rejects_non_socket() {
        let file = std::fs::File::open("/dev/null").unwrap();
        let fd = file.into_raw_fd();

        let mut envelope = HandoffEnvelope::new();
        envelope.insert_listener("public", fd);
        let err = InheritedDescriptors::adopt(&envelope).unwrap_err();
        assert!(matches!(err, Error::InheritedDescriptor { fd: bad, .. } if bad == fd));

        // SAFETY: adopt refused the descriptor, so we still own it.
        drop(unsafe { OwnedFd::from_raw_fd(fd) });
    }

    #[test]
    fn test_adopt_claims_sockets_and_reports_leftovers() {
        let public = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let api = std::net::TcpListener::bind("127.0.0.1:0").unwrap();

        let mut envelope = HandoffEnvelope::new();
        envelope.insert_listener("public", public.into_raw_fd());
        envelope.insert_listener("api", api.into_raw_fd());

        let mut inherited = InheritedDescriptors::adopt(&envelope).unwrap();
        assert!(inherited.take("public").is_some());
        assert!(inherited.take("public").is_none());

        let err = inherited.ensure_claimed().unwrap_err();
        assert!(matches!(err, Error::UnclaimedDescriptors(names) if names == vec!["API".to_string()]));
    }

    #[test]
    fn test_invalid_fd_detection() {
        assert!(!validate_fd(9999));
        assert!(!validate_fd(-1));
    }
}
