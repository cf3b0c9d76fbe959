//! SIGTERM during a restart still shuts the Primary down, retiring the
//! Transitional it had already spawned.

use std::io::Write;
use std::net::SocketAddr;
use std::os::unix::io::BorrowedFd;
use std::os::unix::net::UnixStream;
use std::process::{Child, Command};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use link_tracker_ecdysis::{
    send_signal, Completion, ConnectionHandler, Error, Generation, GenerationRole,
    HandoffEnvelope, ListenerSet, PreparedHandoff, ProcessLauncher, RestartConfig,
    RestartCoordinator,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

const READY_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone)]
struct Hello;

impl ConnectionHandler for Hello {
    async fn handle(&self, mut stream: TcpStream, _peer: SocketAddr, _stopping: CancellationToken) {
        let _ = stream.write_all(b"hello\n").await;
    }
}

/// Spawns `sleep` as a stand-in Transitional that reports ready after
/// [`READY_DELAY`].
#[derive(Default)]
struct SlowLauncher {
    spawned: Arc<Mutex<Option<i32>>>,
}

impl ProcessLauncher for SlowLauncher {
    fn spawn_child(&self, handoff: &PreparedHandoff) -> Result<Child, Error> {
        let child = Command::new("sleep")
            .arg("30")
            .spawn()
            .map_err(Error::Spawn)?;
        *self.spawned.lock().unwrap() = Some(child.id() as i32);

        let fd = handoff.envelope().ready_fd().unwrap();
        let ready = unsafe { BorrowedFd::borrow_raw(fd) }
            .try_clone_to_owned()
            .unwrap();
        std::thread::spawn(move || {
            std::thread::sleep(READY_DELAY);
            let _ = UnixStream::from(ready).write_all(&[1]);
        });
        Ok(child)
    }

    fn replace_self(&self, _handoff: PreparedHandoff) -> Error {
        panic!("a terminated Primary must not replace itself");
    }
}

#[tokio::test]
async fn sigterm_during_restart_exits_and_retires_transitional() {
    let generation = Generation {
        role: GenerationRole::Primary,
        envelope: HandoffEnvelope::new(),
    };

    let mut set = ListenerSet::new(Duration::from_secs(2));
    let handle = set
        .resume_or_bind("public", "127.0.0.1:0".parse().unwrap(), None)
        .await
        .unwrap();
    let addr = handle.local_addr();

    let launcher = SlowLauncher::default();
    let spawned = Arc::clone(&launcher.spawned);
    let mut coordinator =
        RestartCoordinator::new(&generation, set, launcher, RestartConfig::default(), None)
            .unwrap();
    coordinator.serve(&handle, Hello);

    let pid = std::process::id() as i32;
    let client = async {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut greeting = String::new();
        stream.read_to_string(&mut greeting).await.unwrap();
        assert_eq!(greeting, "hello\n");

        send_signal(pid, libc::SIGHUP).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        send_signal(pid, libc::SIGTERM).unwrap();
    };

    let (completion, ()) = tokio::join!(coordinator.run(), client);
    assert!(matches!(completion.unwrap(), Completion::Shutdown));
    assert!(handle.is_stopping());

    let transitional = spawned.lock().unwrap().expect("transitional was spawned");
    let alive = unsafe { libc::kill(transitional, 0) } == 0;
    assert!(!alive, "transitional must be retired and reaped");
}
