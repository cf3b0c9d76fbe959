//! A Primary started with a transitional pid retires and reaps that process.

use std::net::SocketAddr;
use std::process::{Child, Command};
use std::time::Duration;

use link_tracker_ecdysis::{
    send_signal, Completion, ConnectionHandler, Error, Generation, GenerationRole,
    HandoffEnvelope, ListenerSet, PreparedHandoff, ProcessLauncher, RestartConfig,
    RestartCoordinator,
};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct Discard;

impl ConnectionHandler for Discard {
    async fn handle(&self, _stream: TcpStream, _peer: SocketAddr, _stopping: CancellationToken) {}
}

struct FailingLauncher;

impl ProcessLauncher for FailingLauncher {
    fn spawn_child(&self, _handoff: &PreparedHandoff) -> Result<Child, Error> {
        Err(Error::Spawn(std::io::Error::other("fork refused")))
    }

    fn replace_self(&self, _handoff: PreparedHandoff) -> Error {
        Error::ReplaceSelf(std::io::Error::other("exec refused"))
    }
}

/// True once `pid` is gone, including its zombie.
fn reaped(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) != 0 }
}

#[tokio::test]
async fn primary_reaps_inherited_transitional() {
    // Stands in for the Transitional left behind by the previous image.
    let transitional = Command::new("sleep").arg("30").spawn().unwrap();
    let transitional_pid = transitional.id() as i32;
    drop(transitional);

    let mut envelope = HandoffEnvelope::new();
    envelope.set_transitional_pid(Some(transitional_pid));
    let generation = Generation {
        role: GenerationRole::Primary,
        envelope,
    };

    let mut set = ListenerSet::new(Duration::from_secs(1));
    let handle = set
        .resume_or_bind("public", "127.0.0.1:0".parse().unwrap(), None)
        .await
        .unwrap();

    let mut coordinator = RestartCoordinator::new(
        &generation,
        set,
        FailingLauncher,
        RestartConfig::default(),
        None,
    )
    .unwrap();
    coordinator.serve(&handle, Discard);

    let client = async {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !reaped(transitional_pid) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "transitional process was not reaped"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        send_signal(std::process::id() as i32, libc::SIGTERM).unwrap();
    };

    let (completion, ()) = tokio::join!(coordinator.run(), client);
    assert!(matches!(completion.unwrap(), Completion::Shutdown));
}
