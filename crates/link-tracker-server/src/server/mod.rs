//! HTTP serving for the link tracker.
//!
//! Routers are plain axum routers; [`HttpHandler`] serves them on
//! connections accepted by the restart-aware listeners, so a stopping
//! listener can wind each connection down gracefully.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::Request, Router};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use link_tracker_ecdysis::ConnectionHandler;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{debug, Level};

use crate::clock::Clock;
use crate::db::LinkStore;
use crate::hits::HitRecorder;

mod routes;

/// How long a connection accepted just before a stop may take to send its
/// first request.
const FIRST_REQUEST_GRACE: Duration = Duration::from_secs(1);

/// Server application state
pub struct AppState {
    pub store: Arc<dyn LinkStore>,
    pub hits: HitRecorder,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(store: Arc<dyn LinkStore>, hits: HitRecorder, clock: Arc<dyn Clock>) -> Self {
        Self { store, hits, clock }
    }
}

/// Router for the public listener.
///
/// Carries the admin routes too unless a separate api listener serves them.
pub fn public_router(state: Arc<AppState>, with_admin: bool) -> Router {
    let router = routes::redirect_routes().merge(routes::health_routes());
    let router = if with_admin {
        router.merge(routes::admin_routes())
    } else {
        router
    };
    with_tracing(router.with_state(state))
}

/// Router for the api listener.
pub fn api_router(state: Arc<AppState>) -> Router {
    let router = routes::admin_routes().merge(routes::health_routes());
    with_tracing(router.with_state(state))
}

fn with_tracing(router: Router) -> Router {
    router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
}

/// Serves HTTP/1 on accepted connections.
#[derive(Clone)]
pub struct HttpHandler {
    router: Router,
}

impl HttpHandler {
    pub fn new(router: Router) -> Self {
        Self { router }
    }
}

impl ConnectionHandler for HttpHandler {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr, stopping: CancellationToken) {
        let first_request = CancellationToken::new();
        let service = {
            let router = self.router.clone();
            let first_request = first_request.clone();
            hyper::service::service_fn(move |req: Request<Incoming>| {
                first_request.cancel();
                router.clone().call(req)
            })
        };

        let conn = hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service);
        tokio::pin!(conn);

        let shutdown = async {
            stopping.cancelled().await;
            let _ = tokio::time::timeout(FIRST_REQUEST_GRACE, first_request.cancelled()).await;
        };
        tokio::pin!(shutdown);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = &mut shutdown => {
                debug!(%peer, "Listener stopping, closing connection after in-flight request");
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        };

        if let Err(e) = result {
            debug!(%peer, error = %e, "Connection ended with error");
        }
    }
}
