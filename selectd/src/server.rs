//! HTTP server plumbing and signal handling.

use crate::http::HttpDelegate;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request};
use observability_deps::tracing::info;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Binds the listener and starts serving requests on a background task.
///
/// Returns the bound address (useful with an ephemeral port) and the
/// server task; the task drains in-flight requests and exits when
/// `frontend_shutdown` is cancelled.
pub fn start(
    delegate: Arc<HttpDelegate>,
    addr: SocketAddr,
    frontend_shutdown: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<Result<(), hyper::Error>>), hyper::Error> {
    let make_svc = make_service_fn(move |_conn: &AddrStream| {
        let delegate = Arc::clone(&delegate);
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let delegate = Arc::clone(&delegate);
                async move { Ok::<_, Infallible>(delegate.route(req).await) }
            }))
        }
    });

    let server = hyper::Server::try_bind(&addr)?.serve(make_svc);
    let local_addr = server.local_addr();
    info!(%local_addr, "bound HTTP listener");

    let graceful = server.with_graceful_shutdown(async move { frontend_shutdown.cancelled().await });
    Ok((local_addr, tokio::spawn(graceful)))
}

/// Resolves when SIGINT or SIGTERM is received.
#[cfg(unix)]
pub async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("failed to register signal handler");
    let mut int = signal(SignalKind::interrupt()).expect("failed to register signal handler");

    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = int.recv() => info!("received SIGINT"),
    }
}

#[cfg(not(unix))]
pub async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
