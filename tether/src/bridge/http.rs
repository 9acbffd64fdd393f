//! HTTP surface polled by the guest loop.
//!
//! - `GET /cmd`: next queued command as plain text, empty when none.
//! - `POST /result`: stores the raw body and answers `ECHO:<body>`. The echo
//!   is diagnostic only.

use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread::JoinHandle;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::QueueBridge;
use crate::{Error, Result};

/// Prefix of the `POST /result` acknowledgement body.
pub const ECHO_PREFIX: &[u8] = b"ECHO:";

/// Builds the router serving `bridge`.
pub fn router(bridge: Arc<QueueBridge>) -> Router {
    Router::new()
        .route("/cmd", get(next_command))
        .route("/result", post(submit_result))
        .with_state(bridge)
}

async fn next_command(State(bridge): State<Arc<QueueBridge>>) -> impl IntoResponse {
    let command = bridge.dequeue_command().unwrap_or_default();
    if !command.is_empty() {
        debug!(bytes = command.len(), "command fetched by guest");
    }
    ([(header::CONTENT_TYPE, "text/plain")], command)
}

async fn submit_result(
    State(bridge): State<Arc<QueueBridge>>,
    body: Bytes,
) -> impl IntoResponse {
    let mut echo = Vec::with_capacity(ECHO_PREFIX.len() + body.len());
    echo.extend_from_slice(ECHO_PREFIX);
    echo.extend_from_slice(&body);
    bridge.post_result(body.to_vec());
    ([(header::CONTENT_TYPE, "text/plain")], echo)
}

/// Serves `bridge` on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    bridge: Arc<QueueBridge>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "bridge listening");
    }
    axum::serve(listener, router(bridge))
        .with_graceful_shutdown(shutdown)
        .await
}

/// A bridge server running on its own thread.
///
/// Stops when [`shutdown`](Self::shutdown) is called or the handle is
/// dropped.
#[derive(Debug)]
pub struct BridgeServer {
    /// Bound address (resolves port 0).
    addr: SocketAddr,
    /// Fires the graceful shutdown.
    stop: Option<oneshot::Sender<()>>,
    /// Server thread.
    thread: Option<JoinHandle<io::Result<()>>>,
}

impl BridgeServer {
    /// Binds `addr` and starts serving `bridge` on a background thread.
    ///
    /// Binding happens before this returns, so the port is accepting
    /// connections as soon as the handle exists.
    pub fn spawn(addr: impl ToSocketAddrs, bridge: Arc<QueueBridge>) -> Result<Self> {
        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let bound = std_listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (stop, stopped) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("tether-bridge".into())
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = TcpListener::from_std(std_listener)?;
                    serve(listener, bridge, async {
                        let _ = stopped.await;
                    })
                    .await
                })
            })?;

        Ok(Self {
            addr: bound,
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    /// The address actually bound.
    pub const fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting, drains in-flight requests and joins the thread.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop_and_join()
    }

    fn stop_and_join(&mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        match thread.join() {
            Ok(result) => result.map_err(Error::Io),
            Err(_) => Err(Error::Io(io::Error::other("bridge server thread panicked"))),
        }
    }
}

impl Drop for BridgeServer {
    fn drop(&mut self) {
        if let Err(e) = self.stop_and_join() {
            warn!(error = %e, "bridge server exited with an error");
        }
    }
}
