//! WebSocket connection hub.
//!
//! Accepts HTTP upgrades, assigns each session a connection id, runs the
//! per-session read/write tasks and routes outbound frames from the
//! ingester and the filter manager back to the right session. The session
//! table is owned by a single router task, so it needs no lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::msg::{Inbound, Outbound};

const SESSION_CHANNEL_CAPACITY: usize = 128;

/// Shared state for the axum handlers.
///
/// The ingester sender is held weakly: the strong half lives with the read
/// tasks (and an anchor dropped at shutdown), so the ingester's inbound
/// channel closes once the last read task is gone rather than staying open
/// for the server's lifetime.
#[derive(Clone)]
struct HubState {
    to_ingester: mpsc::WeakSender<Inbound>,
    register: mpsc::Sender<SessionHandle>,
    session_quit: mpsc::Sender<Uuid>,
    closing: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
}

/// Write half of a session, handed to the router on accept.
struct SessionHandle {
    conn_id: Uuid,
    outbound: mpsc::Sender<String>,
}

/// The server plus the router-side channel ends.
pub struct ConnectionHub {
    listener: TcpListener,
    local_addr: SocketAddr,
    to_ingester: mpsc::Sender<Inbound>,
    from_ingester: mpsc::Receiver<Outbound>,
    from_fanout: mpsc::Receiver<Outbound>,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionHub {
    /// Bind the listener; the relay is not serving until [`run`] is called.
    pub async fn bind(
        addr: &str,
        to_ingester: mpsc::Sender<Inbound>,
        from_ingester: mpsc::Receiver<Outbound>,
        from_fanout: mpsc::Receiver<Outbound>,
        shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            to_ingester,
            from_ingester,
            from_fanout,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until the shutdown signal fires, then refuse upgrades and let
    /// the pipeline unwind source-first: read tasks exit and release the
    /// ingester channel; the router and write tasks close only once the
    /// drained ingester and filter manager have dropped their outbound
    /// senders, so no queued client-bound frame is lost.
    pub async fn run(self) {
        let closing = Arc::new(AtomicBool::new(false));
        let (register_tx, register_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        let (session_quit_tx, session_quit_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        let state = HubState {
            to_ingester: self.to_ingester.downgrade(),
            register: register_tx,
            session_quit: session_quit_tx,
            closing: closing.clone(),
            shutdown: self.shutdown.clone(),
        };
        // anchor the strong ingester sender until shutdown so sessions can
        // upgrade the weak copy; read tasks keep their own clones after that
        let anchor = self.to_ingester;
        let mut anchor_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if !*anchor_shutdown.borrow() {
                let _ = anchor_shutdown.changed().await;
            }
            drop(anchor);
        });
        let router_task = tokio::spawn(route(
            register_rx,
            self.from_ingester,
            self.from_fanout,
            session_quit_rx,
            self.shutdown.clone(),
        ));

        let app = Router::new()
            .route("/", get(root))
            .route("/healthz", get(healthz))
            .with_state(state);
        let mut shutdown = self.shutdown.clone();
        let graceful = async move {
            if !*shutdown.borrow() {
                let _ = shutdown.changed().await;
            }
            closing.store(true, Ordering::SeqCst);
        };
        info!(addr = %self.local_addr, "listening for incoming connections");
        if let Err(err) = axum::serve(self.listener, app.into_make_service())
            .with_graceful_shutdown(graceful)
            .await
        {
            error!(error = %err, "websocket server failed");
        }
        let _ = router_task.await;
        info!("connection hub stopped");
    }
}

/// Dispatch loop owning the session table.
///
/// Runs until both the ingester and the filter manager have dropped their
/// outbound senders; closing the table then lets the write tasks unwind.
/// A source channel closing outside of shutdown is fatal.
async fn route(
    mut register: mpsc::Receiver<SessionHandle>,
    mut from_ingester: mpsc::Receiver<Outbound>,
    mut from_fanout: mpsc::Receiver<Outbound>,
    mut session_quit: mpsc::Receiver<Uuid>,
    shutdown: watch::Receiver<bool>,
) {
    let mut sessions: HashMap<Uuid, mpsc::Sender<String>> = HashMap::new();
    let mut ingester_open = true;
    let mut fanout_open = true;
    while ingester_open || fanout_open {
        tokio::select! {
            Some(handle) = register.recv() => {
                debug!(conn_id = %handle.conn_id, "session registered");
                sessions.insert(handle.conn_id, handle.outbound);
            }
            out = from_ingester.recv(), if ingester_open => match out {
                Some(out) => deliver(&sessions, out, "ingester").await,
                None => {
                    if !*shutdown.borrow() {
                        error!("receive channel from ingester unexpectedly closed");
                        panic!("receive channel from ingester unexpectedly closed");
                    }
                    ingester_open = false;
                }
            },
            out = from_fanout.recv(), if fanout_open => match out {
                Some(out) => deliver(&sessions, out, "filter manager").await,
                None => {
                    if !*shutdown.borrow() {
                        error!("receive channel from filter manager unexpectedly closed");
                        panic!("receive channel from filter manager unexpectedly closed");
                    }
                    fanout_open = false;
                }
            },
            Some(conn_id) = session_quit.recv() => {
                if sessions.remove(&conn_id).is_none() {
                    warn!(%conn_id, "quit signal from unknown session, ignoring");
                }
            }
        }
    }
    // dropping the outbound senders lets every write task unwind
    sessions.clear();
    debug!("router stopped");
}

/// Forward one outbound frame to its session, or log and drop it.
async fn deliver(sessions: &HashMap<Uuid, mpsc::Sender<String>>, out: Outbound, source: &str) {
    if out.unparseable {
        // hook for strike-count disconnect logic
        debug!(conn_id = %out.conn_id, "client sent an unparseable frame");
    }
    match sessions.get(&out.conn_id) {
        Some(tx) => {
            if tx.send(out.frame.to_json()).await.is_err() {
                warn!(conn_id = %out.conn_id, source, "session outbound channel closed, dropping frame");
            }
        }
        None => {
            warn!(conn_id = %out.conn_id, source, "unknown session, dropping frame");
        }
    }
}

/// `GET /`: WebSocket upgrade, or the relay information document for a
/// plain HTTP request.
async fn root(
    ws: Option<WebSocketUpgrade>,
    State(state): State<HubState>,
) -> axum::response::Response {
    if state.closing.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    match ws {
        Some(upgrade) => upgrade
            .on_upgrade(move |socket| session(socket, state))
            .into_response(),
        None => relay_info().into_response(),
    }
}

/// Run one accepted connection to completion.
async fn session(socket: WebSocket, state: HubState) {
    let conn_id = Uuid::new_v4();
    let to_ingester = match state.to_ingester.upgrade() {
        Some(tx) => tx,
        None => {
            warn!(%conn_id, "ingester is gone, dropping connection");
            return;
        }
    };
    info!(%conn_id, "starting session for new connection");
    let (outbound_tx, outbound_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
    if state
        .register
        .send(SessionHandle {
            conn_id,
            outbound: outbound_tx,
        })
        .await
        .is_err()
    {
        warn!(%conn_id, "router is gone, dropping connection");
        return;
    }
    let (ws_tx, ws_rx) = socket.split();
    let (write_quit_tx, write_quit_rx) = oneshot::channel();
    let read = tokio::spawn(read_task(
        conn_id,
        ws_rx,
        to_ingester,
        write_quit_tx,
        state.shutdown.clone(),
    ));
    let write = tokio::spawn(write_task(
        conn_id,
        ws_tx,
        outbound_rx,
        write_quit_rx,
        state.session_quit.clone(),
    ));
    let _ = read.await;
    let _ = write.await;
    info!(%conn_id, "session ended");
}

/// Publish inbound frames to the ingester. Every exit publishes a single
/// disconnect marker; only peer-initiated exits tell the write task to
/// quit, so during shutdown it keeps flushing until the router lets go.
async fn read_task(
    conn_id: Uuid,
    mut ws_rx: SplitStream<WebSocket>,
    to_ingester: mpsc::Sender<Inbound>,
    write_quit: oneshot::Sender<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut peer_closed = true;
    loop {
        tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(payload))) => {
                    let frame = Inbound::Frame { conn_id, payload };
                    if to_ingester.send(frame).await.is_err() {
                        warn!(%conn_id, "ingester is gone, exiting read task");
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(%conn_id, "client closed connection");
                    break;
                }
                // ping/pong keepalives are answered by the transport layer
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(%conn_id, error = %err, "failed to read from websocket connection");
                    break;
                }
            },
            _ = shutdown.changed() => {
                debug!(%conn_id, "read task cancelled by shutdown");
                peer_closed = false;
                break;
            }
        }
    }
    let _ = to_ingester.send(Inbound::Disconnect { conn_id }).await;
    if peer_closed {
        let _ = write_quit.send(());
    }
    debug!(%conn_id, "read task exiting");
}

/// Write outbound frames in arrival order. The task never watches the
/// shutdown signal directly: during shutdown the router keeps the outbound
/// sender until the ingester and filter manager have drained, so every
/// queued frame is flushed before the channel closes and the transport is
/// torn down. Only a peer-initiated exit signals the router.
async fn write_task(
    conn_id: Uuid,
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    mut write_quit: oneshot::Receiver<()>,
    session_quit: mpsc::Sender<Uuid>,
) {
    loop {
        tokio::select! {
            msg = outbound.recv() => match msg {
                Some(text) => {
                    debug!(%conn_id, "sending frame to client");
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        warn!(%conn_id, "failed to send frame, closing connection");
                        let _ = ws_tx.close().await;
                        let _ = session_quit.send(conn_id).await;
                        return;
                    }
                }
                None => {
                    // the router dropped us during shutdown; it already knows
                    let _ = ws_tx.close().await;
                    debug!(%conn_id, "write task exiting on shutdown");
                    return;
                }
            },
            _ = &mut write_quit => {
                let _ = ws_tx.close().await;
                let _ = session_quit.send(conn_id).await;
                debug!(%conn_id, "write task exiting");
                return;
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Health {
    status: String,
}

/// Health check endpoint.
async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}

#[derive(Serialize, Deserialize)]
struct RelayInfo {
    name: String,
    software: String,
    version: String,
}

/// Basic NIP-11 relay information document.
fn relay_info() -> impl IntoResponse {
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(RelayInfo {
            name: "tandem".into(),
            software: "tandem".into(),
            version: env!("CARGO_PKG_VERSION").into(),
        }),
    )
}
