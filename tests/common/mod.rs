//! Shared end-to-end harness: in-process relay, agents and a local service

#![allow(dead_code)]

use axum::body::{Body, Bytes};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::Router;
use futures_util::StreamExt;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tunnel_relay::{Agent, AgentConfig, AgentError, ConnectionState, RelayBuilder, RunningRelay};

pub const SECRET: &str = "tunnel-relay-end-to-end-test-secret-0123";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn relay_builder() -> RelayBuilder {
    RelayBuilder::new(SECRET)
}

pub async fn start_relay() -> RunningRelay {
    relay_builder().start().await.unwrap()
}

#[derive(Default)]
pub struct LocalState {
    pub name: String,
    pub hang_calls: AtomicUsize,
    pub slow_started: AtomicUsize,
    /// `/slow` handlers dropped before finishing
    pub slow_cancelled: AtomicUsize,
}

/// A local service the agent forwards to
pub struct LocalService {
    pub addr: SocketAddr,
    pub state: Arc<LocalState>,
}

impl LocalService {
    pub fn address(&self) -> String {
        self.addr.to_string()
    }
}

async fn sse() -> Response {
    let events = futures_util::stream::iter(0..3).then(|i| async move {
        if i > 0 {
            tokio::time::sleep(Duration::from_millis(700)).await;
        }
        Ok::<_, Infallible>(Bytes::from(format!("id: {i}\ndata: event {i}\n\n")))
    });
    Response::builder()
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(events))
        .unwrap()
}

/// Hangs on the first call, answers every later one
async fn hang_once(State(state): State<Arc<LocalState>>) -> &'static str {
    if state.hang_calls.fetch_add(1, Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_secs(20)).await;
        "late"
    } else {
        "answered"
    }
}

struct SlowCall {
    state: Arc<LocalState>,
    finished: bool,
}

impl Drop for SlowCall {
    fn drop(&mut self) {
        if !self.finished {
            self.state.slow_cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Takes 30s unless the caller goes away first
async fn slow(State(state): State<Arc<LocalState>>) -> &'static str {
    state.slow_started.fetch_add(1, Ordering::SeqCst);
    let mut call = SlowCall {
        state: state.clone(),
        finished: false,
    };
    tokio::time::sleep(Duration::from_secs(30)).await;
    call.finished = true;
    "finished"
}

async fn echo_socket(mut socket: WebSocket) {
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Text(_) | Message::Binary(_) => {
                if socket.send(message).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

pub async fn start_local(name: &str) -> LocalService {
    let state = Arc::new(LocalState {
        name: name.to_string(),
        ..Default::default()
    });

    let app = Router::new()
        .route(
            "/status",
            get(|| async { ([("content-type", "application/json")], r#"{"ok":true}"#) }),
        )
        .route(
            "/whoami",
            get(|State(state): State<Arc<LocalState>>| async move { state.name.clone() }),
        )
        .route("/echo", post(|body: Bytes| async move { body }))
        .route("/item/{n}", get(|Path(n): Path<u32>| async move { n.to_string() }))
        .route(
            "/bytes/{n}",
            get(|Path(n): Path<usize>| async move {
                (0..n).map(|i| (i % 251) as u8).collect::<Vec<u8>>()
            }),
        )
        .route("/sse", get(sse))
        .route("/hang-once", get(hang_once))
        .route("/slow", get(slow))
        .route(
            "/ws",
            any(|ws: WebSocketUpgrade| async move {
                ws.protocols(["chat"]).on_upgrade(echo_socket).into_response()
            }),
        )
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    LocalService { addr, state }
}

pub struct TestAgent {
    pub agent: Arc<Agent>,
    pub handle: JoinHandle<Result<(), AgentError>>,
}

impl TestAgent {
    /// Drop the agent's connection without a `Disconnect`
    pub async fn kill(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

pub fn agent_config(
    relay: &RunningRelay,
    backend_id: &str,
    local: &LocalService,
    dir: &tempfile::TempDir,
) -> AgentConfig {
    AgentConfig {
        session_ticket_path: dir.path().join(format!("{}.ticket", backend_id)),
        max_backoff_secs: 1,
        ..relay.agent_config(backend_id, &local.address()).unwrap()
    }
}

pub fn spawn_agent(config: AgentConfig) -> TestAgent {
    let agent = Arc::new(Agent::new(config).unwrap());
    let runner = agent.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    TestAgent { agent, handle }
}

pub async fn start_agent(
    relay: &RunningRelay,
    backend_id: &str,
    local: &LocalService,
    dir: &tempfile::TempDir,
) -> TestAgent {
    let agent = spawn_agent(agent_config(relay, backend_id, local, dir));
    wait_registered(&agent.agent).await;
    agent
}

pub async fn wait_registered(agent: &Agent) -> ConnectionState {
    let mut state = agent.state();
    let registered = tokio::time::timeout(
        Duration::from_secs(10),
        state.wait_for(ConnectionState::is_registered),
    )
    .await
    .expect("agent did not register")
    .unwrap()
    .clone();
    registered
}

/// Poll `condition` every 20ms until it holds or `limit` passes
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}
