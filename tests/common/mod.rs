use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

const KICK: &str = "__kick__";

struct PushState {
    received: Mutex<Vec<serde_json::Value>>,
    outbound: broadcast::Sender<String>,
    connections: AtomicUsize,
    accepted: AtomicUsize,
}

/// In-process WebSocket server that records client frames and can push
/// frames to every connected client.
pub struct MockPushServer {
    pub addr: SocketAddr,
    state: Arc<PushState>,
}

#[allow(dead_code)]
impl MockPushServer {
    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn received(&self) -> Vec<serde_json::Value> {
        self.state.received.lock().unwrap().clone()
    }

    /// Frames whose `event` field equals `name`.
    pub fn received_events(&self, name: &str) -> Vec<serde_json::Value> {
        self.received()
            .into_iter()
            .filter(|f| f["event"] == name)
            .collect()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn push(&self, event: &str, data: serde_json::Value) {
        let frame = serde_json::json!({"event": event, "data": data}).to_string();
        let _ = self.state.outbound.send(frame);
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.state.outbound.send(text.to_string());
    }

    /// Close every open connection from the server side.
    pub fn kick_all(&self) {
        let _ = self.state.outbound.send(KICK.to_string());
    }
}

#[allow(dead_code)]
pub async fn spawn_push_server() -> MockPushServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    serve_push(listener).await
}

#[allow(dead_code)]
pub async fn spawn_push_server_on(addr: SocketAddr) -> MockPushServer {
    let listener = TcpListener::bind(addr).await.unwrap();
    serve_push(listener).await
}

async fn serve_push(listener: TcpListener) -> MockPushServer {
    let addr = listener.local_addr().unwrap();
    let (outbound, _) = broadcast::channel(64);
    let state = Arc::new(PushState {
        received: Mutex::new(Vec::new()),
        outbound,
        connections: AtomicUsize::new(0),
        accepted: AtomicUsize::new(0),
    });

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(Arc::clone(&state));

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockPushServer { addr, state }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<PushState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<PushState>) {
    state.accepted.fetch_add(1, Ordering::SeqCst);
    state.connections.fetch_add(1, Ordering::SeqCst);
    let mut outbound = state.outbound.subscribe();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let value = serde_json::from_str(&text)
                        .unwrap_or(serde_json::Value::String(text));
                    state.received.lock().unwrap().push(value);
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            out = outbound.recv() => match out {
                Ok(text) if text == KICK => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
                Ok(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    state.connections.fetch_sub(1, Ordering::SeqCst);
}

/// Poll `cond` every 10ms until it holds or `timeout` passes.
#[allow(dead_code)]
pub async fn wait_until<F>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// An address nothing is listening on.
#[allow(dead_code)]
pub fn unused_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}
