#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use wormhole::config::{DuplicatePolicy, ServerConfig};
use wormhole::server::ServerState;
use wormhole_common::envelope::{ping_envelope, register_envelope};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen,
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        path: "/".to_string(),
        max_conns: 1000,
        max_conns_ip: 1000,
        max_frame_chars: 102_400,
        msg_rate: 10_000,
        bw_rate: 1 << 30,
        ping_interval: 30,
        idle_timeout: 300,
        send_queue: 256,
        duplicate_registration: DuplicatePolicy::Reject,
    }
}

pub struct TestClient {
    pub ws_tx: futures_util::stream::SplitSink<WsStream, Message>,
    pub ws_rx: futures_util::stream::SplitStream<WsStream>,
}

impl TestClient {
    pub async fn connect(addr: &SocketAddr) -> Self {
        let url = format!("ws://{addr}/");
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let (ws_tx, ws_rx) = ws.split();
        Self { ws_tx, ws_rx }
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws_tx
            .send(Message::Text(text.to_string()))
            .await
            .unwrap();
    }

    /// Register and wait until the relay has processed it.
    ///
    /// A ping sent after the registration is echoed only once the
    /// registration ahead of it on the same connection was handled.
    pub async fn register(&mut self, id: &str) {
        self.send_text(&register_envelope(id)).await;
        self.sync().await;
    }

    pub async fn sync(&mut self) {
        let ping = ping_envelope("sync");
        self.send_text(&ping).await;
        assert_eq!(self.recv_text().await, ping);
    }

    pub async fn recv_text(&mut self) -> String {
        self.recv_text_timeout(RECV_TIMEOUT)
            .await
            .expect("timeout waiting for text frame")
    }

    /// Next text frame, skipping transport ping/pong. Panics on close.
    pub async fn recv_text_timeout(&mut self, timeout: Duration) -> Option<String> {
        let result = tokio::time::timeout(timeout, async {
            loop {
                let msg = self.ws_rx.next().await.unwrap().unwrap();
                match msg {
                    Message::Text(text) => return text,
                    Message::Ping(_) | Message::Pong(_) => {}
                    other => panic!("expected text frame, got {other:?}"),
                }
            }
        })
        .await;
        result.ok()
    }

    /// Wait for the server's close frame. Panics if a text frame arrives first.
    pub async fn recv_close(&mut self) -> Option<CloseFrame<'static>> {
        tokio::time::timeout(RECV_TIMEOUT, async {
            while let Some(msg) = self.ws_rx.next().await {
                match msg {
                    Ok(Message::Close(frame)) => return frame,
                    Ok(Message::Text(text)) => panic!("expected close, got text {text}"),
                    Ok(_) => {}
                    Err(_) => return None,
                }
            }
            None
        })
        .await
        .expect("timeout waiting for close")
    }

    pub async fn close(mut self) {
        let _ = self.ws_tx.send(Message::Close(None)).await;
        while let Ok(Some(Ok(_))) =
            tokio::time::timeout(Duration::from_secs(1), self.ws_rx.next()).await
        {}
    }
}

pub async fn start_server_with(
    configure: impl FnOnce(&mut ServerConfig),
) -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = test_config(addr);
    configure(&mut config);
    assert!(config.validate().is_ok());
    let state = Arc::new(ServerState::new(config));

    let state_clone = state.clone();
    tokio::spawn(async move {
        if let Err(e) = wormhole::run(listener, state_clone).await {
            eprintln!("server error in test: {e}");
        }
    });

    (addr, state)
}

pub async fn start_server() -> (SocketAddr, Arc<ServerState>) {
    start_server_with(|_| {}).await
}

/// Poll until the registry holds exactly `expected` bindings.
pub async fn wait_for_bindings(state: &ServerState, expected: usize) {
    tokio::time::timeout(RECV_TIMEOUT, async {
        while state.registry().len() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "registry holds {} bindings, expected {expected}",
            state.registry().len()
        )
    });
}
