#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use rover_signal::model::client::ClientId;
use rover_signal::model::envelope::Role;
use rover_signal::model::propagated::{decode_server_frame, Propagated};
use rover_signal::{start_relay, RelayConfig, RelayHandle};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::Frame;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

pub fn test_config() -> RelayConfig {
    RelayConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        ..RelayConfig::default()
    }
}

pub async fn start(config: RelayConfig) -> (RelayHandle, SocketAddr) {
    start_relay(config).await.unwrap()
}

/// Poll until `cond` holds, for up to one second.
pub async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}

pub struct TestClient {
    pub id: ClientId,
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    pub close_frame: Option<CloseFrame<'static>>,
}

impl TestClient {
    pub async fn connect(addr: &SocketAddr) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        let mut client = TestClient {
            id: ClientId::from(0),
            ws,
            close_frame: None,
        };
        match client.recv().await {
            Some(Propagated::Welcome(id)) => client.id = id,
            other => panic!("expected Welcome, got {other:?}"),
        }
        client
    }

    pub async fn send_json(&mut self, value: Value) {
        self.send_text(&value.to_string()).await;
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws.send(Message::Text(text.to_string())).await.unwrap();
    }

    /// Send a hand-built frame, bypassing the client's own validation.
    pub async fn send_frame(&mut self, frame: Frame) {
        self.ws.send(Message::Frame(frame)).await.unwrap();
    }

    /// Declare `role` and wait until the relay has recorded it.
    pub async fn declare(&mut self, relay: &RelayHandle, role: Role) {
        self.send_json(json!({ "type": "RoleDeclare", "role": role.as_str() }))
            .await;
        let id = self.id;
        wait_for(|| relay.registry().state_of(id).and_then(|s| s.role()) == Some(role)).await;
    }

    /// Next relay message, or `None` once the relay closed the socket. A close
    /// frame is kept in `close_frame`.
    pub async fn recv(&mut self) -> Option<Propagated> {
        loop {
            let frame = timeout(Duration::from_secs(2), self.ws.next())
                .await
                .expect("timed out waiting for a frame");
            match frame {
                Some(Ok(Message::Text(text))) => {
                    return Some(decode_server_frame(text.as_bytes()).unwrap())
                }
                Some(Ok(Message::Close(frame))) => {
                    self.close_frame = frame;
                    return None;
                }
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return None,
            }
        }
    }

    /// Nothing arrives within a short window.
    pub async fn assert_quiet(&mut self) {
        let got = timeout(Duration::from_millis(100), self.ws.next()).await;
        assert!(got.is_err(), "unexpected frame: {got:?}");
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
