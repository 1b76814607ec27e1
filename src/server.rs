//! Transport listener
//!
//! Accepts TCP connections, upgrades them to WebSocket, and hands each one to
//! the [`RelayEngine`] as a stream of decoded envelopes plus a sink of
//! outbound messages. One task per connection; the accept loop itself never
//! stops on a per-connection or accept failure.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{future, stream, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::model::envelope::{DecodeError, Envelope};
use crate::model::propagated::{CloseReason, Propagated};
use crate::registry::SessionRegistry;
use crate::relay::RelayEngine;

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Handle returned by [`start_relay`] to control the running server.
pub struct RelayHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), RelayError>>,
    registry: Arc<SessionRegistry>,
}

impl RelayHandle {
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Signal the relay to stop and wait for it to shut down.
    pub async fn stop(self) -> Result<(), RelayError> {
        let _ = self.shutdown.send(true);
        self.task.await?
    }
}

/// Bind the listen address and run the relay on a background task. Returns
/// the handle and the actual bound address (port 0 lets the OS pick one).
pub async fn start_relay(config: RelayConfig) -> Result<(RelayHandle, SocketAddr), RelayError> {
    config.validate()?;

    let listener = TcpListener::bind(config.listen).await?;
    let addr = listener.local_addr()?;

    let registry = Arc::new(SessionRegistry::new(config.registry_options()));
    let engine = RelayEngine::new(registry.clone(), config.engine_options());
    let (shutdown, shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(run_with_shutdown(
        listener,
        engine,
        config.max_message_size,
        shutdown_rx,
    ));

    Ok((
        RelayHandle {
            shutdown,
            task,
            registry,
        },
        addr,
    ))
}

/// Serve on an already bound listener until Ctrl-C.
pub async fn run(listener: TcpListener, config: &RelayConfig) -> Result<(), RelayError> {
    config.validate()?;

    let registry = Arc::new(SessionRegistry::new(config.registry_options()));
    let engine = RelayEngine::new(registry, config.engine_options());
    let (shutdown, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C"),
            Err(e) => error!("failed to listen for Ctrl-C: {}", e),
        }
        let _ = shutdown.send(true);
    });

    run_with_shutdown(listener, engine, config.max_message_size, shutdown_rx).await
}

/// Accept loop. Runs until `shutdown` flips or its sender is dropped, then
/// tears down every open connection.
pub async fn run_with_shutdown(
    listener: TcpListener,
    engine: RelayEngine,
    max_message_size: usize,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), RelayError> {
    let local_addr = listener.local_addr()?;
    info!("Signaling relay listening on ws://{}", local_addr);

    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, addr)) => {
                    debug!("Accepted TCP connection from {}", addr);
                    connections.spawn(handle_connection(
                        stream,
                        addr,
                        engine.clone(),
                        max_message_size,
                    ));
                }
                Err(e) => {
                    error!("failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },

            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                reap_connection(joined);
            }

            _ = shutdown.changed() => {
                info!("Shutting down, closing {} connections", connections.len());
                break;
            }
        }
    }

    connections.shutdown().await;
    Ok(())
}

/// Upgrade one TCP stream and serve it until it ends.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    engine: RelayEngine,
    max_message_size: usize,
) {
    let ws_config = WebSocketConfig {
        max_message_size: Some(max_message_size),
        max_frame_size: Some(max_message_size),
        ..WebSocketConfig::default()
    };

    let ws = match tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };

    let (ws_tx, ws_rx) = ws.split();

    let inbound = Box::pin(
        ws_rx
            .map(move |msg| inbound_frame(addr, msg))
            .take_while(|frame| future::ready(!matches!(frame, Inbound::End)))
            .filter_map(|frame| {
                future::ready(match frame {
                    Inbound::Frame(decoded) => Some(decoded),
                    Inbound::Skip | Inbound::End => None,
                })
            }),
    );

    let outbound = Box::pin(
        ws_tx.with_flat_map(|msg: Propagated| stream::iter(frames_for(msg).into_iter().map(Ok))),
    );

    let reason = engine.serve(inbound, outbound).await;
    debug!("Connection from {} ended: {}", addr, reason);
}

/// What one read from the socket means for the relay engine.
enum Inbound {
    Frame(Result<Envelope, DecodeError>),
    Skip,
    End,
}

/// Frames that violate the WebSocket protocol (oversized, invalid UTF-8,
/// bad framing) are decode errors; a closed or broken transport ends the
/// stream.
fn inbound_frame(addr: SocketAddr, msg: Result<Message, WsError>) -> Inbound {
    match msg {
        Ok(Message::Text(text)) => Inbound::Frame(Envelope::decode(text.as_bytes())),
        Ok(Message::Binary(data)) => Inbound::Frame(Envelope::decode(&data)),
        Ok(Message::Close(_)) => Inbound::End,
        // Ping replies are handled by the WebSocket layer.
        Ok(_) => Inbound::Skip,
        // Peer dropped TCP without a close frame.
        Err(WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)) => Inbound::End,
        Err(e @ (WsError::Capacity(_) | WsError::Utf8 | WsError::Protocol(_))) => {
            Inbound::Frame(Err(DecodeError::Malformed(e.to_string())))
        }
        Err(e) => {
            debug!("read from {} failed: {}", addr, e);
            Inbound::End
        }
    }
}

/// Log a connection task that panicked. Returns whether it ended cleanly.
fn reap_connection(joined: Result<(), JoinError>) -> bool {
    match joined {
        Ok(()) => true,
        Err(e) => {
            error!("connection task failed: {}", e);
            false
        }
    }
}

/// WebSocket frames carrying one outbound message. A close notice is followed
/// by a close frame naming the same reason.
fn frames_for(msg: Propagated) -> Vec<Message> {
    let text = Message::Text(msg.encode());
    match msg {
        Propagated::Close(reason) => vec![
            text,
            Message::Close(Some(CloseFrame {
                code: close_code(reason),
                reason: reason.as_str().into(),
            })),
        ],
        _ => vec![text],
    }
}

fn close_code(reason: CloseReason) -> CloseCode {
    match reason {
        CloseReason::RoleSuperseded => CloseCode::Library(4000),
        CloseReason::ProtocolError => CloseCode::Protocol,
        CloseReason::SlowConsumer => CloseCode::Again,
    }
}
