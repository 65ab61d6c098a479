//! WebSocket transport for the realtime API
//!
//! Each connection runs in one spawned task that owns both halves of the
//! socket: it performs the handshake, forwards queued outbound frames and
//! reports every inbound frame as a [`TransportEvent`].

use crate::error::{Result, VoiceError};
use crate::transport::{
    ConnectRequest, Connection, Connector, TransportCommand, TransportEvent, WireMessage,
};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, Request};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Opens realtime sessions over `ws://` / `wss://`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WsConnector {
    fn open(&self, request: ConnectRequest) -> Connection {
        let (connection, commands, events) = Connection::pair();
        tokio::spawn(run_connection(request, commands, events));
        connection
    }
}

fn build_request(request: &ConnectRequest) -> Result<Request<()>> {
    let mut http_request = request.url().into_client_request()?;
    for (name, value) in request.headers() {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| VoiceError::Transport(format!("invalid header name {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| VoiceError::Transport(format!("invalid value for header {}: {}", name, e)))?;
        http_request.headers_mut().insert(name, value);
    }
    Ok(http_request)
}

async fn run_connection(
    request: ConnectRequest,
    mut commands: UnboundedReceiver<TransportCommand>,
    events: UnboundedSender<TransportEvent>,
) {
    info!("Connecting to realtime endpoint at {}", request.url());

    let http_request = match build_request(&request) {
        Ok(r) => r,
        Err(e) => {
            error!("Invalid connect request: {}", e);
            let _ = events.send(TransportEvent::Failed(e.to_string()));
            return;
        }
    };

    let ws_stream = match connect_async(http_request).await {
        Ok((ws_stream, resp)) => {
            debug!("WebSocket connection response: {:?}", resp.status());
            ws_stream
        }
        Err(e) => {
            error!("WebSocket connect failed: {}", e);
            let _ = events.send(TransportEvent::Failed(format!("connect failed: {}", e)));
            return;
        }
    };

    if events.send(TransportEvent::Opened).is_err() {
        // Session went away while we were connecting
        return;
    }
    info!("Connected to realtime endpoint");

    let (mut sink, mut stream) = ws_stream.split();

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(TransportCommand::Send(message)) => {
                        let frame = match message {
                            WireMessage::Text(text) => Message::text(text),
                            WireMessage::Binary(bytes) => Message::binary(bytes),
                        };
                        if let Err(e) = sink.send(frame).await {
                            error!("WebSocket send failed: {}", e);
                            let _ = events.send(TransportEvent::Failed(format!("send failed: {}", e)));
                            break;
                        }
                    }
                    Some(TransportCommand::Close) | None => {
                        debug!("Closing WebSocket at session request");
                        if let Err(e) = sink.close().await {
                            debug!("WebSocket close: {}", e);
                        }
                        break;
                    }
                }
            }

            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        let _ = events.send(TransportEvent::Message(WireMessage::Text(text.as_str().to_string())));
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        debug!("Received binary message ({} bytes)", bytes.len());
                        let _ = events.send(TransportEvent::Message(WireMessage::Binary(bytes.to_vec())));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("WebSocket closed: {:?}", frame);
                        let reason = frame
                            .map(|f| f.reason.as_str().to_string())
                            .filter(|r| !r.is_empty());
                        let _ = events.send(TransportEvent::Closed { reason });
                        break;
                    }
                    Some(Ok(_)) => {
                        // Ping/pong and raw frames
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        let _ = events.send(TransportEvent::Failed(e.to_string()));
                        break;
                    }
                    None => {
                        info!("WebSocket stream ended");
                        let _ = events.send(TransportEvent::Closed { reason: None });
                        break;
                    }
                }
            }
        }
    }

    debug!("Connection task terminated");
}
