//! Duplex transport interface
//!
//! The session never touches sockets directly. A [`Connector`] opens a
//! [`Connection`]: a command sender for outbound frames plus a channel of
//! [`TransportEvent`]s that reports open, inbound frames, close and failure
//! in order.

use crate::error::{Result, VoiceError};
use std::fmt;
use tokio::sync::mpsc;

/// Endpoint and handshake headers for a new connection.
#[derive(Clone)]
pub struct ConnectRequest {
    url: String,
    headers: Vec<(String, String)>,
}

impl ConnectRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Case-insensitive header lookup.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers: Vec<(&str, &str)> = self
            .headers
            .iter()
            .map(|(k, v)| {
                if k.eq_ignore_ascii_case("authorization") {
                    (k.as_str(), "<redacted>")
                } else {
                    (k.as_str(), v.as_str())
                }
            })
            .collect();
        f.debug_struct("ConnectRequest")
            .field("url", &self.url)
            .field("headers", &headers)
            .finish()
    }
}

/// A discrete frame on the connection
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Everything the transport reports back, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Handshake finished; frames may flow.
    Opened,
    Message(WireMessage),
    /// Peer closed the connection or the stream ended.
    Closed { reason: Option<String> },
    /// Connect, send or receive failure. No further events follow.
    Failed(String),
}

/// Requests from the session to the transport task
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCommand {
    Send(WireMessage),
    Close,
}

/// Sending half of an open connection.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    commands: mpsc::UnboundedSender<TransportCommand>,
}

impl TransportHandle {
    pub fn new(commands: mpsc::UnboundedSender<TransportCommand>) -> Self {
        Self { commands }
    }

    /// Queue a frame. Fails once the transport task has gone away.
    pub fn send(&self, message: WireMessage) -> Result<()> {
        self.commands
            .send(TransportCommand::Send(message))
            .map_err(|_| VoiceError::ConnectionClosed)
    }

    pub fn close(&self) {
        let _ = self.commands.send(TransportCommand::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// An opened (or opening) connection.
#[derive(Debug)]
pub struct Connection {
    pub handle: TransportHandle,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Connection {
    /// Create both ends: the connection for the session and the raw channel
    /// ends a transport implementation drives.
    pub fn pair() -> (
        Connection,
        mpsc::UnboundedReceiver<TransportCommand>,
        mpsc::UnboundedSender<TransportEvent>,
    ) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let connection = Connection {
            handle: TransportHandle::new(command_tx),
            events: event_rx,
        };
        (connection, command_rx, event_tx)
    }
}

/// Opens duplex connections.
///
/// `open` returns immediately; the outcome of the handshake arrives as the
/// first [`TransportEvent`]. Implementations may spawn onto the current
/// tokio runtime.
pub trait Connector: Send + Sync {
    fn open(&self, request: ConnectRequest) -> Connection;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Channel-backed connector for driving sessions in tests

    use super::*;
    use std::sync::{Arc, Mutex};

    /// Far end of a mock connection, held by the test.
    pub struct MockRemote {
        pub request: ConnectRequest,
        pub commands: mpsc::UnboundedReceiver<TransportCommand>,
        pub events: mpsc::UnboundedSender<TransportEvent>,
    }

    impl MockRemote {
        pub fn open(&self) {
            let _ = self.events.send(TransportEvent::Opened);
        }

        pub fn send_json(&self, value: serde_json::Value) {
            let _ = self
                .events
                .send(TransportEvent::Message(WireMessage::Text(value.to_string())));
        }

        pub fn fail(&self, reason: &str) {
            let _ = self.events.send(TransportEvent::Failed(reason.to_string()));
        }

        /// Next frame the session sent, parsed as JSON.
        pub async fn next_sent(&mut self) -> Option<serde_json::Value> {
            loop {
                match self.commands.recv().await? {
                    TransportCommand::Send(WireMessage::Text(text)) => {
                        return serde_json::from_str(&text).ok();
                    }
                    TransportCommand::Send(WireMessage::Binary(_)) => continue,
                    TransportCommand::Close => return None,
                }
            }
        }

        /// Everything sent so far without waiting.
        pub fn drain_sent(&mut self) -> Vec<TransportCommand> {
            let mut out = Vec::new();
            while let Ok(cmd) = self.commands.try_recv() {
                out.push(cmd);
            }
            out
        }
    }

    #[derive(Clone, Default)]
    pub struct MockConnector {
        remotes: Arc<Mutex<Vec<MockRemote>>>,
    }

    impl MockConnector {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn opened(&self) -> usize {
            self.remotes.lock().unwrap().len()
        }

        /// Take the far end of the most recent connection.
        pub fn take_remote(&self) -> Option<MockRemote> {
            self.remotes.lock().unwrap().pop()
        }
    }

    impl Connector for MockConnector {
        fn open(&self, request: ConnectRequest) -> Connection {
            let (connection, commands, events) = Connection::pair();
            self.remotes.lock().unwrap().push(MockRemote {
                request,
                commands,
                events,
            });
            connection
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_authorization() {
        let request = ConnectRequest::new("wss://example.test")
            .header("Authorization", "Bearer secret")
            .header("OpenAI-Beta", "realtime=v1");
        let debug = format!("{:?}", request);
        assert!(!debug.contains("secret"));
        assert!(debug.contains("realtime=v1"));
        assert_eq!(request.header_value("authorization"), Some("Bearer secret"));
    }

    #[tokio::test]
    async fn test_handle_send_after_transport_gone() {
        let (connection, command_rx, _events) = Connection::pair();
        drop(command_rx);
        assert!(connection.handle.is_closed());
        assert!(matches!(
            connection.handle.send(WireMessage::Text("x".into())),
            Err(VoiceError::ConnectionClosed)
        ));
    }
}
