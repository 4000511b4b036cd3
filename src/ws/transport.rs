//! Socket handles and the default tungstenite-backed [`Transport`].

use std::fmt;

use futures::{SinkExt as _, StreamExt as _};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::handshake::client::Request as HandshakeRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::connection::{Command, SocketSignal};
use super::error::WsError;
use super::traits::Transport;
use crate::Result;
use crate::error::Error;

/// Identifies one socket created by the manager. Signals carrying an older handle are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub(crate) u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a [`Transport`] needs to open a socket.
#[non_exhaustive]
#[derive(Clone)]
pub struct ConnectRequest {
    /// Full connect URL including the session token
    pub url: Url,
    /// Subprotocol to request, empty for none
    pub protocol: String,
}

impl ConnectRequest {
    #[must_use]
    pub fn new(url: Url, protocol: String) -> Self {
        Self { url, protocol }
    }
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut redacted = self.url.clone();
        redacted.set_query(None);
        f.debug_struct("ConnectRequest")
            .field("url", &redacted.as_str())
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// Lifecycle sink handed to a [`Transport`] for one socket.
///
/// Every method returns `false` once the manager is gone, at which point the transport
/// should stop driving the socket.
#[derive(Debug, Clone)]
pub struct SocketEvents {
    handle: HandleId,
    mailbox: mpsc::WeakUnboundedSender<Command>,
}

impl SocketEvents {
    pub(crate) fn new(handle: HandleId, mailbox: mpsc::WeakUnboundedSender<Command>) -> Self {
        Self { handle, mailbox }
    }

    #[must_use]
    pub fn handle(&self) -> HandleId {
        self.handle
    }

    pub fn opened(&self) -> bool {
        self.emit(SocketSignal::Opened)
    }

    pub fn message<S: Into<String>>(&self, text: S) -> bool {
        self.emit(SocketSignal::Message(text.into()))
    }

    pub fn closed(&self) -> bool {
        self.emit(SocketSignal::Closed)
    }

    pub fn error<S: Into<String>>(&self, reason: S) -> bool {
        self.emit(SocketSignal::Error(reason.into()))
    }

    fn emit(&self, signal: SocketSignal) -> bool {
        let Some(mailbox) = self.mailbox.upgrade() else {
            return false;
        };
        mailbox
            .send(Command::Socket {
                handle: self.handle,
                signal,
            })
            .is_ok()
    }
}

/// Cloneable writer for the text frames of one socket.
#[derive(Debug, Clone)]
pub struct Outbound {
    sender: mpsc::UnboundedSender<String>,
}

impl Outbound {
    pub fn send_text(&self, text: String) -> Result<()> {
        self.sender
            .send(text)
            .map_err(|_e| WsError::NotConnected)?;
        Ok(())
    }

    pub fn send_json<T: Serialize>(&self, frame: &T) -> Result<()> {
        let json = serde_json::to_string(frame)?;
        self.send_text(json)
    }
}

/// One socket as seen by the manager: a frame writer plus a shutdown switch.
#[derive(Debug)]
pub struct Socket {
    outbound: Outbound,
    shutdown: CancellationToken,
}

impl Socket {
    #[must_use]
    pub fn new(sender: mpsc::UnboundedSender<String>, shutdown: CancellationToken) -> Self {
        Self {
            outbound: Outbound { sender },
            shutdown,
        }
    }

    #[must_use]
    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    pub(crate) fn close(&self) {
        self.shutdown.cancel();
    }
}

/// [`Transport`] over `tokio-tungstenite`. Each socket is driven by its own task.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteTransport;

impl Transport for TungsteniteTransport {
    fn open(&self, request: ConnectRequest, events: SocketEvents) -> Socket {
        let (sender, outbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        tokio::spawn(drive(request, events, outbound_rx, shutdown.clone()));

        Socket::new(sender, shutdown)
    }
}

fn handshake_request(request: &ConnectRequest) -> Result<HandshakeRequest> {
    let mut handshake = request.url.as_str().into_client_request()?;
    if !request.protocol.is_empty() {
        let protocol = HeaderValue::from_str(&request.protocol)
            .map_err(|e| Error::validation(format!("invalid subprotocol: {e}")))?;
        handshake
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, protocol);
    }
    Ok(handshake)
}

async fn drive(
    request: ConnectRequest,
    events: SocketEvents,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    shutdown: CancellationToken,
) {
    let handshake = match handshake_request(&request) {
        Ok(handshake) => handshake,
        Err(e) => {
            events.error(e.to_string());
            return;
        }
    };

    tracing::debug!(handle = %events.handle(), ?request, "Opening websocket");

    let ws_stream = tokio::select! {
        () = shutdown.cancelled() => return,
        result = connect_async(handshake) => match result {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                events.error(e.to_string());
                return;
            }
        },
    };

    if !events.opened() {
        return;
    }

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                _ = write.send(Message::Close(None)).await;
                break;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        tracing::trace!(%text, "Received WebSocket text message");
                        if !events.message(text.as_str()) {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        events.closed();
                        break;
                    }
                    Some(Err(e)) => {
                        events.error(e.to_string());
                        break;
                    }
                    Some(Ok(_)) => {
                        // Binary frames and control frames carry nothing for the manager.
                    }
                }
            }

            Some(text) = outbound_rx.recv() => {
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    events.error(e.to_string());
                    break;
                }
            }
        }
    }
}
