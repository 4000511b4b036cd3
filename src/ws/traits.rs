//! Seams between the connection engine and its collaborators.
//!
//! - [`Transport`]: opens sockets and reports their lifecycle
//! - [`Dispatcher`]: turns a typed [`Request`] into a wire frame and matches the reply
//! - [`SessionValidator`]: REST reachability check made before every scheduled reconnect

use async_trait::async_trait;
use secrecy::SecretString;

use super::envelope::{Envelope, Request, Response};
use super::transport::{ConnectRequest, Outbound, Socket, SocketEvents};
use crate::error::StatusCode;

/// Opens sockets on behalf of the connection engine.
///
/// # Example
///
/// ```ignore
/// impl Transport for LoopbackTransport {
///     fn open(&self, request: ConnectRequest, events: SocketEvents) -> Socket {
///         let (tx, rx) = mpsc::unbounded_channel();
///         let shutdown = CancellationToken::new();
///         tokio::spawn(loopback(rx, events, shutdown.clone()));
///         Socket::new(tx, shutdown)
///     }
/// }
/// ```
pub trait Transport: Send + Sync + 'static {
    /// Start opening a socket for `request` without blocking.
    ///
    /// Lifecycle signals must be reported through `events` in the order the underlying
    /// connection produces them. The returned [`Socket`] is cancelled when the engine is done
    /// with it; after that any further signals are ignored.
    fn open(&self, request: ConnectRequest, events: SocketEvents) -> Socket;
}

/// Request/response correlation over the live socket.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    /// Send `request` through `outbound` and resolve once its reply arrives.
    async fn request(&self, outbound: Outbound, request: Request) -> crate::Result<Response>;

    /// Offered every inbound frame after counter bookkeeping. Returns `true` when the frame was
    /// the reply to an outstanding request.
    fn handle_inbound(&self, envelope: &Envelope) -> bool {
        _ = envelope;
        false
    }
}

/// Outcome of the reachability check made before a scheduled reconnect.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// Service reachable and the session token accepted
    Authorized,
    /// Session token rejected; the external authentication flow takes over
    Unauthenticated,
    /// Anything else
    Failed {
        status: Option<StatusCode>,
        reason: String,
    },
}

#[async_trait]
pub trait SessionValidator: Send + Sync + 'static {
    async fn validate(&self, token: SecretString) -> Validation;
}
