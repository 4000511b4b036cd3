//! Persistent real-time socket.
//!
//! A [`SocketManager`] keeps one socket to the event service open for as long as the owning
//! session is authenticated and online. It reconnects after failures with jittered backoff,
//! checks the session over REST before each scheduled reconnect, detects gaps in the event
//! stream and replays what was missed, then catches presence up.
//!
//! # Architecture
//!
//! - [`SocketManager`]: cloneable handle; every operation is a command to the connection task
//! - [`Transport`]: opens sockets ([`TungsteniteTransport`] by default)
//! - [`Dispatcher`]: typed request/response routing ([`SocketDispatcher`] by default)
//! - [`SessionValidator`]: pre-reconnect session check ([`crate::validator::RestValidator`])
//!
//! Lifecycle changes are published as [`SocketEvent`]s; the current [`ConnectionState`] is
//! always available from [`SocketManager::state`].

pub mod connection;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod events;
mod keepalive;
pub mod manager;
mod resync;
mod timers;
pub mod traits;
pub mod transport;

pub use connection::ConnectionState;
pub use dispatcher::SocketDispatcher;
pub use envelope::{CounterReading, Envelope, Method, Request, Response, Timestamp};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use events::{Origin, SocketEvent};
pub use manager::{Collaborators, SocketManager};
pub use traits::*;
pub use transport::{ConnectRequest, HandleId, Outbound, Socket, SocketEvents, TungsteniteTransport};
