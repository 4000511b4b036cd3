use std::sync::Arc;

use async_stream::try_stream;
use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use super::connection::{Command, Connection, ConnectionState, Links};
use super::dispatcher::SocketDispatcher;
use super::envelope::{CounterReading, Request, Response, Timestamp, signal};
use super::error::WsError;
use super::events::{Origin, SocketEvent};
use super::traits::{Dispatcher, SessionValidator, Transport};
use super::transport::TungsteniteTransport;
use crate::Result;
use crate::config::Config;
use crate::session::{SecretString, Session};
use crate::validator::RestValidator;

/// Broadcast channel capacity for lifecycle events.
const BROADCAST_CAPACITY: usize = 1024;

/// The pluggable pieces a [`SocketManager`] talks to.
#[derive(Clone)]
pub struct Collaborators {
    transport: Arc<dyn Transport>,
    validator: Arc<dyn SessionValidator>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl Collaborators {
    pub fn new<T, V, D>(transport: T, validator: V, dispatcher: D) -> Self
    where
        T: Transport,
        V: SessionValidator,
        D: Dispatcher,
    {
        Self {
            transport: Arc::new(transport),
            validator: Arc::new(validator),
            dispatcher: Arc::new(dispatcher),
        }
    }

    /// Tungstenite sockets, a [`RestValidator`] against `rest_base` and a [`SocketDispatcher`].
    pub fn standard(rest_base: &str, config: &Config) -> Result<Self> {
        Ok(Self::new(
            TungsteniteTransport,
            RestValidator::new(rest_base, config.client_version())?,
            SocketDispatcher::default(),
        ))
    }
}

/// Handle to a persistent real-time socket.
///
/// The connection itself lives in a background task that owns all of its state. Every method
/// here only posts a command to that task, so calls never block and are applied in order.
/// Cloning the handle is cheap; the connection is torn down once [`SocketManager::destroy`]
/// is called or the last handle is dropped.
///
/// # Example
///
/// ```ignore
/// let session = Session::new("wss://sockets.example.com", Uuid::new_v4())?.with_token(token);
/// let collaborators = Collaborators::standard("https://api.example.com", &config)?;
/// let manager = SocketManager::new(session, config, collaborators);
///
/// let mut events = Box::pin(manager.events());
/// while let Some(event) = events.next().await {
///     println!("{:?}", event?);
/// }
/// ```
#[derive(Clone)]
pub struct SocketManager {
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<SocketEvent>,
}

impl SocketManager {
    /// Create the manager and start its connection task.
    ///
    /// Connects immediately if `session` is authenticated and online. Must be called from
    /// within a tokio runtime.
    #[must_use]
    pub fn new(session: Session, config: Config, collaborators: Collaborators) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let links = Links {
            transport: collaborators.transport,
            validator: collaborators.validator,
            dispatcher: collaborators.dispatcher,
        };
        let connection = Connection::new(
            session,
            config,
            links,
            commands.downgrade(),
            events.clone(),
            state_tx,
        );

        tokio::spawn(connection.run(commands_rx));

        Self {
            commands,
            state_rx,
            events,
        }
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_e| WsError::ConnectionClosed)?;
        Ok(())
    }

    /// Open a socket if the session is authenticated and online. An existing socket is
    /// replaced.
    pub fn connect(&self) -> Result<()> {
        self.command(Command::Connect(Origin::new("connect", "connect requested")))
    }

    /// Close the socket without scheduling a reconnect.
    pub fn close(&self) -> Result<()> {
        self.command(Command::Close)
    }

    /// Close and reopen. With `reset`, resync history is forgotten first.
    pub fn reconnect(&self, reset: bool) -> Result<()> {
        self.command(Command::Reconnect { reset })
    }

    /// Close the socket and stop the connection task. Later calls fail with
    /// [`WsError::ConnectionClosed`].
    pub fn destroy(&self) -> Result<()> {
        self.command(Command::Destroy)
    }

    /// Report a change in network reachability.
    pub fn set_online(&self, online: bool, reset: bool) -> Result<()> {
        self.command(Command::SetOnline { online, reset })
    }

    /// The session obtained (or refreshed) its token; connect with it.
    pub fn authenticated<S: Into<String>>(&self, token: S) -> Result<()> {
        self.command(Command::Authenticated(SecretString::from(token.into())))
    }

    /// The session lost its authentication; close and stay closed.
    pub fn unauthenticated(&self) -> Result<()> {
        self.command(Command::Unauthenticated)
    }

    /// Replay events from `from`, then catch presence up.
    ///
    /// Resolves once the replay chain this request joined has finished and presence has caught
    /// up. Fails with [`WsError::RequestFailed`] when the replay is given up on, and with
    /// [`WsError::NotConnected`] if the socket is closed on purpose first. A connection lost in
    /// between does not fail the call; the replay resumes on the next socket.
    pub async fn resync(&self, from: Timestamp) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Resync { from, reply })?;
        rx.await.map_err(|_e| WsError::ConnectionClosed)?
    }

    /// Ask for presence changes since `since` without replaying events.
    pub async fn sync_presence(&self, since: Timestamp) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::SyncPresence { since, reply })?;
        rx.await.map_err(|_e| WsError::ConnectionClosed)?
    }

    /// Read the server's current counter. Calls close together share one request.
    pub async fn get_counter(&self) -> Result<CounterReading> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::GetCounter(reply))?;
        rx.await.map_err(|_e| WsError::ConnectionClosed)?
    }

    /// Send a `signal` frame with `body`.
    pub fn send_signal(&self, body: &Value) -> Result<()> {
        self.send(&signal(body))
    }

    /// Send a raw frame.
    pub fn send<R: Serialize>(&self, frame: &R) -> Result<()> {
        if !self.state().is_open() {
            return Err(WsError::NotConnected.into());
        }
        let json = serde_json::to_string(frame)?;
        self.command(Command::Send(json))
    }

    /// Route a typed request through the dispatcher and wait for its reply.
    pub async fn request(&self, request: Request) -> Result<Response> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Request { request, reply })?;
        rx.await.map_err(|_e| WsError::ConnectionClosed)?
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
        self.events.subscribe()
    }

    /// Lifecycle events as a stream. The stream ends with [`WsError::Lagged`] if the consumer
    /// falls too far behind.
    pub fn events(&self) -> impl Stream<Item = Result<SocketEvent>> + use<> {
        let mut rx = self.events.subscribe();

        try_stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Socket event subscriber lagged, missed {n} events");
                        Err(WsError::Lagged { count: n })?;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
}
