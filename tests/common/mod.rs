#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Not every test binary uses every helper"
)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, TimeZone as _, Utc};
use rtc_socket::Result;
use rtc_socket::config::Config;
use rtc_socket::session::{SecretString, Session, Uuid};
use rtc_socket::ws::{
    Collaborators, ConnectRequest, Dispatcher, Method, Outbound, Request, Response,
    SessionValidator, Socket, SocketEvent, SocketEvents, SocketManager, Timestamp, Transport,
    Validation, WsError,
};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

pub const ENDPOINT: &str = "wss://sockets.example.com/ws";
pub const TOKEN: &str = "session-token";
pub const CLIENT_ID: Uuid = Uuid::nil();

/// `2024-01-01T00:00:00Z` plus `seconds`.
#[must_use]
pub fn at(seconds: i64) -> Timestamp {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + TimeDelta::seconds(seconds)
}

/// A `change` frame as the server sends it.
#[must_use]
pub fn frame(counter: u64, seconds: i64) -> String {
    json!({
        "counter": counter,
        "timestamp": at(seconds),
        "type": "change",
        "body": { "object": "messages" },
    })
    .to_string()
}

/// Route manager logs to the test output, filtered by `RUST_LOG`.
pub fn init_tracing() {
    drop(
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init(),
    );
}

#[must_use]
pub fn authenticated_session() -> Session {
    Session::new(ENDPOINT, CLIENT_ID).unwrap().with_token(TOKEN)
}

/// Socket handed out by [`MockTransport`]; the test drives its lifecycle.
pub struct OpenedSocket {
    pub request: ConnectRequest,
    pub events: SocketEvents,
    pub outbound: mpsc::UnboundedReceiver<String>,
    pub shutdown: CancellationToken,
}

impl OpenedSocket {
    pub fn open(&self) {
        assert!(self.events.opened(), "manager should still be alive");
    }

    pub fn message(&self, text: &str) {
        assert!(self.events.message(text), "manager should still be alive");
    }

    pub fn close(&self) {
        self.events.closed();
    }

    pub fn fail(&self, reason: &str) {
        self.events.error(reason);
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[derive(Clone)]
pub struct MockTransport {
    opened: mpsc::UnboundedSender<OpenedSocket>,
}

impl Transport for MockTransport {
    fn open(&self, request: ConnectRequest, events: SocketEvents) -> Socket {
        let (tx, outbound) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        drop(self.opened.send(OpenedSocket {
            request,
            events,
            outbound,
            shutdown: shutdown.clone(),
        }));

        Socket::new(tx, shutdown)
    }
}

/// Request captured by [`MockDispatcher`]; the test decides how it completes.
pub struct PendingRequest {
    pub request: Request,
    reply: oneshot::Sender<Result<Response>>,
}

impl PendingRequest {
    #[must_use]
    pub fn method(&self) -> Method {
        self.request.method
    }

    pub fn succeed(self, data: Value) {
        drop(self.reply.send(Ok(Response::new(data, None))));
    }

    pub fn fail(self, reason: &str) {
        drop(self.reply.send(Err(WsError::RequestFailed {
            method: self.request.method,
            reason: reason.to_owned(),
        }
        .into())));
    }

    /// Whether the manager stopped waiting for this request.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }
}

#[derive(Clone)]
pub struct MockDispatcher {
    requests: mpsc::UnboundedSender<PendingRequest>,
}

#[async_trait]
impl Dispatcher for MockDispatcher {
    async fn request(&self, _outbound: Outbound, request: Request) -> Result<Response> {
        let method = request.method;
        let (reply, rx) = oneshot::channel();
        drop(self.requests.send(PendingRequest { request, reply }));
        rx.await.map_err(|_e| WsError::Cancelled(method))?
    }
}

/// Answers every validation with the configured outcome.
#[derive(Clone)]
pub struct MockValidator {
    outcome: Arc<Mutex<Validation>>,
    calls: Arc<AtomicUsize>,
}

impl Default for MockValidator {
    fn default() -> Self {
        Self {
            outcome: Arc::new(Mutex::new(Validation::Authorized)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl MockValidator {
    pub fn respond_with(&self, outcome: Validation) {
        *self.outcome.lock().unwrap() = outcome;
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionValidator for MockValidator {
    async fn validate(&self, _token: SecretString) -> Validation {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcome.lock().unwrap().clone()
    }
}

/// A manager wired to in-memory collaborators.
pub struct Harness {
    pub manager: SocketManager,
    pub events: broadcast::Receiver<SocketEvent>,
    pub validator: MockValidator,
    sockets: mpsc::UnboundedReceiver<OpenedSocket>,
    requests: mpsc::UnboundedReceiver<PendingRequest>,
}

impl Harness {
    #[must_use]
    pub fn start(config: Config) -> Self {
        Self::start_with(authenticated_session(), config)
    }

    #[must_use]
    pub fn start_with(session: Session, config: Config) -> Self {
        init_tracing();
        let (sockets_tx, sockets) = mpsc::unbounded_channel();
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let validator = MockValidator::default();

        let collaborators = Collaborators::new(
            MockTransport { opened: sockets_tx },
            validator.clone(),
            MockDispatcher {
                requests: requests_tx,
            },
        );
        let manager = SocketManager::new(session, config, collaborators);
        let events = manager.subscribe();

        Self {
            manager,
            events,
            validator,
            sockets,
            requests,
        }
    }

    /// Run [`SocketManager::resync`] in the background.
    pub fn resync(&self, from: Timestamp) -> JoinHandle<Result<()>> {
        let manager = self.manager.clone();
        tokio::spawn(async move { manager.resync(from).await })
    }

    /// Run [`SocketManager::sync_presence`] in the background.
    pub fn sync_presence(&self, since: Timestamp) -> JoinHandle<Result<()>> {
        let manager = self.manager.clone();
        tokio::spawn(async move { manager.sync_presence(since).await })
    }

    pub async fn next_socket(&mut self) -> OpenedSocket {
        self.sockets.recv().await.unwrap()
    }

    /// A socket opened by the manager, if one is waiting.
    pub async fn try_next_socket(&mut self) -> Option<OpenedSocket> {
        settle().await;
        self.sockets.try_recv().ok()
    }

    /// Open the first socket and skip past the requests made when it opens without history.
    pub async fn open_fresh(&mut self) -> (OpenedSocket, Vec<PendingRequest>) {
        let socket = self.next_socket().await;
        socket.open();
        let subscribe = self.next_request().await;
        let update = self.next_request().await;
        (socket, vec![subscribe, update])
    }

    pub async fn next_request(&mut self) -> PendingRequest {
        self.requests.recv().await.unwrap()
    }

    /// Requests made so far that nobody has looked at yet.
    pub async fn drain_requests(&mut self) -> Vec<PendingRequest> {
        settle().await;
        let mut requests = Vec::new();
        while let Ok(request) = self.requests.try_recv() {
            requests.push(request);
        }
        requests
    }

    /// Skip events until one matches.
    pub async fn wait_for<F: Fn(&SocketEvent) -> bool>(&mut self, matches: F) -> SocketEvent {
        loop {
            let event = self.events.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    }

    /// Events published so far, excluding inbound messages.
    pub async fn drain_events(&mut self) -> Vec<SocketEvent> {
        settle().await;
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if !matches!(event, SocketEvent::Message(_)) {
                events.push(event);
            }
        }
        events
    }
}

/// Let the connection task and everything it spawned run until idle.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

#[must_use]
pub fn methods(requests: &[PendingRequest]) -> Vec<Method> {
    requests.iter().map(PendingRequest::method).collect()
}

pub fn assert_delay_within(delay: Duration, low_ms: u64, high_ms: u64) {
    assert!(
        delay >= Duration::from_millis(low_ms) && delay <= Duration::from_millis(high_ms),
        "{delay:?} not within [{low_ms}ms, {high_ms}ms]"
    );
}
