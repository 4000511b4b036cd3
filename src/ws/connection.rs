#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;

use secrecy::SecretString;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant as TokioInstant;

use super::envelope::{
    CounterReading, Envelope, Method, PresenceOperation, Request, Response, Timestamp,
    format_timestamp,
};
use super::error::WsError;
use super::events::{Origin, SocketEvent};
use super::keepalive::{CounterProbe, ProbeDecision};
use super::resync::{CounterObservation, ResyncCoordinator, ResyncStep};
use super::timers::{TimerKind, Timers};
use super::traits::{Dispatcher, SessionValidator, Transport, Validation};
use super::transport::{ConnectRequest, HandleId, Outbound, Socket, SocketEvents};
use crate::Result;
use crate::backoff::BackoffPolicy;
use crate::config::{CONNECT_TIMEOUT, Config};
use crate::session::Session;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket
    Disconnected,
    /// Socket created, waiting for it to open
    Connecting,
    /// Socket open
    Open {
        /// When the socket opened
        since: Instant,
    },
    /// Deliberate close in progress
    Closing,
}

impl ConnectionState {
    /// Check if the socket is currently open.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

/// Lifecycle signal reported by a transport for one socket.
#[derive(Debug)]
pub(crate) enum SocketSignal {
    Opened,
    Message(String),
    Closed,
    Error(String),
}

/// Waiter on a `Counter.read` probe.
#[derive(Debug)]
pub(crate) enum ProbeWaiter {
    Caller(oneshot::Sender<Result<CounterReading>>),
    Keepalive,
}

impl ProbeWaiter {
    fn not_connected(self) {
        if let Self::Caller(reply) = self {
            _ = reply.send(Err(WsError::NotConnected.into()));
        }
    }
}

/// Everything the connection task reacts to. Handles send the public operations; spawned
/// helpers report back through the same mailbox.
#[derive(Debug)]
pub(crate) enum Command {
    Connect(Origin),
    Reconnect {
        reset: bool,
    },
    Close,
    SetOnline {
        online: bool,
        reset: bool,
    },
    Authenticated(SecretString),
    Unauthenticated,
    Resync {
        from: Timestamp,
        reply: oneshot::Sender<Result<()>>,
    },
    SyncPresence {
        since: Timestamp,
        reply: oneshot::Sender<Result<()>>,
    },
    GetCounter(oneshot::Sender<Result<CounterReading>>),
    Send(String),
    Request {
        request: Request,
        reply: oneshot::Sender<Result<Response>>,
    },
    Destroy,
    Socket {
        handle: HandleId,
        signal: SocketSignal,
    },
    Timer {
        kind: TimerKind,
        generation: u64,
    },
    Validated {
        generation: u64,
        outcome: Validation,
    },
    ReplayFinished {
        id: u64,
        result: std::result::Result<(), String>,
    },
    PresenceSynced {
        id: u64,
        result: std::result::Result<(), String>,
    },
    CounterRead {
        handle: HandleId,
        result: std::result::Result<CounterReading, String>,
        waiters: Vec<ProbeWaiter>,
    },
}

/// The external collaborators of a connection.
#[derive(Clone)]
pub(crate) struct Links {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) validator: Arc<dyn SessionValidator>,
    pub(crate) dispatcher: Arc<dyn Dispatcher>,
}

#[derive(Debug)]
struct LiveSocket {
    handle: HandleId,
    socket: Socket,
}

/// A cancellable routed request whose completion the connection waits on.
#[derive(Debug)]
struct Tracked {
    id: u64,
    method: Method,
    task: AbortHandle,
    /// Whether completing this presence sync finishes a resync chain
    completes_resync: bool,
    /// Caller of an explicit [`Command::SyncPresence`]
    reply: Option<oneshot::Sender<Result<()>>>,
}

impl Tracked {
    fn cancel(self) {
        self.task.abort();
        if let Some(reply) = self.reply {
            _ = reply.send(Err(WsError::Cancelled(self.method).into()));
        }
    }
}

fn request_failed(method: Method, reason: String) -> crate::error::Error {
    WsError::RequestFailed { method, reason }.into()
}

/// Owns every piece of mutable connection state. Runs as a single task; all state changes
/// happen in [`Connection::handle`]. Whether the socket is open or being closed is read from
/// the published [`ConnectionState`].
pub(crate) struct Connection {
    session: Session,
    config: Config,
    links: Links,
    mailbox: mpsc::WeakUnboundedSender<Command>,
    events: broadcast::Sender<SocketEvent>,
    state: watch::Sender<ConnectionState>,
    socket: Option<LiveSocket>,
    next_handle: u64,
    next_task: u64,
    failure_count: u32,
    reconnect_backoff: BackoffPolicy,
    resync: ResyncCoordinator,
    probe: CounterProbe<ProbeWaiter>,
    timers: Timers,
    validation: Option<u64>,
    replay: Option<Tracked>,
    presence_sync: Option<Tracked>,
    /// Callers of [`Command::Resync`] waiting for the current chain to finish
    resync_waiters: Vec<oneshot::Sender<Result<()>>>,
    last_skipped_counter: Option<TokioInstant>,
}

impl Connection {
    pub(crate) fn new(
        session: Session,
        config: Config,
        links: Links,
        mailbox: mpsc::WeakUnboundedSender<Command>,
        events: broadcast::Sender<SocketEvent>,
        state: watch::Sender<ConnectionState>,
    ) -> Self {
        Self {
            reconnect_backoff: config.reconnect_backoff(),
            resync: ResyncCoordinator::new(config.replay_retries),
            probe: CounterProbe::new(config.counter_probe_min_interval),
            session,
            config,
            links,
            mailbox,
            events,
            state,
            socket: None,
            next_handle: 0,
            next_task: 0,
            failure_count: 0,
            timers: Timers::default(),
            validation: None,
            replay: None,
            presence_sync: None,
            resync_waiters: Vec::new(),
            last_skipped_counter: None,
        }
    }

    /// Drive the connection until every handle is dropped or destroy is requested.
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        if self.may_connect() {
            self.connect(Origin::new("constructor", "initialization"));
        }

        while let Some(command) = commands.recv().await {
            if self.handle(command).is_break() {
                break;
            }
        }

        self.destroy();
    }

    fn handle(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Connect(origin) => self.connect(origin),
            Command::Reconnect { reset } => {
                self.reconnect(reset, Origin::new("reconnect", "reconnect requested"));
            }
            Command::Close => {
                self.close();
                self.finish_resync(|| Err(WsError::NotConnected.into()));
            }
            Command::SetOnline { online, reset } => self.online_changed(online, reset),
            Command::Authenticated(token) => {
                self.session.token = Some(token);
                self.connect(Origin::new("authenticated", "authenticated"));
            }
            Command::Unauthenticated => {
                self.session.token = None;
                self.emit(SocketEvent::Disconnecting(Origin::new(
                    "unauthenticated",
                    "session is no longer authenticated",
                )));
                self.close();
                self.finish_resync(|| Err(WsError::NotConnected.into()));
            }
            Command::Resync { from, reply } => {
                self.resync_waiters.push(reply);
                self.start_resync(from, Origin::new("resync", "requested"));
            }
            Command::SyncPresence { since, reply } => match self.outbound() {
                Some(outbound) => self.start_presence_sync(outbound, since, false, Some(reply)),
                None => {
                    _ = reply.send(Err(WsError::NotConnected.into()));
                }
            },
            Command::GetCounter(reply) => self.get_counter(ProbeWaiter::Caller(reply)),
            Command::Send(text) => self.send_text(text),
            Command::Request { request, reply } => self.forward_request(request, reply),
            Command::Destroy => return ControlFlow::Break(()),
            Command::Socket { handle, signal } => self.on_socket_signal(handle, signal),
            Command::Timer { kind, generation } => {
                if self.timers.fire(kind, generation) {
                    self.on_timer(kind);
                }
            }
            Command::Validated {
                generation,
                outcome,
            } => self.on_validated(generation, outcome),
            Command::ReplayFinished { id, result } => self.on_replay_finished(id, result),
            Command::PresenceSynced { id, result } => self.on_presence_synced(id, result),
            Command::CounterRead {
                handle,
                result,
                waiters,
            } => self.on_counter_read(handle, &result, waiters),
        }
        ControlFlow::Continue(())
    }

    fn may_connect(&self) -> bool {
        self.session.is_authenticated() && self.session.online
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn is_open(&self) -> bool {
        self.socket.is_some() && self.current_state().is_open()
    }

    fn is_closing(&self) -> bool {
        self.current_state() == ConnectionState::Closing
    }

    fn outbound(&self) -> Option<Outbound> {
        self.socket
            .as_ref()
            .filter(|_| self.is_open())
            .map(|live| live.socket.outbound())
    }

    fn emit(&self, event: SocketEvent) {
        tracing::trace!(?event, "Socket event");
        _ = self.events.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn schedule(&mut self, kind: TimerKind, delay: std::time::Duration) {
        let mailbox = self.mailbox.clone();
        self.timers.schedule(kind, delay, move |kind, generation| {
            if let Some(mailbox) = mailbox.upgrade() {
                _ = mailbox.send(Command::Timer { kind, generation });
            }
        });
    }

    fn next_task_id(&mut self) -> u64 {
        self.next_task = self.next_task.wrapping_add(1);
        self.next_task
    }

    fn connect(&mut self, origin: Origin) {
        if !self.may_connect() {
            tracing::debug!(from = origin.from, "Websocket connect skipped: not authenticated or offline");
            return;
        }
        if self.socket.is_some() {
            self.reconnect(false, origin);
            return;
        }

        let url = match self.session.connect_url(&self.config.client_version) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!(error = %e, "Unable to build websocket url");
                return;
            }
        };

        self.emit(SocketEvent::Connecting(origin));
        self.timers.cancel(TimerKind::Reconnect);
        self.validation = None;
        self.next_handle = self.next_handle.wrapping_add(1);
        let handle = HandleId(self.next_handle);

        tracing::info!(%handle, "Websocket connecting");

        let events = SocketEvents::new(handle, self.mailbox.clone());
        let request = ConnectRequest::new(url, self.config.protocol.clone());
        let socket = self.links.transport.open(request, events);

        self.socket = Some(LiveSocket { handle, socket });
        self.set_state(ConnectionState::Connecting);
        self.schedule(TimerKind::ConnectTimeout, CONNECT_TIMEOUT);
    }

    fn reconnect(&mut self, reset: bool, origin: Origin) {
        self.close();
        if reset {
            self.resync.reset();
            self.finish_resync(|| Err(WsError::Cancelled(Method::EventReplay).into()));
        }
        self.connect(origin);
    }

    fn close(&mut self) {
        tracing::debug!("Websocket close requested");
        self.set_state(ConnectionState::Closing);
        self.timers.cancel_all();
        self.validation = None;

        if self.socket.is_some() {
            self.on_socket_close();
        } else {
            self.cancel_tracked();
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn destroy(&mut self) {
        tracing::debug!("Websocket manager destroyed");
        self.emit(SocketEvent::Disconnecting(Origin::new(
            "destroy",
            "manager is being destroyed",
        )));
        self.close();
        self.finish_resync(|| Err(WsError::ConnectionClosed.into()));
    }

    fn online_changed(&mut self, online: bool, reset: bool) {
        self.session.online = online;
        if !self.session.is_authenticated() {
            return;
        }

        if online {
            self.reconnect(reset, Origin::new("online_changed", "detect change to online"));
        } else {
            tracing::info!("Websocket closed due to ambiguous connection state");
            self.emit(SocketEvent::Disconnecting(Origin::new(
                "online_changed",
                "detect change to offline",
            )));
            self.close();
            self.finish_resync(|| Err(WsError::NotConnected.into()));
        }
    }

    fn on_socket_signal(&mut self, handle: HandleId, signal: SocketSignal) {
        if self.socket.as_ref().map(|live| live.handle) != Some(handle) {
            tracing::trace!(%handle, ?signal, "Ignoring signal from discarded socket");
            return;
        }

        match signal {
            SocketSignal::Opened => self.on_open(),
            SocketSignal::Message(text) => self.on_message(&text),
            SocketSignal::Closed => self.on_socket_close(),
            SocketSignal::Error(reason) => self.on_error(&reason),
        }
    }

    fn on_open(&mut self) {
        if self.socket.is_none() || self.is_open() {
            return;
        }

        self.timers.cancel(TimerKind::ConnectTimeout);
        self.failure_count = 0;
        self.last_skipped_counter = None;
        self.set_state(ConnectionState::Open {
            since: Instant::now(),
        });

        tracing::info!("Websocket connected");
        self.emit(SocketEvent::Connected { verified: false });

        match self.resync.resume_from() {
            Some(from) => self.start_resync(from, Origin::new("resync", "reconnected")),
            None => self.enable_presence(None, false),
        }
        self.reschedule_keepalive();
    }

    fn on_message(&mut self, text: &str) {
        self.failure_count = 0;

        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(%text, error = %e, "Failed to handle websocket message");
                return;
            }
        };

        match self.resync.observe(&envelope) {
            CounterObservation::SessionStarted => {
                self.emit(SocketEvent::Connected { verified: true });
            }
            CounterObservation::SessionReset => {
                tracing::info!("Websocket server restarted the session");
                match self.resync.last_event_timestamp() {
                    Some(from) => self.start_resync(from, Origin::new("on_message", "zero counter")),
                    None => tracing::debug!("No events seen yet, nothing to replay"),
                }
            }
            CounterObservation::Skipped { expected, received } => {
                self.on_skipped_counter(&envelope, expected, received);
            }
            CounterObservation::InOrder | CounterObservation::Unnumbered => {}
        }

        let envelope = Arc::new(envelope);
        if self.links.dispatcher.handle_inbound(&envelope) {
            tracing::trace!(counter = ?envelope.counter, "Routed reply to pending request");
        }
        self.emit(SocketEvent::Message(envelope));
        self.reschedule_keepalive();
    }

    fn on_skipped_counter(&mut self, envelope: &Envelope, expected: u64, received: u64) {
        let now = TokioInstant::now();
        let recently_handled = self.last_skipped_counter.is_some_and(|at| {
            now.saturating_duration_since(at) < self.config.ignore_skipped_counter_interval
        });

        if recently_handled {
            self.emit(SocketEvent::IgnoreSkippedCounter(Origin::new(
                "on_message",
                format!("skipped counter {expected} to {received}"),
            )));
            if let Some(timestamp) = envelope.timestamp {
                self.resync.record_timestamp(timestamp);
            }
            return;
        }

        tracing::warn!(expected, received, "Websocket skipped counter");
        self.last_skipped_counter = Some(now);
        match self.resync.last_event_timestamp() {
            Some(from) => self.start_resync(
                from,
                Origin::new("on_message", format!("skipped counter {expected} to {received}")),
            ),
            None => {
                if let Some(timestamp) = envelope.timestamp {
                    self.resync.record_timestamp(timestamp);
                }
            }
        }
    }

    fn on_error(&mut self, reason: &str) {
        if self.is_closing() {
            return;
        }
        self.timers.cancel(TimerKind::ConnectTimeout);
        tracing::debug!(reason, "Websocket error causing websocket to close");

        if self.is_open() {
            if !self.resync.has_seen_session_start() {
                tracing::error!("An apparently open connection has closed without any messages");
                self.failure_count = self.failure_count.saturating_add(1);
            }
            self.on_socket_close();
        } else {
            self.discard_socket();
            self.failure_count = self.failure_count.saturating_add(1);
            self.set_state(ConnectionState::Disconnected);
            self.emit(SocketEvent::ScheduleReconnect(Origin::new(
                "on_error",
                "websocket failed to open",
            )));
            self.schedule_reconnect();
        }
    }

    fn on_socket_close(&mut self) {
        tracing::debug!("Websocket closed");
        let closing = self.is_closing();
        self.resync.connection_lost();
        self.cancel_tracked();
        self.timers.cancel(TimerKind::Keepalive);
        self.timers.cancel(TimerKind::ReplayRetry);
        self.timers.cancel(TimerKind::CounterProbe);
        self.timers.cancel(TimerKind::ConnectTimeout);
        for waiter in self.probe.abandon() {
            waiter.not_connected();
        }
        self.discard_socket();
        self.set_state(ConnectionState::Disconnected);

        if !closing {
            self.emit(SocketEvent::ScheduleReconnect(Origin::new(
                "on_socket_close",
                "websocket closed",
            )));
            self.schedule_reconnect();
        }
        self.emit(SocketEvent::Disconnected);
    }

    fn discard_socket(&mut self) {
        if let Some(live) = self.socket.take() {
            live.socket.close();
        }
    }

    fn cancel_tracked(&mut self) {
        if let Some(replay) = self.replay.take() {
            replay.cancel();
        }
        if let Some(sync) = self.presence_sync.take() {
            sync.cancel();
        }
    }

    fn schedule_reconnect(&mut self) {
        if !self.may_connect() {
            return;
        }

        let attempt = self.failure_count;
        let delay = self.reconnect_backoff.delay(attempt);
        tracing::warn!(attempt, ?delay, "Websocket reconnect scheduled");
        self.emit(SocketEvent::SchedulingReconnect { attempt, delay });
        self.schedule(TimerKind::Reconnect, delay);
    }

    fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::ConnectTimeout => {
                tracing::warn!("Websocket failed to connect to server");
                self.on_error("connect timeout");
            }
            TimerKind::Reconnect => self.validate_session(),
            TimerKind::Keepalive => {
                if self.is_open() {
                    tracing::debug!("Websocket ping");
                    self.get_counter(ProbeWaiter::Keepalive);
                }
            }
            TimerKind::ReplayRetry => {
                if let Some(step) = self.resync.retry_due() {
                    self.apply(step, Origin::new("replay_retry", "retrying failed replay"));
                }
            }
            TimerKind::CounterProbe => {
                if let Some(ProbeDecision::SendNow(waiters)) =
                    self.probe.deferred_due(TokioInstant::now())
                {
                    self.send_counter_read(waiters);
                }
            }
        }
    }

    fn validate_session(&mut self) {
        if !self.may_connect() {
            return;
        }
        if self.socket.is_some() {
            tracing::debug!("Socket already present, skipping session validation");
            return;
        }
        let Some(token) = self.session.token.clone() else {
            return;
        };

        let generation = self.next_task_id();
        self.validation = Some(generation);

        let validator = Arc::clone(&self.links.validator);
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let outcome = validator.validate(token).await;
            if let Some(mailbox) = mailbox.upgrade() {
                _ = mailbox.send(Command::Validated {
                    generation,
                    outcome,
                });
            }
        });
    }

    fn on_validated(&mut self, generation: u64, outcome: Validation) {
        if self.validation != Some(generation) {
            tracing::trace!(generation, "Ignoring stale session validation");
            return;
        }
        self.validation = None;

        match outcome {
            Validation::Authorized => {
                if self.socket.is_some() {
                    tracing::debug!("Socket already present, skipping validated reconnect");
                    return;
                }
                self.connect(Origin::new("validate_session", "has valid session token"));
            }
            Validation::Unauthenticated => {
                tracing::info!("Session token rejected, waiting for re-authentication");
            }
            Validation::Failed { status, reason } => {
                tracing::warn!(?status, %reason, "Session validation failed");
                self.failure_count = self.failure_count.saturating_add(1);
                self.emit(SocketEvent::ScheduleReconnect(Origin::new(
                    "validate_session",
                    format!("Unexpected error: {reason}"),
                )));
                self.schedule_reconnect();
            }
        }
    }

    fn reschedule_keepalive(&mut self) {
        if self.is_open() {
            self.schedule(TimerKind::Keepalive, self.config.keepalive_interval);
        }
    }

    fn start_resync(&mut self, from: Timestamp, origin: Origin) {
        if let Some(sync) = self.presence_sync.take() {
            sync.cancel();
        }
        let step = self.resync.request(from, self.is_open());
        self.apply(step, origin);
    }

    fn apply(&mut self, step: ResyncStep, origin: Origin) {
        match step {
            ResyncStep::Replay(from) => {
                self.emit(SocketEvent::ReplayingEvents(origin));
                self.send_replay(from);
            }
            ResyncStep::Retry {
                from,
                attempt,
                delay,
            } => {
                tracing::info!(
                    from = %format_timestamp(&from),
                    attempt,
                    ?delay,
                    "Websocket Event.replay retry scheduled"
                );
                self.schedule(TimerKind::ReplayRetry, delay);
            }
            ResyncStep::CatchUpPresence(since) => {
                self.enable_presence(since, true);
                if !self
                    .presence_sync
                    .as_ref()
                    .is_some_and(|sync| sync.completes_resync)
                {
                    self.finish_resync(|| Ok(()));
                }
            }
            ResyncStep::GaveUp { from, retried } => {
                if retried {
                    tracing::error!(
                        from = %format_timestamp(&from),
                        "Websocket Event.replay failed after retries, events may be missing"
                    );
                } else {
                    tracing::warn!(
                        from = %format_timestamp(&from),
                        "Websocket Event.replay failed, events may be missing"
                    );
                }
                self.enable_presence(None, false);
            }
            ResyncStep::Deferred => {
                tracing::debug!(from = origin.from, "Websocket replay deferred");
            }
        }
    }

    fn send_replay(&mut self, from: Timestamp) {
        let Some(outbound) = self.outbound() else {
            return;
        };
        tracing::info!(from = %format_timestamp(&from), "Websocket request: Event.replay");

        let id = self.next_task_id();
        let task = self.spawn_tracked(outbound, Request::event_replay(&from), move |result| {
            Command::ReplayFinished {
                id,
                result: result.map(drop).map_err(|e| e.to_string()),
            }
        });
        self.replay = Some(Tracked {
            id,
            method: Method::EventReplay,
            task,
            completes_resync: false,
            reply: None,
        });
    }

    fn on_replay_finished(&mut self, id: u64, result: std::result::Result<(), String>) {
        if self.replay.as_ref().map(|replay| replay.id) != Some(id) {
            return;
        }
        self.replay = None;

        match &result {
            Ok(()) => tracing::debug!("Websocket Event.replay completed"),
            Err(reason) => tracing::warn!(%reason, "Websocket Event.replay has failed"),
        }

        let Some(step) = self.resync.replay_finished(result.is_ok()) else {
            return;
        };
        if let (ResyncStep::GaveUp { .. }, Err(reason)) = (&step, result) {
            self.finish_resync(|| Err(request_failed(Method::EventReplay, reason.clone())));
        }
        self.apply(step, Origin::new("replay_finished", "pending replay"));
    }

    /// Resolve every caller waiting on the resync chain.
    fn finish_resync<F: Fn() -> Result<()>>(&mut self, outcome: F) {
        for reply in self.resync_waiters.drain(..) {
            _ = reply.send(outcome());
        }
    }

    fn enable_presence(&mut self, since: Option<Timestamp>, completes_resync: bool) {
        let Some(outbound) = self.outbound() else {
            return;
        };

        tracing::debug!("Websocket request: Presence.subscribe");
        self.spawn_detached(outbound.clone(), Request::presence_subscribe());
        if self.config.presence_enabled {
            self.spawn_detached(
                outbound.clone(),
                Request::presence_update(&[PresenceOperation::auto_status()]),
            );
        }

        if let Some(since) = since {
            self.start_presence_sync(outbound, since, completes_resync, None);
        }
    }

    fn start_presence_sync(
        &mut self,
        outbound: Outbound,
        since: Timestamp,
        completes_resync: bool,
        reply: Option<oneshot::Sender<Result<()>>>,
    ) {
        // A superseded catch-up hands its place in the resync chain to the new sync.
        let mut completes_resync = completes_resync;
        if let Some(sync) = self.presence_sync.take() {
            completes_resync |= sync.completes_resync;
            sync.cancel();
        }
        tracing::debug!(since = %format_timestamp(&since), "Websocket request: Presence.sync");

        let id = self.next_task_id();
        let task = self.spawn_tracked(outbound, Request::presence_sync(&since), move |result| {
            Command::PresenceSynced {
                id,
                result: result.map(drop).map_err(|e| e.to_string()),
            }
        });
        self.presence_sync = Some(Tracked {
            id,
            method: Method::PresenceSync,
            task,
            completes_resync,
            reply,
        });
    }

    fn on_presence_synced(&mut self, id: u64, result: std::result::Result<(), String>) {
        let Some(sync) = self.presence_sync.take_if(|sync| sync.id == id) else {
            return;
        };

        if let Err(reason) = &result {
            tracing::warn!(%reason, "Websocket Presence.sync has failed");
        }
        let outcome = || {
            result
                .clone()
                .map_err(|reason| request_failed(Method::PresenceSync, reason))
        };
        if let Some(reply) = sync.reply {
            _ = reply.send(outcome());
        }
        if sync.completes_resync {
            self.emit(SocketEvent::Synced);
            self.finish_resync(outcome);
        }
        self.reschedule_keepalive();
    }

    fn get_counter(&mut self, waiter: ProbeWaiter) {
        if !self.is_open() {
            waiter.not_connected();
            return;
        }

        match self.probe.request(waiter, TokioInstant::now()) {
            ProbeDecision::SendNow(waiters) => self.send_counter_read(waiters),
            ProbeDecision::Defer(delay) => self.schedule(TimerKind::CounterProbe, delay),
            ProbeDecision::Joined => {}
        }
    }

    fn send_counter_read(&mut self, waiters: Vec<ProbeWaiter>) {
        let (Some(outbound), Some(handle)) =
            (self.outbound(), self.socket.as_ref().map(|live| live.handle))
        else {
            for waiter in waiters {
                waiter.not_connected();
            }
            return;
        };
        tracing::debug!(waiters = waiters.len(), "Websocket request: Counter.read");

        let dispatcher = Arc::clone(&self.links.dispatcher);
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let result = dispatcher
                .request(outbound, Request::counter_read())
                .await
                .map(|response| CounterReading::from(&response))
                .map_err(|e| e.to_string());
            if let Some(mailbox) = mailbox.upgrade() {
                _ = mailbox.send(Command::CounterRead {
                    handle,
                    result,
                    waiters,
                });
            }
        });
    }

    fn on_counter_read(
        &mut self,
        handle: HandleId,
        result: &std::result::Result<CounterReading, String>,
        waiters: Vec<ProbeWaiter>,
    ) {
        let current = self.is_open() && self.socket.as_ref().map(|live| live.handle) == Some(handle);
        let mut keepalive = false;

        for waiter in waiters {
            match waiter {
                ProbeWaiter::Caller(reply) => {
                    _ = reply.send(result.clone().map_err(|reason| {
                        WsError::RequestFailed {
                            method: Method::CounterRead,
                            reason,
                        }
                        .into()
                    }));
                }
                ProbeWaiter::Keepalive => keepalive = true,
            }
        }

        if !keepalive || !current {
            return;
        }
        match result {
            Ok(_) => self.reschedule_keepalive(),
            Err(reason) => {
                tracing::warn!(%reason, "Websocket keepalive probe failed");
                self.on_error(reason);
            }
        }
    }

    fn send_text(&self, text: String) {
        match self.outbound() {
            Some(outbound) => {
                if let Err(e) = outbound.send_text(text) {
                    tracing::warn!(error = %e, "Unable to send websocket frame");
                }
            }
            None => tracing::debug!("Dropping websocket frame: not connected"),
        }
    }

    fn forward_request(&self, request: Request, reply: oneshot::Sender<Result<Response>>) {
        let Some(outbound) = self.outbound() else {
            _ = reply.send(Err(WsError::NotConnected.into()));
            return;
        };

        let dispatcher = Arc::clone(&self.links.dispatcher);
        tokio::spawn(async move {
            _ = reply.send(dispatcher.request(outbound, request).await);
        });
    }

    fn spawn_tracked<F>(&self, outbound: Outbound, request: Request, complete: F) -> AbortHandle
    where
        F: FnOnce(Result<Response>) -> Command + Send + 'static,
    {
        let dispatcher = Arc::clone(&self.links.dispatcher);
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let result = dispatcher.request(outbound, request).await;
            if let Some(mailbox) = mailbox.upgrade() {
                _ = mailbox.send(complete(result));
            }
        })
        .abort_handle()
    }

    fn spawn_detached(&self, outbound: Outbound, request: Request) {
        let dispatcher = Arc::clone(&self.links.dispatcher);
        tokio::spawn(async move {
            let method = request.method;
            if let Err(e) = dispatcher.request(outbound, request).await {
                tracing::warn!(%method, error = %e, "Websocket request failed");
            }
        });
    }
}
