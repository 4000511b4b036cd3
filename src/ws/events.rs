use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use super::envelope::Envelope;

/// Where a lifecycle transition was requested from and why.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    /// Operation that initiated the transition
    pub from: &'static str,
    /// Human readable reason
    pub why: Cow<'static, str>,
}

impl Origin {
    #[must_use]
    pub fn new<W: Into<Cow<'static, str>>>(from: &'static str, why: W) -> Self {
        Self {
            from,
            why: why.into(),
        }
    }
}

/// Lifecycle notifications published to subscribers of the manager.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// A connection attempt is about to be made
    Connecting(Origin),
    /// The socket is open. `verified` is set once the server has started the logical session
    /// by sending counter 0.
    Connected {
        verified: bool,
    },
    /// The socket is being closed on purpose
    Disconnecting(Origin),
    Disconnected,
    /// An `Event.replay` is about to be issued
    ReplayingEvents(Origin),
    /// Replay and presence catch-up have finished
    Synced,
    /// A reconnect delay was computed
    SchedulingReconnect {
        /// Consecutive failed attempts so far
        attempt: u32,
        delay: Duration,
    },
    /// A reconnect has been requested
    ScheduleReconnect(Origin),
    /// A frame was received from the server
    Message(Arc<Envelope>),
    /// A skipped counter was ignored without checking for missed events
    IgnoreSkippedCounter(Origin),
}
