//! Coalescing of `Counter.read` probes.
//!
//! Keepalive pings and caller-initiated [`crate::ws::SocketManager::get_counter`] calls share
//! the same wire request. Requests arriving within the minimum interval of the last one sent
//! are folded into a single deferred probe, and every waiter in a batch receives the reply.

use std::mem;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ProbeDecision<W> {
    /// Send `Counter.read` now and deliver the result to these waiters
    SendNow(Vec<W>),
    /// Arm the deferred probe to fire after this delay
    Defer(Duration),
    /// A deferred probe is already armed; the waiter rides along
    Joined,
}

#[derive(Debug)]
pub(crate) struct CounterProbe<W> {
    min_interval: Duration,
    last_sent: Option<Instant>,
    deferred: bool,
    waiters: Vec<W>,
}

impl<W> CounterProbe<W> {
    pub(crate) fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_sent: None,
            deferred: false,
            waiters: Vec::new(),
        }
    }

    pub(crate) fn request(&mut self, waiter: W, now: Instant) -> ProbeDecision<W> {
        self.waiters.push(waiter);

        if self.deferred {
            return ProbeDecision::Joined;
        }

        if let Some(last) = self.last_sent {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.min_interval {
                self.deferred = true;
                return ProbeDecision::Defer(self.min_interval.saturating_sub(elapsed));
            }
        }

        self.send(now)
    }

    /// The deferred probe fired. Returns the batch to send, if one is still waiting.
    pub(crate) fn deferred_due(&mut self, now: Instant) -> Option<ProbeDecision<W>> {
        if !self.deferred {
            return None;
        }
        Some(self.send(now))
    }

    /// Drop the deferred probe and hand back everyone still waiting on it.
    pub(crate) fn abandon(&mut self) -> Vec<W> {
        self.deferred = false;
        mem::take(&mut self.waiters)
    }

    fn send(&mut self, now: Instant) -> ProbeDecision<W> {
        self.last_sent = Some(now);
        self.deferred = false;
        ProbeDecision::SendNow(mem::take(&mut self.waiters))
    }
}
