//! Event stream completeness: counter tracking and the replay chain.
//!
//! [`ResyncCoordinator`] is plain state. It decides what should happen next and the connection
//! task carries it out, so at most one `Event.replay` is outstanding at any time.

use std::time::Duration;

use super::envelope::{Envelope, SESSION_START_COUNTER, Timestamp};
use crate::backoff::BackoffPolicy;
use crate::config::{MAX_REPLAY_RETRIES, ReplayRetryPolicy};

/// How an inbound counter relates to the ones before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CounterObservation {
    /// First counter 0 on this socket
    SessionStarted,
    /// Counter 0 again without the socket closing; the server lost its session state
    SessionReset,
    /// At least one counter was never received
    Skipped { expected: u64, received: u64 },
    InOrder,
    /// Frame carried no counter
    Unnumbered,
}

#[derive(Debug, Default)]
struct CounterTracker {
    has_seen_zero: bool,
    last_counter: Option<u64>,
}

impl CounterTracker {
    fn observe(&mut self, counter: Option<u64>) -> CounterObservation {
        let Some(counter) = counter else {
            return CounterObservation::Unnumbered;
        };
        let previous = self.last_counter.replace(counter);

        if counter == SESSION_START_COUNTER {
            if self.has_seen_zero {
                return CounterObservation::SessionReset;
            }
            self.has_seen_zero = true;
            return CounterObservation::SessionStarted;
        }

        match previous {
            Some(previous) if counter > previous.saturating_add(1) => {
                CounterObservation::Skipped {
                    expected: previous.saturating_add(1),
                    received: counter,
                }
            }
            _ => CounterObservation::InOrder,
        }
    }
}

/// Where replay currently stands for the connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResyncCursor {
    /// Timestamp of the newest event seen; replay starts here after a gap
    pub(crate) last_event_timestamp: Option<Timestamp>,
    /// Replay that could not be issued yet
    pub(crate) pending_replay_from: Option<Timestamp>,
    /// Consecutive replay failures in the current chain
    pub(crate) replay_failure_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplayState {
    Idle,
    InFlight(Timestamp),
    RetryScheduled(Timestamp),
}

/// Next action for the connection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResyncStep {
    /// Issue `Event.replay` from this timestamp
    Replay(Timestamp),
    /// Wait, then call [`ResyncCoordinator::retry_due`]
    Retry {
        from: Timestamp,
        attempt: u32,
        delay: Duration,
    },
    /// The chain is done; catch presence up from where it started
    CatchUpPresence(Option<Timestamp>),
    /// The replay failed for good; `retried` tells whether retries were attempted first
    GaveUp { from: Timestamp, retried: bool },
    /// Nothing to send now; the request was queued or was a duplicate
    Deferred,
}

#[derive(Debug)]
pub(crate) struct ResyncCoordinator {
    policy: ReplayRetryPolicy,
    backoff: BackoffPolicy,
    cursor: ResyncCursor,
    counter: CounterTracker,
    replay: ReplayState,
    /// Timestamp the current chain started from
    chain_from: Option<Timestamp>,
}

impl ResyncCoordinator {
    pub(crate) fn new(policy: ReplayRetryPolicy) -> Self {
        Self {
            policy,
            backoff: BackoffPolicy::replay(),
            cursor: ResyncCursor::default(),
            counter: CounterTracker::default(),
            replay: ReplayState::Idle,
            chain_from: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn cursor(&self) -> ResyncCursor {
        self.cursor
    }

    pub(crate) fn last_event_timestamp(&self) -> Option<Timestamp> {
        self.cursor.last_event_timestamp
    }

    pub(crate) fn has_seen_session_start(&self) -> bool {
        self.counter.has_seen_zero
    }

    #[cfg(test)]
    pub(crate) fn is_replaying(&self) -> bool {
        self.replay != ReplayState::Idle
    }

    /// Move the cursor forward. Older timestamps (e.g. from replayed events) never move it back.
    pub(crate) fn record_timestamp(&mut self, timestamp: Timestamp) {
        if self
            .cursor
            .last_event_timestamp
            .is_none_or(|last| timestamp > last)
        {
            self.cursor.last_event_timestamp = Some(timestamp);
        }
    }

    /// Counter bookkeeping for one inbound frame.
    ///
    /// The frame's timestamp is recorded unless the frame signals a gap: replay for a gap must
    /// start from the last timestamp seen before it.
    pub(crate) fn observe(&mut self, envelope: &Envelope) -> CounterObservation {
        let observation = self.counter.observe(envelope.counter);
        let gap = matches!(
            observation,
            CounterObservation::SessionReset | CounterObservation::Skipped { .. }
        );
        if !gap && let Some(timestamp) = envelope.timestamp {
            self.record_timestamp(timestamp);
        }
        observation
    }

    /// Where replay should start when a socket opens, if anywhere.
    pub(crate) fn resume_from(&mut self) -> Option<Timestamp> {
        match (
            self.cursor.pending_replay_from.take(),
            self.cursor.last_event_timestamp,
        ) {
            (Some(pending), Some(last)) => Some(pending.min(last)),
            (pending, last) => pending.or(last),
        }
    }

    /// Ask for a replay from `from`.
    pub(crate) fn request(&mut self, from: Timestamp, open: bool) -> ResyncStep {
        match self.replay {
            ReplayState::InFlight(current) | ReplayState::RetryScheduled(current) => {
                if current != from {
                    self.queue(from);
                }
                ResyncStep::Deferred
            }
            ReplayState::Idle if !open => {
                self.queue(from);
                ResyncStep::Deferred
            }
            ReplayState::Idle => {
                self.chain_from = Some(from);
                self.replay = ReplayState::InFlight(from);
                ResyncStep::Replay(from)
            }
        }
    }

    /// The outstanding `Event.replay` completed. Returns `None` if no replay was outstanding.
    pub(crate) fn replay_finished(&mut self, success: bool) -> Option<ResyncStep> {
        let ReplayState::InFlight(from) = self.replay else {
            return None;
        };
        self.replay = ReplayState::Idle;

        if success {
            self.cursor.replay_failure_count = 0;
            if let Some(next) = self.cursor.pending_replay_from.take() {
                self.replay = ReplayState::InFlight(next);
                return Some(ResyncStep::Replay(next));
            }
            return Some(ResyncStep::CatchUpPresence(self.chain_from.take()));
        }

        let attempt = self.cursor.replay_failure_count;
        if self.policy == ReplayRetryPolicy::Enabled && attempt < MAX_REPLAY_RETRIES {
            self.cursor.replay_failure_count = attempt.saturating_add(1);
            self.replay = ReplayState::RetryScheduled(from);
            return Some(ResyncStep::Retry {
                from,
                attempt,
                delay: self.backoff.delay(attempt),
            });
        }

        self.cursor.replay_failure_count = 0;
        self.cursor.pending_replay_from = None;
        self.chain_from = None;
        Some(ResyncStep::GaveUp {
            from,
            retried: self.policy == ReplayRetryPolicy::Enabled,
        })
    }

    /// The retry delay elapsed.
    pub(crate) fn retry_due(&mut self) -> Option<ResyncStep> {
        let ReplayState::RetryScheduled(from) = self.replay else {
            return None;
        };
        self.replay = ReplayState::InFlight(from);
        Some(ResyncStep::Replay(from))
    }

    /// The socket went away. Counter state is per socket and any outstanding replay is void;
    /// queued replays and the event cursor survive for the next socket.
    pub(crate) fn connection_lost(&mut self) {
        self.counter = CounterTracker::default();
        if let ReplayState::InFlight(from) | ReplayState::RetryScheduled(from) = self.replay {
            self.queue(from);
        }
        self.replay = ReplayState::Idle;
        self.chain_from = None;
        self.cursor.replay_failure_count = 0;
    }

    /// Forget all resync history.
    pub(crate) fn reset(&mut self) {
        self.counter = CounterTracker::default();
        self.cursor = ResyncCursor::default();
        self.replay = ReplayState::Idle;
        self.chain_from = None;
    }

    fn queue(&mut self, from: Timestamp) {
        self.cursor.pending_replay_from = Some(
            self.cursor
                .pending_replay_from
                .map_or(from, |pending| pending.max(from)),
        );
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use serde_json::Value;

    use super::*;

    fn at(seconds: i64) -> Timestamp {
        Timestamp::UNIX_EPOCH + TimeDelta::seconds(seconds)
    }

    fn frame(counter: u64, seconds: i64) -> Envelope {
        Envelope {
            counter: Some(counter),
            timestamp: Some(at(seconds)),
            kind: "change".to_owned(),
            body: Value::Null,
        }
    }

    #[test]
    fn counters_classify_session_start_and_reset() {
        let mut resync = ResyncCoordinator::new(ReplayRetryPolicy::Disabled);

        assert_eq!(resync.observe(&frame(0, 10)), CounterObservation::SessionStarted);
        assert_eq!(resync.observe(&frame(1, 11)), CounterObservation::InOrder);
        assert_eq!(resync.observe(&frame(0, 12)), CounterObservation::SessionReset);
        assert_eq!(
            resync.last_event_timestamp(),
            Some(at(11)),
            "reset frame must not advance the cursor"
        );
    }

    #[test]
    fn skipped_counter_reports_gap_and_keeps_cursor() {
        let mut resync = ResyncCoordinator::new(ReplayRetryPolicy::Disabled);

        _ = resync.observe(&frame(0, 10));
        _ = resync.observe(&frame(1, 11));

        assert_eq!(
            resync.observe(&frame(4, 14)),
            CounterObservation::Skipped {
                expected: 2,
                received: 4
            }
        );
        assert_eq!(resync.last_event_timestamp(), Some(at(11)));
    }

    #[test]
    fn cursor_never_moves_backwards() {
        let mut resync = ResyncCoordinator::new(ReplayRetryPolicy::Disabled);

        resync.record_timestamp(at(20));
        resync.record_timestamp(at(5));

        assert_eq!(resync.last_event_timestamp(), Some(at(20)));
    }

    #[test]
    fn second_request_waits_for_first() {
        let mut resync = ResyncCoordinator::new(ReplayRetryPolicy::Disabled);

        assert_eq!(resync.request(at(10), true), ResyncStep::Replay(at(10)));
        assert_eq!(resync.request(at(20), true), ResyncStep::Deferred);
        assert_eq!(resync.cursor().pending_replay_from, Some(at(20)));

        assert_eq!(
            resync.replay_finished(true),
            Some(ResyncStep::Replay(at(20)))
        );
        assert_eq!(
            resync.replay_finished(true),
            Some(ResyncStep::CatchUpPresence(Some(at(10)))),
            "presence catches up from where the chain started"
        );
        assert!(!resync.is_replaying(), "chain is finished");
    }

    #[test]
    fn duplicate_request_is_dropped() {
        let mut resync = ResyncCoordinator::new(ReplayRetryPolicy::Disabled);

        _ = resync.request(at(10), true);

        assert_eq!(resync.request(at(10), true), ResyncStep::Deferred);
        assert_eq!(resync.cursor().pending_replay_from, None);
    }

    #[test]
    fn request_while_closed_is_queued() {
        let mut resync = ResyncCoordinator::new(ReplayRetryPolicy::Disabled);
        resync.record_timestamp(at(30));

        assert_eq!(resync.request(at(10), false), ResyncStep::Deferred);
        assert_eq!(resync.resume_from(), Some(at(10)));
        assert_eq!(resync.cursor().pending_replay_from, None);
    }

    #[test]
    fn enabled_policy_retries_with_backoff_then_gives_up() {
        let mut resync = ResyncCoordinator::new(ReplayRetryPolicy::Enabled);
        _ = resync.request(at(10), true);

        for attempt in 0..MAX_REPLAY_RETRIES {
            let Some(ResyncStep::Retry {
                from,
                attempt: reported,
                delay,
            }) = resync.replay_finished(false)
            else {
                panic!("attempt {attempt} should schedule a retry");
            };
            assert_eq!(from, at(10));
            assert_eq!(reported, attempt);
            let base = BackoffPolicy::replay().base_delay(attempt);
            assert!(delay >= base && delay <= base.mul_f64(1.5), "{delay:?}");

            assert_eq!(resync.retry_due(), Some(ResyncStep::Replay(at(10))));
        }

        assert_eq!(
            resync.replay_finished(false),
            Some(ResyncStep::GaveUp {
                from: at(10),
                retried: true
            })
        );
        assert_eq!(resync.cursor().replay_failure_count, 0);
    }

    #[test]
    fn disabled_policy_gives_up_and_drops_pending() {
        let mut resync = ResyncCoordinator::new(ReplayRetryPolicy::Disabled);
        _ = resync.request(at(10), true);
        _ = resync.request(at(20), true);

        assert_eq!(
            resync.replay_finished(false),
            Some(ResyncStep::GaveUp {
                from: at(10),
                retried: false
            })
        );
        assert_eq!(resync.cursor().pending_replay_from, None);
    }

    #[test]
    fn success_resets_failure_count() {
        let mut resync = ResyncCoordinator::new(ReplayRetryPolicy::Enabled);
        _ = resync.request(at(10), true);
        _ = resync.replay_finished(false);
        _ = resync.retry_due();

        _ = resync.replay_finished(true);

        assert_eq!(resync.cursor().replay_failure_count, 0);
    }

    #[test]
    fn connection_loss_requeues_outstanding_replay() {
        let mut resync = ResyncCoordinator::new(ReplayRetryPolicy::Disabled);
        _ = resync.observe(&frame(0, 10));
        _ = resync.request(at(10), true);

        resync.connection_lost();

        assert!(!resync.has_seen_session_start(), "counter state is per socket");
        assert_eq!(resync.replay_finished(true), None, "nothing is outstanding");
        assert_eq!(resync.resume_from(), Some(at(10)));
    }

    #[test]
    fn reset_forgets_history() {
        let mut resync = ResyncCoordinator::new(ReplayRetryPolicy::Disabled);
        _ = resync.observe(&frame(0, 10));
        _ = resync.request(at(5), false);

        resync.reset();

        assert_eq!(resync.cursor(), ResyncCursor::default());
        assert_eq!(resync.resume_from(), None);
    }
}
