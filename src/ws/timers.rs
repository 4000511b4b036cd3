//! One-shot timers owned by the connection task.
//!
//! Each [`TimerKind`] has at most one pending timer. Scheduling a kind supersedes whatever was
//! pending for it. A fired timer is only honoured if its generation still matches the slot,
//! so a firing that raced with a cancel is dropped.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKind {
    ConnectTimeout,
    Reconnect,
    Keepalive,
    ReplayRetry,
    CounterProbe,
}

impl TimerKind {
    const COUNT: usize = 5;

    const fn index(self) -> usize {
        match self {
            Self::ConnectTimeout => 0,
            Self::Reconnect => 1,
            Self::Keepalive => 2,
            Self::ReplayRetry => 3,
            Self::CounterProbe => 4,
        }
    }
}

#[derive(Debug)]
struct Slot {
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
pub(crate) struct Timers {
    slots: [Option<Slot>; TimerKind::COUNT],
    generation: u64,
}

impl Timers {
    /// Arm `kind` to call `on_fire(kind, generation)` after `delay`.
    pub(crate) fn schedule<F>(&mut self, kind: TimerKind, delay: Duration, on_fire: F)
    where
        F: FnOnce(TimerKind, u64) + Send + 'static,
    {
        self.cancel(kind);
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;

        let task = tokio::spawn(async move {
            sleep(delay).await;
            on_fire(kind, generation);
        });

        self.slots[kind.index()] = Some(Slot { generation, task });
    }

    pub(crate) fn cancel(&mut self, kind: TimerKind) {
        if let Some(slot) = self.slots[kind.index()].take() {
            slot.task.abort();
        }
    }

    pub(crate) fn cancel_all(&mut self) {
        for slot in self.slots.iter_mut().filter_map(Option::take) {
            slot.task.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self, kind: TimerKind) -> bool {
        self.slots[kind.index()].is_some()
    }

    /// Claim a firing. Returns `true` and clears the slot if `generation` is the current one.
    pub(crate) fn fire(&mut self, kind: TimerKind, generation: u64) -> bool {
        let slot = &mut self.slots[kind.index()];
        if slot.as_ref().is_some_and(|s| s.generation == generation) {
            *slot = None;
            true
        } else {
            false
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
