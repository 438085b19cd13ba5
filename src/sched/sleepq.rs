/*!
 * Sleep Queue
 *
 * Wait channels for generic sleep/wakeup.
 *
 * One condvar is shared by every channel; a wakeup bumps the channel's
 * generation and broadcasts, and sleepers compare generations to tell their
 * wakeup from one meant for another channel. Spurious wakeups are therefore
 * expected and cheap.
 */

use crate::core::types::WaitChannel;
use ahash::RandomState;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::trace;

/// How a generic sleep ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SleepResult {
    /// A wakeup was issued on the channel
    Woken,
    /// The timeout expired first
    TimedOut,
    /// The LWP was asked to quit
    Interrupted,
}

#[derive(Debug, Default)]
struct Channel {
    generation: u64,
    sleepers: usize,
}

/// Sleep queue contents, guarded by the queue mutex
#[derive(Debug, Default)]
pub struct SleepState {
    channels: HashMap<WaitChannel, Channel, RandomState>,
}

impl SleepState {
    /// Register a sleeper; returns the ticket to compare against
    pub(crate) fn enqueue(&mut self, chan: WaitChannel) -> u64 {
        let entry = self.channels.entry(chan).or_default();
        entry.sleepers += 1;
        entry.generation
    }

    /// True once `chan` was woken after `ticket` was issued
    pub(crate) fn woken(&self, chan: WaitChannel, ticket: u64) -> bool {
        self.channels
            .get(&chan)
            .map_or(true, |c| c.generation != ticket)
    }

    pub(crate) fn dequeue(&mut self, chan: WaitChannel) {
        if let Some(entry) = self.channels.get_mut(&chan) {
            entry.sleepers = entry.sleepers.saturating_sub(1);
            if entry.sleepers == 0 {
                self.channels.remove(&chan);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct SleepQueue {
    state: Mutex<SleepState>,
    cv: Condvar,
}

impl SleepQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SleepState> {
        self.state.lock()
    }

    #[inline]
    pub(crate) fn condvar(&self) -> &Condvar {
        &self.cv
    }

    /// Wake every sleeper on `chan`; returns how many were sleeping
    pub fn wakeup(&self, chan: WaitChannel) -> usize {
        let mut state = self.state.lock();
        let Some(entry) = state.channels.get_mut(&chan) else {
            return 0;
        };
        entry.generation = entry.generation.wrapping_add(1);
        let sleepers = entry.sleepers;
        drop(state);

        self.cv.notify_all();
        trace!(%chan, sleepers, "wakeup");
        sleepers
    }

    /// Make every sleeper re-check its quit flag
    ///
    /// Taking the queue lock orders this after any flag set before the call,
    /// so a sleeper either sees the flag before waiting or is woken here.
    pub fn interrupt_all(&self) {
        let _state = self.state.lock();
        self.cv.notify_all();
    }

    pub fn sleepers(&self, chan: WaitChannel) -> usize {
        self.state
            .lock()
            .channels
            .get(&chan)
            .map_or(0, |c| c.sleepers)
    }
}
