//! One-shot timer queue backing queued-request timeouts.
//!
//! A single background thread per queue sleeps until the earliest deadline and
//! then runs that timer's callback with the queue lock released. Each arming
//! bumps a generation counter; cancelling bumps it again, so expiries that were
//! already scheduled simply fall out of the heap when they surface.

use crate::consts;
use crate::error::Result;
use log::{debug, trace};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Called on the timer thread with the generation that expired.
pub(crate) type TimerCallback = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Clone)]
pub(crate) struct TimerQueue {
    shared: Arc<TimerShared>,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wake: Condvar,
}

#[derive(Default)]
struct TimerState {
    pending: BinaryHeap<Reverse<Expiry>>,
    timers: HashMap<u64, TimerEntry>,
    next_id: u64,
    thread_running: bool,
}

struct TimerEntry {
    generation: u64,
    armed: bool,
    callback: TimerCallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Expiry {
    deadline: Instant,
    id: u64,
    generation: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(TimerShared {
                state: Mutex::new(TimerState::default()),
                wake: Condvar::new(),
            }),
        }
    }

    /// Creates a disarmed timer. Starts the queue thread on first use.
    pub(crate) fn create_timer(&self, callback: TimerCallback) -> Result<Timer> {
        let mut state = self.shared.state.lock();
        if !state.thread_running {
            let shared = Arc::clone(&self.shared);
            thread::Builder::new()
                .name("asyn-timer".to_string())
                .spawn(move || run(shared))?;
            state.thread_running = true;
            debug!("Started timer queue thread");
        }
        let id = state.next_id;
        state.next_id += 1;
        state.timers.insert(
            id,
            TimerEntry {
                generation: 0,
                armed: false,
                callback,
            },
        );
        Ok(Timer {
            id,
            shared: Arc::clone(&self.shared),
        })
    }
}

/// A re-armable one-shot timer owned by a request handle.
pub(crate) struct Timer {
    id: u64,
    shared: Arc<TimerShared>,
}

impl Timer {
    /// Arms the timer, replacing any earlier arming. Returns the new generation.
    pub(crate) fn start(&self, delay: Duration) -> u64 {
        let now = Instant::now();
        // Absurd delays saturate to a year instead of overflowing Instant.
        let deadline = now
            .checked_add(delay)
            .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 3600));
        let mut state = self.shared.state.lock();
        let Some(entry) = state.timers.get_mut(&self.id) else {
            return 0;
        };
        entry.generation += 1;
        entry.armed = true;
        let generation = entry.generation;
        state.pending.push(Reverse(Expiry {
            deadline,
            id: self.id,
            generation,
        }));
        self.shared.wake.notify_one();
        trace!("Timer {} armed for {:?} (generation {})", self.id, delay, generation);
        generation
    }

    /// Disarms the timer.
    ///
    /// The generation moves on even when nothing is armed, so an expiry whose
    /// callback is already running can no longer match.
    pub(crate) fn cancel(&self) {
        let mut state = self.shared.state.lock();
        if let Some(entry) = state.timers.get_mut(&self.id) {
            entry.armed = false;
            entry.generation += 1;
        }
    }

    /// True if `generation` is still the latest arming of this timer.
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        let state = self.shared.state.lock();
        state
            .timers
            .get(&self.id)
            .is_some_and(|entry| entry.generation == generation)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shared.state.lock().timers.remove(&self.id);
    }
}

fn run(shared: Arc<TimerShared>) {
    let mut state = shared.state.lock();
    loop {
        match next_live(&mut state) {
            Some(expiry) if expiry.deadline <= Instant::now() => {
                state.pending.pop();
                let callback = match state.timers.get_mut(&expiry.id) {
                    Some(entry) => {
                        entry.armed = false;
                        Arc::clone(&entry.callback)
                    }
                    None => continue,
                };
                trace!("Timer {} expired (generation {})", expiry.id, expiry.generation);
                MutexGuard::unlocked(&mut state, || callback(expiry.generation));
            }
            Some(expiry) => {
                shared.wake.wait_until(&mut state, expiry.deadline);
            }
            None => {
                // Only this thread still refers to the queue.
                if Arc::strong_count(&shared) == 1 {
                    state.thread_running = false;
                    debug!("Timer queue no longer referenced, stopping thread");
                    return;
                }
                shared.wake.wait_for(&mut state, consts::timer::IDLE_POLL);
            }
        }
    }
}

/// Discards stale expiries at the head of the heap and returns the first live one.
fn next_live(state: &mut TimerState) -> Option<Expiry> {
    loop {
        let head = match state.pending.peek() {
            None => return None,
            Some(Reverse(expiry)) => *expiry,
        };
        let live = state
            .timers
            .get(&head.id)
            .is_some_and(|entry| entry.armed && entry.generation == head.generation);
        if live {
            return Some(head);
        }
        state.pending.pop();
    }
}
