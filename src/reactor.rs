//! Event-driven reactor: a handler queue, one-shot timers, and a
//! thread-safe post queue sharing a single blocking wait.
//!
//! The reactor is the kernel-facing half of a context thread. Fibers and
//! external threads enqueue handlers with [`Reactor::post`]; the owning
//! thread drains them with [`Reactor::poll`] (non-blocking) or
//! [`Reactor::run_one`] (blocks until exactly one handler has run).
//! Re-arming a timer cancels its outstanding waits, and cancelled waits
//! are still delivered, with [`TimerStatus::Aborted`].
//!
//! Both `poll` and `run_one` release the internal lock while a handler
//! executes, so handlers may re-enter the reactor — the fiber main loop
//! runs entirely inside a posted handler and nests `run_one` calls.

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::Arc;
use std::time::Instant;

/// How a timer wait completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerStatus {
    /// The deadline was reached.
    Fired,
    /// The wait was cancelled by a re-arm, an explicit cancel, or the
    /// timer being dropped.
    Aborted,
}

type Handler = Box<dyn FnOnce() + Send + 'static>;
type WaitHandler = Box<dyn FnOnce(TimerStatus) + Send + 'static>;

/// A cheaply clonable handle to one event loop.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    // Signalled on post, stop, and any timer re-arm that may shorten the
    // current blocking wait.
    work_cv: Condvar,
}

struct State {
    ready: VecDeque<Handler>,
    timers: HashMap<u64, TimerSlot>,
    next_timer_id: u64,
    stopped: bool,
}

struct TimerSlot {
    expiry: Option<Instant>,
    waiters: Vec<WaitHandler>,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    ready: VecDeque::new(),
                    timers: HashMap::new(),
                    next_timer_id: 0,
                    stopped: false,
                }),
                work_cv: Condvar::new(),
            }),
        }
    }

    /// Enqueue a handler from any thread.
    ///
    /// Handlers posted while the reactor is stopped stay queued and run
    /// after [`Reactor::restart`].
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_boxed(Box::new(f));
    }

    pub(crate) fn post_boxed(&self, handler: Handler) {
        let mut state = self.inner.state.lock();
        state.ready.push_back(handler);
        self.inner.work_cv.notify_one();
    }

    /// Run every immediately-runnable handler, without blocking.
    ///
    /// Handlers enqueued by the handlers themselves are run too; the call
    /// returns once the ready queue is empty (or the reactor is stopped)
    /// and reports how many handlers ran.
    pub fn poll(&self) -> usize {
        let mut count = 0;
        loop {
            let handler = {
                let mut state = self.inner.state.lock();
                if state.stopped {
                    return count;
                }
                Self::sweep_timers(&mut state);
                state.ready.pop_front()
            };
            match handler {
                Some(h) => {
                    h();
                    count += 1;
                }
                None => return count,
            }
        }
    }

    /// Block the calling thread until exactly one handler has run.
    ///
    /// Returns `false` only when the reactor has been stopped.
    pub fn run_one(&self) -> bool {
        let handler = {
            let mut state = self.inner.state.lock();
            loop {
                if state.stopped {
                    return false;
                }
                Self::sweep_timers(&mut state);
                if let Some(h) = state.ready.pop_front() {
                    break h;
                }
                match Self::next_deadline(&state) {
                    Some(deadline) => {
                        let _ = self.inner.work_cv.wait_until(&mut state, deadline);
                    }
                    None => {
                        self.inner.work_cv.wait(&mut state);
                    }
                }
            }
        };
        handler();
        true
    }

    /// Stop the reactor. Pending handlers are retained and run after a
    /// [`Reactor::restart`].
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        state.stopped = true;
        self.inner.work_cv.notify_all();
    }

    /// Clear the stopped flag so `poll`/`run_one` process work again.
    pub fn restart(&self) {
        self.inner.state.lock().stopped = false;
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.state.lock().stopped
    }

    /// Create a one-shot timer owned by this reactor.
    pub fn timer(&self) -> Timer {
        let mut state = self.inner.state.lock();
        let id = state.next_timer_id;
        state.next_timer_id += 1;
        state.timers.insert(
            id,
            TimerSlot {
                expiry: None,
                waiters: Vec::new(),
            },
        );
        Timer {
            inner: Arc::clone(&self.inner),
            id,
        }
    }

    fn sweep_timers(state: &mut State) {
        let now = Instant::now();
        let mut due: Vec<WaitHandler> = Vec::new();
        for slot in state.timers.values_mut() {
            if slot.expiry.is_some_and(|at| at <= now) && !slot.waiters.is_empty() {
                due.append(&mut slot.waiters);
            }
        }
        for waiter in due {
            state
                .ready
                .push_back(Box::new(move || waiter(TimerStatus::Fired)));
        }
    }

    fn next_deadline(state: &State) -> Option<Instant> {
        state
            .timers
            .values()
            .filter(|slot| !slot.waiters.is_empty())
            .filter_map(|slot| slot.expiry)
            .min()
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Reactor")
            .field("ready", &state.ready.len())
            .field("timers", &state.timers.len())
            .field("stopped", &state.stopped)
            .finish()
    }
}

/// A one-shot timer bound to a [`Reactor`].
///
/// Re-arming with [`Timer::expires_at`] cancels outstanding waits and
/// delivers them with [`TimerStatus::Aborted`]; this is what the
/// scheduler's `notify` relies on to yank `run_one` out of a long wait.
pub struct Timer {
    inner: Arc<Inner>,
    id: u64,
}

impl Timer {
    /// Set the expiry, cancelling any outstanding waits.
    ///
    /// Returns the number of waits that were aborted.
    pub fn expires_at(&self, at: Instant) -> usize {
        let mut state = self.inner.state.lock();
        let Some(slot) = state.timers.get_mut(&self.id) else {
            return 0;
        };
        slot.expiry = Some(at);
        let aborted = mem::take(&mut slot.waiters);
        let count = aborted.len();
        for waiter in aborted {
            state
                .ready
                .push_back(Box::new(move || waiter(TimerStatus::Aborted)));
        }
        // The new deadline may be sooner than whatever run_one is
        // currently sleeping on.
        self.inner.work_cv.notify_all();
        count
    }

    /// Register a wait against the current expiry.
    ///
    /// If the expiry has already passed, the handler becomes runnable
    /// immediately with [`TimerStatus::Fired`]. A timer that was never
    /// armed holds the wait until `expires_at` resolves it.
    pub fn async_wait<F>(&self, f: F)
    where
        F: FnOnce(TimerStatus) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        let Some(slot) = state.timers.get_mut(&self.id) else {
            state
                .ready
                .push_back(Box::new(move || f(TimerStatus::Aborted)));
            return;
        };
        match slot.expiry {
            Some(at) if at <= Instant::now() => {
                state.ready.push_back(Box::new(move || f(TimerStatus::Fired)));
                self.inner.work_cv.notify_one();
            }
            _ => slot.waiters.push(Box::new(f)),
        }
    }

    /// Cancel outstanding waits without touching the expiry.
    ///
    /// Returns the number of waits aborted. Note that because the expiry
    /// is preserved, a subsequent `expires_at` with the same instant is
    /// indistinguishable from "already armed" — callers that dedup on the
    /// expiry must re-arm instead of cancelling.
    pub fn cancel(&self) -> usize {
        let mut state = self.inner.state.lock();
        let Some(slot) = state.timers.get_mut(&self.id) else {
            return 0;
        };
        let aborted = mem::take(&mut slot.waiters);
        let count = aborted.len();
        for waiter in aborted {
            state
                .ready
                .push_back(Box::new(move || waiter(TimerStatus::Aborted)));
        }
        self.inner.work_cv.notify_all();
        count
    }

    /// The current expiry, or `None` if the timer was never armed.
    pub fn expiry(&self) -> Option<Instant> {
        self.inner
            .state
            .lock()
            .timers
            .get(&self.id)
            .and_then(|slot| slot.expiry)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if let Some(slot) = state.timers.remove(&self.id) {
            for waiter in slot.waiters {
                state
                    .ready
                    .push_back(Box::new(move || waiter(TimerStatus::Aborted)));
            }
            self.inner.work_cv.notify_all();
        }
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer").field("id", &self.id).finish()
    }
}
