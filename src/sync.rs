//! Fiber-aware synchronization: single-shot events and count-down
//! latches.
//!
//! Both primitives serve two worlds at once: `wait()` suspends the
//! calling fiber when invoked on a runtime thread, and blocks the OS
//! thread otherwise. The signalling side is callable from any thread;
//! fiber waiters are woken through the owning runtime's remote-ready
//! queue, which in turn pulls the reactor out of a blocking wait.

use parking_lot::{Condvar, Mutex};
use std::mem;
use std::sync::Arc;

use crate::fiber::{self, FiberContext};

struct EventState {
    set: bool,
    fiber_waiters: Vec<Arc<FiberContext>>,
}

struct EventInner {
    state: Mutex<EventState>,
    cv: Condvar,
}

/// A single-shot event: one `notify`, any number of waiters.
#[derive(Clone)]
pub struct Done {
    inner: Arc<EventInner>,
}

impl Default for Done {
    fn default() -> Self {
        Self::new()
    }
}

impl Done {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EventInner {
                state: Mutex::new(EventState {
                    set: false,
                    fiber_waiters: Vec::new(),
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// Fire the event and wake every waiter. Idempotent.
    pub fn notify(&self) {
        let waiters = {
            let mut state = self.inner.state.lock();
            state.set = true;
            self.inner.cv.notify_all();
            mem::take(&mut state.fiber_waiters)
        };
        for ctx in waiters {
            fiber::schedule(&ctx);
        }
    }

    /// Block until the event fires.
    pub fn wait(&self) {
        if let Some((rt, ctx)) = fiber::current() {
            loop {
                {
                    let mut state = self.inner.state.lock();
                    if state.set {
                        return;
                    }
                    state.fiber_waiters.push(ctx.clone());
                }
                fiber::switch_out(&rt, &ctx, false);
            }
        } else {
            let mut state = self.inner.state.lock();
            while !state.set {
                self.inner.cv.wait(&mut state);
            }
        }
    }

    pub fn is_set(&self) -> bool {
        self.inner.state.lock().set
    }
}

impl std::fmt::Debug for Done {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Done")
            .field("set", &self.is_set())
            .finish()
    }
}

struct LatchState {
    count: usize,
    fiber_waiters: Vec<Arc<FiberContext>>,
}

struct LatchInner {
    state: Mutex<LatchState>,
    cv: Condvar,
}

/// A count-down latch: `wait` returns once `dec` has been called `count`
/// times.
#[derive(Clone)]
pub struct BlockingCounter {
    inner: Arc<LatchInner>,
}

impl BlockingCounter {
    pub fn new(count: usize) -> Self {
        Self {
            inner: Arc::new(LatchInner {
                state: Mutex::new(LatchState {
                    count,
                    fiber_waiters: Vec::new(),
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// Count one completion down. Extra calls past zero are ignored.
    pub fn dec(&self) {
        let waiters = {
            let mut state = self.inner.state.lock();
            state.count = state.count.saturating_sub(1);
            if state.count > 0 {
                return;
            }
            self.inner.cv.notify_all();
            mem::take(&mut state.fiber_waiters)
        };
        for ctx in waiters {
            fiber::schedule(&ctx);
        }
    }

    /// Block until the count reaches zero.
    pub fn wait(&self) {
        if let Some((rt, ctx)) = fiber::current() {
            loop {
                {
                    let mut state = self.inner.state.lock();
                    if state.count == 0 {
                        return;
                    }
                    state.fiber_waiters.push(ctx.clone());
                }
                fiber::switch_out(&rt, &ctx, false);
            }
        } else {
            let mut state = self.inner.state.lock();
            while state.count > 0 {
                self.inner.cv.wait(&mut state);
            }
        }
    }

    pub fn count(&self) -> usize {
        self.inner.state.lock().count
    }
}

impl std::fmt::Debug for BlockingCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingCounter")
            .field("count", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_done_notify_before_wait() {
        let done = Done::new();
        done.notify();
        // Completed event: wait returns immediately.
        done.wait();
        assert!(done.is_set());
    }

    #[test]
    fn test_done_cross_thread() {
        let done = Done::new();
        let d = done.clone();
        let signaller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            d.notify();
        });
        done.wait();
        signaller.join().unwrap();
    }

    #[test]
    fn test_done_notify_idempotent() {
        let done = Done::new();
        done.notify();
        done.notify();
        done.wait();
    }

    #[test]
    fn test_counter_reaches_zero() {
        let counter = BlockingCounter::new(3);
        assert_eq!(counter.count(), 3);
        counter.dec();
        counter.dec();
        assert_eq!(counter.count(), 1);
        counter.dec();
        counter.wait();
        assert_eq!(counter.count(), 0);
    }

    #[test]
    fn test_counter_zero_waits_immediately() {
        let counter = BlockingCounter::new(0);
        counter.wait();
    }

    #[test]
    fn test_counter_extra_dec_ignored() {
        let counter = BlockingCounter::new(1);
        counter.dec();
        counter.dec();
        assert_eq!(counter.count(), 0);
    }

    #[test]
    fn test_counter_many_threads() {
        let counter = BlockingCounter::new(8);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = counter.clone();
            handles.push(thread::spawn(move || c.dec()));
        }
        counter.wait();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
