//! The nice-level scheduling algorithm and the reactor main loop.
//!
//! [`NiceScheduler`] is the pluggable algorithm driving one context
//! thread: per-priority FIFO ready queues for worker fibers, one extra
//! queue for the dispatcher (placing it below every worker), and the
//! coupling that keeps the reactor and the fiber population from starving
//! each other:
//!
//! - While the main-loop fiber is parked (`LOOP_SUSPEND`), every worker
//!   resumption bumps `switch_cnt`; past `MAIN_SWITCH_LIMIT` the main
//!   loop is re-admitted so a busy fiber population cannot shut out I/O.
//! - When nothing is runnable, the dispatcher idles the thread through
//!   [`NiceScheduler::suspend_until`], arming the suspend timer so the
//!   reactor's blocking wait is bounded by the earliest fiber deadline.
//! - External wakes re-arm the suspend timer to fire immediately
//!   ([`NiceScheduler::notify`]), yanking `run_one` out of a long block.
//!
//! The `LOOP_RUN_ONE` and `LOOP_SUSPEND` flags are tracked independently;
//! their conjunction — the main loop simultaneously blocked in `run_one`
//! and parked waiting for a wake — is a self-deadlock, and
//! `suspend_until` aborts on it. Seeing `LOOP_RUN_ONE` alone is normal
//! there: the dispatcher runs on its own thread, so it can observe the
//! main loop's ordinary blocking wait in passing.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

use crate::fiber::{self, FiberContext, FiberKind, NUM_NICE_LEVELS};
use crate::metrics::SpindleMetrics;
use crate::reactor::{Reactor, Timer};

/// Nice level of the main-loop fiber: the highest priority.
pub const MAIN_NICE_LEVEL: u8 = 0;

/// Worker resumptions tolerated between main-loop turns while it is
/// parked.
pub(crate) const MAIN_SWITCH_LIMIT: u32 = 4;

const LOOP_RUN_ONE: u8 = 1;
const LOOP_SUSPEND: u8 = 2;

/// The capability set the fiber runtime expects from a scheduling
/// algorithm.
pub trait SchedAlgorithm: Send + Sync {
    /// Link a fiber into the ready set. Pre: it is not currently linked.
    fn awakened(&self, ctx: &Arc<FiberContext>);

    /// Pop the fiber to run next, or `None` when nothing is runnable.
    fn pick_next(&self) -> Option<Arc<FiberContext>>;

    /// A queued fiber's scheduling properties changed; re-bucket it.
    fn property_change(&self, ctx: &Arc<FiberContext>);

    /// Whether any worker fiber is ready (the dispatcher never counts).
    fn has_ready_fibers(&self) -> bool;

    /// Dispatcher-only: idle the thread until `wake_at` (`None` = until
    /// externally notified).
    fn suspend_until(&self, wake_at: Option<Instant>);

    /// Thread-safe external wake: fiber-level work became available while
    /// the reactor may be blocked.
    fn notify(&self);
}

struct SchedState {
    ready_queues: [VecDeque<Arc<FiberContext>>; NUM_NICE_LEVELS],
    dispatch_queue: VecDeque<Arc<FiberContext>>,
    // Ready *worker* fibers; excludes the dispatcher by construction.
    ready_cnt: usize,
    // Cached highest-priority non-empty bucket; advanced past empties in
    // pick_next, pulled back on higher-priority enqueues.
    last_nice_level: usize,
    switch_cnt: u32,
    mask: u8,
}

/// Priority scheduler integrating the fiber runtime with one [`Reactor`].
pub struct NiceScheduler {
    reactor: Reactor,
    state: Mutex<SchedState>,
    // Parking slot for the main-loop fiber; holds at most one waiter.
    wake_waiter: Mutex<Option<Arc<FiberContext>>>,
    // Released (set to None) when the main loop exits; notify() is a
    // no-op from then on.
    suspend_timer: Mutex<Option<Timer>>,
    strict_kick: bool,
    metrics: Arc<SpindleMetrics>,
}

impl NiceScheduler {
    pub(crate) fn new(reactor: Reactor, strict_kick: bool, metrics: Arc<SpindleMetrics>) -> Self {
        let suspend_timer = reactor.timer();
        Self {
            reactor,
            state: Mutex::new(SchedState {
                ready_queues: Default::default(),
                dispatch_queue: VecDeque::new(),
                ready_cnt: 0,
                last_nice_level: 0,
                switch_cnt: 0,
                mask: 0,
            }),
            wake_waiter: Mutex::new(None),
            suspend_timer: Mutex::new(Some(suspend_timer)),
            strict_kick,
            metrics,
        }
    }

    fn link_locked(&self, state: &mut SchedState, ctx: &Arc<FiberContext>) {
        debug_assert!(
            !ctx.is_ready_linked(),
            "fiber already linked into a ready queue"
        );
        if ctx.kind() == FiberKind::Dispatcher {
            trace!(fiber = ctx.id(), "ready-link dispatcher");
            state.dispatch_queue.push_back(ctx.clone());
        } else {
            let nice = ctx.nice_level().min(crate::fiber::MAX_NICE_LEVEL) as usize;
            state.ready_queues[nice].push_back(ctx.clone());
            state.ready_cnt += 1;
            if state.last_nice_level > nice {
                state.last_nice_level = nice;
            }
            self.metrics.ready_fibers.set(state.ready_cnt as i64);
            trace!(fiber = ctx.id(), nice, "ready-link");
        }
        ctx.set_ready_linked(true);
    }

    fn unlink_locked(&self, state: &mut SchedState, ctx: &Arc<FiberContext>) {
        if ctx.kind() == FiberKind::Dispatcher {
            state.dispatch_queue.retain(|c| !Arc::ptr_eq(c, ctx));
        } else {
            let mut removed = 0;
            for queue in state.ready_queues.iter_mut() {
                let before = queue.len();
                queue.retain(|c| !Arc::ptr_eq(c, ctx));
                removed += before - queue.len();
            }
            debug_assert_eq!(removed, 1, "linked fiber missing from ready queues");
            state.ready_cnt -= removed;
            self.metrics.ready_fibers.set(state.ready_cnt as i64);
        }
        ctx.set_ready_linked(false);
    }

    // Hand the run token intent to the parked main-loop fiber, if any.
    // Issued outside the state lock: waking re-enters awakened().
    fn kick_main_loop(&self) {
        let waiter = self.wake_waiter.lock().take();
        if let Some(ctx) = waiter {
            trace!("waking main loop fiber");
            fiber::schedule(&ctx);
        }
    }

    fn set_mask_bit(&self, bit: u8, on: bool) {
        let mut state = self.state.lock();
        if on {
            state.mask |= bit;
        } else {
            state.mask &= !bit;
        }
    }

    /// The main-fiber body: alternate between draining the reactor and
    /// letting the fiber population run, blocking in `run_one` only when
    /// no fiber is runnable.
    pub(crate) fn main_loop(&self) {
        while !self.reactor.is_stopped() {
            if self.has_ready_fibers() {
                while self.reactor.poll() > 0 {}
                self.wait_till_fibers_suspend();
            } else {
                self.set_mask_bit(LOOP_RUN_ONE, true);
                let ran = self.reactor.run_one();
                self.set_mask_bit(LOOP_RUN_ONE, false);
                if !ran {
                    break;
                }
            }
        }
        debug!("main loop exited");
        // Break the timer registration before returning so late notify()
        // calls cannot reach a dead loop.
        *self.suspend_timer.lock() = None;
    }

    // Park the main fiber until the dispatcher reports the ready set
    // drained, or until MAIN_SWITCH_LIMIT forced resumptions.
    fn wait_till_fibers_suspend(&self) {
        let Some((rt, ctx)) = fiber::current() else {
            return;
        };
        {
            let mut state = self.state.lock();
            state.mask |= LOOP_SUSPEND;
            state.switch_cnt = 0;
        }
        *self.wake_waiter.lock() = Some(ctx.clone());
        trace!("main loop parked");
        fiber::switch_out(&rt, &ctx, false);
        self.set_mask_bit(LOOP_SUSPEND, false);
        trace!("main loop resumed");
    }
}

impl SchedAlgorithm for NiceScheduler {
    fn awakened(&self, ctx: &Arc<FiberContext>) {
        let mut state = self.state.lock();
        self.link_locked(&mut state, ctx);
    }

    fn pick_next(&self) -> Option<Arc<FiberContext>> {
        let (picked, kick) = {
            let mut state = self.state.lock();
            let mut picked = None;
            let mut kick = false;
            while state.last_nice_level < NUM_NICE_LEVELS {
                let level = state.last_nice_level;
                if let Some(ctx) = state.ready_queues[level].pop_front() {
                    ctx.set_ready_linked(false);
                    debug_assert!(state.ready_cnt > 0);
                    state.ready_cnt -= 1;
                    self.metrics.ready_fibers.set(state.ready_cnt as i64);
                    self.metrics.context_switches.inc();
                    if state.mask & LOOP_SUSPEND != 0 {
                        let counts = !self.strict_kick
                            || (level > MAIN_NICE_LEVEL as usize && state.ready_cnt > 1);
                        if counts {
                            state.switch_cnt += 1;
                            if state.switch_cnt > MAIN_SWITCH_LIMIT {
                                kick = true;
                            }
                        }
                    }
                    picked = Some(ctx);
                    break;
                }
                state.last_nice_level += 1;
            }
            if picked.is_none() {
                debug_assert_eq!(state.ready_cnt, 0);
                picked = state.dispatch_queue.pop_front().map(|ctx| {
                    ctx.set_ready_linked(false);
                    trace!("switching to dispatcher");
                    ctx
                });
            }
            (picked, kick)
        };
        if kick {
            self.metrics.main_loop_resumes.inc();
            self.kick_main_loop();
        }
        picked
    }

    fn property_change(&self, ctx: &Arc<FiberContext>) {
        let mut state = self.state.lock();
        // The fiber may not be queued at all (it could be the running
        // fiber); the next awakened() handles it then.
        if !ctx.is_ready_linked() {
            return;
        }
        self.unlink_locked(&mut state, ctx);
        self.link_locked(&mut state, ctx);
    }

    fn has_ready_fibers(&self) -> bool {
        self.state.lock().ready_cnt > 0
    }

    fn suspend_until(&self, wake_at: Option<Instant>) {
        if let Some((_, ctx)) = fiber::current() {
            debug_assert!(
                ctx.kind() == FiberKind::Dispatcher,
                "suspend_until called from a non-dispatcher fiber"
            );
        }
        if let Some(at) = wake_at {
            let timer = self.suspend_timer.lock();
            if let Some(timer) = timer.as_ref() {
                // Re-arming an unchanged deadline would cancel and
                // re-register the same wait on every dispatcher pass,
                // spinning run_one through aborted handlers.
                if timer.expiry() != Some(at) {
                    timer.expires_at(at);
                    timer.async_wait(|_| fiber::yield_now());
                }
            }
        }
        {
            let state = self.state.lock();
            // LOOP_RUN_ONE alone is the main loop's ordinary idle block,
            // which this thread may observe in passing; combined with
            // LOOP_SUSPEND the main loop claims to be blocked and parked
            // at once, and nothing can ever wake it.
            assert!(
                state.mask & LOOP_RUN_ONE == 0 || state.mask & LOOP_SUSPEND == 0,
                "deadlock: main loop marked both blocked in run_one and parked"
            );
        }
        self.kick_main_loop();
    }

    fn notify(&self) {
        let timer = self.suspend_timer.lock();
        match timer.as_ref() {
            None => debug!("notify() after main loop shutdown, ignored"),
            Some(timer) => {
                self.metrics.remote_wakes.inc();
                // Reset rather than cancel: cancel keeps the old expiry,
                // which would collide with the dedup check in
                // suspend_until. The cost is one spurious pass through
                // the loop (aborted wait plus elapsed expiry).
                timer.async_wait(|_| fiber::yield_now());
                timer.expires_at(Instant::now());
            }
        }
    }
}
