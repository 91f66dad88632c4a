//! Fiber contexts and the per-runtime switching machinery.
//!
//! A fiber is a cooperatively scheduled execution unit backed by a parked
//! OS thread. Every fiber owns a resume gate (a one-token mutex/condvar
//! pair); the scheduler hands the single run token from fiber to fiber,
//! so at most one fiber of a runtime executes at any instant and switches
//! happen only at explicit suspension points — yields, sleeps, latch
//! waits, and fiber completion. This preserves the single-threaded
//! cooperative model while keeping the crate in safe Rust.
//!
//! Three fiber kinds exist per runtime:
//!
//! - `Main` — the context's OS thread itself, driving the reactor loop.
//! - `Dispatcher` — a runtime-owned fiber that runs only when no worker
//!   is runnable; it wakes expired sleepers and idles the thread through
//!   the scheduler's `suspend_until`.
//! - `Worker` — user fibers spawned through an `IoContext`.
//!
//! Cross-thread wakes never touch scheduler queues directly: they go
//! through the runtime's remote-ready queue plus the scheduler's
//! `notify`, and are folded into the ready queues at the next switch
//! point.

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::sched::SchedAlgorithm;
use crate::sync::Done;

/// Highest (numerically largest, least urgent) nice level.
pub const MAX_NICE_LEVEL: u8 = 2;

/// Number of worker priority classes.
pub const NUM_NICE_LEVELS: usize = MAX_NICE_LEVEL as usize + 1;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Discriminates the three fiber roles a runtime manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberKind {
    /// The context thread's own execution, running the reactor loop.
    Main,
    /// The runtime-owned idle driver.
    Dispatcher,
    /// A user fiber.
    Worker,
}

/// Scheduling properties attached to every fiber.
#[derive(Debug, Clone)]
pub struct FiberProps {
    nice_level: u8,
    name: String,
}

impl FiberProps {
    /// New properties at the lowest priority.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            nice_level: MAX_NICE_LEVEL,
            name: name.into(),
        }
    }

    /// Builder-style nice level override. Values above [`MAX_NICE_LEVEL`]
    /// are clamped.
    pub fn with_nice_level(mut self, nice: u8) -> Self {
        self.nice_level = nice.min(MAX_NICE_LEVEL);
        self
    }

    pub fn nice_level(&self) -> u8 {
        self.nice_level
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Clamp-and-set; reports whether the value changed so callers know
    /// whether the scheduler needs a re-bucketing pass.
    pub(crate) fn set_nice_level(&mut self, nice: u8) -> bool {
        let nice = nice.min(MAX_NICE_LEVEL);
        if nice == self.nice_level {
            return false;
        }
        self.nice_level = nice;
        true
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }
}

impl Default for FiberProps {
    fn default() -> Self {
        Self::new("fiber")
    }
}

// One-token gate: `grant` hands the run token, `acquire` blocks until it
// arrives. A grant delivered before the acquire is not lost, which makes
// wake-before-sleep races benign.
struct ResumeGate {
    token: Mutex<bool>,
    cv: Condvar,
}

impl ResumeGate {
    fn new() -> Self {
        Self {
            token: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn grant(&self) {
        *self.token.lock() = true;
        self.cv.notify_one();
    }

    fn acquire(&self) {
        let mut token = self.token.lock();
        while !*token {
            self.cv.wait(&mut token);
        }
        *token = false;
    }
}

/// A first-class suspendable execution unit, owned by the runtime.
pub struct FiberContext {
    id: u64,
    kind: FiberKind,
    props: Mutex<FiberProps>,
    // Maintained under the scheduler's state lock: true iff the fiber is
    // currently linked into exactly one ready queue.
    ready_linked: AtomicBool,
    gate: ResumeGate,
    owner: OnceLock<Arc<RuntimeHandle>>,
}

impl FiberContext {
    pub(crate) fn new(kind: FiberKind, props: FiberProps) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            props: Mutex::new(props),
            ready_linked: AtomicBool::new(false),
            gate: ResumeGate::new(),
            owner: OnceLock::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> FiberKind {
        self.kind
    }

    pub fn name(&self) -> String {
        self.props.lock().name().to_string()
    }

    pub fn nice_level(&self) -> u8 {
        self.props.lock().nice_level()
    }

    pub(crate) fn is_ready_linked(&self) -> bool {
        self.ready_linked.load(Ordering::Relaxed)
    }

    pub(crate) fn set_ready_linked(&self, linked: bool) {
        self.ready_linked.store(linked, Ordering::Relaxed);
    }

    pub(crate) fn bind(&self, owner: Arc<RuntimeHandle>) {
        let _ = self.owner.set(owner);
    }

    pub(crate) fn owner(&self) -> &Arc<RuntimeHandle> {
        self.owner.get().expect("fiber not bound to a runtime")
    }

    pub(crate) fn update_props<R>(&self, f: impl FnOnce(&mut FiberProps) -> R) -> R {
        f(&mut self.props.lock())
    }
}

impl std::fmt::Debug for FiberContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberContext")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.props.lock().name)
            .finish()
    }
}

struct Sleeper {
    wake_at: Instant,
    ctx: Arc<FiberContext>,
}

// Reverse comparison so the BinaryHeap pops the earliest deadline first.
impl Ord for Sleeper {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.wake_at.cmp(&self.wake_at)
    }
}

impl PartialOrd for Sleeper {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Sleeper {
    fn eq(&self, other: &Self) -> bool {
        self.wake_at == other.wake_at && self.ctx.id == other.ctx.id
    }
}

impl Eq for Sleeper {}

/// Shared per-runtime state: the installed scheduling algorithm, the
/// remote-ready queue, the sleep queue, and the dispatcher identity.
pub(crate) struct RuntimeHandle {
    algo: OnceLock<Arc<dyn SchedAlgorithm>>,
    remote: SegQueue<Arc<FiberContext>>,
    dispatcher: OnceLock<Arc<FiberContext>>,
    dispatcher_thread: Mutex<Option<thread::JoinHandle<()>>>,
    sleepers: Mutex<BinaryHeap<Sleeper>>,
    shutdown: AtomicBool,
    prefix: Arc<str>,
    // Runs first on every thread the runtime creates (dispatcher and
    // worker backings); the IoContext uses it to propagate its
    // thread-local identity.
    thread_init: Arc<dyn Fn() + Send + Sync>,
}

impl RuntimeHandle {
    pub(crate) fn new(prefix: Arc<str>, thread_init: Arc<dyn Fn() + Send + Sync>) -> Arc<Self> {
        Arc::new(Self {
            algo: OnceLock::new(),
            remote: SegQueue::new(),
            dispatcher: OnceLock::new(),
            dispatcher_thread: Mutex::new(None),
            sleepers: Mutex::new(BinaryHeap::new()),
            shutdown: AtomicBool::new(false),
            prefix,
            thread_init,
        })
    }

    pub(crate) fn set_algo(&self, algo: Arc<dyn SchedAlgorithm>) {
        let _ = self.algo.set(algo);
    }

    pub(crate) fn algo(&self) -> &Arc<dyn SchedAlgorithm> {
        self.algo.get().expect("no scheduling algorithm installed")
    }

    pub(crate) fn dispatcher(&self) -> &Arc<FiberContext> {
        self.dispatcher.get().expect("runtime not installed")
    }

    pub(crate) fn remote_ready(&self, ctx: Arc<FiberContext>) {
        self.remote.push(ctx);
        self.algo().notify();
    }

    // Fold cross-thread wakes and expired sleepers into the ready queues.
    // Called at every switch point and on each dispatcher pass.
    fn pump(&self) {
        let algo = self.algo();
        while let Some(ctx) = self.remote.pop() {
            algo.awakened(&ctx);
        }
        let now = Instant::now();
        loop {
            let due = {
                let mut sleepers = self.sleepers.lock();
                if sleepers.peek().is_some_and(|s| s.wake_at <= now) {
                    sleepers.pop().map(|s| s.ctx)
                } else {
                    None
                }
            };
            match due {
                Some(ctx) => algo.awakened(&ctx),
                None => break,
            }
        }
    }

    fn next_sleeper_deadline(&self) -> Option<Instant> {
        self.sleepers.lock().peek().map(|s| s.wake_at)
    }

    #[cfg(test)]
    pub(crate) fn pop_remote(&self) -> Option<Arc<FiberContext>> {
        self.remote.pop()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<(Arc<RuntimeHandle>, Arc<FiberContext>)>> =
        const { RefCell::new(None) };
}

pub(crate) fn current() -> Option<(Arc<RuntimeHandle>, Arc<FiberContext>)> {
    CURRENT.with(|c| c.borrow().clone())
}

fn set_current(rt: Arc<RuntimeHandle>, ctx: Arc<FiberContext>) {
    CURRENT.with(|c| *c.borrow_mut() = Some((rt, ctx)));
}

fn clear_current() {
    CURRENT.with(|c| *c.borrow_mut() = None);
}

/// Install a runtime on the calling thread: the calling thread becomes
/// the main fiber and a dispatcher fiber is started alongside it.
pub(crate) fn install(rt: &Arc<RuntimeHandle>) -> Arc<FiberContext> {
    let main_ctx = FiberContext::new(FiberKind::Main, FiberProps::new("main"));
    main_ctx.bind(rt.clone());

    let dispatcher = FiberContext::new(FiberKind::Dispatcher, FiberProps::new("dispatcher"));
    dispatcher.bind(rt.clone());
    let _ = rt.dispatcher.set(dispatcher.clone());

    let rt2 = rt.clone();
    let handle = thread::Builder::new()
        .name(format!("{}-dispatch", rt.prefix))
        .spawn(move || dispatcher_main(rt2, dispatcher))
        .expect("failed to spawn dispatcher thread");
    *rt.dispatcher_thread.lock() = Some(handle);

    set_current(rt.clone(), main_ctx.clone());
    main_ctx
}

/// Tear the runtime down: stop the dispatcher and clear the thread-local
/// identity. Callable only from the installing thread, after the ready
/// set has drained.
pub(crate) fn uninstall(rt: &Arc<RuntimeHandle>) {
    rt.shutdown.store(true, Ordering::Release);
    rt.dispatcher().gate.grant();
    if let Some(handle) = rt.dispatcher_thread.lock().take() {
        let _ = handle.join();
    }
    clear_current();
}

fn dispatcher_main(rt: Arc<RuntimeHandle>, ctx: Arc<FiberContext>) {
    (rt.thread_init)();
    set_current(rt.clone(), ctx.clone());
    ctx.gate.acquire();
    loop {
        if rt.shutdown.load(Ordering::Acquire) {
            break;
        }
        rt.pump();
        let mut next = rt.algo().pick_next();
        if next.is_none() {
            // Nothing runnable: idle the thread through the scheduler.
            // Its wake re-queues a parked main loop, which the retry
            // hands off below; if even the retry comes back empty, the
            // main loop is blocked inside the reactor and drives
            // progress on its own.
            rt.algo().suspend_until(rt.next_sleeper_deadline());
            next = rt.algo().pick_next();
        }
        if let Some(next) = next {
            debug_assert!(!Arc::ptr_eq(&next, &ctx));
            next.gate.grant();
        }
        // Park until a suspending fiber hands control back.
        ctx.gate.acquire();
    }
    trace!("dispatcher exited");
    clear_current();
}

/// Suspend the running fiber and transfer control to the next runnable
/// one. With `reenqueue`, the fiber goes back into its ready queue first
/// (a yield); without, it parks until something calls [`schedule`] on it.
pub(crate) fn switch_out(rt: &Arc<RuntimeHandle>, current: &Arc<FiberContext>, reenqueue: bool) {
    let algo = rt.algo();
    rt.pump();
    if reenqueue {
        algo.awakened(current);
    }
    let dispatcher = rt.dispatcher();
    if !dispatcher.is_ready_linked() && !Arc::ptr_eq(current, dispatcher) {
        algo.awakened(dispatcher);
    }
    let next = algo
        .pick_next()
        .unwrap_or_else(|| dispatcher.clone());
    if Arc::ptr_eq(&next, current) {
        // Sole runnable fiber picked itself; no switch needed. This also
        // resolves wake-before-sleep: a remote wake that landed before
        // the park simply keeps the fiber running.
        return;
    }
    next.gate.grant();
    current.gate.acquire();
}

// Final switch of a completed fiber: hand control onward, never park.
fn terminate_switch(rt: &Arc<RuntimeHandle>, current: &Arc<FiberContext>) {
    let algo = rt.algo();
    rt.pump();
    let dispatcher = rt.dispatcher();
    if !dispatcher.is_ready_linked() {
        algo.awakened(dispatcher);
    }
    match algo.pick_next() {
        Some(next) => {
            debug_assert!(!Arc::ptr_eq(&next, current));
            next.gate.grant();
        }
        None => dispatcher.gate.grant(),
    }
}

/// Make a fiber runnable. From a thread of the owning runtime this links
/// it straight into the ready queues; from anywhere else it goes through
/// the remote queue and the scheduler's `notify`.
pub(crate) fn schedule(ctx: &Arc<FiberContext>) {
    let owner = ctx.owner();
    let local = CURRENT.with(|c| {
        c.borrow()
            .as_ref()
            .is_some_and(|(rt, _)| Arc::ptr_eq(rt, owner))
    });
    if local {
        owner.algo().awakened(ctx);
    } else {
        owner.remote_ready(ctx.clone());
    }
}

/// Spawn a worker fiber on the given runtime and make it runnable.
pub(crate) fn spawn_on(
    rt: &Arc<RuntimeHandle>,
    props: FiberProps,
    f: impl FnOnce() + Send + 'static,
) -> FiberHandle {
    let ctx = FiberContext::new(FiberKind::Worker, props);
    ctx.bind(rt.clone());
    let done = Done::new();

    let rt2 = rt.clone();
    let ctx2 = ctx.clone();
    let done2 = done.clone();
    thread::Builder::new()
        .name(format!("{}-fib-{:04}", rt.prefix, ctx.id()))
        .spawn(move || {
            (rt2.thread_init)();
            set_current(rt2.clone(), ctx2.clone());
            ctx2.gate.acquire();
            f();
            trace!(fiber = ctx2.id(), "fiber completed");
            done2.notify();
            terminate_switch(&rt2, &ctx2);
            clear_current();
        })
        .expect("failed to spawn fiber thread");

    schedule(&ctx);
    FiberHandle { ctx, done }
}

/// Owner handle for a spawned worker fiber.
pub struct FiberHandle {
    ctx: Arc<FiberContext>,
    done: Done,
}

impl FiberHandle {
    /// Block until the fiber's entry function has returned. Suspends the
    /// calling fiber when invoked on a runtime thread; blocks the OS
    /// thread otherwise.
    pub fn join(&self) {
        self.done.wait();
    }

    /// Re-prioritize the fiber. If it is currently queued, the scheduler
    /// moves it to the bucket matching the new level; if it is running or
    /// parked, the next enqueue places it correctly.
    pub fn set_nice_level(&self, nice: u8) {
        let changed = self.ctx.update_props(|p| p.set_nice_level(nice));
        if changed {
            self.ctx.owner().algo().property_change(&self.ctx);
        }
    }

    pub fn nice_level(&self) -> u8 {
        self.ctx.nice_level()
    }

    pub fn name(&self) -> String {
        self.ctx.name()
    }

    pub fn id(&self) -> u64 {
        self.ctx.id()
    }
}

impl std::fmt::Debug for FiberHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberHandle").field("id", &self.ctx.id()).finish()
    }
}

/// Yield the running fiber, letting equal-or-higher-priority work (and
/// the fairness-kicked main loop) run. Outside a runtime this degrades to
/// [`std::thread::yield_now`].
pub fn yield_now() {
    match current() {
        Some((rt, ctx)) => switch_out(&rt, &ctx, true),
        None => thread::yield_now(),
    }
}

/// Park the running fiber until `wake_at`. The dispatcher feeds the
/// earliest pending deadline to the scheduler's `suspend_until`, so the
/// reactor wait is bounded by it. Outside a runtime this degrades to
/// [`std::thread::sleep`].
pub fn sleep_until(wake_at: Instant) {
    match current() {
        Some((rt, ctx)) => {
            rt.sleepers.lock().push(Sleeper {
                wake_at,
                ctx: ctx.clone(),
            });
            switch_out(&rt, &ctx, false);
        }
        None => {
            let now = Instant::now();
            if wake_at > now {
                thread::sleep(wake_at - now);
            }
        }
    }
}

/// See [`sleep_until`].
pub fn sleep_for(duration: Duration) {
    sleep_until(Instant::now() + duration);
}

/// Adjust the running fiber's nice level.
pub fn set_nice_level(nice: u8) {
    if let Some((rt, ctx)) = current() {
        let changed = ctx.update_props(|p| p.set_nice_level(nice));
        if changed {
            // The running fiber is never queue-linked, so this is a
            // no-op re-bucket; the next enqueue uses the new level.
            rt.algo().property_change(&ctx);
        }
    }
}
