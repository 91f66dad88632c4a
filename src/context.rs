//! Per-thread I/O context: boots the reactor and scheduler, runs the
//! main loop as a fiber, and orchestrates shutdown.
//!
//! One `IoContext` pins one OS thread. The thread entering
//! [`IoContext::start_loop`] becomes the main fiber; user work reaches
//! the context through [`IoContext::post`] (plain reactor handler),
//! [`IoContext::post_fiber`] / [`IoContext::spawn_fiber`] (new fiber), or
//! [`IoContext::run_sync`] (run a closure on the context and block the
//! caller for the result). Objects registered with
//! [`IoContext::attach_cancellable`] get a graceful `cancel` during
//! [`IoContext::stop`].

use parking_lot::Mutex;
use std::cell::RefCell;
use std::mem;
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use tracing::{debug, trace};

use crate::fiber::{self, FiberHandle, FiberProps, RuntimeHandle};
use crate::sched::SchedAlgorithm;
use crate::metrics::SpindleMetrics;
use crate::reactor::Reactor;
use crate::sched::{NiceScheduler, MAIN_NICE_LEVEL};
use crate::sync::{BlockingCounter, Done};

/// An object that participates in graceful shutdown.
///
/// `run` is started on its own fiber when the object is attached; `cancel`
/// is invoked on another fiber during [`IoContext::stop`] and must cause
/// `run` to return. Cancellation is best-effort and cooperative — there is
/// no forced teardown.
pub trait Cancellable: Send + Sync {
    fn run(&self);
    fn cancel(&self);
}

thread_local! {
    static CURRENT_CONTEXT: RefCell<Option<Weak<ContextInner>>> = const { RefCell::new(None) };
}

/// Get the context owning the current thread, if any.
///
/// Works from the context thread itself and from every fiber the context
/// spawned.
pub fn current_context() -> Option<IoContext> {
    CURRENT_CONTEXT.with(|c| {
        c.borrow()
            .as_ref()
            .and_then(|weak| weak.upgrade())
            .map(|shared| IoContext { shared })
    })
}

fn set_current_context(context: Weak<ContextInner>) {
    CURRENT_CONTEXT.with(|c| *c.borrow_mut() = Some(context));
}

fn clear_current_context() {
    CURRENT_CONTEXT.with(|c| *c.borrow_mut() = None);
}

pub(crate) struct ContextInner {
    reactor: Reactor,
    prefix: Arc<str>,
    strict_fairness: bool,
    metrics: Arc<SpindleMetrics>,
    runtime: OnceLock<Arc<RuntimeHandle>>,
    thread_id: OnceLock<thread::ThreadId>,
    cancellables: Mutex<Vec<(Arc<dyn Cancellable>, FiberHandle)>>,
}

/// A cheaply clonable handle to one context.
#[derive(Clone)]
pub struct IoContext {
    shared: Arc<ContextInner>,
}

impl IoContext {
    pub(crate) fn new(prefix: Arc<str>, strict_fairness: bool, metrics: Arc<SpindleMetrics>) -> Self {
        Self {
            shared: Arc::new(ContextInner {
                reactor: Reactor::new(),
                prefix,
                strict_fairness,
                metrics,
                runtime: OnceLock::new(),
                thread_id: OnceLock::new(),
                cancellables: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The underlying reactor.
    pub fn reactor(&self) -> &Reactor {
        &self.shared.reactor
    }

    /// Run the context on the calling thread until [`IoContext::stop`].
    ///
    /// Installs a fresh scheduler, turns the calling thread into the main
    /// fiber named `io_loop` at the highest priority, and bootstraps the
    /// main loop inside a posted handler — the reactor's own notion of
    /// "running in this thread" is stack-based and would misreport from
    /// within handlers, which is why callers must use
    /// [`IoContext::in_context_thread`] instead. `started` is decremented
    /// once the loop is live. Returns only after the loop has exited and
    /// the post-exit drain completed.
    pub(crate) fn start_loop(&self, started: &BlockingCounter) {
        let scheduler = Arc::new(NiceScheduler::new(
            self.shared.reactor.clone(),
            self.shared.strict_fairness,
            self.shared.metrics.clone(),
        ));
        let weak = Arc::downgrade(&self.shared);
        let thread_init: Arc<dyn Fn() + Send + Sync> =
            Arc::new(move || set_current_context(weak.clone()));
        let rt = RuntimeHandle::new(self.shared.prefix.clone(), thread_init);
        rt.set_algo(scheduler.clone());
        let _ = self.shared.runtime.set(rt.clone());
        let _ = self.shared.thread_id.set(thread::current().id());
        set_current_context(Arc::downgrade(&self.shared));

        let main_ctx = fiber::install(&rt);
        main_ctx.update_props(|p| {
            p.set_name("io_loop");
            p.set_nice_level(MAIN_NICE_LEVEL);
        });

        debug!(prefix = %self.shared.prefix, "context loop starting");
        let sched = scheduler.clone();
        let started = started.clone();
        self.shared.reactor.post(move || {
            started.dec();
            sched.main_loop();
        });
        // Bootstrap: runs the posted handler above, which returns only
        // once the main loop has exited.
        self.shared.reactor.run_one();

        // A completing fiber may enqueue one last round of handlers, so
        // two passes.
        for pass in 0..2 {
            trace!(pass, "post-exit drain");
            while self.shared.reactor.poll() > 0 || scheduler.has_ready_fibers() {
                fiber::yield_now();
            }
            self.shared.reactor.restart();
        }

        fiber::uninstall(&rt);
        clear_current_context();
        debug!(prefix = %self.shared.prefix, "context loop exited");
    }

    /// Whether the caller runs on this context: its loop thread, or any
    /// fiber belonging to it.
    pub fn in_context_thread(&self) -> bool {
        if self
            .shared
            .thread_id
            .get()
            .is_some_and(|id| *id == thread::current().id())
        {
            return true;
        }
        match (fiber::current(), self.shared.runtime.get()) {
            (Some((rt, _)), Some(own)) => Arc::ptr_eq(&rt, own),
            _ => false,
        }
    }

    /// Enqueue a plain handler on the reactor, from any thread.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.reactor.post(f);
    }

    /// Enqueue a task that runs as a new fiber on this context.
    pub fn post_fiber<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = self.shared.clone();
        self.shared.reactor.post(move || {
            Self::spawn_local(&shared, FiberProps::default(), f);
        });
    }

    /// Spawn a fiber on this context and return its handle.
    pub fn spawn_fiber<F>(&self, f: F) -> FiberHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_fiber_with(FiberProps::default(), f)
    }

    /// Spawn a fiber with explicit properties.
    pub fn spawn_fiber_with<F>(&self, props: FiberProps, f: F) -> FiberHandle
    where
        F: FnOnce() + Send + 'static,
    {
        if self.in_context_thread() {
            Self::spawn_local(&self.shared, props, f)
        } else {
            let shared = self.shared.clone();
            self.run_sync(move || Self::spawn_local(&shared, props, f))
        }
    }

    fn spawn_local<F>(shared: &Arc<ContextInner>, props: FiberProps, f: F) -> FiberHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let rt = shared.runtime.get().expect("context loop not started");
        shared.metrics.fibers_spawned.inc();
        fiber::spawn_on(rt, props, f)
    }

    /// Run `f` on this context and block the caller until it completes.
    ///
    /// Called from the context itself, `f` runs inline. Called from a
    /// fiber of another context, the caller fiber suspends; called from a
    /// plain thread, that thread blocks. Borrowed captures are fine — the
    /// call does not return before `f` has finished.
    ///
    /// `f` executes as a plain reactor handler and must not suspend; for
    /// work that blocks on fiber primitives use
    /// [`IoContext::run_sync_fiber`].
    pub fn run_sync<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        if self.in_context_thread() {
            return f();
        }
        let result: Mutex<Option<R>> = Mutex::new(None);
        let done = Done::new();
        {
            let done = done.clone();
            let result = &result;
            self.shared.reactor.post_boxed(erase_task(Box::new(move || {
                *result.lock() = Some(f());
                done.notify();
            })));
        }
        done.wait();
        let value = result.lock().take();
        value.expect("run_sync task completed without a result")
    }

    /// Like [`IoContext::run_sync`], but `f` runs on a fresh fiber, so it
    /// may suspend — sleep, wait on latches, join other fibers.
    pub fn run_sync_fiber<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        if self.in_context_thread() {
            return f();
        }
        let result: Mutex<Option<R>> = Mutex::new(None);
        let done = Done::new();
        {
            let done = done.clone();
            let result = &result;
            let task = erase_task(Box::new(move || {
                *result.lock() = Some(f());
                done.notify();
            }));
            let shared = self.shared.clone();
            self.shared.reactor.post(move || {
                Self::spawn_local(&shared, FiberProps::new("await"), task);
            });
        }
        done.wait();
        let value = result.lock().take();
        value.expect("run_sync_fiber task completed without a result")
    }

    /// Register a cancellable: `run` starts on its own fiber now,
    /// `cancel` is delivered during [`IoContext::stop`].
    pub fn attach_cancellable(&self, cancellable: Arc<dyn Cancellable>) {
        let runner = cancellable.clone();
        let handle = self.spawn_fiber_with(FiberProps::new("cancellable"), move || runner.run());
        self.shared.cancellables.lock().push((cancellable, handle));
    }

    /// Stop the context: cancel every attached cancellable in parallel,
    /// join their fibers, then stop the reactor. Idempotent — a second
    /// call finds nothing attached and just re-stops the reactor.
    pub fn stop(&self) {
        let attached = mem::take(&mut *self.shared.cancellables.lock());
        if !attached.is_empty() {
            debug!(count = attached.len(), "cancelling attached cancellables");
            let latch = BlockingCounter::new(attached.len());
            for (cancellable, _) in &attached {
                let cancellable = cancellable.clone();
                let latch = latch.clone();
                self.post_fiber(move || {
                    cancellable.cancel();
                    latch.dec();
                });
            }
            latch.wait();
            for (_, handle) in &attached {
                handle.join();
            }
        }
        self.shared.reactor.stop();
        debug!(prefix = %self.shared.prefix, "context stopped");
    }
}

impl std::fmt::Debug for IoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoContext")
            .field("prefix", &self.shared.prefix)
            .field("reactor", &self.shared.reactor)
            .finish()
    }
}

// Erase the closure's borrow lifetime so it can ride the reactor queue.
//
// SAFETY (for callers): sound only when the caller blocks until the task
// has run to completion, so every borrow the closure captured outlives
// its execution. run_sync waits on `done` before returning.
fn erase_task<'a>(task: Box<dyn FnOnce() + Send + 'a>) -> Box<dyn FnOnce() + Send + 'static> {
    unsafe { mem::transmute(task) }
}
