//! End-to-end tests driving pools, fibers, and the scheduler together.

use spindle_rs::{
    sleep_for, yield_now, Cancellable, Done, FiberProps, IoContextPool, SpindleBuilder,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn single_pool() -> IoContextPool {
    let pool = SpindleBuilder::new()
        .prefix("test")
        .io_threads(1)
        .build()
        .unwrap();
    pool.run().unwrap();
    pool
}

#[test]
fn test_run_sync_returns_results() {
    let pool = single_pool();
    let context = pool.get_next_context();

    let i = context.run_sync(|| 5);
    assert_eq!(i, 5);

    // Borrowed captures work: the call blocks until completion.
    let j = context.run_sync(|| i + 5);
    assert_eq!(j, 10);

    pool.stop();
}

#[test]
fn test_run_sync_reports_context_thread() {
    let pool = single_pool();
    let context = pool.get_next_context();

    assert!(!context.in_context_thread());
    let ctx = context.clone();
    assert!(context.run_sync(move || ctx.in_context_thread()));

    pool.stop();
}

#[test]
fn test_fiber_join() {
    let pool = single_pool();
    let context = pool.get_next_context();

    let hits = Arc::new(AtomicUsize::new(0));
    let in_context = Arc::new(AtomicBool::new(false));

    let h = hits.clone();
    let flag = in_context.clone();
    let ctx = context.clone();
    let fiber = context.spawn_fiber(move || {
        h.fetch_add(1, Ordering::SeqCst);
        flag.store(ctx.in_context_thread(), Ordering::SeqCst);
    });
    fiber.join();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(in_context.load(Ordering::SeqCst));

    pool.stop();
}

#[test]
fn test_priority_preemption() {
    let pool = single_pool();
    let context = pool.get_next_context();

    let a_yields = Arc::new(AtomicUsize::new(0));

    let counter = a_yields.clone();
    let a = context.spawn_fiber_with(FiberProps::new("bg").with_nice_level(2), move || {
        for _ in 0..1000 {
            counter.fetch_add(1, Ordering::SeqCst);
            yield_now();
        }
    });

    // Wait until the background fiber is visibly spinning.
    while a_yields.load(Ordering::SeqCst) < 5 {
        thread::yield_now();
    }

    let at_request = a_yields.load(Ordering::SeqCst);
    let observed = Arc::new(AtomicUsize::new(usize::MAX));
    let obs = observed.clone();
    let counter = a_yields.clone();
    let b = context.spawn_fiber_with(FiberProps::new("urgent").with_nice_level(0), move || {
        obs.store(counter.load(Ordering::SeqCst), Ordering::SeqCst);
    });
    b.join();

    // The urgent fiber must have run long before the yield storm ended.
    let at_run = observed.load(Ordering::SeqCst);
    assert!(at_run < 1000, "urgent fiber ran only after the storm finished");
    assert!(
        at_run.saturating_sub(at_request) <= 50,
        "urgent fiber waited {} yields",
        at_run - at_request
    );

    a.join();
    assert_eq!(a_yields.load(Ordering::SeqCst), 1000);
    pool.stop();
}

#[test]
fn test_main_loop_fairness_under_yield_storm() {
    let pool = single_pool();
    let context = pool.get_next_context();

    const HANDLERS: usize = 20;
    let handled = Arc::new(AtomicUsize::new(0));
    let storm_over = Arc::new(AtomicBool::new(false));

    let mut fibers = Vec::new();
    for _ in 0..10 {
        let over = storm_over.clone();
        fibers.push(
            context.spawn_fiber_with(FiberProps::new("storm").with_nice_level(0), move || {
                let mut spins = 0u32;
                while !over.load(Ordering::Relaxed) && spins < 2_000_000 {
                    yield_now();
                    spins += 1;
                }
            }),
        );
    }

    // Handlers trickle in from outside while the storm runs; fairness
    // must keep admitting the main loop so they get served.
    let ctx = context.clone();
    let handled2 = handled.clone();
    let over = storm_over.clone();
    let poster = thread::spawn(move || {
        for k in 0..HANDLERS {
            let handled = handled2.clone();
            let over = over.clone();
            ctx.post(move || {
                handled.fetch_add(1, Ordering::SeqCst);
                if k == HANDLERS - 1 {
                    over.store(true, Ordering::SeqCst);
                }
            });
            thread::sleep(Duration::from_millis(1));
        }
    });

    poster.join().unwrap();
    for fiber in &fibers {
        fiber.join();
    }

    assert_eq!(handled.load(Ordering::SeqCst), HANDLERS);
    assert!(storm_over.load(Ordering::SeqCst));
    assert!(pool.metrics().main_loop_resumes.get() > 0);
    pool.stop();
}

#[test]
fn test_idle_context_woken_by_external_post() {
    let pool = single_pool();
    let context = pool.get_next_context();

    // No fibers: the loop is blocked inside the reactor.
    thread::sleep(Duration::from_millis(50));

    let x = Arc::new(AtomicUsize::new(0));
    let x2 = x.clone();
    let ctx = context.clone();
    let start = Instant::now();
    context.post(move || {
        x2.fetch_add(1, Ordering::SeqCst);
        ctx.stop();
    });

    pool.stop();
    assert_eq!(x.load(Ordering::SeqCst), 1);
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_notify_collapses_pending_wake() {
    let pool = single_pool();
    let context = pool.get_next_context();

    // One fiber sleeps 300ms: the dispatcher arms the suspend timer for
    // that deadline and the loop blocks on it.
    let sleeper = context.spawn_fiber(|| sleep_for(Duration::from_millis(300)));

    let start = Instant::now();
    let woke_after = Arc::new(Mutex::new(None));
    let done = Done::new();

    let d = done.clone();
    let woke = woke_after.clone();
    let waiter = context.spawn_fiber(move || {
        d.wait();
        *woke.lock().unwrap() = Some(start.elapsed());
    });

    // Let everything park, then wake from outside. The wake must land
    // now, not at the 300ms timer deadline.
    thread::sleep(Duration::from_millis(50));
    done.notify();
    waiter.join();

    let woke_after = woke_after.lock().unwrap().expect("waiter never woke");
    assert!(
        woke_after < Duration::from_millis(250),
        "external wake was deferred to the timer deadline: {:?}",
        woke_after
    );

    sleeper.join();
    assert!(start.elapsed() >= Duration::from_millis(300));
    pool.stop();
}

struct SlowCancellable {
    cancel_requested: AtomicBool,
    finished: AtomicBool,
    cancel_delay: Duration,
}

impl SlowCancellable {
    fn new(cancel_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            cancel_requested: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            cancel_delay,
        })
    }
}

impl Cancellable for SlowCancellable {
    fn run(&self) {
        while !self.cancel_requested.load(Ordering::Relaxed) {
            sleep_for(Duration::from_millis(2));
        }
        self.finished.store(true, Ordering::Relaxed);
    }

    fn cancel(&self) {
        sleep_for(self.cancel_delay);
        self.cancel_requested.store(true, Ordering::Relaxed);
        while !self.finished.load(Ordering::Relaxed) {
            yield_now();
        }
    }
}

#[test]
fn test_stop_cancels_attached_in_parallel() {
    let pool = single_pool();
    let context = pool.get_next_context();

    let cancellables: Vec<_> = (0..3)
        .map(|_| SlowCancellable::new(Duration::from_millis(60)))
        .collect();
    for cancellable in &cancellables {
        context.attach_cancellable(cancellable.clone());
    }
    thread::sleep(Duration::from_millis(20));

    let start = Instant::now();
    pool.stop();
    let elapsed = start.elapsed();

    for cancellable in &cancellables {
        assert!(cancellable.finished.load(Ordering::Relaxed));
    }
    // Three 60ms cancellations run on their own fibers; serialized they
    // would need 180ms+.
    assert!(elapsed < Duration::from_millis(150), "stop took {:?}", elapsed);
}

#[test]
fn test_stop_from_inside_context() {
    let pool = single_pool();
    let context = pool.get_next_context();

    let cancellable = SlowCancellable::new(Duration::from_millis(5));
    context.attach_cancellable(cancellable.clone());
    thread::sleep(Duration::from_millis(20));

    context.run_sync_fiber(|| pool.stop());
    assert!(cancellable.finished.load(Ordering::Relaxed));
}

#[test]
fn test_stop_is_idempotent() {
    let pool = single_pool();
    let context = pool.get_next_context();

    let cancellable = SlowCancellable::new(Duration::from_millis(5));
    context.attach_cancellable(cancellable.clone());
    thread::sleep(Duration::from_millis(10));

    pool.stop();
    assert!(cancellable.finished.load(Ordering::Relaxed));
    // Second stop finds nothing attached and returns immediately.
    let start = Instant::now();
    pool.stop();
    assert!(start.elapsed() < Duration::from_millis(50));
}

#[test]
fn test_set_nice_level_rebuckets_queued_fiber() {
    let pool = single_pool();
    let context = pool.get_next_context();

    let order = Arc::new(Mutex::new(Vec::new()));

    let ctx = context.clone();
    let order2 = order.clone();
    // Orchestrate from the context so both fibers stay queued until this
    // closure returns.
    let (early, promoted) = context.run_sync(move || {
        let o = order2.clone();
        let early = ctx.spawn_fiber_with(FiberProps::new("early").with_nice_level(2), move || {
            o.lock().unwrap().push("early");
        });
        let o = order2.clone();
        let promoted =
            ctx.spawn_fiber_with(FiberProps::new("promoted").with_nice_level(2), move || {
                o.lock().unwrap().push("promoted");
            });
        // Promote the later fiber while both sit at nice 2.
        promoted.set_nice_level(0);
        (early, promoted)
    });

    early.join();
    promoted.join();

    assert_eq!(order.lock().unwrap().as_slice(), &["promoted", "early"]);
    pool.stop();
}

#[test]
fn test_yield_storm_until_cancelled() {
    let pool = single_pool();
    let context = pool.get_next_context();

    let cancel = Arc::new(AtomicBool::new(false));
    let launched = spindle_rs::BlockingCounter::new(5);

    let mut fibers = Vec::new();
    for _ in 0..5 {
        let cancel = cancel.clone();
        let launched = launched.clone();
        fibers.push(context.spawn_fiber(move || {
            launched.dec();
            while !cancel.load(Ordering::Relaxed) {
                yield_now();
            }
        }));
    }

    launched.wait();
    cancel.store(true, Ordering::Relaxed);
    for fiber in &fibers {
        fiber.join();
    }
    pool.stop();
}

#[test]
fn test_done_wakes_fiber_from_external_thread() {
    let pool = single_pool();
    let context = pool.get_next_context();

    let observed = Arc::new(AtomicUsize::new(0));
    let obs = observed.clone();
    context.run_sync_fiber(move || {
        let done = Done::new();
        let d = done.clone();
        let signaller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            d.notify();
        });
        done.wait();
        obs.store(1, Ordering::SeqCst);
        signaller.join().unwrap();
    });

    assert_eq!(observed.load(Ordering::SeqCst), 1);
    pool.stop();
}

#[test]
fn test_await_on_all_from_many_threads() {
    let pool = Arc::new({
        let pool = SpindleBuilder::new()
            .prefix("pool-test")
            .io_threads(2)
            .build()
            .unwrap();
        pool.run().unwrap();
        pool
    });

    let visits = Arc::new(AtomicUsize::new(0));
    let mut callers = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        let visits = visits.clone();
        callers.push(thread::spawn(move || {
            let v = visits.clone();
            pool.await_fiber_on_all(move |_| {
                v.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }));
    }
    for caller in callers {
        caller.join().unwrap();
    }

    // 8 callers × 2 contexts.
    assert_eq!(visits.load(Ordering::SeqCst), 16);
    pool.stop();
}

#[test]
fn test_fiber_sleep_wakes_on_time() {
    let pool = single_pool();
    let context = pool.get_next_context();

    let start = Instant::now();
    let fiber = context.spawn_fiber(|| sleep_for(Duration::from_millis(80)));
    fiber.join();
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_millis(80));
    assert!(elapsed < Duration::from_secs(2), "sleep overshot: {:?}", elapsed);
    pool.stop();
}

#[test]
fn test_metrics_observe_activity() {
    let pool = single_pool();
    let context = pool.get_next_context();

    for _ in 0..3 {
        context
            .spawn_fiber(|| {
                for _ in 0..10 {
                    yield_now();
                }
            })
            .join();
    }

    assert!(pool.metrics().fibers_spawned.get() >= 3);
    assert!(pool.metrics().context_switches.get() > 0);
    pool.stop();
}
