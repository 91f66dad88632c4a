//! # spindle-rs
//!
//! **One thread, many fibers**
//!
//! A cooperative fiber runtime where each worker thread owns one
//! event-driven reactor and one priority scheduler, so I/O completions,
//! timers, and computational fibers share a kernel thread without
//! blocking it.
//!
//! ## Features
//!
//! - **Priority scheduling**: three nice levels with strict priority and
//!   FIFO within a level
//! - **I/O fairness**: a parked main loop is re-admitted after at most
//!   four consecutive fiber switches, so a busy fiber population cannot
//!   starve the reactor
//! - **Correct idling**: with nothing runnable, the thread blocks inside
//!   the reactor; external posts and cross-thread wakes pull it back out
//! - **Graceful shutdown**: attached cancellables are cancelled in
//!   parallel and joined before the loop stops
//! - **Flexible configuration**: files (TOML/YAML/JSON), environment
//!   variables, code, or clap CLI overrides
//! - **CPU pinning**: optionally pin each context thread to one CPU
//!
//! ## Quick Start
//!
//! ```ignore
//! use spindle_rs::SpindleBuilder;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = SpindleBuilder::new()
//!         .prefix("myapp")
//!         .io_threads(2)
//!         .build()?;
//!     pool.run()?;
//!
//!     let context = pool.get_next_context();
//!
//!     // Run a closure on the context and get its result back.
//!     let answer = context.run_sync(|| 6 * 7);
//!     assert_eq!(answer, 42);
//!
//!     // Spawn a fiber and join it.
//!     let fiber = context.spawn_fiber(|| {
//!         for _ in 0..3 {
//!             spindle_rs::yield_now();
//!         }
//!     });
//!     fiber.join();
//!
//!     pool.stop();
//!     Ok(())
//! }
//! ```
//!
//! ## Thread Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      IoContextPool                        │
//! └──────────────────────────────────────────────────────────┘
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//! ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//! │ IoContext 0 │       │ IoContext 1 │  ...  │ IoContext N │
//! │  reactor    │       │  reactor    │       │  reactor    │
//! │  scheduler  │       │  scheduler  │       │  scheduler  │
//! │  fibers ────┼─ one runnable at a time, switched at       │
//! └─────────────┘   yields, sleeps, waits, and completion    │
//! ```
//!
//! Each context is fully independent; cross-thread interaction goes
//! through a context's thread-safe post queue.
//!
//! ## Configuration
//!
//! Sources merge in order (later overrides earlier): defaults, config
//! files, environment variables, programmatic calls, CLI arguments.
//!
//! ```toml
//! prefix = "myapp"
//! io_threads = 4
//! cpuset = "0-3"
//! pin_threads = true
//! ```
//!
//! With `.env_prefix("SPINDLE")`: `SPINDLE_PREFIX`, `SPINDLE_IO_THREADS`,
//! `SPINDLE_CPUSET`, ...
//!
//! ## Thread Naming
//!
//! - Context threads: `{prefix}-io-0000`, `{prefix}-io-0001`, ...
//! - Fiber backings: `{prefix}-fib-0001`, ...
//! - Dispatcher: `{prefix}-dispatch`

pub mod affinity;
pub mod builder;
pub mod config;
pub mod context;
pub mod error;
pub mod fiber;
pub mod metrics;
pub mod pool;
pub mod reactor;
pub mod sched;
pub mod sync;

pub use builder::{SpindleArgs, SpindleBuilder};
pub use config::SpindleConfig;
pub use context::{current_context, Cancellable, IoContext};
pub use error::{Result, SpindleError};
pub use fiber::{FiberContext, FiberHandle, FiberKind, FiberProps, MAX_NICE_LEVEL, NUM_NICE_LEVELS};
pub use metrics::SpindleMetrics;
pub use pool::IoContextPool;
pub use reactor::{Reactor, Timer, TimerStatus};
pub use sched::{NiceScheduler, SchedAlgorithm, MAIN_NICE_LEVEL};
pub use sync::{BlockingCounter, Done};

/// Yield the running fiber. See [`fiber::yield_now`].
pub use fiber::yield_now;

/// Park the running fiber for a duration. See [`fiber::sleep_for`].
pub use fiber::sleep_for;

/// Park the running fiber until an instant. See [`fiber::sleep_until`].
pub use fiber::sleep_until;

/// Adjust the running fiber's nice level. See [`fiber::set_nice_level`].
pub use fiber::set_nice_level;
