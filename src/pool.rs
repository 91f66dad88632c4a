//! A pool of independent I/O contexts, one per OS thread.
//!
//! Each context owns its reactor and scheduler; the pool only starts the
//! threads, hands contexts out round-robin, and fans work out across all
//! of them. There is no cross-context scheduling and fibers never
//! migrate.

use parking_lot::Mutex;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

use crate::affinity::{pin_current, CpuAllocator, CpuSet};
use crate::config::SpindleConfig;
use crate::context::IoContext;
use crate::error::{Result, SpindleError};
use crate::metrics::SpindleMetrics;
use crate::sync::BlockingCounter;

/// Owns N [`IoContext`]s and the threads running them.
pub struct IoContextPool {
    contexts: Vec<IoContext>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    next: AtomicUsize,
    prefix: Arc<str>,
    pin_cpus: Option<Arc<CpuAllocator>>,
    metrics: Arc<SpindleMetrics>,
}

impl IoContextPool {
    /// Build a pool from a resolved configuration.
    ///
    /// This is typically called via [`SpindleBuilder::build`](crate::SpindleBuilder::build).
    pub(crate) fn from_config(config: SpindleConfig) -> Result<Self> {
        let cpus = match &config.cpuset {
            Some(s) => {
                let set = CpuSet::parse(s)?;
                set.validate()?;
                set
            }
            None => CpuSet::available(),
        };
        if cpus.is_empty() {
            return Err(SpindleError::NoCpusAvailable);
        }

        let io_threads = config.effective_io_threads(cpus.len());
        if config.pin_threads && io_threads > cpus.len() {
            return Err(SpindleError::InsufficientCpus {
                requested: io_threads,
                available: cpus.len(),
            });
        }

        let metrics = Arc::new(SpindleMetrics::with_prefix(&config.prefix));
        if let Some(registry) = &config.prometheus_registry {
            if let Err(e) = metrics.register(registry) {
                warn!(%e, "failed to register prometheus metrics");
            }
        }

        info!(
            prefix = %config.prefix,
            io_threads,
            pin_threads = config.pin_threads,
            strict_loop_fairness = config.strict_loop_fairness,
            "building context pool"
        );

        let prefix: Arc<str> = config.prefix.as_str().into();
        let contexts = (0..io_threads)
            .map(|_| IoContext::new(prefix.clone(), config.strict_loop_fairness, metrics.clone()))
            .collect();
        let pin_cpus = config
            .pin_threads
            .then(|| Arc::new(CpuAllocator::new(&cpus)));

        Ok(Self {
            contexts,
            threads: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
            prefix,
            pin_cpus,
            metrics,
        })
    }

    /// Start every context on its own named thread and wait until all
    /// loops are live. Idempotent while running.
    pub fn run(&self) -> Result<()> {
        let mut threads = self.threads.lock();
        if !threads.is_empty() {
            return Ok(());
        }

        let started = BlockingCounter::new(self.contexts.len());
        for (index, context) in self.contexts.iter().enumerate() {
            let context = context.clone();
            let started = started.clone();
            let pin_cpus = self.pin_cpus.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-io-{:04}", self.prefix, index))
                .spawn(move || {
                    if let Some(allocator) = pin_cpus {
                        let cpu = allocator.allocate();
                        if let Err(e) = pin_current(cpu) {
                            warn!(%e, cpu, "failed to pin context thread");
                        }
                    }
                    context.start_loop(&started);
                })?;
            threads.push(handle);
        }
        drop(threads);

        started.wait();
        info!(contexts = self.contexts.len(), "context pool running");
        Ok(())
    }

    /// Stop every context and join the pool threads. Idempotent; safe to
    /// call from inside a context — the calling context's thread is left
    /// to finish on its own, since joining it would wait on the very
    /// fiber executing this call.
    pub fn stop(&self) {
        let handles = mem::take(&mut *self.threads.lock());
        for context in &self.contexts {
            context.stop();
        }
        let current = thread::current().id();
        for (index, handle) in handles.into_iter().enumerate() {
            if handle.thread().id() == current {
                continue;
            }
            if self.contexts[index].in_context_thread() {
                continue;
            }
            let _ = handle.join();
        }
    }

    /// Hand out contexts round-robin.
    pub fn get_next_context(&self) -> &IoContext {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.contexts.len();
        &self.contexts[index]
    }

    pub fn at(&self, index: usize) -> &IoContext {
        &self.contexts[index]
    }

    pub fn size(&self) -> usize {
        self.contexts.len()
    }

    /// The pool-wide metrics.
    pub fn metrics(&self) -> &SpindleMetrics {
        &self.metrics
    }

    /// Run `f` as a handler on every context and wait for all of them.
    ///
    /// # Errors
    ///
    /// Fails with [`SpindleError::PoolNotRunning`] when the pool threads
    /// are not running — the posted handlers would never execute and the
    /// wait would never return.
    pub fn await_on_all<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&IoContext) + Send + Sync + 'static,
    {
        if self.threads.lock().is_empty() {
            return Err(SpindleError::PoolNotRunning);
        }
        let f = Arc::new(f);
        let latch = BlockingCounter::new(self.contexts.len());
        for context in &self.contexts {
            let ctx = context.clone();
            let f = f.clone();
            let latch = latch.clone();
            context.post(move || {
                f(&ctx);
                latch.dec();
            });
        }
        latch.wait();
        Ok(())
    }

    /// Run `f` as a fresh fiber on every context and wait for all of
    /// them.
    ///
    /// # Errors
    ///
    /// Fails with [`SpindleError::PoolNotRunning`] when the pool threads
    /// are not running.
    pub fn await_fiber_on_all<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&IoContext) + Send + Sync + 'static,
    {
        if self.threads.lock().is_empty() {
            return Err(SpindleError::PoolNotRunning);
        }
        let f = Arc::new(f);
        let latch = BlockingCounter::new(self.contexts.len());
        for context in &self.contexts {
            let ctx = context.clone();
            let f = f.clone();
            let latch = latch.clone();
            context.post_fiber(move || {
                f(&ctx);
                latch.dec();
            });
        }
        latch.wait();
        Ok(())
    }
}

impl Drop for IoContextPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for IoContextPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoContextPool")
            .field("prefix", &self.prefix)
            .field("contexts", &self.contexts.len())
            .field("running", &!self.threads.lock().is_empty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_sizing_from_config() {
        let config = SpindleConfig {
            io_threads: Some(2),
            ..Default::default()
        };
        let pool = IoContextPool::from_config(config).unwrap();
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn test_round_robin_handout() {
        let config = SpindleConfig {
            io_threads: Some(3),
            ..Default::default()
        };
        let pool = IoContextPool::from_config(config).unwrap();
        let first = pool.get_next_context() as *const IoContext;
        let second = pool.get_next_context() as *const IoContext;
        let third = pool.get_next_context() as *const IoContext;
        let fourth = pool.get_next_context() as *const IoContext;
        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_eq!(first, fourth);
    }

    #[test]
    fn test_invalid_cpuset_rejected() {
        let config = SpindleConfig {
            cpuset: Some("not-a-cpuset".into()),
            ..Default::default()
        };
        assert!(matches!(
            IoContextPool::from_config(config),
            Err(SpindleError::InvalidCpuSet(_))
        ));
    }

    #[test]
    fn test_pinning_needs_enough_cpus() {
        let config = SpindleConfig {
            cpuset: Some("0".into()),
            io_threads: Some(2),
            pin_threads: true,
            ..Default::default()
        };
        assert!(matches!(
            IoContextPool::from_config(config),
            Err(SpindleError::InsufficientCpus { .. })
        ));
    }

    #[test]
    fn test_await_on_all_requires_running_pool() {
        let config = SpindleConfig {
            io_threads: Some(1),
            ..Default::default()
        };
        let pool = IoContextPool::from_config(config).unwrap();
        assert!(matches!(
            pool.await_on_all(|_| {}),
            Err(SpindleError::PoolNotRunning)
        ));
        assert!(matches!(
            pool.await_fiber_on_all(|_| {}),
            Err(SpindleError::PoolNotRunning)
        ));
    }

    #[test]
    fn test_stop_without_run_is_safe() {
        let config = SpindleConfig {
            io_threads: Some(1),
            ..Default::default()
        };
        let pool = IoContextPool::from_config(config).unwrap();
        pool.stop();
        pool.stop();
    }
}
