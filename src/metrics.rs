//! Prometheus metrics for runtime observability.
//!
//! Counters are always collected — they are plain atomic operations — and
//! a `prometheus::Registry` is only needed when the numbers should be
//! scraped. Register one through
//! [`SpindleBuilder::prometheus_registry`](crate::SpindleBuilder::prometheus_registry).

use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Runtime metrics, shared by every context of a pool.
#[derive(Clone)]
pub struct SpindleMetrics {
    /// Worker fibers spawned.
    pub fibers_spawned: IntCounter,

    /// Fiber resumptions decided by the scheduler.
    pub context_switches: IntCounter,

    /// Times a parked main loop was re-admitted by the fairness limit.
    pub main_loop_resumes: IntCounter,

    /// Cross-thread wakes delivered through the suspend-timer reset.
    pub remote_wakes: IntCounter,

    /// Worker fibers currently linked into ready queues.
    pub ready_fibers: IntGauge,
}

impl Default for SpindleMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SpindleMetrics {
    /// Create metrics with the default `spindle` prefix.
    pub fn new() -> Self {
        Self::with_prefix("spindle")
    }

    /// Create metrics named `{prefix}_fibers_spawned`, etc. The prefix is
    /// sanitized to a valid Prometheus metric name.
    pub fn with_prefix(prefix: &str) -> Self {
        let prefix: String = prefix
            .chars()
            .enumerate()
            .map(|(i, c)| {
                let valid = if i == 0 {
                    c.is_ascii_alphabetic() || c == '_' || c == ':'
                } else {
                    c.is_ascii_alphanumeric() || c == '_' || c == ':'
                };
                if valid {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        Self {
            fibers_spawned: IntCounter::with_opts(Opts::new(
                format!("{}_fibers_spawned", prefix),
                "Worker fibers spawned",
            ))
            .expect("metric creation should not fail"),

            context_switches: IntCounter::with_opts(Opts::new(
                format!("{}_context_switches", prefix),
                "Fiber resumptions decided by the scheduler",
            ))
            .expect("metric creation should not fail"),

            main_loop_resumes: IntCounter::with_opts(Opts::new(
                format!("{}_main_loop_resumes", prefix),
                "Main loop re-admissions forced by the fairness limit",
            ))
            .expect("metric creation should not fail"),

            remote_wakes: IntCounter::with_opts(Opts::new(
                format!("{}_remote_wakes", prefix),
                "Cross-thread wakes via suspend-timer reset",
            ))
            .expect("metric creation should not fail"),

            ready_fibers: IntGauge::with_opts(Opts::new(
                format!("{}_ready_fibers", prefix),
                "Worker fibers currently in ready queues",
            ))
            .expect("metric creation should not fail"),
        }
    }

    /// Register all metrics with a registry for exposition.
    ///
    /// # Errors
    ///
    /// Fails on duplicate metric names in the registry.
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.fibers_spawned.clone()))?;
        registry.register(Box::new(self.context_switches.clone()))?;
        registry.register(Box::new(self.main_loop_resumes.clone()))?;
        registry.register(Box::new(self.remote_wakes.clone()))?;
        registry.register(Box::new(self.ready_fibers.clone()))?;
        Ok(())
    }
}

impl std::fmt::Debug for SpindleMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpindleMetrics")
            .field("fibers_spawned", &self.fibers_spawned.get())
            .field("context_switches", &self.context_switches.get())
            .field("main_loop_resumes", &self.main_loop_resumes.get())
            .field("ready_fibers", &self.ready_fibers.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_start_at_zero() {
        let metrics = SpindleMetrics::new();
        assert_eq!(metrics.fibers_spawned.get(), 0);
        assert_eq!(metrics.context_switches.get(), 0);
        assert_eq!(metrics.ready_fibers.get(), 0);
    }

    #[test]
    fn test_prefix_sanitization() {
        // Hyphens are invalid in Prometheus names and must not panic.
        let metrics = SpindleMetrics::with_prefix("my-app");
        metrics.fibers_spawned.inc();
        assert_eq!(metrics.fibers_spawned.get(), 1);
    }

    #[test]
    fn test_register_and_gather() {
        let registry = Registry::new();
        let metrics = SpindleMetrics::new();
        metrics.register(&registry).unwrap();

        metrics.fibers_spawned.inc();
        metrics.ready_fibers.set(3);

        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "spindle_fibers_spawned"));
    }

    #[test]
    fn test_double_register_fails() {
        let registry = Registry::new();
        let metrics = SpindleMetrics::new();
        metrics.register(&registry).unwrap();
        assert!(metrics.register(&registry).is_err());
    }
}
