//! Configuration types for the spindle runtime.

use prometheus::Registry;
use serde::{Deserialize, Serialize};

/// Configuration for an [`IoContextPool`](crate::IoContextPool).
///
/// Deserializable from TOML, YAML, JSON, or environment variables through
/// the builder's figment stack.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpindleConfig {
    /// Thread name prefix (default: "spindle"). Context threads become
    /// `{prefix}-io-{NNNN}`, fiber backings `{prefix}-fib-{NNNN}`.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Number of context threads, each owning one reactor and scheduler.
    /// `None` or `0`: one per available CPU.
    #[serde(default)]
    pub io_threads: Option<usize>,

    /// CPU set string (e.g. "0-7,16-23") restricting where context
    /// threads may run; `None` means all CPUs.
    #[serde(default)]
    pub cpuset: Option<String>,

    /// Pin each context thread to one CPU from the set.
    #[serde(default)]
    pub pin_threads: bool,

    /// Use the stricter fairness rule: only count a resumption against
    /// the main-loop switch limit when the resumed fiber is below the
    /// main loop's priority and more than one fiber remains ready.
    #[serde(default)]
    pub strict_loop_fairness: bool,

    /// Prometheus registry for metrics exposition. Not serializable -
    /// must be set programmatically.
    #[serde(skip)]
    pub prometheus_registry: Option<Registry>,
}

fn default_prefix() -> String {
    "spindle".to_string()
}

impl Default for SpindleConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            io_threads: None,
            cpuset: None,
            pin_threads: false,
            strict_loop_fairness: false,
            prometheus_registry: None,
        }
    }
}

impl SpindleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// The effective context thread count for a machine with
    /// `available_cpus` CPUs.
    pub fn effective_io_threads(&self, available_cpus: usize) -> usize {
        match self.io_threads {
            Some(n) if n > 0 => n,
            _ => available_cpus.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SpindleConfig::default();
        assert_eq!(config.prefix, "spindle");
        assert!(config.io_threads.is_none());
        assert!(config.cpuset.is_none());
        assert!(!config.pin_threads);
        assert!(!config.strict_loop_fairness);
    }

    #[test]
    fn test_effective_io_threads() {
        let mut config = SpindleConfig::default();
        assert_eq!(config.effective_io_threads(8), 8);

        config.io_threads = Some(2);
        assert_eq!(config.effective_io_threads(8), 2);

        // Zero is "use all CPUs", and an empty machine still gets one.
        config.io_threads = Some(0);
        assert_eq!(config.effective_io_threads(8), 8);
        assert_eq!(config.effective_io_threads(0), 1);
    }

    #[test]
    fn test_deserialize_config() {
        let toml = r#"
            prefix = "myapp"
            cpuset = "0-3"
            io_threads = 2
            pin_threads = true
            strict_loop_fairness = true
        "#;

        let config: SpindleConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.prefix, "myapp");
        assert_eq!(config.cpuset, Some("0-3".to_string()));
        assert_eq!(config.io_threads, Some(2));
        assert!(config.pin_threads);
        assert!(config.strict_loop_fairness);
    }
}
