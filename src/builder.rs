//! Builder pattern for constructing context pools.
//!
//! The builder merges configuration sources with figment:
//! - Default values
//! - Config files (TOML, YAML, JSON)
//! - Environment variables
//! - Programmatic overrides
//! - CLI arguments via clap

use crate::config::SpindleConfig;
use crate::error::Result;
use crate::pool::IoContextPool;

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use prometheus::Registry;
use std::path::Path;

/// Builder for an [`IoContextPool`].
///
/// Later sources override earlier ones:
/// 1. Default values
/// 2. Config files (in order added)
/// 3. Environment variables
/// 4. Programmatic overrides
///
/// # Examples
///
/// ```ignore
/// use spindle_rs::SpindleBuilder;
///
/// let pool = SpindleBuilder::new()
///     .file("spindle.toml")
///     .env_prefix("SPINDLE")
///     .prefix("myapp")
///     .io_threads(2)
///     .build()?;
/// pool.run()?;
/// ```
pub struct SpindleBuilder {
    figment: Figment,
    prometheus_registry: Option<Registry>,
}

impl Default for SpindleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SpindleBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpindleBuilder")
            .field("figment", &self.figment)
            .field(
                "prometheus_registry",
                &self.prometheus_registry.as_ref().map(|_| "<Registry>"),
            )
            .finish()
    }
}

impl SpindleBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            figment: Figment::from(Serialized::defaults(SpindleConfig::default())),
            prometheus_registry: None,
        }
    }

    /// Add a configuration file.
    ///
    /// TOML, YAML, and JSON are detected by extension; anything else is
    /// treated as TOML. Files merge in the order they are added.
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        let path = path.as_ref();
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        self.figment = match extension.to_lowercase().as_str() {
            "yaml" | "yml" => self.figment.merge(Yaml::file(path)),
            "json" => self.figment.merge(Json::file(path)),
            _ => self.figment.merge(Toml::file(path)),
        };
        self
    }

    /// Add environment variables with a prefix.
    ///
    /// Variables are read as `{PREFIX}_{KEY}`, e.g. `SPINDLE_IO_THREADS`,
    /// `SPINDLE_CPUSET`.
    pub fn env_prefix(mut self, prefix: &str) -> Self {
        self.figment = self.figment.merge(Env::prefixed(prefix).split("_"));
        self
    }

    /// Set the thread name prefix.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("prefix", prefix.into()));
        self
    }

    /// Set the number of context threads. `0` means one per CPU.
    pub fn io_threads(mut self, n: usize) -> Self {
        self.figment = self.figment.merge(Serialized::default("io_threads", n));
        self
    }

    /// Restrict context threads to a CPU set, e.g. `"0-7,16-23"`.
    pub fn cpuset(mut self, cpuset: impl Into<String>) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("cpuset", cpuset.into()));
        self
    }

    /// Pin each context thread to one CPU from the set.
    pub fn pin_threads(mut self, pin: bool) -> Self {
        self.figment = self.figment.merge(Serialized::default("pin_threads", pin));
        self
    }

    /// Enable the stricter main-loop fairness rule (see
    /// [`SpindleConfig::strict_loop_fairness`]).
    pub fn strict_loop_fairness(mut self, strict: bool) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("strict_loop_fairness", strict));
        self
    }

    /// Provide an external Prometheus registry for metrics exposition.
    pub fn prometheus_registry(mut self, registry: Registry) -> Self {
        self.prometheus_registry = Some(registry);
        self
    }

    /// Apply CLI argument overrides.
    ///
    /// Only the arguments the user actually passed override the
    /// configuration.
    pub fn with_cli_args(mut self, args: &SpindleArgs) -> Self {
        if let Some(ref prefix) = args.spindle_prefix {
            self.figment = self
                .figment
                .merge(Serialized::default("prefix", prefix.clone()));
        }
        if let Some(ref cpuset) = args.spindle_cpuset {
            self.figment = self
                .figment
                .merge(Serialized::default("cpuset", cpuset.clone()));
        }
        if let Some(threads) = args.spindle_io_threads {
            self.figment = self
                .figment
                .merge(Serialized::default("io_threads", threads));
        }
        if let Some(pin) = args.spindle_pin_threads {
            self.figment = self.figment.merge(Serialized::default("pin_threads", pin));
        }
        if let Some(strict) = args.spindle_strict_loop_fairness {
            self.figment = self
                .figment
                .merge(Serialized::default("strict_loop_fairness", strict));
        }
        self
    }

    /// Build the pool. Call [`IoContextPool::run`] to start the threads.
    ///
    /// # Errors
    ///
    /// Fails on configuration extraction errors, an invalid or
    /// unavailable CPU set, or a pinned thread count exceeding the set.
    pub fn build(self) -> Result<IoContextPool> {
        let mut config: SpindleConfig = self.figment.extract().map_err(Box::new)?;
        config.prometheus_registry = self.prometheus_registry;
        IoContextPool::from_config(config)
    }
}

/// CLI arguments for spindle configuration.
///
/// Flatten into your own clap parser:
///
/// ```ignore
/// use clap::Parser;
/// use spindle_rs::{SpindleArgs, SpindleBuilder};
///
/// #[derive(Parser)]
/// struct MyArgs {
///     #[command(flatten)]
///     spindle: SpindleArgs,
/// }
///
/// let args = MyArgs::parse();
/// let pool = SpindleBuilder::new().with_cli_args(&args.spindle).build()?;
/// ```
#[derive(Debug, Default, Clone, clap::Args)]
pub struct SpindleArgs {
    /// Thread name prefix
    #[arg(long)]
    pub spindle_prefix: Option<String>,

    /// CPU set (e.g. "0-7,16-23")
    #[arg(long)]
    pub spindle_cpuset: Option<String>,

    /// Number of context threads (0 = one per CPU)
    #[arg(long)]
    pub spindle_io_threads: Option<usize>,

    /// Pin context threads to CPUs
    #[arg(long)]
    pub spindle_pin_threads: Option<bool>,

    /// Use the stricter main-loop fairness rule
    #[arg(long)]
    pub spindle_strict_loop_fairness: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config: SpindleConfig = SpindleBuilder::new().figment.extract().unwrap();
        assert_eq!(config.prefix, "spindle");
        assert!(config.io_threads.is_none());
        assert!(config.cpuset.is_none());
        assert!(!config.strict_loop_fairness);
    }

    #[test]
    fn test_builder_programmatic_override() {
        let config: SpindleConfig = SpindleBuilder::new()
            .prefix("myapp")
            .cpuset("0-3")
            .io_threads(2)
            .strict_loop_fairness(true)
            .figment
            .extract()
            .unwrap();

        assert_eq!(config.prefix, "myapp");
        assert_eq!(config.cpuset, Some("0-3".to_string()));
        assert_eq!(config.io_threads, Some(2));
        assert!(config.strict_loop_fairness);
    }

    #[test]
    fn test_builder_cli_args_override() {
        let args = SpindleArgs {
            spindle_prefix: Some("cliapp".to_string()),
            spindle_io_threads: Some(1),
            ..Default::default()
        };

        let config: SpindleConfig = SpindleBuilder::new()
            .prefix("progapp")
            .io_threads(4)
            .cpuset("0-3")
            .with_cli_args(&args)
            .figment
            .extract()
            .unwrap();

        // CLI args win, untouched values survive.
        assert_eq!(config.prefix, "cliapp");
        assert_eq!(config.io_threads, Some(1));
        assert_eq!(config.cpuset, Some("0-3".to_string()));
    }

    #[test]
    fn test_build_constructs_pool() {
        let pool = SpindleBuilder::new().io_threads(1).build().unwrap();
        assert_eq!(pool.size(), 1);
    }
}
