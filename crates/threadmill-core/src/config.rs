//! Pool options and resolved configuration
//!
//! Options are all-optional and serde-friendly; they resolve once at pool
//! construction into a [`PoolConfig`] with every default filled in.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::ConfigError;

/// Which kind of execution context backs each worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// In-process worker threads with shared-memory signaling
    #[default]
    Thread,
    /// Child processes speaking newline-delimited JSON over stdio
    Process,
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeKind::Thread => f.write_str("thread"),
            RuntimeKind::Process => f.write_str("process"),
        }
    }
}

/// Upper bound on queued tasks
///
/// `Limit(0)` means no queue at all: submissions that find every worker
/// busy are rejected instead of waiting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueueLimit {
    /// No bound on queued tasks
    #[default]
    Unbounded,
    /// Square of the maximum worker count
    Auto,
    /// Explicit bound
    Limit(usize),
}

impl QueueLimit {
    /// Resolve to a concrete bound, `None` meaning unbounded
    pub fn resolve(self, max_threads: usize) -> Option<usize> {
        match self {
            QueueLimit::Unbounded => None,
            QueueLimit::Auto => Some(max_threads.saturating_mul(max_threads)),
            QueueLimit::Limit(limit) => Some(limit),
        }
    }
}

impl Serialize for QueueLimit {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            QueueLimit::Unbounded => serializer.serialize_none(),
            QueueLimit::Auto => serializer.serialize_str("auto"),
            QueueLimit::Limit(limit) => serializer.serialize_u64(*limit as u64),
        }
    }
}

impl<'de> Deserialize<'de> for QueueLimit {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct LimitVisitor;

        impl<'de> Visitor<'de> for LimitVisitor {
            type Value = QueueLimit;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("\"auto\", a non-negative integer, or null")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<QueueLimit, E> {
                if value == "auto" {
                    Ok(QueueLimit::Auto)
                } else {
                    Err(E::invalid_value(de::Unexpected::Str(value), &self))
                }
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<QueueLimit, E> {
                Ok(QueueLimit::Limit(value as usize))
            }

            fn visit_none<E: de::Error>(self) -> Result<QueueLimit, E> {
                Ok(QueueLimit::Unbounded)
            }

            fn visit_unit<E: de::Error>(self) -> Result<QueueLimit, E> {
                Ok(QueueLimit::Unbounded)
            }

            fn visit_some<D>(self, deserializer: D) -> Result<QueueLimit, D::Error>
            where
                D: Deserializer<'de>,
            {
                deserializer.deserialize_any(LimitVisitor)
            }
        }

        deserializer.deserialize_option(LimitVisitor)
    }
}

/// Caps applied to each spawned worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Stack size in bytes for thread-backed workers
    pub stack_size: Option<usize>,
}

/// How to launch process-backed workers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessOptions {
    /// Worker binary to spawn; required when the process runtime is selected
    pub program: Option<PathBuf>,

    /// Arguments passed to the worker binary
    pub args: Vec<String>,

    /// Extra environment variables for the worker
    pub env: Vec<(String, String)>,
}

/// User-facing pool options, all optional
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Execution runtime for workers
    pub runtime: Option<RuntimeKind>,

    /// Default target file for submissions that name none
    pub target_file: Option<String>,

    /// Default handler name, "default" if unset
    pub target_name: Option<String>,

    /// Lower bound on pool size
    pub min_threads: Option<usize>,

    /// Upper bound on pool size
    pub max_threads: Option<usize>,

    /// Tasks a single worker may run at once
    pub concurrent_tasks_per_worker: Option<usize>,

    /// How long a fully idle worker lives before eviction
    #[serde(with = "duration_millis::opt")]
    pub idle_timeout: Option<Duration>,

    /// How long teardown waits for a worker to exit
    #[serde(with = "duration_millis::opt")]
    pub terminate_timeout: Option<Duration>,

    /// Bound on queued tasks
    pub max_queue: Option<QueueLimit>,

    /// Shared-counter fast path for thread workers
    pub use_fast_path: Option<bool>,

    /// Replace every worker after each completed task
    pub isolate_workers: Option<bool>,

    /// Recycle a worker once its reported memory exceeds this many bytes
    pub max_memory_before_recycle: Option<u64>,

    /// Handler name invoked on each worker before it is torn down
    pub teardown: Option<String>,

    /// Opaque value handed to every worker at startup
    pub worker_data: Option<Value>,

    /// Per-worker resource caps
    pub resource_limits: Option<ResourceLimits>,

    /// Process runtime launch settings
    pub process: Option<ProcessOptions>,
}

impl PoolOptions {
    /// Create empty options; every field falls back to its default
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker runtime
    pub fn with_runtime(mut self, runtime: RuntimeKind) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Set the default target file
    pub fn with_target_file(mut self, file: impl Into<String>) -> Self {
        self.target_file = Some(file.into());
        self
    }

    /// Set the default handler name
    pub fn with_target_name(mut self, name: impl Into<String>) -> Self {
        self.target_name = Some(name.into());
        self
    }

    /// Set the minimum pool size
    pub fn with_min_threads(mut self, min: usize) -> Self {
        self.min_threads = Some(min);
        self
    }

    /// Set the maximum pool size
    pub fn with_max_threads(mut self, max: usize) -> Self {
        self.max_threads = Some(max);
        self
    }

    /// Set per-worker concurrency
    pub fn with_concurrent_tasks_per_worker(mut self, tasks: usize) -> Self {
        self.concurrent_tasks_per_worker = Some(tasks);
        self
    }

    /// Set the idle eviction timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Set the teardown wait window
    pub fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = Some(timeout);
        self
    }

    /// Set the queue bound
    pub fn with_max_queue(mut self, limit: QueueLimit) -> Self {
        self.max_queue = Some(limit);
        self
    }

    /// Enable or disable the shared-counter fast path
    pub fn with_fast_path(mut self, enabled: bool) -> Self {
        self.use_fast_path = Some(enabled);
        self
    }

    /// Enable or disable per-task worker isolation
    pub fn with_isolate_workers(mut self, isolate: bool) -> Self {
        self.isolate_workers = Some(isolate);
        self
    }

    /// Set the memory ceiling that triggers worker recycling
    pub fn with_max_memory_before_recycle(mut self, bytes: u64) -> Self {
        self.max_memory_before_recycle = Some(bytes);
        self
    }

    /// Set the teardown handler name
    pub fn with_teardown(mut self, name: impl Into<String>) -> Self {
        self.teardown = Some(name.into());
        self
    }

    /// Set the startup value handed to every worker
    pub fn with_worker_data(mut self, data: Value) -> Self {
        self.worker_data = Some(data);
        self
    }

    /// Set per-worker resource caps
    pub fn with_resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = Some(limits);
        self
    }

    /// Set process runtime launch settings
    pub fn with_process(mut self, process: ProcessOptions) -> Self {
        self.process = Some(process);
        self
    }

    /// Resolve into an effective configuration
    ///
    /// A one-sided min/max conflict clamps toward the explicit value; a
    /// conflict between two explicit values is an error.
    pub fn resolve(self) -> Result<PoolConfig, ConfigError> {
        let cpus = num_cpus::get_physical().max(1);
        let default_min = (cpus / 2).max(1);
        let default_max = cpus;

        let (min_threads, max_threads) = match (self.min_threads, self.max_threads) {
            (Some(min), Some(max)) => {
                if min > max {
                    return Err(ConfigError::MinExceedsMax { min, max });
                }
                (min.max(1), max.max(1))
            }
            (Some(min), None) => {
                let min = min.max(1);
                (min, default_max.max(min))
            }
            (None, Some(max)) => {
                let max = max.max(1);
                (default_min.min(max), max)
            }
            (None, None) => (default_min, default_max),
        };

        let runtime = self.runtime.unwrap_or_default();
        let process = self.process.unwrap_or_default();
        if runtime == RuntimeKind::Process && process.program.is_none() {
            return Err(ConfigError::MissingProgram);
        }

        Ok(PoolConfig {
            runtime,
            target_file: self.target_file,
            target_name: self.target_name.unwrap_or_else(|| "default".to_string()),
            min_threads,
            max_threads,
            concurrent_tasks_per_worker: self.concurrent_tasks_per_worker.unwrap_or(1).max(1),
            idle_timeout: self.idle_timeout.unwrap_or(Duration::ZERO),
            terminate_timeout: self.terminate_timeout,
            max_queue: self.max_queue.unwrap_or_default().resolve(max_threads),
            use_fast_path: self.use_fast_path.unwrap_or(true),
            isolate_workers: self.isolate_workers.unwrap_or(false),
            max_memory_before_recycle: self.max_memory_before_recycle,
            teardown: self.teardown,
            worker_data: self.worker_data.unwrap_or(Value::Null),
            resource_limits: self.resource_limits.unwrap_or_default(),
            process,
        })
    }
}

/// Effective pool configuration with every default applied
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Execution runtime selected at construction
    pub runtime: RuntimeKind,

    /// Default target file, if any
    pub target_file: Option<String>,

    /// Default handler name
    pub target_name: String,

    /// Lower bound on pool size, at least 1
    pub min_threads: usize,

    /// Upper bound on pool size, at least `min_threads`
    pub max_threads: usize,

    /// Tasks a single worker may run at once, at least 1
    pub concurrent_tasks_per_worker: usize,

    /// Idle worker lifetime before eviction
    #[serde(with = "duration_millis")]
    pub idle_timeout: Duration,

    /// Teardown wait window, `None` to wait indefinitely
    #[serde(with = "duration_millis::opt")]
    pub terminate_timeout: Option<Duration>,

    /// Queue bound, `None` for unbounded, `Some(0)` for no queue
    pub max_queue: Option<usize>,

    /// Shared-counter fast path for thread workers
    pub use_fast_path: bool,

    /// Replace every worker after each completed task
    pub isolate_workers: bool,

    /// Memory ceiling that triggers worker recycling
    pub max_memory_before_recycle: Option<u64>,

    /// Teardown handler name, if any
    pub teardown: Option<String>,

    /// Startup value handed to every worker
    pub worker_data: Value,

    /// Per-worker resource caps
    pub resource_limits: ResourceLimits,

    /// Process runtime launch settings
    pub process: ProcessOptions,
}

/// Serialize durations as integer milliseconds
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }

    /// Same encoding for optional durations
    pub mod opt {
        use serde::{Deserialize, Deserializer, Serialize, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            duration
                .map(|d| d.as_millis() as u64)
                .serialize(serializer)
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let millis = Option::<u64>::deserialize(deserializer)?;
            Ok(millis.map(Duration::from_millis))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_resolve() {
        let config = PoolOptions::new().resolve().unwrap();
        assert!(config.min_threads >= 1);
        assert!(config.max_threads >= config.min_threads);
        assert_eq!(config.concurrent_tasks_per_worker, 1);
        assert_eq!(config.idle_timeout, Duration::ZERO);
        assert_eq!(config.max_queue, None);
        assert_eq!(config.target_name, "default");
        assert!(config.use_fast_path);
        assert!(!config.isolate_workers);
    }

    #[test]
    fn test_explicit_conflict_is_an_error() {
        let err = PoolOptions::new()
            .with_min_threads(8)
            .with_max_threads(2)
            .resolve()
            .unwrap_err();
        assert_eq!(err, ConfigError::MinExceedsMax { min: 8, max: 2 });
    }

    #[test]
    fn test_one_sided_max_clamps_minimum_down() {
        let config = PoolOptions::new().with_max_threads(1).resolve().unwrap();
        assert_eq!(config.min_threads, 1);
        assert_eq!(config.max_threads, 1);
    }

    #[test]
    fn test_one_sided_min_raises_maximum() {
        let config = PoolOptions::new().with_min_threads(64).resolve().unwrap();
        assert_eq!(config.min_threads, 64);
        assert!(config.max_threads >= 64);
    }

    #[test]
    fn test_zero_bounds_normalize_to_one() {
        let config = PoolOptions::new()
            .with_min_threads(0)
            .with_max_threads(0)
            .resolve()
            .unwrap();
        assert_eq!(config.min_threads, 1);
        assert_eq!(config.max_threads, 1);
    }

    #[test]
    fn test_auto_queue_limit_is_max_threads_squared() {
        let config = PoolOptions::new()
            .with_max_threads(4)
            .with_max_queue(QueueLimit::Auto)
            .resolve()
            .unwrap();
        assert_eq!(config.max_queue, Some(16));
    }

    #[test]
    fn test_process_runtime_requires_a_program() {
        let err = PoolOptions::new()
            .with_runtime(RuntimeKind::Process)
            .resolve()
            .unwrap_err();
        assert_eq!(err, ConfigError::MissingProgram);

        let config = PoolOptions::new()
            .with_runtime(RuntimeKind::Process)
            .with_process(ProcessOptions {
                program: Some("worker".into()),
                ..Default::default()
            })
            .resolve()
            .unwrap();
        assert_eq!(config.runtime, RuntimeKind::Process);
    }

    #[test]
    fn test_queue_limit_serde() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            limit: QueueLimit,
        }

        let auto: Wrapper = serde_json::from_str(r#"{"limit":"auto"}"#).unwrap();
        assert_eq!(auto.limit, QueueLimit::Auto);

        let bounded: Wrapper = serde_json::from_str(r#"{"limit":32}"#).unwrap();
        assert_eq!(bounded.limit, QueueLimit::Limit(32));

        let unbounded: Wrapper = serde_json::from_str(r#"{"limit":null}"#).unwrap();
        assert_eq!(unbounded.limit, QueueLimit::Unbounded);

        assert_eq!(
            serde_json::to_string(&Wrapper {
                limit: QueueLimit::Auto
            })
            .unwrap(),
            r#"{"limit":"auto"}"#
        );
    }

    #[test]
    fn test_options_serde_round_trip() {
        let options = PoolOptions::new()
            .with_max_threads(3)
            .with_idle_timeout(Duration::from_millis(250))
            .with_teardown("cleanup");
        let json = serde_json::to_string(&options).unwrap();
        let back: PoolOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_threads, Some(3));
        assert_eq!(back.idle_timeout, Some(Duration::from_millis(250)));
        assert_eq!(back.teardown.as_deref(), Some("cleanup"));
    }
}
