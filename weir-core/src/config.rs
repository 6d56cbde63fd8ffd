//! Runtime and service configuration.
//!
//! [`RuntimeConfig`] controls the worker fleet: how many I/O worker threads
//! are spawned, which driver they use (io_uring or the legacy poller), and
//! the sizing of the optional blocking-exec thread pool that handlers may
//! use through `monoio::spawn_blocking`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Submission queue depth handed to io_uring workers.
const DEFAULT_URING_ENTRIES: u32 = 32768;

/// Default grace period granted to in-flight connections on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// Configuration options for the worker runtime environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Number of I/O worker threads. Each worker owns its own runtime and
    /// accepts connections independently.
    #[serde(default = "default_workers")]
    pub worker_threads: usize,

    /// Number of acceptor threads. With per-worker accept loops this is
    /// recorded for API compatibility; accepting always happens on the
    /// workers themselves.
    #[serde(default = "default_boss_threads")]
    pub boss_threads: usize,

    /// Size of the blocking-exec thread pool shared by all workers.
    /// `None` disables `spawn_blocking` support.
    pub exec_threads: Option<usize>,

    /// Number of I/O entries for io_uring submission queues.
    #[serde(default = "default_entries")]
    pub entries: u32,

    /// Idle timeout for io_uring submission queue polling.
    pub sqpoll_idle: Option<u32>,

    /// The type of runtime driver to use.
    #[serde(default)]
    pub runtime_type: RuntimeType,

    /// Whether to pin worker threads to CPU cores.
    #[serde(default)]
    pub cpu_affinity: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_threads: default_workers(),
            boss_threads: default_boss_threads(),
            exec_threads: None,
            entries: default_entries(),
            sqpoll_idle: None,
            runtime_type: Default::default(),
            cpu_affinity: false,
        }
    }
}

/// Runtime driver selection: io_uring on Linux when available, otherwise
/// the legacy poll-based driver.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    #[cfg(target_os = "linux")]
    IoUring,
    Legacy,
}

impl Default for RuntimeType {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        {
            RuntimeType::IoUring
        }
        #[cfg(not(target_os = "linux"))]
        {
            RuntimeType::Legacy
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_boss_threads() -> usize {
    1
}

fn default_entries() -> u32 {
    DEFAULT_URING_ENTRIES
}
