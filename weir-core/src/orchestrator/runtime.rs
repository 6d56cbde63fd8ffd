use std::future::Future;

#[cfg(target_os = "linux")]
use monoio::IoUringDriver;
use monoio::{blocking::ThreadPool, time::TimeDriver, LegacyDriver, Runtime, RuntimeBuilder};

use crate::config::{RuntimeConfig, RuntimeType};

/// Blocking-exec pool shared by the workers, attached to each runtime.
pub type BlockingPool = Option<Box<dyn ThreadPool + Send + 'static>>;

// sqpoll below one second burns a kernel thread for nothing
#[cfg(target_os = "linux")]
const SQPOLL_IDLE_FLOOR: u32 = 1000;

/// One worker's runtime: io_uring where requested and detected, the
/// legacy poller everywhere else.
pub enum RuntimeWrapper {
    #[cfg(target_os = "linux")]
    IoUring(Runtime<TimeDriver<IoUringDriver>>),
    Legacy(Runtime<TimeDriver<LegacyDriver>>),
}

impl RuntimeWrapper {
    pub fn new(config: &RuntimeConfig, blocking_pool: BlockingPool) -> Self {
        match config.runtime_type {
            #[cfg(target_os = "linux")]
            RuntimeType::IoUring if monoio::utils::detect_uring() => {
                Self::io_uring(config, blocking_pool)
            }
            _ => Self::legacy(blocking_pool),
        }
    }

    #[cfg(target_os = "linux")]
    fn io_uring(config: &RuntimeConfig, blocking_pool: BlockingPool) -> Self {
        let mut builder = RuntimeBuilder::<IoUringDriver>::new();
        if let Some(idle) = config.sqpoll_idle {
            let mut uring = io_uring::IoUring::builder();
            uring.setup_sqpoll(idle.max(SQPOLL_IDLE_FLOOR));
            builder = builder.uring_builder(uring);
        }
        builder = builder.with_entries(config.entries);
        if let Some(pool) = blocking_pool {
            builder = builder.attach_thread_pool(pool);
        }
        RuntimeWrapper::IoUring(
            builder
                .enable_timer()
                .build()
                .expect("worker io_uring runtime construction failed"),
        )
    }

    fn legacy(blocking_pool: BlockingPool) -> Self {
        let mut builder = RuntimeBuilder::<LegacyDriver>::new();
        if let Some(pool) = blocking_pool {
            builder = builder.attach_thread_pool(pool);
        }
        RuntimeWrapper::Legacy(
            builder
                .enable_timer()
                .build()
                .expect("worker runtime construction failed"),
        )
    }

    pub fn block_on<F>(&mut self, future: F) -> F::Output
    where
        F: Future,
    {
        match self {
            #[cfg(target_os = "linux")]
            RuntimeWrapper::IoUring(runtime) => runtime.block_on(future),
            RuntimeWrapper::Legacy(runtime) => runtime.block_on(future),
        }
    }
}
