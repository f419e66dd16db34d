#![warn(clippy::print_stdout, clippy::print_stderr, clippy::dbg_macro)]

//! A self-tuning pool of OS worker threads.
//!
//! Work items submitted through [`ThreadPool::submit()`] are distributed over
//! per-worker stealable queues backed by a shared overflow FIFO. The number of
//! concurrently active workers is continuously re-tuned by a hill-climbing
//! controller that perturbs the thread-count goal and measures the resulting
//! throughput, while a background gate thread watches for starvation and
//! applies compensation for workers that report blocking in their callbacks
//! via [`ThreadPool::notify_blocking_begin()`].

mod blocking;
pub mod config;
mod counts;
mod gate;
mod hill_climbing;
mod lock;
pub mod pool;
pub mod queue;
mod semaphore;
pub mod wait;
mod worker;

pub use config::{
    BlockingConfig, ConfigError, CpuUtilizationSource, GateConfig, HillClimbingConfig, MemoryUsage,
    MemoryUsageSource, ThreadPoolConfig, WorkerConfig,
};
pub use pool::ThreadPool;
pub use wait::{WaitEvent, WaitRegistration};

/// Work scheduled for one-time execution by the thread pool
pub(crate) type WorkItem = Box<dyn FnOnce() + Send + 'static>;
