//! Pool configuration
//!
//! Every tuning constant of the scheduler is a named, overridable field here.
//! The defaults are the empirically-tuned policy values the sizing and
//! blocking algorithms were designed around; override them only with
//! measurements in hand.

use std::{error::Error, fmt, sync::Arc};

/// Highest thread count any configuration may request
///
/// Thread counts live in 16-bit fields of a packed atomic word, and signed
/// arithmetic on intermediate values must not overflow.
pub const MAX_SUPPORTED_THREADS: usize = i16::MAX as usize;

/// Source of a system-wide CPU utilization estimate
///
/// Sampled by the gate thread once per gate period. The sizing controller
/// suppresses upward corrections above
/// [`HillClimbingConfig::cpu_utilization_high_percent`], and the starvation
/// detector widens its threshold above
/// [`GateConfig::cpu_utilization_low_percent`].
pub trait CpuUtilizationSource: Send + Sync {
    /// Current CPU utilization in percent, 0..=100
    fn utilization_percent(&self) -> u8;
}

/// Source of a process memory-pressure estimate
///
/// Sampled by the gate thread once per gate period and consumed by the
/// blocking-compensation logic, which refuses to raise the thread-count goal
/// past the configured fraction of the memory budget.
pub trait MemoryUsageSource: Send + Sync {
    /// Current usage and budget watermark
    fn usage(&self) -> MemoryUsage;
}

/// A memory-pressure snapshot
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MemoryUsage {
    /// Bytes currently in use by the process
    pub current_bytes: u64,

    /// Total memory budget in bytes, `0` meaning "no budget configured"
    pub high_watermark_bytes: u64,
}

/// Default CPU signal: always idle, which never suppresses growth
struct NoCpuSignal;
//
impl CpuUtilizationSource for NoCpuSignal {
    fn utilization_percent(&self) -> u8 {
        0
    }
}

/// Default memory signal: no budget, which disables the memory cap
struct NoMemorySignal;
//
impl MemoryUsageSource for NoMemorySignal {
    fn usage(&self) -> MemoryUsage {
        MemoryUsage::default()
    }
}

/// Thread pool configuration
///
/// `min_threads`/`max_threads` bound the thread-count goal for the lifetime of
/// the pool (and can later be adjusted through
/// [`ThreadPool::set_min_threads()`](crate::ThreadPool::set_min_threads) /
/// [`ThreadPool::set_max_threads()`](crate::ThreadPool::set_max_threads)).
/// The nested structs tune the individual control loops.
#[derive(Clone)]
pub struct ThreadPoolConfig {
    /// Lower bound on the thread-count goal (must be `> 0`)
    pub min_threads: usize,

    /// Upper bound on the thread-count goal (must be `>= min_threads`)
    pub max_threads: usize,

    /// Sizing-controller tuning
    pub hill_climbing: HillClimbingConfig,

    /// Cooperative-blocking compensation tuning
    pub blocking: BlockingConfig,

    /// Gate-thread tuning
    pub gate: GateConfig,

    /// Worker-thread tuning
    pub worker: WorkerConfig,

    /// CPU utilization signal, sampled by the gate thread
    pub cpu_utilization: Arc<dyn CpuUtilizationSource>,

    /// Memory-pressure signal, sampled by the gate thread
    pub memory_usage: Arc<dyn MemoryUsageSource>,
}
//
impl ThreadPoolConfig {
    /// Check the configuration for internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::validate_thread_range(self.min_threads, self.max_threads)
    }

    /// Check a `(min, max)` thread bound pair
    pub(crate) fn validate_thread_range(min: usize, max: usize) -> Result<(), ConfigError> {
        if min == 0 {
            return Err(ConfigError::ZeroMinThreads);
        }
        if max > MAX_SUPPORTED_THREADS {
            return Err(ConfigError::TooManyThreads { requested: max });
        }
        if min > max {
            return Err(ConfigError::InvalidThreadRange { min, max });
        }
        Ok(())
    }
}
//
impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            min_threads: processor_count(),
            max_threads: 512,
            hill_climbing: HillClimbingConfig::default(),
            blocking: BlockingConfig::default(),
            gate: GateConfig::default(),
            worker: WorkerConfig::default(),
            cpu_utilization: Arc::new(NoCpuSignal),
            memory_usage: Arc::new(NoMemorySignal),
        }
    }
}
//
impl fmt::Debug for ThreadPoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolConfig")
            .field("min_threads", &self.min_threads)
            .field("max_threads", &self.max_threads)
            .field("hill_climbing", &self.hill_climbing)
            .field("blocking", &self.blocking)
            .field("gate", &self.gate)
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

/// Sizing-controller (hill climbing) tuning
///
/// The controller samples `(throughput, thread count)` pairs, extracts the
/// oscillation the superimposed thread-count wave induces in throughput, and
/// moves its control setting along the estimated throughput gradient.
#[derive(Clone, Copy, Debug)]
pub struct HillClimbingConfig {
    /// Length of the measurement wave, in samples
    pub wave_period: usize,

    /// Number of full wave periods kept in the sample history
    pub wave_history_size: usize,

    /// Upper bound on the thread-count wave magnitude
    pub max_thread_wave_magnitude: f64,

    /// Scale factor applied to the noise-derived wave magnitude
    pub thread_magnitude_multiplier: f64,

    /// Throughput gain each additional thread must at least produce, as a
    /// fraction of the per-thread average; flat throughput curves therefore
    /// yield a downward correction
    pub target_throughput_ratio: f64,

    /// Wave amplitude targeted relative to the measured throughput noise
    pub target_signal_to_noise_ratio: f64,

    /// Bound on the control-setting change per second
    pub max_change_per_second: f64,

    /// Bound on the control-setting change per sample
    pub max_change_per_sample: f64,

    /// Samples with `(threads - 1) / completions` above this are considered
    /// too noisy to act on and are accumulated instead
    pub max_sample_error: f64,

    /// Exponential-smoothing factor for the running throughput-noise average
    pub throughput_error_smoothing_factor: f64,

    /// Exponent applied to the magnitude of each correction
    pub gain_exponent: f64,

    /// Lower bound of the random sample-interval draw, in milliseconds
    pub sample_interval_low_ms: u32,

    /// Upper bound of the random sample-interval draw, in milliseconds
    pub sample_interval_high_ms: u32,

    /// CPU utilization above which upward corrections are suppressed
    pub cpu_utilization_high_percent: u8,

    /// Seed for the per-instance sample-interval generator
    ///
    /// `None` derives a seed from the pool instance id, which keeps separate
    /// pool instances from resonating with each other while staying
    /// deterministic for a given construction order.
    pub sample_interval_seed: Option<u64>,
}
//
impl Default for HillClimbingConfig {
    fn default() -> Self {
        Self {
            wave_period: 4,
            wave_history_size: 8,
            max_thread_wave_magnitude: 20.0,
            thread_magnitude_multiplier: 1.0,
            target_throughput_ratio: 0.15,
            target_signal_to_noise_ratio: 3.0,
            max_change_per_second: 4.0,
            max_change_per_sample: 20.0,
            max_sample_error: 0.15,
            throughput_error_smoothing_factor: 0.01,
            gain_exponent: 2.0,
            sample_interval_low_ms: 10,
            sample_interval_high_ms: 200,
            cpu_utilization_high_percent: 95,
            sample_interval_seed: None,
        }
    }
}

/// Cooperative-blocking compensation tuning
#[derive(Clone, Copy, Debug)]
pub struct BlockingConfig {
    /// Number of compensating threads added with no delay at all
    pub threads_to_add_without_delay: usize,

    /// Every this many threads added for blocking, the delay between further
    /// additions grows by one step
    pub threads_per_delay_step: usize,

    /// Base delay between rate-limited goal increments, in milliseconds
    pub delay_step_ms: u32,

    /// Upper bound on the delay between goal increments, in milliseconds
    pub max_delay_ms: u32,

    /// Estimated memory cost of one additional worker thread, in bytes
    pub estimated_thread_memory_bytes: u64,

    /// Fraction of the memory budget that compensation must not push usage
    /// beyond
    pub high_memory_fraction: f64,
}
//
impl Default for BlockingConfig {
    fn default() -> Self {
        let procs = processor_count();
        Self {
            threads_to_add_without_delay: procs,
            threads_per_delay_step: (procs / 2).max(1),
            delay_step_ms: 25,
            max_delay_ms: 250,
            estimated_thread_memory_bytes: 64 * 1024,
            high_memory_fraction: 0.8,
        }
    }
}

/// Gate-thread tuning
#[derive(Clone, Copy, Debug)]
pub struct GateConfig {
    /// Housekeeping period, in milliseconds
    pub period_ms: u32,

    /// CPU utilization below which the starvation threshold is one gate
    /// period regardless of thread count
    pub cpu_utilization_low_percent: u8,

    /// Per-goal-thread starvation threshold used when the CPU is busy, in
    /// milliseconds
    pub dequeue_delay_threshold_ms: u32,

    /// Idle gate cycles before the gate thread retires itself
    pub max_runs: u32,
}
//
impl Default for GateConfig {
    fn default() -> Self {
        Self {
            period_ms: 500,
            cpu_utilization_low_percent: 80,
            dequeue_delay_threshold_ms: 1_000,
            max_runs: 2,
        }
    }
}

/// Worker-thread tuning
#[derive(Clone, Copy, Debug)]
pub struct WorkerConfig {
    /// How long an idle worker waits for work before retiring, in
    /// milliseconds
    pub idle_timeout_ms: u64,

    /// How long a worker keeps dispatching before returning to the outer
    /// loop so goal changes take effect, in milliseconds
    pub dispatch_quantum_ms: u64,

    /// Spin iterations a waiter performs on the pool semaphore before
    /// parking
    pub semaphore_spin_count: u32,

    /// Initial capacity of each worker's local queue, rounded up to a power
    /// of two
    pub local_queue_capacity: usize,
}
//
impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 20_000,
            dispatch_quantum_ms: 30,
            semaphore_spin_count: 70,
            local_queue_capacity: 32,
        }
    }
}

/// Errors rejected at the configuration boundary, state unchanged
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConfigError {
    /// A minimum thread count of zero would deadlock the pool
    ZeroMinThreads,

    /// The minimum thread count exceeds the maximum
    InvalidThreadRange {
        /// Requested minimum
        min: usize,
        /// Effective maximum it exceeds
        max: usize,
    },

    /// The requested thread count does not fit the packed accounting word
    TooManyThreads {
        /// Requested maximum
        requested: usize,
    },
}
//
impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroMinThreads => write!(f, "minimum thread count must be at least 1"),
            Self::InvalidThreadRange { min, max } => {
                write!(f, "minimum thread count {min} exceeds maximum {max}")
            }
            Self::TooManyThreads { requested } => write!(
                f,
                "thread count {requested} exceeds supported maximum {MAX_SUPPORTED_THREADS}"
            ),
        }
    }
}
//
impl Error for ConfigError {}

/// Number of hardware execution contexts, with a fallback for exotic targets
pub(crate) fn processor_count() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        ThreadPoolConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_min() {
        let config = ThreadPoolConfig {
            min_threads: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroMinThreads));
    }

    #[test]
    fn rejects_inverted_range() {
        let config = ThreadPoolConfig {
            min_threads: 8,
            max_threads: 4,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidThreadRange { min: 8, max: 4 })
        );
    }

    #[test]
    fn rejects_oversized_max() {
        let config = ThreadPoolConfig {
            max_threads: MAX_SUPPORTED_THREADS + 1,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::TooManyThreads {
                requested: MAX_SUPPORTED_THREADS + 1
            })
        );
    }
}
