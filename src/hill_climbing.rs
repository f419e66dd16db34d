//! Hill-climbing concurrency controller
//!
//! The controller continuously searches for the thread count that maximizes
//! completions per second. It cannot observe the throughput derivative
//! directly, so it superimposes a small deterministic wave on the thread-count
//! goal and extracts, with a resonance filter tuned to the wave frequency, the
//! oscillation this induces in the throughput series. The complex ratio of
//! the two oscillations approximates the local derivative; a biased, gained
//! and clamped correction then walks the control setting along it.
//!
//! The controller is plain mutable state: callers serialize access through
//! the thread-adjustment lock, so it is never invoked concurrently with
//! itself.

use crate::config::HillClimbingConfig;
use log::debug;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::ops::{Div, Mul, Sub};

/// Divisor applied to the sample interval when the controller detects excess
/// capacity it cannot shed (negative correction while pinned at the minimum
/// goal), so the next look comes sooner
const EXCESS_CAPACITY_RESAMPLE_DIVISOR: f64 = 10.0;

/// Why the thread-count goal moved, for the log
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Transition {
    /// Not enough history to measure anything yet
    Warmup,
    /// The goal was changed behind the controller's back and it is re-basing
    Initializing,
    /// Ordinary move along the measured throughput gradient
    ClimbingMove,
    /// The thread-count wave vanished, holding position
    Stabilizing,
    /// The gate thread force-raised the goal around the controller
    Starvation,
    /// An idle worker retired and dragged the goal down with it
    ThreadTimedOut,
    /// Blocking compensation adjusted the goal directly
    CooperativeBlocking,
    /// The configured thread bounds changed
    ConfigurationChange,
}

/// Throughput-maximizing thread count estimator
#[derive(Debug)]
pub(crate) struct HillClimbing {
    /// Tuning knobs
    config: HillClimbingConfig,

    /// Real-valued control setting the goal oscillates around
    current_control_setting: f64,

    /// Samples accepted since construction
    total_samples: u64,

    /// Goal the controller last knew about, to detect outside interference
    last_thread_count: u16,

    /// Smoothed estimate of the throughput measurement noise
    average_throughput_noise: f64,

    /// Time spent at the current goal, for the log
    elapsed_since_last_change: f64,

    /// Work completed at the current goal, for the log
    completions_since_last_change: u64,

    /// Sample time carried over from rejected noisy samples
    accumulated_sample_duration: f64,

    /// Completions carried over from rejected noisy samples
    accumulated_completion_count: u64,

    /// Ring buffer of throughput samples
    samples: Box<[f64]>,

    /// Ring buffer of thread-count samples, aligned with `samples`
    thread_counts: Box<[f64]>,

    /// Interval chosen for the sample currently being collected
    current_sample_interval_ms: u32,

    /// Per-instance interval generator; the fixed seed keeps pool instances
    /// from resonating with each other
    rng: StdRng,
}
//
impl HillClimbing {
    /// Set up the controller for a pool whose initial goal is `initial_goal`
    pub fn new(config: HillClimbingConfig, initial_goal: u16, seed: u64) -> Self {
        assert!(
            config.wave_period >= 2,
            "the measurement wave needs at least two phases"
        );
        assert!(
            config.wave_history_size >= 1,
            "the sample history must hold at least one wave period"
        );
        assert!(
            config.sample_interval_low_ms <= config.sample_interval_high_ms,
            "the sample interval bounds are inverted"
        );
        let samples_to_measure = config.wave_period * config.wave_history_size;
        let mut rng = StdRng::seed_from_u64(seed);
        let current_sample_interval_ms =
            rng.gen_range(config.sample_interval_low_ms..=config.sample_interval_high_ms);
        Self {
            config,
            current_control_setting: f64::from(initial_goal),
            total_samples: 0,
            last_thread_count: initial_goal,
            average_throughput_noise: 0.0,
            elapsed_since_last_change: 0.0,
            completions_since_last_change: 0,
            accumulated_sample_duration: 0.0,
            accumulated_completion_count: 0,
            samples: vec![0.0; samples_to_measure].into_boxed_slice(),
            thread_counts: vec![0.0; samples_to_measure].into_boxed_slice(),
            current_sample_interval_ms,
            rng,
        }
    }

    /// Interval the controller wants the current sample collected over
    pub fn current_sample_interval_ms(&self) -> u32 {
        self.current_sample_interval_ms
    }

    /// Feed one completed sample, get the next goal and sample interval
    ///
    /// `current_goal` is the goal the sample was collected under, and the
    /// returned goal is clamped to `[min_goal, max_threads]`.
    pub fn update(
        &mut self,
        current_goal: u16,
        sample_seconds: f64,
        completions: u64,
        min_goal: u16,
        max_threads: u16,
        cpu_utilization_percent: u8,
    ) -> (u16, u32) {
        let config = self.config;

        // If someone changed the goal without telling us, re-base on it
        if current_goal != self.last_thread_count {
            self.force_change(current_goal, Transition::Initializing);
        }

        self.elapsed_since_last_change += sample_seconds;
        self.completions_since_last_change += completions;

        // Fold in anything carried over from previously rejected samples
        let sample_seconds = sample_seconds + self.accumulated_sample_duration;
        let completions = completions + self.accumulated_completion_count;

        // Completion counting misses work straddling the sample boundaries,
        // which skews short samples badly when many threads run few items
        // each. Accumulate such samples instead of acting on them, and ask
        // for a quick re-sample.
        let too_noisy = completions == 0
            || sample_seconds <= 0.0
            || (f64::from(current_goal) - 1.0) / completions as f64 > config.max_sample_error;
        if too_noisy {
            self.accumulated_sample_duration = sample_seconds;
            self.accumulated_completion_count = completions;
            self.current_sample_interval_ms = config.sample_interval_low_ms;
            return (current_goal, self.current_sample_interval_ms);
        }
        self.accumulated_sample_duration = 0.0;
        self.accumulated_completion_count = 0;

        // Record the sample
        let throughput = completions as f64 / sample_seconds;
        let samples_to_measure = self.samples.len();
        let sample_index = (self.total_samples % samples_to_measure as u64) as usize;
        self.samples[sample_index] = throughput;
        self.thread_counts[sample_index] = f64::from(current_goal);
        self.total_samples += 1;

        let mut ratio = Complex::default();
        let mut confidence = 0.0;
        let mut transition = Transition::Warmup;

        // Measure once at least one full wave period of history exists
        let sample_count = (self.total_samples - 1).min(samples_to_measure as u64) as usize
            / config.wave_period
            * config.wave_period;
        if sample_count > config.wave_period {
            let mut throughput_sum = 0.0;
            let mut thread_sum = 0.0;
            for i in 0..sample_count {
                let idx = self.ring_index(sample_count, i);
                throughput_sum += self.samples[idx];
                thread_sum += self.thread_counts[idx];
            }
            let average_throughput = throughput_sum / sample_count as f64;
            let average_thread_count = thread_sum / sample_count as f64;

            if average_throughput > 0.0 && average_thread_count > 0.0 {
                // The two periods closest to the wave period; any energy the
                // filter finds there is noise, not our own signal
                let wave_ratio = sample_count / config.wave_period;
                let adjacent_period_1 = sample_count as f64 / (wave_ratio as f64 + 1.0);
                let adjacent_period_2 = sample_count as f64 / (wave_ratio as f64 - 1.0);

                let throughput_wave =
                    self.wave_component(&self.samples, sample_count, config.wave_period as f64)
                        * (1.0 / average_throughput);
                let mut throughput_error = (self
                    .wave_component(&self.samples, sample_count, adjacent_period_1)
                    * (1.0 / average_throughput))
                    .abs();
                if adjacent_period_2 <= sample_count as f64 {
                    throughput_error = throughput_error.max(
                        (self.wave_component(&self.samples, sample_count, adjacent_period_2)
                            * (1.0 / average_throughput))
                            .abs(),
                    );
                }
                let thread_wave = self.wave_component(
                    &self.thread_counts,
                    sample_count,
                    config.wave_period as f64,
                ) * (1.0 / average_thread_count);

                self.average_throughput_noise = if self.average_throughput_noise == 0.0 {
                    throughput_error
                } else {
                    config.throughput_error_smoothing_factor * throughput_error
                        + (1.0 - config.throughput_error_smoothing_factor)
                            * self.average_throughput_noise
                };

                if thread_wave.abs() > 0.0 {
                    // Subtracting the target ratio biases flat throughput
                    // curves toward a downward move: a thread that does not
                    // pay its way gets cut
                    ratio = (throughput_wave - thread_wave * config.target_throughput_ratio)
                        / thread_wave;
                    transition = Transition::ClimbingMove;
                } else {
                    ratio = Complex::default();
                    transition = Transition::Stabilizing;
                }

                let noise_for_confidence =
                    self.average_throughput_noise.max(throughput_error);
                confidence = if thread_wave.abs() > noise_for_confidence {
                    (thread_wave.abs() / noise_for_confidence)
                        / config.target_signal_to_noise_ratio
                } else {
                    0.0
                };
            }
        }

        // Turn the measured derivative into a bounded, gained correction
        let mut correction = ratio.re.clamp(-1.0, 1.0);
        correction *= confidence.clamp(0.0, 1.0);
        let gain = config.max_change_per_second * sample_seconds;
        let magnitude = correction.abs().powf(config.gain_exponent) * gain;
        correction = if correction >= 0.0 { magnitude } else { -magnitude };
        correction = correction.min(config.max_change_per_sample);

        // Growing the pool on a saturated machine only adds context switching
        if correction > 0.0 && cpu_utilization_percent > config.cpu_utilization_high_percent {
            correction = 0.0;
        }

        self.current_control_setting += correction;

        // The wave magnitude tracks the measured noise so the signal stays
        // detectable without perturbing throughput more than necessary
        let wave_magnitude = (0.5
            + self.current_control_setting
                * self.average_throughput_noise
                * config.target_signal_to_noise_ratio
                * config.thread_magnitude_multiplier
                * 2.0)
            .min(config.max_thread_wave_magnitude)
            .max(1.0);

        // Keep the whole wave inside the configured bounds
        self.current_control_setting = self
            .current_control_setting
            .min(f64::from(max_threads) - wave_magnitude)
            .max(f64::from(min_goal));

        // Superimpose the wave: this perturbation is what makes the
        // derivative observable in future samples
        let wave_phase = (self.total_samples / (config.wave_period as u64 / 2)) % 2;
        let new_goal = ((self.current_control_setting + wave_magnitude * wave_phase as f64)
            as i64)
            .clamp(i64::from(min_goal), i64::from(max_threads)) as u16;

        if new_goal != current_goal {
            self.change_thread_count(new_goal, transition);
        }

        // When shrinking is impossible because we are already at the minimum,
        // look again sooner: excess capacity costs nothing to re-measure
        let next_interval_ms = if ratio.re < 0.0 && new_goal == min_goal {
            let shortened = f64::from(self.current_sample_interval_ms)
                / (EXCESS_CAPACITY_RESAMPLE_DIVISOR * (-ratio.re).max(1.0));
            (shortened.round() as u32).max(config.sample_interval_low_ms)
        } else {
            self.rng
                .gen_range(config.sample_interval_low_ms..=config.sample_interval_high_ms)
        };
        self.current_sample_interval_ms = next_interval_ms;
        (new_goal, next_interval_ms)
    }

    /// Track a goal change made around the controller (starvation override,
    /// worker retirement, blocking compensation, configuration change)
    pub fn force_change(&mut self, new_goal: u16, transition: Transition) {
        if new_goal != self.last_thread_count {
            self.current_control_setting +=
                f64::from(new_goal) - f64::from(self.last_thread_count);
            self.change_thread_count(new_goal, transition);
        }
    }

    /// Record that the goal changed and restart the per-goal statistics
    fn change_thread_count(&mut self, new_goal: u16, transition: Transition) {
        let throughput = if self.elapsed_since_last_change > 0.0 {
            self.completions_since_last_change as f64 / self.elapsed_since_last_change
        } else {
            0.0
        };
        debug!(
            "thread count goal {} -> {new_goal} ({transition:?}, {throughput:.1} items/s at old goal)",
            self.last_thread_count,
        );
        self.last_thread_count = new_goal;
        self.elapsed_since_last_change = 0.0;
        self.completions_since_last_change = 0;
    }

    /// Amplitude and phase of the oscillation at `period` in the last
    /// `sample_count` entries of one of the sample rings
    ///
    /// This is the Goertzel algorithm: one resonance filter pass over the
    /// window, yielding the single Fourier component we care about.
    fn wave_component(&self, data: &[f64], sample_count: usize, period: f64) -> Complex {
        debug_assert!(period >= 2.0 && period <= sample_count as f64);
        let w = 2.0 * std::f64::consts::PI / period;
        let cosine = w.cos();
        let sine = w.sin();
        let coefficient = 2.0 * cosine;
        let mut q1 = 0.0;
        let mut q2 = 0.0;
        for i in 0..sample_count {
            let q0 = coefficient * q1 - q2 + data[self.ring_index(sample_count, i)];
            q2 = q1;
            q1 = q0;
        }
        Complex {
            re: q1 - q2 * cosine,
            im: q2 * sine,
        } * (1.0 / sample_count as f64)
    }

    /// Ring position of the `i`-th entry of the trailing `sample_count`
    /// window
    fn ring_index(&self, sample_count: usize, i: usize) -> usize {
        ((self.total_samples - sample_count as u64 + i as u64)
            % self.samples.len() as u64) as usize
    }
}

/// Bare-bones complex number, enough for one filter output ratio
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Complex {
    re: f64,
    im: f64,
}
//
impl Complex {
    /// Modulus
    fn abs(self) -> f64 {
        self.re.hypot(self.im)
    }
}
//
impl Mul<f64> for Complex {
    type Output = Self;

    fn mul(self, rhs: f64) -> Self {
        Self {
            re: self.re * rhs,
            im: self.im * rhs,
        }
    }
}
//
impl Sub for Complex {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self {
            re: self.re - rhs.re,
            im: self.im - rhs.im,
        }
    }
}
//
impl Div for Complex {
    type Output = Self;

    fn div(self, rhs: Self) -> Self {
        let denominator = rhs.re * rhs.re + rhs.im * rhs.im;
        Self {
            re: (self.re * rhs.re + self.im * rhs.im) / denominator,
            im: (self.im * rhs.re - self.re * rhs.im) / denominator,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HillClimbingConfig;

    fn controller(initial_goal: u16) -> HillClimbing {
        HillClimbing::new(HillClimbingConfig::default(), initial_goal, 42)
    }

    #[test]
    fn complex_arithmetic() {
        let a = Complex { re: 1.0, im: 2.0 };
        let b = Complex { re: 3.0, im: -1.0 };
        let q = a / b;
        assert!((q.re - 0.1).abs() < 1e-12);
        assert!((q.im - 0.7).abs() < 1e-12);
        assert!((Complex { re: 3.0, im: 4.0 }.abs() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn noisy_samples_are_accumulated_not_acted_on() {
        let mut hc = controller(8);
        // 8 threads completing 10 items is far above the 15% error bound
        let (goal, interval) = hc.update(8, 0.1, 10, 1, 16, 0);
        assert_eq!(goal, 8);
        assert_eq!(
            interval,
            HillClimbingConfig::default().sample_interval_low_ms
        );
        // Accumulation must eventually let the combined sample through
        let mut accepted = false;
        for _ in 0..200 {
            hc.update(8, 0.1, 10, 1, 16, 0);
            if hc.total_samples > 0 {
                accepted = true;
                break;
            }
        }
        assert!(accepted, "accumulated samples never became acceptable");
    }

    #[test]
    fn zero_completions_never_divide() {
        let mut hc = controller(4);
        let (goal, _) = hc.update(4, 1.0, 0, 1, 16, 0);
        assert_eq!(goal, 4);
    }

    /// If throughput does not depend on thread count at all, the controller
    /// must shed the useless threads and settle at the minimum goal.
    #[test]
    fn converges_to_minimum_under_constant_throughput() {
        let mut hc = controller(4);
        let mut goal = 4u16;
        let mut reached_minimum_at = None;
        for iteration in 0..160 {
            let (new_goal, _) = hc.update(goal, 1.0, 200, 1, 10, 0);
            goal = new_goal;
            if goal == 1 && reached_minimum_at.is_none() {
                reached_minimum_at = Some(iteration);
            }
            if iteration >= 110 {
                assert!(
                    (1..=3).contains(&goal),
                    "goal {goal} strayed beyond the dither band at iteration {iteration}"
                );
            }
        }
        let reached = reached_minimum_at.expect("never reached the minimum goal");
        assert!(
            reached <= 100,
            "took {reached} iterations to reach the minimum goal"
        );
    }

    /// With throughput saturating at 8 threads, the controller must find the
    /// knee and hold near it.
    #[test]
    fn converges_to_saturation_knee() {
        let mut hc = controller(1);
        let mut goal = 1u16;
        for _ in 0..200 {
            let completions = u64::from(goal.min(8)) * 10;
            let (new_goal, _) = hc.update(goal, 1.0, completions, 1, 16, 0);
            goal = new_goal;
        }
        assert!(
            (7..=9).contains(&goal),
            "goal {goal} did not converge to the saturation knee"
        );
    }

    #[test]
    fn force_change_rebases_the_control_setting() {
        let mut hc = controller(4);
        hc.force_change(9, Transition::Starvation);
        assert_eq!(hc.last_thread_count, 9);
        assert!((hc.current_control_setting - 9.0).abs() < 1e-12);
    }

    #[test]
    fn suppresses_growth_under_high_cpu_utilization() {
        let mut hc = controller(1);
        let mut goal = 1u16;
        for _ in 0..100 {
            // Strongly increasing throughput, but the machine is pegged
            let completions = u64::from(goal) * 100;
            let (new_goal, _) = hc.update(goal, 1.0, completions, 1, 16, 99);
            goal = new_goal;
        }
        // Only the wave may lift the goal above the unmoved control setting
        assert!(goal <= 5, "goal {goal} grew despite saturated CPU");
    }
}
