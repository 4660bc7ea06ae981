//! Model a slower (or faster) accelerator.
//!
//! The active profile is reduced to a dimensionless speed multiplier (1.0 is the
//! reference accelerator, less is slower, more is faster). Simulated compute delay is
//! proportional to the workload (`layers * tokens`) and to how much slower than the
//! reference the simulated accelerator is. Faster-than-reference profiles never
//! slow the caller down.

use crate::{config::Resolver, Clock, Error, SimulationConfig};
use std::{env, future::Future, sync::Arc, time::Duration};
use tracing::{debug, trace, warn};

/// Environment variable overriding [Tuning::reference_tflops].
pub const REFERENCE_ENV: &str = "EXO_REF_FP16_TFLOPS";

/// Environment variable overriding [Tuning::base_ms_per_layer].
pub const BASE_ENV: &str = "EXO_BASE_MS_PER_LAYER";

/// Default reference compute capability (fp16 TFLOPS).
pub const DEFAULT_REFERENCE_TFLOPS: f64 = 100.0;

/// Default time per layer per token in milliseconds.
pub const DEFAULT_BASE_MS_PER_LAYER: f64 = 0.10;

/// Number of layers assumed when no workload is provided.
pub const DEFAULT_LAYERS: usize = 32;

/// Lowest speed multiplier (a zero speed would imply an infinite delay).
pub const MIN_SPEED: f64 = 1e-4;

/// Highest speed multiplier.
pub const MAX_SPEED: f64 = 100.0;

/// Describes the work a compute step performs (e.g. a model shard).
pub trait Workload {
    /// Number of layers executed per token.
    fn layers(&self) -> usize;
}

/// Externally tunable constants of the throttle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Tuning {
    /// Compute capability that maps to a speed of 1.0.
    pub reference_tflops: f64,

    /// Time per layer per token, in milliseconds, at reference speed.
    pub base_ms_per_layer: f64,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            reference_tflops: DEFAULT_REFERENCE_TFLOPS,
            base_ms_per_layer: DEFAULT_BASE_MS_PER_LAYER,
        }
    }
}

impl Tuning {
    /// Read tuning from the process environment.
    ///
    /// Values that cannot be parsed are ignored (with a warning) in favor of the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            reference_tflops: knob(REFERENCE_ENV, defaults.reference_tflops),
            base_ms_per_layer: knob(BASE_ENV, defaults.base_ms_per_layer),
        }
    }
}

fn parse_knob(name: &'static str, raw: &str) -> Result<f64, Error> {
    raw.trim()
        .parse::<f64>()
        .map_err(|err| Error::InvalidParameter(name, format!("{raw:?} ({err})")))
}

fn knob(name: &'static str, default: f64) -> f64 {
    let Ok(raw) = env::var(name) else {
        return default;
    };
    parse_knob(name, &raw).unwrap_or_else(|err| {
        warn!(?err, default, "ignoring throttle tuning");
        default
    })
}

/// Normalize an absolute compute capability against the reference.
fn normalize(tflops: f64, reference: f64) -> Result<f64, Error> {
    if reference == 0.0 {
        return Err(Error::InvalidParameter(
            "reference_tflops",
            reference.to_string(),
        ));
    }
    let speed = tflops.max(0.0) / reference;
    if speed.is_nan() {
        return Err(Error::InvalidParameter(
            "tops_override_fp16_tflops",
            tflops.to_string(),
        ));
    }
    Ok(speed.max(MIN_SPEED))
}

/// Apply a relative scale to a speed.
fn rescale(speed: f64, scale: f64) -> Result<f64, Error> {
    let scaled = speed * scale;
    if !scale.is_finite() || scaled.is_nan() {
        return Err(Error::InvalidParameter("tops_scale", scale.to_string()));
    }
    Ok(scaled)
}

/// Compute the speed multiplier of a profile, in `[MIN_SPEED, MAX_SPEED]`.
///
/// Returns exactly `1.0` when `config` is absent or disabled. A step that cannot be
/// computed (e.g. a zero reference) is skipped.
pub fn multiplier(config: Option<&SimulationConfig>, tuning: &Tuning) -> f64 {
    let Some(config) = config.filter(|config| config.enable) else {
        return 1.0;
    };

    let mut speed = 1.0;
    if let Some(tflops) = config.tops_override_fp16_tflops {
        match normalize(tflops, tuning.reference_tflops) {
            Ok(normalized) => speed = normalized,
            Err(err) => debug!(?err, "skipping compute override"),
        }
    }
    if let Some(scale) = config.tops_scale {
        match rescale(speed, scale) {
            Ok(scaled) => speed = scaled,
            Err(err) => debug!(?err, "skipping compute scale"),
        }
    }
    speed.clamp(MIN_SPEED, MAX_SPEED)
}

/// Compute the simulated delay of running `tokens` tokens through `layers` layers at `speed`.
///
/// `layers` defaults to [DEFAULT_LAYERS]; both counts are raised to at least one. A speed at
/// or above 1.0 yields [Duration::ZERO].
pub fn compute_delay(
    speed: f64,
    tuning: &Tuning,
    layers: Option<usize>,
    tokens: usize,
) -> Result<Duration, Error> {
    let layers = layers.unwrap_or(DEFAULT_LAYERS).max(1) as f64;
    let tokens = tokens.max(1) as f64;
    let base_ms = tuning.base_ms_per_layer * layers * tokens;
    let delay_ms = base_ms * (1.0 / speed - 1.0);
    if delay_ms.is_nan() {
        return Err(Error::InvalidDelay(delay_ms));
    }
    if delay_ms <= 0.0 {
        return Ok(Duration::ZERO);
    }
    Duration::try_from_secs_f64(delay_ms / 1000.0).map_err(|_| Error::InvalidDelay(delay_ms))
}

/// Inserts compute delays according to the active simulation profile.
#[derive(Clone)]
pub struct Throttle<C: Clock> {
    clock: C,
    resolver: Arc<Resolver>,
    tuning: Tuning,
}

impl<C: Clock> Throttle<C> {
    pub fn new(clock: C, resolver: Arc<Resolver>, tuning: Tuning) -> Self {
        Self {
            clock,
            resolver,
            tuning,
        }
    }

    pub fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    /// Speed multiplier of the active profile (exactly `1.0` when inactive).
    pub fn multiplier(&self) -> f64 {
        multiplier(self.resolver.active(), &self.tuning)
    }

    /// Simulated delay for `tokens` tokens through `workload` (zero if it cannot be computed).
    pub fn delay(&self, workload: Option<&dyn Workload>, tokens: usize) -> Duration {
        if self.resolver.active().is_none() {
            return Duration::ZERO;
        }
        let layers = workload.map(|workload| workload.layers());
        match compute_delay(self.multiplier(), &self.tuning, layers, tokens) {
            Ok(delay) => delay,
            Err(err) => {
                warn!(?err, "skipping compute delay");
                Duration::ZERO
            }
        }
    }

    /// Wait for the simulated delay of `tokens` tokens through `workload`.
    ///
    /// Completes on first poll (without touching the clock) when the delay is zero.
    pub fn simulate_compute_delay(
        &self,
        workload: Option<&dyn Workload>,
        tokens: usize,
    ) -> impl Future<Output = ()> + Send + 'static {
        let delay = self.delay(workload, tokens);
        let clock = self.clock.clone();
        async move {
            if delay.is_zero() {
                return;
            }
            trace!(?delay, tokens, "throttling compute");
            clock.sleep(delay).await;
        }
    }
}
