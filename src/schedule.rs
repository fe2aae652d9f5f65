//! Noise schedule.
//!
//! A schedule of `T` steps is a sequence of `T + 1` interpolation
//! coefficients `σ_0 = 1.0 ≥ σ_1 ≥ … ≥ σ_T = 0.0` between pure noise and the
//! clean latent.

use crate::config::{ModelVariant, TrainingConfig};
use crate::error::{DreamboothError, Result};

/// Spacing of the σ values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScheduleKind {
    /// Evenly spaced from 1 down to `1/T`, then 0.
    Linear,
    /// Linear spacing warped by a resolution-dependent time shift.
    Shifted {
        /// Image width in pixels.
        width: u32,
        /// Image height in pixels.
        height: u32,
    },
}

impl ScheduleKind {
    /// Spacing used by a model variant at a resolution.
    #[must_use]
    pub fn for_model(model: ModelVariant, width: u32, height: u32) -> Self {
        match model {
            ModelVariant::Schnell => ScheduleKind::Linear,
            ModelVariant::Dev => ScheduleKind::Shifted { width, height },
        }
    }
}

/// Precomputed σ values.
///
/// # Example
///
/// ```rust
/// use dreambooth_rs::schedule::NoiseSchedule;
///
/// let schedule = NoiseSchedule::linear(4).unwrap();
/// assert_eq!(schedule.sigmas(), &[1.0, 0.75, 0.5, 0.25, 0.0]);
/// assert_eq!(schedule.delta(1), -0.25);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseSchedule {
    kind: ScheduleKind,
    sigmas: Vec<f64>,
}

impl NoiseSchedule {
    /// Build a schedule of `steps` steps.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when `steps` is zero.
    pub fn new(steps: usize, kind: ScheduleKind) -> Result<Self> {
        if steps == 0 {
            return Err(DreamboothError::Config(
                "steps must be at least 1".to_string(),
            ));
        }

        let t = steps as f64;
        let mut sigmas: Vec<f64> = (0..steps).map(|i| 1.0 - i as f64 / t).collect();

        if let ScheduleKind::Shifted { width, height } = kind {
            let mu = time_shift_mu(width, height);
            for sigma in &mut sigmas {
                *sigma = shift_sigma(mu, *sigma);
            }
        }

        sigmas.push(0.0);
        Ok(Self { kind, sigmas })
    }

    /// Linear schedule.
    pub fn linear(steps: usize) -> Result<Self> {
        Self::new(steps, ScheduleKind::Linear)
    }

    /// Schedule for a training config.
    pub fn for_config(config: &TrainingConfig) -> Result<Self> {
        Self::new(
            config.steps,
            ScheduleKind::for_model(config.model, config.width, config.height),
        )
    }

    /// Spacing of this schedule.
    #[must_use]
    pub fn kind(&self) -> ScheduleKind {
        self.kind
    }

    /// Number of steps `T`.
    #[must_use]
    pub fn steps(&self) -> usize {
        self.sigmas.len() - 1
    }

    /// Number of σ values, `T + 1`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sigmas.len()
    }

    /// Always false; a schedule has at least two values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sigmas.is_empty()
    }

    /// All σ values.
    #[must_use]
    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    /// σ at step `t`.
    ///
    /// # Panics
    ///
    /// Panics when `t > T`.
    #[must_use]
    pub fn sigma(&self, t: usize) -> f64 {
        self.sigmas[t]
    }

    /// `σ(t + 1) − σ(t)`; never positive.
    ///
    /// # Panics
    ///
    /// Panics when `t >= T`.
    #[must_use]
    pub fn delta(&self, t: usize) -> f64 {
        self.sigmas[t + 1] - self.sigmas[t]
    }
}

// Linear fit of the shift exponent between 256 and 4096 latent tokens.
const BASE_SHIFT: f64 = 0.5;
const MAX_SHIFT: f64 = 1.15;
const BASE_SEQ_LEN: f64 = 256.0;
const MAX_SEQ_LEN: f64 = 4096.0;

fn time_shift_mu(width: u32, height: u32) -> f64 {
    let m = (MAX_SHIFT - BASE_SHIFT) / (MAX_SEQ_LEN - BASE_SEQ_LEN);
    let b = BASE_SHIFT - m * BASE_SEQ_LEN;
    m * (f64::from(width) * f64::from(height) / 256.0) + b
}

fn shift_sigma(mu: f64, sigma: f64) -> f64 {
    let e = mu.exp();
    e / (e + (1.0 / sigma - 1.0))
}
