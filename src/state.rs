//! Mutable training state and seeded random streams.

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::TrainingConfig;
use crate::error::Result;
use crate::instrumentation::LossHistory;
use crate::lora::{AdapterRegistry, LoraLayerSelector};
use crate::model::DiffusionBackend;
use crate::optimizer::{AdamWOptimizer, OptimizerConfig};

const STEP_STREAM: u64 = 0x9E37_79B9_7F4A_7C15;
const EPOCH_STREAM: u64 = 0xD1B5_4A32_D192_ED03;

/// Generator for the sampling done at global step `step`.
///
/// Derived from `(seed, step)` alone so a resumed run draws the same values.
/// Offset by one so step 0 never replays the adapter-init stream of `seed`.
#[must_use]
pub fn step_rng(seed: u64, step: usize) -> StdRng {
    StdRng::seed_from_u64(seed ^ (step as u64 + 1).wrapping_mul(STEP_STREAM))
}

/// Generator for the example permutation of `epoch`.
#[must_use]
pub fn epoch_rng(seed: u64, epoch: usize) -> StdRng {
    StdRng::seed_from_u64(seed ^ (epoch as u64 + 1).wrapping_mul(EPOCH_STREAM))
}

/// Everything that changes while training.
#[derive(Debug)]
pub struct TrainingState {
    /// Zero-based epoch of the last completed step.
    pub epoch: usize,
    /// Completed optimizer steps.
    pub global_step: usize,
    /// Seed all random streams derive from.
    pub seed: u64,
    /// Trainable adapters.
    pub adapters: AdapterRegistry,
    /// Optimizer over the adapter variables.
    pub optimizer: AdamWOptimizer,
    /// Recorded losses.
    pub losses: LossHistory,
}

impl TrainingState {
    /// Fresh state: newly initialized adapters and an empty optimizer.
    pub fn fresh<B: DiffusionBackend + ?Sized>(
        config: &TrainingConfig,
        backend: &B,
    ) -> Result<Self> {
        let adapters = LoraLayerSelector::new(backend.architecture()).select(
            config.lora_layers.specs(),
            config.seed,
            backend.device(),
        )?;
        let optimizer =
            OptimizerConfig::from_settings(&config.optimizer).build_adamw(adapters.named_vars())?;
        Ok(Self {
            epoch: 0,
            global_step: 0,
            seed: config.seed,
            adapters,
            optimizer,
            losses: LossHistory::default(),
        })
    }
}
