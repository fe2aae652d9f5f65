//! Adam/AdamW over adapter variables.
//!
//! Follows the update rule of `candle_nn::AdamW` but keeps the moment
//! estimates addressable by parameter name so they can be checkpointed.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::Optimizer;

use crate::config::{OptimizerKind, OptimizerSettings};
use crate::error::{CheckpointFault, DreamboothError, Result};

/// Suffix of first-moment tensors in optimizer state.
pub const EXP_AVG: &str = "exp_avg";
/// Suffix of second-moment tensors in optimizer state.
pub const EXP_AVG_SQ: &str = "exp_avg_sq";

/// Optimizer configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Weight decay
    pub weight_decay: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            weight_decay: 0.01,
            eps: 1e-8,
        }
    }
}

impl OptimizerConfig {
    /// Hyperparameters for the configured algorithm; `Adam` has no weight decay.
    #[must_use]
    pub fn from_settings(settings: &OptimizerSettings) -> Self {
        let weight_decay = match settings.name {
            OptimizerKind::AdamW => 0.01,
            OptimizerKind::Adam => 0.0,
        };
        Self {
            learning_rate: settings.learning_rate,
            weight_decay,
            ..Self::default()
        }
    }

    /// Create an optimizer over named variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the moment buffers cannot be allocated.
    pub fn build_adamw(&self, vars: Vec<(String, Var)>) -> Result<AdamWOptimizer> {
        AdamWOptimizer::with_names(vars, self.clone())
            .map_err(|e| DreamboothError::Training(format!("Failed to create AdamW: {e}")))
    }
}

#[derive(Debug)]
struct ParamState {
    name: String,
    var: Var,
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
}

/// AdamW with exportable state.
#[derive(Debug)]
pub struct AdamWOptimizer {
    params: Vec<ParamState>,
    step_t: usize,
    config: OptimizerConfig,
}

impl AdamWOptimizer {
    fn with_names(vars: Vec<(String, Var)>, config: OptimizerConfig) -> candle_core::Result<Self> {
        let params = vars
            .into_iter()
            .map(|(name, var)| {
                let exp_avg = var.zeros_like()?;
                let exp_avg_sq = var.zeros_like()?;
                Ok(ParamState {
                    name,
                    var,
                    exp_avg,
                    exp_avg_sq,
                })
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            params,
            step_t: 0,
            config,
        })
    }

    /// Hyperparameters.
    #[must_use]
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Number of updates applied so far.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.step_t
    }

    /// Number of optimized variables.
    #[must_use]
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Backpropagate `loss` and apply one update.
    ///
    /// # Errors
    ///
    /// Returns an error if the backward pass or the update fails.
    pub fn update(&mut self, loss: &Tensor) -> Result<()> {
        self.backward_step(loss)
            .map_err(|e| DreamboothError::Training(format!("Optimizer step failed: {e}")))
    }

    /// Moment estimates keyed `<param>.exp_avg` / `<param>.exp_avg_sq`.
    #[must_use]
    pub fn state_tensors(&self) -> Vec<(String, Tensor)> {
        self.params
            .iter()
            .flat_map(|p| {
                [
                    (format!("{}.{EXP_AVG}", p.name), p.exp_avg.clone()),
                    (format!("{}.{EXP_AVG_SQ}", p.name), p.exp_avg_sq.clone()),
                ]
            })
            .collect()
    }

    /// Restore moment estimates and the step counter.
    ///
    /// Validates every tensor before replacing any state.
    pub fn load_state(
        &mut self,
        tensors: &HashMap<String, Tensor>,
        step_count: usize,
    ) -> Result<()> {
        let restored = self
            .params
            .iter()
            .map(|p| {
                Ok((
                    restore_moment(p, EXP_AVG, tensors)?,
                    restore_moment(p, EXP_AVG_SQ, tensors)?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        for (p, (exp_avg, exp_avg_sq)) in self.params.iter_mut().zip(restored) {
            p.exp_avg = exp_avg;
            p.exp_avg_sq = exp_avg_sq;
        }
        self.step_t = step_count;
        Ok(())
    }
}

fn restore_moment(
    p: &ParamState,
    suffix: &str,
    tensors: &HashMap<String, Tensor>,
) -> Result<Tensor> {
    let key = format!("{}.{suffix}", p.name);
    let tensor = tensors.get(&key).ok_or_else(|| {
        CheckpointFault::SpecMismatch(format!("optimizer state `{key}` not present in checkpoint"))
    })?;
    if tensor.dims() != p.var.dims() {
        return Err(CheckpointFault::ShapeMismatch {
            key,
            expected: p.var.dims().to_vec(),
            found: tensor.dims().to_vec(),
        }
        .into());
    }
    Ok(tensor.to_dtype(p.var.dtype())?)
}

impl Optimizer for AdamWOptimizer {
    type Config = OptimizerConfig;

    fn new(vars: Vec<Var>, config: OptimizerConfig) -> candle_core::Result<Self> {
        let named = vars
            .into_iter()
            .enumerate()
            .map(|(i, var)| (format!("param.{i}"), var))
            .collect();
        Self::with_names(named, config)
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.step_t += 1;
        let OptimizerConfig {
            learning_rate: lr,
            beta1,
            beta2,
            weight_decay,
            eps,
        } = self.config;
        let t = i32::try_from(self.step_t).unwrap_or(i32::MAX);
        let scale_m = 1.0 / (1.0 - beta1.powi(t));
        let scale_v = 1.0 / (1.0 - beta2.powi(t));

        for p in &mut self.params {
            let Some(g) = grads.get(p.var.as_tensor()) else {
                continue;
            };
            let exp_avg = p.exp_avg.affine(beta1, 0.0)?.add(&g.affine(1.0 - beta1, 0.0)?)?;
            let exp_avg_sq = p
                .exp_avg_sq
                .affine(beta2, 0.0)?
                .add(&g.sqr()?.affine(1.0 - beta2, 0.0)?)?;

            let m_hat = exp_avg.affine(scale_m, 0.0)?;
            let v_hat = exp_avg_sq.affine(scale_v, 0.0)?;
            let adjusted = m_hat.div(&v_hat.sqrt()?.affine(1.0, eps)?)?;

            let decayed = p.var.as_tensor().affine(1.0 - lr * weight_decay, 0.0)?;
            let next = decayed.sub(&adjusted.affine(lr, 0.0)?)?;

            p.var.set(&next)?;
            p.exp_avg = exp_avg.detach();
            p.exp_avg_sq = exp_avg_sq.detach();
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }
}
