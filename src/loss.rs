//! Rectified-flow training objective.
//!
//! For a clean latent `l_T`, noise `ε` and step `t` the noisy latent is
//! `l_t = (1 − σ_t)·l_T + σ_t·ε`. Consecutive latents differ by
//! `l_{t+1} − l_t = Δσ_t·(ε − l_T)`, so the single-step noise prediction the
//! model should output is `ε − l_T` for every `t`, and the loss is
//! `mean((ε'_t + l_T − ε)²)`.

use candle_core::{DType, Device, Shape, Tensor};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{DreamboothError, Result};
use crate::lora::AdapterRegistry;
use crate::model::{DiffusionBackend, EncodedExample};
use crate::schedule::NoiseSchedule;

/// `(1 − σ)·clean + σ·noise`.
pub fn interpolate_latents(clean: &Tensor, noise: &Tensor, sigma: f64) -> Result<Tensor> {
    Ok(clean
        .affine(1.0 - sigma, 0.0)?
        .add(&noise.affine(sigma, 0.0)?)?)
}

/// The noise prediction that reproduces the schedule exactly: `ε − l_T`.
pub fn noise_target(clean: &Tensor, noise: &Tensor) -> Result<Tensor> {
    Ok(noise.sub(clean)?)
}

/// One denoising update `l + Δσ·ε'`.
pub fn euler_step(latents: &Tensor, predicted: &Tensor, delta: f64) -> Result<Tensor> {
    Ok(latents.add(&predicted.affine(delta, 0.0)?)?)
}

/// `mean((predicted + clean − noise)²)` as a scalar f32 tensor.
pub fn rectified_flow_loss(predicted: &Tensor, clean: &Tensor, noise: &Tensor) -> Result<Tensor> {
    if predicted.dims() != clean.dims() {
        return Err(DreamboothError::Backend(format!(
            "predicted noise has shape {:?}, latents have {:?}",
            predicted.dims(),
            clean.dims()
        )));
    }
    let residual = predicted
        .to_dtype(DType::F32)?
        .add(&clean.to_dtype(DType::F32)?)?
        .sub(&noise.to_dtype(DType::F32)?)?;
    Ok(residual.sqr()?.mean_all()?)
}

/// Standard normal noise of `shape`, drawn from `rng`.
pub fn sample_noise<R: Rng + ?Sized>(
    shape: &Shape,
    dtype: DType,
    device: &Device,
    rng: &mut R,
) -> Result<Tensor> {
    let values: Vec<f32> = (0..shape.elem_count())
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect();
    Ok(Tensor::from_vec(values, shape.clone(), device)?.to_dtype(dtype)?)
}

/// Evaluates the objective through a backend.
#[derive(Debug, Clone, Copy)]
pub struct LossEvaluator<'a> {
    schedule: &'a NoiseSchedule,
}

impl<'a> LossEvaluator<'a> {
    /// Evaluator sampling steps from `schedule`.
    #[must_use]
    pub fn new(schedule: &'a NoiseSchedule) -> Self {
        Self { schedule }
    }

    /// Loss of one example at a random step `t ∈ [0, T)` with fresh noise.
    pub fn example_loss<B, R>(
        &self,
        backend: &B,
        adapters: &AdapterRegistry,
        example: &EncodedExample,
        rng: &mut R,
    ) -> Result<Tensor>
    where
        B: DiffusionBackend + ?Sized,
        R: Rng + ?Sized,
    {
        let t = rng.gen_range(0..self.schedule.steps());
        let sigma = self.schedule.sigma(t);
        let clean = &example.clean_latents;
        let noise = sample_noise(clean.shape(), clean.dtype(), clean.device(), rng)?;

        let latents_t = interpolate_latents(clean, &noise, sigma)?;
        let predicted =
            backend.predict_noise(&latents_t, t, sigma, &example.conditioning, adapters)?;
        rectified_flow_loss(&predicted, clean, &noise)
    }

    /// Mean of the per-example losses.
    pub fn batch_loss<B, R>(
        &self,
        backend: &B,
        adapters: &AdapterRegistry,
        batch: &[&EncodedExample],
        rng: &mut R,
    ) -> Result<Tensor>
    where
        B: DiffusionBackend + ?Sized,
        R: Rng + ?Sized,
    {
        if batch.is_empty() {
            return Err(DreamboothError::Training("empty batch".to_string()));
        }
        let losses = batch
            .iter()
            .map(|example| self.example_loss(backend, adapters, example, rng))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(&losses, 0)?.mean_all()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tensor(values: &[f32]) -> Tensor {
        Tensor::new(values, &Device::Cpu).unwrap()
    }

    fn close(a: &Tensor, b: &Tensor) -> bool {
        let diff: f32 = a.sub(b).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        diff < 1e-5
    }

    #[test]
    fn test_interpolation_endpoints() {
        let clean = tensor(&[1.0, 2.0, 3.0]);
        let noise = tensor(&[-1.0, 0.5, 0.0]);
        assert!(close(&interpolate_latents(&clean, &noise, 1.0).unwrap(), &noise));
        assert!(close(&interpolate_latents(&clean, &noise, 0.0).unwrap(), &clean));
    }

    #[test]
    fn test_target_reproduces_next_latent() {
        let mut rng = StdRng::seed_from_u64(3);
        let shape = Shape::from((2, 6));
        let clean = sample_noise(&shape, DType::F32, &Device::Cpu, &mut rng).unwrap();
        let noise = sample_noise(&shape, DType::F32, &Device::Cpu, &mut rng).unwrap();
        let target = noise_target(&clean, &noise).unwrap();

        let schedule = NoiseSchedule::linear(10).unwrap();
        for t in [0, 4, 9] {
            let (s0, s1) = (schedule.sigma(t), schedule.sigma(t + 1));
            let now = interpolate_latents(&clean, &noise, s0).unwrap();
            let next = interpolate_latents(&clean, &noise, s1).unwrap();
            let stepped = euler_step(&now, &target, schedule.delta(t)).unwrap();
            assert!(close(&stepped, &next), "t = {t}");
        }
    }

    #[test]
    fn test_perfect_prediction_has_zero_loss() {
        let clean = tensor(&[0.5, -0.25, 1.0, 2.0]);
        let noise = tensor(&[1.0, 1.0, -1.0, 0.0]);
        let target = noise_target(&clean, &noise).unwrap();
        let loss: f32 = rectified_flow_loss(&target, &clean, &noise)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(loss.abs() < 1e-7);
    }

    #[test]
    fn test_loss_value() {
        let clean = tensor(&[0.0, 0.0]);
        let noise = tensor(&[1.0, 3.0]);
        let predicted = tensor(&[0.0, 0.0]);
        let loss: f32 = rectified_flow_loss(&predicted, &clean, &noise)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!((loss - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_loss_rejects_shape_mismatch() {
        let clean = tensor(&[0.0, 0.0]);
        let predicted = tensor(&[0.0, 0.0, 0.0]);
        assert!(matches!(
            rectified_flow_loss(&predicted, &clean, &clean),
            Err(DreamboothError::Backend(_))
        ));
    }

    #[test]
    fn test_noise_is_seeded() {
        let shape = Shape::from((3, 4));
        let noise = |seed| {
            sample_noise(&shape, DType::F32, &Device::Cpu, &mut StdRng::seed_from_u64(seed))
                .unwrap()
        };
        let (a, b) = (noise(5), noise(5));
        assert!(close(&a, &b));
        assert_eq!(a.dims(), &[3, 4]);
    }
}
