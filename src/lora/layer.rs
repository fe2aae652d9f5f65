//! Low-rank adapter for a single linear sublayer.

use candle_core::{DType, Device, Tensor, Var};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;

use crate::error::Result;

/// Trainable `lora_A · lora_B` delta added to a frozen linear layer.
///
/// `lora_A` is `(in, r)` and `lora_B` is `(r, out)`; inputs are row vectors so
/// the delta for `x` of shape `(.., in)` is `x · A · B`.
#[derive(Debug, Clone)]
pub struct LoraLinear {
    lora_a: Var,
    lora_b: Var,
}

impl LoraLinear {
    /// Fresh adapter: `A ~ U(±1/√in)`, `B = 0`, so the delta starts at zero.
    pub fn new<R: Rng + ?Sized>(
        in_dim: usize,
        out_dim: usize,
        rank: usize,
        rng: &mut R,
        device: &Device,
    ) -> Result<Self> {
        let bound = 1.0 / (in_dim as f32).sqrt();
        let dist = Uniform::new_inclusive(-bound, bound);
        let values: Vec<f32> = (0..in_dim * rank).map(|_| dist.sample(rng)).collect();

        let lora_a = Var::from_tensor(&Tensor::from_vec(values, (in_dim, rank), device)?)?;
        let lora_b = Var::zeros((rank, out_dim), DType::F32, device)?;

        Ok(Self { lora_a, lora_b })
    }

    /// Input features.
    #[must_use]
    pub fn in_dim(&self) -> usize {
        self.lora_a.dims()[0]
    }

    /// Output features.
    #[must_use]
    pub fn out_dim(&self) -> usize {
        self.lora_b.dims()[1]
    }

    /// Adapter rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.lora_a.dims()[1]
    }

    /// Down projection `(in, r)`.
    #[must_use]
    pub fn lora_a(&self) -> &Var {
        &self.lora_a
    }

    /// Up projection `(r, out)`.
    #[must_use]
    pub fn lora_b(&self) -> &Var {
        &self.lora_b
    }

    /// Trainable parameter count.
    #[must_use]
    pub fn param_count(&self) -> usize {
        self.rank() * (self.in_dim() + self.out_dim())
    }

    /// Adapter contribution for `x` of shape `(.., in)`, in `x`'s dtype.
    pub fn delta(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let h = x
            .to_dtype(self.lora_a.dtype())?
            .broadcast_matmul(self.lora_a.as_tensor())?
            .broadcast_matmul(self.lora_b.as_tensor())?;
        Ok(h.to_dtype(dtype)?)
    }

    /// `base_out + delta(x)`.
    pub fn forward(&self, x: &Tensor, base_out: &Tensor) -> Result<Tensor> {
        Ok(base_out.add(&self.delta(x)?)?)
    }

    /// Weight delta `(A · B)ᵀ` of shape `(out, in)`, ready to add to a base
    /// weight stored in `(out, in)` layout.
    pub fn merged_delta(&self) -> Result<Tensor> {
        let product = self.lora_a.as_tensor().matmul(self.lora_b.as_tensor())?;
        Ok(product.t()?.contiguous()?)
    }

    /// Overwrite both factors; shapes must already match.
    pub(crate) fn set(&self, lora_a: &Tensor, lora_b: &Tensor) -> Result<()> {
        self.lora_a.set(&lora_a.to_dtype(self.lora_a.dtype())?)?;
        self.lora_b.set(&lora_b.to_dtype(self.lora_b.dtype())?)?;
        Ok(())
    }
}
