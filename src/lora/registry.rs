//! Keyed collection of adapters consulted by the backend's forward pass.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use candle_core::{Tensor, Var};

use crate::error::{CheckpointFault, Result};
use crate::lora::LoraLinear;
use crate::model::BlockGroup;

/// Location of an adapted sublayer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AdapterKey {
    /// Block group.
    pub group: BlockGroup,
    /// Block index within the group.
    pub block: usize,
    /// Layer type, e.g. `attn.to_q`.
    pub layer: String,
}

impl AdapterKey {
    /// Create a key.
    pub fn new(group: BlockGroup, block: usize, layer: impl Into<String>) -> Self {
        Self {
            group,
            block,
            layer: layer.into(),
        }
    }

    /// Tensor name of one factor, e.g. `single_transformer_blocks.3.proj_out.lora_A`.
    #[must_use]
    pub fn tensor_name(&self, factor: &str) -> String {
        format!("{self}.{factor}")
    }
}

impl fmt::Display for AdapterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.group, self.block, self.layer)
    }
}

/// Tensor-name suffix of the down projection.
pub const LORA_A: &str = "lora_A";
/// Tensor-name suffix of the up projection.
pub const LORA_B: &str = "lora_B";

/// Adapters indexed by sublayer.
///
/// The backend calls [`AdapterRegistry::apply`] at each adaptable sublayer;
/// an empty registry leaves the base model unchanged.
#[derive(Debug, Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<AdapterKey, LoraLinear>,
}

impl AdapterRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, returning the one it replaced.
    pub fn insert(&mut self, key: AdapterKey, adapter: LoraLinear) -> Option<LoraLinear> {
        self.adapters.insert(key, adapter)
    }

    /// Adapter at `key`.
    #[must_use]
    pub fn get(&self, key: &AdapterKey) -> Option<&LoraLinear> {
        self.adapters.get(key)
    }

    /// Adapter for a sublayer.
    #[must_use]
    pub fn find(&self, group: BlockGroup, block: usize, layer: &str) -> Option<&LoraLinear> {
        self.adapters.get(&AdapterKey::new(group, block, layer))
    }

    /// `base_out` plus the adapter delta for `x`, or `base_out` unchanged
    /// when the sublayer is not adapted.
    pub fn apply(
        &self,
        group: BlockGroup,
        block: usize,
        layer: &str,
        x: &Tensor,
        base_out: &Tensor,
    ) -> Result<Tensor> {
        match self.find(group, block, layer) {
            Some(adapter) => adapter.forward(x, base_out),
            None => Ok(base_out.clone()),
        }
    }

    /// Number of adapters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// True when nothing is adapted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Adapters in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&AdapterKey, &LoraLinear)> {
        self.adapters.iter()
    }

    /// Adapter keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &AdapterKey> {
        self.adapters.keys()
    }

    /// Total trainable parameters.
    #[must_use]
    pub fn param_count(&self) -> usize {
        self.adapters.values().map(LoraLinear::param_count).sum()
    }

    /// Trainable variables with their tensor names, in key order.
    #[must_use]
    pub fn named_vars(&self) -> Vec<(String, Var)> {
        self.adapters
            .iter()
            .flat_map(|(key, adapter)| {
                [
                    (key.tensor_name(LORA_A), adapter.lora_a().clone()),
                    (key.tensor_name(LORA_B), adapter.lora_b().clone()),
                ]
            })
            .collect()
    }

    /// Detached copies of every factor, keyed by tensor name.
    pub fn to_tensors(&self) -> Result<Vec<(String, Tensor)>> {
        self.named_vars()
            .into_iter()
            .map(|(name, var)| Ok((name, var.as_tensor().detach().copy()?)))
            .collect()
    }

    /// Expected tensor shapes keyed by tensor name.
    #[must_use]
    pub fn shapes(&self) -> BTreeMap<String, Vec<usize>> {
        self.named_vars()
            .into_iter()
            .map(|(name, var)| (name, var.dims().to_vec()))
            .collect()
    }

    /// Overwrite every adapter from `tensors`.
    ///
    /// Nothing is written unless every expected tensor is present with the
    /// expected shape and no unexpected tensor is present.
    pub fn load_tensors(&self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        let expected = self.shapes();

        for (name, shape) in &expected {
            let tensor = tensors.get(name).ok_or_else(|| {
                CheckpointFault::SpecMismatch(format!("adapter `{name}` not present in checkpoint"))
            })?;
            if tensor.dims() != shape.as_slice() {
                return Err(CheckpointFault::ShapeMismatch {
                    key: name.clone(),
                    expected: shape.clone(),
                    found: tensor.dims().to_vec(),
                }
                .into());
            }
        }
        if let Some(extra) = tensors.keys().find(|name| !expected.contains_key(*name)) {
            return Err(CheckpointFault::SpecMismatch(format!(
                "checkpoint holds adapter `{extra}` the active config does not select"
            ))
            .into());
        }

        for (key, adapter) in &self.adapters {
            adapter.set(
                &tensors[&key.tensor_name(LORA_A)],
                &tensors[&key.tensor_name(LORA_B)],
            )?;
        }
        Ok(())
    }

    /// Remove and return every adapter, restoring base-model behaviour.
    pub fn detach(&mut self) -> AdapterRegistry {
        std::mem::take(self)
    }

    /// Drop every adapter.
    pub fn clear(&mut self) {
        self.adapters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn registry() -> AdapterRegistry {
        let mut rng = StdRng::seed_from_u64(0);
        let mut registry = AdapterRegistry::new();
        for block in 0..2 {
            let adapter = LoraLinear::new(4, 4, 2, &mut rng, &Device::Cpu).unwrap();
            registry.insert(
                AdapterKey::new(BlockGroup::SingleTransformerBlocks, block, "proj_out"),
                adapter,
            );
        }
        registry
    }

    #[test]
    fn test_key_names() {
        let key = AdapterKey::new(BlockGroup::TransformerBlocks, 7, "attn.to_q");
        assert_eq!(key.to_string(), "transformer_blocks.7.attn.to_q");
        assert_eq!(key.tensor_name(LORA_B), "transformer_blocks.7.attn.to_q.lora_B");
    }

    #[test]
    fn test_apply_without_adapter_is_passthrough() {
        let registry = registry();
        let x = Tensor::ones((1, 4), DType::F32, &Device::Cpu).unwrap();
        let base = Tensor::full(2f32, (1, 4), &Device::Cpu).unwrap();
        let out = registry
            .apply(BlockGroup::TransformerBlocks, 0, "attn.to_q", &x, &base)
            .unwrap();
        assert_eq!(out.to_vec2::<f32>().unwrap(), base.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_named_vars_order_and_count() {
        let registry = registry();
        let names: Vec<String> = registry.named_vars().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec![
                "single_transformer_blocks.0.proj_out.lora_A",
                "single_transformer_blocks.0.proj_out.lora_B",
                "single_transformer_blocks.1.proj_out.lora_A",
                "single_transformer_blocks.1.proj_out.lora_B",
            ]
        );
        assert_eq!(registry.param_count(), 2 * 2 * (4 + 4));
    }

    #[test]
    fn test_load_tensors_round_trip() {
        let source = registry();
        let bump = Tensor::full(0.25f32, (2, 4), &Device::Cpu).unwrap();
        let key = AdapterKey::new(BlockGroup::SingleTransformerBlocks, 1, "proj_out");
        source.get(&key).unwrap().lora_b().set(&bump).unwrap();

        let tensors: HashMap<String, Tensor> = source.to_tensors().unwrap().into_iter().collect();
        let mut rng = StdRng::seed_from_u64(99);
        let mut target = AdapterRegistry::new();
        for block in 0..2 {
            target.insert(
                AdapterKey::new(BlockGroup::SingleTransformerBlocks, block, "proj_out"),
                LoraLinear::new(4, 4, 2, &mut rng, &Device::Cpu).unwrap(),
            );
        }
        target.load_tensors(&tensors).unwrap();

        let restored: Vec<f32> = target
            .get(&key)
            .unwrap()
            .lora_b()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(restored.iter().all(|v| *v == 0.25));
    }

    #[test]
    fn test_load_tensors_shape_mismatch() {
        let target = registry();
        let mut tensors: HashMap<String, Tensor> =
            target.to_tensors().unwrap().into_iter().collect();
        tensors.insert(
            "single_transformer_blocks.0.proj_out.lora_A".into(),
            Tensor::zeros((4, 3), DType::F32, &Device::Cpu).unwrap(),
        );
        let err = target.load_tensors(&tensors).unwrap_err();
        assert!(matches!(
            err,
            crate::DreamboothError::CorruptCheckpoint(CheckpointFault::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_load_tensors_missing_and_extra() {
        let target = registry();
        let all: HashMap<String, Tensor> = target.to_tensors().unwrap().into_iter().collect();

        let mut missing = all.clone();
        missing.remove("single_transformer_blocks.1.proj_out.lora_B");
        assert!(target.load_tensors(&missing).is_err());

        let mut extra = all;
        extra.insert(
            "transformer_blocks.0.attn.to_q.lora_A".into(),
            Tensor::zeros((4, 2), DType::F32, &Device::Cpu).unwrap(),
        );
        let err = target.load_tensors(&extra).unwrap_err();
        assert!(err.to_string().contains("transformer_blocks.0.attn.to_q.lora_A"));
    }

    #[test]
    fn test_detach_restores_base() {
        let mut registry = registry();
        let detached = registry.detach();
        assert!(registry.is_empty());
        assert_eq!(detached.len(), 2);
    }
}
