//! Maps `lora_layers` specs onto concrete sublayers of an architecture.

use std::collections::BTreeSet;

use candle_core::Device;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::config::LoraLayerSpec;
use crate::error::{DreamboothError, Result};
use crate::lora::{AdapterKey, AdapterRegistry, LoraLinear};
use crate::model::{Architecture, BlockGroup};

/// One adapter the selector will create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedAdapter {
    /// Target sublayer.
    pub key: AdapterKey,
    /// Input features of the sublayer.
    pub in_dim: usize,
    /// Output features of the sublayer.
    pub out_dim: usize,
    /// Adapter rank.
    pub rank: usize,
}

/// Resolves layer-selection specs against an [`Architecture`].
///
/// # Example
///
/// ```rust
/// use candle_core::Device;
/// use dreambooth_rs::config::{BlockRange, LoraLayerSpec};
/// use dreambooth_rs::lora::LoraLayerSelector;
/// use dreambooth_rs::model::{Architecture, BlockGroup};
///
/// let flux = Architecture::flux();
/// let spec = LoraLayerSpec {
///     group: BlockGroup::TransformerBlocks,
///     block_range: BlockRange::span(0, 1),
///     layer_types: vec!["attn.to_q".into(), "attn.to_v".into()],
///     lora_rank: 2,
/// };
/// let registry = LoraLayerSelector::new(&flux).select(&[spec], 42, &Device::Cpu).unwrap();
/// assert_eq!(registry.len(), 4);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct LoraLayerSelector<'a> {
    architecture: &'a Architecture,
}

impl<'a> LoraLayerSelector<'a> {
    /// Selector over `architecture`.
    #[must_use]
    pub fn new(architecture: &'a Architecture) -> Self {
        Self { architecture }
    }

    /// Every reason the specs cannot be applied to this architecture.
    #[must_use]
    pub fn problems(&self, specs: &[LoraLayerSpec]) -> Vec<String> {
        let mut problems = Vec::new();
        let mut seen: BTreeSet<BlockGroup> = BTreeSet::new();

        for spec in specs {
            let field = format!("lora_layers.{}", spec.group);
            if !seen.insert(spec.group) {
                problems.push(format!("{field} is configured more than once"));
                continue;
            }
            let Some(layout) = self.architecture.group(spec.group) else {
                problems.push(format!(
                    "{field}: block group not present in the {} architecture",
                    self.architecture.name()
                ));
                continue;
            };

            if let Some(last) = spec.block_range.last() {
                if last > layout.block_limit {
                    problems.push(format!(
                        "{field}.block_range: block {last} exceeds the limit of {}",
                        layout.block_limit
                    ));
                }
            }

            for layer in &spec.layer_types {
                if self.architecture.layer(spec.group, layer).is_none() {
                    problems.push(format!(
                        "{field}.layer_types: unknown layer type `{layer}` (available: {})",
                        self.architecture.layer_names(spec.group).join(", ")
                    ));
                }
            }
        }

        problems
    }

    /// Fail with a configuration error listing every problem.
    pub fn validate(&self, specs: &[LoraLayerSpec]) -> Result<()> {
        let problems = self.problems(specs);
        if problems.is_empty() {
            Ok(())
        } else {
            Err(DreamboothError::Config(problems.join("; ")))
        }
    }

    /// The adapters `specs` select, in group, block, layer-type order.
    pub fn plan(&self, specs: &[LoraLayerSpec]) -> Result<Vec<PlannedAdapter>> {
        self.validate(specs)?;

        let mut planned = Vec::new();
        let mut seen: BTreeSet<AdapterKey> = BTreeSet::new();
        for spec in specs {
            for block in spec.block_range.indices() {
                for layer in &spec.layer_types {
                    let key = AdapterKey::new(spec.group, block, layer.as_str());
                    if !seen.insert(key.clone()) {
                        continue;
                    }
                    let shape = self.architecture.layer(spec.group, layer).ok_or_else(|| {
                        DreamboothError::Config(format!(
                            "lora_layers.{}.layer_types: unknown layer type `{layer}`",
                            spec.group
                        ))
                    })?;
                    planned.push(PlannedAdapter {
                        key,
                        in_dim: shape.in_dim,
                        out_dim: shape.out_dim,
                        rank: spec.lora_rank,
                    });
                }
            }
        }
        Ok(planned)
    }

    /// Instantiate fresh adapters for `specs`, initialized from `seed`.
    pub fn select(
        &self,
        specs: &[LoraLayerSpec],
        seed: u64,
        device: &Device,
    ) -> Result<AdapterRegistry> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut registry = AdapterRegistry::new();
        for planned in self.plan(specs)? {
            let adapter = LoraLinear::new(
                planned.in_dim,
                planned.out_dim,
                planned.rank,
                &mut rng,
                device,
            )?;
            registry.insert(planned.key, adapter);
        }
        debug!(
            adapters = registry.len(),
            params = registry.param_count(),
            "selected LoRA layers"
        );
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BlockRange;

    fn single_spec(start: usize, end: usize, layers: &[&str], rank: usize) -> LoraLayerSpec {
        LoraLayerSpec {
            group: BlockGroup::SingleTransformerBlocks,
            block_range: BlockRange::span(start, end),
            layer_types: layers.iter().map(|s| (*s).to_string()).collect(),
            lora_rank: rank,
        }
    }

    const FIVE: [&str; 5] = ["proj_out", "proj_mlp", "attn.to_q", "attn.to_k", "attn.to_v"];

    #[test]
    fn test_full_single_range_plans_195() {
        let flux = Architecture::flux();
        let plan = LoraLayerSelector::new(&flux)
            .plan(&[single_spec(0, 38, &FIVE, 4)])
            .unwrap();
        assert_eq!(plan.len(), 39 * 5);
    }

    #[test]
    fn test_partial_range_plans_29_per_type() {
        let flux = Architecture::flux();
        for n in 1..=5 {
            let plan = LoraLayerSelector::new(&flux)
                .plan(&[single_spec(10, 38, &FIVE[..n], 4)])
                .unwrap();
            assert_eq!(plan.len(), 29 * n);
        }
    }

    #[test]
    fn test_plan_shapes_follow_catalog() {
        let flux = Architecture::flux();
        let plan = LoraLayerSelector::new(&flux)
            .plan(&[single_spec(3, 3, &["proj_out", "proj_mlp"], 8)])
            .unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!((plan[0].in_dim, plan[0].out_dim, plan[0].rank), (15360, 3072, 8));
        assert_eq!((plan[1].in_dim, plan[1].out_dim), (3072, 12288));
    }

    #[test]
    fn test_unknown_layer_type_names_field() {
        let flux = Architecture::flux();
        let err = LoraLayerSelector::new(&flux)
            .validate(&[single_spec(0, 3, &["proj_out", "attn.to_qq"], 4)])
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("lora_layers.single_transformer_blocks.layer_types"));
        assert!(msg.contains("attn.to_qq"));
    }

    #[test]
    fn test_block_beyond_limit_rejected() {
        let flux = Architecture::flux();
        let err = LoraLayerSelector::new(&flux)
            .validate(&[LoraLayerSpec {
                group: BlockGroup::TransformerBlocks,
                block_range: BlockRange::span(0, 20),
                layer_types: vec!["attn.to_q".into()],
                lora_rank: 4,
            }])
            .unwrap_err();
        assert!(err.to_string().contains("lora_layers.transformer_blocks.block_range"));
    }

    #[test]
    fn test_duplicate_group_rejected() {
        let flux = Architecture::flux();
        let spec = single_spec(0, 1, &["proj_out"], 4);
        let problems = LoraLayerSelector::new(&flux).problems(&[spec.clone(), spec]);
        assert_eq!(problems.len(), 1);
    }

    #[test]
    fn test_duplicate_layer_types_collapse() {
        let flux = Architecture::flux();
        let plan = LoraLayerSelector::new(&flux)
            .plan(&[single_spec(0, 1, &["proj_out", "proj_out"], 4)])
            .unwrap();
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn test_select_is_idempotent_in_shapes_and_seeded() {
        let flux = Architecture::flux();
        let selector = LoraLayerSelector::new(&flux);
        let specs = [single_spec(0, 2, &["attn.to_q", "attn.to_k"], 2)];
        let first = selector.select(&specs, 11, &Device::Cpu).unwrap();
        let second = selector.select(&specs, 11, &Device::Cpu).unwrap();
        assert_eq!(first.shapes(), second.shapes());

        let key = AdapterKey::new(BlockGroup::SingleTransformerBlocks, 2, "attn.to_k");
        let init = |registry: &AdapterRegistry| -> Vec<f32> {
            let adapter = registry.get(&key).unwrap();
            adapter.lora_a().flatten_all().unwrap().to_vec1().unwrap()
        };
        assert_eq!(init(&first), init(&second));
    }

    #[test]
    fn test_explicit_indices() {
        let flux = Architecture::flux();
        let spec = LoraLayerSpec {
            group: BlockGroup::SingleTransformerBlocks,
            block_range: BlockRange::Indices {
                indices: vec![0, 7, 38],
            },
            layer_types: vec!["proj_out".into()],
            lora_rank: 1,
        };
        let plan = LoraLayerSelector::new(&flux).plan(&[spec]).unwrap();
        let blocks: Vec<usize> = plan.iter().map(|p| p.key.block).collect();
        assert_eq!(blocks, vec![0, 7, 38]);
    }
}
