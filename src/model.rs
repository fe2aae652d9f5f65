//! Base-model collaborator: architecture catalog and backend trait.
//!
//! The engine never runs the diffusion transformer itself. It asks a
//! [`DiffusionBackend`] to encode examples, predict noise and render images,
//! handing it the [`AdapterRegistry`] its forward pass must consult. The
//! [`Architecture`] catalog tells the layer selector which sublayers exist and
//! what shape their adapters need.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use candle_core::{Device, Tensor};
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::error::{DreamboothError, Result};
use crate::lora::AdapterRegistry;

/// Hidden size of the Flux transformer.
pub const FLUX_HIDDEN_SIZE: usize = 3072;

/// A group of structurally identical transformer blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockGroup {
    /// Dual-stream (image + text) blocks.
    TransformerBlocks,
    /// Single-stream blocks.
    SingleTransformerBlocks,
}

impl BlockGroup {
    /// All groups in catalog order.
    pub const ALL: [BlockGroup; 2] = [
        BlockGroup::TransformerBlocks,
        BlockGroup::SingleTransformerBlocks,
    ];

    /// Config key of the group.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BlockGroup::TransformerBlocks => "transformer_blocks",
            BlockGroup::SingleTransformerBlocks => "single_transformer_blocks",
        }
    }
}

impl fmt::Display for BlockGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockGroup {
    type Err = DreamboothError;

    fn from_str(s: &str) -> Result<Self> {
        BlockGroup::ALL
            .into_iter()
            .find(|group| group.as_str() == s)
            .ok_or_else(|| {
                DreamboothError::Config(format!(
                    "lora_layers: unknown block group `{s}` \
                     (expected transformer_blocks or single_transformer_blocks)"
                ))
            })
    }
}

/// An adaptable linear sublayer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerShape {
    /// Layer type name as used in `layer_types`, e.g. `attn.to_q`.
    pub name: String,
    /// Input features.
    pub in_dim: usize,
    /// Output features.
    pub out_dim: usize,
}

impl LayerShape {
    /// Create a layer description.
    pub fn new(name: impl Into<String>, in_dim: usize, out_dim: usize) -> Self {
        Self {
            name: name.into(),
            in_dim,
            out_dim,
        }
    }
}

/// Layout of one block group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupLayout {
    /// Which group this describes.
    pub group: BlockGroup,
    /// Largest `end` a block range may name.
    pub block_limit: usize,
    /// Adaptable layers present in every block of the group.
    pub layers: Vec<LayerShape>,
}

/// Catalog of block groups and adaptable layers of a base model.
///
/// # Example
///
/// ```rust
/// use dreambooth_rs::model::{Architecture, BlockGroup};
///
/// let flux = Architecture::flux();
/// let single = flux.group(BlockGroup::SingleTransformerBlocks).unwrap();
/// assert_eq!(single.block_limit, 38);
/// assert!(flux.layer(BlockGroup::SingleTransformerBlocks, "proj_out").is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Architecture {
    name: String,
    groups: Vec<GroupLayout>,
}

impl Architecture {
    /// Build a catalog from explicit group layouts.
    pub fn new(name: impl Into<String>, groups: Vec<GroupLayout>) -> Self {
        Self {
            name: name.into(),
            groups,
        }
    }

    /// The Flux.1 transformer (dev and schnell share it).
    #[must_use]
    pub fn flux() -> Self {
        let h = FLUX_HIDDEN_SIZE;
        let square = |name: &str| LayerShape::new(name, h, h);

        let dual = GroupLayout {
            group: BlockGroup::TransformerBlocks,
            block_limit: 19,
            layers: vec![
                square("attn.to_q"),
                square("attn.to_k"),
                square("attn.to_v"),
                square("attn.add_q_proj"),
                square("attn.add_k_proj"),
                square("attn.add_v_proj"),
                square("attn.to_out"),
                square("attn.to_add_out"),
                LayerShape::new("ff.linear1", h, 4 * h),
                LayerShape::new("ff.linear2", 4 * h, h),
                LayerShape::new("ff_context.linear1", h, 4 * h),
                LayerShape::new("ff_context.linear2", 4 * h, h),
                LayerShape::new("norm1.linear", h, 6 * h),
                LayerShape::new("norm1_context.linear", h, 6 * h),
            ],
        };

        let single = GroupLayout {
            group: BlockGroup::SingleTransformerBlocks,
            block_limit: 38,
            layers: vec![
                square("attn.to_q"),
                square("attn.to_k"),
                square("attn.to_v"),
                LayerShape::new("proj_mlp", h, 4 * h),
                LayerShape::new("proj_out", 5 * h, h),
                LayerShape::new("norm.linear", h, 3 * h),
            ],
        };

        Self::new("flux", vec![dual, single])
    }

    /// Catalog name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All group layouts.
    #[must_use]
    pub fn groups(&self) -> &[GroupLayout] {
        &self.groups
    }

    /// Layout of a group, if the model has it.
    #[must_use]
    pub fn group(&self, group: BlockGroup) -> Option<&GroupLayout> {
        self.groups.iter().find(|layout| layout.group == group)
    }

    /// Shape of a named layer in a group.
    #[must_use]
    pub fn layer(&self, group: BlockGroup, name: &str) -> Option<&LayerShape> {
        self.group(group)?
            .layers
            .iter()
            .find(|layer| layer.name == name)
    }

    /// Layer type names available in a group.
    #[must_use]
    pub fn layer_names(&self, group: BlockGroup) -> Vec<&str> {
        self.group(group)
            .map(|layout| layout.layers.iter().map(|l| l.name.as_str()).collect())
            .unwrap_or_default()
    }
}

/// Encoded prompt, opaque to the engine.
#[derive(Debug, Clone)]
pub struct Conditioning {
    /// Per-token prompt embeddings.
    pub prompt_embeds: Tensor,
    /// Pooled prompt embedding.
    pub pooled_prompt_embeds: Tensor,
}

/// An example after encoding by the backend.
#[derive(Debug, Clone)]
pub struct EncodedExample {
    /// Clean image latents (`l_T`).
    pub clean_latents: Tensor,
    /// Prompt conditioning.
    pub conditioning: Conditioning,
}

/// The diffusion model the engine trains adapters for.
///
/// Implementations own the frozen base weights, the encoders and the
/// decoder. Their forward pass must add `adapters.apply(..)` at every
/// adaptable sublayer so that gradients reach the adapter variables.
pub trait DiffusionBackend {
    /// Block groups and adaptable layers of the model.
    fn architecture(&self) -> &Architecture;

    /// Device the model lives on.
    fn device(&self) -> &Device;

    /// Encode an image/prompt pair into clean latents and conditioning.
    ///
    /// # Errors
    ///
    /// Returns an error when the image cannot be read or encoded.
    fn encode_example(&self, image: &Path, prompt: &str) -> Result<EncodedExample>;

    /// Predict the noise direction for `latents` at schedule step `t`.
    ///
    /// # Errors
    ///
    /// Returns an error on any backend failure; training treats it as fatal.
    fn predict_noise(
        &self,
        latents: &Tensor,
        t: usize,
        sigma: f64,
        conditioning: &Conditioning,
        adapters: &AdapterRegistry,
    ) -> Result<Tensor>;

    /// Render an image for `prompt` with the current adapters.
    ///
    /// # Errors
    ///
    /// Returns an error when generation fails.
    fn generate_image(&self, prompt: &str, seed: u64, adapters: &AdapterRegistry)
        -> Result<RgbImage>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flux_block_limits() {
        let flux = Architecture::flux();
        assert_eq!(
            flux.group(BlockGroup::TransformerBlocks).unwrap().block_limit,
            19
        );
        assert_eq!(
            flux.group(BlockGroup::SingleTransformerBlocks)
                .unwrap()
                .block_limit,
            38
        );
    }

    #[test]
    fn test_flux_layer_shapes() {
        let flux = Architecture::flux();
        let proj_out = flux
            .layer(BlockGroup::SingleTransformerBlocks, "proj_out")
            .unwrap();
        assert_eq!((proj_out.in_dim, proj_out.out_dim), (15360, 3072));

        let ff = flux.layer(BlockGroup::TransformerBlocks, "ff.linear1").unwrap();
        assert_eq!((ff.in_dim, ff.out_dim), (3072, 12288));

        assert!(flux.layer(BlockGroup::SingleTransformerBlocks, "ff.linear1").is_none());
    }

    #[test]
    fn test_block_group_parse() {
        assert_eq!(
            "single_transformer_blocks".parse::<BlockGroup>().unwrap(),
            BlockGroup::SingleTransformerBlocks
        );
        let err = "middle_blocks".parse::<BlockGroup>().unwrap_err();
        assert!(err.to_string().contains("middle_blocks"));
    }

    #[test]
    fn test_layer_names() {
        let flux = Architecture::flux();
        let names = flux.layer_names(BlockGroup::SingleTransformerBlocks);
        assert_eq!(names.len(), 6);
        assert!(names.contains(&"attn.to_v"));
    }
}
