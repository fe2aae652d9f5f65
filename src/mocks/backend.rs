//! Mock diffusion backend
//!
//! A tiny residual stack of frozen 8×8 linear layers laid out like the Flux
//! block groups. It is small enough to train on the CPU in tests while still
//! routing every adaptable sublayer through [`AdapterRegistry::apply`].

use std::cell::Cell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use image::{Rgb, RgbImage};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::{
    BlockRange, ConfigTemplate, InstrumentationConfig, LoraLayerSpec, LoraLayers, ModelVariant,
    SaveConfig, TrainingConfig, TrainingLoopConfig,
};
use crate::error::{DreamboothError, Result};
use crate::lora::AdapterRegistry;
use crate::model::{
    Architecture, BlockGroup, Conditioning, DiffusionBackend, EncodedExample, GroupLayout,
    LayerShape,
};

/// Hidden size of the mock transformer
pub const MOCK_HIDDEN: usize = 8;
/// Latent tokens per example
pub const MOCK_TOKENS: usize = 4;

const RESIDUAL_SCALE: f64 = 0.05;
const IMAGE_SIZE: u32 = 16;

/// Mock backend
pub struct MockBackend {
    architecture: Architecture,
    device: Device,
    weights: BTreeMap<(BlockGroup, String), Tensor>,
    fail_generation: bool,
    predictions: Cell<usize>,
    generations: Cell<usize>,
}

impl MockBackend {
    /// Create a mock backend with base weights drawn from `seed`
    ///
    /// # Errors
    ///
    /// Returns an error if the weights cannot be allocated.
    pub fn new(seed: u64) -> Result<Self> {
        let architecture = Self::architecture();
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(seed);
        let bound = 1.0 / (MOCK_HIDDEN as f32).sqrt();
        let dist = Uniform::new_inclusive(-bound, bound);

        let mut weights = BTreeMap::new();
        for layout in architecture.groups() {
            for layer in &layout.layers {
                let values: Vec<f32> = (0..layer.in_dim * layer.out_dim)
                    .map(|_| dist.sample(&mut rng))
                    .collect();
                let w = Tensor::from_vec(values, (layer.in_dim, layer.out_dim), &device)?;
                weights.insert((layout.group, layer.name.clone()), w);
            }
        }

        Ok(Self {
            architecture,
            device,
            weights,
            fail_generation: false,
            predictions: Cell::new(0),
            generations: Cell::new(0),
        })
    }

    /// Block layout of the mock transformer: 2 dual blocks and 4 single blocks
    #[must_use]
    pub fn architecture() -> Architecture {
        let layer = |name: &str| LayerShape::new(name, MOCK_HIDDEN, MOCK_HIDDEN);
        Architecture::new(
            "mock",
            vec![
                GroupLayout {
                    group: BlockGroup::TransformerBlocks,
                    block_limit: 1,
                    layers: ["attn.to_q", "attn.to_k", "attn.to_v", "attn.to_out"]
                        .into_iter()
                        .map(layer)
                        .collect(),
                },
                GroupLayout {
                    group: BlockGroup::SingleTransformerBlocks,
                    block_limit: 3,
                    layers: ["attn.to_q", "attn.to_k", "attn.to_v", "proj_mlp", "proj_out"]
                        .into_iter()
                        .map(layer)
                        .collect(),
                },
            ],
        )
    }

    /// Make every `generate_image` call fail
    #[must_use]
    pub fn with_failing_generation(mut self) -> Self {
        self.fail_generation = true;
        self
    }

    /// Number of `predict_noise` calls so far
    #[must_use]
    pub fn prediction_count(&self) -> usize {
        self.predictions.get()
    }

    /// Number of `generate_image` calls so far
    #[must_use]
    pub fn generation_count(&self) -> usize {
        self.generations.get()
    }

    fn forward(
        &self,
        latents: &Tensor,
        conditioning: &Conditioning,
        adapters: &AdapterRegistry,
    ) -> Result<Tensor> {
        let mut h = latents.broadcast_add(&conditioning.prompt_embeds)?;
        for layout in self.architecture.groups() {
            for block in 0..=layout.block_limit {
                for layer in &layout.layers {
                    let w = self
                        .weights
                        .get(&(layout.group, layer.name.clone()))
                        .ok_or_else(|| {
                            DreamboothError::Backend(format!("no weight for {}", layer.name))
                        })?;
                    let base = h.broadcast_matmul(w)?;
                    let out = adapters.apply(layout.group, block, &layer.name, &h, &base)?;
                    h = h.add(&out.affine(RESIDUAL_SCALE, 0.0)?)?;
                }
            }
        }
        Ok(h)
    }
}

impl DiffusionBackend for MockBackend {
    fn architecture(&self) -> &Architecture {
        &self.architecture
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn encode_example(&self, image: &Path, prompt: &str) -> Result<EncodedExample> {
        let pixels = image::open(image)?.to_rgb8().into_raw();
        if pixels.is_empty() {
            return Err(DreamboothError::Dataset(format!(
                "{} has no pixels",
                image.display()
            )));
        }
        let latent: Vec<f32> = (0..MOCK_TOKENS * MOCK_HIDDEN)
            .map(|i| f32::from(pixels[(i * 7) % pixels.len()]) / 127.5 - 1.0)
            .collect();

        let mut embed = vec![0f32; MOCK_HIDDEN];
        for (i, byte) in prompt.bytes().enumerate() {
            embed[i % MOCK_HIDDEN] += f32::from(byte) / 255.0;
        }
        let norm = prompt.len().max(1) as f32;
        embed.iter_mut().for_each(|v| *v /= norm);
        let pooled = embed.iter().sum::<f32>() / MOCK_HIDDEN as f32;

        Ok(EncodedExample {
            clean_latents: Tensor::from_vec(latent, (1, MOCK_TOKENS, MOCK_HIDDEN), &self.device)?,
            conditioning: Conditioning {
                prompt_embeds: Tensor::from_vec(embed, (1, 1, MOCK_HIDDEN), &self.device)?,
                pooled_prompt_embeds: Tensor::from_vec(vec![pooled], (1, 1), &self.device)?,
            },
        })
    }

    fn predict_noise(
        &self,
        latents: &Tensor,
        _t: usize,
        sigma: f64,
        conditioning: &Conditioning,
        adapters: &AdapterRegistry,
    ) -> Result<Tensor> {
        self.predictions.set(self.predictions.get() + 1);
        let h = self.forward(latents, conditioning, adapters)?;
        Ok(h.affine(1.0 + sigma, 0.0)?)
    }

    fn generate_image(
        &self,
        prompt: &str,
        seed: u64,
        adapters: &AdapterRegistry,
    ) -> Result<RgbImage> {
        self.generations.set(self.generations.get() + 1);
        if self.fail_generation {
            return Err(DreamboothError::Backend("mock generation failure".to_string()));
        }

        let mut magnitude = 0f32;
        for (_, adapter) in adapters.iter() {
            magnitude += adapter
                .lora_b()
                .as_tensor()
                .abs()?
                .sum_all()?
                .to_dtype(DType::F32)?
                .to_scalar::<f32>()?;
        }
        let shade = (magnitude * 1000.0).clamp(0.0, 255.0) as u8;
        let tint = (prompt.len() as u64 ^ seed) as u8;
        Ok(RgbImage::from_fn(IMAGE_SIZE, IMAGE_SIZE, |x, y| {
            Rgb([shade, tint, ((x + y) * 8) as u8])
        }))
    }
}

/// Write a small solid PNG usable as a training image
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_test_image(path: &Path, shade: u8) -> Result<()> {
    RgbImage::from_fn(8, 8, |x, y| Rgb([shade, (x * 30) as u8, (y * 30) as u8])).save(path)?;
    Ok(())
}

/// A small run over `image_count` generated images under `root/images`
///
/// Adapters target both mock block groups; artifacts go to `root/output`.
/// Checkpoints and validation images are effectively disabled until the
/// caller lowers their frequencies.
///
/// # Errors
///
/// Returns an error if the images cannot be written.
pub fn mock_config(root: &Path, image_count: usize) -> Result<TrainingConfig> {
    let images_dir = root.join("images");
    std::fs::create_dir_all(&images_dir)?;
    let mut names = Vec::with_capacity(image_count);
    for i in 0..image_count {
        let name = PathBuf::from(format!("{i:02}.png"));
        write_test_image(&images_dir.join(&name), (i * 37 % 256) as u8)?;
        names.push(name);
    }

    let mut config = TrainingConfig::from_template(ConfigTemplate::Pet, "dog", images_dir, names);
    config.model = ModelVariant::Schnell;
    config.steps = 10;
    config.width = 256;
    config.height = 256;
    config.quantize = None;
    config.training_loop = TrainingLoopConfig {
        num_epochs: 1,
        batch_size: 1,
    };
    config.optimizer.learning_rate = 1e-3;
    config.save = SaveConfig {
        output_path: root.join("output"),
        checkpoint_frequency: 1000,
        keep_last_n: None,
    };
    config.instrumentation = InstrumentationConfig {
        plot_frequency: 1,
        generate_image_frequency: 1000,
        validation_prompt: Some("photo of sks dog".to_string()),
    };
    config.lora_layers = LoraLayers::new(vec![
        LoraLayerSpec {
            group: BlockGroup::TransformerBlocks,
            block_range: BlockRange::span(0, 1),
            layer_types: vec!["attn.to_v".into()],
            lora_rank: 2,
        },
        LoraLayerSpec {
            group: BlockGroup::SingleTransformerBlocks,
            block_range: BlockRange::span(0, 3),
            layer_types: vec!["proj_out".into(), "attn.to_q".into()],
            lora_rank: 2,
        },
    ]);
    Ok(config)
}
