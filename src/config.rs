//! Configuration parsing and validation.
//!
//! A training run is described by a single JSON document:
//!
//! ```json
//! {
//!   "model": "dev",
//!   "seed": 42,
//!   "steps": 20,
//!   "guidance": 3.0,
//!   "quantize": 4,
//!   "width": 512,
//!   "height": 512,
//!   "training_loop": { "num_epochs": 100, "batch_size": 1 },
//!   "optimizer": { "name": "AdamW", "learning_rate": 1e-4 },
//!   "save": { "output_path": "./outputs/dog", "checkpoint_frequency": 10 },
//!   "instrumentation": {
//!     "plot_frequency": 1,
//!     "generate_image_frequency": 20,
//!     "validation_prompt": "photo of sks dog"
//!   },
//!   "lora_layers": {
//!     "single_transformer_blocks": {
//!       "block_range": { "start": 0, "end": 38 },
//!       "layer_types": ["proj_out", "proj_mlp", "attn.to_q", "attn.to_k", "attn.to_v"],
//!       "lora_rank": 4
//!     }
//!   },
//!   "examples": {
//!     "path": "images/",
//!     "images": [{ "image": "01.jpg", "prompt": "photo of sks dog" }]
//!   }
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DreamboothError, Result};
use crate::lora::LoraLayerSelector;
use crate::model::{Architecture, BlockGroup};

/// Quantization bit widths the base model can be loaded with.
pub const SUPPORTED_QUANTIZE: [u8; 5] = [3, 4, 5, 6, 8];

/// Tokens commonly used as the trigger word in training prompts.
pub const TRIGGER_WORDS: [&str; 3] = ["sks", "xyz", "tkn"];

/// Complete description of a fine-tuning run.
///
/// # Example
///
/// ```rust
/// use dreambooth_rs::TrainingConfig;
///
/// # fn main() -> dreambooth_rs::Result<()> {
/// let config = TrainingConfig::from_preset("pet")?;
/// config.validate()?;
/// assert_eq!(config.training_loop.num_epochs, 100);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Base model variant.
    pub model: ModelVariant,

    /// Random seed for adapter init, shuffling and noise sampling.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Number of inference steps `T` of the noise schedule.
    #[serde(default = "default_steps")]
    pub steps: usize,

    /// Guidance scale passed to the backend.
    #[serde(default = "default_guidance")]
    pub guidance: f64,

    /// Optional quantization bit width of the base weights.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantize: Option<u8>,

    /// Output width in pixels.
    #[serde(default = "default_resolution")]
    pub width: u32,

    /// Output height in pixels.
    #[serde(default = "default_resolution")]
    pub height: u32,

    /// Epoch and batch settings.
    pub training_loop: TrainingLoopConfig,

    /// Optimizer settings.
    pub optimizer: OptimizerSettings,

    /// Checkpoint settings.
    pub save: SaveConfig,

    /// Loss plot and validation image settings.
    #[serde(default)]
    pub instrumentation: InstrumentationConfig,

    /// Which sublayers receive adapters.
    pub lora_layers: LoraLayers,

    /// Training examples.
    pub examples: ExamplesConfig,

    /// Directory the config was loaded from; relative example paths resolve against it.
    #[serde(skip)]
    base_dir: PathBuf,
}

fn default_seed() -> u64 {
    42
}
fn default_steps() -> usize {
    20
}
fn default_guidance() -> f64 {
    3.0
}
fn default_resolution() -> u32 {
    512
}

/// Base model variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelVariant {
    /// Guidance-distilled model; uses the resolution-shifted schedule.
    #[default]
    Dev,
    /// Timestep-distilled model; uses the linear schedule.
    Schnell,
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelVariant::Dev => f.write_str("dev"),
            ModelVariant::Schnell => f.write_str("schnell"),
        }
    }
}

/// Epoch and batch settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingLoopConfig {
    /// Passes over the example set.
    #[serde(default = "default_epochs")]
    pub num_epochs: usize,

    /// Examples per optimizer step.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_epochs() -> usize {
    100
}
fn default_batch_size() -> usize {
    1
}

impl Default for TrainingLoopConfig {
    fn default() -> Self {
        Self {
            num_epochs: default_epochs(),
            batch_size: default_batch_size(),
        }
    }
}

/// Optimizer algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    /// Adam with decoupled weight decay.
    #[default]
    AdamW,
    /// Plain Adam.
    Adam,
}

/// Optimizer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSettings {
    /// Algorithm.
    #[serde(default)]
    pub name: OptimizerKind,

    /// Constant learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,
}

fn default_lr() -> f64 {
    1e-4
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            name: OptimizerKind::AdamW,
            learning_rate: default_lr(),
        }
    }
}

/// Checkpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveConfig {
    /// Root directory of all run artifacts.
    pub output_path: PathBuf,

    /// Save a checkpoint every N global steps.
    #[serde(default = "default_checkpoint_frequency")]
    pub checkpoint_frequency: usize,

    /// Keep only the newest N checkpoint archives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_last_n: Option<usize>,
}

fn default_checkpoint_frequency() -> usize {
    10
}

/// Loss plot and validation image settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentationConfig {
    /// Record the loss and redraw the plot every N steps.
    #[serde(default = "default_plot_frequency")]
    pub plot_frequency: usize,

    /// Render a validation image every N steps.
    #[serde(default = "default_image_frequency")]
    pub generate_image_frequency: usize,

    /// Prompt for validation images; the first example's prompt when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_prompt: Option<String>,
}

fn default_plot_frequency() -> usize {
    1
}
fn default_image_frequency() -> usize {
    20
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        Self {
            plot_frequency: default_plot_frequency(),
            generate_image_frequency: default_image_frequency(),
            validation_prompt: None,
        }
    }
}

/// Blocks of a group that receive adapters.
///
/// Either an inclusive span or an explicit list:
/// `{"start": 0, "end": 38}` or `{"indices": [0, 5, 9]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BlockRange {
    /// Inclusive span `start..=end`.
    Span {
        /// First block.
        start: usize,
        /// Last block (inclusive).
        end: usize,
    },
    /// Explicit block indices.
    Indices {
        /// Block indices.
        indices: Vec<usize>,
    },
}

impl BlockRange {
    /// Inclusive span.
    #[must_use]
    pub fn span(start: usize, end: usize) -> Self {
        BlockRange::Span { start, end }
    }

    /// Block indices in ascending order, without duplicates.
    #[must_use]
    pub fn indices(&self) -> Vec<usize> {
        match self {
            BlockRange::Span { start, end } => (*start..=*end).collect(),
            BlockRange::Indices { indices } => {
                let unique: BTreeSet<usize> = indices.iter().copied().collect();
                unique.into_iter().collect()
            }
        }
    }

    /// Highest block index named by the range.
    #[must_use]
    pub fn last(&self) -> Option<usize> {
        match self {
            BlockRange::Span { end, .. } => Some(*end),
            BlockRange::Indices { indices } => indices.iter().copied().max(),
        }
    }

    fn problems(&self, field: &str) -> Vec<String> {
        match self {
            BlockRange::Span { start, end } if start > end => vec![format!(
                "{field}.block_range: start ({start}) must not exceed end ({end})"
            )],
            BlockRange::Indices { indices } if indices.is_empty() => {
                vec![format!("{field}.block_range.indices must not be empty")]
            }
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockRange::Span { start, end } => write!(f, "{start}..={end}"),
            BlockRange::Indices { indices } => write!(f, "{indices:?}"),
        }
    }
}

/// Adapter placement for one block group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoraLayerSpec {
    /// Target block group.
    pub group: BlockGroup,
    /// Blocks of the group to adapt.
    pub block_range: BlockRange,
    /// Layer types adapted in every selected block.
    pub layer_types: Vec<String>,
    /// Adapter rank.
    pub lora_rank: usize,
}

impl LoraLayerSpec {
    /// Describe how `other` differs from this spec, if it does.
    ///
    /// Layer type order and explicit-index order are not significant.
    #[must_use]
    pub fn difference(&self, other: &LoraLayerSpec) -> Option<String> {
        let group = self.group;
        if self.block_range.indices() != other.block_range.indices() {
            return Some(format!(
                "{group}: block range {} vs {}",
                self.block_range, other.block_range
            ));
        }
        let ours: BTreeSet<&str> = self.layer_types.iter().map(String::as_str).collect();
        let theirs: BTreeSet<&str> = other.layer_types.iter().map(String::as_str).collect();
        if ours != theirs {
            return Some(format!("{group}: layer types {ours:?} vs {theirs:?}"));
        }
        if self.lora_rank != other.lora_rank {
            return Some(format!(
                "{group}: rank {} vs {}",
                self.lora_rank, other.lora_rank
            ));
        }
        None
    }
}

/// On-disk shape of one `lora_layers` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoraGroupSettings {
    block_range: BlockRange,
    layer_types: Vec<String>,
    #[serde(default = "default_lora_rank")]
    lora_rank: usize,
}

fn default_lora_rank() -> usize {
    4
}

/// The `lora_layers` object, parsed into specs ordered by block group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, LoraGroupSettings>",
    into = "BTreeMap<String, LoraGroupSettings>"
)]
pub struct LoraLayers(Vec<LoraLayerSpec>);

impl LoraLayers {
    /// Build from specs; they are kept sorted by group.
    #[must_use]
    pub fn new(mut specs: Vec<LoraLayerSpec>) -> Self {
        specs.sort_by_key(|spec| spec.group);
        Self(specs)
    }

    /// Specs in group order.
    #[must_use]
    pub fn specs(&self) -> &[LoraLayerSpec] {
        &self.0
    }

    /// Spec for a group.
    #[must_use]
    pub fn get(&self, group: BlockGroup) -> Option<&LoraLayerSpec> {
        self.0.iter().find(|spec| spec.group == group)
    }

    /// Number of configured groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no group is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Largest configured rank.
    #[must_use]
    pub fn max_rank(&self) -> usize {
        self.0.iter().map(|spec| spec.lora_rank).max().unwrap_or(0)
    }

    /// Describe the first difference to `other`, if any.
    #[must_use]
    pub fn difference(&self, other: &LoraLayers) -> Option<String> {
        for group in BlockGroup::ALL {
            match (self.get(group), other.get(group)) {
                (Some(ours), Some(theirs)) => {
                    if let Some(diff) = ours.difference(theirs) {
                        return Some(diff);
                    }
                }
                (Some(_), None) => return Some(format!("{group}: configured only on one side")),
                (None, Some(_)) => return Some(format!("{group}: configured only on one side")),
                (None, None) => {}
            }
        }
        None
    }
}

impl TryFrom<BTreeMap<String, LoraGroupSettings>> for LoraLayers {
    type Error = String;

    fn try_from(map: BTreeMap<String, LoraGroupSettings>) -> std::result::Result<Self, String> {
        let mut specs = Vec::with_capacity(map.len());
        for (key, settings) in map {
            let group = BlockGroup::from_str(&key).map_err(|e| e.to_string())?;
            specs.push(LoraLayerSpec {
                group,
                block_range: settings.block_range,
                layer_types: settings.layer_types,
                lora_rank: settings.lora_rank,
            });
        }
        Ok(Self::new(specs))
    }
}

impl From<LoraLayers> for BTreeMap<String, LoraGroupSettings> {
    fn from(layers: LoraLayers) -> Self {
        layers
            .0
            .into_iter()
            .map(|spec| {
                (
                    spec.group.as_str().to_string(),
                    LoraGroupSettings {
                        block_range: spec.block_range,
                        layer_types: spec.layer_types,
                        lora_rank: spec.lora_rank,
                    },
                )
            })
            .collect()
    }
}

/// One training image and its prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleImage {
    /// Image file, relative to `examples.path`.
    pub image: PathBuf,
    /// Training prompt, normally containing the trigger word.
    pub prompt: String,
}

/// Training examples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExamplesConfig {
    /// Directory holding the images, relative to the config file.
    pub path: PathBuf,
    /// Image/prompt pairs in training order.
    pub images: Vec<ExampleImage>,
}

/// Starting points for new configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigTemplate {
    /// Pets and animals.
    Pet,
    /// People and portraits.
    Person,
    /// Artistic styles.
    Style,
    /// Objects and products.
    Object,
}

impl ConfigTemplate {
    /// All templates.
    pub const ALL: [ConfigTemplate; 4] = [
        ConfigTemplate::Pet,
        ConfigTemplate::Person,
        ConfigTemplate::Style,
        ConfigTemplate::Object,
    ];

    /// Template name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ConfigTemplate::Pet => "pet",
            ConfigTemplate::Person => "person",
            ConfigTemplate::Style => "style",
            ConfigTemplate::Object => "object",
        }
    }

    /// Subject used when none is given.
    #[must_use]
    pub fn default_subject(self) -> &'static str {
        match self {
            ConfigTemplate::Pet => "dog",
            ConfigTemplate::Person => "person",
            ConfigTemplate::Style => "style",
            ConfigTemplate::Object => "object",
        }
    }

    fn num_epochs(self) -> usize {
        match self {
            ConfigTemplate::Pet | ConfigTemplate::Object => 100,
            ConfigTemplate::Person => 150,
            ConfigTemplate::Style => 80,
        }
    }

    fn learning_rate(self) -> f64 {
        match self {
            ConfigTemplate::Pet | ConfigTemplate::Object => 1e-4,
            ConfigTemplate::Person => 5e-5,
            ConfigTemplate::Style => 2e-4,
        }
    }

    fn lora_rank(self) -> usize {
        match self {
            ConfigTemplate::Pet => 4,
            ConfigTemplate::Person | ConfigTemplate::Object => 8,
            ConfigTemplate::Style => 16,
        }
    }

    fn quantize(self) -> u8 {
        match self {
            ConfigTemplate::Style => 8,
            _ => 4,
        }
    }

    /// Prompt used for every image of a new config.
    #[must_use]
    pub fn prompt(self, subject: &str) -> String {
        match self {
            ConfigTemplate::Pet | ConfigTemplate::Object => format!("photo of sks {subject}"),
            ConfigTemplate::Person => format!("portrait of sks {subject}"),
            ConfigTemplate::Style => "artwork in sks style".to_string(),
        }
    }

    fn lora_layers(self) -> LoraLayers {
        let rank = self.lora_rank();
        let strings = |names: &[&str]| names.iter().map(|s| (*s).to_string()).collect();
        match self {
            ConfigTemplate::Style => LoraLayers::new(vec![
                LoraLayerSpec {
                    group: BlockGroup::TransformerBlocks,
                    block_range: BlockRange::span(5, 15),
                    layer_types: strings(&["attn.to_q", "attn.to_k", "attn.to_v"]),
                    lora_rank: rank,
                },
                LoraLayerSpec {
                    group: BlockGroup::SingleTransformerBlocks,
                    block_range: BlockRange::span(20, 38),
                    layer_types: strings(&["proj_out", "proj_mlp"]),
                    lora_rank: rank / 2,
                },
            ]),
            _ => LoraLayers::new(vec![LoraLayerSpec {
                group: BlockGroup::SingleTransformerBlocks,
                block_range: BlockRange::span(
                    if self == ConfigTemplate::Pet { 0 } else { 10 },
                    38,
                ),
                layer_types: strings(&[
                    "proj_out",
                    "proj_mlp",
                    "attn.to_q",
                    "attn.to_k",
                    "attn.to_v",
                ]),
                lora_rank: rank,
            }]),
        }
    }
}

impl FromStr for ConfigTemplate {
    type Err = DreamboothError;

    fn from_str(s: &str) -> Result<Self> {
        ConfigTemplate::ALL
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| {
                DreamboothError::Config(format!(
                    "Unknown template: {s} (expected pet, person, style or object)"
                ))
            })
    }
}

impl TrainingConfig {
    /// Load configuration from a JSON file.
    ///
    /// Relative `examples.path` values resolve against the file's directory.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&content)?;
        config.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(config)
    }

    /// Parse configuration from a JSON string; relative paths resolve against `base_dir`.
    pub fn from_json(json: &str, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut config: Self = serde_json::from_str(json)?;
        config.base_dir = base_dir.into();
        Ok(config)
    }

    /// Save configuration to a JSON file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a template name (`pet`, `person`, `style`, `object`).
    ///
    /// The result points at `./images` with a single placeholder image.
    pub fn from_preset(preset: &str) -> Result<Self> {
        let template = ConfigTemplate::from_str(preset)?;
        Ok(Self::from_template(
            template,
            template.default_subject(),
            "./images",
            vec![PathBuf::from("image_01.jpg")],
        ))
    }

    /// Build a configuration from a template for the given images.
    #[must_use]
    pub fn from_template(
        template: ConfigTemplate,
        subject: &str,
        image_dir: impl Into<PathBuf>,
        images: Vec<PathBuf>,
    ) -> Self {
        let prompt = template.prompt(subject);
        let frequency = if images.len() < 10 { 20 } else { 50 };
        Self {
            model: ModelVariant::Dev,
            seed: default_seed(),
            steps: default_steps(),
            guidance: if template == ConfigTemplate::Style {
                3.5
            } else {
                3.0
            },
            quantize: Some(template.quantize()),
            width: default_resolution(),
            height: default_resolution(),
            training_loop: TrainingLoopConfig {
                num_epochs: template.num_epochs(),
                batch_size: 1,
            },
            optimizer: OptimizerSettings {
                name: OptimizerKind::AdamW,
                learning_rate: template.learning_rate(),
            },
            save: SaveConfig {
                output_path: PathBuf::from(format!("./outputs/dreambooth_{subject}")),
                checkpoint_frequency: frequency,
                keep_last_n: None,
            },
            instrumentation: InstrumentationConfig {
                plot_frequency: 5,
                generate_image_frequency: frequency,
                validation_prompt: Some(prompt.clone()),
            },
            lora_layers: template.lora_layers(),
            examples: ExamplesConfig {
                path: image_dir.into(),
                images: images
                    .into_iter()
                    .map(|image| ExampleImage {
                        image,
                        prompt: prompt.clone(),
                    })
                    .collect(),
            },
            base_dir: PathBuf::new(),
        }
    }

    /// Directory relative example paths resolve against.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// The examples directory, resolved against the config file location.
    #[must_use]
    pub fn examples_dir(&self) -> PathBuf {
        if self.examples.path.is_absolute() {
            self.examples.path.clone()
        } else {
            self.base_dir.join(&self.examples.path)
        }
    }

    /// Copy with `examples.path` resolved, suitable for storing inside a checkpoint.
    #[must_use]
    pub fn resolved(&self) -> Self {
        let mut config = self.clone();
        config.examples.path = self.examples_dir();
        config.base_dir = PathBuf::new();
        config
    }

    /// Prompt for validation images.
    #[must_use]
    pub fn validation_prompt(&self) -> Option<&str> {
        self.instrumentation
            .validation_prompt
            .as_deref()
            .or_else(|| self.examples.images.first().map(|e| e.prompt.as_str()))
    }

    /// Validate against the Flux architecture catalog.
    ///
    /// Every offending field is listed in the error message.
    ///
    /// ```rust
    /// use dreambooth_rs::TrainingConfig;
    ///
    /// let mut config = TrainingConfig::from_preset("pet").unwrap();
    /// config.steps = 0;
    /// config.width = 500;
    /// let err = config.validate().unwrap_err().to_string();
    /// assert!(err.contains("steps"));
    /// assert!(err.contains("width"));
    /// ```
    pub fn validate(&self) -> Result<()> {
        self.validate_for(&Architecture::flux())
    }

    /// Validate against a specific architecture catalog.
    pub fn validate_for(&self, architecture: &Architecture) -> Result<()> {
        let mut problems = self.problems();
        problems.extend(LoraLayerSelector::new(architecture).problems(self.lora_layers.specs()));
        if problems.is_empty() {
            Ok(())
        } else {
            Err(DreamboothError::Config(problems.join("; ")))
        }
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.steps == 0 {
            problems.push("steps must be at least 1".to_string());
        }
        for (field, value) in [("width", self.width), ("height", self.height)] {
            if value % 64 != 0 || value < 256 {
                problems.push(format!(
                    "{field} must be a multiple of 64 and at least 256 (got {value})"
                ));
            }
        }
        if !self.guidance.is_finite() || self.guidance < 0.0 {
            problems.push(format!("guidance must be non-negative (got {})", self.guidance));
        }
        if let Some(bits) = self.quantize {
            if !SUPPORTED_QUANTIZE.contains(&bits) {
                problems.push(format!(
                    "quantize must be one of {SUPPORTED_QUANTIZE:?} (got {bits})"
                ));
            }
        }

        if self.training_loop.num_epochs == 0 {
            problems.push("training_loop.num_epochs must be at least 1".to_string());
        }
        if self.training_loop.batch_size == 0 {
            problems.push("training_loop.batch_size must be at least 1".to_string());
        }
        if !(self.optimizer.learning_rate.is_finite() && self.optimizer.learning_rate > 0.0) {
            problems.push("optimizer.learning_rate must be positive".to_string());
        }

        if self.save.output_path.as_os_str().is_empty() {
            problems.push("save.output_path is required".to_string());
        }
        if self.save.checkpoint_frequency == 0 {
            problems.push("save.checkpoint_frequency must be at least 1".to_string());
        }
        if self.save.keep_last_n == Some(0) {
            problems.push("save.keep_last_n must be at least 1".to_string());
        }
        if self.instrumentation.plot_frequency == 0 {
            problems.push("instrumentation.plot_frequency must be at least 1".to_string());
        }
        if self.instrumentation.generate_image_frequency == 0 {
            problems.push(
                "instrumentation.generate_image_frequency must be at least 1".to_string(),
            );
        }

        if self.lora_layers.is_empty() {
            problems.push("lora_layers must configure at least one block group".to_string());
        }
        for spec in self.lora_layers.specs() {
            let field = format!("lora_layers.{}", spec.group);
            if spec.lora_rank == 0 {
                problems.push(format!("{field}.lora_rank must be at least 1"));
            }
            if spec.layer_types.is_empty() {
                problems.push(format!("{field}.layer_types must not be empty"));
            }
            problems.extend(spec.block_range.problems(&field));
        }

        if self.examples.path.as_os_str().is_empty() {
            problems.push("examples.path is required".to_string());
        }
        if self.examples.images.is_empty() {
            problems.push("examples.images must contain at least one image".to_string());
        }
        for (i, example) in self.examples.images.iter().enumerate() {
            if example.image.as_os_str().is_empty() {
                problems.push(format!("examples.images[{i}].image is required"));
            }
            if example.prompt.trim().is_empty() {
                problems.push(format!("examples.images[{i}].prompt must not be empty"));
            }
        }

        problems
    }

    /// Recommendations that do not prevent training.
    #[must_use]
    pub fn validation_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.training_loop.num_epochs < 20 {
            warnings.push(format!(
                "training_loop.num_epochs = {} is low; 20 or more is recommended",
                self.training_loop.num_epochs
            ));
        }
        if self.training_loop.batch_size > 4 {
            warnings.push(format!(
                "training_loop.batch_size = {} is high; 1-4 is recommended",
                self.training_loop.batch_size
            ));
        }
        let lr = self.optimizer.learning_rate;
        if lr > 0.0 && !(1e-6..=1e-3).contains(&lr) {
            warnings.push(format!(
                "optimizer.learning_rate = {lr:e} is outside the usual 1e-6..1e-3 range"
            ));
        }
        for spec in self.lora_layers.specs() {
            if spec.lora_rank > 64 {
                warnings.push(format!(
                    "lora_layers.{}.lora_rank = {} is unusually high; 4-64 is recommended",
                    spec.group, spec.lora_rank
                ));
            }
        }

        let count = self.examples.images.len();
        if (1..3).contains(&count) {
            warnings.push(format!("only {count} training images; 3 or more is recommended"));
        } else if count > 100 {
            warnings.push(format!("{count} training images; more than 100 rarely helps"));
        }
        let has_trigger = self.examples.images.iter().any(|e| {
            e.prompt
                .split_whitespace()
                .any(|word| TRIGGER_WORDS.contains(&word))
        });
        if count > 0 && !has_trigger {
            warnings.push(format!(
                "no prompt contains a trigger word ({})",
                TRIGGER_WORDS.join(", ")
            ));
        }

        warnings
    }
}
