//! Example resolution, encoding and batching.

use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use tracing::{info, warn};

use crate::config::TrainingConfig;
use crate::error::{DreamboothError, Result};
use crate::model::{DiffusionBackend, EncodedExample};
use crate::state::epoch_rng;

/// File extensions picked up by [`scan_images`].
pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Image file names directly inside `dir`, sorted.
///
/// # Errors
///
/// Returns an error if `dir` cannot be read.
pub fn scan_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
        if is_image && path.is_file() {
            if let Some(name) = path.file_name() {
                images.push(PathBuf::from(name));
            }
        }
    }
    images.sort();
    Ok(images)
}

/// A training image and its prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    /// Resolved image path.
    pub image: PathBuf,
    /// Training prompt.
    pub prompt: String,
}

/// Encoded examples ready for training.
///
/// # Example
///
/// ```no_run
/// use dreambooth_rs::dataset::Dataset;
/// use dreambooth_rs::mocks::MockBackend;
/// use dreambooth_rs::TrainingConfig;
///
/// # fn main() -> dreambooth_rs::Result<()> {
/// let config = TrainingConfig::from_file("config.json")?;
/// let backend = MockBackend::new(config.seed)?;
/// let dataset = Dataset::load(&config, &backend)?;
/// println!("{} examples, {} steps per epoch", dataset.len(), dataset.steps_per_epoch(1));
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Dataset {
    examples: Vec<Example>,
    encoded: Vec<EncodedExample>,
}

impl Dataset {
    /// Configured examples with paths resolved against `examples.path`.
    #[must_use]
    pub fn resolve(config: &TrainingConfig) -> Vec<Example> {
        let dir = config.examples_dir();
        config
            .examples
            .images
            .iter()
            .map(|entry| Example {
                image: dir.join(&entry.image),
                prompt: entry.prompt.clone(),
            })
            .collect()
    }

    /// Encode every readable example through `backend`.
    ///
    /// Unreadable images are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when no example survives, and propagates
    /// backend failures other than per-example I/O problems.
    pub fn load<B: DiffusionBackend + ?Sized>(
        config: &TrainingConfig,
        backend: &B,
    ) -> Result<Self> {
        let resolved = Self::resolve(config);
        let configured = resolved.len();
        let mut examples = Vec::with_capacity(configured);
        let mut encoded = Vec::with_capacity(configured);

        for example in resolved {
            if let Err(e) = image::image_dimensions(&example.image) {
                warn!(image = %example.image.display(), error = %e, "skipping unreadable example");
                continue;
            }
            match backend.encode_example(&example.image, &example.prompt) {
                Ok(enc) => {
                    examples.push(example);
                    encoded.push(enc);
                }
                Err(
                    e @ (DreamboothError::Io(_)
                    | DreamboothError::Image(_)
                    | DreamboothError::Dataset(_)),
                ) => {
                    warn!(
                        image = %example.image.display(),
                        error = %e,
                        "skipping example that failed to encode"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if examples.is_empty() {
            return Err(DreamboothError::Config(format!(
                "examples.images: none of the {configured} configured images could be loaded"
            )));
        }

        info!(
            "Loaded {} of {} training examples",
            examples.len(),
            configured
        );
        Ok(Self { examples, encoded })
    }

    /// Number of usable examples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// True when there are no examples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Usable examples in config order.
    #[must_use]
    pub fn examples(&self) -> &[Example] {
        &self.examples
    }

    /// Optimizer steps per epoch; the last batch may be short.
    #[must_use]
    pub fn steps_per_epoch(&self, batch_size: usize) -> usize {
        self.len().div_ceil(batch_size.max(1))
    }

    /// Visiting order for `epoch`, a permutation derived from `(seed, epoch)`.
    #[must_use]
    pub fn epoch_order(&self, seed: u64, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(&mut epoch_rng(seed, epoch));
        order
    }

    /// The `index`-th batch of an epoch visiting examples in `order`.
    #[must_use]
    pub fn batch(&self, order: &[usize], index: usize, batch_size: usize) -> Vec<&EncodedExample> {
        order
            .chunks(batch_size.max(1))
            .nth(index)
            .map(|chunk| chunk.iter().map(|&i| &self.encoded[i]).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{write_test_image, MockBackend};
    use tempfile::TempDir;

    fn config_with_images(dir: &TempDir, names: &[&str]) -> TrainingConfig {
        let mut config = TrainingConfig::from_preset("pet").unwrap();
        config.examples.path = dir.path().to_path_buf();
        config.examples.images = names
            .iter()
            .map(|name| crate::config::ExampleImage {
                image: PathBuf::from(name),
                prompt: format!("photo of sks dog {name}"),
            })
            .collect();
        config
    }

    #[test]
    fn test_scan_images_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        for name in ["b.PNG", "a.jpg", "notes.txt", "c.jpeg"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join("d.png")).unwrap();

        let images = scan_images(dir.path()).unwrap();
        assert_eq!(
            images,
            vec![PathBuf::from("a.jpg"), PathBuf::from("b.PNG"), PathBuf::from("c.jpeg")]
        );
    }

    #[test]
    fn test_resolve_joins_examples_dir() {
        let dir = TempDir::new().unwrap();
        let config = config_with_images(&dir, &["a.png"]);
        let examples = Dataset::resolve(&config);
        assert_eq!(examples[0].image, dir.path().join("a.png"));
    }

    #[test]
    fn test_unreadable_images_are_skipped() {
        let dir = TempDir::new().unwrap();
        write_test_image(&dir.path().join("a.png"), 1).unwrap();
        std::fs::write(dir.path().join("broken.png"), b"not an image").unwrap();
        write_test_image(&dir.path().join("c.png"), 2).unwrap();

        let config = config_with_images(&dir, &["a.png", "broken.png", "missing.png", "c.png"]);
        let backend = MockBackend::new(0).unwrap();
        let dataset = Dataset::load(&config, &backend).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.examples()[1].image, dir.path().join("c.png"));
    }

    #[test]
    fn test_no_readable_images_is_config_error() {
        let dir = TempDir::new().unwrap();
        let config = config_with_images(&dir, &["missing.png"]);
        let backend = MockBackend::new(0).unwrap();
        let err = Dataset::load(&config, &backend).unwrap_err();
        assert!(matches!(err, DreamboothError::Config(_)));
    }

    #[test]
    fn test_batching_and_order() {
        let dir = TempDir::new().unwrap();
        let names = ["0.png", "1.png", "2.png", "3.png", "4.png"];
        for (i, name) in names.iter().enumerate() {
            write_test_image(&dir.path().join(name), i as u8).unwrap();
        }
        let config = config_with_images(&dir, &names);
        let backend = MockBackend::new(0).unwrap();
        let dataset = Dataset::load(&config, &backend).unwrap();

        assert_eq!(dataset.steps_per_epoch(2), 3);
        assert_eq!(dataset.steps_per_epoch(5), 1);

        let order = dataset.epoch_order(42, 0);
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2, 3, 4]);
        assert_eq!(order, dataset.epoch_order(42, 0));

        assert_eq!(dataset.batch(&order, 0, 2).len(), 2);
        assert_eq!(dataset.batch(&order, 2, 2).len(), 1);
        assert!(dataset.batch(&order, 3, 2).is_empty());
    }

    #[test]
    fn test_epoch_orders_differ() {
        let dir = TempDir::new().unwrap();
        let names: Vec<String> = (0..8).map(|i| format!("{i}.png")).collect();
        for (i, name) in names.iter().enumerate() {
            write_test_image(&dir.path().join(name), i as u8).unwrap();
        }
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let config = config_with_images(&dir, &refs);
        let backend = MockBackend::new(0).unwrap();
        let dataset = Dataset::load(&config, &backend).unwrap();

        let orders: Vec<Vec<usize>> = (0..4).map(|e| dataset.epoch_order(7, e)).collect();
        assert!(orders.windows(2).any(|w| w[0] != w[1]));
    }
}
