//! Checkpoint archives for resumable training.
//!
//! A checkpoint is a single zip archive under `<output_path>/_checkpoints`:
//!
//! | member                  | contents                                   |
//! |-------------------------|--------------------------------------------|
//! | `manifest.json`         | format, version, step counters, LoRA specs |
//! | `config.json`           | the config the run was started with        |
//! | `adapters.safetensors`  | every `lora_A` / `lora_B` factor           |
//! | `optimizer.safetensors` | Adam moment estimates                      |
//! | `loss_history.json`     | recorded loss series                       |
//!
//! Archives are written to a `.part` file, synced and renamed, so an
//! interrupted save never replaces a good checkpoint with a partial one.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use safetensors::tensor::TensorView;
use safetensors::Dtype;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::config::{LoraLayers, OptimizerKind, TrainingConfig};
use crate::error::{CheckpointFault, DreamboothError, Result};
use crate::instrumentation::LossHistory;
use crate::model::DiffusionBackend;
use crate::state::TrainingState;

/// Format name recorded in every manifest.
pub const CHECKPOINT_FORMAT: &str = "dreambooth-lora-checkpoint";
/// Archive layout version this build reads and writes.
pub const CHECKPOINT_VERSION: u32 = 1;
/// Directory under the output path holding archives.
pub const CHECKPOINT_DIR: &str = "_checkpoints";

const ARCHIVE_SUFFIX: &str = "_checkpoint.zip";

const MANIFEST: &str = "manifest.json";
const CONFIG: &str = "config.json";
const ADAPTERS: &str = "adapters.safetensors";
const OPTIMIZER: &str = "optimizer.safetensors";
const LOSS_HISTORY: &str = "loss_history.json";

/// Optimizer position stored in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSnapshot {
    /// Algorithm.
    pub name: OptimizerKind,
    /// Learning rate in effect.
    pub learning_rate: f64,
    /// Updates applied so far.
    pub step_count: usize,
}

/// Describes a checkpoint without loading any tensors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    /// Always [`CHECKPOINT_FORMAT`].
    pub format: String,
    /// Archive layout version.
    pub version: u32,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// Epoch of the last completed step.
    pub epoch: usize,
    /// Completed optimizer steps.
    pub global_step: usize,
    /// Seed of the run.
    pub seed: u64,
    /// Usable examples when the checkpoint was written.
    pub dataset_len: usize,
    /// Adapter layout the archive was produced under.
    pub lora_layers: LoraLayers,
    /// Optimizer position.
    pub optimizer: OptimizerSnapshot,
    /// Number of adapted sublayers.
    pub adapter_count: usize,
    /// Trainable parameter count.
    pub trainable_params: usize,
}

impl CheckpointManifest {
    fn for_state(
        state: &TrainingState,
        dataset_len: usize,
        lora_layers: &LoraLayers,
        name: OptimizerKind,
    ) -> Self {
        Self {
            format: CHECKPOINT_FORMAT.to_string(),
            version: CHECKPOINT_VERSION,
            created_at: chrono::Utc::now().to_rfc3339(),
            epoch: state.epoch,
            global_step: state.global_step,
            seed: state.seed,
            dataset_len,
            lora_layers: lora_layers.clone(),
            optimizer: OptimizerSnapshot {
                name,
                learning_rate: state.optimizer.config().learning_rate,
                step_count: state.optimizer.step_count(),
            },
            adapter_count: state.adapters.len(),
            trainable_params: state.adapters.param_count(),
        }
    }

    fn check_format(&self) -> Result<()> {
        if self.format != CHECKPOINT_FORMAT {
            return Err(CheckpointFault::Malformed {
                member: MANIFEST.to_string(),
                reason: format!("unknown format `{}`", self.format),
            }
            .into());
        }
        if self.version != CHECKPOINT_VERSION {
            return Err(CheckpointFault::VersionMismatch {
                expected: CHECKPOINT_VERSION,
                found: self.version,
            }
            .into());
        }
        Ok(())
    }
}

/// A decoded checkpoint archive.
#[derive(Debug)]
pub struct Checkpoint {
    /// Archive manifest.
    pub manifest: CheckpointManifest,
    /// Config stored with the run.
    pub config: TrainingConfig,
    /// Recorded losses.
    pub losses: LossHistory,
    adapters: HashMap<String, Tensor>,
    optimizer: HashMap<String, Tensor>,
}

impl Checkpoint {
    /// Decode every member of the archive at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`DreamboothError::CorruptCheckpoint`] naming the missing or
    /// malformed member, or a version mismatch.
    pub fn read(path: &Path, device: &Device) -> Result<Self> {
        let mut archive = open_archive(path)?;
        let manifest: CheckpointManifest = read_json(&mut archive, MANIFEST)?;
        manifest.check_format()?;

        let config: TrainingConfig = read_json(&mut archive, CONFIG)?;
        let adapters = read_tensors(&mut archive, ADAPTERS, device)?;
        let optimizer = read_tensors(&mut archive, OPTIMIZER, device)?;
        let losses: LossHistory = read_json(&mut archive, LOSS_HISTORY)?;

        Ok(Self {
            manifest,
            config,
            losses,
            adapters,
            optimizer,
        })
    }

    /// Read only the manifest.
    pub fn inspect(path: &Path) -> Result<CheckpointManifest> {
        let mut archive = open_archive(path)?;
        let manifest: CheckpointManifest = read_json(&mut archive, MANIFEST)?;
        manifest.check_format()?;
        Ok(manifest)
    }

    /// Check that this archive can continue a run of `config` over `dataset_len` examples.
    pub fn verify(&self, config: &TrainingConfig, dataset_len: usize) -> Result<()> {
        if let Some(diff) = self.manifest.lora_layers.difference(&config.lora_layers) {
            return Err(CheckpointFault::SpecMismatch(diff).into());
        }
        if self.manifest.dataset_len != dataset_len {
            return Err(CheckpointFault::DatasetMismatch {
                recorded: self.manifest.dataset_len,
                current: dataset_len,
            }
            .into());
        }
        Ok(())
    }

    /// Overwrite `state` with the archived adapters, optimizer and counters.
    ///
    /// Tensors are validated before anything in `state` changes.
    pub fn restore_into(self, state: &mut TrainingState) -> Result<()> {
        state.adapters.load_tensors(&self.adapters)?;
        state
            .optimizer
            .load_state(&self.optimizer, self.manifest.optimizer.step_count)?;
        state.epoch = self.manifest.epoch;
        state.global_step = self.manifest.global_step;
        state.seed = self.manifest.seed;
        state.losses = self.losses;
        Ok(())
    }
}

/// Saves, lists and prunes the checkpoints of one run.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    keep_last_n: Option<usize>,
}

impl CheckpointManager {
    /// Manager for archives under `<output_path>/_checkpoints`.
    pub fn new(output_path: impl AsRef<Path>, keep_last_n: Option<usize>) -> Self {
        Self {
            dir: output_path.as_ref().join(CHECKPOINT_DIR),
            keep_last_n,
        }
    }

    /// Manager for the run described by `config`.
    #[must_use]
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(&config.save.output_path, config.save.keep_last_n)
    }

    /// Checkpoint directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Archive path for `step`.
    #[must_use]
    pub fn path_for(&self, step: usize) -> PathBuf {
        self.dir.join(format!("{step:07}{ARCHIVE_SUFFIX}"))
    }

    /// Write a checkpoint of `state` and prune older archives.
    ///
    /// Archives with a higher step than `state` are never pruned, so a stale
    /// run left in the same directory cannot evict the archive just written.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or any file operation fails. The
    /// previous checkpoint is untouched in that case.
    pub fn save(
        &self,
        state: &TrainingState,
        config: &TrainingConfig,
        dataset_len: usize,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(state.global_step);
        let part = part_path(&path);

        let manifest = CheckpointManifest::for_state(
            state,
            dataset_len,
            &config.lora_layers,
            config.optimizer.name,
        );
        let members = [
            (MANIFEST, serde_json::to_vec_pretty(&manifest)?),
            (CONFIG, serde_json::to_vec_pretty(&config.resolved())?),
            (ADAPTERS, encode_tensors(state.adapters.to_tensors()?, state.global_step)?),
            (OPTIMIZER, encode_tensors(state.optimizer.state_tensors(), state.global_step)?),
            (LOSS_HISTORY, serde_json::to_vec(&state.losses)?),
        ];

        if let Err(e) = write_archive(&part, &members) {
            let _ = fs::remove_file(&part);
            return Err(e);
        }
        fs::rename(&part, &path)?;
        info!(step = state.global_step, path = %path.display(), "Saved checkpoint");

        self.prune(state.global_step)?;
        Ok(path)
    }

    /// Restore a training state for `config` from the archive at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`DreamboothError::CorruptCheckpoint`] when the archive is
    /// damaged or was produced under different LoRA specs or dataset size.
    pub fn load<B: DiffusionBackend + ?Sized>(
        path: &Path,
        config: &TrainingConfig,
        backend: &B,
        dataset_len: usize,
    ) -> Result<TrainingState> {
        let checkpoint = Checkpoint::read(path, backend.device())?;
        checkpoint.verify(config, dataset_len)?;
        let mut state = TrainingState::fresh(config, backend)?;
        checkpoint.restore_into(&mut state)?;
        info!(step = state.global_step, path = %path.display(), "Restored checkpoint");
        Ok(state)
    }

    /// Archives in step order, oldest first.
    pub fn list(&self) -> Result<Vec<(usize, PathBuf)>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut archives = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let step = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_suffix(ARCHIVE_SUFFIX))
                .and_then(|step| step.parse::<usize>().ok());
            if let Some(step) = step {
                archives.push((step, path));
            }
        }
        archives.sort_by_key(|(step, _)| *step);
        Ok(archives)
    }

    /// Newest archive, if any.
    pub fn latest(&self) -> Result<Option<PathBuf>> {
        Ok(self.list()?.pop().map(|(_, path)| path))
    }

    /// Delete all but the newest `keep_last_n` archives at or below `through_step`.
    ///
    /// Returns the removed paths. Does nothing when `keep_last_n` is unset.
    pub fn prune(&self, through_step: usize) -> Result<Vec<PathBuf>> {
        let Some(keep) = self.keep_last_n else {
            return Ok(Vec::new());
        };
        let archives: Vec<_> = self
            .list()?
            .into_iter()
            .filter(|(step, _)| *step <= through_step)
            .collect();
        let excess = archives.len().saturating_sub(keep.max(1));
        let mut removed = Vec::with_capacity(excess);
        for (step, path) in archives.into_iter().take(excess) {
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(step, "Pruned checkpoint");
                    removed.push(path);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to prune checkpoint"),
            }
        }
        Ok(removed)
    }
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Flatten `tensors` to little-endian f32 buffers and serialize them.
fn encode_tensors(tensors: Vec<(String, Tensor)>, step: usize) -> Result<Vec<u8>> {
    let mut buffers = Vec::with_capacity(tensors.len());
    for (name, tensor) in tensors {
        let shape = tensor.dims().to_vec();
        let values = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        buffers.push((name, shape, bytes));
    }

    let mut views = Vec::with_capacity(buffers.len());
    for (name, shape, bytes) in &buffers {
        views.push((name.as_str(), TensorView::new(Dtype::F32, shape.clone(), bytes)?));
    }
    let metadata = HashMap::from([
        ("format".to_string(), CHECKPOINT_FORMAT.to_string()),
        ("global_step".to_string(), step.to_string()),
    ]);
    Ok(safetensors::tensor::serialize(views, &Some(metadata))?)
}

fn write_archive(path: &Path, members: &[(&str, Vec<u8>)]) -> Result<()> {
    let mut zip = ZipWriter::new(File::create(path)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, bytes) in members {
        zip.start_file(*name, options)?;
        zip.write_all(bytes)?;
    }
    let file = zip.finish()?;
    file.sync_all()?;
    Ok(())
}

fn open_archive(path: &Path) -> Result<ZipArchive<File>> {
    let file = File::open(path)?;
    ZipArchive::new(file).map_err(|e| {
        CheckpointFault::Malformed {
            member: path.display().to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

fn read_member(archive: &mut ZipArchive<File>, name: &str) -> Result<Vec<u8>> {
    let malformed = |reason: String| CheckpointFault::Malformed {
        member: name.to_string(),
        reason,
    };
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(ZipError::FileNotFound) => {
            return Err(CheckpointFault::MissingMember(name.to_string()).into())
        }
        Err(e) => return Err(malformed(e.to_string()).into()),
    };
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .map_err(|e| malformed(e.to_string()))?;
    Ok(bytes)
}

fn read_json<T: DeserializeOwned>(archive: &mut ZipArchive<File>, name: &str) -> Result<T> {
    let bytes = read_member(archive, name)?;
    serde_json::from_slice(&bytes).map_err(|e| {
        DreamboothError::from(CheckpointFault::Malformed {
            member: name.to_string(),
            reason: e.to_string(),
        })
    })
}

fn read_tensors(
    archive: &mut ZipArchive<File>,
    name: &str,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    let bytes = read_member(archive, name)?;
    candle_core::safetensors::load_buffer(&bytes, device).map_err(|e| {
        DreamboothError::from(CheckpointFault::Malformed {
            member: name.to_string(),
            reason: e.to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;
    use crate::loss::LossEvaluator;
    use crate::mocks::{mock_config, MockBackend};
    use crate::schedule::NoiseSchedule;
    use crate::state::step_rng;
    use tempfile::TempDir;

    fn trained_state(
        config: &TrainingConfig,
        backend: &MockBackend,
        steps: usize,
    ) -> TrainingState {
        let dataset = Dataset::load(config, backend).unwrap();
        let schedule = NoiseSchedule::for_config(config).unwrap();
        let evaluator = LossEvaluator::new(&schedule);
        let mut state = TrainingState::fresh(config, backend).unwrap();
        let order = dataset.epoch_order(config.seed, 0);
        for step in 0..steps {
            let batch = dataset.batch(&order, step % dataset.len(), 1);
            let loss = evaluator
                .batch_loss(backend, &state.adapters, &batch, &mut step_rng(config.seed, step))
                .unwrap();
            state.optimizer.update(&loss).unwrap();
            state.global_step += 1;
            state
                .losses
                .record_loss(state.global_step, f64::from(loss.to_scalar::<f32>().unwrap()));
        }
        state
    }

    fn rewrite(path: &Path, edit: impl Fn(&str, Vec<u8>) -> Option<Vec<u8>>) {
        let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut members = Vec::new();
        for i in 0..archive.len() {
            let mut file = archive.by_index(i).unwrap();
            let name = file.name().to_string();
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes).unwrap();
            members.push((name, bytes));
        }
        drop(archive);

        let mut writer = ZipWriter::new(File::create(path).unwrap());
        for (name, bytes) in members {
            if let Some(bytes) = edit(&name, bytes) {
                writer.start_file(name, SimpleFileOptions::default()).unwrap();
                writer.write_all(&bytes).unwrap();
            }
        }
        writer.finish().unwrap();
    }

    fn fault(err: DreamboothError) -> CheckpointFault {
        match err {
            DreamboothError::CorruptCheckpoint(fault) => fault,
            other => panic!("expected corrupt checkpoint, got {other}"),
        }
    }

    struct Fixture {
        _dir: TempDir,
        config: TrainingConfig,
        backend: MockBackend,
        manager: CheckpointManager,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = mock_config(dir.path(), 3).unwrap();
        let backend = MockBackend::new(1).unwrap();
        let manager = CheckpointManager::from_config(&config);
        Fixture {
            _dir: dir,
            config,
            backend,
            manager,
        }
    }

    #[test]
    fn test_save_writes_named_archive() {
        let f = fixture();
        let state = trained_state(&f.config, &f.backend, 2);
        let path = f.manager.save(&state, &f.config, 3).unwrap();

        assert!(path.ends_with("_checkpoints/0000002_checkpoint.zip"));
        assert!(path.exists());
        assert!(!part_path(&path).exists());
    }

    #[test]
    fn test_round_trip_restores_state() {
        let f = fixture();
        let state = trained_state(&f.config, &f.backend, 3);
        let path = f.manager.save(&state, &f.config, 3).unwrap();

        let restored = CheckpointManager::load(&path, &f.config, &f.backend, 3).unwrap();
        assert_eq!(restored.global_step, 3);
        assert_eq!(restored.optimizer.step_count(), 3);
        assert_eq!(restored.losses, state.losses);

        let before = state.adapters.to_tensors().unwrap();
        let after = restored.adapters.to_tensors().unwrap();
        assert_eq!(before.len(), after.len());
        for ((name_a, a), (name_b, b)) in before.iter().zip(&after) {
            assert_eq!(name_a, name_b);
            assert_eq!(
                a.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
                b.flatten_all().unwrap().to_vec1::<f32>().unwrap()
            );
        }
    }

    #[test]
    fn test_inspect_reads_manifest() {
        let f = fixture();
        let state = trained_state(&f.config, &f.backend, 1);
        let path = f.manager.save(&state, &f.config, 3).unwrap();

        let manifest = Checkpoint::inspect(&path).unwrap();
        assert_eq!(manifest.format, CHECKPOINT_FORMAT);
        assert_eq!(manifest.version, CHECKPOINT_VERSION);
        assert_eq!(manifest.global_step, 1);
        assert_eq!(manifest.dataset_len, 3);
        assert_eq!(manifest.lora_layers, f.config.lora_layers);
        assert_eq!(manifest.adapter_count, state.adapters.len());
    }

    #[test]
    fn test_stored_config_is_readable() {
        let f = fixture();
        let state = trained_state(&f.config, &f.backend, 1);
        let path = f.manager.save(&state, &f.config, 3).unwrap();

        let checkpoint = Checkpoint::read(&path, &Device::Cpu).unwrap();
        assert_eq!(checkpoint.config.examples.path, f.config.examples_dir());
        assert_eq!(checkpoint.config.lora_layers, f.config.lora_layers);
        assert_eq!(checkpoint.config.seed, f.config.seed);
    }

    #[test]
    fn test_missing_member() {
        let f = fixture();
        let state = trained_state(&f.config, &f.backend, 1);
        let path = f.manager.save(&state, &f.config, 3).unwrap();
        rewrite(&path, |name, bytes| (name != ADAPTERS).then_some(bytes));

        let err = Checkpoint::read(&path, &Device::Cpu).unwrap_err();
        assert_eq!(fault(err), CheckpointFault::MissingMember(ADAPTERS.to_string()));
    }

    #[test]
    fn test_malformed_member() {
        let f = fixture();
        let state = trained_state(&f.config, &f.backend, 1);
        let path = f.manager.save(&state, &f.config, 3).unwrap();
        rewrite(&path, |name, bytes| {
            Some(if name == OPTIMIZER { b"garbage".to_vec() } else { bytes })
        });

        let err = Checkpoint::read(&path, &Device::Cpu).unwrap_err();
        assert!(matches!(
            fault(err),
            CheckpointFault::Malformed { member, .. } if member == OPTIMIZER
        ));
    }

    #[test]
    fn test_version_mismatch() {
        let f = fixture();
        let state = trained_state(&f.config, &f.backend, 1);
        let path = f.manager.save(&state, &f.config, 3).unwrap();
        rewrite(&path, |name, bytes| {
            if name != MANIFEST {
                return Some(bytes);
            }
            let mut manifest: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            manifest["version"] = serde_json::json!(99);
            Some(serde_json::to_vec(&manifest).unwrap())
        });

        let err = Checkpoint::inspect(&path).unwrap_err();
        assert_eq!(
            fault(err),
            CheckpointFault::VersionMismatch {
                expected: CHECKPOINT_VERSION,
                found: 99
            }
        );
    }

    #[test]
    fn test_not_an_archive() {
        let f = fixture();
        fs::create_dir_all(f.manager.dir()).unwrap();
        let path = f.manager.path_for(7);
        fs::write(&path, b"definitely not a zip").unwrap();

        let err = Checkpoint::read(&path, &Device::Cpu).unwrap_err();
        assert!(matches!(fault(err), CheckpointFault::Malformed { .. }));
    }

    #[test]
    fn test_spec_mismatch_rejected() {
        let f = fixture();
        let state = trained_state(&f.config, &f.backend, 1);
        let path = f.manager.save(&state, &f.config, 3).unwrap();

        let mut other = f.config.clone();
        let mut specs = other.lora_layers.specs().to_vec();
        specs[0].lora_rank = 4;
        other.lora_layers = LoraLayers::new(specs);

        let err = CheckpointManager::load(&path, &other, &f.backend, 3).unwrap_err();
        assert!(matches!(fault(err), CheckpointFault::SpecMismatch(_)));
    }

    #[test]
    fn test_dataset_mismatch_rejected() {
        let f = fixture();
        let state = trained_state(&f.config, &f.backend, 1);
        let path = f.manager.save(&state, &f.config, 3).unwrap();

        let err = CheckpointManager::load(&path, &f.config, &f.backend, 4).unwrap_err();
        assert_eq!(
            fault(err),
            CheckpointFault::DatasetMismatch {
                recorded: 3,
                current: 4
            }
        );
    }

    #[test]
    fn test_list_and_latest() {
        let f = fixture();
        assert!(f.manager.latest().unwrap().is_none());

        let mut state = trained_state(&f.config, &f.backend, 1);
        for step in [3, 12, 5] {
            state.global_step = step;
            f.manager.save(&state, &f.config, 3).unwrap();
        }
        fs::write(f.manager.dir().join("0000099_checkpoint.zip.part"), b"").unwrap();

        let steps: Vec<usize> = f.manager.list().unwrap().into_iter().map(|(s, _)| s).collect();
        assert_eq!(steps, vec![3, 5, 12]);
        assert_eq!(f.manager.latest().unwrap(), Some(f.manager.path_for(12)));
    }

    #[test]
    fn test_keep_last_n_prunes_oldest() {
        let mut f = fixture();
        f.config.save.keep_last_n = Some(2);
        let manager = CheckpointManager::from_config(&f.config);

        let mut state = trained_state(&f.config, &f.backend, 1);
        for step in 1..=4 {
            state.global_step = step;
            manager.save(&state, &f.config, 3).unwrap();
        }

        let steps: Vec<usize> = manager.list().unwrap().into_iter().map(|(s, _)| s).collect();
        assert_eq!(steps, vec![3, 4]);
    }

    #[test]
    fn test_without_keep_last_n_everything_is_kept() {
        let f = fixture();
        let mut state = trained_state(&f.config, &f.backend, 1);
        for step in 1..=3 {
            state.global_step = step;
            f.manager.save(&state, &f.config, 3).unwrap();
        }
        assert!(f.manager.prune(3).unwrap().is_empty());
        assert_eq!(f.manager.list().unwrap().len(), 3);
    }

    #[test]
    fn test_prune_ignores_newer_archives_from_other_runs() {
        let mut f = fixture();
        f.config.save.keep_last_n = Some(1);
        let manager = CheckpointManager::from_config(&f.config);

        let mut state = trained_state(&f.config, &f.backend, 1);
        state.global_step = 10;
        manager.save(&state, &f.config, 3).unwrap();

        state.global_step = 5;
        let path = manager.save(&state, &f.config, 3).unwrap();

        assert!(path.exists());
        let steps: Vec<usize> = manager.list().unwrap().into_iter().map(|(s, _)| s).collect();
        assert_eq!(steps, vec![5, 10]);
    }

    #[test]
    fn test_prune_through_step() {
        let mut f = fixture();
        f.config.save.keep_last_n = Some(1);
        let manager = CheckpointManager::new(&f.config.save.output_path, None);
        let mut state = trained_state(&f.config, &f.backend, 1);
        for step in [2, 4, 6] {
            state.global_step = step;
            manager.save(&state, &f.config, 3).unwrap();
        }

        let pruning = CheckpointManager::from_config(&f.config);
        let removed = pruning.prune(4).unwrap();
        assert_eq!(removed, vec![pruning.path_for(2)]);
        let steps: Vec<usize> = pruning.list().unwrap().into_iter().map(|(s, _)| s).collect();
        assert_eq!(steps, vec![4, 6]);
    }
}
