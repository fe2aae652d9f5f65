//! Training loop and scheduled side effects.

use std::path::{Path, PathBuf};

use candle_core::DType;
use indicatif::{ProgressBar, ProgressStyle};

use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::config::TrainingConfig;
use crate::dataset::Dataset;
use crate::error::{DreamboothError, Result};
use crate::instrumentation::{Instrumentation, LossHistory};
use crate::lora::AdapterRegistry;
use crate::loss::LossEvaluator;
use crate::model::DiffusionBackend;
use crate::preflight;
use crate::schedule::NoiseSchedule;
use crate::state::{step_rng, TrainingState};

const PROGRESS_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} ETA {eta} {msg}";

/// Where the trainer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerPhase {
    /// Loading examples and building adapters.
    Initializing,
    /// Taking optimizer steps.
    Running,
    /// Writing a checkpoint archive.
    Checkpointing,
    /// Rendering a validation image.
    Validating,
    /// Every step has run and the final checkpoint exists.
    Completed,
    /// A step or a checkpoint failed.
    Failed,
}

/// Side effects due after a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DueEvents {
    /// Write a checkpoint.
    pub checkpoint: bool,
    /// Render a validation image.
    pub validate: bool,
    /// Record the loss and redraw the plot.
    pub plot: bool,
}

impl DueEvents {
    /// True when anything is due.
    #[must_use]
    pub fn any(&self) -> bool {
        self.checkpoint || self.validate || self.plot
    }
}

/// Step-modulus schedule of side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepSchedule {
    /// Checkpoint every N steps.
    pub checkpoint_every: usize,
    /// Validation image every N steps.
    pub validate_every: usize,
    /// Loss plot every N steps.
    pub plot_every: usize,
}

impl StepSchedule {
    /// Frequencies from the `save` and `instrumentation` sections.
    #[must_use]
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self {
            checkpoint_every: config.save.checkpoint_frequency,
            validate_every: config.instrumentation.generate_image_frequency,
            plot_every: config.instrumentation.plot_frequency,
        }
    }

    /// Events due once global step `step` has completed.
    #[must_use]
    pub fn due(&self, step: usize) -> DueEvents {
        let every = |n: usize| n > 0 && step > 0 && step % n == 0;
        DueEvents {
            checkpoint: every(self.checkpoint_every),
            validate: every(self.validate_every),
            plot: every(self.plot_every),
        }
    }
}

/// Metrics of one optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepMetrics {
    /// Global step after the update.
    pub step: usize,
    /// Zero-based epoch the step belonged to.
    pub epoch: usize,
    /// Batch loss.
    pub loss: f64,
}

/// What a call to [`Trainer::train`] produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingSummary {
    /// Global step when training stopped.
    pub final_step: usize,
    /// Steps taken by this call.
    pub steps_run: usize,
    /// Loss of the last step taken.
    pub last_loss: Option<f64>,
    /// Archives written, in order.
    pub checkpoints: Vec<PathBuf>,
    /// Validation images written.
    pub validation_images: Vec<PathBuf>,
    /// Loss plots written.
    pub plots: Vec<PathBuf>,
}

/// Training orchestrator.
///
/// # Example
///
/// ```no_run
/// use dreambooth_rs::mocks::MockBackend;
/// use dreambooth_rs::Trainer;
///
/// # fn main() -> dreambooth_rs::Result<()> {
/// let backend = MockBackend::new(0)?;
/// let mut trainer = Trainer::start("config.json", backend)?;
/// let summary = trainer.train()?;
/// println!("finished at step {}", summary.final_step);
/// # Ok(())
/// # }
/// ```
pub struct Trainer<B: DiffusionBackend> {
    config: TrainingConfig,
    backend: B,
    dataset: Dataset,
    schedule: NoiseSchedule,
    state: TrainingState,
    checkpoints: CheckpointManager,
    instrumentation: Instrumentation,
    events: StepSchedule,
    phase: TrainerPhase,
    metrics: Vec<StepMetrics>,
    last_saved_step: Option<usize>,
}

impl<B: DiffusionBackend> Trainer<B> {
    /// Create a trainer with freshly initialized adapters.
    ///
    /// Validates the config against the backend's architecture, runs the
    /// preflight checks and encodes the dataset.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if validation or preflight fails or no
    /// example can be loaded.
    pub fn new(config: TrainingConfig, backend: B) -> Result<Self> {
        config.validate_for(backend.architecture())?;
        for warning in config.validation_warnings() {
            tracing::warn!("{warning}");
        }
        let report = preflight::run_checks(&config).into_result()?;
        tracing::info!(
            "Estimated memory use: ~{:.0}GB",
            report.estimated_memory_gb
        );

        let dataset = Dataset::load(&config, &backend)?;
        let schedule = NoiseSchedule::for_config(&config)?;
        let state = TrainingState::fresh(&config, &backend)?;

        tracing::info!("Initialized trainer");
        tracing::info!("  Model: {} ({})", config.model, backend.architecture().name());
        tracing::info!(
            "  Adapters: {} ({} parameters)",
            state.adapters.len(),
            state.adapters.param_count()
        );
        tracing::info!("  Examples: {}", dataset.len());
        tracing::info!("  Epochs: {}", config.training_loop.num_epochs);

        Ok(Self {
            checkpoints: CheckpointManager::from_config(&config),
            instrumentation: Instrumentation::new(&config),
            events: StepSchedule::from_config(&config),
            config,
            backend,
            dataset,
            schedule,
            state,
            phase: TrainerPhase::Initializing,
            metrics: Vec::new(),
            last_saved_step: None,
        })
    }

    /// Create a trainer from a config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or [`Trainer::new`] fails.
    pub fn start(config_path: impl AsRef<Path>, backend: B) -> Result<Self> {
        let config = TrainingConfig::from_file(config_path)?;
        Self::new(config, backend)
    }

    /// Continue a run from a checkpoint, using the config stored in it.
    ///
    /// # Errors
    ///
    /// Returns [`DreamboothError::CorruptCheckpoint`] if the archive is
    /// damaged or does not match the dataset it was produced over.
    pub fn resume(checkpoint_path: impl AsRef<Path>, backend: B) -> Result<Self> {
        let path = checkpoint_path.as_ref();
        let checkpoint = Checkpoint::read(path, backend.device())?;
        let mut trainer = Self::new(checkpoint.config.clone(), backend)?;
        checkpoint.verify(&trainer.config, trainer.dataset.len())?;
        checkpoint.restore_into(&mut trainer.state)?;
        tracing::info!(
            step = trainer.state.global_step,
            path = %path.display(),
            "Resumed from checkpoint"
        );
        Ok(trainer)
    }

    /// Replace the current state with a checkpoint of the same run.
    ///
    /// # Errors
    ///
    /// Returns [`DreamboothError::CorruptCheckpoint`] if the archive was
    /// produced under different LoRA specs; the current state is kept.
    pub fn resume_from(&mut self, checkpoint_path: impl AsRef<Path>) -> Result<()> {
        self.state = CheckpointManager::load(
            checkpoint_path.as_ref(),
            &self.config,
            &self.backend,
            self.dataset.len(),
        )?;
        self.last_saved_step = None;
        Ok(())
    }

    /// Steps in one epoch.
    #[must_use]
    pub fn steps_per_epoch(&self) -> usize {
        self.dataset
            .steps_per_epoch(self.config.training_loop.batch_size)
    }

    /// Steps in the whole run.
    #[must_use]
    pub fn total_steps(&self) -> usize {
        self.steps_per_epoch() * self.config.training_loop.num_epochs
    }

    /// Run every remaining step, then write the final checkpoint.
    ///
    /// The final checkpoint is skipped only when this trainer already saved
    /// the final step; archives left on disk by other runs are overwritten.
    ///
    /// # Errors
    ///
    /// Returns an error if a step or a checkpoint save fails. Validation and
    /// plot failures are logged and do not stop training.
    pub fn train(&mut self) -> Result<TrainingSummary> {
        match self.run() {
            Ok(summary) => {
                self.phase = TrainerPhase::Completed;
                Ok(summary)
            }
            Err(e) => {
                self.phase = TrainerPhase::Failed;
                tracing::error!(step = self.state.global_step, error = %e, "Training failed");
                Err(e)
            }
        }
    }

    fn run(&mut self) -> Result<TrainingSummary> {
        self.phase = TrainerPhase::Running;
        let steps_per_epoch = self.steps_per_epoch();
        let total_steps = self.total_steps();
        let start_step = self.state.global_step;
        let mut summary = TrainingSummary::default();

        tracing::info!(
            "Starting training at step {}/{}",
            start_step,
            total_steps
        );

        let pb = ProgressBar::new(total_steps as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(PROGRESS_TEMPLATE)?
                .progress_chars("#>-"),
        );
        pb.set_position(start_step as u64);
        pb.reset_eta();

        self.metrics.clear();
        let mut order_epoch = None;
        let mut order = Vec::new();

        while self.state.global_step < total_steps {
            let step = self.state.global_step;
            let epoch = step / steps_per_epoch;
            let batch_index = step % steps_per_epoch;

            if order_epoch != Some(epoch) {
                order = self.dataset.epoch_order(self.state.seed, epoch);
                order_epoch = Some(epoch);
                tracing::info!(
                    "Starting epoch {}/{}",
                    epoch + 1,
                    self.config.training_loop.num_epochs
                );
            }

            let metrics = self.training_step(&order, epoch, batch_index)?;
            self.metrics.push(metrics);
            summary.steps_run += 1;
            summary.last_loss = Some(metrics.loss);

            pb.set_message(format!("loss {:.4}", metrics.loss));
            pb.inc(1);

            let due = self.events.due(metrics.step);
            if due.plot {
                self.state.losses.record_loss(metrics.step, metrics.loss);
                if let Some(path) = self
                    .instrumentation
                    .write_loss_plot(metrics.step, &self.state.losses)
                {
                    summary.plots.push(path);
                }
                tracing::info!(
                    "Step {}/{}, Epoch {}, Loss: {:.4}",
                    metrics.step,
                    total_steps,
                    epoch + 1,
                    metrics.loss
                );
            }
            if due.checkpoint {
                summary.checkpoints.push(self.save_checkpoint()?);
            }
            if due.validate {
                self.phase = TrainerPhase::Validating;
                if let Some(path) = self.instrumentation.generate_validation_image(
                    metrics.step,
                    &self.backend,
                    &self.state.adapters,
                ) {
                    summary.validation_images.push(path);
                }
            }
            self.phase = TrainerPhase::Running;
        }

        pb.finish_with_message("Training complete");

        if self.last_saved_step != Some(self.state.global_step) {
            summary.checkpoints.push(self.save_checkpoint()?);
        }
        summary.final_step = self.state.global_step;
        tracing::info!("Training complete at step {}", summary.final_step);
        Ok(summary)
    }

    /// One optimizer step over the `batch_index`-th batch of `order`.
    fn training_step(
        &mut self,
        order: &[usize],
        epoch: usize,
        batch_index: usize,
    ) -> Result<StepMetrics> {
        let step = self.state.global_step;
        let batch = self
            .dataset
            .batch(order, batch_index, self.config.training_loop.batch_size);
        let mut rng = step_rng(self.state.seed, step);

        let loss = LossEvaluator::new(&self.schedule).batch_loss(
            &self.backend,
            &self.state.adapters,
            &batch,
            &mut rng,
        )?;
        let value = f64::from(loss.to_dtype(DType::F32)?.to_scalar::<f32>()?);
        if !value.is_finite() {
            return Err(DreamboothError::Training(format!(
                "loss is not finite at step {}",
                step + 1
            )));
        }

        self.state.optimizer.update(&loss)?;
        self.state.global_step += 1;
        self.state.epoch = epoch;
        tracing::debug!(step = self.state.global_step, loss = value, "step");

        Ok(StepMetrics {
            step: self.state.global_step,
            epoch,
            loss: value,
        })
    }

    fn save_checkpoint(&mut self) -> Result<PathBuf> {
        self.phase = TrainerPhase::Checkpointing;
        let path = self
            .checkpoints
            .save(&self.state, &self.config, self.dataset.len())?;
        self.last_saved_step = Some(self.state.global_step);
        Ok(path)
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// The diffusion backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Encoded examples.
    #[must_use]
    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Current training state.
    #[must_use]
    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Trained adapters.
    #[must_use]
    pub fn adapters(&self) -> &AdapterRegistry {
        &self.state.adapters
    }

    /// Recorded losses.
    #[must_use]
    pub fn losses(&self) -> &LossHistory {
        &self.state.losses
    }

    /// Checkpoint manager of this run.
    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> TrainerPhase {
        self.phase
    }

    /// Metrics of every step taken by the last `train` call.
    #[must_use]
    pub fn metrics(&self) -> &[StepMetrics] {
        &self.metrics
    }

    /// Completed optimizer steps.
    #[must_use]
    pub fn step(&self) -> usize {
        self.state.global_step
    }

    /// Epoch of the last completed step.
    #[must_use]
    pub fn epoch(&self) -> usize {
        self.state.epoch
    }
}
