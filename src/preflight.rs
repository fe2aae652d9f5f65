//! Environment checks run before training starts.
//!
//! [`TrainingConfig::validate`] only looks at the config itself. These checks
//! touch the filesystem: the examples must exist, and the output directory
//! must be writable with room for checkpoint archives.

use std::fs;
use std::path::Path;

use tracing::warn;

use crate::checkpoint::CheckpointManager;
use crate::config::TrainingConfig;
use crate::dataset::Dataset;
use crate::error::{DreamboothError, Result};

/// Parameters of the Flux transformer, in billions.
const FLUX_PARAMS_B: f64 = 12.0;
/// Activations, text encoders and VAE on top of the transformer weights.
const RUNTIME_OVERHEAD_GB: f64 = 6.0;
/// Estimates above this get a warning.
const HIGH_MEMORY_GB: f64 = 32.0;
/// Free space at the output path below this is an error.
const MIN_FREE_DISK_GB: f64 = 5.0;
/// Free space at the output path below this gets a warning.
const LOW_FREE_DISK_GB: f64 = 10.0;
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

const WRITE_PROBE: &str = ".write_test";

/// Outcome of the preflight checks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreflightReport {
    /// Problems that prevent training.
    pub errors: Vec<String>,
    /// Problems worth knowing about.
    pub warnings: Vec<String>,
    /// Rough peak memory estimate in GB.
    pub estimated_memory_gb: f64,
    /// Free space at the output path in GB, when it could be read.
    pub available_disk_gb: Option<f64>,
}

impl PreflightReport {
    /// True when nothing prevents training.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Convert collected errors into a configuration error.
    pub fn into_result(self) -> Result<Self> {
        if self.errors.is_empty() {
            Ok(self)
        } else {
            Err(DreamboothError::Config(self.errors.join("; ")))
        }
    }
}

/// Rough peak memory for training with `quantize` bits and adapters of `max_rank`.
#[must_use]
pub fn estimate_memory_gb(quantize: Option<u8>, max_rank: usize) -> f64 {
    let bits = f64::from(quantize.unwrap_or(16));
    let weights = FLUX_PARAMS_B * bits / 8.0;
    // adapter weights plus two Adam moments, fp32
    let adapters = max_rank as f64 * 0.05;
    weights + adapters + RUNTIME_OVERHEAD_GB
}

/// Run every check for `config`.
#[must_use]
pub fn run_checks(config: &TrainingConfig) -> PreflightReport {
    let mut report = PreflightReport {
        estimated_memory_gb: estimate_memory_gb(config.quantize, config.lora_layers.max_rank()),
        ..PreflightReport::default()
    };

    check_examples(config, &mut report);
    check_output_dir(config, &mut report);

    if report.estimated_memory_gb > HIGH_MEMORY_GB {
        report.warnings.push(format!(
            "estimated memory use is ~{:.0}GB; consider `quantize` or a lower `lora_rank`",
            report.estimated_memory_gb
        ));
    }

    for warning in &report.warnings {
        warn!("{warning}");
    }
    report
}

fn check_examples(config: &TrainingConfig, report: &mut PreflightReport) {
    let dir = config.examples_dir();
    if !dir.is_dir() {
        report.errors.push(format!(
            "examples.path: directory {} does not exist",
            dir.display()
        ));
        return;
    }

    let examples = Dataset::resolve(config);
    let missing: Vec<_> = examples.iter().filter(|e| !e.image.is_file()).collect();
    if !examples.is_empty() && missing.len() == examples.len() {
        report
            .errors
            .push("examples.images: none of the configured images exist".to_string());
    } else {
        for example in missing {
            report.warnings.push(format!(
                "examples.images: {} not found and will be skipped",
                example.image.display()
            ));
        }
    }
}

fn check_output_dir(config: &TrainingConfig, report: &mut PreflightReport) {
    let output = &config.save.output_path;
    if let Err(e) = probe_writable(output) {
        report.errors.push(format!(
            "save.output_path: cannot write to {}: {e}",
            output.display()
        ));
        return;
    }

    match fs4::available_space(output) {
        Ok(bytes) => check_free_space(bytes as f64 / BYTES_PER_GB, report),
        Err(e) => report
            .warnings
            .push(format!("save.output_path: could not read free disk space: {e}")),
    }

    match CheckpointManager::from_config(config).list() {
        Ok(existing) if !existing.is_empty() => report.warnings.push(format!(
            "save.output_path: {} already holds {} checkpoint(s); \
             resume from the latest or use a new directory",
            output.display(),
            existing.len()
        )),
        Ok(_) => {}
        Err(e) => report
            .warnings
            .push(format!("save.output_path: could not list checkpoints: {e}")),
    }
}

fn check_free_space(available_gb: f64, report: &mut PreflightReport) {
    report.available_disk_gb = Some(available_gb);
    if available_gb < MIN_FREE_DISK_GB {
        report.errors.push(format!(
            "save.output_path: only {available_gb:.1}GB free, \
             at least {MIN_FREE_DISK_GB:.0}GB needed"
        ));
    } else if available_gb < LOW_FREE_DISK_GB {
        report.warnings.push(format!(
            "save.output_path: only {available_gb:.1}GB free; checkpoints may fill the disk"
        ));
    }
}

fn probe_writable(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    let probe = dir.join(WRITE_PROBE);
    fs::write(&probe, b"")?;
    fs::remove_file(probe)
}
