//! CLI entry point for dreambooth-rs.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dreambooth_rs::checkpoint::Checkpoint;
use dreambooth_rs::config::ConfigTemplate;
use dreambooth_rs::dataset::{scan_images, Dataset};
use dreambooth_rs::lora::LoraLayerSelector;
use dreambooth_rs::model::Architecture;
use dreambooth_rs::{preflight, DreamboothError, Result, TrainingConfig};

#[derive(Parser)]
#[command(name = "dreambooth")]
#[command(about = "LoRA fine-tuning toolkit for Flux diffusion transformers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file and the environment it points at
    Validate {
        /// Path to configuration file
        config: PathBuf,
    },
    /// Generate a configuration file from a template
    Init {
        /// Output path for config file
        #[arg(default_value = "config.json")]
        output: PathBuf,
        /// Template (pet, person, style, object)
        #[arg(long, default_value = "pet")]
        template: String,
        /// Directory of training images to list in the config
        #[arg(long)]
        images: Option<PathBuf>,
        /// Subject name used in prompts and the output directory
        #[arg(long)]
        subject: Option<String>,
    },
    /// Print the manifest of a checkpoint archive
    Inspect {
        /// Path to checkpoint archive
        checkpoint: PathBuf,
        /// Print the raw manifest as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config.display());
            let config = TrainingConfig::from_file(&config)?;
            config.validate()?;

            let report = preflight::run_checks(&config);
            for warning in config.validation_warnings().iter().chain(&report.warnings) {
                println!("  ! {warning}");
            }
            let report = report.into_result()?;

            let architecture = Architecture::flux();
            let adapters = LoraLayerSelector::new(&architecture).plan(config.lora_layers.specs())?;
            println!("✓ Configuration is valid");
            println!("  Model: {}", config.model);
            println!("  Examples: {}", Dataset::resolve(&config).len());
            println!("  Adapters: {}", adapters.len());
            println!("  Estimated memory: ~{:.0}GB", report.estimated_memory_gb);
            if let Some(free) = report.available_disk_gb {
                println!("  Free disk: ~{free:.0}GB");
            }
            println!("  Output: {}", config.save.output_path.display());
        }
        Commands::Init {
            output,
            template,
            images,
            subject,
        } => {
            tracing::info!("Generating config for template: {}", template);
            let template: ConfigTemplate = template.parse()?;
            let subject = subject.as_deref().unwrap_or(template.default_subject());
            let (image_dir, files) = match images {
                Some(dir) => {
                    let files = scan_images(&dir)?;
                    if files.is_empty() {
                        return Err(DreamboothError::Config(format!(
                            "no .jpg, .jpeg or .png images found in {}",
                            dir.display()
                        )));
                    }
                    (dir, files)
                }
                None => (PathBuf::from("./images"), vec![PathBuf::from("image_01.jpg")]),
            };
            let config = TrainingConfig::from_template(template, subject, image_dir, files);
            config.to_file(&output)?;
            println!("✓ Configuration written to: {}", output.display());
            println!("  Images: {}", config.examples.images.len());
            println!("  Output: {}", config.save.output_path.display());
        }
        Commands::Inspect { checkpoint, json } => {
            let manifest = Checkpoint::inspect(&checkpoint)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&manifest)?);
            } else {
                println!("Checkpoint: {}", checkpoint.display());
                println!("  Format: {} v{}", manifest.format, manifest.version);
                println!("  Created: {}", manifest.created_at);
                println!("  Step: {} (epoch {})", manifest.global_step, manifest.epoch + 1);
                println!("  Seed: {}", manifest.seed);
                println!("  Examples: {}", manifest.dataset_len);
                println!(
                    "  Adapters: {} ({} parameters)",
                    manifest.adapter_count, manifest.trainable_params
                );
                println!(
                    "  Optimizer: {:?}, lr {:e}, {} updates",
                    manifest.optimizer.name,
                    manifest.optimizer.learning_rate,
                    manifest.optimizer.step_count
                );
                for spec in manifest.lora_layers.specs() {
                    println!(
                        "  {}: blocks {}, rank {}, {}",
                        spec.group,
                        spec.block_range,
                        spec.lora_rank,
                        spec.layer_types.join(", ")
                    );
                }
            }
        }
    }

    Ok(())
}
