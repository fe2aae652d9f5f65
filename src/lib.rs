//! # dreambooth-rs
//!
//! LoRA fine-tuning engine for Flux-style diffusion transformers.
//!
//! A small set of (image, prompt) pairs teaches the model a new subject or
//! style that later prompts address through a trigger word such as `sks`.
//! Only low-rank adapters are trained; the base model stays frozen behind the
//! [`DiffusionBackend`](model::DiffusionBackend) trait.
//!
//! ## Features
//!
//! - **JSON Configuration** - One file describes the model, examples and adapters
//! - **Layer Selection** - Adapt any block range and layer types of either block group
//! - **Rectified Flow Loss** - The flow-matching objective Flux was trained with
//! - **Resumable** - Zip checkpoints restore adapters, optimizer and step counters exactly
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Generate a config for the images in ./photos
//! dreambooth init config.json --template pet --images ./photos --subject rex
//!
//! # Validate configuration
//! dreambooth validate config.json
//!
//! # Show what a checkpoint holds
//! dreambooth inspect outputs/dreambooth_rex/_checkpoints/0000040_checkpoint.zip
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use dreambooth_rs::mocks::MockBackend;
//! use dreambooth_rs::Trainer;
//!
//! # fn main() -> dreambooth_rs::Result<()> {
//! // Any DiffusionBackend works; the mock trains on the CPU in seconds
//! let backend = MockBackend::new(42)?;
//! let mut trainer = Trainer::start("config.json", backend)?;
//! trainer.train()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Using Templates
//!
//! ```rust
//! use dreambooth_rs::TrainingConfig;
//!
//! # fn main() -> dreambooth_rs::Result<()> {
//! let mut config = TrainingConfig::from_preset("style")?;
//! config.training_loop.num_epochs = 50;
//! config.optimizer.learning_rate = 2e-4;
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod error;
pub mod instrumentation;
pub mod lora;
pub mod loss;
pub mod model;
pub mod optimizer;
pub mod preflight;
pub mod schedule;
pub mod state;
pub mod trainer;

// Mock backend for testing without model weights
#[cfg(any(test, feature = "mock-backend"))]
pub mod mocks;

pub use config::TrainingConfig;
pub use error::{DreamboothError, Result};
pub use trainer::Trainer;
