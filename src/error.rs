//! Error types for dreambooth-rs.
//!
//! Every fallible operation in the crate returns [`Result`]. Configuration
//! problems are reported before any training starts; checkpoint problems found
//! while resuming carry a [`CheckpointFault`] describing what exactly is wrong
//! with the archive.
//!
//! # Example - Pattern Matching
//!
//! ```rust
//! use dreambooth_rs::{DreamboothError, TrainingConfig};
//!
//! # fn main() {
//! match TrainingConfig::from_preset("landscape") {
//!     Ok(_) => println!("Loaded config"),
//!     Err(DreamboothError::Config(msg)) => {
//!         eprintln!("Configuration error: {}", msg);
//!     }
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # }
//! ```

use thiserror::Error;

/// Result type alias for dreambooth-rs operations.
pub type Result<T> = std::result::Result<T, DreamboothError>;

/// Errors that can occur in dreambooth-rs.
///
/// # Example
///
/// ```rust
/// use dreambooth_rs::{DreamboothError, Result};
///
/// fn validate_output(path: &str) -> Result<()> {
///     if path.is_empty() {
///         return Err(DreamboothError::Config("save.output_path is required".to_string()));
///     }
///     Ok(())
/// }
///
/// assert!(validate_output("").is_err());
/// assert!(validate_output("./out").is_ok());
/// ```
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DreamboothError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// Failure reported by the diffusion backend.
    #[error("backend error: {0}")]
    Backend(String),

    /// A checkpoint archive could not be restored.
    #[error("corrupt checkpoint: {0}")]
    CorruptCheckpoint(CheckpointFault),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Safetensors serialization error.
    #[error("safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    /// Zip archive error.
    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Image decoding or encoding error.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

/// What is wrong with a checkpoint archive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CheckpointFault {
    /// A required archive member is absent.
    #[error("missing member `{0}`")]
    MissingMember(String),

    /// A member exists but could not be decoded.
    #[error("malformed member `{member}`: {reason}")]
    Malformed {
        /// Archive member name.
        member: String,
        /// Decoder message.
        reason: String,
    },

    /// The archive was written by an incompatible format version.
    #[error("unsupported checkpoint version {found} (expected {expected})")]
    VersionMismatch {
        /// Version this build reads.
        expected: u32,
        /// Version recorded in the manifest.
        found: u32,
    },

    /// The archive was produced under different LoRA layer specs.
    #[error("LoRA layer spec mismatch: {0}")]
    SpecMismatch(String),

    /// A stored tensor does not have the shape the active config expects.
    #[error("shape mismatch for `{key}`: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        /// Tensor name.
        key: String,
        /// Shape required by the active config.
        expected: Vec<usize>,
        /// Shape stored in the archive.
        found: Vec<usize>,
    },

    /// The archive was produced over a dataset of a different size.
    #[error(
        "dataset mismatch: checkpoint recorded {recorded} examples, current dataset has {current}"
    )]
    DatasetMismatch {
        /// Example count stored in the manifest.
        recorded: usize,
        /// Example count of the dataset being resumed.
        current: usize,
    },
}

impl From<CheckpointFault> for DreamboothError {
    fn from(fault: CheckpointFault) -> Self {
        DreamboothError::CorruptCheckpoint(fault)
    }
}

impl From<indicatif::style::TemplateError> for DreamboothError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        DreamboothError::Template(err.to_string())
    }
}
