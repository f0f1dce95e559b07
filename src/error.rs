use std::path::PathBuf;

use thiserror::Error;

use crate::cli::CliError;
use crate::config::ConfigError;
use crate::engine::EngineError;

/// Terminal failure of a `start` invocation. None of these are retried.
#[derive(Debug, Error)]
pub enum LaunchFailure {
    #[error(transparent)]
    Cli(#[from] CliError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid image reference {reference:?}: {reason}")]
    ImageResolution { reference: String, reason: String },

    #[error("failed to pull image {reference}")]
    Pull {
        reference: String,
        #[source]
        source: EngineError,
    },

    #[error("failed to read connection file {}", path.display())]
    SpecRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse connection file {}: {reason}", path.display())]
    SpecParse { path: PathBuf, reason: String },

    #[error("failed to write connection file {}", path.display())]
    SpecWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to launch kernel container from {image}")]
    Launch {
        image: String,
        #[source]
        source: EngineError,
    },
}

impl LaunchFailure {
    /// Process exit status reported for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchFailure::Cli(_) => 2,
            LaunchFailure::Config(_) => 3,
            LaunchFailure::ImageResolution { .. } => 4,
            LaunchFailure::Pull { .. } => 5,
            LaunchFailure::SpecRead { .. } => 6,
            LaunchFailure::SpecParse { .. } => 7,
            LaunchFailure::SpecWrite { .. } => 8,
            LaunchFailure::Launch { .. } => 9,
        }
    }
}
