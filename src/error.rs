use std::{io, path::PathBuf};

use thiserror::Error;

/// Fatal problems with the configuration surface, raised at construction.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown model variant `{0}` (expected one of: relu, elu)")]
    UnknownModel(String),
    #[error("unknown optimiser `{0}` (expected one of: sgd, mom, adam)")]
    UnknownOptimiser(String),
    #[error("invalid shape: {0}")]
    InvalidShape(String),
    #[error("batch size must be positive")]
    ZeroBatchSize,
    #[error("invalid hyperparameter: {0}")]
    InvalidHparam(String),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("checkpoint not found at {}", .0.display())]
    Missing(PathBuf),
    #[error("checkpoint at {} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("checkpoint metadata: {0}")]
    Format(#[from] serde_json::Error),
    #[error("checkpoint io: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// The batch could not be processed: non-finite values, wrong lengths, or a forward
    /// pass that blew up. Nothing was mutated.
    #[error("numerically invalid batch: {0}")]
    NumericInstability(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("chunk io: {0}")]
    Io(#[from] io::Error),
    #[error("bad chunk header: {0}")]
    BadHeader(String),
    #[error("chunk shape {found} does not match expected {expected}")]
    ShapeMismatch { expected: String, found: String },
}

#[derive(Debug, Error)]
pub enum TrainerError {
    #[error("training interrupted")]
    Cancelled,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("output io: {0}")]
    Io(#[from] io::Error),
    #[error("logger: {0}")]
    Logger(#[from] log::SetLoggerError),
}
