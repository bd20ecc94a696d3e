pub mod data;
pub mod error;
pub mod network;
pub mod optimiser;
pub mod rng;
pub mod session;
pub mod trainer;
pub mod util;

pub use data::{Batch, BatchSource, BoardShape, DataSet, EncodedBatch, Position};
pub use error::{ChunkError, ConfigError, PersistenceError, SessionError, TrainerError};
pub use network::ModelKind;
pub use optimiser::OptimiserKind;
pub use session::{ComputeSession, Inference, SharedSession};
pub use trainer::{
    schedule::{Regime, TrainingState},
    settings::{Flags, Hparams, OutputPaths},
    Interrupt, TestOutcome, TrainOutcome, Trainer,
};

/// Policy term sign for supervised data and winning self-play games.
pub const FORWARD: f32 = 1.0;

/// Proportion of the test set evaluated after each training chunk.
pub const TEST_PROPORTION: f64 = 0.1;
