use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::PathBuf,
};

use super::logger::ansi;
use crate::{
    data::BoardShape, error::ConfigError, network::ModelKind, optimiser::OptimiserKind, session::StepMetrics,
};

/// Run-level configuration, fixed for the lifetime of a [`super::Trainer`].
#[derive(Clone, Debug)]
pub struct Flags {
    pub batch_size: usize,
    pub num_epochs: usize,
    pub shape: BoardShape,
    /// Recorded and displayed only: the rate actually used always comes from the schedule.
    pub lr: f32,
    /// Recorded and displayed only.
    pub lr_factor: f32,
    /// Snapshot after every evaluation regardless of accuracy.
    pub force_save: bool,
    pub optimiser: OptimiserKind,
    pub model: ModelKind,
    /// Checkpoint directory (containing `checkpoints.json`) or a single snapshot to resume from.
    pub load_model_path: Option<PathBuf>,
    pub outputs: OutputPaths,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            batch_size: 64,
            num_epochs: 5,
            shape: BoardShape::GO,
            lr: 0.1,
            lr_factor: 0.1,
            force_save: false,
            optimiser: OptimiserKind::Momentum,
            model: ModelKind::Relu,
            load_model_path: None,
            outputs: OutputPaths::default(),
        }
    }
}

impl Flags {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }

        BoardShape::new(self.shape.rows, self.shape.cols, self.shape.channels, self.shape.classes)?;
        Ok(())
    }

    pub fn display(&self) {
        println!("Model                  : {}", ansi(self.model, "32;1"));
        println!("Optimiser              : {}", ansi(self.optimiser, "32;1"));
        println!("Board / Moves          : {}", ansi(self.shape, 31));
        println!("Batch Size             : {}", ansi(self.batch_size, 31));
        println!("Epochs / Chunk         : {}", ansi(self.num_epochs, 31));
        println!("Initial LR (unused)    : {}", ansi(self.lr, 31));
        println!("LR Factor (unused)     : {}", ansi(self.lr_factor, 31));
        println!("Force Save             : {}", ansi(self.force_save, 31));
        if let Some(path) = &self.load_model_path {
            println!("Resume From            : {}", ansi(path.display(), "32;1"));
        }
        self.outputs.display();
    }
}

/// Predictor and update-rule hyperparameters.
#[derive(Clone, Debug, PartialEq)]
pub struct Hparams {
    pub hidden: usize,
    pub residual_units: usize,
    pub weight_decay: f32,
    pub relu_leakiness: f32,
    /// Momentum coefficient for [`OptimiserKind::Momentum`].
    pub momentum: f32,
    pub temperature: f32,
    /// Gradients are rescaled so their global L2 norm never exceeds this.
    pub global_norm: f32,
    /// Threads to split a batch across inside a single step.
    pub threads: usize,
    /// Fixed seed for weight initialisation, entropy if `None`.
    pub seed: Option<u64>,
    pub gaussian_init: bool,
}

impl Default for Hparams {
    fn default() -> Self {
        Self {
            hidden: 256,
            residual_units: 1,
            weight_decay: 1e-4,
            relu_leakiness: 0.1,
            momentum: 0.9,
            temperature: 1.0,
            global_norm: 100.0,
            threads: std::thread::available_parallelism().map_or(1, usize::from),
            seed: None,
            gaussian_init: false,
        }
    }
}

impl Hparams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(ConfigError::InvalidHparam(format!("temperature must be positive, got {}", self.temperature)));
        }

        if !(self.global_norm.is_finite() && self.global_norm > 0.0) {
            return Err(ConfigError::InvalidHparam(format!("global norm must be positive, got {}", self.global_norm)));
        }

        if self.hidden == 0 || self.threads == 0 {
            return Err(ConfigError::InvalidHparam("hidden width and threads must be positive".to_string()));
        }

        Ok(())
    }

    pub fn display(&self) {
        println!("Hidden Width           : {}", ansi(self.hidden, 31));
        println!("Residual Units         : {}", ansi(self.residual_units, 31));
        println!("Weight Decay           : {}", ansi(self.weight_decay, 31));
        println!("ReLU Leakiness         : {}", ansi(self.relu_leakiness, 31));
        println!("Temperature            : {}", ansi(self.temperature, 31));
        println!("Global Norm            : {}", ansi(self.global_norm, 31));
        println!("Threads                : {}", ansi(self.threads, 31));
    }
}

/// Where a run writes its results.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputPaths {
    pub checkpoint_dir: PathBuf,
    pub result_log: PathBuf,
    pub train_log_dir: PathBuf,
}

impl Default for OutputPaths {
    fn default() -> Self {
        Self::in_dir(".")
    }
}

impl OutputPaths {
    pub const METRICS_FILE: &'static str = "metrics.csv";

    /// The usual layout under `root`: `savedmodels/`, `result.txt` and `train_log/`.
    pub fn in_dir(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            checkpoint_dir: root.join("savedmodels"),
            result_log: root.join("result.txt"),
            train_log_dir: root.join("train_log"),
        }
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.train_log_dir.join(Self::METRICS_FILE)
    }

    /// Creates every output location (idempotently) and opens the append-only logs.
    pub fn prepare(&self) -> io::Result<Outputs> {
        fs::create_dir_all(&self.checkpoint_dir)?;
        fs::create_dir_all(&self.train_log_dir)?;

        if let Some(parent) = self.result_log.parent() {
            fs::create_dir_all(parent)?;
        }

        let result = ResultLog::open(&self.result_log)?;
        let metrics = MetricsLog::open(self.metrics_path())?;

        Ok(Outputs { result, metrics })
    }

    pub fn display(&self) {
        println!("Checkpoints            : {}", ansi(self.checkpoint_dir.display(), "32;1"));
        println!("Result Log             : {}", ansi(self.result_log.display(), "32;1"));
        println!("Train Log              : {}", ansi(self.train_log_dir.display(), "32;1"));
    }
}

/// The opened log handles of a run.
pub struct Outputs {
    pub result: ResultLog,
    pub metrics: MetricsLog,
}

/// Human-readable progress, appended to and flushed line by line.
pub struct ResultLog {
    path: PathBuf,
    file: File,
}

impl ResultLog {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn line(&mut self, text: impl AsRef<str>) -> io::Result<()> {
        writeln!(self.file, "{}", text.as_ref())?;
        self.file.flush()
    }
}

/// One CSV row per completed training step.
pub struct MetricsLog {
    writer: BufWriter<File>,
}

impl MetricsLog {
    pub const HEADER: &'static str = "step,loss,move_accuracy,outcome_accuracy,gradient_norm,temperature,learning_rate";

    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let fresh = fs::metadata(&path).map_or(true, |m| m.len() == 0);

        let mut writer = BufWriter::new(OpenOptions::new().create(true).append(true).open(&path)?);
        if fresh {
            writeln!(writer, "{}", Self::HEADER)?;
        }

        Ok(Self { writer })
    }

    pub fn record(&mut self, step: u64, metrics: &StepMetrics, learning_rate: f32) -> io::Result<()> {
        writeln!(
            self.writer,
            "{step},{},{},{},{},{},{learning_rate}",
            metrics.loss, metrics.move_accuracy, metrics.outcome_accuracy, metrics.gradient_norm, metrics.temperature,
        )
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
