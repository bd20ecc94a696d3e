pub mod logger;
pub mod save;
pub mod schedule;
pub mod settings;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use crate::{
    data::BatchSource,
    error::{SessionError, TrainerError},
    network::LossMode,
    optimiser::OptimiserKind,
    session::{ComputeSession, SharedSession, StepConfig, StepMetrics},
};

use logger::ansi;
use save::{CheckpointPolicy, EvaluationResult, ModelSnapshot};
use schedule::{LrScheduler, Regime, StepTableLR, TrainingState};
use settings::{Flags, Hparams, Outputs};

/// A training step whose move accuracy exceeds this ends the chunk early.
pub const OVERFIT_ACCURACY: f32 = 0.7;
/// A block is written to the result log every this many batches.
pub const REPORT_EVERY: usize = 50;

/// Cooperative cancellation, checked after every batch.
#[derive(Clone, Debug, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TrainOutcome {
    Completed,
    /// Training stopped early because a step's move accuracy exceeded [`OVERFIT_ACCURACY`].
    Overfit { epoch: usize, batch: usize, accuracy: f32 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct TestOutcome {
    pub result: EvaluationResult,
    pub snapshot: Option<ModelSnapshot>,
}

pub struct Trainer {
    flags: Flags,
    session: SharedSession,
    state: TrainingState,
    checkpoints: CheckpointPolicy,
    outputs: Outputs,
    interrupt: Interrupt,
    resumed: bool,
}

impl Trainer {
    /// Builds the session and prepares every output location. If `flags.load_model_path`
    /// is set but cannot be loaded, the failure is logged and training starts from fresh weights.
    pub fn new(flags: Flags, hparams: Hparams) -> Result<Self, TrainerError> {
        flags.validate()?;

        let outputs = flags.outputs.prepare()?;
        let checkpoints = CheckpointPolicy::open(&flags.outputs.checkpoint_dir)?;
        let mut session = ComputeSession::new(flags.model, flags.optimiser, flags.shape, flags.batch_size, &hparams)?;

        let resumed = match &flags.load_model_path {
            Some(path) => {
                log::info!("Loading model from {}", path.display());
                let loaded = save::resolve_resume_path(path).and_then(|snapshot| {
                    session.load(&snapshot)?;
                    Ok(snapshot)
                });

                match loaded {
                    Ok(snapshot) => {
                        log::info!("Loaded {} at step {}", snapshot.display(), session.step());
                        true
                    }
                    Err(err) => {
                        log::error!("Loading model failed: {err}. Continuing with freshly initialised weights.");
                        false
                    }
                }
            }
            None => false,
        };

        let state = TrainingState::new(session.step());

        Ok(Self {
            flags,
            session: SharedSession::new(session),
            state,
            checkpoints,
            outputs,
            interrupt: Interrupt::default(),
            resumed,
        })
    }

    pub fn display(&self) {
        let session = self.session.lock();

        self.flags.display();
        session.hparams().display();
        println!("Network                : {}", ansi(session.network(), "32;1"));
        println!("Parameters             : {}", ansi(session.network().size(), 31));
        println!("Starting Step          : {}", ansi(self.state.cumulative_step(), 31));
        println!("LR (supervised)        : {}", StepTableLR::for_regime(Regime::Supervised).colourful());
        println!("LR (reinforcement)     : {}", StepTableLR::for_regime(Regime::Reinforcement).colourful());
    }

    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    pub fn state(&self) -> TrainingState {
        self.state
    }

    /// Handle for search and protocol clients to run inference against the trained weights.
    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    pub fn checkpoints(&self) -> &CheckpointPolicy {
        &self.checkpoints
    }

    pub fn interrupt_handle(&self) -> Interrupt {
        self.interrupt.clone()
    }

    /// Whether weights were restored from `flags.load_model_path`.
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    /// Runs `flags.num_epochs` passes of `data_size / batch_size` steps over `source`.
    ///
    /// `sparse` selects the supervised regime (one-hot targets, sparse cross-entropy);
    /// otherwise the reinforcement regime is used and `regime_sign` scales the policy term.
    pub fn train(
        &mut self,
        mut source: impl BatchSource,
        regime_sign: f32,
        sparse: bool,
    ) -> Result<TrainOutcome, TrainerError> {
        let regime = if sparse { Regime::Supervised } else { Regime::Reinforcement };
        self.state = TrainingState::with_regime(self.state.cumulative_step(), regime);

        log::info!("Training model...");

        let timer = Instant::now();
        let start = self.state.cumulative_step();
        let mut last = StepMetrics::default();

        let outcome = self.run_epochs(&mut source, regime_sign, &mut last);
        self.outputs.metrics.flush()?;

        let steps = self.state.cumulative_step() - start;
        logger::report_chunk_finished(
            self.state.cumulative_step(),
            last.loss,
            timer.elapsed().as_secs_f32(),
            steps as usize * self.flags.batch_size,
        );

        outcome
    }

    fn run_epochs(
        &mut self,
        source: &mut impl BatchSource,
        regime_sign: f32,
        last: &mut StepMetrics,
    ) -> Result<TrainOutcome, TrainerError> {
        let shape = self.flags.shape;
        let batch_size = self.flags.batch_size;
        let iterations = source.data_size() / batch_size;

        let (loss_mode, regime_sign) = match self.state.regime() {
            Regime::Supervised => (LossMode::Sparse, 1.0),
            Regime::Reinforcement => (LossMode::Dense, regime_sign),
        };

        for epoch in 0..self.flags.num_epochs {
            log::info!("Epoch {}", epoch + 1);

            for i in 0..iterations {
                let batch = source.next_batch(batch_size).encode(shape);
                let learning_rate = self.state.learning_rate();
                let config = StepConfig { learning_rate, loss_mode, regime_sign };

                let step = self.session.lock().train_step(&batch, config);

                match step {
                    Ok(metrics) => {
                        let completed = self.state.cumulative_step();
                        self.state.advance();
                        *last = metrics;

                        self.outputs.metrics.record(completed, &metrics, learning_rate)?;

                        if i % REPORT_EVERY == 0 {
                            self.report_step(i, completed, &metrics, learning_rate)?;
                        }

                        if metrics.move_accuracy > OVERFIT_ACCURACY {
                            log::warn!(
                                "Move accuracy {:.4} at epoch {} batch {i}, stopping this chunk",
                                metrics.move_accuracy,
                                epoch + 1
                            );
                            return Ok(TrainOutcome::Overfit { epoch, batch: i, accuracy: metrics.move_accuracy });
                        }
                    }
                    Err(SessionError::NumericInstability(reason)) => {
                        log::warn!("Step {} corrupts. Discard.", i + 1);
                        log::debug!("Step {} rejected: {reason}", i + 1);
                    }
                    Err(SessionError::Persistence(err)) => return Err(err.into()),
                }

                if self.interrupt.is_raised() {
                    log::warn!("Interrupted after batch {i} of epoch {}", epoch + 1);
                    return Err(TrainerError::Cancelled);
                }
            }
        }

        Ok(TrainOutcome::Completed)
    }

    fn report_step(&mut self, i: usize, step: u64, metrics: &StepMetrics, lr: f32) -> Result<(), TrainerError> {
        let out = &mut self.outputs.result;

        out.line("Training...")?;
        out.line(format!(
            "Step {i} | Training loss {:.2} | Temperature {:.2} | Magnitude of global norm {:.2} | Total step {step} | \
             Play move accuracy {:.4} | Game outcome accuracy {:.2}",
            metrics.loss, metrics.temperature, metrics.gradient_norm, metrics.move_accuracy, metrics.outcome_accuracy,
        ))?;

        if self.flags.optimiser == OptimiserKind::Adam {
            out.line("Learning rate Adam")?;
        } else {
            out.line(format!("Learning rate {lr}"))?;
        }

        Ok(())
    }

    /// Evaluates a proportion of `source` and hands the result to the checkpoint policy.
    /// Returns `None` if nothing could be evaluated.
    pub fn test(&mut self, source: impl BatchSource, proportion: f64) -> Result<Option<TestOutcome>, TrainerError> {
        log::info!("Running evaluation...");

        let session = self.session.lock();

        let Some(result) = save::evaluate(&session, source, proportion) else {
            log::warn!("No batches evaluated at proportion {proportion}, skipping checkpoint decision");
            return Ok(None);
        };

        let out = &mut self.outputs.result;
        out.line("Running evaluation...")?;
        out.line(format!("Test loss: {:.2}", result.mean_loss))?;
        out.line(format!("Play move test accuracy: {:.4}", result.mean_move_accuracy))?;
        out.line(format!("Win ratio test accuracy: {:.2}", result.mean_outcome_accuracy))?;

        log::info!(
            "test loss {} | move accuracy {} | outcome accuracy {}",
            ansi(format!("{:.4}", result.mean_loss), logger::num_cs()),
            ansi(format!("{:.4}", result.mean_move_accuracy), logger::num_cs()),
            ansi(format!("{:.4}", result.mean_outcome_accuracy), logger::num_cs()),
        );

        let snapshot = self.checkpoints.maybe_checkpoint(&session, &result, self.flags.force_save)?;

        Ok(Some(TestOutcome { result, snapshot }))
    }

    /// Appends a free-form line to the result log, for drivers that wrap the trainer.
    pub fn log_result(&mut self, line: impl AsRef<str>) -> Result<(), TrainerError> {
        self.outputs.result.line(line)?;
        Ok(())
    }
}
