use std::{path::PathBuf, time::Instant};

use anyhow::Context;
use gozero::{data::chunk, trainer::save, ComputeSession};
use structopt::StructOpt;

use crate::ModelOptions;

#[derive(StructOpt)]
pub struct EvaluateOptions {
    /// Checkpoint directory or snapshot.
    #[structopt(required = true, short, long)]
    pub checkpoint: PathBuf,
    #[structopt(required = true, short, long)]
    pub input: PathBuf,
    #[structopt(long, default_value = "1.0")]
    pub proportion: f64,
    #[structopt(flatten)]
    pub model: ModelOptions,
}

impl EvaluateOptions {
    pub fn run(&self) -> anyhow::Result<()> {
        let shape = self.model.shape()?;
        let mut session = ComputeSession::new(
            self.model.model,
            self.model.optimiser,
            shape,
            self.model.batch_size,
            &self.model.hparams(),
        )?;

        let snapshot = save::resolve_resume_path(&self.checkpoint)?;
        session.load(&snapshot).with_context(|| format!("Failed to load {}", snapshot.display()))?;

        let data = chunk::read_chunk_with_shape(&self.input, shape)
            .with_context(|| format!("Failed to read {}", self.input.display()))?;

        println!("# [Evaluating {} at step {}]", snapshot.display(), session.step());
        let timer = Instant::now();

        let result = save::evaluate(&session, data, self.proportion)
            .with_context(|| "Not enough valid positions to evaluate a single batch.")?;

        println!("Batches evaluated       : {}", result.batches_evaluated);
        println!("Test loss               : {:.4}", result.mean_loss);
        println!("Play move accuracy      : {:.4}", result.mean_move_accuracy);
        println!("Game outcome accuracy   : {:.4}", result.mean_outcome_accuracy);
        println!("> Took {:.2} seconds.", timer.elapsed().as_secs_f32());

        Ok(())
    }
}
