use std::{
    fs,
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::Context;
use gozero::{
    data::chunk,
    trainer::{logger, Interrupt},
    Flags, OutputPaths, TrainOutcome, Trainer, TrainerError, FORWARD, TEST_PROPORTION,
};
use rand::seq::SliceRandom;
use structopt::StructOpt;

use crate::ModelOptions;

/// Rotates over every `train<N>.chunk` in a data directory, evaluating `test.chunk` after each.
#[derive(StructOpt)]
pub struct TrainOptions {
    #[structopt(long = "dataset", default_value = "./processed_data")]
    pub data_dir: PathBuf,
    #[structopt(long = "global-epoch", default_value = "20")]
    pub global_epochs: usize,
    #[structopt(long = "n-epoch", default_value = "5")]
    pub epochs: usize,
    /// Recorded only, the schedule decides the rate.
    #[structopt(long, default_value = "0.1")]
    pub lr: f32,
    /// Recorded only.
    #[structopt(long = "lr-factor", default_value = "0.1")]
    pub lr_factor: f32,
    #[structopt(long = "force-save")]
    pub force_save: bool,
    /// Checkpoint directory or snapshot to resume from.
    #[structopt(long = "model-path")]
    pub load_model_path: Option<PathBuf>,
    /// Root for `savedmodels/`, `result.txt` and `train_log/`.
    #[structopt(long = "out-dir", default_value = ".")]
    pub out_dir: PathBuf,
    /// Train on self-play data: dense targets and the reinforcement schedule.
    #[structopt(long)]
    pub reinforce: bool,
    #[structopt(long, default_value = "1.0")]
    pub direction: f32,
    /// Colour-blind friendly output.
    #[structopt(long)]
    pub cbcs: bool,
    #[structopt(flatten)]
    pub model: ModelOptions,
}

impl TrainOptions {
    pub fn run(&self) -> anyhow::Result<()> {
        logger::set_cbcs(self.cbcs);

        let outputs = OutputPaths::in_dir(&self.out_dir);
        logger::init(&outputs.train_log_dir)?;

        let shape = self.model.shape()?;
        let flags = Flags {
            batch_size: self.model.batch_size,
            num_epochs: self.epochs,
            shape,
            lr: self.lr,
            lr_factor: self.lr_factor,
            force_save: self.force_save,
            optimiser: self.model.optimiser,
            model: self.model.model,
            load_model_path: self.load_model_path.clone(),
            outputs,
        };

        let mut trainer = Trainer::new(flags, self.model.hparams())?;
        trainer.display();
        listen_for_quit(trainer.interrupt_handle());

        let test_path = self.data_dir.join("test.chunk");
        let mut test = chunk::read_chunk_with_shape(&test_path, shape)
            .with_context(|| format!("Failed to read {}", test_path.display()))?;

        let mut files = training_chunks(&self.data_dir)?;
        anyhow::ensure!(!files.is_empty(), "No train<N>.chunk files in {}", self.data_dir.display());
        files.shuffle(&mut rand::thread_rng());

        let sign = if self.reinforce { self.direction } else { FORWARD };
        let mut global_step = 0;

        for global_epoch in 0..self.global_epochs {
            for file in &files {
                global_step += 1;
                trainer.log_result(format!("Using {}", file.display()))?;

                let mut data = chunk::read_chunk_with_shape(file, shape)
                    .with_context(|| format!("Failed to read {}", file.display()))?;
                data.shuffle();

                let timer = Instant::now();
                match trainer.train(&mut data, sign, !self.reinforce) {
                    Ok(TrainOutcome::Completed) => {}
                    Ok(TrainOutcome::Overfit { epoch, batch, accuracy }) => {
                        log::warn!("{} overfit at epoch {} batch {batch} ({accuracy:.4})", file.display(), epoch + 1);
                    }
                    Err(TrainerError::Cancelled) => {
                        log::warn!("Training interrupted, exiting");
                        std::process::exit(130);
                    }
                    Err(err) => return Err(err.into()),
                }
                log::info!("training: {:.3}", timer.elapsed().as_secs_f32());

                let timer = Instant::now();
                trainer.test(&mut test, TEST_PROPORTION)?;
                log::info!("test set evaluation: {:.3}", timer.elapsed().as_secs_f32());

                trainer.log_result(format!("Global step {global_step} finished."))?;
            }

            trainer.log_result(format!("Global epoch {global_epoch} finished."))?;
        }

        trainer.log_result("Now, I am the Master.")?;
        Ok(())
    }
}

/// Paths of every `train<N>.chunk` directly inside `dir`.
fn training_chunks(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in fs::read_dir(dir).with_context(|| format!("Cannot read data directory {}", dir.display()))? {
        let path = entry?.path();
        let is_chunk = path.file_name().and_then(|n| n.to_str()).is_some_and(is_training_chunk);

        if is_chunk {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

fn is_training_chunk(name: &str) -> bool {
    name.strip_prefix("train")
        .and_then(|rest| rest.strip_suffix(".chunk"))
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// Typing `Q` and enter stops training after the current batch.
fn listen_for_quit(interrupt: Interrupt) {
    std::thread::spawn(move || loop {
        let mut buffer = String::new();
        match std::io::stdin().read_line(&mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(_) if buffer.trim().eq_ignore_ascii_case("q") => {
                log::warn!("Interrupt requested, finishing current batch...");
                interrupt.raise();
                break;
            }
            Ok(_) => {}
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_names() {
        assert!(is_training_chunk("train0.chunk"));
        assert!(is_training_chunk("train123.chunk"));
        assert!(!is_training_chunk("train.chunk"));
        assert!(!is_training_chunk("test.chunk"));
        assert!(!is_training_chunk("train1.chunk.gz"));
        assert!(!is_training_chunk("trainx.chunk"));
    }
}
