mod evaluate;
mod graph;
mod shuffle;
mod train;
mod validate;

use gozero::{BoardShape, Hparams, ModelKind, OptimiserKind};
use structopt::StructOpt;

#[derive(StructOpt)]
pub enum Options {
    Train(train::TrainOptions),
    Evaluate(evaluate::EvaluateOptions),
    Graph(graph::GraphOptions),
    Shuffle(shuffle::ShuffleOptions),
    Validate(validate::ValidateOptions),
}

fn main() -> anyhow::Result<()> {
    match Options::from_args() {
        Options::Train(options) => options.run(),
        Options::Evaluate(options) => options.run(),
        Options::Graph(options) => options.run(),
        Options::Shuffle(options) => options.run(),
        Options::Validate(options) => options.run(),
    }
}

/// Architecture and board options shared by every command that builds a network.
#[derive(StructOpt)]
pub struct ModelOptions {
    #[structopt(long = "n-img-row", default_value = "19")]
    pub rows: usize,
    #[structopt(long = "n-img-col", default_value = "19")]
    pub cols: usize,
    #[structopt(long = "n-img-channels", default_value = "17")]
    pub channels: usize,
    #[structopt(long = "n-classes", default_value = "362")]
    pub classes: usize,
    #[structopt(long = "n-batch", default_value = "64")]
    pub batch_size: usize,
    /// relu | elu
    #[structopt(long = "model-type", default_value = "relu")]
    pub model: ModelKind,
    /// sgd | mom | adam
    #[structopt(long, default_value = "mom")]
    pub optimiser: OptimiserKind,
    #[structopt(long, default_value = "256")]
    pub hidden: usize,
    #[structopt(long = "n-resid-units", default_value = "1")]
    pub residual_units: usize,
    #[structopt(long)]
    pub threads: Option<usize>,
    #[structopt(long)]
    pub seed: Option<u64>,
}

impl ModelOptions {
    pub fn shape(&self) -> anyhow::Result<BoardShape> {
        Ok(BoardShape::new(self.rows, self.cols, self.channels, self.classes)?)
    }

    pub fn hparams(&self) -> Hparams {
        let defaults = Hparams::default();
        Hparams {
            hidden: self.hidden,
            residual_units: self.residual_units,
            threads: self.threads.unwrap_or(defaults.threads),
            seed: self.seed,
            ..defaults
        }
    }
}
