use std::{
    fs::File,
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::Context;
use gozero::data::chunk;
use structopt::StructOpt;

#[derive(StructOpt)]
pub struct ShuffleOptions {
    #[structopt(required = true, short, long)]
    pub input: PathBuf,
    #[structopt(required = true, short, long)]
    pub output: PathBuf,
}

impl ShuffleOptions {
    pub fn run(&self) -> anyhow::Result<()> {
        println!("# [Shuffling Data]");
        let time = Instant::now();

        let mut data = chunk::read_chunk(&self.input).with_context(|| "Failed to read input.")?;

        validate_output_path(&self.output)
            .with_context(|| format!("Invalid output path: {}", self.output.display()))?;

        data.shuffle();

        chunk::write_chunk(&self.output, data.shape(), data.positions()).with_context(|| "Failed to write output.")?;

        println!("> Shuffled {} positions in {:.2} seconds.", data.positions().len(), time.elapsed().as_secs_f32());

        Ok(())
    }
}

/// Test if we can write to the output path
fn validate_output_path(path: &Path) -> anyhow::Result<()> {
    match File::create(path) {
        Ok(_) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("Cannot create file at specified path: {}", e)),
    }
}
