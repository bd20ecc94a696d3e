use anyhow::Context;
use gozero::{data::chunk, Position};
use structopt::StructOpt;

use std::{path::PathBuf, time::Instant};

#[derive(StructOpt)]
pub struct ValidateOptions {
    #[structopt(required = true, short, long)]
    input: PathBuf,
}

const MSGS: [&str; 4] = [
    "Feature value not 0 or 1",
    "Non-finite or negative policy",
    "Policy does not sum to 1",
    "Outcome not 0 or 1",
];

fn problems(pos: &Position) -> [bool; 4] {
    let policy_ok = pos.policy.iter().all(|p| p.is_finite() && *p >= 0.0);
    let sum: f32 = pos.policy.iter().sum();

    [
        pos.features.iter().any(|&x| x > 1),
        !policy_ok,
        policy_ok && (sum - 1.0).abs() > 1e-3,
        pos.outcome != 0.0 && pos.outcome != 1.0,
    ]
}

impl ValidateOptions {
    pub fn run(&self) -> anyhow::Result<()> {
        let timer = Instant::now();
        let data = chunk::read_chunk(&self.input).with_context(|| "Failed to read chunk.")?;

        let mut invalid = [0u64; 4];
        let mut wins = 0u64;
        let mut found = false;

        for pos in data.positions() {
            for (count, bad) in invalid.iter_mut().zip(problems(pos)) {
                if bad {
                    *count += 1;

                    if !found {
                        found = true;
                        println!("There is at least one invalid position!");
                    }
                }
            }

            if pos.outcome == 1.0 {
                wins += 1;
            }
        }

        println!();
        println!("SUMMARY:");

        let total = data.positions().len() as u64;
        println!("Board {} | Checked {total} Positions in {:.2} seconds", data.shape(), timer.elapsed().as_secs_f32());
        if total > 0 {
            println!("Wins for side to move: {}%", wins * 100 / total);
        }

        let total_invalid = invalid.iter().sum::<u64>();
        if total_invalid > 0 {
            println!();
            println!("ERRORS:");
            for (&count, msg) in invalid.iter().zip(MSGS.iter()) {
                println!("{msg: <35} : {count}");
            }
            println!("--------------------------------");
            println!("Total errors: {total_invalid}");
            println!("Note this is total errors, 1 position may contribute multiple.")
        } else {
            println!("No invalid positions!")
        }

        Ok(())
    }
}
