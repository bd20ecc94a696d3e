use std::{
    fmt::Display,
    fs::{self, OpenOptions},
    path::Path,
    sync::atomic::{AtomicBool, Ordering::SeqCst},
};

use log::LevelFilter;
use simplelog::{ColorChoice, CombinedLogger, ConfigBuilder, TermLogger, TerminalMode, WriteLogger};

use crate::error::TrainerError;

pub const LOG_FILE: &str = "gozero.log";

static CBCS: AtomicBool = AtomicBool::new(false);

pub fn ansi<T: Display, U: Display>(x: T, y: U) -> String {
    format!("\x1b[{y}m{x}\x1b[0m{}", esc())
}

pub fn set_cbcs(val: bool) {
    CBCS.store(val, SeqCst)
}

pub fn num_cs() -> i32 {
    if CBCS.load(SeqCst) {
        35
    } else {
        36
    }
}

fn esc() -> &'static str {
    if CBCS.load(SeqCst) {
        "\x1b[38;5;225m"
    } else {
        ""
    }
}

/// Installs the global logger: Info and above to the terminal, Debug and above appended to
/// `gozero.log` in `dir`. Fails if a logger is already installed.
pub fn init(dir: impl AsRef<Path>) -> Result<(), TrainerError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;

    let config = ConfigBuilder::new()
        .set_location_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off)
        .set_thread_level(LevelFilter::Off)
        .build();

    let file = OpenOptions::new().create(true).append(true).open(dir.join(LOG_FILE))?;

    let term = TermLogger::new(LevelFilter::Info, config.clone(), TerminalMode::Mixed, ColorChoice::Auto);
    let file = WriteLogger::new(LevelFilter::Debug, config, file);

    CombinedLogger::init(vec![term, file])?;
    Ok(())
}

pub fn seconds_to_hms(mut seconds: u32) -> (u32, u32, u32) {
    let mut minutes = seconds / 60;
    let hours = minutes / 60;
    seconds -= minutes * 60;
    minutes -= hours * 60;

    (hours, minutes, seconds)
}

/// One-line progress report for a finished chunk of training.
pub fn report_chunk_finished(steps: u64, loss: f32, elapsed: f32, positions: usize) {
    let num_cs = num_cs();
    let pos_per_sec = positions as f32 / elapsed.max(f32::EPSILON);
    let (hours, minutes, seconds) = seconds_to_hms(elapsed as u32);

    log::info!(
        "total step {} | last loss {} | {} pos/sec | time {}h {}m {}s",
        ansi(steps, num_cs),
        ansi(format!("{loss:.4}"), num_cs),
        ansi(format!("{pos_per_sec:.0}"), num_cs),
        ansi(hours, num_cs),
        ansi(minutes, num_cs),
        ansi(seconds, num_cs),
    );
}
