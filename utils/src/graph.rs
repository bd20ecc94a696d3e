use anyhow::{bail, Context};
use gozero::trainer::settings::MetricsLog;
use structopt::StructOpt;

use std::{
    ffi::OsStr,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use plotters::prelude::*;

/// Plots loss and move accuracy from one or more `metrics.csv` files.
#[derive(StructOpt)]
pub struct GraphOptions {
    /// Files to process
    #[structopt(name = "FILE", parse(from_os_str))]
    files: Vec<PathBuf>,
    #[structopt(long, default_value = "visualisation/plots")]
    out_dir: PathBuf,
    #[structopt(long, default_value = "50")]
    window: usize,
}

const COLOURS: &[RGBColor] = &[
    RGBColor(31, 119, 180),
    RGBColor(255, 127, 14),
    RGBColor(44, 160, 44),
    RGBColor(214, 39, 40),
    RGBColor(148, 103, 189),
    RGBColor(140, 86, 75),
];

const CHART_BG_COLOUR: RGBAColor = RGBAColor(234, 234, 242, 1.0);
const FONT: &str = "sans-serif";
const IMG_DIMS: (u32, u32) = (1920, 1080);
const NOISY_PLOT_OPACITY: f64 = 0.15;

/// `(step, loss, move_accuracy)` per row.
type Series = Vec<(u64, f64, f64)>;

/// Calculates the simple moving average of one column
fn moving_average(data: &[(u64, f64)], window_size: usize) -> Vec<(u64, f64)> {
    let window_size = window_size.clamp(1, data.len().max(1));
    data.windows(window_size)
        .map(|window| {
            let mean = window.iter().map(|p| p.1).sum::<f64>() / window_size as f64;
            (window[window_size / 2].0, mean)
        })
        .collect()
}

fn read_metrics(path: &Path) -> anyhow::Result<Series> {
    let file = std::fs::File::open(path).with_context(|| format!("Failed to open {}.", path.display()))?;
    let mut lines = BufReader::new(file).lines();

    let header = lines.next().transpose()?;
    if header.as_deref() != Some(MetricsLog::HEADER) {
        bail!("{} is not a metrics log (expected header `{}`)", path.display(), MetricsLog::HEADER);
    }

    lines
        .enumerate()
        .map(|(line_no, line)| {
            let line = line?;
            let fields: Vec<&str> = line.split(',').collect();
            let parse = |i: usize| -> anyhow::Result<f64> {
                let text = fields.get(i).with_context(|| format!("Missing column {i} on line {}.", line_no + 2))?;
                text.trim().parse().with_context(|| format!("Failed to parse \"{text}\" as a number."))
            };

            Ok((parse(0)? as u64, parse(1)?, parse(2)?))
        })
        .collect()
}

impl GraphOptions {
    pub fn run(&self) -> anyhow::Result<()> {
        if self.files.is_empty() {
            bail!("No metrics files provided! \nUsage: \n $ gozero-utils graph run1/train_log/metrics.csv ...");
        }

        std::fs::create_dir_all(&self.out_dir).with_context(|| "Failed to create plots directory.")?;

        let mut runs = Vec::new();
        for (i, file) in self.files.iter().enumerate() {
            let name = file
                .parent()
                .and_then(Path::parent)
                .and_then(Path::file_name)
                .and_then(OsStr::to_str)
                .map_or_else(|| format!("run-{}", i + 1), str::to_string);

            runs.push((name, read_metrics(file)?));
        }

        let loss = self.out_dir.join("training_loss.png");
        self.plot(&runs, &loss, "Training loss", "Loss", |r| r.1)?;

        let accuracy = self.out_dir.join("move_accuracy.png");
        self.plot(&runs, &accuracy, "Play move accuracy", "Accuracy", |r| r.2)?;

        println!("Loss plot saved to {}", loss.display());
        println!("Accuracy plot saved to {}", accuracy.display());

        Ok(())
    }

    fn plot(
        &self,
        runs: &[(String, Series)],
        path: &Path,
        title: &str,
        y_desc: &str,
        column: fn(&(u64, f64, f64)) -> f64,
    ) -> anyhow::Result<()> {
        let points = runs.iter().flat_map(|(_, data)| data.iter());
        let x_max = points.clone().map(|r| r.0).max().unwrap_or(1).max(1);
        let y_max = points.map(column).filter(|y| y.is_finite()).fold(0.0f64, f64::max).max(1e-3) * 1.05;

        let root = BitMapBackend::new(path, IMG_DIMS).into_drawing_area();
        root.fill(&WHITE)?;

        let mut chart = ChartBuilder::on(&root)
            .caption(title, (FONT, 48))
            .margin(30)
            .x_label_area_size(80)
            .y_label_area_size(100)
            .build_cartesian_2d(0..x_max, 0.0..y_max)?;

        chart.plotting_area().fill(&CHART_BG_COLOUR)?;
        chart.configure_mesh().x_desc("Step").y_desc(y_desc).draw()?;

        for (i, (name, data)) in runs.iter().enumerate() {
            let colour = COLOURS[i % COLOURS.len()];
            let raw: Vec<_> = data.iter().map(|r| (r.0, column(r))).collect();

            chart.draw_series(LineSeries::new(raw.iter().copied(), colour.mix(NOISY_PLOT_OPACITY)))?;
            chart
                .draw_series(LineSeries::new(moving_average(&raw, self.window), colour.stroke_width(2)))?
                .label(name)
                .legend(move |(x, y)| PathElement::new([(x, y), (x + 40, y)], colour.stroke_width(3)));
        }

        chart
            .configure_series_labels()
            .border_style(BLACK)
            .background_style(WHITE.mix(0.8))
            .position(SeriesLabelPosition::UpperRight)
            .draw()?;
        root.present()?;

        Ok(())
    }
}
