//! Plotting of recorded sessions.
//!
//! Reads a CSV written by a collection run and renders temperature (and the
//! control signal, when recorded, on a secondary axis) against tick into an
//! SVG file.

use std::error::Error;
use std::ops::Range;
use std::path::{Path, PathBuf};

use log::info;
use plotters::prelude::*;

use crate::errors::{LinkError, Result};
use crate::protocol::Sample;
use crate::sink::read_samples;

const PLOT_SIZE: (u32, u32) = (1200, 700);

#[derive(Debug, Clone, PartialEq)]
pub enum PlotOutcome {
    /// The file exists but holds no usable rows.
    NoData,
    Rendered { samples: usize, path: PathBuf },
}

/// Basic statistics of a recording, printed next to the plot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub samples: usize,
    pub first_tick: f64,
    pub last_tick: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl Summary {
    pub fn of(samples: &[Sample]) -> Option<Self> {
        let first = samples.first()?;
        let last = samples.last()?;
        let (min, max, sum) = samples.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY, 0.0),
            |(min, max, sum), s| (min.min(s.temperature), max.max(s.temperature), sum + s.temperature),
        );
        Some(Self {
            samples: samples.len(),
            first_tick: first.tick,
            last_tick: last.tick,
            min,
            max,
            mean: sum / samples.len() as f64,
        })
    }
}

/// Default plot path for a CSV file: same name, `.svg` extension.
pub fn default_plot_path(csv: &Path) -> PathBuf {
    csv.with_extension("svg")
}

/// Load `csv` and render it to `out`.
///
/// A missing file is an error; an empty or fully malformed one is reported as
/// [`PlotOutcome::NoData`].
pub fn render(csv: &Path, out: &Path) -> Result<PlotOutcome> {
    let samples = read_samples(csv)?;
    if samples.is_empty() {
        info!("{} holds no numeric data", csv.display());
        return Ok(PlotOutcome::NoData);
    }
    render_samples(&samples, out)?;
    info!("plotted {} samples to {}", samples.len(), out.display());
    Ok(PlotOutcome::Rendered {
        samples: samples.len(),
        path: out.to_path_buf(),
    })
}

/// Render already loaded samples. `samples` must not be empty.
pub fn render_samples(samples: &[Sample], out: &Path) -> Result<()> {
    draw(samples, out).map_err(|e| LinkError::Plot(e.to_string()))
}

/// Range around `values` with some headroom; degenerate ranges are widened.
fn padded_range<I: Iterator<Item = f64>>(values: I) -> Range<f64> {
    let (min, max) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if !min.is_finite() || !max.is_finite() {
        return 0.0..1.0;
    }
    let pad = ((max - min) * 0.05).max(0.5);
    (min - pad)..(max + pad)
}

fn draw(samples: &[Sample], out: &Path) -> std::result::Result<(), Box<dyn Error>> {
    let has_control = samples.iter().any(|s| s.control.is_some());
    let x_range = padded_range(samples.iter().map(|s| s.tick));
    let y_range = padded_range(samples.iter().map(|s| s.temperature));
    let c_range = padded_range(samples.iter().filter_map(|s| s.control));

    let root = SVGBackend::new(out, PLOT_SIZE).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("PID controller recording", ("sans-serif", 24))
        .margin(15)
        .x_label_area_size(45)
        .y_label_area_size(60)
        .right_y_label_area_size(if has_control { 60 } else { 0 })
        .build_cartesian_2d(x_range.clone(), y_range)?
        .set_secondary_coord(x_range, c_range);

    chart
        .configure_mesh()
        .x_desc("tick [ms]")
        .y_desc("temperature [°C]")
        .draw()?;

    chart
        .draw_series(LineSeries::new(
            samples.iter().map(|s| (s.tick, s.temperature)),
            &RED,
        ))?
        .label("temperature")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &RED));

    if has_control {
        chart.configure_secondary_axes().y_desc("control").draw()?;
        chart
            .draw_secondary_series(LineSeries::new(
                samples
                    .iter()
                    .filter_map(|s| s.control.map(|c| (s.tick, c))),
                &BLUE,
            ))?
            .label("control")
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &BLUE));
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;

    root.present()?;
    Ok(())
}
