//! Top-down PNG plots for reviewing a job.
//!
//! Plots carry no text (no font backend is compiled in); colours encode the
//! meaning:
//! - trajectory review: autopilot in blue, sonar-native fixes in light red,
//!   corrected track in green, replaced outliers in red, LOW_CONFIDENCE
//!   samples in orange
//! - point clouds: one palette colour per source cloud
//!
//! Coordinates are plotted relative to the plot's lower-left corner so UTM
//! magnitudes do not cost precision.

use std::path::Path;

use plotters::prelude::*;
use plotters_bitmap::BitMapBackend;
use thiserror::Error;

use crate::core::{CorrectedTrajectory, PointCloud, SampleStatus, Trajectory};

/// Errors that can occur during visualization.
#[derive(Error, Debug)]
pub enum VisualizationError {
    #[error("Plotting error: {0}")]
    PlottingError(String),

    #[error("nothing to plot")]
    Empty,
}

/// Result type for visualization operations.
pub type Result<T> = std::result::Result<T, VisualizationError>;

const DEFAULT_WIDTH: u32 = 1920;
const DEFAULT_HEIGHT: u32 = 1080;

/// Colours per source cloud id.
const SOURCE_COLORS: &[(u8, u8, u8)] = &[
    (55, 126, 184),  // Blue
    (228, 26, 28),   // Red
    (77, 175, 74),   // Green
    (152, 78, 163),  // Purple
    (255, 127, 0),   // Orange
    (166, 86, 40),   // Brown
    (247, 129, 191), // Pink
    (0, 206, 209),   // Turquoise
];

const AUTOPILOT_COLOR: RGBColor = RGBColor(55, 126, 184);
const SONAR_COLOR: RGBColor = RGBColor(251, 154, 153);
const CORRECTED_COLOR: RGBColor = RGBColor(77, 175, 74);
const OUTLIER_COLOR: RGBColor = RGBColor(228, 26, 28);
const LOW_CONFIDENCE_COLOR: RGBColor = RGBColor(255, 127, 0);

fn plot_err<E: std::fmt::Display>(e: E) -> VisualizationError {
    VisualizationError::PlottingError(e.to_string())
}

/// Axis-aligned bounds of (x, y) points with a 5% margin.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Bounds {
    x_min: f64,
    x_max: f64,
    y_min: f64,
    y_max: f64,
}

impl Bounds {
    fn of<'a>(points: impl IntoIterator<Item = &'a (f64, f64)>) -> Option<Self> {
        let mut bounds: Option<Self> = None;
        for &(x, y) in points {
            if !x.is_finite() || !y.is_finite() {
                continue;
            }
            bounds = Some(match bounds {
                None => Self {
                    x_min: x,
                    x_max: x,
                    y_min: y,
                    y_max: y,
                },
                Some(b) => Self {
                    x_min: b.x_min.min(x),
                    x_max: b.x_max.max(x),
                    y_min: b.y_min.min(y),
                    y_max: b.y_max.max(y),
                },
            });
        }
        bounds.map(Self::padded)
    }

    fn padded(self) -> Self {
        let pad = |min: f64, max: f64| {
            let span = max - min;
            if span < 1e-9 {
                (min - 1.0, max + 1.0)
            } else {
                (min - span * 0.05, max + span * 0.05)
            }
        };
        let (x_min, x_max) = pad(self.x_min, self.x_max);
        let (y_min, y_max) = pad(self.y_min, self.y_max);
        Self {
            x_min,
            x_max,
            y_min,
            y_max,
        }
    }

    fn origin(&self) -> (f64, f64) {
        (self.x_min, self.y_min)
    }
}

fn xy(position: &nalgebra::Vector3<f64>) -> (f64, f64) {
    (position.x, position.y)
}

/// Plots the autopilot track, the sonar-native fixes and the corrected
/// trajectory, highlighting replaced and LOW_CONFIDENCE samples.
pub fn plot_trajectory_correction(
    output_path: &Path,
    autopilot: &Trajectory,
    sonar: &Trajectory,
    corrected: &CorrectedTrajectory,
) -> Result<()> {
    let ap: Vec<(f64, f64)> = autopilot.iter().map(|p| xy(&p.position)).collect();
    let native: Vec<(f64, f64)> = sonar.iter().map(|p| xy(&p.position)).collect();
    let fused: Vec<(f64, f64)> = corrected.samples().iter().map(|s| xy(&s.pose.position)).collect();

    let bounds = Bounds::of(ap.iter().chain(&native).chain(&fused)).ok_or(VisualizationError::Empty)?;
    let (ox, oy) = bounds.origin();
    let shift = |pts: &[(f64, f64)]| -> Vec<(f64, f64)> { pts.iter().map(|&(x, y)| (x - ox, y - oy)).collect() };

    let root = BitMapBackend::new(output_path, (DEFAULT_WIDTH, DEFAULT_HEIGHT)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;

    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .build_cartesian_2d(0.0..(bounds.x_max - ox), 0.0..(bounds.y_max - oy))
        .map_err(plot_err)?;

    chart
        .draw_series(shift(&native).into_iter().map(|p| Circle::new(p, 2, SONAR_COLOR.filled())))
        .map_err(plot_err)?;
    chart
        .draw_series(LineSeries::new(shift(&ap), AUTOPILOT_COLOR.stroke_width(2)))
        .map_err(plot_err)?;
    chart
        .draw_series(LineSeries::new(shift(&fused), CORRECTED_COLOR.stroke_width(2)))
        .map_err(plot_err)?;

    let flagged = corrected.samples().iter().filter_map(|s| {
        let color = match s.status {
            SampleStatus::Replaced => OUTLIER_COLOR,
            status if status.is_low_confidence() => LOW_CONFIDENCE_COLOR,
            _ => return None,
        };
        let (x, y) = xy(&s.pose.position);
        Some(Circle::new((x - ox, y - oy), 4, color.filled()))
    });
    chart.draw_series(flagged).map_err(plot_err)?;

    root.present().map_err(plot_err)?;
    Ok(())
}

/// Scatter plot (east vs north) of a cloud, coloured by source id.
///
/// Clouds larger than `max_points` are subsampled with a fixed stride.
pub fn plot_point_cloud(output_path: &Path, cloud: &PointCloud, max_points: usize, alpha: f32) -> Result<()> {
    if cloud.is_empty() {
        return Err(VisualizationError::Empty);
    }

    let n = cloud.len();
    let step = n.div_ceil(max_points.max(1));
    let alpha = f64::from(alpha.clamp(0.0, 1.0));

    let points: Vec<(f64, f64)> = (0..n).step_by(step).map(|i| (cloud.x()[i], cloud.y()[i])).collect();
    let colors: Vec<RGBAColor> = (0..n)
        .step_by(step)
        .map(|i| {
            let source = cloud.sources().map_or(0, |s| s[i] as usize);
            let (r, g, b) = SOURCE_COLORS[source % SOURCE_COLORS.len()];
            RGBAColor(r, g, b, alpha)
        })
        .collect();

    let bounds = Bounds::of(&points).ok_or(VisualizationError::Empty)?;
    let (ox, oy) = bounds.origin();

    let root = BitMapBackend::new(output_path, (DEFAULT_WIDTH, DEFAULT_HEIGHT)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;

    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .build_cartesian_2d(0.0..(bounds.x_max - ox), 0.0..(bounds.y_max - oy))
        .map_err(plot_err)?;

    chart
        .draw_series(
            points
                .iter()
                .zip(&colors)
                .map(|(&(x, y), color)| Circle::new((x - ox, y - oy), 2, color.filled())),
        )
        .map_err(plot_err)?;

    root.present().map_err(plot_err)?;
    Ok(())
}
