//! Fusion of the sonar-native trajectory with the aligned autopilot poses.
//!
//! Each aligned fix is classified by the horizontal divergence between the
//! sonar fix and the autopilot pose:
//! - within `outlier_distance_m`: blended, weighted by autopilot confidence
//! - outlier in a run of at most `outlier_run_length`: replaced by the
//!   autopilot pose
//! - outlier in a longer run: interpolated between the nearest accepted
//!   samples (or held from the only accepted side) and flagged LOW_CONFIDENCE

use log::{debug, info, warn};
use rayon::prelude::*;
use thiserror::Error;

use crate::config::CorrectionConfig;
use crate::core::types::{interpolate_between, slerp_or_nearest};
use crate::core::{
    CorrectedPose, CorrectedTrajectory, PoseQuality, SampleStatus, SourceTag, TimestampedPose, TrajectoryIssue,
};

use super::alignment::{AlignedFix, AlignmentResult};

/// Errors raised by the corrector. All of them abort the job.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CorrectionError {
    #[error("no aligned samples to correct")]
    NoSamples,

    #[error("all {count} samples are outliers; nothing to interpolate from")]
    NoAcceptedSamples { count: usize },

    #[error("non-finite input at sample {index} (t = {timestamp})")]
    NonFiniteInput { index: usize, timestamp: f64 },

    #[error("corrected trajectory is malformed: {0}")]
    InvalidOutput(#[from] TrajectoryIssue),
}

/// Counts of how each sample was produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorrectionStats {
    pub samples: usize,
    pub blended: usize,
    pub replaced: usize,
    pub interpolated: usize,
    pub held: usize,
    pub outliers: usize,
    pub max_divergence_m: f64,
}

impl CorrectionStats {
    pub fn low_confidence(&self) -> usize {
        self.interpolated + self.held
    }
}

/// Output of the corrector.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionResult {
    pub trajectory: CorrectedTrajectory,
    pub stats: CorrectionStats,
}

fn horizontal_divergence(fix: &AlignedFix) -> f64 {
    let d = fix.sonar.position - fix.autopilot.position;
    d.x.hypot(d.y)
}

fn blend(fix: &AlignedFix, config: &CorrectionConfig) -> TimestampedPose {
    let ap = &fix.autopilot;
    let confidence = ap.quality.confidence.clamp(0.0, 1.0);
    let w = config.blend_min_weight + (config.blend_max_weight - config.blend_min_weight) * confidence;

    TimestampedPose {
        timestamp: fix.timestamp(),
        position: fix.sonar.position.lerp(&ap.position, w),
        attitude: slerp_or_nearest(&fix.sonar.attitude, &ap.attitude, w),
        source: SourceTag::Corrected,
        quality: PoseQuality::new(w * confidence + (1.0 - w) * fix.sonar.quality.confidence),
    }
}

fn replace(fix: &AlignedFix) -> TimestampedPose {
    TimestampedPose {
        timestamp: fix.timestamp(),
        source: SourceTag::Corrected,
        ..fix.autopilot.clone()
    }
}

/// Classifies outliers into maximal runs `[start, end)`.
fn outlier_runs(outlier: &[bool]) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut i = 0;
    while i < outlier.len() {
        if outlier[i] {
            let start = i;
            while i < outlier.len() && outlier[i] {
                i += 1;
            }
            runs.push((start, i));
        } else {
            i += 1;
        }
    }
    runs
}

/// Fuses the aligned fixes into the corrected trajectory.
pub fn correct(alignment: &AlignmentResult, config: &CorrectionConfig) -> Result<CorrectionResult, CorrectionError> {
    let fixes = &alignment.fixes;
    if fixes.is_empty() {
        return Err(CorrectionError::NoSamples);
    }

    for (index, fix) in fixes.iter().enumerate() {
        if !fix.sonar.is_finite() || !fix.autopilot.is_finite() {
            return Err(CorrectionError::NonFiniteInput {
                index,
                timestamp: fix.timestamp(),
            });
        }
    }

    let divergence: Vec<f64> = fixes.par_iter().map(horizontal_divergence).collect();
    let outlier: Vec<bool> = divergence.iter().map(|&d| d > config.outlier_distance_m).collect();

    let mut stats = CorrectionStats {
        samples: fixes.len(),
        outliers: outlier.iter().filter(|&&o| o).count(),
        max_divergence_m: divergence.iter().copied().fold(0.0, f64::max),
        ..CorrectionStats::default()
    };

    // First pass: blended and short-run replacements; long runs stay empty
    let mut samples: Vec<Option<CorrectedPose>> = fixes
        .par_iter()
        .zip(&outlier)
        .zip(&divergence)
        .map(|((fix, &is_outlier), &divergence_m)| {
            (!is_outlier).then(|| CorrectedPose {
                pose: blend(fix, config),
                status: SampleStatus::Blended,
                divergence_m,
            })
        })
        .collect();
    stats.blended = samples.iter().filter(|s| s.is_some()).count();

    let runs = outlier_runs(&outlier);
    let mut long_runs = Vec::new();
    for &(start, end) in &runs {
        if end - start <= config.outlier_run_length {
            for i in start..end {
                debug!(
                    "Sample {} (t = {:.3}) diverges {:.2} m; replaced by autopilot pose",
                    i,
                    fixes[i].timestamp(),
                    divergence[i]
                );
                samples[i] = Some(CorrectedPose {
                    pose: replace(&fixes[i]),
                    status: SampleStatus::Replaced,
                    divergence_m: divergence[i],
                });
            }
            stats.replaced += end - start;
        } else {
            long_runs.push((start, end));
        }
    }

    if stats.blended + stats.replaced == 0 {
        return Err(CorrectionError::NoAcceptedSamples { count: fixes.len() });
    }

    // Second pass: long runs bridge the nearest accepted neighbours
    for (start, end) in long_runs {
        let left = start.checked_sub(1).and_then(|i| samples[i].clone());
        let right = samples.get(end).cloned().flatten();
        warn!(
            "{} consecutive outliers between t = {:.3} and t = {:.3}; interpolating, LOW_CONFIDENCE",
            end - start,
            fixes[start].timestamp(),
            fixes[end - 1].timestamp()
        );

        for i in start..end {
            let t = fixes[i].timestamp();
            let (pose, status) = match (&left, &right) {
                (Some(a), Some(b)) => {
                    let span = b.pose.timestamp - a.pose.timestamp;
                    let w = if span > 0.0 { (t - a.pose.timestamp) / span } else { 0.0 };
                    (interpolate_between(&a.pose, &b.pose, w, t), SampleStatus::Interpolated)
                }
                (Some(only), None) | (None, Some(only)) => {
                    let mut held = only.pose.clone();
                    held.timestamp = t;
                    (held, SampleStatus::Held)
                }
                (None, None) => return Err(CorrectionError::NoAcceptedSamples { count: fixes.len() }),
            };
            match status {
                SampleStatus::Held => stats.held += 1,
                _ => stats.interpolated += 1,
            }
            let quality = PoseQuality::low(pose.quality.confidence);
            samples[i] = Some(CorrectedPose {
                pose: TimestampedPose {
                    source: SourceTag::Corrected,
                    quality,
                    ..pose
                },
                status,
                divergence_m: divergence[i],
            });
        }
    }

    let samples: Vec<CorrectedPose> = samples.into_iter().flatten().collect();
    let trajectory = CorrectedTrajectory::new(samples, alignment.frame.clone())?;

    info!(
        "Corrected {} samples: {} blended, {} replaced, {} interpolated, {} held (max divergence {:.2} m)",
        stats.samples, stats.blended, stats.replaced, stats.interpolated, stats.held, stats.max_divergence_m
    );

    Ok(CorrectionResult { trajectory, stats })
}
