//! Temporal alignment of the sonar log against the autopilot log.
//!
//! The two logs run on independent clocks. A single offset is estimated and
//! applied to every sonar timestamp (`t_autopilot = t_sonar + offset`), then
//! each sonar fix and ping is matched against the autopilot trajectory.
//!
//! Offset sources, in order of precedence:
//! 1. a manual offset from the configuration
//! 2. sync markers present in both logs (matched by label)
//! 3. cross-correlation of the horizontal speed profiles
//! 4. the mission-start assumption (offset 0) when a speed profile has no
//!    features to correlate

use std::collections::HashMap;
use std::fmt;

use log::{debug, info, warn};
use rayon::prelude::*;
use thiserror::Error;

use crate::config::AlignmentConfig;
use crate::core::{Frame, SyncMarker, TimestampedPose, Trajectory, TrajectoryIssue};
use crate::parsers::{AutopilotLog, SonarLog};

/// Minimum number of speed samples a lag needs to be scored.
const MIN_OVERLAP_SAMPLES: usize = 8;

/// Errors raised while aligning the two logs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlignmentError {
    #[error("{0} trajectory is empty")]
    EmptyTrajectory(&'static str),

    #[error("autopilot trajectory is in {autopilot} but the sonar trajectory is in {sonar}")]
    FrameMismatch { autopilot: Frame, sonar: Frame },

    #[error("{log} trajectory is unusable: {source}")]
    InvalidTrajectory {
        log: &'static str,
        #[source]
        source: TrajectoryIssue,
    },

    #[error("sync markers disagree by {spread_s:.3} s (tolerance {tolerance_s:.3} s)")]
    InconsistentMarkers { spread_s: f64, tolerance_s: f64 },

    #[error(
        "ambiguous clock offset: peak correlation {peak:.3} at {lag_s:.2} s, margin {margin:.3} over the next peak; \
         supply a manual offset"
    )]
    AmbiguousOffset { peak: f64, margin: f64, lag_s: f64 },

    #[error("speed profiles do not overlap within ±{max_lag_s} s; supply a manual offset")]
    NoProfileOverlap { max_lag_s: f64 },

    #[error("no sonar fix falls within {tolerance_s} s of the autopilot log after applying offset {offset_s:.3} s")]
    NoOverlap { offset_s: f64, tolerance_s: f64 },
}

/// Where the clock offset came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OffsetSource {
    Manual,
    Markers { count: usize, spread_s: f64 },
    Correlation { peak: f64, margin: f64 },
    /// Both logs assumed to share the mission-start clock.
    MissionStart,
}

impl fmt::Display for OffsetSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OffsetSource::Manual => write!(f, "manual"),
            OffsetSource::Markers { count, spread_s } => {
                write!(f, "{} sync marker(s), spread {:.3} s", count, spread_s)
            }
            OffsetSource::Correlation { peak, margin } => {
                write!(f, "speed correlation, peak {:.3}, margin {:.3}", peak, margin)
            }
            OffsetSource::MissionStart => write!(f, "mission start"),
        }
    }
}

/// Estimated clock offset, added to sonar timestamps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockOffset {
    pub offset_s: f64,
    pub source: OffsetSource,
}

/// A sonar fix paired with the autopilot pose at the same instant.
///
/// Both poses carry the timestamp on the autopilot clock.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedFix {
    pub sonar_index: usize,
    pub sonar: TimestampedPose,
    pub autopilot: TimestampedPose,
}

impl AlignedFix {
    #[inline]
    pub fn timestamp(&self) -> f64 {
        self.autopilot.timestamp
    }
}

/// A ping with its timestamp moved onto the autopilot clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingMatch {
    pub ping_index: usize,
    pub timestamp: f64,
}

/// Output of the aligner.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentResult {
    pub offset: ClockOffset,
    pub frame: Frame,
    /// Tolerance used for matching, kept for downstream pose lookups.
    pub time_tolerance_s: f64,
    pub fixes: Vec<AlignedFix>,
    /// Indices (after duplicate removal) of sonar fixes outside the autopilot span.
    pub unmatched_fixes: Vec<usize>,
    /// Matched pings, in ping order.
    pub pings: Vec<PingMatch>,
    /// Indices of pings outside the autopilot span by more than the tolerance.
    pub unmatched_pings: Vec<usize>,
    /// Fixes dropped from either log because their timestamp repeated.
    pub duplicates_dropped: usize,
}

/// Removes repeated timestamps and checks the trajectory is usable.
fn prepare(trajectory: &Trajectory, log: &'static str) -> Result<(Trajectory, usize), AlignmentError> {
    if trajectory.is_empty() {
        return Err(AlignmentError::EmptyTrajectory(log));
    }
    let mut prepared = trajectory.clone();
    let dropped = prepared.dedup_timestamps();
    prepared
        .validate()
        .map_err(|source| AlignmentError::InvalidTrajectory { log, source })?;
    if dropped > 0 {
        warn!("Dropped {} duplicate-timestamp fixes from the {} log", dropped, log);
    }
    Ok((prepared, dropped))
}

/// Offset implied by sync markers sharing a label.
///
/// Repeated labels are paired in order of occurrence.
fn marker_offset(
    autopilot: &[SyncMarker],
    sonar: &[SyncMarker],
    tolerance_s: f64,
) -> Result<Option<ClockOffset>, AlignmentError> {
    let mut by_label: HashMap<&str, Vec<f64>> = HashMap::new();
    for marker in autopilot {
        by_label.entry(marker.label.as_str()).or_default().push(marker.timestamp);
    }

    let mut used: HashMap<&str, usize> = HashMap::new();
    let mut diffs = Vec::new();
    for marker in sonar {
        let Some(times) = by_label.get(marker.label.as_str()) else {
            continue;
        };
        let k = used.entry(marker.label.as_str()).or_insert(0);
        if let Some(t_ap) = times.get(*k) {
            diffs.push(t_ap - marker.timestamp);
            *k += 1;
        }
    }

    if diffs.is_empty() {
        return Ok(None);
    }

    diffs.sort_by(f64::total_cmp);
    let spread_s = diffs[diffs.len() - 1] - diffs[0];
    if spread_s > tolerance_s {
        return Err(AlignmentError::InconsistentMarkers { spread_s, tolerance_s });
    }

    let mid = diffs.len() / 2;
    let median = if diffs.len() % 2 == 0 {
        0.5 * (diffs[mid - 1] + diffs[mid])
    } else {
        diffs[mid]
    };

    Ok(Some(ClockOffset {
        offset_s: median,
        source: OffsetSource::Markers {
            count: diffs.len(),
            spread_s,
        },
    }))
}

/// Horizontal speed around `t`, from positions half a step either side.
fn speed_at(trajectory: &Trajectory, t: f64, step: f64) -> Option<f64> {
    let a = trajectory.interpolate(t - 0.5 * step, 0.0)?;
    let b = trajectory.interpolate(t + 0.5 * step, 0.0)?;
    let d = b.position - a.position;
    Some(d.x.hypot(d.y) / step)
}

/// Speed samples on a regular grid covering the trajectory.
fn speed_profile(trajectory: &Trajectory, step: f64) -> (f64, Vec<f64>) {
    let Some((start, end)) = trajectory.span() else {
        return (0.0, Vec::new());
    };
    let first = start + 0.5 * step;
    let count = ((end - start) / step).floor().max(0.0) as usize;
    let samples = (0..count)
        .map_while(|i| speed_at(trajectory, first + i as f64 * step, step))
        .collect();
    (first, samples)
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

/// Pearson correlation of two equally long series; `None` if either is flat.
fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        cov += (x - mean_a) * (y - mean_b);
        var_a += (x - mean_a).powi(2);
        var_b += (y - mean_b).powi(2);
    }
    let denom = (var_a * var_b).sqrt();
    (denom > f64::EPSILON).then(|| cov / denom)
}

/// Offset from the cross-correlation of the speed profiles, or `None` when a
/// profile is featureless.
fn correlation_offset(
    autopilot: &Trajectory,
    sonar: &Trajectory,
    config: &AlignmentConfig,
) -> Result<Option<ClockOffset>, AlignmentError> {
    let step = config.correlation_step_s;
    let (_, autopilot_profile) = speed_profile(autopilot, step);
    let (sonar_start, sonar_profile) = speed_profile(sonar, step);

    let autopilot_std = std_dev(&autopilot_profile);
    let sonar_std = std_dev(&sonar_profile);
    debug!(
        "Speed profile std: autopilot {:.4} m/s, sonar {:.4} m/s",
        autopilot_std, sonar_std
    );
    if autopilot_std < config.min_speed_std || sonar_std < config.min_speed_std {
        return Ok(None);
    }

    let max_steps = (config.max_lag_s / step).round() as i64;
    // Lags are scored independently; the ordered collect keeps ties deterministic
    let scores: Vec<(f64, Option<f64>)> = (-max_steps..=max_steps)
        .into_par_iter()
        .map(|k| {
            let lag = k as f64 * step;
            let mut a = Vec::with_capacity(sonar_profile.len());
            let mut s = Vec::with_capacity(sonar_profile.len());
            for (j, &speed) in sonar_profile.iter().enumerate() {
                let t = sonar_start + j as f64 * step + lag;
                if let Some(v) = speed_at(autopilot, t, step) {
                    a.push(v);
                    s.push(speed);
                }
            }
            let score = if a.len() >= MIN_OVERLAP_SAMPLES { pearson(&a, &s) } else { None };
            (lag, score)
        })
        .collect();

    let Some((best, &(best_lag, Some(peak)))) = scores
        .iter()
        .enumerate()
        .filter(|(_, (_, s))| s.is_some())
        .max_by(|a, b| a.1 .1.unwrap_or(f64::MIN).total_cmp(&b.1 .1.unwrap_or(f64::MIN)))
    else {
        return Err(AlignmentError::NoProfileOverlap {
            max_lag_s: config.max_lag_s,
        });
    };

    let runner_up = scores
        .iter()
        .filter(|(lag, _)| (lag - best_lag).abs() > config.peak_exclusion_s)
        .filter_map(|(_, s)| *s)
        .fold(f64::NEG_INFINITY, f64::max);
    let margin = if runner_up.is_finite() { peak - runner_up } else { peak };

    if peak < config.min_peak_correlation || margin < config.min_peak_margin {
        return Err(AlignmentError::AmbiguousOffset {
            peak,
            margin,
            lag_s: best_lag,
        });
    }

    // Parabolic refinement through the neighbouring scores
    let mut offset_s = best_lag;
    if best > 0 && best + 1 < scores.len() {
        if let (Some(left), Some(right)) = (scores[best - 1].1, scores[best + 1].1) {
            let curvature = left - 2.0 * peak + right;
            if curvature < 0.0 {
                let delta = (0.5 * (left - right) / curvature).clamp(-0.5, 0.5);
                offset_s += delta * step;
            }
        }
    }

    Ok(Some(ClockOffset {
        offset_s,
        source: OffsetSource::Correlation { peak, margin },
    }))
}

/// Estimates the clock offset between the logs.
pub fn estimate_offset(
    autopilot: &Trajectory,
    autopilot_markers: &[SyncMarker],
    sonar: &Trajectory,
    sonar_markers: &[SyncMarker],
    config: &AlignmentConfig,
) -> Result<ClockOffset, AlignmentError> {
    if let Some(offset_s) = config.manual_offset_s {
        return Ok(ClockOffset {
            offset_s,
            source: OffsetSource::Manual,
        });
    }

    if let Some(offset) = marker_offset(autopilot_markers, sonar_markers, config.marker_tolerance_s)? {
        return Ok(offset);
    }

    match correlation_offset(autopilot, sonar, config)? {
        Some(offset) => Ok(offset),
        None => {
            warn!("Speed profiles are featureless; assuming both logs share the mission-start clock");
            Ok(ClockOffset {
                offset_s: 0.0,
                source: OffsetSource::MissionStart,
            })
        }
    }
}

/// Aligns the sonar log to the autopilot log.
///
/// Every sonar fix and ping is moved onto the autopilot clock. Fixes get the
/// interpolated autopilot pose; fixes and pings outside the autopilot span by
/// more than `time_tolerance_s` are reported as unmatched.
pub fn align(
    autopilot: &AutopilotLog,
    sonar: &SonarLog,
    config: &AlignmentConfig,
) -> Result<AlignmentResult, AlignmentError> {
    let (reference, dropped_ap) = prepare(&autopilot.trajectory, "autopilot")?;
    let (native, dropped_sonar) = prepare(&sonar.trajectory, "sonar")?;

    if reference.frame() != native.frame() {
        return Err(AlignmentError::FrameMismatch {
            autopilot: reference.frame().clone(),
            sonar: native.frame().clone(),
        });
    }

    let offset = estimate_offset(&reference, &autopilot.markers, &native, &sonar.markers, config)?;
    info!("Clock offset {:+.3} s ({})", offset.offset_s, offset.source);

    let tolerance = config.time_tolerance_s;
    let mut fixes = Vec::with_capacity(native.len());
    let mut unmatched_fixes = Vec::new();
    for (i, pose) in native.iter().enumerate() {
        let t = pose.timestamp + offset.offset_s;
        match reference.interpolate(t, tolerance) {
            Some(matched) => {
                let mut shifted = pose.clone();
                shifted.timestamp = t;
                fixes.push(AlignedFix {
                    sonar_index: i,
                    sonar: shifted,
                    autopilot: matched,
                });
            }
            None => unmatched_fixes.push(i),
        }
    }

    if fixes.is_empty() {
        return Err(AlignmentError::NoOverlap {
            offset_s: offset.offset_s,
            tolerance_s: tolerance,
        });
    }

    let (start, end) = reference.span().ok_or(AlignmentError::EmptyTrajectory("autopilot"))?;
    let mut pings = Vec::with_capacity(sonar.pings.len());
    let mut unmatched_pings = Vec::new();
    for (i, ping) in sonar.pings.iter().enumerate() {
        let t = ping.timestamp + offset.offset_s;
        if t.is_finite() && t >= start - tolerance && t <= end + tolerance {
            pings.push(PingMatch { ping_index: i, timestamp: t });
        } else {
            unmatched_pings.push(i);
        }
    }

    info!(
        "Aligned {} of {} sonar fixes, {} of {} pings",
        fixes.len(),
        native.len(),
        pings.len(),
        sonar.pings.len()
    );
    if !unmatched_fixes.is_empty() {
        warn!("{} sonar fixes lie outside the autopilot log", unmatched_fixes.len());
    }
    if !unmatched_pings.is_empty() {
        warn!("{} pings lie outside the autopilot log and will be discarded", unmatched_pings.len());
    }

    Ok(AlignmentResult {
        offset,
        frame: reference.frame().clone(),
        time_tolerance_s: tolerance,
        fixes,
        unmatched_fixes,
        pings,
        unmatched_pings,
        duplicates_dropped: dropped_ap + dropped_sonar,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PingRecord, SourceTag};
    use approx::assert_abs_diff_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    fn pose(t: f64, x: f64, y: f64, source: SourceTag) -> TimestampedPose {
        TimestampedPose::new(t, Vector3::new(x, y, 0.0), UnitQuaternion::identity(), source)
    }

    /// Two incommensurate speed oscillations give one distinct correlation peak.
    fn wavy_position(t: f64) -> f64 {
        t + 3.0 * (t * 0.21).sin() + 6.0 * (t * 0.083).cos()
    }

    fn wavy_log(start: f64, end: f64, shift: f64, source: SourceTag) -> Trajectory {
        let poses = (0..)
            .map(|i| start + i as f64 * 0.5)
            .take_while(|t| *t <= end)
            .map(|t| pose(t, wavy_position(t + shift), 0.0, source))
            .collect();
        Trajectory::from_poses(poses, Frame::LocalEnu)
    }

    fn straight_log(n: usize, source: SourceTag) -> Trajectory {
        Trajectory::from_poses(
            (0..n).map(|i| pose(i as f64, i as f64, 0.0, source)).collect(),
            Frame::LocalEnu,
        )
    }

    fn autopilot_log(trajectory: Trajectory) -> AutopilotLog {
        AutopilotLog {
            trajectory,
            markers: Vec::new(),
            missions: Vec::new(),
        }
    }

    fn sonar_log(trajectory: Trajectory, pings: Vec<PingRecord>) -> SonarLog {
        SonarLog {
            trajectory,
            pings,
            markers: Vec::new(),
        }
    }

    #[test]
    fn test_manual_offset_wins() {
        let config = AlignmentConfig {
            manual_offset_s: Some(12.5),
            ..AlignmentConfig::default()
        };
        let traj = straight_log(10, SourceTag::Autopilot);
        let offset = estimate_offset(&traj, &[], &traj, &[], &config).unwrap();
        assert_eq!(offset.offset_s, 12.5);
        assert_eq!(offset.source, OffsetSource::Manual);
    }

    #[test]
    fn test_marker_offset_median() {
        let ap = vec![
            SyncMarker { label: "A".into(), timestamp: 110.0 },
            SyncMarker { label: "B".into(), timestamp: 150.1 },
            SyncMarker { label: "C".into(), timestamp: 190.0 },
        ];
        let sonar = vec![
            SyncMarker { label: "A".into(), timestamp: 10.0 },
            SyncMarker { label: "B".into(), timestamp: 50.0 },
            SyncMarker { label: "C".into(), timestamp: 90.05 },
            SyncMarker { label: "Z".into(), timestamp: 95.0 },
        ];
        let offset = marker_offset(&ap, &sonar, 0.5).unwrap().unwrap();
        assert_abs_diff_eq!(offset.offset_s, 100.0, epsilon = 1e-9);
        assert!(matches!(offset.source, OffsetSource::Markers { count: 3, .. }));
    }

    #[test]
    fn test_inconsistent_markers() {
        let ap = vec![
            SyncMarker { label: "A".into(), timestamp: 10.0 },
            SyncMarker { label: "B".into(), timestamp: 20.0 },
        ];
        let sonar = vec![
            SyncMarker { label: "A".into(), timestamp: 10.0 },
            SyncMarker { label: "B".into(), timestamp: 25.0 },
        ];
        assert!(matches!(
            marker_offset(&ap, &sonar, 0.5),
            Err(AlignmentError::InconsistentMarkers { .. })
        ));
    }

    #[test]
    fn test_featureless_profiles_fall_back_to_mission_start() {
        let traj = straight_log(100, SourceTag::Autopilot);
        let offset = estimate_offset(&traj, &[], &traj, &[], &AlignmentConfig::default()).unwrap();
        assert_eq!(offset.offset_s, 0.0);
        assert_eq!(offset.source, OffsetSource::MissionStart);
    }

    #[test]
    fn test_correlation_recovers_offset() {
        // Sonar clock runs 7 s behind: sonar(t) sees the autopilot motion at t + 7
        let autopilot = wavy_log(0.0, 300.0, 0.0, SourceTag::Autopilot);
        let sonar = wavy_log(20.0, 250.0, 7.0, SourceTag::SonarNative);

        let offset = estimate_offset(&autopilot, &[], &sonar, &[], &AlignmentConfig::default()).unwrap();
        assert!(matches!(offset.source, OffsetSource::Correlation { .. }));
        assert_abs_diff_eq!(offset.offset_s, 7.0, epsilon = 0.25);
    }

    #[test]
    fn test_periodic_profile_is_ambiguous() {
        // A pure period-10 s speed pattern correlates equally well at every period
        let periodic = |shift: f64, source| {
            let poses = (0..600)
                .map(|i| {
                    let t = i as f64 * 0.5;
                    pose(t, t + 2.0 * ((t + shift) * std::f64::consts::TAU / 10.0).sin(), 0.0, source)
                })
                .collect();
            Trajectory::from_poses(poses, Frame::LocalEnu)
        };
        let autopilot = periodic(0.0, SourceTag::Autopilot);
        let sonar = periodic(3.0, SourceTag::SonarNative);
        let result = estimate_offset(&autopilot, &[], &sonar, &[], &AlignmentConfig::default());
        assert!(matches!(result, Err(AlignmentError::AmbiguousOffset { .. })));
    }

    #[test]
    fn test_align_matches_fixes_and_pings() {
        let autopilot = autopilot_log(straight_log(11, SourceTag::Autopilot));
        let pings = vec![
            PingRecord::nadir(-5.0, 3.0, 0.0),
            PingRecord::nadir(2.5, 3.0, 0.0),
            PingRecord::nadir(10.5, 3.0, 0.0),
            PingRecord::nadir(f64::NAN, 3.0, 0.0),
        ];
        let sonar = sonar_log(straight_log(11, SourceTag::SonarNative), pings);

        let result = align(&autopilot, &sonar, &AlignmentConfig::default()).unwrap();
        assert_eq!(result.fixes.len(), 11);
        assert_eq!(result.pings.len(), 2);
        assert_eq!(result.unmatched_pings, vec![0, 3]);
        assert_eq!(result.pings[1].ping_index, 2);
        assert_abs_diff_eq!(result.fixes[4].autopilot.position.x, 4.0);
    }

    #[test]
    fn test_align_drops_duplicates_and_rejects_disorder() {
        let mut poses: Vec<_> = (0..10).map(|i| pose(i as f64, i as f64, 0.0, SourceTag::SonarNative)).collect();
        poses.insert(3, pose(2.0, 2.0, 0.0, SourceTag::SonarNative));
        let sonar = sonar_log(Trajectory::from_poses(poses.clone(), Frame::LocalEnu), Vec::new());
        let autopilot = autopilot_log(straight_log(10, SourceTag::Autopilot));

        let result = align(&autopilot, &sonar, &AlignmentConfig::default()).unwrap();
        assert_eq!(result.duplicates_dropped, 1);
        assert_eq!(result.fixes.len(), 10);

        poses.swap(5, 6);
        let sonar = sonar_log(Trajectory::from_poses(poses, Frame::LocalEnu), Vec::new());
        assert!(matches!(
            align(&autopilot, &sonar, &AlignmentConfig::default()),
            Err(AlignmentError::InvalidTrajectory { log: "sonar", .. })
        ));
    }

    #[test]
    fn test_align_frame_mismatch() {
        let autopilot = autopilot_log(straight_log(10, SourceTag::Autopilot));
        let sonar_traj = Trajectory::from_poses(
            straight_log(10, SourceTag::SonarNative).into_poses(),
            Frame::Local("sonar".into()),
        );
        let sonar = sonar_log(sonar_traj, Vec::new());
        assert!(matches!(
            align(&autopilot, &sonar, &AlignmentConfig::default()),
            Err(AlignmentError::FrameMismatch { .. })
        ));
    }

    #[test]
    fn test_align_no_overlap() {
        let autopilot = autopilot_log(straight_log(10, SourceTag::Autopilot));
        let sonar = sonar_log(straight_log(10, SourceTag::SonarNative), Vec::new());
        let config = AlignmentConfig {
            manual_offset_s: Some(1000.0),
            ..AlignmentConfig::default()
        };
        assert!(matches!(
            align(&autopilot, &sonar, &config),
            Err(AlignmentError::NoOverlap { .. })
        ));
    }
}
