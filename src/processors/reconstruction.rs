//! Point reconstruction from pings and the corrected trajectory.
//!
//! Each matched ping becomes one point: the slant range along the beam plus
//! the transducer lever arm, rotated by the pose attitude into a local ENU
//! frame anchored at the first accepted pose. The ENU cloud is then projected
//! into the trajectory's UTM zone. Pings are independent, so the per-ping work
//! runs on rayon in fixed-size chunks; the collected order is the ping order,
//! which keeps the output bit-identical across runs.

use log::{debug, info, warn};
use nalgebra::Vector3;
use rayon::prelude::*;
use thiserror::Error;

use crate::config::{ReconstructionConfig, VerticalReference};
use crate::core::transforms::utm_to_latlon;
use crate::core::types::interpolate_between;
use crate::core::{
    CorrectedPose, CorrectedTrajectory, Frame, LocalTangentFrame, PingRecord, Point3D, PointCloud, TimestampedPose,
    UtmZoneTable,
};

use super::alignment::{AlignmentResult, PingMatch};
use super::CancelToken;

/// Errors raised by the reconstructor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReconstructionError {
    #[error("corrected trajectory is empty")]
    EmptyTrajectory,

    #[error("ping {index} (t = {timestamp}) is invalid: {reason}")]
    InvalidPing {
        index: usize,
        timestamp: f64,
        reason: String,
    },

    #[error("alignment refers to ping {index} but the log has {count} pings")]
    PingIndexOutOfRange { index: usize, count: usize },

    #[error("cancelled after {processed} pings")]
    Cancelled { processed: usize },
}

/// Per-job reconstruction counts.
///
/// `reconstructed = total_pings - discarded_unmatched - discarded_no_pose`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconstructionStats {
    pub total_pings: usize,
    pub reconstructed: usize,
    /// Pings outside the autopilot log.
    pub discarded_unmatched: usize,
    /// Pings inside the autopilot log but outside the corrected trajectory.
    pub discarded_no_pose: usize,
    /// Points whose pose came from a LOW_CONFIDENCE sample or a wide gap.
    pub low_confidence: usize,
    /// Accepted poses lie in more than one UTM zone.
    pub zone_crossing: bool,
}

/// Output of the reconstructor.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconstruction {
    pub cloud: PointCloud,
    /// Index of the ping that produced each point.
    pub point_pings: Vec<usize>,
    pub anchor: Option<LocalTangentFrame>,
    pub stats: ReconstructionStats,
}

/// Corrected pose at `t`, with a flag when it should not be trusted.
fn pose_at(samples: &[CorrectedPose], t: f64, tolerance: f64, max_gap: f64) -> Option<(TimestampedPose, bool)> {
    let first = samples.first()?;
    let last = samples.last()?;

    let held = |sample: &CorrectedPose| {
        let mut pose = sample.pose.clone();
        pose.timestamp = t;
        (pose, sample.status.is_low_confidence())
    };

    if t <= first.pose.timestamp {
        return (first.pose.timestamp - t <= tolerance).then(|| held(first));
    }
    if t >= last.pose.timestamp {
        return (t - last.pose.timestamp <= tolerance).then(|| held(last));
    }

    let upper = samples.partition_point(|s| s.pose.timestamp <= t);
    let a = &samples[upper - 1];
    let b = &samples[upper];
    let gap = b.pose.timestamp - a.pose.timestamp;
    let w = if gap > 0.0 { (t - a.pose.timestamp) / gap } else { 0.0 };

    let low = a.status.is_low_confidence() || b.status.is_low_confidence() || gap > max_gap;
    Some((interpolate_between(&a.pose, &b.pose, w, t), low))
}

/// Offset of the return from the pose origin, in body axes (forward, left, up).
fn body_offset(ping: &PingRecord, lever_frd: &Vector3<f64>) -> Vector3<f64> {
    let (sin, cos) = ping.beam_angle_rad.sin_cos();
    let frd = lever_frd + Vector3::new(0.0, ping.range_m * sin, ping.range_m * cos);
    Vector3::new(frd.x, -frd.y, -frd.z)
}

fn check_ping(index: usize, ping: &PingRecord) -> Result<(), ReconstructionError> {
    let reason = if !ping.range_m.is_finite() || ping.range_m < 0.0 {
        format!("range {} m", ping.range_m)
    } else if !ping.beam_angle_rad.is_finite() {
        format!("beam angle {} rad", ping.beam_angle_rad)
    } else {
        return Ok(());
    };
    Err(ReconstructionError::InvalidPing {
        index,
        timestamp: ping.timestamp,
        reason,
    })
}

/// Whether accepted poses leave the zone of the anchor.
fn crosses_zones(trajectory: &CorrectedTrajectory, anchor: &LocalTangentFrame, zones: &UtmZoneTable) -> bool {
    let zone = anchor.zone();
    trajectory
        .samples()
        .iter()
        .filter(|s| !s.status.is_low_confidence())
        .any(|s| {
            let (lat, lon) = utm_to_latlon(s.pose.position.x, s.pose.position.y, zone);
            zones.zone_for(lat, lon).map(|z| z.number != zone.number).unwrap_or(false)
        })
}

/// Reconstructs one point per matched ping.
///
/// The cloud is in the trajectory's UTM zone when the trajectory is
/// UTM-tagged, otherwise in the trajectory's own frame.
pub fn reconstruct(
    pings: &[PingRecord],
    alignment: &AlignmentResult,
    trajectory: &CorrectedTrajectory,
    config: &ReconstructionConfig,
    zones: &UtmZoneTable,
    cancel: &CancelToken,
) -> Result<Reconstruction, ReconstructionError> {
    let samples = trajectory.samples();
    let origin = samples
        .iter()
        .find(|s| !s.status.is_low_confidence())
        .or_else(|| samples.first())
        .ok_or(ReconstructionError::EmptyTrajectory)?;

    for m in &alignment.pings {
        let ping = pings.get(m.ping_index).ok_or(ReconstructionError::PingIndexOutOfRange {
            index: m.ping_index,
            count: pings.len(),
        })?;
        check_ping(m.ping_index, ping)?;
    }

    let anchor = trajectory
        .frame()
        .utm_zone()
        .map(|zone| LocalTangentFrame::new(origin.pose.position, zone));

    let mut stats = ReconstructionStats {
        total_pings: pings.len(),
        discarded_unmatched: alignment.unmatched_pings.len(),
        ..ReconstructionStats::default()
    };

    if let Some(ltf) = &anchor {
        info!(
            "Reconstructing {} pings in ENU anchored at ({:.2}, {:.2}) zone {}",
            alignment.pings.len(),
            ltf.anchor().x,
            ltf.anchor().y,
            ltf.zone()
        );
        if crosses_zones(trajectory, ltf, zones) {
            stats.zone_crossing = true;
            warn!(
                "Survey spans more than one UTM zone; all points are projected in zone {}",
                ltf.zone()
            );
        }
    } else {
        info!(
            "Reconstructing {} pings in frame {} (no UTM projection)",
            alignment.pings.len(),
            trajectory.frame()
        );
    }

    let lever = Vector3::from(config.transducer_offset);
    let tolerance = alignment.time_tolerance_s;
    let point_for = |m: &PingMatch| -> Option<(Point3D, bool)> {
        let ping = &pings[m.ping_index];
        let (pose, low) = pose_at(samples, m.timestamp, tolerance, config.max_pose_gap_s)?;

        let mut sensor = pose.position;
        if let VerticalReference::WaterLevel { level_m } = config.vertical_reference {
            sensor.z = level_m;
        }
        let sensor = match &anchor {
            Some(ltf) => ltf.utm_to_enu(&sensor),
            None => sensor,
        };
        let p = sensor + pose.attitude * body_offset(ping, &lever);

        Some((
            Point3D {
                intensity: Some(ping.intensity),
                ..Point3D::new(p.x, p.y, p.z)
            },
            low,
        ))
    };

    let interval = config.cancel_check_interval.max(1);
    let mut outcomes: Vec<Option<(Point3D, bool)>> = Vec::with_capacity(alignment.pings.len());
    for chunk in alignment.pings.chunks(interval) {
        if cancel.is_cancelled() {
            return Err(ReconstructionError::Cancelled {
                processed: outcomes.len(),
            });
        }
        let part: Vec<_> = chunk.par_iter().map(&point_for).collect();
        outcomes.extend(part);
    }

    let local_frame = if anchor.is_some() {
        Frame::LocalEnu
    } else {
        trajectory.frame().clone()
    };
    let mut cloud = PointCloud::with_capacity(local_frame, outcomes.len());
    let mut point_pings = Vec::with_capacity(outcomes.len());
    for (m, outcome) in alignment.pings.iter().zip(outcomes) {
        match outcome {
            Some((point, low)) => {
                cloud.push(point);
                point_pings.push(m.ping_index);
                if low {
                    stats.low_confidence += 1;
                }
            }
            None => {
                debug!("Ping {} (t = {:.3}) has no corrected pose", m.ping_index, m.timestamp);
                stats.discarded_no_pose += 1;
            }
        }
    }
    stats.reconstructed = cloud.len();

    let cloud = match &anchor {
        Some(ltf) => {
            let zone = ltf.zone();
            cloud.map_into(Frame::Utm(zone), |c| {
                let utm = ltf.enu_to_utm(&Vector3::new(c[0], c[1], c[2]));
                [utm.x, utm.y, utm.z]
            })
        }
        None => cloud,
    };

    info!(
        "Reconstructed {} of {} pings ({} outside the autopilot log, {} without pose, {} low confidence)",
        stats.reconstructed,
        stats.total_pings,
        stats.discarded_unmatched,
        stats.discarded_no_pose,
        stats.low_confidence
    );

    Ok(Reconstruction {
        cloud,
        point_pings,
        anchor,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::attitude_from_euler;
    use crate::core::{SampleStatus, SourceTag, UtmZone};
    use crate::processors::alignment::{ClockOffset, OffsetSource};
    use approx::assert_abs_diff_eq;
    use nalgebra::UnitQuaternion;

    fn sample(t: f64, position: Vector3<f64>, attitude: UnitQuaternion<f64>, status: SampleStatus) -> CorrectedPose {
        CorrectedPose {
            pose: TimestampedPose::new(t, position, attitude, SourceTag::Corrected),
            status,
            divergence_m: 0.0,
        }
    }

    fn alignment(pings: &[PingRecord]) -> AlignmentResult {
        AlignmentResult {
            offset: ClockOffset {
                offset_s: 0.0,
                source: OffsetSource::MissionStart,
            },
            frame: Frame::LocalEnu,
            time_tolerance_s: 0.5,
            fixes: Vec::new(),
            unmatched_fixes: Vec::new(),
            pings: pings
                .iter()
                .enumerate()
                .map(|(i, p)| PingMatch {
                    ping_index: i,
                    timestamp: p.timestamp,
                })
                .collect(),
            unmatched_pings: Vec::new(),
            duplicates_dropped: 0,
        }
    }

    fn north_facing(frame: Frame, origin: Vector3<f64>) -> CorrectedTrajectory {
        let attitude = attitude_from_euler(0.0, 0.0, 0.0);
        CorrectedTrajectory::new(
            (0..=10)
                .map(|i| {
                    let t = i as f64;
                    sample(t, origin + Vector3::new(0.0, t, 0.0), attitude, SampleStatus::Blended)
                })
                .collect(),
            frame,
        )
        .unwrap()
    }

    fn run(pings: &[PingRecord], trajectory: &CorrectedTrajectory, config: &ReconstructionConfig) -> Reconstruction {
        reconstruct(
            pings,
            &alignment(pings),
            trajectory,
            config,
            &UtmZoneTable::standard(),
            &CancelToken::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_nadir_ping_below_transducer() {
        let traj = north_facing(Frame::LocalEnu, Vector3::new(0.0, 0.0, 10.0));
        let pings = vec![PingRecord::nadir(2.5, 3.0, 7.0)];
        let result = run(&pings, &traj, &ReconstructionConfig::default());

        assert_eq!(result.cloud.frame(), &Frame::LocalEnu);
        let p = result.cloud.point(0);
        assert_abs_diff_eq!(p.x, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(p.y, 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(p.z, 6.5, epsilon = 1e-12);
        assert_eq!(p.intensity, Some(7.0));
    }

    #[test]
    fn test_starboard_beam_points_east_when_heading_north() {
        let traj = north_facing(Frame::LocalEnu, Vector3::zeros());
        let ping = PingRecord {
            beam_angle_rad: 90f64.to_radians(),
            ..PingRecord::nadir(0.0, 4.0, 0.0)
        };
        let config = ReconstructionConfig {
            transducer_offset: [0.0, 0.0, 0.0],
            ..ReconstructionConfig::default()
        };
        let p = run(&[ping], &traj, &config).cloud.point(0);
        assert_abs_diff_eq!(p.x, 4.0, epsilon = 1e-9);
        assert_abs_diff_eq!(p.y, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(p.z, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_water_level_reference() {
        let traj = north_facing(Frame::LocalEnu, Vector3::new(0.0, 0.0, 25.0));
        let config = ReconstructionConfig {
            vertical_reference: VerticalReference::WaterLevel { level_m: 100.0 },
            ..ReconstructionConfig::default()
        };
        let p = run(&[PingRecord::nadir(1.0, 2.0, 0.0)], &traj, &config).cloud.point(0);
        assert_abs_diff_eq!(p.z, 97.5, epsilon = 1e-12);
    }

    #[test]
    fn test_utm_projection_round_trips_anchor() {
        let zone: UtmZone = "23S".parse().unwrap();
        let origin = Vector3::new(331_000.0, 7_400_000.0, 0.0);
        let traj = north_facing(Frame::Utm(zone), origin);
        let pings = vec![PingRecord::nadir(0.0, 4.0, 0.0), PingRecord::nadir(5.0, 4.0, 0.0)];
        let result = run(&pings, &traj, &ReconstructionConfig::default());

        assert_eq!(result.cloud.frame(), &Frame::Utm(zone));
        assert!(result.anchor.is_some());
        let first = result.cloud.point(0);
        assert_abs_diff_eq!(first.x, origin.x, epsilon = 1e-6);
        assert_abs_diff_eq!(first.y, origin.y, epsilon = 1e-6);
        assert_abs_diff_eq!(first.z, -4.5, epsilon = 1e-9);
        // Points follow the grid track to within the convergence/scale model
        let second = result.cloud.point(1);
        assert_abs_diff_eq!(second.y, origin.y + 5.0, epsilon = 1e-6);
        assert!(!result.stats.zone_crossing);
    }

    #[test]
    fn test_discard_accounting() {
        let traj = north_facing(Frame::LocalEnu, Vector3::zeros());
        let pings: Vec<_> = [0.0, 5.0, 10.4, 11.0].iter().map(|&t| PingRecord::nadir(t, 1.0, 0.0)).collect();
        let mut a = alignment(&pings);
        // Ping 3 was rejected by the aligner; ping 2 lands past the trajectory end
        a.pings.truncate(3);
        a.pings[2].timestamp = 10.6;
        a.unmatched_pings = vec![3];

        let result = reconstruct(
            &pings,
            &a,
            &traj,
            &ReconstructionConfig::default(),
            &UtmZoneTable::standard(),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(result.stats.total_pings, 4);
        assert_eq!(result.stats.discarded_unmatched, 1);
        assert_eq!(result.stats.discarded_no_pose, 1);
        assert_eq!(result.stats.reconstructed, 2);
        assert_eq!(result.point_pings, vec![0, 1]);
    }

    #[test]
    fn test_low_confidence_and_gap_flags() {
        let attitude = UnitQuaternion::identity();
        let traj = CorrectedTrajectory::new(
            vec![
                sample(0.0, Vector3::zeros(), attitude, SampleStatus::Blended),
                sample(1.0, Vector3::zeros(), attitude, SampleStatus::Interpolated),
                sample(2.0, Vector3::zeros(), attitude, SampleStatus::Blended),
                sample(3.0, Vector3::zeros(), attitude, SampleStatus::Blended),
                sample(30.0, Vector3::zeros(), attitude, SampleStatus::Blended),
            ],
            Frame::LocalEnu,
        )
        .unwrap();
        let pings: Vec<_> = [0.5, 2.5, 10.0].iter().map(|&t| PingRecord::nadir(t, 1.0, 0.0)).collect();
        let result = run(&pings, &traj, &ReconstructionConfig::default());
        // 0.5 touches an interpolated sample, 10.0 sits in a 27 s gap
        assert_eq!(result.stats.low_confidence, 2);
    }

    #[test]
    fn test_invalid_ping_is_error() {
        let traj = north_facing(Frame::LocalEnu, Vector3::zeros());
        let pings = vec![PingRecord::nadir(1.0, f64::NAN, 0.0)];
        let result = reconstruct(
            &pings,
            &alignment(&pings),
            &traj,
            &ReconstructionConfig::default(),
            &UtmZoneTable::standard(),
            &CancelToken::new(),
        );
        assert!(matches!(result, Err(ReconstructionError::InvalidPing { index: 0, .. })));
    }

    #[test]
    fn test_cancelled_before_first_chunk() {
        let traj = north_facing(Frame::LocalEnu, Vector3::zeros());
        let pings: Vec<_> = (0..100).map(|i| PingRecord::nadir(i as f64 * 0.1, 1.0, 0.0)).collect();
        let cancel = CancelToken::new();
        cancel.cancel();
        let config = ReconstructionConfig {
            cancel_check_interval: 16,
            ..ReconstructionConfig::default()
        };
        let result = reconstruct(&pings, &alignment(&pings), &traj, &config, &UtmZoneTable::standard(), &cancel);
        assert_eq!(result, Err(ReconstructionError::Cancelled { processed: 0 }));
    }

    #[test]
    fn test_reconstruction_is_deterministic() {
        let attitude = attitude_from_euler(0.05, -0.02, 1.1);
        let traj = CorrectedTrajectory::new(
            (0..200)
                .map(|i| {
                    let t = i as f64 * 0.5;
                    sample(t, Vector3::new(500_000.0 + t.sin() * 3.0, t, 0.2 * t.cos()), attitude, SampleStatus::Blended)
                })
                .collect(),
            Frame::Utm("31N".parse().unwrap()),
        )
        .unwrap();
        let pings: Vec<_> = (0..5000)
            .map(|i| PingRecord {
                beam_angle_rad: ((i % 7) as f64 - 3.0) * 0.1,
                ..PingRecord::nadir(i as f64 * 0.0199, 5.0 + (i % 13) as f64 * 0.37, i as f32)
            })
            .collect();
        let config = ReconstructionConfig {
            cancel_check_interval: 333,
            ..ReconstructionConfig::default()
        };
        let first = run(&pings, &traj, &config);
        let second = run(&pings, &traj, &config);
        assert_eq!(first.cloud.len(), 5000);
        assert_eq!(first.cloud, second.cloud);
    }
}
