//! Division of a survey into scan lines.
//!
//! A scan line is a run of autopilot poses, and the time window they span on
//! the autopilot clock. Lines come either from the mission that was flown,
//! whose waypoints are matched in flight order to the trajectory, or from
//! manual cut points given as fractions of the flight.
//!
//! With a mission, each pair of consecutive passed waypoints bounds one line.
//! The stretch before the first pass and the one after the last pass become
//! lines of their own when they exceed `edge_leg_fraction` of the poses.

use log::{debug, info};
use nalgebra::Vector3;
use thiserror::Error;

use crate::config::SegmentationConfig;
use crate::core::{TimestampedPose, Trajectory};
use crate::parsers::{Mission, SonarLog};

/// Errors raised while segmenting a survey.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SegmentationError {
    #[error("trajectory has {0} poses; at least 2 are needed to split it")]
    TooShort(usize),

    #[error("no mission was uploaded before the flight started at t = {flight_start}")]
    NoMission { flight_start: f64 },

    #[error("only {passed} of {waypoints} waypoints were passed within {radius_m} m")]
    TooFewWaypoints {
        passed: usize,
        waypoints: usize,
        radius_m: f64,
    },

    #[error("cut point {0} must lie strictly between 0 and 1")]
    InvalidCut(f64),
}

/// Poses `first_pose..=last_pose` of a trajectory and the times they span.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanLine {
    pub first_pose: usize,
    pub last_pose: usize,
    pub start: f64,
    pub end: f64,
}

impl ScanLine {
    fn between(poses: &[TimestampedPose], first_pose: usize, last_pose: usize) -> Self {
        Self {
            first_pose,
            last_pose,
            start: poses[first_pose].timestamp,
            end: poses[last_pose].timestamp,
        }
    }

    /// Whether autopilot time `t` lies on the line, ends included.
    #[inline]
    pub fn contains(&self, t: f64) -> bool {
        t >= self.start && t <= self.end
    }

    #[inline]
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// The mission flown: the latest one uploaded at or before `flight_start`.
pub fn select_mission(missions: &[Mission], flight_start: f64) -> Option<&Mission> {
    missions
        .iter()
        .filter(|m| m.uploaded_at <= flight_start)
        .max_by(|a, b| a.uploaded_at.total_cmp(&b.uploaded_at))
}

/// First pose from `from` on that comes within `radius` of the waypoint.
fn pass_index(poses: &[TimestampedPose], from: usize, waypoint: &Vector3<f64>, radius: f64) -> Option<usize> {
    poses
        .get(from..)?
        .iter()
        .position(|p| (p.position - waypoint).xy().norm() <= radius)
        .map(|i| from + i)
}

/// Lines between the waypoints of `mission`, as the trajectory passed them.
///
/// Waypoints are matched in order, each strictly after the previous pass. A
/// waypoint the trajectory never comes near is skipped.
pub fn mission_scan_lines(
    trajectory: &Trajectory,
    mission: &Mission,
    config: &SegmentationConfig,
) -> Result<Vec<ScanLine>, SegmentationError> {
    let poses = trajectory.poses();
    if poses.len() < 2 {
        return Err(SegmentationError::TooShort(poses.len()));
    }

    let mut passes = Vec::with_capacity(mission.waypoints.len());
    let mut from = 0;
    for (i, waypoint) in mission.waypoints.iter().enumerate() {
        match pass_index(poses, from, waypoint, config.waypoint_radius_m) {
            Some(index) => {
                passes.push(index);
                from = index + 1;
            }
            None => debug!("Waypoint {} is never passed within {} m", i, config.waypoint_radius_m),
        }
    }

    if passes.len() < 2 {
        return Err(SegmentationError::TooFewWaypoints {
            passed: passes.len(),
            waypoints: mission.waypoints.len(),
            radius_m: config.waypoint_radius_m,
        });
    }
    let (first_pass, last_pass) = (passes[0], passes[passes.len() - 1]);

    let n = poses.len() as f64;
    let last_pose = poses.len() - 1;
    let mut cuts = Vec::with_capacity(passes.len() + 2);
    if first_pass as f64 / n > config.edge_leg_fraction {
        cuts.push(0);
    }
    cuts.extend_from_slice(&passes);
    if last_pass < last_pose && (last_pass as f64 / n) < 1.0 - config.edge_leg_fraction {
        cuts.push(last_pose);
    }

    let lines: Vec<ScanLine> = cuts.windows(2).map(|w| ScanLine::between(poses, w[0], w[1])).collect();
    info!(
        "Mission of {} waypoints: {} passed, {} scan lines",
        mission.waypoints.len(),
        passes.len(),
        lines.len()
    );
    Ok(lines)
}

/// Lines of the mission selected for the trajectory's start time.
pub fn flown_mission_scan_lines(
    trajectory: &Trajectory,
    missions: &[Mission],
    config: &SegmentationConfig,
) -> Result<Vec<ScanLine>, SegmentationError> {
    let (flight_start, _) = trajectory
        .span()
        .ok_or(SegmentationError::TooShort(trajectory.len()))?;
    let mission = select_mission(missions, flight_start).ok_or(SegmentationError::NoMission { flight_start })?;
    debug!(
        "Mission uploaded {:.1} s before the flight",
        flight_start - mission.uploaded_at
    );
    mission_scan_lines(trajectory, mission, config)
}

/// Lines between manual cut points, each a fraction of the pose count.
pub fn fraction_scan_lines(trajectory: &Trajectory, cuts: &[f64]) -> Result<Vec<ScanLine>, SegmentationError> {
    let poses = trajectory.poses();
    if poses.len() < 2 {
        return Err(SegmentationError::TooShort(poses.len()));
    }
    if let Some(&bad) = cuts.iter().find(|c| !(**c > 0.0 && **c < 1.0)) {
        return Err(SegmentationError::InvalidCut(bad));
    }

    let last_pose = poses.len() - 1;
    let mut indices: Vec<usize> = cuts.iter().map(|c| (c * last_pose as f64).round() as usize).collect();
    indices.push(0);
    indices.push(last_pose);
    indices.sort_unstable();
    indices.dedup();

    Ok(indices.windows(2).map(|w| ScanLine::between(poses, w[0], w[1])).collect())
}

/// One trajectory per line. Neighbouring pieces share their boundary pose.
pub fn split_trajectory(trajectory: &Trajectory, lines: &[ScanLine]) -> Vec<Trajectory> {
    let poses = trajectory.poses();
    lines
        .iter()
        .map(|line| {
            let piece = poses
                .get(line.first_pose..=line.last_pose)
                .map(<[TimestampedPose]>::to_vec)
                .unwrap_or_default();
            Trajectory::from_poses(piece, trajectory.frame().clone())
        })
        .collect()
}

/// One sonar log per line.
///
/// `offset_s` moves sonar time onto the autopilot clock; the pieces keep the
/// sonar's own timestamps. Fixes go to every line that contains them, so
/// neighbouring pieces can share a boundary fix. Pings and markers go to the
/// first line that contains them. Records outside every line are dropped.
pub fn split_sonar_log(log: &SonarLog, lines: &[ScanLine], offset_s: f64) -> Vec<SonarLog> {
    let first_line = |t: f64| lines.iter().position(|line| line.contains(t + offset_s));

    let mut pieces: Vec<SonarLog> = lines
        .iter()
        .map(|line| SonarLog {
            trajectory: Trajectory::from_poses(
                log.trajectory
                    .iter()
                    .filter(|p| line.contains(p.timestamp + offset_s))
                    .cloned()
                    .collect(),
                log.trajectory.frame().clone(),
            ),
            pings: Vec::new(),
            markers: Vec::new(),
        })
        .collect();

    let mut outside = 0usize;
    for ping in &log.pings {
        match first_line(ping.timestamp) {
            Some(i) => pieces[i].pings.push(ping.clone()),
            None => outside += 1,
        }
    }
    for marker in &log.markers {
        if let Some(i) = first_line(marker.timestamp) {
            pieces[i].markers.push(marker.clone());
        }
    }

    if outside > 0 {
        debug!("{} of {} pings fall outside every scan line", outside, log.pings.len());
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Frame, PingRecord, SourceTag, SyncMarker};
    use approx::assert_abs_diff_eq;
    use nalgebra::UnitQuaternion;

    /// Walks the corners at 1 m per second, one pose per metre.
    fn walk(corners: &[(f64, f64)]) -> Trajectory {
        let mut positions = vec![Vector3::new(corners[0].0, corners[0].1, 0.0)];
        for pair in corners.windows(2) {
            let (a, b) = (Vector3::new(pair[0].0, pair[0].1, 0.0), Vector3::new(pair[1].0, pair[1].1, 0.0));
            let steps = (b - a).norm().round() as usize;
            let dir = (b - a) / steps as f64;
            positions.extend((1..=steps).map(|k| a + dir * k as f64));
        }
        let poses = positions
            .into_iter()
            .enumerate()
            .map(|(i, p)| TimestampedPose::new(i as f64, p, UnitQuaternion::identity(), SourceTag::Autopilot))
            .collect();
        Trajectory::from_poses(poses, Frame::LocalEnu)
    }

    /// Lead-in from the west, a three-leg lawnmower, tail to the east.
    /// Corners at poses 40, 140, 160 and 260; the last pose is 300.
    fn survey_flight() -> Trajectory {
        walk(&[(-40.0, 0.0), (0.0, 0.0), (0.0, 100.0), (20.0, 100.0), (20.0, 0.0), (60.0, 0.0)])
    }

    fn mission(uploaded_at: f64, waypoints: &[(f64, f64)]) -> Mission {
        Mission {
            uploaded_at,
            waypoints: waypoints.iter().map(|&(x, y)| Vector3::new(x, y, 10.0)).collect(),
        }
    }

    fn lawnmower() -> Mission {
        mission(-60.0, &[(0.0, 0.0), (0.0, 100.0), (20.0, 100.0), (20.0, 0.0)])
    }

    fn bounds(lines: &[ScanLine]) -> Vec<(usize, usize)> {
        lines.iter().map(|l| (l.first_pose, l.last_pose)).collect()
    }

    #[test]
    fn test_mission_lines_with_lead_and_tail() {
        let traj = survey_flight();
        let lines = mission_scan_lines(&traj, &lawnmower(), &SegmentationConfig::default()).unwrap();

        // Each waypoint is passed 5 m before its corner
        assert_eq!(bounds(&lines), vec![(0, 35), (35, 135), (135, 155), (155, 255), (255, 300)]);
        assert_abs_diff_eq!(lines[1].start, 35.0);
        assert_abs_diff_eq!(lines[1].duration(), 100.0);
    }

    #[test]
    fn test_short_edges_are_not_lines() {
        let traj = walk(&[(-3.0, 0.0), (0.0, 0.0), (0.0, 100.0), (20.0, 100.0), (20.0, 0.0), (20.0, -3.0)]);
        let config = SegmentationConfig::default();
        let lines = mission_scan_lines(&traj, &lawnmower(), &config).unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].first_pose, 0);
    }

    #[test]
    fn test_unreached_waypoints_are_skipped() {
        let traj = survey_flight();
        // Closed back to the start, which the flight never revisits
        let closed = mission(-60.0, &[(0.0, 0.0), (0.0, 100.0), (20.0, 100.0), (500.0, 500.0), (20.0, 0.0), (0.0, 0.0)]);
        let lines = mission_scan_lines(&traj, &closed, &SegmentationConfig::default()).unwrap();
        assert_eq!(bounds(&lines), vec![(0, 35), (35, 135), (135, 155), (155, 255), (255, 300)]);
    }

    #[test]
    fn test_too_few_waypoints_passed() {
        let traj = survey_flight();
        let far = mission(-60.0, &[(0.0, 0.0), (900.0, 900.0)]);
        assert!(matches!(
            mission_scan_lines(&traj, &far, &SegmentationConfig::default()),
            Err(SegmentationError::TooFewWaypoints { passed: 1, waypoints: 2, .. })
        ));
    }

    #[test]
    fn test_select_latest_mission_before_flight() {
        let missions = vec![mission(-50.0, &[]), mission(-10.0, &[]), mission(5.0, &[])];
        assert_eq!(select_mission(&missions, 0.0).map(|m| m.uploaded_at), Some(-10.0));
        assert!(select_mission(&missions, -60.0).is_none());

        let traj = survey_flight();
        assert!(matches!(
            flown_mission_scan_lines(&traj, &missions[2..], &SegmentationConfig::default()),
            Err(SegmentationError::NoMission { .. })
        ));
        let mut flown = vec![lawnmower()];
        flown.push(mission(-300.0, &[]));
        assert_eq!(
            flown_mission_scan_lines(&traj, &flown, &SegmentationConfig::default()).unwrap().len(),
            5
        );
    }

    #[test]
    fn test_fraction_lines() {
        let traj = walk(&[(0.0, 0.0), (10.0, 0.0)]);
        let lines = fraction_scan_lines(&traj, &[0.5, 0.2, 0.5]).unwrap();
        assert_eq!(bounds(&lines), vec![(0, 2), (2, 5), (5, 10)]);

        assert_eq!(bounds(&fraction_scan_lines(&traj, &[]).unwrap()), vec![(0, 10)]);
        assert_eq!(fraction_scan_lines(&traj, &[1.0]), Err(SegmentationError::InvalidCut(1.0)));
        assert!(matches!(
            fraction_scan_lines(&walk(&[(0.0, 0.0)]), &[0.5]),
            Err(SegmentationError::TooShort(1))
        ));
    }

    #[test]
    fn test_split_trajectory_shares_boundaries() {
        let traj = survey_flight();
        let lines = fraction_scan_lines(&traj, &[0.5]).unwrap();
        let pieces = split_trajectory(&traj, &lines);
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].len(), 151);
        assert_eq!(pieces[1].len(), 151);
        assert_eq!(pieces[0].poses()[150], pieces[1].poses()[0]);
        assert_eq!(pieces[1].frame(), &Frame::LocalEnu);
    }

    #[test]
    fn test_split_sonar_log_on_autopilot_clock() {
        let traj = survey_flight();
        let lines = mission_scan_lines(&traj, &lawnmower(), &SegmentationConfig::default()).unwrap();

        // Sonar clock runs 10 s behind the autopilot clock
        let offset = 10.0;
        let sonar_traj = Trajectory::from_poses(
            traj.iter()
                .map(|p| TimestampedPose { timestamp: p.timestamp - offset, ..p.clone() })
                .map(|p| TimestampedPose { source: SourceTag::SonarNative, ..p })
                .collect(),
            Frame::LocalEnu,
        );
        let log = SonarLog {
            trajectory: sonar_traj,
            pings: (0..300).map(|i| PingRecord::nadir(i as f64 + 0.5, 8.0, 1.0)).collect(),
            markers: vec![SyncMarker {
                label: "start".to_string(),
                timestamp: 30.0,
            }],
        };

        let pieces = split_sonar_log(&log, &lines, offset);
        assert_eq!(pieces.len(), 5);

        // Autopilot 0..35 is sonar -10..25
        assert_eq!(pieces[0].trajectory.len(), 36);
        assert_eq!(pieces[0].pings.len(), 25);
        assert_eq!(pieces[0].trajectory.poses()[35], pieces[1].trajectory.poses()[0]);

        for (piece, line) in pieces.iter().zip(&lines) {
            assert!(piece.pings.iter().all(|p| line.contains(p.timestamp + offset)));
        }
        // Pings after sonar time 290 lie past the last pose
        let kept: usize = pieces.iter().map(|p| p.pings.len()).sum();
        assert_eq!(kept, 290);

        assert_eq!(pieces[1].markers.len(), 1);
        assert!(pieces.iter().enumerate().all(|(i, p)| i == 1 || p.markers.is_empty()));
    }
}
