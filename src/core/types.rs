//! Pose, trajectory and ping record types shared by every pipeline stage.

use std::fmt;
use std::str::FromStr;

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::transforms::UtmZone;

/// Coordinate frame a position or point is expressed in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Frame {
    /// East-North-Up tangent plane anchored at the mission's first accepted pose.
    LocalEnu,
    /// An arbitrary named local frame (e.g. a photogrammetry model).
    Local(String),
    /// UTM grid coordinates (easting, northing, up).
    Utm(UtmZone),
}

impl Frame {
    #[inline]
    pub fn is_utm(&self) -> bool {
        matches!(self, Frame::Utm(_))
    }

    /// UTM zone of the frame, if it is a UTM frame.
    #[inline]
    pub fn utm_zone(&self) -> Option<UtmZone> {
        match self {
            Frame::Utm(zone) => Some(*zone),
            _ => None,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::LocalEnu => write!(f, "enu"),
            Frame::Local(name) => write!(f, "local:{}", name),
            Frame::Utm(zone) => write!(f, "utm:{}", zone),
        }
    }
}

/// Error returned when a frame description cannot be parsed.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid frame '{0}' (expected 'enu', 'local:<name>' or 'utm:<zone><N|S>')")]
pub struct FrameParseError(pub String);

impl FromStr for Frame {
    type Err = FrameParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let lower = trimmed.to_ascii_lowercase();

        if lower == "enu" || lower == "local_enu" {
            return Ok(Frame::LocalEnu);
        }
        if let Some(zone) = lower.strip_prefix("utm:") {
            return zone
                .parse::<UtmZone>()
                .map(Frame::Utm)
                .map_err(|_| FrameParseError(s.to_string()));
        }
        if lower.starts_with("local:") {
            // Keep the caller's casing for the name
            let name = trimmed[6..].trim();
            if !name.is_empty() {
                return Ok(Frame::Local(name.to_string()));
            }
        }
        Err(FrameParseError(s.to_string()))
    }
}

/// Which subsystem recorded a pose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceTag {
    Autopilot,
    SonarNative,
    Corrected,
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceTag::Autopilot => "autopilot",
            SourceTag::SonarNative => "sonar",
            SourceTag::Corrected => "corrected",
        };
        f.write_str(name)
    }
}

/// Quality attached to a pose.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseQuality {
    /// Confidence in [0, 1].
    pub confidence: f64,
    /// Set on samples that were interpolated or held across a gap.
    pub low_confidence: bool,
}

impl PoseQuality {
    pub fn new(confidence: f64) -> Self {
        Self {
            confidence: confidence.clamp(0.0, 1.0),
            low_confidence: false,
        }
    }

    pub fn low(confidence: f64) -> Self {
        Self {
            confidence: confidence.clamp(0.0, 1.0),
            low_confidence: true,
        }
    }
}

impl Default for PoseQuality {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// A single timestamped pose.
///
/// Attitude rotates body-frame vectors (x forward, y left, z up) into ENU.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampedPose {
    pub timestamp: f64,
    pub position: Vector3<f64>,
    pub attitude: UnitQuaternion<f64>,
    pub source: SourceTag,
    pub quality: PoseQuality,
}

impl TimestampedPose {
    pub fn new(timestamp: f64, position: Vector3<f64>, attitude: UnitQuaternion<f64>, source: SourceTag) -> Self {
        Self {
            timestamp,
            position,
            attitude,
            source,
            quality: PoseQuality::default(),
        }
    }

    pub fn with_quality(mut self, quality: PoseQuality) -> Self {
        self.quality = quality;
        self
    }

    /// Returns true when timestamp, position and attitude are all finite.
    pub fn is_finite(&self) -> bool {
        self.timestamp.is_finite()
            && self.position.iter().all(|v| v.is_finite())
            && self.attitude.coords.iter().all(|v| v.is_finite())
    }
}

/// NED to ENU axis swap.
fn ned_to_enu() -> Matrix3<f64> {
    Matrix3::new(0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, -1.0)
}

/// Forward-left-up to forward-right-down body axes.
fn flu_to_frd() -> Matrix3<f64> {
    Matrix3::new(1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, -1.0)
}

/// Builds an attitude from aerospace roll/pitch/yaw in radians
/// (NED, yaw clockwise from north).
pub fn attitude_from_euler(roll: f64, pitch: f64, yaw: f64) -> UnitQuaternion<f64> {
    let ned = Rotation3::from_euler_angles(roll, pitch, yaw);
    let m = ned_to_enu() * ned.matrix() * flu_to_frd();
    UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(m))
}

/// Recovers aerospace roll/pitch/yaw in radians from an attitude.
pub fn attitude_to_euler(attitude: &UnitQuaternion<f64>) -> (f64, f64, f64) {
    let enu = attitude.to_rotation_matrix();
    let m = ned_to_enu() * enu.matrix() * flu_to_frd();
    Rotation3::from_matrix_unchecked(m).euler_angles()
}

/// Reasons a trajectory is not well-formed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrajectoryIssue {
    #[error("timestamp {timestamp} at index {index} does not increase (previous {previous})")]
    NonMonotonic { index: usize, previous: f64, timestamp: f64 },

    #[error("non-finite pose at index {index} (t = {timestamp})")]
    NonFinite { index: usize, timestamp: f64 },
}

/// Ordered sequence of poses in one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    poses: Vec<TimestampedPose>,
    frame: Frame,
}

impl Trajectory {
    /// Creates an empty trajectory.
    pub fn new(frame: Frame) -> Self {
        Self {
            poses: Vec::new(),
            frame,
        }
    }

    pub fn from_poses(poses: Vec<TimestampedPose>, frame: Frame) -> Self {
        Self { poses, frame }
    }

    #[inline]
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    #[inline]
    pub fn poses(&self) -> &[TimestampedPose] {
        &self.poses
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.poses.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }

    #[inline]
    pub fn push(&mut self, pose: TimestampedPose) {
        self.poses.push(pose);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TimestampedPose> {
        self.poses.iter()
    }

    pub fn into_poses(self) -> Vec<TimestampedPose> {
        self.poses
    }

    /// First and last timestamp.
    pub fn span(&self) -> Option<(f64, f64)> {
        match (self.poses.first(), self.poses.last()) {
            (Some(first), Some(last)) => Some((first.timestamp, last.timestamp)),
            _ => None,
        }
    }

    pub fn timestamps(&self) -> Vec<f64> {
        self.poses.iter().map(|p| p.timestamp).collect()
    }

    /// Checks that timestamps strictly increase and every pose is finite.
    pub fn validate(&self) -> Result<(), TrajectoryIssue> {
        let mut previous = f64::NEG_INFINITY;
        for (index, pose) in self.poses.iter().enumerate() {
            if !pose.is_finite() {
                return Err(TrajectoryIssue::NonFinite {
                    index,
                    timestamp: pose.timestamp,
                });
            }
            if pose.timestamp <= previous {
                return Err(TrajectoryIssue::NonMonotonic {
                    index,
                    previous,
                    timestamp: pose.timestamp,
                });
            }
            previous = pose.timestamp;
        }
        Ok(())
    }

    /// Removes poses whose timestamp repeats the previous kept pose.
    ///
    /// Returns the number of poses dropped.
    pub fn dedup_timestamps(&mut self) -> usize {
        let before = self.poses.len();
        self.poses.dedup_by(|later, kept| later.timestamp == kept.timestamp);
        before - self.poses.len()
    }

    /// Pose at time `t`.
    ///
    /// Position is interpolated linearly and attitude spherically between the
    /// two bracketing poses. Outside the span the nearest end pose is returned
    /// if it lies within `tolerance` seconds, otherwise `None`.
    pub fn interpolate(&self, t: f64, tolerance: f64) -> Option<TimestampedPose> {
        let (start, end) = self.span()?;
        if !t.is_finite() {
            return None;
        }

        if t <= start {
            return (start - t <= tolerance).then(|| self.poses[0].clone().at(t));
        }
        if t >= end {
            let last = &self.poses[self.poses.len() - 1];
            return (t - end <= tolerance).then(|| last.clone().at(t));
        }

        // First index with timestamp > t; start < t < end so 1 <= upper < len
        let upper = self.poses.partition_point(|p| p.timestamp <= t);
        let a = &self.poses[upper - 1];
        let b = &self.poses[upper];
        let dt = b.timestamp - a.timestamp;
        let w = if dt > 0.0 { (t - a.timestamp) / dt } else { 0.0 };

        Some(interpolate_between(a, b, w, t))
    }
}

impl TimestampedPose {
    fn at(mut self, t: f64) -> Self {
        self.timestamp = t;
        self
    }
}

/// Interpolates between two poses at weight `w` in [0, 1].
pub fn interpolate_between(a: &TimestampedPose, b: &TimestampedPose, w: f64, t: f64) -> TimestampedPose {
    let position = a.position.lerp(&b.position, w);
    let attitude = slerp_or_nearest(&a.attitude, &b.attitude, w);
    let quality = PoseQuality {
        confidence: a.quality.confidence.min(b.quality.confidence),
        low_confidence: a.quality.low_confidence || b.quality.low_confidence,
    };
    TimestampedPose {
        timestamp: t,
        position,
        attitude,
        source: a.source,
        quality,
    }
}

/// Spherical interpolation that falls back to the nearer endpoint for
/// antipodal rotations, where slerp is undefined.
pub fn slerp_or_nearest(a: &UnitQuaternion<f64>, b: &UnitQuaternion<f64>, w: f64) -> UnitQuaternion<f64> {
    a.try_slerp(b, w, 1.0e-9)
        .unwrap_or_else(|| if w < 0.5 { *a } else { *b })
}

/// How a corrected sample was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleStatus {
    /// Sonar fix blended with the autopilot pose.
    Blended,
    /// Outlier replaced by the autopilot pose.
    Replaced,
    /// Inside a long outlier run, interpolated between accepted samples.
    Interpolated,
    /// Inside a long outlier run with accepted samples on one side only.
    Held,
}

impl SampleStatus {
    #[inline]
    pub fn is_low_confidence(self) -> bool {
        matches!(self, SampleStatus::Interpolated | SampleStatus::Held)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SampleStatus::Blended => "blended",
            SampleStatus::Replaced => "replaced",
            SampleStatus::Interpolated => "interpolated",
            SampleStatus::Held => "held",
        }
    }
}

impl fmt::Display for SampleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sample of the corrected trajectory.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectedPose {
    pub pose: TimestampedPose,
    pub status: SampleStatus,
    /// Horizontal distance between the sonar fix and the autopilot pose.
    pub divergence_m: f64,
}

/// The single fused trajectory of a job.
///
/// Only constructible from well-formed samples: timestamps strictly increase
/// and every pose is finite.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectedTrajectory {
    samples: Vec<CorrectedPose>,
    frame: Frame,
}

impl CorrectedTrajectory {
    pub fn new(samples: Vec<CorrectedPose>, frame: Frame) -> Result<Self, TrajectoryIssue> {
        let corrected = Self { samples, frame };
        corrected.to_trajectory().validate()?;
        Ok(corrected)
    }

    #[inline]
    pub fn samples(&self) -> &[CorrectedPose] {
        &self.samples
    }

    #[inline]
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn low_confidence_count(&self) -> usize {
        self.samples.iter().filter(|s| s.status.is_low_confidence()).count()
    }

    /// Plain pose view of the corrected samples.
    pub fn to_trajectory(&self) -> Trajectory {
        Trajectory::from_poses(self.samples.iter().map(|s| s.pose.clone()).collect(), self.frame.clone())
    }
}

/// One sonar ping.
#[derive(Debug, Clone, PartialEq)]
pub struct PingRecord {
    pub timestamp: f64,
    /// Slant range to the return in meters.
    pub range_m: f64,
    /// Beam angle from nadir in radians, positive to starboard.
    pub beam_angle_rad: f64,
    pub beam_index: u32,
    pub intensity: f32,
    /// Byte offset of the raw waveform in the vendor container, if any.
    pub waveform_offset: Option<u64>,
}

impl PingRecord {
    /// A nadir-looking single-beam ping.
    pub fn nadir(timestamp: f64, range_m: f64, intensity: f32) -> Self {
        Self {
            timestamp,
            range_m,
            beam_angle_rad: 0.0,
            beam_index: 0,
            intensity,
            waveform_offset: None,
        }
    }
}

/// A labelled event usable to synchronise two logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMarker {
    pub label: String,
    pub timestamp: f64,
}
