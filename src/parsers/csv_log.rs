//! CSV interchange formats for both logs.
//!
//! The autopilot CSV is also the format of the corrected trajectory export,
//! so an exported trajectory can be decoded again as a reference log. Sonar
//! logs can be written back with [`write_sonar_csv`], which is how split scan
//! lines are stored.

use std::path::Path;

use csv::{ReaderBuilder, Trim};
use log::info;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::{AutopilotDecoder, AutopilotLog, ParseError, SonarDecoder, SonarLog};
use crate::core::types::{attitude_from_euler, attitude_to_euler};
use crate::core::writers::{create_buffered_writer, ensure_parent_dirs};
use crate::core::ExportError;
use crate::core::{Frame, PingRecord, PoseQuality, SourceTag, SyncMarker, TimestampedPose, Trajectory};

/// One row of a pose CSV.
#[derive(Debug, Deserialize)]
struct PoseRow {
    timestamp: f64,
    east: f64,
    north: f64,
    up: f64,
    #[serde(default)]
    roll_deg: Option<f64>,
    #[serde(default)]
    pitch_deg: Option<f64>,
    #[serde(default)]
    yaw_deg: Option<f64>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    low_confidence: Option<bool>,
    #[serde(default)]
    frame: Option<String>,
}

/// One row of a sonar CSV; `record` selects which columns apply.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SonarRow {
    record: String,
    timestamp: f64,
    #[serde(default)]
    east: Option<f64>,
    #[serde(default)]
    north: Option<f64>,
    #[serde(default)]
    up: Option<f64>,
    #[serde(default)]
    roll_deg: Option<f64>,
    #[serde(default)]
    pitch_deg: Option<f64>,
    #[serde(default)]
    yaw_deg: Option<f64>,
    #[serde(default)]
    range_m: Option<f64>,
    #[serde(default)]
    beam_deg: Option<f64>,
    #[serde(default)]
    beam_index: Option<u32>,
    #[serde(default)]
    intensity: Option<f32>,
    #[serde(default)]
    label: Option<String>,
}

fn reader(bytes: &[u8]) -> csv::Reader<&[u8]> {
    ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(bytes)
}

fn euler_attitude(roll: Option<f64>, pitch: Option<f64>, yaw: Option<f64>) -> nalgebra::UnitQuaternion<f64> {
    attitude_from_euler(
        roll.unwrap_or(0.0).to_radians(),
        pitch.unwrap_or(0.0).to_radians(),
        yaw.unwrap_or(0.0).to_radians(),
    )
}

/// Decodes `timestamp,east,north,up[,roll_deg,pitch_deg,yaw_deg][,confidence][,low_confidence][,frame]`.
#[derive(Debug, Clone)]
pub struct CsvAutopilotDecoder {
    default_frame: Frame,
}

impl CsvAutopilotDecoder {
    /// `default_frame` applies when the file has no `frame` column.
    pub fn new(default_frame: Frame) -> Self {
        Self { default_frame }
    }
}

impl AutopilotDecoder for CsvAutopilotDecoder {
    fn name(&self) -> &'static str {
        "pose-csv"
    }

    fn decode(&self, bytes: &[u8]) -> Result<AutopilotLog, ParseError> {
        let mut rdr = reader(bytes);
        let mut frame: Option<Frame> = None;
        let mut poses = Vec::new();

        for (i, result) in rdr.deserialize::<PoseRow>().enumerate() {
            let row = result?;
            let line = i + 2;

            if let Some(name) = row.frame.as_deref().filter(|s| !s.is_empty()) {
                let parsed: Frame = name.parse().map_err(|e: crate::core::FrameParseError| ParseError::Malformed {
                    line,
                    reason: e.to_string(),
                })?;
                match &frame {
                    Some(existing) if *existing != parsed => {
                        return Err(ParseError::Malformed {
                            line,
                            reason: format!("frame changes from {} to {}", existing, parsed),
                        });
                    }
                    Some(_) => {}
                    None => frame = Some(parsed),
                }
            }

            let quality = PoseQuality {
                confidence: row.confidence.unwrap_or(1.0).clamp(0.0, 1.0),
                low_confidence: row.low_confidence.unwrap_or(false),
            };
            poses.push(
                TimestampedPose::new(
                    row.timestamp,
                    Vector3::new(row.east, row.north, row.up),
                    euler_attitude(row.roll_deg, row.pitch_deg, row.yaw_deg),
                    SourceTag::Autopilot,
                )
                .with_quality(quality),
            );
        }

        if poses.is_empty() {
            return Err(ParseError::Empty("pose"));
        }

        let frame = frame.unwrap_or_else(|| self.default_frame.clone());
        info!("Decoded {} poses from CSV in frame {}", poses.len(), frame);

        Ok(AutopilotLog {
            trajectory: Trajectory::from_poses(poses, frame),
            markers: Vec::new(),
            missions: Vec::new(),
        })
    }
}

/// Decodes a sonar CSV with `record` = `fix` | `ping` | `mark`.
#[derive(Debug, Clone)]
pub struct CsvSonarDecoder {
    frame: Frame,
    confidence: f64,
}

impl CsvSonarDecoder {
    pub fn new(frame: Frame, confidence: f64) -> Self {
        Self { frame, confidence }
    }
}

impl SonarDecoder for CsvSonarDecoder {
    fn name(&self) -> &'static str {
        "sonar-csv"
    }

    fn decode(&self, bytes: &[u8]) -> Result<SonarLog, ParseError> {
        let mut rdr = reader(bytes);
        let mut poses = Vec::new();
        let mut pings = Vec::new();
        let mut markers = Vec::new();

        for (i, result) in rdr.deserialize::<SonarRow>().enumerate() {
            let row = result?;
            let line = i + 2;
            let missing = |column: &str| ParseError::Malformed {
                line,
                reason: format!("{} record without '{}'", row.record, column),
            };

            match row.record.to_ascii_lowercase().as_str() {
                "fix" => {
                    let east = row.east.ok_or_else(|| missing("east"))?;
                    let north = row.north.ok_or_else(|| missing("north"))?;
                    poses.push(
                        TimestampedPose::new(
                            row.timestamp,
                            Vector3::new(east, north, row.up.unwrap_or(0.0)),
                            euler_attitude(row.roll_deg, row.pitch_deg, row.yaw_deg),
                            SourceTag::SonarNative,
                        )
                        .with_quality(PoseQuality::new(self.confidence)),
                    );
                }
                "ping" => {
                    pings.push(PingRecord {
                        timestamp: row.timestamp,
                        range_m: row.range_m.ok_or_else(|| missing("range_m"))?,
                        beam_angle_rad: row.beam_deg.unwrap_or(0.0).to_radians(),
                        beam_index: row.beam_index.unwrap_or(0),
                        intensity: row.intensity.unwrap_or(0.0),
                        waveform_offset: None,
                    });
                }
                "mark" => markers.push(SyncMarker {
                    label: row.label.clone().unwrap_or_default(),
                    timestamp: row.timestamp,
                }),
                other => {
                    return Err(ParseError::Malformed {
                        line,
                        reason: format!("unknown record kind '{}'", other),
                    })
                }
            }
        }

        if poses.is_empty() {
            return Err(ParseError::Empty("fix"));
        }

        info!(
            "Decoded {} sonar fixes, {} pings, {} marks from CSV",
            poses.len(),
            pings.len(),
            markers.len()
        );

        Ok(SonarLog {
            trajectory: Trajectory::from_poses(poses, self.frame.clone()),
            pings,
            markers,
        })
    }
}

fn sonar_rows(log: &SonarLog) -> Vec<SonarRow> {
    let mut rows = Vec::with_capacity(log.trajectory.len() + log.pings.len() + log.markers.len());
    for pose in log.trajectory.iter() {
        let (roll, pitch, yaw) = attitude_to_euler(&pose.attitude);
        rows.push(SonarRow {
            record: "fix".to_string(),
            timestamp: pose.timestamp,
            east: Some(pose.position.x),
            north: Some(pose.position.y),
            up: Some(pose.position.z),
            roll_deg: Some(roll.to_degrees()),
            pitch_deg: Some(pitch.to_degrees()),
            yaw_deg: Some(yaw.to_degrees().rem_euclid(360.0)),
            ..SonarRow::default()
        });
    }
    for ping in &log.pings {
        rows.push(SonarRow {
            record: "ping".to_string(),
            timestamp: ping.timestamp,
            range_m: Some(ping.range_m),
            beam_deg: Some(ping.beam_angle_rad.to_degrees()),
            beam_index: Some(ping.beam_index),
            intensity: Some(ping.intensity),
            ..SonarRow::default()
        });
    }
    for marker in &log.markers {
        rows.push(SonarRow {
            record: "mark".to_string(),
            timestamp: marker.timestamp,
            label: Some(marker.label.clone()),
            ..SonarRow::default()
        });
    }
    // Stable, so a fix keeps its place ahead of a ping at the same instant
    rows.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
    rows
}

/// Writes a sonar log in the format [`CsvSonarDecoder`] reads, in time order.
///
/// The frame is not stored; the reader supplies it.
pub fn write_sonar_csv(path: &Path, log: &SonarLog) -> Result<(), ExportError> {
    ensure_parent_dirs(path)?;
    let writer = create_buffered_writer(path)?;
    let mut csv_writer = csv::Writer::from_writer(writer);
    let path_str = path.display().to_string();

    for row in sonar_rows(log) {
        csv_writer.serialize(row).map_err(|e| ExportError::CsvError {
            path: path_str.clone(),
            source: e,
        })?;
    }

    csv_writer.flush().map_err(|e| ExportError::WriteFile {
        path: path_str,
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_pose_csv_with_frame_column() {
        let text = "timestamp,east,north,up,roll_deg,pitch_deg,yaw_deg,status,low_confidence,divergence_m,frame\n\
                    0.0,100.0,200.0,1.0,0,0,90,blended,false,0.2,utm:23S\n\
                    1.0,101.0,200.0,1.0,0,0,90,interpolated,true,,utm:23S\n";
        let log = CsvAutopilotDecoder::new(Frame::LocalEnu).decode(text.as_bytes()).unwrap();
        assert_eq!(log.trajectory.len(), 2);
        assert_eq!(log.trajectory.frame().to_string(), "utm:23S");
        assert!(log.trajectory.poses()[1].quality.low_confidence);
        assert_abs_diff_eq!(log.trajectory.poses()[1].position.x, 101.0);
    }

    #[test]
    fn test_pose_csv_default_frame() {
        let text = "timestamp,east,north,up\n0,1,2,3\n";
        let log = CsvAutopilotDecoder::new(Frame::LocalEnu).decode(text.as_bytes()).unwrap();
        assert_eq!(log.trajectory.frame(), &Frame::LocalEnu);
    }

    #[test]
    fn test_pose_csv_frame_change_is_error() {
        let text = "timestamp,east,north,up,frame\n0,1,2,3,utm:23S\n1,1,2,3,utm:24S\n";
        assert!(matches!(
            CsvAutopilotDecoder::new(Frame::LocalEnu).decode(text.as_bytes()),
            Err(ParseError::Malformed { line: 3, .. })
        ));
    }

    #[test]
    fn test_pose_csv_bad_number() {
        let text = "timestamp,east,north,up\n0,abc,2,3\n";
        assert!(matches!(
            CsvAutopilotDecoder::new(Frame::LocalEnu).decode(text.as_bytes()),
            Err(ParseError::Csv(_))
        ));
    }

    #[test]
    fn test_sonar_csv_records() {
        let text = "record,timestamp,east,north,up,range_m,beam_deg,intensity,label\n\
                    fix,0.0,10,20,0,,,,\n\
                    ping,0.1,,,,5.5,30,12.5,\n\
                    mark,0.2,,,,,,,start\n\
                    fix,1.0,11,20,0,,,,\n";
        let log = CsvSonarDecoder::new(Frame::LocalEnu, 0.5).decode(text.as_bytes()).unwrap();
        assert_eq!(log.trajectory.len(), 2);
        assert_eq!(log.pings.len(), 1);
        assert_abs_diff_eq!(log.pings[0].beam_angle_rad, 30f64.to_radians());
        assert_eq!(log.pings[0].intensity, 12.5);
        assert_eq!(log.markers[0].label, "start");
    }

    #[test]
    fn test_sonar_csv_ping_without_range() {
        let text = "record,timestamp,east,north,range_m\nfix,0,1,1,\nping,0.5,,,\n";
        assert!(matches!(
            CsvSonarDecoder::new(Frame::LocalEnu, 0.5).decode(text.as_bytes()),
            Err(ParseError::Malformed { line: 3, .. })
        ));
    }

    #[test]
    fn test_written_sonar_log_reads_back() {
        let text = "record,timestamp,east,north,up,yaw_deg,range_m,beam_deg,beam_index,intensity,label\n\
                    fix,0.0,10,20,1,90,,,,,\n\
                    ping,0.5,,,,,5.5,-15,3,12.5,\n\
                    fix,1.0,11,20,1,90,,,,,\n\
                    mark,0.25,,,,,,,,,start\n";
        let decoder = CsvSonarDecoder::new(Frame::LocalEnu, 0.5);
        let log = decoder.decode(text.as_bytes()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lines").join("line_001.csv");
        write_sonar_csv(&path, &log).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let kinds: Vec<&str> = content.lines().skip(1).map(|l| l.split(',').next().unwrap_or("")).collect();
        assert_eq!(kinds, vec!["fix", "mark", "ping", "fix"]);

        let again = decoder.decode(content.as_bytes()).unwrap();
        assert_eq!(again.trajectory.len(), 2);
        assert_abs_diff_eq!(again.trajectory.poses()[1].position.x, 11.0);
        let (_, _, yaw) = attitude_to_euler(&again.trajectory.poses()[0].attitude);
        assert_abs_diff_eq!(yaw, 90f64.to_radians(), epsilon = 1e-9);
        assert_eq!(again.pings.len(), 1);
        assert_eq!(again.pings[0].range_m, 5.5);
        assert_eq!(again.pings[0].beam_index, 3);
        assert_abs_diff_eq!(again.pings[0].beam_angle_rad, log.pings[0].beam_angle_rad, epsilon = 1e-12);
        assert_eq!(again.markers, log.markers);
    }
}
