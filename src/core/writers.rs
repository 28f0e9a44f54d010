//! Data writers for PLY and CSV formats.
//!
//! This module provides functions for exporting job results:
//! - Merged point clouds as ASCII PLY with frame, intensity and provenance
//! - Point clouds as CSV
//! - The corrected trajectory as CSV with per-sample status
//!
//! Coordinates are written with Rust's shortest round-trip float formatting,
//! so reading a file back yields the exact same values.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use thiserror::Error;

use super::cloud::PointCloud;
use super::types::{attitude_to_euler, CorrectedTrajectory};

/// Errors that can occur during export. Job artifacts stay untouched.
#[derive(Error, Debug)]
pub enum ExportError {
    /// Failed to create parent directories.
    #[error("failed to create parent directories for '{path}': {source}")]
    CreateDirectory {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Failed to create or open file for writing.
    #[error("failed to create file '{path}': {source}")]
    CreateFile {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Failed to write data to file.
    #[error("failed to write to file '{path}': {source}")]
    WriteFile {
        path: String,
        #[source]
        source: io::Error,
    },

    /// CSV writing error.
    #[error("CSV write error for '{path}': {source}")]
    CsvError {
        path: String,
        #[source]
        source: csv::Error,
    },
}

/// Result type for write operations.
pub type Result<T> = std::result::Result<T, ExportError>;

/// Creates parent directories for a file path if they don't exist.
pub(crate) fn ensure_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| ExportError::CreateDirectory {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
    }
    Ok(())
}

/// Creates a buffered writer for the given path.
pub(crate) fn create_buffered_writer(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path).map_err(|e| ExportError::CreateFile {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(BufWriter::new(file))
}

fn write_ply_body<W: Write>(writer: &mut W, cloud: &PointCloud) -> io::Result<()> {
    let intensities = cloud.intensities();
    let sources = cloud.sources();

    writeln!(writer, "ply")?;
    writeln!(writer, "format ascii 1.0")?;
    writeln!(writer, "comment frame {}", cloud.frame())?;
    writeln!(writer, "element vertex {}", cloud.len())?;
    writeln!(writer, "property double x")?;
    writeln!(writer, "property double y")?;
    writeln!(writer, "property double z")?;
    if intensities.is_some() {
        writeln!(writer, "property float intensity")?;
    }
    if sources.is_some() {
        writeln!(writer, "property uint source")?;
    }
    writeln!(writer, "end_header")?;

    for i in 0..cloud.len() {
        write!(writer, "{} {} {}", cloud.x()[i], cloud.y()[i], cloud.z()[i])?;
        if let Some(values) = intensities {
            write!(writer, " {}", values[i])?;
        }
        if let Some(values) = sources {
            write!(writer, " {}", values[i])?;
        }
        writeln!(writer)?;
    }

    writer.flush()
}

/// Write a point cloud to an ASCII PLY file.
///
/// The header records the cloud's frame as `comment frame <frame>` and
/// declares `intensity`/`source` properties only when the cloud carries them.
/// Parent directories are created if needed.
///
/// # Example
///
/// ```no_run
/// use sonar_fusion::core::{Frame, PointCloud};
/// use sonar_fusion::core::writers::write_ply;
/// use std::path::Path;
///
/// let cloud = PointCloud::new(Frame::LocalEnu);
/// write_ply(Path::new("output.ply"), &cloud).unwrap();
/// ```
pub fn write_ply(path: &Path, cloud: &PointCloud) -> Result<()> {
    ensure_parent_dirs(path)?;
    let mut writer = create_buffered_writer(path)?;

    write_ply_body(&mut writer, cloud).map_err(|e| ExportError::WriteFile {
        path: path.display().to_string(),
        source: e,
    })
}

/// Write a point cloud to CSV with `x,y,z[,intensity][,source]` columns.
pub fn write_cloud_csv(path: &Path, cloud: &PointCloud) -> Result<()> {
    ensure_parent_dirs(path)?;
    let writer = create_buffered_writer(path)?;
    let mut csv_writer = csv::Writer::from_writer(writer);
    let path_str = path.display().to_string();
    let csv_err = |e: csv::Error| ExportError::CsvError {
        path: path_str.clone(),
        source: e,
    };

    let intensities = cloud.intensities();
    let sources = cloud.sources();

    let mut header = vec!["x", "y", "z"];
    if intensities.is_some() {
        header.push("intensity");
    }
    if sources.is_some() {
        header.push("source");
    }
    csv_writer.write_record(&header).map_err(csv_err)?;

    for i in 0..cloud.len() {
        let mut row = vec![cloud.x()[i].to_string(), cloud.y()[i].to_string(), cloud.z()[i].to_string()];
        if let Some(values) = intensities {
            row.push(values[i].to_string());
        }
        if let Some(values) = sources {
            row.push(values[i].to_string());
        }
        csv_writer.write_record(&row).map_err(csv_err)?;
    }

    csv_writer.flush().map_err(|e| ExportError::WriteFile {
        path: path_str.clone(),
        source: e,
    })
}

/// One row of the corrected trajectory export.
#[derive(Debug, Serialize)]
struct TrajectoryRow<'a> {
    timestamp: f64,
    east: f64,
    north: f64,
    up: f64,
    roll_deg: f64,
    pitch_deg: f64,
    yaw_deg: f64,
    status: &'a str,
    low_confidence: bool,
    divergence_m: f64,
    frame: &'a str,
}

/// Write the corrected trajectory to CSV, one row per sample, keeping the
/// LOW_CONFIDENCE flag and status of each sample.
pub fn write_trajectory_csv(path: &Path, trajectory: &CorrectedTrajectory) -> Result<()> {
    ensure_parent_dirs(path)?;
    let writer = create_buffered_writer(path)?;
    let mut csv_writer = csv::Writer::from_writer(writer);
    let path_str = path.display().to_string();
    let frame = trajectory.frame().to_string();

    for sample in trajectory.samples() {
        let (roll, pitch, yaw) = attitude_to_euler(&sample.pose.attitude);
        let row = TrajectoryRow {
            timestamp: sample.pose.timestamp,
            east: sample.pose.position.x,
            north: sample.pose.position.y,
            up: sample.pose.position.z,
            roll_deg: roll.to_degrees(),
            pitch_deg: pitch.to_degrees(),
            yaw_deg: yaw.to_degrees().rem_euclid(360.0),
            status: sample.status.as_str(),
            low_confidence: sample.status.is_low_confidence(),
            divergence_m: sample.divergence_m,
            frame: &frame,
        };
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
    use crate::core::types::{attitude_from_euler, CorrectedPose, SampleStatus, SourceTag, TimestampedPose};
    use crate::core::{Frame, Point3D, UtmZone};
    use nalgebra::Vector3;
    use std::fs;
    use tempfile::tempdir;

    fn create_test_cloud() -> PointCloud {
        PointCloud::from_coords(
            Frame::Utm("23S".parse::<UtmZone>().unwrap()),
            &[[331234.125, 7399876.5, -4.75], [2.0, 5.0, 8.0], [3.0, 6.0, 9.0]],
        )
    }

    #[test]
    fn test_write_ply_header_without_attributes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.ply");
        write_ply(&path, &create_test_cloud()).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();

        assert_eq!(lines[0], "ply");
        assert_eq!(lines[1], "format ascii 1.0");
        assert_eq!(lines[2], "comment frame utm:23S");
        assert_eq!(lines[3], "element vertex 3");
        assert_eq!(lines[7], "end_header");
        assert_eq!(lines[8], "331234.125 7399876.5 -4.75");
    }

    #[test]
    fn test_write_ply_with_attributes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.ply");
        let mut cloud = PointCloud::new(Frame::LocalEnu);
        cloud.push(Point3D {
            intensity: Some(0.5),
            source: Some(3),
            ..Point3D::new(1.0, 2.0, 3.0)
        });

        write_ply(&path, &cloud).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("property float intensity"));
        assert!(content.contains("property uint source"));
        assert!(content.lines().last().unwrap() == "1 2 3 0.5 3");
    }

    #[test]
    fn test_write_ply_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("subdir").join("nested").join("test.ply");
        write_ply(&path, &create_test_cloud()).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_write_to_directory_fails() {
        let dir = tempdir().unwrap();
        let err = write_ply(dir.path(), &create_test_cloud()).unwrap_err();
        assert!(matches!(err, ExportError::CreateFile { .. }));
    }

    #[test]
    fn test_write_cloud_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.csv");
        write_cloud_csv(&path, &create_test_cloud().tagged(1)).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();

        assert_eq!(lines[0], "x,y,z,source");
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], "331234.125,7399876.5,-4.75,1");
    }

    #[test]
    fn test_write_trajectory_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("traj.csv");

        let pose = |t: f64| {
            TimestampedPose::new(
                t,
                Vector3::new(10.0 + t, 20.0, 1.0),
                attitude_from_euler(0.0, 0.0, 90f64.to_radians()),
                SourceTag::Corrected,
            )
        };
        let traj = CorrectedTrajectory::new(
            vec![
                CorrectedPose { pose: pose(0.0), status: SampleStatus::Blended, divergence_m: 0.25 },
                CorrectedPose { pose: pose(1.0), status: SampleStatus::Interpolated, divergence_m: 40.0 },
            ],
            Frame::LocalEnu,
        )
        .unwrap();

        write_trajectory_csv(&path, &traj).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(
            lines[0],
            "timestamp,east,north,up,roll_deg,pitch_deg,yaw_deg,status,low_confidence,divergence_m,frame"
        );
        assert!(lines[1].contains(",blended,false,0.25,enu"));
        assert!(lines[2].contains(",interpolated,true,40.0,enu"));
    }
}
