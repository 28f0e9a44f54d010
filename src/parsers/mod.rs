//! Log decoders.
//!
//! Every log format sits behind one of two traits so the pipeline only ever
//! sees [`AutopilotLog`] and [`SonarLog`]:
//! - [`AutopilotDecoder`]: ArduPilot DataFlash binary logs, pose CSV
//! - [`SonarDecoder`]: HYPACK HSX text logs, sonar CSV

pub mod csv_log;
pub mod dataflash;
pub mod hsx;

use std::path::Path;

use nalgebra::Vector3;
use thiserror::Error;

use crate::core::transforms::GeodesyError;
use crate::core::{PingRecord, SyncMarker, Trajectory};

pub use csv_log::{write_sonar_csv, CsvAutopilotDecoder, CsvSonarDecoder};
pub use dataflash::DataFlashDecoder;
pub use hsx::HsxDecoder;

/// Errors raised while decoding a log. Any of them is fatal to the job.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("in '{path}': {source}")]
    InFile {
        path: String,
        #[source]
        source: Box<ParseError>,
    },

    #[error("bad record header at byte {offset}")]
    BadHeader { offset: usize },

    #[error("record type {msg_type} at byte {offset} has no format definition")]
    UnknownType { msg_type: u8, offset: usize },

    #[error("truncated record at byte {offset}: needs {needed} bytes, {available} left")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("invalid format definition at byte {offset}: {reason}")]
    InvalidFormat { offset: usize, reason: String },

    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("missing header entry '{0}'")]
    MissingHeader(&'static str),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("position of record {index} cannot be projected: {source}")]
    Projection {
        index: usize,
        #[source]
        source: GeodesyError,
    },

    #[error("log contains no usable {0} records")]
    Empty(&'static str),
}

impl ParseError {
    fn in_file(self, path: &Path) -> Self {
        ParseError::InFile {
            path: path.display().to_string(),
            source: Box::new(self),
        }
    }
}

/// A waypoint mission uploaded to the autopilot.
#[derive(Debug, Clone, PartialEq)]
pub struct Mission {
    /// Time of the last command of the upload, on the trajectory's clock.
    pub uploaded_at: f64,
    /// Waypoints in flight order, in the trajectory's frame. A mission that
    /// does not end where it started gets its first waypoint appended.
    pub waypoints: Vec<Vector3<f64>>,
}

/// Decoded autopilot log.
#[derive(Debug, Clone)]
pub struct AutopilotLog {
    pub trajectory: Trajectory,
    pub markers: Vec<SyncMarker>,
    /// Missions in upload order. Empty for formats without mission records.
    pub missions: Vec<Mission>,
}

/// Decoded sonar log: the sonar's own navigation plus its pings.
#[derive(Debug, Clone)]
pub struct SonarLog {
    pub trajectory: Trajectory,
    /// Pings in log order.
    pub pings: Vec<PingRecord>,
    pub markers: Vec<SyncMarker>,
}

/// Reads a whole file, releasing the handle before decoding starts.
fn read_file(path: &Path) -> Result<Vec<u8>, ParseError> {
    std::fs::read(path).map_err(|e| ParseError::Io {
        path: path.display().to_string(),
        source: e,
    })
}

/// Decodes an autopilot telemetry log into a trajectory.
pub trait AutopilotDecoder: Send + Sync {
    /// Short format name used in logs.
    fn name(&self) -> &'static str;

    fn decode(&self, bytes: &[u8]) -> Result<AutopilotLog, ParseError>;

    fn decode_file(&self, path: &Path) -> Result<AutopilotLog, ParseError> {
        let bytes = read_file(path)?;
        self.decode(&bytes).map_err(|e| e.in_file(path))
    }
}

/// Decodes a sonar navigation/range log into a native trajectory and pings.
pub trait SonarDecoder: Send + Sync {
    fn name(&self) -> &'static str;

    fn decode(&self, bytes: &[u8]) -> Result<SonarLog, ParseError>;

    fn decode_file(&self, path: &Path) -> Result<SonarLog, ParseError> {
        let bytes = read_file(path)?;
        self.decode(&bytes).map_err(|e| e.in_file(path))
    }
}
