//! Data loaders for auxiliary point cloud files.
//!
//! This module provides parsers for:
//! - ASCII PLY point clouds (double or float coordinates, optional intensity/source)
//! - Cartesian point cloud CSV files (x, y, z columns)
//! - Plain XYZ text files as produced by sonar post-processing
//! - Correspondence pair CSV files for registration
//!
//! None of these formats carries a trustworthy frame, so the caller always
//! supplies one. A PLY written by this crate records its frame in a
//! `comment frame` line, readable through [`read_ply_frame`].

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, StringRecord};
use thiserror::Error;

use serde::Deserialize;

use super::cloud::{Correspondence, Point3D, PointCloud};
use super::types::{Frame, FrameParseError};

/// Errors that can occur during file loading.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Empty file: {0}")]
    EmptyFile(PathBuf),

    #[error("Invalid PLY file: {0}")]
    InvalidPly(String),

    #[error("Missing required columns: {0}")]
    MissingColumns(String),

    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("{0}")]
    Frame(#[from] FrameParseError),

    #[error("unknown point cloud format for '{0}'")]
    UnknownFormat(PathBuf),
}

/// Result type for loader operations.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Supported auxiliary cloud formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudFormat {
    Ply,
    Csv,
    /// Whitespace or comma separated `x y z [intensity]`; `invert_z` turns
    /// positive depths into negative heights.
    Xyz { invert_z: bool },
}

impl CloudFormat {
    /// Guesses the format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "ply" => Some(CloudFormat::Ply),
            "csv" => Some(CloudFormat::Csv),
            "xyz" | "txt" => Some(CloudFormat::Xyz { invert_z: false }),
            _ => None,
        }
    }
}

fn parse_value<T: std::str::FromStr>(raw: &str, line: usize, name: &str) -> Result<T> {
    raw.trim().parse::<T>().map_err(|_| LoaderError::Parse {
        line,
        reason: format!("invalid {} value: '{}'", name, raw),
    })
}

fn field<'r>(record: &'r StringRecord, idx: usize, line: usize, name: &str) -> Result<&'r str> {
    record.get(idx).ok_or_else(|| LoaderError::Parse {
        line,
        reason: format!("missing {} value", name),
    })
}

/// Load a point cloud in the given format, tagging it with `frame`.
pub fn load_cloud<P: AsRef<Path>>(path: P, format: CloudFormat, frame: Frame) -> Result<PointCloud> {
    let path = path.as_ref();
    let cloud = match format {
        CloudFormat::Ply => load_ply(path, frame)?,
        CloudFormat::Csv => load_cartesian_csv(path, frame)?,
        CloudFormat::Xyz { invert_z } => load_xyz(path, frame, invert_z)?,
    };
    if cloud.is_empty() {
        return Err(LoaderError::EmptyFile(path.to_path_buf()));
    }
    Ok(cloud)
}

/// Load a point cloud, guessing the format from the extension.
pub fn load_cloud_auto<P: AsRef<Path>>(path: P, frame: Frame) -> Result<PointCloud> {
    let path = path.as_ref();
    let format = CloudFormat::from_path(path).ok_or_else(|| LoaderError::UnknownFormat(path.to_path_buf()))?;
    load_cloud(path, format, frame)
}

/// Load a Cartesian point cloud from a CSV file with x, y, z columns.
///
/// Column names are matched case-insensitively; optional `intensity` and
/// `source` columns are kept.
pub fn load_cartesian_csv<P: AsRef<Path>>(path: P, frame: Frame) -> Result<PointCloud> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(BufReader::new(file));

    // Get headers and map to lowercase
    let headers = reader.headers()?.clone();
    let col_map: HashMap<String, usize> = headers
        .iter()
        .enumerate()
        .map(|(i, name)| (name.trim().to_lowercase(), i))
        .collect();

    let column = |name: &str| {
        col_map
            .get(name)
            .copied()
            .ok_or_else(|| LoaderError::MissingColumns(name.to_string()))
    };
    let x_idx = column("x")?;
    let y_idx = column("y")?;
    let z_idx = column("z")?;
    let intensity_idx = col_map.get("intensity").copied();
    let source_idx = col_map.get("source").copied();

    let mut cloud = PointCloud::with_capacity(frame, 10_000);

    for (i, result) in reader.records().enumerate() {
        let record = result?;
        let line = i + 2;
        let get = |idx: usize, name: &str| -> Result<f64> { parse_value(field(&record, idx, line, name)?, line, name) };

        let mut point = Point3D::new(get(x_idx, "x")?, get(y_idx, "y")?, get(z_idx, "z")?);
        if let Some(idx) = intensity_idx {
            point.intensity = Some(parse_value(field(&record, idx, line, "intensity")?, line, "intensity")?);
        }
        if let Some(idx) = source_idx {
            point.source = Some(parse_value(field(&record, idx, line, "source")?, line, "source")?);
        }
        cloud.push(point);
    }

    Ok(cloud)
}

/// Reads the `comment frame <frame>` line of a PLY header, if any.
pub fn read_ply_frame<P: AsRef<Path>>(path: P) -> Result<Option<Frame>> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    for line in reader.lines() {
        let line = line?;
        let stripped = line.trim();
        if let Some(frame) = stripped.strip_prefix("comment frame ") {
            return Ok(Some(frame.parse()?));
        }
        if stripped == "end_header" {
            break;
        }
    }
    Ok(None)
}

/// Load a point cloud from an ASCII PLY file.
///
/// Supports vertex elements with:
/// - Required: x, y, z properties
/// - Optional: intensity and source properties
pub fn load_ply<P: AsRef<Path>>(path: P, frame: Frame) -> Result<PointCloud> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut lines = reader.lines();

    // Check PLY magic number
    let first_line = lines
        .next()
        .ok_or_else(|| LoaderError::InvalidPly("Empty file".to_string()))??;

    if !first_line.trim().starts_with("ply") {
        return Err(LoaderError::InvalidPly(format!("{} is not a PLY file", path.display())));
    }

    // Parse header
    let mut num_vertices: Option<usize> = None;
    let mut prop_names: Vec<String> = Vec::new();
    let mut in_vertex = false;
    let mut header_done = false;
    let mut line_no = 1usize;

    for line in &mut lines {
        let line = line?;
        line_no += 1;
        let stripped = line.trim();

        if stripped.starts_with("format") && !stripped.contains("ascii") {
            return Err(LoaderError::InvalidPly(format!("only ASCII PLY is supported, got '{}'", stripped)));
        } else if stripped.starts_with("element") {
            let parts: Vec<&str> = stripped.split_whitespace().collect();
            in_vertex = parts.get(1) == Some(&"vertex");
            if in_vertex {
                num_vertices = parts.last().and_then(|s| s.parse().ok());
            }
        } else if stripped.starts_with("property") && in_vertex {
            if let Some(name) = stripped.split_whitespace().last() {
                prop_names.push(name.to_string());
            }
        } else if stripped == "end_header" {
            header_done = true;
            break;
        }
    }

    let num_vertices = num_vertices.ok_or_else(|| LoaderError::InvalidPly("No vertex count in header".to_string()))?;

    if !header_done {
        return Err(LoaderError::InvalidPly("Missing end_header".to_string()));
    }

    // Build property index map
    let prop_idx: HashMap<&str, usize> = prop_names.iter().enumerate().map(|(i, name)| (name.as_str(), i)).collect();

    let required = |name: &str| {
        prop_idx
            .get(name)
            .copied()
            .ok_or_else(|| LoaderError::MissingColumns(name.to_string()))
    };
    let x_idx = required("x")?;
    let y_idx = required("y")?;
    let z_idx = required("z")?;
    let intensity_idx = prop_idx.get("intensity").copied();
    let source_idx = prop_idx.get("source").copied();

    let mut cloud = PointCloud::with_capacity(frame, num_vertices);

    // Parse vertex data
    for line in lines {
        if cloud.len() >= num_vertices {
            break;
        }

        let line = line?;
        line_no += 1;
        let values: Vec<&str> = line.split_whitespace().collect();

        if values.len() < prop_names.len() {
            return Err(LoaderError::Parse {
                line: line_no,
                reason: format!("expected {} values, found {}", prop_names.len(), values.len()),
            });
        }

        let mut point = Point3D::new(
            parse_value(values[x_idx], line_no, "x")?,
            parse_value(values[y_idx], line_no, "y")?,
            parse_value(values[z_idx], line_no, "z")?,
        );
        if let Some(idx) = intensity_idx {
            point.intensity = Some(parse_value(values[idx], line_no, "intensity")?);
        }
        if let Some(idx) = source_idx {
            point.source = Some(parse_value(values[idx], line_no, "source")?);
        }
        cloud.push(point);
    }

    if cloud.len() < num_vertices {
        return Err(LoaderError::InvalidPly(format!(
            "Expected {} vertices, found {}",
            num_vertices,
            cloud.len()
        )));
    }

    Ok(cloud)
}

/// Load an XYZ text cloud: `x y z [intensity]` per line, `#` comments allowed.
pub fn load_xyz<P: AsRef<Path>>(path: P, frame: Frame, invert_z: bool) -> Result<PointCloud> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    let mut cloud = PointCloud::with_capacity(frame, 10_000);

    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        let line_no = i + 1;
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }

        let values: Vec<&str> = stripped
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .collect();
        if values.len() < 3 {
            return Err(LoaderError::Parse {
                line: line_no,
                reason: format!("expected at least 3 values, found {}", values.len()),
            });
        }

        let z: f64 = parse_value(values[2], line_no, "z")?;
        let mut point = Point3D::new(
            parse_value(values[0], line_no, "x")?,
            parse_value(values[1], line_no, "y")?,
            if invert_z { -z } else { z },
        );
        if let Some(raw) = values.get(3) {
            point.intensity = Some(parse_value(raw, line_no, "intensity")?);
        }
        cloud.push(point);
    }

    Ok(cloud)
}

/// One row of a correspondence CSV.
#[derive(Debug, Deserialize)]
struct PairRow {
    source_x: f64,
    source_y: f64,
    source_z: f64,
    target_x: f64,
    target_y: f64,
    target_z: f64,
}

/// Load correspondence pairs from a CSV with
/// `source_x,source_y,source_z,target_x,target_y,target_z` columns.
pub fn load_correspondences<P: AsRef<Path>>(path: P) -> Result<Vec<Correspondence>> {
    let path = path.as_ref();
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(BufReader::new(File::open(path)?));

    let pairs = reader
        .deserialize::<PairRow>()
        .map(|row| {
            let row = row?;
            Ok(Correspondence::new(
                [row.source_x, row.source_y, row.source_z],
                [row.target_x, row.target_y, row.target_z],
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    if pairs.is_empty() {
        return Err(LoaderError::EmptyFile(path.to_path_buf()));
    }
    Ok(pairs)
}
