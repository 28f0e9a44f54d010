//! Merging of several point clouds into the frame of a UTM-tagged anchor.
//!
//! Each input is brought into the anchor frame in one of three ways:
//! - already in the anchor frame: kept as is
//! - UTM in another zone: reprojected exactly through geodetic coordinates
//! - any other frame: registered onto the anchor cloud
//!
//! Every cloud is then tagged with its input index, cleaned with statistical
//! outlier removal, optionally voxel-downsampled and stripped of points that
//! duplicate already merged ones, before being appended.

use std::fmt;

use log::{info, warn};
use thiserror::Error;

use crate::config::{MergeConfig, RegistrationConfig};
use crate::core::transforms::{reproject_utm, GeodesyError};
use crate::core::{AlignmentTransform, CloudError, Correspondence, Frame, PointCloud, UtmZone};

use super::filtering::{remove_duplicates, statistical_outlier_removal, voxel_downsample};
use super::registration::{register, RegistrationError};
use super::CancelToken;

/// Errors raised while merging clouds.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MergeError {
    #[error("no clouds to merge")]
    NoInputs,

    #[error("no UTM-tagged cloud to anchor the merge")]
    NoAnchor,

    #[error("anchor index {index} out of range for {count} clouds")]
    AnchorOutOfRange { index: usize, count: usize },

    #[error("anchor cloud {index} is in frame {frame}, not a UTM frame")]
    AnchorNotUtm { index: usize, frame: Frame },

    #[error("registering cloud {index} ('{name}'): {source}")]
    Registration {
        index: usize,
        name: String,
        source: RegistrationError,
    },

    #[error("reprojecting cloud {index} ('{name}'): {source}")]
    Geodesy {
        index: usize,
        name: String,
        source: GeodesyError,
    },

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("merge cancelled after {merged} clouds")]
    Cancelled { merged: usize },
}

/// One cloud offered to the merger.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeInput {
    pub name: String,
    pub cloud: PointCloud,
    /// Known point pairs (cloud frame → anchor frame) seeding registration.
    pub correspondences: Option<Vec<Correspondence>>,
}

impl MergeInput {
    pub fn new(name: impl Into<String>, cloud: PointCloud) -> Self {
        Self {
            name: name.into(),
            cloud,
            correspondences: None,
        }
    }

    pub fn with_correspondences(mut self, pairs: Vec<Correspondence>) -> Self {
        self.correspondences = Some(pairs);
        self
    }
}

/// How a cloud was brought into the anchor frame.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeMethod {
    Anchor,
    SameFrame,
    Reprojected { from: UtmZone },
    Registered { residual: f64, iterations: usize },
}

impl fmt::Display for MergeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeMethod::Anchor => write!(f, "anchor"),
            MergeMethod::SameFrame => write!(f, "same frame"),
            MergeMethod::Reprojected { from } => write!(f, "reprojected from {}", from),
            MergeMethod::Registered { residual, iterations } => {
                write!(f, "registered ({:.4} m after {} iterations)", residual, iterations)
            }
        }
    }
}

/// Per-cloud accounting of a merge.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudMergeReport {
    pub index: usize,
    pub name: String,
    pub frame: Frame,
    pub method: MergeMethod,
    /// Transform into the anchor frame; `None` for reprojection.
    pub transform: Option<AlignmentTransform>,
    pub input_points: usize,
    pub outliers_removed: usize,
    pub downsampled_removed: usize,
    pub duplicates_removed: usize,
    pub merged_points: usize,
}

/// Merged cloud in the anchor frame, with one report per input (in input order).
#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult {
    pub cloud: PointCloud,
    pub reports: Vec<CloudMergeReport>,
    pub anchor: usize,
}

fn select_anchor(inputs: &[MergeInput], config: &MergeConfig) -> Result<usize, MergeError> {
    match config.anchor {
        Some(index) => {
            let input = inputs.get(index).ok_or(MergeError::AnchorOutOfRange {
                index,
                count: inputs.len(),
            })?;
            if !input.cloud.frame().is_utm() {
                return Err(MergeError::AnchorNotUtm {
                    index,
                    frame: input.cloud.frame().clone(),
                });
            }
            Ok(index)
        }
        None => inputs
            .iter()
            .position(|input| input.cloud.frame().is_utm())
            .ok_or(MergeError::NoAnchor),
    }
}

fn reproject(input: &MergeInput, index: usize, from: UtmZone, to: UtmZone) -> Result<PointCloud, MergeError> {
    let coords = input
        .cloud
        .to_coords()
        .into_iter()
        .map(|c| reproject_utm(c[0], c[1], from, to).map(|(e, n)| [e, n, c[2]]))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| MergeError::Geodesy {
            index,
            name: input.name.clone(),
            source,
        })?;
    let reprojected = PointCloud::from_coords(Frame::Utm(to), &coords);
    Ok(match input.cloud.intensities() {
        Some(intensity) => reprojected.with_intensity(intensity.to_vec())?,
        None => reprojected,
    })
}

/// Merges `inputs` into the frame of the anchor cloud.
///
/// The anchor is `config.anchor` or the first UTM-tagged input and is merged
/// first; the other inputs follow in input order. Source ids in the merged
/// cloud are input indices.
pub fn merge_clouds(
    inputs: &[MergeInput],
    config: &MergeConfig,
    registration: &RegistrationConfig,
    cancel: &CancelToken,
) -> Result<MergeResult, MergeError> {
    if inputs.is_empty() {
        return Err(MergeError::NoInputs);
    }
    let anchor = select_anchor(inputs, config)?;
    let anchor_frame = inputs[anchor].cloud.frame().clone();
    info!(
        "Merging {} clouds into {} (anchor '{}')",
        inputs.len(),
        anchor_frame,
        inputs[anchor].name
    );

    let mut merged = PointCloud::new(anchor_frame.clone());
    let mut anchor_cloud: Option<PointCloud> = None;
    let mut reports = Vec::with_capacity(inputs.len());

    let order = std::iter::once(anchor).chain((0..inputs.len()).filter(|&i| i != anchor));
    for index in order {
        if cancel.is_cancelled() {
            return Err(MergeError::Cancelled { merged: reports.len() });
        }
        let input = &inputs[index];
        let frame = input.cloud.frame().clone();

        let (aligned, method, transform) = if index == anchor {
            let identity = AlignmentTransform::identity(frame.clone());
            (input.cloud.clone(), MergeMethod::Anchor, Some(identity))
        } else if frame == anchor_frame {
            let identity = AlignmentTransform::identity(frame.clone());
            (input.cloud.clone(), MergeMethod::SameFrame, Some(identity))
        } else if let (Some(from), Some(to)) = (frame.utm_zone(), anchor_frame.utm_zone()) {
            let cloud = reproject(input, index, from, to)?;
            (cloud, MergeMethod::Reprojected { from }, None)
        } else {
            let target = anchor_cloud.as_ref().unwrap_or(&merged);
            let result = register(
                &input.cloud,
                target,
                input.correspondences.as_deref(),
                registration,
                cancel,
            )
            .map_err(|source| MergeError::Registration {
                index,
                name: input.name.clone(),
                source,
            })?;
            let method = MergeMethod::Registered {
                residual: result.residual,
                iterations: result.iterations,
            };
            let cloud = input.cloud.clone().transform(&result.transform)?;
            (cloud, method, Some(result.transform))
        };

        let input_points = aligned.len();
        let tagged = aligned.tagged(index as u32);
        let (cleaned, outliers_removed) = statistical_outlier_removal(&tagged, config.outlier_k, config.outlier_sigma);
        let (downsampled, downsampled_removed) = voxel_downsample(&cleaned, config.voxel_size);
        let (unique, duplicates_removed) = remove_duplicates(&downsampled, &merged, config.duplicate_tolerance_m);

        if unique.is_empty() {
            warn!("Cloud '{}' contributed no points after filtering", input.name);
        }
        merged.extend_from(&unique)?;
        if index == anchor {
            anchor_cloud = Some(unique.clone());
        }

        info!(
            "Cloud {} '{}' ({}): {} points, {} outliers, {} downsampled, {} duplicates, {} merged",
            index,
            input.name,
            method,
            input_points,
            outliers_removed,
            downsampled_removed,
            duplicates_removed,
            unique.len()
        );
        reports.push(CloudMergeReport {
            index,
            name: input.name.clone(),
            frame,
            method,
            transform,
            input_points,
            outliers_removed,
            downsampled_removed,
            duplicates_removed,
            merged_points: unique.len(),
        });
    }

    reports.sort_by_key(|r| r.index);
    info!("Merged cloud: {} points", merged.len());
    Ok(MergeResult {
        cloud: merged,
        reports,
        anchor,
    })
}
