//! Configuration types for the sonar fusion pipeline.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::transforms::Hemisphere;

/// Errors raised while loading, saving or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write config '{path}': {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Temporal alignment between the autopilot and sonar clocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignmentConfig {
    /// Max gap (s) between a sonar record and the autopilot span
    #[serde(default = "default_time_tolerance")]
    pub time_tolerance_s: f64,

    /// Known clock offset (s) added to sonar time to get autopilot time
    #[serde(default)]
    pub manual_offset_s: Option<f64>,

    /// Search window for the cross-correlation
    #[serde(default = "default_max_lag")]
    pub max_lag_s: f64,

    /// Resampling step of the speed profiles
    #[serde(default = "default_correlation_step")]
    pub correlation_step_s: f64,

    /// Speed std (m/s) below which a profile is considered featureless
    #[serde(default = "default_min_speed_std")]
    pub min_speed_std: f64,

    #[serde(default = "default_min_peak_correlation")]
    pub min_peak_correlation: f64,

    /// Required margin of the main peak over the best secondary peak
    #[serde(default = "default_min_peak_margin")]
    pub min_peak_margin: f64,

    /// Half-width around the main peak excluded from the secondary search
    #[serde(default = "default_peak_exclusion")]
    pub peak_exclusion_s: f64,

    /// Max disagreement between offsets implied by different sync markers
    #[serde(default = "default_marker_tolerance")]
    pub marker_tolerance_s: f64,
}

fn default_time_tolerance() -> f64 {
    1.0
}

fn default_max_lag() -> f64 {
    30.0
}

fn default_correlation_step() -> f64 {
    0.5
}

fn default_min_speed_std() -> f64 {
    0.05
}

fn default_min_peak_correlation() -> f64 {
    0.5
}

fn default_min_peak_margin() -> f64 {
    0.05
}

fn default_peak_exclusion() -> f64 {
    2.0
}

fn default_marker_tolerance() -> f64 {
    0.5
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            time_tolerance_s: default_time_tolerance(),
            manual_offset_s: None,
            max_lag_s: default_max_lag(),
            correlation_step_s: default_correlation_step(),
            min_speed_std: default_min_speed_std(),
            min_peak_correlation: default_min_peak_correlation(),
            min_peak_margin: default_min_peak_margin(),
            peak_exclusion_s: default_peak_exclusion(),
            marker_tolerance_s: default_marker_tolerance(),
        }
    }
}

/// Outlier classification and blending of the sonar trajectory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionConfig {
    /// Horizontal divergence (m) above which a sonar fix is an outlier
    #[serde(default = "default_outlier_distance")]
    pub outlier_distance_m: f64,

    /// Longest outlier run replaced sample by sample
    #[serde(default = "default_outlier_run_length")]
    pub outlier_run_length: usize,

    /// Autopilot weight at zero confidence
    #[serde(default = "default_blend_min_weight")]
    pub blend_min_weight: f64,

    /// Autopilot weight at full confidence
    #[serde(default = "default_blend_max_weight")]
    pub blend_max_weight: f64,
}

fn default_outlier_distance() -> f64 {
    5.0
}

fn default_outlier_run_length() -> usize {
    5
}

fn default_blend_min_weight() -> f64 {
    0.5
}

fn default_blend_max_weight() -> f64 {
    0.95
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            outlier_distance_m: default_outlier_distance(),
            outlier_run_length: default_outlier_run_length(),
            blend_min_weight: default_blend_min_weight(),
            blend_max_weight: default_blend_max_weight(),
        }
    }
}

/// Where point heights are referenced from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VerticalReference {
    /// Use the altitude of the corrected pose.
    PoseAltitude,
    /// Use a fixed water level (m, same datum as the poses).
    WaterLevel { level_m: f64 },
}

impl Default for VerticalReference {
    fn default() -> Self {
        VerticalReference::PoseAltitude
    }
}

/// Geometry of the point reconstruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructionConfig {
    /// Transducer lever arm in the body frame (forward, starboard, down), meters
    #[serde(default = "default_transducer_offset")]
    pub transducer_offset: [f64; 3],

    #[serde(default)]
    pub vertical_reference: VerticalReference,

    /// Pings processed between two cancellation checks
    #[serde(default = "default_cancel_check_interval")]
    pub cancel_check_interval: usize,

    /// Pings between corrected samples further apart than this are flagged
    /// LOW_CONFIDENCE (s)
    #[serde(default = "default_max_pose_gap")]
    pub max_pose_gap_s: f64,
}

fn default_transducer_offset() -> [f64; 3] {
    [0.0, 0.0, 0.5]
}

fn default_cancel_check_interval() -> usize {
    4096
}

fn default_max_pose_gap() -> f64 {
    5.0
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            transducer_offset: default_transducer_offset(),
            vertical_reference: VerticalReference::default(),
            cancel_check_interval: default_cancel_check_interval(),
            max_pose_gap_s: default_max_pose_gap(),
        }
    }
}

/// Cloud registration (closed form + ICP).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    #[serde(default = "default_icp_max_iterations")]
    pub icp_max_iterations: usize,

    /// Stop when the mean residual improves by less than this (m)
    #[serde(default = "default_icp_residual_tolerance")]
    pub icp_residual_tolerance: f64,

    /// Max mean residual (m) for an accepted registration
    #[serde(default = "default_icp_accept_threshold")]
    pub icp_accept_threshold: f64,

    /// Ignore pairs farther apart than this (m)
    #[serde(default)]
    pub max_correspondence_distance: Option<f64>,

    /// Estimate a uniform scale as well (photogrammetry models)
    #[serde(default)]
    pub estimate_scale: bool,

    /// Accept the best transform even above the threshold
    #[serde(default)]
    pub force_accept: bool,
}

fn default_icp_max_iterations() -> usize {
    50
}

fn default_icp_residual_tolerance() -> f64 {
    1e-4
}

fn default_icp_accept_threshold() -> f64 {
    0.5
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            icp_max_iterations: default_icp_max_iterations(),
            icp_residual_tolerance: default_icp_residual_tolerance(),
            icp_accept_threshold: default_icp_accept_threshold(),
            max_correspondence_distance: None,
            estimate_scale: false,
            force_accept: false,
        }
    }
}

/// Merge-time filtering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Voxel edge (m); 0 disables downsampling
    #[serde(default)]
    pub voxel_size: f64,

    /// Neighbours used by statistical outlier removal
    #[serde(default = "default_outlier_k")]
    pub outlier_k: usize,

    #[serde(default = "default_outlier_sigma")]
    pub outlier_sigma: f64,

    /// Points closer than this to an already merged point are duplicates
    #[serde(default = "default_duplicate_tolerance")]
    pub duplicate_tolerance_m: f64,

    /// Index of the anchor cloud; defaults to the first UTM cloud
    #[serde(default)]
    pub anchor: Option<usize>,
}

fn default_outlier_k() -> usize {
    20
}

fn default_outlier_sigma() -> f64 {
    2.0
}

fn default_duplicate_tolerance() -> f64 {
    0.01
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            voxel_size: 0.0,
            outlier_k: default_outlier_k(),
            outlier_sigma: default_outlier_sigma(),
            duplicate_tolerance_m: default_duplicate_tolerance(),
            anchor: None,
        }
    }
}

/// Scan-line segmentation of a survey.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationConfig {
    /// A waypoint counts as passed when a pose comes within this distance (m)
    #[serde(default = "default_waypoint_radius")]
    pub waypoint_radius_m: f64,

    /// The stretch before the first passed waypoint (or after the last one)
    /// becomes its own line when it exceeds this fraction of the poses
    #[serde(default = "default_edge_leg_fraction")]
    pub edge_leg_fraction: f64,
}

fn default_waypoint_radius() -> f64 {
    5.0
}

fn default_edge_leg_fraction() -> f64 {
    0.1
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            waypoint_radius_m: default_waypoint_radius(),
            edge_leg_fraction: default_edge_leg_fraction(),
        }
    }
}

/// Autopilot log decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutopilotConfig {
    /// GPS-UTC leap seconds
    #[serde(default = "default_leap_seconds")]
    pub leap_seconds: f64,

    /// Minimum GPS fix status kept (3 = 3D fix)
    #[serde(default = "default_min_fix_status")]
    pub min_fix_status: u8,
}

fn default_leap_seconds() -> f64 {
    18.0
}

fn default_min_fix_status() -> u8 {
    3
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            leap_seconds: default_leap_seconds(),
            min_fix_status: default_min_fix_status(),
        }
    }
}

/// Sonar log decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SonarConfig {
    /// Offset of the sonar's local clock from UTC (hours)
    #[serde(default)]
    pub timezone_offset_hours: f64,

    /// Hemisphere of the zone named in the log header
    #[serde(default = "default_hemisphere")]
    pub hemisphere: Hemisphere,

    /// Confidence assigned to the sonar's own fixes
    #[serde(default = "default_sonar_confidence")]
    pub confidence: f64,
}

fn default_hemisphere() -> Hemisphere {
    Hemisphere::North
}

fn default_sonar_confidence() -> f64 {
    0.5
}

impl Default for SonarConfig {
    fn default() -> Self {
        Self {
            timezone_offset_hours: 0.0,
            hemisphere: default_hemisphere(),
            confidence: default_sonar_confidence(),
        }
    }
}

/// Main pipeline configuration combining all sub-configs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub alignment: AlignmentConfig,

    #[serde(default)]
    pub correction: CorrectionConfig,

    #[serde(default)]
    pub reconstruction: ReconstructionConfig,

    #[serde(default)]
    pub registration: RegistrationConfig,

    #[serde(default)]
    pub merge: MergeConfig,

    #[serde(default)]
    pub segmentation: SegmentationConfig,

    #[serde(default)]
    pub autopilot: AutopilotConfig,

    #[serde(default)]
    pub sonar: SonarConfig,
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(invalid(field, format!("{} must be a finite value >= 0", value)));
    }
    Ok(())
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(invalid(field, format!("{} must be a finite value > 0", value)));
    }
    Ok(())
}

fn unit_interval(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(invalid(field, format!("{} must lie in [0, 1]", value)));
    }
    Ok(())
}

impl PipelineConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: PipelineConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(())
    }

    /// Rejects values no stage can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let a = &self.alignment;
        non_negative("alignment.time_tolerance_s", a.time_tolerance_s)?;
        non_negative("alignment.max_lag_s", a.max_lag_s)?;
        positive("alignment.correlation_step_s", a.correlation_step_s)?;
        non_negative("alignment.min_speed_std", a.min_speed_std)?;
        non_negative("alignment.peak_exclusion_s", a.peak_exclusion_s)?;
        non_negative("alignment.marker_tolerance_s", a.marker_tolerance_s)?;
        if let Some(offset) = a.manual_offset_s {
            if !offset.is_finite() {
                return Err(invalid("alignment.manual_offset_s", "must be finite"));
            }
        }

        let c = &self.correction;
        positive("correction.outlier_distance_m", c.outlier_distance_m)?;
        unit_interval("correction.blend_min_weight", c.blend_min_weight)?;
        unit_interval("correction.blend_max_weight", c.blend_max_weight)?;
        if c.blend_min_weight > c.blend_max_weight {
            return Err(invalid(
                "correction.blend_min_weight",
                "must not exceed correction.blend_max_weight",
            ));
        }

        if self.reconstruction.cancel_check_interval == 0 {
            return Err(invalid("reconstruction.cancel_check_interval", "must be at least 1"));
        }
        positive("reconstruction.max_pose_gap_s", self.reconstruction.max_pose_gap_s)?;
        if self.reconstruction.transducer_offset.iter().any(|v| !v.is_finite()) {
            return Err(invalid("reconstruction.transducer_offset", "must be finite"));
        }

        let r = &self.registration;
        non_negative("registration.icp_residual_tolerance", r.icp_residual_tolerance)?;
        non_negative("registration.icp_accept_threshold", r.icp_accept_threshold)?;
        if let Some(d) = r.max_correspondence_distance {
            positive("registration.max_correspondence_distance", d)?;
        }

        let m = &self.merge;
        non_negative("merge.voxel_size", m.voxel_size)?;
        non_negative("merge.outlier_sigma", m.outlier_sigma)?;
        non_negative("merge.duplicate_tolerance_m", m.duplicate_tolerance_m)?;
        if m.outlier_k == 0 {
            return Err(invalid("merge.outlier_k", "must be at least 1"));
        }

        positive("segmentation.waypoint_radius_m", self.segmentation.waypoint_radius_m)?;
        let edge = self.segmentation.edge_leg_fraction;
        if !(0.0..0.5).contains(&edge) {
            return Err(invalid("segmentation.edge_leg_fraction", format!("{} must lie in [0, 0.5)", edge)));
        }

        non_negative("autopilot.leap_seconds", self.autopilot.leap_seconds)?;
        unit_interval("sonar.confidence", self.sonar.confidence)?;
        if !self.sonar.timezone_offset_hours.is_finite() {
            return Err(invalid("sonar.timezone_offset_hours", "must be finite"));
        }

        Ok(())
    }
}
