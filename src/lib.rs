//! Sonar survey fusion: trajectory correction, point reconstruction and
//! point cloud merging.
//!
//! This crate provides tools for:
//! - Decoding autopilot (ArduPilot DataFlash, CSV) and sonar (HYPACK HSX, CSV) logs
//! - Aligning the two clocks and correcting the sonar trajectory against the autopilot
//! - Reconstructing sonar returns as 3D points in UTM
//! - Registering and merging clouds from other sources (photogrammetry, older surveys)
//! - Splitting a survey into scan lines by the uploaded mission or at manual cut points
//!
//! # Example
//!
//! ```no_run
//! use sonar_fusion::pipeline::{AutopilotFormat, AutopilotInput, JobInputs, OutputSpec, SonarFormat, SonarInput};
//! use sonar_fusion::{PipelineConfig, ProcessingJob};
//!
//! let inputs = JobInputs::survey(
//!     AutopilotInput::File { path: "flight.bin".into(), format: AutopilotFormat::DataFlash },
//!     SonarInput::File { path: "line01.hsx".into(), format: SonarFormat::Hsx },
//! );
//! let outputs = OutputSpec { cloud: Some("survey.ply".into()), trajectory: Some("trajectory.csv".into()) };
//! let mut job = ProcessingJob::new(PipelineConfig::default(), inputs, outputs);
//! job.run().unwrap();
//! println!("{:?}", job.stats());
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod parsers;
pub mod pipeline;
pub mod processors;
pub mod visualization;

pub use config::{
    AlignmentConfig, CorrectionConfig, MergeConfig, PipelineConfig, ReconstructionConfig, RegistrationConfig,
    SegmentationConfig,
};
pub use core::{AlignmentTransform, CorrectedTrajectory, Frame, PingRecord, PointCloud, TimestampedPose, Trajectory};
pub use pipeline::{JobError, ProcessingJob, Stage};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
