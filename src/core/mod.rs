//! Core data types, geodesy and I/O operations.

pub mod cloud;
pub mod loaders;
pub mod transforms;
pub mod types;
pub mod writers;

pub use cloud::{orthonormalize, AlignmentTransform, CloudError, Correspondence, Point3D, PointCloud};
pub use loaders::{load_cloud, load_correspondences, read_ply_frame, CloudFormat, LoaderError};
pub use transforms::{Hemisphere, LocalTangentFrame, UtmZone, UtmZoneTable};
pub use types::{
    CorrectedPose, CorrectedTrajectory, Frame, FrameParseError, PingRecord, PoseQuality, SampleStatus, SourceTag,
    SyncMarker, TimestampedPose, Trajectory, TrajectoryIssue,
};
pub use writers::{write_cloud_csv, write_ply, write_trajectory_csv, ExportError};
