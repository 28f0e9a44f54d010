//! Pipeline stages and cloud operations.

pub mod alignment;
pub mod correction;
pub mod filtering;
pub mod merging;
pub mod reconstruction;
pub mod registration;
pub mod segmentation;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// Re-export key types for convenience
pub use alignment::{align, estimate_offset, AlignmentError, AlignmentResult, ClockOffset, OffsetSource};
pub use correction::{correct, CorrectionError, CorrectionResult, CorrectionStats};
pub use filtering::{remove_duplicates, statistical_outlier_removal, voxel_downsample};
pub use merging::{merge_clouds, CloudMergeReport, MergeError, MergeInput, MergeMethod, MergeResult};
pub use reconstruction::{reconstruct, Reconstruction, ReconstructionError, ReconstructionStats};
pub use registration::{fit_correspondences, register, Correspondence, Registration, RegistrationError, SeedKind};
pub use segmentation::{
    flown_mission_scan_lines, fraction_scan_lines, mission_scan_lines, select_mission, split_sonar_log,
    split_trajectory, ScanLine, SegmentationError,
};

/// Shared cancellation flag polled by long-running stages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
