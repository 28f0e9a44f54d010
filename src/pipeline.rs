//! Processing jobs: one survey (or merge-only) run from inputs to exports.
//!
//! A [`ProcessingJob`] owns its configuration, inputs and every intermediate
//! artifact. Stages run in a fixed order:
//!
//! ```text
//! Parse → Align → Correct → Reconstruct → Merge → Export
//! ```
//!
//! [`ProcessingJob::run`] only executes stages whose artifact is missing, so
//! after a recoverable failure (a registration above threshold, an unwritable
//! destination) the caller can adjust the configuration or outputs and call
//! `run` again without repeating the completed work.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{info, warn};
use thiserror::Error;

use crate::config::PipelineConfig;
use crate::core::loaders::{load_cloud_auto, load_correspondences, LoaderError};
use crate::core::writers::{write_cloud_csv, write_ply, write_trajectory_csv, ExportError};
use crate::core::{CloudFormat, Correspondence, CorrectedTrajectory, Frame, PointCloud, UtmZoneTable};
use crate::parsers::{
    AutopilotDecoder, AutopilotLog, CsvAutopilotDecoder, CsvSonarDecoder, DataFlashDecoder, HsxDecoder,
    ParseError, SonarDecoder, SonarLog,
};
use crate::processors::{
    align, correct, merge_clouds, reconstruct, AlignmentError, AlignmentResult, ClockOffset, CorrectionError,
    CorrectionResult, CorrectionStats, MergeError, MergeInput, MergeResult, Reconstruction, ReconstructionError,
    ReconstructionStats, RegistrationError,
};

pub use crate::processors::CancelToken;

/// Pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Parse,
    Align,
    Correct,
    Reconstruct,
    Merge,
    Export,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Parse => "parse",
            Stage::Align => "align",
            Stage::Correct => "correct",
            Stage::Reconstruct => "reconstruct",
            Stage::Merge => "merge",
            Stage::Export => "export",
        };
        f.write_str(name)
    }
}

/// Errors that end a job run. Artifacts of completed stages are kept.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("missing input: {0}")]
    MissingInput(&'static str),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("loading cloud '{name}': {source}")]
    Cloud {
        name: String,
        #[source]
        source: LoaderError,
    },

    #[error(transparent)]
    Alignment(#[from] AlignmentError),

    #[error(transparent)]
    Correction(#[from] CorrectionError),

    #[error(transparent)]
    Reconstruction(#[from] ReconstructionError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error("cancelled during {stage}")]
    Cancelled { stage: Stage },

    #[error("job worker thread panicked")]
    WorkerPanicked,
}

impl JobError {
    /// Stage the error was raised in; `None` when the worker died.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            JobError::MissingInput(_) | JobError::Parse(_) | JobError::Cloud { .. } => Some(Stage::Parse),
            JobError::Alignment(_) => Some(Stage::Align),
            JobError::Correction(_) => Some(Stage::Correct),
            JobError::Reconstruction(_) => Some(Stage::Reconstruct),
            JobError::Merge(_) => Some(Stage::Merge),
            JobError::Export(_) => Some(Stage::Export),
            JobError::Cancelled { stage } => Some(*stage),
            JobError::WorkerPanicked => None,
        }
    }

    /// True when a registration exceeded its acceptance threshold; the job
    /// can be re-run with `force_accept` or with correspondences.
    pub fn is_registration_rejection(&self) -> bool {
        matches!(
            self,
            JobError::Merge(MergeError::Registration {
                source: RegistrationError::ResidualAboveThreshold { .. },
                ..
            })
        )
    }
}

/// Autopilot log encodings.
#[derive(Debug, Clone, PartialEq)]
pub enum AutopilotFormat {
    DataFlash,
    /// Pose CSV; `frame` applies to rows without a `frame` column.
    Csv { frame: Frame },
}

/// Sonar log encodings.
#[derive(Debug, Clone, PartialEq)]
pub enum SonarFormat {
    Hsx,
    Csv { frame: Frame },
}

#[derive(Debug, Clone)]
pub enum AutopilotInput {
    File { path: PathBuf, format: AutopilotFormat },
    Decoded(AutopilotLog),
}

#[derive(Debug, Clone)]
pub enum SonarInput {
    File { path: PathBuf, format: SonarFormat },
    Decoded(SonarLog),
}

/// Where an auxiliary cloud comes from.
#[derive(Debug, Clone)]
pub enum CloudSource {
    /// Format is taken from the extension; `frame` is the caller's declaration.
    File { path: PathBuf, frame: Frame },
    Loaded(PointCloud),
}

#[derive(Debug, Clone)]
pub enum PairSource {
    File(PathBuf),
    Loaded(Vec<Correspondence>),
}

/// An auxiliary cloud to merge with the survey.
#[derive(Debug, Clone)]
pub struct CloudInput {
    pub name: String,
    pub source: CloudSource,
    pub correspondences: Option<PairSource>,
}

impl CloudInput {
    pub fn file(path: impl Into<PathBuf>, frame: Frame) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            name,
            source: CloudSource::File { path, frame },
            correspondences: None,
        }
    }

    pub fn loaded(name: impl Into<String>, cloud: PointCloud) -> Self {
        Self {
            name: name.into(),
            source: CloudSource::Loaded(cloud),
            correspondences: None,
        }
    }

    pub fn with_correspondences(mut self, pairs: PairSource) -> Self {
        self.correspondences = Some(pairs);
        self
    }
}

/// Job inputs. A survey job has both logs; a merge-only job has neither.
#[derive(Debug, Clone, Default)]
pub struct JobInputs {
    pub autopilot: Option<AutopilotInput>,
    pub sonar: Option<SonarInput>,
    pub clouds: Vec<CloudInput>,
}

impl JobInputs {
    pub fn survey(autopilot: AutopilotInput, sonar: SonarInput) -> Self {
        Self {
            autopilot: Some(autopilot),
            sonar: Some(sonar),
            clouds: Vec::new(),
        }
    }

    pub fn merge_only(clouds: Vec<CloudInput>) -> Self {
        Self {
            autopilot: None,
            sonar: None,
            clouds,
        }
    }

    pub fn is_survey(&self) -> bool {
        self.autopilot.is_some() || self.sonar.is_some()
    }
}

/// Export destinations. A cloud path ending in `.csv` is written as CSV,
/// anything else as PLY.
#[derive(Debug, Clone, Default)]
pub struct OutputSpec {
    pub cloud: Option<PathBuf>,
    pub trajectory: Option<PathBuf>,
}

/// Intermediate results owned by a job.
#[derive(Debug, Clone, Default)]
pub struct JobArtifacts {
    pub autopilot: Option<AutopilotLog>,
    pub sonar: Option<SonarLog>,
    pub clouds: Option<Vec<MergeInput>>,
    pub alignment: Option<AlignmentResult>,
    pub correction: Option<CorrectionResult>,
    pub reconstruction: Option<Reconstruction>,
    pub merge: Option<MergeResult>,
    /// Files written by the export stage.
    pub exported: Option<Vec<PathBuf>>,
}

impl JobArtifacts {
    /// Drops the artifacts of `stage` and every later stage.
    fn clear_from(&mut self, stage: Stage) {
        if stage <= Stage::Parse {
            self.autopilot = None;
            self.sonar = None;
            self.clouds = None;
        }
        if stage <= Stage::Align {
            self.alignment = None;
        }
        if stage <= Stage::Correct {
            self.correction = None;
        }
        if stage <= Stage::Reconstruct {
            self.reconstruction = None;
        }
        if stage <= Stage::Merge {
            self.merge = None;
        }
        self.exported = None;
    }
}

/// Summary counters of a job, derived from its artifacts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobStats {
    pub pings: usize,
    pub clock_offset: Option<ClockOffset>,
    pub unmatched_pings: usize,
    pub correction: Option<CorrectionStats>,
    pub reconstruction: Option<ReconstructionStats>,
    pub clouds_merged: usize,
    pub output_points: usize,
}

/// One processing run.
#[derive(Debug)]
pub struct ProcessingJob {
    pub config: PipelineConfig,
    pub inputs: JobInputs,
    pub outputs: OutputSpec,
    zones: Arc<UtmZoneTable>,
    cancel: CancelToken,
    artifacts: JobArtifacts,
}

impl ProcessingJob {
    pub fn new(config: PipelineConfig, inputs: JobInputs, outputs: OutputSpec) -> Self {
        Self::with_zone_table(config, inputs, outputs, Arc::new(UtmZoneTable::standard()))
    }

    /// Shares an already constructed zone table between jobs.
    pub fn with_zone_table(
        config: PipelineConfig,
        inputs: JobInputs,
        outputs: OutputSpec,
        zones: Arc<UtmZoneTable>,
    ) -> Self {
        Self {
            config,
            inputs,
            outputs,
            zones,
            cancel: CancelToken::new(),
            artifacts: JobArtifacts::default(),
        }
    }

    pub fn artifacts(&self) -> &JobArtifacts {
        &self.artifacts
    }

    /// Token that cancels this job from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Discards the artifacts of `stage` and later, so the next `run`
    /// recomputes them (e.g. after changing the configuration).
    pub fn reset_from(&mut self, stage: Stage) {
        info!("Resetting job from the {} stage", stage);
        self.artifacts.clear_from(stage);
    }

    /// Corrected trajectory, once the correction stage has run.
    pub fn corrected_trajectory(&self) -> Option<&CorrectedTrajectory> {
        self.artifacts.correction.as_ref().map(|c| &c.trajectory)
    }

    /// The cloud the export stage writes: the merge result when a merge ran,
    /// otherwise the reconstructed survey cloud.
    pub fn output_cloud(&self) -> Option<&PointCloud> {
        self.artifacts
            .merge
            .as_ref()
            .map(|m| &m.cloud)
            .or_else(|| self.artifacts.reconstruction.as_ref().map(|r| &r.cloud))
    }

    pub fn stats(&self) -> JobStats {
        let a = &self.artifacts;
        JobStats {
            pings: a.sonar.as_ref().map_or(0, |s| s.pings.len()),
            clock_offset: a.alignment.as_ref().map(|al| al.offset),
            unmatched_pings: a.alignment.as_ref().map_or(0, |al| al.unmatched_pings.len()),
            correction: a.correction.as_ref().map(|c| c.stats.clone()),
            reconstruction: a.reconstruction.as_ref().map(|r| r.stats.clone()),
            clouds_merged: a.merge.as_ref().map_or(0, |m| m.reports.len()),
            output_points: self.output_cloud().map_or(0, PointCloud::len),
        }
    }

    fn checkpoint(&self, stage: Stage) -> Result<(), JobError> {
        if self.cancel.is_cancelled() {
            warn!("Job cancelled before the {} stage", stage);
            return Err(JobError::Cancelled { stage });
        }
        Ok(())
    }

    /// Runs every stage whose artifact is missing.
    pub fn run(&mut self) -> Result<(), JobError> {
        self.run_through(Stage::Export)
    }

    /// Runs the missing stages up to and including `last`.
    pub fn run_through(&mut self, last: Stage) -> Result<(), JobError> {
        let survey = self.inputs.is_survey();
        if !survey && self.inputs.clouds.is_empty() {
            return Err(JobError::MissingInput("autopilot and sonar logs, or clouds to merge"));
        }

        self.checkpoint(Stage::Parse)?;
        self.parse()?;

        if survey {
            for stage in [Stage::Align, Stage::Correct, Stage::Reconstruct] {
                if stage > last {
                    return Ok(());
                }
                self.checkpoint(stage)?;
                match stage {
                    Stage::Align => self.align()?,
                    Stage::Correct => self.correct()?,
                    _ => self.reconstruct()?,
                }
            }
        }

        let has_clouds = self.artifacts.clouds.as_ref().is_some_and(|c| !c.is_empty());
        if has_clouds && last >= Stage::Merge {
            self.checkpoint(Stage::Merge)?;
            self.merge()?;
        }

        if last >= Stage::Export {
            self.checkpoint(Stage::Export)?;
            self.export()?;
        }
        Ok(())
    }

    fn parse(&mut self) -> Result<(), JobError> {
        if self.inputs.is_survey() {
            if self.artifacts.autopilot.is_none() {
                let input = self.inputs.autopilot.as_ref().ok_or(JobError::MissingInput("autopilot log"))?;
                self.artifacts.autopilot = Some(self.decode_autopilot(input)?);
            }
            if self.artifacts.sonar.is_none() {
                let input = self.inputs.sonar.as_ref().ok_or(JobError::MissingInput("sonar log"))?;
                self.artifacts.sonar = Some(self.decode_sonar(input)?);
            }
        }
        if self.artifacts.clouds.is_none() {
            let clouds = self
                .inputs
                .clouds
                .iter()
                .map(load_cloud_input)
                .collect::<Result<Vec<_>, _>>()?;
            self.artifacts.clouds = Some(clouds);
        }
        Ok(())
    }

    fn decode_autopilot(&self, input: &AutopilotInput) -> Result<AutopilotLog, JobError> {
        let (path, format) = match input {
            AutopilotInput::Decoded(log) => return Ok(log.clone()),
            AutopilotInput::File { path, format } => (path, format),
        };
        let decoder: Box<dyn AutopilotDecoder> = match format {
            AutopilotFormat::DataFlash => Box::new(DataFlashDecoder::new(&self.config.autopilot, self.zones.clone())),
            AutopilotFormat::Csv { frame } => Box::new(CsvAutopilotDecoder::new(frame.clone())),
        };
        info!("Decoding autopilot log {} ({})", path.display(), decoder.name());
        let log = decoder.decode_file(path)?;
        info!(
            "Autopilot log: {} poses, {} sync markers",
            log.trajectory.len(),
            log.markers.len()
        );
        Ok(log)
    }

    fn decode_sonar(&self, input: &SonarInput) -> Result<SonarLog, JobError> {
        let (path, format) = match input {
            SonarInput::Decoded(log) => return Ok(log.clone()),
            SonarInput::File { path, format } => (path, format),
        };
        let decoder: Box<dyn SonarDecoder> = match format {
            SonarFormat::Hsx => Box::new(HsxDecoder::new(&self.config.sonar)),
            SonarFormat::Csv { frame } => Box::new(CsvSonarDecoder::new(frame.clone(), self.config.sonar.confidence)),
        };
        info!("Decoding sonar log {} ({})", path.display(), decoder.name());
        let log = decoder.decode_file(path)?;
        info!(
            "Sonar log: {} fixes, {} pings, {} sync markers",
            log.trajectory.len(),
            log.pings.len(),
            log.markers.len()
        );
        Ok(log)
    }

    fn align(&mut self) -> Result<(), JobError> {
        if self.artifacts.alignment.is_some() {
            return Ok(());
        }
        let (Some(autopilot), Some(sonar)) = (&self.artifacts.autopilot, &self.artifacts.sonar) else {
            return Err(JobError::MissingInput("decoded logs"));
        };
        self.artifacts.alignment = Some(align(autopilot, sonar, &self.config.alignment)?);
        Ok(())
    }

    fn correct(&mut self) -> Result<(), JobError> {
        if self.artifacts.correction.is_some() {
            return Ok(());
        }
        let alignment = self.artifacts.alignment.as_ref().ok_or(JobError::MissingInput("alignment"))?;
        self.artifacts.correction = Some(correct(alignment, &self.config.correction)?);
        Ok(())
    }

    fn reconstruct(&mut self) -> Result<(), JobError> {
        if self.artifacts.reconstruction.is_some() {
            return Ok(());
        }
        let (Some(sonar), Some(alignment), Some(correction)) = (
            &self.artifacts.sonar,
            &self.artifacts.alignment,
            &self.artifacts.correction,
        ) else {
            return Err(JobError::MissingInput("corrected trajectory"));
        };
        let result = reconstruct(
            &sonar.pings,
            alignment,
            &correction.trajectory,
            &self.config.reconstruction,
            &self.zones,
            &self.cancel,
        );
        match result {
            Ok(mut reconstruction) => {
                // The survey cloud is provenance 0 whether or not a merge follows
                reconstruction.cloud = reconstruction.cloud.tagged(0);
                self.artifacts.reconstruction = Some(reconstruction);
                Ok(())
            }
            Err(ReconstructionError::Cancelled { .. }) => Err(JobError::Cancelled {
                stage: Stage::Reconstruct,
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn merge(&mut self) -> Result<(), JobError> {
        if self.artifacts.merge.is_some() {
            return Ok(());
        }
        let mut inputs = Vec::new();
        if let Some(reconstruction) = &self.artifacts.reconstruction {
            inputs.push(MergeInput::new("survey", reconstruction.cloud.clone()));
        }
        inputs.extend(self.artifacts.clouds.iter().flatten().cloned());

        match merge_clouds(&inputs, &self.config.merge, &self.config.registration, &self.cancel) {
            Ok(result) => {
                self.artifacts.merge = Some(result);
                Ok(())
            }
            Err(MergeError::Cancelled { .. })
            | Err(MergeError::Registration {
                source: RegistrationError::Cancelled { .. },
                ..
            }) => Err(JobError::Cancelled { stage: Stage::Merge }),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes the requested outputs. Safe to call again after a failure.
    pub fn export(&mut self) -> Result<(), JobError> {
        if self.artifacts.exported.is_some() {
            return Ok(());
        }
        let mut written = Vec::new();

        if let Some(path) = &self.outputs.trajectory {
            match self.corrected_trajectory() {
                Some(trajectory) => {
                    write_trajectory_csv(path, trajectory)?;
                    info!("Wrote corrected trajectory ({} samples) to {}", trajectory.len(), path.display());
                    written.push(path.clone());
                }
                None => warn!("No corrected trajectory to write to {}", path.display()),
            }
        }

        if let Some(path) = &self.outputs.cloud {
            match self.output_cloud() {
                Some(cloud) => {
                    write_cloud(path, cloud)?;
                    info!("Wrote {} points to {}", cloud.len(), path.display());
                    written.push(path.clone());
                }
                None => warn!("No point cloud to write to {}", path.display()),
            }
        }

        self.artifacts.exported = Some(written);
        Ok(())
    }

    /// Runs the job on a named worker thread.
    pub fn spawn(self) -> std::io::Result<JobHandle> {
        self.spawn_through(Stage::Export)
    }

    /// Runs the stages up to `last` on a named worker thread.
    pub fn spawn_through(self, last: Stage) -> std::io::Result<JobHandle> {
        let cancel = self.cancel_token();
        let handle = thread::Builder::new().name("sonar-fusion-job".into()).spawn(move || {
            let mut job = self;
            let result = job.run_through(last);
            JobOutcome { job, result }
        })?;
        Ok(JobHandle { cancel, handle })
    }
}

fn write_cloud(path: &Path, cloud: &PointCloud) -> Result<(), ExportError> {
    match CloudFormat::from_path(path) {
        Some(CloudFormat::Csv) => write_cloud_csv(path, cloud),
        _ => write_ply(path, cloud),
    }
}

fn load_cloud_input(input: &CloudInput) -> Result<MergeInput, JobError> {
    let wrap = |source| JobError::Cloud {
        name: input.name.clone(),
        source,
    };
    let cloud = match &input.source {
        CloudSource::Loaded(cloud) => cloud.clone(),
        CloudSource::File { path, frame } => {
            let cloud = load_cloud_auto(path, frame.clone()).map_err(wrap)?;
            info!("Loaded cloud '{}': {} points in {}", input.name, cloud.len(), cloud.frame());
            cloud
        }
    };
    let pairs = match &input.correspondences {
        None => None,
        Some(PairSource::Loaded(pairs)) => Some(pairs.clone()),
        Some(PairSource::File(path)) => Some(load_correspondences(path).map_err(wrap)?),
    };
    let merge_input = MergeInput::new(input.name.clone(), cloud);
    Ok(match pairs {
        Some(pairs) => merge_input.with_correspondences(pairs),
        None => merge_input,
    })
}

/// Finished job and the result of its run.
#[derive(Debug)]
pub struct JobOutcome {
    pub job: ProcessingJob,
    pub result: Result<(), JobError>,
}

/// Handle to a job running on a worker thread.
#[derive(Debug)]
pub struct JobHandle {
    cancel: CancelToken,
    handle: JoinHandle<JobOutcome>,
}

impl JobHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> Result<JobOutcome, JobError> {
        self.handle.join().map_err(|_| JobError::WorkerPanicked)
    }
}
