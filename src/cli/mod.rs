//! Command-line interface for the sonar fusion pipeline.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};

use crate::core::loaders::load_cloud_auto;
use crate::core::Frame;
use crate::parsers::write_sonar_csv;
use crate::pipeline::{
    AutopilotFormat, AutopilotInput, CloudInput, JobInputs, JobOutcome, OutputSpec, PairSource,
    ProcessingJob, SonarFormat, SonarInput, Stage,
};
use crate::processors::segmentation::{flown_mission_scan_lines, fraction_scan_lines, split_sonar_log};
use crate::visualization;
use crate::PipelineConfig;

#[derive(Parser)]
#[command(name = "sonar-fusion")]
#[command(about = "Sonar trajectory correction and point cloud merging", version)]
pub struct Cli {
    /// Path to YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Log inputs shared by the survey commands.
#[derive(clap::Args, Debug)]
struct LogArgs {
    /// Autopilot log (DataFlash .bin/.log, or pose .csv)
    #[arg(long)]
    autopilot: PathBuf,

    /// Sonar log (HYPACK .hsx, or sonar .csv)
    #[arg(long)]
    sonar: PathBuf,

    /// Frame of CSV logs without a frame column (enu, local:NAME, utm:ZONE)
    #[arg(long, default_value = "enu")]
    csv_frame: Frame,

    /// Clock offset in seconds added to sonar time (skips estimation)
    #[arg(long, allow_hyphen_values = true)]
    offset: Option<f64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Full survey: align, correct, reconstruct, merge extra clouds, export
    Process {
        #[command(flatten)]
        logs: LogArgs,

        /// Extra cloud to merge, as PATH@FRAME or PATH@FRAME+PAIRS.csv
        #[arg(long = "cloud", value_parser = parse_cloud_arg)]
        clouds: Vec<CloudInput>,

        /// Output cloud (.ply or .csv)
        #[arg(short, long)]
        output: PathBuf,

        /// Corrected trajectory CSV
        #[arg(long)]
        trajectory: Option<PathBuf>,

        /// Accept registrations above the residual threshold
        #[arg(long)]
        force_accept: bool,
    },

    /// Align and correct the sonar trajectory, then export it
    Correct {
        #[command(flatten)]
        logs: LogArgs,

        /// Corrected trajectory CSV
        #[arg(short, long)]
        output: PathBuf,

        /// Review plot (PNG)
        #[arg(long)]
        plot: Option<PathBuf>,
    },

    /// Estimate the clock offset between the two logs
    Offset {
        #[command(flatten)]
        logs: LogArgs,
    },

    /// Split the sonar log into scan lines, one sonar CSV per line
    Split {
        #[command(flatten)]
        logs: LogArgs,

        /// Output directory for line_NNN.csv files
        #[arg(short, long)]
        output: PathBuf,

        /// Cut points as fractions of the flight (e.g. 0.3,0.6); default splits by mission waypoints
        #[arg(long, value_delimiter = ',')]
        at: Vec<f64>,
    },

    /// Merge clouds into the frame of a UTM-tagged anchor
    Merge {
        /// Clouds as PATH@FRAME or PATH@FRAME+PAIRS.csv
        #[arg(required = true, value_parser = parse_cloud_arg)]
        clouds: Vec<CloudInput>,

        /// Output cloud (.ply or .csv)
        #[arg(short, long)]
        output: PathBuf,

        /// Index of the anchor cloud (defaults to the first UTM cloud)
        #[arg(long)]
        anchor: Option<usize>,

        /// Voxel size for downsampling (m)
        #[arg(long)]
        voxel_size: Option<f64>,

        /// Accept registrations above the residual threshold
        #[arg(long)]
        force_accept: bool,
    },

    /// Plot a cloud (PLY, CSV or XYZ) top-down as PNG
    Plot {
        /// Input cloud
        cloud: PathBuf,

        /// Output PNG (defaults to the input name with .png)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Maximum number of points to plot (subsamples if exceeded)
        #[arg(long, default_value_t = 1_000_000)]
        max_points: usize,

        /// Alpha/transparency value for points (0.0 to 1.0)
        #[arg(long, default_value_t = 0.5)]
        alpha: f32,
    },

    /// Write the default configuration as YAML
    InitConfig {
        #[arg(default_value = "sonar-fusion.yaml")]
        path: PathBuf,
    },
}

/// Parses `PATH@FRAME[+PAIRS.csv]`.
fn parse_cloud_arg(arg: &str) -> std::result::Result<CloudInput, String> {
    let (path, rest) = arg
        .rsplit_once('@')
        .ok_or_else(|| format!("'{}' is not PATH@FRAME[+PAIRS.csv]", arg))?;
    let (frame, pairs) = match rest.split_once('+') {
        Some((frame, pairs)) => (frame, Some(pairs)),
        None => (rest, None),
    };
    let frame: Frame = frame.parse().map_err(|e| format!("{}", e))?;
    if path.is_empty() {
        return Err(format!("'{}' has an empty path", arg));
    }
    let input = CloudInput::file(path, frame);
    Ok(match pairs {
        Some(p) if !p.is_empty() => input.with_correspondences(PairSource::File(PathBuf::from(p))),
        _ => input,
    })
}

fn autopilot_input(path: &Path, csv_frame: &Frame) -> AutopilotInput {
    let is_csv = path.extension().is_some_and(|e| e.eq_ignore_ascii_case("csv"));
    let format = if is_csv {
        AutopilotFormat::Csv {
            frame: csv_frame.clone(),
        }
    } else {
        AutopilotFormat::DataFlash
    };
    AutopilotInput::File {
        path: path.to_path_buf(),
        format,
    }
}

fn sonar_input(path: &Path, csv_frame: &Frame) -> SonarInput {
    let is_csv = path.extension().is_some_and(|e| e.eq_ignore_ascii_case("csv"));
    let format = if is_csv {
        SonarFormat::Csv {
            frame: csv_frame.clone(),
        }
    } else {
        SonarFormat::Hsx
    };
    SonarInput::File {
        path: path.to_path_buf(),
        format,
    }
}

fn survey_inputs(logs: &LogArgs) -> JobInputs {
    JobInputs::survey(
        autopilot_input(&logs.autopilot, &logs.csv_frame),
        sonar_input(&logs.sonar, &logs.csv_frame),
    )
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Print a summary box
fn print_summary(title: &str, items: &[(&str, String)]) {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║ {:<60} ║", title);
    println!("╠══════════════════════════════════════════════════════════════╣");
    for (key, value) in items {
        let display_value = if value.chars().count() > 37 {
            format!("{}...", value.chars().take(34).collect::<String>())
        } else {
            value.clone()
        };
        println!("║ {:<20}: {:<37} ║", key, display_value);
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}

/// Runs `job` through `last` on a worker thread behind a spinner.
fn run_job(job: ProcessingJob, last: Stage, message: &str) -> Result<ProcessingJob> {
    let spinner = create_spinner(message);
    let outcome = job
        .spawn_through(last)
        .context("failed to start job thread")
        .and_then(|handle| Ok(handle.join()?));
    spinner.finish_and_clear();

    let JobOutcome { job, result } = outcome?;
    match result {
        Ok(()) => Ok(job),
        Err(e) => {
            if e.is_registration_rejection() {
                warn!("Re-run with --force-accept, or supply correspondences as PATH@FRAME+PAIRS.csv");
            }
            let stage = e.stage().map_or_else(|| "worker".to_string(), |s| s.to_string());
            Err(anyhow::Error::new(e).context(format!("{} stage failed", stage)))
        }
    }
}

pub fn run() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity (must come first)
    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .format_timestamp_secs()
        .init();

    let config = match &cli.config {
        Some(path) => match PipelineConfig::from_yaml(path) {
            Ok(cfg) => {
                info!("Loaded config from: {}", path.display());
                cfg
            }
            Err(e) => {
                warn!("Failed to load config from {}: {}, using defaults", path.display(), e);
                PipelineConfig::default()
            }
        },
        None => PipelineConfig::default(),
    };

    let result = match cli.command {
        Commands::Process {
            logs,
            clouds,
            output,
            trajectory,
            force_accept,
        } => cmd_process(config, &logs, clouds, &output, trajectory, force_accept),
        Commands::Correct { logs, output, plot } => cmd_correct(config, &logs, &output, plot.as_deref()),
        Commands::Offset { logs } => cmd_offset(config, &logs),
        Commands::Split { logs, output, at } => cmd_split(config, &logs, &output, &at),
        Commands::Merge {
            clouds,
            output,
            anchor,
            voxel_size,
            force_accept,
        } => cmd_merge(config, clouds, &output, anchor, voxel_size, force_accept),
        Commands::Plot {
            cloud,
            output,
            max_points,
            alpha,
        } => cmd_plot(&cloud, output, max_points, alpha),
        Commands::InitConfig { path } => cmd_init_config(&path),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn apply_offset(config: &mut PipelineConfig, logs: &LogArgs) {
    if let Some(offset) = logs.offset {
        config.alignment.manual_offset_s = Some(offset);
    }
}

fn cmd_process(
    mut config: PipelineConfig,
    logs: &LogArgs,
    clouds: Vec<CloudInput>,
    output: &Path,
    trajectory: Option<PathBuf>,
    force_accept: bool,
) -> Result<()> {
    let start = Instant::now();
    apply_offset(&mut config, logs);
    config.registration.force_accept |= force_accept;

    let mut inputs = survey_inputs(logs);
    inputs.clouds = clouds;
    let outputs = OutputSpec {
        cloud: Some(output.to_path_buf()),
        trajectory: trajectory.clone(),
    };

    let job = run_job(ProcessingJob::new(config, inputs, outputs), Stage::Export, "Processing survey...")?;
    let stats = job.stats();

    let mut items = vec![
        ("Autopilot log", logs.autopilot.display().to_string()),
        ("Sonar log", logs.sonar.display().to_string()),
        ("Pings", stats.pings.to_string()),
        (
            "Clock offset",
            stats
                .clock_offset
                .map_or_else(|| "-".to_string(), |o| format!("{:+.3} s ({})", o.offset_s, o.source)),
        ),
    ];
    if let Some(c) = &stats.correction {
        items.push(("Outliers replaced", c.replaced.to_string()));
        items.push(("Low confidence", (c.interpolated + c.held).to_string()));
    }
    if let Some(r) = &stats.reconstruction {
        items.push(("Points reconstructed", r.reconstructed.to_string()));
        items.push((
            "Pings discarded",
            (r.discarded_unmatched + r.discarded_no_pose).to_string(),
        ));
    }
    if let Some(merge) = &job.artifacts().merge {
        for report in &merge.reports {
            items.push(("Merged cloud", format!("{}: {}", report.name, report.method)));
        }
    }
    items.push(("Output points", stats.output_points.to_string()));
    items.push(("Output", output.display().to_string()));
    if let Some(path) = &trajectory {
        items.push(("Trajectory", path.display().to_string()));
    }
    items.push(("Duration", format!("{:.2?}", start.elapsed())));

    print_summary("Survey Processing Complete", &items);
    Ok(())
}

fn cmd_correct(mut config: PipelineConfig, logs: &LogArgs, output: &Path, plot: Option<&Path>) -> Result<()> {
    let start = Instant::now();
    apply_offset(&mut config, logs);

    let outputs = OutputSpec {
        cloud: None,
        trajectory: Some(output.to_path_buf()),
    };
    let mut job = run_job(
        ProcessingJob::new(config, survey_inputs(logs), outputs),
        Stage::Correct,
        "Correcting trajectory...",
    )?;
    job.export().context("exporting corrected trajectory")?;

    if let Some(plot_path) = plot {
        let artifacts = job.artifacts();
        if let (Some(ap), Some(sonar), Some(corrected)) =
            (&artifacts.autopilot, &artifacts.sonar, job.corrected_trajectory())
        {
            visualization::plot_trajectory_correction(plot_path, &ap.trajectory, &sonar.trajectory, corrected)
                .with_context(|| format!("plotting {}", plot_path.display()))?;
        }
    }

    let stats = job.stats();
    let correction = stats.correction.unwrap_or_default();
    print_summary(
        "Trajectory Correction Complete",
        &[
            ("Samples", correction.samples.to_string()),
            ("Blended", correction.blended.to_string()),
            ("Replaced", correction.replaced.to_string()),
            ("Interpolated", correction.interpolated.to_string()),
            ("Held", correction.held.to_string()),
            ("Max divergence", format!("{:.2} m", correction.max_divergence_m)),
            ("Output", output.display().to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );
    Ok(())
}

fn cmd_offset(mut config: PipelineConfig, logs: &LogArgs) -> Result<()> {
    apply_offset(&mut config, logs);
    let job = run_job(
        ProcessingJob::new(config, survey_inputs(logs), OutputSpec::default()),
        Stage::Align,
        "Estimating clock offset...",
    )?;
    let Some(alignment) = &job.artifacts().alignment else {
        bail!("alignment produced no result");
    };

    print_summary(
        "Clock Offset",
        &[
            ("Offset", format!("{:+.3} s", alignment.offset.offset_s)),
            ("Source", alignment.offset.source.to_string()),
            ("Matched fixes", alignment.fixes.len().to_string()),
            ("Unmatched fixes", alignment.unmatched_fixes.len().to_string()),
            ("Matched pings", alignment.pings.len().to_string()),
            ("Unmatched pings", alignment.unmatched_pings.len().to_string()),
        ],
    );
    Ok(())
}

fn line_file_name(index: usize) -> String {
    format!("line_{:03}.csv", index + 1)
}

fn cmd_split(mut config: PipelineConfig, logs: &LogArgs, output: &Path, at: &[f64]) -> Result<()> {
    let start = Instant::now();
    apply_offset(&mut config, logs);
    let segmentation = config.segmentation.clone();

    let job = run_job(
        ProcessingJob::new(config, survey_inputs(logs), OutputSpec::default()),
        Stage::Align,
        "Aligning logs...",
    )?;
    let artifacts = job.artifacts();
    let (Some(autopilot), Some(sonar), Some(alignment)) = (&artifacts.autopilot, &artifacts.sonar, &artifacts.alignment)
    else {
        bail!("alignment produced no result");
    };

    let (lines, method) = if at.is_empty() {
        let lines = flown_mission_scan_lines(&autopilot.trajectory, &autopilot.missions, &segmentation)
            .context("splitting by mission waypoints")?;
        (lines, "mission waypoints")
    } else {
        let lines = fraction_scan_lines(&autopilot.trajectory, at).context("splitting at cut points")?;
        (lines, "cut points")
    };

    let pieces = split_sonar_log(sonar, &lines, alignment.offset.offset_s);
    let mut written = 0usize;
    for (i, (line, piece)) in lines.iter().zip(&pieces).enumerate() {
        if piece.pings.is_empty() {
            warn!("Line {} ({:.1} s) has no pings; not written", i + 1, line.duration());
            continue;
        }
        let path = output.join(line_file_name(i));
        write_sonar_csv(&path, piece).with_context(|| format!("writing {}", path.display()))?;
        info!(
            "Line {}: {:.1} s, {} fixes, {} pings -> {}",
            i + 1,
            line.duration(),
            piece.trajectory.len(),
            piece.pings.len(),
            path.display()
        );
        written += 1;
    }

    print_summary(
        "Survey Split Complete",
        &[
            ("Split by", method.to_string()),
            ("Clock offset", format!("{:+.3} s ({})", alignment.offset.offset_s, alignment.offset.source)),
            ("Scan lines", lines.len().to_string()),
            ("Files written", written.to_string()),
            ("Output", output.display().to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );
    Ok(())
}

fn cmd_merge(
    mut config: PipelineConfig,
    clouds: Vec<CloudInput>,
    output: &Path,
    anchor: Option<usize>,
    voxel_size: Option<f64>,
    force_accept: bool,
) -> Result<()> {
    let start = Instant::now();
    if anchor.is_some() {
        config.merge.anchor = anchor;
    }
    if let Some(size) = voxel_size {
        config.merge.voxel_size = size;
    }
    config.registration.force_accept |= force_accept;

    let outputs = OutputSpec {
        cloud: Some(output.to_path_buf()),
        trajectory: None,
    };
    let job = run_job(
        ProcessingJob::new(config, JobInputs::merge_only(clouds), outputs),
        Stage::Export,
        "Merging clouds...",
    )?;
    let Some(merge) = &job.artifacts().merge else {
        bail!("merge produced no result");
    };

    let mut items = Vec::new();
    for report in &merge.reports {
        items.push((
            "Cloud",
            format!(
                "{} {} -> {}",
                report.name, report.input_points, report.merged_points
            ),
        ));
        items.push(("  method", report.method.to_string()));
    }
    items.push(("Frame", merge.cloud.frame().to_string()));
    items.push(("Merged points", merge.cloud.len().to_string()));
    items.push(("Output", output.display().to_string()));
    items.push(("Duration", format!("{:.2?}", start.elapsed())));

    print_summary("Merge Complete", &items);
    Ok(())
}

fn cmd_plot(cloud_path: &Path, output: Option<PathBuf>, max_points: usize, alpha: f32) -> Result<()> {
    let start = Instant::now();
    let output_path = output.unwrap_or_else(|| cloud_path.with_extension("png"));

    let spinner = create_spinner("Loading cloud...");
    let cloud = load_cloud_auto(cloud_path, Frame::LocalEnu);
    spinner.finish_and_clear();
    let cloud = cloud.with_context(|| format!("loading {}", cloud_path.display()))?;

    visualization::plot_point_cloud(&output_path, &cloud, max_points, alpha)
        .with_context(|| format!("plotting {}", output_path.display()))?;

    print_summary(
        "Visualization Complete",
        &[
            ("Input file", cloud_path.display().to_string()),
            ("Output PNG", output_path.display().to_string()),
            ("Points in cloud", cloud.len().to_string()),
            ("Max points plotted", max_points.to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );
    Ok(())
}

fn cmd_init_config(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    PipelineConfig::default()
        .to_yaml(path)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}
