//! End-to-end scenarios over synthetic surveys.

use approx::assert_abs_diff_eq;
use nalgebra::{Rotation3, UnitQuaternion, Vector3};
use tempfile::TempDir;

use sonar_fusion::config::PipelineConfig;
use sonar_fusion::core::{
    load_cloud, CloudFormat, Correspondence, Frame, PingRecord, PointCloud, SampleStatus, SourceTag, TimestampedPose,
    Trajectory, UtmZone,
};
use sonar_fusion::parsers::{write_sonar_csv, AutopilotLog, CsvSonarDecoder, Mission, SonarDecoder, SonarLog};
use sonar_fusion::pipeline::{AutopilotInput, CloudInput, JobInputs, OutputSpec, PairSource, SonarInput};
use sonar_fusion::processors::{
    flown_mission_scan_lines, merge_clouds, register, split_sonar_log, CancelToken, MergeInput, MergeMethod,
    OffsetSource,
};
use sonar_fusion::{ProcessingJob, Stage};

const EAST: f64 = 500_000.0;
const NORTH: f64 = 7_400_000.0;

fn utm() -> Frame {
    Frame::Utm("23S".parse::<UtmZone>().unwrap())
}

/// Eastward at 1 m/s over [0, 100] s, one pose per second.
fn eastward(source: SourceTag) -> Trajectory {
    let poses = (0..=100)
        .map(|i| {
            let t = i as f64;
            TimestampedPose::new(t, Vector3::new(EAST + t, NORTH, 0.0), UnitQuaternion::identity(), source)
        })
        .collect();
    Trajectory::from_poses(poses, utm())
}

fn survey(pings: Vec<PingRecord>, sonar_trajectory: Trajectory) -> JobInputs {
    let autopilot = AutopilotLog {
        trajectory: eastward(SourceTag::Autopilot),
        markers: Vec::new(),
        missions: Vec::new(),
    };
    let sonar = SonarLog {
        trajectory: sonar_trajectory,
        pings,
        markers: Vec::new(),
    };
    JobInputs::survey(AutopilotInput::Decoded(autopilot), SonarInput::Decoded(sonar))
}

#[test]
fn outlier_fix_is_replaced_by_autopilot_pose() {
    // Sonar fix at t=50 s is 50 m off the autopilot track
    let noisy: Vec<_> = eastward(SourceTag::SonarNative)
        .into_poses()
        .into_iter()
        .map(|mut pose| {
            if pose.timestamp == 50.0 {
                pose.position.y += 50.0;
            }
            pose
        })
        .collect();
    let pings = (0..100).map(|i| PingRecord::nadir(i as f64 + 0.5, 10.0, 1.0)).collect();
    let inputs = survey(pings, Trajectory::from_poses(noisy, utm()));

    let config = PipelineConfig::default();
    let outlier_distance = config.correction.outlier_distance_m;
    let mut job = ProcessingJob::new(config, inputs, OutputSpec::default());
    job.run_through(Stage::Correct).unwrap();

    // A constant-speed track has no speed features: mission-start clocks
    let offset = job.stats().clock_offset.unwrap();
    assert_eq!(offset.source, OffsetSource::MissionStart);
    assert_eq!(offset.offset_s, 0.0);

    let correction = &job.artifacts().correction.as_ref().unwrap();
    assert_eq!(correction.stats.replaced, 1);

    let trajectory = job.corrected_trajectory().unwrap();
    let sample = trajectory.samples().iter().find(|s| s.pose.timestamp == 50.0).unwrap();
    assert_eq!(sample.status, SampleStatus::Replaced);
    assert!(!sample.status.is_low_confidence());
    let expected = Vector3::new(EAST + 50.0, NORTH, 0.0);
    assert!((sample.pose.position - expected).norm() <= outlier_distance);

    let times: Vec<f64> = trajectory.samples().iter().map(|s| s.pose.timestamp).collect();
    assert!(times.windows(2).all(|w| w[0] < w[1]));
    assert!(trajectory.samples().iter().all(|s| s.pose.position.iter().all(|v| v.is_finite())));
}

#[test]
fn pings_outside_autopilot_span_are_discarded() {
    let mut pings: Vec<_> = (0..900).map(|i| PingRecord::nadir(i as f64 * 0.1, 8.0, 2.0)).collect();
    pings.extend((0..100).map(|i| PingRecord::nadir(110.0 + i as f64 * 0.1, 8.0, 2.0)));

    let mut config = PipelineConfig::default();
    config.alignment.manual_offset_s = Some(0.0);
    let dir = TempDir::new().unwrap();
    let ply = dir.path().join("survey.ply");
    let outputs = OutputSpec {
        cloud: Some(ply.clone()),
        trajectory: Some(dir.path().join("trajectory.csv")),
    };
    let mut job = ProcessingJob::new(config, survey(pings, eastward(SourceTag::SonarNative)), outputs);
    job.run().unwrap();

    let stats = job.stats();
    let reconstruction = stats.reconstruction.unwrap();
    assert_eq!(stats.pings, 1000);
    assert_eq!(stats.unmatched_pings, 100);
    assert_eq!(reconstruction.discarded_unmatched, 100);
    assert_eq!(reconstruction.reconstructed, 900);
    assert_eq!(stats.output_points, 900);

    // Points stay in ping order, 8 m below the track
    let cloud = &job.artifacts().reconstruction.as_ref().unwrap().cloud;
    assert_eq!(cloud.frame(), &utm());
    assert_abs_diff_eq!(cloud.coord(0)[0], EAST, epsilon = 1e-3);
    assert_abs_diff_eq!(cloud.coord(0)[2], -8.5, epsilon = 1e-3);
    assert_abs_diff_eq!(cloud.coord(899)[0], EAST + 89.9, epsilon = 1e-2);

    // Export round trip keeps count and exact coordinates
    let reloaded = load_cloud(&ply, CloudFormat::Ply, utm()).unwrap();
    assert_eq!(reloaded.len(), cloud.len());
    assert_eq!(reloaded.to_coords(), cloud.to_coords());
}

#[test]
fn reconstruction_is_deterministic() {
    let pings: Vec<_> = (0..500)
        .map(|i| {
            let mut ping = PingRecord::nadir(i as f64 * 0.19, 5.0 + (i % 7) as f64, i as f32);
            ping.beam_angle_rad = ((i % 11) as f64 - 5.0).to_radians();
            ping
        })
        .collect();
    let run = || {
        let mut config = PipelineConfig::default();
        config.alignment.manual_offset_s = Some(0.0);
        config.reconstruction.cancel_check_interval = 64;
        let mut job = ProcessingJob::new(config, survey(pings.clone(), eastward(SourceTag::SonarNative)), OutputSpec::default());
        job.run().unwrap();
        job.artifacts().reconstruction.clone().unwrap()
    };

    let first = run();
    let second = run();
    assert_eq!(first.cloud.len(), 500);
    assert_eq!(first, second);
    let bits = |c: &PointCloud| c.to_coords().iter().flat_map(|p| p.map(f64::to_bits)).collect::<Vec<_>>();
    assert_eq!(bits(&first.cloud), bits(&second.cloud));
}

fn unit_cube() -> Vec<[f64; 3]> {
    let mut corners = Vec::new();
    for x in [0.0, 1.0] {
        for y in [0.0, 1.0] {
            for z in [0.0, 1.0] {
                corners.push([x, y, z]);
            }
        }
    }
    corners
}

#[test]
fn rotated_local_cube_registers_onto_utm_cube() {
    let anchor = PointCloud::from_coords(utm(), &unit_cube());
    let rotation = Rotation3::from_axis_angle(&Vector3::z_axis(), 30f64.to_radians());
    let shift = Vector3::new(10.0, 10.0, 0.0);
    let local_pts: Vec<[f64; 3]> = unit_cube()
        .iter()
        .map(|p| {
            let v = rotation * Vector3::new(p[0], p[1], p[2]) + shift;
            [v.x, v.y, v.z]
        })
        .collect();
    let local = PointCloud::from_coords(Frame::Local("photogrammetry".into()), &local_pts);

    // Four non-coplanar corners: origin and the three unit axes
    let pairs: Vec<_> = [0usize, 4, 2, 1]
        .iter()
        .map(|&i| Correspondence::new(local_pts[i], unit_cube()[i]))
        .collect();

    let config = PipelineConfig::default();
    let result = register(&local, &anchor, Some(&pairs), &config.registration, &CancelToken::new()).unwrap();

    let inverse = rotation.inverse();
    assert_abs_diff_eq!(result.transform.rotation_angle_to(&inverse), 0.0, epsilon = 1e-6);
    assert_abs_diff_eq!(result.transform.translation, -(inverse * shift), epsilon = 1e-9);
    assert_abs_diff_eq!(result.transform.scale, 1.0);
    assert!(result.residual < config.registration.icp_accept_threshold);
    for (local, expected) in local_pts.iter().zip(unit_cube()) {
        let mapped = result.transform.apply(*local);
        for k in 0..3 {
            assert_abs_diff_eq!(mapped[k], expected[k], epsilon = 1e-9);
        }
    }
}

#[test]
fn merge_job_with_correspondence_file() {
    let dir = TempDir::new().unwrap();
    let pairs_path = dir.path().join("pairs.csv");
    let rotation = Rotation3::from_axis_angle(&Vector3::z_axis(), 30f64.to_radians());
    let to_local = |p: [f64; 3]| {
        let v = rotation * Vector3::new(p[0], p[1], p[2]) + Vector3::new(10.0, 10.0, 0.0);
        [v.x, v.y, v.z]
    };
    let mut csv = String::from("source_x,source_y,source_z,target_x,target_y,target_z\n");
    for p in [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]] {
        let s = to_local(p);
        csv.push_str(&format!("{},{},{},{},{},{}\n", s[0], s[1], s[2], p[0], p[1], p[2]));
    }
    std::fs::write(&pairs_path, csv).unwrap();

    // The model holds the survey cube plus two points the survey never saw
    let mut model = unit_cube();
    model.extend([[0.5, 0.5, 0.5], [0.5, 0.5, 2.0]]);
    let local: Vec<_> = model.into_iter().map(to_local).collect();
    let inputs = JobInputs::merge_only(vec![
        CloudInput::loaded("survey", PointCloud::from_coords(utm(), &unit_cube())),
        CloudInput::loaded("model", PointCloud::from_coords(Frame::Local("model".into()), &local))
            .with_correspondences(PairSource::File(pairs_path)),
    ]);
    let out = dir.path().join("merged.csv");
    let outputs = OutputSpec {
        cloud: Some(out.clone()),
        trajectory: None,
    };
    let mut config = PipelineConfig::default();
    config.registration.icp_max_iterations = 0;
    let mut job = ProcessingJob::new(config, inputs, outputs);
    job.run().unwrap();

    let merge = job.artifacts().merge.as_ref().unwrap();
    let report = &merge.reports[1];
    assert!(matches!(report.method, MergeMethod::Registered { .. }));
    assert_eq!(report.duplicates_removed, 8);
    assert_eq!(report.merged_points, 2);
    assert_eq!(merge.cloud.frame(), &utm());
    assert_eq!(merge.cloud.len(), 10);
    let last = merge.cloud.coord(9);
    for (got, want) in last.iter().zip([0.5, 0.5, 2.0]) {
        assert_abs_diff_eq!(*got, want, epsilon = 1e-6);
    }

    let reloaded = load_cloud(&out, CloudFormat::Csv, utm()).unwrap();
    assert_eq!(reloaded.len(), 10);
    assert_eq!(reloaded.sources(), merge.cloud.sources());
}

#[test]
fn remerging_an_aligned_cloud_is_a_no_op() {
    let mut coords = unit_cube();
    coords.push([40.0, 40.0, 40.0]);
    let inputs = [MergeInput::new("survey", PointCloud::from_coords(utm(), &coords))];
    let mut config = PipelineConfig::default();
    config.merge.outlier_k = 3;
    config.merge.outlier_sigma = 1.0;

    let once = merge_clouds(&inputs, &config.merge, &config.registration, &CancelToken::new()).unwrap();
    assert_eq!(once.reports[0].outliers_removed, 1);

    let again = [
        MergeInput::new("merged", once.cloud.clone()),
        MergeInput::new("copy", once.cloud.clone()),
    ];
    let twice = merge_clouds(&again, &config.merge, &config.registration, &CancelToken::new()).unwrap();
    assert_eq!(twice.reports[0].outliers_removed, 0);
    assert_eq!(twice.reports[1].method, MergeMethod::SameFrame);
    assert!(twice.reports[1].transform.as_ref().unwrap().is_identity(0.0));
    assert_eq!(twice.reports[1].merged_points, 0);
    assert_eq!(twice.cloud.to_coords(), once.cloud.to_coords());
}

fn uneven_seabed(n: usize) -> Vec<[f64; 3]> {
    let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
    let mut next = || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        (state >> 11) as f64 / (1u64 << 53) as f64
    };
    (0..n)
        .map(|_| {
            let east = EAST + next() * 120.0;
            let north = NORTH + next() * 80.0;
            let relief = next() * 0.8 + if next() < 0.03 { next() * 10.0 } else { 0.0 };
            [east, north, -15.0 + 0.02 * (east - EAST) + relief]
        })
        .collect()
}

#[test]
fn merge_filtering_is_stable_with_default_config() {
    let config = PipelineConfig::default();
    let survey = [MergeInput::new("survey", PointCloud::from_coords(utm(), &uneven_seabed(2000)))];

    let once = merge_clouds(&survey, &config.merge, &config.registration, &CancelToken::new()).unwrap();
    assert!(once.reports[0].outliers_removed > 0);

    let again = [MergeInput::new("merged", once.cloud.clone())];
    let twice = merge_clouds(&again, &config.merge, &config.registration, &CancelToken::new()).unwrap();
    assert_eq!(twice.reports[0].outliers_removed, 0);
    assert_eq!(twice.reports[0].duplicates_removed, 0);
    assert_eq!(twice.cloud, once.cloud);
}

#[test]
fn mission_lines_split_the_sonar_log_into_reimportable_files() {
    let waypoint = |east: f64| Vector3::new(EAST + east, NORTH, 10.0);
    let autopilot = AutopilotLog {
        trajectory: eastward(SourceTag::Autopilot),
        markers: Vec::new(),
        missions: vec![
            Mission {
                uploaded_at: -600.0,
                waypoints: vec![waypoint(90.0), waypoint(10.0)],
            },
            Mission {
                uploaded_at: -30.0,
                waypoints: vec![waypoint(20.0), waypoint(50.0), waypoint(80.0)],
            },
        ],
    };
    let sonar = SonarLog {
        trajectory: eastward(SourceTag::SonarNative),
        pings: (0..200).map(|i| PingRecord::nadir(0.25 + i as f64 * 0.5, 6.0, 1.0)).collect(),
        markers: Vec::new(),
    };
    let inputs = JobInputs::survey(AutopilotInput::Decoded(autopilot), SonarInput::Decoded(sonar));

    let config = PipelineConfig::default();
    let segmentation = config.segmentation.clone();
    let mut job = ProcessingJob::new(config, inputs, OutputSpec::default());
    job.run_through(Stage::Align).unwrap();

    let artifacts = job.artifacts();
    let autopilot = artifacts.autopilot.as_ref().unwrap();
    let sonar = artifacts.sonar.as_ref().unwrap();
    let offset = artifacts.alignment.as_ref().unwrap().offset.offset_s;

    // The later upload is flown; each waypoint is passed 5 m early
    let lines = flown_mission_scan_lines(&autopilot.trajectory, &autopilot.missions, &segmentation).unwrap();
    let bounds: Vec<(usize, usize)> = lines.iter().map(|l| (l.first_pose, l.last_pose)).collect();
    assert_eq!(bounds, vec![(0, 15), (15, 45), (45, 75), (75, 100)]);

    let dir = TempDir::new().unwrap();
    let decoder = CsvSonarDecoder::new(utm(), 0.5);
    let mut pings = 0;
    for (i, piece) in split_sonar_log(sonar, &lines, offset).iter().enumerate() {
        let path = dir.path().join(format!("line_{:03}.csv", i + 1));
        write_sonar_csv(&path, piece).unwrap();
        let again = decoder.decode_file(&path).unwrap();
        assert_eq!(again.pings.len(), piece.pings.len());
        assert_eq!(again.trajectory.len(), piece.trajectory.len());
        pings += again.pings.len();
    }
    assert_eq!(pings, 200);

    let second = decoder.decode_file(&dir.path().join("line_002.csv")).unwrap();
    assert_eq!(second.pings.len(), 60);
    assert_eq!(second.trajectory.len(), 31);
    assert_abs_diff_eq!(second.pings[0].timestamp, 15.25);
}
