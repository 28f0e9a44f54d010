//! HYPACK HSX survey log decoder.
//!
//! HSX files are line oriented. The header runs until `EOH` and carries the
//! survey date (`TND <hh:mm:ss> <mm/dd/yyyy>`) and the projection zone
//! (`INI ZoneName=Zone <n>`). Data records are `<TAG> <device> <time> ...`
//! with time in seconds past local midnight:
//!
//! | Tag | Fields after time          | Use                         |
//! |-----|----------------------------|-----------------------------|
//! | POS | easting northing           | native position fix         |
//! | RAW | n lat*1e4 lon*1e4 alt ...  | altitude of the fix         |
//! | HCP | heave roll pitch           | attitude                    |
//! | GYR | heading                    | attitude                    |
//! | EC1 | depth                      | one nadir ping              |
//! | FIX | event number               | sync marker                 |
//!
//! A record time more than half a day below its predecessor is taken to be
//! on the next day, so surveys running past midnight stay monotonic.

use chrono::NaiveDate;
use log::{debug, info};
use nalgebra::Vector3;

use super::{ParseError, SonarDecoder, SonarLog};
use crate::config::SonarConfig;
use crate::core::transforms::{Hemisphere, UtmZone};
use crate::core::types::attitude_from_euler;
use crate::core::{Frame, PingRecord, PoseQuality, SourceTag, SyncMarker, TimestampedPose, Trajectory};

const SECONDS_PER_HOUR: f64 = 3600.0;
const SECONDS_PER_DAY: f64 = 86_400.0;

/// Decoder for HYPACK `.HSX` logs.
#[derive(Debug, Clone)]
pub struct HsxDecoder {
    timezone_offset_hours: f64,
    hemisphere: Hemisphere,
    confidence: f64,
}

impl HsxDecoder {
    pub fn new(config: &SonarConfig) -> Self {
        Self {
            timezone_offset_hours: config.timezone_offset_hours,
            hemisphere: config.hemisphere,
            confidence: config.confidence,
        }
    }
}

/// Turns seconds-of-day into seconds since the survey date, carrying days.
#[derive(Debug, Default)]
struct DayClock {
    last: Option<f64>,
    days: u32,
}

impl DayClock {
    fn elapsed(&mut self, seconds_of_day: f64) -> f64 {
        if self.last.is_some_and(|last| last - seconds_of_day > SECONDS_PER_DAY / 2.0) {
            self.days += 1;
            debug!("Record time wrapped past midnight (day {})", self.days);
        }
        self.last = Some(seconds_of_day);
        f64::from(self.days) * SECONDS_PER_DAY + seconds_of_day
    }
}

/// Running navigation state while scanning data records.
#[derive(Debug, Default)]
struct NavState {
    altitude: f64,
    roll_deg: f64,
    pitch_deg: f64,
    heading_deg: f64,
}

fn malformed(line: usize, reason: impl Into<String>) -> ParseError {
    ParseError::Malformed {
        line,
        reason: reason.into(),
    }
}

fn field(fields: &[&str], idx: usize, line: usize, tag: &str) -> Result<f64, ParseError> {
    let raw = fields
        .get(idx)
        .ok_or_else(|| malformed(line, format!("{} record has {} fields, needs {}", tag, fields.len(), idx + 1)))?;
    raw.parse::<f64>()
        .map_err(|_| malformed(line, format!("{} field {} is not a number: '{}'", tag, idx, raw)))
}

/// Parses the zone number from `INI ZoneName=Zone 23` (optionally `23(48W-42W)`).
fn parse_zone_number(fields: &[&str], line: usize) -> Result<u8, ParseError> {
    let last = fields.last().copied().unwrap_or("");
    let number = last.split('(').next().unwrap_or("");
    number
        .parse::<u8>()
        .map_err(|_| malformed(line, format!("bad zone name '{}'", last)))
}

impl SonarDecoder for HsxDecoder {
    fn name(&self) -> &'static str {
        "hsx"
    }

    fn decode(&self, bytes: &[u8]) -> Result<SonarLog, ParseError> {
        let text = String::from_utf8_lossy(bytes);

        let mut survey_midnight: Option<f64> = None;
        let mut zone: Option<UtmZone> = None;
        let mut in_header = true;

        let mut nav = NavState::default();
        let mut poses: Vec<TimestampedPose> = Vec::new();
        let mut pings: Vec<PingRecord> = Vec::new();
        let mut markers: Vec<SyncMarker> = Vec::new();
        let mut ignored = 0usize;
        let mut clock = DayClock::default();

        let tz_shift = self.timezone_offset_hours * SECONDS_PER_HOUR;

        for (i, raw_line) in text.lines().enumerate() {
            let line = i + 1;
            let fields: Vec<&str> = raw_line.split_whitespace().collect();
            let Some(&tag) = fields.first() else {
                continue;
            };

            if in_header {
                match tag {
                    "TND" => {
                        let date = fields
                            .get(2)
                            .ok_or_else(|| malformed(line, "TND record without a date"))?;
                        let parsed = NaiveDate::parse_from_str(date, "%m/%d/%Y")
                            .map_err(|e| malformed(line, format!("bad survey date '{}': {}", date, e)))?;
                        let midnight = parsed
                            .and_hms_opt(0, 0, 0)
                            .ok_or_else(|| malformed(line, "survey date has no midnight"))?;
                        survey_midnight = Some(midnight.and_utc().timestamp() as f64);
                    }
                    "INI" if fields.get(1) == Some(&"ZoneName=Zone") => {
                        let number = parse_zone_number(&fields, line)?;
                        zone = Some(
                            UtmZone::new(number, self.hemisphere)
                                .map_err(|e| malformed(line, e.to_string()))?,
                        );
                    }
                    "EOH" => in_header = false,
                    _ => {}
                }
                continue;
            }

            let base = survey_midnight.ok_or(ParseError::MissingHeader("TND"))?;
            let mut to_unix = |seconds_of_day: f64| base + clock.elapsed(seconds_of_day) - tz_shift;

            match tag {
                "POS" => {
                    let t = to_unix(field(&fields, 2, line, tag)?);
                    let east = field(&fields, 3, line, tag)?;
                    let north = field(&fields, 4, line, tag)?;
                    let attitude = attitude_from_euler(
                        nav.roll_deg.to_radians(),
                        nav.pitch_deg.to_radians(),
                        nav.heading_deg.to_radians(),
                    );
                    poses.push(
                        TimestampedPose::new(t, Vector3::new(east, north, nav.altitude), attitude, SourceTag::SonarNative)
                            .with_quality(PoseQuality::new(self.confidence)),
                    );
                }
                "RAW" => {
                    nav.altitude = field(&fields, 6, line, tag)?;
                }
                "HCP" => {
                    nav.roll_deg = field(&fields, 4, line, tag)?;
                    nav.pitch_deg = field(&fields, 5, line, tag)?;
                }
                "GYR" => {
                    nav.heading_deg = field(&fields, 3, line, tag)?;
                }
                "EC1" => {
                    let t = to_unix(field(&fields, 2, line, tag)?);
                    let depth = field(&fields, 3, line, tag)?;
                    pings.push(PingRecord::nadir(t, depth, 0.0));
                }
                "FIX" => {
                    let t = to_unix(field(&fields, 2, line, tag)?);
                    let label = fields.get(3).copied().unwrap_or("").to_string();
                    markers.push(SyncMarker { label, timestamp: t });
                }
                _ => ignored += 1,
            }
        }

        let zone = zone.ok_or(ParseError::MissingHeader("INI ZoneName"))?;
        if survey_midnight.is_none() {
            return Err(ParseError::MissingHeader("TND"));
        }
        if poses.is_empty() {
            return Err(ParseError::Empty("POS"));
        }

        debug!("Ignored {} HSX records with unused tags", ignored);
        info!(
            "Decoded {} sonar fixes in zone {}, {} pings, {} event marks",
            poses.len(),
            zone,
            pings.len(),
            markers.len()
        );

        Ok(SonarLog {
            trajectory: Trajectory::from_poses(poses, Frame::Utm(zone)),
            pings,
            markers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::attitude_to_euler;
    use approx::assert_abs_diff_eq;

    const SAMPLE: &str = "\
FTP NEW 2
HSX 9
TND 11:27:59 07/19/2023
INI ZoneName=Zone 23(48W-42W)
EOH
RAW 0 41279.100 4 -235000.0 -466000.0 712.40 0
GYR 1 41279.100 90.0
HCP 2 41279.100 0.10 1.50 -2.00
POS 0 41279.100 331234.50 7399876.25
EC1 3 41279.200 4.75
FIX 99 41279.300 12
POS 0 41280.100 331235.50 7399876.25
EC1 3 41280.200 4.80
";

    fn decoder(tz: f64) -> HsxDecoder {
        HsxDecoder::new(&SonarConfig {
            timezone_offset_hours: tz,
            hemisphere: Hemisphere::South,
            confidence: 0.4,
        })
    }

    #[test]
    fn test_decode_sample() {
        let log = decoder(0.0).decode(SAMPLE.as_bytes()).unwrap();

        assert_eq!(log.trajectory.len(), 2);
        assert_eq!(log.trajectory.frame().to_string(), "utm:23S");
        assert_eq!(log.pings.len(), 2);
        assert_eq!(log.markers.len(), 1);
        assert_eq!(log.markers[0].label, "12");

        // 2023-07-19T00:00:00Z
        let midnight = 1_689_724_800.0;
        let first = &log.trajectory.poses()[0];
        assert_abs_diff_eq!(first.timestamp, midnight + 41279.1, epsilon = 1e-6);
        assert_abs_diff_eq!(first.position, Vector3::new(331234.5, 7399876.25, 712.4), epsilon = 1e-9);
        assert_abs_diff_eq!(first.quality.confidence, 0.4);

        let (roll, pitch, yaw) = attitude_to_euler(&first.attitude);
        assert_abs_diff_eq!(roll.to_degrees(), 1.5, epsilon = 1e-9);
        assert_abs_diff_eq!(pitch.to_degrees(), -2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(yaw.to_degrees(), 90.0, epsilon = 1e-9);

        assert_abs_diff_eq!(log.pings[1].range_m, 4.8);
        assert_eq!(log.pings[1].beam_angle_rad, 0.0);
    }

    #[test]
    fn test_timezone_offset() {
        let utc = decoder(0.0).decode(SAMPLE.as_bytes()).unwrap();
        let local = decoder(-3.0).decode(SAMPLE.as_bytes()).unwrap();
        assert_abs_diff_eq!(
            local.pings[0].timestamp - utc.pings[0].timestamp,
            3.0 * SECONDS_PER_HOUR,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_survey_past_midnight_keeps_increasing() {
        let text = "\
TND 23:59:58 07/19/2023
INI ZoneName=Zone 23
EOH
POS 0 86398.500 331234.50 7399876.25
EC1 3 86399.600 4.75
POS 0 0.500 331235.50 7399876.25
EC1 3 1.600 4.80
POS 0 2.500 331236.50 7399876.25
";
        let log = decoder(0.0).decode(text.as_bytes()).unwrap();
        let times = log.trajectory.timestamps();
        assert!(times.windows(2).all(|w| w[0] < w[1]));
        assert!(log.trajectory.validate().is_ok());

        let midnight = 1_689_724_800.0;
        assert_abs_diff_eq!(times[1], midnight + SECONDS_PER_DAY + 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(log.pings[1].timestamp - log.pings[0].timestamp, 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_small_backward_step_is_not_a_new_day() {
        let mut clock = DayClock::default();
        assert_eq!(clock.elapsed(100.0), 100.0);
        assert_eq!(clock.elapsed(99.5), 99.5);
        assert_eq!(clock.elapsed(50_000.0), 50_000.0);
        assert_eq!(clock.elapsed(10.0), SECONDS_PER_DAY + 10.0);
    }

    #[test]
    fn test_malformed_number_reports_line() {
        let text = SAMPLE.replace("EC1 3 41280.200 4.80", "EC1 3 41280.200 four");
        match decoder(0.0).decode(text.as_bytes()) {
            Err(ParseError::Malformed { line, .. }) => assert_eq!(line, 13),
            other => panic!("expected Malformed, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_zone() {
        let text = SAMPLE.replace("INI ZoneName=Zone 23(48W-42W)\n", "");
        assert!(matches!(
            decoder(0.0).decode(text.as_bytes()),
            Err(ParseError::MissingHeader("INI ZoneName"))
        ));
    }

    #[test]
    fn test_missing_date() {
        let text = SAMPLE.replace("TND 11:27:59 07/19/2023\n", "");
        assert!(matches!(
            decoder(0.0).decode(text.as_bytes()),
            Err(ParseError::MissingHeader("TND"))
        ));
    }

    #[test]
    fn test_no_fixes_is_empty() {
        let text = "TND 00:00:00 01/01/2024\nINI ZoneName=Zone 31\nEOH\nEC1 3 10.0 4.0\n";
        assert!(matches!(decoder(0.0).decode(text.as_bytes()), Err(ParseError::Empty("POS"))));
    }
}
