//! ArduPilot DataFlash binary log decoder.
//!
//! A log is a flat sequence of records, each starting with the bytes
//! `0xA3 0x95 <type>`. Type 128 (`FMT`) records describe the layout of every
//! other type: name, total length, a format string with one character per
//! field, and comma-separated field labels.
//!
//! Only `GPS`, `ATT`, `MSG` and `CMD` records are decoded into values;
//! everything else is skipped by length. `CMD` records are the mission
//! commands the autopilot logs on upload; waypoint commands uploaded together
//! form one [`Mission`]. Decoding is strict: a bad header, a record
//! type with no prior `FMT` or a truncated record aborts with the byte offset.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use log::{debug, info, warn};
use nalgebra::{UnitQuaternion, Vector3};

use super::{AutopilotDecoder, AutopilotLog, Mission, ParseError};
use crate::config::AutopilotConfig;
use crate::core::transforms::{latlon_to_utm, UtmZoneTable};
use crate::core::types::{attitude_from_euler, slerp_or_nearest};
use crate::core::{Frame, PoseQuality, SourceTag, SyncMarker, TimestampedPose, Trajectory};

const HEAD_BYTE1: u8 = 0xA3;
const HEAD_BYTE2: u8 = 0x95;
const HEADER_LEN: usize = 3;

/// Record type of format definitions.
const FMT_TYPE: u8 = 128;

/// Total length of a format definition record.
const FMT_LENGTH: usize = 89;

/// Unix time of the GPS epoch, 1980-01-06T00:00:00Z.
pub const GPS_EPOCH_UNIX: f64 = 315_964_800.0;

const SECONDS_PER_WEEK: f64 = 604_800.0;

/// Marker messages are `MSG` texts with this prefix.
const SYNC_PREFIX: &str = "SYNC";

/// MAV_CMD_NAV_WAYPOINT
const NAV_WAYPOINT: u16 = 16;

/// MAV_FRAME_GLOBAL_RELATIVE_ALT
const RELATIVE_ALT_FRAME: u8 = 3;

/// Commands logged within this window of the first one belong to one upload.
const MISSION_UPLOAD_WINDOW_US: f64 = 2.0e6;

/// A mission whose ends are farther apart than this is closed back to its start.
const MISSION_CLOSE_DISTANCE_M: f64 = 10.0;

/// A decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Text(String),
    Array(Vec<i16>),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Layout of one record type, from its `FMT` definition.
#[derive(Debug, Clone)]
pub struct MessageFormat {
    pub msg_type: u8,
    pub name: String,
    /// Total record length including the 3-byte header.
    pub length: usize,
    pub format: Vec<u8>,
    pub labels: Vec<String>,
}

impl MessageFormat {
    fn index_of(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }
}

/// One decoded record.
#[derive(Debug, Clone)]
pub struct Message {
    /// Byte offset of the record header.
    pub offset: usize,
    pub format: Rc<MessageFormat>,
    pub values: Vec<FieldValue>,
}

impl Message {
    pub fn get(&self, label: &str) -> Option<&FieldValue> {
        self.format.index_of(label).map(|i| &self.values[i])
    }

    /// Numeric field, failing with the record offset when it is absent.
    pub fn number(&self, label: &str) -> Result<f64, ParseError> {
        self.get(label)
            .and_then(FieldValue::as_f64)
            .ok_or_else(|| ParseError::InvalidFormat {
                offset: self.offset,
                reason: format!("{} record has no numeric field '{}'", self.format.name, label),
            })
    }
}

/// Size in bytes of one format character.
fn field_size(c: u8) -> Option<usize> {
    let size = match c {
        b'b' | b'B' | b'M' => 1,
        b'h' | b'H' | b'c' | b'C' => 2,
        b'i' | b'I' | b'f' | b'e' | b'E' | b'L' | b'n' => 4,
        b'd' | b'q' | b'Q' => 8,
        b'N' => 16,
        b'Z' | b'a' => 64,
        _ => return None,
    };
    Some(size)
}

fn le<const N: usize>(b: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&b[..N]);
    out
}

fn c_string(b: &[u8]) -> String {
    let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
    String::from_utf8_lossy(&b[..end]).trim().to_string()
}

/// Decodes one field; `b` holds at least `field_size(c)` bytes.
fn decode_field(c: u8, b: &[u8]) -> FieldValue {
    match c {
        b'b' => FieldValue::Int(b[0] as i8 as i64),
        b'B' | b'M' => FieldValue::Int(b[0] as i64),
        b'h' => FieldValue::Int(i16::from_le_bytes(le(b)) as i64),
        b'H' => FieldValue::Int(u16::from_le_bytes(le(b)) as i64),
        b'i' => FieldValue::Int(i32::from_le_bytes(le(b)) as i64),
        b'I' => FieldValue::Int(u32::from_le_bytes(le(b)) as i64),
        b'q' => FieldValue::Int(i64::from_le_bytes(le(b))),
        b'Q' => FieldValue::Int(u64::from_le_bytes(le(b)) as i64),
        b'f' => FieldValue::Float(f32::from_le_bytes(le(b)) as f64),
        b'd' => FieldValue::Float(f64::from_le_bytes(le(b))),
        // Scaled integers: centi-units and 1e-7 degrees
        b'c' => FieldValue::Float(i16::from_le_bytes(le(b)) as f64 / 100.0),
        b'C' => FieldValue::Float(u16::from_le_bytes(le(b)) as f64 / 100.0),
        b'e' => FieldValue::Float(i32::from_le_bytes(le(b)) as f64 / 100.0),
        b'E' => FieldValue::Float(u32::from_le_bytes(le(b)) as f64 / 100.0),
        b'L' => FieldValue::Float(i32::from_le_bytes(le(b)) as f64 / 1.0e7),
        b'n' => FieldValue::Text(c_string(&b[..4])),
        b'N' => FieldValue::Text(c_string(&b[..16])),
        b'Z' => FieldValue::Text(c_string(&b[..64])),
        b'a' => FieldValue::Array(b[..64].chunks_exact(2).map(|p| i16::from_le_bytes([p[0], p[1]])).collect()),
        _ => FieldValue::Int(0),
    }
}

/// Parses the body of a `FMT` record located at `offset`.
fn parse_format(record: &[u8], offset: usize) -> Result<MessageFormat, ParseError> {
    let body = &record[HEADER_LEN..];
    let msg_type = body[0];
    let length = body[1] as usize;
    let name = c_string(&body[2..6]);
    let format: Vec<u8> = c_string(&body[6..22]).into_bytes();
    let labels_raw = c_string(&body[22..86]);
    let labels: Vec<String> = if labels_raw.is_empty() {
        Vec::new()
    } else {
        labels_raw.split(',').map(|s| s.trim().to_string()).collect()
    };

    let invalid = |reason: String| ParseError::InvalidFormat { offset, reason };

    let mut payload = 0usize;
    for &c in &format {
        payload += field_size(c).ok_or_else(|| invalid(format!("unknown format character '{}' in {}", c as char, name)))?;
    }
    if labels.len() != format.len() {
        return Err(invalid(format!(
            "{} declares {} fields but {} labels",
            name,
            format.len(),
            labels.len()
        )));
    }
    if HEADER_LEN + payload != length {
        return Err(invalid(format!(
            "{} declares length {} but its fields need {}",
            name,
            length,
            HEADER_LEN + payload
        )));
    }

    Ok(MessageFormat {
        msg_type,
        name,
        length,
        format,
        labels,
    })
}

fn ensure_available(bytes: &[u8], offset: usize, needed: usize) -> Result<(), ParseError> {
    let available = bytes.len() - offset;
    if available < needed {
        return Err(ParseError::Truncated {
            offset,
            needed,
            available,
        });
    }
    Ok(())
}

/// Walks every record of a log, decoding those whose name is in `wanted`.
pub fn parse_messages(bytes: &[u8], wanted: &[&str]) -> Result<Vec<Message>, ParseError> {
    let mut formats: HashMap<u8, Rc<MessageFormat>> = HashMap::new();
    let mut messages = Vec::new();
    let mut skipped = 0usize;
    let mut pos = 0usize;

    while pos < bytes.len() {
        ensure_available(bytes, pos, HEADER_LEN)?;
        if bytes[pos] != HEAD_BYTE1 || bytes[pos + 1] != HEAD_BYTE2 {
            return Err(ParseError::BadHeader { offset: pos });
        }
        let msg_type = bytes[pos + 2];

        if msg_type == FMT_TYPE {
            ensure_available(bytes, pos, FMT_LENGTH)?;
            let format = parse_format(&bytes[pos..pos + FMT_LENGTH], pos)?;
            formats.insert(format.msg_type, Rc::new(format));
            pos += FMT_LENGTH;
            continue;
        }

        let format = formats
            .get(&msg_type)
            .cloned()
            .ok_or(ParseError::UnknownType { msg_type, offset: pos })?;
        ensure_available(bytes, pos, format.length)?;

        if wanted.contains(&format.name.as_str()) {
            let mut values = Vec::with_capacity(format.format.len());
            let mut cursor = pos + HEADER_LEN;
            for &c in &format.format {
                // Sizes were validated against the record length when the FMT was read
                let size = field_size(c).unwrap_or(0);
                values.push(decode_field(c, &bytes[cursor..cursor + size]));
                cursor += size;
            }
            messages.push(Message {
                offset: pos,
                format: Rc::clone(&format),
                values,
            });
        } else {
            skipped += 1;
        }

        pos += format.length;
    }

    debug!("Parsed {} records ({} skipped), {} formats", messages.len(), skipped, formats.len());
    Ok(messages)
}

/// A GPS record that passed the fix filter.
#[derive(Debug, Clone)]
struct GpsFix {
    index: usize,
    time_us: f64,
    timestamp: f64,
    lat: f64,
    lon: f64,
    alt: f64,
    status: u8,
    hdop: f64,
}

/// A logged waypoint command.
#[derive(Debug, Clone, Copy, PartialEq)]
struct WaypointCommand {
    index: usize,
    time_us: f64,
    lat: f64,
    lon: f64,
    alt: f64,
}

/// Splits waypoint commands into uploads.
fn group_uploads(commands: &[WaypointCommand]) -> Vec<&[WaypointCommand]> {
    let mut groups = Vec::new();
    let mut start = 0;
    for i in 1..=commands.len() {
        if i == commands.len() || commands[i].time_us - commands[start].time_us >= MISSION_UPLOAD_WINDOW_US {
            groups.push(&commands[start..i]);
            start = i;
        }
    }
    groups
}

/// Places a boot-clock time on the GPS timeline through the nearest fix.
fn gps_time(fixes: &[GpsFix], time_us: f64) -> Option<f64> {
    let nearest = fixes
        .iter()
        .min_by(|a, b| (a.time_us - time_us).abs().total_cmp(&(b.time_us - time_us).abs()))?;
    Some(nearest.timestamp + (time_us - nearest.time_us) / 1.0e6)
}

/// Confidence of a fix from its status and HDOP.
fn fix_confidence(status: u8, hdop: f64) -> f64 {
    let base = match status {
        0..=2 => 0.0,
        3 => 0.8,
        4 => 0.9,
        _ => 1.0,
    };
    base / hdop.max(1.0)
}

/// Attitude at `time_us`, interpolated between ATT samples and clamped at the ends.
fn attitude_at(samples: &[(f64, UnitQuaternion<f64>)], time_us: f64) -> UnitQuaternion<f64> {
    let Some(first) = samples.first() else {
        return UnitQuaternion::identity();
    };
    let upper = samples.partition_point(|(t, _)| *t <= time_us);
    if upper == 0 {
        return first.1;
    }
    if upper == samples.len() {
        return samples[samples.len() - 1].1;
    }
    let (ta, qa) = &samples[upper - 1];
    let (tb, qb) = &samples[upper];
    let w = if tb > ta { (time_us - ta) / (tb - ta) } else { 0.0 };
    slerp_or_nearest(qa, qb, w)
}

/// Decoder for ArduPilot DataFlash `.bin` logs.
#[derive(Debug, Clone)]
pub struct DataFlashDecoder {
    leap_seconds: f64,
    min_fix_status: u8,
    zones: Arc<UtmZoneTable>,
}

impl DataFlashDecoder {
    pub fn new(config: &AutopilotConfig, zones: Arc<UtmZoneTable>) -> Self {
        Self {
            leap_seconds: config.leap_seconds,
            min_fix_status: config.min_fix_status,
            zones,
        }
    }

    /// UTC Unix time of a GPS week/millisecond pair.
    pub fn gps_to_unix(&self, week: f64, week_ms: f64) -> f64 {
        GPS_EPOCH_UNIX + week * SECONDS_PER_WEEK + week_ms / 1000.0 - self.leap_seconds
    }
}

impl AutopilotDecoder for DataFlashDecoder {
    fn name(&self) -> &'static str {
        "dataflash"
    }

    fn decode(&self, bytes: &[u8]) -> Result<AutopilotLog, ParseError> {
        let messages = parse_messages(bytes, &["GPS", "ATT", "MSG", "CMD"])?;

        let mut fixes: Vec<GpsFix> = Vec::new();
        let mut attitudes: Vec<(f64, UnitQuaternion<f64>)> = Vec::new();
        let mut sync_texts: Vec<(f64, String)> = Vec::new();
        let mut commands: Vec<WaypointCommand> = Vec::new();
        let mut gps_index = 0usize;
        let mut no_fix = 0usize;

        for msg in &messages {
            match msg.format.name.as_str() {
                "GPS" => {
                    let index = gps_index;
                    gps_index += 1;
                    let status = msg.number("Status")? as u8;
                    if status < self.min_fix_status {
                        no_fix += 1;
                        continue;
                    }
                    let hdop = msg.get("HDop").and_then(FieldValue::as_f64).unwrap_or(1.0);
                    fixes.push(GpsFix {
                        index,
                        time_us: msg.number("TimeUS")?,
                        timestamp: self.gps_to_unix(msg.number("GWk")?, msg.number("GMS")?),
                        lat: msg.number("Lat")?,
                        lon: msg.number("Lng")?,
                        alt: msg.number("Alt")?,
                        status,
                        hdop,
                    });
                }
                "ATT" => {
                    let q = attitude_from_euler(
                        msg.number("Roll")?.to_radians(),
                        msg.number("Pitch")?.to_radians(),
                        msg.number("Yaw")?.to_radians(),
                    );
                    attitudes.push((msg.number("TimeUS")?, q));
                }
                "MSG" => {
                    let text = msg.get("Message").and_then(FieldValue::as_str).unwrap_or("");
                    if let Some(label) = text.strip_prefix(SYNC_PREFIX) {
                        sync_texts.push((msg.number("TimeUS")?, label.trim().to_string()));
                    }
                }
                "CMD" => {
                    let is_waypoint = msg.number("CId")? as u16 == NAV_WAYPOINT
                        && msg.number("Frame")? as u8 == RELATIVE_ALT_FRAME;
                    let (lat, lon) = (msg.number("Lat")?, msg.number("Lng")?);
                    if is_waypoint && lat != 0.0 && lon != 0.0 {
                        commands.push(WaypointCommand {
                            index: commands.len(),
                            time_us: msg.number("TimeUS")?,
                            lat,
                            lon,
                            alt: msg.number("Alt")?,
                        });
                    }
                }
                _ => {}
            }
        }

        let first = fixes.first().ok_or(ParseError::Empty("GPS fix"))?;
        let zone = self
            .zones
            .zone_for(first.lat, first.lon)
            .map_err(|source| ParseError::Projection {
                index: first.index,
                source,
            })?;

        if attitudes.is_empty() {
            warn!("Autopilot log has no ATT records; poses carry identity attitude");
        }
        attitudes.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut trajectory = Trajectory::new(Frame::Utm(zone));
        for fix in &fixes {
            let utm = latlon_to_utm(fix.lat, fix.lon, zone).map_err(|source| ParseError::Projection {
                index: fix.index,
                source,
            })?;
            let pose = TimestampedPose::new(
                fix.timestamp,
                Vector3::new(utm.easting, utm.northing, fix.alt),
                attitude_at(&attitudes, fix.time_us),
                SourceTag::Autopilot,
            )
            .with_quality(PoseQuality::new(fix_confidence(fix.status, fix.hdop)));
            trajectory.push(pose);
        }

        let markers: Vec<SyncMarker> = sync_texts
            .into_iter()
            .filter_map(|(time_us, label)| {
                Some(SyncMarker {
                    label,
                    timestamp: gps_time(&fixes, time_us)?,
                })
            })
            .collect();

        let mut missions = Vec::new();
        for upload in group_uploads(&commands) {
            if upload.len() < 2 {
                debug!("Ignoring single-waypoint upload at {} us", upload[0].time_us);
                continue;
            }
            let mut waypoints = upload
                .iter()
                .map(|cmd| {
                    latlon_to_utm(cmd.lat, cmd.lon, zone)
                        .map(|utm| Vector3::new(utm.easting, utm.northing, cmd.alt))
                        .map_err(|source| ParseError::Projection {
                            index: cmd.index,
                            source,
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let (start, end) = (waypoints[0], waypoints[waypoints.len() - 1]);
            if (end - start).xy().norm() > MISSION_CLOSE_DISTANCE_M {
                waypoints.push(start);
            }
            let last = upload[upload.len() - 1].time_us;
            if let Some(uploaded_at) = gps_time(&fixes, last) {
                missions.push(Mission { uploaded_at, waypoints });
            }
        }

        info!(
            "Decoded {} GPS fixes in zone {} ({} without fix skipped), {} attitude samples, {} sync markers, {} missions",
            trajectory.len(),
            zone,
            no_fix,
            attitudes.len(),
            markers.len(),
            missions.len()
        );

        Ok(AutopilotLog {
            trajectory,
            markers,
            missions,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::core::transforms::Hemisphere;
    use crate::core::types::attitude_to_euler;
    use approx::assert_abs_diff_eq;

    fn decoder() -> DataFlashDecoder {
        DataFlashDecoder::new(&AutopilotConfig::default(), Arc::new(UtmZoneTable::standard()))
    }

    fn sample_log() -> Vec<u8> {
        let mut log = header();
        log.extend(gps_record(1_000_000, 1, 99_000, 2200, -23.5, -46.6, 700.0));
        log.extend(att_record(1_500_000, 0.0, 0.0, 90.0));
        log.extend(gps_record(2_000_000, 3, 100_000, 2200, -23.5, -46.6, 700.0));
        log.extend(msg_record(2_500_000, "SYNC start"));
        log.extend(att_record(2_500_000, 0.0, 0.0, 90.0));
        log.extend(gps_record(3_000_000, 4, 101_000, 2200, -23.49999, -46.6, 701.0));
        log.extend(msg_record(2_600_000, "Mission armed"));
        log
    }

    #[test]
    fn test_decode_gps_time_and_zone() {
        let log = decoder().decode(&sample_log()).unwrap();
        let traj = &log.trajectory;

        // The status-1 fix is skipped
        assert_eq!(traj.len(), 2);
        match traj.frame() {
            Frame::Utm(zone) => {
                assert_eq!(zone.number, 23);
                assert_eq!(zone.hemisphere, Hemisphere::South);
            }
            other => panic!("unexpected frame {}", other),
        }

        let expected_t0 = GPS_EPOCH_UNIX + 2200.0 * SECONDS_PER_WEEK + 100.0 - 18.0;
        assert_abs_diff_eq!(traj.poses()[0].timestamp, expected_t0, epsilon = 1e-6);
        assert_abs_diff_eq!(traj.poses()[1].timestamp - traj.poses()[0].timestamp, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(traj.poses()[1].position.z, 701.0, epsilon = 1e-9);
        // About 1.1 m north between the two fixes
        let dn = traj.poses()[1].position.y - traj.poses()[0].position.y;
        assert!(dn > 1.0 && dn < 1.2, "northing step was {}", dn);
        assert!(traj.poses()[1].quality.confidence > traj.poses()[0].quality.confidence);
    }

    #[test]
    fn test_attitude_and_markers() {
        let log = decoder().decode(&sample_log()).unwrap();
        let (_, _, yaw) = attitude_to_euler(&log.trajectory.poses()[0].attitude);
        assert_abs_diff_eq!(yaw, 90f64.to_radians(), epsilon = 1e-6);

        assert_eq!(log.markers.len(), 1);
        assert_eq!(log.markers[0].label, "start");
        let t0 = log.trajectory.poses()[0].timestamp;
        assert_abs_diff_eq!(log.markers[0].timestamp, t0 + 0.5, epsilon = 1e-6);
    }

    /// Two fixes 10 s apart and three uploads: a closed square, an out-and-back
    /// line, and a single waypoint. The home position (frame 0) and a takeoff
    /// command are not waypoints.
    fn mission_log() -> Vec<u8> {
        let (lat, lon) = (-23.5, -46.6);
        let d = 0.001;
        let mut log = header();
        log.extend(cmd_record(100_000, 0, NAV_WAYPOINT, 0, lat, lon, 0.0));
        log.extend(cmd_record(100_000, 1, 22, RELATIVE_ALT_FRAME, lat, lon, 10.0));
        log.extend(cmd_record(200_000, 2, NAV_WAYPOINT, RELATIVE_ALT_FRAME, lat, lon, 10.0));
        log.extend(cmd_record(300_000, 3, NAV_WAYPOINT, RELATIVE_ALT_FRAME, lat + d, lon, 10.0));
        log.extend(cmd_record(400_000, 4, NAV_WAYPOINT, RELATIVE_ALT_FRAME, lat + d, lon + d, 10.0));
        log.extend(cmd_record(500_000, 5, NAV_WAYPOINT, RELATIVE_ALT_FRAME, lat, lon + d, 10.0));
        log.extend(cmd_record(5_000_000, 1, NAV_WAYPOINT, RELATIVE_ALT_FRAME, lat, lon, 10.0));
        log.extend(cmd_record(5_100_000, 2, NAV_WAYPOINT, RELATIVE_ALT_FRAME, lat + d, lon, 10.0));
        log.extend(cmd_record(9_000_000, 1, NAV_WAYPOINT, RELATIVE_ALT_FRAME, lat, lon, 10.0));
        log.extend(gps_record(10_000_000, 3, 100_000, 2200, lat, lon, 700.0));
        log.extend(gps_record(20_000_000, 3, 110_000, 2200, lat, lon, 700.0));
        log
    }

    #[test]
    fn test_waypoint_uploads_become_missions() {
        let log = decoder().decode(&mission_log()).unwrap();
        assert_eq!(log.missions.len(), 2);

        let t0 = log.trajectory.poses()[0].timestamp;
        let square = &log.missions[0];
        assert_abs_diff_eq!(square.uploaded_at, t0 - 9.5, epsilon = 1e-6);
        // Ends about 100 m east of the start, so the start is appended
        assert_eq!(square.waypoints.len(), 5);
        assert_eq!(square.waypoints[4], square.waypoints[0]);
        assert_abs_diff_eq!(square.waypoints[0].z, 10.0, epsilon = 1e-6);

        let start = log.trajectory.poses()[0].position;
        assert_abs_diff_eq!(square.waypoints[0].x, start.x, epsilon = 1e-6);
        assert_abs_diff_eq!(square.waypoints[0].y, start.y, epsilon = 1e-6);
        let north = square.waypoints[1].y - square.waypoints[0].y;
        assert!(north > 100.0 && north < 120.0, "northing step was {}", north);

        let line = &log.missions[1];
        assert_abs_diff_eq!(line.uploaded_at, t0 - 4.9, epsilon = 1e-6);
        assert_eq!(line.waypoints.len(), 3);
    }

    #[test]
    fn test_upload_window_keeps_the_command_that_opens_a_group() {
        let at = |t: f64| WaypointCommand {
            index: 0,
            time_us: t,
            lat: 1.0,
            lon: 1.0,
            alt: 0.0,
        };
        let commands = [at(0.0), at(1.9e6), at(2.0e6), at(2.5e6), at(9.0e6)];
        let groups: Vec<usize> = group_uploads(&commands).iter().map(|g| g.len()).collect();
        assert_eq!(groups, vec![2, 2, 1]);
        assert!(group_uploads(&[]).is_empty());
    }

    #[test]
    fn test_field_scaling() {
        assert_eq!(decode_field(b'L', &(-235_000_000i32).to_le_bytes()), FieldValue::Float(-23.5));
        assert_eq!(decode_field(b'c', &(-150i16).to_le_bytes()), FieldValue::Float(-1.5));
        assert_eq!(decode_field(b'b', &[0xFF]), FieldValue::Int(-1));
    }

    #[test]
    fn test_bad_header_offset() {
        let mut log = header();
        let offset = log.len();
        log.extend([0x00, 0x95, GPS_TYPE]);
        match decoder().decode(&log) {
            Err(ParseError::BadHeader { offset: o }) => assert_eq!(o, offset),
            other => panic!("expected BadHeader, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type() {
        let mut log = header();
        log.extend([HEAD_BYTE1, HEAD_BYTE2, 200, 0, 0]);
        assert!(matches!(
            decoder().decode(&log),
            Err(ParseError::UnknownType { msg_type: 200, .. })
        ));
    }

    #[test]
    fn test_truncated_record() {
        let mut log = header();
        let record = gps_record(1, 3, 0, 2200, 10.0, 10.0, 0.0);
        log.extend(&record[..20]);
        assert!(matches!(
            decoder().decode(&log),
            Err(ParseError::Truncated { needed: 33, available: 20, .. })
        ));
    }

    #[test]
    fn test_invalid_format_length() {
        let log = fmt_record(GPS_TYPE, 40, "GPS", "QB", "TimeUS,Status");
        assert!(matches!(parse_messages(&log, &["GPS"]), Err(ParseError::InvalidFormat { offset: 0, .. })));
    }

    #[test]
    fn test_no_fix_is_empty() {
        let mut log = header();
        log.extend(gps_record(1_000_000, 1, 0, 2200, 10.0, 10.0, 0.0));
        assert!(matches!(decoder().decode(&log), Err(ParseError::Empty(_))));
    }

    #[test]
    fn test_decode_file_wraps_path() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[HEAD_BYTE1, 0x00, 0x00]).unwrap();
        file.flush().unwrap();
        let err = decoder().decode_file(file.path()).unwrap_err();
        assert!(matches!(err, ParseError::InFile { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }
}
