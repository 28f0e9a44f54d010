//! Coordinate transformations between geodetic, UTM and local ENU frames.
//!
//! This module provides:
//! - An injectable UTM zone table (including the Norway and Svalbard exceptions)
//! - WGS84 transverse Mercator forward and inverse projections
//! - A local tangent frame anchored at a UTM position, used to move between
//!   the mission's East-North-Up frame and the UTM grid
//!
//! All angles at the public boundary are in degrees unless a name says otherwise.

use std::fmt;
use std::str::FromStr;

use nalgebra::{Rotation3, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// WGS84 semi-major axis (meters).
const WGS84_A: f64 = 6_378_137.0;

/// WGS84 flattening.
const WGS84_F: f64 = 1.0 / 298.257_223_563;

/// UTM central scale factor.
const UTM_K0: f64 = 0.9996;

/// False easting applied to every zone.
const FALSE_EASTING: f64 = 500_000.0;

/// False northing applied in the southern hemisphere.
const FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;

/// Errors raised by coordinate conversions.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeodesyError {
    #[error("latitude {0} outside the UTM domain [-80, 84]")]
    LatitudeOutOfRange(f64),

    #[error("invalid UTM zone number {0}")]
    InvalidZone(u8),

    #[error("invalid zone description '{0}'")]
    InvalidZoneDescription(String),
}

/// Hemisphere of a UTM zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Hemisphere {
    North,
    South,
}

impl Hemisphere {
    /// Hemisphere containing the given latitude (the equator counts as north).
    pub fn from_latitude(lat_deg: f64) -> Self {
        if lat_deg < 0.0 {
            Hemisphere::South
        } else {
            Hemisphere::North
        }
    }

    fn letter(self) -> char {
        match self {
            Hemisphere::North => 'N',
            Hemisphere::South => 'S',
        }
    }
}

/// A UTM zone: number 1..=60 plus hemisphere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UtmZone {
    pub number: u8,
    pub hemisphere: Hemisphere,
}

impl UtmZone {
    /// Creates a zone, validating the zone number.
    pub fn new(number: u8, hemisphere: Hemisphere) -> Result<Self, GeodesyError> {
        if !(1..=60).contains(&number) {
            return Err(GeodesyError::InvalidZone(number));
        }
        Ok(Self { number, hemisphere })
    }

    /// Central meridian of the zone in degrees.
    #[inline]
    pub fn central_meridian(&self) -> f64 {
        (self.number as f64 - 1.0) * 6.0 - 180.0 + 3.0
    }
}

impl fmt::Display for UtmZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.number, self.hemisphere.letter())
    }
}

impl FromStr for UtmZone {
    type Err = GeodesyError;

    /// Parses descriptions such as `23S`, `32N` or `23 S`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        let invalid = || GeodesyError::InvalidZoneDescription(s.to_string());

        let letter = compact.chars().last().ok_or_else(invalid)?;
        let hemisphere = match letter.to_ascii_uppercase() {
            'N' => Hemisphere::North,
            'S' => Hemisphere::South,
            _ => return Err(invalid()),
        };
        let number: u8 = compact[..compact.len() - 1].parse().map_err(|_| invalid())?;
        UtmZone::new(number, hemisphere)
    }
}

/// A projected UTM coordinate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UtmCoordinate {
    pub easting: f64,
    pub northing: f64,
    pub zone: UtmZone,
}

/// Read-only table of UTM zone boundaries.
///
/// Built once and shared (usually behind an `Arc`) by every job that needs
/// zone lookups. Holds the regular 6° grid plus the irregular zones over
/// south-west Norway and Svalbard.
#[derive(Debug, Clone)]
pub struct UtmZoneTable {
    central_meridians: Vec<f64>,
    exceptions: Vec<ZoneException>,
}

/// An irregular zone assignment: a lat/lon box mapped to a fixed zone number.
#[derive(Debug, Clone, Copy)]
struct ZoneException {
    lat_min: f64,
    lat_max: f64,
    lon_min: f64,
    lon_max: f64,
    zone: u8,
}

impl UtmZoneTable {
    /// Builds the standard WGS84 UTM zone table.
    pub fn standard() -> Self {
        let central_meridians = (1..=60u8).map(|n| (n as f64 - 1.0) * 6.0 - 177.0).collect();

        let exceptions = vec![
            // Norway: zone 32V is widened west to 3°E
            ZoneException { lat_min: 56.0, lat_max: 64.0, lon_min: 3.0, lon_max: 12.0, zone: 32 },
            // Svalbard
            ZoneException { lat_min: 72.0, lat_max: 84.0, lon_min: 0.0, lon_max: 9.0, zone: 31 },
            ZoneException { lat_min: 72.0, lat_max: 84.0, lon_min: 9.0, lon_max: 21.0, zone: 33 },
            ZoneException { lat_min: 72.0, lat_max: 84.0, lon_min: 21.0, lon_max: 33.0, zone: 35 },
            ZoneException { lat_min: 72.0, lat_max: 84.0, lon_min: 33.0, lon_max: 42.0, zone: 37 },
        ];

        Self {
            central_meridians,
            exceptions,
        }
    }

    /// Number of zones in the table.
    #[inline]
    pub fn len(&self) -> usize {
        self.central_meridians.len()
    }

    /// Returns true if the table holds no zones.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.central_meridians.is_empty()
    }

    /// Central meridian of a zone number, if the table knows it.
    pub fn central_meridian(&self, number: u8) -> Option<f64> {
        self.central_meridians.get(number.checked_sub(1)? as usize).copied()
    }

    /// Determines the zone containing a geodetic position.
    pub fn zone_for(&self, lat_deg: f64, lon_deg: f64) -> Result<UtmZone, GeodesyError> {
        if !(-80.0..=84.0).contains(&lat_deg) {
            return Err(GeodesyError::LatitudeOutOfRange(lat_deg));
        }

        let lon = normalize_longitude(lon_deg);
        let hemisphere = Hemisphere::from_latitude(lat_deg);

        for ex in &self.exceptions {
            if lat_deg >= ex.lat_min && lat_deg < ex.lat_max && lon >= ex.lon_min && lon < ex.lon_max {
                return UtmZone::new(ex.zone, hemisphere);
            }
        }

        let number = (((lon + 180.0) / 6.0).floor() as i32).clamp(0, 59) + 1;
        UtmZone::new(number as u8, hemisphere)
    }

    /// Projects a geodetic position into the zone that contains it.
    pub fn project(&self, lat_deg: f64, lon_deg: f64) -> Result<UtmCoordinate, GeodesyError> {
        let zone = self.zone_for(lat_deg, lon_deg)?;
        latlon_to_utm(lat_deg, lon_deg, zone)
    }
}

impl Default for UtmZoneTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Wraps a longitude into [-180, 180).
fn normalize_longitude(lon_deg: f64) -> f64 {
    let wrapped = (lon_deg + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped >= 180.0 {
        wrapped - 360.0
    } else {
        wrapped
    }
}

/// WGS84 constants of the Krüger n-series (sixth order in the third flattening).
struct Ellipsoid {
    e: f64,
    e2: f64,
    ep2: f64,
    /// Rectifying radius times the central scale factor.
    k0_a: f64,
    /// Forward coefficients, conformal → rectifying.
    alpha: [f64; 6],
    /// Inverse coefficients, rectifying → conformal.
    beta: [f64; 6],
}

impl Ellipsoid {
    fn wgs84() -> Self {
        let e2 = WGS84_F * (2.0 - WGS84_F);
        let n = WGS84_F / (2.0 - WGS84_F);
        let n2 = n * n;
        let n3 = n2 * n;
        let n4 = n3 * n;
        let n5 = n4 * n;
        let n6 = n5 * n;

        let rectifying = WGS84_A / (1.0 + n) * (1.0 + n2 / 4.0 + n4 / 64.0 + n6 / 256.0);

        let alpha = [
            n / 2.0 - 2.0 * n2 / 3.0 + 5.0 * n3 / 16.0 + 41.0 * n4 / 180.0 - 127.0 * n5 / 288.0
                + 7891.0 * n6 / 37800.0,
            13.0 * n2 / 48.0 - 3.0 * n3 / 5.0 + 557.0 * n4 / 1440.0 + 281.0 * n5 / 630.0
                - 1_983_433.0 * n6 / 1_935_360.0,
            61.0 * n3 / 240.0 - 103.0 * n4 / 140.0 + 15061.0 * n5 / 26880.0 + 167_603.0 * n6 / 181_440.0,
            49561.0 * n4 / 161_280.0 - 179.0 * n5 / 168.0 + 6_601_661.0 * n6 / 7_257_600.0,
            34729.0 * n5 / 80640.0 - 3_418_889.0 * n6 / 1_995_840.0,
            212_378_941.0 * n6 / 319_334_400.0,
        ];
        let beta = [
            n / 2.0 - 2.0 * n2 / 3.0 + 37.0 * n3 / 96.0 - n4 / 360.0 - 81.0 * n5 / 512.0 + 96199.0 * n6 / 604_800.0,
            n2 / 48.0 + n3 / 15.0 - 437.0 * n4 / 1440.0 + 46.0 * n5 / 105.0 - 1_118_711.0 * n6 / 3_870_720.0,
            17.0 * n3 / 480.0 - 37.0 * n4 / 840.0 - 209.0 * n5 / 4480.0 + 5569.0 * n6 / 90720.0,
            4397.0 * n4 / 161_280.0 - 11.0 * n5 / 504.0 - 830_251.0 * n6 / 7_257_600.0,
            4583.0 * n5 / 161_280.0 - 108_847.0 * n6 / 3_991_680.0,
            20_648_693.0 * n6 / 638_668_800.0,
        ];

        Self {
            e: e2.sqrt(),
            e2,
            ep2: e2 / (1.0 - e2),
            k0_a: UTM_K0 * rectifying,
            alpha,
            beta,
        }
    }

    /// Tangent of the conformal latitude for geodetic latitude `phi`.
    fn conformal_tan(&self, phi: f64) -> f64 {
        let tau = phi.tan();
        let sigma = (self.e * (self.e * tau / tau.hypot(1.0)).atanh()).sinh();
        tau * sigma.hypot(1.0) - sigma * tau.hypot(1.0)
    }

    /// Inverts `conformal_tan` by Newton iteration; returns geodetic latitude.
    fn geodetic_latitude(&self, tau_prime: f64) -> f64 {
        let mut tau = tau_prime;
        for _ in 0..8 {
            let sigma = (self.e * (self.e * tau / tau.hypot(1.0)).atanh()).sinh();
            let tau_i = tau * sigma.hypot(1.0) - sigma * tau.hypot(1.0);
            let dtau = (tau_prime - tau_i) / tau_i.hypot(1.0) * (1.0 + (1.0 - self.e2) * tau * tau)
                / ((1.0 - self.e2) * tau.hypot(1.0));
            tau += dtau;
            if dtau.abs() <= 1e-14 * tau.abs().max(1.0) {
                break;
            }
        }
        tau.atan()
    }
}

/// Projects a geodetic position into a given UTM zone.
///
/// The zone does not have to be the one containing the position, which is
/// how a job keeps a single zone across a zone boundary.
pub fn latlon_to_utm(lat_deg: f64, lon_deg: f64, zone: UtmZone) -> Result<UtmCoordinate, GeodesyError> {
    if !(-80.0..=84.0).contains(&lat_deg) {
        return Err(GeodesyError::LatitudeOutOfRange(lat_deg));
    }

    let ell = Ellipsoid::wgs84();
    let lam = normalize_longitude(lon_deg - zone.central_meridian()).to_radians();
    let t = ell.conformal_tan(lat_deg.to_radians());
    let (sin_lam, cos_lam) = lam.sin_cos();

    let xi_p = t.atan2(cos_lam);
    let eta_p = (sin_lam / t.hypot(cos_lam)).asinh();

    let mut xi = xi_p;
    let mut eta = eta_p;
    for (j, a) in ell.alpha.iter().enumerate() {
        let k = 2.0 * (j + 1) as f64;
        xi += a * (k * xi_p).sin() * (k * eta_p).cosh();
        eta += a * (k * xi_p).cos() * (k * eta_p).sinh();
    }

    let easting = FALSE_EASTING + ell.k0_a * eta;
    let mut northing = ell.k0_a * xi;
    if zone.hemisphere == Hemisphere::South {
        northing += FALSE_NORTHING_SOUTH;
    }

    Ok(UtmCoordinate {
        easting,
        northing,
        zone,
    })
}

/// Converts a UTM coordinate back to geodetic latitude/longitude in degrees.
pub fn utm_to_latlon(easting: f64, northing: f64, zone: UtmZone) -> (f64, f64) {
    let ell = Ellipsoid::wgs84();
    let y = match zone.hemisphere {
        Hemisphere::North => northing,
        Hemisphere::South => northing - FALSE_NORTHING_SOUTH,
    };
    let xi = y / ell.k0_a;
    let eta = (easting - FALSE_EASTING) / ell.k0_a;

    let mut xi_p = xi;
    let mut eta_p = eta;
    for (j, b) in ell.beta.iter().enumerate() {
        let k = 2.0 * (j + 1) as f64;
        xi_p -= b * (k * xi).sin() * (k * eta).cosh();
        eta_p -= b * (k * xi).cos() * (k * eta).sinh();
    }

    let sinh_eta = eta_p.sinh();
    let (sin_xi, cos_xi) = xi_p.sin_cos();
    let tau_prime = sin_xi / sinh_eta.hypot(cos_xi);
    let lam = sinh_eta.atan2(cos_xi);

    let phi = ell.geodetic_latitude(tau_prime);
    (phi.to_degrees(), normalize_longitude(zone.central_meridian() + lam.to_degrees()))
}

/// Meridian convergence (radians): angle from true north to grid north.
pub fn grid_convergence(lat_deg: f64, lon_deg: f64, zone: UtmZone) -> f64 {
    let dlam = normalize_longitude(lon_deg - zone.central_meridian()).to_radians();
    (dlam.tan() * lat_deg.to_radians().sin()).atan()
}

/// Point scale factor of the projection at a geodetic position.
pub fn point_scale_factor(lat_deg: f64, lon_deg: f64, zone: UtmZone) -> f64 {
    let ell = Ellipsoid::wgs84();
    let phi = lat_deg.to_radians();
    let dlam = normalize_longitude(lon_deg - zone.central_meridian()).to_radians();
    let t = phi.tan().powi(2);
    let c = ell.ep2 * phi.cos().powi(2);
    let a2 = (phi.cos() * dlam).powi(2);
    UTM_K0 * (1.0 + (1.0 + c) * a2 / 2.0 + (5.0 - 4.0 * t + 42.0 * c + 13.0 * c * c - 28.0 * ell.ep2) * a2 * a2 / 24.0)
}

/// Local East-North-Up frame anchored at a UTM position.
///
/// Over the extent of a survey the grid is treated as a rotated, scaled copy
/// of the tangent plane at the anchor: `grid = k * R(γ) * enu`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalTangentFrame {
    anchor: Vector3<f64>,
    zone: UtmZone,
    convergence: f64,
    scale: f64,
    enu_to_grid: Rotation3<f64>,
}

impl LocalTangentFrame {
    /// Anchors a frame at a UTM position (easting, northing, up).
    pub fn new(anchor: Vector3<f64>, zone: UtmZone) -> Self {
        let (lat, lon) = utm_to_latlon(anchor.x, anchor.y, zone);
        let convergence = grid_convergence(lat, lon, zone);
        let scale = point_scale_factor(lat, lon, zone);

        // Grid azimuth = true azimuth - γ, i.e. a counter-clockwise rotation by γ
        let enu_to_grid = Rotation3::from_axis_angle(&Vector3::z_axis(), convergence);

        Self {
            anchor,
            zone,
            convergence,
            scale,
            enu_to_grid,
        }
    }

    #[inline]
    pub fn anchor(&self) -> Vector3<f64> {
        self.anchor
    }

    #[inline]
    pub fn zone(&self) -> UtmZone {
        self.zone
    }

    /// Grid convergence at the anchor (radians).
    #[inline]
    pub fn convergence(&self) -> f64 {
        self.convergence
    }

    /// Horizontal scale factor at the anchor.
    #[inline]
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Converts a UTM position to local ENU relative to the anchor.
    pub fn utm_to_enu(&self, utm: &Vector3<f64>) -> Vector3<f64> {
        let d = utm - self.anchor;
        let horizontal = self.enu_to_grid.inverse() * Vector3::new(d.x / self.scale, d.y / self.scale, 0.0);
        Vector3::new(horizontal.x, horizontal.y, d.z)
    }

    /// Converts a local ENU position to UTM.
    pub fn enu_to_utm(&self, enu: &Vector3<f64>) -> Vector3<f64> {
        let horizontal = self.enu_to_grid * Vector3::new(enu.x, enu.y, 0.0) * self.scale;
        Vector3::new(
            self.anchor.x + horizontal.x,
            self.anchor.y + horizontal.y,
            self.anchor.z + enu.z,
        )
    }
}

/// Reprojects a UTM position from one zone into another, exactly.
pub fn reproject_utm(easting: f64, northing: f64, from: UtmZone, to: UtmZone) -> Result<(f64, f64), GeodesyError> {
    if from == to {
        return Ok((easting, northing));
    }
    let (lat, lon) = utm_to_latlon(easting, northing, from);
    let c = latlon_to_utm(lat, lon, to)?;
    Ok((c.easting, c.northing))
}
