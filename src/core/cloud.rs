//! Frame-tagged point clouds and rigid/similarity transforms between frames.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};
use thiserror::Error;

use super::types::Frame;

/// Errors raised by frame-aware cloud operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CloudError {
    #[error("transform expects frame {expected} but the cloud is in {actual}")]
    FrameMismatch { expected: Frame, actual: Frame },

    #[error("column length mismatch: x={x}, y={y}, z={z}")]
    LengthMismatch { x: usize, y: usize, z: usize },

    #[error("attribute column '{name}' has {len} values for {points} points")]
    AttributeLength { name: &'static str, len: usize, points: usize },
}

/// Per-point view of a cloud.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point3D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub intensity: Option<f32>,
    /// Index of the input cloud this point came from.
    pub source: Option<u32>,
}

impl Point3D {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self {
            x,
            y,
            z,
            intensity: None,
            source: None,
        }
    }

    #[inline]
    pub fn coords(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }
}

/// A multiset of points tagged with exactly one frame.
///
/// Coordinates are stored column-wise. The frame can only change through
/// [`PointCloud::transform`] or [`PointCloud::map_into`], both of which consume
/// the cloud, so a half-transformed cloud is never observable.
#[derive(Debug, Clone, PartialEq)]
pub struct PointCloud {
    x: Vec<f64>,
    y: Vec<f64>,
    z: Vec<f64>,
    intensity: Option<Vec<f32>>,
    source: Option<Vec<u32>>,
    frame: Frame,
}

impl PointCloud {
    /// Creates an empty cloud in the given frame.
    pub fn new(frame: Frame) -> Self {
        Self::with_capacity(frame, 0)
    }

    pub fn with_capacity(frame: Frame, capacity: usize) -> Self {
        Self {
            x: Vec::with_capacity(capacity),
            y: Vec::with_capacity(capacity),
            z: Vec::with_capacity(capacity),
            intensity: None,
            source: None,
            frame,
        }
    }

    /// Creates a cloud from coordinate columns.
    pub fn from_xyz(frame: Frame, x: Vec<f64>, y: Vec<f64>, z: Vec<f64>) -> Result<Self, CloudError> {
        if x.len() != y.len() || x.len() != z.len() {
            return Err(CloudError::LengthMismatch {
                x: x.len(),
                y: y.len(),
                z: z.len(),
            });
        }
        Ok(Self {
            x,
            y,
            z,
            intensity: None,
            source: None,
            frame,
        })
    }

    /// Creates a cloud from `[x, y, z]` triples.
    pub fn from_coords(frame: Frame, coords: &[[f64; 3]]) -> Self {
        let mut cloud = Self::with_capacity(frame, coords.len());
        for c in coords {
            cloud.x.push(c[0]);
            cloud.y.push(c[1]);
            cloud.z.push(c[2]);
        }
        cloud
    }

    /// Attaches a per-point intensity column.
    pub fn with_intensity(mut self, intensity: Vec<f32>) -> Result<Self, CloudError> {
        if intensity.len() != self.len() {
            return Err(CloudError::AttributeLength {
                name: "intensity",
                len: intensity.len(),
                points: self.len(),
            });
        }
        self.intensity = Some(intensity);
        Ok(self)
    }

    /// Attaches a per-point source column.
    pub fn with_sources(mut self, sources: Vec<u32>) -> Result<Self, CloudError> {
        if sources.len() != self.len() {
            return Err(CloudError::AttributeLength {
                name: "source",
                len: sources.len(),
                points: self.len(),
            });
        }
        self.source = Some(sources);
        Ok(self)
    }

    /// Tags every point with the same source id.
    pub fn tagged(mut self, source: u32) -> Self {
        self.source = Some(vec![source; self.len()]);
        self
    }

    #[inline]
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.x.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    #[inline]
    pub fn x(&self) -> &[f64] {
        &self.x
    }

    #[inline]
    pub fn y(&self) -> &[f64] {
        &self.y
    }

    #[inline]
    pub fn z(&self) -> &[f64] {
        &self.z
    }

    #[inline]
    pub fn intensities(&self) -> Option<&[f32]> {
        self.intensity.as_deref()
    }

    #[inline]
    pub fn sources(&self) -> Option<&[u32]> {
        self.source.as_deref()
    }

    #[inline]
    pub fn coord(&self, i: usize) -> [f64; 3] {
        [self.x[i], self.y[i], self.z[i]]
    }

    pub fn point(&self, i: usize) -> Point3D {
        Point3D {
            x: self.x[i],
            y: self.y[i],
            z: self.z[i],
            intensity: self.intensity.as_ref().map(|v| v[i]),
            source: self.source.as_ref().map(|v| v[i]),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Point3D> + '_ {
        (0..self.len()).map(move |i| self.point(i))
    }

    /// Converts the cloud to `[x, y, z]` triples.
    pub fn to_coords(&self) -> Vec<[f64; 3]> {
        (0..self.len()).map(|i| self.coord(i)).collect()
    }

    /// Appends a point.
    ///
    /// Attribute columns are created on first use; earlier points get
    /// intensity 0 and source 0.
    pub fn push(&mut self, point: Point3D) {
        let n = self.len();
        self.x.push(point.x);
        self.y.push(point.y);
        self.z.push(point.z);

        if let Some(col) = self.intensity.as_mut() {
            col.push(point.intensity.unwrap_or(0.0));
        } else if let Some(value) = point.intensity {
            let mut col = vec![0.0; n];
            col.push(value);
            self.intensity = Some(col);
        }

        if let Some(col) = self.source.as_mut() {
            col.push(point.source.unwrap_or(0));
        } else if let Some(value) = point.source {
            let mut col = vec![0; n];
            col.push(value);
            self.source = Some(col);
        }
    }

    /// Returns the subset of points at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            x: indices.iter().map(|&i| self.x[i]).collect(),
            y: indices.iter().map(|&i| self.y[i]).collect(),
            z: indices.iter().map(|&i| self.z[i]).collect(),
            intensity: self.intensity.as_ref().map(|v| indices.iter().map(|&i| v[i]).collect()),
            source: self.source.as_ref().map(|v| indices.iter().map(|&i| v[i]).collect()),
            frame: self.frame.clone(),
        }
    }

    /// Appends every point of `other`, which must share this cloud's frame.
    pub fn extend_from(&mut self, other: &PointCloud) -> Result<(), CloudError> {
        if other.frame != self.frame {
            return Err(CloudError::FrameMismatch {
                expected: self.frame.clone(),
                actual: other.frame.clone(),
            });
        }
        for p in other.iter() {
            self.push(p);
        }
        Ok(())
    }

    /// Mean of all points, or `None` for an empty cloud.
    pub fn centroid(&self) -> Option<Vector3<f64>> {
        if self.is_empty() {
            return None;
        }
        let n = self.len() as f64;
        Some(Vector3::new(
            self.x.iter().sum::<f64>() / n,
            self.y.iter().sum::<f64>() / n,
            self.z.iter().sum::<f64>() / n,
        ))
    }

    /// Axis-aligned bounds as (min, max).
    pub fn bounds(&self) -> Option<([f64; 3], [f64; 3])> {
        if self.is_empty() {
            return None;
        }
        let mut min = [f64::INFINITY; 3];
        let mut max = [f64::NEG_INFINITY; 3];
        for i in 0..self.len() {
            let c = self.coord(i);
            for k in 0..3 {
                min[k] = min[k].min(c[k]);
                max[k] = max[k].max(c[k]);
            }
        }
        Some((min, max))
    }

    /// Applies a transform, consuming the cloud and returning it in the
    /// transform's target frame.
    pub fn transform(self, transform: &AlignmentTransform) -> Result<Self, CloudError> {
        if transform.source != self.frame {
            return Err(CloudError::FrameMismatch {
                expected: transform.source.clone(),
                actual: self.frame,
            });
        }
        let target = transform.target.clone();
        Ok(self.map_into(target, |c| transform.apply(c)))
    }

    /// Maps every coordinate into a new frame, consuming the cloud.
    pub fn map_into<F>(self, frame: Frame, f: F) -> Self
    where
        F: Fn([f64; 3]) -> [f64; 3],
    {
        let n = self.len();
        let mut x = Vec::with_capacity(n);
        let mut y = Vec::with_capacity(n);
        let mut z = Vec::with_capacity(n);
        for i in 0..n {
            let c = f([self.x[i], self.y[i], self.z[i]]);
            x.push(c[0]);
            y.push(c[1]);
            z.push(c[2]);
        }
        Self {
            x,
            y,
            z,
            intensity: self.intensity,
            source: self.source,
            frame,
        }
    }
}

/// A point known in both the source and the target frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub source: [f64; 3],
    pub target: [f64; 3],
}

impl Correspondence {
    pub fn new(source: [f64; 3], target: [f64; 3]) -> Self {
        Self { source, target }
    }
}

/// Proper rotation closest to a nearly orthonormal matrix.
///
/// SVD products drift by a few ulps off SO(3); going through a renormalized
/// quaternion puts the result back on it.
pub fn orthonormalize(m: &Matrix3<f64>) -> Rotation3<f64> {
    let mut q = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(*m));
    q.renormalize();
    q.to_rotation_matrix()
}

/// Similarity transform `p' = scale * R * p + t` from one frame to another.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentTransform {
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
    pub source: Frame,
    pub target: Frame,
}

impl AlignmentTransform {
    /// Identity transform within one frame.
    pub fn identity(frame: Frame) -> Self {
        Self {
            rotation: Rotation3::identity(),
            translation: Vector3::zeros(),
            scale: 1.0,
            source: frame.clone(),
            target: frame,
        }
    }

    pub fn new(rotation: Rotation3<f64>, translation: Vector3<f64>, scale: f64, source: Frame, target: Frame) -> Self {
        Self {
            rotation,
            translation,
            scale,
            source,
            target,
        }
    }

    #[inline]
    pub fn apply_vector(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p * self.scale + self.translation
    }

    #[inline]
    pub fn apply(&self, c: [f64; 3]) -> [f64; 3] {
        let v = self.apply_vector(&Vector3::new(c[0], c[1], c[2]));
        [v.x, v.y, v.z]
    }

    /// Composes `self` followed by `next`.
    pub fn then(&self, next: &AlignmentTransform) -> Result<Self, CloudError> {
        if self.target != next.source {
            return Err(CloudError::FrameMismatch {
                expected: next.source.clone(),
                actual: self.target.clone(),
            });
        }
        Ok(Self {
            rotation: next.rotation * self.rotation,
            translation: next.rotation * self.translation * next.scale + next.translation,
            scale: next.scale * self.scale,
            source: self.source.clone(),
            target: next.target.clone(),
        })
    }

    /// Transform mapping the target frame back to the source frame.
    pub fn inverse(&self) -> Self {
        let r_inv = self.rotation.inverse();
        let s_inv = 1.0 / self.scale;
        Self {
            rotation: r_inv,
            translation: -(r_inv * self.translation) * s_inv,
            scale: s_inv,
            source: self.target.clone(),
            target: self.source.clone(),
        }
    }

    /// Rotation angle in radians, in `[0, pi]`.
    ///
    /// Computed from the quaternion so a trace a few ulps above 3 still
    /// yields 0 instead of NaN.
    #[inline]
    pub fn rotation_angle(&self) -> f64 {
        UnitQuaternion::from_rotation_matrix(&self.rotation).angle()
    }

    /// Angle in radians between this rotation and `other`.
    pub fn rotation_angle_to(&self, other: &Rotation3<f64>) -> f64 {
        UnitQuaternion::from_rotation_matrix(&self.rotation).angle_to(&UnitQuaternion::from_rotation_matrix(other))
    }

    /// True when rotation, translation and scale are all within `tolerance` of identity.
    ///
    /// The rotation is compared entry-wise (Frobenius norm of `R - I`).
    pub fn is_identity(&self, tolerance: f64) -> bool {
        (self.rotation.matrix() - Matrix3::identity()).norm() <= tolerance
            && self.translation.norm() <= tolerance
            && (self.scale - 1.0).abs() <= tolerance
    }
}
