//! Rigid registration of a point cloud onto an anchor cloud.
//!
//! This module provides:
//! - a closed-form least-squares fit from corresponding point pairs, with the
//!   rotation taken as the polar factor of the cross-covariance (SVD with
//!   reflection fix) and optional scale
//! - a principal-axis seed for clouds without correspondences
//! - iterative closest point refinement using a `kiddo` KD-tree on the
//!   target, with the per-iteration nearest-neighbour search run on `rayon`
//!
//! ICP iterations are sequential; each one rematches every source point and
//! re-solves the closed-form fit from the original source coordinates.

use std::fmt;

use kiddo::{ImmutableKdTree, SquaredEuclidean};
use log::{debug, info, warn};
use nalgebra::{Matrix3, Rotation3, SymmetricEigen, Vector3};
use rayon::prelude::*;
use thiserror::Error;

use crate::config::RegistrationConfig;
use crate::core::{orthonormalize, AlignmentTransform, Frame, PointCloud};

use super::CancelToken;

pub use crate::core::Correspondence;

/// Source points used to score each principal-axis seed.
const SEED_SAMPLE_POINTS: usize = 4096;

/// Errors raised by registration.
///
/// `ResidualAboveThreshold` is recoverable: it carries the best transform
/// found so the caller can force-accept it, retry with correspondences, or
/// abort.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistrationError {
    #[error("{which} cloud is empty")]
    EmptyCloud { which: &'static str },

    #[error("need at least 3 correspondences, got {count}")]
    TooFewCorrespondences { count: usize },

    #[error("degenerate point configuration: {0}")]
    Degenerate(&'static str),

    #[error("singular value decomposition failed")]
    Decomposition,

    #[error("only {matched} source points found a neighbour within the correspondence distance")]
    TooFewMatches { matched: usize },

    #[error(
        "mean residual {residual:.4} m after {iterations} ICP iterations exceeds the acceptance threshold {threshold:.4} m"
    )]
    ResidualAboveThreshold {
        residual: f64,
        threshold: f64,
        iterations: usize,
        transform: Box<AlignmentTransform>,
    },

    #[error("cancelled after {iterations} ICP iterations")]
    Cancelled { iterations: usize },
}

/// How the ICP starting transform was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedKind {
    Correspondences,
    PrincipalAxes,
}

impl fmt::Display for SeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeedKind::Correspondences => write!(f, "correspondences"),
            SeedKind::PrincipalAxes => write!(f, "principal axes"),
        }
    }
}

/// Outcome of a successful registration.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub transform: AlignmentTransform,
    pub seed: SeedKind,
    /// Mean point-to-point residual of the seed.
    pub initial_residual: f64,
    /// Mean point-to-point residual of the final transform.
    pub residual: f64,
    pub iterations: usize,
    /// Whether the improvement fell below the tolerance before the cap.
    pub converged: bool,
}

fn to_vector(p: [f64; 3]) -> Vector3<f64> {
    Vector3::new(p[0], p[1], p[2])
}

fn mean(points: &[Vector3<f64>]) -> Vector3<f64> {
    points.iter().fold(Vector3::zeros(), |acc, p| acc + p) / points.len() as f64
}

/// Eigen-decomposition of the scatter matrix, eigenvalues descending.
fn principal_axes(points: &[Vector3<f64>], centroid: &Vector3<f64>) -> (Vector3<f64>, Matrix3<f64>) {
    let scatter = points.iter().fold(Matrix3::zeros(), |acc, p| {
        let d = p - centroid;
        acc + d * d.transpose()
    });
    let eig = SymmetricEigen::new(scatter);

    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eig.eigenvalues[b].total_cmp(&eig.eigenvalues[a]));

    let values = Vector3::new(
        eig.eigenvalues[order[0]],
        eig.eigenvalues[order[1]],
        eig.eigenvalues[order[2]],
    );
    let axes = Matrix3::from_columns(&[
        eig.eigenvectors.column(order[0]).into_owned(),
        eig.eigenvectors.column(order[1]).into_owned(),
        eig.eigenvectors.column(order[2]).into_owned(),
    ]);
    (values, axes)
}

/// Least-squares similarity (or rigid, when `estimate_scale` is false)
/// mapping `source` onto `target`.
fn solve(
    source: &[Vector3<f64>],
    target: &[Vector3<f64>],
    estimate_scale: bool,
) -> Result<(Rotation3<f64>, Vector3<f64>, f64), RegistrationError> {
    let cs = mean(source);
    let ct = mean(target);

    let (spread, _) = principal_axes(source, &cs);
    if spread[0] <= f64::EPSILON {
        return Err(RegistrationError::Degenerate("source points coincide"));
    }
    if spread[1] <= 1e-10 * spread[0] {
        return Err(RegistrationError::Degenerate("source points are collinear"));
    }

    let n = source.len() as f64;
    let mut cov = Matrix3::zeros();
    let mut var_s = 0.0;
    for (s, t) in source.iter().zip(target) {
        let ds = s - cs;
        cov += (t - ct) * ds.transpose();
        var_s += ds.norm_squared();
    }
    cov /= n;
    var_s /= n;

    let svd = cov.svd(true, true);
    let mut u = svd.u.ok_or(RegistrationError::Decomposition)?;
    let v_t = svd.v_t.ok_or(RegistrationError::Decomposition)?;
    let mut sigma = svd.singular_values;

    // Reflection fix: flip the axis of the smallest singular value
    if (u * v_t).determinant() < 0.0 {
        let k = sigma.imin();
        let flipped = -u.column(k);
        u.set_column(k, &flipped);
        sigma[k] = -sigma[k];
    }

    let rotation = orthonormalize(&(u * v_t));
    let scale = if estimate_scale { sigma.sum() / var_s } else { 1.0 };
    let translation = ct - rotation * cs * scale;
    Ok((rotation, translation, scale))
}

/// Closed-form transform from at least 3 non-collinear correspondences.
pub fn fit_correspondences(
    pairs: &[Correspondence],
    estimate_scale: bool,
    source: Frame,
    target: Frame,
) -> Result<AlignmentTransform, RegistrationError> {
    if pairs.len() < 3 {
        return Err(RegistrationError::TooFewCorrespondences { count: pairs.len() });
    }
    let src: Vec<_> = pairs.iter().map(|p| to_vector(p.source)).collect();
    let tgt: Vec<_> = pairs.iter().map(|p| to_vector(p.target)).collect();
    let (rotation, translation, scale) = solve(&src, &tgt, estimate_scale)?;
    Ok(AlignmentTransform::new(rotation, translation, scale, source, target))
}

/// Nearest-neighbour matching of the transformed source against the target.
struct Matcher<'a> {
    tree: ImmutableKdTree<f64, 3>,
    target: &'a [[f64; 3]],
    max_distance_sq: Option<f64>,
}

impl<'a> Matcher<'a> {
    fn new(target: &'a [[f64; 3]], max_distance: Option<f64>) -> Self {
        Self {
            tree: ImmutableKdTree::new_from_slice(target),
            target,
            max_distance_sq: max_distance.map(|d| d * d),
        }
    }

    /// Pairs and mean residual for `transform`.
    fn pairs(
        &self,
        source: &[[f64; 3]],
        transform: &AlignmentTransform,
    ) -> Result<(Vec<Correspondence>, f64), RegistrationError> {
        let matched: Vec<(Correspondence, f64)> = source
            .par_iter()
            .filter_map(|p| {
                let nn = self.tree.nearest_one::<SquaredEuclidean>(&transform.apply(*p));
                if self.max_distance_sq.is_some_and(|max| nn.distance > max) {
                    return None;
                }
                Some((Correspondence::new(*p, self.target[nn.item as usize]), nn.distance.sqrt()))
            })
            .collect();

        if matched.len() < 3 {
            return Err(RegistrationError::TooFewMatches { matched: matched.len() });
        }
        let residual = matched.iter().map(|(_, d)| d).sum::<f64>() / matched.len() as f64;
        Ok((matched.into_iter().map(|(c, _)| c).collect(), residual))
    }
}

/// Every `step`-th point, so seeds are scored on a bounded sample.
fn sample(points: &[[f64; 3]], max: usize) -> Vec<[f64; 3]> {
    let step = points.len().div_ceil(max).max(1);
    points.iter().step_by(step).copied().collect()
}

/// Aligns centroids and principal axes, trying the four proper sign choices
/// of the axes and keeping the one with the lowest mean residual.
fn principal_axis_seed(
    source: &[[f64; 3]],
    target: &[[f64; 3]],
    matcher: &Matcher<'_>,
    source_frame: &Frame,
    target_frame: &Frame,
) -> Result<(AlignmentTransform, f64), RegistrationError> {
    let src: Vec<_> = source.iter().map(|p| to_vector(*p)).collect();
    let tgt: Vec<_> = target.iter().map(|p| to_vector(*p)).collect();
    let cs = mean(&src);
    let ct = mean(&tgt);
    let (_, axes_s) = principal_axes(&src, &cs);
    let (_, axes_t) = principal_axes(&tgt, &ct);
    let handedness = (axes_s.determinant() * axes_t.determinant()).signum();

    let subset = sample(source, SEED_SAMPLE_POINTS);
    let mut best: Option<(AlignmentTransform, f64)> = None;
    for (s1, s2) in [(1.0, 1.0), (1.0, -1.0), (-1.0, 1.0), (-1.0, -1.0)] {
        let signs = Matrix3::from_diagonal(&Vector3::new(s1, s2, s1 * s2 * handedness));
        let rotation = orthonormalize(&(axes_t * signs * axes_s.transpose()));
        let translation = ct - rotation * cs;
        let candidate = AlignmentTransform::new(
            rotation,
            translation,
            1.0,
            source_frame.clone(),
            target_frame.clone(),
        );
        let (_, residual) = matcher.pairs(&subset, &candidate)?;
        debug!("Principal-axis seed ({:+}, {:+}): residual {:.4}", s1, s2, residual);
        if best.as_ref().map_or(true, |(_, r)| residual < *r) {
            best = Some((candidate, residual));
        }
    }
    best.ok_or(RegistrationError::Degenerate("no principal-axis seed"))
}

/// Registers `source` onto `target`.
///
/// The seed comes from `correspondences` when given, otherwise from the
/// principal axes. ICP then refines it until the mean residual improves by
/// less than `icp_residual_tolerance` or `icp_max_iterations` is reached. A
/// final residual above `icp_accept_threshold` is an error unless
/// `force_accept` is set.
pub fn register(
    source: &PointCloud,
    target: &PointCloud,
    correspondences: Option<&[Correspondence]>,
    config: &RegistrationConfig,
    cancel: &CancelToken,
) -> Result<Registration, RegistrationError> {
    if source.is_empty() {
        return Err(RegistrationError::EmptyCloud { which: "source" });
    }
    if target.is_empty() {
        return Err(RegistrationError::EmptyCloud { which: "target" });
    }

    let source_pts = source.to_coords();
    let target_pts = target.to_coords();
    let matcher = Matcher::new(&target_pts, config.max_correspondence_distance);

    let (seed, mut transform) = match correspondences.filter(|c| !c.is_empty()) {
        Some(pairs) => (
            SeedKind::Correspondences,
            fit_correspondences(pairs, config.estimate_scale, source.frame().clone(), target.frame().clone())?,
        ),
        None => {
            let (t, _) = principal_axis_seed(&source_pts, &target_pts, &matcher, source.frame(), target.frame())?;
            (SeedKind::PrincipalAxes, t)
        }
    };

    let (mut pairs, mut residual) = matcher.pairs(&source_pts, &transform)?;
    let initial_residual = residual;
    info!(
        "Registering {} onto {} ({} seed, residual {:.4} m)",
        source.frame(),
        target.frame(),
        seed,
        residual
    );

    let mut iterations = 0;
    let mut converged = false;
    while iterations < config.icp_max_iterations {
        if cancel.is_cancelled() {
            return Err(RegistrationError::Cancelled { iterations });
        }
        iterations += 1;

        let src: Vec<_> = pairs.iter().map(|c| to_vector(c.source)).collect();
        let tgt: Vec<_> = pairs.iter().map(|c| to_vector(c.target)).collect();
        let (rotation, translation, scale) = solve(&src, &tgt, config.estimate_scale)?;
        let candidate = AlignmentTransform::new(
            rotation,
            translation,
            scale,
            source.frame().clone(),
            target.frame().clone(),
        );
        let (candidate_pairs, candidate_residual) = matcher.pairs(&source_pts, &candidate)?;

        let improvement = residual - candidate_residual;
        debug!("ICP iteration {}: residual {:.6} m", iterations, candidate_residual);
        if improvement > 0.0 {
            transform = candidate;
            pairs = candidate_pairs;
            residual = candidate_residual;
        }
        if improvement < config.icp_residual_tolerance {
            converged = true;
            break;
        }
    }

    info!(
        "ICP finished after {} iterations: residual {:.4} m (converged: {})",
        iterations, residual, converged
    );

    if residual > config.icp_accept_threshold {
        if config.force_accept {
            warn!(
                "Residual {:.4} m exceeds threshold {:.4} m; force-accepted",
                residual, config.icp_accept_threshold
            );
        } else {
            return Err(RegistrationError::ResidualAboveThreshold {
                residual,
                threshold: config.icp_accept_threshold,
                iterations,
                transform: Box::new(transform),
            });
        }
    }

    Ok(Registration {
        transform,
        seed,
        initial_residual,
        residual,
        iterations,
        converged,
    })
}
