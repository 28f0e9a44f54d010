//! Point filters applied to each cloud before it joins a merge.
//!
//! All filters keep the surviving points in their original order and carry
//! their attributes along, so a filtered cloud is a subset of its input.

use std::collections::HashSet;
use std::num::NonZeroUsize;

use kiddo::{ImmutableKdTree, SquaredEuclidean};
use log::debug;
use rayon::prelude::*;

use crate::core::PointCloud;

/// Removes points whose mean distance to their `k` nearest neighbours lies
/// more than `sigma` standard deviations above the cloud-wide mean.
///
/// Passes repeat on the survivors until one removes nothing, so the result
/// is a fixed point: filtering it again removes no further points.
/// Clouds with `k` or fewer points, or `k == 0`, are returned unchanged.
/// Returns the filtered cloud and the number of points removed.
pub fn statistical_outlier_removal(cloud: &PointCloud, k: usize, sigma: f64) -> (PointCloud, usize) {
    let mut current = cloud.clone();
    let mut passes = 0;
    loop {
        let Some(keep) = outlier_pass(&current, k, sigma) else {
            break;
        };
        if keep.len() == current.len() {
            break;
        }
        passes += 1;
        current = current.select(&keep);
    }

    let removed = cloud.len() - current.len();
    if passes > 1 {
        debug!("Outlier removal converged after {} passes, removed {}", passes, removed);
    }
    (current, removed)
}

/// Indices of the points of one outlier pass, or `None` when the cloud is
/// too small to judge.
fn outlier_pass(cloud: &PointCloud, k: usize, sigma: f64) -> Option<Vec<usize>> {
    let neighbours = NonZeroUsize::new(k + 1).filter(|_| k > 0 && cloud.len() > k)?;

    let coords = cloud.to_coords();
    let tree: ImmutableKdTree<f64, 3> = ImmutableKdTree::new_from_slice(&coords);

    // The query point is its own nearest neighbour at distance zero
    let mean_distances: Vec<f64> = coords
        .par_iter()
        .map(|q| {
            tree.nearest_n::<SquaredEuclidean>(q, neighbours)
                .iter()
                .map(|nn| nn.distance.sqrt())
                .sum::<f64>()
                / k as f64
        })
        .collect();

    let n = mean_distances.len() as f64;
    let mu = mean_distances.iter().sum::<f64>() / n;
    let std = (mean_distances.iter().map(|d| (d - mu).powi(2)).sum::<f64>() / n).sqrt();
    let limit = mu + sigma * std;

    let keep: Vec<usize> = mean_distances
        .iter()
        .enumerate()
        .filter(|(_, &d)| d <= limit)
        .map(|(i, _)| i)
        .collect();
    debug!(
        "Outlier pass (k={}, sigma={}): mean {:.4} m, std {:.4} m, removed {}",
        k,
        sigma,
        mu,
        std,
        cloud.len() - keep.len()
    );
    Some(keep)
}

/// Keeps the first point falling in each cubic voxel of edge `size`.
///
/// A non-positive size disables downsampling.
pub fn voxel_downsample(cloud: &PointCloud, size: f64) -> (PointCloud, usize) {
    if size <= 0.0 || !size.is_finite() {
        return (cloud.clone(), 0);
    }

    let mut occupied = HashSet::with_capacity(cloud.len());
    let keep: Vec<usize> = (0..cloud.len())
        .filter(|&i| {
            let c = cloud.coord(i);
            let key = (
                (c[0] / size).floor() as i64,
                (c[1] / size).floor() as i64,
                (c[2] / size).floor() as i64,
            );
            occupied.insert(key)
        })
        .collect();

    let removed = cloud.len() - keep.len();
    debug!("Voxel downsample ({} m): {} voxels, removed {}", size, keep.len(), removed);
    (cloud.select(&keep), removed)
}

/// Drops points of `cloud` lying within `tolerance` of any point of `existing`.
pub fn remove_duplicates(cloud: &PointCloud, existing: &PointCloud, tolerance: f64) -> (PointCloud, usize) {
    if existing.is_empty() || cloud.is_empty() || tolerance <= 0.0 {
        return (cloud.clone(), 0);
    }

    let existing_coords = existing.to_coords();
    let tree: ImmutableKdTree<f64, 3> = ImmutableKdTree::new_from_slice(&existing_coords);
    let limit = tolerance * tolerance;

    let duplicate: Vec<bool> = cloud
        .to_coords()
        .par_iter()
        .map(|q| tree.nearest_one::<SquaredEuclidean>(q).distance <= limit)
        .collect();
    let keep: Vec<usize> = duplicate
        .iter()
        .enumerate()
        .filter(|(_, &dup)| !dup)
        .map(|(i, _)| i)
        .collect();

    let removed = cloud.len() - keep.len();
    debug!("Duplicate removal ({} m): removed {}", tolerance, removed);
    (cloud.select(&keep), removed)
}
