//! Clustering of trained grid nodes.
//!
//! Three interchangeable algorithms operate on the trained weight field,
//! selected by a closed enum rather than dynamic dispatch. All of them
//! produce the same [`Cluster`] shape with the same quality convention,
//! and they fully replace any previous clustering on each request.

use crate::error::{MercatorError, Result};
use crate::grid::Grid;
use log::debug;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// The clustering algorithm to run over the trained grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterAlgorithm {
    /// Flood-fill of contiguous low-dissimilarity regions of the u-matrix.
    UMatrix,
    /// K-means over node weight vectors with k-means++ seeding.
    KMeans,
    /// Agglomerative centroid merge cut at the distance threshold.
    Hierarchical,
}

/// A group of grid nodes with similar weight vectors.
///
/// `quality` is silhouette-style: `(separation - cohesion) /
/// max(separation, cohesion)`, bounded to `[-1, 1]`, where `cohesion` is
/// the mean member distance to the cluster's weight centroid and
/// `separation` the mean member distance to the nearest other cluster's
/// centroid. With fewer than two clusters, separation and quality are 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    /// Cluster identifier, unique within one clustering result.
    pub id: usize,
    /// Mean grid coordinates of the member nodes.
    pub center: (f64, f64),
    /// Indices of member nodes. Every node belongs to at most one cluster.
    pub member_nodes: Vec<usize>,
    /// Normalized quality in `[-1, 1]`; higher is better separated.
    pub quality: f64,
    /// Mean member distance to the cluster weight centroid.
    pub cohesion: f64,
    /// Mean member distance to the nearest other cluster's centroid.
    pub separation: f64,
}

/// Aggregate statistics over one clustering result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStats {
    /// Nodes assigned to some cluster.
    pub clustered_nodes: usize,
    /// Nodes left unclustered (above threshold or in undersized regions).
    pub unclustered_nodes: usize,
    /// Mean quality across clusters; 0 when there are none.
    pub mean_quality: f64,
}

/// The full result of one clustering request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterReport {
    /// Which algorithm produced this result.
    pub algorithm: ClusterAlgorithm,
    /// The clusters, ordered by their smallest member node index.
    pub clusters: Vec<Cluster>,
    /// Node indices not assigned to any cluster.
    pub unclustered: Vec<usize>,
    /// Aggregate statistics.
    pub stats: ClusterStats,
}

/// Runs the selected algorithm over a trained grid.
///
/// `threshold` bounds u-matrix region growth and the hierarchical merge
/// distance; k-means ignores it. `min_cluster_size` discards undersized
/// regions, marking their nodes unclustered. `seed` makes k-means
/// deterministic.
pub fn cluster_grid(
    grid: &Grid,
    algorithm: ClusterAlgorithm,
    threshold: f64,
    min_cluster_size: usize,
    seed: Option<u64>,
) -> Result<ClusterReport> {
    if !threshold.is_finite() || threshold <= 0.0 {
        return Err(MercatorError::Configuration(format!(
            "cluster threshold {threshold} must be positive and finite"
        )));
    }
    if min_cluster_size == 0 {
        return Err(MercatorError::Configuration(
            "minimum cluster size must be at least 1".to_string(),
        ));
    }

    let memberships = match algorithm {
        ClusterAlgorithm::UMatrix => umatrix_regions(grid, threshold),
        ClusterAlgorithm::KMeans => kmeans_regions(grid, seed),
        ClusterAlgorithm::Hierarchical => hierarchical_regions(grid, threshold),
    };

    Ok(build_report(grid, algorithm, memberships, min_cluster_size))
}

/// Contiguous regions of the u-matrix below the threshold.
///
/// Nodes at or above the threshold sit on dissimilarity ridges and stay
/// unassigned here; flood fill connects the remaining nodes through the
/// topology's adjacency.
fn umatrix_regions(grid: &Grid, threshold: f64) -> Vec<Vec<usize>> {
    let values = grid.umatrix();
    let mut visited = vec![false; grid.total_nodes()];
    let mut regions = Vec::new();

    for start in 0..grid.total_nodes() {
        if visited[start] || values[start] >= threshold {
            continue;
        }

        let mut region = Vec::new();
        let mut queue = VecDeque::from([start]);
        visited[start] = true;
        while let Some(idx) = queue.pop_front() {
            region.push(idx);
            let (x, y) = grid.index_to_coords(idx);
            for neighbor in grid.topology.neighbors(x, y, grid.width, grid.height) {
                if !visited[neighbor] && values[neighbor] < threshold {
                    visited[neighbor] = true;
                    queue.push_back(neighbor);
                }
            }
        }
        regions.push(region);
    }

    regions
}

/// K-means over node weights, k-means++ seeded, with early exit once
/// assignments stabilize. `k = max(2, floor(sqrt(nodes / 2)))`.
fn kmeans_regions(grid: &Grid, seed: Option<u64>) -> Vec<Vec<usize>> {
    const MAX_ROUNDS: usize = 100;

    let n = grid.total_nodes();
    let k = (((n / 2) as f64).sqrt().floor() as usize).max(2).min(n);
    let mut rng = match seed {
        Some(s) => ChaCha8Rng::seed_from_u64(s),
        None => ChaCha8Rng::from_entropy(),
    };

    // K-means++ initialization: first centroid uniform, the rest weighted
    // by squared distance to the nearest chosen centroid.
    let mut centroids: Vec<Vec<f64>> = Vec::with_capacity(k);
    centroids.push(grid.nodes[rng.gen_range(0..n)].weights.clone());
    while centroids.len() < k {
        let distances: Vec<f64> = grid
            .nodes
            .iter()
            .map(|node| {
                centroids
                    .iter()
                    .map(|c| node.distance_squared(c))
                    .fold(f64::MAX, f64::min)
            })
            .collect();
        let total: f64 = distances.iter().sum();
        if total <= 0.0 {
            centroids.push(grid.nodes[rng.gen_range(0..n)].weights.clone());
            continue;
        }
        let mut r = rng.gen::<f64>() * total;
        let mut chosen = n - 1;
        for (i, &d) in distances.iter().enumerate() {
            r -= d;
            if r <= 0.0 {
                chosen = i;
                break;
            }
        }
        centroids.push(grid.nodes[chosen].weights.clone());
    }

    let mut assignment = vec![0usize; n];
    for round in 0..MAX_ROUNDS {
        let mut changed = false;
        for (i, node) in grid.nodes.iter().enumerate() {
            let mut best = 0;
            let mut best_dist = f64::MAX;
            for (c, centroid) in centroids.iter().enumerate() {
                let dist = node.distance_squared(centroid);
                if dist < best_dist {
                    best_dist = dist;
                    best = c;
                }
            }
            if assignment[i] != best {
                assignment[i] = best;
                changed = true;
            }
        }
        if !changed {
            debug!("k-means converged after {round} rounds");
            break;
        }

        for (c, centroid) in centroids.iter_mut().enumerate() {
            let members: Vec<usize> = (0..n).filter(|&i| assignment[i] == c).collect();
            if members.is_empty() {
                continue; // empty centroid keeps its position
            }
            for value in centroid.iter_mut() {
                *value = 0.0;
            }
            for &m in &members {
                for (value, w) in centroid.iter_mut().zip(&grid.nodes[m].weights) {
                    *value += w;
                }
            }
            for value in centroid.iter_mut() {
                *value /= members.len() as f64;
            }
        }
    }

    (0..k)
        .map(|c| (0..n).filter(|&i| assignment[i] == c).collect())
        .filter(|members: &Vec<usize>| !members.is_empty())
        .collect()
}

/// Agglomerative merge of nodes by centroid distance until the closest
/// pair of clusters is farther apart than the threshold (flat dendrogram
/// cut).
fn hierarchical_regions(grid: &Grid, threshold: f64) -> Vec<Vec<usize>> {
    struct Agglomerate {
        members: Vec<usize>,
        centroid: Vec<f64>,
    }

    let mut active: Vec<Option<Agglomerate>> = grid
        .nodes
        .iter()
        .enumerate()
        .map(|(i, node)| {
            Some(Agglomerate {
                members: vec![i],
                centroid: node.weights.clone(),
            })
        })
        .collect();

    fn centroid_distance(a: &[f64], b: &[f64]) -> f64 {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    loop {
        let mut best: Option<(usize, usize, f64)> = None;
        for i in 0..active.len() {
            let Some(a) = &active[i] else { continue };
            for (j, slot) in active.iter().enumerate().skip(i + 1) {
                let Some(b) = slot else { continue };
                let dist = centroid_distance(&a.centroid, &b.centroid);
                if best.map_or(true, |(_, _, d)| dist < d) {
                    best = Some((i, j, dist));
                }
            }
        }

        match best {
            Some((i, j, dist)) if dist <= threshold => {
                let absorbed = active[j].take().expect("slot j was active");
                let keep = active[i].as_mut().expect("slot i was active");
                let total = (keep.members.len() + absorbed.members.len()) as f64;
                let keep_share = keep.members.len() as f64 / total;
                let absorbed_share = absorbed.members.len() as f64 / total;
                for (c, other) in keep.centroid.iter_mut().zip(&absorbed.centroid) {
                    *c = *c * keep_share + other * absorbed_share;
                }
                keep.members.extend(absorbed.members);
            }
            _ => break,
        }
    }

    active
        .into_iter()
        .flatten()
        .map(|agg| agg.members)
        .collect()
}

/// Applies the minimum-size filter, computes per-cluster metrics, and
/// assembles the report.
fn build_report(
    grid: &Grid,
    algorithm: ClusterAlgorithm,
    memberships: Vec<Vec<usize>>,
    min_cluster_size: usize,
) -> ClusterReport {
    let mut assigned = vec![false; grid.total_nodes()];
    let mut kept: Vec<Vec<usize>> = memberships
        .into_iter()
        .filter(|members| members.len() >= min_cluster_size)
        .collect();
    kept.sort_by_key(|members| members.iter().copied().min().unwrap_or(usize::MAX));

    for members in &kept {
        for &m in members {
            assigned[m] = true;
        }
    }
    let unclustered: Vec<usize> = (0..grid.total_nodes()).filter(|&i| !assigned[i]).collect();

    // Weight-space centroid per kept cluster.
    let centroids: Vec<Vec<f64>> = kept
        .iter()
        .map(|members| {
            let mut centroid = vec![0.0; grid.weight_dim];
            for &m in members {
                for (c, w) in centroid.iter_mut().zip(&grid.nodes[m].weights) {
                    *c += w;
                }
            }
            for c in centroid.iter_mut() {
                *c /= members.len() as f64;
            }
            centroid
        })
        .collect();

    let clusters: Vec<Cluster> = kept
        .iter()
        .enumerate()
        .map(|(id, members)| {
            let cohesion = members
                .iter()
                .map(|&m| grid.nodes[m].distance(&centroids[id]))
                .sum::<f64>()
                / members.len() as f64;

            let separation = if centroids.len() < 2 {
                0.0
            } else {
                members
                    .iter()
                    .map(|&m| {
                        centroids
                            .iter()
                            .enumerate()
                            .filter(|(other, _)| *other != id)
                            .map(|(_, c)| grid.nodes[m].distance(c))
                            .fold(f64::MAX, f64::min)
                    })
                    .sum::<f64>()
                    / members.len() as f64
            };

            let denom = separation.max(cohesion);
            let quality = if denom > 0.0 {
                ((separation - cohesion) / denom).clamp(-1.0, 1.0)
            } else {
                0.0
            };

            let (sum_x, sum_y) = members.iter().fold((0.0, 0.0), |(sx, sy), &m| {
                let (x, y) = grid.index_to_coords(m);
                (sx + x as f64, sy + y as f64)
            });

            Cluster {
                id,
                center: (
                    sum_x / members.len() as f64,
                    sum_y / members.len() as f64,
                ),
                member_nodes: members.clone(),
                quality,
                cohesion,
                separation,
            }
        })
        .collect();

    let mean_quality = if clusters.is_empty() {
        0.0
    } else {
        clusters.iter().map(|c| c.quality).sum::<f64>() / clusters.len() as f64
    };

    let clustered_nodes = clusters.iter().map(|c| c.member_nodes.len()).sum();
    ClusterReport {
        algorithm,
        clusters,
        unclustered,
        stats: ClusterStats {
            clustered_nodes,
            unclustered_nodes: grid.total_nodes() - clustered_nodes,
            mean_quality,
        },
    }
}
