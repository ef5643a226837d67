//! The fixed-topology 2D lattice of weight nodes.

mod node;
mod topology;

pub use node::Node;
pub use topology::Topology;

use crate::config::MapConfig;
use crate::error::{MercatorError, Result};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// A 2D lattice of nodes, each owning a weight vector of the configured
/// embedding dimension.
///
/// The node set is fixed in shape for the grid's lifetime; index `i`
/// corresponds to coordinates `(i % width, i / width)`. Only the node
/// weights mutate, and only during training.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grid {
    /// Grid width in nodes.
    pub width: usize,
    /// Grid height in nodes.
    pub height: usize,
    /// Lattice topology.
    pub topology: Topology,
    /// Weight vector dimensionality.
    pub weight_dim: usize,
    /// The nodes in row-major order.
    pub nodes: Vec<Node>,
}

impl Grid {
    /// Creates a new grid with randomly initialized weights.
    ///
    /// Initialization is deterministic when the config carries a seed.
    pub fn new(config: &MapConfig) -> Self {
        let mut rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };

        let nodes: Vec<Node> = (0..config.grid_width * config.grid_height)
            .map(|i| {
                let x = i % config.grid_width;
                let y = i / config.grid_width;
                Node::new_random(x, y, config.embedding_dimension, &mut rng)
            })
            .collect();

        Self {
            width: config.grid_width,
            height: config.grid_height,
            topology: config.topology,
            weight_dim: config.embedding_dimension,
            nodes,
        }
    }

    /// Returns the total number of nodes.
    #[inline]
    pub fn total_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Gets a node by its 1D index.
    #[inline]
    pub fn get(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    /// Converts a 1D index to `(x, y)` coordinates.
    #[inline]
    pub fn index_to_coords(&self, index: usize) -> (usize, usize) {
        (index % self.width, index / self.width)
    }

    /// Converts `(x, y)` coordinates to a 1D index.
    #[inline]
    pub fn coords_to_index(&self, x: usize, y: usize) -> usize {
        y * self.width + x
    }

    /// Finds the best matching unit for an input vector.
    ///
    /// The BMU is the node whose weight vector is closest (Euclidean) to
    /// the input. Ties break to the lowest node index. Returns the index
    /// and the distance.
    pub fn find_bmu(&self, input: &[f64]) -> Result<(usize, f64)> {
        if input.len() != self.weight_dim {
            return Err(MercatorError::Data(format!(
                "input dimension {} does not match weight dimension {}",
                input.len(),
                self.weight_dim
            )));
        }

        let mut best_idx = 0;
        let mut best_dist = f64::MAX;
        for (i, node) in self.nodes.iter().enumerate() {
            let dist = node.distance_squared(input);
            if dist < best_dist {
                best_dist = dist;
                best_idx = i;
            }
        }

        Ok((best_idx, best_dist.sqrt()))
    }

    /// Finds the best matching unit scanning nodes in parallel.
    ///
    /// Same contract as [`find_bmu`](Self::find_bmu), including lowest-index
    /// tie breaking; faster on large grids.
    pub fn find_bmu_parallel(&self, input: &[f64]) -> Result<(usize, f64)> {
        if input.len() != self.weight_dim {
            return Err(MercatorError::Data(format!(
                "input dimension {} does not match weight dimension {}",
                input.len(),
                self.weight_dim
            )));
        }

        let (best_dist, best_idx) = self
            .nodes
            .par_iter()
            .enumerate()
            .map(|(i, node)| (node.distance_squared(input), i))
            .reduce(
                || (f64::MAX, usize::MAX),
                |a, b| {
                    // Lexicographic min keeps the lowest index on equal distance.
                    if b.0 < a.0 || (b.0 == a.0 && b.1 < a.1) {
                        b
                    } else {
                        a
                    }
                },
            );

        Ok((best_idx, best_dist.sqrt()))
    }

    /// Computes the u-matrix field: for every node, the mean weight-vector
    /// distance to its directly adjacent grid neighbors.
    ///
    /// High values mark dissimilarity ridges between map regions; the
    /// clustering engine and the feature-map generator both read this field.
    pub fn umatrix(&self) -> Vec<f64> {
        (0..self.nodes.len())
            .map(|i| {
                let node = &self.nodes[i];
                let neighbors = self.topology.neighbors(node.x, node.y, self.width, self.height);
                if neighbors.is_empty() {
                    return 0.0;
                }
                let sum: f64 = neighbors
                    .iter()
                    .map(|&n| node.weight_distance(&self.nodes[n]))
                    .sum();
                sum / neighbors.len() as f64
            })
            .collect()
    }

    /// Grid-plane distance between two nodes given the topology.
    #[inline]
    pub fn grid_distance(&self, a: usize, b: usize) -> f64 {
        self.topology
            .grid_distance(self.index_to_coords(a), self.index_to_coords(b))
    }
}
