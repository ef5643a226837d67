//! Configuration for map instances.

use crate::error::{MercatorError, Result};
use crate::grid::Topology;
use serde::{Deserialize, Serialize};

/// Configuration for a single map instance.
///
/// Immutable once the instance is created; [`validate`](MapConfig::validate)
/// runs before any grid storage is allocated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapConfig {
    /// Grid width in nodes. Must be within 3..=100.
    pub grid_width: usize,

    /// Grid height in nodes. Must be within 3..=100.
    pub grid_height: usize,

    /// Lattice topology.
    /// Default: rectangular.
    pub topology: Topology,

    /// Dimensionality of entity embeddings and node weight vectors.
    /// Production embeddings are typically 100-2000 wide; any dimension
    /// from 1 to 2000 is accepted so small synthetic maps stay usable.
    pub embedding_dimension: usize,

    /// Hard cap on training iterations. A run ends here even if the
    /// requested epochs would continue. 0 disables the cap.
    /// Default: 10,000.
    pub max_iterations: usize,

    /// Initial learning rate.
    /// Default: 0.1.
    pub initial_learning_rate: f64,

    /// Final learning rate. Must not exceed the initial rate.
    /// Default: 0.01.
    pub final_learning_rate: f64,

    /// Initial neighborhood radius. When unset, half the larger grid
    /// dimension is used.
    pub initial_radius: Option<f64>,

    /// Terminal neighborhood radius.
    /// Default: 1.0.
    pub final_radius: f64,

    /// Default u-matrix / merge threshold for clustering requests that do
    /// not override it.
    /// Default: 0.3.
    pub cluster_threshold: f64,

    /// Minimum nodes per cluster; smaller regions are left unclustered.
    /// Default: 3.
    pub min_cluster_size: usize,

    /// Random seed for reproducibility (weight init, sample order,
    /// k-means seeding, sample data).
    /// Default: None (entropy).
    pub seed: Option<u64>,

    /// Publish a training snapshot every N iterations (always on the
    /// first and last). Default: 1.
    pub snapshot_interval: usize,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            grid_width: 20,
            grid_height: 20,
            topology: Topology::Rectangular,
            embedding_dimension: 768,
            max_iterations: 10_000,
            initial_learning_rate: 0.1,
            final_learning_rate: 0.01,
            initial_radius: None,
            final_radius: 1.0,
            cluster_threshold: 0.3,
            min_cluster_size: 3,
            seed: None,
            snapshot_interval: 1,
        }
    }
}

impl MapConfig {
    /// Returns the total number of nodes in the grid.
    #[inline]
    pub fn total_nodes(&self) -> usize {
        self.grid_width * self.grid_height
    }

    /// The starting neighborhood radius: the configured value, or half the
    /// larger grid dimension.
    #[inline]
    pub fn effective_initial_radius(&self) -> f64 {
        self.initial_radius
            .unwrap_or_else(|| self.grid_width.max(self.grid_height) as f64 / 2.0)
    }

    /// Validates all bounds.
    ///
    /// Called at instance creation; a failure here is fatal to the create
    /// request and nothing is allocated.
    pub fn validate(&self) -> Result<()> {
        if !(3..=100).contains(&self.grid_width) || !(3..=100).contains(&self.grid_height) {
            return Err(MercatorError::Configuration(format!(
                "grid dimensions {}x{} outside 3..=100",
                self.grid_width, self.grid_height
            )));
        }
        if self.embedding_dimension == 0 || self.embedding_dimension > 2000 {
            return Err(MercatorError::Configuration(format!(
                "embedding dimension {} outside 1..=2000",
                self.embedding_dimension
            )));
        }
        if self.initial_learning_rate <= 0.0 || self.final_learning_rate <= 0.0 {
            return Err(MercatorError::Configuration(
                "learning rates must be positive".to_string(),
            ));
        }
        if self.final_learning_rate > self.initial_learning_rate {
            return Err(MercatorError::Configuration(format!(
                "final learning rate {} exceeds initial {}",
                self.final_learning_rate, self.initial_learning_rate
            )));
        }
        if let Some(r) = self.initial_radius {
            if r <= 0.0 || !r.is_finite() {
                return Err(MercatorError::Configuration(format!(
                    "initial radius {r} must be positive and finite"
                )));
            }
        }
        if self.final_radius <= 0.0 || self.final_radius > self.effective_initial_radius() {
            return Err(MercatorError::Configuration(format!(
                "final radius {} outside (0, initial radius {}]",
                self.final_radius,
                self.effective_initial_radius()
            )));
        }
        if !self.cluster_threshold.is_finite() || self.cluster_threshold <= 0.0 {
            return Err(MercatorError::Configuration(
                "cluster threshold must be positive and finite".to_string(),
            ));
        }
        if self.min_cluster_size == 0 {
            return Err(MercatorError::Configuration(
                "minimum cluster size must be at least 1".to_string(),
            ));
        }
        if self.snapshot_interval == 0 {
            return Err(MercatorError::Configuration(
                "snapshot interval must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
