//! Scalar feature maps derived from a trained grid.

use crate::error::{MercatorError, Result};
use crate::grid::Grid;
use serde::{Deserialize, Serialize};

/// Which scalar field to derive over the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureMapKind {
    /// Per-node mean weight distance to adjacent neighbors, the same
    /// field the u-matrix clusterer reads.
    UMatrix,
    /// Raw weight value at one embedding dimension for every node.
    Component(usize),
    /// Weight-space distance from every node to the reference node at the
    /// grid center `(width / 2, height / 2)` (integer division).
    Distance,
}

/// One node's scalar value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeatureValue {
    /// Node index.
    pub node: usize,
    /// The derived scalar.
    pub value: f64,
}

/// Min/max/mean over a feature map's values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FieldStats {
    /// Smallest value in the field.
    pub min: f64,
    /// Largest value in the field.
    pub max: f64,
    /// Arithmetic mean of the field.
    pub mean: f64,
}

impl FieldStats {
    fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self {
                min: 0.0,
                max: 0.0,
                mean: 0.0,
            };
        }
        let mut min = f64::MAX;
        let mut max = f64::MIN;
        let mut sum = 0.0;
        for &v in values {
            min = min.min(v);
            max = max.max(v);
            sum += v;
        }
        Self {
            min,
            max,
            mean: sum / values.len() as f64,
        }
    }
}

/// A scalar field over the grid with its summary statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureMap {
    /// The field that was derived.
    pub kind: FeatureMapKind,
    /// One value per node, in node-index order.
    pub values: Vec<FeatureValue>,
    /// Min/max/mean of the field.
    pub stats: FieldStats,
}

/// Derives the requested scalar field from a trained grid.
///
/// `Component` errors when the dimension index is outside the embedding
/// dimension. Computation is read-only with respect to the grid.
pub fn feature_map(grid: &Grid, kind: FeatureMapKind) -> Result<FeatureMap> {
    let raw: Vec<f64> = match kind {
        FeatureMapKind::UMatrix => grid.umatrix(),
        FeatureMapKind::Component(dimension) => {
            if dimension >= grid.weight_dim {
                return Err(MercatorError::Configuration(format!(
                    "component dimension {} outside embedding dimension {}",
                    dimension, grid.weight_dim
                )));
            }
            grid.nodes.iter().map(|n| n.weights[dimension]).collect()
        }
        FeatureMapKind::Distance => {
            let reference = grid.coords_to_index(grid.width / 2, grid.height / 2);
            let center = &grid.nodes[reference];
            grid.nodes.iter().map(|n| n.weight_distance(center)).collect()
        }
    };

    let stats = FieldStats::from_values(&raw);
    let values = raw
        .into_iter()
        .enumerate()
        .map(|(node, value)| FeatureValue { node, value })
        .collect();

    Ok(FeatureMap { kind, values, stats })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfig;

    fn test_grid() -> Grid {
        let config = MapConfig {
            grid_width: 5,
            grid_height: 4,
            embedding_dimension: 3,
            seed: Some(11),
            ..Default::default()
        };
        let mut grid = Grid::new(&config);
        for (i, node) in grid.nodes.iter_mut().enumerate() {
            node.weights = vec![i as f64, 0.0, 0.0];
        }
        grid
    }

    #[test]
    fn test_component_plane() {
        let grid = test_grid();
        let map = feature_map(&grid, FeatureMapKind::Component(0)).unwrap();

        assert_eq!(map.values.len(), 20);
        assert_eq!(map.values[7].node, 7);
        assert!((map.values[7].value - 7.0).abs() < 1e-12);
        assert!((map.stats.min - 0.0).abs() < 1e-12);
        assert!((map.stats.max - 19.0).abs() < 1e-12);
        assert!((map.stats.mean - 9.5).abs() < 1e-12);
    }

    #[test]
    fn test_component_out_of_range() {
        let grid = test_grid();
        let err = feature_map(&grid, FeatureMapKind::Component(3)).unwrap_err();
        assert!(matches!(err, MercatorError::Configuration(_)));
    }

    #[test]
    fn test_distance_reference_is_grid_center() {
        let grid = test_grid();
        let map = feature_map(&grid, FeatureMapKind::Distance).unwrap();

        // Center of a 5x4 grid is (2, 2) = index 12; its own distance is 0.
        let reference = grid.coords_to_index(2, 2);
        assert_eq!(reference, 12);
        assert!(map.values[reference].value < 1e-12);
        assert!((map.stats.min - 0.0).abs() < 1e-12);
        assert!(map.values[0].value > 0.0);
    }

    #[test]
    fn test_umatrix_map_matches_grid_field() {
        let grid = test_grid();
        let map = feature_map(&grid, FeatureMapKind::UMatrix).unwrap();
        let field = grid.umatrix();
        for (fv, raw) in map.values.iter().zip(field) {
            assert!((fv.value - raw).abs() < 1e-12);
        }
    }
}
